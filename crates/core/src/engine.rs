//! High-level orchestrator: seeds nonce state, wires the worker pool,
//! tracker, and rate controller together, and turns a batch of
//! requests into a run summary.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use alloy::primitives::Address;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::EngineConfig,
    error::BarrageError,
    nonce::NonceAllocator,
    pool::{TxRequest, WorkerPool},
    provider::RpcTransport,
    rate::RateController,
    tracker::{TrackerHandle, TrackerStats},
    Result,
};

/// How often the sweeper checks for stuck transactions.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Final report of one run.
#[derive(Clone, Debug)]
pub struct RunSummary {
    pub stats: TrackerStats,
    /// Nonces whose transactions never confirmed, re-offered to the
    /// allocator for a later run.
    pub unresolved: Vec<(Address, u64)>,
    pub cancelled: bool,
}

pub struct Engine {
    transport: Arc<dyn RpcTransport>,
    config: EngineConfig,
    nonces: Arc<NonceAllocator>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn builder(transport: Arc<dyn RpcTransport>) -> EngineBuilder {
        EngineBuilder {
            transport,
            config: EngineConfig::default(),
            cancel: None,
        }
    }

    /// Token that cooperatively stops the run: workers stop dequeuing,
    /// in-flight submissions finish, pending nonces are reconciled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn nonces(&self) -> Arc<NonceAllocator> {
        self.nonces.clone()
    }

    /// Syncs an account's local counter with the chain's confirmed
    /// count. Called automatically for unseeded accounts at the start
    /// of a run.
    pub async fn seed_account(&self, address: Address) -> Result<()> {
        let confirmed = self
            .transport
            .transaction_count(address)
            .await
            .map_err(BarrageError::Submit)?;
        self.nonces.reconcile(address, confirmed, &[]);
        info!(%address, confirmed, "seeded account nonce state");
        Ok(())
    }

    /// Dispatches `requests` through the worker pool and blocks until
    /// every outcome is terminal (or the run is cancelled).
    pub async fn run(&self, requests: Vec<TxRequest>) -> Result<RunSummary> {
        let addresses: HashSet<Address> =
            requests.iter().map(|r| r.account.address()).collect();
        for &address in &addresses {
            if !self.nonces.is_seeded(address) {
                self.seed_account(address).await?;
            }
        }

        let tracker = TrackerHandle::spawn(64);
        let rate = Arc::new(RateController::new(
            self.config.target_rate,
            self.config.outcome_window,
            self.config.rejection_backoff_threshold,
        ));

        let (queue_tx, queue_rx) = mpsc::channel(requests.len().max(1));
        let total = requests.len();
        for request in requests {
            queue_tx
                .send(request)
                .await
                .map_err(|_| BarrageError::ChannelClosed("work queue"))?;
        }
        drop(queue_tx);
        info!(total, workers = self.config.worker_count, "starting run");

        let pool = Arc::new(WorkerPool::new(
            self.transport.clone(),
            self.nonces.clone(),
            rate,
            tracker.clone(),
            self.cancel.clone(),
            self.config.clone(),
        ));
        let workers = pool.clone().spawn(queue_rx);
        let sweeper = self.spawn_sweeper(pool.clone(), tracker.clone());

        let mut worker_failure = None;
        for result in join_all(workers).await {
            if let Err(e) = result {
                worker_failure = Some(BarrageError::WorkerPanic(e.to_string()));
            }
        }
        // the sweeper and tracker must come down even when a worker
        // died, or they loop forever in an embedding process
        sweeper.0.cancel();
        let _ = sweeper.1.await;
        if let Some(e) = worker_failure {
            let _ = tracker.stop().await;
            return Err(e);
        }

        // anything still pending has either aged past the timeout
        // (workers poll for the full window before giving up) or was
        // interrupted by cancellation
        let timeout = Duration::from_secs(self.config.timeout_secs);
        tracker.sweep_timed_out(timeout).await?;
        let cancelled = self.cancel.is_cancelled();
        let mut unresolved = tracker.timed_out_nonces().await?;
        for &address in &addresses {
            let pending = tracker.pending_nonces(address).await?;
            unresolved.extend(pending.into_iter().map(|nonce| (address, nonce)));
        }
        unresolved.sort_unstable();

        // reconcile so a fresh run cannot double-allocate
        let mut by_account: HashMap<Address, Vec<u64>> = HashMap::new();
        for (address, nonce) in &unresolved {
            by_account.entry(*address).or_default().push(*nonce);
        }
        for (address, nonces) in &by_account {
            pool.reconcile_account(*address, nonces).await;
        }

        let stats = tracker.stats().await?;
        tracker.stop().await?;
        if cancelled {
            warn!(?stats, "run cancelled");
        } else {
            info!(?stats, "run complete");
        }
        Ok(RunSummary {
            stats,
            unresolved,
            cancelled,
        })
    }

    /// Periodically times out stuck transactions and reconciles their
    /// nonces against the chain while the run is in progress.
    fn spawn_sweeper(
        &self,
        pool: Arc<WorkerPool>,
        tracker: TrackerHandle,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let stop = CancellationToken::new();
        let token = stop.clone();
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let handle = tokio::task::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                }
                let stale = match tracker.sweep_timed_out(timeout).await {
                    Ok(stale) => stale,
                    Err(_) => break,
                };
                if stale.is_empty() {
                    continue;
                }
                let mut by_account: HashMap<Address, Vec<u64>> = HashMap::new();
                for (address, nonce) in stale {
                    by_account.entry(address).or_default().push(nonce);
                }
                for (address, nonces) in &by_account {
                    pool.reconcile_account(*address, nonces).await;
                }
            }
        });
        (stop, handle)
    }
}

pub struct EngineBuilder {
    transport: Arc<dyn RpcTransport>,
    config: EngineConfig,
    cancel: Option<CancellationToken>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Validates the configuration; a bad config never starts a run.
    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        Ok(Engine {
            transport: self.transport,
            config: self.config,
            nonces: Arc::new(NonceAllocator::new()),
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        account::Account,
        error::{RejectReason, SubmitError},
        provider::{mock::MockTransport, ReceiptStatus},
        signer::{FeePolicy, TxTemplate},
    };
    use alloy::{
        primitives::{TxHash, U256},
        signers::local::PrivateKeySigner,
    };
    use async_trait::async_trait;
    use std::{collections::HashSet, str::FromStr};

    fn test_account() -> Account {
        Account::new(
            PrivateKeySigner::from_str(
                "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            )
            .unwrap(),
        )
    }

    fn transfer_requests(account: &Account, count: usize) -> Vec<TxRequest> {
        let template = TxTemplate::transfer(
            Address::repeat_byte(0xaa),
            U256::from(10_000_000_000_000_000u64),
            FeePolicy::Legacy {
                gas_price: 10_000_000_000,
            },
            31_337,
        );
        (0..count)
            .map(|_| TxRequest {
                account: account.clone(),
                template: template.clone(),
            })
            .collect()
    }

    fn fast_config(worker_count: usize) -> EngineConfig {
        EngineConfig {
            target_rate: 1_000.0,
            worker_count,
            timeout_secs: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn happy_path_uses_a_contiguous_nonce_block() {
        let mock = Arc::new(MockTransport::new());
        let account = test_account();
        let engine = Engine::builder(mock.clone())
            .config(fast_config(4))
            .build()
            .unwrap();

        let summary = engine.run(transfer_requests(&account, 10)).await.unwrap();

        assert_eq!(summary.stats.accepted, 10);
        assert_eq!(summary.stats.rejected, 0);
        assert_eq!(summary.stats.pending, 0);
        assert_eq!(summary.stats.timed_out, 0);
        assert!(summary.unresolved.is_empty());
        assert!(!summary.cancelled);

        let mut nonces = mock.submitted_nonces();
        nonces.sort_unstable();
        assert_eq!(nonces, (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn nonces_hit_the_wire_in_order_without_pipelining() {
        let mock = Arc::new(MockTransport::new());
        let account = test_account();
        let engine = Engine::builder(mock.clone())
            .config(fast_config(8))
            .build()
            .unwrap();

        engine.run(transfer_requests(&account, 20)).await.unwrap();
        let nonces = mock.submitted_nonces();
        assert_eq!(nonces, (0..20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn permanent_rejection_affects_only_one_request() {
        let mock = Arc::new(MockTransport::new());
        mock.fail_nonce_with(
            4,
            SubmitError::Permanent(RejectReason::InsufficientFunds),
        );
        let account = test_account();
        let engine = Engine::builder(mock.clone())
            .config(fast_config(4))
            .build()
            .unwrap();

        let summary = engine.run(transfer_requests(&account, 10)).await.unwrap();

        assert_eq!(summary.stats.accepted, 9);
        assert_eq!(summary.stats.rejected, 1);
        assert_eq!(summary.stats.timed_out, 0);

        // the rejected slot is not handed to some other pending
        // request: every submitted nonce is unique and 4 is absent
        let nonces = mock.submitted_nonces();
        let unique: HashSet<u64> = nonces.iter().copied().collect();
        assert_eq!(unique.len(), nonces.len());
        assert!(!unique.contains(&4));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let mock = Arc::new(MockTransport::new());
        mock.fail_transient(2);
        let account = test_account();
        let config = EngineConfig {
            retry_backoff_ms: 10,
            ..fast_config(2)
        };
        let engine = Engine::builder(mock.clone()).config(config).build().unwrap();

        let summary = engine.run(transfer_requests(&account, 3)).await.unwrap();
        assert_eq!(summary.stats.accepted, 3);
        assert_eq!(summary.stats.rejected, 0);
    }

    #[tokio::test]
    async fn unconfirmed_transaction_times_out_and_is_reoffered() {
        let mock = Arc::new(MockTransport::new());
        mock.hold_nonce(1);
        let account = test_account();
        let engine = Engine::builder(mock.clone())
            .config(fast_config(4))
            .build()
            .unwrap();

        let summary = engine.run(transfer_requests(&account, 3)).await.unwrap();

        assert_eq!(summary.stats.accepted, 2);
        assert_eq!(summary.stats.timed_out, 1);
        assert_eq!(summary.unresolved, vec![(account.address(), 1)]);

        // reconciliation re-offered the dropped nonce
        assert_eq!(engine.nonces().peek(account.address()), Some(1));
    }

    #[tokio::test]
    async fn pipelined_run_resolves_every_outcome() {
        let mock = Arc::new(MockTransport::new());
        let account = test_account();
        let config = EngineConfig {
            pipelining_enabled: true,
            ..fast_config(8)
        };
        let engine = Engine::builder(mock.clone()).config(config).build().unwrap();

        let summary = engine.run(transfer_requests(&account, 20)).await.unwrap();

        assert_eq!(summary.stats.accepted, 20);
        assert_eq!(summary.stats.rejected, 0);
        assert_eq!(summary.stats.timed_out, 0);
        assert!(summary.unresolved.is_empty());

        // without the gate, wire order may interleave; every nonce
        // still goes out exactly once
        let mut nonces = mock.submitted_nonces();
        nonces.sort_unstable();
        assert_eq!(nonces, (0..20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn signing_failure_is_rejected_without_reaching_the_wire() {
        let mock = Arc::new(MockTransport::new());
        let account = test_account();
        let mut requests = transfer_requests(&account, 3);
        requests[0].template.gas_limit = 1_000;
        let engine = Engine::builder(mock.clone())
            .config(fast_config(2))
            .build()
            .unwrap();

        let summary = engine.run(requests).await.unwrap();

        assert_eq!(summary.stats.accepted, 2);
        assert_eq!(summary.stats.rejected, 1);
        assert_eq!(mock.submitted_nonces().len(), 2);
    }

    /// Transport whose submissions panic, taking the worker task down.
    struct PanickingTransport;

    #[async_trait]
    impl crate::provider::RpcTransport for PanickingTransport {
        async fn submit(&self, _raw_tx: &[u8]) -> std::result::Result<TxHash, SubmitError> {
            panic!("transport dropped the connection");
        }

        async fn transaction_count(
            &self,
            _address: Address,
        ) -> std::result::Result<u64, SubmitError> {
            Ok(0)
        }

        async fn receipt_status(
            &self,
            _tx_hash: TxHash,
        ) -> std::result::Result<ReceiptStatus, SubmitError> {
            Ok(ReceiptStatus::NotFound)
        }
    }

    #[tokio::test]
    async fn worker_panic_surfaces_after_cleanup() {
        let account = test_account();
        let engine = Engine::builder(Arc::new(PanickingTransport))
            .config(fast_config(2))
            .build()
            .unwrap();

        let result = engine.run(transfer_requests(&account, 2)).await;
        assert!(matches!(result, Err(BarrageError::WorkerPanic(_))));
    }

    #[tokio::test]
    async fn cancellation_stops_dequeues_and_never_reuses_nonces() {
        let mock = Arc::new(MockTransport::new());
        let account = test_account();
        let config = EngineConfig {
            target_rate: 50.0,
            worker_count: 3,
            timeout_secs: 1,
            ..Default::default()
        };
        let engine = Engine::builder(mock.clone())
            .config(config.clone())
            .build()
            .unwrap();
        let cancel = engine.cancel_token();

        let run = tokio::spawn({
            let requests = transfer_requests(&account, 40);
            async move { engine.run(requests).await }
        });
        tokio::time::sleep(Duration::from_millis(120)).await;
        cancel.cancel();
        let summary = run.await.unwrap().unwrap();

        assert!(summary.cancelled);
        let first_batch = mock.submitted_nonces();
        assert!(first_batch.len() < 40, "cancellation should cut the run short");

        // a fresh run that reconciles first never repeats a nonce
        let engine = Engine::builder(mock.clone()).config(config).build().unwrap();
        engine.run(transfer_requests(&account, 5)).await.unwrap();

        let all = mock.submitted_nonces();
        let unique: HashSet<u64> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len(), "a nonce was allocated twice");
    }
}
