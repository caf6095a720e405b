use std::{sync::Arc, time::Duration};

use alloy::primitives::{Address, TxHash};
use rand::Rng;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    account::Account,
    config::EngineConfig,
    error::{RejectReason, SubmitError},
    nonce::NonceAllocator,
    provider::{ReceiptStatus, RpcTransport},
    rate::RateController,
    signer::{sign_request, SignedTx, TxTemplate},
    tracker::{Outcome, TrackerHandle},
};

/// How often a worker polls for a receipt while awaiting confirmation.
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// One unit of work. The nonce is assigned by the allocator at
/// dispatch time, never by the caller.
#[derive(Clone, Debug)]
pub struct TxRequest {
    pub account: Account,
    pub template: TxTemplate,
}

/// Fixed-size set of workers draining a shared queue: dequeue, admit,
/// allocate, sign, submit with bounded retries, then await
/// confirmation and report the outcome.
pub(crate) struct WorkerPool {
    transport: Arc<dyn RpcTransport>,
    nonces: Arc<NonceAllocator>,
    rate: Arc<RateController>,
    tracker: TrackerHandle,
    cancel: CancellationToken,
    config: EngineConfig,
}

impl WorkerPool {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        nonces: Arc<NonceAllocator>,
        rate: Arc<RateController>,
        tracker: TrackerHandle,
        cancel: CancellationToken,
        config: EngineConfig,
    ) -> Self {
        Self {
            transport,
            nonces,
            rate,
            tracker,
            cancel,
            config,
        }
    }

    pub fn spawn(self: Arc<Self>, queue: mpsc::Receiver<TxRequest>) -> Vec<JoinHandle<()>> {
        let queue = Arc::new(Mutex::new(queue));
        (0..self.config.worker_count)
            .map(|worker_id| {
                let pool = self.clone();
                let queue = queue.clone();
                tokio::task::spawn(async move { pool.run_worker(worker_id, queue).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker_id: usize, queue: Arc<Mutex<mpsc::Receiver<TxRequest>>>) {
        loop {
            // the cancel signal denies new dequeues; the item already
            // in hand is in flight and allowed to finish
            let request = {
                let mut receiver = queue.lock().await;
                tokio::select! {
                    _ = self.cancel.cancelled() => None,
                    request = receiver.recv() => request,
                }
            };
            let Some(request) = request else {
                debug!(worker_id, "worker draining: no more work");
                break;
            };
            self.rate.admit().await;
            self.process(request).await;
        }
    }

    async fn process(&self, request: TxRequest) {
        let address = request.account.address();

        // With pipelining off, allocation and the first wire write for
        // one account happen under its gate so nonces are submitted in
        // allocation order. Confirmation-wait happens after release.
        let gate = if self.config.pipelining_enabled {
            None
        } else {
            self.nonces.submit_gate(address)
        };
        let guard = match &gate {
            Some(gate) => Some(gate.lock().await),
            None => None,
        };

        let nonce = match self.nonces.allocate(address) {
            Ok(nonce) => nonce,
            Err(e) => {
                warn!(%address, "nonce allocation failed: {e}");
                return;
            }
        };

        let signed = match sign_request(request.account.signer(), &request.template, nonce) {
            Ok(signed) => signed,
            Err(e) => {
                // fatal for this request only; the nonce slot stays
                // burned until reconciliation re-offers it
                warn!(%address, nonce, "signing failed: {e}");
                let _ = self
                    .tracker
                    .record(
                        address,
                        nonce,
                        Outcome::Rejected(RejectReason::Signing(e.to_string())),
                    )
                    .await;
                return;
            }
        };

        let submit_result = self.submit_with_retry(&signed).await;
        drop(guard);

        match submit_result {
            Ok(tx_hash) => {
                debug!(%address, nonce, %tx_hash, "submitted");
                if self.tracker.submitted(&signed).await.is_err() {
                    return;
                }
                self.await_confirmation(address, nonce, tx_hash).await;
            }
            Err(SubmitError::Transient(msg)) => {
                // retry budget exhausted
                warn!(%address, nonce, "submission failed after retries: {msg}");
                self.rate.record_outcome(true).await;
                let _ = self
                    .tracker
                    .record(address, nonce, Outcome::Rejected(RejectReason::Other(msg)))
                    .await;
            }
            Err(SubmitError::Permanent(reason)) => {
                warn!(%address, nonce, "submission rejected: {reason}");
                self.rate.record_outcome(true).await;
                let _ = self
                    .tracker
                    .record(address, nonce, Outcome::Rejected(reason))
                    .await;
            }
            Err(SubmitError::NonceConflict(kind)) => {
                warn!(%address, nonce, "nonce conflict ({kind}), reconciling with chain");
                self.rate.record_outcome(true).await;
                let _ = self
                    .tracker
                    .record(
                        address,
                        nonce,
                        Outcome::Rejected(RejectReason::Other(kind.to_string())),
                    )
                    .await;
                self.reconcile_account(address, &[nonce]).await;
            }
        }
    }

    async fn submit_with_retry(&self, signed: &SignedTx) -> Result<TxHash, SubmitError> {
        let mut attempt = 0u32;
        loop {
            match self.transport.submit(&signed.raw).await {
                Ok(tx_hash) => return Ok(tx_hash),
                Err(SubmitError::Transient(msg)) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(SubmitError::Transient(msg));
                    }
                    let backoff = backoff_with_jitter(self.config.retry_backoff_ms, attempt);
                    debug!(
                        nonce = signed.nonce,
                        attempt,
                        "transient submit failure, retrying in {backoff:?}: {msg}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Polls for a receipt until confirmation or the configured
    /// timeout. On timeout the entry is left pending; the tracker's
    /// sweep owns the timed-out transition so the clock is consistent.
    async fn await_confirmation(
        &self,
        address: Address,
        nonce: u64,
        tx_hash: TxHash,
    ) {
        let deadline = Instant::now() + Duration::from_secs(self.config.timeout_secs);
        loop {
            match self.transport.receipt_status(tx_hash).await {
                Ok(ReceiptStatus::Confirmed) => {
                    info!(%address, nonce, %tx_hash, "transaction confirmed");
                    self.rate.record_outcome(false).await;
                    let _ = self
                        .tracker
                        .record(address, nonce, Outcome::Accepted(tx_hash))
                        .await;
                    return;
                }
                Ok(status) => {
                    debug!(%tx_hash, ?status, "awaiting confirmation");
                }
                Err(e) => {
                    debug!(%tx_hash, "receipt poll failed: {e}");
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            tokio::time::sleep(CONFIRM_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Queries the chain's authoritative count and re-offers the
    /// given never-confirmed nonces.
    pub(crate) async fn reconcile_account(
        &self,
        address: Address,
        unconfirmed: &[u64],
    ) {
        match self.transport.transaction_count(address).await {
            Ok(confirmed) => self.nonces.reconcile(address, confirmed, unconfirmed),
            Err(e) => warn!(%address, "reconciliation query failed: {e}"),
        }
    }
}

fn backoff_with_jitter(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..=exp / 2);
    Duration::from_millis(exp.saturating_add(jitter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff_with_jitter(100, 1);
        let fifth = backoff_with_jitter(100, 5);
        assert!(first >= Duration::from_millis(200));
        assert!(first <= Duration::from_millis(300));
        assert!(fifth >= Duration::from_millis(3200));
    }
}
