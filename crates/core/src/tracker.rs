use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use alloy::primitives::{Address, TxHash};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{
    error::{BarrageError, RejectReason},
    signer::SignedTx,
};

/// Terminal result of one dispatched request. Once recorded for a
/// request it is never mutated; a later write for the same request is
/// dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    Accepted(TxHash),
    Rejected(RejectReason),
    TimedOut,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub accepted: u64,
    pub rejected: u64,
    pub pending: u64,
    pub timed_out: u64,
}

struct PendingEntry {
    tx_hash: TxHash,
    submitted_at: Instant,
}

enum TrackerMessage {
    Submitted {
        from: Address,
        nonce: u64,
        tx_hash: TxHash,
        on_receive: oneshot::Sender<()>,
    },
    Resolved {
        from: Address,
        nonce: u64,
        outcome: Outcome,
        on_receive: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<TrackerStats>,
    },
    PendingNonces {
        address: Address,
        reply: oneshot::Sender<Vec<u64>>,
    },
    SweepTimedOut {
        older_than: Duration,
        reply: oneshot::Sender<Vec<(Address, u64)>>,
    },
    TimedOutNonces {
        reply: oneshot::Sender<Vec<(Address, u64)>>,
    },
    Stop {
        on_stop: oneshot::Sender<()>,
    },
}

/// Single-writer actor owning all per-request state; workers talk to
/// it through [`TrackerHandle`], so aggregate counters never need
/// shared-memory locking.
struct Tracker {
    receiver: mpsc::Receiver<TrackerMessage>,
    pending: HashMap<(Address, u64), PendingEntry>,
    resolved: HashMap<(Address, u64), Outcome>,
    stats: TrackerStats,
}

impl Tracker {
    fn new(receiver: mpsc::Receiver<TrackerMessage>) -> Self {
        Self {
            receiver,
            pending: HashMap::new(),
            resolved: HashMap::new(),
            stats: TrackerStats::default(),
        }
    }

    fn handle_submitted(&mut self, from: Address, nonce: u64, tx_hash: TxHash) {
        // A re-offered nonce starts a fresh request lifecycle.
        self.resolved.remove(&(from, nonce));
        let prior = self.pending.insert(
            (from, nonce),
            PendingEntry {
                tx_hash,
                submitted_at: Instant::now(),
            },
        );
        if prior.is_none() {
            self.stats.pending += 1;
        }
    }

    fn handle_resolved(&mut self, from: Address, nonce: u64, outcome: Outcome) {
        let key = (from, nonce);
        if let Some(existing) = self.resolved.get(&key) {
            debug!(
                %from,
                nonce,
                ?existing,
                "dropping outcome for already-resolved request"
            );
            return;
        }
        if self.pending.remove(&key).is_some() {
            self.stats.pending -= 1;
        }
        match &outcome {
            Outcome::Accepted(_) => self.stats.accepted += 1,
            Outcome::Rejected(_) => self.stats.rejected += 1,
            Outcome::TimedOut => self.stats.timed_out += 1,
        }
        self.resolved.insert(key, outcome);
    }

    fn sweep_timed_out(&mut self, older_than: Duration) -> Vec<(Address, u64)> {
        let now = Instant::now();
        let mut stale = self
            .pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.submitted_at) >= older_than)
            .map(|((from, nonce), entry)| (*from, *nonce, entry.tx_hash))
            .collect::<Vec<_>>();
        stale.sort_by_key(|(from, nonce, _)| (*from, *nonce));

        for (from, nonce, tx_hash) in &stale {
            warn!(%from, nonce, %tx_hash, "transaction timed out waiting for confirmation");
            self.handle_resolved(*from, *nonce, Outcome::TimedOut);
        }
        stale
            .into_iter()
            .map(|(from, nonce, _)| (from, nonce))
            .collect()
    }

    fn pending_nonces(&self, address: Address) -> Vec<u64> {
        let mut nonces = self
            .pending
            .keys()
            .filter(|(from, _)| *from == address)
            .map(|(_, nonce)| *nonce)
            .collect::<Vec<_>>();
        nonces.sort_unstable();
        nonces
    }

    async fn run(mut self) {
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                TrackerMessage::Submitted {
                    from,
                    nonce,
                    tx_hash,
                    on_receive,
                } => {
                    self.handle_submitted(from, nonce, tx_hash);
                    let _ = on_receive.send(());
                }
                TrackerMessage::Resolved {
                    from,
                    nonce,
                    outcome,
                    on_receive,
                } => {
                    self.handle_resolved(from, nonce, outcome);
                    let _ = on_receive.send(());
                }
                TrackerMessage::Stats { reply } => {
                    let _ = reply.send(self.stats);
                }
                TrackerMessage::PendingNonces { address, reply } => {
                    let _ = reply.send(self.pending_nonces(address));
                }
                TrackerMessage::SweepTimedOut { older_than, reply } => {
                    let _ = reply.send(self.sweep_timed_out(older_than));
                }
                TrackerMessage::TimedOutNonces { reply } => {
                    let mut stale = self
                        .resolved
                        .iter()
                        .filter(|(_, outcome)| **outcome == Outcome::TimedOut)
                        .map(|((from, nonce), _)| (*from, *nonce))
                        .collect::<Vec<_>>();
                    stale.sort_unstable();
                    let _ = reply.send(stale);
                }
                TrackerMessage::Stop { on_stop } => {
                    let _ = on_stop.send(());
                    break;
                }
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackerHandle {
    sender: mpsc::Sender<TrackerMessage>,
}

impl TrackerHandle {
    pub fn spawn(bufsize: usize) -> Self {
        let (sender, receiver) = mpsc::channel(bufsize);
        tokio::task::spawn(Tracker::new(receiver).run());
        Self { sender }
    }

    async fn request<T>(
        &self,
        msg: TrackerMessage,
        receiver: oneshot::Receiver<T>,
    ) -> Result<T, BarrageError> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| BarrageError::ChannelClosed("tracker"))?;
        receiver
            .await
            .map_err(|_| BarrageError::ChannelClosed("tracker"))
    }

    /// Registers a submitted transaction as pending.
    pub async fn submitted(&self, tx: &SignedTx) -> Result<(), BarrageError> {
        let (sender, receiver) = oneshot::channel();
        self.request(
            TrackerMessage::Submitted {
                from: tx.from,
                nonce: tx.nonce,
                tx_hash: tx.tx_hash,
                on_receive: sender,
            },
            receiver,
        )
        .await
    }

    /// Records the terminal outcome for a request.
    pub async fn record(
        &self,
        from: Address,
        nonce: u64,
        outcome: Outcome,
    ) -> Result<(), BarrageError> {
        let (sender, receiver) = oneshot::channel();
        self.request(
            TrackerMessage::Resolved {
                from,
                nonce,
                outcome,
                on_receive: sender,
            },
            receiver,
        )
        .await
    }

    pub async fn stats(&self) -> Result<TrackerStats, BarrageError> {
        let (sender, receiver) = oneshot::channel();
        self.request(TrackerMessage::Stats { reply: sender }, receiver)
            .await
    }

    /// In-flight nonces for `address`, ascending.
    pub async fn pending_nonces(&self, address: Address) -> Result<Vec<u64>, BarrageError> {
        let (sender, receiver) = oneshot::channel();
        self.request(
            TrackerMessage::PendingNonces {
                address,
                reply: sender,
            },
            receiver,
        )
        .await
    }

    /// Marks every entry pending longer than `older_than` as timed
    /// out and returns their nonces as reconciliation candidates.
    pub async fn sweep_timed_out(
        &self,
        older_than: Duration,
    ) -> Result<Vec<(Address, u64)>, BarrageError> {
        let (sender, receiver) = oneshot::channel();
        self.request(
            TrackerMessage::SweepTimedOut {
                older_than,
                reply: sender,
            },
            receiver,
        )
        .await
    }

    /// Every request that resolved as timed out, ascending per
    /// account. These are the reconciliation candidates for a
    /// restart.
    pub async fn timed_out_nonces(&self) -> Result<Vec<(Address, u64)>, BarrageError> {
        let (sender, receiver) = oneshot::channel();
        self.request(TrackerMessage::TimedOutNonces { reply: sender }, receiver)
            .await
    }

    pub async fn stop(&self) -> Result<(), BarrageError> {
        let (sender, receiver) = oneshot::channel();
        self.request(TrackerMessage::Stop { on_stop: sender }, receiver)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{Bytes, B256};

    fn signed(from: Address, nonce: u64) -> SignedTx {
        SignedTx {
            raw: Bytes::from(vec![nonce as u8]),
            tx_hash: B256::repeat_byte(nonce as u8),
            from,
            nonce,
        }
    }

    #[tokio::test]
    async fn tracks_lifecycle_and_stats() {
        let tracker = TrackerHandle::spawn(8);
        let from = Address::repeat_byte(1);

        let tx = signed(from, 0);
        tracker.submitted(&tx).await.unwrap();
        assert_eq!(tracker.pending_nonces(from).await.unwrap(), vec![0]);

        tracker
            .record(from, 0, Outcome::Accepted(tx.tx_hash))
            .await
            .unwrap();
        let stats = tracker.stats().await.unwrap();
        assert_eq!(
            stats,
            TrackerStats {
                accepted: 1,
                rejected: 0,
                pending: 0,
                timed_out: 0
            }
        );
        tracker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn outcomes_are_terminal() {
        let tracker = TrackerHandle::spawn(8);
        let from = Address::repeat_byte(2);
        let tx = signed(from, 3);

        tracker.submitted(&tx).await.unwrap();
        tracker
            .record(from, 3, Outcome::Accepted(tx.tx_hash))
            .await
            .unwrap();
        tracker
            .record(from, 3, Outcome::Rejected(RejectReason::AlreadyKnown))
            .await
            .unwrap();

        let stats = tracker.stats().await.unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 0);
        tracker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn sweep_reports_stale_nonces() {
        let tracker = TrackerHandle::spawn(8);
        let from = Address::repeat_byte(3);

        tracker.submitted(&signed(from, 0)).await.unwrap();
        tracker.submitted(&signed(from, 1)).await.unwrap();

        // nothing is older than an hour
        assert!(tracker
            .sweep_timed_out(Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());

        let stale = tracker.sweep_timed_out(Duration::ZERO).await.unwrap();
        assert_eq!(stale, vec![(from, 0), (from, 1)]);

        let stats = tracker.stats().await.unwrap();
        assert_eq!(stats.timed_out, 2);
        assert_eq!(stats.pending, 0);
        assert!(tracker.pending_nonces(from).await.unwrap().is_empty());
        tracker.stop().await.unwrap();
    }
}
