//! Scripted in-memory transport for engine tests: decodes submitted
//! envelopes, confirms them instantly unless told otherwise, and can
//! be programmed to fail specific nonces or hold them unconfirmed.

use std::{
    collections::{BTreeSet, HashMap},
    sync::Mutex,
};

use alloy::{
    consensus::{transaction::SignerRecoverable, Transaction, TxEnvelope},
    eips::eip2718::Decodable2718,
    primitives::{Address, TxHash},
};
use async_trait::async_trait;

use super::{ReceiptStatus, RpcTransport};
use crate::error::{RejectReason, SubmitError};

#[derive(Default)]
struct MockState {
    /// Seeded confirmed counts, advanced as contiguous nonces confirm.
    base_counts: HashMap<Address, u64>,
    confirmed_nonces: HashMap<Address, BTreeSet<u64>>,
    statuses: HashMap<TxHash, ReceiptStatus>,
    submissions: Vec<(Address, u64, TxHash)>,
    fail_nonce: HashMap<u64, SubmitError>,
    transient_failures: u32,
    held: BTreeSet<u64>,
}

#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_transaction_count(&self, address: Address, count: u64) {
        self.lock().base_counts.insert(address, count);
    }

    /// The next submission carrying `nonce` fails with `err`.
    pub fn fail_nonce_with(&self, nonce: u64, err: SubmitError) {
        self.lock().fail_nonce.insert(nonce, err);
    }

    /// The next `n` submissions fail transiently regardless of nonce.
    pub fn fail_transient(&self, n: u32) {
        self.lock().transient_failures = n;
    }

    /// Submissions carrying `nonce` are accepted but never confirm.
    pub fn hold_nonce(&self, nonce: u64) {
        self.lock().held.insert(nonce);
    }

    /// Nonces of every accepted submission, in wire order.
    pub fn submitted_nonces(&self) -> Vec<u64> {
        self.lock()
            .submissions
            .iter()
            .map(|(_, nonce, _)| *nonce)
            .collect()
    }

    pub fn submissions(&self) -> Vec<(Address, u64)> {
        self.lock()
            .submissions
            .iter()
            .map(|(address, nonce, _)| (*address, *nonce))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock lock poisoned")
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn submit(&self, raw_tx: &[u8]) -> Result<TxHash, SubmitError> {
        let mut buf = raw_tx;
        let envelope = TxEnvelope::decode_2718(&mut buf)
            .map_err(|e| SubmitError::Permanent(RejectReason::Malformed(e.to_string())))?;
        let from = envelope
            .recover_signer()
            .map_err(|e| SubmitError::Permanent(RejectReason::Malformed(e.to_string())))?;
        let nonce = envelope.nonce();
        let tx_hash = *envelope.tx_hash();

        let mut state = self.lock();
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(SubmitError::Transient("mock transport unavailable".into()));
        }
        if let Some(err) = state.fail_nonce.remove(&nonce) {
            return Err(err);
        }

        state.submissions.push((from, nonce, tx_hash));
        if state.held.contains(&nonce) {
            state.statuses.insert(tx_hash, ReceiptStatus::Pending);
        } else {
            state.statuses.insert(tx_hash, ReceiptStatus::Confirmed);
            state.confirmed_nonces.entry(from).or_default().insert(nonce);
        }
        Ok(tx_hash)
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, SubmitError> {
        let state = self.lock();
        let mut count = state.base_counts.get(&address).copied().unwrap_or(0);
        if let Some(confirmed) = state.confirmed_nonces.get(&address) {
            while confirmed.contains(&count) {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn receipt_status(&self, tx_hash: TxHash) -> Result<ReceiptStatus, SubmitError> {
        Ok(self
            .lock()
            .statuses
            .get(&tx_hash)
            .copied()
            .unwrap_or(ReceiptStatus::NotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{sign_request, FeePolicy, TxTemplate};
    use alloy::{primitives::U256, signers::local::PrivateKeySigner};
    use std::str::FromStr;

    fn signed(nonce: u64) -> crate::signer::SignedTx {
        let signer = PrivateKeySigner::from_str(
            "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
        )
        .unwrap();
        let template = TxTemplate::transfer(
            Address::repeat_byte(0x11),
            U256::from(1u64),
            FeePolicy::Legacy { gas_price: 1 },
            1,
        );
        sign_request(&signer, &template, nonce).unwrap()
    }

    #[tokio::test]
    async fn confirms_and_advances_count() {
        let mock = MockTransport::new();
        let tx = signed(0);
        let hash = mock.submit(&tx.raw).await.unwrap();
        assert_eq!(hash, tx.tx_hash);
        assert_eq!(
            mock.receipt_status(hash).await.unwrap(),
            ReceiptStatus::Confirmed
        );
        assert_eq!(mock.transaction_count(tx.from).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn held_nonce_stays_pending_and_gaps_the_count() {
        let mock = MockTransport::new();
        mock.hold_nonce(0);
        let tx0 = signed(0);
        let tx1 = signed(1);
        let hash0 = mock.submit(&tx0.raw).await.unwrap();
        mock.submit(&tx1.raw).await.unwrap();
        assert_eq!(
            mock.receipt_status(hash0).await.unwrap(),
            ReceiptStatus::Pending
        );
        // nonce 1 confirmed, but 0 never did: count stays at the gap
        assert_eq!(mock.transaction_count(tx0.from).await.unwrap(), 0);
    }
}
