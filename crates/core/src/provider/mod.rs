pub mod mock;

use alloy::{
    primitives::{Address, TxHash},
    providers::{DynProvider, Provider, ProviderBuilder},
    transports::{http::reqwest::Url, RpcError},
};
use async_trait::async_trait;
use tracing::debug;

use crate::error::{NonceConflictKind, RejectReason, SubmitError};

/// Inclusion state of a previously submitted transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiptStatus {
    Confirmed,
    Pending,
    NotFound,
}

/// The network seam. The engine treats implementations as unreliable,
/// possibly rate-limited peers; every error they return must already
/// be classified (see [`SubmitError`]) so callers can pick a retry
/// policy without parsing node-specific messages themselves.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Broadcasts raw signed transaction bytes.
    async fn submit(&self, raw_tx: &[u8]) -> Result<TxHash, SubmitError>;

    /// The chain's authoritative confirmed transaction count.
    async fn transaction_count(&self, address: Address) -> Result<u64, SubmitError>;

    /// Whether `tx_hash` has been included, is still in the mempool,
    /// or is unknown to the node.
    async fn receipt_status(&self, tx_hash: TxHash) -> Result<ReceiptStatus, SubmitError>;
}

/// Classifies a node error message. Nodes disagree on exact wording,
/// so this matches the common geth/reth phrasings.
pub fn classify_submit_error(message: &str) -> SubmitError {
    let msg = message.to_lowercase();
    if msg.contains("nonce too low") {
        SubmitError::NonceConflict(NonceConflictKind::TooLow)
    } else if msg.contains("nonce too high") || msg.contains("nonce gap") {
        SubmitError::NonceConflict(NonceConflictKind::TooHigh)
    } else if msg.contains("insufficient funds") {
        SubmitError::Permanent(RejectReason::InsufficientFunds)
    } else if msg.contains("already known") || msg.contains("already imported") {
        SubmitError::Permanent(RejectReason::AlreadyKnown)
    } else if msg.contains("underpriced") {
        SubmitError::Permanent(RejectReason::Underpriced)
    } else if msg.contains("invalid")
        || msg.contains("malformed")
        || msg.contains("intrinsic gas")
        || msg.contains("exceeds block gas limit")
    {
        SubmitError::Permanent(RejectReason::Malformed(message.to_owned()))
    } else {
        SubmitError::Transient(message.to_owned())
    }
}

/// [`RpcTransport`] over a standard JSON-RPC HTTP endpoint.
pub struct HttpTransport {
    provider: DynProvider,
}

impl HttpTransport {
    pub fn new(provider: DynProvider) -> Self {
        Self { provider }
    }

    pub fn connect(url: Url) -> Self {
        Self::new(ProviderBuilder::new().connect_http(url).erased())
    }

    pub async fn chain_id(&self) -> Result<u64, SubmitError> {
        self.provider
            .get_chain_id()
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn submit(&self, raw_tx: &[u8]) -> Result<TxHash, SubmitError> {
        let pending = self
            .provider
            .send_raw_transaction(raw_tx)
            .await
            .map_err(|e| match e {
                RpcError::ErrorResp(payload) => classify_submit_error(payload.message.as_ref()),
                other => SubmitError::Transient(other.to_string()),
            })?;
        debug!(tx_hash = %pending.tx_hash(), "transaction submitted");
        Ok(*pending.tx_hash())
    }

    async fn transaction_count(&self, address: Address) -> Result<u64, SubmitError> {
        self.provider
            .get_transaction_count(address)
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))
    }

    async fn receipt_status(&self, tx_hash: TxHash) -> Result<ReceiptStatus, SubmitError> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))?;
        if receipt.is_some() {
            return Ok(ReceiptStatus::Confirmed);
        }
        let known = self
            .provider
            .get_transaction_by_hash(tx_hash)
            .await
            .map_err(|e| SubmitError::Transient(e.to_string()))?;
        Ok(if known.is_some() {
            ReceiptStatus::Pending
        } else {
            ReceiptStatus::NotFound
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_node_messages() {
        assert!(matches!(
            classify_submit_error("nonce too low: next nonce 4, tx nonce 2"),
            SubmitError::NonceConflict(NonceConflictKind::TooLow)
        ));
        assert!(matches!(
            classify_submit_error("insufficient funds for gas * price + value"),
            SubmitError::Permanent(RejectReason::InsufficientFunds)
        ));
        assert!(matches!(
            classify_submit_error("already known"),
            SubmitError::Permanent(RejectReason::AlreadyKnown)
        ));
        assert!(matches!(
            classify_submit_error("replacement transaction underpriced"),
            SubmitError::Permanent(RejectReason::Underpriced)
        ));
        assert!(matches!(
            classify_submit_error("connection reset by peer"),
            SubmitError::Transient(_)
        ));
    }
}
