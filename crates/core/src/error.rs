use alloy::primitives::Address;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BarrageError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("signing failed: {0}")]
    Signing(#[from] SignError),

    #[error("nonce conflict for {address}: {kind}")]
    NonceConflict {
        address: Address,
        kind: NonceConflictKind,
    },

    #[error("submission failed: {0}")]
    Submit(#[from] SubmitError),

    #[error("internal channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("worker task panicked: {0}")]
    WorkerPanic(String),
}

/// Fatal before anything starts; no partial run is allowed to begin.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("target_rate must be positive, got {0}")]
    NonPositiveRate(f64),

    #[error("worker_count must be nonzero")]
    ZeroWorkers,

    #[error("timeout_secs must be nonzero")]
    ZeroTimeout,

    #[error("rejection_backoff_threshold must be in (0, 1], got {0}")]
    ThresholdOutOfRange(f64),

    #[error("outcome_window must be nonzero")]
    ZeroWindow,
}

/// Fatal for the single request being signed, never for the run.
#[derive(Debug, Error)]
pub enum SignError {
    #[error("invalid template: {0}")]
    InvalidTemplate(TemplateErrorKind),

    #[error("signer rejected the payload: {0}")]
    Signer(#[from] alloy::signers::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateErrorKind {
    #[error("gas limit {0} is below the intrinsic transfer cost")]
    GasTooLow(u64),

    #[error("chain id must be nonzero")]
    ChainIdMissing,

    #[error("fee must be nonzero")]
    ZeroFee,

    #[error("max priority fee {priority} exceeds max fee {max}")]
    PriorityFeeTooHigh { priority: u128, max: u128 },
}

/// Errors surfaced by an RPC transport when submitting a transaction,
/// pre-classified so the worker pool can decide whether to retry.
#[derive(Clone, Debug, Error)]
pub enum SubmitError {
    /// Network hiccups, rate limits, timeouts. Retried with backoff.
    #[error("transient rpc failure: {0}")]
    Transient(String),

    /// The node will never accept this transaction. Not retried.
    #[error("{0}")]
    Permanent(RejectReason),

    /// The account's nonce state disagrees with the chain. Triggers
    /// reconciliation rather than a retry.
    #[error("nonce conflict: {0}")]
    NonceConflict(NonceConflictKind),
}

/// Terminal rejection reasons reported in outcomes.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RejectReason {
    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("transaction already known")]
    AlreadyKnown,

    #[error("replacement transaction underpriced")]
    Underpriced,

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("malformed transaction: {0}")]
    Malformed(String),

    #[error("rejected: {0}")]
    Other(String),
}

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum NonceConflictKind {
    #[error("nonce too low")]
    TooLow,

    #[error("nonce too high")]
    TooHigh,

    #[error("account not seeded with a confirmed transaction count")]
    Unseeded,
}
