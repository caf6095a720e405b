pub mod account;
pub mod config;
pub mod engine;
pub mod error;
pub mod nonce;
pub mod pool;
pub mod provider;
pub mod rate;
pub mod signer;
pub mod tracker;

pub type Result<T> = std::result::Result<T, error::BarrageError>;
