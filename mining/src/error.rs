use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MiningError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("chain rpc error: {0}")]
    ChainRpc(String),

    #[error("timed out waiting for receipt of {0}")]
    ReceiptTimeout(String),

    #[error("chainlink price for feed {feed} not synced at block {block}")]
    PriceNotSynced { feed: String, block: u64 },

    #[error("negative amount at wire boundary: {0}")]
    NegativeAmount(Decimal),

    #[error("amount exceeds wire range: {0}")]
    AmountOverflow(Decimal),

    #[error("data inconsistency: {0}")]
    Inconsistency(String),
}

pub type MiningResult<T> = Result<T, MiningError>;

impl From<bincode::Error> for MiningError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for MiningError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for MiningError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::ChainRpc(format!("request timed out: {err}"))
        } else {
            Self::Http(err.to_string())
        }
    }
}

impl From<std::io::Error> for MiningError {
    fn from(err: std::io::Error) -> Self {
        Self::Store(err.to_string())
    }
}
