use crate::domain::ledger::{ConversionErrorCode, ConversionId, ConversionStatus};
use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConversionError>;

#[derive(Error, Debug)]
pub enum ConversionError {
    /// The request failed validation; nothing was persisted.
    #[error("Request rejected ({code}): {message}")]
    Rejected {
        code: ConversionErrorCode,
        message: String,
    },
    /// Another execution for the same idempotency key is in flight.
    #[error("Conversion in progress for idempotency key {idempotency_key}")]
    InProgress { idempotency_key: String },
    #[error("Conversion {id} is not ready for execution (status {status}, next retry {next_retry_at:?})")]
    NotReady {
        id: ConversionId,
        status: ConversionStatus,
        next_retry_at: Option<DateTime<Utc>>,
    },
    #[error("Conversion {id} already completed with tx {tx_hash}")]
    AlreadyCompleted { id: ConversionId, tx_hash: String },
    #[error("Invalid transition for conversion {id}: cannot {action} from {from}")]
    InvalidTransition {
        id: ConversionId,
        from: ConversionStatus,
        action: &'static str,
    },
    #[error("Conversion not found: {0}")]
    NotFound(String),
    #[error("Idempotency key already bound to another conversion: {0}")]
    DuplicateIdempotencyKey(String),
    #[error("Timed out during {0}")]
    Timeout(&'static str),
    #[error("Treasury error: {0}")]
    Treasury(String),
    #[error("Payment verification error: {0}")]
    PaymentVerification(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),
}

impl ConversionError {
    pub fn rejected(code: ConversionErrorCode, message: impl Into<String>) -> Self {
        Self::Rejected {
            code,
            message: message.into(),
        }
    }

    /// Maps the error onto the ledger's error code taxonomy.
    pub fn code(&self) -> ConversionErrorCode {
        match self {
            Self::Rejected { code, .. } => *code,
            Self::InProgress { .. } | Self::AlreadyCompleted { .. } => ConversionErrorCode::Duplicate,
            Self::DuplicateIdempotencyKey(_) => ConversionErrorCode::Duplicate,
            Self::Treasury(_) => ConversionErrorCode::TransferFailed,
            _ => ConversionErrorCode::Internal,
        }
    }

    /// True for conflict signals that a caller should poll on rather than treat as failure.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::InProgress { .. } | Self::NotReady { .. })
    }
}
