//! Error types for strata
//!
//! Lower layers (allocator, journal log, stores) return these unchanged; the
//! journal driver is the only place that wraps a stage failure into
//! [`Error::OperationFailed`].

use crate::types::JournalMode;
use thiserror::Error;

/// Common result type for strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for strata
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation consumed every block it reserved in its prepare phase and
    /// was not allowed to grow. Signals an estimation bug in the caller.
    #[error("allocation context exhausted after {granted} blocks and dynamic allocation is disabled")]
    AllocationExhausted { granted: usize },

    #[error("out of space: requested {requested} blocks, only {available} available")]
    OutOfSpace { requested: u64, available: u64 },

    /// Header validation failed at mount; the store must be reformatted.
    #[error("invalid store: {0}")]
    InvalidStore(String),

    #[error("operation failed under {mode} journal ({}): {source}", .mode.failure_consequence())]
    OperationFailed {
        mode: JournalMode,
        #[source]
        source: Box<Error>,
    },

    #[error("journal sector {sector} has no free transaction slot")]
    JournalSectorFull { sector: u64 },

    #[error("address {address} out of range (block count {block_count})")]
    AddressOutOfRange { address: u64, block_count: u64 },

    #[error("journal corruption detected: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create an invalid store error
    pub fn invalid_store(msg: impl Into<String>) -> Self {
        Self::InvalidStore(msg.into())
    }

    /// Create a corruption error
    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Wrap a stage failure with the journal mode that was active
    #[must_use]
    pub fn operation_failed(mode: JournalMode, source: Self) -> Self {
        Self::OperationFailed {
            mode,
            source: Box::new(source),
        }
    }

    /// Check if the failure may have left the store inconsistent
    #[must_use]
    pub fn may_corrupt(&self) -> bool {
        matches!(
            self,
            Self::OperationFailed {
                mode: JournalMode::NonSafe,
                ..
            }
        )
    }

    /// Check if this error means the device ran out of blocks
    #[must_use]
    pub fn is_out_of_space(&self) -> bool {
        match self {
            Self::OutOfSpace { .. } | Self::AllocationExhausted { .. } => true,
            Self::OperationFailed { source, .. } => source.is_out_of_space(),
            _ => false,
        }
    }
}
