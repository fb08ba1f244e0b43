//! Core type definitions for strata
//!
//! Identifiers, block classifications and strategy enums shared by the
//! storage engine and the operations that run on top of it.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Address of one fixed-size block on the backing store
pub type BlockAddress = u64;

/// Identity of an in-flight operation, used as the owner of allocation-group
/// locks and reserved address pools.
#[derive(Clone, Copy, PartialEq, Eq, Hash, From, Into)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Generate a new random operation ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperationId({})", self.0)
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a block holds. Stores may use it for caching or diagnostics; the
/// engine uses it to tag every read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKind {
    /// The database header at address 0
    Header,
    /// A reserved super block
    SuperBlock,
    /// An allocation-group bitmap
    AllocationBitmap,
    /// Node header (common or version)
    NodeHeader,
    /// B+ tree node
    BTree,
    /// Single-block object payload
    ObjectData,
    /// Multi-block stream payload
    StreamData,
    /// In-flight transaction slots
    JournalSector,
    /// Journal log records
    JournalLog,
    /// Before-image saved by the journal
    JournalBackup,
    /// Kind not known to the caller
    Unknown,
}

/// How the allocator should treat a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Initial reservation for an operation; fails when space is short
    Normal,
    /// Top-up of an operation that already committed to needing more
    DynamicAllocation,
    /// Log and backup blocks for a journal transaction
    JournalAllocation,
}

impl AllocationStrategy {
    /// Forced strategies may draw from groups locked by other operations
    #[must_use]
    pub const fn is_forced(&self) -> bool {
        !matches!(self, Self::Normal)
    }
}

/// Durability strategy of a journal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalMode {
    /// Every stage is committed through the write-ahead log
    #[default]
    Safe,
    /// Writes go straight to the store; a crash may leave partial state
    NonSafe,
}

impl JournalMode {
    /// What a failed operation may have done to the store
    #[must_use]
    pub const fn failure_consequence(&self) -> &'static str {
        match self {
            Self::Safe => "stages after the last committed one were not applied",
            Self::NonSafe => "the store may be left inconsistent",
        }
    }
}

impl fmt::Display for JournalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Safe => write!(f, "safe"),
            Self::NonSafe => write!(f, "non-safe"),
        }
    }
}
