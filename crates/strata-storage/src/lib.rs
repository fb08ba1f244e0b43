//! Strata Storage - Block allocation and write-ahead journaling
//!
//! This crate provides:
//! - On-disk layout: header, super blocks and allocation-group bitmaps
//! - A concurrent block allocator with per-operation group locking
//! - Write-ahead transactions with rollback recovery
//! - Journals that run staged operations in safe or non-safe mode
//! - Memory and file-backed block stores

pub mod allocator;
pub mod bitmap;
pub mod context;
pub mod disk;
pub mod format;
pub mod journal;
pub mod journal_log;
pub mod layout;
pub mod operation;
pub mod raw_io;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use allocator::Allocator;
pub use bitmap::AllocationBitmap;
pub use context::{AllocationContext, BlockChain};
pub use disk::FileStore;
pub use format::{format, format_with_config};
pub use journal::{Journal, NonSafeJournal, SafeJournal, open_journal};
pub use journal_log::{Extent, JournalLog, LogKind, LogRecord, RecoveryReport, StagedWrite};
pub use layout::{DatabaseHeader, Geometry, GroupSlot, LINK_HEADER_SIZE};
pub use operation::{Operation, Prepared, ReadService, Service, StoreReader};
pub use raw_io::{AlignedBuffer, RawFile};
pub use service::{NonSafeService, SafeService};
pub use store::{BlockStore, MemoryStore, StoreStats};
