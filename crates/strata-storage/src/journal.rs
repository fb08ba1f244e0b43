//! Journals: the entry point for running operations
//!
//! A journal owns the allocator of a store and drives operations through
//! prepare, reservation and their stages. Both journals roll back in-flight
//! transactions when they start up.

use crate::allocator::Allocator;
use crate::context::AllocationContext;
use crate::journal_log::{JournalLog, RecoveryReport};
use crate::operation::{Operation, ReadService, StoreReader};
use crate::service::{NonSafeService, SafeService};
use crate::store::BlockStore;
use std::sync::Arc;
use strata_common::{BlockAddress, Error, JournalMode, Result, StorageConfig};
use tracing::{debug, info};

/// Runs operations against a store
pub trait Journal: Send + Sync {
    /// Durability strategy of this journal
    fn mode(&self) -> JournalMode;

    /// Prepare, reserve and run every stage of an operation. Stage errors
    /// come back wrapped in [`Error::OperationFailed`].
    fn execute(&self, operation: &mut dyn Operation) -> Result<()>;

    /// Read-only access for callers outside an operation
    fn read_service(&self) -> &dyn ReadService;

    /// Diagnostic location of a block
    fn physical_location(&self, address: BlockAddress) -> String;

    /// Free space in bytes
    fn free_space(&self) -> Result<u64>;

    /// The underlying store
    fn device_storage(&self) -> Arc<dyn BlockStore>;
}

/// State shared by both journal kinds
struct JournalCore {
    allocator: Arc<Allocator>,
    log: Arc<JournalLog>,
    reader: StoreReader,
    dynamic_top_up: usize,
    recovery: RecoveryReport,
}

impl JournalCore {
    fn startup(store: Arc<dyn BlockStore>, dynamic_top_up: usize, mode: JournalMode) -> Result<Self> {
        let allocator = Arc::new(Allocator::new(store.clone())?);
        let log = Arc::new(JournalLog::new(allocator.clone()));
        let recovery = log.recover()?;

        info!(
            "Opened '{}' with {} journal ({} blocks of {} bytes)",
            allocator.header().name,
            mode,
            allocator.block_count(),
            allocator.block_size()
        );
        Ok(Self {
            allocator,
            log,
            reader: StoreReader::new(store),
            dynamic_top_up,
            recovery,
        })
    }

    fn open_context(&self, operation: &mut dyn Operation) -> Result<AllocationContext> {
        let prepared = operation.prepare(&self.reader)?;
        debug!(
            hint = prepared.hint,
            blocks = prepared.blocks_required,
            dynamic = prepared.allow_dynamic,
            stages = operation.stage_count(),
            "operation prepared"
        );
        AllocationContext::new(self.allocator.clone(), &prepared, self.dynamic_top_up)
    }

    fn free_space(&self) -> Result<u64> {
        Ok(self.allocator.free_blocks()? * u64::from(self.allocator.block_size()))
    }
}

/// Journal that commits every stage through the write-ahead log
///
/// Each stage is atomic on its own; an operation that fails in a later stage
/// keeps the effects of the stages already committed.
pub struct SafeJournal {
    core: JournalCore,
}

impl SafeJournal {
    /// Open a formatted store, rolling back interrupted transactions
    pub fn startup(store: Arc<dyn BlockStore>, dynamic_top_up: usize) -> Result<Self> {
        Ok(Self {
            core: JournalCore::startup(store, dynamic_top_up, JournalMode::Safe)?,
        })
    }

    /// What recovery did at startup
    pub const fn recovery_report(&self) -> RecoveryReport {
        self.core.recovery
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.core.allocator
    }

    fn run(&self, operation: &mut dyn Operation) -> Result<()> {
        let context = self.core.open_context(operation)?;
        let mut service =
            SafeService::new(self.core.allocator.clone(), self.core.log.clone(), context);
        for stage in 0..operation.stage_count() {
            operation.execute(stage, &mut service)?;
            service.commit()?;
        }
        Ok(())
    }
}

impl Journal for SafeJournal {
    fn mode(&self) -> JournalMode {
        JournalMode::Safe
    }

    fn execute(&self, operation: &mut dyn Operation) -> Result<()> {
        self.run(operation)
            .map_err(|e| Error::operation_failed(JournalMode::Safe, e))
    }

    fn read_service(&self) -> &dyn ReadService {
        &self.core.reader
    }

    fn physical_location(&self, address: BlockAddress) -> String {
        self.core.allocator.store().physical_location(address)
    }

    fn free_space(&self) -> Result<u64> {
        self.core.free_space()
    }

    fn device_storage(&self) -> Arc<dyn BlockStore> {
        self.core.allocator.store().clone()
    }
}

/// Journal that writes directly to the store
///
/// Faster, but a crash or failed stage can leave partially written state.
pub struct NonSafeJournal {
    core: JournalCore,
}

impl NonSafeJournal {
    /// Open a formatted store, rolling back transactions left by a safe
    /// journal
    pub fn startup(store: Arc<dyn BlockStore>, dynamic_top_up: usize) -> Result<Self> {
        Ok(Self {
            core: JournalCore::startup(store, dynamic_top_up, JournalMode::NonSafe)?,
        })
    }

    pub const fn recovery_report(&self) -> RecoveryReport {
        self.core.recovery
    }

    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.core.allocator
    }

    fn run(&self, operation: &mut dyn Operation) -> Result<()> {
        let context = self.core.open_context(operation)?;
        let mut service = NonSafeService::new(self.core.allocator.clone(), context);

        let mut outcome = Ok(());
        for stage in 0..operation.stage_count() {
            if let Err(e) = operation.execute(stage, &mut service) {
                outcome = Err(e);
                break;
            }
        }
        // bitmaps are brought in line with whatever was written
        let finished = service.finish();
        outcome.and(finished)
    }
}

impl Journal for NonSafeJournal {
    fn mode(&self) -> JournalMode {
        JournalMode::NonSafe
    }

    fn execute(&self, operation: &mut dyn Operation) -> Result<()> {
        self.run(operation)
            .map_err(|e| Error::operation_failed(JournalMode::NonSafe, e))
    }

    fn read_service(&self) -> &dyn ReadService {
        &self.core.reader
    }

    fn physical_location(&self, address: BlockAddress) -> String {
        self.core.allocator.store().physical_location(address)
    }

    fn free_space(&self) -> Result<u64> {
        self.core.free_space()
    }

    fn device_storage(&self) -> Arc<dyn BlockStore> {
        self.core.allocator.store().clone()
    }
}

/// Open the journal kind a configuration asks for
pub fn open_journal(store: Arc<dyn BlockStore>, config: &StorageConfig) -> Result<Box<dyn Journal>> {
    config.validate()?;
    let top_up = config.dynamic_top_up as usize;
    Ok(match config.journal_mode {
        JournalMode::Safe => Box::new(SafeJournal::startup(store, top_up)?),
        JournalMode::NonSafe => Box::new(NonSafeJournal::startup(store, top_up)?),
    })
}
