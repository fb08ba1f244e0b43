//! Test helpers: formatted stores, fault injection and scripted operations

use crate::format::format;
use crate::operation::{Operation, Prepared, ReadService, Service};
use crate::store::{BlockStore, MemoryStore};
use parking_lot::Mutex;
use std::sync::Arc;
use strata_common::{BlockAddress, BlockKind, Error, Result};

/// Block size used by test stores
pub const TEST_BLOCK_SIZE: u32 = 512;

/// A formatted in-memory store
pub fn formatted_store(block_count: u64, journal_frequency: u32) -> Arc<dyn BlockStore> {
    let store = MemoryStore::new(TEST_BLOCK_SIZE, block_count).unwrap();
    format(&store, "test", journal_frequency).unwrap();
    Arc::new(store)
}

/// Which write should fail
#[derive(Clone, Copy, Debug)]
pub struct FaultRule {
    kind: Option<BlockKind>,
    address: Option<BlockAddress>,
    /// Matching writes let through before the failing one
    skip: usize,
    /// Fail only the matching write instead of every write after it
    once: bool,
}

impl FaultRule {
    pub const fn kind(kind: BlockKind, skip: usize) -> Self {
        Self {
            kind: Some(kind),
            address: None,
            skip,
            once: false,
        }
    }

    pub const fn at(address: BlockAddress, skip: usize) -> Self {
        Self {
            kind: None,
            address: Some(address),
            skip,
            once: false,
        }
    }

    /// A transient fault: the store keeps working afterwards
    pub const fn once(mut self) -> Self {
        self.once = true;
        self
    }

    fn matches(&self, kind: BlockKind, address: BlockAddress) -> bool {
        self.kind.is_none_or(|k| k == kind) && self.address.is_none_or(|a| a == address)
    }
}

/// Memory store that fails one armed write and, unless the rule is
/// transient, every write after it like a device that went away
pub struct FaultyStore {
    inner: MemoryStore,
    rule: Mutex<Option<FaultRule>>,
    tripped: Mutex<bool>,
}

impl FaultyStore {
    pub fn formatted(block_count: u64, journal_frequency: u32) -> Self {
        let inner = MemoryStore::new(TEST_BLOCK_SIZE, block_count).unwrap();
        format(&inner, "faulty", journal_frequency).unwrap();
        Self {
            inner,
            rule: Mutex::new(None),
            tripped: Mutex::new(false),
        }
    }

    pub fn arm(&self, rule: FaultRule) {
        *self.rule.lock() = Some(rule);
        *self.tripped.lock() = false;
    }

    pub fn heal(&self) {
        *self.rule.lock() = None;
        *self.tripped.lock() = false;
    }
}

impl BlockStore for FaultyStore {
    fn block_size(&self) -> u32 {
        self.inner.block_size()
    }

    fn block_count(&self) -> u64 {
        self.inner.block_count()
    }

    fn read(&self, kind: BlockKind, address: BlockAddress) -> Result<Vec<u8>> {
        self.inner.read(kind, address)
    }

    fn write(&self, kind: BlockKind, address: BlockAddress, data: &[u8]) -> Result<()> {
        let mut tripped = self.tripped.lock();
        if !*tripped {
            let mut armed = self.rule.lock();
            if let Some(rule) = armed.as_mut()
                && rule.matches(kind, address)
            {
                if rule.skip > 0 {
                    rule.skip -= 1;
                } else if rule.once {
                    *armed = None;
                    return Err(Error::storage(format!(
                        "injected transient failure at {address} ({kind:?})"
                    )));
                } else {
                    *tripped = true;
                }
            }
        }
        if *tripped {
            return Err(Error::storage(format!(
                "injected write failure at {address} ({kind:?})"
            )));
        }
        self.inner.write(kind, address, data)
    }

    fn sync(&self) -> Result<()> {
        if *self.tripped.lock() {
            return Err(Error::storage("injected sync failure"));
        }
        self.inner.sync()
    }

    fn physical_location(&self, address: BlockAddress) -> String {
        self.inner.physical_location(address)
    }
}

type Stage = Box<dyn FnMut(&mut dyn Service) -> Result<()>>;

/// Operation built from closures, one per stage
pub struct ScriptedOperation {
    prepared: Prepared,
    stages: Vec<Stage>,
}

impl ScriptedOperation {
    pub fn new(prepared: Prepared) -> Self {
        Self {
            prepared,
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, f: impl FnMut(&mut dyn Service) -> Result<()> + 'static) -> Self {
        self.stages.push(Box::new(f));
        self
    }
}

impl Operation for ScriptedOperation {
    fn prepare(&mut self, _reader: &dyn ReadService) -> Result<Prepared> {
        Ok(self.prepared)
    }

    fn stage_count(&self) -> usize {
        self.stages.len()
    }

    fn execute(&mut self, stage: usize, service: &mut dyn Service) -> Result<()> {
        (self.stages[stage])(service)
    }
}
