//! Store formatting

use crate::bitmap::AllocationBitmap;
use crate::layout::{DatabaseHeader, Geometry, is_journal_group};
use crate::store::BlockStore;
use strata_common::{BlockKind, Result, StorageConfig};
use tracing::{debug, info};

/// Write a fresh header, zeroed super blocks, empty group bitmaps and
/// journal sectors. Any previous content becomes unreachable.
pub fn format(
    store: &dyn BlockStore,
    name: &str,
    journal_frequency: u32,
) -> Result<DatabaseHeader> {
    let block_size = store.block_size();
    let header = DatabaseHeader::new(name, block_size, store.block_count(), journal_frequency)?;
    let geometry = Geometry::new(block_size, header.block_count)?;
    let zero = vec![0u8; block_size as usize];

    store.write(BlockKind::Header, 0, &header.encode())?;

    for address in geometry.super_block_addresses() {
        store.write(BlockKind::SuperBlock, address, &zero)?;
    }

    let mut sectors = 0u64;
    for group in 0..geometry.group_count() {
        let address = geometry.group_address(group);
        let mut bitmap = AllocationBitmap::empty(block_size);
        if is_journal_group(group, journal_frequency) {
            bitmap.set(0);
            store.write(BlockKind::JournalSector, address + 1, &zero)?;
            sectors += 1;
        }
        store.write(BlockKind::AllocationBitmap, address, bitmap.as_bytes())?;
    }
    debug!(
        groups = geometry.group_count(),
        sectors, "wrote allocation bitmaps"
    );

    store.sync()?;
    info!(
        "Formatted store '{}' ({} blocks of {} bytes, journal frequency {})",
        name,
        header.block_count,
        block_size,
        journal_frequency
    );
    Ok(header)
}

/// Format a store with the name and journal frequency of a configuration
pub fn format_with_config(store: &dyn BlockStore, config: &StorageConfig) -> Result<DatabaseHeader> {
    config.validate()?;
    if config.block_size != store.block_size() {
        return Err(strata_common::Error::Configuration(format!(
            "configured block size {} does not match store block size {}",
            config.block_size,
            store.block_size()
        )));
    }
    format(store, &config.database_name, config.journal_frequency)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_format_layout() {
        let store = MemoryStore::new(512, 9000).unwrap();
        let header = format(&store, "layout", 2).unwrap();
        assert_eq!(header.block_count, 9000);

        let geo = Geometry::new(512, 9000).unwrap();
        let decoded =
            DatabaseHeader::decode(&store.read(BlockKind::Header, 0).unwrap()).unwrap();
        assert_eq!(decoded.name, "layout");
        assert_eq!(decoded.journal_frequency, 2);

        // groups 0 and 2 carry a journal sector, group 1 does not
        for (group, journal) in [(0, true), (1, false), (2, true)] {
            let bitmap = AllocationBitmap::from_block(
                store
                    .read(BlockKind::AllocationBitmap, geo.group_address(group))
                    .unwrap(),
            );
            assert_eq!(bitmap.is_set(0), journal);
            assert_eq!(bitmap.count_used(geo.usable_offsets(group)), u64::from(journal));
        }
    }

    #[test]
    fn test_format_rejects_mismatched_config() {
        let store = MemoryStore::new(512, 9000).unwrap();
        let config = StorageConfig {
            block_size: 4096,
            ..Default::default()
        };
        assert!(format_with_config(&store, &config).is_err());

        let config = StorageConfig {
            block_size: 512,
            ..Default::default()
        };
        format_with_config(&store, &config).unwrap();
    }
}
