//! On-disk layout definitions
//!
//! Store layout (`bits = block_size * 8`):
//! ```text
//! +--------------------+  address 0
//! |  Database header   |
//! +--------------------+  address 1
//! |  Super block       |  reserved, precedes every `bits` groups
//! +--------------------+  address 2
//! |  Group 0 bitmap    |  one bit per governed block
//! |  governed blocks   |  offsets 1..=bits (bit index = offset - 1)
//! +--------------------+
//! |  Group 1 bitmap    |
//! |  ...               |
//! +--------------------+  address 1 + bits * (bits + 1) + 1
//! |  Super block       |
//! |  ...               |
//! +--------------------+
//! ```
//!
//! A group marked as a journal group keeps its first governed block
//! (offset 1) as a journal sector.

use bytes::{Buf, BufMut, BytesMut};
use strata_common::config::{MAX_NAME_LEN, is_valid_block_size};
use strata_common::{BlockAddress, Error, Result};

/// First magic number of the header
pub const HEADER_MAGIC: u64 = 0xAF76_AD63_97BC_CDF4;

/// Encoded header length, checksum included
pub const HEADER_SIZE: usize = 108;

/// Bytes reserved for the name field
pub const NAME_FIELD_SIZE: usize = 64;

/// Stream link header: next block (u64) + sequential flag (u32)
pub const LINK_HEADER_SIZE: usize = 12;

/// Tree node header: flags (u32) + entry count (u32)
pub const NODE_HEADER_SIZE: usize = 8;

/// Node flag marking a leaf
pub const NODE_FLAG_LEAF: u32 = 1;

/// Smallest block count holding a header, a super block and one group
pub const MIN_BLOCK_COUNT: u64 = 4;

/// Header stored in block 0
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseHeader {
    /// Block size in bytes
    pub block_size: u32,
    /// Number of addressable blocks
    pub block_count: u64,
    /// Address of the root object, 0 when unset
    pub root_object_address: BlockAddress,
    /// Distance between journal groups (0 = only group 0)
    pub journal_frequency: u32,
    /// Database name
    pub name: String,
}

impl DatabaseHeader {
    /// Offset of the checksum field
    const CHECKSUM_OFFSET: usize = 104;

    /// Create a header for a fresh store
    pub fn new(
        name: &str,
        block_size: u32,
        block_count: u64,
        journal_frequency: u32,
    ) -> Result<Self> {
        let header = Self {
            block_size,
            block_count,
            root_object_address: 0,
            journal_frequency,
            name: name.to_string(),
        };
        header.validate()?;
        Ok(header)
    }

    /// Serialize into a full block
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.block_size as usize);
        buf.put_u64_le(HEADER_MAGIC);
        buf.put_u64_le(!HEADER_MAGIC);
        buf.put_u32_le(self.block_size);
        buf.put_u64_le(self.block_count);
        buf.put_u64_le(self.root_object_address);
        buf.put_u32_le(self.journal_frequency);

        let mut name = [0u8; NAME_FIELD_SIZE];
        let bytes = self.name.as_bytes();
        let len = bytes.len().min(MAX_NAME_LEN);
        name[..len].copy_from_slice(&bytes[..len]);
        buf.put_slice(&name);

        let checksum = crc32c::crc32c(&buf[..Self::CHECKSUM_OFFSET]);
        buf.put_u32_le(checksum);

        buf.resize(self.block_size as usize, 0);
        buf.to_vec()
    }

    /// Parse and verify a header block
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::invalid_store("header block too small"));
        }

        let mut buf = data;
        let magic1 = buf.get_u64_le();
        let magic2 = buf.get_u64_le();
        if magic1 != HEADER_MAGIC || magic2 != !HEADER_MAGIC {
            return Err(Error::invalid_store("invalid header magic"));
        }

        let block_size = buf.get_u32_le();
        let block_count = buf.get_u64_le();
        let root_object_address = buf.get_u64_le();
        let journal_frequency = buf.get_u32_le();

        let mut name_field = [0u8; NAME_FIELD_SIZE];
        buf.copy_to_slice(&mut name_field);
        let name_len = name_field.iter().position(|&b| b == 0).unwrap_or(NAME_FIELD_SIZE);
        let name = std::str::from_utf8(&name_field[..name_len])
            .map_err(|_| Error::invalid_store("database name is not valid UTF-8"))?
            .to_string();

        let checksum = buf.get_u32_le();
        if crc32c::crc32c(&data[..Self::CHECKSUM_OFFSET]) != checksum {
            return Err(Error::invalid_store("header checksum mismatch"));
        }

        let header = Self {
            block_size,
            block_count,
            root_object_address,
            journal_frequency,
            name,
        };
        header.validate()?;
        Ok(header)
    }

    /// Validate header consistency
    pub fn validate(&self) -> Result<()> {
        if !is_valid_block_size(self.block_size) {
            return Err(Error::invalid_store(format!(
                "unsupported block size {}",
                self.block_size
            )));
        }
        if self.block_count < MIN_BLOCK_COUNT {
            return Err(Error::invalid_store(format!(
                "block count {} is below minimum {MIN_BLOCK_COUNT}",
                self.block_count
            )));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(Error::invalid_store(format!(
                "database name longer than {MAX_NAME_LEN} bytes"
            )));
        }
        Ok(())
    }
}

/// Position of an address relative to its allocation group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupSlot {
    /// Group index
    pub group: u64,
    /// 0 for the bitmap block itself, otherwise 1..=bits
    pub offset: u64,
}

/// Address arithmetic for super blocks and allocation groups
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    block_count: u64,
    bits: u64,
    group_span: u64,
    super_span: u64,
    group_count: u64,
}

impl Geometry {
    pub fn new(block_size: u32, block_count: u64) -> Result<Self> {
        if !is_valid_block_size(block_size) {
            return Err(Error::invalid_store(format!(
                "unsupported block size {block_size}"
            )));
        }
        if block_count < MIN_BLOCK_COUNT {
            return Err(Error::invalid_store(format!(
                "block count {block_count} is below minimum {MIN_BLOCK_COUNT}"
            )));
        }

        let bits = u64::from(block_size) * 8;
        let group_span = bits + 1;
        let super_span = bits * group_span + 1;

        // addresses after the header, then split into full and partial spans
        let after_header = block_count - 1;
        let full = (after_header - 1) / super_span;
        let rem = (after_header - 1) % super_span;
        let partial = if rem <= 1 {
            0
        } else {
            (rem - 1).div_ceil(group_span).min(bits)
        };

        Ok(Self {
            block_count,
            bits,
            group_span,
            super_span,
            group_count: full * bits + partial,
        })
    }

    /// Offsets governed by one bitmap
    pub const fn bits_per_group(&self) -> u64 {
        self.bits
    }

    pub const fn group_count(&self) -> u64 {
        self.group_count
    }

    pub const fn block_count(&self) -> u64 {
        self.block_count
    }

    /// Address of the bitmap block of a group
    pub const fn group_address(&self, group: u64) -> BlockAddress {
        2 + (group / self.bits) * self.super_span + (group % self.bits) * self.group_span
    }

    /// Address of a governed offset
    pub const fn address_of(&self, group: u64, offset: u64) -> BlockAddress {
        self.group_address(group) + offset
    }

    /// Group and offset of an address. The header and super blocks map to
    /// offset 0 of the group that follows them.
    pub const fn locate(&self, address: BlockAddress) -> GroupSlot {
        if address <= 1 {
            return GroupSlot {
                group: 0,
                offset: 0,
            };
        }
        let a = address - 1;
        let span = a / self.super_span;
        let within = a - span * self.super_span;
        if within == 0 {
            return GroupSlot {
                group: span * self.bits,
                offset: 0,
            };
        }
        let within = within - 1;
        let group = within / self.group_span;
        GroupSlot {
            group: span * self.bits + group,
            offset: within - group * self.group_span,
        }
    }

    /// Number of offsets of a group that lie inside the store
    pub fn usable_offsets(&self, group: u64) -> u64 {
        let address = self.group_address(group);
        if address + 1 >= self.block_count {
            return 0;
        }
        (self.block_count - address - 1).min(self.bits)
    }

    pub const fn is_super_block(&self, address: BlockAddress) -> bool {
        address >= 1 && (address - 1) % self.super_span == 0
    }

    /// Addresses of every super block inside the store
    pub fn super_block_addresses(&self) -> impl Iterator<Item = BlockAddress> + use<> {
        let span = self.super_span;
        let end = self.block_count;
        (0u64..)
            .map(move |k| 1 + k * span)
            .take_while(move |&address| address < end)
    }

    /// Whether an address is an allocatable block governed by some group
    pub fn is_governed(&self, address: BlockAddress) -> bool {
        if address >= self.block_count {
            return false;
        }
        let slot = self.locate(address);
        slot.offset != 0 && slot.group < self.group_count
    }
}

/// Whether a group carries a journal sector
pub const fn is_journal_group(group: u64, frequency: u32) -> bool {
    if frequency == 0 {
        group == 0
    } else {
        group % frequency as u64 == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = DatabaseHeader::new("catalog", 512, 10_000, 4).unwrap();
        header.root_object_address = 77;

        let bytes = header.encode();
        assert_eq!(bytes.len(), 512);
        assert_eq!(&bytes[0..8], &HEADER_MAGIC.to_le_bytes());

        let decoded = DatabaseHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_detects_damage() {
        let header = DatabaseHeader::new("catalog", 512, 10_000, 4).unwrap();

        let mut bytes = header.encode();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            DatabaseHeader::decode(&bytes),
            Err(Error::InvalidStore(_))
        ));

        let mut bytes = header.encode();
        bytes[45] ^= 0x01;
        assert!(matches!(
            DatabaseHeader::decode(&bytes),
            Err(Error::InvalidStore(_))
        ));

        assert!(DatabaseHeader::decode(&vec![0u8; 512]).is_err());
    }

    #[test]
    fn test_group_addresses() {
        let geo = Geometry::new(512, 1 << 26).unwrap();
        let bits = geo.bits_per_group();
        assert_eq!(bits, 4096);

        assert_eq!(geo.group_address(0), 2);
        assert_eq!(geo.group_address(1), 2 + bits + 1);
        // the second span starts with a super block
        let second_super = 1 + bits * (bits + 1) + 1;
        assert!(geo.is_super_block(second_super));
        assert_eq!(geo.group_address(bits), second_super + 1);
    }

    #[test]
    fn test_locate_inverts_group_address() {
        let geo = Geometry::new(512, 1 << 26).unwrap();
        for group in [0, 1, 7, 4095, 4096, 4097, 10_000] {
            for offset in [0, 1, 2, 4096] {
                let address = geo.address_of(group, offset);
                assert_eq!(geo.locate(address), GroupSlot { group, offset });
            }
        }
    }

    #[test]
    fn test_locate_reserved_addresses() {
        let geo = Geometry::new(512, 1 << 26).unwrap();
        assert_eq!(geo.locate(0), GroupSlot { group: 0, offset: 0 });
        assert_eq!(geo.locate(1), GroupSlot { group: 0, offset: 0 });

        let second_super = 1 + 4096 * 4097 + 1;
        assert_eq!(
            geo.locate(second_super),
            GroupSlot {
                group: 4096,
                offset: 0
            }
        );
        assert!(!geo.is_governed(second_super));
        assert!(!geo.is_governed(2));
        assert!(geo.is_governed(3));
    }

    #[test]
    fn test_group_count() {
        // header, super block, bitmap, one governed block
        assert_eq!(Geometry::new(512, 4).unwrap().group_count(), 1);
        assert!(Geometry::new(512, 3).is_err());

        let geo = Geometry::new(512, 9000).unwrap();
        assert_eq!(geo.group_count(), 3);
        assert_eq!(geo.usable_offsets(0), 4096);
        assert_eq!(geo.usable_offsets(2), 9000 - geo.group_address(2) - 1);
        assert!(!geo.is_governed(9000));

        // exactly one full span
        let span = 4096 * 4097 + 1;
        assert_eq!(Geometry::new(512, span + 1).unwrap().group_count(), 4096);
        // a trailing bitmap with nothing to govern is not a group
        assert_eq!(Geometry::new(512, span + 3).unwrap().group_count(), 4096);
        assert_eq!(Geometry::new(512, span + 4).unwrap().group_count(), 4097);
    }

    #[test]
    fn test_super_blocks() {
        let geo = Geometry::new(512, 4096 * 4097 * 2 + 10).unwrap();
        let supers: Vec<_> = geo.super_block_addresses().collect();
        assert_eq!(supers, vec![1, 1 + 4096 * 4097 + 1, 1 + 2 * (4096 * 4097 + 1)]);
    }

    #[test]
    fn test_journal_groups() {
        assert!(is_journal_group(0, 0));
        assert!(!is_journal_group(3, 0));
        assert!(is_journal_group(8, 4));
        assert!(!is_journal_group(9, 4));
    }
}
