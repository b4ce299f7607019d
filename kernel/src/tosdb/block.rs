// SPDX-License-Identifier: MIT OR Apache-2.0

//! On-disk metadata block chains. Each metadata kind is written as a
//! page-padded block whose header points backward at the previous
//! version; readers walk the chain until the previous pointer is zero
//! or flagged invalid, so the newest definition always wins.

extern crate alloc;

use crate::error::TurnstoneError;

use alloc::vec;
use alloc::vec::Vec;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

pub const TOSDB_PAGE_SIZE: u64 = 4096;

pub const BLOCK_TYPE_TABLE: u32 = 1;
pub const BLOCK_TYPE_COLUMN_LIST: u32 = 2;
pub const BLOCK_TYPE_INDEX_LIST: u32 = 3;
pub const BLOCK_TYPE_SSTABLE_LIST: u32 = 4;
pub const BLOCK_TYPE_SSTABLE: u32 = 5;

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct BlockHeader {
    pub block_type: u32,
    reserved: u32,
    pub block_size: u64,
    pub previous_block_location: u64,
    pub previous_block_size: u64,
    pub previous_block_invalid: u8,
    padding: [u8; 7],
}

impl BlockHeader {
    pub fn new(block_type: u32, previous_location: u64, previous_size: u64) -> Self {
        Self {
            block_type,
            reserved: 0,
            block_size: 0,
            previous_block_location: previous_location,
            previous_block_size: previous_size,
            previous_block_invalid: 0,
            padding: [0; 7],
        }
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct TableBlock {
    pub header: BlockHeader,
    pub id: u64,
    pub database_id: u64,
    pub column_next_id: u64,
    pub index_next_id: u64,
    pub memtable_next_id: u64,
    pub column_list_location: u64,
    pub column_list_size: u64,
    pub index_list_location: u64,
    pub index_list_size: u64,
    pub sstable_list_location: u64,
    pub sstable_list_size: u64,
    pub name: [u8; 64],
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct ColumnListBlock {
    pub header: BlockHeader,
    pub database_id: u64,
    pub table_id: u64,
    pub column_count: u64,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct ColumnListItem {
    pub id: u64,
    pub data_type: u8,
    pub deleted: u8,
    reserved: [u8; 6],
    pub name: [u8; 64],
}

impl ColumnListItem {
    pub fn new(id: u64, data_type: u8, deleted: bool, name: &str) -> Self {
        let mut item = Self {
            id,
            data_type,
            deleted: deleted as u8,
            reserved: [0; 6],
            name: [0; 64],
        };
        let bytes = name.as_bytes();
        item.name[..bytes.len()].copy_from_slice(bytes);
        item
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|b| *b == 0).unwrap_or(64);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct IndexListBlock {
    pub header: BlockHeader,
    pub database_id: u64,
    pub table_id: u64,
    pub index_count: u64,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct IndexListItem {
    pub id: u64,
    pub column_id: u64,
    pub index_type: u8,
    pub deleted: u8,
    reserved: [u8; 6],
}

impl IndexListItem {
    pub fn new(id: u64, column_id: u64, index_type: u8, deleted: bool) -> Self {
        Self {
            id,
            column_id,
            index_type,
            deleted: deleted as u8,
            reserved: [0; 6],
        }
    }
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug)]
#[repr(C)]
pub struct SstableListBlock {
    pub header: BlockHeader,
    pub database_id: u64,
    pub table_id: u64,
    pub sstable_count: u64,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct SstableListItem {
    pub id: u64,
    pub location: u64,
    pub size: u64,
    pub record_count: u64,
}

/// Backing store for metadata and data blocks. Writes are append-only
/// and return the location the block landed at; location zero is never
/// handed out so it doubles as the null pointer of the chains.
pub trait BlockIo: core::fmt::Debug {
    fn read(&self, location: u64, size: u64) -> Result<Vec<u8>, TurnstoneError>;
    fn write(&mut self, data: &[u8]) -> Result<u64, TurnstoneError>;
}

/// Pads a serialized block to whole pages and patches the block size
/// into its header.
pub fn finalize_block(bytes: &mut Vec<u8>) {
    let padded = (bytes.len() as u64).div_ceil(TOSDB_PAGE_SIZE) * TOSDB_PAGE_SIZE;
    bytes.resize(padded as usize, 0);

    if let Ok((header, _)) = BlockHeader::mut_from_prefix(bytes.as_mut_slice()) {
        header.block_size = padded;
    }
}

/// Memory-backed block store used by tests and the early-boot ramdisk
/// path.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    storage: Vec<u8>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            // Keep location zero unused so chains can treat it as
            // "no previous block".
            storage: vec![0u8; TOSDB_PAGE_SIZE as usize],
        }
    }
}

impl BlockIo for MemoryBackend {
    fn read(&self, location: u64, size: u64) -> Result<Vec<u8>, TurnstoneError> {
        let start = location as usize;
        let end = start + size as usize;
        if location == 0 || end > self.storage.len() {
            return Err(TurnstoneError::NotFound);
        }
        Ok(Vec::from(&self.storage[start..end]))
    }

    fn write(&mut self, data: &[u8]) -> Result<u64, TurnstoneError> {
        let location = self.storage.len() as u64;
        self.storage.extend_from_slice(data);
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_pads_and_sets_size() {
        let header = BlockHeader::new(BLOCK_TYPE_TABLE, 0, 0);
        let mut bytes = Vec::from(header.as_bytes());
        bytes.extend_from_slice(&[0xAA; 100]);

        finalize_block(&mut bytes);
        assert_eq!(bytes.len() as u64, TOSDB_PAGE_SIZE);

        let (parsed, _) = BlockHeader::read_from_prefix(&bytes).unwrap();
        assert_eq!(parsed.block_size, TOSDB_PAGE_SIZE);
        assert_eq!(parsed.block_type, BLOCK_TYPE_TABLE);
    }

    #[test]
    fn test_memory_backend_roundtrip() {
        let mut backend = MemoryBackend::new();
        let header = BlockHeader::new(BLOCK_TYPE_COLUMN_LIST, 0, 0);
        let mut bytes = Vec::from(header.as_bytes());
        finalize_block(&mut bytes);

        let location = backend.write(&bytes).unwrap();
        assert_ne!(location, 0);

        let read = backend.read(location, bytes.len() as u64).unwrap();
        assert_eq!(read, bytes);

        assert!(backend.read(0, 16).is_err());
    }

    #[test]
    fn test_chain_walks_backward() {
        let mut backend = MemoryBackend::new();

        // Two versions of the same list; the second links at the
        // first.
        let header = BlockHeader::new(BLOCK_TYPE_INDEX_LIST, 0, 0);
        let mut first = Vec::from(header.as_bytes());
        finalize_block(&mut first);
        let first_loc = backend.write(&first).unwrap();

        let header = BlockHeader::new(BLOCK_TYPE_INDEX_LIST, first_loc, first.len() as u64);
        let mut second = Vec::from(header.as_bytes());
        finalize_block(&mut second);
        let second_loc = backend.write(&second).unwrap();

        let bytes = backend.read(second_loc, second.len() as u64).unwrap();
        let (parsed, _) = BlockHeader::read_from_prefix(&bytes).unwrap();
        assert_eq!(parsed.previous_block_location, first_loc);

        let bytes = backend
            .read(parsed.previous_block_location, parsed.previous_block_size)
            .unwrap();
        let (parsed, _) = BlockHeader::read_from_prefix(&bytes).unwrap();
        assert_eq!(parsed.previous_block_location, 0);
    }

    #[test]
    fn test_column_item_name_roundtrip() {
        let item = ColumnListItem::new(7, 5, false, "name");
        assert_eq!(item.name_str(), "name");
    }
}
