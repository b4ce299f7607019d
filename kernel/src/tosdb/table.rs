// SPDX-License-Identifier: MIT OR Apache-2.0

//! Table lifecycle: open from the persisted metadata chains, mutate
//! through memtables, persist dirty sub-structures on close. Every
//! new metadata block links backward at the previous version, so a
//! reader can always reach the full history while the newest
//! definition wins.

extern crate alloc;

use super::block::{
    finalize_block, BlockHeader, ColumnListBlock, ColumnListItem, IndexListBlock, IndexListItem,
    SstableListBlock, SstableListItem, TableBlock, BLOCK_TYPE_COLUMN_LIST, BLOCK_TYPE_INDEX_LIST,
    BLOCK_TYPE_SSTABLE, BLOCK_TYPE_SSTABLE_LIST, BLOCK_TYPE_TABLE,
};
use super::memtable::{MemKey, Memtable, SstableData, StoredRecord};
use super::{BackendRef, DataType, TosdbError, TOSDB_NAME_MAX_LEN};
use crate::error::TurnstoneError;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;

use zerocopy::{FromBytes, IntoBytes};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexType {
    Primary = 0,
    Unique = 1,
    Secondary = 2,
}

impl IndexType {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Primary,
            1 => Self::Unique,
            _ => Self::Secondary,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Column {
    pub id: u64,
    pub name: String,
    pub data_type: DataType,
    pub is_deleted: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct Index {
    pub id: u64,
    pub column_id: u64,
    pub index_type: IndexType,
    pub is_deleted: bool,
}

#[derive(Debug)]
pub struct Table {
    pub id: u64,
    pub database_id: u64,
    pub name: String,
    backend: BackendRef,

    pub columns: BTreeMap<String, Column>,
    column_new: Vec<Column>,
    pub indexes: BTreeMap<u64, Index>,
    index_new: Vec<Index>,

    pub column_next_id: u64,
    pub index_next_id: u64,
    pub memtable_next_id: u64,

    memtables: Vec<Memtable>,
    sstable_list_items: Vec<SstableListItem>,

    pub metadata_location: u64,
    pub metadata_size: u64,
    column_list_location: u64,
    column_list_size: u64,
    index_list_location: u64,
    index_list_size: u64,
    sstable_list_location: u64,
    sstable_list_size: u64,

    pub is_open: bool,
    pub is_dirty: bool,
    pub is_deleted: bool,
}

impl Table {
    pub fn create(id: u64, database_id: u64, name: &str, backend: BackendRef) -> Self {
        log::debug!("new table {} created", name);
        Self {
            id,
            database_id,
            name: String::from(name),
            backend,
            columns: BTreeMap::new(),
            column_new: Vec::new(),
            indexes: BTreeMap::new(),
            index_new: Vec::new(),
            column_next_id: 1,
            index_next_id: 1,
            memtable_next_id: 1,
            memtables: Vec::new(),
            sstable_list_items: Vec::new(),
            metadata_location: 0,
            metadata_size: 0,
            column_list_location: 0,
            column_list_size: 0,
            index_list_location: 0,
            index_list_size: 0,
            sstable_list_location: 0,
            sstable_list_size: 0,
            is_open: true,
            is_dirty: true,
            is_deleted: false,
        }
    }

    pub fn column_add(&mut self, name: &str, data_type: DataType) -> Result<(), TosdbError> {
        if name.is_empty() || name.len() > TOSDB_NAME_MAX_LEN {
            log::error!("col name size error");
            return Err(TosdbError::NameTooLong);
        }

        if self.columns.contains_key(name) {
            log::error!("column {} exists for table {}", name, self.name);
            return Err(TosdbError::ColumnExists);
        }

        let column = Column {
            id: self.column_next_id,
            name: String::from(name),
            data_type,
            is_deleted: false,
        };
        self.column_next_id += 1;

        self.columns.insert(column.name.clone(), column.clone());
        self.column_new.push(column);
        self.is_dirty = true;

        log::debug!("col {} is added to table {}", name, self.name);

        Ok(())
    }

    pub fn index_create(&mut self, column_name: &str, index_type: IndexType) -> Result<(), TosdbError> {
        let column = self
            .columns
            .get(column_name)
            .ok_or(TosdbError::ColumnNotFound)?;

        let index = Index {
            id: self.index_next_id,
            column_id: column.id,
            index_type,
            is_deleted: false,
        };
        self.index_next_id += 1;

        self.indexes.insert(index.id, index);
        self.index_new.push(index);
        self.is_dirty = true;

        log::debug!(
            "index {} for column {} is added to table {}",
            index.id,
            column_name,
            self.name
        );

        Ok(())
    }

    pub fn index_for_column(&self, column_id: u64) -> Option<u64> {
        self.indexes
            .values()
            .find(|idx| idx.column_id == column_id && !idx.is_deleted)
            .map(|idx| idx.id)
    }

    pub fn primary_index(&self) -> Option<Index> {
        self.indexes
            .values()
            .find(|idx| idx.index_type == IndexType::Primary && !idx.is_deleted)
            .copied()
    }

    /// Primary column id and type, resolved through the primary index.
    pub fn primary_column(&self) -> Option<(u64, DataType)> {
        let index = self.primary_index()?;
        self.columns
            .values()
            .find(|col| col.id == index.column_id)
            .map(|col| (col.id, col.data_type))
    }

    pub fn column_by_name(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    // ---- write path ----

    pub fn memtable_upsert(
        &mut self,
        primary: MemKey,
        secondaries: &[(u64, MemKey)],
        serialized: Vec<u8>,
        deleted: bool,
    ) -> Result<(), TosdbError> {
        if !self.is_open {
            return Err(TosdbError::TableClosed);
        }

        if self.memtables.is_empty() {
            self.memtables.push(Memtable::new(self.memtable_next_id));
            self.memtable_next_id += 1;
        }

        let memtable = self.memtables.last_mut().unwrap();
        memtable.upsert(primary, secondaries, serialized, deleted);
        self.is_dirty = true;

        Ok(())
    }

    // ---- read path ----

    fn sstable_payload(&self, item: &SstableListItem) -> Result<Vec<u8>, TurnstoneError> {
        let bytes = self.backend.lock().read(item.location, item.size)?;
        let header_len = core::mem::size_of::<BlockHeader>();
        if bytes.len() < header_len {
            return Err(TurnstoneError::CorruptData);
        }
        Ok(Vec::from(&bytes[header_len..]))
    }

    fn sstables_newest_first(&self) -> Vec<SstableListItem> {
        let mut items = self.sstable_list_items.clone();
        items.sort_by_key(|item| core::cmp::Reverse(item.id));
        items
    }

    pub fn point_get(&self, primary: &MemKey) -> Result<Option<StoredRecord>, TurnstoneError> {
        for memtable in self.memtables.iter().rev() {
            if let Some(record) = memtable.get(primary) {
                return Ok(Some(record.clone()));
            }
        }

        for item in self.sstables_newest_first() {
            let payload = self.sstable_payload(&item)?;
            if let Some(record) = SstableData::new(&payload).get(primary) {
                return Ok(Some(record));
            }
        }

        Ok(None)
    }

    /// Index search across the memtables and the sstable layer;
    /// results de-duplicate through the sorted set.
    pub fn search_keys(
        &self,
        index_id: u64,
        key: &MemKey,
        results: &mut BTreeSet<MemKey>,
    ) -> Result<(), TurnstoneError> {
        for memtable in self.memtables.iter() {
            memtable.search(index_id, key, results);
        }

        for item in self.sstables_newest_first() {
            let payload = self.sstable_payload(&item)?;
            SstableData::new(&payload).search(index_id, key, results);
        }

        Ok(())
    }

    // ---- persistence ----

    fn column_persist(&mut self) -> Result<(), TurnstoneError> {
        let block = ColumnListBlock {
            header: BlockHeader::new(
                BLOCK_TYPE_COLUMN_LIST,
                self.column_list_location,
                self.column_list_size,
            ),
            database_id: self.database_id,
            table_id: self.id,
            column_count: self.column_new.len() as u64,
        };

        let mut bytes = Vec::from(block.as_bytes());
        for column in self.column_new.drain(..) {
            let item = ColumnListItem::new(
                column.id,
                column.data_type as u8,
                column.is_deleted,
                &column.name,
            );
            bytes.extend_from_slice(item.as_bytes());
        }
        finalize_block(&mut bytes);

        let location = self.backend.lock().write(&bytes)?;
        self.column_list_location = location;
        self.column_list_size = bytes.len() as u64;

        Ok(())
    }

    fn index_persist(&mut self) -> Result<(), TurnstoneError> {
        let block = IndexListBlock {
            header: BlockHeader::new(
                BLOCK_TYPE_INDEX_LIST,
                self.index_list_location,
                self.index_list_size,
            ),
            database_id: self.database_id,
            table_id: self.id,
            index_count: self.index_new.len() as u64,
        };

        let mut bytes = Vec::from(block.as_bytes());
        for index in self.index_new.drain(..) {
            let item = IndexListItem::new(
                index.id,
                index.column_id,
                index.index_type as u8,
                index.is_deleted,
            );
            bytes.extend_from_slice(item.as_bytes());
        }
        finalize_block(&mut bytes);

        let location = self.backend.lock().write(&bytes)?;
        self.index_list_location = location;
        self.index_list_size = bytes.len() as u64;

        Ok(())
    }

    fn memtable_persist(&mut self) -> Result<(), TurnstoneError> {
        for memtable in core::mem::take(&mut self.memtables) {
            if memtable.is_empty() {
                continue;
            }

            let payload = memtable.serialize();
            let header = BlockHeader::new(BLOCK_TYPE_SSTABLE, 0, 0);
            let mut bytes = Vec::from(header.as_bytes());
            bytes.extend_from_slice(&payload);
            finalize_block(&mut bytes);

            let location = self.backend.lock().write(&bytes)?;
            self.sstable_list_items.push(SstableListItem {
                id: memtable.id,
                location,
                size: bytes.len() as u64,
                record_count: memtable.len() as u64,
            });
        }

        if self.sstable_list_items.is_empty() {
            return Ok(());
        }

        let block = SstableListBlock {
            header: BlockHeader::new(
                BLOCK_TYPE_SSTABLE_LIST,
                self.sstable_list_location,
                self.sstable_list_size,
            ),
            database_id: self.database_id,
            table_id: self.id,
            sstable_count: self.sstable_list_items.len() as u64,
        };

        let mut bytes = Vec::from(block.as_bytes());
        for item in self.sstable_list_items.iter() {
            bytes.extend_from_slice(item.as_bytes());
        }
        finalize_block(&mut bytes);

        let location = self.backend.lock().write(&bytes)?;
        self.sstable_list_location = location;
        self.sstable_list_size = bytes.len() as u64;

        log::debug!(
            "sstable list for table {} persisted at {:#x}({:#x})",
            self.name,
            location,
            self.sstable_list_size
        );

        Ok(())
    }

    pub fn persist(&mut self) -> Result<(), TurnstoneError> {
        if !self.is_dirty {
            return Ok(());
        }
        if !self.is_open {
            log::error!("table is closed");
            return Err(TurnstoneError::Tosdb(TosdbError::TableClosed));
        }

        if !self.column_new.is_empty() {
            self.column_persist()?;
        }

        if !self.index_new.is_empty() {
            self.index_persist()?;
        }

        if !self.memtables.is_empty() {
            self.memtable_persist()?;
        }

        let mut block = TableBlock {
            header: BlockHeader::new(BLOCK_TYPE_TABLE, self.metadata_location, self.metadata_size),
            id: self.id,
            database_id: self.database_id,
            column_next_id: self.column_next_id,
            index_next_id: self.index_next_id,
            memtable_next_id: self.memtable_next_id,
            column_list_location: self.column_list_location,
            column_list_size: self.column_list_size,
            index_list_location: self.index_list_location,
            index_list_size: self.index_list_size,
            sstable_list_location: self.sstable_list_location,
            sstable_list_size: self.sstable_list_size,
            name: [0; 64],
        };
        // Table blocks carry their whole state; the chain behind them
        // never needs walking.
        block.header.previous_block_invalid = 1;
        let name_bytes = self.name.as_bytes();
        block.name[..name_bytes.len()].copy_from_slice(name_bytes);

        let mut bytes = Vec::from(block.as_bytes());
        finalize_block(&mut bytes);

        let location = self.backend.lock().write(&bytes)?;
        self.metadata_location = location;
        self.metadata_size = bytes.len() as u64;

        log::debug!(
            "table {} is persisted at loc {:#x} size {:#x}",
            self.name,
            location,
            self.metadata_size
        );

        self.is_dirty = false;

        Ok(())
    }

    // ---- load path ----

    fn load_columns(&mut self) -> Result<(), TosdbError> {
        self.columns = BTreeMap::new();

        let mut location = self.column_list_location;
        let mut size = self.column_list_size;

        while location != 0 {
            let bytes = self
                .backend
                .lock()
                .read(location, size)
                .map_err(|_| TosdbError::TableClosed)?;

            let (block, rest) =
                ColumnListBlock::read_from_prefix(&bytes).map_err(|_| TosdbError::TableClosed)?;

            let mut rest = rest;
            for _ in 0..block.column_count {
                let (item, remaining) =
                    ColumnListItem::read_from_prefix(rest).map_err(|_| TosdbError::TableClosed)?;
                rest = remaining;

                let name = String::from(item.name_str());
                if self.columns.contains_key(&name) {
                    continue;
                }

                let Some(data_type) = DataType::from_u8(item.data_type) else {
                    continue;
                };

                self.columns.insert(
                    name.clone(),
                    Column {
                        id: item.id,
                        name,
                        data_type,
                        is_deleted: item.deleted != 0,
                    },
                );
            }

            if block.header.previous_block_invalid != 0 {
                break;
            }
            location = block.header.previous_block_location;
            size = block.header.previous_block_size;
        }

        Ok(())
    }

    fn load_indexes(&mut self) -> Result<(), TosdbError> {
        self.indexes = BTreeMap::new();

        let mut location = self.index_list_location;
        let mut size = self.index_list_size;

        while location != 0 {
            let bytes = self
                .backend
                .lock()
                .read(location, size)
                .map_err(|_| TosdbError::TableClosed)?;

            let (block, rest) =
                IndexListBlock::read_from_prefix(&bytes).map_err(|_| TosdbError::TableClosed)?;

            let mut rest = rest;
            for _ in 0..block.index_count {
                let (item, remaining) =
                    IndexListItem::read_from_prefix(rest).map_err(|_| TosdbError::TableClosed)?;
                rest = remaining;

                if self.indexes.contains_key(&item.id) {
                    continue;
                }

                self.indexes.insert(
                    item.id,
                    Index {
                        id: item.id,
                        column_id: item.column_id,
                        index_type: IndexType::from_u8(item.index_type),
                        is_deleted: item.deleted != 0,
                    },
                );
            }

            if block.header.previous_block_invalid != 0 {
                break;
            }
            location = block.header.previous_block_location;
            size = block.header.previous_block_size;
        }

        Ok(())
    }

    fn load_sstables(&mut self) -> Result<(), TosdbError> {
        self.sstable_list_items = Vec::new();

        if self.sstable_list_location == 0 {
            log::debug!("no sstable for table {}", self.name);
            return Ok(());
        }

        let mut seen = BTreeSet::new();
        let mut location = self.sstable_list_location;
        let mut size = self.sstable_list_size;

        while location != 0 {
            let bytes = self
                .backend
                .lock()
                .read(location, size)
                .map_err(|_| TosdbError::TableClosed)?;

            let (block, rest) =
                SstableListBlock::read_from_prefix(&bytes).map_err(|_| TosdbError::TableClosed)?;

            let mut rest = rest;
            for _ in 0..block.sstable_count {
                let (item, remaining) =
                    SstableListItem::read_from_prefix(rest).map_err(|_| TosdbError::TableClosed)?;
                rest = remaining;

                if seen.insert(item.id) {
                    self.sstable_list_items.push(item);
                }
            }

            if block.header.previous_block_invalid != 0 {
                break;
            }
            location = block.header.previous_block_location;
            size = block.header.previous_block_size;
        }

        Ok(())
    }

    /// Loads the table from its persisted metadata. The sstable data
    /// blocks themselves stay on disk until a read touches them.
    pub fn load(&mut self) -> Result<(), TosdbError> {
        if self.is_deleted {
            log::warn!("table {} is deleted", self.name);
            return Err(TosdbError::TableDeleted);
        }
        if self.is_open {
            return Ok(());
        }
        if self.metadata_location == 0 || self.metadata_size == 0 {
            log::error!("metadata not found for {}", self.name);
            return Err(TosdbError::TableClosed);
        }

        let bytes = self
            .backend
            .lock()
            .read(self.metadata_location, self.metadata_size)
            .map_err(|_| TosdbError::TableClosed)?;
        let (block, _) =
            TableBlock::read_from_prefix(&bytes).map_err(|_| TosdbError::TableClosed)?;

        self.column_list_location = block.column_list_location;
        self.column_list_size = block.column_list_size;
        self.column_next_id = block.column_next_id;
        self.load_columns()?;

        self.index_list_location = block.index_list_location;
        self.index_list_size = block.index_list_size;
        self.index_next_id = block.index_next_id;
        self.load_indexes()?;

        self.memtable_next_id = block.memtable_next_id;
        self.sstable_list_location = block.sstable_list_location;
        self.sstable_list_size = block.sstable_list_size;
        self.load_sstables()?;

        self.is_open = true;

        log::debug!("table {} loaded", self.name);

        Ok(())
    }

    /// Persists everything dirty, then drops the in-memory state.
    pub fn close(&mut self) -> Result<(), TurnstoneError> {
        if !self.is_open {
            return Ok(());
        }

        log::debug!("table {} will be closed", self.name);

        if self.is_dirty {
            self.persist()?;
        }

        self.columns.clear();
        self.indexes.clear();
        self.memtables.clear();
        self.sstable_list_items.clear();
        self.is_open = false;

        log::debug!("table {} is closed", self.name);

        Ok(())
    }

    /// Releases every in-memory structure whether the table is open or
    /// not; nothing is persisted.
    pub fn free(&mut self) {
        self.columns.clear();
        self.column_new.clear();
        self.indexes.clear();
        self.index_new.clear();
        self.memtables.clear();
        self.sstable_list_items.clear();
        self.is_open = false;
        log::debug!("table freed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::SpinLock;
    use crate::tosdb::block::MemoryBackend;
    use alloc::boxed::Box;
    use alloc::sync::Arc;

    fn backend() -> BackendRef {
        Arc::new(SpinLock::new(
            Box::new(MemoryBackend::new()) as Box<dyn super::super::block::BlockIo + Send>
        ))
    }

    fn sample_table(backend: BackendRef) -> Table {
        let mut table = Table::create(1, 1, "modules", backend);
        table.column_add("id", DataType::Int64).unwrap();
        table.column_add("name", DataType::String).unwrap();
        table.index_create("id", IndexType::Primary).unwrap();
        table.index_create("name", IndexType::Secondary).unwrap();
        table
    }

    #[test]
    fn test_column_and_index_ids_advance() {
        let mut table = sample_table(backend());
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.column_next_id, 3);
        assert_eq!(table.index_next_id, 3);

        let primary = table.primary_index().unwrap();
        assert_eq!(primary.column_id, table.columns["id"].id);
        assert_eq!(table.primary_column(), Some((1, DataType::Int64)));
        assert_eq!(table.index_for_column(2), Some(2));

        table.column_add("extra", DataType::Int32).unwrap();
        assert_eq!(table.column_next_id, 4);
    }

    #[test]
    fn test_close_then_load_restores_metadata() {
        let backend = backend();
        let mut table = sample_table(backend);

        table.close().unwrap();
        assert!(!table.is_open);
        assert_ne!(table.metadata_location, 0);
        let first_location = table.metadata_location;
        let first_size = table.metadata_size;

        table.load().unwrap();
        assert!(table.is_open);
        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.columns["name"].data_type, DataType::String);
        assert_eq!(table.indexes.len(), 2);
        assert_eq!(table.primary_column(), Some((1, DataType::Int64)));

        // Clean close of a non-dirty table writes nothing new.
        table.close().unwrap();
        assert_eq!(table.metadata_location, first_location);
        assert_eq!(table.metadata_size, first_size);
    }

    #[test]
    fn test_reopened_metadata_is_byte_identical() {
        let backend = backend();
        let mut table = sample_table(backend.clone());

        table.close().unwrap();
        let bytes_before = backend
            .lock()
            .read(table.metadata_location, table.metadata_size)
            .unwrap();

        table.load().unwrap();
        table.close().unwrap();

        let bytes_after = backend
            .lock()
            .read(table.metadata_location, table.metadata_size)
            .unwrap();
        assert_eq!(bytes_before, bytes_after);
    }

    #[test]
    fn test_column_chain_newest_wins() {
        let backend = backend();
        let mut table = sample_table(backend);

        table.close().unwrap();
        table.load().unwrap();

        table.column_add("late", DataType::Int8).unwrap();
        table.close().unwrap();
        table.load().unwrap();

        // Both generations of the column list are reachable.
        assert_eq!(table.columns.len(), 3);
        assert!(table.columns.contains_key("late"));
        assert!(table.columns.contains_key("name"));
    }

    #[test]
    fn test_memtable_persists_to_sstable_on_close() {
        let backend = backend();
        let mut table = sample_table(backend);

        let primary: MemKey = (42, Vec::new());
        table
            .memtable_upsert(primary.clone(), &[], Vec::from(&b"payload"[..]), false)
            .unwrap();

        // Visible from the memtable.
        let got = table.point_get(&primary).unwrap().unwrap();
        assert_eq!(got.serialized, b"payload");

        table.close().unwrap();
        table.load().unwrap();

        // Visible from the sstable layer after reopen.
        let got = table.point_get(&primary).unwrap().unwrap();
        assert_eq!(got.serialized, b"payload");
    }

    #[test]
    fn test_search_keys_merges_layers() {
        let backend = backend();
        let mut table = sample_table(backend);

        let primary_a: MemKey = (1, Vec::new());
        let sec_a: MemKey = (0x1111, Vec::from(&b"alice"[..]));
        table
            .memtable_upsert(primary_a.clone(), &[(2, sec_a.clone())], Vec::new(), false)
            .unwrap();

        table.close().unwrap();
        table.load().unwrap();

        let primary_b: MemKey = (2, Vec::new());
        table
            .memtable_upsert(primary_b.clone(), &[(2, sec_a.clone())], Vec::new(), false)
            .unwrap();

        let mut results = BTreeSet::new();
        table.search_keys(2, &sec_a, &mut results).unwrap();
        assert!(results.contains(&primary_a));
        assert!(results.contains(&primary_b));
        assert_eq!(results.len(), 2);
    }
}
