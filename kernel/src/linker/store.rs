// SPDX-License-Identifier: MIT OR Apache-2.0

//! Record-read surface the linker consumes: the `sections`, `modules`,
//! `symbols`, and `relocations` system tables, reached through the
//! TOSDB record interface.

extern crate alloc;

use super::{ModuleRecord, RelocationKind, RelocationRecord, SectionRecord, SymbolRecord};
use crate::error::TurnstoneError;
use crate::tosdb::record::{create_record, Record};
use crate::tosdb::table::IndexType;
use crate::tosdb::{DataType, Database, TableRef};

use alloc::vec::Vec;

/// Read access to the linker inputs. The linker itself never touches
/// storage directly; everything arrives through this trait.
pub trait ModuleStore {
    fn symbol_by_name(&mut self, name: &str) -> Result<SymbolRecord, TurnstoneError>;
    fn symbol_by_id(&mut self, id: u64) -> Result<SymbolRecord, TurnstoneError>;
    fn section_by_id(&mut self, id: u64) -> Result<SectionRecord, TurnstoneError>;
    fn sections_of_module(&mut self, module_id: u64) -> Result<Vec<SectionRecord>, TurnstoneError>;
    fn relocations_of_section(
        &mut self,
        section_id: u64,
    ) -> Result<Vec<RelocationRecord>, TurnstoneError>;
    fn module_by_id(&mut self, id: u64) -> Result<ModuleRecord, TurnstoneError>;
}

/// The four system tables inside the `system` database.
#[derive(Debug)]
pub struct TosdbModuleStore {
    sections: TableRef,
    modules: TableRef,
    symbols: TableRef,
    relocations: TableRef,
}

fn ensure_sections_table(db: &mut Database) -> Result<TableRef, TurnstoneError> {
    let table = db.table_create_or_open("sections")?;
    {
        let mut guard = table.lock();
        if guard.columns.is_empty() {
            guard.column_add("id", DataType::Int64)?;
            guard.column_add("module_id", DataType::Int64)?;
            guard.column_add("name", DataType::String)?;
            guard.column_add("size", DataType::Int64)?;
            guard.column_add("alignment", DataType::Int64)?;
            guard.column_add("data", DataType::ByteArray)?;
            guard.index_create("id", IndexType::Primary)?;
            guard.index_create("module_id", IndexType::Secondary)?;
        }
    }
    Ok(table)
}

fn ensure_modules_table(db: &mut Database) -> Result<TableRef, TurnstoneError> {
    let table = db.table_create_or_open("modules")?;
    {
        let mut guard = table.lock();
        if guard.columns.is_empty() {
            guard.column_add("id", DataType::Int64)?;
            guard.column_add("name", DataType::String)?;
            guard.index_create("id", IndexType::Primary)?;
            guard.index_create("name", IndexType::Secondary)?;
        }
    }
    Ok(table)
}

fn ensure_symbols_table(db: &mut Database) -> Result<TableRef, TurnstoneError> {
    let table = db.table_create_or_open("symbols")?;
    {
        let mut guard = table.lock();
        if guard.columns.is_empty() {
            guard.column_add("id", DataType::Int64)?;
            guard.column_add("section_id", DataType::Int64)?;
            guard.column_add("name", DataType::String)?;
            guard.column_add("value", DataType::Int64)?;
            guard.column_add("size", DataType::Int64)?;
            guard.index_create("id", IndexType::Primary)?;
            guard.index_create("name", IndexType::Secondary)?;
        }
    }
    Ok(table)
}

fn ensure_relocations_table(db: &mut Database) -> Result<TableRef, TurnstoneError> {
    let table = db.table_create_or_open("relocations")?;
    {
        let mut guard = table.lock();
        if guard.columns.is_empty() {
            guard.column_add("id", DataType::Int64)?;
            guard.column_add("section_id", DataType::Int64)?;
            guard.column_add("symbol_id", DataType::Int64)?;
            guard.column_add("offset", DataType::Int64)?;
            guard.column_add("addend", DataType::Int64)?;
            guard.column_add("reloc_type", DataType::Int8)?;
            guard.index_create("id", IndexType::Primary)?;
            guard.index_create("section_id", IndexType::Secondary)?;
        }
    }
    Ok(table)
}

impl TosdbModuleStore {
    /// Opens (or lays out) the system tables.
    pub fn open(db: &mut Database) -> Result<Self, TurnstoneError> {
        Ok(Self {
            sections: ensure_sections_table(db)?,
            modules: ensure_modules_table(db)?,
            symbols: ensure_symbols_table(db)?,
            relocations: ensure_relocations_table(db)?,
        })
    }

    pub fn sections_table(&self) -> &TableRef {
        &self.sections
    }

    pub fn modules_table(&self) -> &TableRef {
        &self.modules
    }

    pub fn symbols_table(&self) -> &TableRef {
        &self.symbols
    }

    pub fn relocations_table(&self) -> &TableRef {
        &self.relocations
    }

    fn symbol_from_record(record: &Record) -> Result<SymbolRecord, TurnstoneError> {
        Ok(SymbolRecord {
            id: record.get_int64("id")? as u64,
            section_id: record.get_int64("section_id")? as u64,
            name: record.get_string("name")?,
            value: record.get_int64("value")? as u64,
            size: record.get_int64("size")? as u64,
        })
    }

    fn section_from_record(record: &Record) -> Result<SectionRecord, TurnstoneError> {
        Ok(SectionRecord {
            id: record.get_int64("id")? as u64,
            module_id: record.get_int64("module_id")? as u64,
            name: record.get_string("name")?,
            size: record.get_int64("size")? as u64,
            alignment: record.get_int64("alignment")? as u64,
            data: record.get_bytearray("data")?,
        })
    }

    fn relocation_from_record(record: &Record) -> Result<RelocationRecord, TurnstoneError> {
        let kind = RelocationKind::from_u8(record.get_int8("reloc_type")? as u8)
            .ok_or(TurnstoneError::CorruptData)?;
        Ok(RelocationRecord {
            id: record.get_int64("id")? as u64,
            section_id: record.get_int64("section_id")? as u64,
            symbol_id: record.get_int64("symbol_id")? as u64,
            offset: record.get_int64("offset")? as u64,
            addend: record.get_int64("addend")?,
            kind,
        })
    }
}

impl ModuleStore for TosdbModuleStore {
    fn symbol_by_name(&mut self, name: &str) -> Result<SymbolRecord, TurnstoneError> {
        let mut probe = create_record(&self.symbols)?;
        probe.set_string("name", name)?;

        let found = probe.search()?;
        let record = found.first().ok_or_else(|| {
            log::error!("entrypoint symbol not found: {}", name);
            TurnstoneError::NotFound
        })?;

        Self::symbol_from_record(record)
    }

    fn symbol_by_id(&mut self, id: u64) -> Result<SymbolRecord, TurnstoneError> {
        let mut record = create_record(&self.symbols)?;
        record.set_int64("id", id as i64)?;
        if !record.get()? {
            return Err(TurnstoneError::NotFound);
        }
        Self::symbol_from_record(&record)
    }

    fn section_by_id(&mut self, id: u64) -> Result<SectionRecord, TurnstoneError> {
        let mut record = create_record(&self.sections)?;
        record.set_int64("id", id as i64)?;
        if !record.get()? {
            return Err(TurnstoneError::NotFound);
        }
        Self::section_from_record(&record)
    }

    fn sections_of_module(&mut self, module_id: u64) -> Result<Vec<SectionRecord>, TurnstoneError> {
        let mut probe = create_record(&self.sections)?;
        probe.set_int64("module_id", module_id as i64)?;

        let mut sections = Vec::new();
        for record in probe.search()? {
            sections.push(Self::section_from_record(&record)?);
        }
        Ok(sections)
    }

    fn relocations_of_section(
        &mut self,
        section_id: u64,
    ) -> Result<Vec<RelocationRecord>, TurnstoneError> {
        let mut probe = create_record(&self.relocations)?;
        probe.set_int64("section_id", section_id as i64)?;

        let mut relocations = Vec::new();
        for record in probe.search()? {
            relocations.push(Self::relocation_from_record(&record)?);
        }
        Ok(relocations)
    }

    fn module_by_id(&mut self, id: u64) -> Result<ModuleRecord, TurnstoneError> {
        let mut record = create_record(&self.modules)?;
        record.set_int64("id", id as i64)?;
        if !record.get()? {
            return Err(TurnstoneError::NotFound);
        }
        Ok(ModuleRecord {
            id: record.get_int64("id")? as u64,
            name: record.get_string("name")?,
        })
    }
}

/// Writes one complete module into the store; the build side of the
/// tooling uses this, and so do the tests.
#[derive(Debug, Default)]
pub struct StoreWriter {
    next_record_id: u64,
}

impl StoreWriter {
    pub fn new() -> Self {
        Self { next_record_id: 1 }
    }

    fn next_id(&mut self) -> i64 {
        let id = self.next_record_id;
        self.next_record_id += 1;
        id as i64
    }

    pub fn add_module(
        &mut self,
        store: &TosdbModuleStore,
        name: &str,
    ) -> Result<u64, TurnstoneError> {
        let id = self.next_id();
        let mut record = create_record(&store.modules)?;
        record.set_int64("id", id)?;
        record.set_string("name", name)?;
        record.upsert()?;
        Ok(id as u64)
    }

    pub fn add_section(
        &mut self,
        store: &TosdbModuleStore,
        module_id: u64,
        name: &str,
        alignment: u64,
        data: &[u8],
    ) -> Result<u64, TurnstoneError> {
        let id = self.next_id();
        let mut record = create_record(&store.sections)?;
        record.set_int64("id", id)?;
        record.set_int64("module_id", module_id as i64)?;
        record.set_string("name", name)?;
        record.set_int64("size", data.len() as i64)?;
        record.set_int64("alignment", alignment as i64)?;
        record.set_bytearray("data", data)?;
        record.upsert()?;
        Ok(id as u64)
    }

    pub fn add_symbol(
        &mut self,
        store: &TosdbModuleStore,
        section_id: u64,
        name: &str,
        value: u64,
        size: u64,
    ) -> Result<u64, TurnstoneError> {
        let id = self.next_id();
        let mut record = create_record(&store.symbols)?;
        record.set_int64("id", id)?;
        record.set_int64("section_id", section_id as i64)?;
        record.set_string("name", name)?;
        record.set_int64("value", value as i64)?;
        record.set_int64("size", size as i64)?;
        record.upsert()?;
        Ok(id as u64)
    }

    pub fn add_relocation(
        &mut self,
        store: &TosdbModuleStore,
        section_id: u64,
        symbol_id: u64,
        offset: u64,
        addend: i64,
        kind: RelocationKind,
    ) -> Result<u64, TurnstoneError> {
        let id = self.next_id();
        let mut record = create_record(&store.relocations)?;
        record.set_int64("id", id)?;
        record.set_int64("section_id", section_id as i64)?;
        record.set_int64("symbol_id", symbol_id as i64)?;
        record.set_int64("offset", offset as i64)?;
        record.set_int64("addend", addend)?;
        record.set_int8("reloc_type", kind as u8 as i8)?;
        record.upsert()?;
        Ok(id as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tosdb::block::MemoryBackend;
    use alloc::boxed::Box;

    #[test]
    fn test_store_roundtrip() {
        let mut tosdb = crate::tosdb::Tosdb::new(Box::new(MemoryBackend::new()));
        let db = tosdb.database_create_or_open("system").unwrap();
        let mut db = db.lock();

        let store = TosdbModuleStore::open(&mut db).unwrap();
        let mut writer = StoreWriter::new();

        let module = writer.add_module(&store, "core").unwrap();
        let section = writer
            .add_section(&store, module, ".text", 16, &[0x90, 0xC3])
            .unwrap();
        let symbol = writer.add_symbol(&store, section, "entry", 0, 2).unwrap();
        writer
            .add_relocation(&store, section, symbol, 1, 0, RelocationKind::Abs64)
            .unwrap();

        let mut store = store;

        let found = store.symbol_by_name("entry").unwrap();
        assert_eq!(found.id, symbol);
        assert_eq!(found.section_id, section);

        let sec = store.section_by_id(section).unwrap();
        assert_eq!(sec.module_id, module);
        assert_eq!(sec.data, [0x90, 0xC3]);

        let secs = store.sections_of_module(module).unwrap();
        assert_eq!(secs.len(), 1);

        let relocs = store.relocations_of_section(section).unwrap();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].kind, RelocationKind::Abs64);

        let module_record = store.module_by_id(module).unwrap();
        assert_eq!(module_record.name, "core");

        assert!(store.symbol_by_name("missing").is_err());
    }
}
