// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedded table store surface: typed records, table lifecycle, and
//! the backward-linked metadata block chains. The storage engine
//! underneath (compaction, B+ tree indexes, bloom filters) stays an
//! external collaborator; what lives here is the record-read surface
//! the rest of the kernel consumes.

extern crate alloc;

pub mod block;
pub mod memtable;
pub mod record;
pub mod table;

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::locking::SpinLock;

use block::BlockIo;
use table::Table;

pub const TOSDB_NAME_MAX_LEN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TosdbError {
    TableClosed,
    TableDeleted,
    ColumnNotFound,
    ColumnExists,
    TypeMismatch,
    NameTooLong,
    NoPrimaryIndex,
    BackendFull,
}

/// Column data types. Everything ordered before `String` packs into a
/// single word; `String` and `ByteArray` carry heap copies.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DataType {
    Boolean = 0,
    Char = 1,
    Int8 = 2,
    Int16 = 3,
    Int32 = 4,
    Int64 = 5,
    Float32 = 6,
    Float64 = 7,
    String = 8,
    ByteArray = 9,
}

impl DataType {
    pub fn is_fixed(self) -> bool {
        self < DataType::String
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Boolean,
            1 => Self::Char,
            2 => Self::Int8,
            3 => Self::Int16,
            4 => Self::Int32,
            5 => Self::Int64,
            6 => Self::Float32,
            7 => Self::Float64,
            8 => Self::String,
            9 => Self::ByteArray,
            _ => return None,
        })
    }
}

/// A typed column value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Boolean(bool),
    Char(u8),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    ByteArray(Vec<u8>),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Char(_) => DataType::Char,
            Value::Int8(_) => DataType::Int8,
            Value::Int16(_) => DataType::Int16,
            Value::Int32(_) => DataType::Int32,
            Value::Int64(_) => DataType::Int64,
            Value::Float32(_) => DataType::Float32,
            Value::Float64(_) => DataType::Float64,
            Value::String(_) => DataType::String,
            Value::ByteArray(_) => DataType::ByteArray,
        }
    }

    /// Fixed values packed into one word, the form index keys use.
    pub fn fixed_bits(&self) -> Option<u64> {
        Some(match self {
            Value::Boolean(v) => *v as u64,
            Value::Char(v) => *v as u64,
            Value::Int8(v) => *v as u8 as u64,
            Value::Int16(v) => *v as u16 as u64,
            Value::Int32(v) => *v as u32 as u64,
            Value::Int64(v) => *v as u64,
            Value::Float32(v) => v.to_bits() as u64,
            Value::Float64(v) => v.to_bits(),
            _ => return None,
        })
    }

    pub fn var_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::String(s) => Some(s.as_bytes()),
            Value::ByteArray(b) => Some(b),
            _ => None,
        }
    }

    pub fn wire_bytes(&self) -> Vec<u8> {
        match self {
            Value::String(s) => Vec::from(s.as_bytes()),
            Value::ByteArray(b) => b.clone(),
            fixed => Vec::from(fixed.fixed_bits().unwrap_or(0).to_le_bytes()),
        }
    }

    pub fn from_wire(data_type: DataType, bytes: &[u8]) -> Option<Self> {
        if data_type.is_fixed() {
            let mut word = [0u8; 8];
            let len = bytes.len().min(8);
            word[..len].copy_from_slice(&bytes[..len]);
            let bits = u64::from_le_bytes(word);
            Some(match data_type {
                DataType::Boolean => Value::Boolean(bits != 0),
                DataType::Char => Value::Char(bits as u8),
                DataType::Int8 => Value::Int8(bits as u8 as i8),
                DataType::Int16 => Value::Int16(bits as u16 as i16),
                DataType::Int32 => Value::Int32(bits as u32 as i32),
                DataType::Int64 => Value::Int64(bits as i64),
                DataType::Float32 => Value::Float32(f32::from_bits(bits as u32)),
                DataType::Float64 => Value::Float64(f64::from_bits(bits)),
                _ => return None,
            })
        } else {
            match data_type {
                DataType::String => Some(Value::String(
                    String::from_utf8(Vec::from(bytes)).ok()?,
                )),
                DataType::ByteArray => Some(Value::ByteArray(Vec::from(bytes))),
                _ => None,
            }
        }
    }
}

pub type TableRef = Arc<SpinLock<Table>>;
pub type BackendRef = Arc<SpinLock<alloc::boxed::Box<dyn BlockIo + Send>>>;

#[derive(Debug)]
pub struct Database {
    pub id: u64,
    pub name: String,
    tables: BTreeMap<String, TableRef>,
    table_next_id: u64,
    backend: BackendRef,
}

impl Database {
    fn new(id: u64, name: &str, backend: BackendRef) -> Self {
        Self {
            id,
            name: String::from(name),
            tables: BTreeMap::new(),
            table_next_id: 1,
            backend,
        }
    }

    /// Opens the named table, lazily loading it from its persisted
    /// metadata chain, or creates a fresh one.
    pub fn table_create_or_open(&mut self, name: &str) -> Result<TableRef, TosdbError> {
        if name.len() > TOSDB_NAME_MAX_LEN {
            log::error!("table name cannot be longer than {}", TOSDB_NAME_MAX_LEN);
            return Err(TosdbError::NameTooLong);
        }

        if let Some(existing) = self.tables.get(name) {
            {
                let mut table = existing.lock();
                if table.is_deleted {
                    log::error!("table {} was deleted", table.name);
                    return Err(TosdbError::TableDeleted);
                }
                if !table.is_open {
                    log::debug!("table {} will be lazy loaded", table.name);
                    table.load()?;
                }
            }
            return Ok(existing.clone());
        }

        log::debug!("table {} not found, new one will be created", name);

        let table = Table::create(self.table_next_id, self.id, name, self.backend.clone());
        self.table_next_id += 1;

        let table = Arc::new(SpinLock::new(table));
        self.tables.insert(String::from(name), table.clone());

        Ok(table)
    }
}

pub type DatabaseRef = Arc<SpinLock<Database>>;

/// Top-level store handle: one backend, many databases.
#[derive(Debug)]
pub struct Tosdb {
    backend: BackendRef,
    databases: BTreeMap<String, DatabaseRef>,
    database_next_id: u64,
}

impl Tosdb {
    pub fn new(backend: alloc::boxed::Box<dyn BlockIo + Send>) -> Self {
        Self {
            backend: Arc::new(SpinLock::new(backend)),
            databases: BTreeMap::new(),
            database_next_id: 1,
        }
    }

    pub fn database_create_or_open(&mut self, name: &str) -> Result<DatabaseRef, TosdbError> {
        if name.len() > TOSDB_NAME_MAX_LEN {
            return Err(TosdbError::NameTooLong);
        }

        if let Some(db) = self.databases.get(name) {
            return Ok(db.clone());
        }

        let db = Arc::new(SpinLock::new(Database::new(
            self.database_next_id,
            name,
            self.backend.clone(),
        )));
        self.database_next_id += 1;
        self.databases.insert(String::from(name), db.clone());
        Ok(db)
    }
}
