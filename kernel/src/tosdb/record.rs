// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed record interface. Every typed setter fans through the
//! generic `set_data`; indexed columns additionally produce a key
//! entry whose hash is the raw value for fixed-length types and the
//! xxhash64 of the bytes for variable-length ones. Upsert, delete,
//! get, and search are forwarded to the table's memtable/sstable
//! layers.

extern crate alloc;

use super::memtable::MemKey;
use super::{DataType, TableRef, TosdbError, Value};
use crate::error::TurnstoneError;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;

use twox_hash::XxHash64;

const KEY_HASH_SEED: u64 = 0;

/// One index key of a record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEntry {
    pub index_id: u64,
    pub key_hash: u64,
    pub key_length: u64,
    pub key: Vec<u8>,
}

impl KeyEntry {
    pub fn mem_key(&self) -> MemKey {
        (self.key_hash, self.key.clone())
    }
}

#[derive(Debug)]
pub struct Record {
    table: TableRef,
    columns: BTreeMap<u64, Value>,
    keys: BTreeMap<u64, KeyEntry>,
    is_deleted: bool,
}

/// Creates a fresh record bound to an open table.
pub fn create_record(table: &TableRef) -> Result<Record, TurnstoneError> {
    {
        let guard = table.lock();
        if !guard.is_open {
            log::error!("table {} is closed", guard.name);
            return Err(TosdbError::TableClosed.into());
        }
        if guard.is_deleted {
            log::error!("table {} is deleted", guard.name);
            return Err(TosdbError::TableDeleted.into());
        }
    }

    Ok(Record {
        table: table.clone(),
        columns: BTreeMap::new(),
        keys: BTreeMap::new(),
        is_deleted: false,
    })
}

impl Record {
    pub fn is_deleted(&self) -> bool {
        self.is_deleted
    }

    /// Generic typed store: column lookup by name, type check, key
    /// extraction for indexed columns.
    pub fn set_data(&mut self, column_name: &str, value: Value) -> Result<(), TurnstoneError> {
        if column_name.is_empty() {
            return Err(TurnstoneError::InvalidArgument);
        }

        let column_id = {
            let table = self.table.lock();
            let column = table.column_by_name(column_name).ok_or_else(|| {
                log::error!(
                    "column {} does not exist at table {}",
                    column_name,
                    table.name
                );
                TurnstoneError::Tosdb(TosdbError::ColumnNotFound)
            })?;

            if column.data_type != value.data_type() {
                log::error!(
                    "column {} type mismatch for table {}",
                    column_name,
                    table.name
                );
                return Err(TosdbError::TypeMismatch.into());
            }

            column.id
        };

        self.set_data_with_colid(column_id, value)
    }

    pub fn set_data_with_colid(
        &mut self,
        column_id: u64,
        value: Value,
    ) -> Result<(), TurnstoneError> {
        if column_id == 0 {
            return Err(TurnstoneError::InvalidArgument);
        }

        let index_id = self.table.lock().index_for_column(column_id);

        if let Some(index_id) = index_id {
            let entry = match value.fixed_bits() {
                Some(bits) => KeyEntry {
                    index_id,
                    key_hash: bits,
                    key_length: 0,
                    key: Vec::new(),
                },
                None => {
                    let bytes = value.var_bytes().unwrap_or(&[]);
                    KeyEntry {
                        index_id,
                        key_hash: XxHash64::oneshot(KEY_HASH_SEED, bytes),
                        key_length: bytes.len() as u64,
                        key: Vec::from(bytes),
                    }
                }
            };
            self.keys.insert(index_id, entry);
        }

        self.columns.insert(column_id, value);

        Ok(())
    }

    pub fn get_data(&self, column_name: &str, data_type: DataType) -> Result<Value, TurnstoneError> {
        let column_id = {
            let table = self.table.lock();
            let column = table
                .column_by_name(column_name)
                .ok_or(TurnstoneError::Tosdb(TosdbError::ColumnNotFound))?;
            if column.data_type != data_type {
                return Err(TosdbError::TypeMismatch.into());
            }
            column.id
        };

        self.columns
            .get(&column_id)
            .cloned()
            .ok_or(TurnstoneError::NotFound)
    }

    pub fn key_entry(&self, index_id: u64) -> Option<&KeyEntry> {
        self.keys.get(&index_id)
    }

    // Typed accessors, all routed through set_data/get_data.

    pub fn set_boolean(&mut self, column: &str, value: bool) -> Result<(), TurnstoneError> {
        self.set_data(column, Value::Boolean(value))
    }

    pub fn get_boolean(&self, column: &str) -> Result<bool, TurnstoneError> {
        match self.get_data(column, DataType::Boolean)? {
            Value::Boolean(v) => Ok(v),
            _ => Err(TosdbError::TypeMismatch.into()),
        }
    }

    pub fn set_char(&mut self, column: &str, value: u8) -> Result<(), TurnstoneError> {
        self.set_data(column, Value::Char(value))
    }

    pub fn get_char(&self, column: &str) -> Result<u8, TurnstoneError> {
        match self.get_data(column, DataType::Char)? {
            Value::Char(v) => Ok(v),
            _ => Err(TosdbError::TypeMismatch.into()),
        }
    }

    pub fn set_int8(&mut self, column: &str, value: i8) -> Result<(), TurnstoneError> {
        self.set_data(column, Value::Int8(value))
    }

    pub fn get_int8(&self, column: &str) -> Result<i8, TurnstoneError> {
        match self.get_data(column, DataType::Int8)? {
            Value::Int8(v) => Ok(v),
            _ => Err(TosdbError::TypeMismatch.into()),
        }
    }

    pub fn set_int16(&mut self, column: &str, value: i16) -> Result<(), TurnstoneError> {
        self.set_data(column, Value::Int16(value))
    }

    pub fn get_int16(&self, column: &str) -> Result<i16, TurnstoneError> {
        match self.get_data(column, DataType::Int16)? {
            Value::Int16(v) => Ok(v),
            _ => Err(TosdbError::TypeMismatch.into()),
        }
    }

    pub fn set_int32(&mut self, column: &str, value: i32) -> Result<(), TurnstoneError> {
        self.set_data(column, Value::Int32(value))
    }

    pub fn get_int32(&self, column: &str) -> Result<i32, TurnstoneError> {
        match self.get_data(column, DataType::Int32)? {
            Value::Int32(v) => Ok(v),
            _ => Err(TosdbError::TypeMismatch.into()),
        }
    }

    pub fn set_int64(&mut self, column: &str, value: i64) -> Result<(), TurnstoneError> {
        self.set_data(column, Value::Int64(value))
    }

    pub fn get_int64(&self, column: &str) -> Result<i64, TurnstoneError> {
        match self.get_data(column, DataType::Int64)? {
            Value::Int64(v) => Ok(v),
            _ => Err(TosdbError::TypeMismatch.into()),
        }
    }

    pub fn set_float32(&mut self, column: &str, value: f32) -> Result<(), TurnstoneError> {
        self.set_data(column, Value::Float32(value))
    }

    pub fn get_float32(&self, column: &str) -> Result<f32, TurnstoneError> {
        match self.get_data(column, DataType::Float32)? {
            Value::Float32(v) => Ok(v),
            _ => Err(TosdbError::TypeMismatch.into()),
        }
    }

    pub fn set_float64(&mut self, column: &str, value: f64) -> Result<(), TurnstoneError> {
        self.set_data(column, Value::Float64(value))
    }

    pub fn get_float64(&self, column: &str) -> Result<f64, TurnstoneError> {
        match self.get_data(column, DataType::Float64)? {
            Value::Float64(v) => Ok(v),
            _ => Err(TosdbError::TypeMismatch.into()),
        }
    }

    pub fn set_string(&mut self, column: &str, value: &str) -> Result<(), TurnstoneError> {
        self.set_data(column, Value::String(String::from(value)))
    }

    pub fn get_string(&self, column: &str) -> Result<String, TurnstoneError> {
        match self.get_data(column, DataType::String)? {
            Value::String(v) => Ok(v),
            _ => Err(TosdbError::TypeMismatch.into()),
        }
    }

    pub fn set_bytearray(&mut self, column: &str, value: &[u8]) -> Result<(), TurnstoneError> {
        self.set_data(column, Value::ByteArray(Vec::from(value)))
    }

    pub fn get_bytearray(&self, column: &str) -> Result<Vec<u8>, TurnstoneError> {
        match self.get_data(column, DataType::ByteArray)? {
            Value::ByteArray(v) => Ok(v),
            _ => Err(TosdbError::TypeMismatch.into()),
        }
    }

    // ---- wire form ----

    /// Serializes the record as a typed, ordered dictionary: each
    /// column is `{int64 id, data_type, length, bytes}`.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.columns.len() as u64).to_le_bytes());

        for (column_id, value) in self.columns.iter() {
            let bytes = value.wire_bytes();
            out.extend_from_slice(&column_id.to_le_bytes());
            out.push(value.data_type() as u8);
            out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            out.extend_from_slice(&bytes);
        }

        out
    }

    fn populate_from(&mut self, bytes: &[u8]) -> Result<(), TurnstoneError> {
        let mut offset = 0usize;

        let read_u64 = |bytes: &[u8], offset: &mut usize| -> Result<u64, TurnstoneError> {
            let end = *offset + 8;
            let value = u64::from_le_bytes(
                bytes
                    .get(*offset..end)
                    .ok_or(TurnstoneError::CorruptData)?
                    .try_into()
                    .map_err(|_| TurnstoneError::CorruptData)?,
            );
            *offset = end;
            Ok(value)
        };

        let count = read_u64(bytes, &mut offset)?;
        for _ in 0..count {
            let column_id = read_u64(bytes, &mut offset)?;
            let type_byte = *bytes.get(offset).ok_or(TurnstoneError::CorruptData)?;
            offset += 1;
            let len = read_u64(bytes, &mut offset)? as usize;
            let data = bytes
                .get(offset..offset + len)
                .ok_or(TurnstoneError::CorruptData)?;
            offset += len;

            let data_type =
                DataType::from_u8(type_byte).ok_or(TurnstoneError::CorruptData)?;
            let value =
                Value::from_wire(data_type, data).ok_or(TurnstoneError::CorruptData)?;

            self.set_data_with_colid(column_id, value)?;
        }

        Ok(())
    }

    // ---- storage operations ----

    fn primary_key(&self) -> Result<(u64, MemKey), TurnstoneError> {
        let primary = self
            .table
            .lock()
            .primary_index()
            .ok_or(TurnstoneError::Tosdb(TosdbError::NoPrimaryIndex))?;

        let entry = self
            .keys
            .get(&primary.id)
            .ok_or(TurnstoneError::Tosdb(TosdbError::NoPrimaryIndex))?;

        Ok((primary.id, entry.mem_key()))
    }

    fn secondary_keys(&self, primary_index_id: u64) -> Vec<(u64, MemKey)> {
        self.keys
            .values()
            .filter(|entry| entry.index_id != primary_index_id)
            .map(|entry| (entry.index_id, entry.mem_key()))
            .collect()
    }

    pub fn upsert(&mut self) -> Result<(), TurnstoneError> {
        let (primary_index_id, primary) = self.primary_key()?;
        let secondaries = self.secondary_keys(primary_index_id);
        let serialized = self.serialize();

        self.table
            .lock()
            .memtable_upsert(primary, &secondaries, serialized, false)?;
        Ok(())
    }

    /// Write-through tombstone; deleting an already-deleted record is
    /// a no-op.
    pub fn delete(&mut self) -> Result<(), TurnstoneError> {
        let (primary_index_id, primary) = self.primary_key()?;

        if let Some(stored) = self.table.lock().point_get(&primary)? {
            if stored.deleted {
                return Ok(());
            }
        }

        let secondaries = self.secondary_keys(primary_index_id);
        let serialized = self.serialize();

        self.is_deleted = true;
        self.table
            .lock()
            .memtable_upsert(primary, &secondaries, serialized, true)?;
        Ok(())
    }

    /// Point lookup by the primary key set on this record; on success
    /// the record's columns are replaced by the stored ones.
    pub fn get(&mut self) -> Result<bool, TurnstoneError> {
        let (_, primary) = self.primary_key()?;

        let stored = { self.table.lock().point_get(&primary)? };

        match stored {
            Some(stored) => {
                if stored.deleted {
                    self.is_deleted = true;
                    return Ok(false);
                }
                self.populate_from(&stored.serialized)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Collects records whose indexed columns match the keys set on
    /// this record. Matches from the memtable and sstable layers are
    /// de-duplicated through a sorted set and materialized with point
    /// gets.
    pub fn search(&self) -> Result<Vec<Record>, TurnstoneError> {
        let (primary_column_id, primary_type, primary_index_id) = {
            let table = self.table.lock();
            let (column_id, data_type) = table
                .primary_column()
                .ok_or(TurnstoneError::Tosdb(TosdbError::NoPrimaryIndex))?;
            let index = table
                .primary_index()
                .ok_or(TurnstoneError::Tosdb(TosdbError::NoPrimaryIndex))?;
            (column_id, data_type, index.id)
        };

        let mut matches: BTreeSet<MemKey> = BTreeSet::new();
        {
            let table = self.table.lock();
            for entry in self.keys.values() {
                if entry.index_id == primary_index_id {
                    continue;
                }
                table.search_keys(entry.index_id, &entry.mem_key(), &mut matches)?;
            }
        }

        let mut records = Vec::new();
        for primary in matches {
            let mut record = create_record(&self.table)?;

            let value = if primary.1.is_empty() {
                Value::from_wire(primary_type, &primary.0.to_le_bytes())
            } else {
                Value::from_wire(primary_type, &primary.1)
            }
            .ok_or(TurnstoneError::CorruptData)?;

            record.set_data_with_colid(primary_column_id, value)?;

            if record.get()? {
                records.push(record);
            }
        }

        Ok(records)
    }
}
