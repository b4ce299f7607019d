// SPDX-License-Identifier: MIT OR Apache-2.0

//! Memtable: the in-memory write layer of a table, keyed by the
//! primary index with per-index secondary lookups. A persisted
//! memtable becomes an sstable block the read path scans newest-first.

extern crate alloc;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;

/// Index key: the hash plus the raw key bytes (empty for fixed-length
/// keys, whose hash carries the value itself).
pub type MemKey = (u64, Vec<u8>);

#[derive(Clone, Debug)]
pub struct StoredRecord {
    pub serialized: Vec<u8>,
    pub deleted: bool,
}

#[derive(Debug, Default)]
pub struct Memtable {
    pub id: u64,
    records: BTreeMap<MemKey, StoredRecord>,
    secondary: BTreeMap<u64, BTreeMap<MemKey, MemKey>>,
    pub is_dirty: bool,
}

impl Memtable {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write-through of one record. A delete is an upsert of a
    /// tombstone.
    pub fn upsert(
        &mut self,
        primary: MemKey,
        secondaries: &[(u64, MemKey)],
        serialized: Vec<u8>,
        deleted: bool,
    ) {
        for (index_id, key) in secondaries {
            self.secondary
                .entry(*index_id)
                .or_default()
                .insert(key.clone(), primary.clone());
        }

        self.records.insert(
            primary,
            StoredRecord {
                serialized,
                deleted,
            },
        );
        self.is_dirty = true;
    }

    pub fn get(&self, primary: &MemKey) -> Option<&StoredRecord> {
        self.records.get(primary)
    }

    pub fn is_deleted(&self, primary: &MemKey) -> bool {
        self.records.get(primary).map(|r| r.deleted).unwrap_or(false)
    }

    /// Primary keys whose `index_id` entry matches `key`.
    pub fn search(&self, index_id: u64, key: &MemKey, results: &mut BTreeSet<MemKey>) {
        if let Some(index) = self.secondary.get(&index_id) {
            if let Some(primary) = index.get(key) {
                results.insert(primary.clone());
            }
        }
    }

    /// Serializes the whole memtable into the sstable wire form.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.records.len() as u64).to_le_bytes());

        for ((hash, key), record) in self.records.iter() {
            out.extend_from_slice(&hash.to_le_bytes());
            out.extend_from_slice(&(key.len() as u64).to_le_bytes());
            out.extend_from_slice(key);
            out.push(record.deleted as u8);

            // Secondary entries pointing at this record.
            let secondaries: Vec<(u64, &MemKey)> = self
                .secondary
                .iter()
                .flat_map(|(index_id, index)| {
                    index
                        .iter()
                        .filter(|(_, primary)| primary.0 == *hash && primary.1 == *key)
                        .map(move |(sec_key, _)| (*index_id, sec_key))
                })
                .collect();

            out.extend_from_slice(&(secondaries.len() as u64).to_le_bytes());
            for (index_id, (sec_hash, sec_bytes)) in secondaries {
                out.extend_from_slice(&index_id.to_le_bytes());
                out.extend_from_slice(&sec_hash.to_le_bytes());
                out.extend_from_slice(&(sec_bytes.len() as u64).to_le_bytes());
                out.extend_from_slice(sec_bytes);
            }

            out.extend_from_slice(&(record.serialized.len() as u64).to_le_bytes());
            out.extend_from_slice(&record.serialized);
        }

        out
    }
}

/// Reader over a persisted memtable payload.
#[derive(Debug)]
pub struct SstableData<'a> {
    bytes: &'a [u8],
}

struct WireCursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> WireCursor<'a> {
    fn u64(&mut self) -> Option<u64> {
        let end = self.offset.checked_add(8)?;
        let value = u64::from_le_bytes(self.bytes.get(self.offset..end)?.try_into().ok()?);
        self.offset = end;
        Some(value)
    }

    fn u8(&mut self) -> Option<u8> {
        let value = *self.bytes.get(self.offset)?;
        self.offset += 1;
        Some(value)
    }

    fn slice(&mut self, len: u64) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(len as usize)?;
        let value = self.bytes.get(self.offset..end)?;
        self.offset = end;
        Some(value)
    }
}

impl<'a> SstableData<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Point lookup of one primary key.
    pub fn get(&self, primary: &MemKey) -> Option<StoredRecord> {
        let mut found = None;
        self.walk(|hash, key, record, _| {
            if hash == primary.0 && key == primary.1.as_slice() {
                found = Some(record);
            }
        })?;
        found
    }

    /// Collects primary keys matching a secondary index entry.
    pub fn search(&self, index_id: u64, key: &MemKey, results: &mut BTreeSet<MemKey>) {
        let _ = self.walk(|hash, primary_bytes, _, secondaries| {
            for (sec_index, sec_hash, sec_bytes) in secondaries {
                if *sec_index == index_id && *sec_hash == key.0 && *sec_bytes == key.1.as_slice() {
                    results.insert((hash, Vec::from(primary_bytes)));
                }
            }
        });
    }

    fn walk(
        &self,
        mut visit: impl FnMut(u64, &'a [u8], StoredRecord, &[(u64, u64, &'a [u8])]),
    ) -> Option<()> {
        let mut cursor = WireCursor {
            bytes: self.bytes,
            offset: 0,
        };

        let count = cursor.u64()?;
        for _ in 0..count {
            let hash = cursor.u64()?;
            let key_len = cursor.u64()?;
            let key = cursor.slice(key_len)?;
            let deleted = cursor.u8()? != 0;

            let sec_count = cursor.u64()?;
            let mut secondaries = Vec::with_capacity(sec_count as usize);
            for _ in 0..sec_count {
                let index_id = cursor.u64()?;
                let sec_hash = cursor.u64()?;
                let sec_len = cursor.u64()?;
                let sec_bytes = cursor.slice(sec_len)?;
                secondaries.push((index_id, sec_hash, sec_bytes));
            }

            let data_len = cursor.u64()?;
            let data = cursor.slice(data_len)?;

            visit(
                hash,
                key,
                StoredRecord {
                    serialized: Vec::from(data),
                    deleted,
                },
                &secondaries,
            );
        }

        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn key(hash: u64, bytes: &[u8]) -> MemKey {
        (hash, Vec::from(bytes))
    }

    #[test]
    fn test_upsert_and_get() {
        let mut memtable = Memtable::new(1);
        memtable.upsert(key(7, b""), &[], vec![1, 2, 3], false);

        let record = memtable.get(&key(7, b"")).unwrap();
        assert_eq!(record.serialized, vec![1, 2, 3]);
        assert!(!record.deleted);
        assert!(memtable.is_dirty);
    }

    #[test]
    fn test_tombstone_visible() {
        let mut memtable = Memtable::new(1);
        memtable.upsert(key(7, b""), &[], vec![1], false);
        memtable.upsert(key(7, b""), &[], vec![], true);
        assert!(memtable.is_deleted(&key(7, b"")));
    }

    #[test]
    fn test_secondary_search() {
        let mut memtable = Memtable::new(1);
        let primary = key(1, b"");
        let sec = key(0xABCD, b"alice");
        memtable.upsert(primary.clone(), &[(2, sec.clone())], vec![9], false);

        let mut results = BTreeSet::new();
        memtable.search(2, &sec, &mut results);
        assert!(results.contains(&primary));

        let mut results = BTreeSet::new();
        memtable.search(2, &key(0xABCD, b"bob"), &mut results);
        assert!(results.is_empty());
    }

    #[test]
    fn test_serialize_roundtrip_through_sstable() {
        let mut memtable = Memtable::new(1);
        let primary = key(42, b"");
        let sec = key(0x1111, b"name-key");
        memtable.upsert(primary.clone(), &[(3, sec.clone())], vec![5, 6, 7], false);
        memtable.upsert(key(43, b""), &[], vec![8], true);

        let bytes = memtable.serialize();
        let sstable = SstableData::new(&bytes);

        let record = sstable.get(&primary).unwrap();
        assert_eq!(record.serialized, vec![5, 6, 7]);
        assert!(!record.deleted);

        let tombstone = sstable.get(&key(43, b"")).unwrap();
        assert!(tombstone.deleted);

        let mut results = BTreeSet::new();
        sstable.search(3, &sec, &mut results);
        assert!(results.contains(&primary));
    }
}
