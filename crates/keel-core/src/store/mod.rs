//! State Store — durable, versioned key/value state per contract
//!
//! The sandbox never writes here directly: it accumulates a [`WriteSet`] per
//! contract during a call and hands the whole [`CommitBatch`] over only when
//! the call succeeds. Stores apply a batch atomically, so readers observe
//! either none or all of a transaction.
//!
//! # Layout
//!
//! ```text
//! StateStore (trait)
//!   ├── MemoryStore — StateTable only, process lifetime
//!   └── FileStore   — StateTable + write-ahead log (wal.rs), survives restart
//! ```

mod file;
mod memory;
pub(crate) mod wal;

use std::collections::BTreeMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::{ContractId, Error, Result};

pub use file::{CompactionStats, FileStore};
pub use memory::MemoryStore;

// ── Write sets ────────────────────────────────────────────

/// Buffered writes of one contract within one transaction.
/// `None` marks a delete. BTreeMap keeps application order deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WriteSet {
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.insert(key, None);
    }

    /// Pending write for `key`: `Some(None)` is a pending delete,
    /// `None` means the key was not touched.
    pub fn get(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.writes.get(key).map(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &Option<Vec<u8>>)> {
        self.writes.iter()
    }
}

/// All writes of one committed invocation, grouped by contract
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CommitBatch {
    contracts: BTreeMap<ContractId, WriteSet>,
}

impl CommitBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(id: ContractId, writes: WriteSet) -> Self {
        let mut batch = Self::new();
        batch.contracts.insert(id, writes);
        batch
    }

    /// Mutable write set for a contract, created on first use
    pub fn writes_mut(&mut self, id: ContractId) -> &mut WriteSet {
        self.contracts.entry(id).or_default()
    }

    pub fn writes(&self, id: &ContractId) -> Option<&WriteSet> {
        self.contracts.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContractId, &WriteSet)> {
        self.contracts.iter()
    }

    /// Drop contracts whose write set ended up empty
    pub fn prune(&mut self) {
        self.contracts.retain(|_, writes| !writes.is_empty());
    }

    /// Total number of key writes across contracts
    pub fn write_count(&self) -> usize {
        self.contracts.values().map(WriteSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.contracts.values().all(WriteSet::is_empty)
    }

    pub fn contract_count(&self) -> usize {
        self.contracts.len()
    }
}

// ── Snapshots ─────────────────────────────────────────────

/// Committed state of one contract
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StateSnapshot {
    /// Number of committed transactions that touched this contract
    pub version: u64,
    pub entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl StateSnapshot {
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.entries.get(key).map(Vec::as_slice)
    }

    /// Encode as `[version u64][count u32]{[klen u32][key][vlen u32][value]}*`
    pub fn encode(&self) -> Vec<u8> {
        let body: usize = self.entries.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
        let mut out = Vec::with_capacity(12 + body);
        // Writes into a Vec cannot fail
        let _ = out.write_u64::<LittleEndian>(self.version);
        let _ = out.write_u32::<LittleEndian>(self.entries.len() as u32);
        for (key, value) in &self.entries {
            let _ = out.write_u32::<LittleEndian>(key.len() as u32);
            out.extend_from_slice(key);
            let _ = out.write_u32::<LittleEndian>(value.len() as u32);
            out.extend_from_slice(value);
        }
        out
    }

    /// Decode bytes produced by [`StateSnapshot::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let malformed = |e: std::io::Error| Error::InvalidArgument(format!("malformed snapshot: {}", e));

        let version = cursor.read_u64::<LittleEndian>().map_err(malformed)?;
        let count = cursor.read_u32::<LittleEndian>().map_err(malformed)?;
        let mut entries = BTreeMap::new();
        for _ in 0..count {
            let key = read_chunk(&mut cursor).map_err(malformed)?;
            let value = read_chunk(&mut cursor).map_err(malformed)?;
            entries.insert(key, value);
        }
        if (cursor.position() as usize) != bytes.len() {
            return Err(Error::InvalidArgument(
                "malformed snapshot: trailing bytes".into(),
            ));
        }
        Ok(StateSnapshot { version, entries })
    }
}

fn read_chunk(cursor: &mut Cursor<&[u8]>) -> std::io::Result<Vec<u8>> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "chunk length past end of buffer",
        ));
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

// ── Store trait ───────────────────────────────────────────

/// Durable per-contract key/value medium used by the runtime
pub trait StateStore: Send + Sync {
    /// Committed value of `key` in `id`'s state
    fn read(&self, id: &ContractId, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Committed snapshot of `id`'s whole state (empty for untouched contracts)
    fn snapshot(&self, id: &ContractId) -> Result<StateSnapshot>;

    /// Apply every write of the batch atomically
    fn commit(&self, batch: &CommitBatch) -> Result<()>;

    /// Apply one contract's writes as a transaction
    fn apply(&self, id: &ContractId, writes: WriteSet) -> Result<()> {
        self.commit(&CommitBatch::single(*id, writes))
    }

    /// Persist deployed module bytes so the registry can be rebuilt
    fn record_module(&self, id: &ContractId, code: &[u8]) -> Result<()>;

    /// Every recorded module, in deployment order
    fn modules(&self) -> Result<Vec<(ContractId, Vec<u8>)>>;
}

// ── Shared in-memory table ────────────────────────────────

#[derive(Debug, Default)]
struct ContractState {
    version: u64,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// Versioned in-memory state shared by both store implementations.
///
/// Each contract sits behind its own reader/writer lock; a commit takes the
/// write locks of every contract in the batch (in identity order) before
/// applying anything, so multi-contract batches become visible together.
#[derive(Debug, Default)]
pub(crate) struct StateTable {
    contracts: DashMap<ContractId, Arc<RwLock<ContractState>>>,
}

impl StateTable {
    fn slot(&self, id: &ContractId) -> Arc<RwLock<ContractState>> {
        self.contracts.entry(*id).or_default().clone()
    }

    fn existing(&self, id: &ContractId) -> Option<Arc<RwLock<ContractState>>> {
        self.contracts.get(id).map(|slot| slot.clone())
    }

    pub(crate) fn read(&self, id: &ContractId, key: &[u8]) -> Option<Vec<u8>> {
        let slot = self.existing(id)?;
        let state = slot.read();
        state.entries.get(key).cloned()
    }

    pub(crate) fn snapshot(&self, id: &ContractId) -> StateSnapshot {
        match self.existing(id) {
            Some(slot) => {
                let state = slot.read();
                StateSnapshot {
                    version: state.version,
                    entries: state.entries.clone(),
                }
            }
            None => StateSnapshot::default(),
        }
    }

    pub(crate) fn apply(&self, batch: &CommitBatch) {
        // BTreeMap iteration order doubles as the lock order
        let slots: Vec<_> = batch
            .iter()
            .filter(|(_, writes)| !writes.is_empty())
            .map(|(id, writes)| (self.slot(id), writes))
            .collect();
        let mut guards: Vec<_> = slots
            .iter()
            .map(|(slot, writes)| (slot.write(), *writes))
            .collect();
        for (state, writes) in guards.iter_mut() {
            for (key, value) in writes.iter() {
                match value {
                    Some(value) => {
                        state.entries.insert(key.clone(), value.clone());
                    }
                    None => {
                        state.entries.remove(key);
                    }
                }
            }
            state.version += 1;
        }
    }

    /// Replace a contract's state wholesale (log checkpoints)
    pub(crate) fn restore(&self, id: &ContractId, snapshot: StateSnapshot) {
        let slot = self.slot(id);
        let mut state = slot.write();
        state.version = snapshot.version;
        state.entries = snapshot.entries;
    }

    pub(crate) fn contract_ids(&self) -> Vec<ContractId> {
        let mut ids: Vec<_> = self.contracts.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> ContractId {
        ContractId::from_bytes([n; 32])
    }

    #[test]
    fn test_write_set_last_write_wins() {
        let mut ws = WriteSet::new();
        ws.put(b"k".to_vec(), b"1".to_vec());
        ws.put(b"k".to_vec(), b"2".to_vec());
        assert_eq!(ws.get(b"k"), Some(Some(&b"2"[..])));
        ws.delete(b"k".to_vec());
        assert_eq!(ws.get(b"k"), Some(None));
        assert_eq!(ws.get(b"other"), None);
        assert_eq!(ws.len(), 1);
    }

    #[test]
    fn test_snapshot_encoding_layout() {
        let mut snapshot = StateSnapshot {
            version: 2,
            entries: BTreeMap::new(),
        };
        snapshot.entries.insert(b"a".to_vec(), vec![0, 1]);
        let bytes = snapshot.encode();
        assert_eq!(&bytes[..8], &2u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_le_bytes());
        assert_eq!(&bytes[12..16], &1u32.to_le_bytes());
        assert_eq!(bytes[16], b'a');
        assert_eq!(&bytes[17..21], &2u32.to_le_bytes());
        assert_eq!(&bytes[21..], &[0, 1]);
        assert_eq!(StateSnapshot::decode(&bytes).unwrap(), snapshot);
    }

    #[test]
    fn test_snapshot_decode_rejects_truncation() {
        let mut snapshot = StateSnapshot::default();
        snapshot.entries.insert(b"key".to_vec(), b"value".to_vec());
        let bytes = snapshot.encode();
        for cut in [0, 5, 12, bytes.len() - 1] {
            assert!(StateSnapshot::decode(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
        let mut extra = bytes.clone();
        extra.push(0);
        assert!(StateSnapshot::decode(&extra).is_err());
    }

    #[test]
    fn test_table_apply_bumps_versions_per_contract() {
        let table = StateTable::default();
        let mut batch = CommitBatch::new();
        batch.writes_mut(id(1)).put(b"x".to_vec(), b"1".to_vec());
        batch.writes_mut(id(2)).put(b"y".to_vec(), b"2".to_vec());
        table.apply(&batch);
        table.apply(&CommitBatch::single(id(1), {
            let mut ws = WriteSet::new();
            ws.delete(b"x".to_vec());
            ws
        }));

        let one = table.snapshot(&id(1));
        assert_eq!(one.version, 2);
        assert!(one.entries.is_empty());
        let two = table.snapshot(&id(2));
        assert_eq!(two.version, 1);
        assert_eq!(two.get(b"y"), Some(&b"2"[..]));
        assert_eq!(table.snapshot(&id(3)), StateSnapshot::default());
    }

    #[test]
    fn test_batch_prune_and_counts() {
        let mut batch = CommitBatch::new();
        batch.writes_mut(id(1)).put(b"a".to_vec(), vec![]);
        batch.writes_mut(id(2));
        assert_eq!(batch.contract_count(), 2);
        batch.prune();
        assert_eq!(batch.contract_count(), 1);
        assert_eq!(batch.write_count(), 1);
        assert!(!batch.is_empty());
    }
}
