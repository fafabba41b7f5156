//! Write-ahead log records and framing
//!
//! ## Record Format
//!
//! ```text
//! [length: u32][type: u8][payload: bytes][crc32: u32]
//! ```
//!
//! - **length**: size of type + payload + crc (not including the length itself)
//! - **type**: record tag (1=Deploy, 2=Commit, 3=Checkpoint)
//! - **payload**: bincode-serialized [`WalRecord`]
//! - **crc32**: checksum over \[type\]\[payload\]
//!
//! A reader stops at the first record that is truncated or fails its
//! checksum; everything after that point is a torn tail.

use crc32fast::Hasher;

use super::{CommitBatch, StateSnapshot};
use crate::{ContractId, Error, Result};

const TYPE_DEPLOY: u8 = 1;
const TYPE_COMMIT: u8 = 2;
const TYPE_CHECKPOINT: u8 = 3;

/// Frame overhead: length(4) + type(1) + crc(4)
const FRAME_OVERHEAD: usize = 9;

/// Upper bound on a single record, guards against reading garbage lengths
const MAX_RECORD_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub(crate) enum WalRecord {
    /// A module was deployed
    Deploy { id: ContractId, code: Vec<u8> },
    /// One committed invocation
    Commit { sequence: u64, batch: CommitBatch },
    /// Full state of one contract, written by compaction
    Checkpoint { id: ContractId, snapshot: StateSnapshot },
}

impl WalRecord {
    fn type_tag(&self) -> u8 {
        match self {
            WalRecord::Deploy { .. } => TYPE_DEPLOY,
            WalRecord::Commit { .. } => TYPE_COMMIT,
            WalRecord::Checkpoint { .. } => TYPE_CHECKPOINT,
        }
    }
}

/// Encode a record into its framed form
pub(crate) fn encode_record(record: &WalRecord) -> Result<Vec<u8>> {
    let type_tag = record.type_tag();
    let payload = bincode::serialize(record)
        .map_err(|e| Error::Storage(format!("failed to encode log record: {}", e)))?;

    let total_len = 1 + payload.len() + 4;
    let mut buf = Vec::with_capacity(4 + total_len);
    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.push(type_tag);
    buf.extend_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&[type_tag]);
    hasher.update(&payload);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());
    Ok(buf)
}

/// Outcome of scanning a log buffer
#[derive(Debug)]
pub(crate) struct LogScan {
    pub records: Vec<WalRecord>,
    /// Length of the valid prefix; bytes past this are a torn tail
    pub valid_len: usize,
}

impl LogScan {
    pub fn has_torn_tail(&self, total_len: usize) -> bool {
        self.valid_len < total_len
    }
}

/// Decode every intact record from the start of `buf`
pub(crate) fn scan_records(buf: &[u8]) -> LogScan {
    let mut records = Vec::new();
    let mut offset = 0usize;

    while let Some((record, consumed)) = decode_at(buf, offset) {
        records.push(record);
        offset += consumed;
    }

    LogScan {
        records,
        valid_len: offset,
    }
}

fn decode_at(buf: &[u8], offset: usize) -> Option<(WalRecord, usize)> {
    let rest = buf.get(offset..)?;
    if rest.len() < FRAME_OVERHEAD {
        return None;
    }
    let total_len = u32::from_le_bytes(rest[..4].try_into().ok()?) as usize;
    if total_len < 5 || total_len > MAX_RECORD_BYTES || rest.len() < 4 + total_len {
        return None;
    }

    let body = &rest[4..4 + total_len];
    let (content, crc_bytes) = body.split_at(total_len - 4);
    let stored_crc = u32::from_le_bytes(crc_bytes.try_into().ok()?);
    let mut hasher = Hasher::new();
    hasher.update(content);
    if hasher.finalize() != stored_crc {
        return None;
    }

    let type_tag = content[0];
    let record: WalRecord = bincode::deserialize(&content[1..]).ok()?;
    if record.type_tag() != type_tag {
        return None;
    }
    Some((record, 4 + total_len))
}
