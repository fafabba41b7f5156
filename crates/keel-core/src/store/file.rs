//! Durable state store backed by an append-only log
//!
//! Every deploy and every committed invocation is appended to `state.wal`
//! before it becomes visible in memory. Opening a directory replays the log;
//! a torn tail left by a crash mid-append is cut off.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use super::wal::{encode_record, scan_records, WalRecord};
use super::{CommitBatch, StateSnapshot, StateStore, StateTable};
use crate::{ContractId, Error, Result};

const LOG_FILE: &str = "state.wal";
const COMPACT_FILE: &str = "state.wal.compact";

/// What the log needs from the file underneath it
trait LogSink: Write {
    fn sync(&mut self) -> std::io::Result<()>;
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl LogSink for File {
    fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

struct LogFile<F: LogSink = File> {
    file: F,
    /// Bytes of intact records in the file
    len: u64,
    /// Sequence number of the last commit record
    sequence: u64,
    /// A failed append could not be cut back out of the file. Nothing more
    /// is appended until compaction rewrites the log.
    poisoned: bool,
}

impl<F: LogSink> LogFile<F> {
    fn new(file: F, len: u64, sequence: u64) -> Self {
        LogFile {
            file,
            len,
            sequence,
            poisoned: false,
        }
    }

    /// Append one encoded record. A record that was not fully written (or
    /// not synced when `sync` is set) is cut off again, so the caller's
    /// failure is never replayed on the next open.
    fn append(&mut self, bytes: &[u8], sync: bool) -> Result<()> {
        if self.poisoned {
            return Err(Error::Storage(
                "state log is unusable after a failed append; compact to recover".into(),
            ));
        }
        let written = self
            .file
            .write_all(bytes)
            .and_then(|()| if sync { self.file.sync() } else { Ok(()) });
        if let Err(e) = written {
            if let Err(cut) = self.file.truncate(self.len) {
                tracing::error!(error = %cut, "failed to cut back a failed append, state log poisoned");
                self.poisoned = true;
            }
            return Err(Error::Storage(format!("failed to append to state log: {}", e)));
        }
        self.len += bytes.len() as u64;
        Ok(())
    }
}

/// Summary of a [`FileStore::compact`] run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    pub modules: usize,
    pub contracts: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

/// [`StateStore`] persisted to a directory
pub struct FileStore {
    dir: PathBuf,
    table: StateTable,
    modules: RwLock<Vec<(ContractId, Vec<u8>)>>,
    log: Mutex<LogFile>,
    sync_writes: bool,
}

impl std::fmt::Debug for FileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStore")
            .field("dir", &self.dir)
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl FileStore {
    /// Open (or create) the store in `dir` and replay its log
    pub fn open(dir: impl AsRef<Path>, sync_writes: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(LOG_FILE);

        let existing = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let scan = scan_records(&existing);

        if scan.has_torn_tail(existing.len()) {
            tracing::warn!(
                path = %path.display(),
                valid = scan.valid_len,
                discarded = existing.len() - scan.valid_len,
                "discarding torn tail of state log"
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(scan.valid_len as u64)?;
            file.sync_all()?;
        }

        let table = StateTable::default();
        let mut modules: Vec<(ContractId, Vec<u8>)> = Vec::new();
        let mut sequence = 0u64;
        let record_count = scan.records.len();

        for record in scan.records {
            match record {
                WalRecord::Deploy { id, code } => {
                    if !modules.iter().any(|(known, _)| *known == id) {
                        modules.push((id, code));
                    }
                }
                WalRecord::Commit {
                    sequence: seq,
                    batch,
                } => {
                    table.apply(&batch);
                    sequence = sequence.max(seq);
                }
                WalRecord::Checkpoint { id, snapshot } => table.restore(&id, snapshot),
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        tracing::info!(
            path = %path.display(),
            records = record_count,
            modules = modules.len(),
            "opened state log"
        );

        Ok(FileStore {
            dir,
            table,
            modules: RwLock::new(modules),
            log: Mutex::new(LogFile::new(file, scan.valid_len as u64, sequence)),
            sync_writes,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn append(&self, log: &mut LogFile, record: &WalRecord) -> Result<()> {
        let bytes = encode_record(record)?;
        log.append(&bytes, self.sync_writes)
    }

    /// Rewrite the log as one checkpoint per contract plus the deployed
    /// modules. Commits wait while compaction runs.
    pub fn compact(&self) -> Result<CompactionStats> {
        let mut log = self.log.lock();
        let bytes_before = log.len;

        let modules = self.modules.read().clone();
        let contract_ids = self.table.contract_ids();

        let tmp_path = self.dir.join(COMPACT_FILE);
        let mut tmp = File::create(&tmp_path)?;
        let mut bytes_after = 0u64;
        for (id, code) in &modules {
            let bytes = encode_record(&WalRecord::Deploy {
                id: *id,
                code: code.clone(),
            })?;
            tmp.write_all(&bytes)?;
            bytes_after += bytes.len() as u64;
        }
        for id in &contract_ids {
            let bytes = encode_record(&WalRecord::Checkpoint {
                id: *id,
                snapshot: self.table.snapshot(id),
            })?;
            tmp.write_all(&bytes)?;
            bytes_after += bytes.len() as u64;
        }
        tmp.sync_all()?;
        drop(tmp);

        // The append handle follows the file through the rename, so every
        // fallible step happens before the old log is replaced
        let file = match OpenOptions::new().append(true).open(&tmp_path) {
            Ok(file) => file,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e.into());
            }
        };
        if let Err(e) = fs::rename(&tmp_path, self.log_path()) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        let sequence = log.sequence;
        *log = LogFile::new(file, bytes_after, sequence);

        tracing::info!(
            modules = modules.len(),
            contracts = contract_ids.len(),
            bytes_before,
            bytes_after,
            "compacted state log"
        );

        Ok(CompactionStats {
            modules: modules.len(),
            contracts: contract_ids.len(),
            bytes_before,
            bytes_after,
        })
    }
}

impl StateStore for FileStore {
    fn read(&self, id: &ContractId, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.table.read(id, key))
    }

    fn snapshot(&self, id: &ContractId) -> Result<StateSnapshot> {
        Ok(self.table.snapshot(id))
    }

    fn commit(&self, batch: &CommitBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        // Holding the log lock across apply keeps log order == visibility order
        let mut log = self.log.lock();
        let sequence = log.sequence + 1;
        self.append(
            &mut log,
            &WalRecord::Commit {
                sequence,
                batch: batch.clone(),
            },
        )?;
        log.sequence = sequence;
        self.table.apply(batch);
        Ok(())
    }

    fn record_module(&self, id: &ContractId, code: &[u8]) -> Result<()> {
        let mut log = self.log.lock();
        if self.modules.read().iter().any(|(known, _)| known == id) {
            return Ok(());
        }
        self.append(
            &mut log,
            &WalRecord::Deploy {
                id: *id,
                code: code.to_vec(),
            },
        )?;
        self.modules.write().push((*id, code.to_vec()));
        Ok(())
    }

    fn modules(&self) -> Result<Vec<(ContractId, Vec<u8>)>> {
        Ok(self.modules.read().clone())
    }
}
