//! Persistent process records
//!
//! Records are kept in memory and written out as a single rkyv snapshot on
//! every change, so a restarted daemon can tell which processes vanished
//! while it was down. Exited records are kept up to
//! [`FINISHED_RECORD_LIMIT`], oldest dropped first. An unreadable snapshot is
//! moved aside to `processes.bin.corrupt` and the store starts empty.

use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};

pub const SNAPSHOT_FILE: &str = "processes.bin";

/// Exited records retained per store
pub const FINISHED_RECORD_LIMIT: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt process snapshot: {0}")]
    Corrupt(String),

    #[error("Failed to encode process snapshot: {0}")]
    Encode(String),
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum RecordStatus {
    Running,
    Exited,
    AbnormalExit,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::AbnormalExit => "abnormal_exit",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct ProcessRecord {
    pub id: String,
    pub pid: Option<u32>,
    pub command: Vec<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    /// Unix milliseconds
    pub start_time: u64,
    pub end_time: Option<u64>,
    pub status: RecordStatus,
    pub exit_code: Option<i32>,
    pub creator_id: Option<String>,
    pub memory_limit_mb: Option<u64>,
    pub cpu_limit_secs: Option<u64>,
    pub sandboxed: bool,
}

impl ProcessRecord {
    /// Move to a terminal status. A record that already ended is left alone.
    pub fn finish(&mut self, status: RecordStatus, exit_code: Option<i32>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.exit_code = exit_code;
        self.end_time = Some(now_millis());
        true
    }
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Insert `record` unless a newer run of the same id is already stored, then
/// drop the oldest finished records past the limit.
fn upsert(records: &mut BTreeMap<String, ProcessRecord>, record: &ProcessRecord) -> bool {
    if records
        .get(&record.id)
        .is_some_and(|existing| existing.start_time > record.start_time)
    {
        trace!(id = %record.id, "Ignoring record from an earlier run");
        return false;
    }
    records.insert(record.id.clone(), record.clone());

    let mut finished: Vec<(u64, String)> = records
        .values()
        .filter(|r| r.status.is_terminal())
        .map(|r| (r.end_time.unwrap_or(0), r.id.clone()))
        .collect();
    if finished.len() > FINISHED_RECORD_LIMIT {
        finished.sort();
        let excess = finished.len() - FINISHED_RECORD_LIMIT;
        for (_, id) in finished.into_iter().take(excess) {
            records.remove(&id);
        }
    }
    true
}

pub trait ProcessStore: Send + Sync {
    /// Insert or replace the record with the same id. A record whose
    /// `start_time` is older than the stored one is ignored.
    fn save(&self, record: &ProcessRecord) -> Result<(), StoreError>;

    fn load(&self) -> Result<Vec<ProcessRecord>, StoreError>;
}

/// Store backed by one snapshot file, replaced atomically on each save
pub struct FileProcessStore {
    path: PathBuf,
    records: Mutex<Option<BTreeMap<String, ProcessRecord>>>,
}

impl FileProcessStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            records: Mutex::new(None),
        }
    }

    /// Store at `<dir>/processes.bin`
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SNAPSHOT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_snapshot(&self) -> Result<BTreeMap<String, ProcessRecord>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!("No process snapshot at {}", self.path.display());
                return Ok(BTreeMap::new());
            }
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut aligned = rkyv::util::AlignedVec::<16>::new();
        aligned.extend_from_slice(&bytes);
        let records = rkyv::from_bytes::<Vec<ProcessRecord>, rkyv::rancor::Error>(&aligned)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        Ok(records.into_iter().map(|r| (r.id.clone(), r)).collect())
    }

    /// Read the snapshot, quarantining it when it cannot be decoded
    fn open_snapshot(&self) -> Result<BTreeMap<String, ProcessRecord>, StoreError> {
        match self.read_snapshot() {
            Err(StoreError::Corrupt(reason)) => {
                let aside = self.path.with_extension("bin.corrupt");
                warn!(
                    "Process snapshot {} is unreadable ({}), moving it to {}",
                    self.path.display(),
                    reason,
                    aside.display()
                );
                std::fs::rename(&self.path, &aside).map_err(|source| StoreError::Io {
                    path: self.path.clone(),
                    source,
                })?;
                Ok(BTreeMap::new())
            }
            other => other,
        }
    }

    fn write_snapshot(&self, records: &BTreeMap<String, ProcessRecord>) -> Result<(), StoreError> {
        let list: Vec<ProcessRecord> = records.values().cloned().collect();
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&list)
            .map_err(|e| StoreError::Encode(e.to_string()))?;

        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("bin.tmp");
        std::fs::write(&tmp, &bytes).map_err(io_err)?;
        std::fs::rename(&tmp, &self.path).map_err(io_err)?;

        debug!(
            "Wrote {} process records to {}",
            list.len(),
            self.path.display()
        );
        Ok(())
    }
}

impl ProcessStore for FileProcessStore {
    fn save(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        let mut guard = self.records.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            *guard = Some(self.open_snapshot()?);
        }
        let Some(records) = guard.as_mut() else {
            return Ok(());
        };
        if !upsert(records, record) {
            return Ok(());
        }
        self.write_snapshot(records)
    }

    fn load(&self) -> Result<Vec<ProcessRecord>, StoreError> {
        let mut guard = self.records.lock().unwrap_or_else(|e| e.into_inner());
        let records = self.open_snapshot()?;
        let list = records.values().cloned().collect();
        *guard = Some(records);
        Ok(list)
    }
}

#[derive(Default)]
pub struct MemoryProcessStore {
    records: Mutex<BTreeMap<String, ProcessRecord>>,
}

impl MemoryProcessStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<ProcessRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }
}

impl ProcessStore for MemoryProcessStore {
    fn save(&self, record: &ProcessRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        upsert(&mut records, record);
        Ok(())
    }

    fn load(&self) -> Result<Vec<ProcessRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }
}
