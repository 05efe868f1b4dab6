//! Persistent storage of subresource histories
//!
//! The history store is loaded once when it is first acquired and saved by
//! the periodic writer and on last release.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::PreconnectError;
use crate::url_history::UrlHistoryRecord;

/// Key-value storage of histories keyed by main host
pub trait HistoryStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<UrlHistoryRecord>, PreconnectError>;

    fn save_all(&self, records: &[UrlHistoryRecord]) -> Result<(), PreconnectError>;
}

/// Histories kept as one JSON document on disk
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl HistoryStore for JsonFileStore {
    fn load_all(&self) -> Result<Vec<UrlHistoryRecord>, PreconnectError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        if data.is_empty() {
            return Ok(Vec::new());
        }

        Ok(serde_json::from_slice(&data)?)
    }

    fn save_all(&self, records: &[UrlHistoryRecord]) -> Result<(), PreconnectError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let data = serde_json::to_vec(records)?;
        let tmp = self.temp_path();
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;

        tracing::debug!("Saved {} histories to {}", records.len(), self.path.display());
        Ok(())
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<Vec<UrlHistoryRecord>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<UrlHistoryRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            saves: AtomicUsize::new(0),
        }
    }

    /// Records of the last save
    pub fn records(&self) -> Vec<UrlHistoryRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Number of `save_all` calls so far
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl HistoryStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<UrlHistoryRecord>, PreconnectError> {
        Ok(self.records())
    }

    fn save_all(&self, records: &[UrlHistoryRecord]) -> Result<(), PreconnectError> {
        if let Ok(mut stored) = self.records.lock() {
            *stored = records.to_vec();
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
