//! Timing Store
//!
//! Recent per-suite durations, shared across runs, used to estimate how long
//! each suite will take. Observations are buffered during a run and written in
//! one batch by [`TimingStore::flush`].
//!
//! Keys have the form `timings-{prefix}-{run}-{suite}`; each key holds at most
//! [`KEEP`] durations, newest first.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Number of durations kept per key
pub const KEEP: usize = 10;

/// Errors raised by a timing backend
#[derive(Debug, Error)]
pub enum TimingError {
    #[error("Timing store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timing store at {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Timing backend unavailable: {0}")]
    Unavailable(String),
}

/// Storage behind a [`TimingStore`]
///
/// Modeled on a list-valued key/value server: values are pushed to the front
/// of a key and the key is trimmed to a fixed length.
pub trait TimingBackend: Send {
    /// Up to `limit` most recent values for `key`
    fn range(&mut self, key: &str, limit: usize) -> Result<Vec<f64>, TimingError>;

    /// Push `value` to the front of `key`, keeping only `keep` values
    fn push_trim(&mut self, key: &str, value: f64, keep: usize) -> Result<(), TimingError>;

    /// Make pushed values durable
    fn sync(&mut self) -> Result<(), TimingError>;

    /// Drop any cached connection state after a failure
    fn reset(&mut self);
}

/// Timing store with buffered writes
pub struct TimingStore {
    backend: Box<dyn TimingBackend>,
    prefix: String,
    pending: Vec<(String, f64)>,
}

impl TimingStore {
    /// Store over `backend`, using `prefix` in every key
    pub fn new(backend: Box<dyn TimingBackend>, prefix: impl Into<String>) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            pending: Vec::new(),
        }
    }

    /// In-memory store, mostly for tests
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryBackend::default()), "default")
    }

    /// Key under which durations for `suite` in `run` are kept
    pub fn key(&self, run: &str, suite: &str) -> String {
        format!("timings-{}-{}-{}", self.prefix, run, suite)
    }

    /// Mean of the recent durations for `suite` in `run`, in seconds; 0 if unknown.
    pub fn fetch(&mut self, run: &str, suite: &str) -> f64 {
        let key = self.key(run, suite);
        match self.backend.range(&key, KEEP) {
            Ok(values) if values.is_empty() => 0.0,
            Ok(values) => values.iter().sum::<f64>() / values.len() as f64,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "timing lookup failed");
                self.backend.reset();
                0.0
            }
        }
    }

    /// Buffer one observation until the next flush.
    pub fn record(&mut self, run: &str, suite: &str, duration: Duration) {
        let key = self.key(run, suite);
        self.pending.push((key, duration.as_secs_f64()));
    }

    /// Number of buffered observations
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Write buffered observations. Returns how many were stored.
    ///
    /// A failing key is logged and skipped; the backend is reset and the rest
    /// of the batch continues.
    pub fn flush(&mut self) -> usize {
        let mut written = 0;
        for (key, value) in std::mem::take(&mut self.pending) {
            match self.backend.push_trim(&key, value, KEEP) {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "dropping timing observation");
                    self.backend.reset();
                }
            }
        }

        if let Err(e) = self.backend.sync() {
            tracing::warn!(error = %e, "failed to persist timings");
            self.backend.reset();
            return 0;
        }

        tracing::debug!(written, "timings flushed");
        written
    }
}

type Table = BTreeMap<String, VecDeque<f64>>;

/// Non-durable backend
#[derive(Debug, Default)]
pub struct MemoryBackend {
    table: Table,
}

impl TimingBackend for MemoryBackend {
    fn range(&mut self, key: &str, limit: usize) -> Result<Vec<f64>, TimingError> {
        Ok(self
            .table
            .get(key)
            .map(|values| values.iter().take(limit).copied().collect())
            .unwrap_or_default())
    }

    fn push_trim(&mut self, key: &str, value: f64, keep: usize) -> Result<(), TimingError> {
        push_front_trimmed(&mut self.table, key, value, keep);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), TimingError> {
        Ok(())
    }

    fn reset(&mut self) {}
}

#[derive(Deserialize)]
struct TimingFile {
    keys: Table,
}

#[derive(Serialize)]
struct TimingFileRef<'a> {
    keys: &'a Table,
}

/// JSON file backend, shared by every run that points at the same path.
///
/// Reads come from a copy of the file loaded on first use. Pushes are queued
/// and replayed onto a fresh read of the file at sync, which then replaces it
/// atomically; concurrent runs only race on the keys they both push to.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    cache: Option<Table>,
    queued: Vec<(String, f64, usize)>,
}

impl FileBackend {
    /// Backend for the file at `path` (created on first sync)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: None,
            queued: Vec::new(),
        }
    }

    /// Path of the timing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Pushes not yet written to the file
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    fn load(&self) -> Result<Table, TimingError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Table::new()),
            Err(source) => {
                return Err(TimingError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        let file: TimingFile =
            serde_json::from_str(&content).map_err(|source| TimingError::Corrupt {
                path: self.path.clone(),
                source,
            })?;
        Ok(file.keys)
    }

    fn io_error(&self, source: std::io::Error) -> TimingError {
        TimingError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn push_front_trimmed(table: &mut Table, key: &str, value: f64, keep: usize) {
    let values = table.entry(key.to_string()).or_default();
    values.push_front(value);
    values.truncate(keep);
}

impl TimingBackend for FileBackend {
    fn range(&mut self, key: &str, limit: usize) -> Result<Vec<f64>, TimingError> {
        if self.cache.is_none() {
            let mut table = self.load()?;
            for (key, value, keep) in &self.queued {
                push_front_trimmed(&mut table, key, *value, *keep);
            }
            self.cache = Some(table);
        }
        Ok(self
            .cache
            .as_ref()
            .and_then(|table| table.get(key))
            .map(|values| values.iter().take(limit).copied().collect())
            .unwrap_or_default())
    }

    fn push_trim(&mut self, key: &str, value: f64, keep: usize) -> Result<(), TimingError> {
        if let Some(table) = self.cache.as_mut() {
            push_front_trimmed(table, key, value, keep);
        }
        self.queued.push((key.to_string(), value, keep));
        Ok(())
    }

    fn sync(&mut self) -> Result<(), TimingError> {
        if self.queued.is_empty() {
            return Ok(());
        }

        // Start from what other runs have written since we last looked
        let mut table = self.load()?;
        for (key, value, keep) in &self.queued {
            push_front_trimmed(&mut table, key, *value, *keep);
        }

        let json = serde_json::to_string_pretty(&TimingFileRef { keys: &table }).map_err(
            |source| TimingError::Corrupt {
                path: self.path.clone(),
                source,
            },
        )?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let tmp = self
            .path
            .with_extension(format!("json.{}.tmp", std::process::id()));
        std::fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))?;

        self.queued.clear();
        self.cache = Some(table);
        Ok(())
    }

    /// Drops the cached copy; queued pushes survive and go out on the next sync.
    fn reset(&mut self) {
        self.cache = None;
    }
}
