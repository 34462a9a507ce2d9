//! Buffer for database writes made while the system is DEGRADED.
//!
//! Writes that would normally hit the DB synchronously are held in memory
//! and appended to an on-disk WAL so a crash cannot lose intent. Limits:
//! - entry cap and byte cap; bytes are the serialized `data` payload,
//!   measured once at insertion (memory explosion protection)
//! - `idempotent_key` is the dedup identity: duplicate adds succeed
//!   without recording twice, and WAL replay skips duplicates
//! - restore is purely local: no DB calls, no events
//! - flush is all-or-nothing through the sink; failure retains the WAL

use std::collections::{BTreeMap, HashSet};
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::ResilienceConfig;

/// A single buffered write. `idempotent_key` must be
/// `{resource_type}:{resource_id}:{seq}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferEntry {
    pub resource_type: String,
    pub resource_id: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub idempotent_key: String,
}

impl BufferEntry {
    pub fn new(
        resource_type: &str,
        resource_id: &str,
        data: serde_json::Value,
        seq: u64,
    ) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            data,
            timestamp: Utc::now(),
            idempotent_key: format!("{resource_type}:{resource_id}:{seq}"),
        }
    }
}

/// Destination for a flush: one call receives every buffered entry grouped
/// by resource type and must apply them atomically.
#[async_trait]
pub trait BufferSink: Send + Sync {
    async fn apply(&self, groups: &BTreeMap<String, Vec<BufferEntry>>) -> Result<()>;
}

struct BufferInner {
    entries: Vec<BufferEntry>,
    idempotent_keys: HashSet<String>,
    byte_count: usize,
}

pub struct DbBuffer {
    max_entries: usize,
    max_bytes: usize,
    wal_path: Option<PathBuf>,
    inner: Mutex<BufferInner>,
}

impl DbBuffer {
    /// Construct the buffer, restoring any existing WAL at `wal_path`.
    /// Restore only rebuilds local state; it never touches the DB.
    pub fn new(config: &ResilienceConfig, wal_path: Option<PathBuf>) -> Self {
        let buffer = Self {
            max_entries: config.db_buffer_max_entries,
            max_bytes: config.db_buffer_max_bytes,
            wal_path,
            inner: Mutex::new(BufferInner {
                entries: Vec::new(),
                idempotent_keys: HashSet::new(),
                byte_count: 0,
            }),
        };
        buffer.restore_from_wal();
        buffer
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Serialized payload bytes currently held.
    pub fn byte_count(&self) -> usize {
        self.inner.lock().byte_count
    }

    /// Add an entry. Returns false when the buffer is full (entry or byte
    /// cap); the caller is expected to emit DB_BUFFER_OVERFLOW. A duplicate
    /// idempotent key returns true without recording or touching the WAL.
    pub fn add(&self, entry: BufferEntry) -> bool {
        let serialized = match serde_json::to_string(&entry.data) {
            Ok(s) => s,
            Err(e) => {
                error!(key = entry.idempotent_key.as_str(), "Unserializable buffer entry: {e}");
                return false;
            }
        };
        let entry_bytes = serialized.len();

        {
            let mut inner = self.inner.lock();

            if inner.idempotent_keys.contains(&entry.idempotent_key) {
                debug!(key = entry.idempotent_key.as_str(), "Duplicate idempotent key");
                return true;
            }

            if inner.entries.len() >= self.max_entries {
                warn!(max_entries = self.max_entries, "DB buffer full (entries)");
                return false;
            }
            if inner.byte_count + entry_bytes > self.max_bytes {
                warn!(
                    max_bytes = self.max_bytes,
                    current = inner.byte_count,
                    new_entry = entry_bytes,
                    "DB buffer full (bytes)"
                );
                return false;
            }

            inner.idempotent_keys.insert(entry.idempotent_key.clone());
            inner.entries.push(entry.clone());
            inner.byte_count += entry_bytes;

            debug!(
                key = entry.idempotent_key.as_str(),
                entries = inner.entries.len(),
                bytes = inner.byte_count,
                "Buffered degraded write"
            );
        }

        self.append_wal(&entry);
        true
    }

    /// Drain every entry into the sink, grouped by resource type. On
    /// success the flushed entries are removed and the WAL rewritten to
    /// whatever arrived during the flush; on failure nothing is removed and
    /// the WAL is retained.
    pub async fn flush_to_db(&self, sink: &dyn BufferSink) -> Result<usize> {
        let snapshot: Vec<BufferEntry> = self.inner.lock().entries.clone();
        if snapshot.is_empty() {
            return Ok(0);
        }

        let mut groups: BTreeMap<String, Vec<BufferEntry>> = BTreeMap::new();
        for entry in &snapshot {
            groups
                .entry(entry.resource_type.clone())
                .or_default()
                .push(entry.clone());
        }

        info!(count = snapshot.len(), "Flushing DB buffer");
        sink.apply(&groups)
            .await
            .context("DB buffer flush failed; entries and WAL retained")?;

        let flushed: HashSet<&str> = snapshot
            .iter()
            .map(|e| e.idempotent_key.as_str())
            .collect();

        let remaining: Vec<BufferEntry> = {
            let mut inner = self.inner.lock();
            let remaining: Vec<BufferEntry> = inner
                .entries
                .iter()
                .filter(|e| !flushed.contains(e.idempotent_key.as_str()))
                .cloned()
                .collect();
            inner.entries = remaining.clone();
            inner.idempotent_keys = remaining
                .iter()
                .map(|e| e.idempotent_key.clone())
                .collect();
            inner.byte_count = remaining
                .iter()
                .map(|e| {
                    serde_json::to_string(&e.data)
                        .map(|s| s.len())
                        .unwrap_or(0)
                })
                .sum();
            remaining
        };

        self.rewrite_wal(&remaining);
        Ok(snapshot.len())
    }

    fn append_wal(&self, entry: &BufferEntry) {
        let Some(path) = &self.wal_path else {
            return;
        };
        let result = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(path)?;
            let line = serde_json::to_string(entry)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            writeln!(file, "{line}")?;
            // Buffered intent must survive a crash.
            file.sync_data()
        })();
        if let Err(e) = result {
            error!("Failed to write WAL: {e}");
        }
    }

    fn restore_from_wal(&self) {
        let Some(path) = &self.wal_path else {
            return;
        };
        if !path.exists() {
            return;
        }

        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                error!("Failed to read WAL: {e}");
                return;
            }
        };

        let mut inner = self.inner.lock();
        let mut restored = 0usize;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: BufferEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping invalid WAL entry: {e}");
                    continue;
                }
            };
            if inner.idempotent_keys.contains(&entry.idempotent_key) {
                continue;
            }
            let entry_bytes = serde_json::to_string(&entry.data)
                .map(|s| s.len())
                .unwrap_or(0);
            inner.idempotent_keys.insert(entry.idempotent_key.clone());
            inner.entries.push(entry);
            inner.byte_count += entry_bytes;
            restored += 1;
        }

        if restored > 0 {
            info!(
                entries = restored,
                bytes = inner.byte_count,
                "Restored DB buffer from WAL"
            );
        }
    }

    fn rewrite_wal(&self, remaining: &[BufferEntry]) {
        let Some(path) = &self.wal_path else {
            return;
        };
        let result = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(path)?;
            for entry in remaining {
                let line = serde_json::to_string(entry)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                writeln!(file, "{line}")?;
            }
            file.sync_data()
        })();
        if let Err(e) = result {
            error!("Failed to rewrite WAL: {e}");
        }
    }
}
