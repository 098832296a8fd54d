//! Durable Raft log.
//!
//! An append-only file of length-prefixed bincode records (u32 big-endian
//! length + encoded [`LogEntry`]), fsynced before any acknowledgement that
//! depends on the appended entries, mirrored in a `BTreeMap` for reads.
//! Truncation (conflict resolution on followers) rewrites the retained
//! prefix; it is rare and small, so the simple path wins.
//!
//! Recovery tolerates a torn tail: a partial record at the end of the file
//! is discarded and the file is truncated to the last complete record.

use crate::error::Result;
use crate::types::{LogEntry, LogIndex, Term};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "log";

/// What recovery found on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryInfo {
    /// Complete entries reloaded from disk.
    pub entries_recovered: usize,
    /// Whether a torn tail record was discarded.
    pub tail_discarded: bool,
}

struct LogInner {
    file: File,
    entries: BTreeMap<LogIndex, LogEntry>,
}

/// Append-only replicated log storage.
pub struct RaftLog {
    path: PathBuf,
    inner: RwLock<LogInner>,
}

impl RaftLog {
    /// Open (or create) the log under `dir`, replaying all records.
    pub fn open(dir: impl AsRef<Path>) -> Result<(Self, RecoveryInfo)> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let mut raw = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut raw)?;

        let mut entries = BTreeMap::new();
        let mut offset = 0usize;
        let mut valid_end = 0usize;
        let mut tail_discarded = false;

        while offset + 4 <= raw.len() {
            let len = u32::from_be_bytes(raw[offset..offset + 4].try_into().unwrap()) as usize;
            if offset + 4 + len > raw.len() {
                break;
            }
            match bincode::deserialize::<LogEntry>(&raw[offset + 4..offset + 4 + len]) {
                Ok(entry) => {
                    entries.insert(entry.index, entry);
                    offset += 4 + len;
                    valid_end = offset;
                }
                Err(e) => {
                    tracing::warn!(error = %e, offset, "discarding corrupt log tail");
                    break;
                }
            }
        }
        if valid_end < raw.len() {
            tail_discarded = true;
        }

        if tail_discarded {
            file.set_len(valid_end as u64)?;
            file.sync_data()?;
            file.seek(SeekFrom::End(0))?;
        }

        let info = RecoveryInfo {
            entries_recovered: entries.len(),
            tail_discarded,
        };

        Ok((
            Self {
                path,
                inner: RwLock::new(LogInner { file, entries }),
            },
            info,
        ))
    }

    /// Append one entry and fsync.
    pub fn append(&self, entry: LogEntry) -> Result<()> {
        self.append_batch(vec![entry])
    }

    /// Append a batch of entries with a single fsync.
    pub fn append_batch(&self, entries: Vec<LogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut inner = self.inner.write();
        let mut buf = Vec::new();
        for entry in &entries {
            let body = bincode::serialize(entry)?;
            buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
            buf.extend_from_slice(&body);
        }
        inner.file.write_all(&buf)?;
        inner.file.sync_data()?;

        for entry in entries {
            inner.entries.insert(entry.index, entry);
        }
        Ok(())
    }

    /// Entry at `index`, if present.
    pub fn get(&self, index: LogIndex) -> Option<LogEntry> {
        self.inner.read().entries.get(&index).cloned()
    }

    /// Entries in `[from, to)`.
    pub fn get_range(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        self.inner
            .read()
            .entries
            .range(from..to)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Index of the last entry (ZERO when empty).
    pub fn last_index(&self) -> LogIndex {
        self.inner
            .read()
            .entries
            .keys()
            .next_back()
            .copied()
            .unwrap_or(LogIndex::ZERO)
    }

    /// Term of the last entry (ZERO when empty).
    pub fn last_term(&self) -> Term {
        self.inner
            .read()
            .entries
            .values()
            .next_back()
            .map(|e| e.term)
            .unwrap_or(Term::ZERO)
    }

    /// Term of the entry at `index`; ZERO for the sentinel index.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == LogIndex::ZERO {
            return Some(Term::ZERO);
        }
        self.inner.read().entries.get(&index).map(|e| e.term)
    }

    /// Drop every entry at `from` and beyond, rewriting the file.
    ///
    /// Used by followers to discard a conflicting suffix. A leader never
    /// calls this on its own entries.
    pub fn truncate(&self, from: LogIndex) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.entries.range(from..).next().is_none() {
            return Ok(());
        }

        inner.entries.split_off(&from);

        let mut buf = Vec::new();
        for entry in inner.entries.values() {
            let body = bincode::serialize(entry)?;
            buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
            buf.extend_from_slice(&body);
        }

        // Rewrite via tmp + rename so a crash mid-truncate cannot lose the
        // retained prefix.
        let tmp = self.path.with_extension("tmp");
        {
            let mut tmp_file = File::create(&tmp)?;
            tmp_file.write_all(&buf)?;
            tmp_file.sync_data()?;
        }
        std::fs::rename(&tmp, &self.path)?;

        inner.file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        inner.file.sync_data()?;
        Ok(())
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

impl std::fmt::Debug for RaftLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RaftLog")
            .field("path", &self.path)
            .field("len", &self.len())
            .finish()
    }
}
