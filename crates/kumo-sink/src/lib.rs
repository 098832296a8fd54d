//! kumo-sink: the durable key-value sink behind the queue and cache
//! services.
//!
//! The services need only four operations with per-key atomicity: put, get,
//! delete, and prefix scan. Anything that can honor that contract can back
//! the sink; this crate ships an in-memory table for tests and a flat-file
//! directory store for single-node durability.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, SinkError>;

/// Durable key-value sink with per-key atomicity.
///
/// No cross-key transactions, no ordering guarantees between keys. Keys are
/// flat strings; callers namespace with prefixes (`queue/...`, `cache/...`).
pub trait KvSink: Send + Sync {
    fn put(&self, key: &str, value: Bytes) -> Result<()>;
    fn get(&self, key: &str) -> Result<Option<Bytes>>;
    fn delete(&self, key: &str) -> Result<()>;
    /// All `(key, value)` pairs whose key starts with `prefix`, key-ordered.
    fn scan(&self, prefix: &str) -> Result<Vec<(String, Bytes)>>;
}

/// In-memory sink for tests and volatile deployments.
#[derive(Default)]
pub struct MemorySink {
    entries: RwLock<BTreeMap<String, Bytes>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvSink for MemorySink {
    fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// File-per-key sink under a directory.
///
/// Each key maps to one file; writes go through tmp + rename so a crash
/// leaves either the old or the new value. Key segments are percent-escaped
/// so arbitrary key strings stay within one directory level.
pub struct DirSink {
    root: PathBuf,
}

impl DirSink {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn file_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() {
            return Err(SinkError::InvalidKey("empty key".to_string()));
        }
        Ok(self.root.join(escape_key(key)))
    }
}

impl KvSink for DirSink {
    fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let path = self.file_for(key)?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&value)?;
            file.sync_data()?;
        }
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match std::fs::read(self.file_for(key)?) {
            Ok(raw) => Ok(Some(Bytes::from(raw))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        match std::fs::remove_file(self.file_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn scan(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(".tmp") {
                continue;
            }
            let Some(key) = unescape_key(name) else {
                continue;
            };
            if key.starts_with(prefix) {
                let raw = std::fs::read(entry.path())?;
                out.push((key, Bytes::from(raw)));
            }
        }
        out.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(out)
    }
}

/// Escape a key into a single safe file name.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for b in key.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' | b'.' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02x}")),
        }
    }
    out
}

fn unescape_key(name: &str) -> Option<String> {
    let mut out = Vec::with_capacity(name.len());
    let bytes = name.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(sink: &dyn KvSink) {
        sink.put("queue/m1", Bytes::from("a")).unwrap();
        sink.put("queue/m2", Bytes::from("b")).unwrap();
        sink.put("cache/k1", Bytes::from("c")).unwrap();

        assert_eq!(sink.get("queue/m1").unwrap(), Some(Bytes::from("a")));
        assert_eq!(sink.get("missing").unwrap(), None);

        let queue_entries = sink.scan("queue/").unwrap();
        assert_eq!(queue_entries.len(), 2);
        assert_eq!(queue_entries[0].0, "queue/m1");
        assert_eq!(queue_entries[1].0, "queue/m2");

        sink.delete("queue/m1").unwrap();
        assert_eq!(sink.get("queue/m1").unwrap(), None);
        // Deleting a missing key is a no-op.
        sink.delete("queue/m1").unwrap();

        // Overwrite keeps the latest value.
        sink.put("cache/k1", Bytes::from("c2")).unwrap();
        assert_eq!(sink.get("cache/k1").unwrap(), Some(Bytes::from("c2")));
    }

    #[test]
    fn memory_sink_contract() {
        let sink = MemorySink::new();
        exercise(&sink);
    }

    #[test]
    fn dir_sink_contract() {
        let dir = TempDir::new().unwrap();
        let sink = DirSink::open(dir.path()).unwrap();
        exercise(&sink);
    }

    #[test]
    fn dir_sink_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let sink = DirSink::open(dir.path()).unwrap();
            sink.put("queue/m1", Bytes::from("payload")).unwrap();
        }
        let sink = DirSink::open(dir.path()).unwrap();
        assert_eq!(sink.get("queue/m1").unwrap(), Some(Bytes::from("payload")));
        assert_eq!(sink.scan("queue/").unwrap().len(), 1);
    }

    #[test]
    fn key_escaping_round_trips() {
        let key = "queue/orders:42 weird/键";
        assert_eq!(unescape_key(&escape_key(key)), Some(key.to_string()));
    }

    #[test]
    fn empty_key_rejected() {
        let dir = TempDir::new().unwrap();
        let sink = DirSink::open(dir.path()).unwrap();
        assert!(matches!(
            sink.put("", Bytes::new()),
            Err(SinkError::InvalidKey(_))
        ));
    }
}
