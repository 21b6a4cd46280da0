//! Storage backends for cached replies.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheKey;
use crate::types::Reply;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One stored reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Canonical text of the key, kept to detect digest collisions on disk.
    pub key: String,
    pub created_at: SystemTime,
    pub value: Reply,
}

impl CacheEntry {
    pub fn new(key: &CacheKey, value: Reply) -> Self {
        Self {
            key: key.as_str().to_string(),
            created_at: SystemTime::now(),
            value,
        }
    }
}

/// A keyed table of cache entries. Entries are overwritten, never swept.
pub trait CacheStore: Send + Sync + fmt::Debug {
    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;
    fn save(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError>;
}

static DEFAULT_TABLE: Lazy<MemoryStore> = Lazy::new(MemoryStore::new);
static NAMED_TABLES: Lazy<Mutex<HashMap<String, MemoryStore>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// In-memory table. Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    table: Arc<Mutex<HashMap<CacheKey, CacheEntry>>>,
}

impl MemoryStore {
    /// A fresh table private to this store and its clones.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide default table.
    pub fn global() -> Self {
        DEFAULT_TABLE.clone()
    }

    /// The process-wide table registered under `name`, created on first use.
    pub fn named(name: &str) -> Self {
        NAMED_TABLES.lock().entry(name.to_string()).or_default().clone()
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    pub fn clear(&self) {
        self.table.lock().clear();
    }
}

impl CacheStore for MemoryStore {
    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.table.lock().get(key).cloned())
    }

    fn save(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        self.table.lock().insert(key.clone(), entry);
        Ok(())
    }
}

/// One JSON file per key under a directory.
///
/// Files are named by the SHA-256 digest of the key and replaced atomically
/// (temp file + rename). Expiry is judged from the `created_at` timestamp
/// stored inside the file, not from the file's modification time.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File that holds the entry for `key`.
    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.root.join(format!("{}.json", key.digest()))
    }
}

impl CacheStore for DirStore {
    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let bytes = match std::fs::read(self.path_for(key)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry = serde_json::from_slice(&bytes)?;
        Ok((entry.key == key.as_str()).then_some(entry))
    }

    fn save(&self, key: &CacheKey, entry: CacheEntry) -> Result<(), CacheError> {
        std::fs::create_dir_all(&self.root)?;
        let mut file = tempfile::NamedTempFile::new_in(&self.root)?;
        serde_json::to_writer(&mut file, &entry)?;
        file.flush()?;
        file.persist(self.path_for(key)).map_err(|e| e.error)?;
        Ok(())
    }
}
