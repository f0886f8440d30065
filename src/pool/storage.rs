//! Pool document stored in a JSON file guarded by advisory locks.
//!
//! Every read for mutation and every write happens inside a [`LockedFile`]
//! guard: shared lock for a plain load, exclusive lock for read-modify-write.
//! The lock is released when the guard drops, whatever the exit path.

use crate::error::PoolError;
use crate::server::Server;

use rustix::fs::{flock, FlockOperation};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Contents of a pool file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, deserialize_with = "pool_field")]
    pub pool: Vec<Server>,
    #[serde(default, deserialize_with = "meta_field")]
    pub meta: Map<String, Value>,
}

impl Document {
    pub fn position(&self, key: &str) -> Option<usize> {
        self.pool.iter().position(|s| s.key() == key)
    }

    /// Merge `servers` by key: an existing entry is replaced in place, a new
    /// key is appended. Returns how many keys were new.
    pub fn merge(&mut self, servers: impl IntoIterator<Item = Server>) -> usize {
        let mut index: HashMap<String, usize> = self
            .pool
            .iter()
            .enumerate()
            .map(|(idx, s)| (s.key(), idx))
            .collect();

        let mut added = 0;
        for server in servers {
            match index.entry(server.key()) {
                Entry::Occupied(slot) => self.pool[*slot.get()] = server,
                Entry::Vacant(slot) => {
                    slot.insert(self.pool.len());
                    self.pool.push(server);
                    added += 1;
                }
            }
        }
        added
    }
}

fn pool_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Server>, D::Error> {
    let entries = match Value::deserialize(deserializer)? {
        Value::Null => return Ok(Vec::new()),
        Value::Array(items) => items,
        // Keyed form: {"ip:port": {...}, ...}
        Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
        other => return Err(de::Error::custom(format!("pool must be a list, got {other}"))),
    };

    let servers = entries
        .into_iter()
        .map(serde_json::from_value::<Server>)
        .collect::<Result<Vec<_>, _>>()
        .map_err(de::Error::custom)?;

    let mut doc = Document::default();
    doc.merge(servers);
    Ok(doc.pool)
}

fn meta_field<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Map<String, Value>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        Value::Array(items) if items.is_empty() => Ok(Map::new()),
        other => Err(de::Error::custom(format!("meta must be an object, got {other}"))),
    }
}

/// Path of a pool file plus the operations that lock it.
#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
}

impl Storage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the file if needed and write an empty document into it.
    ///
    /// Returns `true` if this call initialised the file, `false` if another
    /// writer got there first.
    pub fn initialize(&self) -> Result<bool, PoolError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| self.unavailable(e))?;
        let mut locked = LockedFile::lock(file, &self.path, FlockOperation::LockExclusive)?;

        let len = locked.file.metadata().map_err(|e| self.unavailable(e))?.len();
        if len > 0 {
            return Ok(false);
        }
        locked.write(&mut Document::default())?;
        Ok(true)
    }

    /// Acquire a shared lock for reading.
    pub fn lock_shared(&self) -> Result<LockedFile<'_>, PoolError> {
        let file = File::open(&self.path).map_err(|e| self.unavailable(e))?;
        LockedFile::lock(file, &self.path, FlockOperation::LockShared)
    }

    /// Acquire an exclusive lock for a read-modify-write cycle.
    pub fn lock_exclusive(&self) -> Result<LockedFile<'_>, PoolError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| self.unavailable(e))?;
        LockedFile::lock(file, &self.path, FlockOperation::LockExclusive)
    }

    /// Load the document under a shared lock.
    pub fn load(&self) -> Result<Document, PoolError> {
        self.lock_shared()?.read()
    }

    /// Run `op` on the blocking thread pool, so waiting for a lock held by
    /// another process never stalls the async executor.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T, PoolError>
    where
        F: FnOnce(&Storage) -> Result<T, PoolError> + Send + 'static,
        T: Send + 'static,
    {
        let storage = self.clone();
        tokio::task::spawn_blocking(move || op(&storage))
            .await
            .map_err(|e| self.unavailable(io::Error::other(e)))?
    }

    fn unavailable(&self, source: io::Error) -> PoolError {
        PoolError::StorageUnavailable {
            path: self.path.clone(),
            source,
        }
    }
}

/// An open pool file holding a lock until dropped.
pub struct LockedFile<'a> {
    file: File,
    path: &'a Path,
}

impl<'a> LockedFile<'a> {
    fn lock(file: File, path: &'a Path, operation: FlockOperation) -> Result<Self, PoolError> {
        flock(&file, operation).map_err(|errno| PoolError::StorageUnavailable {
            path: path.to_path_buf(),
            source: io::Error::from(errno),
        })?;
        Ok(Self { file, path })
    }

    /// Read and decode the whole file. A zero-length file is an empty document.
    pub fn read(&mut self) -> Result<Document, PoolError> {
        let mut contents = Vec::new();
        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.read_to_end(&mut contents))
            .map_err(|e| self.unavailable(e))?;

        if contents.iter().all(u8::is_ascii_whitespace) {
            return Ok(Document::default());
        }

        serde_json::from_slice(&contents).map_err(|source| PoolError::CorruptState {
            path: self.path.to_path_buf(),
            bytes: contents.len(),
            source,
        })
    }

    /// Replace the file contents with `doc`, stamping `meta.modified`.
    pub fn write(&mut self, doc: &mut Document) -> Result<(), PoolError> {
        doc.meta.insert(
            "modified".to_string(),
            Value::from(chrono::Utc::now().timestamp()),
        );
        let bytes = serde_json::to_vec_pretty(doc)
            .map_err(|e| self.unavailable(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        self.file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.set_len(0))
            .and_then(|_| self.file.write_all(&bytes))
            .and_then(|_| self.file.flush())
            .map_err(|e| self.unavailable(e))
    }

    fn unavailable(&self, source: io::Error) -> PoolError {
        PoolError::StorageUnavailable {
            path: self.path.to_path_buf(),
            source,
        }
    }
}

impl Drop for LockedFile<'_> {
    fn drop(&mut self) {
        let _ = flock(&self.file, FlockOperation::Unlock);
    }
}
