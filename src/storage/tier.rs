//! Persistence tier boundary
//!
//! The segment store writes frozen segments, segment directories and the
//! existence map through a [`PersistenceTier`]. Two implementations ship:
//!
//! - [`MemoryTier`]: an in-process map, for tests and the stand-in cluster
//! - [`FileTier`]: one file per key under a root directory
//!
//! File record layout:
//! ```text
//! ┌────────────┬──────────────────────┬────────────┐
//! │ flags: u8  │ payload (lz4 if set) │ crc32: u32 │
//! └────────────┴──────────────────────┴────────────┘
//! ```

use crate::storage::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Key/value store holding persisted blobs
pub trait PersistenceTier: Send + Sync + std::fmt::Debug {
    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Remove a key; removing an absent key is not an error
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// All keys beginning with `prefix`, sorted
    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// In-memory persistence tier
#[derive(Debug, Default)]
pub struct MemoryTier {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryTier {
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

impl PersistenceTier for MemoryTier {
    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

const FLAG_LZ4: u8 = 0x01;
const BLOB_SUFFIX: &str = ".blob";

/// File-per-key persistence tier
#[derive(Debug)]
pub struct FileTier {
    root: PathBuf,
    compress: bool,
}

impl FileTier {
    /// Open (creating if needed) a tier rooted at `root`
    pub fn open(root: impl Into<PathBuf>, compress: bool) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, compress })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
            return Err(StorageError::Serialization(format!("invalid tier key '{}'", key)));
        }
        let mut path = self.root.clone();
        path.extend(key.split('/'));
        let mut file = path.into_os_string();
        file.push(BLOB_SUFFIX);
        Ok(PathBuf::from(file))
    }

    fn collect_keys(&self, dir: &Path, keys: &mut Vec<String>) -> StorageResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                self.collect_keys(&path, keys)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                let parts: Vec<String> = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                if let Some(key) = parts.join("/").strip_suffix(BLOB_SUFFIX) {
                    keys.push(key.to_string());
                }
            }
        }
        Ok(())
    }
}

impl PersistenceTier for FileTier {
    fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut record = Vec::with_capacity(value.len() + 5);
        if self.compress {
            record.push(FLAG_LZ4);
            record.extend(lz4_flex::compress_prepend_size(value));
        } else {
            record.push(0);
            record.extend_from_slice(value);
        }
        let crc = crc32fast::hash(&record);
        record.extend_from_slice(&crc.to_le_bytes());

        // Write then rename so readers never observe a partial record
        let mut staging = path.clone().into_os_string();
        staging.push(".tmp");
        fs::write(&staging, &record)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }

    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        let record = match fs::read(&path) {
            Ok(record) => record,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if record.len() < 5 {
            return Err(StorageError::Corruption(format!("record for '{}' truncated", key)));
        }

        let (body, trailer) = record.split_at(record.len() - 4);
        let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(StorageError::Corruption(format!(
                "checksum mismatch for '{}': stored={}, computed={}",
                key, stored, computed
            )));
        }

        let payload = &body[1..];
        if body[0] & FLAG_LZ4 != 0 {
            lz4_flex::decompress_size_prepended(payload)
                .map(Some)
                .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))
        } else {
            Ok(Some(payload.to_vec()))
        }
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
