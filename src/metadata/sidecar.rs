//! Sidecar file backend
//!
//! Attributes live in `<node>.mpk`, bincode encoded, replaced atomically on
//! every write. Decoded attribute sets are kept in a bounded LRU cache and
//! revalidated against the sidecar file's inode, change time, modification
//! time and length on every read.

use super::{io_error, with_suffix, write_atomic, Attributes, MetadataBackend, LOCK_SUFFIX};
use crate::concurrency::LockedFile;
use crate::error::StorageError;
use lru::LruCache;
use parking_lot::RwLock;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

pub const METADATA_SUFFIX: &str = ".mpk";

/// Sidecars kept decoded by a backend created with `new`.
pub const DEFAULT_CACHE_CAPACITY: usize = 4096;

/// Identity of one version of a sidecar file. Every write replaces the file
/// with a new inode, so a rewrite by another process changes the inode even
/// when length and modification time match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: SystemTime,
    len: u64,
    #[cfg(unix)]
    ino: u64,
    #[cfg(unix)]
    ctime: (i64, i64),
}

impl Fingerprint {
    fn of(stat: &fs::Metadata) -> Result<Self, StorageError> {
        #[cfg(unix)]
        use std::os::unix::fs::MetadataExt;
        Ok(Self {
            modified: stat.modified()?,
            len: stat.len(),
            #[cfg(unix)]
            ino: stat.ino(),
            #[cfg(unix)]
            ctime: (stat.ctime(), stat.ctime_nsec()),
        })
    }
}

#[derive(Debug, Clone)]
struct CachedAttributes {
    fingerprint: Fingerprint,
    attrs: Attributes,
}

#[derive(Debug)]
pub struct SidecarBackend {
    cache: RwLock<LruCache<PathBuf, CachedAttributes>>,
}

impl Default for SidecarBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SidecarBackend {
    pub fn new() -> Self {
        Self::with_capacity(
            NonZeroUsize::new(DEFAULT_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        )
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            cache: RwLock::new(LruCache::new(capacity)),
        }
    }

    fn load(&self, path: &Path) -> Result<Attributes, StorageError> {
        let meta_path = self.metadata_path(path);
        let stat = match fs::metadata(&meta_path) {
            Ok(stat) => stat,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // no sidecar yet: the node exists iff its own file does
                fs::symlink_metadata(path).map_err(|e| io_error(path, e))?;
                return Ok(Attributes::new());
            }
            Err(e) => return Err(StorageError::Io(e)),
        };
        let fingerprint = Fingerprint::of(&stat)?;

        if let Some(cached) = self.cache.write().get(&meta_path) {
            if cached.fingerprint == fingerprint {
                return Ok(cached.attrs.clone());
            }
        }

        let bytes = fs::read(&meta_path).map_err(|e| io_error(&meta_path, e))?;
        let attrs = decode(&bytes)?;
        // the file may have been replaced between stat and read
        let after = fs::metadata(&meta_path).map_err(|e| io_error(&meta_path, e))?;
        if Fingerprint::of(&after)? == fingerprint {
            self.cache.write().put(
                meta_path,
                CachedAttributes {
                    fingerprint,
                    attrs: attrs.clone(),
                },
            );
        } else {
            self.cache.write().pop(&meta_path);
        }
        Ok(attrs)
    }

    fn store(&self, path: &Path, attrs: Attributes) -> Result<(), StorageError> {
        let meta_path = self.metadata_path(path);
        let bytes = bincode::serialize(&attrs).map_err(|e| StorageError::Encode(e.to_string()))?;
        write_atomic(&meta_path, &bytes)?;
        let stat = fs::metadata(&meta_path)?;
        self.cache.write().put(
            meta_path,
            CachedAttributes {
                fingerprint: Fingerprint::of(&stat)?,
                attrs,
            },
        );
        Ok(())
    }

    fn update<F>(&self, path: &Path, acquire_lock: bool, mutate: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Attributes),
    {
        let _guard = if acquire_lock {
            Some(LockedFile::exclusive(&self.lockfile_path(path))?)
        } else {
            None
        };
        let mut attrs = self.load(path)?;
        mutate(&mut attrs);
        self.store(path, attrs)
    }

    #[cfg(test)]
    fn cached_entries(&self) -> usize {
        self.cache.read().len()
    }
}

fn decode(bytes: &[u8]) -> Result<Attributes, StorageError> {
    if bytes.is_empty() {
        return Ok(Attributes::new());
    }
    bincode::deserialize(bytes).map_err(|e| StorageError::Decode(e.to_string()))
}

impl MetadataBackend for SidecarBackend {
    fn name(&self) -> &'static str {
        "sidecar"
    }

    fn all(&self, path: &Path) -> Result<Attributes, StorageError> {
        self.load(path)
    }

    fn set_multiple(
        &self,
        path: &Path,
        attrs: &Attributes,
        acquire_lock: bool,
    ) -> Result<(), StorageError> {
        self.update(path, acquire_lock, |current| current.merge(attrs))
    }

    fn remove(&self, path: &Path, key: &str, acquire_lock: bool) -> Result<(), StorageError> {
        self.update(path, acquire_lock, |current| {
            current.remove(key);
        })
    }

    fn metadata_path(&self, path: &Path) -> PathBuf {
        with_suffix(path, METADATA_SUFFIX)
    }

    fn is_meta_file(&self, path: &Path) -> bool {
        let name = path.to_string_lossy();
        name.ends_with(METADATA_SUFFIX) || name.ends_with(LOCK_SUFFIX)
    }

    fn purge(&self, path: &Path) -> Result<(), StorageError> {
        let meta_path = self.metadata_path(path);
        self.cache.write().pop(&meta_path);
        match fs::remove_file(&meta_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    fn rename(&self, old: &Path, new: &Path) -> Result<(), StorageError> {
        let old_meta = self.metadata_path(old);
        let new_meta = self.metadata_path(new);
        self.cache.write().pop(&old_meta);
        match fs::rename(&old_meta, &new_meta) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
