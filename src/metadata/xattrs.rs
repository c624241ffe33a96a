//! Extended attribute backend
//!
//! Attributes are stored as `user.*` extended attributes on the node file
//! itself, so the node path doubles as its metadata path.

use super::{io_error, prefixes, Attributes, MetadataBackend, LOCK_SUFFIX};
use crate::concurrency::LockedFile;
use crate::error::StorageError;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub struct XattrsBackend;

impl XattrsBackend {
    pub fn new() -> Self {
        Self
    }

    /// Whether the filesystem holding `dir` accepts user extended attributes.
    pub fn supported_at(dir: &Path) -> bool {
        if !xattr::SUPPORTED_PLATFORM {
            return false;
        }
        let scratch = dir.join(format!(".xattr-check-{}", uuid::Uuid::new_v4()));
        if std::fs::write(&scratch, b"").is_err() {
            return false;
        }
        let ok = xattr::set(&scratch, "user.decompfs.check", b"1").is_ok();
        let _ = std::fs::remove_file(&scratch);
        ok
    }
}

impl MetadataBackend for XattrsBackend {
    fn name(&self) -> &'static str {
        "xattrs"
    }

    fn all(&self, path: &Path) -> Result<Attributes, StorageError> {
        let names = xattr::list(path).map_err(|e| io_error(path, e))?;
        let mut attrs = Attributes::new();
        for name in names {
            let name = name.to_string_lossy().into_owned();
            if !name.starts_with("user.") {
                continue;
            }
            if let Some(value) = xattr::get(path, &name).map_err(|e| io_error(path, e))? {
                attrs.set(name, value);
            }
        }
        Ok(attrs)
    }

    fn get(&self, path: &Path, key: &str) -> Result<Vec<u8>, StorageError> {
        match xattr::get(path, key).map_err(|e| io_error(path, e))? {
            Some(value) => Ok(value),
            None => Err(StorageError::InvalidAttribute {
                key: key.to_string(),
                reason: super::ATTR_UNSET.to_string(),
            }),
        }
    }

    fn set_multiple(
        &self,
        path: &Path,
        attrs: &Attributes,
        acquire_lock: bool,
    ) -> Result<(), StorageError> {
        let _guard = if acquire_lock {
            Some(LockedFile::exclusive(&self.lockfile_path(path))?)
        } else {
            None
        };
        for (key, value) in attrs.iter() {
            xattr::set(path, key, value).map_err(|e| io_error(path, e))?;
        }
        Ok(())
    }

    fn remove(&self, path: &Path, key: &str, acquire_lock: bool) -> Result<(), StorageError> {
        let _guard = if acquire_lock {
            Some(LockedFile::exclusive(&self.lockfile_path(path))?)
        } else {
            None
        };
        if xattr::get(path, key).map_err(|e| io_error(path, e))?.is_none() {
            return Ok(());
        }
        xattr::remove(path, key).map_err(|e| io_error(path, e))
    }

    fn metadata_path(&self, path: &Path) -> PathBuf {
        path.to_path_buf()
    }

    fn is_meta_file(&self, path: &Path) -> bool {
        path.to_string_lossy().ends_with(LOCK_SUFFIX)
    }

    fn purge(&self, path: &Path) -> Result<(), StorageError> {
        let names = match xattr::list(path) {
            Ok(names) => names,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::Io(e)),
        };
        for name in names {
            let name = name.to_string_lossy().into_owned();
            if name.starts_with(prefixes::PREFIX) {
                xattr::remove(path, &name).map_err(|e| io_error(path, e))?;
            }
        }
        Ok(())
    }

    fn rename(&self, _old: &Path, _new: &Path) -> Result<(), StorageError> {
        // attributes travel with the inode
        Ok(())
    }
}
