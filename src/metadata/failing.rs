//! Sidecar backend with one armed write failure, for exercising rollbacks.

use super::{Attributes, MetadataBackend, SidecarBackend};
use crate::error::StorageError;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};

#[derive(Debug, Default)]
pub(crate) struct FailingBackend {
    inner: SidecarBackend,
    trap: Mutex<Option<(PathBuf, String)>>,
}

impl FailingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `set_multiple` on `path` that writes `key`.
    pub fn fail_next_write(&self, path: &Path, key: &str) {
        *self.trap.lock() = Some((path.to_path_buf(), key.to_string()));
    }

    /// Whether the armed failure has not fired yet.
    pub fn armed(&self) -> bool {
        self.trap.lock().is_some()
    }
}

impl MetadataBackend for FailingBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn all(&self, path: &Path) -> Result<Attributes, StorageError> {
        self.inner.all(path)
    }

    fn set_multiple(
        &self,
        path: &Path,
        attrs: &Attributes,
        acquire_lock: bool,
    ) -> Result<(), StorageError> {
        {
            let mut trap = self.trap.lock();
            let fires = matches!(&*trap, Some((p, key)) if p == path && attrs.contains(key));
            if fires {
                *trap = None;
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("write to {} failed", path.display()),
                )));
            }
        }
        self.inner.set_multiple(path, attrs, acquire_lock)
    }

    fn remove(&self, path: &Path, key: &str, acquire_lock: bool) -> Result<(), StorageError> {
        self.inner.remove(path, key, acquire_lock)
    }

    fn metadata_path(&self, path: &Path) -> PathBuf {
        self.inner.metadata_path(path)
    }

    fn is_meta_file(&self, path: &Path) -> bool {
        self.inner.is_meta_file(path)
    }

    fn purge(&self, path: &Path) -> Result<(), StorageError> {
        self.inner.purge(path)
    }

    fn rename(&self, old: &Path, new: &Path) -> Result<(), StorageError> {
        self.inner.rename(old, new)
    }
}
