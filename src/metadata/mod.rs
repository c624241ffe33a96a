//! Node metadata storage
//!
//! Attributes of a node are stored either as extended file attributes on the
//! node itself or in a sidecar file next to it. Both encodings sit behind the
//! `MetadataBackend` trait. A storage root uses exactly one backend.

pub mod prefixes;
pub mod sidecar;
pub mod xattrs;

#[cfg(test)]
pub(crate) mod failing;

pub use sidecar::SidecarBackend;
pub use xattrs::XattrsBackend;

use crate::error::StorageError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// Suffix of the per-node lock file.
pub const LOCK_SUFFIX: &str = ".mlock";

const ATTR_UNSET: &str = "attribute not set";

/// Attribute map of one node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes(BTreeMap<String, Vec<u8>>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).map(Vec::as_slice)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn set_string(&mut self, key: impl Into<String>, value: &str) {
        self.set(key, value.as_bytes().to_vec());
    }

    pub fn set_int64(&mut self, key: impl Into<String>, value: i64) {
        self.set(key, value.to_string().into_bytes());
    }

    pub fn remove(&mut self, key: &str) -> Option<Vec<u8>> {
        self.0.remove(key)
    }

    /// String value of `key`. Missing or non UTF-8 values are errors.
    pub fn string(&self, key: &str) -> Result<String, StorageError> {
        let raw = self.get(key).ok_or_else(|| attr_unset(key))?;
        String::from_utf8(raw.to_vec()).map_err(|e| StorageError::InvalidAttribute {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// String value of `key`, empty when unset.
    pub fn string_or_empty(&self, key: &str) -> String {
        self.get(key)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default()
    }

    pub fn int64(&self, key: &str) -> Result<i64, StorageError> {
        let value = self.string(key)?;
        value
            .trim()
            .parse::<i64>()
            .map_err(|e| StorageError::InvalidAttribute {
                key: key.to_string(),
                reason: format!("{:?} is not an int64: {}", value, e),
            })
    }

    pub fn int64_or(&self, key: &str, default: i64) -> i64 {
        self.int64(key).unwrap_or(default)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Overlay `other` onto `self`.
    pub fn merge(&mut self, other: &Attributes) {
        for (k, v) in other.0.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }
}

impl FromIterator<(String, Vec<u8>)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Attributes {
    type Item = (String, Vec<u8>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Vec<u8>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Capability interface over one on-disk attribute encoding.
///
/// Writers that already hold the node's lock file pass `acquire_lock = false`;
/// advisory locks are per open file, so re-acquiring from a second handle in
/// the same process would block forever.
pub trait MetadataBackend: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// All attributes of the node at `path`.
    fn all(&self, path: &Path) -> Result<Attributes, StorageError>;

    fn get(&self, path: &Path, key: &str) -> Result<Vec<u8>, StorageError> {
        let attrs = self.all(path)?;
        attrs
            .get(key)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| attr_unset(key))
    }

    fn get_string(&self, path: &Path, key: &str) -> Result<String, StorageError> {
        self.all(path)?.string(key)
    }

    fn get_int64(&self, path: &Path, key: &str) -> Result<i64, StorageError> {
        self.all(path)?.int64(key)
    }

    fn set(&self, path: &Path, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut attrs = Attributes::new();
        attrs.set(key, value.to_vec());
        self.set_multiple(path, &attrs, true)
    }

    fn set_multiple(
        &self,
        path: &Path,
        attrs: &Attributes,
        acquire_lock: bool,
    ) -> Result<(), StorageError>;

    /// Unset `key`. Removing an attribute that is not set is not an error.
    fn remove(&self, path: &Path, key: &str, acquire_lock: bool) -> Result<(), StorageError>;

    fn lockfile_path(&self, path: &Path) -> PathBuf {
        with_suffix(path, LOCK_SUFFIX)
    }

    /// The file holding the attributes of the node at `path`.
    fn metadata_path(&self, path: &Path) -> PathBuf;

    /// Whether `path` is a backend artifact rather than node content.
    fn is_meta_file(&self, path: &Path) -> bool;

    /// Drop all attributes and cached state of the node at `path`.
    fn purge(&self, path: &Path) -> Result<(), StorageError>;

    /// Follow a rename of the node file from `old` to `new`.
    fn rename(&self, old: &Path, new: &Path) -> Result<(), StorageError>;
}

/// Which attribute encoding a storage root uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sidecar,
    Xattrs,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sidecar => write!(f, "sidecar"),
            BackendKind::Xattrs => write!(f, "xattrs"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sidecar" | "messagepack" => Ok(BackendKind::Sidecar),
            "xattrs" | "xattr" => Ok(BackendKind::Xattrs),
            other => Err(StorageError::InvalidAttribute {
                key: "metadata_backend".to_string(),
                reason: format!("unknown backend {:?}", other),
            }),
        }
    }
}

pub fn build_backend(kind: BackendKind) -> Arc<dyn MetadataBackend> {
    match kind {
        BackendKind::Sidecar => Arc::new(SidecarBackend::new()),
        BackendKind::Xattrs => Arc::new(XattrsBackend::new()),
    }
}

/// `path` with `suffix` appended to its last component.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s: OsString = path.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

/// True when the error means the node (or its metadata) does not exist.
pub fn is_not_exist(err: &StorageError) -> bool {
    match err {
        StorageError::NotExist(_) => true,
        StorageError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
        _ => false,
    }
}

/// True when the error means a requested attribute is not set.
pub fn is_attr_unset(err: &StorageError) -> bool {
    matches!(err, StorageError::InvalidAttribute { reason, .. } if reason == ATTR_UNSET)
}

fn attr_unset(key: &str) -> StorageError {
    StorageError::InvalidAttribute {
        key: key.to_string(),
        reason: ATTR_UNSET.to_string(),
    }
}

pub(crate) fn io_error(path: &Path, err: std::io::Error) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotExist(path.to_path_buf())
    } else {
        StorageError::Io(err)
    }
}

/// Replace `path` with `bytes` via a hidden temp file in the same directory.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let dir = path
        .parent()
        .ok_or_else(|| StorageError::NotExist(path.to_path_buf()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| -> Result<(), StorageError> {
        let mut file = fs::File::create(&tmp).map_err(|e| io_error(&tmp, e))?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path).map_err(|e| io_error(path, e))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
