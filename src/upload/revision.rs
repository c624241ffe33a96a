//! Content swaps on upload completion.

use crate::concurrency::LockedFile;
use crate::error::{FsError, StorageError};
use crate::lookup::Lookup;
use crate::metadata::{prefixes, Attributes, MetadataBackend};
use crate::node::{format_timestamp, Node};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Everything that describes one version of a file's content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionMetadata {
    pub mtime: Option<DateTime<Utc>>,
    pub blob_id: String,
    pub blob_size: i64,
    pub checksum_sha1: Vec<u8>,
    pub checksum_md5: Vec<u8>,
    pub checksum_adler32: Vec<u8>,
}

impl RevisionMetadata {
    fn to_attributes(&self, mtime: &DateTime<Utc>) -> Attributes {
        let mut attrs = Attributes::new();
        attrs.set_string(prefixes::BLOBID_ATTR, &self.blob_id);
        attrs.set_int64(prefixes::BLOBSIZE_ATTR, self.blob_size);
        attrs.set(
            prefixes::checksum_attr(prefixes::CHECKSUM_SHA1),
            self.checksum_sha1.clone(),
        );
        attrs.set(
            prefixes::checksum_attr(prefixes::CHECKSUM_MD5),
            self.checksum_md5.clone(),
        );
        attrs.set(
            prefixes::checksum_attr(prefixes::CHECKSUM_ADLER32),
            self.checksum_adler32.clone(),
        );
        attrs.set_string(prefixes::MTIME_ATTR, &format_timestamp(mtime));
        attrs
    }
}

/// Lock and touch the file of `revision_node`. Returns the held revision lock.
pub fn create_revision_node(lookup: &Lookup, revision_node: &Node) -> Result<LockedFile, FsError> {
    let path = revision_node.internal_path();
    let lock = LockedFile::exclusive(&lookup.backend().lockfile_path(&path))?;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)?;
    Ok(lock)
}

/// Remove a revision's file, metadata and lock file. Missing pieces are skipped.
pub fn remove_revision_artifacts(backend: &dyn MetadataBackend, path: &Path) -> Result<(), StorageError> {
    remove_if_present(path)?;
    backend.purge(path)?;
    remove_if_present(&backend.lockfile_path(path))
}

fn remove_if_present(path: &Path) -> Result<(), StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StorageError::Io(e)),
    }
}

pub(crate) fn set_file_mtime(path: &Path, mtime: DateTime<Utc>) -> std::io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(path)?;
    file.set_modified(mtime.into())
}

/// Point `node` at new content, taking the node lock.
///
/// Returns the size difference to propagate and the re-read node.
pub fn set_node_to_upload(
    lookup: &Arc<Lookup>,
    node: &Node,
    rm: RevisionMetadata,
) -> Result<(i64, Node), FsError> {
    let lock = LockedFile::exclusive(&node.lockfile_path())?;
    set_node_to_upload_locked(lookup, node, rm, &lock)
}

/// Like `set_node_to_upload` for callers already holding the node lock.
pub fn set_node_to_upload_locked(
    lookup: &Arc<Lookup>,
    node: &Node,
    rm: RevisionMetadata,
    node_lock: &LockedFile,
) -> Result<(i64, Node), FsError> {
    if node_lock.path() != node.lockfile_path() {
        return Err(FsError::Internal(format!(
            "lock {} does not belong to node {}",
            node_lock.path().display(),
            node.id
        )));
    }
    let mut current = Node::read_node(lookup, &node.space_id, &node.id)?;
    if !current.exists {
        return Err(FsError::NotFound(node.id.clone()));
    }

    let size_diff = rm.blob_size - current.blobsize;
    let mtime = rm.mtime.unwrap_or_else(Utc::now);
    current
        .set_xattrs(&rm.to_attributes(&mtime), false)
        .map_err(|e| FsError::internal("could not write metadata", e))?;

    current.blob_id = rm.blob_id;
    current.blobsize = rm.blob_size;
    Ok((size_diff, current))
}
