//! Blob storage
//!
//! File content lives apart from the node tree, keyed by space and blob ID.
//! Nodes and revisions only reference blobs through their blob ID attribute.

use crate::error::StorageError;
use crate::lookup::pathify;
use crate::metadata::io_error;
use crate::node::Node;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

pub trait Blobstore: Send + Sync + fmt::Debug {
    /// Move the file at `source` into place as the blob of `node`.
    fn upload(&self, node: &Node, source: &Path) -> Result<(), StorageError>;

    /// Stream the blob referenced by `node`.
    fn download(&self, node: &Node) -> Result<Box<dyn Read + Send>, StorageError>;

    /// Remove the blob referenced by `node`. Removing a missing blob succeeds.
    fn delete(&self, node: &Node) -> Result<(), StorageError>;
}

/// Blobs as plain files under `<root>/spaces/<space>/blobs/<pathified blob id>`.
#[derive(Debug, Clone)]
pub struct FsBlobstore {
    root: PathBuf,
}

impl FsBlobstore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn blob_path(&self, space_id: &str, blob_id: &str) -> PathBuf {
        self.root
            .join("spaces")
            .join(pathify(space_id, 1, 2))
            .join("blobs")
            .join(pathify(blob_id, 4, 2))
    }

    fn path_for(&self, node: &Node) -> Result<PathBuf, StorageError> {
        if node.blob_id.is_empty() || node.blob_id.contains('/') || node.blob_id.starts_with('.') {
            return Err(StorageError::InvalidAttribute {
                key: "blob_id".to_string(),
                reason: format!("invalid blob id {:?} on node {}", node.blob_id, node.id),
            });
        }
        Ok(self.blob_path(&node.space_id, &node.blob_id))
    }
}

impl Blobstore for FsBlobstore {
    fn upload(&self, node: &Node, source: &Path) -> Result<(), StorageError> {
        let dest = self.path_for(node)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        if fs::rename(source, &dest).is_err() {
            // different filesystem
            fs::copy(source, &dest).map_err(|e| io_error(source, e))?;
            fs::remove_file(source).map_err(|e| io_error(source, e))?;
        }
        Ok(())
    }

    fn download(&self, node: &Node) -> Result<Box<dyn Read + Send>, StorageError> {
        let path = self.path_for(node)?;
        let file = fs::File::open(&path).map_err(|e| io_error(&path, e))?;
        Ok(Box::new(file))
    }

    fn delete(&self, node: &Node) -> Result<(), StorageError> {
        let path = self.path_for(node)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
