//! Revision keys and revision nodes
//!
//! A revision of node `id` is stored beside the node as `id.REV.<timestamp>`,
//! in the same directory, so promoting one is a metadata copy and never a
//! cross-device move.

use super::{format_timestamp, Node};
use crate::error::StorageError;
use crate::metadata::{is_not_exist, prefixes};
use chrono::{DateTime, Duration, Utc};

/// Reserved separator between a node ID and a revision timestamp.
pub const REVISION_ID_DELIMITER: &str = ".REV.";

/// Split a revision key on the first delimiter. Keys without one come back as
/// `(key, "")`.
pub fn split_revision_key(revision_key: &str) -> (&str, &str) {
    match revision_key.split_once(REVISION_ID_DELIMITER) {
        Some((id, revision)) => (id, revision),
        None => (revision_key, ""),
    }
}

pub fn join_revision_key(node_id: &str, revision: &str) -> String {
    format!("{}{}{}", node_id, REVISION_ID_DELIMITER, revision)
}

/// Attributes a revision carries over from the node it was frozen from.
pub fn is_revision_attr(name: &str) -> bool {
    prefixes::is_content_attr(name)
}

impl Node {
    /// Handle for revision `revision` of this node, without reading it.
    pub fn revision_node(&self, revision: &str) -> Node {
        Node::new(
            self.lookup(),
            self.space_id.clone(),
            join_revision_key(&self.id, revision),
            self.parent_id.clone(),
            self.name.clone(),
            self.node_type,
        )
    }

    /// Read revision `revision`. A missing revision has `exists == false`.
    pub fn read_revision(&self, revision: &str) -> Result<Node, StorageError> {
        if revision.is_empty() || revision.contains('/') {
            return Err(StorageError::InvalidAttribute {
                key: "revision".to_string(),
                reason: format!("invalid revision {:?}", revision),
            });
        }
        let mut rn = self.revision_node(revision);
        let attrs = match rn.xattrs() {
            Ok(attrs) => attrs,
            Err(e) if is_not_exist(&e) => return Ok(rn),
            Err(e) => return Err(e),
        };
        rn.exists = true;
        rn.blob_id = attrs.string_or_empty(prefixes::BLOBID_ATTR);
        rn.blobsize = attrs.int64(prefixes::BLOBSIZE_ATTR)?;
        Ok(rn)
    }

    /// Timestamp for a new revision frozen at `mtime`, advanced one nanosecond
    /// at a time past revisions that already exist. Callers hold the node lock.
    pub fn unused_revision_timestamp(&self, mtime: DateTime<Utc>) -> String {
        let mut t = mtime;
        loop {
            let candidate = format_timestamp(&t);
            let path = self
                .lookup()
                .internal_path(&self.space_id, &join_revision_key(&self.id, &candidate));
            if std::fs::symlink_metadata(&path).is_err() {
                return candidate;
            }
            t += Duration::nanoseconds(1);
        }
    }
}
