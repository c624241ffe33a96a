//! Node handles
//!
//! A `Node` is an in-memory view of one file or directory. It is read from the
//! metadata backend on construction and never refreshes itself; re-read the
//! node after taking its lock when the current state matters.

pub mod locks;
pub mod permissions;
pub mod revisions;

use crate::error::{FsError, StorageError};
use crate::lookup::{validate_id, Lookup};
use crate::metadata::{is_not_exist, prefixes, Attributes};
use crate::types::{NodeType, ResourceId, ResourceInfo, UserId};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

/// Prefix of the processing marker value, followed by the upload ID.
pub const PROCESSING_STATUS: &str = "processing:";

/// RFC3339 with nanoseconds, UTC. Used for revision keys and time attributes.
pub fn format_timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|t| t.with_timezone(&Utc))
}

/// Etag over the node's content identity and the given time.
pub fn calculate_etag(node: &Node, mtime: &DateTime<Utc>) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(node.id.as_bytes());
    hasher.update(b"\0");
    hasher.update(node.blob_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(format_timestamp(mtime).as_bytes());
    let digest = hasher.finalize();
    format!("\"{}\"", hex::encode(&digest.as_bytes()[..16]))
}

#[derive(Clone)]
pub struct Node {
    lookup: Arc<Lookup>,
    pub space_id: String,
    pub id: String,
    pub parent_id: String,
    pub name: String,
    pub exists: bool,
    pub blob_id: String,
    pub blobsize: i64,
    pub node_type: NodeType,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("space_id", &self.space_id)
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("name", &self.name)
            .field("exists", &self.exists)
            .field("blob_id", &self.blob_id)
            .field("blobsize", &self.blobsize)
            .field("node_type", &self.node_type)
            .finish()
    }
}

impl Node {
    /// A handle that has not been read from disk.
    pub fn new(
        lookup: &Arc<Lookup>,
        space_id: impl Into<String>,
        id: impl Into<String>,
        parent_id: impl Into<String>,
        name: impl Into<String>,
        node_type: NodeType,
    ) -> Self {
        Self {
            lookup: lookup.clone(),
            space_id: space_id.into(),
            id: id.into(),
            parent_id: parent_id.into(),
            name: name.into(),
            exists: false,
            blob_id: String::new(),
            blobsize: 0,
            node_type,
        }
    }

    /// Read a node by ID. A missing node is returned with `exists == false`.
    pub fn read_node(
        lookup: &Arc<Lookup>,
        space_id: &str,
        node_id: &str,
    ) -> Result<Node, StorageError> {
        validate_id(space_id).map_err(|e| StorageError::InvalidAttribute {
            key: "space_id".to_string(),
            reason: e.to_string(),
        })?;
        validate_id(node_id).map_err(|e| StorageError::InvalidAttribute {
            key: "node_id".to_string(),
            reason: e.to_string(),
        })?;

        let mut node = Node::new(lookup, space_id, node_id, "", "", NodeType::Invalid);
        let attrs = match lookup.backend().all(&node.internal_path()) {
            Ok(attrs) => attrs,
            Err(e) if is_not_exist(&e) => return Ok(node),
            Err(e) => return Err(e),
        };
        node.apply(&attrs);
        node.exists = true;
        Ok(node)
    }

    pub(crate) fn apply(&mut self, attrs: &Attributes) {
        self.parent_id = attrs.string_or_empty(prefixes::PARENTID_ATTR);
        self.name = attrs.string_or_empty(prefixes::NAME_ATTR);
        self.blob_id = attrs.string_or_empty(prefixes::BLOBID_ATTR);
        self.blobsize = attrs.int64_or(prefixes::BLOBSIZE_ATTR, 0);
        self.node_type = NodeType::from_i64(attrs.int64_or(prefixes::TYPE_ATTR, 0));
    }

    pub fn lookup(&self) -> &Arc<Lookup> {
        &self.lookup
    }

    pub fn internal_path(&self) -> PathBuf {
        self.lookup.internal_path(&self.space_id, &self.id)
    }

    pub fn lockfile_path(&self) -> PathBuf {
        self.lookup.backend().lockfile_path(&self.internal_path())
    }

    pub fn is_space_root(&self) -> bool {
        self.id == self.space_id
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Container
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(self.space_id.clone(), self.id.clone())
    }

    /// Fresh attributes from the backend.
    pub fn xattrs(&self) -> Result<Attributes, StorageError> {
        self.lookup.backend().all(&self.internal_path())
    }

    pub fn set_xattrs(&self, attrs: &Attributes, acquire_lock: bool) -> Result<(), StorageError> {
        self.lookup
            .backend()
            .set_multiple(&self.internal_path(), attrs, acquire_lock)
    }

    pub fn remove_xattr(&self, key: &str, acquire_lock: bool) -> Result<(), StorageError> {
        self.lookup
            .backend()
            .remove(&self.internal_path(), key, acquire_lock)
    }

    /// Child entry `name`. Missing children come back with `exists == false`
    /// and `parent_id` set to this node.
    pub fn child(&self, name: &str) -> Result<Node, FsError> {
        crate::lookup::validate_name(name)?;
        let missing = || {
            Node::new(
                &self.lookup,
                self.space_id.clone(),
                "",
                self.id.clone(),
                name,
                NodeType::Invalid,
            )
        };
        if !self.exists || !self.is_dir() {
            return Ok(missing());
        }

        let link = self.internal_path().join(name);
        let target = match fs::read_link(&link) {
            Ok(target) => target,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(missing()),
            Err(e) => return Err(e.into()),
        };
        let child_id = Lookup::child_id_from_link(&target);
        let mut child = Node::read_node(&self.lookup, &self.space_id, &child_id)?;
        if !child.exists {
            tracing::warn!(node = %self.id, name, child = %child_id, "dangling child link");
            let mut m = missing();
            m.id = child_id;
            return Ok(m);
        }
        if child.name.is_empty() {
            child.name = name.to_string();
        }
        if child.parent_id.is_empty() {
            child.parent_id = self.id.clone();
        }
        Ok(child)
    }

    pub fn parent(&self) -> Result<Node, FsError> {
        if self.parent_id.is_empty() {
            return Err(FsError::NotFound(format!("{} has no parent", self.id)));
        }
        Ok(Node::read_node(&self.lookup, &self.space_id, &self.parent_id)?)
    }

    pub fn space_root(&self) -> Result<Node, FsError> {
        Ok(Node::read_node(&self.lookup, &self.space_id, &self.space_id)?)
    }

    /// Owner of the space this node belongs to.
    pub fn space_owner(&self) -> Result<Option<UserId>, FsError> {
        let attrs = if self.is_space_root() {
            self.xattrs()?
        } else {
            self.space_root()?.xattrs()?
        };
        let id = attrs.string_or_empty(prefixes::OWNER_ID_ATTR);
        if id.is_empty() {
            return Ok(None);
        }
        Ok(Some(UserId::new(
            attrs.string_or_empty(prefixes::OWNER_IDP_ATTR),
            id,
        )))
    }

    /// Content modification time. Falls back to the file's own mtime.
    pub fn mtime(&self) -> Result<DateTime<Utc>, StorageError> {
        let attrs = self.xattrs()?;
        if let Some(t) = attrs
            .get(prefixes::MTIME_ATTR)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|s| parse_timestamp(s).ok())
        {
            return Ok(t);
        }
        let path = self.internal_path();
        let modified = fs::symlink_metadata(&path)
            .map_err(|e| crate::metadata::io_error(&path, e))?
            .modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }

    pub fn set_mtime(&self, t: &DateTime<Utc>, acquire_lock: bool) -> Result<(), StorageError> {
        let mut attrs = Attributes::new();
        attrs.set_string(prefixes::MTIME_ATTR, &format_timestamp(t));
        self.set_xattrs(&attrs, acquire_lock)
    }

    /// Tree modification time, the latest change anywhere below a container.
    pub fn tmtime(&self) -> Result<DateTime<Utc>, StorageError> {
        let attrs = self.xattrs()?;
        match attrs
            .get(prefixes::TMTIME_ATTR)
            .and_then(|raw| std::str::from_utf8(raw).ok())
            .and_then(|s| parse_timestamp(s).ok())
        {
            Some(t) => Ok(t),
            None => self.mtime(),
        }
    }

    pub fn treesize(&self) -> Result<i64, StorageError> {
        Ok(self.xattrs()?.int64_or(prefixes::TREESIZE_ATTR, 0))
    }

    /// Size reported for the node: tree size for containers, blob size for files.
    pub fn size(&self) -> Result<i64, StorageError> {
        if self.is_dir() {
            self.treesize()
        } else {
            Ok(self.blobsize)
        }
    }

    pub fn etag(&self) -> Result<String, StorageError> {
        if self.is_dir() {
            let attrs = self.xattrs()?;
            let propagated = attrs.string_or_empty(prefixes::PROPAGATION_ETAG_ATTR);
            if !propagated.is_empty() {
                return Ok(format!("\"{}\"", propagated));
            }
            return Ok(calculate_etag(self, &self.tmtime()?));
        }
        Ok(calculate_etag(self, &self.mtime()?))
    }

    /// Upload ID currently being finalized into this node, if any.
    pub fn processing_upload(&self) -> Result<Option<String>, StorageError> {
        let status = self.xattrs()?.string_or_empty(prefixes::STATUS_ATTR);
        Ok(status
            .strip_prefix(PROCESSING_STATUS)
            .map(str::to_string))
    }

    pub fn mark_processing(&self, upload_id: &str, acquire_lock: bool) -> Result<(), StorageError> {
        let mut attrs = Attributes::new();
        attrs.set_string(
            prefixes::STATUS_ATTR,
            &format!("{}{}", PROCESSING_STATUS, upload_id),
        );
        self.set_xattrs(&attrs, acquire_lock)
    }

    /// Clear the processing marker if it still belongs to `upload_id`.
    pub fn unmark_processing(&self, upload_id: &str, acquire_lock: bool) -> Result<(), StorageError> {
        match self.processing_upload()? {
            Some(current) if current == upload_id => {
                self.remove_xattr(prefixes::STATUS_ATTR, acquire_lock)
            }
            _ => Ok(()),
        }
    }

    pub fn as_resource_info(&self) -> Result<ResourceInfo, StorageError> {
        let attrs = self.xattrs()?;
        let checksum = attrs
            .get(&prefixes::checksum_attr(prefixes::CHECKSUM_SHA1))
            .filter(|raw| !raw.is_empty())
            .map(hex::encode);
        let processing = attrs
            .string_or_empty(prefixes::STATUS_ATTR)
            .starts_with(PROCESSING_STATUS);
        Ok(ResourceInfo {
            id: self.resource_id(),
            parent_id: self.parent_id.clone(),
            name: self.name.clone(),
            node_type: self.node_type,
            size: self.size()?.max(0) as u64,
            etag: self.etag()?,
            mtime: self.mtime()?,
            checksum,
            processing,
        })
    }
}
