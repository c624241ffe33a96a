//! Core types shared by the storage engine and its callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a user as issued by an identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId {
    pub idp: String,
    pub opaque_id: String,
}

impl UserId {
    pub fn new(idp: impl Into<String>, opaque_id: impl Into<String>) -> Self {
        Self {
            idp: idp.into(),
            opaque_id: opaque_id.into(),
        }
    }
}

/// The user executing a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
}

impl User {
    pub fn new(id: UserId, username: impl Into<String>) -> Self {
        Self {
            id,
            username: username.into(),
        }
    }
}

/// Addresses a node: the space it lives in and its opaque node ID.
///
/// An empty `opaque_id` addresses the space root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub storage_id: String,
    pub space_id: String,
    pub opaque_id: String,
}

impl ResourceId {
    pub fn new(space_id: impl Into<String>, opaque_id: impl Into<String>) -> Self {
        Self {
            storage_id: String::new(),
            space_id: space_id.into(),
            opaque_id: opaque_id.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.storage_id.is_empty() {
            write!(f, "{}!{}", self.space_id, self.opaque_id)
        } else {
            write!(f, "{}${}!{}", self.storage_id, self.space_id, self.opaque_id)
        }
    }
}

/// A space-relative reference: a resource ID plus an optional relative path below it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub resource_id: ResourceId,
    pub path: String,
}

impl Reference {
    /// Reference a path relative to the root of a space.
    pub fn space_path(space_id: impl Into<String>, path: impl Into<String>) -> Self {
        let space_id = space_id.into();
        Self {
            resource_id: ResourceId::new(space_id.clone(), space_id),
            path: path.into(),
        }
    }

    /// Reference a node directly by its ID.
    pub fn node(space_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            resource_id: ResourceId::new(space_id, node_id),
            path: String::new(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.resource_id)
        } else {
            write!(f, "{}/{}", self.resource_id, self.path.trim_start_matches("./"))
        }
    }
}

/// Resource type as stored in the type attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Invalid,
    File,
    Container,
}

impl NodeType {
    pub fn as_i64(self) -> i64 {
        match self {
            NodeType::Invalid => 0,
            NodeType::File => 1,
            NodeType::Container => 2,
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => NodeType::File,
            2 => NodeType::Container,
            _ => NodeType::Invalid,
        }
    }
}

/// One entry of a revision listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub key: String,
    /// Seconds since the epoch
    pub mtime: u64,
    pub size: u64,
    pub etag: String,
}

/// Stat result for a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub id: ResourceId,
    pub parent_id: String,
    pub name: String,
    pub node_type: NodeType,
    pub size: u64,
    pub etag: String,
    pub mtime: DateTime<Utc>,
    /// SHA1 checksum, hex encoded, when known
    pub checksum: Option<String>,
    /// Set while an upload is being finalized into this node
    pub processing: bool,
}

/// A space as listed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSpace {
    pub id: String,
    pub name: String,
    pub owner: Option<UserId>,
    /// Aggregate size of the space tree
    pub size: u64,
}
