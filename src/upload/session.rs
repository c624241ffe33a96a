//! Upload sessions
//!
//! A session is the only durable state of an upload. It is written next to the
//! received bytes, bincode encoded, and resolved to a target node once all
//! bytes have landed.

use crate::concurrency::LockedFile;
use crate::context::RequestContext;
use crate::error::{FsError, StorageError};
use crate::lookup::Lookup;
use crate::metadata::{io_error, write_atomic};
use crate::node::{calculate_etag, parse_timestamp, Node};
use crate::tree::Tree;
use crate::types::{NodeType, Reference, ResourceId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub filename: String,
    pub space_root: String,
    pub space_owner_or_manager: String,
    pub provider_id: String,
    /// Client supplied modification time, RFC3339
    pub mtime: String,
    pub node_id: String,
    pub node_parent_id: String,
    pub executant_idp: String,
    pub executant_id: String,
    pub executant_type: String,
    pub executant_user_name: String,
    pub log_level: String,
    /// Expected checksum as `<algorithm> <hex digest>`
    pub checksum: String,
    pub checksum_sha1: Vec<u8>,
    pub checksum_adler32: Vec<u8>,
    pub checksum_md5: Vec<u8>,

    pub blob_id: String,
    pub blob_size: i64,

    /// Declared length, -1 when unknown
    pub size: i64,
    /// Bytes received so far
    pub offset: i64,

    pub chunk: String,
    pub dir: String,
    pub lock_id: String,
    pub header_if_match: String,
    pub header_if_none_match: String,
    pub header_if_unmodified_since: String,
    pub expires: Option<DateTime<Utc>>,
}

impl Session {
    pub fn executant(&self) -> UserId {
        UserId::new(self.executant_idp.clone(), self.executant_id.clone())
    }

    pub fn resource_id(&self) -> ResourceId {
        ResourceId::new(self.space_root.clone(), self.node_id.clone())
    }

    /// Reference to the upload target: by node once resolved, else parent + name.
    pub fn reference(&self) -> Reference {
        if self.node_id.is_empty() {
            Reference {
                resource_id: ResourceId::new(self.space_root.clone(), self.node_parent_id.clone()),
                path: format!("./{}", self.filename),
            }
        } else {
            Reference::node(self.space_root.clone(), self.node_id.clone())
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.map(|e| e <= now).unwrap_or(false)
    }
}

/// Persist `session` for `upload_id`.
pub fn write_metadata(lookup: &Lookup, upload_id: &str, session: &Session) -> Result<(), StorageError> {
    let path = lookup.upload_path(upload_id);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let bytes = bincode::serialize(session).map_err(|e| StorageError::Encode(e.to_string()))?;
    write_atomic(&path, &bytes)
}

/// Load the session of `upload_id`. An empty record decodes as the default session.
pub fn read_metadata(lookup: &Lookup, upload_id: &str) -> Result<Session, StorageError> {
    let path = lookup.upload_path(upload_id);
    let bytes = fs::read(&path).map_err(|e| io_error(&path, e))?;
    if bytes.is_empty() {
        return Ok(Session::default());
    }
    bincode::deserialize(&bytes).map_err(|e| StorageError::Decode(e.to_string()))
}

const RESOLVE_ATTEMPTS: usize = 8;

/// Resolve the target node of a fully received upload and mark it as processing.
///
/// New targets are created under the parent's lock so concurrent uploads of
/// the same name end up on one node. The target's lock is held from
/// resolution until the session is persisted.
pub fn update_metadata(
    ctx: &RequestContext,
    tree: &Tree,
    upload_id: &str,
    size: i64,
    mut session: Session,
) -> Result<(Session, Node), FsError> {
    let lookup = tree.lookup();
    let ctx = if session.lock_id.is_empty() {
        ctx.clone()
    } else {
        ctx.clone().with_lock_id(session.lock_id.clone())
    };

    let (node, _node_lock, created) = if session.node_id.is_empty() {
        let parent = Node::read_node(lookup, &session.space_root, &session.node_parent_id)?;
        if !parent.exists {
            return Err(FsError::PreconditionFailed("parent does not exist".to_string()));
        }
        resolve_target(tree, &parent, &session)?
    } else {
        let node = Node::read_node(lookup, &session.space_root, &session.node_id)?;
        if !node.exists {
            return Err(FsError::NotFound(session.node_id.clone()));
        }
        let lock = open_existing_node(&node)?;
        let node = Node::read_node(lookup, &session.space_root, &session.node_id)?;
        if !node.exists {
            return Err(FsError::NotFound(session.node_id.clone()));
        }
        (node, lock, false)
    };

    if !created {
        validate_request(&ctx, &session, &node)?;
    }

    node.mark_processing(upload_id, false)
        .map_err(|e| FsError::internal("could not write processing status", e))?;

    session.blob_size = size;
    session.node_id = node.id.clone();
    session.node_parent_id = node.parent_id.clone();
    write_metadata(lookup, upload_id, &session)
        .map_err(|e| FsError::internal("could not write upload metadata", e))?;

    Ok((session, node))
}

/// Join the child named by the session or create it under the parent lock.
///
/// An existing child is locked on its own after the parent lock is released,
/// then checked to still be linked under that name. Moves and deletes hold
/// the node lock, so the check is stable once it passes.
fn resolve_target(
    tree: &Tree,
    parent: &Node,
    session: &Session,
) -> Result<(Node, LockedFile, bool), FsError> {
    let lookup = tree.lookup();
    for _ in 0..RESOLVE_ATTEMPTS {
        let parent_lock = LockedFile::exclusive(&parent.lockfile_path())?;
        let child = parent.child(&session.filename)?;
        if !child.exists {
            if !session.header_if_match.is_empty() {
                return Err(FsError::PreconditionFailed("etag mismatch, resource does not exist".to_string()));
            }
            let id = uuid::Uuid::new_v4().to_string();
            let mtime = if session.mtime.is_empty() {
                None
            } else {
                parse_timestamp(&session.mtime).ok()
            };
            let (node, lock) = tree.create_node_locked(parent, &session.filename, &id, NodeType::File, mtime)?;
            tracing::debug!(node = %node.id, "initialized new node");
            return Ok((node, lock, true));
        }
        drop(parent_lock);

        let lock = open_existing_node(&child)?;
        let node = Node::read_node(lookup, &child.space_id, &child.id)?;
        if node.exists && node.parent_id == parent.id && node.name == session.filename {
            return Ok((node, lock, false));
        }
        tracing::debug!(node = %child.id, name = %session.filename, "upload target changed while locking, retrying");
    }
    Err(FsError::Aborted(format!(
        "upload target {} kept changing",
        session.filename
    )))
}

fn open_existing_node(node: &Node) -> Result<LockedFile, FsError> {
    Ok(LockedFile::exclusive(&node.lockfile_path())?)
}

/// Check conditional headers and locks against the current state of `node`.
pub fn validate_request(ctx: &RequestContext, session: &Session, node: &Node) -> Result<(), FsError> {
    node.check_lock(ctx)?;

    let mtime = node.mtime()?;
    let current_etag = calculate_etag(node, &mtime);

    if !session.header_if_match.is_empty() && session.header_if_match != current_etag {
        return Err(FsError::PreconditionFailed("etag mismatch".to_string()));
    }

    if !session.header_if_none_match.is_empty() {
        if session.header_if_none_match.trim() == "*" {
            return Err(FsError::PreconditionFailed("etag mismatch, resource exists".to_string()));
        }
        if session
            .header_if_none_match
            .split(',')
            .any(|tag| tag.trim() == current_etag)
        {
            return Err(FsError::PreconditionFailed("etag mismatch".to_string()));
        }
    }

    if !session.header_if_unmodified_since.is_empty() {
        let since = parse_timestamp(&session.header_if_unmodified_since).map_err(|e| {
            FsError::InvalidArgument(format!("invalid if-unmodified-since: {}", e))
        })?;
        if mtime > since {
            return Err(FsError::PreconditionFailed("if-unmodified-since mismatch".to_string()));
        }
    }
    Ok(())
}
