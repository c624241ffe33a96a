//! Reference resolution and on-disk layout
//!
//! Every node lives at a path derived from its space ID and node ID alone:
//!
//! ```text
//! <root>/spaces/<sp[0:2]>/<sp[2:]>/nodes/<id[0:2]>/<id[2:4]>/<id[4:6]>/<id[6:8]>/<id[8:]>
//! ```
//!
//! Names and parents are attributes, and a container lists its children as
//! symlinks named after each child pointing at the child's node path. Moving
//! or renaming a node therefore never moves content.

use crate::concurrency::LockedFile;
use crate::context::RequestContext;
use crate::error::{FsError, StorageError};
use crate::metadata::{Attributes, MetadataBackend};
use crate::node::Node;
use crate::types::Reference;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SPACES_DIR: &str = "spaces";
const NODES_DIR: &str = "nodes";
const UPLOADS_DIR: &str = "uploads";
const UPLOAD_INFO_SUFFIX: &str = ".info";

/// Split `id` into `depth` directory levels of `width` characters, keeping the
/// remainder as the final component.
pub fn pathify(id: &str, depth: usize, width: usize) -> String {
    let mut out = String::with_capacity(id.len() + depth);
    let mut rest = id;
    for _ in 0..depth {
        if rest.len() <= width || !rest.is_char_boundary(width) {
            break;
        }
        let (head, tail) = rest.split_at(width);
        out.push_str(head);
        out.push('/');
        rest = tail;
    }
    out.push_str(rest);
    out
}

/// Reject IDs that would escape the node directory.
pub fn validate_id(id: &str) -> Result<(), FsError> {
    if id.is_empty()
        || id.starts_with('.')
        || id.contains('/')
        || id.contains('\\')
        || id.contains('\0')
    {
        return Err(FsError::InvalidArgument(format!("invalid node id {:?}", id)));
    }
    Ok(())
}

/// Reject names that cannot be a single directory entry.
pub fn validate_name(name: &str) -> Result<(), FsError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidArgument(format!("invalid name {:?}", name)));
    }
    Ok(())
}

#[derive(Debug)]
pub struct Lookup {
    root: PathBuf,
    backend: Arc<dyn MetadataBackend>,
}

impl Lookup {
    pub fn new(root: impl Into<PathBuf>, backend: Arc<dyn MetadataBackend>) -> Self {
        Self {
            root: root.into(),
            backend,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn backend(&self) -> &dyn MetadataBackend {
        self.backend.as_ref()
    }

    pub fn backend_arc(&self) -> Arc<dyn MetadataBackend> {
        self.backend.clone()
    }

    pub fn spaces_dir(&self) -> PathBuf {
        self.root.join(SPACES_DIR)
    }

    pub fn space_path(&self, space_id: &str) -> PathBuf {
        self.spaces_dir().join(pathify(space_id, 1, 2))
    }

    /// Physical path of a node. Pure: performs no I/O.
    pub fn internal_path(&self, space_id: &str, node_id: &str) -> PathBuf {
        self.space_path(space_id)
            .join(NODES_DIR)
            .join(pathify(node_id, 4, 2))
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    /// Session record of an upload.
    pub fn upload_path(&self, upload_id: &str) -> PathBuf {
        self.uploads_dir()
            .join(format!("{}{}", upload_id, UPLOAD_INFO_SUFFIX))
    }

    /// Bytes received so far for an upload.
    pub fn upload_data_path(&self, upload_id: &str) -> PathBuf {
        self.uploads_dir().join(upload_id)
    }

    /// Upload ID of a session record path, if it is one.
    pub fn upload_id_from_path(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_str()?;
        name.strip_suffix(UPLOAD_INFO_SUFFIX)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    /// Symlink target a container uses to reference `child_id`.
    fn child_link_target(&self, parent_id: &str, child_id: &str) -> PathBuf {
        // one ".." per directory level of the parent's own node path
        let ups = pathify(parent_id, 4, 2).split('/').count();
        let mut target = PathBuf::new();
        for _ in 0..ups {
            target.push("..");
        }
        target.join(pathify(child_id, 4, 2))
    }

    /// Node ID referenced by a child link target.
    pub fn child_id_from_link(target: &Path) -> String {
        let target = target.to_string_lossy();
        let mut rest: &str = &target;
        while let Some(stripped) = rest.strip_prefix("../") {
            rest = stripped;
        }
        rest.replace('/', "")
    }

    /// Create the entry `name` in container `parent_id` pointing at `child_id`.
    /// Callers hold the parent's lock.
    pub fn link_child(
        &self,
        space_id: &str,
        parent_id: &str,
        name: &str,
        child_id: &str,
    ) -> Result<(), FsError> {
        validate_name(name)?;
        let link = self.internal_path(space_id, parent_id).join(name);
        let target = self.child_link_target(parent_id, child_id);
        symlink(&target, &link).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                FsError::AlreadyExists(name.to_string())
            } else {
                FsError::from(e)
            }
        })
    }

    /// Remove the entry `name` from container `parent_id`.
    pub fn unlink_child(&self, space_id: &str, parent_id: &str, name: &str) -> Result<(), FsError> {
        validate_name(name)?;
        let link = self.internal_path(space_id, parent_id).join(name);
        fs::remove_file(&link).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FsError::NotFound(name.to_string())
            } else {
                FsError::from(e)
            }
        })
    }

    pub fn node_from_id(self: &Arc<Self>, space_id: &str, node_id: &str) -> Result<Node, FsError> {
        Node::read_node(self, space_id, node_id).map_err(FsError::from)
    }

    /// Resolve a reference to a node.
    ///
    /// Missing nodes are returned with `exists == false`. When a path segment
    /// other than the last one is missing the walk stops there.
    pub fn node_from_resource(
        self: &Arc<Self>,
        ctx: &RequestContext,
        reference: &Reference,
    ) -> Result<Node, FsError> {
        let rid = &reference.resource_id;
        if rid.space_id.is_empty() {
            return Err(FsError::InvalidArgument("missing space id".to_string()));
        }
        let start_id = if rid.opaque_id.is_empty() {
            rid.space_id.as_str()
        } else {
            rid.opaque_id.as_str()
        };
        let start = self.node_from_id(&rid.space_id, start_id)?;
        if reference.path.is_empty() || !start.exists {
            return Ok(start);
        }
        self.walk_path(ctx, start, &reference.path, |_| Ok(()))
    }

    /// Follow `path` segment by segment below `start`, calling `visit` on every
    /// node reached. Checks for cancellation between segments.
    pub fn walk_path<F>(
        self: &Arc<Self>,
        ctx: &RequestContext,
        start: Node,
        path: &str,
        mut visit: F,
    ) -> Result<Node, FsError>
    where
        F: FnMut(&Node) -> Result<(), FsError>,
    {
        let mut current = start;
        for segment in path.split('/').filter(|s| !s.is_empty() && *s != ".") {
            ctx.check()?;
            if !current.exists {
                break;
            }
            current = current.child(segment)?;
            visit(&current)?;
        }
        Ok(current)
    }

    /// Space relative path of `node`, e.g. `/docs/a.txt`. The root is `/`.
    pub fn path(&self, ctx: &RequestContext, node: &Node, max_depth: usize) -> Result<String, FsError> {
        let mut segments = Vec::new();
        let mut current_id = node.id.clone();
        let mut parent_id = node.parent_id.clone();
        let mut name = node.name.clone();
        while current_id != node.space_id && !parent_id.is_empty() {
            ctx.check()?;
            if segments.len() >= max_depth {
                return Err(FsError::Internal(format!(
                    "path of {} deeper than {}",
                    node.id, max_depth
                )));
            }
            segments.push(name);
            let attrs = self
                .backend
                .all(&self.internal_path(&node.space_id, &parent_id))?;
            current_id = parent_id;
            parent_id = attrs.string_or_empty(crate::metadata::prefixes::PARENTID_ATTR);
            name = attrs.string_or_empty(crate::metadata::prefixes::NAME_ATTR);
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }

    /// Copy the attributes of `src` accepted by `filter` onto `dst`, holding a
    /// shared lock on the source while reading.
    pub fn copy_metadata<F>(
        &self,
        src: &Path,
        dst: &Path,
        filter: F,
        acquire_target_lock: bool,
    ) -> Result<(), StorageError>
    where
        F: Fn(&str, &[u8]) -> Option<Vec<u8>>,
    {
        let source_lock = LockedFile::shared(&self.backend.lockfile_path(src))?;
        self.copy_metadata_with_source_lock(src, dst, filter, &source_lock, acquire_target_lock)
    }

    /// Like `copy_metadata`, with the source lock already held by the caller.
    pub fn copy_metadata_with_source_lock<F>(
        &self,
        src: &Path,
        dst: &Path,
        filter: F,
        source_lock: &LockedFile,
        acquire_target_lock: bool,
    ) -> Result<(), StorageError>
    where
        F: Fn(&str, &[u8]) -> Option<Vec<u8>>,
    {
        let expected = self.backend.lockfile_path(src);
        if source_lock.path() != expected {
            return Err(StorageError::Lock(format!(
                "lock path {} does not match {}",
                source_lock.path().display(),
                expected.display()
            )));
        }

        let source = self.backend.all(src)?;
        let copied: Attributes = source
            .iter()
            .filter_map(|(k, v)| filter(k, v).map(|nv| (k.to_string(), nv)))
            .collect();
        if copied.is_empty() {
            return Ok(());
        }
        self.backend.set_multiple(dst, &copied, acquire_target_lock)
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(not(unix))]
fn symlink(_target: &Path, _link: &Path) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "child links require symlink support",
    ))
}
