//! Storage engine facade
//!
//! `Storage` wires the lookup, the tree mutator, the blobstore and the
//! permission checker together and exposes the operations callers use. Every
//! operation resolves its reference, assembles the caller's permissions on the
//! resolved node and only then touches the tree. Revision and upload
//! operations live in `crate::revisions` and `crate::upload`.

use crate::blobstore::{Blobstore, FsBlobstore};
use crate::config::{GatewayConfig, PropagationConfig};
use crate::context::RequestContext;
use crate::error::FsError;
use crate::lookup::Lookup;
use crate::metadata::{build_backend, prefixes, BackendKind, MetadataBackend, XattrsBackend};
use crate::node::locks::Lock;
use crate::node::permissions::{OwnerPermissions, PermissionsChecker, ResourcePermissions};
use crate::node::Node;
use crate::tree::Tree;
use crate::types::{Reference, ResourceInfo, StorageSpace};
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use walkdir::WalkDir;

/// Records which metadata backend a storage root was created with.
const BACKEND_MARKER: &str = ".metadata_backend";

const MAX_UPLOAD_EXPIRY_SECS: u64 = 10 * 365 * 24 * 3600;

#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub provider_id: String,
    pub upload_expiry: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            provider_id: "decompfs".to_string(),
            upload_expiry: Duration::hours(24),
        }
    }
}

impl StorageOptions {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut options = Self::default();
        if !config.storage.provider_id.is_empty() {
            options.provider_id = config.storage.provider_id.clone();
        }
        let secs = config.upload.expiry_secs.min(MAX_UPLOAD_EXPIRY_SECS);
        options.upload_expiry = Duration::seconds(secs as i64);
        options
    }
}

#[derive(Debug, Clone)]
pub struct Storage {
    pub(crate) lookup: Arc<Lookup>,
    pub(crate) tree: Tree,
    pub(crate) blobstore: Arc<dyn Blobstore>,
    pub(crate) permissions: Arc<dyn PermissionsChecker>,
    pub(crate) options: StorageOptions,
}

impl Storage {
    /// Storage over `root` with a filesystem blobstore and owner permissions.
    pub fn new(
        root: &Path,
        backend: Arc<dyn MetadataBackend>,
        propagation: PropagationConfig,
        options: StorageOptions,
    ) -> Self {
        let lookup = Arc::new(Lookup::new(root, backend));
        Self {
            tree: Tree::new(lookup.clone(), propagation),
            blobstore: Arc::new(FsBlobstore::new(root)),
            permissions: Arc::new(OwnerPermissions),
            lookup,
            options,
        }
    }

    /// Open the storage root described by `config`, creating it if needed.
    pub fn from_config(config: &GatewayConfig) -> Result<Self, FsError> {
        let root = config.storage.resolve_root()?;
        fs::create_dir_all(&root)?;
        let kind = config.storage.metadata_backend;
        ensure_backend_marker(&root, kind)?;
        if kind == BackendKind::Xattrs && !XattrsBackend::supported_at(&root) {
            return Err(FsError::ConfigError(format!(
                "filesystem at {} does not support user extended attributes",
                root.display()
            )));
        }

        tracing::info!(root = %root.display(), backend = %kind, "storage opened");
        Ok(Self::new(
            &root,
            build_backend(kind),
            config.propagation.clone(),
            StorageOptions::from_config(config),
        ))
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionsChecker>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn with_blobstore(mut self, blobstore: Arc<dyn Blobstore>) -> Self {
        self.blobstore = blobstore;
        self
    }

    pub fn lookup(&self) -> &Arc<Lookup> {
        &self.lookup
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub(crate) fn resolve(&self, ctx: &RequestContext, reference: &Reference) -> Result<Node, FsError> {
        self.lookup.node_from_resource(ctx, reference)
    }

    pub(crate) fn permissions_for(
        &self,
        ctx: &RequestContext,
        node: &Node,
    ) -> Result<ResourcePermissions, FsError> {
        self.permissions.assemble_permissions(ctx, node)
    }

    /// Resolve `reference` to an existing node the caller may stat.
    fn stat_node(&self, ctx: &RequestContext, reference: &Reference) -> Result<(Node, ResourcePermissions), FsError> {
        let node = self.resolve(ctx, reference)?;
        if !node.exists {
            return Err(FsError::NotFound(reference.to_string()));
        }
        let perms = self.permissions_for(ctx, &node)?;
        if !perms.stat {
            return Err(FsError::NotFound(reference.to_string()));
        }
        Ok((node, perms))
    }

    /// Resolve the container a new entry at `reference` would be created in.
    fn target_parent(&self, ctx: &RequestContext, reference: &Reference) -> Result<(Node, String), FsError> {
        let (parent_ref, name) = split_reference(reference)?;
        let parent = self.resolve(ctx, &parent_ref)?;
        if !parent.exists || !parent.is_dir() {
            return Err(FsError::NotFound(parent_ref.to_string()));
        }
        Ok((parent, name))
    }

    // spaces

    /// Create a space owned by the calling user.
    pub fn create_space(&self, ctx: &RequestContext, name: &str) -> Result<StorageSpace, FsError> {
        ctx.check()?;
        let user = ctx
            .user()
            .ok_or_else(|| FsError::PermissionDenied("creating a space requires a user".to_string()))?;
        if name.is_empty() {
            return Err(FsError::InvalidArgument("space name must not be empty".to_string()));
        }
        let space_id = uuid::Uuid::new_v4().to_string();
        let root = self.tree.create_space_root(&space_id, &user.id, name)?;
        Ok(StorageSpace {
            id: root.space_id.clone(),
            name: name.to_string(),
            owner: Some(user.id.clone()),
            size: 0,
        })
    }

    /// Every space the caller may stat, sorted by ID.
    pub fn list_spaces(&self, ctx: &RequestContext) -> Result<Vec<StorageSpace>, FsError> {
        let spaces_dir = self.lookup.spaces_dir();
        if !spaces_dir.exists() {
            return Ok(Vec::new());
        }

        let mut spaces = Vec::new();
        for entry in WalkDir::new(&spaces_dir)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
        {
            ctx.check()?;
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("could not read space directory entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(space_id) = space_id_from_dir(&spaces_dir, entry.path()) else {
                continue;
            };
            let root = match Node::read_node(&self.lookup, &space_id, &space_id) {
                Ok(root) if root.exists => root,
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!(space = %space_id, "could not read space root, skipping: {}", e);
                    continue;
                }
            };
            if !self.permissions_for(ctx, &root)?.stat {
                continue;
            }
            let attrs = root.xattrs()?;
            spaces.push(StorageSpace {
                id: space_id,
                name: attrs.string_or_empty(prefixes::SPACE_NAME_ATTR),
                owner: root.space_owner()?,
                size: attrs.int64_or(prefixes::TREESIZE_ATTR, 0).max(0) as u64,
            });
        }
        spaces.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(spaces)
    }

    // tree

    pub fn create_dir(&self, ctx: &RequestContext, reference: &Reference) -> Result<ResourceInfo, FsError> {
        tracing::debug!(reference = %reference, "create_dir");
        let (parent, name) = self.target_parent(ctx, reference)?;
        let perms = self.permissions_for(ctx, &parent)?;
        if !perms.create_container {
            return Err(perms.deny(reference));
        }
        parent.check_lock(ctx)?;
        let node = self.tree.create_dir(ctx, &parent, &name)?;
        Ok(node.as_resource_info()?)
    }

    /// Create an empty file at `reference`.
    pub fn touch_file(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        mtime: Option<DateTime<Utc>>,
    ) -> Result<ResourceInfo, FsError> {
        tracing::debug!(reference = %reference, "touch_file");
        let (parent, name) = self.target_parent(ctx, reference)?;
        let perms = self.permissions_for(ctx, &parent)?;
        if !perms.initiate_file_upload {
            return Err(perms.deny(reference));
        }
        parent.check_lock(ctx)?;
        let node = self.tree.touch_file(ctx, &parent, &name, mtime)?;
        Ok(node.as_resource_info()?)
    }

    /// Move or rename the node at `from` to `to`. The target must not exist.
    pub fn move_node(
        &self,
        ctx: &RequestContext,
        from: &Reference,
        to: &Reference,
    ) -> Result<ResourceInfo, FsError> {
        tracing::debug!(from = %from, to = %to, "move");
        let (node, perms) = self.stat_node(ctx, from)?;
        if !perms.move_ {
            return Err(perms.deny(from));
        }
        node.check_lock(ctx)?;

        let (new_parent, new_name) = self.target_parent(ctx, to)?;
        let target_perms = self.permissions_for(ctx, &new_parent)?;
        let allowed = if node.is_dir() {
            target_perms.create_container
        } else {
            target_perms.initiate_file_upload
        };
        if !allowed {
            return Err(target_perms.deny(to));
        }

        let moved = self.tree.move_node(ctx, &node, &new_parent, &new_name)?;
        Ok(moved.as_resource_info()?)
    }

    pub fn delete(&self, ctx: &RequestContext, reference: &Reference) -> Result<(), FsError> {
        tracing::debug!(reference = %reference, "delete");
        let (node, perms) = self.stat_node(ctx, reference)?;
        if !perms.delete {
            return Err(perms.deny(reference));
        }
        node.check_lock(ctx)?;
        self.tree.delete(ctx, &node)
    }

    /// Stat.
    pub fn get_md(&self, ctx: &RequestContext, reference: &Reference) -> Result<ResourceInfo, FsError> {
        let (node, _) = self.stat_node(ctx, reference)?;
        Ok(node.as_resource_info()?)
    }

    /// Space relative path of the node at `reference`.
    pub fn get_path(&self, ctx: &RequestContext, reference: &Reference) -> Result<String, FsError> {
        let (node, _) = self.stat_node(ctx, reference)?;
        self.lookup
            .path(ctx, &node, self.tree.propagation().max_depth)
    }

    pub fn list_folder(&self, ctx: &RequestContext, reference: &Reference) -> Result<Vec<ResourceInfo>, FsError> {
        let (node, perms) = self.stat_node(ctx, reference)?;
        if !perms.list_container {
            return Err(perms.deny(reference));
        }
        self.tree
            .list_folder(ctx, &node)?
            .iter()
            .map(|child| child.as_resource_info().map_err(FsError::from))
            .collect()
    }

    /// Stream the current content of the file at `reference`.
    pub fn download(&self, ctx: &RequestContext, reference: &Reference) -> Result<Box<dyn Read + Send>, FsError> {
        let (node, perms) = self.stat_node(ctx, reference)?;
        if !perms.initiate_file_download {
            return Err(perms.deny(reference));
        }
        if node.is_dir() {
            return Err(FsError::InvalidArgument(format!("{} is a container", reference)));
        }
        if node.blob_id.is_empty() {
            return Ok(Box::new(std::io::empty()));
        }
        self.blobstore
            .download(&node)
            .map_err(|e| FsError::internal(format!("could not read blob of {}", node.id), e))
    }

    // external locks

    pub fn set_lock(&self, ctx: &RequestContext, reference: &Reference, lock: &Lock) -> Result<(), FsError> {
        let (node, perms) = self.stat_node(ctx, reference)?;
        if !perms.initiate_file_upload {
            return Err(perms.deny(reference));
        }
        node.set_lock(lock)?;
        tracing::debug!(node = %node.id, lock_id = %lock.lock_id, "lock set");
        Ok(())
    }

    pub fn get_lock(&self, ctx: &RequestContext, reference: &Reference) -> Result<Option<Lock>, FsError> {
        let (node, _) = self.stat_node(ctx, reference)?;
        node.get_lock()
    }

    pub fn unlock(&self, ctx: &RequestContext, reference: &Reference, lock_id: &str) -> Result<(), FsError> {
        let (node, perms) = self.stat_node(ctx, reference)?;
        if !perms.initiate_file_upload {
            return Err(perms.deny(reference));
        }
        node.unlock(lock_id)?;
        tracing::debug!(node = %node.id, lock_id, "lock released");
        Ok(())
    }
}

/// Split a path reference into the reference of its parent and the last name.
pub(crate) fn split_reference(reference: &Reference) -> Result<(Reference, String), FsError> {
    let path = reference.path.trim_end_matches('/');
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (dir, name),
        None => ("", path),
    };
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::InvalidArgument(format!(
            "reference {} does not name an entry",
            reference
        )));
    }
    let parent = Reference {
        resource_id: reference.resource_id.clone(),
        path: if dir.is_empty() { ".".to_string() } else { dir.to_string() },
    };
    Ok((parent, name.to_string()))
}

/// Space ID encoded by a `<spaces>/<sp[0:2]>/<sp[2:]>` directory.
fn space_id_from_dir(spaces_dir: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(spaces_dir).ok()?;
    let mut id = String::new();
    for component in rel.components() {
        id.push_str(component.as_os_str().to_str()?);
    }
    Some(id)
}

/// A storage root keeps the metadata backend it was created with.
fn ensure_backend_marker(root: &Path, kind: BackendKind) -> Result<(), FsError> {
    let marker = root.join(BACKEND_MARKER);
    match fs::read_to_string(&marker) {
        Ok(recorded) => {
            let recorded: BackendKind = recorded
                .trim()
                .parse()
                .map_err(|e| FsError::ConfigError(format!("unreadable backend marker: {}", e)))?;
            if recorded != kind {
                return Err(FsError::ConfigError(format!(
                    "storage root {} uses the {} metadata backend, configured {}",
                    root.display(),
                    recorded,
                    kind
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            fs::write(&marker, kind.to_string())?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
