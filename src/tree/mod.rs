//! Tree mutations
//!
//! Creates, moves, deletes and lists nodes. Structure is kept in two places: the
//! parent ID and name attributes of each node, and the child links inside each
//! container. Both are changed under the parent's lock, and every mutation is
//! followed by a propagation to the ancestors.

pub mod propagate;

use crate::concurrency::{LockSet, LockedFile};
use crate::config::PropagationConfig;
use crate::context::RequestContext;
use crate::error::FsError;
use crate::lookup::{validate_name, Lookup};
use crate::metadata::{prefixes, with_suffix, Attributes};
use crate::node::{format_timestamp, Node};
use crate::types::{NodeType, UserId};
use chrono::{DateTime, Utc};
use std::fs;
use std::sync::Arc;

/// Suffix marking a deleted node, followed by the deletion time.
pub const TRASH_DELIMITER: &str = ".T.";

#[derive(Debug, Clone)]
pub struct Tree {
    lookup: Arc<Lookup>,
    propagation: PropagationConfig,
}

impl Tree {
    pub fn new(lookup: Arc<Lookup>, propagation: PropagationConfig) -> Self {
        Self { lookup, propagation }
    }

    pub fn lookup(&self) -> &Arc<Lookup> {
        &self.lookup
    }

    pub fn propagation(&self) -> &PropagationConfig {
        &self.propagation
    }

    /// Create the root container of a new space. Its node ID is the space ID.
    pub fn create_space_root(
        &self,
        space_id: &str,
        owner: &UserId,
        name: &str,
    ) -> Result<Node, FsError> {
        let path = self.lookup.internal_path(space_id, space_id);
        if fs::symlink_metadata(&path).is_ok() {
            return Err(FsError::AlreadyExists(format!("space {}", space_id)));
        }
        fs::create_dir_all(&path)?;

        let mut attrs = Attributes::new();
        attrs.set_string(prefixes::ID_ATTR, space_id);
        attrs.set_string(prefixes::PARENTID_ATTR, "");
        attrs.set_string(prefixes::NAME_ATTR, name);
        attrs.set_int64(prefixes::TYPE_ATTR, NodeType::Container.as_i64());
        attrs.set_string(prefixes::OWNER_IDP_ATTR, &owner.idp);
        attrs.set_string(prefixes::OWNER_ID_ATTR, &owner.opaque_id);
        attrs.set_string(prefixes::SPACE_NAME_ATTR, name);
        attrs.set_string(prefixes::MTIME_ATTR, &format_timestamp(&Utc::now()));
        attrs.set_int64(prefixes::TREESIZE_ATTR, 0);
        self.lookup
            .backend()
            .set_multiple(&path, &attrs, true)?;

        tracing::info!(space = %space_id, name, "space created");
        Ok(Node::read_node(&self.lookup, space_id, space_id)?)
    }

    /// Create node `id` as child `name` of `parent` and link it.
    ///
    /// The caller holds the parent's lock and has checked that `name` is free.
    /// Returns the node together with its own held lock.
    pub(crate) fn create_node_locked(
        &self,
        parent: &Node,
        name: &str,
        id: &str,
        node_type: NodeType,
        mtime: Option<DateTime<Utc>>,
    ) -> Result<(Node, LockedFile), FsError> {
        validate_name(name)?;
        let path = self.lookup.internal_path(&parent.space_id, id);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        match node_type {
            NodeType::Container => fs::create_dir(&path),
            _ => fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .map(|_| ()),
        }
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                FsError::AlreadyExists(format!("node {}", id))
            } else {
                FsError::from(e)
            }
        })?;

        let remove_node = || {
            let _ = match node_type {
                NodeType::Container => fs::remove_dir_all(&path),
                _ => fs::remove_file(&path),
            };
            let _ = self.lookup.backend().purge(&path);
        };

        let lock = match LockedFile::exclusive(&self.lookup.backend().lockfile_path(&path)) {
            Ok(lock) => lock,
            Err(e) => {
                remove_node();
                return Err(e.into());
            }
        };

        let mut attrs = Attributes::new();
        attrs.set_string(prefixes::ID_ATTR, id);
        attrs.set_string(prefixes::PARENTID_ATTR, &parent.id);
        attrs.set_string(prefixes::NAME_ATTR, name);
        attrs.set_int64(prefixes::TYPE_ATTR, node_type.as_i64());
        attrs.set_string(
            prefixes::MTIME_ATTR,
            &format_timestamp(&mtime.unwrap_or_else(Utc::now)),
        );
        match node_type {
            NodeType::Container => attrs.set_int64(prefixes::TREESIZE_ATTR, 0),
            _ => {
                attrs.set_string(prefixes::BLOBID_ATTR, "");
                attrs.set_int64(prefixes::BLOBSIZE_ATTR, 0);
            }
        }

        let linked = self
            .lookup
            .backend()
            .set_multiple(&path, &attrs, false)
            .map_err(FsError::from)
            .and_then(|_| {
                self.lookup
                    .link_child(&parent.space_id, &parent.id, name, id)
            });
        if let Err(e) = linked {
            remove_node();
            return Err(e);
        }

        let node = Node::read_node(&self.lookup, &parent.space_id, id)?;
        Ok((node, lock))
    }

    fn create_child(
        &self,
        ctx: &RequestContext,
        parent: &Node,
        name: &str,
        node_type: NodeType,
        mtime: Option<DateTime<Utc>>,
    ) -> Result<Node, FsError> {
        validate_name(name)?;
        ctx.check()?;
        if !parent.exists || !parent.is_dir() {
            return Err(FsError::PreconditionFailed(format!(
                "parent {} is not a container",
                parent.id
            )));
        }

        let node = {
            let _parent_lock = LockedFile::exclusive(&parent.lockfile_path())?;
            if parent.child(name)?.exists {
                return Err(FsError::AlreadyExists(name.to_string()));
            }
            let id = uuid::Uuid::new_v4().to_string();
            let (node, _node_lock) = self.create_node_locked(parent, name, &id, node_type, mtime)?;
            node
        };

        tracing::debug!(node = %node.id, parent = %parent.id, name, "node created");
        self.propagate_change(ctx, &node, 0)?;
        Ok(node)
    }

    pub fn create_dir(&self, ctx: &RequestContext, parent: &Node, name: &str) -> Result<Node, FsError> {
        self.create_child(ctx, parent, name, NodeType::Container, None)
    }

    /// Create an empty file.
    pub fn touch_file(
        &self,
        ctx: &RequestContext,
        parent: &Node,
        name: &str,
        mtime: Option<DateTime<Utc>>,
    ) -> Result<Node, FsError> {
        self.create_child(ctx, parent, name, NodeType::File, mtime)
    }

    /// Rename `node` to `new_name` below `new_parent`. The target name must be free.
    pub fn move_node(
        &self,
        ctx: &RequestContext,
        node: &Node,
        new_parent: &Node,
        new_name: &str,
    ) -> Result<Node, FsError> {
        validate_name(new_name)?;
        ctx.check()?;
        if !node.exists {
            return Err(FsError::NotFound(node.id.clone()));
        }
        if node.is_space_root() {
            return Err(FsError::InvalidArgument("cannot move a space root".to_string()));
        }
        if node.space_id != new_parent.space_id {
            return Err(FsError::InvalidArgument("cannot move across spaces".to_string()));
        }
        if !new_parent.exists || !new_parent.is_dir() {
            return Err(FsError::PreconditionFailed(format!(
                "target {} is not a container",
                new_parent.id
            )));
        }
        if node.is_dir() {
            self.ensure_not_ancestor(ctx, node, new_parent)?;
        }

        let old_parent_id = node.parent_id.clone();
        let same_parent = old_parent_id == new_parent.id;
        let size = node.size()?;

        {
            let old_lockfile = self
                .lookup
                .backend()
                .lockfile_path(&self.lookup.internal_path(&node.space_id, &old_parent_id));
            let _locks = LockSet::exclusive(&[
                old_lockfile,
                new_parent.lockfile_path(),
                node.lockfile_path(),
            ])?;
            self.ensure_linked(node)?;
            if !new_parent.is_space_root() {
                self.ensure_linked(new_parent)?;
            }

            if same_parent && node.name == new_name {
                return Ok(node.clone());
            }
            if new_parent.child(new_name)?.exists {
                return Err(FsError::AlreadyExists(new_name.to_string()));
            }

            if same_parent {
                let dir = new_parent.internal_path();
                fs::rename(dir.join(&node.name), dir.join(new_name))?;
            } else {
                self.lookup
                    .link_child(&node.space_id, &new_parent.id, new_name, &node.id)?;
                if let Err(e) = self
                    .lookup
                    .unlink_child(&node.space_id, &old_parent_id, &node.name)
                {
                    let _ = self
                        .lookup
                        .unlink_child(&node.space_id, &new_parent.id, new_name);
                    return Err(e);
                }
            }

            let mut attrs = Attributes::new();
            attrs.set_string(prefixes::PARENTID_ATTR, &new_parent.id);
            attrs.set_string(prefixes::NAME_ATTR, new_name);
            node.set_xattrs(&attrs, false)?;
        }

        let moved = Node::read_node(&self.lookup, &node.space_id, &node.id)?;
        tracing::debug!(node = %node.id, from = %old_parent_id, to = %new_parent.id, name = new_name, "node moved");

        if same_parent {
            self.propagate_change(ctx, &moved, 0)?;
        } else {
            self.propagate_change_from(ctx, &node.space_id, &old_parent_id, -size)?;
            self.propagate_change(ctx, &moved, size)?;
        }
        Ok(moved)
    }

    /// Fail unless `node` is still linked under the parent and name it was
    /// read with. Called with the parent lock held.
    fn ensure_linked(&self, node: &Node) -> Result<(), FsError> {
        let parent = Node::read_node(&self.lookup, &node.space_id, &node.parent_id)?;
        let linked = parent.child(&node.name)?;
        if !linked.exists || linked.id != node.id {
            return Err(FsError::NotFound(node.id.clone()));
        }
        Ok(())
    }

    fn ensure_not_ancestor(
        &self,
        ctx: &RequestContext,
        node: &Node,
        target: &Node,
    ) -> Result<(), FsError> {
        let mut current = target.clone();
        for _ in 0..self.propagation.max_depth {
            ctx.check()?;
            if current.id == node.id {
                return Err(FsError::InvalidArgument(
                    "cannot move a container into itself".to_string(),
                ));
            }
            if current.is_space_root() || current.parent_id.is_empty() {
                return Ok(());
            }
            current = current.parent()?;
        }
        Err(FsError::Internal(format!("ancestors of {} too deep", target.id)))
    }

    /// Unlink `node` from its parent and move it aside as a trashed node.
    pub fn delete(&self, ctx: &RequestContext, node: &Node) -> Result<(), FsError> {
        ctx.check()?;
        if !node.exists {
            return Err(FsError::NotFound(node.id.clone()));
        }
        if node.is_space_root() {
            return Err(FsError::InvalidArgument("cannot delete a space root".to_string()));
        }
        let size = node.size()?;
        let path = node.internal_path();
        let backend = self.lookup.backend();
        let deleted_at = Utc::now();
        let trash_path = with_suffix(
            &path,
            &format!("{}{}", TRASH_DELIMITER, format_timestamp(&deleted_at)),
        );

        {
            let parent_path = self.lookup.internal_path(&node.space_id, &node.parent_id);
            let _locks =
                LockSet::exclusive(&[backend.lockfile_path(&parent_path), node.lockfile_path()])?;
            self.ensure_linked(node)?;

            self.lookup
                .unlink_child(&node.space_id, &node.parent_id, &node.name)?;
            if let Err(e) = fs::rename(&path, &trash_path) {
                let _ = self
                    .lookup
                    .link_child(&node.space_id, &node.parent_id, &node.name, &node.id);
                return Err(e.into());
            }
            backend.rename(&path, &trash_path)?;

            let mut attrs = Attributes::new();
            attrs.set_string(
                prefixes::TRASH_ORIGIN_ATTR,
                &format!("{}/{}", node.parent_id, node.name),
            );
            backend.set_multiple(&trash_path, &attrs, true)?;
            // the node's lock file stays: a waiter may already hold its inode
        }

        tracing::debug!(node = %node.id, parent = %node.parent_id, name = %node.name, "node deleted");
        self.propagate_change(ctx, node, -size)
    }

    /// Children of a container, sorted by name.
    pub fn list_folder(&self, ctx: &RequestContext, node: &Node) -> Result<Vec<Node>, FsError> {
        if !node.exists {
            return Err(FsError::NotFound(node.id.clone()));
        }
        if !node.is_dir() {
            return Err(FsError::InvalidArgument(format!("{} is not a container", node.id)));
        }

        let mut children = Vec::new();
        for entry in fs::read_dir(node.internal_path())? {
            ctx.check()?;
            let entry = entry?;
            if !entry.file_type()?.is_symlink() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let target = fs::read_link(entry.path())?;
            let child_id = Lookup::child_id_from_link(&target);
            let mut child = match Node::read_node(&self.lookup, &node.space_id, &child_id) {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(node = %node.id, child = %child_id, "could not read child, skipping: {}", e);
                    continue;
                }
            };
            if !child.exists {
                tracing::warn!(node = %node.id, child = %child_id, name, "dangling child link, skipping");
                continue;
            }
            if child.name.is_empty() {
                child.name = name;
            }
            children.push(child);
        }
        children.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(children)
    }

    /// Depth-first walk below and including `root`, checking for cancellation
    /// before every node.
    pub fn walk<F>(&self, ctx: &RequestContext, root: &Node, mut visit: F) -> Result<(), FsError>
    where
        F: FnMut(&Node) -> Result<(), FsError>,
    {
        let mut stack = vec![root.clone()];
        while let Some(node) = stack.pop() {
            ctx.check()?;
            visit(&node)?;
            if node.is_dir() {
                let mut children = self.list_folder(ctx, &node)?;
                children.reverse();
                stack.extend(children);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancellationToken;
    use crate::metadata::SidecarBackend;

    fn tree(root: &std::path::Path) -> Tree {
        let lu = Arc::new(Lookup::new(root, Arc::new(SidecarBackend::new())));
        Tree::new(lu, PropagationConfig::default())
    }

    fn owner() -> UserId {
        UserId::new("idp", "alice")
    }

    #[test]
    fn test_create_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        let ctx = RequestContext::anonymous();
        let root = t.create_space_root("space-0001", &owner(), "home").unwrap();
        assert!(root.is_space_root());
        assert!(t.create_space_root("space-0001", &owner(), "home").is_err());

        let docs = t.create_dir(&ctx, &root, "docs").unwrap();
        let file = t.touch_file(&ctx, &root, "a.txt", None).unwrap();
        assert!(matches!(
            t.create_dir(&ctx, &root, "docs"),
            Err(FsError::AlreadyExists(_))
        ));

        let names: Vec<_> = t
            .list_folder(&ctx, &root)
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "docs"]);
        assert_eq!(docs.parent_id, root.id);
        assert_eq!(file.node_type, NodeType::File);
        assert!(matches!(
            t.touch_file(&ctx, &file, "x", None),
            Err(FsError::PreconditionFailed(_))
        ));
    }

    #[test]
    fn test_move_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        let ctx = RequestContext::anonymous();
        let root = t.create_space_root("space-0001", &owner(), "home").unwrap();
        let a = t.create_dir(&ctx, &root, "a").unwrap();
        let b = t.create_dir(&ctx, &root, "b").unwrap();
        let f = t.touch_file(&ctx, &a, "f.txt", None).unwrap();

        let renamed = t.move_node(&ctx, &f, &a, "g.txt").unwrap();
        assert_eq!(renamed.name, "g.txt");
        assert!(!a.child("f.txt").unwrap().exists);

        let moved = t.move_node(&ctx, &renamed, &b, "g.txt").unwrap();
        assert_eq!(moved.parent_id, b.id);
        assert_eq!(b.child("g.txt").unwrap().id, f.id);
        assert!(!a.child("g.txt").unwrap().exists);

        t.touch_file(&ctx, &a, "taken", None).unwrap();
        assert!(matches!(
            t.move_node(&ctx, &moved, &a, "taken"),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_move_into_own_subtree_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        let ctx = RequestContext::anonymous();
        let root = t.create_space_root("space-0001", &owner(), "home").unwrap();
        let a = t.create_dir(&ctx, &root, "a").unwrap();
        let inner = t.create_dir(&ctx, &a, "inner").unwrap();
        assert!(matches!(
            t.move_node(&ctx, &a, &inner, "a"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_delete_moves_node_to_trash() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        let ctx = RequestContext::anonymous();
        let root = t.create_space_root("space-0001", &owner(), "home").unwrap();
        let f = t.touch_file(&ctx, &root, "a.txt", None).unwrap();
        let path = f.internal_path();

        t.delete(&ctx, &f).unwrap();
        assert!(!path.exists());
        assert!(!root.child("a.txt").unwrap().exists);
        let trashed: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(TRASH_DELIMITER) && !n.ends_with(".mpk") && !n.ends_with(".mlock"))
            .collect();
        assert_eq!(trashed.len(), 1);
        assert!(matches!(t.delete(&ctx, &root), Err(FsError::InvalidArgument(_))));
    }

    #[test]
    fn test_delete_keeps_lock_file_of_deleted_node() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        let ctx = RequestContext::anonymous();
        let root = t.create_space_root("space-0001", &owner(), "home").unwrap();
        let f = t.touch_file(&ctx, &root, "a.txt", None).unwrap();
        let lockfile = f.lockfile_path();
        let held = LockedFile::exclusive(&lockfile).unwrap();

        let (t2, f2) = (t.clone(), f.clone());
        let deleter = std::thread::spawn(move || t2.delete(&RequestContext::anonymous(), &f2));
        std::thread::sleep(std::time::Duration::from_millis(50));
        drop(held);
        deleter.join().unwrap().unwrap();

        // late lockers still meet on the same file
        assert!(lockfile.exists());
        let first = LockedFile::exclusive(&lockfile).unwrap();
        assert!(LockedFile::try_exclusive(&lockfile).unwrap().is_none());
        drop(first);
    }

    #[test]
    fn test_stale_handles_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        let ctx = RequestContext::anonymous();
        let root = t.create_space_root("space-0001", &owner(), "home").unwrap();
        let a = t.create_dir(&ctx, &root, "a").unwrap();
        let f = t.touch_file(&ctx, &root, "f", None).unwrap();

        t.move_node(&ctx, &f, &a, "f").unwrap();
        assert!(matches!(t.delete(&ctx, &f), Err(FsError::NotFound(_))));
        assert!(matches!(
            t.move_node(&ctx, &f, &root, "g"),
            Err(FsError::NotFound(_))
        ));
        assert_eq!(a.child("f").unwrap().id, f.id);
    }

    #[test]
    fn test_move_out_of_directory_racing_its_delete() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        let ctx = RequestContext::anonymous();
        let root = t.create_space_root("space-0001", &owner(), "home").unwrap();

        for round in 0..40 {
            let d = t.create_dir(&ctx, &root, &format!("d{}", round)).unwrap();
            let x = t.touch_file(&ctx, &d, "x", None).unwrap();
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let (tx, rx) = std::sync::mpsc::channel();

            {
                let (t, root, barrier, tx) = (t.clone(), root.clone(), barrier.clone(), tx.clone());
                let name = format!("x{}", round);
                std::thread::spawn(move || {
                    barrier.wait();
                    let moved = t.move_node(&RequestContext::anonymous(), &x, &root, &name);
                    tx.send(moved.is_ok()).unwrap();
                });
            }
            {
                let (t, barrier, tx) = (t.clone(), barrier.clone(), tx.clone());
                std::thread::spawn(move || {
                    barrier.wait();
                    t.delete(&RequestContext::anonymous(), &d).unwrap();
                    tx.send(true).unwrap();
                });
            }

            for _ in 0..2 {
                rx.recv_timeout(std::time::Duration::from_secs(10))
                    .unwrap_or_else(|_| panic!("move and delete deadlocked in round {}", round));
            }
        }
    }

    #[test]
    fn test_walk_visits_everything_and_honours_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let t = tree(dir.path());
        let ctx = RequestContext::anonymous();
        let root = t.create_space_root("space-0001", &owner(), "home").unwrap();
        let a = t.create_dir(&ctx, &root, "a").unwrap();
        t.touch_file(&ctx, &a, "1", None).unwrap();
        t.touch_file(&ctx, &root, "2", None).unwrap();

        let mut seen = Vec::new();
        t.walk(&ctx, &root, |n| {
            seen.push(n.name.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec!["home", "2", "a", "1"]);

        let token = CancellationToken::new();
        let cancelled = RequestContext::anonymous().with_cancellation(token.clone());
        let mut visited = 0;
        let result = t.walk(&cancelled, &root, |_| {
            visited += 1;
            token.cancel();
            Ok(())
        });
        assert!(matches!(result, Err(FsError::Aborted(_))));
        assert_eq!(visited, 1);
    }
}
