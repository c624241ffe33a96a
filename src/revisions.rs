//! File revisions
//!
//! Listing, downloading, restoring and deleting the revisions kept beside a
//! node. A revision key is `<node id>.REV.<timestamp>`; the revision itself is
//! a file of that name next to the node carrying a frozen copy of the node's
//! content attributes.
//!
//! Restoring swaps content under the node lock: the current content is frozen
//! into a new revision, the target revision's attributes are promoted onto
//! the node and the target revision is removed. Every step before the swap is
//! committed registers a compensating action so a failed restore leaves the
//! node and its revisions as they were.

use crate::concurrency::{LockedFile, ScopedMutation};
use crate::context::RequestContext;
use crate::error::FsError;
use crate::lookup::validate_id;
use crate::metadata::{prefixes, Attributes};
use crate::node::permissions::ResourcePermissions;
use crate::node::revisions::{is_revision_attr, join_revision_key, split_revision_key, REVISION_ID_DELIMITER};
use crate::node::{calculate_etag, Node};
use crate::storage::Storage;
use crate::types::{FileVersion, Reference};
use crate::upload::revision::{create_revision_node, remove_revision_artifacts, set_file_mtime};
use chrono::Utc;
use std::io::Read;

impl Storage {
    /// Resolve the node owning `revision_key` in the space of `reference`.
    fn revision_owner(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        revision_key: &str,
    ) -> Result<(Node, String, ResourcePermissions), FsError> {
        let (node_id, revision) = split_revision_key(revision_key);
        if revision.is_empty() || revision.contains('/') || validate_id(node_id).is_err() {
            return Err(FsError::NotFound(format!("malformed revision key {:?}", revision_key)));
        }
        ctx.check()?;
        let node = self
            .lookup
            .node_from_id(&reference.resource_id.space_id, node_id)?;
        if !node.exists {
            return Err(FsError::NotFound(reference.to_string()));
        }
        let perms = self.permissions_for(ctx, &node)?;
        Ok((node, revision.to_string(), perms))
    }

    /// Revisions of the file at `reference`, sorted by key.
    pub fn list_revisions(&self, ctx: &RequestContext, reference: &Reference) -> Result<Vec<FileVersion>, FsError> {
        let node = self.resolve(ctx, reference)?;
        if !node.exists {
            return Err(FsError::NotFound(reference.to_string()));
        }
        let perms = self.permissions_for(ctx, &node)?;
        if !perms.list_file_versions {
            return Err(perms.deny(reference));
        }
        self.revisions_of(ctx, &node)
    }

    pub(crate) fn revisions_of(&self, ctx: &RequestContext, node: &Node) -> Result<Vec<FileVersion>, FsError> {
        let node_path = node.internal_path();
        let pattern = format!(
            "{}{}*",
            glob::Pattern::escape(&node_path.to_string_lossy()),
            REVISION_ID_DELIMITER
        );
        let entries = glob::glob(&pattern)
            .map_err(|e| FsError::internal(format!("invalid revision pattern for {}", node.id), e))?;

        let backend = self.lookup.backend();
        let mut versions = Vec::new();
        for entry in entries {
            ctx.check()?;
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::error!(node = %node.id, "could not read revision entry, skipping: {}", e);
                    continue;
                }
            };
            if backend.is_meta_file(&path) {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let (_, revision) = split_revision_key(file_name);
            if revision.is_empty() {
                continue;
            }

            let revision_node = match node.read_revision(revision) {
                Ok(rn) if rn.exists => rn,
                Ok(_) => continue,
                Err(e) => {
                    tracing::error!(node = %node.id, revision, "could not read revision, skipping: {}", e);
                    continue;
                }
            };
            let mtime = match revision_node.mtime() {
                Ok(mtime) => mtime,
                Err(e) => {
                    tracing::error!(node = %node.id, revision, "could not read revision mtime, skipping: {}", e);
                    continue;
                }
            };
            versions.push(FileVersion {
                key: join_revision_key(&node.id, revision),
                mtime: mtime.timestamp().max(0) as u64,
                size: revision_node.blobsize.max(0) as u64,
                etag: calculate_etag(&revision_node, &mtime),
            });
        }
        versions.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(versions)
    }

    /// Stream the content of revision `revision_key`.
    pub fn download_revision(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        revision_key: &str,
    ) -> Result<Box<dyn Read + Send>, FsError> {
        let (node, revision, perms) = self.revision_owner(ctx, reference, revision_key)?;
        if !(perms.list_file_versions && perms.initiate_file_download) {
            return Err(perms.deny(reference));
        }

        let revision_node = node
            .read_revision(&revision)
            .map_err(|e| FsError::internal(format!("could not read revision {}", revision_key), e))?;
        if !revision_node.exists {
            return Err(FsError::NotFound(revision_key.to_string()));
        }
        if revision_node.blob_id.is_empty() {
            return Ok(Box::new(std::io::empty()));
        }
        self.blobstore
            .download(&revision_node)
            .map_err(|e| FsError::internal(format!("could not read blob of revision {}", revision_key), e))
    }

    /// Make revision `revision_key` the current content of its node. The
    /// previous content becomes a new revision whose key is returned.
    pub fn restore_revision(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        revision_key: &str,
    ) -> Result<String, FsError> {
        tracing::debug!(reference = %reference, revision = revision_key, "restore_revision");
        let (node, revision, perms) = self.revision_owner(ctx, reference, revision_key)?;
        if !perms.restore_file_version {
            return Err(perms.deny(reference));
        }
        node.check_lock(ctx)?;

        let mut mutation = ScopedMutation::begin(LockedFile::exclusive(&node.lockfile_path())?);
        let current = Node::read_node(&self.lookup, &node.space_id, &node.id)?;
        if !current.exists {
            return Err(FsError::NotFound(reference.to_string()));
        }
        let target = current
            .read_revision(&revision)
            .map_err(|e| FsError::internal(format!("could not read revision {}", revision_key), e))?;
        if !target.exists {
            return Err(FsError::NotFound(revision_key.to_string()));
        }

        let backend = self.lookup.backend();
        let node_path = current.internal_path();
        let target_path = target.internal_path();
        let original_size = current.blobsize;
        let original: Attributes = current
            .xattrs()?
            .into_iter()
            .filter(|(k, _)| is_revision_attr(k))
            .collect();
        let promoted: Attributes = backend
            .all(&target_path)
            .map_err(|e| FsError::internal(format!("could not read revision {}", revision_key), e))?
            .into_iter()
            .filter(|(k, _)| is_revision_attr(k))
            .collect();

        // freeze the current content
        let old_mtime = current.mtime()?;
        let demoted = current.revision_node(&current.unused_revision_timestamp(old_mtime));
        let demoted_path = demoted.internal_path();
        let demoted_lock = create_revision_node(&self.lookup, &demoted)?;
        {
            let backend = self.lookup.backend_arc();
            let path = demoted_path.clone();
            mutation.on_rollback("remove demoted revision", move || {
                remove_revision_artifacts(backend.as_ref(), &path)
            });
        }
        self.lookup
            .copy_metadata_with_source_lock(
                &node_path,
                &demoted_path,
                |k, v| is_revision_attr(k).then(|| v.to_vec()),
                mutation.lock(),
                false,
            )
            .map_err(|e| FsError::internal("could not copy metadata to revision", e))?;
        if let Err(e) = set_file_mtime(&demoted_path, old_mtime) {
            tracing::warn!(revision = %demoted.id, "could not set revision file mtime: {}", e);
        }

        // promote the target onto the node
        {
            let backend = self.lookup.backend_arc();
            let path = node_path.clone();
            let original = original.clone();
            let added: Vec<String> = promoted
                .keys()
                .filter(|k| !original.contains(k))
                .map(str::to_string)
                .collect();
            mutation.on_rollback("restore node content attributes", move || {
                backend.set_multiple(&path, &original, false)?;
                for key in &added {
                    backend.remove(&path, key, false)?;
                }
                Ok(())
            });
        }
        backend
            .set_multiple(&node_path, &promoted, false)
            .map_err(|e| FsError::internal("could not promote revision", e))?;
        for stale in original
            .keys()
            .filter(|k| k.starts_with(prefixes::CHECKSUM_PREFIX) && !promoted.contains(k))
        {
            backend
                .remove(&node_path, stale, false)
                .map_err(|e| FsError::internal("could not remove stale checksum", e))?;
        }
        current
            .set_mtime(&Utc::now(), false)
            .map_err(|e| FsError::internal("could not update mtime", e))?;

        let node_lock = mutation.commit();
        drop(demoted_lock);

        if let Err(e) = remove_revision_artifacts(backend, &target_path) {
            tracing::warn!(node = %current.id, revision = %target.id, "could not remove restored revision: {}", e);
        }
        drop(node_lock);

        let size_diff = target.blobsize - original_size;
        tracing::info!(node = %current.id, revision = revision_key, new_revision = %demoted.id, size_diff, "revision restored");
        self.tree.propagate_change(ctx, &current, size_diff)?;
        Ok(demoted.id)
    }

    /// Remove revision `revision_key` and its blob.
    pub fn delete_revision(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        revision_key: &str,
    ) -> Result<(), FsError> {
        tracing::debug!(reference = %reference, revision = revision_key, "delete_revision");
        let (node, revision, perms) = self.revision_owner(ctx, reference, revision_key)?;
        if !perms.restore_file_version {
            return Err(FsError::PermissionDenied(format!(
                "deleting revision {} not allowed",
                revision_key
            )));
        }
        node.check_lock(ctx)?;

        let _lock = LockedFile::exclusive(&node.lockfile_path())?;
        let current = Node::read_node(&self.lookup, &node.space_id, &node.id)?;
        let target = current
            .read_revision(&revision)
            .map_err(|e| FsError::internal(format!("could not read revision {}", revision_key), e))?;
        if !target.exists {
            return Err(FsError::NotFound(revision_key.to_string()));
        }

        remove_revision_artifacts(self.lookup.backend(), &target.internal_path())
            .map_err(|e| FsError::internal(format!("could not remove revision {}", revision_key), e))?;
        if !target.blob_id.is_empty() && target.blob_id != current.blob_id {
            self.blobstore
                .delete(&target)
                .map_err(|e| FsError::internal(format!("could not delete blob of revision {}", revision_key), e))?;
        }
        tracing::info!(node = %current.id, revision = revision_key, "revision deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PropagationConfig;
    use crate::metadata::failing::FailingBackend;
    use crate::metadata::SidecarBackend;
    use crate::storage::StorageOptions;
    use crate::types::{User, UserId};
    use crate::upload::UploadOptions;
    use std::path::Path;
    use std::sync::Arc;

    fn storage(root: &Path) -> Storage {
        Storage::new(
            root,
            Arc::new(SidecarBackend::new()),
            PropagationConfig::default(),
            StorageOptions::default(),
        )
    }

    fn alice() -> RequestContext {
        RequestContext::new(User::new(UserId::new("idp", "alice"), "alice"))
    }

    fn read_all(mut r: Box<dyn Read + Send>) -> String {
        let mut s = String::new();
        r.read_to_string(&mut s).unwrap();
        s
    }

    #[test]
    fn test_no_revisions_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let fs = storage(dir.path());
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let file = Reference::space_path(&space.id, "./a.txt");
        fs.upload(&ctx, &file, &b"one"[..], UploadOptions::default()).unwrap();
        assert!(fs.list_revisions(&ctx, &file).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_keys_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let fs = storage(dir.path());
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let file = Reference::space_path(&space.id, "./a.txt");
        fs.upload(&ctx, &file, &b"one"[..], UploadOptions::default()).unwrap();

        for key in ["no-delimiter", ".REV.2024-01-01T00:00:00.000000000Z", "x/y.REV.1"] {
            assert!(fs.download_revision(&ctx, &file, key).err().unwrap().is_not_found(), "{}", key);
            assert!(fs.restore_revision(&ctx, &file, key).unwrap_err().is_not_found(), "{}", key);
        }
    }

    #[test]
    fn test_download_and_delete_revision() {
        let dir = tempfile::tempdir().unwrap();
        let fs = storage(dir.path());
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let file = Reference::space_path(&space.id, "./a.txt");
        fs.upload(&ctx, &file, &b"one"[..], UploadOptions::default()).unwrap();
        fs.upload(&ctx, &file, &b"two!"[..], UploadOptions::default()).unwrap();

        let versions = fs.list_revisions(&ctx, &file).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].size, 3);
        assert_eq!(read_all(fs.download_revision(&ctx, &file, &versions[0].key).unwrap()), "one");

        fs.delete_revision(&ctx, &file, &versions[0].key).unwrap();
        assert!(fs.list_revisions(&ctx, &file).unwrap().is_empty());
        assert!(fs
            .download_revision(&ctx, &file, &versions[0].key)
            .err().unwrap()
            .is_not_found());
        assert_eq!(read_all(fs.download(&ctx, &file).unwrap()), "two!");
    }

    #[test]
    fn test_restore_swaps_content() {
        let dir = tempfile::tempdir().unwrap();
        let fs = storage(dir.path());
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let file = Reference::space_path(&space.id, "./a.txt");
        fs.upload(&ctx, &file, &b"one"[..], UploadOptions::default()).unwrap();
        fs.upload(&ctx, &file, &b"two!"[..], UploadOptions::default()).unwrap();
        let old = fs.list_revisions(&ctx, &file).unwrap().remove(0);

        let new_key = fs.restore_revision(&ctx, &file, &old.key).unwrap();
        assert_ne!(new_key, old.key);
        assert_eq!(read_all(fs.download(&ctx, &file).unwrap()), "one");
        assert_eq!(fs.get_md(&ctx, &file).unwrap().size, 3);

        let keys: Vec<_> = fs
            .list_revisions(&ctx, &file)
            .unwrap()
            .into_iter()
            .map(|v| v.key)
            .collect();
        assert_eq!(keys, vec![new_key.clone()]);
        assert_eq!(read_all(fs.download_revision(&ctx, &file, &new_key).unwrap()), "two!");
    }

    #[test]
    fn test_locked_node_cannot_be_restored() {
        let dir = tempfile::tempdir().unwrap();
        let fs = storage(dir.path());
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let file = Reference::space_path(&space.id, "./a.txt");
        fs.upload(&ctx, &file, &b"one"[..], UploadOptions::default()).unwrap();
        fs.upload(&ctx, &file, &b"two"[..], UploadOptions::default()).unwrap();
        let key = fs.list_revisions(&ctx, &file).unwrap().remove(0).key;

        fs.set_lock(&ctx, &file, &crate::node::locks::Lock::new("l1")).unwrap();
        assert!(matches!(
            fs.restore_revision(&ctx, &file, &key),
            Err(FsError::Locked(_))
        ));
        assert_eq!(fs.list_revisions(&ctx, &file).unwrap().len(), 1);
    }

    #[test]
    fn test_failed_promote_rolls_restore_back() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(FailingBackend::new());
        let fs = Storage::new(
            dir.path(),
            backend.clone(),
            PropagationConfig::default(),
            StorageOptions::default(),
        );
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let file = Reference::space_path(&space.id, "./a.txt");
        fs.upload(&ctx, &file, &b"one"[..], UploadOptions::default()).unwrap();
        fs.upload(&ctx, &file, &b"two!"[..], UploadOptions::default()).unwrap();

        let keys_before: Vec<_> = fs
            .list_revisions(&ctx, &file)
            .unwrap()
            .into_iter()
            .map(|v| v.key)
            .collect();
        let checksums = |node: &Node| -> Attributes {
            node.xattrs()
                .unwrap()
                .into_iter()
                .filter(|(k, _)| k.starts_with(prefixes::CHECKSUM_PREFIX))
                .collect()
        };
        let before = fs.resolve(&ctx, &file).unwrap();
        assert_eq!(checksums(&before).len(), 3);

        backend.fail_next_write(&before.internal_path(), prefixes::BLOBID_ATTR);
        let err = fs.restore_revision(&ctx, &file, &keys_before[0]).unwrap_err();
        assert!(matches!(err, FsError::Internal(_)), "{:?}", err);
        assert!(!backend.armed());

        let keys_after: Vec<_> = fs
            .list_revisions(&ctx, &file)
            .unwrap()
            .into_iter()
            .map(|v| v.key)
            .collect();
        assert_eq!(keys_after, keys_before);

        let after = fs.resolve(&ctx, &file).unwrap();
        assert_eq!(after.blob_id, before.blob_id);
        assert_eq!(after.blobsize, 4);
        assert_eq!(checksums(&after), checksums(&before));
        assert_eq!(read_all(fs.download(&ctx, &file).unwrap()), "two!");
        assert_eq!(
            read_all(fs.download_revision(&ctx, &file, &keys_before[0]).unwrap()),
            "one"
        );

        // the untouched revision still restores
        fs.restore_revision(&ctx, &file, &keys_before[0]).unwrap();
        assert_eq!(read_all(fs.download(&ctx, &file).unwrap()), "one");
    }
}
