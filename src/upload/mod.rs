//! Uploads
//!
//! An upload goes through three steps. `initiate_upload` records a session,
//! `write_upload_chunk` writes bytes at the recorded session offset and
//! `finish_upload` turns the received bytes into the node's new content,
//! keeping the previous content as a revision.

pub mod revision;
pub mod session;

use self::revision::{
    create_revision_node, remove_revision_artifacts, set_file_mtime, set_node_to_upload_locked,
    RevisionMetadata,
};
use self::session::{read_metadata, update_metadata, write_metadata, Session};
use crate::concurrency::{LockedFile, ScopedMutation};
use crate::context::RequestContext;
use crate::error::{FsError, StorageError};
use crate::lookup::{validate_id, Lookup};
use crate::metadata::{is_not_exist, prefixes, with_suffix, LOCK_SUFFIX};
use crate::node::revisions::is_revision_attr;
use crate::node::{format_timestamp, parse_timestamp, Node};
use crate::storage::{split_reference, Storage};
use crate::types::{Reference, ResourceInfo};
use chrono::{DateTime, Utc};
use sha1::Digest;
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const CHUNK_SIZE: usize = 64 * 1024;

/// Conditions and metadata supplied when an upload is initiated.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    /// Expected checksum as `<algorithm> <hex digest>`, e.g. `sha1 2fd4...`
    pub checksum: Option<String>,
    pub mtime: Option<DateTime<Utc>>,
    pub if_match: Option<String>,
    pub if_none_match: Option<String>,
    pub if_unmodified_since: Option<DateTime<Utc>>,
    /// Lock token to present when the target is locked
    pub lock_id: Option<String>,
}

/// Digests of an uploaded file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checksums {
    pub sha1: Vec<u8>,
    pub md5: Vec<u8>,
    pub adler32: Vec<u8>,
}

impl Checksums {
    fn digest(&self, algorithm: &str) -> Option<&[u8]> {
        match algorithm {
            prefixes::CHECKSUM_SHA1 => Some(&self.sha1),
            prefixes::CHECKSUM_MD5 => Some(&self.md5),
            prefixes::CHECKSUM_ADLER32 => Some(&self.adler32),
            _ => None,
        }
    }
}

/// SHA1, MD5 and Adler-32 of the file at `path`, read once.
pub fn compute_checksums(path: &Path) -> Result<Checksums, StorageError> {
    let mut file = fs::File::open(path).map_err(|e| crate::metadata::io_error(path, e))?;
    let mut sha1 = sha1::Sha1::new();
    let mut md5 = md5::Md5::new();
    let mut adler = adler::Adler32::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sha1.update(&buf[..n]);
        md5.update(&buf[..n]);
        adler.write_slice(&buf[..n]);
    }
    Ok(Checksums {
        sha1: sha1.finalize().to_vec(),
        md5: md5.finalize().to_vec(),
        adler32: adler.checksum().to_be_bytes().to_vec(),
    })
}

/// Compare `expected` (`<algorithm> <hex>` or `<algorithm>:<hex>`) against the
/// computed digests. An empty expectation always passes.
pub fn verify_checksum(expected: &str, sums: &Checksums) -> Result<(), FsError> {
    let expected = expected.trim();
    if expected.is_empty() {
        return Ok(());
    }
    let (algorithm, hex_digest) = expected
        .split_once(|c: char| c == ' ' || c == ':')
        .ok_or_else(|| FsError::InvalidArgument(format!("malformed checksum {:?}", expected)))?;
    let algorithm = algorithm.trim().to_ascii_lowercase();
    let digest = sums
        .digest(&algorithm)
        .ok_or_else(|| FsError::InvalidArgument(format!("unsupported checksum algorithm {}", algorithm)))?;
    if !hex::encode(digest).eq_ignore_ascii_case(hex_digest.trim()) {
        return Err(FsError::PreconditionFailed(format!("{} checksum mismatch", algorithm)));
    }
    Ok(())
}

fn upload_lockfile(lookup: &Lookup, upload_id: &str) -> PathBuf {
    with_suffix(&lookup.upload_path(upload_id), LOCK_SUFFIX)
}

/// Remove session, data and lock file of an upload. Missing files are fine.
fn remove_upload_files(lookup: &Lookup, upload_id: &str) {
    for path in [
        lookup.upload_path(upload_id),
        lookup.upload_data_path(upload_id),
        upload_lockfile(lookup, upload_id),
    ] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(upload_id, path = %path.display(), "could not remove upload file: {}", e),
        }
    }
}

fn ensure_executant(ctx: &RequestContext, session: &Session) -> Result<(), FsError> {
    if session.executant_id.is_empty() {
        return Ok(());
    }
    match ctx.user() {
        Some(user) if user.id == session.executant() => Ok(()),
        _ => Err(FsError::PermissionDenied(format!("upload {} belongs to another user", session.id))),
    }
}

fn read_session(lookup: &Lookup, upload_id: &str) -> Result<Session, FsError> {
    read_metadata(lookup, upload_id).map_err(|e| {
        if is_not_exist(&e) {
            FsError::NotFound(format!("upload {}", upload_id))
        } else {
            FsError::internal("could not read upload metadata", e)
        }
    })
}

impl Storage {
    /// Start an upload to the file at `reference`. `length` is the declared
    /// size if known. Returns the upload ID.
    pub fn initiate_upload(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        length: Option<u64>,
        options: UploadOptions,
    ) -> Result<String, FsError> {
        ctx.check()?;
        tracing::debug!(reference = %reference, ?length, "initiate_upload");
        let rid = &reference.resource_id;

        let mut session = Session::default();
        let target_by_id =
            reference.path.is_empty() && !rid.opaque_id.is_empty() && rid.opaque_id != rid.space_id;
        if target_by_id {
            let node = self.resolve(ctx, reference)?;
            if !node.exists {
                return Err(FsError::NotFound(reference.to_string()));
            }
            let perms = self.permissions_for(ctx, &node)?;
            if !perms.initiate_file_upload {
                return Err(perms.deny(reference));
            }
            if node.is_dir() {
                return Err(FsError::InvalidArgument(format!("{} is a container", reference)));
            }
            node.check_lock(&self.upload_context(ctx, &options))?;
            session.node_id = node.id.clone();
            session.node_parent_id = node.parent_id.clone();
            session.filename = node.name.clone();
        } else {
            let (parent_ref, name) = split_reference(reference)?;
            let parent = self.resolve(ctx, &parent_ref)?;
            if !parent.exists || !parent.is_dir() {
                return Err(FsError::PreconditionFailed(format!("parent {} does not exist", parent_ref)));
            }
            let perms = self.permissions_for(ctx, &parent)?;
            if !perms.initiate_file_upload {
                return Err(perms.deny(reference));
            }
            let child = parent.child(&name)?;
            if child.exists {
                if child.is_dir() {
                    return Err(FsError::InvalidArgument(format!("{} is a container", reference)));
                }
                child.check_lock(&self.upload_context(ctx, &options))?;
            }
            session.node_parent_id = parent.id.clone();
            session.filename = name;
        }

        let upload_id = uuid::Uuid::new_v4().to_string();
        let space_owner = self
            .lookup
            .node_from_id(&rid.space_id, &rid.space_id)?
            .space_owner()?;

        session.id = upload_id.clone();
        session.space_root = rid.space_id.clone();
        session.space_owner_or_manager = space_owner.map(|o| o.opaque_id).unwrap_or_default();
        session.provider_id = self.options.provider_id.clone();
        session.mtime = options.mtime.as_ref().map(format_timestamp).unwrap_or_default();
        if let Some(user) = ctx.user() {
            session.executant_idp = user.id.idp.clone();
            session.executant_id = user.id.opaque_id.clone();
            session.executant_type = "primary".to_string();
            session.executant_user_name = user.username.clone();
        }
        session.checksum = options.checksum.unwrap_or_default();
        session.lock_id = options
            .lock_id
            .or_else(|| ctx.lock_id().map(str::to_string))
            .unwrap_or_default();
        session.header_if_match = options.if_match.unwrap_or_default();
        session.header_if_none_match = options.if_none_match.unwrap_or_default();
        session.header_if_unmodified_since = options
            .if_unmodified_since
            .as_ref()
            .map(format_timestamp)
            .unwrap_or_default();
        session.size = length.map(|l| l as i64).unwrap_or(-1);
        session.offset = 0;
        session.expires = Some(Utc::now() + self.options.upload_expiry);

        write_metadata(&self.lookup, &upload_id, &session)
            .map_err(|e| FsError::internal("could not write upload metadata", e))?;
        if let Err(e) = fs::File::create(self.lookup.upload_data_path(&upload_id)) {
            remove_upload_files(&self.lookup, &upload_id);
            return Err(e.into());
        }

        tracing::info!(upload_id = %upload_id, space = %session.space_root, name = %session.filename, "upload initiated");
        Ok(upload_id)
    }

    fn upload_context(&self, ctx: &RequestContext, options: &UploadOptions) -> RequestContext {
        match &options.lock_id {
            Some(lock_id) => ctx.clone().with_lock_id(lock_id.clone()),
            None => ctx.clone(),
        }
    }

    /// Current state of an upload session.
    pub fn get_upload(&self, ctx: &RequestContext, upload_id: &str) -> Result<Session, FsError> {
        validate_id(upload_id)?;
        let session = read_session(&self.lookup, upload_id)?;
        ensure_executant(ctx, &session)?;
        Ok(session)
    }

    /// Write `data` at `offset`, which must be the session's recorded offset.
    /// Returns the new offset.
    pub fn write_upload_chunk(
        &self,
        ctx: &RequestContext,
        upload_id: &str,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, FsError> {
        ctx.check()?;
        validate_id(upload_id)?;
        let _lock = LockedFile::exclusive(&upload_lockfile(&self.lookup, upload_id))?;
        let mut session = read_session(&self.lookup, upload_id)?;
        if session.is_expired(Utc::now()) {
            return Err(FsError::NotFound(format!("upload {} expired", upload_id)));
        }
        ensure_executant(ctx, &session)?;

        if offset as i64 != session.offset {
            return Err(FsError::PreconditionFailed(format!(
                "offset {} does not match upload offset {}",
                offset, session.offset
            )));
        }
        let end = session.offset + data.len() as i64;
        if session.size >= 0 && end > session.size {
            return Err(FsError::InvalidArgument(format!(
                "chunk ends at {} past declared length {}",
                end, session.size
            )));
        }

        let data_path = self.lookup.upload_data_path(upload_id);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&data_path)
            .map_err(|e| FsError::from(crate::metadata::io_error(&data_path, e)))?;
        // bytes past the recorded offset belong to a write that never got recorded
        file.set_len(session.offset as u64)?;
        file.seek(SeekFrom::Start(session.offset as u64))?;
        file.write_all(data)?;
        file.sync_data()?;

        session.offset = end;
        write_metadata(&self.lookup, upload_id, &session)
            .map_err(|e| FsError::internal("could not write upload metadata", e))?;
        tracing::trace!(upload_id, offset = end, "chunk written");
        Ok(end as u64)
    }

    /// Turn a fully received upload into the target node's content.
    pub fn finish_upload(&self, ctx: &RequestContext, upload_id: &str) -> Result<ResourceInfo, FsError> {
        ctx.check()?;
        validate_id(upload_id)?;
        let _upload_lock = LockedFile::exclusive(&upload_lockfile(&self.lookup, upload_id))?;
        let session = read_session(&self.lookup, upload_id)?;
        ensure_executant(ctx, &session)?;
        if session.size >= 0 && session.offset != session.size {
            return Err(FsError::PreconditionFailed(format!(
                "upload {} incomplete: {} of {} bytes",
                upload_id, session.offset, session.size
            )));
        }

        let data_path = self.lookup.upload_data_path(upload_id);
        let received = fs::metadata(&data_path)
            .map_err(|e| FsError::from(crate::metadata::io_error(&data_path, e)))?
            .len();
        if received != session.offset as u64 {
            return Err(FsError::PreconditionFailed(format!(
                "upload {} holds {} bytes but {} were recorded",
                upload_id, received, session.offset
            )));
        }
        let size = session.offset;

        let (session, node) = update_metadata(ctx, &self.tree, upload_id, size, session)?;

        let (size_diff, updated) = match self.finalize_upload(upload_id, &session, &node, &data_path) {
            Ok(done) => done,
            Err(e) => {
                if let Err(ue) = node.unmark_processing(upload_id, true) {
                    tracing::warn!(upload_id, node = %node.id, "could not clear processing status: {}", ue);
                }
                // a session whose bytes went into a rolled back blob cannot be retried
                if matches!(e, FsError::PreconditionFailed(_)) || !data_path.exists() {
                    remove_upload_files(&self.lookup, upload_id);
                }
                return Err(e);
            }
        };

        remove_upload_files(&self.lookup, upload_id);
        tracing::info!(upload_id, node = %updated.id, size, size_diff, "upload finished");
        self.tree.propagate_change(ctx, &updated, size_diff)?;
        Ok(updated.as_resource_info()?)
    }

    /// Store the blob, demote the current content and point the node at the
    /// upload. Runs under the node lock; on failure the blob and the demoted
    /// revision are removed again.
    fn finalize_upload(
        &self,
        upload_id: &str,
        session: &Session,
        node: &Node,
        data_path: &Path,
    ) -> Result<(i64, Node), FsError> {
        let sums = compute_checksums(data_path)
            .map_err(|e| FsError::internal("could not checksum upload", e))?;
        verify_checksum(&session.checksum, &sums)?;

        let mut blob_node = node.clone();
        blob_node.blob_id = uuid::Uuid::new_v4().to_string();
        self.blobstore
            .upload(&blob_node, data_path)
            .map_err(|e| FsError::internal("could not store blob", e))?;

        let mut mutation = ScopedMutation::begin(LockedFile::exclusive(&node.lockfile_path())?);
        {
            let blobstore = self.blobstore.clone();
            let blob_node = blob_node.clone();
            mutation.on_rollback("delete uploaded blob", move || blobstore.delete(&blob_node));
        }

        let current = Node::read_node(&self.lookup, &node.space_id, &node.id)?;
        if !current.exists {
            return Err(FsError::NotFound(node.id.clone()));
        }

        if !current.blob_id.is_empty() {
            let old_mtime = current.mtime()?;
            let revision = current.revision_node(&current.unused_revision_timestamp(old_mtime));
            let revision_path = revision.internal_path();
            let _revision_lock = create_revision_node(&self.lookup, &revision)?;
            {
                let backend = self.lookup.backend_arc();
                let path = revision_path.clone();
                mutation.on_rollback("remove demoted revision", move || {
                    remove_revision_artifacts(backend.as_ref(), &path)
                });
            }
            self.lookup
                .copy_metadata_with_source_lock(
                    &current.internal_path(),
                    &revision_path,
                    |k, v| is_revision_attr(k).then(|| v.to_vec()),
                    mutation.lock(),
                    false,
                )
                .map_err(|e| FsError::internal("could not copy metadata to revision", e))?;
            if let Err(e) = set_file_mtime(&revision_path, old_mtime) {
                tracing::warn!(revision = %revision.id, "could not set revision file mtime: {}", e);
            }
            tracing::debug!(node = %current.id, revision = %revision.id, "previous content kept as revision");
        }

        let mtime = if session.mtime.is_empty() {
            None
        } else {
            Some(parse_timestamp(&session.mtime).map_err(|e| {
                FsError::InvalidArgument(format!("invalid mtime {:?}: {}", session.mtime, e))
            })?)
        };
        let rm = RevisionMetadata {
            mtime,
            blob_id: blob_node.blob_id.clone(),
            blob_size: session.blob_size,
            checksum_sha1: sums.sha1,
            checksum_md5: sums.md5,
            checksum_adler32: sums.adler32,
        };
        let (size_diff, updated) = set_node_to_upload_locked(&self.lookup, &current, rm, mutation.lock())?;
        updated
            .unmark_processing(upload_id, false)
            .map_err(|e| FsError::internal("could not clear processing status", e))?;

        let _node_lock = mutation.commit();
        Ok((size_diff, updated))
    }

    /// Upload `reader` to `reference` in one go.
    pub fn upload(
        &self,
        ctx: &RequestContext,
        reference: &Reference,
        mut reader: impl Read,
        options: UploadOptions,
    ) -> Result<ResourceInfo, FsError> {
        let upload_id = self.initiate_upload(ctx, reference, None, options)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut offset = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            offset = self.write_upload_chunk(ctx, upload_id.as_str(), offset, &buf[..n])?;
        }
        self.finish_upload(ctx, &upload_id)
    }

    /// Remove upload sessions that expired before `now`. Sessions currently
    /// being written or finished are skipped. Returns the number removed.
    pub fn purge_expired_uploads(&self, now: DateTime<Utc>) -> Result<usize, FsError> {
        let dir = self.lookup.uploads_dir();
        if !dir.exists() {
            return Ok(0);
        }

        let mut purged = 0;
        for entry in WalkDir::new(&dir).min_depth(1).max_depth(1) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("could not read upload directory entry: {}", e);
                    continue;
                }
            };
            let Some(upload_id) = Lookup::upload_id_from_path(entry.path()) else {
                continue;
            };
            let Some(_lock) = LockedFile::try_exclusive(&upload_lockfile(&self.lookup, &upload_id))? else {
                tracing::debug!(upload_id = %upload_id, "upload busy, not purging");
                continue;
            };
            let session = match read_metadata(&self.lookup, &upload_id) {
                Ok(session) => session,
                Err(e) => {
                    tracing::error!(upload_id = %upload_id, "could not read upload session, skipping: {}", e);
                    continue;
                }
            };
            if !session.is_expired(now) {
                continue;
            }

            if !session.node_id.is_empty() {
                match Node::read_node(&self.lookup, &session.space_root, &session.node_id) {
                    Ok(node) if node.exists => {
                        if let Err(e) = node.unmark_processing(&upload_id, true) {
                            tracing::warn!(upload_id = %upload_id, node = %node.id, "could not clear processing status: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(upload_id = %upload_id, "could not read upload target: {}", e),
                }
            }
            remove_upload_files(&self.lookup, &upload_id);
            tracing::info!(upload_id = %upload_id, "expired upload purged");
            purged += 1;
        }
        Ok(purged)
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
    use chrono::Duration;
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

    #[test]
    fn test_checksums_of_known_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"hello").unwrap();
        let sums = compute_checksums(&path).unwrap();
        assert_eq!(hex::encode(&sums.sha1), "aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d");
        assert_eq!(hex::encode(&sums.md5), "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(hex::encode(&sums.adler32), "062c0215");

        assert!(verify_checksum("", &sums).is_ok());
        assert!(verify_checksum("SHA1 AAF4C61DDCC5E8A2DABEDE0F3B482CD9AEA9434D", &sums).is_ok());
        assert!(verify_checksum("adler32:062c0215", &sums).is_ok());
        assert!(matches!(
            verify_checksum("md5 00", &sums),
            Err(FsError::PreconditionFailed(_))
        ));
        assert!(matches!(
            verify_checksum("crc32 00", &sums),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_chunked_upload_creates_node() {
        let dir = tempfile::tempdir().unwrap();
        let fs = storage(dir.path());
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let target = Reference::space_path(&space.id, "./a.txt");

        let id = fs
            .initiate_upload(&ctx, &target, Some(6), UploadOptions::default())
            .unwrap();
        assert_eq!(fs.write_upload_chunk(&ctx, &id, 0, b"abc").unwrap(), 3);
        assert!(matches!(
            fs.write_upload_chunk(&ctx, &id, 1, b"def"),
            Err(FsError::PreconditionFailed(_))
        ));
        assert!(matches!(
            fs.write_upload_chunk(&ctx, &id, 3, b"defg"),
            Err(FsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.finish_upload(&ctx, &id),
            Err(FsError::PreconditionFailed(_))
        ));
        fs.write_upload_chunk(&ctx, &id, 3, b"def").unwrap();

        let info = fs.finish_upload(&ctx, &id).unwrap();
        assert_eq!(info.size, 6);
        assert!(!info.processing);
        assert!(!fs.lookup().upload_path(&id).exists());

        let mut content = String::new();
        fs.download(&ctx, &target)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "abcdef");
    }

    fn read_content(fs: &Storage, ctx: &RequestContext, target: &Reference) -> String {
        let mut content = String::new();
        fs.download(ctx, target)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content
    }

    fn append_unrecorded(fs: &Storage, upload_id: &str, data: &[u8]) {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(fs.lookup().upload_data_path(upload_id))
            .unwrap();
        file.write_all(data).unwrap();
    }

    #[test]
    fn test_retried_chunk_overwrites_unrecorded_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let fs = storage(dir.path());
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let target = Reference::space_path(&space.id, "./a.txt");

        let id = fs
            .initiate_upload(&ctx, &target, Some(6), UploadOptions::default())
            .unwrap();
        // bytes landed but the session offset was never advanced
        append_unrecorded(&fs, &id, b"abc");
        assert_eq!(fs.get_upload(&ctx, &id).unwrap().offset, 0);

        assert_eq!(fs.write_upload_chunk(&ctx, &id, 0, b"abc").unwrap(), 3);
        assert_eq!(fs.write_upload_chunk(&ctx, &id, 3, b"def").unwrap(), 6);
        let info = fs.finish_upload(&ctx, &id).unwrap();
        assert_eq!(info.size, 6);
        assert_eq!(read_content(&fs, &ctx, &target), "abcdef");
    }

    #[test]
    fn test_finish_rejects_bytes_beyond_recorded_offset() {
        let dir = tempfile::tempdir().unwrap();
        let fs = storage(dir.path());
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let target = Reference::space_path(&space.id, "./a.txt");

        let id = fs
            .initiate_upload(&ctx, &target, None, UploadOptions::default())
            .unwrap();
        fs.write_upload_chunk(&ctx, &id, 0, b"abc").unwrap();
        append_unrecorded(&fs, &id, b"xyz");
        assert!(matches!(
            fs.finish_upload(&ctx, &id),
            Err(FsError::PreconditionFailed(_))
        ));

        // the session survives and the next chunk replaces the stray bytes
        fs.write_upload_chunk(&ctx, &id, 3, b"def").unwrap();
        let info = fs.finish_upload(&ctx, &id).unwrap();
        assert_eq!(info.size, 6);
        assert_eq!(read_content(&fs, &ctx, &target), "abcdef");
    }

    #[test]
    fn test_failed_finalize_drops_session_and_keeps_content() {
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
        let target = Reference::space_path(&space.id, "./a.txt");
        fs.upload(&ctx, &target, &b"one"[..], UploadOptions::default()).unwrap();
        let before = fs.resolve(&ctx, &target).unwrap();

        let id = fs
            .initiate_upload(&ctx, &target, Some(4), UploadOptions::default())
            .unwrap();
        fs.write_upload_chunk(&ctx, &id, 0, b"two!").unwrap();
        backend.fail_next_write(&before.internal_path(), prefixes::BLOBID_ATTR);

        let err = fs.finish_upload(&ctx, &id).unwrap_err();
        assert!(matches!(err, FsError::Internal(_)), "{:?}", err);
        assert!(!backend.armed());
        assert!(fs.get_upload(&ctx, &id).unwrap_err().is_not_found());
        assert!(!fs.lookup().upload_path(&id).exists());
        assert!(!fs.lookup().upload_data_path(&id).exists());

        let after = fs.resolve(&ctx, &target).unwrap();
        assert_eq!(after.blob_id, before.blob_id);
        assert!(!fs.get_md(&ctx, &target).unwrap().processing);
        assert!(fs.list_revisions(&ctx, &target).unwrap().is_empty());
        assert_eq!(read_content(&fs, &ctx, &target), "one");
    }

    #[test]
    fn test_checksum_mismatch_discards_upload() {
        let dir = tempfile::tempdir().unwrap();
        let fs = storage(dir.path());
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let target = Reference::space_path(&space.id, "./a.txt");

        let options = UploadOptions {
            checksum: Some("sha1 0000".into()),
            ..Default::default()
        };
        let err = fs.upload(&ctx, &target, &b"hello"[..], options).unwrap_err();
        assert!(matches!(err, FsError::PreconditionFailed(_)));
        let node = fs.get_md(&ctx, &target).unwrap();
        assert_eq!(node.size, 0);
        assert!(!node.processing);
    }

    #[test]
    fn test_other_user_cannot_write_session() {
        let dir = tempfile::tempdir().unwrap();
        let fs = storage(dir.path());
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let id = fs
            .initiate_upload(&ctx, &Reference::space_path(&space.id, "./a.txt"), None, UploadOptions::default())
            .unwrap();
        let bob = RequestContext::new(User::new(UserId::new("idp", "bob"), "bob"));
        assert!(matches!(
            fs.write_upload_chunk(&bob, &id, 0, b"x"),
            Err(FsError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_purge_expired_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let fs = storage(dir.path());
        let ctx = alice();
        let space = fs.create_space(&ctx, "home").unwrap();
        let stale = fs
            .initiate_upload(&ctx, &Reference::space_path(&space.id, "./a.txt"), None, UploadOptions::default())
            .unwrap();
        let fresh = fs
            .initiate_upload(&ctx, &Reference::space_path(&space.id, "./b.txt"), None, UploadOptions::default())
            .unwrap();

        let mut session = fs.get_upload(&ctx, &stale).unwrap();
        session.expires = Some(Utc::now() - Duration::hours(1));
        write_metadata(fs.lookup(), &stale, &session).unwrap();

        assert_eq!(fs.purge_expired_uploads(Utc::now()).unwrap(), 1);
        assert!(fs.get_upload(&ctx, &stale).unwrap_err().is_not_found());
        assert!(fs.get_upload(&ctx, &fresh).is_ok());
    }
}
