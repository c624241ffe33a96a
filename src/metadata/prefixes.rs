//! Attribute names used on node metadata.

/// Common prefix of every attribute the engine writes.
pub const PREFIX: &str = "user.decompfs.";

pub const ID_ATTR: &str = "user.decompfs.id";
pub const PARENTID_ATTR: &str = "user.decompfs.parentid";
pub const NAME_ATTR: &str = "user.decompfs.name";
pub const TYPE_ATTR: &str = "user.decompfs.type";
pub const BLOBID_ATTR: &str = "user.decompfs.blobid";
pub const BLOBSIZE_ATTR: &str = "user.decompfs.blobsize";

/// Checksums are stored as `CHECKSUM_PREFIX + algorithm` with the raw digest as value.
pub const CHECKSUM_PREFIX: &str = "user.decompfs.cs.";

/// Modification time of the node content, RFC3339Nano UTC.
pub const MTIME_ATTR: &str = "user.decompfs.mtime";
/// Tree modification time, set by propagation.
pub const TMTIME_ATTR: &str = "user.decompfs.tmtime";
/// Aggregate size of a container, maintained by propagation.
pub const TREESIZE_ATTR: &str = "user.decompfs.treesize";
/// Random etag written by propagation.
pub const PROPAGATION_ETAG_ATTR: &str = "user.decompfs.etag";

/// Processing marker, value is `PROCESSING_STATUS + upload id`.
pub const STATUS_ATTR: &str = "user.decompfs.nodestatus";

pub const OWNER_IDP_ATTR: &str = "user.decompfs.owner.idp";
pub const OWNER_ID_ATTR: &str = "user.decompfs.owner.id";
pub const SPACE_NAME_ATTR: &str = "user.decompfs.space.name";

/// JSON encoded external lock.
pub const LOCK_ATTR: &str = "user.decompfs.lock";

/// Trash bookkeeping written when a node is deleted.
pub const TRASH_ORIGIN_ATTR: &str = "user.decompfs.trash.origin";

pub const CHECKSUM_SHA1: &str = "sha1";
pub const CHECKSUM_MD5: &str = "md5";
pub const CHECKSUM_ADLER32: &str = "adler32";

/// Attribute name for a checksum algorithm.
pub fn checksum_attr(algorithm: &str) -> String {
    format!("{}{}", CHECKSUM_PREFIX, algorithm)
}

/// Attributes that describe a node's content and travel with it into revisions.
pub fn is_content_attr(name: &str) -> bool {
    name.starts_with(CHECKSUM_PREFIX)
        || name == TYPE_ATTR
        || name == BLOBID_ATTR
        || name == BLOBSIZE_ATTR
        || name == MTIME_ATTR
}
