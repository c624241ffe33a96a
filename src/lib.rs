//! decompfs: Decomposed Filesystem Storage
//!
//! A storage engine that keeps every file and directory as a node addressed by
//! ID, with metadata in extended attributes or sidecar files, content in a blob
//! store, and previous file contents retained as revisions beside the node.
//! Tree aggregates (etag, tree mtime, tree size) are propagated to ancestors
//! after each mutation.

pub mod blobstore;
pub mod concurrency;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod lookup;
pub mod metadata;
pub mod node;
pub mod registry;
pub mod revisions;
pub mod storage;
pub mod tooling;
pub mod tree;
pub mod types;
pub mod upload;

pub use context::{CancellationToken, RequestContext};
pub use error::{FsError, StorageError};
pub use node::locks::Lock;
pub use storage::{Storage, StorageOptions};
pub use types::{
    FileVersion, NodeType, Reference, ResourceId, ResourceInfo, StorageSpace, User, UserId,
};
pub use upload::UploadOptions;
