//! Shared fixtures: a sidecar backed storage on a temporary root.

use decompfs::config::PropagationConfig;
use decompfs::metadata::SidecarBackend;
use decompfs::node::Node;
use decompfs::{
    Reference, RequestContext, Storage, StorageOptions, StorageSpace, UploadOptions, User, UserId,
};
use std::io::Read;
use std::sync::Arc;
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
    pub storage: Storage,
    pub space: StorageSpace,
}

impl Fixture {
    /// Storage with one space owned by alice.
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(
            dir.path(),
            Arc::new(SidecarBackend::new()),
            PropagationConfig::default(),
            StorageOptions::default(),
        );
        let space = storage.create_space(&alice(), "home").unwrap();
        Self { dir, storage, space }
    }

    pub fn reference(&self, path: &str) -> Reference {
        Reference::space_path(&self.space.id, format!("./{}", path))
    }

    pub fn put(&self, path: &str, content: &[u8]) {
        self.storage
            .upload(&alice(), &self.reference(path), content, UploadOptions::default())
            .unwrap();
    }

    pub fn read(&self, path: &str) -> Vec<u8> {
        let mut out = Vec::new();
        self.storage
            .download(&alice(), &self.reference(path))
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    /// Node handle for `path`, read straight from disk.
    pub fn node(&self, path: &str) -> Node {
        let info = self.storage.get_md(&alice(), &self.reference(path)).unwrap();
        Node::read_node(self.storage.lookup(), &self.space.id, &info.id.opaque_id).unwrap()
    }

    pub fn root(&self) -> Node {
        Node::read_node(self.storage.lookup(), &self.space.id, &self.space.id).unwrap()
    }
}

pub fn alice() -> RequestContext {
    RequestContext::new(User::new(UserId::new("idp", "alice"), "alice"))
}

pub fn bob() -> RequestContext {
    RequestContext::new(User::new(UserId::new("idp", "bob"), "bob"))
}
