//! External locks
//!
//! Client visible locks (WebDAV LOCK, app locks) are distinct from the
//! internal lock files. They are stored JSON encoded in the lock attribute and
//! checked before mutating a node.

use super::Node;
use crate::concurrency::LockedFile;
use crate::context::RequestContext;
use crate::error::{FsError, StorageError};
use crate::metadata::{is_attr_unset, prefixes, Attributes};
use crate::types::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub lock_id: String,
    #[serde(default)]
    pub owner: Option<UserId>,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

impl Lock {
    pub fn new(lock_id: impl Into<String>) -> Self {
        Self {
            lock_id: lock_id.into(),
            owner: None,
            app_name: String::new(),
            expiration: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration.map(|e| e <= now).unwrap_or(false)
    }
}

impl Node {
    fn read_lock(&self) -> Result<Option<Lock>, FsError> {
        let raw = match self.lookup().backend().get(&self.internal_path(), prefixes::LOCK_ATTR) {
            Ok(raw) => raw,
            Err(e) if is_attr_unset(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if raw.is_empty() {
            return Ok(None);
        }
        let lock: Lock = serde_json::from_slice(&raw)
            .map_err(|e| FsError::from(StorageError::Decode(e.to_string())))?;
        if lock.is_expired(Utc::now()) {
            return Ok(None);
        }
        Ok(Some(lock))
    }

    /// The active lock, ignoring expired ones.
    pub fn get_lock(&self) -> Result<Option<Lock>, FsError> {
        self.read_lock()
    }

    /// Lock the node. Re-locking with the same lock ID refreshes the lock.
    pub fn set_lock(&self, lock: &Lock) -> Result<(), FsError> {
        if lock.lock_id.is_empty() {
            return Err(FsError::InvalidArgument("empty lock id".to_string()));
        }
        let _guard = LockedFile::exclusive(&self.lockfile_path())?;
        if let Some(existing) = self.read_lock()? {
            if existing.lock_id != lock.lock_id {
                return Err(FsError::Locked(self.id.clone()));
            }
        }
        let encoded =
            serde_json::to_vec(lock).map_err(|e| FsError::from(StorageError::Encode(e.to_string())))?;
        let mut attrs = Attributes::new();
        attrs.set(prefixes::LOCK_ATTR, encoded);
        self.set_xattrs(&attrs, false)?;
        Ok(())
    }

    /// Remove the lock held under `lock_id`.
    pub fn unlock(&self, lock_id: &str) -> Result<(), FsError> {
        let _guard = LockedFile::exclusive(&self.lockfile_path())?;
        match self.read_lock()? {
            None => Err(FsError::PreconditionFailed(format!("{} is not locked", self.id))),
            Some(existing) if existing.lock_id != lock_id => Err(FsError::Locked(self.id.clone())),
            Some(_) => {
                self.remove_xattr(prefixes::LOCK_ATTR, false)?;
                Ok(())
            }
        }
    }

    /// Fail with `Locked` unless the node is unlocked or the request presents
    /// the lock's token.
    pub fn check_lock(&self, ctx: &RequestContext) -> Result<(), FsError> {
        match self.read_lock()? {
            None => Ok(()),
            Some(lock) if ctx.lock_id() == Some(lock.lock_id.as_str()) => Ok(()),
            Some(_) => Err(FsError::Locked(self.id.clone())),
        }
    }
}
