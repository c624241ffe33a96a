//! Permission assembly
//!
//! The engine asks a `PermissionsChecker` for the caller's permission set on a
//! node before every operation. Real deployments plug in their share and
//! space membership model; `OwnerPermissions` only knows space owners.

use super::Node;
use crate::context::RequestContext;
use crate::error::FsError;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourcePermissions {
    pub stat: bool,
    pub list_container: bool,
    pub list_file_versions: bool,
    pub initiate_file_download: bool,
    pub initiate_file_upload: bool,
    pub restore_file_version: bool,
    pub create_container: bool,
    pub move_: bool,
    pub delete: bool,
}

impl ResourcePermissions {
    pub fn all() -> Self {
        Self {
            stat: true,
            list_container: true,
            list_file_versions: true,
            initiate_file_download: true,
            initiate_file_upload: true,
            restore_file_version: true,
            create_container: true,
            move_: true,
            delete: true,
        }
    }

    pub fn none() -> Self {
        Self::default()
    }

    /// Error for a missing permission: `PermissionDenied` when the caller may
    /// at least stat the node, otherwise `NotFound` so existence stays hidden.
    pub fn deny(&self, what: impl fmt::Display) -> FsError {
        if self.stat {
            FsError::PermissionDenied(what.to_string())
        } else {
            FsError::NotFound(what.to_string())
        }
    }
}

pub trait PermissionsChecker: Send + Sync + fmt::Debug {
    fn assemble_permissions(
        &self,
        ctx: &RequestContext,
        node: &Node,
    ) -> Result<ResourcePermissions, FsError>;
}

/// Grants everything to the owner of the node's space, nothing to anyone else.
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnerPermissions;

impl PermissionsChecker for OwnerPermissions {
    fn assemble_permissions(
        &self,
        ctx: &RequestContext,
        node: &Node,
    ) -> Result<ResourcePermissions, FsError> {
        let Some(user) = ctx.user() else {
            return Ok(ResourcePermissions::none());
        };
        match node.space_owner()? {
            Some(owner) if owner == user.id => Ok(ResourcePermissions::all()),
            _ => Ok(ResourcePermissions::none()),
        }
    }
}

/// Grants everything to everyone. For tooling running as the storage admin.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionsChecker for AllowAll {
    fn assemble_permissions(
        &self,
        _ctx: &RequestContext,
        _node: &Node,
    ) -> Result<ResourcePermissions, FsError> {
        Ok(ResourcePermissions::all())
    }
}
