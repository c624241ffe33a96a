//! Ancestor propagation
//!
//! After a mutation every ancestor below the space root gets a fresh random
//! etag, a new tree modification time and its tree size adjusted by the size
//! delta. The walk follows parent IDs iteratively and holds at most one lock
//! at a time. The space root itself is never written.

use super::Tree;
use crate::concurrency::LockedFile;
use crate::config::FailurePolicy;
use crate::context::RequestContext;
use crate::error::FsError;
use crate::metadata::{is_not_exist, prefixes, Attributes};
use crate::node::{format_timestamp, Node};
use chrono::Utc;
use std::fs;

fn random_etag() -> String {
    let bytes: [u8; 16] = rand::random();
    hex::encode(bytes)
}

impl Tree {
    /// Propagate a change of `node` to its ancestors.
    pub fn propagate(&self, ctx: &RequestContext, node: &Node, size_diff: i64) -> Result<(), FsError> {
        if node.is_space_root() {
            return Ok(());
        }
        self.propagate_from(ctx, &node.space_id, &node.parent_id, size_diff)
    }

    /// Walk up from `first_id`, updating it and every ancestor until the space root.
    pub fn propagate_from(
        &self,
        ctx: &RequestContext,
        space_id: &str,
        first_id: &str,
        size_diff: i64,
    ) -> Result<(), FsError> {
        let backend = self.lookup.backend();
        let mut current = first_id.to_string();
        let mut visited = 0usize;

        loop {
            if current.is_empty() || current == space_id {
                break;
            }
            ctx.check()?;
            if visited >= self.propagation.max_depth {
                return Err(FsError::Internal(format!(
                    "propagation from {} exceeded {} ancestors",
                    first_id, self.propagation.max_depth
                )));
            }

            let path = self.lookup.internal_path(space_id, &current);
            if fs::symlink_metadata(&path).is_err() {
                tracing::warn!(space = %space_id, node = %current, "ancestor missing, stopping propagation");
                break;
            }

            let parent_id = {
                let _lock = LockedFile::exclusive(&backend.lockfile_path(&path))?;
                let attrs = match backend.all(&path) {
                    Ok(attrs) => attrs,
                    Err(e) if is_not_exist(&e) => {
                        tracing::warn!(space = %space_id, node = %current, "ancestor vanished, stopping propagation");
                        break;
                    }
                    Err(e) => return Err(e.into()),
                };

                let mut update = Attributes::new();
                update.set_string(prefixes::PROPAGATION_ETAG_ATTR, &random_etag());
                update.set_string(prefixes::TMTIME_ATTR, &format_timestamp(&Utc::now()));
                if size_diff != 0 {
                    let treesize = attrs.int64_or(prefixes::TREESIZE_ATTR, 0);
                    let adjusted = treesize.saturating_add(size_diff);
                    if adjusted < 0 {
                        tracing::warn!(node = %current, treesize, size_diff, "tree size would become negative, clamping");
                    }
                    update.set_int64(prefixes::TREESIZE_ATTR, adjusted.max(0));
                }
                backend.set_multiple(&path, &update, false)?;
                attrs.string_or_empty(prefixes::PARENTID_ATTR)
            };

            tracing::trace!(space = %space_id, node = %current, size_diff, "propagated");
            current = parent_id;
            visited += 1;
        }
        Ok(())
    }

    /// Propagate, then apply the configured failure policy.
    pub fn propagate_change(&self, ctx: &RequestContext, node: &Node, size_diff: i64) -> Result<(), FsError> {
        if node.is_space_root() {
            return Ok(());
        }
        self.propagate_change_from(ctx, &node.space_id, &node.parent_id, size_diff)
    }

    pub fn propagate_change_from(
        &self,
        ctx: &RequestContext,
        space_id: &str,
        first_id: &str,
        size_diff: i64,
    ) -> Result<(), FsError> {
        match self.propagate_from(ctx, space_id, first_id, size_diff) {
            Ok(()) => Ok(()),
            Err(e) => match self.propagation.failure_policy {
                FailurePolicy::BestEffort => {
                    tracing::error!(space = %space_id, node = %first_id, size_diff, "propagation failed: {}", e);
                    Ok(())
                }
                FailurePolicy::Strict => Err(e),
            },
        }
    }
}
