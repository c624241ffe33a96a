//! Configuration
//!
//! Layered configuration for the storage engine and its tooling. Sources, in
//! increasing precedence: built-in defaults, the global config file, an
//! explicitly named config file, and `DECOMPFS__SECTION__KEY` environment
//! variables.

pub mod facade;
pub mod merge;
pub mod paths;
pub mod sources;

pub use facade::ConfigLoader;
pub use paths::xdg_root as xdg;

use crate::error::FsError;
use crate::logging::LoggingConfig;
use crate::metadata::BackendKind;
use crate::registry::Service;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub propagation: PropagationConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub registry: RegistryConfig,
}

/// Where and how nodes are stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage root; empty means `$XDG_DATA_HOME/decompfs/storage`
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Attribute encoding. Fixed for the lifetime of a storage root.
    #[serde(default)]
    pub metadata_backend: BackendKind,

    /// Provider ID recorded in upload sessions
    #[serde(default)]
    pub provider_id: String,
}

impl StorageConfig {
    /// The storage root to use, falling back to the XDG data directory.
    pub fn resolve_root(&self) -> Result<PathBuf, FsError> {
        match &self.root {
            Some(root) if !root.as_os_str().is_empty() => Ok(root.clone()),
            _ => xdg::default_storage_root(),
        }
    }
}

/// What a failed ancestor update means for the mutation that triggered it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log and report the mutation as successful. Ancestors may keep stale etags.
    #[default]
    BestEffort,
    /// Surface the propagation error to the caller.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Upper bound on ancestors visited by one propagation
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_depth() -> usize {
    4096
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            max_depth: default_max_depth(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Seconds an unfinished upload session stays valid
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
}

fn default_expiry_secs() -> u64 {
    86_400
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_expiry_secs(),
        }
    }
}

/// Services registered at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub services: Vec<Service>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.storage.metadata_backend, BackendKind::Sidecar);
        assert_eq!(config.propagation.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(config.propagation.max_depth, 4096);
        assert_eq!(config.upload.expiry_secs, 86_400);
        assert!(config.registry.services.is_empty());
    }

    #[test]
    fn test_explicit_root_wins() {
        let config = StorageConfig {
            root: Some(PathBuf::from("/srv/decompfs")),
            ..Default::default()
        };
        assert_eq!(config.resolve_root().unwrap(), PathBuf::from("/srv/decompfs"));
    }

    #[test]
    fn test_parse_toml_sections() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [storage]
            root = "/srv/decompfs"
            metadata_backend = "xattrs"

            [propagation]
            failure_policy = "strict"

            [[registry.services]]
            name = "storage-provider"
            nodes = [{ id = "n1", address = "127.0.0.1:9000" }]
            "#,
        )
        .unwrap();
        assert_eq!(config.storage.metadata_backend, BackendKind::Xattrs);
        assert_eq!(config.propagation.failure_policy, FailurePolicy::Strict);
        assert_eq!(config.propagation.max_depth, 4096);
        assert_eq!(config.registry.services[0].nodes[0].address, "127.0.0.1:9000");
    }
}
