//! Built-in defaults every configuration is layered on.

use config::builder::DefaultState;
use config::{ConfigBuilder, ConfigError};

/// Builder seeded with the defaults of every section.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    config::Config::builder()
        .set_default("storage.metadata_backend", "sidecar")?
        .set_default("storage.provider_id", "")?
        .set_default("propagation.failure_policy", "best_effort")?
        .set_default("propagation.max_depth", 4096_i64)?
        .set_default("upload.expiry_secs", 86_400_i64)?
        .set_default("logging.enabled", true)?
        .set_default("logging.level", "info")?
        .set_default("logging.format", "text")?
        .set_default("logging.output", "stderr")
}
