//! XDG Base Directory utilities.

use crate::error::FsError;
use std::path::PathBuf;

/// Get XDG data home directory
///
/// Returns `$XDG_DATA_HOME` if set, otherwise defaults to `$HOME/.local/share`
pub fn data_home() -> Option<PathBuf> {
    if let Ok(xdg_data_home) = std::env::var("XDG_DATA_HOME") {
        if !xdg_data_home.is_empty() {
            return Some(PathBuf::from(xdg_data_home));
        }
    }

    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".local").join("share"))
}

/// Get XDG config home directory
///
/// Returns `$XDG_CONFIG_HOME` if set, otherwise defaults to `$HOME/.config`
pub fn config_home() -> Option<PathBuf> {
    if let Ok(xdg_config_home) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg_config_home.is_empty() {
            return Some(PathBuf::from(xdg_config_home));
        }
    }

    std::env::var("HOME")
        .ok()
        .map(|home| PathBuf::from(home).join(".config"))
}

/// `$XDG_CONFIG_HOME/decompfs/config.toml`
pub fn global_config_path() -> Option<PathBuf> {
    config_home().map(|dir| dir.join("decompfs").join("config.toml"))
}

/// `$XDG_DATA_HOME/decompfs/storage`
pub fn default_storage_root() -> Result<PathBuf, FsError> {
    let data_home = data_home().ok_or_else(|| {
        FsError::ConfigError(
            "Could not determine XDG data home directory (HOME not set)".to_string(),
        )
    })?;
    Ok(data_home.join("decompfs").join("storage"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_config_path_shape() {
        if let Some(path) = global_config_path() {
            assert!(path.ends_with("decompfs/config.toml"));
        }
    }
}
