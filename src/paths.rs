//! XDG directory helpers for config/data locations.

use std::path::{Path, PathBuf};

/// Base directory for persistent data (snapshots, defect logs, DC
/// sidecars).
///
/// Uses `DM_DATA_DIR` if set, otherwise `$XDG_DATA_HOME/dirmirror` or
/// `~/.local/share/dirmirror`.
pub(crate) fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DM_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("dirmirror")
}

/// Base directory for configuration.
///
/// Uses `DM_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/dirmirror`
/// or `~/.config/dirmirror`.
pub(crate) fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("DM_CONFIG_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("dirmirror")
}

pub(crate) fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// One snapshot file per domain: `{identity}.{domain}.cache`.
pub(crate) fn cache_file(base: &Path, identity: &str, domain: &str) -> PathBuf {
    base.join(format!("{identity}.{domain}.cache"))
}

/// Sibling defect log: `{identity}.{domain}.log`.
pub(crate) fn defect_log_file(base: &Path, identity: &str, domain: &str) -> PathBuf {
    base.join(format!("{identity}.{domain}.log"))
}

/// Sidecar remembering the last-used DC: `{identity}.{domain}.dc`.
pub(crate) fn dc_sidecar_file(base: &Path, identity: &str, domain: &str) -> PathBuf {
    base.join(format!("{identity}.{domain}.dc"))
}
