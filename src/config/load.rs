use std::fs;
use std::path::{Path, PathBuf};

use super::{Config, ConfigError};

pub fn config_path() -> PathBuf {
    crate::paths::config_dir().join("config.toml")
}

/// Load the user config file (if present) and apply env overrides.
///
/// `domain` must be set by one of the layers; everything else has a
/// default.
pub fn load() -> Result<Config, ConfigError> {
    let mut config = match read_file(&config_path())? {
        Some(config) => config,
        None => Config::default(),
    };
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let mut config = read_file(path)?.ok_or_else(|| ConfigError::Invalid {
        reason: format!("config file {} not found", path.display()),
    })?;
    apply_env_overrides(&mut config);
    validate(&config)?;
    Ok(config)
}

fn read_file(path: &Path) -> Result<Option<Config>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::Invalid {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    toml::from_str(&contents)
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            reason: format!("failed to parse {}: {e}", path.display()),
        })
}

fn apply_env_overrides(config: &mut Config) {
    let text = |name: &str| std::env::var(name).ok().filter(|v| !v.trim().is_empty());

    if let Some(domain) = text("DM_DOMAIN") {
        config.domain = domain;
    }
    if let Some(identity) = text("DM_IDENTITY") {
        config.identity = identity;
    }
    if let Some(server) = text("DM_PREFERRED_SERVER") {
        config.preferred_server = Some(server);
    }
    if let Some(path) = text("DM_SNAPSHOT_PATH") {
        config.snapshot_path = Some(PathBuf::from(path));
    }
    if let Some(secs) = text("DM_SNAPSHOT_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        config.snapshot_interval_secs = secs;
    }
    if let Some(size) = text("DM_BULK_LOAD_PAGE_SIZE").and_then(|v| v.parse().ok()) {
        config.bulk_load_page_size = size;
    }
    if let Some(all) = text("DM_LOAD_ALL_ATTRIBUTES").and_then(|v| v.parse().ok()) {
        config.load_all_attributes = all;
    }
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.domain.trim().is_empty() {
        return Err(ConfigError::Invalid {
            reason: "`domain` is required (config file or DM_DOMAIN)".into(),
        });
    }
    if config.identity.trim().is_empty() {
        return Err(ConfigError::Invalid {
            reason: "`identity` must not be empty".into(),
        });
    }
    if config.bulk_load_page_size == 0 {
        return Err(ConfigError::Invalid {
            reason: "`bulk_load_page_size` must be positive".into(),
        });
    }
    if config.queue_capacity == 0 {
        return Err(ConfigError::Invalid {
            reason: "`queue_capacity` must be positive".into(),
        });
    }
    if config.backoff_min_secs > config.backoff_max_secs {
        return Err(ConfigError::Invalid {
            reason: "`backoff_min_secs` must not exceed `backoff_max_secs`".into(),
        });
    }
    Ok(())
}

/// Write a config atomically (used to seed a default file).
pub fn write_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let dir = path.parent().ok_or_else(|| ConfigError::Invalid {
        reason: "config path missing parent directory".into(),
    })?;
    fs::create_dir_all(dir).map_err(|e| ConfigError::Invalid {
        reason: format!("failed to create {}: {e}", dir.display()),
    })?;
    let contents = toml::to_string_pretty(config).map_err(|e| ConfigError::Invalid {
        reason: format!("failed to render config: {e}"),
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| ConfigError::Invalid {
        reason: format!("failed to create temp file in {}: {e}", dir.display()),
    })?;
    fs::write(temp.path(), contents).map_err(|e| ConfigError::Invalid {
        reason: format!("failed to write config temp file: {e}"),
    })?;
    temp.persist(path).map_err(|e| ConfigError::Invalid {
        reason: format!("failed to persist config to {}: {e}", path.display()),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_roundtrip_and_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.domain = "corp.example".into();
        config.preferred_server = Some("dc1.corp.example".into());
        config.bulk_load_page_size = 250;
        write_config(&path, &config).unwrap();

        let loaded = load_from(&path).unwrap();
        assert_eq!(loaded.domain, "corp.example");
        assert_eq!(loaded.preferred_server.as_deref(), Some("dc1.corp.example"));
        assert_eq!(loaded.bulk_load_page_size, 250);
        assert_eq!(loaded.identity, "mirror");
    }

    #[test]
    fn missing_domain_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_config(&path, &Config::default()).unwrap();
        let err = load_from(&path).unwrap_err();
        assert!(err.to_string().contains("domain"));
    }

    #[test]
    fn bad_bounds_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.domain = "corp.example".into();
        config.backoff_min_secs = 500;
        config.backoff_max_secs = 5;
        write_config(&path, &config).unwrap();
        assert!(load_from(&path).is_err());
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::default();
        assert_eq!(config.bulk_load_page_size, 1000);
        assert_eq!(config.snapshot_interval_secs, 300);
        assert_eq!(config.notify_idle_timeout_secs, 172_800);
    }
}
