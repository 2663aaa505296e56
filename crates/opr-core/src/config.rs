//! Configuration management for opr

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Environment variable overriding `authority_command`
pub const AUTHORITY_ENV: &str = "OPR_AUTHORITY";

/// opr tool configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Lock attempts before giving up
    #[serde(default = "default_lock_retries")]
    pub lock_retries: u32,

    /// Sleep between lock attempts (milliseconds)
    #[serde(default = "default_lock_interval_ms")]
    pub lock_interval_ms: u64,

    /// Helper program that verifies and changes credentials on the target system
    #[serde(default)]
    pub authority_command: Option<String>,
}

fn default_lock_retries() -> u32 {
    100
}

fn default_lock_interval_ms() -> u64 {
    40
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_retries: default_lock_retries(),
            lock_interval_ms: default_lock_interval_ms(),
            authority_command: None,
        }
    }
}

impl Config {
    /// Load config from file, falling back to defaults when absent
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read opr config from {:?}", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse opr config from {:?}", path))?
        } else {
            Self::default()
        };

        if let Some(command) = std::env::var_os(AUTHORITY_ENV) {
            if !command.is_empty() {
                config.authority_command = Some(command.to_string_lossy().into_owned());
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() -> Result<()> {
        let tmp = TempDir::new()?;
        let config = Config::load(&tmp.path().join("config.json"))?;
        assert_eq!(config.lock_retries, 100);
        assert_eq!(config.lock_interval_ms, 40);
        Ok(())
    }

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("config.json");
        std::fs::write(&path, r#"{ "lock_retries": 5 }"#)?;

        let config = Config::load(&path)?;
        assert_eq!(config.lock_retries, 5);
        assert_eq!(config.lock_interval_ms, 40);
        Ok(())
    }

    #[test]
    fn test_full_file() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "lock_retries": 3,
                "lock_interval_ms": 10,
                "authority_command": "/usr/local/bin/opr-oracle"
            }"#,
        )?;

        let config = Config::load(&path)?;
        assert_eq!(config.lock_retries, 3);
        assert_eq!(config.lock_interval_ms, 10);
        if std::env::var_os(AUTHORITY_ENV).is_none() {
            assert_eq!(config.authority_command.as_deref(), Some("/usr/local/bin/opr-oracle"));
        }
        Ok(())
    }

    #[test]
    fn test_garbage_is_an_error() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("config.json");
        std::fs::write(&path, "not json")?;
        assert!(Config::load(&path).is_err());
        Ok(())
    }
}
