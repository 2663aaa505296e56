//! Standard paths used by opr

use std::ffi::OsString;
use std::path::PathBuf;
use thiserror::Error;

/// Environment variable naming the repository file
pub const REPOSITORY_ENV: &str = "OPRREPOS";

/// Environment lookup failures
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("environment variable '{0}' not set")]
    MissingEnvironment(&'static str),
}

/// Standard opr paths
pub struct Paths {
    /// Config directory (~/.config/opr)
    pub config: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("opr");

        Self { config }
    }

    /// Path of the tool configuration file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.json")
    }

    /// Resolve the repository file from `OPRREPOS`
    pub fn repository() -> Result<PathBuf, CoreError> {
        Self::repository_from(std::env::var_os(REPOSITORY_ENV))
    }

    /// Resolve the repository file from an already fetched variable value
    pub fn repository_from(value: Option<OsString>) -> Result<PathBuf, CoreError> {
        match value {
            Some(v) if !v.is_empty() => Ok(PathBuf::from(v)),
            _ => Err(CoreError::MissingEnvironment(REPOSITORY_ENV)),
        }
    }
}
