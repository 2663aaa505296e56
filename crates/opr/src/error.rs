//! Repository errors

use std::path::PathBuf;
use thiserror::Error;

/// The message shown for every refused request. It never says why.
pub const MSG_SECURITY: &str = "sorry :(";

/// Repository-specific errors
#[derive(Error, Debug)]
pub enum RepoError {
    #[error("{0}")]
    Config(String),

    #[error("{} is not a valid OPR repository", .0.display())]
    Format(PathBuf),

    #[error("read failure in {} ({what})", path.display())]
    Corrupt { path: PathBuf, what: String },

    #[error("unable to lock {} after {attempts} attempts", path.display())]
    LockTimeout { path: PathBuf, attempts: u32 },

    #[error("{}", MSG_SECURITY)]
    Denied,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("max_entries reached (max {0} entries)")]
    CapacityExceeded(usize),

    #[error("{field} too long (max {max} chars)")]
    FieldTooLong { field: &'static str, max: usize },

    #[error("{0}")]
    Authority(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl RepoError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: &std::path::Path, what: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            what: what.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RepoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denied_message_is_generic() {
        assert_eq!(RepoError::Denied.to_string(), "sorry :(");
    }

    #[test]
    fn test_field_too_long_message() {
        let err = RepoError::FieldTooLong {
            field: "schemaname",
            max: 29,
        };
        assert_eq!(err.to_string(), "schemaname too long (max 29 chars)");
    }
}
