//! Audit logging for repository requests
//!
//! When the repository header names a logfile, every request outcome is
//! appended to it as one line:
//!
//! ```text
//! Mon Mar  4 10:15:02 2024 [ ok ] bob : (PRODDB, hr) : request ok
//! Mon Mar  4 10:15:09 2024 [fail] eve : security (not reposowner).
//! ```

use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::error::{RepoError, Result};

/// Outcome column of an audit line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Fail,
}

impl Outcome {
    fn tag(self) -> &'static str {
        match self {
            Self::Ok => "[ ok ]",
            Self::Fail => "[fail]",
        }
    }
}

/// A single audit event
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub timestamp: DateTime<Local>,
    pub outcome: Outcome,
    /// Principal the event is about
    pub principal: String,
    /// (database, schema) when the event concerns records
    pub target: Option<(String, String)>,
    pub message: String,
}

impl AuditEntry {
    pub fn new(outcome: Outcome, principal: &str, message: &str) -> Self {
        Self {
            timestamp: Local::now(),
            outcome,
            principal: principal.to_string(),
            target: None,
            message: message.to_string(),
        }
    }

    pub fn with_target(mut self, database: &str, schema: &str) -> Self {
        self.target = Some((database.to_string(), schema.to_string()));
        self
    }

    /// Render as a log line, without the trailing newline
    pub fn render(&self) -> String {
        let stamp = self.timestamp.format("%a %b %e %H:%M:%S %Y");
        match &self.target {
            Some((database, schema)) => format!(
                "{} {} {} : ({}, {}) : {}",
                stamp,
                self.outcome.tag(),
                self.principal,
                database,
                schema,
                self.message
            ),
            None => format!(
                "{} {} {} : {}",
                stamp,
                self.outcome.tag(),
                self.principal,
                self.message
            ),
        }
    }
}

/// Append-only audit log
#[derive(Debug, Clone)]
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    pub fn with_path(log_path: PathBuf) -> Self {
        Self { log_path }
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }

    /// Create the file if needed and restrict it to the owner
    pub fn prepare(&self) -> Result<()> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.log_path)
            .map_err(|e| {
                RepoError::io(format!("unable to open {} for append", self.log_path.display()), e)
            })?;

        fs::set_permissions(&self.log_path, fs::Permissions::from_mode(0o600))
            .map_err(|e| {
                RepoError::io(format!("chmod failed on log file {}", self.log_path.display()), e)
            })
    }

    /// Append an entry to the log
    pub fn log(&self, entry: &AuditEntry) -> Result<()> {
        let failure = |e| {
            RepoError::io(format!("unable to append to logfile {}", self.log_path.display()), e)
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.log_path)
            .map_err(failure)?;

        writeln!(file, "{}", entry.render()).map_err(failure)
    }
}
