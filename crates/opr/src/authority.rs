//! Bridge to the system of record that owns the real credentials.
//!
//! opr never talks to a database itself. Verifying a password, or changing
//! it on the target, is delegated to a `CredentialAuthority`. The shipped
//! implementation runs an external helper program; tests plug in their own.

use std::io::Write;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::cipher::PlainSecret;
use crate::error::{RepoError, Result};

/// Something that can check and change credentials on the target system.
///
/// `Ok(false)` means the authority answered and refused; `Err` means it
/// could not be asked. Callers treat both as a hard stop.
pub trait CredentialAuthority {
    /// Try to log on with `secret`
    fn verify(&self, database: &str, schema: &str, secret: &PlainSecret) -> Result<bool>;

    /// Change the credential from `old` to `new` on the target
    fn change(
        &self,
        database: &str,
        schema: &str,
        old: &PlainSecret,
        new: &PlainSecret,
    ) -> Result<bool>;
}

/// Used when no helper is configured; every call fails
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredAuthority;

impl UnconfiguredAuthority {
    fn refuse() -> RepoError {
        RepoError::Authority(format!(
            "no credential authority configured (set {} or authority_command)",
            opr_core::config::AUTHORITY_ENV
        ))
    }
}

impl CredentialAuthority for UnconfiguredAuthority {
    fn verify(&self, _database: &str, _schema: &str, _secret: &PlainSecret) -> Result<bool> {
        Err(Self::refuse())
    }

    fn change(
        &self,
        _database: &str,
        _schema: &str,
        _old: &PlainSecret,
        _new: &PlainSecret,
    ) -> Result<bool> {
        Err(Self::refuse())
    }
}

/// Runs a helper program:
///
/// - `<program> verify <database> <schema>` with the secret on stdin
/// - `<program> change <database> <schema>` with old and new secret on stdin,
///   one per line
///
/// Exit status 0 means yes.
#[derive(Debug, Clone)]
pub struct CommandAuthority {
    program: String,
}

impl CommandAuthority {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(
        &self,
        action: &str,
        database: &str,
        schema: &str,
        secrets: &[&PlainSecret],
    ) -> Result<bool> {
        debug!(program = %self.program, action, database, schema, "asking credential authority");

        let mut child = Command::new(&self.program)
            .args([action, database, schema])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .map_err(|e| RepoError::Authority(format!("failed to run {}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            for secret in secrets {
                stdin
                    .write_all(secret.as_bytes())
                    .and_then(|_| stdin.write_all(b"\n"))
                    .map_err(|e| {
                        RepoError::Authority(format!("failed to talk to {}: {}", self.program, e))
                    })?;
            }
        }

        let status = child
            .wait()
            .map_err(|e| {
                RepoError::Authority(format!("failed to wait for {}: {}", self.program, e))
            })?;

        debug!(
            program = %self.program,
            action,
            success = status.success(),
            "credential authority answered"
        );
        Ok(status.success())
    }
}

impl CredentialAuthority for CommandAuthority {
    fn verify(&self, database: &str, schema: &str, secret: &PlainSecret) -> Result<bool> {
        self.run("verify", database, schema, &[secret])
    }

    fn change(
        &self,
        database: &str,
        schema: &str,
        old: &PlainSecret,
        new: &PlainSecret,
    ) -> Result<bool> {
        self.run("change", database, schema, &[old, new])
    }
}

/// Pick the authority described by the configuration
pub fn from_config(config: &opr_core::Config) -> Box<dyn CredentialAuthority> {
    match &config.authority_command {
        Some(program) => Box::new(CommandAuthority::new(program.clone())),
        None => Box::new(UnconfiguredAuthority),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn helper(tmp: &TempDir, body: &str) -> String {
        let path = tmp.path().join("authority.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o700)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_unconfigured_refuses() {
        let secret = PlainSecret::new(b"x");
        assert!(matches!(
            UnconfiguredAuthority.verify("DB", "s", &secret),
            Err(RepoError::Authority(_))
        ));
        assert!(UnconfiguredAuthority.change("DB", "s", &secret, &secret).is_err());
    }

    #[test]
    fn test_command_reads_secret_from_stdin() {
        let tmp = TempDir::new().unwrap();
        let program = helper(
            &tmp,
            r#"read pw; [ "$1 $2 $3 $pw" = "verify PRODDB hr s3cr3t" ]"#,
        );
        let authority = CommandAuthority::new(program);

        assert!(authority.verify("PRODDB", "hr", &PlainSecret::new(b"s3cr3t")).unwrap());
        assert!(!authority.verify("PRODDB", "hr", &PlainSecret::new(b"wrong")).unwrap());
    }

    #[test]
    fn test_command_change_gets_both_secrets() {
        let tmp = TempDir::new().unwrap();
        let program = helper(
            &tmp,
            r#"read old; read new; [ "$1" = change ] && [ "$old" = a ] && [ "$new" = b ]"#,
        );
        let authority = CommandAuthority::new(program);

        let (a, b) = (PlainSecret::new(b"a"), PlainSecret::new(b"b"));
        assert!(authority.change("PRODDB", "hr", &a, &b).unwrap());
        assert!(!authority.change("PRODDB", "hr", &b, &a).unwrap());
    }

    #[test]
    fn test_missing_program_is_an_error() {
        let authority = CommandAuthority::new("/nonexistent/opr-authority");
        assert!(authority.verify("DB", "s", &PlainSecret::new(b"x")).is_err());
    }
}
