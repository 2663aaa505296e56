//! Repository operations
//!
//! A `Session` is one invocation: a loaded repository plus the principal
//! acting on it. Every mutation prepares the new state in memory, persists
//! it, and only then reports success. If any step fails the in-memory state
//! is rolled back to what was loaded, so a failed call never leaves a
//! half-applied change behind, on disk or in the session.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditEntry, AuditLog, Outcome};
use crate::authority::CredentialAuthority;
use crate::cipher::{self, PlainSecret};
use crate::codec::{
    DatabaseField, DecodeError, FixedField, OsUserField, Record, SchemaField, W_SECRET,
};
use crate::error::{RepoError, Result, MSG_SECURITY};
use crate::guard;
use crate::lock::LockPolicy;
use crate::store::Repository;

/// Arguments of an add request
#[derive(Debug, Clone, Copy)]
pub struct NewEntry<'a> {
    pub database: &'a str,
    pub schema: &'a str,
    pub osuser: &'a str,
    /// Store the secret without asking the authority first
    pub skip_verify: bool,
}

impl<'a> NewEntry<'a> {
    pub fn new(database: &'a str, schema: &'a str, osuser: &'a str) -> Self {
        Self {
            database,
            schema,
            osuser,
            skip_verify: false,
        }
    }

    pub fn skip_verify(mut self, skip: bool) -> Self {
        self.skip_verify = skip;
        self
    }
}

/// Where the secret of a newly added record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretSource {
    /// Copied from another record of the same database/schema
    Reused,
    /// Supplied and confirmed by the authority
    Verified,
    /// Supplied and stored unchecked
    Unverified,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: usize,
    /// Entries already present, as `(database, schema, osuser)`
    pub skipped: Vec<String>,
}

/// Crosscheck verdict for one database/schema pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub database: String,
    pub schema: String,
    pub valid: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListEntry {
    pub database: String,
    pub schema: String,
    pub osuser: String,
}

impl From<&Record> for ListEntry {
    fn from(record: &Record) -> Self {
        Self {
            database: record.database.text().into_owned(),
            schema: record.schema.text().into_owned(),
            osuser: record.osuser.text().into_owned(),
        }
    }
}

/// What a principal may see of the repository. Secrets are never part of it.
#[derive(Debug, Clone, Serialize)]
pub struct Listing {
    pub repository: String,
    /// Full view for the owner, own entries only for everyone else
    pub privileged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logfile: Option<String>,
    pub entries: Vec<ListEntry>,
}

/// Canonical lookup key: database upper case, schema lower case
fn canonical_key(database: &str, schema: &str) -> Result<(DatabaseField, SchemaField)> {
    Ok((
        FixedField::from_text("database", &database.to_ascii_uppercase())?,
        FixedField::from_text("schemaname", &schema.to_ascii_lowercase())?,
    ))
}

fn describe(record: &Record) -> String {
    format!(
        "({}, {}, {})",
        record.database.text(),
        record.schema.text(),
        record.osuser.text()
    )
}

/// A loaded repository and the principal acting on it
#[derive(Debug)]
pub struct Session {
    repo: Repository,
    principal: String,
}

impl Session {
    pub fn new(repo: Repository, principal: impl Into<String>) -> Self {
        Self {
            repo,
            principal: principal.into(),
        }
    }

    /// Load the repository at `path` for `principal`
    pub fn open(path: &Path, principal: impl Into<String>, policy: LockPolicy) -> Result<Self> {
        Ok(Self::new(Repository::load(path, policy)?, principal))
    }

    /// Create a new repository owned by `principal`
    pub fn create(path: &Path, principal: impl Into<String>, policy: LockPolicy) -> Result<Self> {
        let principal = principal.into();
        let repo = Repository::create(path, &principal, policy)?;
        Ok(Self::new(repo, principal))
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Apply `change` and persist. On any failure the session goes back to
    /// its previous state.
    fn commit<T>(&mut self, change: impl FnOnce(&mut Repository) -> Result<T>) -> Result<T> {
        let snapshot = self.repo.clone();
        let result = change(&mut self.repo).and_then(|value| {
            self.repo.persist()?;
            Ok(value)
        });
        if result.is_err() {
            self.repo = snapshot;
        }
        result
    }

    fn event(
        &self,
        outcome: Outcome,
        principal: &str,
        target: Option<(&str, &str)>,
        message: &str,
    ) {
        let mut entry = AuditEntry::new(outcome, principal, message);
        if let Some((database, schema)) = target {
            entry = entry.with_target(database, schema);
        }
        self.repo.audit(entry);
    }

    /// Grant `entry.osuser` access to a database/schema credential.
    ///
    /// When the pair is already known the stored secret is reused and
    /// `secret` is never called. Otherwise `secret` supplies it and, unless
    /// verification is skipped, the authority must accept it first.
    pub fn add<F>(
        &mut self,
        entry: NewEntry<'_>,
        secret: F,
        authority: &dyn CredentialAuthority,
    ) -> Result<SecretSource>
    where
        F: FnOnce() -> Result<PlainSecret>,
    {
        guard::require_owner(&self.repo, &self.principal)?;

        let (database, schema) = canonical_key(entry.database, entry.schema)?;
        let osuser = OsUserField::from_text("osusername", entry.osuser)?;
        let records = self.repo.records();

        records.ensure_room(1)?;
        if records.find_exact(&database, &schema, &osuser).is_some() {
            return Err(RepoError::AlreadyExists(format!(
                "entry ({}, {}, {}) exists",
                database.text(),
                schema.text(),
                osuser.text()
            )));
        }

        let existing = records.find_by_schema(&database, &schema).and_then(|i| records.get(i));
        let (record, source) = match existing {
            Some(existing) => {
                let shared = cipher::reveal(existing);
                (cipher::seal(database, schema, osuser, shared.as_bytes())?, SecretSource::Reused)
            }
            None => {
                let plain = secret()?;
                let record = cipher::seal(database, schema, osuser, plain.as_bytes())?;
                if entry.skip_verify {
                    (record, SecretSource::Unverified)
                } else if authority.verify(&database.text(), &schema.text(), &plain)? {
                    (record, SecretSource::Verified)
                } else {
                    return Err(RepoError::Authority(format!(
                        "logon to ({}, {}) failed, entry not added",
                        database.text(),
                        schema.text()
                    )));
                }
            }
        };

        self.commit(|repo| repo.records_mut().insert(record))?;

        info!(
            database = %database.text(),
            schema = %schema.text(),
            osuser = entry.osuser,
            ?source,
            "entry added"
        );
        self.event(
            Outcome::Ok,
            entry.osuser,
            Some((&*database.text(), &*schema.text())),
            "entry added",
        );
        Ok(source)
    }

    /// Revoke `osuser`'s access to a database/schema credential
    pub fn delete(&mut self, database: &str, schema: &str, osuser: &str) -> Result<()> {
        guard::require_owner(&self.repo, &self.principal)?;

        let (database, schema) = canonical_key(database, schema)?;
        let osuser_field = OsUserField::from_text("osusername", osuser)?;

        let index = self
            .repo
            .records()
            .find_exact(&database, &schema, &osuser_field)
            .ok_or_else(|| {
                RepoError::NotFound(format!(
                    "entry ({}, {}, {}) does not exist",
                    database.text(),
                    schema.text(),
                    osuser
                ))
            })?;

        self.commit(|repo| {
            repo.records_mut().remove(index);
            Ok(())
        })?;

        info!(database = %database.text(), schema = %schema.text(), osuser, "entry deleted");
        self.event(
            Outcome::Ok,
            osuser,
            Some((&*database.text(), &*schema.text())),
            "entry deleted",
        );
        Ok(())
    }

    /// Change a database/schema credential on the system of record, then
    /// store the new secret in every record of that pair. Returns how many
    /// records changed. Nothing is written unless the authority confirms.
    pub fn modify(
        &mut self,
        database: &str,
        schema: &str,
        new_secret: &PlainSecret,
        authority: &dyn CredentialAuthority,
    ) -> Result<usize> {
        guard::require_owner(&self.repo, &self.principal)?;

        let (database, schema) = canonical_key(database, schema)?;
        FixedField::<W_SECRET>::from_bytes("password", new_secret.as_bytes())?;

        let range = self.repo.records().schema_range(&database, &schema);
        let first = self
            .repo
            .records()
            .get(range.start)
            .filter(|_| !range.is_empty())
            .ok_or_else(|| {
                RepoError::NotFound(format!(
                    "no entries for ({}, {})",
                    database.text(),
                    schema.text()
                ))
            })?;

        let old_secret = cipher::reveal(first);
        if !authority.change(&database.text(), &schema.text(), &old_secret, new_secret)? {
            return Err(RepoError::Authority(format!(
                "password change on ({}, {}) failed, nothing modified",
                database.text(),
                schema.text()
            )));
        }
        drop(old_secret);

        let changed = self.commit(|repo| {
            let mut changed = 0;
            for index in range {
                if let Some(record) = repo.records_mut().get_mut(index) {
                    *record = cipher::seal(
                        record.database,
                        record.schema,
                        record.osuser,
                        new_secret.as_bytes(),
                    )?;
                    changed += 1;
                }
            }
            Ok(changed)
        })?;

        info!(database = %database.text(), schema = %schema.text(), changed, "entries modified");
        self.event(
            Outcome::Ok,
            &self.principal,
            Some((&*database.text(), &*schema.text())),
            "entry modified",
        );
        Ok(changed)
    }

    /// Merge records from an export file. Entries already present are
    /// skipped. A damaged stream or a full repository aborts the import
    /// with nothing written.
    pub fn import(&mut self, path: &Path) -> Result<ImportReport> {
        guard::require_owner(&self.repo, &self.principal)?;

        let file = File::open(path)
            .map_err(|e| {
                RepoError::io(format!("unable to open {} for reading", path.display()), e)
            })?;
        let mut reader = BufReader::new(file);

        let mut incoming = Vec::new();
        loop {
            match Record::decode_next(&mut reader) {
                Ok(Some(record)) => incoming.push(record),
                Ok(None) => break,
                Err(DecodeError::Io(e)) => {
                    return Err(RepoError::io(format!("read failure in {}", path.display()), e))
                }
                Err(other) => return Err(RepoError::corrupt(path, other.to_string())),
            }
        }

        let report = self.commit(|repo| {
            let mut report = ImportReport::default();
            for record in incoming {
                if repo
                    .records()
                    .find_exact(&record.database, &record.schema, &record.osuser)
                    .is_some()
                {
                    report.skipped.push(describe(&record));
                    continue;
                }
                repo.records_mut().insert(record)?;
                report.imported += 1;
            }
            Ok(report)
        })?;

        info!(
            path = %path.display(),
            imported = report.imported,
            skipped = report.skipped.len(),
            "import finished"
        );
        Ok(report)
    }

    /// Write every record, still scrambled, to `path`. Returns the number
    /// written; an empty repository writes nothing.
    pub fn export(&self, path: &Path) -> Result<usize> {
        guard::require_owner(&self.repo, &self.principal)?;

        let records = self.repo.records();
        if records.is_empty() {
            return Ok(0);
        }

        let failure = |e| RepoError::io(format!("write failure in {}", path.display()), e);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| {
                RepoError::io(format!("unable to open {} for writing", path.display()), e)
            })?;

        let mut writer = BufWriter::new(file);
        for record in records.iter() {
            record.encode(&mut writer).map_err(failure)?;
        }
        writer.flush().map_err(failure)?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| RepoError::io(format!("chmod failed on {}", path.display()), e))?;

        info!(path = %path.display(), entries = records.len(), "export finished");
        Ok(records.len())
    }

    /// Secret for (database, schema) granted to the acting principal. A
    /// miss of any kind gives the same generic refusal.
    pub fn read(&self, database: &str, schema: &str) -> Result<PlainSecret> {
        let target_db = database.to_ascii_uppercase();
        let target_schema = schema.to_ascii_lowercase();
        let target = Some((target_db.as_str(), target_schema.as_str()));

        let hit = canonical_key(database, schema).ok().and_then(|(database, schema)| {
            let osuser = OsUserField::from_text("osusername", &self.principal).ok()?;
            let records = self.repo.records();
            records
                .find_exact(&database, &schema, &osuser)
                .and_then(|i| records.get(i))
        });

        match hit {
            Some(record) => {
                let secret = cipher::reveal(record);
                self.event(Outcome::Ok, &self.principal, target, "request ok");
                Ok(secret)
            }
            None => {
                self.event(Outcome::Fail, &self.principal, target, MSG_SECURITY);
                Err(RepoError::Denied)
            }
        }
    }

    /// Ask the authority whether each stored database/schema credential
    /// still works, optionally for one database only. Nothing is changed.
    pub fn crosscheck(
        &self,
        database: Option<&str>,
        authority: &dyn CredentialAuthority,
    ) -> Result<Vec<CheckResult>> {
        guard::require_owner(&self.repo, &self.principal)?;

        let only = database.map(str::to_ascii_uppercase);
        let mut results = Vec::new();
        let mut previous: Option<&Record> = None;

        for record in self.repo.records().iter() {
            let same_pair = |p: &Record| p.database == record.database && p.schema == record.schema;
            if previous.is_some_and(same_pair) {
                continue;
            }
            previous = Some(record);

            let database = record.database.text().into_owned();
            if only.as_ref().is_some_and(|only| *only != database) {
                continue;
            }
            let schema = record.schema.text().into_owned();

            let secret = cipher::reveal(record);
            let valid = match authority.verify(&database, &schema, &secret) {
                Ok(valid) => valid,
                Err(e) => {
                    warn!(
                        database = %database,
                        schema = %schema,
                        error = %e,
                        "crosscheck could not ask authority"
                    );
                    false
                }
            };
            results.push(CheckResult { database, schema, valid });
        }

        Ok(results)
    }

    /// Everything the owner may see, or only the caller's own entries
    pub fn list(&self) -> Listing {
        let privileged = guard::is_owner(&self.repo, &self.principal);
        let me = OsUserField::from_text("osusername", &self.principal).ok();

        let entries = self
            .repo
            .records()
            .iter()
            .filter(|r| privileged || me.as_ref() == Some(&r.osuser))
            .map(ListEntry::from)
            .collect();

        Listing {
            repository: self.repo.path().display().to_string(),
            privileged,
            owner: privileged.then(|| self.repo.owner()),
            logfile: if privileged {
                self.repo.logfile().map(|p| p.display().to_string())
            } else {
                None
            },
            entries,
        }
    }

    /// Start auditing to `path`
    pub fn enable_logging(&mut self, path: &Path) -> Result<()> {
        guard::require_owner(&self.repo, &self.principal)?;

        AuditLog::with_path(path.to_path_buf()).prepare()?;
        self.commit(|repo| repo.set_logfile(Some(path)))?;

        info!(path = %path.display(), "logging enabled");
        self.event(Outcome::Ok, &self.principal, None, "logging enabled");
        Ok(())
    }

    /// Stop auditing. The last line written to the old log says so.
    pub fn disable_logging(&mut self) -> Result<()> {
        guard::require_owner(&self.repo, &self.principal)?;

        self.event(Outcome::Ok, &self.principal, None, "logging disabled.");
        self.commit(|repo| repo.set_logfile(None))?;

        info!("logging disabled");
        Ok(())
    }
}
