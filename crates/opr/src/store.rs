//! Repository - the header plus every record, loaded from and written back
//! to one file.
//!
//! Loads happen under a shared lock. A persist takes the exclusive lock on
//! the live file, writes a sibling temp file, and renames it over the live
//! one before letting go, so readers see either the old or the new content
//! and never a half-written file. Peers that were waiting on the replaced
//! file notice the swap and lock the new one instead.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::audit::{AuditEntry, AuditLog};
use crate::codec::{DecodeError, FixedField, Header, Record};
use crate::error::{RepoError, Result};
use crate::index::{RecordSet, MAX_ENTRIES};
use crate::lock::{FileLock, LockMode, LockPolicy};

/// An in-memory copy of a repository file
#[derive(Debug, Clone)]
pub struct Repository {
    path: PathBuf,
    header: Header,
    records: RecordSet,
    policy: LockPolicy,
}

impl Repository {
    /// Create a new, empty repository owned by `owner`. Fails if the file
    /// already exists.
    pub fn create(path: &Path, owner: &str, policy: LockPolicy) -> Result<Self> {
        let header = Header::new(owner)?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    RepoError::AlreadyExists(format!("file {} already exists", path.display()))
                } else {
                    RepoError::io(format!("unable to open {} for writing", path.display()), e)
                }
            })?;

        header
            .encode(&mut file)
            .and_then(|_| file.sync_all())
            .map_err(|e| {
                RepoError::io(format!("failure writing to {} (header)", path.display()), e)
            })?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .map_err(|e| {
                RepoError::io(format!("chmod failed on repository {}", path.display()), e)
            })?;

        info!(path = %path.display(), owner, "repository created");

        Ok(Self {
            path: path.to_path_buf(),
            header,
            records: RecordSet::new(),
            policy,
        })
    }

    /// Read the repository at `path` under a shared lock
    pub fn load(path: &Path, policy: LockPolicy) -> Result<Self> {
        let lock = FileLock::open(path, LockMode::Shared, policy)?;
        let mut reader = BufReader::new(lock.file());

        let header = Header::decode(&mut reader).map_err(|e| decode_failure(path, "header", e))?;
        if !header.has_valid_magic() {
            return Err(RepoError::Format(path.to_path_buf()));
        }
        if header.count > MAX_ENTRIES {
            return Err(RepoError::corrupt(path, format!("entry count {}", header.count)));
        }

        let mut records = Vec::with_capacity(header.count);
        for _ in 0..header.count {
            let record = Record::decode(&mut reader).map_err(|e| decode_failure(path, "entry", e))?;
            records.push(record);
        }

        debug!(path = %path.display(), entries = records.len(), "repository loaded");

        Ok(Self {
            path: path.to_path_buf(),
            header,
            records: RecordSet::from_records(records),
            policy,
        })
    }

    /// Sort, then replace the file with the in-memory state
    pub fn persist(&mut self) -> Result<()> {
        self.records.sort_all();
        self.header.count = self.records.len();

        let _lock = FileLock::open(&self.path, LockMode::Exclusive, self.policy)?;

        let temp = temp_path(&self.path);
        let written = self.write_to(&temp).and_then(|_| {
            fs::rename(&temp, &self.path)
                .map_err(|e| RepoError::io(format!("unable to replace {}", self.path.display()), e))
        });

        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                warn!(
                    dir = %parent.display(),
                    error = %e,
                    "directory sync failed, rename may not be durable"
                );
            }
        }

        info!(path = %self.path.display(), entries = self.header.count, "repository written");
        Ok(())
    }

    fn write_to(&self, temp: &Path) -> Result<()> {
        let failure = |what: &str, e| {
            RepoError::io(format!("write failure in {} ({})", self.path.display(), what), e)
        };

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(temp)
            .map_err(|e| failure("temp file", e))?;

        let mut writer = BufWriter::new(file);
        self.header.encode(&mut writer).map_err(|e| failure("header", e))?;
        for record in self.records.iter() {
            record.encode(&mut writer).map_err(|e| failure("entry", e))?;
        }
        writer.flush().map_err(|e| failure("flush", e))?;
        writer.get_ref().sync_all().map_err(|e| failure("sync", e))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    pub(crate) fn records_mut(&mut self) -> &mut RecordSet {
        &mut self.records
    }

    pub fn owner(&self) -> String {
        self.header.owner.text().into_owned()
    }

    /// Configured audit log, if logging is enabled
    pub fn logfile(&self) -> Option<PathBuf> {
        if self.header.logfile.is_blank() {
            None
        } else {
            Some(PathBuf::from(self.header.logfile.text().into_owned()))
        }
    }

    pub(crate) fn set_logfile(&mut self, logfile: Option<&Path>) -> Result<()> {
        self.header.logfile = match logfile {
            Some(path) => FixedField::from_text("logfile", &path.to_string_lossy())?,
            None => FixedField::empty(),
        };
        Ok(())
    }

    /// Append to the audit log if one is configured. A failing log is
    /// reported but never fails the request.
    pub fn audit(&self, entry: AuditEntry) {
        if let Some(path) = self.logfile() {
            if let Err(e) = AuditLog::with_path(path).log(&entry) {
                warn!(error = %e, "audit log write failed");
            }
        }
    }
}

fn decode_failure(path: &Path, what: &str, err: DecodeError) -> RepoError {
    match err {
        DecodeError::Io(e) => {
            RepoError::io(format!("read failure in {} ({})", path.display(), what), e)
        }
        other => RepoError::corrupt(path, format!("{}: {}", what, other)),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repository".to_string());
    path.with_file_name(format!("{}.tmp.{}", name, std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher;
    use crate::codec::{HEADER_LEN, MAGIC, RECORD_LEN};
    use std::time::Duration;
    use tempfile::TempDir;

    fn policy() -> LockPolicy {
        LockPolicy {
            retries: 2,
            interval: Duration::from_millis(5),
        }
    }

    fn sealed(db: &str, schema: &str, osuser: &str, secret: &str) -> Record {
        cipher::seal(
            FixedField::from_text("database", db).unwrap(),
            FixedField::from_text("schemaname", schema).unwrap(),
            FixedField::from_text("osusername", osuser).unwrap(),
            secret.as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn test_create_writes_empty_header() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("repos");

        let repo = Repository::create(&path, "alice", policy()).unwrap();
        assert_eq!(repo.owner(), "alice");
        assert_eq!(repo.header().count, 0);
        assert!(repo.logfile().is_none());

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[..32], MAGIC);

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let loaded = Repository::load(&path, policy()).unwrap();
        assert_eq!(loaded.owner(), "alice");
        assert!(loaded.records().is_empty());
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("repos");
        fs::write(&path, b"precious").unwrap();

        let err = Repository::create(&path, "alice", policy()).unwrap_err();
        assert!(matches!(err, RepoError::AlreadyExists(_)));
        assert_eq!(fs::read(&path).unwrap(), b"precious");
    }

    #[test]
    fn test_persist_and_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("repos");
        let mut repo = Repository::create(&path, "alice", policy()).unwrap();

        repo.records_mut().insert(sealed("TEST", "scott", "bob", "tiger")).unwrap();
        repo.records_mut().insert(sealed("PRODDB", "hr", "bob", "s3cr3t")).unwrap();
        repo.persist().unwrap();

        assert_eq!(fs::read(&path).unwrap().len(), HEADER_LEN + 2 * RECORD_LEN);

        let loaded = Repository::load(&path, policy()).unwrap();
        assert_eq!(loaded.header().count, 2);
        assert_eq!(loaded.records(), repo.records());
        assert_eq!(loaded.records().get(0).unwrap().database.text(), "PRODDB");
        assert_eq!(cipher::reveal(loaded.records().get(1).unwrap()).as_bytes(), b"tiger");

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // no temp files left behind
        let leftovers = fs::read_dir(tmp.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_bad_magic_is_format_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("repos");
        fs::write(&path, vec![b'?'; HEADER_LEN]).unwrap();

        let err = Repository::load(&path, policy()).unwrap_err();
        assert!(matches!(err, RepoError::Format(_)));
    }

    #[test]
    fn test_truncated_files_are_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("repos");
        let mut repo = Repository::create(&path, "alice", policy()).unwrap();
        repo.records_mut().insert(sealed("PRODDB", "hr", "bob", "s3cr3t")).unwrap();
        repo.persist().unwrap();

        let bytes = fs::read(&path).unwrap();

        fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();
        let err = Repository::load(&path, policy()).unwrap_err();
        assert!(matches!(err, RepoError::Corrupt { .. }));

        fs::write(&path, &bytes[..HEADER_LEN - 3]).unwrap();
        let err = Repository::load(&path, policy()).unwrap_err();
        assert!(matches!(err, RepoError::Corrupt { .. }));
    }

    #[test]
    fn test_absurd_count_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("repos");
        Repository::create(&path, "alice", policy()).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        bytes[HEADER_LEN - 32..HEADER_LEN - 27].copy_from_slice(b"99999");
        fs::write(&path, &bytes).unwrap();

        let err = Repository::load(&path, policy()).unwrap_err();
        assert!(matches!(err, RepoError::Corrupt { .. }));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = Repository::load(&tmp.path().join("nope"), policy()).unwrap_err();
        assert!(matches!(err, RepoError::Io { .. }));
    }

    #[test]
    fn test_writer_blocked_by_reader_times_out() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("repos");
        let mut repo = Repository::create(&path, "alice", policy()).unwrap();
        let before = fs::read(&path).unwrap();

        let _reader = FileLock::open(&path, LockMode::Shared, policy()).unwrap();

        repo.records_mut().insert(sealed("PRODDB", "hr", "bob", "s3cr3t")).unwrap();
        let err = repo.persist().unwrap_err();
        assert!(matches!(err, RepoError::LockTimeout { .. }));
        assert_eq!(fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_lock_after_persist_sees_new_content() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("repos");
        Repository::create(&path, "alice", policy()).unwrap();
        let early = File::open(&path).unwrap();

        let mut writer = Repository::load(&path, policy()).unwrap();
        writer.records_mut().insert(sealed("PRODDB", "hr", "bob", "s3cr3t")).unwrap();
        writer.persist().unwrap();

        // a handle opened before the persist locks the replaced file
        let stale = FileLock::acquire(early, &path, LockMode::Exclusive, policy()).unwrap();
        assert!(!stale.is_current(&path).unwrap());
        drop(stale);

        let lock = FileLock::open(&path, LockMode::Exclusive, policy()).unwrap();
        let header = Header::decode(&mut lock.file()).unwrap();
        assert_eq!(header.count, 1);

        // the current file is held, so no second exclusive lock and no persist
        let err = FileLock::open(&path, LockMode::Exclusive, policy()).unwrap_err();
        assert!(matches!(err, RepoError::LockTimeout { .. }));
        writer.records_mut().insert(sealed("TEST", "scott", "bob", "tiger")).unwrap();
        assert!(matches!(writer.persist(), Err(RepoError::LockTimeout { .. })));
        drop(lock);

        assert_eq!(Repository::load(&path, policy()).unwrap().header().count, 1);
        writer.persist().unwrap();
        assert_eq!(Repository::load(&path, policy()).unwrap().header().count, 2);
    }

    #[test]
    fn test_logfile_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("repos");
        let log = tmp.path().join("opr.log");
        let mut repo = Repository::create(&path, "alice", policy()).unwrap();

        repo.set_logfile(Some(&log)).unwrap();
        repo.persist().unwrap();
        assert_eq!(Repository::load(&path, policy()).unwrap().logfile(), Some(log));

        repo.set_logfile(None).unwrap();
        repo.persist().unwrap();
        assert!(Repository::load(&path, policy()).unwrap().logfile().is_none());
    }
}
