//! opr - Oracle password repository
//!
//! "Scripts should log on without anyone typing a password."
//!
//! One file, owned by one operator, maps (database, schema, os user) to the
//! schema password. Each os user can read back only the passwords granted to
//! them; the owner manages grants, rotates passwords on the target database
//! through a credential authority, and can export or import the lot.
//!
//! Passwords are scrambled on disk to keep them out of a casual look at the
//! file. The real protection is the file mode, the advisory locks and the
//! owner check.

pub mod audit;
pub mod authority;
pub mod cipher;
pub mod codec;
pub mod error;
pub mod guard;
pub mod index;
pub mod lock;
pub mod ops;
pub mod store;

pub use authority::{CommandAuthority, CredentialAuthority, UnconfiguredAuthority};
pub use cipher::PlainSecret;
pub use error::{RepoError, Result, MSG_SECURITY};
pub use lock::LockPolicy;
pub use ops::{CheckResult, ImportReport, ListEntry, Listing, NewEntry, SecretSource, Session};
pub use store::Repository;
