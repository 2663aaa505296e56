//! opr core - shared plumbing for the opr credential repository
//!
//! Everything here is environment-facing: where the repository lives,
//! how the tool is configured, and who is invoking it.

pub mod config;
pub mod paths;
pub mod principal;

pub use config::Config;
pub use paths::{CoreError, Paths, REPOSITORY_ENV};
pub use principal::current_principal;
