//! Owner checks for privileged requests

use crate::audit::{AuditEntry, Outcome};
use crate::codec::{FixedField, W_OWNER};
use crate::error::{RepoError, Result};
use crate::store::Repository;

/// Whether `principal` is the repository owner, compared over the full
/// owner field.
pub fn is_owner(repo: &Repository, principal: &str) -> bool {
    FixedField::<W_OWNER>::from_text("owner", principal)
        .map(|candidate| candidate == repo.header().owner)
        .unwrap_or(false)
}

/// Refuse anyone but the owner. The refusal is audited and carries no
/// detail.
pub fn require_owner(repo: &Repository, principal: &str) -> Result<()> {
    if is_owner(repo, principal) {
        return Ok(());
    }
    repo.audit(AuditEntry::new(Outcome::Fail, principal, "security (not reposowner)."));
    Err(RepoError::Denied)
}
