//! Login state machine.
//!
//! Ties the staff directory and credential store together into one attempt
//! with three terminal states. External callers never learn whether an
//! identifier exists: unknown identifiers and wrong passwords produce the
//! same rejection, and the unknown-identifier path still pays a bcrypt
//! verification so the two are not separable by timing either. Rate
//! limiting happens at the HTTP boundary, before this machine runs.

use tracing::{info, warn};

use super::accounts::{burn_dummy_verification, verify_password, AccountStore};
use super::directory::{normalize_identifier, Directory, StaffRecord};
use super::error::AuthError;

/// Terminal state of one login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Credentials verified against an existing account.
    Accepted(StaffRecord),
    /// Identity exists in the directory but has no broker account yet.
    NeedsRegistration(StaffRecord),
    Rejected(AuthError),
}

pub struct Authenticator<'a> {
    directory: &'a dyn Directory,
    accounts: &'a dyn AccountStore,
}

impl<'a> Authenticator<'a> {
    #[must_use]
    pub const fn new(directory: &'a dyn Directory, accounts: &'a dyn AccountStore) -> Self {
        Self {
            directory,
            accounts,
        }
    }

    /// Run one attempt. `source` is the client address, carried for the
    /// audit trail in the logs.
    pub async fn login(
        &self,
        employee_name: &str,
        password: &str,
        source: &str,
    ) -> Result<Decision, AuthError> {
        let employee_name = normalize_identifier(employee_name);

        let Some(staff) = self.directory.find_staff(&employee_name).await? else {
            // Equalize timing with the stored-hash path.
            burn_dummy_verification(password);
            warn!(employee_name, source, "Login rejected: unknown identifier");
            return Ok(Decision::Rejected(AuthError::InvalidCredential));
        };

        let Some(hash) = self.accounts.password_hash(&employee_name).await? else {
            info!(employee_name, source, "Login deferred: registration required");
            return Ok(Decision::NeedsRegistration(staff));
        };

        if !verify_password(password, &hash) {
            warn!(employee_name, source, "Login rejected: password mismatch");
            return Ok(Decision::Rejected(AuthError::InvalidCredential));
        }

        info!(employee_name, source, "Login accepted");
        Ok(Decision::Accepted(staff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::accounts::{hash_password, MemoryAccountStore};
    use crate::auth::directory::MemoryDirectory;
    use crate::auth::error::GENERIC_CREDENTIAL_MESSAGE;

    fn jane() -> StaffRecord {
        StaffRecord {
            employee_name: "jane.doe".into(),
            name: "Jane Doe".into(),
            dept_code: "ENG".into(),
            level: 2,
            ext: Some("4821".into()),
        }
    }

    async fn fixture() -> (MemoryDirectory, MemoryAccountStore) {
        let directory = MemoryDirectory::new(vec![jane()]);
        let accounts = MemoryAccountStore::default();
        accounts
            .create("jane.doe", &hash_password("hunter22").unwrap())
            .await
            .unwrap();
        (directory, accounts)
    }

    #[tokio::test]
    async fn valid_credentials_are_accepted() {
        let (directory, accounts) = fixture().await;
        let auth = Authenticator::new(&directory, &accounts);

        let decision = auth.login(" Jane.Doe ", "hunter22", "10.0.0.1").await.unwrap();
        assert_eq!(decision, Decision::Accepted(jane()));
    }

    #[tokio::test]
    async fn unknown_identifier_and_wrong_password_are_indistinguishable() {
        let (directory, accounts) = fixture().await;
        let auth = Authenticator::new(&directory, &accounts);

        let unknown = auth.login("ghost", "hunter22", "10.0.0.1").await.unwrap();
        let wrong = auth.login("jane.doe", "wrong", "10.0.0.1").await.unwrap();

        let message = |d: &Decision| match d {
            Decision::Rejected(err) => err.public_message().to_string(),
            other => panic!("expected rejection, got {other:?}"),
        };
        assert_eq!(message(&unknown), GENERIC_CREDENTIAL_MESSAGE);
        assert_eq!(message(&unknown), message(&wrong));
    }

    #[tokio::test]
    async fn directory_identity_without_account_needs_registration() {
        let directory = MemoryDirectory::new(vec![jane()]);
        let accounts = MemoryAccountStore::default();
        let auth = Authenticator::new(&directory, &accounts);

        let decision = auth.login("jane.doe", "anything", "10.0.0.1").await.unwrap();
        assert_eq!(decision, Decision::NeedsRegistration(jane()));
    }
}
