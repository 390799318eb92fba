//! Authentication hook for end-user accounts.
//!
//! tierlink does not own an account store. The login tier calls an
//! [`Authenticator`] with the account name and password from a
//! `LoginRequest`; every later tier trusts the tickets minted from that
//! first check instead of asking the store again.

use tierlink_protocol::IdentityId;

use crate::SessionError;

/// What the account store knows about a successfully authenticated account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub identity: IdentityId,
    pub account: String,
    pub roles: Vec<String>,
    pub max_characters: u32,
    /// Administrators and similar accounts are exempt from the
    /// inactivity watchdog.
    pub privileged: bool,
    /// No persistent account behind this identity (guest/unauthenticated
    /// play). Its transient character state is discarded when it drops
    /// without a transfer target.
    pub ephemeral: bool,
}

impl AccountRecord {
    /// A regular, persistent, unprivileged account.
    pub fn new(identity: IdentityId, account: impl Into<String>) -> Self {
        Self {
            identity,
            account: account.into(),
            roles: Vec::new(),
            max_characters: 0,
            privileged: false,
            ephemeral: false,
        }
    }
}

/// Validates an account's password and returns its record.
///
/// # Example
///
/// ```rust
/// use tierlink_protocol::IdentityId;
/// use tierlink_session::{AccountRecord, Authenticator, SessionError};
///
/// /// Accepts any account whose password equals its name.
/// struct EchoAuthenticator;
///
/// impl Authenticator for EchoAuthenticator {
///     async fn authenticate(
///         &self,
///         account: &str,
///         password: &str,
///     ) -> Result<AccountRecord, SessionError> {
///         if account != password {
///             return Err(SessionError::AuthFailed("bad password".into()));
///         }
///         Ok(AccountRecord::new(IdentityId(account.len() as u64), account))
///     }
/// }
/// ```
pub trait Authenticator: Send + Sync + 'static {
    /// Checks `password` for `account`.
    ///
    /// # Returns
    /// - `Ok(AccountRecord)`: the account exists and the password matches
    /// - `Err(SessionError::AuthFailed)`: anything else
    fn authenticate(
        &self,
        account: &str,
        password: &str,
    ) -> impl std::future::Future<Output = Result<AccountRecord, SessionError>> + Send;
}
