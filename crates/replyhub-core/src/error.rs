//! Error taxonomy for the session core.
//!
//! `AuthError` is `Clone` because a single in-flight token refresh hands the
//! same result to every caller waiting on it.

use std::fmt;

use thiserror::Error;

use crate::auth::SessionStatus;
use crate::storage::StorageError;

/// An optional collaborator the core was asked to use but does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    IdentityProvider,
    InteractiveSignIn,
    PopupSignIn,
    RedirectSignIn,
    NativeSignIn,
    AccountPicker,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::IdentityProvider => "identity provider",
            Capability::InteractiveSignIn => "interactive sign-in",
            Capability::PopupSignIn => "popup sign-in",
            Capability::RedirectSignIn => "redirect sign-in",
            Capability::NativeSignIn => "native credential sign-in",
            Capability::AccountPicker => "native account picker",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("No account exists for this email")]
    AccountNotFound,

    #[error("Email address is malformed")]
    MalformedEmail,

    #[error("An account already exists for this email")]
    EmailAlreadyInUse,

    #[error("Password is too weak")]
    WeakPassword,

    #[error("Too many attempts - please wait before retrying")]
    RateLimited,

    #[error("Interactive sign-in was cancelled")]
    InteractiveSignInCancelled,

    #[error("Interactive sign-in was blocked")]
    InteractiveSignInBlocked,

    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(Capability),

    #[error("Not signed in")]
    NotSignedIn,

    #[error("Invalid session transition: {transition} while {from:?}")]
    InvalidTransition {
        from: SessionStatus,
        transition: &'static str,
    },

    #[error("Refusing to send session credentials to {0}")]
    ForeignEndpoint(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Identity provider error: {0}")]
    Provider(String),
}

impl AuthError {
    /// Failures caused by what the user typed; shown verbatim, session untouched.
    pub fn is_user_input(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredentials
                | AuthError::AccountNotFound
                | AuthError::MalformedEmail
                | AuthError::EmailAlreadyInUse
                | AuthError::WeakPassword
                | AuthError::RateLimited
        )
    }

    pub fn is_network(&self) -> bool {
        matches!(self, AuthError::NetworkError(_))
    }
}

impl From<reqwest::Error> for AuthError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            AuthError::Provider(format!("Failed to decode response: {}", err))
        } else {
            AuthError::NetworkError(err.to_string())
        }
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::Storage(err.to_string())
    }
}
