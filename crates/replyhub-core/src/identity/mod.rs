//! Identity provider seam.
//!
//! The session core never talks to an identity service directly; it goes
//! through [`IdentityProvider`]. Interactive methods have default bodies that
//! report [`Capability`] unavailability, so a provider only implements the
//! flows its platform supports.

pub mod rest;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::auth::{BearerToken, Credential, Identity, PendingSignIn};
use crate::error::{AuthError, Capability};
use crate::subscription::Subscription;

pub use self::rest::{RestIdentityConfig, RestIdentityProvider};

/// Outcome of a popup attempt that did not produce a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopupError {
    /// The environment refused to open the popup.
    Blocked,
    /// The popup window went away before completing (user closed it, or an
    /// embedded browser tore it down).
    ClosedByUser,
    /// The user explicitly cancelled the account chooser.
    Cancelled,
    Failed(AuthError),
}

impl From<AuthError> for PopupError {
    fn from(err: AuthError) -> Self {
        PopupError::Failed(err)
    }
}

impl fmt::Display for PopupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopupError::Blocked => f.write_str("popup blocked"),
            PopupError::ClosedByUser => f.write_str("popup closed by user"),
            PopupError::Cancelled => f.write_str("popup cancelled"),
            PopupError::Failed(e) => write!(f, "popup failed: {}", e),
        }
    }
}

/// Assertion returned by a platform-native account picker.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NativeCredential {
    /// Upstream provider, e.g. `google.com`.
    pub provider_id: String,
    pub id_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl fmt::Debug for NativeCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeCredential")
            .field("provider_id", &self.provider_id)
            .field("id_token", &"<redacted>")
            .finish()
    }
}

/// Credential from a completed redirect, with the `state` the provider
/// carried through the round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectResult {
    pub state: String,
    pub credential: Credential,
}

/// Push notification from the provider: a credential, or `None` once the
/// provider no longer has a signed-in user.
pub trait IdentityListener: Send + Sync {
    fn on_change(&self, change: Option<Credential>);
}

impl<F> IdentityListener for F
where
    F: Fn(Option<Credential>) + Send + Sync,
{
    fn on_change(&self, change: Option<Credential>) {
        self(change)
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in_with_password(&self, email: &str, password: &str)
        -> Result<Credential, AuthError>;

    async fn create_user(&self, email: &str, password: &str) -> Result<Credential, AuthError>;

    async fn sign_in_popup(&self) -> Result<Credential, PopupError> {
        Err(PopupError::Failed(AuthError::CapabilityUnavailable(
            Capability::PopupSignIn,
        )))
    }

    /// Start a full-page redirect. `Ok` means navigation has begun; the
    /// result arrives through [`pending_redirect_result`](Self::pending_redirect_result)
    /// after the app reloads.
    async fn sign_in_redirect(&self, _pending: &PendingSignIn) -> Result<(), AuthError> {
        Err(AuthError::CapabilityUnavailable(Capability::RedirectSignIn))
    }

    /// Result of the redirect started for `pending`, if one is waiting.
    async fn pending_redirect_result(
        &self,
        _pending: &PendingSignIn,
    ) -> Result<Option<RedirectResult>, AuthError> {
        Err(AuthError::CapabilityUnavailable(Capability::RedirectSignIn))
    }

    async fn sign_in_with_native_credential(
        &self,
        _credential: NativeCredential,
    ) -> Result<Credential, AuthError> {
        Err(AuthError::CapabilityUnavailable(Capability::NativeSignIn))
    }

    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Who the provider believes is signed in, confirmed with the provider
    /// where it can be.
    async fn current_identity(&self) -> Result<Option<Identity>, AuthError>;

    async fn get_token(&self, force_refresh: bool) -> Result<BearerToken, AuthError>;

    fn on_identity_changed(&self, listener: Arc<dyn IdentityListener>) -> Subscription;
}

/// Platform-native account selection (mobile).
#[async_trait]
pub trait AccountPicker: Send + Sync {
    /// Fails with `InteractiveSignInCancelled` when the user dismisses it.
    async fn pick_account(&self) -> Result<NativeCredential, AuthError>;
}
