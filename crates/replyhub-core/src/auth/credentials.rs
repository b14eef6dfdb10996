//! Sign-in, registration and sign-out against the identity provider.
//!
//! Every sign-in style is normalized to a single [`Credential`] and brought
//! into the session store through the same `BeginSignIn` bracket.

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::Platform;
use crate::error::{AuthError, Capability};
use crate::identity::{AccountPicker, IdentityProvider, PopupError};
use crate::storage::KeyValueStore;

use super::pending::PendingSignIn;
use super::session::Credential;
use super::store::{SessionStore, Transition};

/// How interactive sign-in behaves on this platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractiveSettings {
    pub platform: Platform,
    pub redirect_origin: String,
    pub redirect_return_path: String,
}

impl Default for InteractiveSettings {
    fn default() -> Self {
        Self {
            platform: Platform::Headless,
            redirect_origin: String::new(),
            redirect_return_path: "/".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InteractiveOutcome {
    SignedIn(Credential),
    /// Navigation away has begun; the session completes on the next startup.
    Redirecting(PendingSignIn),
}

/// Local sign-out always succeeds; the remote half may not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignOutOutcome {
    pub remote_error: Option<AuthError>,
}

impl SignOutOutcome {
    pub fn is_clean(&self) -> bool {
        self.remote_error.is_none()
    }
}

pub struct CredentialProvider {
    store: Arc<SessionStore>,
    storage: Arc<dyn KeyValueStore>,
    identity: Option<Arc<dyn IdentityProvider>>,
    picker: Option<Arc<dyn AccountPicker>>,
    settings: InteractiveSettings,
}

impl CredentialProvider {
    pub fn new(
        store: Arc<SessionStore>,
        storage: Arc<dyn KeyValueStore>,
        identity: Option<Arc<dyn IdentityProvider>>,
        settings: InteractiveSettings,
    ) -> Self {
        Self {
            store,
            storage,
            identity,
            picker: None,
            settings,
        }
    }

    pub fn with_account_picker(mut self, picker: Arc<dyn AccountPicker>) -> Self {
        self.picker = Some(picker);
        self
    }

    fn provider(&self) -> Result<&Arc<dyn IdentityProvider>, AuthError> {
        self.identity
            .as_ref()
            .ok_or(AuthError::CapabilityUnavailable(Capability::IdentityProvider))
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Credential, AuthError> {
        let email = email.trim();
        if !is_valid_email(email) {
            return Err(AuthError::MalformedEmail);
        }
        let provider = Arc::clone(self.provider()?);

        info!(email = %email, "Signing in with password");
        self.bracket(provider.sign_in_with_password(email, password))
            .await
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<Credential, AuthError> {
        let email = email.trim();
        if !is_valid_email(email) {
            return Err(AuthError::MalformedEmail);
        }
        let provider = Arc::clone(self.provider()?);

        info!(email = %email, "Registering account");
        self.bracket(provider.create_user(email, password)).await
    }

    /// Platform-appropriate interactive sign-in.
    ///
    /// Windowed platforms try a popup and fall back to a full-page redirect
    /// when the popup is blocked or torn down. Mobile goes through the
    /// native account picker.
    pub async fn sign_in_interactive(&self) -> Result<InteractiveOutcome, AuthError> {
        match self.settings.platform {
            Platform::Headless => Err(AuthError::CapabilityUnavailable(
                Capability::InteractiveSignIn,
            )),
            Platform::Windowed => self.sign_in_windowed().await,
            Platform::Mobile => self.sign_in_native().await.map(InteractiveOutcome::SignedIn),
        }
    }

    async fn sign_in_windowed(&self) -> Result<InteractiveOutcome, AuthError> {
        let provider = Arc::clone(self.provider()?);

        let attempt = SignInAttempt::begin(&self.store)?;
        match provider.sign_in_popup().await {
            Ok(credential) => {
                attempt.succeed(credential.clone())?;
                Ok(InteractiveOutcome::SignedIn(credential))
            }
            Err(PopupError::Blocked | PopupError::ClosedByUser) => {
                info!("Popup unavailable, falling back to redirect sign-in");
                self.start_redirect(provider.as_ref(), attempt).await
            }
            Err(PopupError::Cancelled) => {
                attempt.fail();
                Err(AuthError::InteractiveSignInCancelled)
            }
            Err(PopupError::Failed(e)) => {
                attempt.fail();
                Err(e)
            }
        }
    }

    /// On success the bracket stays open until the app reloads and the
    /// redirect result is applied, or another sign-in restarts it.
    async fn start_redirect(
        &self,
        provider: &dyn IdentityProvider,
        attempt: SignInAttempt<'_>,
    ) -> Result<InteractiveOutcome, AuthError> {
        let pending = PendingSignIn::new(
            self.settings.redirect_origin.clone(),
            self.settings.redirect_return_path.clone(),
        );
        if let Err(e) = pending.save(self.storage.as_ref()) {
            attempt.fail();
            return Err(e);
        }

        match provider.sign_in_redirect(&pending).await {
            Ok(()) => {
                info!(return_url = %pending.return_url(), "Redirect sign-in started");
                attempt.hand_off();
                Ok(InteractiveOutcome::Redirecting(pending))
            }
            Err(e) => {
                warn!(error = %e, "Redirect sign-in failed to start");
                if let Err(e) = PendingSignIn::clear(self.storage.as_ref()) {
                    warn!(error = %e, "Failed to clear sign-in marker");
                }
                attempt.fail();
                Err(AuthError::InteractiveSignInBlocked)
            }
        }
    }

    async fn sign_in_native(&self) -> Result<Credential, AuthError> {
        let provider = Arc::clone(self.provider()?);
        let picker = self
            .picker
            .clone()
            .ok_or(AuthError::CapabilityUnavailable(Capability::AccountPicker))?;

        self.bracket(async move {
            let native = picker.pick_account().await?;
            debug!(provider_id = %native.provider_id, "Account picked");
            provider.sign_in_with_native_credential(native).await
        })
        .await
    }

    /// Finish a redirect sign-in started before the last reload.
    ///
    /// Consumes the resume marker; returns `None` when there was no marker,
    /// or the provider had no result waiting. A result whose `state` does not
    /// match the marker is rejected.
    pub async fn complete_pending_redirect(&self) -> Result<Option<Credential>, AuthError> {
        let Some(pending) = PendingSignIn::take(self.storage.as_ref())? else {
            return Ok(None);
        };
        let provider = Arc::clone(self.provider()?);
        debug!(started_at = %pending.started_at, "Completing redirect sign-in");

        let attempt = SignInAttempt::begin(&self.store)?;
        match provider.pending_redirect_result(&pending).await {
            Ok(Some(result)) if result.state != pending.state => {
                warn!("Redirect result belongs to a different sign-in attempt");
                attempt.fail();
                Err(AuthError::Provider("redirect sign-in state mismatch".into()))
            }
            Ok(Some(result)) => {
                let credential = result.credential;
                attempt.succeed(credential.clone())?;
                info!(subject_id = %credential.identity.subject_id, "Redirect sign-in completed");
                Ok(Some(credential))
            }
            Ok(None) => {
                info!("No redirect result waiting");
                attempt.fail();
                Ok(None)
            }
            Err(e) => {
                warn!(error = %e, "Redirect sign-in failed");
                attempt.fail();
                Err(e)
            }
        }
    }

    /// Clear the local session first, then end the provider session.
    pub async fn sign_out(&self) -> SignOutOutcome {
        if let Err(e) = self.store.write(Transition::SignedOut) {
            warn!(error = %e, "Local sign-out rejected");
        }
        if let Err(e) = PendingSignIn::clear(self.storage.as_ref()) {
            warn!(error = %e, "Failed to clear sign-in marker");
        }

        let Some(provider) = self.identity.as_ref() else {
            return SignOutOutcome::default();
        };
        match provider.sign_out().await {
            Ok(()) => {
                info!("Signed out");
                SignOutOutcome::default()
            }
            Err(e) => {
                warn!(error = %e, "Provider sign-out failed; local session already cleared");
                SignOutOutcome {
                    remote_error: Some(e),
                }
            }
        }
    }

    async fn bracket<F>(&self, sign_in: F) -> Result<Credential, AuthError>
    where
        F: Future<Output = Result<Credential, AuthError>>,
    {
        let attempt = SignInAttempt::begin(&self.store)?;
        match sign_in.await {
            Ok(credential) => {
                attempt.succeed(credential.clone())?;
                info!(subject_id = %credential.identity.subject_id, "Signed in");
                Ok(credential)
            }
            Err(e) => {
                if e.is_user_input() {
                    debug!(error = %e, "Sign-in rejected");
                } else {
                    warn!(error = %e, "Sign-in failed");
                }
                attempt.fail();
                Err(e)
            }
        }
    }
}

/// An open `BeginSignIn` bracket.
///
/// Dropped without being resolved (the caller's future was cancelled), it
/// closes the bracket with `SignInFailed` so the session returns to where
/// it was before the attempt.
struct SignInAttempt<'a> {
    store: &'a SessionStore,
    open: bool,
}

impl<'a> SignInAttempt<'a> {
    fn begin(store: &'a SessionStore) -> Result<Self, AuthError> {
        store.write(Transition::BeginSignIn)?;
        Ok(Self { store, open: true })
    }

    fn succeed(mut self, credential: Credential) -> Result<(), AuthError> {
        self.open = false;
        self.store.write(Transition::SignedIn(credential))?;
        Ok(())
    }

    fn fail(mut self) {
        self.open = false;
        self.close();
    }

    /// Leave the bracket open for a flow that finishes after a reload.
    fn hand_off(mut self) {
        self.open = false;
    }

    fn close(&self) {
        // A concurrent sign-out may already have closed the bracket.
        let _ = self.store.write(Transition::SignInFailed);
    }
}

impl Drop for SignInAttempt<'_> {
    fn drop(&mut self) {
        if self.open {
            debug!("Sign-in attempt abandoned");
            self.close();
        }
    }
}

/// Cheap local check so obviously bad input never reaches the network.
pub(crate) fn is_valid_email(email: &str) -> bool {
    if email.is_empty() || email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}
