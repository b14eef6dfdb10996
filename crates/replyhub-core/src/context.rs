//! Wiring for one application-lifetime auth context.
//!
//! `AuthContext` owns the session store, the credential provider, the token
//! refresher, the authenticated client and the auth state observer, and
//! runs the startup sequence:
//!
//! 1. register the provider listener (events buffer until step 5)
//! 2. restore the persisted session hint
//! 3. complete a redirect sign-in left pending before the last reload
//! 4. reconcile with the provider's view of the current identity
//! 5. mark the store initialized

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::api::{AuthenticatedClient, ClientSettings};
use crate::auth::store::Transition;
use crate::auth::{
    AuthStateObserver, Credential, CredentialProvider, InteractiveSettings, Session,
    SessionObserver, SessionStore, SessionUpdates, TokenRefresher,
};
use crate::config::Config;
use crate::error::AuthError;
use crate::identity::{AccountPicker, IdentityProvider};
use crate::storage::KeyValueStore;
use crate::subscription::Subscription;

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub client: ClientSettings,
    pub interactive: InteractiveSettings,
    pub refresh_margin: chrono::Duration,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            client: ClientSettings::default(),
            interactive: InteractiveSettings::default(),
            refresh_margin: chrono::Duration::minutes(
                crate::auth::session::TOKEN_REFRESH_BUFFER_MINUTES,
            ),
        }
    }
}

impl ContextOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            client: config.client_settings(),
            interactive: config.interactive_settings(),
            refresh_margin: config.refresh_margin(),
        }
    }
}

pub struct AuthContext {
    store: Arc<SessionStore>,
    identity: Option<Arc<dyn IdentityProvider>>,
    credentials: CredentialProvider,
    refresher: Arc<TokenRefresher>,
    client: AuthenticatedClient,
    observer: Mutex<Option<AuthStateObserver>>,
    started: AtomicBool,
}

impl AuthContext {
    /// `identity` may be `None` for contexts that only replay a persisted
    /// session; every operation needing the provider then reports
    /// `CapabilityUnavailable`.
    pub fn new(
        storage: Arc<dyn KeyValueStore>,
        identity: Option<Arc<dyn IdentityProvider>>,
        options: ContextOptions,
    ) -> Result<Self, AuthError> {
        let store = Arc::new(SessionStore::new(Arc::clone(&storage)));
        let refresher = Arc::new(
            TokenRefresher::new(Arc::clone(&store), identity.clone())
                .with_margin(options.refresh_margin),
        );
        let credentials = CredentialProvider::new(
            Arc::clone(&store),
            storage,
            identity.clone(),
            options.interactive,
        );
        let client =
            AuthenticatedClient::new(Arc::clone(&store), Arc::clone(&refresher), options.client)?;

        Ok(Self {
            store,
            identity,
            credentials,
            refresher,
            client,
            observer: Mutex::new(None),
            started: AtomicBool::new(false),
        })
    }

    pub fn from_config(
        config: &Config,
        storage: Arc<dyn KeyValueStore>,
        identity: Option<Arc<dyn IdentityProvider>>,
    ) -> Result<Self, AuthError> {
        Self::new(storage, identity, ContextOptions::from_config(config))
    }

    pub fn with_account_picker(mut self, picker: Arc<dyn AccountPicker>) -> Self {
        self.credentials = self.credentials.with_account_picker(picker);
        self
    }

    /// Run the startup sequence once; later calls wait for the first to
    /// finish and return the current session.
    pub async fn init(&self) -> Session {
        if self.started.swap(true, Ordering::SeqCst) {
            self.store.initialized().await;
            return self.store.read();
        }

        if let Some(identity) = &self.identity {
            let observer = AuthStateObserver::start(identity.as_ref(), Arc::clone(&self.store));
            *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(observer);
        }

        match self.store.restore() {
            Ok(Some(session)) => debug!(status = %session.status(), "Session hint restored"),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Failed to restore session hint"),
        }

        if let Err(e) = self.credentials.complete_pending_redirect().await {
            warn!(error = %e, "Pending redirect sign-in could not be completed");
        }

        self.reconcile().await;
        self.store.mark_initialized();

        let session = self.store.read();
        info!(status = %session.status(), "Auth context initialized");
        session
    }

    /// Let the provider confirm or deny whatever the store now holds.
    async fn reconcile(&self) {
        let Some(identity) = &self.identity else {
            return;
        };
        let session = self.store.read();

        match identity.current_identity().await {
            Ok(Some(confirmed)) => {
                if session.identity().map(|i| i.subject_id.as_str())
                    == Some(confirmed.subject_id.as_str())
                {
                    debug!(subject_id = %confirmed.subject_id, "Provider confirmed session");
                    return;
                }
                info!(subject_id = %confirmed.subject_id, "Adopting provider identity");
                match identity.get_token(false).await {
                    Ok(token) => {
                        if let Err(e) = self.store.adopt(Credential::new(confirmed, token)) {
                            warn!(error = %e, "Could not adopt provider identity");
                        }
                    }
                    Err(e) => warn!(error = %e, "Could not fetch token for provider identity"),
                }
            }
            Ok(None) => {
                if session.credential().is_some() {
                    info!("Provider no longer recognizes the restored session");
                    if let Err(e) = self.store.write(Transition::Revoked) {
                        warn!(error = %e, "Could not revoke restored session");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Could not reach identity provider, keeping restored session");
            }
        }
    }

    /// Stop listening to the provider and drop every session observer.
    pub fn dispose(&self) {
        if let Some(observer) = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            observer.stop();
        }
        self.store.dispose();
    }

    pub fn session(&self) -> Session {
        self.store.read()
    }

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> Subscription {
        self.store.subscribe(observer)
    }

    pub fn updates(&self) -> SessionUpdates {
        self.store.updates()
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn credentials(&self) -> &CredentialProvider {
        &self.credentials
    }

    pub fn refresher(&self) -> &Arc<TokenRefresher> {
        &self.refresher
    }

    pub fn client(&self) -> &AuthenticatedClient {
        &self.client
    }
}
