//! Bearer token refresh with single-flight deduplication.
//!
//! Concurrent callers that need a fresh token share one provider call: the
//! first caller spawns the refresh as its own task and parks a `Shared`
//! handle to it in `in_flight`; later callers clone the handle and await the
//! same result. The task settles the session even if every caller gives up.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Duration;
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info, warn};

use crate::error::{AuthError, Capability};
use crate::identity::IdentityProvider;

use super::session::{BearerToken, SessionStatus, TOKEN_REFRESH_BUFFER_MINUTES};
use super::store::{SessionStore, Transition};

type RefreshFuture = Shared<BoxFuture<'static, Result<BearerToken, AuthError>>>;

struct InFlight {
    id: u64,
    refresh: RefreshFuture,
    done: Arc<AtomicBool>,
}

pub struct TokenRefresher {
    store: Arc<SessionStore>,
    identity: Option<Arc<dyn IdentityProvider>>,
    margin: Duration,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

impl TokenRefresher {
    pub fn new(store: Arc<SessionStore>, identity: Option<Arc<dyn IdentityProvider>>) -> Self {
        Self {
            store,
            identity,
            margin: Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES),
            in_flight: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Treat tokens expiring within `margin` as already due for refresh.
    pub fn with_margin(mut self, margin: Duration) -> Self {
        self.margin = margin;
        self
    }

    /// Return a usable bearer token.
    ///
    /// Without `force_refresh`, a cached token that is not expired (or about
    /// to be) comes straight back with no network call. Otherwise one
    /// provider refresh runs, shared by every concurrent caller.
    ///
    /// # Errors
    /// `NotSignedIn` when there is no session, `CapabilityUnavailable` when no
    /// identity provider is configured, `TokenRefreshFailed` when the
    /// provider refused (the session is then `Expired`).
    pub async fn get_valid_token(&self, force_refresh: bool) -> Result<BearerToken, AuthError> {
        let session = self.store.read();
        let Some(cached) = session.token() else {
            return Err(AuthError::NotSignedIn);
        };

        if !force_refresh && !cached.expires_within(self.margin) {
            return Ok(cached.clone());
        }

        let identity = self
            .identity
            .as_ref()
            .ok_or(AuthError::CapabilityUnavailable(Capability::IdentityProvider))?;

        let (id, refresh) = self.join_or_start(identity);
        let result = refresh.await;
        self.finish(id);
        result
    }

    /// Number of refreshes started since creation.
    pub fn refreshes_started(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    fn join_or_start(&self, identity: &Arc<dyn IdentityProvider>) -> (u64, RefreshFuture) {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(in_flight) = slot.as_ref() {
            // A settled refresh left behind by cancelled waiters must not be reused.
            if !in_flight.done.load(Ordering::Acquire) {
                debug!(refresh_id = in_flight.id, "Joining in-flight token refresh");
                return (in_flight.id, in_flight.refresh.clone());
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let done = Arc::new(AtomicBool::new(false));
        let work = run_refresh(Arc::clone(identity), Arc::clone(&self.store));
        let settled = Arc::clone(&done);
        let task = tokio::spawn(async move {
            let result = work.await;
            settled.store(true, Ordering::Release);
            result
        });

        let refresh = async move {
            task.await.unwrap_or_else(|e| {
                Err(AuthError::TokenRefreshFailed(format!("refresh task failed: {}", e)))
            })
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            id,
            refresh: refresh.clone(),
            done,
        });
        (id, refresh)
    }

    fn finish(&self, id: u64) {
        let mut slot = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|in_flight| in_flight.id == id) {
            *slot = None;
        }
    }
}

async fn run_refresh(
    identity: Arc<dyn IdentityProvider>,
    store: Arc<SessionStore>,
) -> Result<BearerToken, AuthError> {
    let before = store.read();
    let subject = before.identity().map(|identity| identity.subject_id.clone());
    let tracked = matches!(
        before.status(),
        SessionStatus::Authenticated | SessionStatus::Expired
    );
    if tracked {
        store.write(Transition::BeginRefresh)?;
    }

    match identity.get_token(true).await {
        Ok(token) => {
            if tracked {
                if let Err(e) = store.write(Transition::Refreshed(token.clone())) {
                    // The provider may have pushed the rotated credential first.
                    let now = store.read();
                    let same_subject = now
                        .identity()
                        .is_some_and(|identity| Some(&identity.subject_id) == subject.as_ref());
                    if !same_subject {
                        debug!(error = %e, "Session changed during token refresh");
                        return Err(AuthError::NotSignedIn);
                    }
                    debug!(status = %now.status(), "Refreshed token already applied to the session");
                }
            }
            info!(expires_at = ?token.expires_at(), "Bearer token refreshed");
            Ok(token)
        }
        Err(e) => {
            warn!(error = %e, "Token refresh failed");
            if tracked {
                let _ = store.write(Transition::RefreshFailed);
            }
            Err(AuthError::TokenRefreshFailed(e.to_string()))
        }
    }
}
