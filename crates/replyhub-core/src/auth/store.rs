//! The session store: one snapshot, serialized writes, ordered notifications.
//!
//! Every mutation goes through [`SessionStore::write`] with a [`Transition`],
//! which is checked against the session state machine:
//!
//! ```text
//! Unauthenticated --BeginSignIn--> Authenticating --SignedIn--> Authenticated
//!                                  Authenticating --SignInFailed--> (previous)
//!                                  Authenticating --BeginSignIn--> Authenticating
//! Authenticated --BeginRefresh--> Refreshing --Refreshed--> Authenticated
//!                                 Refreshing --RefreshFailed--> Expired
//! Authenticated --Invalidated--> Expired
//! Expired --BeginSignIn | BeginRefresh--> ...
//! any --SignedOut | Revoked--> Unauthenticated
//! ```
//!
//! Observers are called while the write lock is held, so they see every
//! transition exactly in submission order. They must not write back into the
//! store from inside `on_change`.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::AuthError;
use crate::storage::KeyValueStore;
use crate::subscription::{ListenerSet, Subscription};

use super::session::{BearerToken, Credential, PersistedSession, Session, SessionStatus};

/// Storage slot holding the resume hint.
pub const SESSION_KEY: &str = "session";

/// Receives every session transition, in order.
pub trait SessionObserver: Send + Sync {
    fn on_change(&self, session: &Session);
}

impl<F> SessionObserver for F
where
    F: Fn(&Session) + Send + Sync,
{
    fn on_change(&self, session: &Session) {
        self(session)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Transition {
    BeginSignIn,
    SignInFailed,
    SignedIn(Credential),
    BeginRefresh,
    Refreshed(BearerToken),
    RefreshFailed,
    /// The backend rejected a freshly refreshed token, or the offline grace
    /// window lapsed.
    Invalidated,
    Verified(DateTime<Utc>),
    SignedOut,
    /// The identity provider no longer knows this session.
    Revoked,
}

impl Transition {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Transition::BeginSignIn => "begin_sign_in",
            Transition::SignInFailed => "sign_in_failed",
            Transition::SignedIn(_) => "signed_in",
            Transition::BeginRefresh => "begin_refresh",
            Transition::Refreshed(_) => "refreshed",
            Transition::RefreshFailed => "refresh_failed",
            Transition::Invalidated => "invalidated",
            Transition::Verified(_) => "verified",
            Transition::SignedOut => "signed_out",
            Transition::Revoked => "revoked",
        }
    }
}

/// Compute the session that `transition` produces from `current`.
fn apply(
    current: &Session,
    before_sign_in: Option<&Session>,
    transition: Transition,
) -> Result<Session, AuthError> {
    use SessionStatus::*;

    let invalid = |t: &Transition| AuthError::InvalidTransition {
        from: current.status,
        transition: t.name(),
    };

    let mut next = current.clone();
    next.revision = current.revision + 1;

    match transition {
        Transition::BeginSignIn => match current.status {
            Unauthenticated | Authenticating | Authenticated | Expired => {
                next.status = Authenticating
            }
            _ => return Err(invalid(&Transition::BeginSignIn)),
        },
        Transition::SignInFailed => {
            if current.status != Authenticating {
                return Err(invalid(&Transition::SignInFailed));
            }
            let previous = before_sign_in.cloned().unwrap_or_default();
            next.status = previous.status;
            next.credential = previous.credential;
            next.last_verified_at = previous.last_verified_at;
        }
        Transition::SignedIn(credential) => {
            if current.status == Unauthenticated {
                return Err(invalid(&Transition::SignedIn(credential)));
            }
            if current.identity() != Some(&credential.identity) {
                next.last_verified_at = None;
            }
            next.status = Authenticated;
            next.credential = Some(credential);
        }
        Transition::BeginRefresh => match current.status {
            Authenticated | Expired if current.credential.is_some() => next.status = Refreshing,
            _ => return Err(invalid(&Transition::BeginRefresh)),
        },
        Transition::Refreshed(token) => match (current.status, next.credential.as_mut()) {
            (Refreshing, Some(credential)) => {
                credential.token = token;
                next.status = Authenticated;
            }
            _ => return Err(invalid(&Transition::Refreshed(token))),
        },
        Transition::RefreshFailed => {
            if current.status != Refreshing {
                return Err(invalid(&Transition::RefreshFailed));
            }
            next.status = Expired;
        }
        Transition::Invalidated => match current.status {
            Authenticated | Refreshing | Expired if current.credential.is_some() => {
                next.status = Expired
            }
            _ => return Err(invalid(&Transition::Invalidated)),
        },
        Transition::Verified(at) => {
            if current.credential.is_none() {
                return Err(invalid(&Transition::Verified(at)));
            }
            next.last_verified_at = Some(at);
        }
        Transition::SignedOut | Transition::Revoked => {
            next.status = Unauthenticated;
            next.credential = None;
            next.last_verified_at = None;
        }
    }

    Ok(next)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct WriterState {
    /// Snapshot to fall back to if the in-progress sign-in fails.
    before_sign_in: Option<Session>,
}

pub struct SessionStore {
    storage: Arc<dyn KeyValueStore>,
    current: RwLock<Session>,
    writer: Mutex<WriterState>,
    observers: ListenerSet<dyn SessionObserver>,
    initialized: watch::Sender<bool>,
}

impl SessionStore {
    pub fn new(storage: Arc<dyn KeyValueStore>) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            storage,
            current: RwLock::new(Session::unauthenticated()),
            writer: Mutex::new(WriterState::default()),
            observers: ListenerSet::new(),
            initialized,
        }
    }

    /// Current snapshot.
    pub fn read(&self) -> Session {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> Subscription {
        self.observers.add(observer)
    }

    /// Same stream as [`subscribe`](Self::subscribe), delivered through an
    /// unbounded channel for async consumers.
    pub fn updates(&self) -> SessionUpdates {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(Arc::new(ChannelObserver { tx }));
        SessionUpdates {
            rx,
            _subscription: subscription,
        }
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    /// Resolves once startup restore and reconciliation have finished.
    pub async fn initialized(&self) {
        let mut rx = self.initialized.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub(crate) fn mark_initialized(&self) {
        self.initialized.send_replace(true);
    }

    /// Drop every observer. The snapshot itself stays readable.
    pub fn dispose(&self) {
        self.observers.clear();
    }

    /// Apply `transition`, persist the result and notify observers.
    ///
    /// Storage I/O runs under the writer lock, so backends are expected to
    /// be small local slots (file, keychain) rather than network stores.
    pub(crate) fn write(&self, transition: Transition) -> Result<Session, AuthError> {
        let mut writer = lock(&self.writer);
        let current = self.read();
        let name = transition.name();

        let starts_sign_in = matches!(transition, Transition::BeginSignIn);
        let ends_sign_in = matches!(
            transition,
            Transition::SignInFailed
                | Transition::SignedIn(_)
                | Transition::SignedOut
                | Transition::Revoked
        );

        let next = match apply(&current, writer.before_sign_in.as_ref(), transition) {
            Ok(next) => next,
            Err(e) => {
                warn!(from = %current.status, transition = name, "Rejected session transition");
                return Err(e);
            }
        };

        if starts_sign_in {
            // A restarted bracket still falls back to the session it started from.
            if current.status != SessionStatus::Authenticating {
                writer.before_sign_in = Some(current.clone());
            }
        } else if ends_sign_in {
            writer.before_sign_in = None;
        }

        self.persist(&next);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();

        debug!(
            from = %current.status,
            to = %next.status,
            transition = name,
            revision = next.revision,
            "Session transition"
        );
        self.notify(&next);

        Ok(next)
    }

    /// Sign in through the full `Authenticating` bracket when starting cold.
    pub(crate) fn adopt(&self, credential: Credential) -> Result<Session, AuthError> {
        if self.read().status == SessionStatus::Unauthenticated {
            self.write(Transition::BeginSignIn)?;
        }
        self.write(Transition::SignedIn(credential))
    }

    /// Load the persisted resume hint as an optimistic snapshot.
    ///
    /// Only valid before initialization while still `Unauthenticated`.
    /// Unreadable hints are discarded.
    pub(crate) fn restore(&self) -> Result<Option<Session>, AuthError> {
        let _writer = lock(&self.writer);
        let current = self.read();
        if self.is_initialized() || current.status != SessionStatus::Unauthenticated {
            return Err(AuthError::InvalidTransition {
                from: current.status,
                transition: "restore",
            });
        }

        let Some(blob) = self.storage.get(SESSION_KEY)? else {
            debug!("No persisted session");
            return Ok(None);
        };

        let hint: PersistedSession = match serde_json::from_slice(&blob) {
            Ok(hint) => hint,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session hint");
                if let Err(e) = self.storage.remove(SESSION_KEY) {
                    error!(error = %e, "Failed to remove unreadable session hint");
                }
                return Ok(None);
            }
        };

        let status = match hint.status {
            SessionStatus::Expired => SessionStatus::Expired,
            _ => SessionStatus::Authenticated,
        };
        let next = Session {
            status,
            credential: Some(Credential::new(hint.identity, hint.token)),
            last_verified_at: hint.last_verified_at,
            revision: current.revision + 1,
        };

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next.clone();
        info!(status = %next.status, saved_at = %hint.saved_at, "Restored session hint");
        self.notify(&next);

        Ok(Some(next))
    }

    fn persist(&self, session: &Session) {
        let result = match PersistedSession::from_session(session) {
            Some(hint) => serde_json::to_vec(&hint)
                .map_err(Into::into)
                .and_then(|blob| self.storage.set(SESSION_KEY, &blob)),
            None => self.storage.remove(SESSION_KEY),
        };
        // The slot is only a hint; the in-memory session stays authoritative.
        if let Err(e) = result {
            error!(error = %e, "Failed to persist session hint");
        }
    }

    fn notify(&self, session: &Session) {
        for observer in self.observers.snapshot() {
            observer.on_change(session);
        }
    }
}

struct ChannelObserver {
    tx: mpsc::UnboundedSender<Session>,
}

impl SessionObserver for ChannelObserver {
    fn on_change(&self, session: &Session) {
        let _ = self.tx.send(session.clone());
    }
}

/// Async stream of session snapshots; unsubscribes on drop.
pub struct SessionUpdates {
    rx: mpsc::UnboundedReceiver<Session>,
    _subscription: Subscription,
}

impl SessionUpdates {
    pub async fn next(&mut self) -> Option<Session> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Session> {
        self.rx.try_recv().ok()
    }

    /// Everything delivered so far, without waiting.
    pub fn drain(&mut self) -> Vec<Session> {
        let mut out = Vec::new();
        while let Ok(session) = self.rx.try_recv() {
            out.push(session);
        }
        out
    }
}
