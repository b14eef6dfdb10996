//! Applies identity changes pushed by the provider to the session store.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::identity::IdentityProvider;
use crate::subscription::Subscription;

use super::session::Credential;
use super::store::{SessionStore, Transition};

/// Listens for the lifetime of the auth context. Changes that arrive before
/// startup reconciliation has finished are queued, then applied in order.
pub struct AuthStateObserver {
    subscription: Option<Subscription>,
    task: JoinHandle<()>,
}

impl AuthStateObserver {
    /// Must be called from within a tokio runtime.
    pub fn start(identity: &dyn IdentityProvider, store: Arc<SessionStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Option<Credential>>();
        let subscription = identity.on_identity_changed(Arc::new(move |change: Option<Credential>| {
            let _ = tx.send(change);
        }));

        let task = tokio::spawn(async move {
            store.initialized().await;
            debug!("Auth state observer active");
            while let Some(change) = rx.recv().await {
                apply_change(&store, change);
            }
        });

        Self {
            subscription: Some(subscription),
            task,
        }
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        self.task.abort();
    }
}

impl Drop for AuthStateObserver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn apply_change(store: &SessionStore, change: Option<Credential>) {
    match change {
        Some(credential) => {
            let subject_id = credential.identity.subject_id.clone();
            match store.adopt(credential) {
                Ok(_) => debug!(subject_id = %subject_id, "Adopted provider credential"),
                Err(e) => warn!(error = %e, "Could not adopt provider credential"),
            }
        }
        None => {
            if store.read().credential().is_some() {
                info!("Provider revoked the session");
                if let Err(e) = store.write(Transition::Revoked) {
                    warn!(error = %e, "Could not revoke session");
                }
            }
        }
    }
}
