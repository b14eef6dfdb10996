//! Resume marker for redirect sign-in.
//!
//! A redirect navigates away from the app, so the fact that a sign-in is in
//! flight has to survive the reload. The marker lives in its own storage slot
//! and is taken (read + removed) exactly once on the next startup.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AuthError;
use crate::storage::KeyValueStore;

pub const PENDING_SIGN_IN_KEY: &str = "pending_interactive_sign_in";

/// Markers older than this are treated as abandoned.
const PENDING_SIGN_IN_TTL_MINUTES: i64 = 15;

const STATE_LENGTH: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSignIn {
    pub origin: String,
    pub return_path: String,
    /// Random value the provider echoes back, tying the result to this attempt.
    pub state: String,
    pub started_at: DateTime<Utc>,
}

impl PendingSignIn {
    pub fn new(origin: impl Into<String>, return_path: impl Into<String>) -> Self {
        let state = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(STATE_LENGTH)
            .map(char::from)
            .collect();
        Self {
            origin: origin.into(),
            return_path: return_path.into(),
            state,
            started_at: Utc::now(),
        }
    }

    pub fn is_stale(&self) -> bool {
        Utc::now() - self.started_at > Duration::minutes(PENDING_SIGN_IN_TTL_MINUTES)
    }

    /// Where the provider should send the browser back to.
    pub fn return_url(&self) -> String {
        format!(
            "{}/{}",
            self.origin.trim_end_matches('/'),
            self.return_path.trim_start_matches('/')
        )
    }

    pub(crate) fn save(&self, storage: &dyn KeyValueStore) -> Result<(), AuthError> {
        let blob = serde_json::to_vec(self).map_err(|e| AuthError::Storage(e.to_string()))?;
        storage.set(PENDING_SIGN_IN_KEY, &blob)?;
        debug!(origin = %self.origin, return_path = %self.return_path, "Saved pending sign-in marker");
        Ok(())
    }

    /// Read and remove the marker. Stale or unreadable markers are dropped
    /// and reported as absent.
    pub(crate) fn take(storage: &dyn KeyValueStore) -> Result<Option<Self>, AuthError> {
        let Some(blob) = storage.get(PENDING_SIGN_IN_KEY)? else {
            return Ok(None);
        };
        storage.remove(PENDING_SIGN_IN_KEY)?;

        let marker: PendingSignIn = match serde_json::from_slice(&blob) {
            Ok(marker) => marker,
            Err(e) => {
                warn!(error = %e, "Discarding unreadable sign-in marker");
                return Ok(None);
            }
        };

        if marker.is_stale() {
            warn!(started_at = %marker.started_at, "Discarding stale sign-in marker");
            return Ok(None);
        }
        Ok(Some(marker))
    }

    pub(crate) fn clear(storage: &dyn KeyValueStore) -> Result<(), AuthError> {
        storage.remove(PENDING_SIGN_IN_KEY)?;
        Ok(())
    }
}
