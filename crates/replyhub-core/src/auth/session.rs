use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Default lifetime assumed for provider tokens that don't state one.
/// Identity provider ID tokens live for an hour.
pub const DEFAULT_TOKEN_LIFETIME_MINUTES: i64 = 60;

/// Buffer before expiry at which a token counts as due for refresh.
pub const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub subject_id: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Identity {
    pub fn new(subject_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            email: email.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name for greetings: display name when set, else the email.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.email)
    }
}

/// Opaque bearer string plus the timing needed to decide when to refresh it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct BearerToken {
    value: String,
    issued_at: DateTime<Utc>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl BearerToken {
    pub fn new(value: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            value: value.into(),
            issued_at: Utc::now(),
            expires_at,
        }
    }

    pub fn with_lifetime(value: impl Into<String>, lifetime: Duration) -> Self {
        let now = Utc::now();
        Self {
            value: value.into(),
            issued_at: now,
            expires_at: Some(now + lifetime),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Tokens without a known expiry are never considered expired locally.
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() >= at).unwrap_or(false)
    }

    /// Check if the token expires within `margin` and should be refreshed
    pub fn expires_within(&self, margin: Duration) -> bool {
        self.expires_at
            .map(|at| Utc::now() + margin >= at)
            .unwrap_or(false)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> Option<i64> {
        self.expires_at
            .map(|at| (at - Utc::now()).num_minutes().max(0))
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("value", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A verified identity together with the token derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Credential {
    pub identity: Identity,
    pub token: BearerToken,
}

impl Credential {
    pub fn new(identity: Identity, token: BearerToken) -> Self {
        Self { identity, token }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Refreshing,
    Expired,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Unauthenticated => "unauthenticated",
            SessionStatus::Authenticating => "authenticating",
            SessionStatus::Authenticated => "authenticated",
            SessionStatus::Refreshing => "refreshing",
            SessionStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of who is signed in.
///
/// Identity and token travel together as one `Credential`, so a session can
/// never carry one without the other.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Session {
    pub(crate) status: SessionStatus,
    pub(crate) credential: Option<Credential>,
    pub(crate) last_verified_at: Option<DateTime<Utc>>,
    pub(crate) revision: u64,
}

impl Session {
    pub(crate) fn unauthenticated() -> Self {
        Self {
            status: SessionStatus::Unauthenticated,
            credential: None,
            last_verified_at: None,
            revision: 0,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.credential.as_ref().map(|c| &c.identity)
    }

    pub fn token(&self) -> Option<&BearerToken> {
        self.credential.as_ref().map(|c| &c.token)
    }

    pub fn credential(&self) -> Option<&Credential> {
        self.credential.as_ref()
    }

    pub fn last_verified_at(&self) -> Option<DateTime<Utc>> {
        self.last_verified_at
    }

    /// Bumped once per applied transition.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == SessionStatus::Authenticated && self.credential.is_some()
    }

    /// True when the last successful backend round trip is older than `grace`.
    /// A session that has never been verified has nothing to go stale.
    pub fn verification_stale(&self, grace: Duration) -> bool {
        self.last_verified_at
            .is_some_and(|at| Utc::now() - at > grace)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::unauthenticated()
    }
}

/// Resume hint written to persisted storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSession {
    pub identity: Identity,
    pub token: BearerToken,
    pub status: SessionStatus,
    #[serde(default)]
    pub last_verified_at: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
}

impl PersistedSession {
    /// Returns `None` for sessions with nothing worth resuming.
    pub fn from_session(session: &Session) -> Option<Self> {
        let credential = session.credential.as_ref()?;
        let status = match session.status {
            SessionStatus::Expired => SessionStatus::Expired,
            _ => SessionStatus::Authenticated,
        };
        Some(Self {
            identity: credential.identity.clone(),
            token: credential.token.clone(),
            status,
            last_verified_at: session.last_verified_at,
            saved_at: Utc::now(),
        })
    }
}
