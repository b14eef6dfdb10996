//! Identity provider over the Identity Toolkit REST protocol.
//!
//! Password sign-in, sign-up and IdP assertion exchange go to the accounts
//! endpoints; ID tokens are renewed with a refresh-token grant. The signed-in
//! user record (identity, refresh token, last ID token) is kept in a
//! [`KeyValueStore`] owned by this provider, separate from the session hint.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::auth::session::{DEFAULT_TOKEN_LIFETIME_MINUTES, TOKEN_REFRESH_BUFFER_MINUTES};
use crate::auth::{BearerToken, Credential, Identity};
use crate::error::AuthError;
use crate::storage::KeyValueStore;
use crate::subscription::{ListenerSet, Subscription};

use super::{IdentityListener, IdentityProvider, NativeCredential};

pub const DEFAULT_AUTH_BASE_URL: &str = "https://identitytoolkit.googleapis.com/v1";
pub const DEFAULT_TOKEN_BASE_URL: &str = "https://securetoken.googleapis.com/v1";

/// Storage slot for the provider's own user record.
pub const USER_RECORD_KEY: &str = "identity_user";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// `signInWithIdp` requires a request URI even for assertions obtained natively.
const IDP_REQUEST_URI: &str = "http://localhost";

#[derive(Debug, Clone)]
pub struct RestIdentityConfig {
    pub api_key: String,
    pub auth_base_url: String,
    pub token_base_url: String,
    pub request_timeout: Duration,
}

impl RestIdentityConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            auth_base_url: DEFAULT_AUTH_BASE_URL.to_string(),
            token_base_url: DEFAULT_TOKEN_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    identity: Identity,
    refresh_token: String,
    id_token: BearerToken,
}

impl UserRecord {
    fn credential(&self) -> Credential {
        Credential::new(self.identity.clone(), self.id_token.clone())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountResponse {
    local_id: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

fn token_from(value: String, expires_in: Option<&str>) -> BearerToken {
    let seconds = expires_in
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_MINUTES * 60);
    BearerToken::with_lifetime(value, ChronoDuration::seconds(seconds))
}

/// Map an Identity Toolkit error message onto the auth error taxonomy.
///
/// Messages look like `EMAIL_NOT_FOUND` or
/// `WEAK_PASSWORD : Password should be at least 6 characters`.
pub(crate) fn map_error_code(message: &str) -> AuthError {
    let code = message
        .split([' ', ':'])
        .next()
        .unwrap_or(message)
        .trim();
    match code {
        "EMAIL_NOT_FOUND" => AuthError::AccountNotFound,
        "INVALID_PASSWORD" | "INVALID_LOGIN_CREDENTIALS" => AuthError::InvalidCredentials,
        "TOO_MANY_ATTEMPTS_TRY_LATER" => AuthError::RateLimited,
        "INVALID_EMAIL" | "MISSING_EMAIL" => AuthError::MalformedEmail,
        "EMAIL_EXISTS" => AuthError::EmailAlreadyInUse,
        c if c.starts_with("WEAK_PASSWORD") => AuthError::WeakPassword,
        "TOKEN_EXPIRED" | "INVALID_REFRESH_TOKEN" | "USER_NOT_FOUND" | "USER_DISABLED" => {
            AuthError::TokenRefreshFailed(code.to_string())
        }
        other => AuthError::Provider(other.to_string()),
    }
}

/// Refresh-token rejections that mean the account session is gone for good.
fn is_revocation(err: &AuthError) -> bool {
    matches!(err, AuthError::TokenRefreshFailed(_))
}

pub struct RestIdentityProvider {
    client: Client,
    config: RestIdentityConfig,
    storage: Arc<dyn KeyValueStore>,
    user: Mutex<Option<UserRecord>>,
    listeners: ListenerSet<dyn IdentityListener>,
}

impl RestIdentityProvider {
    /// Loads any previously saved user record from `storage`.
    pub fn new(
        config: RestIdentityConfig,
        storage: Arc<dyn KeyValueStore>,
    ) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AuthError::Provider(format!("Failed to build HTTP client: {}", e)))?;

        let user = match storage.get(USER_RECORD_KEY)? {
            Some(blob) => match serde_json::from_slice::<UserRecord>(&blob) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Discarding unreadable identity record");
                    storage.remove(USER_RECORD_KEY)?;
                    None
                }
            },
            None => None,
        };

        Ok(Self {
            client,
            config,
            storage,
            user: Mutex::new(user),
            listeners: ListenerSet::new(),
        })
    }

    fn accounts_url(&self, method: &str) -> String {
        format!(
            "{}/accounts:{}",
            self.config.auth_base_url.trim_end_matches('/'),
            method
        )
    }

    fn token_url(&self) -> String {
        format!("{}/token", self.config.token_base_url.trim_end_matches('/'))
    }

    async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, AuthError> {
        if response.status().is_success() {
            return Ok(response.json().await?);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(envelope) => Err(map_error_code(&envelope.error.message)),
            Err(_) => Err(AuthError::Provider(format!(
                "Identity service returned {}",
                status
            ))),
        }
    }

    async fn call_accounts(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<Credential, AuthError> {
        debug!(method = method, "Calling identity service");
        let response = self
            .client
            .post(self.accounts_url(method))
            .query(&[("key", self.config.api_key.as_str())])
            .json(&body)
            .send()
            .await?;
        let account: AccountResponse = Self::parse(response).await?;

        let mut identity = Identity::new(account.local_id, account.email.unwrap_or_default());
        if let Some(name) = account.display_name.filter(|n| !n.is_empty()) {
            identity = identity.with_display_name(name);
        }
        let record = UserRecord {
            identity,
            refresh_token: account.refresh_token,
            id_token: token_from(account.id_token, account.expires_in.as_deref()),
        };
        let credential = record.credential();
        self.replace_user(Some(record))?;
        self.notify(Some(credential.clone()));
        Ok(credential)
    }

    async fn refresh(&self, record: UserRecord) -> Result<UserRecord, AuthError> {
        debug!(subject_id = %record.identity.subject_id, "Exchanging refresh token");
        let response = self
            .client
            .post(self.token_url())
            .query(&[("key", self.config.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", record.refresh_token.as_str()),
            ])
            .send()
            .await?;
        let refreshed: RefreshResponse = Self::parse(response).await?;

        if let Some(user_id) = refreshed.user_id.as_deref() {
            if user_id != record.identity.subject_id {
                return Err(AuthError::Provider("Refresh returned a different user".into()));
            }
        }
        Ok(UserRecord {
            identity: record.identity,
            refresh_token: refreshed.refresh_token,
            id_token: token_from(refreshed.id_token, refreshed.expires_in.as_deref()),
        })
    }

    /// Refresh and store; a revoked refresh token clears the record.
    async fn refresh_and_store(&self, record: UserRecord) -> Result<UserRecord, AuthError> {
        match self.refresh(record).await {
            Ok(updated) => {
                self.replace_user(Some(updated.clone()))?;
                self.notify(Some(updated.credential()));
                Ok(updated)
            }
            Err(e) if is_revocation(&e) => {
                info!(error = %e, "Identity service revoked the session");
                self.replace_user(None)?;
                self.notify(None);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn current_user(&self) -> Option<UserRecord> {
        self.user
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn replace_user(&self, record: Option<UserRecord>) -> Result<(), AuthError> {
        match &record {
            Some(record) => {
                let blob = serde_json::to_vec(record).map_err(|e| AuthError::Storage(e.to_string()))?;
                self.storage.set(USER_RECORD_KEY, &blob)?;
            }
            None => self.storage.remove(USER_RECORD_KEY)?,
        }
        *self.user.lock().unwrap_or_else(PoisonError::into_inner) = record;
        Ok(())
    }

    fn notify(&self, change: Option<Credential>) {
        for listener in self.listeners.snapshot() {
            listener.on_change(change.clone());
        }
    }
}

#[async_trait]
impl IdentityProvider for RestIdentityProvider {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Credential, AuthError> {
        self.call_accounts(
            "signInWithPassword",
            json!({ "email": email, "password": password, "returnSecureToken": true }),
        )
        .await
    }

    async fn create_user(&self, email: &str, password: &str) -> Result<Credential, AuthError> {
        self.call_accounts(
            "signUp",
            json!({ "email": email, "password": password, "returnSecureToken": true }),
        )
        .await
    }

    async fn sign_in_with_native_credential(
        &self,
        credential: NativeCredential,
    ) -> Result<Credential, AuthError> {
        let post_body = {
            let mut form = form_urlencoded::Serializer::new(String::new());
            form.append_pair("id_token", &credential.id_token)
                .append_pair("providerId", &credential.provider_id);
            if let Some(access_token) = &credential.access_token {
                form.append_pair("access_token", access_token);
            }
            form.finish()
        };
        self.call_accounts(
            "signInWithIdp",
            json!({
                "postBody": post_body,
                "requestUri": IDP_REQUEST_URI,
                "returnSecureToken": true,
                "returnIdpCredential": true,
            }),
        )
        .await
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.replace_user(None)?;
        self.notify(None);
        Ok(())
    }

    /// Confirms the saved user by exchanging its refresh token.
    async fn current_identity(&self) -> Result<Option<Identity>, AuthError> {
        let Some(record) = self.current_user() else {
            return Ok(None);
        };
        match self.refresh_and_store(record).await {
            Ok(updated) => Ok(Some(updated.identity)),
            Err(e) if is_revocation(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_token(&self, force_refresh: bool) -> Result<BearerToken, AuthError> {
        let record = self.current_user().ok_or(AuthError::NotSignedIn)?;
        let margin = ChronoDuration::minutes(TOKEN_REFRESH_BUFFER_MINUTES);
        if !force_refresh && !record.id_token.expires_within(margin) {
            return Ok(record.id_token);
        }
        Ok(self.refresh_and_store(record).await?.id_token)
    }

    fn on_identity_changed(&self, listener: Arc<dyn IdentityListener>) -> Subscription {
        self.listeners.add(listener)
    }
}
