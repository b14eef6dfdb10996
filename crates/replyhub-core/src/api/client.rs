//! API client for the ReplyHub backend.
//!
//! `AuthenticatedClient` attaches the current bearer token to every request,
//! recovers once from a rejected token, and keeps the session's verification
//! timestamp current.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::auth::store::{SessionStore, Transition};
use crate::auth::{BearerToken, SessionStatus, TokenRefresher};
use crate::config::DEFAULT_API_BASE_URL;
use crate::error::AuthError;

use super::ApiError;

/// Backend endpoint that accepts any valid bearer token.
pub const VERIFY_ENDPOINT: &str = "/api/me";

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Successful round trips closer together than this share one `Verified` write.
const VERIFY_WRITE_INTERVAL_SECS: i64 = 60;

const DEFAULT_OFFLINE_GRACE_HOURS: i64 = 24;

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: String,
    pub request_timeout: Duration,
    /// How long the session survives without a successful backend round trip
    /// while the network is down.
    pub offline_grace: chrono::Duration,
    pub rate_limit_backoff: Duration,
    pub max_rate_limit_retries: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            offline_grace: chrono::Duration::hours(DEFAULT_OFFLINE_GRACE_HOURS),
            rate_limit_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_rate_limit_retries: MAX_RATE_LIMIT_RETRIES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self::new(Method::GET)
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post(body: serde_json::Value) -> Self {
        Self::new(Method::POST).json(body)
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct AuthenticatedClient {
    client: Client,
    store: Arc<SessionStore>,
    refresher: Arc<TokenRefresher>,
    settings: ClientSettings,
}

impl AuthenticatedClient {
    pub fn new(
        store: Arc<SessionStore>,
        refresher: Arc<TokenRefresher>,
        settings: ClientSettings,
    ) -> Result<Self, AuthError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| AuthError::Provider(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            store,
            refresher,
            settings,
        })
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    /// Resolve `endpoint` against the backend. Absolute URLs are accepted
    /// only on the backend's own origin; the bearer token never leaves it.
    fn url(&self, endpoint: &str) -> Result<String, AuthError> {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Ok(format!(
                "{}/{}",
                self.settings.base_url.trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            ));
        }

        let foreign = || AuthError::ForeignEndpoint(endpoint.to_string());
        let base = Url::parse(&self.settings.base_url).map_err(|_| foreign())?;
        let target = Url::parse(endpoint).map_err(|_| foreign())?;
        if target.origin() != base.origin() {
            warn!(endpoint = endpoint, "Refusing to send session token off the backend origin");
            return Err(foreign());
        }
        Ok(target.into())
    }

    /// Send an authenticated request.
    ///
    /// Non-success statuses other than 401 are returned as-is for the caller
    /// to interpret. A 401 gets one forced token refresh and one retry; if
    /// the retry is also rejected, the response is returned and the session
    /// becomes `Expired`.
    pub async fn request(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Response, AuthError> {
        let url = self.url(endpoint)?;

        let token = self.refresher.get_valid_token(false).await?;
        let response = self.send(&url, &options, &token).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            self.record_success(&response);
            return Ok(response);
        }

        debug!(url = %url, "Token rejected, refreshing and retrying once");
        let token = self.refresher.get_valid_token(true).await?;
        let retry = self.send(&url, &options, &token).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %url, "Refreshed token rejected, expiring session");
            if let Err(e) = self.store.write(Transition::Invalidated) {
                debug!(error = %e, "Session already left the authenticated state");
            }
            return Ok(retry);
        }

        self.record_success(&retry);
        Ok(retry)
    }

    async fn send(
        &self,
        url: &str,
        options: &RequestOptions,
        token: &BearerToken,
    ) -> Result<Response, AuthError> {
        let mut headers = options.headers.clone();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", token.as_str()))
            .map_err(|_| AuthError::Provider("Bearer token is not a valid header value".into()))?;
        headers.insert(header::AUTHORIZATION, bearer);

        let mut builder = self
            .client
            .request(options.method.clone(), url)
            .headers(headers);
        if let Some(body) = &options.body {
            builder = builder.json(body);
        }

        match builder.send().await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!(url = url, error = %e, "Request failed without a response");
                self.note_unreachable();
                Err(AuthError::NetworkError(e.to_string()))
            }
        }
    }

    /// Keep the session while offline, up to the grace window.
    fn note_unreachable(&self) {
        let session = self.store.read();
        if session.status() == SessionStatus::Authenticated
            && session.verification_stale(self.settings.offline_grace)
        {
            warn!(
                last_verified_at = ?session.last_verified_at(),
                "Offline grace window lapsed, expiring session"
            );
            if let Err(e) = self.store.write(Transition::Invalidated) {
                debug!(error = %e, "Could not expire session");
            }
        }
    }

    fn record_success(&self, response: &Response) {
        if !response.status().is_success() {
            return;
        }
        let session = self.store.read();
        let now = Utc::now();
        let due = session.last_verified_at().map_or(true, |at| {
            now - at >= chrono::Duration::seconds(VERIFY_WRITE_INTERVAL_SECS)
        });
        if due && session.credential().is_some() {
            if let Err(e) = self.store.write(Transition::Verified(now)) {
                debug!(error = %e, "Could not record verification");
            }
        }
    }

    /// Check if response is successful, returning an error with body if not.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(response: Response) -> Result<Option<Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn json_with_retry<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff = self.settings.rate_limit_backoff;

        loop {
            let response = self.request(endpoint, options.clone()).await?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    return response.json().await.map_err(|e| {
                        ApiError::InvalidResponse(format!(
                            "Failed to parse JSON response from {}: {}",
                            endpoint, e
                        ))
                    });
                }
                None => {
                    retries += 1;
                    if retries > self.settings.max_rate_limit_retries {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(
                        endpoint = endpoint,
                        retry = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Rate limited, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.json_with_retry(endpoint, RequestOptions::get()).await
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let body = serde_json::to_value(body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        self.json_with_retry(endpoint, RequestOptions::post(body)).await
    }

    /// Whether the backend accepts the current session.
    pub async fn verify(&self) -> Result<bool, AuthError> {
        let response = self.request(VERIFY_ENDPOINT, RequestOptions::get()).await?;
        Ok(response.status().is_success())
    }
}
