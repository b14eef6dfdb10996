//! Shared fixtures for unit tests: a scriptable identity provider, a native
//! account picker, and local HTTP servers standing in for the backend and
//! the identity service.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::{Json, Router};
use chrono::Duration as ChronoDuration;
use serde_json::{json, Value};

use crate::auth::pending::PENDING_SIGN_IN_KEY;
use crate::auth::{BearerToken, Credential, Identity, PendingSignIn};
use crate::error::AuthError;
use crate::identity::{
    AccountPicker, IdentityListener, IdentityProvider, NativeCredential, PopupError, RedirectResult,
};
use crate::storage::KeyValueStore;
use crate::subscription::{ListenerSet, Subscription};

// ============================================================================
// Identity provider fake
// ============================================================================

struct FakeState {
    accounts: HashMap<String, (String, Identity)>,
    current: Option<Identity>,
    current_error: Option<AuthError>,
    next_token: u32,
    next_subject: u32,
    popup: Result<Identity, PopupError>,
    redirect_identity: Identity,
    redirect_pending: bool,
    redirect_state: String,
    fail_redirect: bool,
    native_identity: Identity,
    fail_refresh: bool,
    fail_sign_out: bool,
    token_delay: Duration,
    sign_in_delay: Duration,
    push_changes: bool,
    watched_storage: Option<Arc<dyn KeyValueStore>>,
}

/// In-memory identity provider. Knows one account, `a@b.com` /
/// `secret123` -> `u1`. Sign-ins issue `tok1`, `tok2`, ...; token refreshes
/// issue `refreshed-1`, `refreshed-2`, ...
pub(crate) struct FakeIdentityProvider {
    state: Mutex<FakeState>,
    listeners: ListenerSet<dyn IdentityListener>,
    sign_in_calls: AtomicUsize,
    token_calls: AtomicUsize,
    redirect_calls: AtomicUsize,
    sign_out_calls: AtomicUsize,
    marker_present_at_redirect: AtomicBool,
}

impl FakeIdentityProvider {
    pub(crate) fn new() -> Self {
        let u1 = Identity::new("u1", "a@b.com");
        let mut accounts = HashMap::new();
        accounts.insert("a@b.com".to_string(), ("secret123".to_string(), u1.clone()));

        Self {
            state: Mutex::new(FakeState {
                accounts,
                current: None,
                current_error: None,
                next_token: 1,
                next_subject: 2,
                popup: Ok(u1.clone()),
                redirect_identity: u1.clone(),
                redirect_pending: false,
                redirect_state: String::new(),
                fail_redirect: false,
                native_identity: u1,
                fail_refresh: false,
                fail_sign_out: false,
                token_delay: Duration::ZERO,
                sign_in_delay: Duration::ZERO,
                push_changes: false,
                watched_storage: None,
            }),
            listeners: ListenerSet::new(),
            sign_in_calls: AtomicUsize::new(0),
            token_calls: AtomicUsize::new(0),
            redirect_calls: AtomicUsize::new(0),
            sign_out_calls: AtomicUsize::new(0),
            marker_present_at_redirect: AtomicBool::new(false),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn issue(&self, identity: Identity) -> Credential {
        self.with_state(|s| {
            let token = BearerToken::with_lifetime(
                format!("tok{}", s.next_token),
                ChronoDuration::minutes(60),
            );
            s.next_token += 1;
            s.current = Some(identity.clone());
            Credential::new(identity, token)
        })
    }

    pub(crate) fn set_popup(&self, outcome: Result<Identity, PopupError>) {
        self.with_state(|s| s.popup = outcome);
    }

    pub(crate) fn set_redirect_identity(&self, identity: Identity) {
        self.with_state(|s| s.redirect_identity = identity);
    }

    pub(crate) fn set_fail_redirect(&self, fail: bool) {
        self.with_state(|s| s.fail_redirect = fail);
    }

    pub(crate) fn set_native_identity(&self, identity: Identity) {
        self.with_state(|s| s.native_identity = identity);
    }

    pub(crate) fn set_fail_refresh(&self, fail: bool) {
        self.with_state(|s| s.fail_refresh = fail);
    }

    pub(crate) fn set_fail_sign_out(&self, fail: bool) {
        self.with_state(|s| s.fail_sign_out = fail);
    }

    pub(crate) fn set_token_delay(&self, delay: Duration) {
        self.with_state(|s| s.token_delay = delay);
    }

    pub(crate) fn set_sign_in_delay(&self, delay: Duration) {
        self.with_state(|s| s.sign_in_delay = delay);
    }

    /// Notify listeners of every credential issued and token rotated, before
    /// the call that produced it returns.
    pub(crate) fn set_push_changes(&self, push: bool) {
        self.with_state(|s| s.push_changes = push);
    }

    /// Replace the `state` the next redirect result will carry.
    pub(crate) fn set_redirect_state(&self, state: &str) {
        self.with_state(|s| s.redirect_state = state.to_string());
    }

    pub(crate) fn set_current(&self, identity: Option<Identity>) {
        self.with_state(|s| s.current = identity);
    }

    /// Make `current_identity` fail, e.g. with a network error.
    pub(crate) fn set_current_error(&self, error: Option<AuthError>) {
        self.with_state(|s| s.current_error = error);
    }

    /// Record whether the resume marker is in `storage` when navigation starts.
    pub(crate) fn watch_storage(&self, storage: Arc<dyn KeyValueStore>) {
        self.with_state(|s| s.watched_storage = Some(storage));
    }

    /// Push an identity change to every registered listener.
    pub(crate) fn emit(&self, change: Option<Credential>) {
        for listener in self.listeners.snapshot() {
            listener.on_change(change.clone());
        }
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub(crate) fn sign_in_calls(&self) -> usize {
        self.sign_in_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn token_calls(&self) -> usize {
        self.token_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn redirect_calls(&self) -> usize {
        self.redirect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn sign_out_calls(&self) -> usize {
        self.sign_out_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn marker_present_at_redirect(&self) -> bool {
        self.marker_present_at_redirect.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Credential, AuthError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.with_state(|s| s.sign_in_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let identity = self.with_state(|s| match s.accounts.get(email) {
            None => Err(AuthError::AccountNotFound),
            Some((expected, _)) if expected != password => Err(AuthError::InvalidCredentials),
            Some((_, identity)) => Ok(identity.clone()),
        })?;
        let credential = self.issue(identity);
        if self.with_state(|s| s.push_changes) {
            self.emit(Some(credential.clone()));
        }
        Ok(credential)
    }

    async fn create_user(&self, email: &str, password: &str) -> Result<Credential, AuthError> {
        self.sign_in_calls.fetch_add(1, Ordering::SeqCst);
        let identity = self.with_state(|s| {
            if s.accounts.contains_key(email) {
                return Err(AuthError::EmailAlreadyInUse);
            }
            if password.len() < 6 {
                return Err(AuthError::WeakPassword);
            }
            let identity = Identity::new(format!("u{}", s.next_subject), email);
            s.next_subject += 1;
            s.accounts
                .insert(email.to_string(), (password.to_string(), identity.clone()));
            Ok(identity)
        })?;
        Ok(self.issue(identity))
    }

    async fn sign_in_popup(&self) -> Result<Credential, PopupError> {
        let outcome = self.with_state(|s| s.popup.clone());
        outcome.map(|identity| self.issue(identity))
    }

    async fn sign_in_redirect(&self, pending: &PendingSignIn) -> Result<(), AuthError> {
        self.redirect_calls.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            if let Some(storage) = &s.watched_storage {
                let present = matches!(storage.get(PENDING_SIGN_IN_KEY), Ok(Some(_)));
                self.marker_present_at_redirect.store(present, Ordering::SeqCst);
            }
            if s.fail_redirect {
                return Err(AuthError::Provider("navigation refused".into()));
            }
            s.redirect_pending = true;
            s.redirect_state = pending.state.clone();
            Ok(())
        })
    }

    async fn pending_redirect_result(
        &self,
        _pending: &PendingSignIn,
    ) -> Result<Option<RedirectResult>, AuthError> {
        let waiting = self.with_state(|s| {
            std::mem::replace(&mut s.redirect_pending, false)
                .then(|| (s.redirect_identity.clone(), s.redirect_state.clone()))
        });
        Ok(waiting.map(|(identity, state)| RedirectResult {
            state,
            credential: self.issue(identity),
        }))
    }

    async fn sign_in_with_native_credential(
        &self,
        credential: NativeCredential,
    ) -> Result<Credential, AuthError> {
        if credential.id_token != "native-ok" {
            return Err(AuthError::InvalidCredentials);
        }
        let identity = self.with_state(|s| s.native_identity.clone());
        Ok(self.issue(identity))
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.sign_out_calls.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            if s.fail_sign_out {
                return Err(AuthError::NetworkError("identity service unreachable".into()));
            }
            s.current = None;
            Ok(())
        })
    }

    async fn current_identity(&self) -> Result<Option<Identity>, AuthError> {
        self.with_state(|s| match &s.current_error {
            Some(e) => Err(e.clone()),
            None => Ok(s.current.clone()),
        })
    }

    async fn get_token(&self, _force_refresh: bool) -> Result<BearerToken, AuthError> {
        let n = self.token_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let (delay, fail) = self.with_state(|s| (s.token_delay, s.fail_refresh));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(AuthError::NetworkError("refresh endpoint unreachable".into()));
        }
        let token =
            BearerToken::with_lifetime(format!("refreshed-{}", n), ChronoDuration::minutes(60));

        let pushed = self.with_state(|s| s.push_changes.then(|| s.current.clone()).flatten());
        if let Some(identity) = pushed {
            self.emit(Some(Credential::new(identity, token.clone())));
        }
        Ok(token)
    }

    fn on_identity_changed(&self, listener: Arc<dyn IdentityListener>) -> Subscription {
        self.listeners.add(listener)
    }
}

pub(crate) struct FakeAccountPicker {
    outcome: Result<NativeCredential, AuthError>,
}

impl FakeAccountPicker {
    pub(crate) fn returning(credential: NativeCredential) -> Self {
        Self {
            outcome: Ok(credential),
        }
    }

    pub(crate) fn dismissed() -> Self {
        Self {
            outcome: Err(AuthError::InteractiveSignInCancelled),
        }
    }
}

#[async_trait]
impl AccountPicker for FakeAccountPicker {
    async fn pick_account(&self) -> Result<NativeCredential, AuthError> {
        self.outcome.clone()
    }
}

// ============================================================================
// Local HTTP servers
// ============================================================================

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{}", addr)
}

/// Base URL nothing is listening on.
pub(crate) async fn unreachable_base_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RecordedRequest {
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct BackendState {
    accepted: Mutex<HashSet<String>>,
    scripted: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

/// Backend stand-in. Every path answers 200 with an echo of the request for
/// accepted bearer tokens and 401 otherwise; scripted statuses take
/// precedence, one per request.
pub(crate) struct MockBackend {
    pub base_url: String,
    state: Arc<BackendState>,
}

impl MockBackend {
    pub(crate) async fn start() -> Self {
        let state = Arc::new(BackendState::default());
        let router = Router::new()
            .fallback(backend_handler)
            .with_state(Arc::clone(&state));
        let base_url = serve(router).await;
        Self { base_url, state }
    }

    pub(crate) fn accept(&self, token: &str) {
        self.state.accepted.lock().unwrap().insert(token.to_string());
    }

    pub(crate) fn revoke_all(&self) {
        self.state.accepted.lock().unwrap().clear();
    }

    pub(crate) fn script(&self, statuses: &[u16]) {
        self.state.scripted.lock().unwrap().extend(statuses);
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub(crate) fn hits(&self) -> usize {
        self.state.requests.lock().unwrap().len()
    }

    /// Bearer tokens seen, in arrival order.
    pub(crate) fn seen_tokens(&self) -> Vec<Option<String>> {
        self.requests()
            .into_iter()
            .map(|r| {
                r.authorization
                    .and_then(|a| a.strip_prefix("Bearer ").map(str::to_string))
            })
            .collect()
    }
}

async fn backend_handler(
    State(state): State<Arc<BackendState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, Json<Value>) {
    let authorization = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().unwrap().push(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        authorization: authorization.clone(),
        headers: headers
            .iter()
            .filter_map(|(n, v)| Some((n.to_string(), v.to_str().ok()?.to_string())))
            .collect(),
    });

    if let Some(status) = state.scripted.lock().unwrap().pop_front() {
        let status = StatusCode::from_u16(status).unwrap();
        return (status, Json(json!({ "error": "scripted" })));
    }

    let token = authorization.as_deref().and_then(|a| a.strip_prefix("Bearer "));
    let accepted = token.is_some_and(|t| state.accepted.lock().unwrap().contains(t));
    if !accepted {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" })));
    }

    let body: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    (
        StatusCode::OK,
        Json(json!({
            "method": method.to_string(),
            "path": uri.path(),
            "body": body,
        })),
    )
}

struct IdentityServiceState {
    users: Mutex<HashMap<String, (String, String)>>,
    valid_refresh_tokens: Mutex<HashMap<String, String>>,
    next_token: AtomicUsize,
    refresh_calls: AtomicUsize,
    rate_limited: AtomicBool,
    idp_access_token: Mutex<Option<String>>,
}

/// Identity Toolkit stand-in covering `signInWithPassword`, `signUp`,
/// `signInWithIdp` and the refresh-token grant. ID tokens are `id-1`,
/// `id-2`, ...
pub(crate) struct MockIdentityService {
    pub base_url: String,
    state: Arc<IdentityServiceState>,
}

impl MockIdentityService {
    pub(crate) const API_KEY: &'static str = "test-api-key";
    pub(crate) const GOOD_IDP_TOKEN: &'static str = "good-idp-token";

    pub(crate) async fn start() -> Self {
        let state = Arc::new(IdentityServiceState {
            users: Mutex::new(HashMap::new()),
            valid_refresh_tokens: Mutex::new(HashMap::new()),
            next_token: AtomicUsize::new(1),
            refresh_calls: AtomicUsize::new(0),
            rate_limited: AtomicBool::new(false),
            idp_access_token: Mutex::new(None),
        });
        let router = Router::new()
            .fallback(identity_handler)
            .with_state(Arc::clone(&state));
        let base_url = serve(router).await;
        Self { base_url, state }
    }

    pub(crate) fn add_user(&self, email: &str, password: &str, local_id: &str) {
        self.state
            .users
            .lock()
            .unwrap()
            .insert(email.to_string(), (password.to_string(), local_id.to_string()));
    }

    pub(crate) fn set_rate_limited(&self, limited: bool) {
        self.state.rate_limited.store(limited, Ordering::SeqCst);
    }

    pub(crate) fn revoke_refresh_tokens(&self) {
        self.state.valid_refresh_tokens.lock().unwrap().clear();
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.state.refresh_calls.load(Ordering::SeqCst)
    }

    /// Decoded `access_token` from the last `signInWithIdp` post body.
    pub(crate) fn idp_access_token(&self) -> Option<String> {
        self.state.idp_access_token.lock().unwrap().clone()
    }
}

fn identity_error(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": { "code": 400, "message": message } })),
    )
}

fn issue_account(
    state: &IdentityServiceState,
    local_id: &str,
    email: &str,
    display_name: Option<&str>,
) -> (StatusCode, Json<Value>) {
    let n = state.next_token.fetch_add(1, Ordering::SeqCst);
    let refresh_token = format!("refresh-{}", n);
    state
        .valid_refresh_tokens
        .lock()
        .unwrap()
        .insert(refresh_token.clone(), local_id.to_string());
    (
        StatusCode::OK,
        Json(json!({
            "localId": local_id,
            "email": email,
            "displayName": display_name.unwrap_or(""),
            "idToken": format!("id-{}", n),
            "refreshToken": refresh_token,
            "expiresIn": "3600",
        })),
    )
}

async fn identity_handler(
    State(state): State<Arc<IdentityServiceState>>,
    uri: Uri,
    body: String,
) -> (StatusCode, Json<Value>) {
    let key_ok = uri
        .query()
        .is_some_and(|q| q.split('&').any(|p| p == format!("key={}", MockIdentityService::API_KEY)));
    if !key_ok {
        return identity_error("API_KEY_INVALID");
    }

    let path = uri.path();
    if path.ends_with("/token") {
        state.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let refresh_token = body
            .split('&')
            .find_map(|p| p.strip_prefix("refresh_token="))
            .unwrap_or_default()
            .to_string();
        let Some(local_id) = state
            .valid_refresh_tokens
            .lock()
            .unwrap()
            .get(&refresh_token)
            .cloned()
        else {
            return identity_error("INVALID_REFRESH_TOKEN");
        };
        let n = state.next_token.fetch_add(1, Ordering::SeqCst);
        return (
            StatusCode::OK,
            Json(json!({
                "id_token": format!("id-{}", n),
                "refresh_token": refresh_token,
                "expires_in": "3600",
                "user_id": local_id,
            })),
        );
    }

    let request: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
    let email = request["email"].as_str().unwrap_or_default().to_string();
    let password = request["password"].as_str().unwrap_or_default().to_string();

    if path.ends_with("accounts:signInWithPassword") {
        if state.rate_limited.load(Ordering::SeqCst) {
            return identity_error("TOO_MANY_ATTEMPTS_TRY_LATER : Try again later");
        }
        let user = state.users.lock().unwrap().get(&email).cloned();
        return match user {
            None => identity_error("EMAIL_NOT_FOUND"),
            Some((expected, _)) if expected != password => identity_error("INVALID_LOGIN_CREDENTIALS"),
            Some((_, local_id)) => issue_account(&state, &local_id, &email, None),
        };
    }

    if path.ends_with("accounts:signUp") {
        if !email.contains('@') {
            return identity_error("INVALID_EMAIL");
        }
        if state.users.lock().unwrap().contains_key(&email) {
            return identity_error("EMAIL_EXISTS");
        }
        if password.len() < 6 {
            return identity_error("WEAK_PASSWORD : Password should be at least 6 characters");
        }
        let local_id = format!("new-{}", email.len());
        state
            .users
            .lock()
            .unwrap()
            .insert(email.clone(), (password, local_id.clone()));
        return issue_account(&state, &local_id, &email, None);
    }

    if path.ends_with("accounts:signInWithIdp") {
        let post_body = request["postBody"].as_str().unwrap_or_default();
        let fields: HashMap<String, String> = url::form_urlencoded::parse(post_body.as_bytes())
            .into_owned()
            .collect();
        *state.idp_access_token.lock().unwrap() = fields.get("access_token").cloned();
        if fields.get("id_token").map(String::as_str) != Some(MockIdentityService::GOOD_IDP_TOKEN) {
            return identity_error("INVALID_IDP_RESPONSE");
        }
        return issue_account(&state, "idp-user", "native@b.com", Some("Native User"));
    }

    (StatusCode::NOT_FOUND, Json(json!({ "error": { "message": "NOT_FOUND" } })))
}
