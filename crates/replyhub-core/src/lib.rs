//! ReplyHub core - session state and authenticated access to the backend.
//!
//! The pieces, bottom up:
//! - [`storage`] persists small blobs (session hint, sign-in marker)
//! - [`auth::SessionStore`] holds the one session snapshot and notifies observers
//! - [`auth::CredentialProvider`] signs users in and out through an
//!   [`identity::IdentityProvider`]
//! - [`auth::TokenRefresher`] keeps the bearer token fresh, one refresh at a time
//! - [`api::AuthenticatedClient`] sends backend requests with that token
//! - [`context::AuthContext`] wires them together and runs startup

pub mod api;
pub mod auth;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod storage;
pub mod subscription;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiError, AuthenticatedClient, ClientSettings, RequestOptions};
pub use auth::{
    BearerToken, Credential, CredentialProvider, Identity, InteractiveOutcome, Session,
    SessionStatus, SessionStore, SignOutOutcome, TokenRefresher,
};
pub use config::Config;
pub use context::{AuthContext, ContextOptions};
pub use error::{AuthError, Capability};
pub use subscription::Subscription;
