//! Authenticated access to the ReplyHub backend.
//!
//! Every request carries the session's bearer token. A 401 triggers exactly
//! one forced token refresh and one retry; a second rejection expires the
//! session.

pub mod client;
pub mod error;

pub use client::{AuthenticatedClient, ClientSettings, RequestOptions, VERIFY_ENDPOINT};
pub use error::ApiError;
