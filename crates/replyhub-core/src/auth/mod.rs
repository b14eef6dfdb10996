//! Session state and everything that mutates it.
//!
//! - `session` - identity, bearer token and session snapshot types
//! - `store` - the serialized state machine and its observers
//! - `credentials` - password, interactive and native sign-in, sign-out
//! - `refresher` - single-flight bearer token refresh
//! - `observer` - applies provider-pushed identity changes
//! - `pending` - redirect sign-in resume marker

pub mod credentials;
pub mod observer;
pub mod pending;
pub mod refresher;
pub mod session;
pub mod store;

pub use credentials::{CredentialProvider, InteractiveOutcome, InteractiveSettings, SignOutOutcome};
pub use observer::AuthStateObserver;
pub use pending::PendingSignIn;
pub use refresher::TokenRefresher;
pub use session::{BearerToken, Credential, Identity, PersistedSession, Session, SessionStatus};
pub use store::{SessionObserver, SessionStore, SessionUpdates};
