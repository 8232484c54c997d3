//! Authentication module for managing the user session and stored credentials.
//!
//! This module provides:
//! - `AuthSession`: sign-in/sign-out, bootstrap, and authenticated requests with
//!   one-shot token refresh
//! - `CredentialStore`: secure storage of the access token (OS keychain via keyring)
//! - `LoginPayload`: validated sign-in input

pub mod credentials;
pub mod session;
pub mod validation;

pub use credentials::{
    Credential, CredentialStore, KeyringCredentialStore, MemoryCredentialStore,
    DEFAULT_SERVICE_NAME,
};
pub use session::{AuthSession, SessionPhase, SessionState};
pub use validation::LoginPayload;
