//! diaryline core - authenticated session and analysis status polling for
//! the diary backend.
//!
//! - `auth`: `AuthSession` (sign-in, bootstrap, authenticated fetch with
//!   one-shot token refresh) and credential storage
//! - `api`: endpoint client, HTTP transport, error taxonomy
//! - `poller`: `StatusPoller` for a diary's AI analysis job
//! - `models`: user and analysis payloads
//! - `config`: persisted client configuration

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod poller;

pub use api::{ApiClient, ApiRequest, ApiResponse, AuthError, HttpTransport, TransportError};
pub use auth::{AuthSession, CredentialStore, SessionPhase, SessionState};
pub use config::Config;
pub use poller::{PollEvent, PollEventKind, PollHandle, StatusPoller};
