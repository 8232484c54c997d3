//! REST API client module for the diary backend.
//!
//! This module provides the `ApiClient` for building and decoding requests
//! against the backend, and the `HttpTransport` seam that executes them.
//!
//! The API uses bearer token authentication; tokens are obtained from the
//! public login endpoint and renewed through `/refresh`.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiClient, LoginGrant, DEFAULT_REFRESH_PROVIDER};
pub use error::AuthError;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport, TransportError};
