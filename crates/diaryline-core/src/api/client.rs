//! API client for the diary backend.
//!
//! Knows the endpoint layout and the shapes of the auth responses. Token
//! handling lives in `AuthSession`; this type only builds requests and
//! decodes responses.

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;
use tracing::debug;

use crate::auth::LoginPayload;
use crate::models::User;

use super::transport::{ApiRequest, ApiResponse, HttpTransport, ReqwestTransport, TransportError};
use super::AuthError;

// ============================================================================
// Constants
// ============================================================================

const LOGIN_PATH: &str = "/api/public/login";
const REFRESH_PATH: &str = "/refresh";
const PROFILE_PATH: &str = "/api/users/me";

/// Provider sent with token refresh requests
pub const DEFAULT_REFRESH_PROVIDER: &str = "server";

/// `status` value of a successful login envelope
const LOGIN_SUCCESS: &str = "success";

#[derive(Debug, Deserialize)]
struct LoginEnvelope {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<LoginData>,
}

#[derive(Debug, Deserialize)]
struct LoginData {
    access_token: String,
    user: User,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RefreshGrant {
    pub(crate) access_token: String,
}

/// Profile responses come as `{data: {user}}`; older servers send `{user}`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProfileEnvelope {
    Wrapped { data: ProfileData },
    Bare { user: User },
}

#[derive(Debug, Deserialize)]
struct ProfileData {
    user: User,
}

/// Token and profile returned by a successful login.
#[derive(Debug, Clone)]
pub struct LoginGrant {
    pub access_token: String,
    pub user: User,
}

/// API client for the diary backend.
/// Clone is cheap - the transport is shared.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    refresh_provider: String,
}

impl ApiClient {
    /// Create a client talking to `base_url` over reqwest
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self::with_transport(base_url, Arc::new(ReqwestTransport::new()?)))
    }

    pub fn with_transport(base_url: &str, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            refresh_provider: DEFAULT_REFRESH_PROVIDER.to_string(),
        }
    }

    pub fn with_refresh_provider(mut self, provider: impl Into<String>) -> Self {
        self.refresh_provider = provider.into();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for `path`. Absolute URLs pass through unchanged.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn analysis_url(&self, job_id: &str) -> String {
        self.url(&format!("/api/diaries/{}/analysis", job_id))
    }

    pub fn profile_request(&self) -> ApiRequest {
        ApiRequest::get(self.url(PROFILE_PATH))
    }

    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        self.transport.execute(request).await
    }

    /// Exchange credentials for an access token and profile.
    pub async fn login(&self, payload: &LoginPayload) -> Result<LoginGrant, AuthError> {
        let body = serde_json::to_value(payload)
            .map_err(|e| AuthError::InvalidInput(format!("Unencodable login payload: {}", e)))?;
        let response = self
            .execute(ApiRequest::post(self.url(LOGIN_PATH), body))
            .await?;

        if !response.is_success() {
            return Err(AuthError::from_status(response.status, &response.text()));
        }

        Self::parse_login(&response)
    }

    fn parse_login(response: &ApiResponse) -> Result<LoginGrant, AuthError> {
        let envelope: LoginEnvelope = response
            .json()
            .map_err(|e| AuthError::MalformedResponse(format!("login response: {}", e)))?;

        let message = envelope.message.unwrap_or_default();
        if envelope.status.as_deref() != Some(LOGIN_SUCCESS) {
            debug!(status = ?envelope.status, "Login rejected by server");
            return Err(AuthError::InvalidCredentials(message));
        }

        let data = envelope.data.ok_or_else(|| {
            AuthError::MalformedResponse("login response has no data".to_string())
        })?;
        if data.access_token.trim().is_empty() {
            return Err(AuthError::MalformedResponse(
                "login response has an empty access token".to_string(),
            ));
        }

        Ok(LoginGrant {
            access_token: data.access_token,
            user: data.user,
        })
    }

    /// Ask the server for a new token in exchange for an expired one.
    /// The raw response is returned so a failed refresh can be handed back
    /// to the caller that triggered it.
    pub async fn refresh(&self, expired_token: &str) -> Result<ApiResponse, TransportError> {
        let body = serde_json::json!({
            "expiredToken": expired_token,
            "provider": self.refresh_provider,
        });
        self.execute(ApiRequest::post(self.url(REFRESH_PATH), body))
            .await
    }

    pub(crate) fn parse_refresh(response: &ApiResponse) -> Result<String, AuthError> {
        let grant: RefreshGrant = response
            .json()
            .map_err(|e| AuthError::MalformedResponse(format!("refresh response: {}", e)))?;
        if grant.access_token.trim().is_empty() {
            return Err(AuthError::MalformedResponse(
                "refresh response has an empty access token".to_string(),
            ));
        }
        Ok(grant.access_token)
    }

    pub fn parse_profile(response: &ApiResponse) -> Result<User, AuthError> {
        let envelope: ProfileEnvelope = response
            .json()
            .map_err(|e| AuthError::MalformedResponse(format!("profile response: {}", e)))?;
        Ok(match envelope {
            ProfileEnvelope::Wrapped { data } => data.user,
            ProfileEnvelope::Bare { user } => user,
        })
    }
}
