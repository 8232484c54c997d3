//! The authenticated session.
//!
//! `AuthSession` owns the access token and user profile, persists the token
//! through a `CredentialStore`, and wraps requests so an expired token is
//! refreshed once and the request retried once. Observers follow state
//! changes through `subscribe()`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiRequest, ApiResponse, AuthError};
use crate::models::User;

use super::credentials::{Credential, CredentialStore};
use super::validation::LoginPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Restoring a previous session has not finished yet
    Bootstrapping,
    SignedOut,
    SignedIn,
}

/// Snapshot of the session published to observers.
#[derive(Clone, Default, PartialEq)]
pub struct SessionState {
    pub token: Option<String>,
    pub user: Option<User>,
    pub bootstrapping: bool,
    pub auth_loading: bool,
    pub signed_in_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn is_signed_in(&self) -> bool {
        self.token.is_some() && self.user.is_some()
    }

    pub fn phase(&self) -> SessionPhase {
        if self.bootstrapping {
            SessionPhase::Bootstrapping
        } else if self.is_signed_in() {
            SessionPhase::SignedIn
        } else {
            SessionPhase::SignedOut
        }
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("user", &self.user)
            .field("bootstrapping", &self.bootstrapping)
            .field("auth_loading", &self.auth_loading)
            .field("signed_in_at", &self.signed_in_at)
            .finish()
    }
}

/// Result of one call to the refresh endpoint.
#[derive(Debug, Clone)]
enum RefreshOutcome {
    Renewed(String),
    /// The endpoint refused; its response goes back to the caller.
    Rejected(ApiResponse),
    /// The endpoint answered 2xx without a usable token.
    Invalid(String),
    /// The session was signed out or replaced after the request went out.
    /// The request's own 401 stands and nothing is retried.
    Stale,
}

/// Last refresh performed, keyed by the token it replaced and the session
/// generation it ran in. Callers that queued behind an in-flight refresh for
/// the same token reuse its outcome.
struct RefreshRecord {
    expired: String,
    generation: u64,
    outcome: RefreshOutcome,
}

struct Inner {
    api: ApiClient,
    store: Arc<dyn CredentialStore>,
    state: watch::Sender<SessionState>,
    refresh: Mutex<Option<RefreshRecord>>,
    /// Bumped on every sign-in and sign-out. A token refresh does not bump it.
    generation: AtomicU64,
}

/// Shared handle to the session. Clone is cheap; all clones see the same state.
#[derive(Clone)]
pub struct AuthSession {
    inner: Arc<Inner>,
}

/// Holds `auth_loading` up for the lifetime of a sign-in or sign-out.
struct LoadingGuard<'a> {
    state: &'a watch::Sender<SessionState>,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|s| s.auth_loading = false);
    }
}

impl AuthSession {
    /// New session in the `Bootstrapping` phase. Call `bootstrap()` once at startup.
    pub fn new(api: ApiClient, store: Arc<dyn CredentialStore>) -> Self {
        let (state, _) = watch::channel(SessionState {
            bootstrapping: true,
            ..SessionState::default()
        });
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                state,
                refresh: Mutex::new(None),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.state.borrow().phase()
    }

    pub fn token(&self) -> Option<String> {
        self.inner.state.borrow().token.clone()
    }

    pub fn user(&self) -> Option<User> {
        self.inner.state.borrow().user.clone()
    }

    // =========================================================================
    // Sign in / sign out
    // =========================================================================

    /// Sign in with an email or login id.
    ///
    /// Input is validated before anything goes over the network. On failure
    /// the session is left untouched.
    pub async fn sign_in(&self, identifier: &str, password: &str) -> Result<User, AuthError> {
        let payload = LoginPayload::new(identifier, password)?;
        let _loading = self.begin_loading();

        info!(field = payload.field_name(), "Signing in");
        let grant = match self.inner.api.login(&payload).await {
            Ok(grant) => grant,
            Err(e) => {
                warn!(error = %e, "Sign-in failed");
                return Err(e);
            }
        };

        self.persist(&grant.access_token);
        self.adopt(grant.access_token, grant.user.clone());
        info!(user = grant.user.display_name(), "Sign-in successful");
        Ok(grant.user)
    }

    /// Forget the session. Always completes; a keychain failure is logged and
    /// the in-memory session is cleared regardless.
    pub fn sign_out(&self) {
        let _loading = self.begin_loading();
        self.end_session();
        info!("Signed out");
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Restore the session saved by a previous run.
    ///
    /// Any failure leaves the session signed out with the store cleared.
    /// `bootstrapping` is cleared before this returns, whatever happened.
    pub async fn bootstrap(&self) -> SessionPhase {
        match self.inner.store.get() {
            Ok(Some(credential)) => match self.restore(credential).await {
                Ok(user) => info!(user = user.display_name(), "Session restored"),
                Err(e) => {
                    warn!(error = %e, "Could not restore session");
                    self.end_session();
                }
            },
            Ok(None) => debug!("No stored credential"),
            Err(e) => {
                warn!(error = %e, "Failed to read stored credential");
                self.end_session();
            }
        }

        self.inner.state.send_modify(|s| s.bootstrapping = false);
        self.phase()
    }

    async fn restore(&self, credential: Credential) -> Result<User, AuthError> {
        let stored = credential.access_token;
        let (response, token) = self
            .fetch_with_refresh(&self.inner.api.profile_request(), stored.clone())
            .await?;

        if !response.is_success() {
            return Err(AuthError::from_status(response.status, &response.text()));
        }
        let user = ApiClient::parse_profile(&response)?;

        if token != stored {
            self.persist(&token);
        }
        self.adopt(token, user.clone());
        Ok(user)
    }

    /// Re-fetch the profile of the signed-in user. Returns `None` when signed out.
    pub async fn refresh_user(&self) -> Result<Option<User>, AuthError> {
        if self.token().is_none() {
            return Ok(None);
        }

        let response = self
            .authenticated_fetch(self.inner.api.profile_request())
            .await?;
        if !response.is_success() {
            if self.token().is_none() {
                // The refresh endpoint refused and the session was ended
                return Err(AuthError::RefreshFailed(format!(
                    "refresh refused with status {}",
                    response.status.as_u16()
                )));
            }
            return Err(AuthError::from_status(response.status, &response.text()));
        }
        let user = ApiClient::parse_profile(&response)?;

        let updated = self.inner.state.send_if_modified(|s| {
            if s.token.is_some() {
                s.user = Some(user.clone());
                true
            } else {
                false
            }
        });
        Ok(updated.then_some(user))
    }

    // =========================================================================
    // Authenticated requests
    // =========================================================================

    /// Send `request` with the session's bearer token.
    ///
    /// A 401 triggers exactly one token refresh followed by exactly one
    /// retry, whose response is returned whatever its status. If the refresh
    /// is refused the session is signed out and the refresh endpoint's
    /// response is returned instead.
    pub async fn authenticated_fetch(&self, request: ApiRequest) -> Result<ApiResponse, AuthError> {
        let token = self.token().ok_or(AuthError::NoToken)?;
        let (response, _) = self.fetch_with_refresh(&request, token).await?;
        Ok(response)
    }

    /// Returns the response and the token it was finally sent with.
    async fn fetch_with_refresh(
        &self,
        request: &ApiRequest,
        token: String,
    ) -> Result<(ApiResponse, String), AuthError> {
        let generation = self.generation();
        let response = self.send_with_token(request, &token).await?;
        if !response.is_unauthorized() {
            return Ok((response, token));
        }

        debug!(url = %request.url, "Access token rejected, refreshing");
        match self.refresh_token(&token, generation).await? {
            RefreshOutcome::Renewed(fresh) => {
                let response = self.send_with_token(request, &fresh).await?;
                Ok((response, fresh))
            }
            RefreshOutcome::Rejected(refused) => Ok((refused, token)),
            RefreshOutcome::Invalid(reason) => Err(AuthError::RefreshFailed(reason)),
            RefreshOutcome::Stale => Ok((response, token)),
        }
    }

    async fn send_with_token(
        &self,
        request: &ApiRequest,
        token: &str,
    ) -> Result<ApiResponse, AuthError> {
        let request = request.with_bearer(token).map_err(|_| {
            AuthError::MalformedResponse("access token is not a valid header value".to_string())
        })?;
        Ok(self.inner.api.execute(request).await?)
    }

    /// Single-flight token refresh.
    ///
    /// Only one refresh runs at a time. A caller that waited on the lock
    /// while another refreshed the same expired token gets that outcome
    /// instead of refreshing again. Network failures are not recorded so the
    /// next caller tries again.
    ///
    /// `generation` is the session generation the failed request was sent
    /// in. Once the session has been signed out or replaced, no token from
    /// that older session is retried or adopted.
    async fn refresh_token(
        &self,
        expired: &str,
        generation: u64,
    ) -> Result<RefreshOutcome, AuthError> {
        let mut last = self.inner.refresh.lock().await;
        if let Some(record) = last
            .as_ref()
            .filter(|r| r.expired == expired && r.generation == generation)
        {
            let renewed = matches!(record.outcome, RefreshOutcome::Renewed(_));
            if !renewed || self.generation() == generation {
                debug!("Reusing concurrent token refresh result");
                return Ok(record.outcome.clone());
            }
        }
        if self.generation() != generation {
            debug!("Session changed while the request was out, not refreshing");
            return Ok(RefreshOutcome::Stale);
        }

        let response = match self.inner.api.refresh(expired).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Token refresh request failed");
                return Err(e.into());
            }
        };

        let outcome = if response.is_success() {
            match ApiClient::parse_refresh(&response) {
                Ok(fresh) => RefreshOutcome::Renewed(fresh),
                Err(e) => RefreshOutcome::Invalid(e.to_string()),
            }
        } else {
            RefreshOutcome::Rejected(response)
        };

        match outcome {
            RefreshOutcome::Renewed(ref fresh) => {
                // Only replace the token this refresh was for; a sign-out or
                // new sign-in in the meantime wins.
                let adopted = self.inner.state.send_if_modified(|s| {
                    if s.token.as_deref() == Some(expired) {
                        s.token = Some(fresh.clone());
                        true
                    } else {
                        false
                    }
                });
                if adopted {
                    self.persist(fresh);
                }
                info!(adopted, "Access token refreshed");
            }
            // A sign-in that landed during the refresh is not ended by it
            RefreshOutcome::Rejected(ref response) => {
                warn!(status = response.status.as_u16(), "Token refresh refused, signing out");
                if self.generation() == generation {
                    self.end_session();
                }
            }
            RefreshOutcome::Invalid(ref reason) => {
                warn!(reason = %reason, "Token refresh returned no token, signing out");
                if self.generation() == generation {
                    self.end_session();
                }
            }
            RefreshOutcome::Stale => {}
        }

        if self.generation() != generation && matches!(outcome, RefreshOutcome::Renewed(_)) {
            debug!("Session changed during token refresh, discarding renewed token");
            return Ok(RefreshOutcome::Stale);
        }

        *last = Some(RefreshRecord {
            expired: expired.to_string(),
            generation,
            outcome: outcome.clone(),
        });
        Ok(outcome)
    }

    // =========================================================================
    // State helpers
    // =========================================================================

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn begin_loading(&self) -> LoadingGuard<'_> {
        self.inner.state.send_modify(|s| s.auth_loading = true);
        LoadingGuard {
            state: &self.inner.state,
        }
    }

    /// Token and user always change together.
    fn adopt(&self, token: String, user: User) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.state.send_modify(|s| {
            s.token = Some(token);
            s.user = Some(user);
            s.signed_in_at = Some(Utc::now());
        });
    }

    fn end_session(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.inner.store.clear() {
            warn!(error = %e, "Failed to clear stored credential");
        }
        self.inner.state.send_modify(|s| {
            s.token = None;
            s.user = None;
            s.signed_in_at = None;
        });
    }

    fn persist(&self, token: &str) {
        if let Err(e) = self.inner.store.set(&Credential::new(token)) {
            warn!(error = %e, "Failed to store credential");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use reqwest::StatusCode;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::api::transport::testing::{empty, json as respond, ScriptedTransport, Step};
    use crate::auth::MemoryCredentialStore;

    const BASE: &str = "http://api.test";

    fn login_ok(token: &str) -> Step {
        respond(
            200,
            json!({"status": "success", "message": "ok",
                   "data": {"access_token": token, "user": {"email": "test@example.com"}}}),
        )
    }

    fn session_with(
        transport: &Arc<ScriptedTransport>,
        store: &Arc<MemoryCredentialStore>,
    ) -> AuthSession {
        let api = ApiClient::with_transport(BASE, transport.clone());
        AuthSession::new(api, store.clone())
    }

    async fn signed_in(
        transport: &Arc<ScriptedTransport>,
        store: &Arc<MemoryCredentialStore>,
        token: &str,
    ) -> AuthSession {
        transport.on("/api/public/login", login_ok(token));
        let session = session_with(transport, store);
        session
            .sign_in("test@example.com", "Passw0rd!")
            .await
            .expect("sign-in succeeds");
        session
    }

    /// Store whose writes always fail.
    struct BrokenStore {
        cleared: AtomicBool,
    }

    impl CredentialStore for BrokenStore {
        fn get(&self) -> anyhow::Result<Option<Credential>> {
            anyhow::bail!("keychain locked")
        }
        fn set(&self, _: &Credential) -> anyhow::Result<()> {
            anyhow::bail!("keychain locked")
        }
        fn clear(&self) -> anyhow::Result<()> {
            self.cleared.store(true, Ordering::SeqCst);
            anyhow::bail!("keychain locked")
        }
    }

    #[tokio::test]
    async fn test_sign_in_adopts_token_and_user() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "tok123").await;

        assert_eq!(session.token().as_deref(), Some("tok123"));
        assert_eq!(
            session.user().and_then(|u| u.email).as_deref(),
            Some("test@example.com")
        );
        assert_eq!(store.token().as_deref(), Some("tok123"));
        assert!(!session.state().auth_loading);

        let sent = transport.requests_to("/api/public/login");
        assert_eq!(sent.len(), 1);
        assert_eq!(
            sent[0].body,
            Some(json!({"email": "test@example.com", "password": "Passw0rd!"}))
        );
    }

    #[tokio::test]
    async fn test_sign_in_with_login_id_payload() {
        let transport = ScriptedTransport::new();
        transport.on("/api/public/login", login_ok("tok"));
        let store = Arc::new(MemoryCredentialStore::new());
        let session = session_with(&transport, &store);

        session.sign_in("diarist", "Passw0rd!").await.expect("sign-in succeeds");
        let sent = transport.requests_to("/api/public/login");
        assert_eq!(sent[0].body, Some(json!({"loginId": "diarist", "password": "Passw0rd!"})));
    }

    #[tokio::test]
    async fn test_sign_in_rejects_placeholders_without_network() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = session_with(&transport, &store);

        for identifier in ["none_provided", "NULL", " undefined ", "None", "empty", "   "] {
            let err = session.sign_in(identifier, "Passw0rd!").await.unwrap_err();
            assert!(matches!(err, AuthError::InvalidInput(_)), "{identifier:?}");
        }
        assert!(transport.requests().is_empty());
        assert!(session.token().is_none());
    }

    #[tokio::test]
    async fn test_sign_in_failures_leave_state_unchanged() {
        let transport = ScriptedTransport::new();
        transport
            .on("/api/public/login", respond(401, json!({"message": "Bad credentials"})))
            .on("/api/public/login", empty(503))
            .on("/api/public/login", Step::Respond(ApiResponse::new(StatusCode::OK, "<html/>")))
            .on("/api/public/login", Step::Fail("connection refused".into()));
        let store = Arc::new(MemoryCredentialStore::new());
        let session = session_with(&transport, &store);

        let err = session.sign_in("diarist", "Passw0rd!").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredentials(_)));
        let err = session.sign_in("diarist", "Passw0rd!").await.unwrap_err();
        assert!(matches!(err, AuthError::ServerError(_)));
        let err = session.sign_in("diarist", "Passw0rd!").await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
        let err = session.sign_in("diarist", "Passw0rd!").await.unwrap_err();
        assert!(matches!(err, AuthError::NetworkError(_)));
        assert!(!err.user_message().is_empty());

        assert!(session.token().is_none());
        assert!(session.user().is_none());
        assert!(store.token().is_none());
        assert!(!session.state().auth_loading);
    }

    #[tokio::test]
    async fn test_auth_loading_while_sign_in_in_flight() {
        let transport = ScriptedTransport::new();
        let gate = Arc::new(Notify::new());
        transport.on(
            "/api/public/login",
            Step::Gated(
                gate.clone(),
                ApiResponse::new(
                    StatusCode::OK,
                    json!({"status": "success",
                           "data": {"access_token": "tok", "user": {"loginId": "diarist"}}})
                    .to_string(),
                ),
            ),
        );
        let store = Arc::new(MemoryCredentialStore::new());
        let session = session_with(&transport, &store);
        let mut observer = session.subscribe();
        assert!(!observer.borrow().auth_loading);

        let (result, ()) = futures::join!(session.sign_in("diarist", "Passw0rd!"), async {
            observer.changed().await.expect("sender alive");
            let state = observer.borrow_and_update().clone();
            assert!(state.auth_loading);
            assert!(state.token.is_none());
            gate.notify_one();
        });

        result.expect("sign-in succeeds");
        let state = session.state();
        assert!(!state.auth_loading);
        assert!(state.is_signed_in());
    }

    #[tokio::test]
    async fn test_sign_out_clears_everything() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "tok123").await;
        session.inner.state.send_modify(|s| s.bootstrapping = false);

        session.sign_out();
        assert_eq!(session.phase(), SessionPhase::SignedOut);
        assert!(store.token().is_none());

        // Idempotent
        session.sign_out();
        assert_eq!(session.phase(), SessionPhase::SignedOut);
    }

    #[tokio::test]
    async fn test_sign_out_survives_store_failure() {
        let transport = ScriptedTransport::new();
        transport.on("/api/public/login", login_ok("tok123"));
        let store = Arc::new(BrokenStore {
            cleared: AtomicBool::new(false),
        });
        let session = AuthSession::new(ApiClient::with_transport(BASE, transport.clone()), store.clone());

        // Persisting fails too, but the in-memory session still works
        session.sign_in("diarist", "Passw0rd!").await.expect("sign-in succeeds");
        assert_eq!(session.token().as_deref(), Some("tok123"));

        session.sign_out();
        assert!(store.cleared.load(Ordering::SeqCst));
        assert!(session.token().is_none());
        assert!(session.user().is_none());
    }

    #[tokio::test]
    async fn test_fetch_without_token_sends_nothing() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = session_with(&transport, &store);

        let err = session
            .authenticated_fetch(ApiRequest::get(format!("{BASE}/api/diaries")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NoToken));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_attaches_bearer_token() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "tok123").await;
        transport.on("/api/diaries", respond(200, json!([])));

        let response = session
            .authenticated_fetch(ApiRequest::get(format!("{BASE}/api/diaries")))
            .await
            .expect("fetch succeeds");
        assert!(response.is_success());
        assert_eq!(transport.requests_to("/api/diaries")[0].bearer_token(), Some("tok123"));
        assert!(transport.requests_to("/refresh").is_empty());
    }

    #[tokio::test]
    async fn test_fetch_refreshes_once_and_retries() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "old").await;
        transport
            .on("/api/diaries", empty(401))
            .on("/api/diaries", respond(200, json!([{"id": 1}])))
            .on("/refresh", respond(200, json!({"access_token": "new"})));

        let response = session
            .authenticated_fetch(ApiRequest::get(format!("{BASE}/api/diaries")))
            .await
            .expect("fetch succeeds");

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(session.token().as_deref(), Some("new"));
        assert_eq!(store.token().as_deref(), Some("new"));
        assert!(session.user().is_some());

        let sent = transport.requests_to("/api/diaries");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].bearer_token(), Some("old"));
        assert_eq!(sent[1].bearer_token(), Some("new"));
        assert_eq!(
            transport.requests_to("/refresh")[0].body,
            Some(json!({"expiredToken": "old", "provider": "server"}))
        );
    }

    #[tokio::test]
    async fn test_second_401_after_refresh_is_returned() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "old").await;
        transport
            .on("/api/diaries", empty(401))
            .on("/api/diaries", empty(401))
            .on("/refresh", respond(200, json!({"access_token": "new"})));

        let response = session
            .authenticated_fetch(ApiRequest::get(format!("{BASE}/api/diaries")))
            .await
            .expect("fetch returns a response");

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(transport.requests_to("/api/diaries").len(), 2);
        assert_eq!(transport.requests_to("/refresh").len(), 1);
        assert_eq!(session.token().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_failed_refresh_signs_out_and_returns_refresh_response() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "old").await;
        let mut observer = session.subscribe();
        observer.mark_unchanged();

        transport
            .on("/api/diaries", empty(401))
            .on("/refresh", respond(403, json!({"error": "refresh token expired"})));

        let response = session
            .authenticated_fetch(ApiRequest::get(format!("{BASE}/api/diaries")))
            .await
            .expect("fetch returns a response");

        assert_eq!(response.status, StatusCode::FORBIDDEN);
        assert!(response.text().contains("refresh token expired"));
        assert!(session.token().is_none());
        assert!(session.user().is_none());
        assert!(store.token().is_none());
        assert!(observer.has_changed().expect("sender alive"));
        // No retry of the original request
        assert_eq!(transport.requests_to("/api/diaries").len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_without_token_is_refresh_failed() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "old").await;
        transport
            .on("/api/diaries", empty(401))
            .on("/refresh", respond(200, json!({"token": "wrong-field"})));

        let err = session
            .authenticated_fetch(ApiRequest::get(format!("{BASE}/api/diaries")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert!(err.is_session_fatal());
        assert!(session.token().is_none());
    }

    #[tokio::test]
    async fn test_refresh_network_error_keeps_session() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "old").await;
        transport
            .on("/api/diaries", empty(401))
            .on("/refresh", Step::Fail("connection reset".into()));

        let err = session
            .authenticated_fetch(ApiRequest::get(format!("{BASE}/api/diaries")))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::NetworkError(_)));
        assert_eq!(session.token().as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn test_concurrent_401s_share_one_refresh() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "old").await;

        let gate = Arc::new(Notify::new());
        transport
            .on("/api/diaries", empty(401))
            .on("/api/diaries", empty(401))
            .on("/api/diaries", respond(200, json!([])))
            .on("/api/diaries", respond(200, json!([])))
            .on(
                "/refresh",
                Step::Gated(
                    gate.clone(),
                    ApiResponse::new(StatusCode::OK, json!({"access_token": "new"}).to_string()),
                ),
            );

        let request = ApiRequest::get(format!("{BASE}/api/diaries"));
        let (a, b, ()) = futures::join!(
            session.authenticated_fetch(request.clone()),
            session.authenticated_fetch(request.clone()),
            async {
                tokio::task::yield_now().await;
                gate.notify_one();
            }
        );

        assert!(a.expect("first fetch").is_success());
        assert!(b.expect("second fetch").is_success());
        assert_eq!(transport.requests_to("/refresh").len(), 1);
        assert_eq!(session.token().as_deref(), Some("new"));

        let retried: Vec<_> = transport.requests_to("/api/diaries")[2..]
            .iter()
            .map(|r| r.bearer_token().map(str::to_string))
            .collect();
        assert_eq!(retried, vec![Some("new".to_string()), Some("new".to_string())]);
    }

    #[tokio::test]
    async fn test_renewed_token_not_reused_after_new_sign_in() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "first").await;

        let gate = Arc::new(Notify::new());
        transport
            .on("/api/diaries", empty(401))
            .on("/api/diaries", respond(200, json!([])))
            .on(
                "/api/diaries",
                Step::Gated(gate.clone(), ApiResponse::new(StatusCode::UNAUTHORIZED, "")),
            )
            .on("/refresh", respond(200, json!({"access_token": "renewed"})));

        // Refresh "first" into "renewed"
        let request = ApiRequest::get(format!("{BASE}/api/diaries"));
        session
            .authenticated_fetch(request.clone())
            .await
            .expect("fetch succeeds");
        assert_eq!(session.token().as_deref(), Some("renewed"));

        // A request still holding "first" gets its 401 only after the user
        // signed out and back in
        let (late, ()) = futures::join!(
            session.fetch_with_refresh(&request, "first".to_string()),
            async {
                tokio::task::yield_now().await;
                session.sign_out();
                transport.on("/api/public/login", login_ok("second"));
                session
                    .sign_in("test@example.com", "Passw0rd!")
                    .await
                    .expect("sign-in succeeds");
                gate.notify_one();
            }
        );

        let (response, token) = late.expect("fetch returns a response");
        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        assert_eq!(token, "first");
        assert_eq!(transport.requests_to("/api/diaries").len(), 3);
        assert_eq!(transport.requests_to("/refresh").len(), 1);
        assert_eq!(session.token().as_deref(), Some("second"));
        assert_eq!(store.token().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_refresh_user_after_refused_refresh_is_refresh_failed() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "old").await;
        transport
            .on("/api/users/me", empty(401))
            .on("/refresh", respond(401, json!({"error": "expired"})));

        let err = session.refresh_user().await.unwrap_err();
        assert!(matches!(err, AuthError::RefreshFailed(_)));
        assert_eq!(err.user_message(), "Your session has expired. Please sign in again.");
        assert!(session.token().is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_restores_session() {
        let transport = ScriptedTransport::new();
        transport.on(
            "/api/users/me",
            respond(200, json!({"data": {"user": {"loginId": "diarist"}}})),
        );
        let store = Arc::new(MemoryCredentialStore::with_credential(Credential::new("saved")));
        let session = session_with(&transport, &store);
        assert_eq!(session.phase(), SessionPhase::Bootstrapping);

        assert_eq!(session.bootstrap().await, SessionPhase::SignedIn);
        assert_eq!(session.token().as_deref(), Some("saved"));
        assert_eq!(session.user().and_then(|u| u.login_id).as_deref(), Some("diarist"));
        assert_eq!(transport.requests_to("/api/users/me")[0].bearer_token(), Some("saved"));
    }

    #[tokio::test]
    async fn test_bootstrap_refreshes_expired_token() {
        let transport = ScriptedTransport::new();
        transport
            .on("/api/users/me", empty(401))
            .on("/api/users/me", respond(200, json!({"user": {"nickname": "Mina"}})))
            .on("/refresh", respond(200, json!({"access_token": "renewed"})));
        let store = Arc::new(MemoryCredentialStore::with_credential(Credential::new("stale")));
        let session = session_with(&transport, &store);

        assert_eq!(session.bootstrap().await, SessionPhase::SignedIn);
        assert_eq!(session.token().as_deref(), Some("renewed"));
        assert_eq!(store.token().as_deref(), Some("renewed"));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_clears_store() {
        let transport = ScriptedTransport::new();
        transport
            .on("/api/users/me", empty(401))
            .on("/refresh", empty(401));
        let store = Arc::new(MemoryCredentialStore::with_credential(Credential::new("stale")));
        let session = session_with(&transport, &store);

        assert_eq!(session.bootstrap().await, SessionPhase::SignedOut);
        assert!(store.token().is_none());
        assert!(session.token().is_none());
        assert!(!session.state().bootstrapping);
    }

    #[tokio::test]
    async fn test_bootstrap_network_error_signs_out() {
        let transport = ScriptedTransport::new();
        transport.on("/api/users/me", Step::Fail("no route to host".into()));
        let store = Arc::new(MemoryCredentialStore::with_credential(Credential::new("saved")));
        let session = session_with(&transport, &store);

        assert_eq!(session.bootstrap().await, SessionPhase::SignedOut);
        assert!(store.token().is_none());
    }

    #[tokio::test]
    async fn test_bootstrap_without_credential() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = session_with(&transport, &store);

        assert_eq!(session.bootstrap().await, SessionPhase::SignedOut);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_bootstrap_store_read_error() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(BrokenStore {
            cleared: AtomicBool::new(false),
        });
        let session = AuthSession::new(ApiClient::with_transport(BASE, transport.clone()), store.clone());

        assert_eq!(session.bootstrap().await, SessionPhase::SignedOut);
        assert!(store.cleared.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_refresh_user_replaces_profile() {
        let transport = ScriptedTransport::new();
        let store = Arc::new(MemoryCredentialStore::new());
        let session = signed_in(&transport, &store, "tok").await;
        transport.on(
            "/api/users/me",
            respond(200, json!({"data": {"user": {"email": "test@example.com", "emailVerified": true}}})),
        );

        let user = session.refresh_user().await.expect("profile fetch").expect("signed in");
        assert!(user.email_verified);
        assert_eq!(session.user(), Some(user));

        session.sign_out();
        assert_eq!(session.refresh_user().await.expect("no-op"), None);
    }

    #[test]
    fn test_state_debug_hides_token() {
        let state = SessionState {
            token: Some("secret".to_string()),
            ..SessionState::default()
        };
        assert!(!format!("{state:?}").contains("secret"));
    }
}
