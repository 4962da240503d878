//! Session lifecycle: bootstrap, login, logout.
//!
//! `SessionManager` owns the credential store, the refresh coordinator and the
//! request pipeline for one API origin. The in-memory `Session` is what the rest
//! of the application looks at; `AuthEvent`s are broadcast on every change.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::api::{ApiClient, ApiError, ReqwestTransport, RequestPipeline, Transport};
use crate::config::Config;
use crate::models::{AuthResponse, LoginRequest, OAuthProvider, RegisterRequest, UserProfile};

use super::{Credential, CredentialStore, RefreshCoordinator, RefreshError, RefreshObserver};

const LOGIN_PATH: &str = "/login";
const REGISTER_PATH: &str = "/register";

/// Capacity of the event channel; slow subscribers see `Lagged`
const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AuthState {
    #[default]
    LoggedOut,
    LoggedIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum LogoutReason {
    /// `logout()` was called
    UserRequested,
    /// Refresh failed terminally
    SessionExpired,
    /// Verification returned 404
    AccountNotFound,
    /// Still rejected after a successful refresh
    CredentialRejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum AuthEvent {
    LoggedIn,
    ProfileUpdated,
    TokenRefreshed,
    LoggedOut { reason: LogoutReason },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    pub state: AuthState,
    pub user: Option<UserProfile>,
    pub logged_in_at: Option<DateTime<Utc>>,
    /// Last time the backend confirmed the profile
    pub verified_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.state == AuthState::LoggedIn
    }
}

/// Session state shared with the refresh coordinator.
struct SessionShared {
    session: RwLock<Session>,
    events: broadcast::Sender<AuthEvent>,
}

impl SessionShared {
    fn emit(&self, event: AuthEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Returns true if this moved the session from logged-out to logged-in.
    fn mark_logged_in(&self, user: Option<UserProfile>, verified: bool) -> bool {
        let now = Utc::now();
        let mut session = self.session.write();
        let transitioned = session.state == AuthState::LoggedOut;
        session.state = AuthState::LoggedIn;
        session.user = user;
        if transitioned {
            session.logged_in_at = Some(now);
            session.verified_at = None;
        }
        if verified {
            session.verified_at = Some(now);
        }
        transitioned
    }

    /// Back to logged-out. `LoggedOut` is only emitted on the transition, so
    /// racing callers produce a single event.
    fn reset(&self, reason: LogoutReason) -> bool {
        {
            let mut session = self.session.write();
            if session.state == AuthState::LoggedOut {
                return false;
            }
            *session = Session::default();
        }
        info!(?reason, "Logged out");
        self.emit(AuthEvent::LoggedOut { reason });
        true
    }
}

impl RefreshObserver for SessionShared {
    fn refreshed(&self) {
        self.emit(AuthEvent::TokenRefreshed);
    }

    fn session_expired(&self, error: &RefreshError) {
        debug!(error = %error, "Refresh failed, ending session");
        self.reset(LogoutReason::SessionExpired);
    }
}

struct Inner {
    store: Arc<CredentialStore>,
    shared: Arc<SessionShared>,
    api: ApiClient,
}

/// Entry point for everything authenticated. Clone is cheap.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(config: &Config, store: Arc<CredentialStore>, transport: Arc<dyn Transport>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(SessionShared {
            session: RwLock::new(Session::default()),
            events,
        });
        let coordinator = Arc::new(
            RefreshCoordinator::new(store.clone(), transport.clone(), config.refresh_timeout())
                .with_observer(shared.clone()),
        );
        let pipeline = RequestPipeline::new(transport, store.clone(), coordinator)
            .treat_422_as_auth_failure(config.treat_422_as_auth_failure);

        Self {
            inner: Arc::new(Inner {
                store,
                shared,
                api: ApiClient::new(Arc::new(pipeline)),
            }),
        }
    }

    /// HTTP transport and credential store as described by `config`.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let transport = ReqwestTransport::new(&config.api_base_url, config.request_timeout())?;
        let store = config.open_credential_store()?;
        Ok(Self::new(config, Arc::new(store), Arc::new(transport)))
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.inner.store
    }

    pub fn session(&self) -> Session {
        self.inner.shared.session.read().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.shared.session.read().is_authenticated()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Restore the session from stored credentials and verify it.
    ///
    /// The cached session is reported as logged in right away; only a definite
    /// answer from the backend (account gone, credential rejected, refresh
    /// failed) ends it. Network trouble and server errors keep it.
    #[instrument(skip(self))]
    pub async fn check_auth(&self) -> AuthState {
        let shared = &self.inner.shared;
        let (credential, cached_user, generation) = self.inner.store.cached_session();
        if credential.is_none() {
            shared.reset(LogoutReason::SessionExpired);
            return AuthState::LoggedOut;
        }

        if shared.mark_logged_in(cached_user, false) {
            shared.emit(AuthEvent::LoggedIn);
        }

        match self.verify_user().await {
            Ok(user) => {
                {
                    let mut session = shared.session.write();
                    // The profile belongs to the credential we started with; a
                    // logout or another login since then wins.
                    if !session.is_authenticated()
                        || !self.inner.store.set_user_profile_if(generation, &user)
                    {
                        debug!("Session replaced while verifying, discarding profile");
                        return session.state;
                    }
                    session.user = Some(user);
                    session.verified_at = Some(Utc::now());
                }
                debug!("Session verified");
                shared.emit(AuthEvent::ProfileUpdated);
            }
            Err(ApiError::AccountNotFound) => {
                warn!("Account no longer exists");
                self.end_session_if(generation, LogoutReason::AccountNotFound);
            }
            Err(ApiError::AuthRejected { status, .. }) => {
                warn!(status, "Credential rejected after refresh");
                self.end_session_if(generation, LogoutReason::CredentialRejected);
            }
            Err(ApiError::RefreshFailed(e)) => {
                debug!(error = %e, "Refresh failed during verification");
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Could not verify session, keeping cached session");
            }
            Err(e) => {
                warn!(error = %e, "Unexpected verification failure, keeping cached session");
            }
        }

        self.session().state
    }

    /// Run `check_auth` in the background.
    pub fn spawn_check_auth(&self) -> JoinHandle<AuthState> {
        let manager = self.clone();
        tokio::spawn(async move { manager.check_auth().await })
    }

    async fn verify_user(&self) -> Result<UserProfile, ApiError> {
        match self.inner.api.fetch_user().await {
            Err(ApiError::NotFound(_)) => Err(ApiError::AccountNotFound),
            other => other,
        }
    }

    #[instrument(skip(self, request), fields(email = %request.email))]
    pub async fn login(&self, request: &LoginRequest) -> Result<Session, ApiError> {
        let auth = self.inner.api.authenticate(LOGIN_PATH, request).await?;
        Ok(self.establish(auth))
    }

    #[instrument(skip(self, request), fields(email = %request.email))]
    pub async fn register(&self, request: &RegisterRequest) -> Result<Session, ApiError> {
        let auth = self.inner.api.authenticate(REGISTER_PATH, request).await?;
        Ok(self.establish(auth))
    }

    /// Trade a provider's token (Google ID token, GitHub code, ...) for a session.
    #[instrument(skip(self, token), fields(provider = %provider))]
    pub async fn exchange_oauth_token(&self, provider: OAuthProvider, token: &str) -> Result<Session, ApiError> {
        let body = serde_json::json!({ "token": token });
        let auth = self.inner.api.authenticate(&provider.verify_path(), &body).await?;
        Ok(self.establish(auth))
    }

    fn establish(&self, auth: AuthResponse) -> Session {
        let AuthResponse {
            access_token,
            refresh_token,
            user,
        } = auth;
        if refresh_token.is_none() {
            warn!("No refresh token issued; session ends when the access token expires");
        }
        self.inner
            .store
            .replace(Credential::new(access_token, refresh_token), user.as_ref());
        self.inner.shared.mark_logged_in(user, true);
        info!("Logged in");
        self.inner.shared.emit(AuthEvent::LoggedIn);
        self.session()
    }

    /// Clear stored credentials and the in-memory session. Safe to call when
    /// already logged out or while a refresh is failing.
    #[instrument(skip(self))]
    pub fn logout(&self) {
        self.inner.store.clear();
        self.inner.shared.reset(LogoutReason::UserRequested);
    }

    fn end_session_if(&self, generation: u64, reason: LogoutReason) {
        if self.inner.store.clear_if(generation) {
            self.inner.shared.reset(reason);
        } else {
            debug!(?reason, "Credential replaced meanwhile, not logging out");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{backend, json_response, user_json, MockTransport, FRESH_TOKEN, REFRESH_TOKEN, STALE_TOKEN};
    use reqwest::StatusCode;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn manager_with(transport: MockTransport) -> (SessionManager, Arc<CredentialStore>, Arc<MockTransport>) {
        let store = Arc::new(CredentialStore::in_memory());
        let transport = Arc::new(transport);
        let manager = SessionManager::new(&Config::default(), store.clone(), transport.clone());
        (manager, store, transport)
    }

    fn drain(rx: &mut broadcast::Receiver<AuthEvent>) -> Vec<AuthEvent> {
        let mut events = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
                Err(TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    fn logouts(events: &[AuthEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, AuthEvent::LoggedOut { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_check_auth_without_credential() {
        let (manager, _store, transport) = manager_with(MockTransport::backend());
        assert_eq!(manager.check_auth().await, AuthState::LoggedOut);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_check_auth_verifies_and_updates_profile() {
        let (manager, store, _) = manager_with(MockTransport::backend());
        store.replace(
            Credential::new(FRESH_TOKEN, Some(REFRESH_TOKEN.into())),
            Some(&UserProfile {
                name: Some("Old name".into()),
                ..Default::default()
            }),
        );
        let mut rx = manager.subscribe();

        assert_eq!(manager.check_auth().await, AuthState::LoggedIn);
        let session = manager.session();
        assert_eq!(session.user.unwrap().name.as_deref(), Some("Ada"));
        assert!(session.verified_at.is_some());
        assert_eq!(store.user_profile().unwrap().name.as_deref(), Some("Ada"));
        assert_eq!(drain(&mut rx), vec![AuthEvent::LoggedIn, AuthEvent::ProfileUpdated]);
    }

    #[tokio::test]
    async fn test_check_auth_refreshes_expired_token() {
        let (manager, store, transport) = manager_with(MockTransport::backend());
        store.set(Credential::new(STALE_TOKEN, Some(REFRESH_TOKEN.into())));
        let mut rx = manager.subscribe();

        assert_eq!(manager.check_auth().await, AuthState::LoggedIn);
        assert_eq!(transport.count("/refresh"), 1);
        assert_eq!(store.access_token().as_deref(), Some(FRESH_TOKEN));
        assert!(drain(&mut rx).contains(&AuthEvent::TokenRefreshed));
    }

    #[tokio::test]
    async fn test_bootstrap_keeps_session_on_network_error() {
        let (manager, store, _) = manager_with(MockTransport::new(|_| {
            Err(ApiError::Network("connection refused".into()))
        }));
        store.replace(
            Credential::new(FRESH_TOKEN, Some(REFRESH_TOKEN.into())),
            Some(&UserProfile {
                name: Some("Ada".into()),
                ..Default::default()
            }),
        );

        assert_eq!(manager.check_auth().await, AuthState::LoggedIn);
        let session = manager.session();
        assert_eq!(session.user.unwrap().name.as_deref(), Some("Ada"));
        assert!(session.verified_at.is_none());
        assert!(store.get().is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_keeps_session_on_server_error() {
        let (manager, store, _) = manager_with(MockTransport::new(|_| {
            json_response(StatusCode::SERVICE_UNAVAILABLE, json!({ "error": "maintenance" }))
        }));
        store.set(Credential::new(FRESH_TOKEN, Some(REFRESH_TOKEN.into())));

        assert_eq!(manager.check_auth().await, AuthState::LoggedIn);
        assert!(store.get().is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_logs_out_when_account_gone() {
        let (manager, store, _) = manager_with(MockTransport::new(|_| {
            json_response(StatusCode::NOT_FOUND, json!({ "message": "User not found" }))
        }));
        store.set(Credential::new(FRESH_TOKEN, Some(REFRESH_TOKEN.into())));
        let mut rx = manager.subscribe();

        assert_eq!(manager.check_auth().await, AuthState::LoggedOut);
        assert!(store.get().is_none());
        assert!(!manager.is_authenticated());
        assert_eq!(
            drain(&mut rx),
            vec![
                AuthEvent::LoggedIn,
                AuthEvent::LoggedOut {
                    reason: LogoutReason::AccountNotFound
                }
            ]
        );
    }

    #[tokio::test]
    async fn test_bootstrap_refresh_failure_logs_out() {
        let (manager, store, _) = manager_with(MockTransport::backend());
        store.set(Credential::new(STALE_TOKEN, Some("revoked".into())));
        let mut rx = manager.subscribe();

        assert_eq!(manager.check_auth().await, AuthState::LoggedOut);
        assert!(store.get().is_none());
        let events = drain(&mut rx);
        assert_eq!(logouts(&events), 1);
        assert!(events.contains(&AuthEvent::LoggedOut {
            reason: LogoutReason::SessionExpired
        }));
    }

    #[tokio::test]
    async fn test_bootstrap_rejected_after_refresh_logs_out() {
        let (manager, store, _) = manager_with(MockTransport::new(|req| match req.path.as_str() {
            "/refresh" => json_response(StatusCode::OK, json!({ "access_token": "still-bad" })),
            _ => json_response(StatusCode::UNAUTHORIZED, json!({ "msg": "Token has been revoked" })),
        }));
        store.set(Credential::new(STALE_TOKEN, Some(REFRESH_TOKEN.into())));
        let mut rx = manager.subscribe();

        assert_eq!(manager.check_auth().await, AuthState::LoggedOut);
        assert!(store.get().is_none());
        assert!(drain(&mut rx).contains(&AuthEvent::LoggedOut {
            reason: LogoutReason::CredentialRejected
        }));
    }

    #[tokio::test]
    async fn test_login_stores_credential_and_profile() {
        let (manager, store, transport) = manager_with(MockTransport::new(|req| {
            assert_eq!(req.path, "/login");
            assert_eq!(req.body.as_ref().unwrap()["email"], "ada@example.com");
            json_response(
                StatusCode::OK,
                json!({ "access_token": FRESH_TOKEN, "refresh_token": REFRESH_TOKEN, "user": user_json() }),
            )
        }));
        let mut rx = manager.subscribe();

        let session = manager
            .login(&LoginRequest::new("ada@example.com", "hunter2"))
            .await
            .unwrap();
        assert!(session.is_authenticated());
        assert!(session.logged_in_at.is_some());
        assert_eq!(session.user.unwrap().email.as_deref(), Some("ada@example.com"));
        assert_eq!(store.get(), Some(Credential::new(FRESH_TOKEN, Some(REFRESH_TOKEN.into()))));
        assert_eq!(store.user_profile().unwrap().name.as_deref(), Some("Ada"));
        assert_eq!(transport.requests()[0].bearer_token(), None);
        assert_eq!(drain(&mut rx), vec![AuthEvent::LoggedIn]);
    }

    #[tokio::test]
    async fn test_login_failure_leaves_state_untouched() {
        let (manager, store, _) = manager_with(MockTransport::new(|_| {
            json_response(StatusCode::UNAUTHORIZED, json!({ "message": "Invalid email or password" }))
        }));
        store.set(Credential::new("previous", Some("previous-refresh".into())));

        match manager.login(&LoginRequest::new("ada@example.com", "wrong")).await {
            Err(ApiError::AuthRejected { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid email or password");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(store.access_token().as_deref(), Some("previous"));
        assert!(!manager.is_authenticated());
    }

    #[tokio::test]
    async fn test_register_validation_error_surfaces() {
        let (manager, store, transport) = manager_with(MockTransport::new(|_| {
            json_response(StatusCode::UNPROCESSABLE_ENTITY, json!({ "message": "Email already registered" }))
        }));

        let request = RegisterRequest::new("Ada", "ada@example.com", "pw").with_field("age", 36);
        match manager.register(&request).await {
            Err(ApiError::Status { status, message }) => {
                assert_eq!(status, 422);
                assert_eq!(message, "Email already registered");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(store.get().is_none());
        assert_eq!(transport.count("/refresh"), 0);
    }

    #[tokio::test]
    async fn test_oauth_exchange() {
        let (manager, store, _) = manager_with(MockTransport::new(|req| {
            assert_eq!(req.path, "/auth/github/verify");
            assert_eq!(req.body.as_ref().unwrap()["token"], "gh-code");
            json_response(StatusCode::OK, json!({ "access_token": FRESH_TOKEN, "refresh_token": REFRESH_TOKEN }))
        }));

        let session = manager
            .exchange_oauth_token(OAuthProvider::GitHub, "gh-code")
            .await
            .unwrap();
        assert!(session.is_authenticated());
        assert!(session.user.is_none());
        assert_eq!(store.access_token().as_deref(), Some(FRESH_TOKEN));
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let (manager, store, _) = manager_with(MockTransport::new(|_| {
            json_response(
                StatusCode::OK,
                json!({ "access_token": FRESH_TOKEN, "refresh_token": REFRESH_TOKEN, "user": user_json() }),
            )
        }));
        manager.login(&LoginRequest::new("ada@example.com", "pw")).await.unwrap();
        let mut rx = manager.subscribe();

        manager.logout();
        manager.logout();
        assert!(store.get().is_none());
        assert!(store.user_profile().is_none());
        assert_eq!(
            drain(&mut rx),
            vec![AuthEvent::LoggedOut {
                reason: LogoutReason::UserRequested
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_racing_failing_refresh_emits_once() {
        let transport = MockTransport::new(backend).with_delay("/refresh", Duration::from_millis(100));
        let (manager, store, transport) = manager_with(transport);
        store.set(Credential::new(STALE_TOKEN, Some("revoked".into())));
        manager.inner.shared.mark_logged_in(None, false);
        let mut rx = manager.subscribe();

        let request = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.api().fetch_user().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.api().pipeline().coordinator().is_refreshing());
        manager.logout();

        assert!(request.await.unwrap().is_err());
        manager.logout();
        assert!(store.get().is_none());
        assert_eq!(transport.count("/refresh"), 1);
        assert_eq!(logouts(&drain(&mut rx)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_check_auth() {
        let (manager, store, _) = manager_with(MockTransport::backend());
        store.set(Credential::new(FRESH_TOKEN, Some(REFRESH_TOKEN.into())));

        let state = manager.spawn_check_auth().await.unwrap();
        assert_eq!(state, AuthState::LoggedIn);
        assert!(manager.session().verified_at.is_some());
    }

    fn alice_then_bob() -> MockTransport {
        MockTransport::new(|req| match req.path.as_str() {
            "/login" => json_response(
                StatusCode::OK,
                json!({ "access_token": "bob-a", "refresh_token": "bob-r", "user": { "name": "Bob" } }),
            ),
            _ => json_response(StatusCode::OK, json!({ "user": { "name": "Alice" } })),
        })
        .with_delay("/user", Duration::from_millis(100))
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_during_check_auth_keeps_new_profile() {
        let (manager, store, _) = manager_with(alice_then_bob());
        store.set(Credential::new("alice-a", Some("alice-r".into())));

        let check = manager.spawn_check_auth();
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.logout();
        manager
            .login(&LoginRequest::new("bob@example.com", "pw"))
            .await
            .unwrap();

        assert_eq!(check.await.unwrap(), AuthState::LoggedIn);
        let name = |user: Option<UserProfile>| user.and_then(|u| u.name);
        assert_eq!(name(manager.session().user).as_deref(), Some("Bob"));
        assert_eq!(name(store.user_profile()).as_deref(), Some("Bob"));
        assert_eq!(store.access_token().as_deref(), Some("bob-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_during_check_auth_leaves_no_profile() {
        let (manager, store, _) = manager_with(alice_then_bob());
        store.set(Credential::new("alice-a", Some("alice-r".into())));

        let check = manager.spawn_check_auth();
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.logout();

        assert_eq!(check.await.unwrap(), AuthState::LoggedOut);
        assert!(manager.session().user.is_none());
        assert!(store.user_profile().is_none());
        assert!(store.get().is_none());
    }
}
