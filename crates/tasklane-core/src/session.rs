use std::sync::{Arc, LazyLock};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tasklane_shared::{AuthResponse, LoginRequest, ProfileUpdate, RegisterRequest, UserDto};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::api::ApiClient;
use crate::error::{ApiError, AuthAction, AuthError};
use crate::storage::{AUTH_TOKEN_KEY, CONVERSATION_KEY};

const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Unknown,
    Anonymous,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: AuthStatus,
    pub user: Option<UserDto>,
    pub token: Option<String>,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl SessionSnapshot {
    fn unknown() -> Self {
        Self {
            status: AuthStatus::Unknown,
            user: None,
            token: None,
            is_loading: true,
            error: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.status == AuthStatus::Authenticated && self.user.is_some()
    }

    pub fn user_id(&self) -> Option<Uuid> {
        self.user.as_ref().map(|user| user.user_id)
    }

    fn become_anonymous(&mut self) {
        self.status = AuthStatus::Anonymous;
        self.user = None;
        self.token = None;
        self.is_loading = false;
    }
}

struct SessionInner {
    api: ApiClient,
    state: watch::Sender<SessionSnapshot>,
}

struct Refresher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns who is signed in. Constructed once and handed to everything that
/// needs identity; observers read snapshots or subscribe to changes.
pub struct SessionStore {
    inner: Arc<SessionInner>,
    refresher: Mutex<Option<Refresher>>,
}

impl std::fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("SessionStore")
            .field("status", &snapshot.status)
            .field("user", &snapshot.user.map(|user| user.email))
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}

impl SessionStore {
    pub fn new(api: ApiClient) -> Self {
        let (state, _) = watch::channel(SessionSnapshot::unknown());
        Self {
            inner: Arc::new(SessionInner { api, state }),
            refresher: Mutex::new(None),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.state.subscribe()
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    /// Re-derives identity from the stored token. Never fails; the outcome
    /// is the returned snapshot.
    pub async fn refresh(&self) -> SessionSnapshot {
        self.inner.refresh().await
    }

    #[tracing::instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<UserDto, AuthError> {
        self.begin_attempt();
        let request = LoginRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
        };
        let outcome = self.inner.api.login(&request).await;
        self.complete_sign_in(AuthAction::Login, outcome).await
    }

    #[tracing::instrument(skip(self, password))]
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<UserDto, AuthError> {
        self.begin_attempt();
        let email = email.trim();
        let request = RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
            username: derive_username(name, email),
        };
        let outcome = self.inner.api.register(&request).await;
        self.complete_sign_in(AuthAction::Register, outcome).await
    }

    /// Always ends anonymous. A failing remote sign-out is only logged.
    #[tracing::instrument(skip(self))]
    pub async fn logout(&self) {
        if let Err(err) = self.inner.api.logout().await {
            warn!(error = %err, "remote sign-out failed; clearing local session anyway");
        }

        let storage = self.inner.api.storage();
        for key in [AUTH_TOKEN_KEY, CONVERSATION_KEY] {
            if let Err(err) = storage.remove(key) {
                warn!(key, error = %err, "failed to clear client storage entry");
            }
        }

        self.inner.state.send_modify(|state| {
            state.become_anonymous();
            state.error = None;
        });
        info!("signed out");
    }

    /// Asks the server whether the stored token is still accepted.
    pub async fn verify(&self) -> Result<bool, ApiError> {
        if self.inner.api.bearer_token().is_none() {
            return Ok(false);
        }
        Ok(self.inner.api.verify_token().await?.valid)
    }

    #[tracing::instrument(skip(self, update))]
    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserDto, ApiError> {
        let user = self.inner.api.update_profile(update).await?;
        self.inner.state.send_modify(|state| {
            if state.status == AuthStatus::Authenticated {
                state.user = Some(user.clone());
            }
        });
        Ok(user)
    }

    /// Resolves the session once and starts the periodic refresh. Calling
    /// it again while the refresh loop runs does nothing.
    pub async fn start(&self, interval: Duration) -> SessionSnapshot {
        {
            let mut slot = self.refresher.lock();
            if slot.as_ref().is_some_and(|running| !running.cancel.is_cancelled()) {
                debug!("session refresh already running");
                return self.snapshot();
            }
            *slot = Some(spawn_refresher(
                Arc::clone(&self.inner),
                interval.max(MIN_REFRESH_INTERVAL),
            ));
        }
        self.inner.refresh().await
    }

    pub fn is_refreshing(&self) -> bool {
        self.refresher
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Stops the periodic refresh and waits for it to exit.
    pub async fn teardown(&self) {
        let Some(running) = self.refresher.lock().take() else {
            return;
        };
        running.cancel.cancel();
        if let Err(err) = running.handle.await {
            warn!(error = %err, "session refresh task ended abnormally");
        }
        debug!("session refresh stopped");
    }

    fn begin_attempt(&self) {
        self.inner.state.send_modify(|state| {
            state.error = None;
            state.is_loading = true;
        });
    }

    async fn complete_sign_in(
        &self,
        action: AuthAction,
        outcome: Result<AuthResponse, ApiError>,
    ) -> Result<UserDto, AuthError> {
        let reply = match outcome {
            Ok(reply) => reply,
            Err(err) => {
                warn!(status = err.status(), error = %err, "sign-in request rejected");
                return Err(self.record_failure(AuthError::classify(action, &err)));
            }
        };

        let Some(token) = reply.bearer_token() else {
            return Err(self.record_failure(AuthError::MissingToken(action)));
        };
        if let Err(err) = self.inner.api.storage().set(AUTH_TOKEN_KEY, token) {
            warn!(error = %err, "failed to persist bearer token");
            return Err(self.record_failure(AuthError::Other(format!(
                "failed to store credentials: {err:#}"
            ))));
        }

        let snapshot = self.inner.refresh().await;
        match snapshot.user {
            Some(user) if snapshot.status == AuthStatus::Authenticated => {
                info!(user_id = %user.user_id, "signed in");
                Ok(user)
            }
            _ => Err(self.record_failure(AuthError::IdentityUnavailable)),
        }
    }

    fn record_failure(&self, err: AuthError) -> AuthError {
        let message = err.to_string();
        self.inner.state.send_modify(|state| {
            state.error = Some(message);
            state.is_loading = false;
            if state.status == AuthStatus::Unknown {
                state.become_anonymous();
            }
        });
        err
    }
}

impl Drop for SessionStore {
    fn drop(&mut self) {
        if let Some(running) = self.refresher.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

impl SessionInner {
    #[tracing::instrument(skip(self))]
    async fn refresh(&self) -> SessionSnapshot {
        let Some(token) = self.api.bearer_token() else {
            debug!("no stored token; session is anonymous");
            self.state.send_modify(SessionSnapshot::become_anonymous);
            return self.state.borrow().clone();
        };

        match self.api.current_user().await {
            Ok(user) => {
                debug!(user_id = %user.user_id, "identity refreshed");
                self.state.send_modify(|state| {
                    state.status = AuthStatus::Authenticated;
                    state.user = Some(user);
                    state.token = Some(token);
                    state.is_loading = false;
                });
            }
            Err(err) => {
                if err.is_unauthorized() {
                    info!(status = err.status(), "stored token rejected; discarding it");
                    if let Err(remove_err) = self.api.storage().remove(AUTH_TOKEN_KEY) {
                        warn!(error = %remove_err, "failed to discard rejected token");
                    }
                } else {
                    warn!(error = %err, "identity refresh failed");
                }
                self.state.send_modify(SessionSnapshot::become_anonymous);
            }
        }

        self.state.borrow().clone()
    }
}

fn spawn_refresher(inner: Arc<SessionInner>, period: Duration) -> Refresher {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            debug!("periodic session refresh");
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = inner.refresh() => {}
            }
        }
    });
    Refresher { cancel, handle }
}

/// Username sent on registration: the display name when given, else the
/// email's local part, with whitespace runs collapsed to `_` and lower-cased.
pub fn derive_username(name: Option<&str>, email: &str) -> String {
    let base = name
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| email.split('@').next().unwrap_or(email).trim());
    WHITESPACE_RUN.replace_all(base, "_").to_lowercase()
}

static WHITESPACE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern is valid"));

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{Value, json};

    use super::{AuthStatus, SessionStore, derive_username};
    use crate::api::scripted::ScriptedTransport;
    use crate::api::{ApiClient, HttpMethod};
    use crate::error::{AuthAction, AuthError};
    use crate::storage::{AUTH_TOKEN_KEY, CONVERSATION_KEY, ClientStorage, MemoryStorage};

    const ME: &str = "/api/v1/auth/me";
    const LOGIN: &str = "/api/v1/auth/login";
    const REGISTER: &str = "/api/v1/auth/register";
    const LOGOUT: &str = "/api/v1/auth/logout";

    fn user_json() -> Value {
        json!({
            "user_id": "1d3c0c39-7d2b-4c2e-9b41-18a1d3f2c9aa",
            "email": "ada@example.com",
            "username": "ada",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
            "is_active": true
        })
    }

    fn store() -> (SessionStore, Arc<ScriptedTransport>, Arc<MemoryStorage>) {
        let transport = Arc::new(ScriptedTransport::new());
        let storage = Arc::new(MemoryStorage::new());
        let api = ApiClient::new("http://api.test", transport.clone(), storage.clone());
        (SessionStore::new(api), transport, storage)
    }

    #[tokio::test]
    async fn starts_unknown_and_loading() {
        let (session, _, _) = store();
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, AuthStatus::Unknown);
        assert!(snapshot.is_loading);
        assert!(!snapshot.is_authenticated());
    }

    #[tokio::test]
    async fn refresh_without_token_skips_the_network() {
        let (session, transport, _) = store();
        let snapshot = session.refresh().await;
        assert_eq!(snapshot.status, AuthStatus::Anonymous);
        assert!(!snapshot.is_loading);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn valid_login_then_refresh_is_authenticated() {
        let (session, transport, storage) = store();
        transport.respond(HttpMethod::Post, LOGIN, 200, json!({ "token": "tok-1" }));
        transport.respond(HttpMethod::Get, ME, 200, user_json());

        let user = session
            .login("ada@example.com", "pw")
            .await
            .expect("login succeeds");
        assert_eq!(user.username, "ada");
        assert_eq!(storage.get(AUTH_TOKEN_KEY).as_deref(), Some("tok-1"));

        let snapshot = session.refresh().await;
        assert!(snapshot.is_authenticated());
        assert_eq!(snapshot.token.as_deref(), Some("tok-1"));
        assert_eq!(
            snapshot.user.map(|user| user.email),
            Some("ada@example.com".to_string())
        );

        let me = transport
            .requests()
            .into_iter()
            .find(|request| request.url.ends_with(ME))
            .expect("identity request");
        assert_eq!(me.header("Authorization"), Some("Bearer tok-1"));
    }

    #[tokio::test]
    async fn invalid_login_stays_anonymous() {
        let (session, transport, storage) = store();
        session.refresh().await;
        transport.respond(
            HttpMethod::Post,
            LOGIN,
            401,
            json!({ "detail": "Incorrect email or password" }),
        );

        let err = session
            .login("ada@example.com", "wrong")
            .await
            .expect_err("login rejected");
        assert_eq!(err, AuthError::InvalidCredentials);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, AuthStatus::Anonymous);
        assert_eq!(snapshot.error.as_deref(), Some("Invalid email or password"));
        assert_eq!(storage.get(AUTH_TOKEN_KEY), None);
    }

    #[tokio::test]
    async fn login_reply_without_token_is_rejected() {
        let (session, transport, _) = store();
        transport.respond(HttpMethod::Post, LOGIN, 200, json!({ "user": user_json() }));

        let err = session.login("ada@example.com", "pw").await.expect_err("no token");
        assert_eq!(err, AuthError::MissingToken(AuthAction::Login));
        assert_eq!(transport.count(HttpMethod::Get, ME), 0);
    }

    #[tokio::test]
    async fn failed_identity_after_login_reports_error() {
        let (session, transport, _) = store();
        transport.respond(HttpMethod::Post, LOGIN, 200, json!({ "token": "tok" }));
        transport.respond(HttpMethod::Get, ME, 500, json!({ "message": "boom" }));

        let err = session.login("ada@example.com", "pw").await.expect_err("identity");
        assert_eq!(err, AuthError::IdentityUnavailable);
        assert_eq!(session.snapshot().status, AuthStatus::Anonymous);
    }

    #[tokio::test]
    async fn register_derives_username_and_reports_duplicates() {
        let (session, transport, _) = store();
        transport.respond(
            HttpMethod::Post,
            REGISTER,
            409,
            json!({ "message": "Email taken" }),
        );

        let err = session
            .register("ada@example.com", "pw", Some("Ada  Lovelace"))
            .await
            .expect_err("duplicate");
        assert_eq!(err, AuthError::AlreadyExists);

        let body = transport.requests()[0].json_body().expect("body");
        assert_eq!(body["username"], "ada_lovelace");
    }

    #[tokio::test]
    async fn rejected_token_is_discarded_on_refresh() {
        let (session, transport, storage) = store();
        storage.set(AUTH_TOKEN_KEY, "stale").expect("seed token");
        transport.respond(HttpMethod::Get, ME, 401, json!({ "detail": "expired" }));

        let snapshot = session.refresh().await;
        assert_eq!(snapshot.status, AuthStatus::Anonymous);
        assert_eq!(storage.get(AUTH_TOKEN_KEY), None);
    }

    #[tokio::test]
    async fn network_failure_keeps_token_for_later() {
        let (session, transport, storage) = store();
        storage.set(AUTH_TOKEN_KEY, "tok").expect("seed token");
        transport.fail(HttpMethod::Get, ME, "connection refused");

        let snapshot = session.refresh().await;
        assert_eq!(snapshot.status, AuthStatus::Anonymous);
        assert_eq!(storage.get(AUTH_TOKEN_KEY).as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn logout_clears_state_even_when_remote_fails() {
        let (session, transport, storage) = store();
        storage.set(AUTH_TOKEN_KEY, "tok").expect("seed token");
        storage.set(CONVERSATION_KEY, "4").expect("seed conversation");
        transport.respond(HttpMethod::Get, ME, 200, user_json());
        transport.fail(HttpMethod::Post, LOGOUT, "offline");

        assert!(session.refresh().await.is_authenticated());
        let mut changes = session.subscribe();
        session.logout().await;

        let snapshot = session.snapshot();
        assert!(!snapshot.is_authenticated());
        assert_eq!(snapshot.token, None);
        assert_eq!(storage.get(AUTH_TOKEN_KEY), None);
        assert_eq!(storage.get(CONVERSATION_KEY), None);
        assert!(changes.has_changed().expect("sender alive"));
    }

    #[tokio::test(start_paused = true)]
    async fn background_refresh_runs_on_interval_until_teardown() {
        let (session, transport, storage) = store();
        storage.set(AUTH_TOKEN_KEY, "tok").expect("seed token");
        transport.respond(HttpMethod::Get, ME, 200, user_json());

        let interval = Duration::from_secs(300);
        assert!(session.start(interval).await.is_authenticated());
        assert_eq!(transport.count(HttpMethod::Get, ME), 1);

        session.start(interval).await;
        assert_eq!(transport.count(HttpMethod::Get, ME), 1);

        tokio::time::sleep(Duration::from_secs(301)).await;
        tokio::task::yield_now().await;
        assert_eq!(transport.count(HttpMethod::Get, ME), 2);

        session.teardown().await;
        assert!(!session.is_refreshing());
        tokio::time::sleep(Duration::from_secs(1200)).await;
        assert_eq!(transport.count(HttpMethod::Get, ME), 2);

        session.teardown().await;
    }

    #[test]
    fn username_falls_back_to_email_local_part() {
        assert_eq!(derive_username(None, "Grace.Hopper@navy.mil"), "grace.hopper");
        assert_eq!(derive_username(Some("   "), "x y@z.io"), "x_y");
        assert_eq!(derive_username(Some(" Alan \t Turing "), "a@b.c"), "alan_turing");
    }
}
