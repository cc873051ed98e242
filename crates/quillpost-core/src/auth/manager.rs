use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use reqwest::StatusCode;
use tracing::{debug, info, warn};

use super::coordinator::{Flight, RefreshCoordinator, RefreshError};
use super::session::{SessionData, SessionError, SessionState};
use super::store::CredentialStore;
use crate::api::models::{LoginRequest, RefreshRequest, TokenResponse};
use crate::api::transport::{ApiRequest, Transport};
use crate::api::ApiError;
use crate::config::Config;
use crate::utils::lock;
use crate::utils::validate::is_valid_username;

pub const LOGIN_PATH: &str = "/login";
pub const REFRESH_PATH: &str = "/token/refresh";

/// Owns the session for one client: its state, persistence, and refresh
/// coordination. Shared as `Arc<SessionManager>` with the request pipeline.
pub struct SessionManager {
    transport: Arc<dyn Transport>,
    store: CredentialStore,
    state: Mutex<SessionState>,
    coordinator: RefreshCoordinator,
    refresh_threshold: Duration,
    max_session_age: Duration,
    admin_user_id: i64,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn Transport>, store: CredentialStore, config: &Config) -> Self {
        Self {
            transport,
            store,
            state: Mutex::new(SessionState::Anonymous),
            coordinator: RefreshCoordinator::new(),
            refresh_threshold: config.refresh_threshold(),
            max_session_age: config.max_session_age(),
            admin_user_id: config.admin_user_id,
        }
    }

    // ===== Lifecycle =====

    /// Authenticate against `/login`, persist the session and mark it active.
    /// Any previous session is replaced.
    ///
    /// Fails without touching the current session if the new one cannot be
    /// persisted.
    pub async fn login(&self, username: &str, password: &str) -> Result<SessionData> {
        if !is_valid_username(username) {
            bail!("Username must be 3-20 characters without spaces");
        }
        if password.is_empty() {
            bail!("Password must not be empty");
        }

        let request = ApiRequest::post(LOGIN_PATH)
            .json(&LoginRequest { username, password })?
            .without_auth_retry();
        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| ApiError::Network(e.to_string()))
            .context("Failed to send login request")?;

        if !response.status.is_success() {
            return Err(ApiError::from_status(response.status, &response.body).into());
        }

        let tokens: TokenResponse = response.json().context("Failed to parse login response")?;
        let data = SessionData::from_login(tokens, username, Utc::now())?;

        {
            let mut state = lock(&self.state);
            self.store.save(&data).context("Failed to persist session")?;
            state.sign_out();
            state.authenticate(data.clone())?;
        }

        info!(user_id = data.user_id, "Logged in");
        Ok(data)
    }

    /// Drop the session from memory and storage. No server call is made.
    pub fn logout(&self) {
        self.sign_out_if(|_| true);
    }

    /// Log out only if the session still uses `token`. A session that was
    /// refreshed or replaced since is left alone. Returns true if a session
    /// was ended.
    pub fn logout_if_current(&self, token: Option<&str>) -> bool {
        self.sign_out_if(|state| state.access_token() == token)
    }

    fn sign_out_if(&self, pred: impl FnOnce(&SessionState) -> bool) -> bool {
        let mut state = lock(&self.state);
        if !pred(&*state) {
            return false;
        }
        let dropped = state.sign_out();
        if let Err(e) = self.store.clear() {
            warn!(error = %e, "Failed to clear stored session");
        }
        match dropped {
            Some(data) => {
                info!(user_id = data.user_id, "Logged out");
                true
            }
            None => false,
        }
    }

    /// Re-activate the persisted session at startup. The token is not checked
    /// with the server; the first real request does that.
    ///
    /// Returns false (after logging out) when the login is older than the
    /// maximum session age.
    pub fn restore(&self) -> Result<bool> {
        if let Some(current) = self.current() {
            return Ok(self.check_max_age(&current));
        }

        let Some(data) = self.store.load()? else {
            debug!("No stored session to restore");
            return Ok(false);
        };
        if !self.check_max_age(&data) {
            return Ok(false);
        }

        let mut state = lock(&self.state);
        if !state.is_authenticated() {
            state.authenticate(data)?;
            info!("Session restored");
        }
        Ok(true)
    }

    /// Log out if the current session has outlived the maximum session age.
    /// Returns true when a session remains.
    pub fn enforce_max_age(&self) -> bool {
        match self.current() {
            Some(current) => self.check_max_age(&current),
            None => false,
        }
    }

    fn check_max_age(&self, data: &SessionData) -> bool {
        if data.exceeds_max_age_at(Utc::now(), self.max_session_age) {
            info!(
                last_login = %data.last_login_time,
                "Session exceeded maximum age, logging out"
            );
            self.logout();
            return false;
        }
        true
    }

    // ===== State queries =====

    pub fn is_authenticated(&self) -> bool {
        lock(&self.state).is_authenticated()
    }

    pub fn is_admin(&self) -> bool {
        lock(&self.state)
            .session()
            .map(|d| d.user_id == self.admin_user_id)
            .unwrap_or(false)
    }

    pub fn current(&self) -> Option<SessionData> {
        lock(&self.state).session().cloned()
    }

    pub fn access_token(&self) -> Option<String> {
        lock(&self.state).access_token().map(str::to_string)
    }

    pub fn is_refreshing(&self) -> bool {
        self.coordinator.is_refreshing()
    }

    /// True when the token is within the refresh threshold of expiring.
    pub fn needs_proactive_refresh(&self) -> bool {
        lock(&self.state)
            .session()
            .map(|d| d.needs_refresh(self.refresh_threshold))
            .unwrap_or(false)
    }

    // ===== Refresh =====

    /// Refresh the access token, returning the new one or `None` on failure.
    pub async fn refresh(&self) -> Option<String> {
        match self.refresh_from(None).await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "Token refresh failed");
                None
            }
        }
    }

    /// Refresh on behalf of a request that was rejected while using
    /// `stale_token`. If the session has already moved past that token the
    /// current one is returned without another network call.
    pub async fn refresh_from(&self, stale_token: Option<&str>) -> Result<String, RefreshError> {
        if let Some(token) = self.rotated_past(stale_token) {
            return Ok(token);
        }

        match self.coordinator.join() {
            Flight::Follower(rx) => rx.await.unwrap_or(Err(RefreshError::Abandoned)),
            Flight::Leader(guard) => {
                // Another leader may have finished between the check above and join.
                let outcome = match self.rotated_past(stale_token) {
                    Some(token) => Ok(token),
                    None => self.perform_refresh().await,
                };
                guard.settle(&outcome);
                outcome
            }
        }
    }

    fn rotated_past(&self, stale_token: Option<&str>) -> Option<String> {
        let stale = stale_token?;
        let current = self.access_token()?;
        (current != stale).then_some(current)
    }

    async fn perform_refresh(&self) -> Result<String, RefreshError> {
        let refresh_token = lock(&self.state)
            .begin_refresh()
            .map_err(|_| RefreshError::NoSession)?;
        debug!("Refreshing access token");

        let request = ApiRequest::post(REFRESH_PATH)
            .json(&RefreshRequest {
                refresh_token: &refresh_token,
            })
            .map_err(|e| self.abort(RefreshError::Failed(e.to_string())))?
            .without_auth_retry();

        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| self.abort(RefreshError::Network(e.to_string())))?;

        match response.status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                // Only the session this refresh started from; a login since then stays
                if self.sign_out_if(SessionState::is_refreshing) {
                    warn!(status = %response.status, "Refresh token rejected, session ended");
                }
                return Err(RefreshError::Rejected);
            }
            status if !status.is_success() => {
                return Err(self.abort(RefreshError::Failed(format!("status {}", status))));
            }
            _ => {}
        }

        let tokens: TokenResponse = response
            .json()
            .map_err(|e| self.abort(RefreshError::Failed(format!("invalid response: {}", e))))?;

        let data = {
            let mut state = lock(&self.state);
            match state.complete_refresh(&tokens) {
                Ok(data) => data.clone(),
                Err(SessionError::InvalidTransition { .. }) => {
                    // Logged out (or logged in again) while the refresh was in flight
                    debug!("Discarding refreshed tokens for a session that ended");
                    return Err(RefreshError::NoSession);
                }
                Err(e) => {
                    state.abort_refresh();
                    return Err(RefreshError::Failed(e.to_string()));
                }
            }
        };

        if let Err(e) = self.store.save(&data) {
            warn!(error = %e, "Failed to persist refreshed session");
        }
        info!(user_id = data.user_id, "Access token refreshed");
        Ok(data.access_token)
    }

    /// Return to `Authenticated` with the old tokens after a non-terminal failure.
    fn abort(&self, error: RefreshError) -> RefreshError {
        lock(&self.state).abort_refresh();
        error
    }
}
