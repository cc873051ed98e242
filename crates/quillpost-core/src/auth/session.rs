use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::models::TokenResponse;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Access token is empty")]
    EmptyAccessToken,

    #[error("Refresh token is missing")]
    MissingRefreshToken,

    #[error("Invalid session transition: {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub access_token: String,
    pub refresh_token: String,
    /// Epoch seconds after which `access_token` is rejected by the server
    pub expires_at: i64,
    pub user_id: i64,
    pub username: String,
    #[serde(default)]
    pub avatar: Option<String>,
    pub last_login_time: DateTime<Utc>,
}

impl SessionData {
    /// Build a session from a fresh `/login` response.
    pub fn from_login(
        tokens: TokenResponse,
        username: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        if tokens.access_token.is_empty() {
            return Err(SessionError::EmptyAccessToken);
        }
        let refresh_token = tokens
            .refresh_token
            .filter(|t| !t.is_empty())
            .ok_or(SessionError::MissingRefreshToken)?;

        Ok(Self {
            access_token: tokens.access_token,
            refresh_token,
            expires_at: tokens.expires_at,
            user_id: tokens.user_id,
            username: username.to_string(),
            avatar: tokens.avatar,
            last_login_time: now,
        })
    }

    /// Apply a `/token/refresh` response. The refresh token is replaced when the
    /// server rotated it; `last_login_time` is left alone so the absolute
    /// session ceiling keeps counting from the original login.
    pub fn rotate(&mut self, tokens: &TokenResponse) -> Result<(), SessionError> {
        if tokens.access_token.is_empty() {
            return Err(SessionError::EmptyAccessToken);
        }
        self.access_token = tokens.access_token.clone();
        if let Some(ref refresh) = tokens.refresh_token {
            if !refresh.is_empty() {
                self.refresh_token = refresh.clone();
            }
        }
        self.expires_at = tokens.expires_at;
        self.user_id = tokens.user_id;
        if tokens.avatar.is_some() {
            self.avatar = tokens.avatar.clone();
        }
        Ok(())
    }

    pub fn expires_at_time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.expires_at, 0).single()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// True once `now` reaches `expires_at - threshold` (inclusive).
    pub fn needs_refresh_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now.timestamp() >= self.expires_at - threshold.num_seconds()
    }

    pub fn needs_refresh(&self, threshold: Duration) -> bool {
        self.needs_refresh_at(Utc::now(), threshold)
    }

    /// True when the login is older than `max_age`, regardless of token expiry.
    pub fn exceeds_max_age_at(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.last_login_time > max_age
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        ((self.expires_at - Utc::now().timestamp()) / 60).max(0)
    }
}

/// Authentication state of the client.
///
/// `Refreshing` still carries the current session: requests keep using the
/// old token while a refresh is in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Anonymous,
    Authenticated(SessionData),
    Refreshing(SessionData),
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Anonymous => "anonymous",
            SessionState::Authenticated(_) => "authenticated",
            SessionState::Refreshing(_) => "refreshing",
        }
    }

    pub fn session(&self) -> Option<&SessionData> {
        match self {
            SessionState::Anonymous => None,
            SessionState::Authenticated(data) | SessionState::Refreshing(data) => Some(data),
        }
    }

    pub fn access_token(&self) -> Option<&str> {
        self.session().map(|d| d.access_token.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        !matches!(self, SessionState::Anonymous)
    }

    pub fn is_refreshing(&self) -> bool {
        matches!(self, SessionState::Refreshing(_))
    }

    /// Anonymous -> Authenticated (login or restore)
    pub fn authenticate(&mut self, data: SessionData) -> Result<(), SessionError> {
        if data.access_token.is_empty() {
            return Err(SessionError::EmptyAccessToken);
        }
        match self {
            SessionState::Anonymous => {
                *self = SessionState::Authenticated(data);
                Ok(())
            }
            _ => Err(self.invalid("authenticate")),
        }
    }

    /// Authenticated -> Refreshing. Returns the refresh token to spend.
    pub fn begin_refresh(&mut self) -> Result<String, SessionError> {
        match std::mem::take(self) {
            SessionState::Authenticated(data) => {
                let refresh_token = data.refresh_token.clone();
                *self = SessionState::Refreshing(data);
                Ok(refresh_token)
            }
            other => {
                *self = other;
                Err(self.invalid("begin refresh"))
            }
        }
    }

    /// Refreshing -> Authenticated with the rotated tokens.
    pub fn complete_refresh(&mut self, tokens: &TokenResponse) -> Result<&SessionData, SessionError> {
        let rotated = match self {
            SessionState::Refreshing(data) => {
                let mut rotated = data.clone();
                rotated.rotate(tokens)?;
                rotated
            }
            _ => return Err(self.invalid("complete refresh")),
        };
        *self = SessionState::Authenticated(rotated);
        self.session()
            .ok_or_else(|| self.invalid("complete refresh"))
    }

    /// Refreshing -> Authenticated with the old tokens, after a refresh that
    /// failed without the server rejecting the refresh token.
    pub fn abort_refresh(&mut self) {
        if let SessionState::Refreshing(data) = std::mem::take(self) {
            *self = SessionState::Authenticated(data);
        }
    }

    /// Any -> Anonymous. Returns the session that was dropped, if any.
    pub fn sign_out(&mut self) -> Option<SessionData> {
        match std::mem::take(self) {
            SessionState::Anonymous => None,
            SessionState::Authenticated(data) | SessionState::Refreshing(data) => Some(data),
        }
    }

    fn invalid(&self, action: &'static str) -> SessionError {
        SessionError::InvalidTransition {
            action,
            state: self.name(),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
