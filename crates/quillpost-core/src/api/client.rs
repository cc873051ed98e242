//! API client for the blog REST API.
//!
//! `ApiClient` ties the session manager and request pipeline together and
//! offers typed JSON helpers on top. Resource calls return `anyhow::Result`;
//! the underlying `ApiError` can be recovered with `downcast_ref`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{de::DeserializeOwned, Serialize};

use super::models::{RegisterRequest, RegisterResponse};
use super::pipeline::RequestPipeline;
use super::transport::{ApiRequest, HttpTransport, Transport};
use super::ApiError;
use crate::auth::{CredentialStore, RouteGuard, SessionData, SessionManager};
use crate::config::Config;
use crate::utils::validate::{is_valid_email, is_valid_username};

const REGISTER_PATH: &str = "/register";
const VISITOR_LOGS_PATH: &str = "/admin/visitor-logs";
const VISITOR_STATS_PATH: &str = "/admin/visitor-stats";

/// Clone is cheap - all state is behind `Arc`.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
    pipeline: Arc<RequestPipeline>,
}

impl ApiClient {
    /// Create a client talking HTTP to the configured API, with the
    /// configured session storage.
    pub fn new(config: &Config) -> Result<Self> {
        let transport = HttpTransport::new(&config.api_base_url, config.request_timeout())
            .context("Failed to build HTTP client")?;
        let store = CredentialStore::from_config(config)?;
        Ok(Self::with_transport(config, Arc::new(transport), store))
    }

    pub fn with_transport(config: &Config, transport: Arc<dyn Transport>, store: CredentialStore) -> Self {
        let session = Arc::new(SessionManager::new(Arc::clone(&transport), store, config));
        let pipeline = Arc::new(RequestPipeline::new(
            Arc::clone(&transport),
            Arc::clone(&session),
            config,
        ));
        Self {
            transport,
            session,
            pipeline,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn route_guard(&self) -> RouteGuard {
        RouteGuard::new(Arc::clone(&self.session))
    }

    // ===== Session =====

    pub async fn login(&self, username: &str, password: &str) -> Result<SessionData> {
        self.session.login(username, password).await
    }

    pub fn logout(&self) {
        self.session.logout()
    }

    pub fn restore(&self) -> Result<bool> {
        self.session.restore()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    /// Create an account. Does not log in.
    pub async fn register(&self, username: &str, email: &str, password: &str) -> Result<RegisterResponse> {
        if !is_valid_username(username) {
            bail!("Username must be 3-20 characters without spaces");
        }
        if !is_valid_email(email) {
            bail!("Invalid email address: {}", email);
        }
        if password.is_empty() {
            bail!("Password must not be empty");
        }

        let request = ApiRequest::post(REGISTER_PATH)
            .json(&RegisterRequest {
                username,
                email,
                password,
            })?
            .without_auth_retry();
        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| ApiError::Network(e.to_string()))
            .context("Failed to send registration request")?;

        if !response.status.is_success() {
            return Err(ApiError::from_status(response.status, &response.body).into());
        }
        response.json().context("Failed to parse registration response")
    }

    // ===== Resource requests =====

    async fn send_json<T: DeserializeOwned>(&self, request: ApiRequest) -> Result<T> {
        let path = request.path.clone();
        let response = self.pipeline.execute(request).await?;
        if response.body.trim().is_empty() {
            // Treat empty bodies as JSON null so `()` and `Option<_>` work
            return serde_json::from_str("null")
                .with_context(|| format!("Empty response from {}", path));
        }
        response
            .json()
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(ApiRequest::get(path)).await
    }

    pub async fn get_with_query<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let mut request = ApiRequest::get(path);
        for (key, value) in query {
            request = request.query(key, value);
        }
        self.send_json(request).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T> {
        self.send_json(ApiRequest::post(path).json(body)?).await
    }

    pub async fn put<T: DeserializeOwned, B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<T> {
        self.send_json(ApiRequest::put(path).json(body)?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(ApiRequest::delete(path)).await
    }

    // ===== Admin analytics =====

    fn require_admin(&self) -> Result<()> {
        if !self.session.is_admin() {
            return Err(ApiError::AccessDenied("admin account required".to_string()).into());
        }
        Ok(())
    }

    /// Visitor log entries, filtered by the given query parameters.
    pub async fn fetch_visitor_logs(&self, params: &[(&str, String)]) -> Result<serde_json::Value> {
        self.require_admin()?;
        self.get_with_query(VISITOR_LOGS_PATH, params).await
    }

    /// Aggregated visitor statistics over the last `days` days.
    pub async fn fetch_visitor_stats(&self, days: u32) -> Result<serde_json::Value> {
        self.require_admin()?;
        self.get_with_query(VISITOR_STATS_PATH, &[("days", days.to_string())]).await
    }
}
