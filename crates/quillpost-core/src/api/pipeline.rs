//! Outbound request pipeline.
//!
//! Every request goes through the same steps:
//! 1. Attach the bearer token of the current session, if any. A token close
//!    to expiry starts a background refresh; the request still goes out
//!    with the token it has.
//! 2. Send, retrying a bounded number of times when no response arrives.
//! 3. On 401, join the single in-flight refresh (or start it) and resubmit
//!    once with the new token. If the refresh fails the session that sent
//!    the request is ended.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reqwest::StatusCode;
use tracing::{debug, warn};

use super::transport::{ApiRequest, ApiResponse, Transport};
use super::ApiError;
use crate::auth::manager::REFRESH_PATH;
use crate::auth::SessionManager;
use crate::config::Config;
use crate::utils::lock;

pub struct RequestPipeline {
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
    retry_count: u32,
    retry_backoff: Duration,
    /// Consecutive no-response failures per request URL
    network_failures: Mutex<HashMap<String, u32>>,
}

impl RequestPipeline {
    pub fn new(transport: Arc<dyn Transport>, session: Arc<SessionManager>, config: &Config) -> Self {
        Self {
            transport,
            session,
            retry_count: config.retry_count,
            retry_backoff: config.retry_backoff(),
            network_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Send a request and return the successful response, or the error the
    /// caller should see.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut request = self.prepare(request)?;
        let response = self.send_with_retry(&request).await?;

        if response.status == StatusCode::UNAUTHORIZED
            && request.retry_on_unauthorized
            && request.path != REFRESH_PATH
        {
            return self.retry_after_refresh(&mut request).await;
        }
        Self::check(response)
    }

    /// Pre-send: attach credentials and kick off a proactive refresh if due.
    fn prepare(&self, mut request: ApiRequest) -> Result<ApiRequest, ApiError> {
        if !self.session.enforce_max_age() {
            return Ok(request);
        }
        let Some(token) = self.session.access_token() else {
            return Ok(request);
        };
        request.set_bearer(&token)?;

        if self.session.needs_proactive_refresh() && !self.session.is_refreshing() {
            debug!(path = %request.path, "Token near expiry, refreshing in background");
            let session = Arc::clone(&self.session);
            tokio::spawn(async move {
                session.refresh().await;
            });
        }
        Ok(request)
    }

    async fn retry_after_refresh(&self, request: &mut ApiRequest) -> Result<ApiResponse, ApiError> {
        let stale = request.bearer_token().map(str::to_string);
        debug!(path = %request.path, "Unauthorized, waiting for token refresh");

        match self.session.refresh_from(stale.as_deref()).await {
            Ok(token) => {
                request.set_bearer(&token)?;
                // Exactly one resubmission; a second 401 is returned as is.
                let response = self.send_with_retry(request).await?;
                Self::check(response)
            }
            Err(e) => {
                if self.session.logout_if_current(stale.as_deref()) {
                    warn!(path = %request.path, error = %e, "Refresh failed after 401, session ended");
                } else {
                    debug!(path = %request.path, error = %e, "Refresh failed after 401 for a session that was replaced");
                }
                Err(ApiError::Unauthorized)
            }
        }
    }

    /// Send, retrying while no response is received, up to `retry_count` retries.
    async fn send_with_retry(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let identity = request.identity();
        loop {
            match self.transport.send(request).await {
                Ok(response) => {
                    self.reset_failures(&identity);
                    return Ok(response);
                }
                Err(e) => {
                    let failures = self.record_failure(&identity);
                    if failures > self.retry_count {
                        self.reset_failures(&identity);
                        warn!(url = %identity, attempts = failures, error = %e, "Giving up after network errors");
                        return Err(ApiError::Network(e.to_string()));
                    }
                    warn!(url = %identity, retry = failures, error = %e, "Network error, retrying");
                    if !self.retry_backoff.is_zero() {
                        tokio::time::sleep(self.retry_backoff.saturating_mul(failures)).await;
                    }
                }
            }
        }
    }

    fn record_failure(&self, identity: &str) -> u32 {
        let mut failures = lock(&self.network_failures);
        let count = failures.entry(identity.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    fn reset_failures(&self, identity: &str) {
        lock(&self.network_failures).remove(identity);
    }

    fn check(response: ApiResponse) -> Result<ApiResponse, ApiError> {
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(ApiError::from_status(response.status, &response.body))
        }
    }
}
