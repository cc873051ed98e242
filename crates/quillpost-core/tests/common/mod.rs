//! In-memory stand-in for the blog API used by the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use quillpost_core::api::{ApiRequest, ApiResponse, Transport, TransportError};
use quillpost_core::auth::{CredentialStore, MemoryStorage};
use quillpost_core::{ApiClient, Config};
use reqwest::StatusCode;
use serde_json::json;

pub const PASSWORD: &str = "secret";

#[derive(Default)]
struct Tokens {
    generation: u32,
    valid_access: HashSet<String>,
    refresh: String,
}

pub struct FakeServer {
    tokens: Mutex<Tokens>,
    /// Lifetime of issued access tokens, in seconds
    pub token_ttl: AtomicI64,
    pub refresh_delay: Mutex<Duration>,
    /// When set, `/token/refresh` answers with this status
    pub refresh_status: Mutex<Option<StatusCode>>,
    /// Number of upcoming sends that fail without a response
    pub offline_for: AtomicU32,
    pub login_calls: AtomicUsize,
    pub refresh_calls: AtomicUsize,
    pub sends: AtomicUsize,
    pub seen: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tokens: Mutex::new(Tokens::default()),
            token_ttl: AtomicI64::new(3600),
            refresh_delay: Mutex::new(Duration::from_millis(50)),
            refresh_status: Mutex::new(None),
            offline_for: AtomicU32::new(0),
            login_calls: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            sends: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    /// Invalidate every access token issued so far (refresh token stays valid).
    pub fn expire_access_tokens(&self) {
        self.tokens.lock().unwrap().valid_access.clear();
    }

    pub fn set_refresh_status(&self, status: StatusCode) {
        *self.refresh_status.lock().unwrap() = Some(status);
    }

    pub fn go_offline(&self, sends: u32) {
        self.offline_for.store(sends, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn requests_to(&self, path: &str) -> usize {
        self.seen.lock().unwrap().iter().filter(|(p, _)| p == path).count()
    }

    fn issue(&self) -> serde_json::Value {
        let mut tokens = self.tokens.lock().unwrap();
        tokens.generation += 1;
        let access = format!("access-{}", tokens.generation);
        tokens.refresh = format!("refresh-{}", tokens.generation);
        tokens.valid_access.insert(access.clone());
        json!({
            "access_token": access,
            "refresh_token": tokens.refresh,
            "token_type": "bearer",
            "expires_at": Utc::now().timestamp() + self.token_ttl.load(Ordering::SeqCst),
            "userId": 1,
        })
    }

    fn reply(status: StatusCode, body: serde_json::Value) -> ApiResponse {
        ApiResponse::new(status, body.to_string())
    }

    async fn handle(&self, request: &ApiRequest) -> ApiResponse {
        let body = request.body.clone().unwrap_or_default();
        match request.path.as_str() {
            "/login" => {
                self.login_calls.fetch_add(1, Ordering::SeqCst);
                if body["password"] == PASSWORD {
                    Self::reply(StatusCode::OK, self.issue())
                } else {
                    Self::reply(StatusCode::UNAUTHORIZED, json!({"detail": "bad credentials"}))
                }
            }
            "/register" => Self::reply(StatusCode::OK, json!({"message": "user created"})),
            "/token/refresh" => {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
                let delay = *self.refresh_delay.lock().unwrap();
                tokio::time::sleep(delay).await;

                let forced = *self.refresh_status.lock().unwrap();
                if let Some(status) = forced {
                    return Self::reply(status, json!({"detail": "forced"}));
                }
                let presented = body["refresh_token"].as_str().unwrap_or_default().to_string();
                if presented != self.tokens.lock().unwrap().refresh {
                    return Self::reply(StatusCode::UNAUTHORIZED, json!({"detail": "invalid refresh token"}));
                }
                Self::reply(StatusCode::OK, self.issue())
            }
            path => {
                let bearer = request.bearer_token().map(str::to_string);
                let authorized = bearer
                    .as_ref()
                    .map(|t| self.tokens.lock().unwrap().valid_access.contains(t))
                    .unwrap_or(false);

                if path == "/public" {
                    return Self::reply(StatusCode::OK, json!({"path": path}));
                }
                if path == "/always-401" || !authorized {
                    return Self::reply(StatusCode::UNAUTHORIZED, json!({"detail": "token expired"}));
                }
                if let Some(code) = path.strip_prefix("/status/") {
                    let status = StatusCode::from_u16(code.parse().unwrap()).unwrap();
                    return Self::reply(status, json!({"detail": "as requested"}));
                }
                Self::reply(StatusCode::OK, json!({"path": path, "token": bearer}))
            }
        }
    }
}

#[async_trait]
impl Transport for FakeServer {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        let offline = self
            .offline_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if offline {
            return Err(TransportError("connection refused".to_string()));
        }

        self.seen
            .lock()
            .unwrap()
            .push((request.path.clone(), request.bearer_token().map(str::to_string)));
        Ok(self.handle(request).await)
    }
}

pub fn test_config() -> Config {
    Config {
        retry_backoff_ms: 0,
        encryption_enabled: false,
        ..Config::default()
    }
}

pub fn client(server: &Arc<FakeServer>) -> ApiClient {
    let store = CredentialStore::new(Box::new(MemoryStorage::new()), None);
    ApiClient::with_transport(&test_config(), server.clone(), store)
}
