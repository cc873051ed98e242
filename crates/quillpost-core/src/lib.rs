//! quillpost-core - client-side session handling for the blog REST API.
//!
//! Logs in, keeps the bearer token fresh, retries requests that failed on
//! an expired token, and persists the session between runs.

pub mod api;
pub mod auth;
pub mod config;
pub mod utils;

pub use api::{ApiClient, ApiError};
pub use auth::{GuardDecision, RouteAccess, SessionData, SessionManager};
pub use config::{Config, Persistence};
