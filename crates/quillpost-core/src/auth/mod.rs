//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `SessionManager`: login, logout, restore, and token refresh
//! - `RefreshCoordinator`: single-flight gate so concurrent callers share one refresh
//! - `CredentialStore`: session persistence, optionally encrypted
//! - `RouteGuard`: access decisions for protected and admin-only views

pub mod cipher;
pub mod coordinator;
pub mod guard;
pub mod manager;
pub mod session;
pub mod store;

pub use cipher::SessionCipher;
pub use coordinator::{RefreshCoordinator, RefreshError};
pub use guard::{GuardDecision, RouteAccess, RouteGuard};
pub use manager::SessionManager;
pub use session::{SessionData, SessionError, SessionState};
pub use store::{CredentialStore, FileStorage, MemoryStorage, StorageBackend};
