mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use quillpost_core::auth::{CredentialStore, FileStorage, SessionCipher};
use quillpost_core::{ApiClient, ApiError, GuardDecision, RouteAccess, SessionData};

use common::{client, test_config, FakeServer, PASSWORD};

fn durable_client(server: &Arc<FakeServer>, dir: &std::path::Path) -> ApiClient {
    let store = CredentialStore::new(
        Box::new(FileStorage::new(dir.to_path_buf())),
        Some(SessionCipher::from_passphrase("test passphrase").unwrap()),
    );
    ApiClient::with_transport(&test_config(), server.clone(), store)
}

#[tokio::test]
async fn test_login_persists_authenticated_session() {
    let server = FakeServer::new();
    let dir = tempfile::tempdir().unwrap();
    let client = durable_client(&server, dir.path());

    let session = client.login("noah", PASSWORD).await.unwrap();

    assert!(!session.access_token.is_empty());
    assert!(session.expires_at > Utc::now().timestamp());
    assert_eq!(session.username, "noah");
    assert!(client.is_authenticated());

    // A second client over the same storage sees the same session
    let other = durable_client(&server, dir.path());
    assert!(!other.is_authenticated());
    assert!(other.restore().unwrap());
    assert_eq!(other.session().current(), Some(session));
}

#[tokio::test]
async fn test_login_with_bad_password() {
    let server = FakeServer::new();
    let client = client(&server);

    let err = client.login("noah", "wrong").await.unwrap_err();
    assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::Unauthorized)));
    assert!(!client.is_authenticated());
}

#[tokio::test]
async fn test_restore_is_idempotent() {
    let server = FakeServer::new();
    let dir = tempfile::tempdir().unwrap();
    durable_client(&server, dir.path())
        .login("noah", PASSWORD)
        .await
        .unwrap();

    let client = durable_client(&server, dir.path());
    assert!(client.restore().unwrap());
    let first = client.session().current();
    assert!(client.restore().unwrap());
    assert_eq!(client.session().current(), first);
    assert!(first.is_some());
}

#[tokio::test]
async fn test_restore_rejects_session_past_max_age() {
    let server = FakeServer::new();
    let dir = tempfile::tempdir().unwrap();

    let stale = SessionData {
        access_token: "structurally-fine".to_string(),
        refresh_token: "refresh".to_string(),
        expires_at: Utc::now().timestamp() + 3600,
        user_id: 1,
        username: "noah".to_string(),
        avatar: None,
        last_login_time: Utc::now() - Duration::days(8),
    };
    CredentialStore::new(
        Box::new(FileStorage::new(dir.path().to_path_buf())),
        Some(SessionCipher::from_passphrase("test passphrase").unwrap()),
    )
    .save(&stale)
    .unwrap();

    let client = durable_client(&server, dir.path());
    assert!(!client.restore().unwrap());
    assert!(!client.is_authenticated());
    assert!(!dir.path().join("session.dat").exists());
    // Restore never contacts the server
    assert_eq!(server.sends.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_logout_clears_memory_and_storage() {
    let server = FakeServer::new();
    let dir = tempfile::tempdir().unwrap();
    let client = durable_client(&server, dir.path());
    client.login("noah", PASSWORD).await.unwrap();
    let sends_before = server.sends.load(std::sync::atomic::Ordering::SeqCst);

    client.logout();

    assert!(!client.is_authenticated());
    assert!(client.session().current().is_none());
    assert!(!client.restore().unwrap());
    // Logout is local only
    assert_eq!(server.sends.load(std::sync::atomic::Ordering::SeqCst), sends_before);
}

#[tokio::test]
async fn test_login_replaces_existing_session() {
    let server = FakeServer::new();
    let client = client(&server);
    let first = client.login("noah", PASSWORD).await.unwrap();
    let second = client.login("noah", PASSWORD).await.unwrap();

    assert_ne!(first.access_token, second.access_token);
    assert_eq!(client.session().access_token(), Some(second.access_token));
}

#[tokio::test]
async fn test_register_validates_and_sends() {
    let server = FakeServer::new();
    let client = client(&server);

    assert!(client.register("noah", "not-an-email", "pw").await.is_err());
    assert_eq!(server.sends.load(std::sync::atomic::Ordering::SeqCst), 0);

    let response = client.register("noah", "noah@example.com", "pw").await.unwrap();
    assert_eq!(response.message, "user created");
    assert!(!client.is_authenticated());
}

#[tokio::test]
async fn test_route_guard_decisions() {
    let server = FakeServer::new();
    let client = client(&server);
    let guard = client.route_guard();

    assert_eq!(guard.check("/", RouteAccess::Public), GuardDecision::Allow);
    assert_eq!(
        guard.check("/admin/stats", RouteAccess::Admin),
        GuardDecision::RedirectToLogin {
            to: "/login?redirect=%2Fadmin%2Fstats".to_string()
        }
    );

    // The fake server issues tokens for user 1, the admin
    client.login("noah", PASSWORD).await.unwrap();
    assert_eq!(guard.check("/drafts", RouteAccess::Authenticated), GuardDecision::Allow);
    assert_eq!(guard.check("/admin/stats", RouteAccess::Admin), GuardDecision::Allow);
}

#[tokio::test]
async fn test_route_guard_forbids_non_admin() {
    let server = FakeServer::new();
    let config = quillpost_core::Config {
        admin_user_id: 99,
        ..test_config()
    };
    let store = CredentialStore::new(Box::new(quillpost_core::auth::MemoryStorage::new()), None);
    let client = ApiClient::with_transport(&config, server.clone(), store);
    client.login("noah", PASSWORD).await.unwrap();

    let guard = client.route_guard();
    assert_eq!(guard.check("/drafts", RouteAccess::Authenticated), GuardDecision::Allow);
    assert_eq!(guard.check("/admin", RouteAccess::Admin), GuardDecision::Forbidden);

    let err = client.fetch_visitor_stats(7).await.unwrap_err();
    assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::AccessDenied(_))));
}
