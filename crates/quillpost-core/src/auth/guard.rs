use std::sync::Arc;

use tracing::{debug, warn};

use super::manager::SessionManager;

/// Login view that unauthenticated visitors are sent to.
pub const LOGIN_ROUTE: &str = "/login";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteAccess {
    #[default]
    Public,
    Authenticated,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    Allow,
    /// Send to the login view; `to` carries the original path as `redirect`.
    RedirectToLogin { to: String },
    /// Logged in, but not the admin user.
    Forbidden,
}

/// Decides whether a view may be entered with the current session.
pub struct RouteGuard {
    session: Arc<SessionManager>,
}

impl RouteGuard {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    pub fn check(&self, path: &str, access: RouteAccess) -> GuardDecision {
        if access == RouteAccess::Public {
            return GuardDecision::Allow;
        }

        if !self.session.is_authenticated() {
            let restored = self.session.restore().unwrap_or_else(|e| {
                warn!(error = %e, "Failed to restore session");
                false
            });
            if !restored {
                debug!(path, "Unauthenticated, redirecting to login");
                return GuardDecision::RedirectToLogin {
                    to: login_redirect(path),
                };
            }
        }

        if access == RouteAccess::Admin && !self.session.is_admin() {
            debug!(path, "Admin route denied");
            return GuardDecision::Forbidden;
        }
        GuardDecision::Allow
    }
}

/// Login URL that returns to `path` after signing in.
pub fn login_redirect(path: &str) -> String {
    format!("{}?redirect={}", LOGIN_ROUTE, urlencoding::encode(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_login_redirect_encodes_path() {
        assert_eq!(login_redirect("/admin"), "/login?redirect=%2Fadmin");
        assert_eq!(
            login_redirect("/article/3?tab=comments"),
            "/login?redirect=%2Farticle%2F3%3Ftab%3Dcomments"
        );
    }
}
