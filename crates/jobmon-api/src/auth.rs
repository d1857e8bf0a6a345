// Request identity resolution.
//
// When auth is enabled every request must carry an identity header and
// destructive endpoints additionally check ownership. When disabled an
// anonymous identity is synthesized and nothing is gated.

use axum::extract::Request;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use jobmon_core::config::AuthConfig;
use jobmon_core::JobmonError;

use crate::error::ApiError;

pub const IDENTITY_HEADER: &str = "x-jobmon-user";
pub const ANONYMOUS: &str = "anonymous";

/// The identity resolved for a request, stored in request extensions.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_name: String,
    pub is_admin: bool,
}

impl Identity {
    /// Ownership guard for destructive endpoints: the workflow's recorded
    /// user, an admin, or anyone at all when auth is disabled (anonymous
    /// identities are only minted in that mode).
    pub fn authorize_owner(&self, owner: &str) -> Result<(), ApiError> {
        if self.user_name == ANONYMOUS || self.is_admin || self.user_name == owner {
            Ok(())
        } else {
            Err(ApiError(JobmonError::AuthorizationDenied(format!(
                "{} does not own this workflow (owner: {})",
                self.user_name, owner
            ))))
        }
    }
}

fn resolve(headers: &HeaderMap, config: &AuthConfig) -> Result<Identity, ApiError> {
    let header = headers
        .get(IDENTITY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match header {
        Some(user) => Ok(Identity {
            user_name: user.to_string(),
            is_admin: config.admin_group.iter().any(|a| a == user),
        }),
        None if config.enabled => Err(ApiError(JobmonError::Unauthenticated)),
        None => Ok(Identity {
            user_name: ANONYMOUS.to_string(),
            is_admin: false,
        }),
    }
}

/// Middleware: resolve the identity once and stash it for handlers.
pub async fn identity_middleware(
    axum::extract::State(config): axum::extract::State<std::sync::Arc<AuthConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let identity = resolve(request.headers(), &config)?;
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(user: Option<&str>) -> HeaderMap {
        let mut h = HeaderMap::new();
        if let Some(u) = user {
            h.insert(IDENTITY_HEADER, HeaderValue::from_str(u).unwrap());
        }
        h
    }

    fn config(enabled: bool, admins: &[&str]) -> AuthConfig {
        AuthConfig {
            enabled,
            admin_group: admins.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn enabled_auth_requires_identity() {
        let err = resolve(&headers(None), &config(true, &[])).unwrap_err();
        assert_eq!(err.0.kind_str(), "unauthenticated");
    }

    #[test]
    fn disabled_auth_synthesizes_anonymous() {
        let identity = resolve(&headers(None), &config(false, &[])).unwrap();
        assert_eq!(identity.user_name, ANONYMOUS);
        assert!(identity.authorize_owner("someone-else").is_ok());
    }

    #[test]
    fn admin_group_membership_is_resolved() {
        let identity = resolve(&headers(Some("ops")), &config(true, &["ops"])).unwrap();
        assert!(identity.is_admin);
        assert!(identity.authorize_owner("someone-else").is_ok());
    }

    #[test]
    fn owner_check_rejects_strangers() {
        let identity = resolve(&headers(Some("alice")), &config(true, &[])).unwrap();
        assert!(identity.authorize_owner("alice").is_ok());
        let err = identity.authorize_owner("bob").unwrap_err();
        assert_eq!(err.0.kind_str(), "authorization_denied");
    }
}
