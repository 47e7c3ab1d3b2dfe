//! Authentication backends applied to API requests.
//!
//! The backend is picked once from [`AuthMode`](crate::AuthMode) when the
//! configuration is loaded; the orchestrator only sees the [`AuthBackend`]
//! trait.

use std::fmt;

use serde_json::{Map, Value};

use crate::transport::RequestSpec;

/// Strategy deciding how API requests identify the user.
pub trait AuthBackend: Send + Sync + fmt::Debug {
    /// Stable backend name reported in request preferences.
    fn name(&self) -> &'static str;

    /// Decorates an API request before it is submitted.
    fn authorize(&self, spec: RequestSpec) -> RequestSpec;

    /// Adds backend-specific entries to the `preferences` envelope object.
    fn extend_preferences(&self, preferences: &mut Map<String, Value>) {
        preferences.insert("authMode".into(), Value::from(self.name()));
    }
}

/// No account; requests go out unauthenticated.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineAuth;

impl AuthBackend for OfflineAuth {
    fn name(&self) -> &'static str {
        "offline"
    }

    fn authorize(&self, spec: RequestSpec) -> RequestSpec {
        spec
    }
}

/// Account served by an authlib-injector compatible server.
#[derive(Clone)]
pub struct AuthlibInjectorAuth {
    server: String,
    access_token: Option<String>,
}

impl AuthlibInjectorAuth {
    /// Creates the backend for `server`, optionally carrying a session token.
    pub fn new(server: impl Into<String>, access_token: Option<String>) -> Self {
        Self {
            server: server.into(),
            access_token,
        }
    }

    /// Authentication server root.
    #[must_use]
    pub fn server(&self) -> &str {
        &self.server
    }
}

// Keeps the token out of logs.
impl fmt::Debug for AuthlibInjectorAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthlibInjectorAuth")
            .field("server", &self.server)
            .field("has_token", &self.access_token.is_some())
            .finish()
    }
}

impl AuthBackend for AuthlibInjectorAuth {
    fn name(&self) -> &'static str {
        "authlib_injector"
    }

    fn authorize(&self, spec: RequestSpec) -> RequestSpec {
        match &self.access_token {
            Some(token) => spec.header("Authorization", format!("Bearer {token}")),
            None => spec,
        }
    }

    fn extend_preferences(&self, preferences: &mut Map<String, Value>) {
        preferences.insert("authMode".into(), Value::from(self.name()));
        preferences.insert("authServer".into(), Value::from(self.server.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_leaves_request_untouched() {
        let spec = OfflineAuth.authorize(RequestSpec::get("https://api.example.com/update"));
        assert!(spec.headers().is_empty());

        let mut prefs = Map::new();
        OfflineAuth.extend_preferences(&mut prefs);
        assert_eq!(prefs["authMode"], "offline");
    }

    #[test]
    fn test_authlib_injector_adds_bearer_token() {
        let auth = AuthlibInjectorAuth::new("https://auth.example.com", Some("tok".into()));
        let spec = auth.authorize(RequestSpec::get("https://api.example.com/update"));
        assert_eq!(spec.header_value("authorization"), Some("Bearer tok"));
    }

    #[test]
    fn test_authlib_injector_reports_server_in_preferences() {
        let auth = AuthlibInjectorAuth::new("https://auth.example.com", None);
        let mut prefs = Map::new();
        auth.extend_preferences(&mut prefs);
        assert_eq!(prefs["authMode"], "authlib_injector");
        assert_eq!(prefs["authServer"], "https://auth.example.com");
    }

    #[test]
    fn test_debug_output_hides_token() {
        let auth = AuthlibInjectorAuth::new("https://auth.example.com", Some("secret".into()));
        let rendered = format!("{auth:?}");
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("has_token: true"));
    }
}
