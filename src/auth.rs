use base64::Engine;
use std::collections::HashMap;

/// HTTP Basic auth gate for a route. `userpass` maps username to
/// plaintext password, matching the config format the corpus uses for
/// small static credential sets.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct BasicAuthConfig {
    pub realm: String,
    pub userpass: HashMap<String, String>,
}

/// Outcome of checking an inbound request's `Authorization` header
/// against a route's basic-auth config.
pub enum AuthOutcome {
    Allowed,
    Denied { www_authenticate: String },
}

impl BasicAuthConfig {
    /// Check a raw `Authorization` header value (including the `Basic `
    /// prefix) against the configured credentials.
    pub fn check(&self, authorization_header: Option<&str>) -> AuthOutcome {
        if let Some(value) = authorization_header {
            if let Some((username, password)) = decode_basic(value) {
                if let Some(stored) = self.userpass.get(&username) {
                    if stored == &password {
                        return AuthOutcome::Allowed;
                    }
                }
            }
        }
        AuthOutcome::Denied {
            www_authenticate: format!(r#"Basic realm="{}""#, self.realm),
        }
    }
}

fn decode_basic(header_value: &str) -> Option<(String, String)> {
    let encoded = header_value.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some((username.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BasicAuthConfig {
        let mut userpass = HashMap::new();
        userpass.insert("alice".to_string(), "s3cret".to_string());
        BasicAuthConfig {
            realm: "admin".to_string(),
            userpass,
        }
    }

    fn header_for(user: &str, pass: &str) -> String {
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        format!("Basic {encoded}")
    }

    #[test]
    fn correct_credentials_are_allowed() {
        let cfg = config();
        let header = header_for("alice", "s3cret");
        assert!(matches!(cfg.check(Some(&header)), AuthOutcome::Allowed));
    }

    #[test]
    fn wrong_password_is_denied_with_realm() {
        let cfg = config();
        let header = header_for("alice", "wrong");
        match cfg.check(Some(&header)) {
            AuthOutcome::Denied { www_authenticate } => {
                assert_eq!(www_authenticate, r#"Basic realm="admin""#);
            }
            AuthOutcome::Allowed => panic!("expected denial"),
        }
    }

    #[test]
    fn missing_header_is_denied() {
        let cfg = config();
        assert!(matches!(cfg.check(None), AuthOutcome::Denied { .. }));
    }

    #[test]
    fn unknown_user_is_denied() {
        let cfg = config();
        let header = header_for("mallory", "whatever");
        assert!(matches!(cfg.check(Some(&header)), AuthOutcome::Denied { .. }));
    }
}
