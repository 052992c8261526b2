//! HTTP basic-auth credentials.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Username/password pair sent as `Authorization: Basic <base64>`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Renders the `Authorization` header value.
    pub fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }

    /// Checks an `Authorization` header value against these credentials.
    ///
    /// Uses constant-time comparison to prevent timing attacks.
    pub fn verify(&self, header: Option<&str>) -> bool {
        let Some(value) = header else {
            return false;
        };
        constant_time_eq(value.trim().as_bytes(), self.header_value().as_bytes())
    }
}

fn constant_time_eq(received: &[u8], expected: &[u8]) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in received.iter().zip(expected) {
        diff |= a ^ b;
    }
    diff == 0
}
