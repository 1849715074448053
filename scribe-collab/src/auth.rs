//! Handshake authentication seam.
//!
//! Token issuance and user accounts live in an external service; the
//! collaboration server only needs "bearer token → user id". The trait is
//! injected so deployments plug in their verifier and tests use a static
//! table.

use std::collections::HashMap;

/// Resolves a bearer token presented at the WebSocket handshake.
pub trait AuthService: Send + Sync {
    /// The user id for a valid token, or `None` to reject the handshake.
    fn authenticate(&self, bearer_token: &str) -> Option<String>;
}

/// Fixed token → user table.
#[derive(Default)]
pub struct StaticTokenAuth {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, user_id: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), user_id.into());
        self
    }

    /// Parse a `token:user,token:user` table (the server binary's env
    /// format). Malformed pairs are skipped with a warning.
    pub fn from_table(table: &str) -> Self {
        let mut auth = Self::new();
        for pair in table.split(',').filter(|p| !p.is_empty()) {
            match pair.split_once(':') {
                Some((token, user)) if !token.is_empty() && !user.is_empty() => {
                    auth.tokens.insert(token.to_string(), user.to_string());
                }
                _ => log::warn!("skipping malformed token entry {pair:?}"),
            }
        }
        auth
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl AuthService for StaticTokenAuth {
    fn authenticate(&self, bearer_token: &str) -> Option<String> {
        self.tokens.get(bearer_token).cloned()
    }
}
