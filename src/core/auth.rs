//! Connection authentication.
//!
//! The session asks an [`Authenticator`] to allow or deny the credentials of a
//! CONNECT frame. When no authenticator is configured, every connection is
//! accepted.

use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub login: Option<String>,
    pub passcode: Option<String>,
}

impl Credentials {
    pub fn new(login: Option<&str>, passcode: Option<&str>) -> Self {
        Self {
            login: login.map(str::to_string),
            passcode: passcode.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow { identity: Option<String> },
    Deny { reason: String },
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allow { .. })
    }
}

/// Trait used by the session to validate CONNECT credentials.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> AuthDecision;
}

/// Accepts a fixed set of login/passcode pairs.
#[derive(Debug, Clone, Default)]
pub struct StaticAuthenticator {
    users: HashMap<String, String>,
}

impl StaticAuthenticator {
    /// Create a new authenticator from an iterator of `(login, passcode)` pairs.
    pub fn from_pairs<I, L, P>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (L, P)>,
        L: Into<String>,
        P: Into<String>,
    {
        let users = pairs
            .into_iter()
            .map(|(l, p)| (l.into(), p.into()))
            .collect();
        Self { users }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for StaticAuthenticator {
    fn authenticate(&self, credentials: &Credentials) -> AuthDecision {
        let (Some(login), Some(passcode)) = (&credentials.login, &credentials.passcode) else {
            return AuthDecision::Deny {
                reason: "login and passcode are required".to_string(),
            };
        };

        match self.users.get(login) {
            Some(expected) if expected == passcode => AuthDecision::Allow {
                identity: Some(login.clone()),
            },
            _ => AuthDecision::Deny {
                reason: "invalid login or passcode".to_string(),
            },
        }
    }
}
