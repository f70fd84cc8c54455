pub mod jwt;

pub use jwt::TokenVerifier;

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

/// Verified caller, built fresh from a token on every request.
///
/// Timestamps are unix seconds as carried in the token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallerIdentity {
    /// Subject (user id). `None` only for anonymous callers on public routes.
    pub subject: Option<String>,
    /// Issuer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Issued at
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<u64>,
    /// Expiration time
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
    /// Roles and scopes
    pub roles: BTreeSet<String>,
    /// Remaining custom claims (e.g. `phone`)
    pub claims: HashMap<String, serde_json::Value>,
}

impl CallerIdentity {
    /// Identity for a request on a public route that carried no token
    pub fn anonymous() -> Self {
        Self {
            subject: None,
            issuer: None,
            issued_at: None,
            expires_at: None,
            roles: BTreeSet::new(),
            claims: HashMap::new(),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.subject.is_none()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}
