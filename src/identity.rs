// src/identity.rs

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Candidate claims for the user's email, in priority order.
///
/// The first two are only used when their value looks like an email address;
/// Entra ID puts UPNs or bare account names there for some account types.
const EMAIL_SHAPED_CLAIMS: [&str; 2] = ["preferred_username", "upn"];

/// The verified claim set of an Entra ID token.
///
/// Standard claims are typed. Identity claims are kept as raw JSON because
/// their shape varies across token versions and tenant configurations; every
/// other claim lands in `extra`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TokenClaims {
    pub iss: String,
    pub sub: String,
    /// A single audience string or an array of them.
    pub aud: Value,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_username: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upn: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emails: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenClaims {
    fn claim(&self, name: &str) -> Option<&Value> {
        match name {
            "name" => self.name.as_ref(),
            "preferred_username" => self.preferred_username.as_ref(),
            "upn" => self.upn.as_ref(),
            "email" => self.email.as_ref(),
            "emails" => self.emails.as_ref(),
            "groups" => self.groups.as_ref(),
            other => self.extra.get(other),
        }
    }

    /// Resolves the user's email from the candidate claims.
    ///
    /// Order: `preferred_username` and `upn` (each only if email-shaped), then
    /// `email`, then the first entry of `emails`. Returns `None` if nothing matches.
    pub fn resolve_email(&self) -> Option<&str> {
        EMAIL_SHAPED_CLAIMS
            .iter()
            .filter_map(|name| non_empty_str(self.claim(name)))
            .find(|value| looks_like_email(value))
            .or_else(|| non_empty_str(self.email.as_ref()))
            .or_else(|| match &self.emails {
                Some(Value::Array(entries)) => non_empty_str(entries.first()),
                _ => None,
            })
    }

    /// Group identifiers from the `groups` claim, in token order.
    ///
    /// Empty when the claim is absent or not a list. Groups are trusted as issued.
    pub fn group_ids(&self) -> Vec<String> {
        match &self.groups {
            Some(Value::Array(entries)) => entries
                .iter()
                .filter_map(|entry| match entry {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    Value::Bool(b) => Some(b.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// The normalized identity of an authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IdentityRecord {
    /// The token's subject.
    pub id: String,
    /// Display name, or empty.
    pub name: String,
    /// Best-effort email, or empty.
    pub email: String,
    pub groups: Vec<String>,
}

impl From<&TokenClaims> for IdentityRecord {
    fn from(claims: &TokenClaims) -> Self {
        Self {
            id: claims.sub.clone(),
            name: non_empty_str(claims.name.as_ref()).unwrap_or_default().to_string(),
            email: claims.resolve_email().unwrap_or_default().to_string(),
            groups: claims.group_ids(),
        }
    }
}

/// The body returned to an authenticated caller: `{ "user": { ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UserResponse {
    pub user: IdentityRecord,
}

impl From<IdentityRecord> for UserResponse {
    fn from(user: IdentityRecord) -> Self {
        Self { user }
    }
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// A loose shape check: one `@`, a non-empty local part, a dotted domain, no whitespace.
pub(crate) fn looks_like_email(value: &str) -> bool {
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.chars().any(char::is_whitespace)
}
