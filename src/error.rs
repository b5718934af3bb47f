// src/error.rs

use thiserror::Error;

/// The primary error type for the `entra-auth` library.
///
/// Validation failures keep their specific kind all the way to the caller so
/// that the surrounding layer can log the reason while still answering with a
/// uniform "unauthorized" response.
#[derive(Debug, Clone, Error)]
pub enum EntraAuthError {
    /// The token is not a three-part signed JWT, or its header or payload cannot be decoded.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// The algorithm declared in the token header is not one of the accepted asymmetric algorithms.
    #[error("Unsupported JWT algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// No published key matches the token's `kid`, even after refreshing the key set.
    #[error("Key not found for kid: {0}")]
    KeyNotFound(String),

    /// The discovery document or the JWKS could not be fetched or decoded.
    #[error("Identity provider unreachable at {url}: {reason}")]
    ProviderUnreachable { url: String, reason: String },

    /// The token signature does not verify against the resolved key.
    #[error("Invalid token signature")]
    InvalidSignature,

    /// The `exp` claim is in the past.
    #[error("Token has expired")]
    TokenExpired,

    /// The `nbf` claim is in the future.
    #[error("Token is not valid yet")]
    TokenNotYetValid,

    /// The `iss` claim is not one of the accepted issuers.
    #[error("Invalid issuer: {0}")]
    InvalidIssuer(String),

    /// The `aud` claim does not match the configured audience.
    #[error("Invalid audience: {0}")]
    InvalidAudience(String),

    /// A required configuration field is missing.
    #[error("A required configuration field is missing: {0}")]
    MissingConfiguration(String),

    /// A provided URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// A configuration value is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl EntraAuthError {
    pub(crate) fn unreachable(url: impl Into<String>, reason: impl ToString) -> Self {
        EntraAuthError::ProviderUnreachable {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns `true` if retrying the whole validation later might succeed.
    ///
    /// Only provider outages are transient; every other kind is a property of
    /// the token or the configuration.
    pub fn is_transient(&self) -> bool {
        matches!(self, EntraAuthError::ProviderUnreachable { .. })
    }
}

impl From<jsonwebtoken::errors::Error> for EntraAuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidSignature => EntraAuthError::InvalidSignature,
            ErrorKind::ExpiredSignature => EntraAuthError::TokenExpired,
            ErrorKind::ImmatureSignature => EntraAuthError::TokenNotYetValid,
            ErrorKind::InvalidIssuer => {
                EntraAuthError::InvalidIssuer("issuer is not accepted".to_string())
            }
            ErrorKind::InvalidAudience => {
                EntraAuthError::InvalidAudience("audience does not match".to_string())
            }
            ErrorKind::MissingRequiredClaim(claim) => match claim.as_str() {
                "iss" => EntraAuthError::InvalidIssuer("token has no 'iss' claim".to_string()),
                "aud" => EntraAuthError::InvalidAudience("token has no 'aud' claim".to_string()),
                other => {
                    EntraAuthError::MalformedToken(format!("missing required claim '{other}'"))
                }
            },
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                EntraAuthError::UnsupportedAlgorithm(err.to_string())
            }
            _ => EntraAuthError::MalformedToken(err.to_string()),
        }
    }
}
