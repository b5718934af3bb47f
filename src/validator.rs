// src/validator.rs

use crate::client::KeyMaterialCache;
use crate::config::ProviderSettings;
use crate::error::EntraAuthError;
use crate::identity::{IdentityRecord, TokenClaims};
use base64::engine::{general_purpose::URL_SAFE_NO_PAD, Engine};
use jsonwebtoken::{decode, Algorithm, Validation};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

/// The bearer token validator.
///
/// This struct should be created once and shared by all requests. Clones
/// share the same settings and key cache.
#[derive(Clone)]
pub struct Validator {
    settings: Arc<ProviderSettings>,
    keys: KeyMaterialCache,
}

/// The JOSE header fields needed before any key is resolved.
#[derive(Debug, Deserialize)]
struct UnverifiedHeader {
    alg: Option<String>,
    kid: Option<String>,
}

impl UnverifiedHeader {
    /// Decodes the header segment without verifying anything.
    fn parse(token: &str) -> Result<Self, EntraAuthError> {
        if token.is_empty() {
            return Err(EntraAuthError::MalformedToken("token is empty".to_string()));
        }

        // The signature segment may be empty (`alg: none`); that is rejected later, by algorithm.
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 || segments[0].is_empty() || segments[1].is_empty() {
            return Err(EntraAuthError::MalformedToken(
                "expected three dot-separated segments".to_string(),
            ));
        }

        let bytes = URL_SAFE_NO_PAD
            .decode(segments[0])
            .map_err(|e| EntraAuthError::MalformedToken(format!("header is not base64url: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| EntraAuthError::MalformedToken(format!("header is not a JSON object: {e}")))
    }

    /// Returns the declared algorithm if it is one of `allowed`.
    fn algorithm(&self, allowed: &[Algorithm]) -> Result<Algorithm, EntraAuthError> {
        let name = self
            .alg
            .as_deref()
            .ok_or_else(|| EntraAuthError::MalformedToken("header has no 'alg'".to_string()))?;
        Algorithm::from_str(name)
            .ok()
            .filter(|alg| allowed.contains(alg))
            .ok_or_else(|| EntraAuthError::UnsupportedAlgorithm(name.to_string()))
    }
}

impl Validator {
    /// Creates a new `Validator` with its own key cache.
    pub fn new(settings: ProviderSettings) -> Self {
        let settings = Arc::new(settings);
        let keys = KeyMaterialCache::new(settings.clone());
        Self { settings, keys }
    }

    /// Creates a `Validator` over an existing key cache.
    pub fn with_key_cache(settings: Arc<ProviderSettings>, keys: KeyMaterialCache) -> Self {
        Self { settings, keys }
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn key_cache(&self) -> &KeyMaterialCache {
        &self.keys
    }

    /// Validates a bearer token and returns the caller's normalized identity.
    ///
    /// # Errors
    ///
    /// Any failure is terminal for this call and keeps its specific kind; see
    /// [`Validator::validate_claims`].
    #[instrument(skip(self, token), err)]
    pub async fn validate(&self, token: &str) -> Result<IdentityRecord, EntraAuthError> {
        let claims = self.validate_claims(token).await?;
        Ok(IdentityRecord::from(&claims))
    }

    /// Validates a bearer token and returns its verified claim set.
    ///
    /// This method performs, in order:
    /// 1. Header decoding (`MalformedToken`).
    /// 2. Algorithm allow-listing (`UnsupportedAlgorithm`).
    /// 3. Key resolution through the key cache (`KeyNotFound`, `ProviderUnreachable`).
    /// 4. Signature verification (`InvalidSignature`).
    /// 5. `exp`, `nbf`, `iss` and `aud` checks (`TokenExpired`, `TokenNotYetValid`,
    ///    `InvalidIssuer`, `InvalidAudience`).
    pub async fn validate_claims(&self, token: &str) -> Result<TokenClaims, EntraAuthError> {
        // 1. Decode header to get kid and alg without validation.
        let header = UnverifiedHeader::parse(token)?;

        // 2. Check if the algorithm is allowed.
        let alg = header.algorithm(&self.settings.validation.algorithms)?;
        let kid = header
            .kid
            .ok_or_else(|| EntraAuthError::MalformedToken("header has no 'kid'".to_string()))?;
        debug!("Token header: alg={:?}, kid={}", alg, kid);

        // 3. Resolve the signing key.
        let decoding_key = self.keys.get_signing_key(&kid).await?;

        // 4. Construct validation options.
        let mut validation = Validation::new(alg);
        validation.leeway = self.settings.validation.leeway.as_secs();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.set_issuer(&self.settings.accepted_issuers);
        validation.set_audience(&[&self.settings.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        // 5. Verify the signature, then the standard claims. Decode into a generic
        // Value first so that a missing or mistyped claim is reported by the claim
        // checks rather than by deserialization.
        let token_data = decode::<serde_json::Value>(token, &decoding_key, &validation)
            .map_err(|err| self.explain(token, err))?;

        // `exp == now` passes the library check; the token must still be live.
        let exp = token_data.claims.get("exp").and_then(serde_json::Value::as_u64);
        if exp.is_some_and(|exp| has_expired(exp, validation.leeway, now_secs())) {
            return Err(EntraAuthError::TokenExpired);
        }

        // 6. Shape the verified claims.
        let claims: TokenClaims = serde_json::from_value(token_data.claims)
            .map_err(|e| EntraAuthError::MalformedToken(format!("unexpected claim shape: {e}")))?;

        debug!("Token validated for subject {}", claims.sub);
        Ok(claims)
    }

    /// Maps a `jsonwebtoken` failure, adding the offending claim value for issuer and audience.
    fn explain(&self, token: &str, err: jsonwebtoken::errors::Error) -> EntraAuthError {
        match EntraAuthError::from(err) {
            EntraAuthError::InvalidIssuer(reason) => match unverified_claim(token, "iss") {
                Some(iss) => {
                    debug!("Rejected issuer {}; accepted: {:?}", iss, self.settings.accepted_issuers);
                    EntraAuthError::InvalidIssuer(format!("{iss} is not accepted"))
                }
                None => EntraAuthError::InvalidIssuer(reason),
            },
            EntraAuthError::InvalidAudience(reason) => match unverified_claim(token, "aud") {
                Some(aud) => {
                    debug!("Rejected audience {}; expected: {}", aud, self.settings.audience);
                    EntraAuthError::InvalidAudience(format!("{aud} does not match the configured audience"))
                }
                None => EntraAuthError::InvalidAudience(reason),
            },
            other => other,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A token is live only while `now < exp + leeway`.
fn has_expired(exp: u64, leeway: u64, now: u64) -> bool {
    exp.saturating_add(leeway) <= now
}

/// Reads one claim from the payload without verification, for diagnostics only.
fn unverified_claim(token: &str, name: &str) -> Option<serde_json::Value> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get(name).cloned()
}

/// Extracts the token from an `Authorization` header value of the form `Bearer <token>`.
///
/// The scheme is matched case-insensitively.
pub fn extract_bearer(authorization: &str) -> Result<&str, EntraAuthError> {
    let (scheme, token) = authorization
        .trim()
        .split_once(' ')
        .ok_or_else(|| EntraAuthError::MalformedToken("expected 'Bearer <token>'".to_string()))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(EntraAuthError::MalformedToken(format!("unsupported scheme '{scheme}'")));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(EntraAuthError::MalformedToken("bearer token is empty".to_string()));
    }
    Ok(token)
}
