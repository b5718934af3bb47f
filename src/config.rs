// src/config.rs

use crate::error::EntraAuthError;
use jsonwebtoken::Algorithm;
use std::time::Duration;
use url::Url;

const AUTHORITY: &str = "https://login.microsoftonline.com";
const V1_ISSUER_HOST: &str = "https://sts.windows.net";

/// Checks applied to a token's time-based claims and header.
#[derive(Clone, Debug)]
pub struct ValidationDetails {
    /// The signing algorithms that are permitted for the token.
    /// Tokens signed with any other algorithm will be rejected.
    pub algorithms: Vec<Algorithm>,
    /// The tolerance for clock skew when validating `exp` and `nbf`.
    /// Defaults to zero.
    pub leeway: Duration,
}

impl Default for ValidationDetails {
    fn default() -> Self {
        Self {
            // Entra ID signs access and ID tokens with RS256.
            algorithms: vec![Algorithm::RS256],
            leeway: Duration::ZERO,
        }
    }
}

/// Immutable provider settings for one Entra ID tenant and application.
///
/// All derived values (issuer, discovery URL, audience, accepted issuers) are
/// computed once by [`ProviderSettingsBuilder::build`] and never recomputed.
#[derive(Clone, Debug)]
pub struct ProviderSettings {
    /// The directory (tenant) identifier.
    pub tenant_id: String,
    /// The application (client) identifier.
    pub client_id: String,
    /// The expected issuer. Defaults to the tenant's v2.0 issuer.
    pub issuer: String,
    /// Where the OpenID configuration document is published.
    pub discovery_url: Url,
    /// Explicit JWKS location. When `None`, it is read from the discovery document.
    pub jwks_url: Option<Url>,
    /// The expected `aud` claim. Defaults to `client_id`.
    pub audience: String,
    /// Every issuer string a token may carry.
    pub accepted_issuers: Vec<String>,
    /// How long a fetched key set is considered fresh when the provider sends no `Cache-Control`.
    pub cache_ttl: Duration,
    /// Upper bound for each discovery or JWKS request.
    pub http_timeout: Duration,
    /// The specific validation parameters to apply to the token.
    pub validation: ValidationDetails,
}

impl ProviderSettings {
    /// Loads settings from the process environment.
    ///
    /// See [`ProviderSettings::from_lookup`] for the variables read.
    pub fn from_env() -> Result<Self, EntraAuthError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads settings through an arbitrary variable lookup.
    ///
    /// `AZURE_AD_TENANT_ID` and `AZURE_AD_CLIENT_ID` are required. The optional
    /// overrides are `AZURE_AD_ISSUER`, `AZURE_AD_OPENID_CONFIG_URL`,
    /// `AZURE_AD_JWKS_URI`, `AZURE_AD_AUDIENCE`, `AZURE_AD_JWKS_CACHE_TTL_SECS`
    /// and `AZURE_AD_HTTP_TIMEOUT_SECS`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, EntraAuthError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let secs = |name: &str| -> Result<Option<Duration>, EntraAuthError> {
            get(name)
                .map(|v| {
                    v.trim()
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|_| EntraAuthError::InvalidConfiguration(format!("{name} must be a whole number of seconds")))
                })
                .transpose()
        };

        let mut builder = ProviderSettingsBuilder::new();
        if let Some(tenant_id) = get("AZURE_AD_TENANT_ID") {
            builder = builder.tenant_id(tenant_id);
        }
        if let Some(client_id) = get("AZURE_AD_CLIENT_ID") {
            builder = builder.client_id(client_id);
        }
        if let Some(issuer) = get("AZURE_AD_ISSUER") {
            builder = builder.issuer(issuer);
        }
        if let Some(url) = get("AZURE_AD_OPENID_CONFIG_URL") {
            builder = builder.discovery_url(&url)?;
        }
        if let Some(url) = get("AZURE_AD_JWKS_URI") {
            builder = builder.jwks_url(&url)?;
        }
        if let Some(audience) = get("AZURE_AD_AUDIENCE") {
            builder = builder.audience(audience);
        }
        if let Some(ttl) = secs("AZURE_AD_JWKS_CACHE_TTL_SECS")? {
            builder = builder.cache_ttl(ttl);
        }
        if let Some(timeout) = secs("AZURE_AD_HTTP_TIMEOUT_SECS")? {
            builder = builder.http_timeout(timeout);
        }
        builder.build()
    }

    /// Returns `true` if `iss` is one of the accepted issuers (exact match).
    pub fn accepts_issuer(&self, iss: &str) -> bool {
        self.accepted_issuers.iter().any(|accepted| accepted == iss)
    }
}

/// A builder for creating a `ProviderSettings` instance.
#[derive(Default)]
pub struct ProviderSettingsBuilder {
    tenant_id: Option<String>,
    client_id: Option<String>,
    issuer: Option<String>,
    discovery_url: Option<Url>,
    jwks_url: Option<Url>,
    audience: Option<String>,
    cache_ttl: Option<Duration>,
    http_timeout: Option<Duration>,
    validation: ValidationDetails,
}

impl ProviderSettingsBuilder {
    /// Creates a new `ProviderSettingsBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the tenant ID. This is a required field.
    pub fn tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Sets the application (client) ID. This is a required field.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Overrides the expected issuer. When set, only this exact issuer is accepted.
    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    /// Overrides where the OpenID configuration document is fetched from.
    pub fn discovery_url(mut self, url: &str) -> Result<Self, EntraAuthError> {
        let parsed_url = Url::parse(url).map_err(|e| EntraAuthError::InvalidUrl(e.to_string()))?;
        self.discovery_url = Some(parsed_url);
        Ok(self)
    }

    /// Sets an explicit JWKS URL, bypassing discovery.
    pub fn jwks_url(mut self, url: &str) -> Result<Self, EntraAuthError> {
        let parsed_url = Url::parse(url).map_err(|e| EntraAuthError::InvalidUrl(e.to_string()))?;
        self.jwks_url = Some(parsed_url);
        Ok(self)
    }

    /// Overrides the expected audience (e.g. an `api://` application ID URI).
    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Sets the fallback freshness window for the key set. Defaults to 24 hours.
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Sets the per-request timeout for provider calls. Defaults to 5 seconds.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    /// Sets the allowed signing algorithms. Only RSA-family algorithms are accepted.
    pub fn algorithms(mut self, algorithms: Vec<Algorithm>) -> Self {
        self.validation.algorithms = algorithms;
        self
    }

    /// Sets the clock skew tolerance. Defaults to zero.
    pub fn leeway(mut self, leeway: Duration) -> Self {
        self.validation.leeway = leeway;
        self
    }

    /// Consumes the builder and returns a `ProviderSettings` object.
    ///
    /// # Errors
    ///
    /// Returns an error if `tenant_id` or `client_id` is missing, if a derived
    /// URL cannot be parsed, or if a non-RSA algorithm was configured.
    pub fn build(self) -> Result<ProviderSettings, EntraAuthError> {
        let tenant_id = self
            .tenant_id
            .ok_or(EntraAuthError::MissingConfiguration("tenant_id".to_string()))?;
        let client_id = self
            .client_id
            .ok_or(EntraAuthError::MissingConfiguration("client_id".to_string()))?;

        if self.validation.algorithms.is_empty() {
            return Err(EntraAuthError::InvalidConfiguration(
                "at least one signing algorithm must be allowed".to_string(),
            ));
        }
        if let Some(alg) = self.validation.algorithms.iter().find(|alg| !is_rsa(**alg)) {
            return Err(EntraAuthError::InvalidConfiguration(format!(
                "{alg:?} is not an RSA signing algorithm"
            )));
        }

        let v2_issuer = format!("{AUTHORITY}/{tenant_id}/v2.0");
        let (issuer, accepted_issuers) = match self.issuer {
            Some(issuer) => (issuer.clone(), vec![issuer]),
            None => (
                v2_issuer.clone(),
                vec![v2_issuer.clone(), format!("{V1_ISSUER_HOST}/{tenant_id}/")],
            ),
        };

        let discovery_url = match self.discovery_url {
            Some(url) => url,
            None => Url::parse(&format!("{v2_issuer}/.well-known/openid-configuration"))
                .map_err(|e| EntraAuthError::InvalidUrl(e.to_string()))?,
        };

        Ok(ProviderSettings {
            audience: self.audience.unwrap_or_else(|| client_id.clone()),
            tenant_id,
            client_id,
            issuer,
            discovery_url,
            jwks_url: self.jwks_url,
            accepted_issuers,
            cache_ttl: self.cache_ttl.unwrap_or_else(|| Duration::from_secs(24 * 60 * 60)),
            http_timeout: self.http_timeout.unwrap_or_else(|| Duration::from_secs(5)),
            validation: self.validation,
        })
    }
}

pub(crate) fn is_rsa(alg: Algorithm) -> bool {
    matches!(
        alg,
        Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512
    )
}
