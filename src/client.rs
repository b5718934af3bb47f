// src/client.rs

use crate::config::{is_rsa, ProviderSettings};
use crate::error::EntraAuthError;
use crate::model::{JsonWebKeySet, OidcDiscoveryDocument};
use jsonwebtoken::{Algorithm, DecodingKey};
use moka::future::Cache;
use reqwest::header::{HeaderMap, CACHE_CONTROL};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use url::Url;

/// A snapshot of the provider's published signing keys.
///
/// A `KeySet` is never mutated after construction; a refresh builds a new one
/// and swaps it in, so readers always see a complete map.
pub struct KeySet {
    keys: HashMap<String, Arc<DecodingKey>>,
    fetched_at: Option<Instant>,
    ttl: Duration,
}

impl KeySet {
    fn empty() -> Self {
        Self {
            keys: HashMap::new(),
            fetched_at: None,
            ttl: Duration::ZERO,
        }
    }

    /// Returns `true` if the set was fetched and is younger than its TTL.
    pub fn is_fresh(&self) -> bool {
        self.fetched_at
            .is_some_and(|fetched_at| fetched_at.elapsed() < self.ttl)
    }

    /// Looks up the key published under `kid`.
    pub fn get(&self, kid: &str) -> Option<Arc<DecodingKey>> {
        self.keys.get(kid).cloned()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl std::fmt::Debug for KeySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySet")
            .field("keys_count", &self.keys.len())
            .field("fetched_at", &self.fetched_at)
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Fetches and caches the identity provider's signing keys.
///
/// Cloning is cheap and all clones share one key set. Refreshes are
/// serialized: concurrent callers that miss at the same time wait for the
/// in-flight refresh and reuse its outcome, including a failure.
#[derive(Clone)]
pub struct KeyMaterialCache {
    // The client is internally ref-counted to allow for cheap cloning.
    inner: Arc<Inner>,
}

struct Inner {
    settings: Arc<ProviderSettings>,
    http_client: reqwest::Client,
    current: RwLock<Arc<KeySet>>,
    // Completed refresh attempts, successful or not. Only written under `last_refresh`.
    refresh_attempts: AtomicU64,
    // Outcome of the latest refresh attempt; also serializes refreshes.
    last_refresh: Mutex<Result<(), EntraAuthError>>,
    // Discovery URL -> parsed document, so a key rotation only re-fetches the JWKS.
    discovery_cache: Cache<String, Arc<OidcDiscoveryDocument>>,
}

impl KeyMaterialCache {
    /// Creates an empty cache. Nothing is fetched until the first lookup.
    pub fn new(settings: Arc<ProviderSettings>) -> Self {
        let http_client = match reqwest::Client::builder().timeout(settings.http_timeout).build() {
            Ok(client) => client,
            Err(e) => {
                warn!("Failed to build HTTP client with timeout, using defaults: {}", e);
                reqwest::Client::new()
            }
        };
        Self::with_http_client(settings, http_client)
    }

    /// Creates an empty cache that uses the given HTTP client.
    ///
    /// The configured `http_timeout` is enforced on every request regardless
    /// of the client's own timeout settings.
    pub fn with_http_client(settings: Arc<ProviderSettings>, http_client: reqwest::Client) -> Self {
        let discovery_cache = Cache::builder()
            .max_capacity(4)
            .time_to_live(settings.cache_ttl)
            .build();

        Self {
            inner: Arc::new(Inner {
                settings,
                http_client,
                current: RwLock::new(Arc::new(KeySet::empty())),
                refresh_attempts: AtomicU64::new(0),
                last_refresh: Mutex::new(Ok(())),
                discovery_cache,
            }),
        }
    }

    /// Returns the public key published under `kid`.
    ///
    /// The key set is refreshed first if it is empty, stale, or does not
    /// contain `kid`. At most one refresh is attempted per call.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` if `kid` is still unknown after the refresh, and
    /// `ProviderUnreachable` if the discovery document or JWKS cannot be fetched.
    #[instrument(skip(self), err)]
    pub async fn get_signing_key(&self, kid: &str) -> Result<Arc<DecodingKey>, EntraAuthError> {
        // Read the attempt counter before the snapshot, so the snapshot is never older than it.
        let attempts_seen = self.inner.refresh_attempts.load(Ordering::Acquire);
        let snapshot = self.snapshot().await;
        if snapshot.is_fresh() {
            if let Some(key) = snapshot.get(kid) {
                debug!("JWK cache hit for kid: {}", kid);
                return Ok(key);
            }
            debug!("JWK cache miss for kid: {}. Refreshing key set.", kid);
        } else {
            debug!("Key set is empty or stale. Refreshing before looking up kid: {}", kid);
        }

        let mut last_refresh = self.inner.last_refresh.lock().await;

        // Another caller finished a refresh attempt while we waited for the guard;
        // its outcome, success or failure, counts as ours.
        if self.inner.refresh_attempts.load(Ordering::Acquire) != attempts_seen {
            debug!("Reusing the outcome of a concurrent refresh");
            last_refresh.clone()?;
            return self
                .snapshot()
                .await
                .get(kid)
                .ok_or_else(|| EntraAuthError::KeyNotFound(kid.to_string()));
        }

        let outcome = self.refresh().await;
        *last_refresh = outcome.as_ref().map(|_| ()).map_err(Clone::clone);
        self.inner.refresh_attempts.fetch_add(1, Ordering::Release);

        outcome?
            .get(kid)
            .ok_or_else(|| EntraAuthError::KeyNotFound(kid.to_string()))
    }

    /// Drops the current key set and discovery document; the next lookup refetches.
    pub async fn invalidate(&self) {
        *self.inner.current.write().await = Arc::new(KeySet::empty());
        self.inner.discovery_cache.invalidate_all();
    }

    /// The key identifiers in the current key set, sorted.
    pub async fn key_ids(&self) -> Vec<String> {
        let mut kids: Vec<String> = self.snapshot().await.keys.keys().cloned().collect();
        kids.sort();
        kids
    }

    /// When the current key set was fetched, or `None` before the first refresh.
    pub async fn fetched_at(&self) -> Option<Instant> {
        self.snapshot().await.fetched_at
    }

    async fn snapshot(&self) -> Arc<KeySet> {
        self.inner.current.read().await.clone()
    }

    /// Fetches the JWKS and swaps it in as the current key set.
    #[instrument(skip(self), err)]
    async fn refresh(&self) -> Result<Arc<KeySet>, EntraAuthError> {
        let jwks_url = self.jwks_url().await?;

        let (jwks, max_age) = self.fetch_json::<JsonWebKeySet>(&jwks_url).await?;
        let ttl = max_age.unwrap_or(self.inner.settings.cache_ttl);
        let keys = decode_keys(jwks);

        info!("Successfully fetched {} keys. Caching with TTL: {:?}", keys.len(), ttl);

        let key_set = Arc::new(KeySet {
            keys,
            fetched_at: Some(Instant::now()),
            ttl,
        });
        *self.inner.current.write().await = key_set.clone();
        Ok(key_set)
    }

    /// Determines the JWKS URL, either from the settings or from discovery.
    async fn jwks_url(&self) -> Result<Url, EntraAuthError> {
        if let Some(url) = &self.inner.settings.jwks_url {
            debug!("Using JWKS URL from settings: {}", url);
            return Ok(url.clone());
        }

        let discovery_url = &self.inner.settings.discovery_url;
        let document = match self.inner.discovery_cache.get(discovery_url.as_str()).await {
            Some(document) => document,
            None => {
                debug!("Performing OIDC discovery at: {}", discovery_url);
                let (document, _) = self.fetch_json::<OidcDiscoveryDocument>(discovery_url).await?;
                let document = Arc::new(document);
                self.inner
                    .discovery_cache
                    .insert(discovery_url.to_string(), document.clone())
                    .await;
                document
            }
        };

        if let Some(issuer) = document.issuer.as_deref() {
            if !self.inner.settings.accepts_issuer(issuer) {
                warn!(
                    "Discovery document issuer {} is not among the accepted issuers {:?}",
                    issuer, self.inner.settings.accepted_issuers
                );
            }
        }

        let jwks_url = Url::parse(&document.jwks_uri).map_err(|e| {
            EntraAuthError::unreachable(discovery_url.as_str(), format!("invalid jwks_uri: {e}"))
        })?;
        debug!("Discovered JWKS URL: {}", jwks_url);
        Ok(jwks_url)
    }

    /// GETs `url` and decodes the JSON body, bounded by the configured timeout.
    /// Also returns the `Cache-Control: max-age` of the response, if any.
    async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &Url,
    ) -> Result<(T, Option<Duration>), EntraAuthError> {
        let timeout = self.inner.settings.http_timeout;
        let fetch = async {
            let response = self
                .inner
                .http_client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| EntraAuthError::unreachable(url.as_str(), e))?;

            let status = response.status();
            if !status.is_success() {
                return Err(EntraAuthError::unreachable(url.as_str(), format!("unexpected status {status}")));
            }

            let max_age = parse_cache_control(response.headers());
            let body = response
                .json::<T>()
                .await
                .map_err(|e| EntraAuthError::unreachable(url.as_str(), e))?;
            Ok::<_, EntraAuthError>((body, max_age))
        };

        tokio::time::timeout(timeout, fetch).await.map_err(|_| {
            EntraAuthError::unreachable(url.as_str(), format!("no response within {timeout:?}"))
        })?
    }
}

/// Turns the usable RSA signing keys of a JWKS into decoding keys.
fn decode_keys(jwks: JsonWebKeySet) -> HashMap<String, Arc<DecodingKey>> {
    let mut keys = HashMap::new();
    for jwk in jwks.keys {
        if jwk.kty.as_deref() != Some("RSA") || jwk.use_purpose.as_deref() == Some("enc") {
            warn!("Skipping non-signing or non-RSA JWK: {:?}", jwk.kid);
            continue;
        }
        if let Some(alg) = jwk.alg.as_deref() {
            if !Algorithm::from_str(alg).is_ok_and(is_rsa) {
                warn!("Skipping JWK {:?} declared for algorithm {}", jwk.kid, alg);
                continue;
            }
        }
        let (Some(kid), Some(n), Some(e)) = (jwk.kid, jwk.n.as_deref(), jwk.e.as_deref()) else {
            warn!("Skipping RSA JWK without kid, n or e");
            continue;
        };
        match DecodingKey::from_rsa_components(n, e) {
            Ok(key) => {
                keys.insert(kid, Arc::new(key));
            }
            Err(err) => warn!("Failed to parse JWK {}: {}", kid, err),
        }
    }
    keys
}

/// Parses the `Cache-Control` header to determine the TTL.
fn parse_cache_control(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(CACHE_CONTROL)?
        .to_str()
        .ok()?
        .split(',')
        .find_map(|part| {
            part.trim()
                .strip_prefix("max-age=")?
                .parse::<u64>()
                .ok()
                .map(Duration::from_secs)
        })
}
