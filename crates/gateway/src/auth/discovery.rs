//! Discovery-backed signed tokens.
//!
//! The verification key is selected by the token's `kid` header from a JWKS
//! document fetched over HTTPS. The key set is cached in-process for one
//! hour, keyed by URL. Every failure — missing header, unknown kid, fetch
//! error, bad signature — resolves to "no caller".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::DecodingKey;
use parking_lot::RwLock;
use serde_json::Value;

use tg_domain::config::TokenAuthConfig;
use tg_domain::{CallerContext, Error, Result};

use super::token::{build_validation, context_from_claims};

/// How long a fetched key set stays fresh.
const JWKS_TTL: Duration = Duration::from_secs(3600);

/// Appended to the issuer URL when no explicit JWKS endpoint is configured.
const WELL_KNOWN_SUFFIX: &str = "/.well-known/jwks.json";

struct CachedJwks {
    keys: Arc<JwkSet>,
    fetched_at: Instant,
}

pub struct DiscoveryVerifier {
    jwks_url: String,
    settings: TokenAuthConfig,
    client: reqwest::Client,
    cache: RwLock<HashMap<String, CachedJwks>>,
}

impl DiscoveryVerifier {
    pub fn new(settings: &TokenAuthConfig) -> Result<Self> {
        let jwks_url = match (&settings.jwks_url, &settings.issuer) {
            (Some(url), _) => url.clone(),
            (None, Some(issuer)) => {
                format!("{}{}", issuer.trim_end_matches('/'), WELL_KNOWN_SUFFIX)
            }
            (None, None) => {
                return Err(Error::Config(
                    "oidc mode requires a jwksUrl or an issuer".into(),
                ))
            }
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            jwks_url,
            settings: settings.clone(),
            client,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Verify a token against the discovered key set.
    pub async fn verify(&self, token: &str) -> Option<CallerContext> {
        let header = match jsonwebtoken::decode_header(token) {
            Ok(h) => h,
            Err(e) => {
                tracing::debug!(error = %e, "unreadable token header");
                return None;
            }
        };
        let kid = match header.kid {
            Some(kid) => kid,
            None => {
                tracing::debug!("token has no kid header");
                return None;
            }
        };

        let jwks = self.key_set().await?;
        let jwk = match jwks.find(&kid) {
            Some(jwk) => jwk,
            None => {
                tracing::debug!(kid = %kid, "no key matches kid");
                return None;
            }
        };
        let key = match DecodingKey::from_jwk(jwk) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!(kid = %kid, error = %e, "unusable JWK");
                return None;
            }
        };

        let validation = build_validation(header.alg, &self.settings);
        match jsonwebtoken::decode::<Value>(token, &key, &validation) {
            Ok(data) => context_from_claims(&self.settings, &data.claims),
            Err(e) => {
                tracing::debug!(error = %e, "discovery token verification failed");
                None
            }
        }
    }

    /// The cached key set, refetched after [`JWKS_TTL`].
    async fn key_set(&self) -> Option<Arc<JwkSet>> {
        {
            let cache = self.cache.read();
            if let Some(entry) = cache.get(&self.jwks_url) {
                if entry.fetched_at.elapsed() < JWKS_TTL {
                    return Some(Arc::clone(&entry.keys));
                }
            }
        }

        tracing::debug!(url = %self.jwks_url, "fetching JWKS");
        let response = match self.client.get(&self.jwks_url).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(url = %self.jwks_url, error = %e, "JWKS fetch failed");
                return None;
            }
        };
        let keys: JwkSet = match response.json().await {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(url = %self.jwks_url, error = %e, "JWKS decode failed");
                return None;
            }
        };

        let keys = Arc::new(keys);
        self.cache.write().insert(
            self.jwks_url.clone(),
            CachedJwks {
                keys: Arc::clone(&keys),
                fetched_at: Instant::now(),
            },
        );
        Some(keys)
    }
}
