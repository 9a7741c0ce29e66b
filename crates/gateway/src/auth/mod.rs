//! Caller authentication.
//!
//! Credential verification is a tagged set of modes behind one
//! `authenticate` capability: `none`, pre-shared keys, locally verified
//! signed tokens, and discovery-backed signed tokens (the only mode that
//! performs I/O — a cached JWKS fetch).
//!
//! Authentication never faults the pipeline: every failure path resolves to
//! "no caller" (`None`), logged at debug level.

mod apikey;
mod discovery;
mod token;

use tg_domain::config::{AuthConfig, AuthMode};
use tg_domain::{CallerContext, Error, Result};

pub use apikey::KeyStore;
pub use discovery::DiscoveryVerifier;
pub use token::TokenVerifier;

/// Resolves caller credentials to a [`CallerContext`].
pub struct Authenticator {
    mode: AuthMode,
    keys: KeyStore,
    token: Option<TokenVerifier>,
    discovery: Option<DiscoveryVerifier>,
}

impl Authenticator {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let token = match config.mode {
            AuthMode::Jwt => {
                let settings = config
                    .token
                    .as_ref()
                    .ok_or_else(|| Error::Config("jwt mode requires a token section".into()))?;
                Some(TokenVerifier::new(settings)?)
            }
            _ => None,
        };
        let discovery = match config.mode {
            AuthMode::Oidc => {
                let settings = config
                    .token
                    .as_ref()
                    .ok_or_else(|| Error::Config("oidc mode requires a token section".into()))?;
                Some(DiscoveryVerifier::new(settings)?)
            }
            _ => None,
        };
        Ok(Self {
            mode: config.mode,
            keys: KeyStore::new(&config.credentials),
            token,
            discovery,
        })
    }

    pub fn mode(&self) -> AuthMode {
        self.mode
    }

    /// Resolve a credential to a caller context, or `None` when the caller
    /// cannot be identified.
    pub async fn authenticate(&self, credential: Option<&str>) -> Option<CallerContext> {
        match self.mode {
            AuthMode::None => Some(CallerContext::anonymous()),
            AuthMode::ApiKey => {
                let raw = credential?;
                self.keys.resolve(raw)
            }
            AuthMode::Jwt => {
                let raw = credential?;
                self.token.as_ref()?.verify(raw)
            }
            AuthMode::Oidc => {
                let raw = credential?;
                self.discovery.as_ref()?.verify(raw).await
            }
        }
    }

    /// Atomically replace the pre-shared credential map (hot reload).
    pub fn reload(&self, config: &AuthConfig) {
        self.keys.replace(&config.credentials);
        tracing::info!(
            credentials = config.credentials.len(),
            "credential map reloaded"
        );
    }
}
