//! Locally verified signed tokens.
//!
//! Verification runs against a preconfigured HS256 shared secret or an
//! RS256 public key. Issuer and audience are enforced when configured; the
//! consumer id and roles come from configurable claims.

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde_json::Value;

use tg_domain::config::TokenAuthConfig;
use tg_domain::{CallerContext, Error, Result};

pub struct TokenVerifier {
    key: DecodingKey,
    algorithm: Algorithm,
    settings: TokenAuthConfig,
}

impl TokenVerifier {
    pub fn new(settings: &TokenAuthConfig) -> Result<Self> {
        let (key, algorithm) = if let Some(secret) = &settings.secret {
            (DecodingKey::from_secret(secret.as_bytes()), Algorithm::HS256)
        } else if let Some(pem) = &settings.public_key {
            let key = DecodingKey::from_rsa_pem(pem.as_bytes())
                .map_err(|e| Error::Config(format!("invalid publicKey: {e}")))?;
            (key, Algorithm::RS256)
        } else {
            return Err(Error::Config(
                "jwt mode requires a secret or a publicKey".into(),
            ));
        };
        Ok(Self {
            key,
            algorithm,
            settings: settings.clone(),
        })
    }

    /// Verify a token and derive the caller context from its claims.
    pub fn verify(&self, token: &str) -> Option<CallerContext> {
        let validation = build_validation(self.algorithm, &self.settings);
        match jsonwebtoken::decode::<Value>(token, &self.key, &validation) {
            Ok(data) => context_from_claims(&self.settings, &data.claims),
            Err(e) => {
                tracing::debug!(error = %e, "token verification failed");
                None
            }
        }
    }
}

/// Validation settings shared by the local and discovery verifiers.
pub(crate) fn build_validation(algorithm: Algorithm, settings: &TokenAuthConfig) -> Validation {
    let mut validation = Validation::new(algorithm);
    if let Some(issuer) = &settings.issuer {
        validation.set_issuer(&[issuer]);
    }
    match &settings.audience {
        Some(audience) => validation.set_audience(&[audience]),
        None => validation.validate_aud = false,
    }
    validation
}

/// Derive a caller context from verified claims, or `None` when required
/// claims are missing or the email domain is not permitted.
pub(crate) fn context_from_claims(
    settings: &TokenAuthConfig,
    claims: &Value,
) -> Option<CallerContext> {
    let consumer_id = claim_string(claims.get(settings.consumer_claim.as_str()))?;

    let roles = match claims.get(settings.roles_claim.as_str()) {
        Some(Value::String(role)) => vec![role.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    let email = claims.get("email").and_then(Value::as_str).map(str::to_string);
    if let Some(email) = &email {
        if !settings.allowed_email_domains.is_empty() {
            let domain = email.rsplit('@').next().unwrap_or("");
            let permitted = settings
                .allowed_email_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain));
            if !permitted {
                tracing::debug!(email = %email, "email domain not permitted");
                return None;
            }
        }
    }

    let credential_id = claims
        .get("jti")
        .and_then(Value::as_str)
        .unwrap_or("token")
        .to_string();

    Some(CallerContext {
        consumer_id,
        credential_id,
        roles,
        rate_limit_per_minute: None,
        email,
        metadata: None,
    })
}

fn claim_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
