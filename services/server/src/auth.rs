//! Bearer-token verification and channel access policy.
//!
//! Tokens are self-contained HS256 JWTs.  The optional `channels` claim
//! restricts which topics the bearer may join: `*` matches everything, a
//! trailing `*` is a prefix wildcard, anything else matches exactly.  A
//! token without the claim may join any channel.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use rb_protocol::error_codes;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub sub: Option<String>,
    pub exp: u64,
    /// Topic patterns the bearer may join; absent means unrestricted.
    #[serde(default)]
    pub channels: Option<Vec<String>>,
}

/// Verification failure with the machine-readable code surfaced to clients.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason} ({code})")]
pub struct AuthFailure {
    pub code: &'static str,
    pub reason: String,
}

pub struct AuthVerifier {
    decoding: DecodingKey,
    validation: Validation,
}

impl AuthVerifier {
    pub fn new(secret: &str, issuer: Option<&str>, audience: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        if let Some(iss) = issuer {
            validation.set_issuer(&[iss]);
        }
        match audience {
            Some(aud) => validation.set_audience(&[aud]),
            None => validation.validate_aud = false,
        }
        AuthVerifier {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, AuthFailure> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthFailure {
                    code: error_codes::AUTH_EXPIRED,
                    reason: "Token has expired".to_owned(),
                },
                ErrorKind::InvalidSignature => AuthFailure {
                    code: error_codes::AUTH_SIGNATURE_INVALID,
                    reason: "Token signature is invalid".to_owned(),
                },
                _ => AuthFailure {
                    code: error_codes::AUTH_INVALID,
                    reason: format!("Token rejected: {e}"),
                },
            })
    }

    pub fn can_access_channel(claims: &Claims, topic: &str) -> bool {
        let Some(patterns) = &claims.channels else {
            return true;
        };
        patterns.iter().any(|pattern| topic_matches(pattern, topic))
    }
}

fn topic_matches(pattern: &str, topic: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return topic.starts_with(prefix);
    }
    pattern == topic
}
