//! Signed transfer tokens
//!
//! A transfer token grants time-bounded access to exactly one upload target,
//! so asynchronous consumers (scanners, processors) can fetch an upload's
//! bytes through the data gateway without broader credentials.

use crate::{CryptoError, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Audience claim carried by every transfer token
pub const TOKEN_AUDIENCE: &str = "tusk";

/// Issuer claim carried by every transfer token
pub const TOKEN_ISSUER: &str = "tusk";

/// Claims of a transfer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferClaims {
    /// Expiration time
    pub exp: i64,
    /// Issued at
    pub iat: i64,
    /// Audience
    pub aud: String,
    /// Issuer
    pub iss: String,
    /// Path the bearer may fetch
    pub target: String,
}

/// Mints and validates transfer tokens with a shared secret
#[derive(Clone)]
pub struct TokenIssuer {
    secret: String,
    ttl: Duration,
}

impl TokenIssuer {
    /// Create an issuer; tokens expire `ttl` after issuance
    pub fn new(secret: impl Into<String>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    /// Token lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign a token scoped to `target`
    pub fn issue(&self, target: &str) -> Result<String> {
        if self.secret.is_empty() {
            return Err(CryptoError::MissingSecret);
        }

        let now = Utc::now();
        let claims = TransferClaims {
            exp: (now + self.ttl).timestamp(),
            iat: now.timestamp(),
            aud: TOKEN_AUDIENCE.to_string(),
            iss: TOKEN_ISSUER.to_string(),
            target: target.to_string(),
        };

        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|source| CryptoError::TokenSigning {
            target: target.to_string(),
            source,
        })
    }

    /// Check signature, expiry, audience and issuer, returning the claims
    pub fn validate(&self, token: &str) -> Result<TransferClaims> {
        if self.secret.is_empty() {
            return Err(CryptoError::MissingSecret);
        }

        let key = DecodingKey::from_secret(self.secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_audience(&[TOKEN_AUDIENCE]);
        validation.set_issuer(&[TOKEN_ISSUER]);

        decode::<TransferClaims>(token, &key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!("transfer token validation failed: {}", e);
                CryptoError::InvalidToken(e)
            })
    }
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("secret", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_validate() {
        let issuer = TokenIssuer::new("test-secret", Duration::hours(1));
        let token = issuer.issue("https://cloud.example/data/tus/abc").unwrap();

        let claims = issuer.validate(&token).unwrap();
        assert_eq!(claims.target, "https://cloud.example/data/tus/abc");
        assert_eq!(claims.aud, TOKEN_AUDIENCE);
        assert_eq!(claims.iss, TOKEN_ISSUER);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = TokenIssuer::new("secret-a", Duration::hours(1));
        let other = TokenIssuer::new("secret-b", Duration::hours(1));
        let token = issuer.issue("target").unwrap();

        assert!(matches!(other.validate(&token), Err(CryptoError::InvalidToken(_))));
    }

    #[test]
    fn test_expired_token_rejected() {
        // beyond the default validation leeway
        let issuer = TokenIssuer::new("test-secret", Duration::minutes(-5));
        let token = issuer.issue("target").unwrap();

        assert!(issuer.validate(&token).is_err());
    }

    #[test]
    fn test_missing_secret() {
        let issuer = TokenIssuer::new("", Duration::hours(1));
        assert!(matches!(issuer.issue("target"), Err(CryptoError::MissingSecret)));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let issuer = TokenIssuer::new("super-secret", Duration::hours(1));
        let rendered = format!("{:?}", issuer);
        assert!(!rendered.contains("super-secret"));
    }
}
