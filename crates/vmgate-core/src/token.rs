//! HS256 bearer tokens.
//!
//! Tokens are issued by the account service; vmgate only needs to validate
//! them and read the principal. Issuing is kept for tooling and tests.

use crate::error::{GateError, GateResult};
use crate::model::Principal;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Shortest accepted signing secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Claims carried by an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: u64,
    pub username: String,
    pub role: String,
    #[serde(default)]
    pub approved: bool,
    pub iat: u64,
    pub exp: u64,
}

impl Claims {
    pub fn principal(&self) -> Principal {
        Principal {
            user_id: self.user_id,
            username: self.username.clone(),
            role: self.role.clone(),
            approved: self.approved,
        }
    }
}

/// Validates (and, for tooling, issues) HS256 tokens with a shared secret.
#[derive(Clone)]
pub struct JwtValidator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    /// Create a validator. Fails if the secret is shorter than [`MIN_SECRET_LEN`].
    pub fn new(secret: &[u8]) -> GateResult<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(GateError::Config(format!(
                "JWT secret must be at least {MIN_SECRET_LEN} bytes (got {})",
                secret.len()
            )));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        })
    }

    /// Verify signature and expiry, returning the decoded claims.
    ///
    /// The error carries a short reason suitable for a client-facing message.
    pub fn validate(&self, token: &str) -> GateResult<Claims> {
        decode::<Claims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                let reason = match e.kind() {
                    ErrorKind::ExpiredSignature => "token expired",
                    ErrorKind::InvalidSignature => "invalid signature",
                    ErrorKind::InvalidAlgorithm => "unsupported algorithm",
                    ErrorKind::InvalidToken | ErrorKind::Base64(_) | ErrorKind::Utf8(_) => {
                        "malformed token"
                    }
                    ErrorKind::Json(_) | ErrorKind::MissingRequiredClaim(_) => "invalid claims",
                    _ => "token validation failed",
                };
                GateError::Token(reason.to_string())
            })
    }

    /// Issue a token for `principal` valid for `ttl_secs`.
    pub fn issue(&self, principal: &Principal, ttl_secs: u64) -> GateResult<String> {
        let now = now_secs()?;
        self.sign(&Claims {
            user_id: principal.user_id,
            username: principal.username.clone(),
            role: principal.role.clone(),
            approved: principal.approved,
            iat: now,
            exp: now + ttl_secs,
        })
    }

    /// Sign arbitrary claims.
    pub fn sign(&self, claims: &Claims) -> GateResult<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| GateError::Token(format!("failed to sign token: {e}")))
    }
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> GateResult<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| GateError::Other(format!("system clock before epoch: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    fn principal() -> Principal {
        Principal {
            user_id: 42,
            username: "operator".into(),
            role: "user".into(),
            approved: true,
        }
    }

    #[test]
    fn issue_and_validate() {
        let v = JwtValidator::new(SECRET).unwrap();
        let token = v.issue(&principal(), 3600).unwrap();
        let claims = v.validate(&token).unwrap();
        assert_eq!(claims.principal(), principal());
    }

    #[test]
    fn short_secret_rejected() {
        assert!(matches!(
            JwtValidator::new(b"too-short"),
            Err(GateError::Config(_))
        ));
    }

    #[test]
    fn wrong_secret() {
        let a = JwtValidator::new(SECRET).unwrap();
        let b = JwtValidator::new(b"fedcba9876543210fedcba9876543210").unwrap();
        let token = a.issue(&principal(), 3600).unwrap();
        match b.validate(&token) {
            Err(GateError::Token(reason)) => assert_eq!(reason, "invalid signature"),
            other => panic!("expected signature failure, got {other:?}"),
        }
    }

    #[test]
    fn expired_token() {
        let v = JwtValidator::new(SECRET).unwrap();
        let now = now_secs().unwrap();
        let token = v
            .sign(&Claims {
                user_id: 1,
                username: "old".into(),
                role: "user".into(),
                approved: true,
                iat: now - 7200,
                exp: now - 3600,
            })
            .unwrap();
        match v.validate(&token) {
            Err(GateError::Token(reason)) => assert_eq!(reason, "token expired"),
            other => panic!("expected expiry failure, got {other:?}"),
        }
    }

    #[test]
    fn garbage_token() {
        let v = JwtValidator::new(SECRET).unwrap();
        assert!(matches!(v.validate("not.a.jwt"), Err(GateError::Token(_))));
    }
}
