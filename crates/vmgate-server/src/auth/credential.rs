//! Console Authenticator.
//!
//! Locates a bearer token (query `token` first, then `Authorization: Bearer`),
//! delegates validation to a [`TokenValidator`] and enforces the approval
//! flag. Every rejection happens before the connection is upgraded and maps
//! to a plain HTTP status and body.

use hyper::header::AUTHORIZATION;
use hyper::{HeaderMap, StatusCode};
use std::sync::Arc;
use tracing::warn;
use vmgate_core::{GateError, GateResult, JwtValidator, Principal};

/// Seam over the external credential validator.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> GateResult<Principal>;
}

impl TokenValidator for JwtValidator {
    fn validate(&self, token: &str) -> GateResult<Principal> {
        JwtValidator::validate(self, token).map(|claims| claims.principal())
    }
}

/// Why a request was refused before upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRejection {
    MissingCredential,
    InvalidCredential(String),
    PendingApproval,
}

impl AuthRejection {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthRejection::MissingCredential | AuthRejection::InvalidCredential(_) => {
                StatusCode::UNAUTHORIZED
            }
            AuthRejection::PendingApproval => StatusCode::FORBIDDEN,
        }
    }

    pub fn body(&self) -> String {
        match self {
            AuthRejection::MissingCredential => "Authentication token required".to_string(),
            AuthRejection::InvalidCredential(reason) => {
                format!("Invalid or expired token: {reason}")
            }
            AuthRejection::PendingApproval => "Account pending approval".to_string(),
        }
    }
}

/// Pull the bearer token from the query value or the `Authorization` header.
/// Empty values count as absent.
pub fn extract_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(t) = query_token.filter(|t| !t.is_empty()) {
        return Some(t.to_string());
    }
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

#[derive(Clone)]
pub struct ConsoleAuthenticator {
    validator: Arc<dyn TokenValidator>,
}

impl ConsoleAuthenticator {
    pub fn new(validator: Arc<dyn TokenValidator>) -> Self {
        Self { validator }
    }

    /// Validate the credential only. Used by the status endpoint, which does
    /// not require an approved account.
    pub fn identify(
        &self,
        query_token: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<Principal, AuthRejection> {
        let token = extract_token(query_token, headers).ok_or_else(|| {
            warn!("connection attempt without token");
            AuthRejection::MissingCredential
        })?;

        self.validator.validate(&token).map_err(|e| {
            let reason = match e {
                GateError::Token(reason) | GateError::Auth(reason) => reason,
                other => other.to_string(),
            };
            warn!(reason = %reason, "connection attempt with invalid token");
            AuthRejection::InvalidCredential(reason)
        })
    }

    /// Full console check: valid credential plus approved-or-admin.
    pub fn authenticate(
        &self,
        query_token: Option<&str>,
        headers: &HeaderMap,
    ) -> Result<Principal, AuthRejection> {
        let principal = self.identify(query_token, headers)?;
        if !principal.may_open_console() {
            warn!(
                user_id = principal.user_id,
                username = %principal.username,
                "console attempt by unapproved user"
            );
            return Err(AuthRejection::PendingApproval);
        }
        Ok(principal)
    }
}
