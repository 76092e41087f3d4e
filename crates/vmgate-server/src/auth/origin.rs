//! Origin gate for browser-facing upgrade requests.
//!
//! Matching rules, in order:
//!
//! | Allow-list          | Accepts                                         |
//! |---------------------|-------------------------------------------------|
//! | contains `"*"`      | any non-empty origin                            |
//! | otherwise           | exact match after stripping one trailing `/`,   |
//! |                     | or exact match against the raw entry            |
//!
//! An empty origin is always rejected. There is no substring matching.

use std::collections::HashSet;
use tracing::warn;

/// Strip a single trailing `/`.
fn normalize(origin: &str) -> &str {
    origin.strip_suffix('/').unwrap_or(origin)
}

/// Pure allow-list check.
pub fn is_origin_allowed(origin: &str, allow_list: &[String]) -> bool {
    if origin.is_empty() {
        return false;
    }
    if allow_list.iter().any(|entry| entry == "*") {
        return true;
    }
    let candidate = normalize(origin);
    allow_list
        .iter()
        .any(|entry| normalize(entry) == candidate || entry == origin)
}

/// Runtime origin gate built once at startup and shared with the HTTP layer.
///
/// Pre-computes the normalized allow-list into a `HashSet`; the raw entries
/// are kept for the exact-match fallback and for rejection logs.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allowed: Vec<String>,
    normalized: HashSet<String>,
    allow_all: bool,
}

impl OriginPolicy {
    pub fn new(allowed: Vec<String>) -> Self {
        let allow_all = allowed.iter().any(|entry| entry == "*");
        let normalized = allowed.iter().map(|e| normalize(e).to_string()).collect();
        Self {
            allowed,
            normalized,
            allow_all,
        }
    }

    /// Same result as [`is_origin_allowed`] against the configured list.
    pub fn allows(&self, origin: &str) -> bool {
        if origin.is_empty() {
            return false;
        }
        if self.allow_all {
            return true;
        }
        self.normalized.contains(normalize(origin)) || self.allowed.iter().any(|e| e == origin)
    }

    /// Check an optional `Origin` header, logging the rejection.
    pub fn check(&self, origin: Option<&str>) -> bool {
        let origin = origin.unwrap_or("");
        let ok = self.allows(origin);
        if !ok {
            warn!(
                origin = %origin,
                allowed = ?self.allowed,
                "origin rejected"
            );
        }
        ok
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }
}
