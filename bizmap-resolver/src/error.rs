//! Error taxonomy for matching, enrichment and recovery
//!
//! Every failure an adapter or store can raise maps onto one variant here;
//! the workflow decides from the variant alone whether to abort the run,
//! stop cleanly, skip an adapter, or count the failure and move on.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which quota cap was hit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaScope {
    Run,
    Day,
}

impl fmt::Display for QuotaScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaScope::Run => write!(f, "per run"),
            QuotaScope::Day => write!(f, "per day"),
        }
    }
}

/// Resolver error
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Credentials rejected. Applies to every record, so the run aborts.
    #[error("{adapter}: authentication failed (HTTP {status})")]
    AuthFailed { adapter: String, status: u16 },

    /// Source asked us to slow down
    #[error("{adapter}: rate limited (HTTP {status})")]
    RateLimited { adapter: String, status: u16 },

    /// Known request budget used up; resume later from checkpoint
    #[error("{adapter}: quota exhausted ({used}/{limit} {scope})")]
    QuotaExhausted {
        adapter: String,
        scope: QuotaScope,
        used: u32,
        limit: u32,
    },

    /// Source refuses this request; skip the adapter for this record only
    #[error("{adapter}: blocked (HTTP {status})")]
    PermanentBlock { adapter: String, status: u16 },

    /// Nothing at the requested location
    #[error("Not found: {0}")]
    NotFound(String),

    /// Persisted snapshot could not be parsed
    #[error("Corrupt snapshot {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    /// Non-success status outside the classes above
    #[error("{adapter}: upstream error (HTTP {status}): {body}")]
    Upstream {
        adapter: String,
        status: u16,
        body: String,
    },

    /// Connect, timeout or body transfer failure
    #[error("{adapter}: network error: {message}")]
    Network { adapter: String, message: String },

    /// Anything else; logged and counted, processing continues
    #[error("Unexpected error: {0}")]
    Unexpected(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] bizmap_common::Error),
}

/// Result alias for resolver operations
pub type ResolveResult<T> = Result<T, ResolveError>;

impl ResolveError {
    /// Errors that must abort the whole run
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResolveError::AuthFailed { .. })
    }

    /// HTTP status carried by the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            ResolveError::AuthFailed { status, .. }
            | ResolveError::RateLimited { status, .. }
            | ResolveError::PermanentBlock { status, .. }
            | ResolveError::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Unclassified status; body kept short for logs
    pub fn upstream(adapter: &str, status: u16, body: &str) -> Self {
        ResolveError::Upstream {
            adapter: adapter.to_string(),
            status,
            body: body.chars().take(200).collect(),
        }
    }

    /// Map a reqwest transport error
    pub fn network(adapter: &str, err: reqwest::Error) -> Self {
        ResolveError::Network {
            adapter: adapter.to_string(),
            message: err.to_string(),
        }
    }
}

/// Classify a response status into the taxonomy. `None` for 2xx.
pub fn classify_status(adapter: &str, status: u16, body: &str) -> Option<ResolveError> {
    match status {
        200..=299 => None,
        401 => Some(ResolveError::AuthFailed { adapter: adapter.to_string(), status }),
        403 => Some(ResolveError::PermanentBlock { adapter: adapter.to_string(), status }),
        404 => Some(ResolveError::NotFound(format!("{} (HTTP 404)", adapter))),
        429 => Some(ResolveError::RateLimited { adapter: adapter.to_string(), status }),
        _ => Some(ResolveError::upstream(adapter, status, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(classify_status("a", 200, "").is_none());
        assert!(matches!(classify_status("a", 401, ""), Some(ResolveError::AuthFailed { .. })));
        assert!(matches!(classify_status("a", 403, ""), Some(ResolveError::PermanentBlock { .. })));
        assert!(matches!(classify_status("a", 404, ""), Some(ResolveError::NotFound(_))));
        assert!(matches!(classify_status("a", 429, ""), Some(ResolveError::RateLimited { .. })));
        assert!(matches!(
            classify_status("a", 503, "busy"),
            Some(ResolveError::Upstream { status: 503, .. })
        ));
    }

    #[test]
    fn test_only_auth_is_fatal() {
        let auth = classify_status("a", 401, "").unwrap();
        let block = classify_status("a", 403, "").unwrap();
        assert!(auth.is_fatal());
        assert!(!block.is_fatal());
        assert_eq!(block.status(), Some(403));
    }

    #[test]
    fn test_upstream_body_truncated() {
        let body = "x".repeat(1000);
        match classify_status("a", 500, &body) {
            Some(ResolveError::Upstream { body, .. }) => assert_eq!(body.len(), 200),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
