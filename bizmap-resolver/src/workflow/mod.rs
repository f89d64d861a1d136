//! Resumable passes over the mapping file
//!
//! - [`MatchRun`]: fill null source slots by querying each source's chain
//! - [`EnrichmentRun`]: attach listing details to matched slots
//!
//! Both process one record at a time, checkpoint after every record, and end
//! with a [`RunStatus`] that tells the operator whether and how to resume.

mod enrichment;
mod match_run;
mod statistics;

pub use enrichment::{normalize_details, EnrichmentRun};
pub use match_run::MatchRun;
pub use statistics::{EnrichmentStatistics, RunStatistics, SourceStats};

use crate::error::{QuotaScope, ResolveError};
use std::fmt;

/// Process exit codes for each terminal status
pub mod exit_codes {
    pub const EXIT_OK: i32 = 0;
    pub const EXIT_FAILURE: i32 = 1;
    pub const EXIT_AUTH_FAILED: i32 = 2;
    pub const EXIT_QUOTA_EXHAUSTED: i32 = 3;
    pub const EXIT_INTERRUPTED: i32 = 4;
    pub const EXIT_CORRUPT: i32 = 5;
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Input exhausted
    Completed,
    /// A request budget ran out; the checkpoint is flushed
    QuotaExhausted { adapter: String, scope: QuotaScope },
    /// Cancelled by signal
    Interrupted,
    /// Fatal error for every remaining record (bad credentials)
    Aborted { reason: String },
}

impl RunStatus {
    /// Map a run-ending error; `None` for errors that do not end a run
    pub fn from_error(err: &ResolveError) -> Option<Self> {
        match err {
            ResolveError::QuotaExhausted { adapter, scope, .. } => Some(RunStatus::QuotaExhausted {
                adapter: adapter.clone(),
                scope: *scope,
            }),
            e if e.is_fatal() => Some(RunStatus::Aborted {
                reason: e.to_string(),
            }),
            _ => None,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Completed => exit_codes::EXIT_OK,
            RunStatus::QuotaExhausted { .. } => exit_codes::EXIT_QUOTA_EXHAUSTED,
            RunStatus::Interrupted => exit_codes::EXIT_INTERRUPTED,
            RunStatus::Aborted { .. } => exit_codes::EXIT_AUTH_FAILED,
        }
    }

    /// Operator instruction printed with the summary
    pub fn resume_hint(&self) -> String {
        match self {
            RunStatus::Completed => "Nothing left to do.".to_string(),
            RunStatus::QuotaExhausted { scope: QuotaScope::Day, .. } => {
                "Daily quota used up. Re-run the same command after the UTC day rolls over; \
                 finished records are skipped."
                    .to_string()
            }
            RunStatus::QuotaExhausted { scope: QuotaScope::Run, .. } => {
                "Per-run quota used up. Re-run the same command to continue from the checkpoint."
                    .to_string()
            }
            RunStatus::Interrupted => {
                "Interrupted. Re-run the same command to continue from the checkpoint.".to_string()
            }
            RunStatus::Aborted { .. } => {
                "Fix the credentials, then re-run the same command; the checkpoint is intact."
                    .to_string()
            }
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::QuotaExhausted { adapter, scope } => {
                write!(f, "quota exhausted ({}, {})", adapter, scope)
            }
            RunStatus::Interrupted => write!(f, "interrupted"),
            RunStatus::Aborted { reason } => write!(f, "aborted: {}", reason),
        }
    }
}

/// Terminal status plus the pass's counters
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome<S> {
    pub status: RunStatus,
    pub statistics: S,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify_status;

    #[test]
    fn test_status_from_error() {
        let auth = classify_status("yelp/structured_api", 401, "").unwrap();
        let status = RunStatus::from_error(&auth).unwrap();
        assert_eq!(status.exit_code(), exit_codes::EXIT_AUTH_FAILED);

        let quota = ResolveError::QuotaExhausted {
            adapter: "yelp/structured_api".to_string(),
            scope: QuotaScope::Day,
            used: 5000,
            limit: 5000,
        };
        let status = RunStatus::from_error(&quota).unwrap();
        assert_eq!(status.exit_code(), exit_codes::EXIT_QUOTA_EXHAUSTED);
        assert!(status.resume_hint().contains("UTC day"));

        let block = classify_status("x", 403, "").unwrap();
        assert!(RunStatus::from_error(&block).is_none());
    }
}
