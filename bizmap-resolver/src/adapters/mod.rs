//! Source adapters and the per-source fallback chain
//!
//! An adapter fetches raw candidates for one record from one external
//! directory. A [`SourceChain`] owns the adapters for one mapping slot and
//! tries them strictly in priority order until one yields a match.

pub mod rendered_page;
pub mod structured_api;

pub use rendered_page::{HttpPageRenderer, PageLink, PageRenderer, RenderedPage, RenderedPageAdapter};
pub use structured_api::StructuredApiAdapter;

use crate::error::{ResolveError, ResolveResult};
use crate::matcher::Matcher;
use crate::types::{CandidateMatch, ListingDetails, RawCandidate, SourceRecord};
use async_trait::async_trait;
use std::sync::Arc;

/// One integration against one external directory
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Label used in logs and the quota ledger (`<source>/<kind>`)
    fn name(&self) -> &str;

    /// Candidate listings for `target`, in the order the source ranked them
    async fn query(&self, target: &SourceRecord) -> ResolveResult<Vec<RawCandidate>>;

    /// Whether [`SourceAdapter::details`] does anything
    fn supports_details(&self) -> bool {
        false
    }

    /// Structured detail for an already matched listing
    async fn details(&self, _listing: &CandidateMatch) -> ResolveResult<Option<ListingDetails>> {
        Ok(None)
    }
}

/// Result of running a chain for one record
#[derive(Debug, Clone, PartialEq)]
pub enum ChainOutcome {
    /// First adapter to produce a match above the floor
    Matched {
        adapter: String,
        candidate: CandidateMatch,
    },
    /// Every adapter answered and none matched
    NoMatch,
    /// At least one adapter could not answer (blocked, retries exhausted,
    /// unexpected failure) and no other adapter matched
    Deferred { failures: Vec<String> },
}

/// Ordered adapters for one source slot
#[derive(Clone)]
pub struct SourceChain {
    source: String,
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl std::fmt::Debug for SourceChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceChain")
            .field("source", &self.source)
            .field(
                "adapters",
                &self.adapters.iter().map(|a| a.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl SourceChain {
    pub fn new(source: impl Into<String>, adapters: Vec<Arc<dyn SourceAdapter>>) -> Self {
        Self {
            source: source.into(),
            adapters,
        }
    }

    /// Mapping slot this chain fills
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn adapters(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.adapters
    }

    /// Try adapters in order and stop at the first match.
    ///
    /// Returns `Err` only for failures that end the run: authentication
    /// failure and quota exhaustion. Everything else is folded into the
    /// outcome so one record's trouble never blocks the next.
    pub async fn resolve(
        &self,
        target: &SourceRecord,
        matcher: &Matcher,
    ) -> ResolveResult<ChainOutcome> {
        let mut failures = Vec::new();

        for adapter in &self.adapters {
            let candidates = match adapter.query(target).await {
                Ok(candidates) => candidates,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e @ ResolveError::QuotaExhausted { .. }) => return Err(e),
                Err(ResolveError::NotFound(_)) => {
                    tracing::debug!(record_id = %target.id, adapter = adapter.name(), "No listings");
                    continue;
                }
                Err(e @ ResolveError::PermanentBlock { .. }) => {
                    tracing::warn!(
                        record_id = %target.id,
                        adapter = adapter.name(),
                        error = %e,
                        "Adapter blocked for this record, trying next"
                    );
                    failures.push(e.to_string());
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        record_id = %target.id,
                        adapter = adapter.name(),
                        error = %e,
                        "Adapter failed, trying next"
                    );
                    failures.push(e.to_string());
                    continue;
                }
            };

            tracing::debug!(
                record_id = %target.id,
                adapter = adapter.name(),
                candidates = candidates.len(),
                "Candidates received"
            );

            if let Some(candidate) = matcher.best_match(target, &candidates) {
                return Ok(ChainOutcome::Matched {
                    adapter: adapter.name().to_string(),
                    candidate,
                });
            }
        }

        if failures.is_empty() {
            Ok(ChainOutcome::NoMatch)
        } else {
            Ok(ChainOutcome::Deferred { failures })
        }
    }

    /// First adapter able to fetch listing details
    pub fn details_adapter(&self) -> Option<&Arc<dyn SourceAdapter>> {
        self.adapters.iter().find(|a| a.supports_details())
    }
}
