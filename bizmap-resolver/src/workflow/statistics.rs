//! Run statistics
//!
//! Counters reported at every terminal stop, together with the instruction
//! needed to resume.

use serde::Serialize;
use std::collections::BTreeMap;

/// Per-source counters for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    /// Records whose chain produced a match this run
    pub matched: usize,
    /// Chains that completed without a match
    pub no_match: usize,
    /// Chains that could not finish (blocked, retries exhausted, failures)
    pub deferred: usize,
}

impl SourceStats {
    pub fn display_string(&self) -> String {
        format!(
            "{} matched, {} no match, {} deferred",
            self.matched, self.no_match, self.deferred
        )
    }
}

/// Match run counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStatistics {
    /// Records in the input file
    pub total_records: usize,
    /// Records skipped because the checkpoint already covers them
    pub already_done: usize,
    /// Records queried and checkpointed this run
    pub processed: usize,
    /// Unexpected per-record failures (logged and skipped)
    pub errors: usize,
    /// Keyed by source name
    pub sources: BTreeMap<String, SourceStats>,
}

impl RunStatistics {
    pub fn source_mut(&mut self, source: &str) -> &mut SourceStats {
        self.sources.entry(source.to_string()).or_default()
    }

    /// Slots filled this run (a record matched by two sources counts twice)
    pub fn matched(&self) -> usize {
        self.sources.values().map(|s| s.matched).sum()
    }

    /// Records not yet covered by the checkpoint
    pub fn remaining(&self) -> usize {
        self.total_records
            .saturating_sub(self.already_done)
            .saturating_sub(self.processed)
    }

    pub fn display_string(&self) -> String {
        format!(
            "Processed {} of {} ({} already done, {} remaining), {} matched, {} errors",
            self.processed,
            self.total_records,
            self.already_done,
            self.remaining(),
            self.matched(),
            self.errors
        )
    }
}

/// Enrichment pass counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichmentStatistics {
    /// Matched slots without details when the pass started
    pub pending: usize,
    pub enriched: usize,
    /// Listing vanished upstream
    pub not_found: usize,
    pub errors: usize,
}

impl EnrichmentStatistics {
    pub fn remaining(&self) -> usize {
        self.pending
            .saturating_sub(self.enriched)
            .saturating_sub(self.not_found)
    }

    pub fn display_string(&self) -> String {
        format!(
            "Enriched {} of {} ({} not found, {} errors, {} remaining)",
            self.enriched,
            self.pending,
            self.not_found,
            self.errors,
            self.remaining()
        )
    }
}
