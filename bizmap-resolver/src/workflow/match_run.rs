//! Match run: resolve every pending record against every source chain

use super::statistics::RunStatistics;
use super::{RunOutcome, RunStatus};
use crate::adapters::{ChainOutcome, SourceChain};
use crate::checkpoint::{MappingStore, PendingState};
use crate::error::ResolveResult;
use crate::matcher::Matcher;
use crate::types::{MappingEntry, SourceRecord};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Sequential, checkpointed resolution of an input set
pub struct MatchRun {
    run_id: Uuid,
    chains: Vec<SourceChain>,
    matcher: Matcher,
    revisit_unmatched: bool,
}

impl MatchRun {
    pub fn new(chains: Vec<SourceChain>, matcher: Matcher, revisit_unmatched: bool) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            chains,
            matcher,
            revisit_unmatched,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn source_names(&self) -> Vec<&str> {
        self.chains.iter().map(|c| c.source()).collect()
    }

    /// Query every chain this record still needs, in configuration order.
    ///
    /// Only run-ending errors come back as `Err`; the entry is left for the
    /// caller to discard in that case.
    async fn resolve_record(
        &self,
        record: &SourceRecord,
        entry: &MappingEntry,
    ) -> ResolveResult<Vec<(String, ChainOutcome)>> {
        let mut outcomes = Vec::with_capacity(self.chains.len());

        for chain in &self.chains {
            let source = chain.source();
            if entry.is_populated(source) {
                continue;
            }
            if !self.revisit_unmatched && entry.last_searched.contains_key(source) {
                continue;
            }

            let outcome = chain.resolve(record, &self.matcher).await?;
            outcomes.push((source.to_string(), outcome));
        }

        Ok(outcomes)
    }

    /// Fold chain outcomes into the entry and the counters
    fn apply(
        &self,
        record: &SourceRecord,
        entry: &mut MappingEntry,
        outcomes: Vec<(String, ChainOutcome)>,
        stats: &mut RunStatistics,
    ) {
        let now = Utc::now();

        for (source, outcome) in outcomes {
            match outcome {
                ChainOutcome::Matched { adapter, candidate } => {
                    tracing::info!(
                        record_id = %record.id,
                        source = %source,
                        adapter = %adapter,
                        listing = %candidate.name,
                        score = candidate.score,
                        "Matched"
                    );
                    entry.fill_slot(&source, candidate);
                    entry.last_searched.insert(source.clone(), now);
                    stats.source_mut(&source).matched += 1;
                }
                ChainOutcome::NoMatch => {
                    tracing::info!(record_id = %record.id, source = %source, "No match");
                    entry.last_searched.insert(source.clone(), now);
                    stats.source_mut(&source).no_match += 1;
                }
                ChainOutcome::Deferred { failures } => {
                    tracing::warn!(
                        record_id = %record.id,
                        source = %source,
                        failures = failures.len(),
                        "Source deferred to a later run"
                    );
                    stats.source_mut(&source).deferred += 1;
                    stats.errors += failures.len();
                }
            }
        }
    }

    /// Process `records` against `store` until done, out of quota, aborted
    /// or cancelled. The checkpoint is flushed before returning in every case.
    pub async fn execute(
        &self,
        records: &[SourceRecord],
        store: &mut MappingStore,
        cancel: &CancellationToken,
    ) -> ResolveResult<RunOutcome<RunStatistics>> {
        let sources = self.source_names();
        let mut stats = RunStatistics {
            total_records: records.len(),
            ..Default::default()
        };
        for source in &sources {
            stats.source_mut(source);
        }

        tracing::info!(
            run_id = %self.run_id,
            records = records.len(),
            sources = ?sources,
            "Match run starting"
        );

        let mut status = RunStatus::Completed;

        for record in records {
            if cancel.is_cancelled() {
                status = RunStatus::Interrupted;
                break;
            }

            if store.pending_state(record, &sources, self.revisit_unmatched) == PendingState::Done {
                stats.already_done += 1;
                continue;
            }

            let mut entry = store
                .get(&record.id)
                .cloned()
                .unwrap_or_else(|| MappingEntry::for_record(record, sources.iter().copied()));
            for source in &sources {
                entry.ensure_slot(source);
            }

            let resolved = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(record_id = %record.id, "Cancelled mid-record; record not saved");
                    status = RunStatus::Interrupted;
                    break;
                }
                resolved = self.resolve_record(record, &entry) => resolved,
            };

            let outcomes = match resolved {
                Ok(outcomes) => outcomes,
                Err(e) => match RunStatus::from_error(&e) {
                    Some(stop) => {
                        tracing::warn!(record_id = %record.id, error = %e, "Stopping run; record not saved");
                        status = stop;
                        break;
                    }
                    None => {
                        tracing::error!(record_id = %record.id, error = %e, "Unexpected failure, skipping record");
                        stats.errors += 1;
                        continue;
                    }
                },
            };

            self.apply(record, &mut entry, outcomes, &mut stats);
            store.save(entry)?;
            stats.processed += 1;
        }

        store.flush()?;

        tracing::info!(
            run_id = %self.run_id,
            status = %status,
            summary = %stats.display_string(),
            "Match run finished"
        );

        Ok(RunOutcome {
            status,
            statistics: stats,
        })
    }
}
