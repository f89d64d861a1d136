//! Read-only progress report
//!
//! Combines the input file, the mapping file and the quota ledger into one
//! summary. Nothing here writes to disk: a truncated mapping file is
//! repaired in memory only.

use crate::checkpoint::{MappingStore, PendingState};
use crate::config::{AdapterQuota, RunConfig};
use crate::error::ResolveResult;
use crate::quota::QuotaLedger;
use crate::types::{load_source_records, SourceRecord};
use serde::Serialize;
use std::fmt::Write as _;

/// Today's usage of one adapter tier
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaUsage {
    pub label: String,
    pub used_today: u32,
    pub per_day: Option<u32>,
    /// Days of full daily budget needed for this source's pending records
    pub days_remaining: Option<u64>,
}

/// Per-source counts
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceProgress {
    pub source: String,
    pub matched: usize,
    /// Input records whose slot for this source still needs a search
    pub pending: usize,
    pub with_details: usize,
    pub without_attributes: usize,
    pub quota: Vec<QuotaUsage>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressReport {
    pub total_records: usize,
    /// Input records with a mapping entry
    pub processed: usize,
    /// Input records the next match run would query
    pub remaining: usize,
    pub sources: Vec<SourceProgress>,
}

fn days_needed(pending: usize, per_day: u32) -> u64 {
    if per_day == 0 {
        return u64::MAX;
    }
    (pending as u64).div_ceil(per_day as u64)
}

/// Build the report from already loaded state
pub fn summarize(
    records: &[SourceRecord],
    store: &MappingStore,
    ledger: &QuotaLedger,
    sources: &[String],
    quotas: &[AdapterQuota],
    revisit_unmatched: bool,
) -> ProgressReport {
    let names: Vec<&str> = sources.iter().map(String::as_str).collect();

    let mut report = ProgressReport {
        total_records: records.len(),
        ..Default::default()
    };

    for record in records {
        let state = store.pending_state(record, &names, revisit_unmatched);
        if state != PendingState::New {
            report.processed += 1;
        }
        if state != PendingState::Done {
            report.remaining += 1;
        }
    }

    for source in sources {
        let mut progress = SourceProgress {
            source: source.clone(),
            ..Default::default()
        };

        for entry in store.entries() {
            let Some(slot) = entry.slot(source) else {
                continue;
            };
            progress.matched += 1;
            match &slot.details {
                Some(details) => {
                    progress.with_details += 1;
                    if details.attributes.is_empty() {
                        progress.without_attributes += 1;
                    }
                }
                None => progress.without_attributes += 1,
            }
        }

        progress.pending = records
            .iter()
            .filter(|record| match store.get(&record.id) {
                None => true,
                Some(entry) => {
                    !entry.is_populated(source)
                        && (revisit_unmatched || !entry.last_searched.contains_key(source))
                }
            })
            .count();

        progress.quota = quotas
            .iter()
            .filter(|q| &q.source == source)
            .map(|q| QuotaUsage {
                label: q.label.clone(),
                used_today: ledger.used_today(&q.label),
                per_day: q.per_day,
                days_remaining: q.per_day.map(|cap| days_needed(progress.pending, cap)),
            })
            .collect();

        report.sources.push(progress);
    }

    report
}

/// Load everything named by `config` read-only and summarize it
pub fn progress_report(config: &RunConfig) -> ResolveResult<ProgressReport> {
    let records = load_source_records(&config.input_file)?;
    let store = MappingStore::open_read_only(&config.mapping_file)?;
    let ledger = QuotaLedger::load_read_only(&config.quota_ledger)?;

    Ok(summarize(
        &records,
        &store,
        &ledger,
        &config.source_names(),
        &config.adapter_quotas(),
        config.revisit_unmatched,
    ))
}

impl ProgressReport {
    pub fn display_string(&self) -> String {
        let mut out = format!(
            "Records: {} total, {} processed, {} remaining\n",
            self.total_records, self.processed, self.remaining
        );
        for source in &self.sources {
            let _ = writeln!(
                out,
                "  {}: {} matched, {} pending, {} with details, {} without attributes",
                source.source,
                source.matched,
                source.pending,
                source.with_details,
                source.without_attributes
            );
            for quota in &source.quota {
                match (quota.per_day, quota.days_remaining) {
                    (Some(cap), Some(days)) => {
                        let _ = writeln!(
                            out,
                            "    {}: {}/{} today, ~{} day(s) of quota to finish",
                            quota.label, quota.used_today, cap, days
                        );
                    }
                    _ => {
                        let _ = writeln!(out, "    {}: {} today (uncapped)", quota.label, quota.used_today);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandidateMatch, ListingDetails, MappingEntry};
    use serde_json::json;
    use tempfile::TempDir;

    fn candidate(id: &str) -> CandidateMatch {
        CandidateMatch {
            id: id.to_string(),
            name: id.to_string(),
            url: format!("https://www.yelp.com/biz/{}", id),
            score: 100.0,
            match_reasons: Vec::new(),
        }
    }

    #[test]
    fn test_summarize_counts() {
        let temp = TempDir::new().unwrap();
        let (mut store, _) = MappingStore::open(&temp.path().join("m.json")).unwrap();

        let records: Vec<SourceRecord> = (0..5)
            .map(|i| SourceRecord::new(format!("r{}", i), "Jade Palace", "Austin", "TX"))
            .collect();

        let mut with_details = MappingEntry::for_record(&records[0], ["yelp"]);
        with_details.fill_slot("yelp", candidate("a"));
        with_details.slot_mut("yelp").unwrap().details = Some(ListingDetails {
            attributes: serde_json::from_value(json!({"outdoor_seating": true})).unwrap(),
            ..Default::default()
        });
        store.save(with_details).unwrap();

        let mut bare = MappingEntry::for_record(&records[1], ["yelp"]);
        bare.fill_slot("yelp", candidate("b"));
        store.save(bare).unwrap();

        store.save(MappingEntry::for_record(&records[2], ["yelp"])).unwrap();

        let ledger = QuotaLedger::in_memory();
        ledger.record("yelp/structured_api");

        let quotas = vec![AdapterQuota {
            source: "yelp".to_string(),
            label: "yelp/structured_api".to_string(),
            per_day: Some(2),
        }];
        let report = summarize(&records, &store, &ledger, &["yelp".to_string()], &quotas, true);

        assert_eq!(report.total_records, 5);
        assert_eq!(report.processed, 3);
        assert_eq!(report.remaining, 3);

        let yelp = &report.sources[0];
        assert_eq!(yelp.matched, 2);
        assert_eq!(yelp.with_details, 1);
        assert_eq!(yelp.without_attributes, 1);
        assert_eq!(yelp.pending, 3);
        assert_eq!(yelp.quota[0].used_today, 1);
        assert_eq!(yelp.quota[0].days_remaining, Some(2));
        assert!(report.display_string().contains("1/2 today"));
    }

    #[test]
    fn test_days_needed() {
        assert_eq!(days_needed(0, 10), 0);
        assert_eq!(days_needed(10, 10), 1);
        assert_eq!(days_needed(11, 10), 2);
    }
}
