//! Checkpoint store
//!
//! The mapping file is a JSON object keyed by record id. It is loaded once,
//! mutated one record at a time and rewritten atomically after every
//! mutation, so an interruption loses at most the record in flight.
//!
//! Entries only ever gain information: a populated slot is never replaced
//! or cleared, and entries are never removed.

use crate::error::{ResolveError, ResolveResult};
use crate::quota::QuotaLedger;
use crate::repair::{repair_file, repair_text, RepairReport};
use crate::types::{MappingEntry, SourceRecord};
use bizmap_common::fs::write_json_atomic;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What a record still needs from the match run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    /// No entry yet
    New,
    /// Some configured slot still null and eligible for a search
    Incomplete,
    /// Nothing left to do
    Done,
}

/// Durable record-id -> [`MappingEntry`] map
#[derive(Debug)]
pub struct MappingStore {
    path: PathBuf,
    entries: BTreeMap<String, MappingEntry>,
    ledger: Option<Arc<QuotaLedger>>,
}

fn parse_entries(text: &str) -> Result<BTreeMap<String, MappingEntry>, serde_json::Error> {
    serde_json::from_str(text)
}

impl MappingStore {
    /// Open for writing, repairing a truncated file first.
    ///
    /// A missing file is an empty store. Returns the repair report when a
    /// repair was needed.
    pub fn open(path: &Path) -> ResolveResult<(Self, Option<RepairReport>)> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No mapping file yet, starting empty");
                return Ok((Self::empty(path), None));
            }
            Err(e) => return Err(e.into()),
        };

        let (entries, report) = match parse_entries(&text) {
            Ok(entries) => (entries, None),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Mapping file failed to parse, attempting repair");
                let report = repair_file(path)?;
                let repaired = std::fs::read_to_string(path)?;
                let entries = parse_entries(&repaired).map_err(|e| ResolveError::Corrupt {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
                (entries, Some(report))
            }
        };

        tracing::info!(path = %path.display(), entries = entries.len(), "Loaded mapping file");

        Ok((
            Self {
                path: path.to_path_buf(),
                entries,
                ledger: None,
            },
            report,
        ))
    }

    /// Open without ever writing. A truncated file is repaired in memory only.
    pub fn open_read_only(path: &Path) -> ResolveResult<Self> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::empty(path)),
            Err(e) => return Err(e.into()),
        };

        let entries = match parse_entries(&text) {
            Ok(entries) => entries,
            Err(_) => {
                let corrupt = |reason: String| ResolveError::Corrupt {
                    path: path.to_path_buf(),
                    reason,
                };
                let repaired = repair_text(&text).map_err(corrupt)?;
                tracing::warn!(
                    path = %path.display(),
                    strategy = %repaired.strategy,
                    "Mapping file is truncated; reading repaired copy"
                );
                parse_entries(&repaired.text).map_err(|e| corrupt(e.to_string()))?
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            ledger: None,
        })
    }

    fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            entries: BTreeMap::new(),
            ledger: None,
        }
    }

    /// Flush `ledger` together with every checkpoint write
    pub fn with_ledger(mut self, ledger: Arc<QuotaLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&MappingEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.values()
    }

    /// Merge `entry` into the store and persist immediately
    pub fn save(&mut self, entry: MappingEntry) -> ResolveResult<()> {
        match self.entries.get_mut(&entry.id) {
            Some(existing) => existing.absorb(entry),
            None => {
                self.entries.insert(entry.id.clone(), entry);
            }
        }
        self.flush()
    }

    /// Write the full map atomically, then the quota ledger
    pub fn flush(&self) -> ResolveResult<()> {
        write_json_atomic(&self.path, &self.entries)?;
        if let Some(ledger) = &self.ledger {
            ledger.flush()?;
        }
        Ok(())
    }

    /// Decide whether `record` needs querying.
    ///
    /// With `revisit_unmatched` off, a null slot whose source already ran to
    /// completion for this record counts as done.
    pub fn pending_state(
        &self,
        record: &SourceRecord,
        sources: &[&str],
        revisit_unmatched: bool,
    ) -> PendingState {
        let Some(entry) = self.entries.get(&record.id) else {
            return PendingState::New;
        };

        let outstanding = sources.iter().any(|source| {
            !entry.is_populated(source)
                && (revisit_unmatched || !entry.last_searched.contains_key(*source))
        });

        if outstanding {
            PendingState::Incomplete
        } else {
            PendingState::Done
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandidateMatch, MatchReason};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn entry_with_match(id: &str) -> MappingEntry {
        let record = SourceRecord::new(id, "Golden Dragon", "Austin", "TX").with_phone("512-555-0199");
        let mut entry = MappingEntry::for_record(&record, ["yelp", "tripadvisor"]);
        entry.fill_slot(
            "yelp",
            CandidateMatch {
                id: "golden-dragon-austin".to_string(),
                name: "Golden Dragon".to_string(),
                url: "https://www.yelp.com/biz/golden-dragon-austin".to_string(),
                score: 107.0,
                match_reasons: vec![MatchReason::CityMatch, MatchReason::ExactName],
            },
        );
        entry
            .last_searched
            .insert("tripadvisor".to_string(), Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        entry
    }

    #[test]
    fn test_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapping.json");

        let (mut store, report) = MappingStore::open(&path).unwrap();
        assert!(report.is_none());
        let entry = entry_with_match("r1");
        store.save(entry.clone()).unwrap();

        let (reloaded, _) = MappingStore::open(&path).unwrap();
        assert_eq!(reloaded.get("r1"), Some(&entry));
    }

    #[test]
    fn test_save_never_reverts_populated_slot() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapping.json");
        let (mut store, _) = MappingStore::open(&path).unwrap();

        store.save(entry_with_match("r1")).unwrap();

        let record = SourceRecord::new("r1", "Golden Dragon", "Austin", "TX");
        store
            .save(MappingEntry::for_record(&record, ["yelp", "tripadvisor"]))
            .unwrap();

        assert!(store.get("r1").unwrap().is_populated("yelp"));
    }

    #[test]
    fn test_pending_state() {
        let temp = TempDir::new().unwrap();
        let (mut store, _) = MappingStore::open(&temp.path().join("m.json")).unwrap();
        store.save(entry_with_match("r1")).unwrap();

        let known = SourceRecord::new("r1", "Golden Dragon", "Austin", "TX");
        let unknown = SourceRecord::new("r2", "Jade Palace", "Austin", "TX");

        assert_eq!(store.pending_state(&unknown, &["yelp"], true), PendingState::New);
        assert_eq!(store.pending_state(&known, &["yelp"], true), PendingState::Done);
        assert_eq!(
            store.pending_state(&known, &["yelp", "tripadvisor"], true),
            PendingState::Incomplete
        );
        // tripadvisor already searched without a match
        assert_eq!(
            store.pending_state(&known, &["yelp", "tripadvisor"], false),
            PendingState::Done
        );
    }

    #[test]
    fn test_truncated_file_is_repaired_on_open() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapping.json");

        let mut entries = BTreeMap::new();
        for i in 0..5 {
            let e = entry_with_match(&format!("r{}", i));
            entries.insert(e.id.clone(), e);
        }
        let text = serde_json::to_string_pretty(&entries).unwrap();
        std::fs::write(&path, &text[..text.len() - 40]).unwrap();

        let (store, report) = MappingStore::open(&path).unwrap();
        let report = report.unwrap();
        assert_eq!(store.len(), 4);
        assert!(report.backup.unwrap().exists());
    }

    #[test]
    fn test_read_only_open_does_not_write() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapping.json");
        std::fs::write(&path, r#"{"r1": {"id": "r1", "name": "A", "city": "B", "state": "C", "yelp": null}, "r2": {"id""#)
            .unwrap();

        let store = MappingStore::open_read_only(&path).unwrap();
        assert_eq!(store.len(), 1);
        assert!(!temp.path().join("mapping.json.backup").exists());
    }
}
