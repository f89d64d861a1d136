//! Daily request ledger
//!
//! Per-day caps must hold across restarts, so request counts are persisted in
//! a sidecar file (`<mapping>.quota.json`) keyed by UTC day and adapter label.
//! Per-run caps live in [`crate::throttle::QuotaGuard`] and reset every run.

use crate::error::ResolveResult;
use bizmap_common::fs::{write_backup, write_json_atomic};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Days of history kept in the ledger file
const RETAINED_DAYS: usize = 14;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct LedgerData {
    /// `YYYY-MM-DD` (UTC) -> adapter label -> requests issued
    days: BTreeMap<NaiveDate, BTreeMap<String, u32>>,
}

#[derive(Debug, Default)]
struct LedgerState {
    data: LedgerData,
    dirty: bool,
}

/// Request counts per adapter per UTC day
#[derive(Debug)]
pub struct QuotaLedger {
    path: Option<PathBuf>,
    state: Mutex<LedgerState>,
}

impl QuotaLedger {
    /// Ledger that is never written to disk (tests, read-only reports)
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Default sidecar location for a mapping file
    pub fn path_for(mapping: &Path) -> PathBuf {
        let mut name = mapping
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".quota.json");
        mapping.with_file_name(name)
    }

    /// Load the ledger, starting empty when the file does not exist.
    ///
    /// An unreadable ledger is backed up and replaced: losing history only
    /// makes the day cap more permissive for the current day.
    pub fn load(path: &Path) -> ResolveResult<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<LedgerData>(&content) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Quota ledger unreadable, starting a new one"
                    );
                    write_backup(path)?;
                    LedgerData::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerData::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path.to_path_buf()),
            state: Mutex::new(LedgerState { data, dirty: false }),
        })
    }

    /// Snapshot of the ledger for reporting. Never writes; an unreadable
    /// file reads as empty.
    pub fn load_read_only(path: &Path) -> ResolveResult<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<LedgerData>(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Quota ledger unreadable");
                LedgerData::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerData::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: None,
            state: Mutex::new(LedgerState { data, dirty: false }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        // Counters stay consistent even if a holder panicked mid-increment
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Requests issued today by `label`
    pub fn used_today(&self, label: &str) -> u32 {
        self.used_on(Self::today(), label)
    }

    pub fn used_on(&self, day: NaiveDate, label: &str) -> u32 {
        self.lock()
            .data
            .days
            .get(&day)
            .and_then(|d| d.get(label))
            .copied()
            .unwrap_or(0)
    }

    /// Count one request against today; returns the new total
    pub fn record(&self, label: &str) -> u32 {
        let mut state = self.lock();
        let count = state
            .data
            .days
            .entry(Self::today())
            .or_default()
            .entry(label.to_string())
            .or_insert(0);
        *count += 1;
        let total = *count;
        state.dirty = true;
        total
    }

    /// Persist pending counts. No-op for in-memory ledgers or when unchanged.
    pub fn flush(&self) -> ResolveResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let mut state = self.lock();
        if !state.dirty {
            return Ok(());
        }

        while state.data.days.len() > RETAINED_DAYS {
            let Some(oldest) = state.data.days.keys().next().copied() else {
                break;
            };
            state.data.days.remove(&oldest);
        }

        write_json_atomic(path, &state.data)?;
        state.dirty = false;
        Ok(())
    }
}
