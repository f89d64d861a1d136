//! Enrichment pass: attach listing details to already matched slots

use super::statistics::EnrichmentStatistics;
use super::{RunOutcome, RunStatus};
use crate::adapters::{SourceAdapter, SourceChain};
use crate::checkpoint::MappingStore;
use crate::error::{ResolveError, ResolveResult};
use crate::types::{CandidateMatch, ListingDetails};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

const MENU_URL_KEY: &str = "menu_url";

/// Absolute form of `raw` resolved against `base`, without query or fragment
fn absolute_menu_url(raw: &str, base: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut url = match Url::parse(base) {
        Ok(base) => base.join(raw).ok()?,
        Err(_) => Url::parse(raw).ok()?,
    };
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);
    Some(url.to_string())
}

/// Tidy a details block fetched for the listing at `listing_url`.
///
/// Counts photos, drops an attribute map holding nothing but `undefined`,
/// and turns the menu link (attribute or top-level) into an absolute URL
/// without query parameters.
pub fn normalize_details(details: &mut ListingDetails, listing_url: &str) {
    details.photos_count = details.photos.len();

    if details.attributes.len() == 1 && details.attributes.contains_key("undefined") {
        details.attributes.clear();
    }

    let raw = details
        .attributes
        .get(MENU_URL_KEY)
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| details.menu_url.clone());

    let Some(raw) = raw else {
        return;
    };

    match absolute_menu_url(&raw, listing_url) {
        Some(menu) => {
            if details.attributes.contains_key(MENU_URL_KEY) {
                details
                    .attributes
                    .insert(MENU_URL_KEY.to_string(), Value::String(menu.clone()));
            }
            details.menu_url = Some(menu);
        }
        None => {
            tracing::debug!(menu_url = %raw, "Discarding unusable menu URL");
            details.menu_url = None;
        }
    }
}

struct PendingDetail {
    record_id: String,
    source: String,
    candidate: CandidateMatch,
    adapter: Arc<dyn SourceAdapter>,
}

/// Sequential, checkpointed details fetch
pub struct EnrichmentRun {
    run_id: Uuid,
    chains: Vec<SourceChain>,
}

impl EnrichmentRun {
    pub fn new(chains: Vec<SourceChain>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            chains,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn pending(&self, store: &MappingStore) -> Vec<PendingDetail> {
        let mut work = Vec::new();
        for entry in store.entries() {
            for chain in &self.chains {
                let Some(adapter) = chain.details_adapter() else {
                    continue;
                };
                let Some(slot) = entry.slot(chain.source()) else {
                    continue;
                };
                if slot.details.is_some() {
                    continue;
                }
                work.push(PendingDetail {
                    record_id: entry.id.clone(),
                    source: chain.source().to_string(),
                    candidate: slot.candidate.clone(),
                    adapter: Arc::clone(adapter),
                });
            }
        }
        work
    }

    /// Fetch details for every matched slot that lacks them
    pub async fn execute(
        &self,
        store: &mut MappingStore,
        cancel: &CancellationToken,
    ) -> ResolveResult<RunOutcome<EnrichmentStatistics>> {
        let work = self.pending(store);
        let mut stats = EnrichmentStatistics {
            pending: work.len(),
            ..Default::default()
        };

        tracing::info!(run_id = %self.run_id, pending = work.len(), "Enrichment starting");

        let mut status = RunStatus::Completed;

        for item in work {
            if cancel.is_cancelled() {
                status = RunStatus::Interrupted;
                break;
            }

            let fetched = tokio::select! {
                _ = cancel.cancelled() => {
                    status = RunStatus::Interrupted;
                    break;
                }
                fetched = item.adapter.details(&item.candidate) => fetched,
            };

            let mut details = match fetched {
                Ok(Some(details)) => details,
                Ok(None) | Err(ResolveError::NotFound(_)) => {
                    tracing::info!(
                        record_id = %item.record_id,
                        source = %item.source,
                        listing = %item.candidate.id,
                        "Listing not found upstream"
                    );
                    stats.not_found += 1;
                    continue;
                }
                Err(e) => match RunStatus::from_error(&e) {
                    Some(stop) => {
                        tracing::warn!(record_id = %item.record_id, error = %e, "Stopping enrichment");
                        status = stop;
                        break;
                    }
                    None => {
                        tracing::error!(
                            record_id = %item.record_id,
                            source = %item.source,
                            error = %e,
                            "Details fetch failed, skipping"
                        );
                        stats.errors += 1;
                        continue;
                    }
                },
            };

            normalize_details(&mut details, &item.candidate.url);

            let Some(mut entry) = store.get(&item.record_id).cloned() else {
                continue;
            };
            let Some(slot) = entry.slot_mut(&item.source) else {
                continue;
            };
            slot.details = Some(details);
            store.save(entry)?;

            tracing::info!(record_id = %item.record_id, source = %item.source, "Details attached");
            stats.enriched += 1;
        }

        store.flush()?;

        tracing::info!(
            run_id = %self.run_id,
            status = %status,
            summary = %stats.display_string(),
            "Enrichment finished"
        );

        Ok(RunOutcome {
            status,
            statistics: stats,
        })
    }
}
