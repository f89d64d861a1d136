//! In-process stand-ins for directories and geocoders

use async_trait::async_trait;
use bizmap_resolver::adapters::SourceAdapter;
use bizmap_resolver::error::{classify_status, ResolveResult};
use bizmap_resolver::neighborhood::GeocodeProvider;
use bizmap_resolver::quota::QuotaLedger;
use bizmap_resolver::throttle::{BackoffPolicy, QuotaGuard, RequestGate};
use bizmap_resolver::types::{BusinessListing, Coordinates, RawCandidate, SourceRecord};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What a [`CountingAdapter`] answers
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// One candidate identical to the target
    Match,
    /// One candidate far below the name floor
    NoMatch,
    /// The given HTTP status, classified as a real adapter would
    Fail(u16),
}

/// Adapter that counts queries and routes them through a real [`RequestGate`]
pub struct CountingAdapter {
    name: String,
    behavior: Behavior,
    gate: RequestGate,
    calls: AtomicUsize,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl CountingAdapter {
    pub fn new(name: &str, behavior: Behavior) -> Self {
        Self::with_quota(name, behavior, None, Arc::new(QuotaLedger::in_memory()))
    }

    /// Gate with a per-run cap and no spacing
    pub fn with_quota(
        name: &str,
        behavior: Behavior,
        per_run: Option<u32>,
        ledger: Arc<QuotaLedger>,
    ) -> Self {
        let backoff = BackoffPolicy {
            base_delay: Duration::from_millis(1),
            ..BackoffPolicy::default()
        };
        Self {
            name: name.to_string(),
            behavior,
            gate: RequestGate::new(
                Duration::ZERO,
                QuotaGuard::new(name, per_run, None, ledger),
                backoff,
            ),
            calls: AtomicUsize::new(0),
            cancel_after: None,
        }
    }

    /// Cancel `token` once `calls` queries have been answered
    pub fn cancelling_after(mut self, calls: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((calls, token));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn answer(&self, target: &SourceRecord) -> ResolveResult<Vec<RawCandidate>> {
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &self.cancel_after {
            if calls >= *after {
                token.cancel();
            }
        }

        let name = match self.behavior {
            Behavior::Match => target.name.clone(),
            Behavior::NoMatch => "Zyx Qwv Plumbing Supply".to_string(),
            Behavior::Fail(status) => {
                return Err(classify_status(&self.name, status, "scripted failure").unwrap())
            }
        };

        let slug = name.to_lowercase().replace(' ', "-");
        Ok(vec![RawCandidate::Business(BusinessListing {
            id: slug.clone(),
            alias: Some(slug.clone()),
            name,
            url: format!("https://directory.test/biz/{}", slug),
            phone: None,
            city: Some(target.city.clone()),
            state: Some(target.state.clone()),
            rating: Some(4.5),
            review_count: Some(12),
        })])
    }
}

#[async_trait]
impl SourceAdapter for CountingAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query(&self, target: &SourceRecord) -> ResolveResult<Vec<RawCandidate>> {
        self.gate.execute(|| self.answer(target)).await
    }
}

/// What a [`FakeGeocoder`] tier answers
#[derive(Debug, Clone)]
pub enum GeocodeReply {
    Found(String),
    Nothing,
    Blocked,
    Fail(u16),
}

impl GeocodeReply {
    fn to_result(&self) -> ResolveResult<Option<String>> {
        match self {
            GeocodeReply::Found(name) => Ok(Some(name.clone())),
            GeocodeReply::Nothing => Ok(None),
            GeocodeReply::Blocked => Err(classify_status("geocoder", 403, "").unwrap()),
            GeocodeReply::Fail(status) => Err(classify_status("geocoder", *status, "").unwrap()),
        }
    }
}

/// Geocoder with scripted replies and per-tier call counters
pub struct FakeGeocoder {
    reverse: GeocodeReply,
    forward: GeocodeReply,
    pub reverse_calls: AtomicUsize,
    pub forward_calls: AtomicUsize,
}

impl FakeGeocoder {
    pub fn new(reverse: GeocodeReply, forward: GeocodeReply) -> Self {
        Self {
            reverse,
            forward,
            reverse_calls: AtomicUsize::new(0),
            forward_calls: AtomicUsize::new(0),
        }
    }

    pub fn reverse_calls(&self) -> usize {
        self.reverse_calls.load(Ordering::SeqCst)
    }

    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeocodeProvider for FakeGeocoder {
    async fn reverse(&self, _coordinates: Coordinates) -> ResolveResult<Option<String>> {
        self.reverse_calls.fetch_add(1, Ordering::SeqCst);
        self.reverse.to_result()
    }

    async fn forward(&self, _address: &str) -> ResolveResult<Option<String>> {
        self.forward_calls.fetch_add(1, Ordering::SeqCst);
        self.forward.to_result()
    }
}
