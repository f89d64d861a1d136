//! Request spacing, quota enforcement and retry/backoff
//!
//! Every adapter funnels its network calls through one [`RequestGate`]:
//! 1. Check the per-run and per-day caps ([`QuotaGuard`])
//! 2. Wait for the spacing limiter (governor, one permit per `min_interval`)
//! 3. Issue the request
//! 4. On a retryable failure, wait `base_delay * attempt` and go again,
//!    up to `max_attempts` in total
//!
//! Each attempt counts against quota, since metered APIs bill retries too.

use crate::error::{QuotaScope, ResolveError, ResolveResult};
use crate::quota::QuotaLedger;
use bizmap_common::config::BackoffConfig;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Linear backoff policy shared by every adapter
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub retryable_statuses: HashSet<u16>,
    pub retry_network_errors: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&BackoffConfig::default())
    }
}

impl BackoffPolicy {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            retryable_statuses: config.retryable_statuses.iter().copied().collect(),
            retry_network_errors: config.retry_network_errors,
        }
    }

    /// Wait before the attempt following `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }

    /// Whether another attempt may fix this failure
    pub fn is_retryable(&self, err: &ResolveError) -> bool {
        match err {
            ResolveError::RateLimited { .. } => true,
            ResolveError::Upstream { status, .. } => self.retryable_statuses.contains(status),
            ResolveError::Network { .. } => self.retry_network_errors,
            _ => false,
        }
    }
}

/// Per-run and per-day request caps for one adapter
#[derive(Debug)]
pub struct QuotaGuard {
    label: String,
    per_run: Option<u32>,
    per_day: Option<u32>,
    used_this_run: AtomicU32,
    ledger: Arc<QuotaLedger>,
}

impl QuotaGuard {
    pub fn new(
        label: impl Into<String>,
        per_run: Option<u32>,
        per_day: Option<u32>,
        ledger: Arc<QuotaLedger>,
    ) -> Self {
        Self {
            label: label.into(),
            per_run,
            per_day,
            used_this_run: AtomicU32::new(0),
            ledger,
        }
    }

    /// No caps, in-memory ledger
    pub fn unlimited(label: impl Into<String>) -> Self {
        Self::new(label, None, None, Arc::new(QuotaLedger::in_memory()))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn per_day(&self) -> Option<u32> {
        self.per_day
    }

    pub fn used_this_run(&self) -> u32 {
        self.used_this_run.load(Ordering::SeqCst)
    }

    /// Reserve one request, or fail with [`ResolveError::QuotaExhausted`]
    pub fn acquire(&self) -> ResolveResult<()> {
        let used_run = self.used_this_run.load(Ordering::SeqCst);
        if let Some(limit) = self.per_run {
            if used_run >= limit {
                return Err(self.exhausted(QuotaScope::Run, used_run, limit));
            }
        }

        if let Some(limit) = self.per_day {
            let used_day = self.ledger.used_today(&self.label);
            if used_day >= limit {
                return Err(self.exhausted(QuotaScope::Day, used_day, limit));
            }
        }

        self.used_this_run.fetch_add(1, Ordering::SeqCst);
        self.ledger.record(&self.label);
        Ok(())
    }

    fn exhausted(&self, scope: QuotaScope, used: u32, limit: u32) -> ResolveError {
        ResolveError::QuotaExhausted {
            adapter: self.label.clone(),
            scope,
            used,
            limit,
        }
    }
}

/// Spacing + quota + backoff for one adapter's outbound requests
pub struct RequestGate {
    label: String,
    limiter: Option<DefaultDirectRateLimiter>,
    quota: QuotaGuard,
    backoff: BackoffPolicy,
}

impl std::fmt::Debug for RequestGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestGate")
            .field("label", &self.label)
            .field("spaced", &self.limiter.is_some())
            .field("quota", &self.quota)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl RequestGate {
    /// `min_interval` of zero disables spacing
    pub fn new(min_interval: Duration, quota: QuotaGuard, backoff: BackoffPolicy) -> Self {
        let limiter = Quota::with_period(min_interval).map(RateLimiter::direct);
        Self {
            label: quota.label().to_string(),
            limiter,
            quota,
            backoff,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn quota(&self) -> &QuotaGuard {
        &self.quota
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Run `op` under the gate's contract.
    ///
    /// Quota exhaustion is returned immediately and never retried.
    /// Non-retryable errors are returned as-is; retryable ones are returned
    /// after the last attempt fails.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> ResolveResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResolveResult<T>>,
    {
        let mut attempt = 1u32;

        loop {
            self.quota.acquire()?;

            if let Some(limiter) = &self.limiter {
                if limiter.check().is_err() {
                    tracing::debug!(adapter = %self.label, "Waiting for request spacing");
                    limiter.until_ready().await;
                }
            }

            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(adapter = %self.label, attempt, "Request succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) if attempt < self.backoff.max_attempts && self.backoff.is_retryable(&err) => {
                    let wait = self.backoff.delay_for(attempt);
                    tracing::warn!(
                        adapter = %self.label,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(err) => {
                    if self.backoff.is_retryable(&err) {
                        tracing::warn!(
                            adapter = %self.label,
                            attempts = attempt,
                            error = %err,
                            "Retries exhausted"
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
