//! Run configuration
//!
//! Materialises a [`TomlConfig`] into the values one run owns: resolved
//! paths, the matcher, the backoff policy and the adapter chains. API keys
//! resolve ENV → TOML.

use crate::adapters::rendered_page::RenderedPageSettings;
use crate::adapters::structured_api::StructuredApiSettings;
use crate::adapters::{HttpPageRenderer, RenderedPageAdapter, SourceAdapter, SourceChain, StructuredApiAdapter};
use crate::error::ResolveResult;
use crate::matcher::Matcher;
use crate::quota::QuotaLedger;
use crate::throttle::{BackoffPolicy, QuotaGuard, RequestGate};
use bizmap_common::config::{
    resolve_relative, AdapterConfig, GeocodingConfig, ScoringConfig, SourceConfig,
    StructuredApiConfig, TomlConfig,
};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const USER_AGENT: &str = concat!("bizmap/", env!("CARGO_PKG_VERSION"));

/// Ledger/log label for one adapter tier of one source
pub fn adapter_label(source: &str, adapter: &AdapterConfig) -> String {
    let kind = match adapter {
        AdapterConfig::StructuredApi(_) => "structured_api",
        AdapterConfig::RenderedPage(_) => "rendered_page",
    };
    format!("{}/{}", source, kind)
}

/// Daily cap of one adapter tier, for reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterQuota {
    pub source: String,
    pub label: String,
    pub per_day: Option<u32>,
}

/// Validate API key (non-empty, non-whitespace)
fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Resolve a structured API key.
///
/// **Priority:** ENV (`api_key_env`) → TOML (`api_key`)
pub fn resolve_api_key(source: &str, config: &StructuredApiConfig) -> Option<String> {
    let env_key = std::env::var(&config.api_key_env)
        .ok()
        .filter(|k| is_valid_key(k));
    let toml_key = config.api_key.clone().filter(|k| is_valid_key(k));

    if env_key.is_some() && toml_key.is_some() {
        tracing::warn!(
            source = %source,
            env = %config.api_key_env,
            "API key found in both environment and TOML. Using environment."
        );
    }

    match (env_key, toml_key) {
        (Some(key), _) => {
            tracing::debug!(source = %source, "API key loaded from environment variable");
            Some(key)
        }
        (None, Some(key)) => {
            tracing::debug!(source = %source, "API key loaded from TOML config");
            Some(key)
        }
        (None, None) => None,
    }
}

/// Everything one run needs, resolved from the config file and data folder
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub data_folder: PathBuf,
    pub input_file: PathBuf,
    pub mapping_file: PathBuf,
    pub quota_ledger: PathBuf,
    pub scoring: ScoringConfig,
    pub backoff: BackoffPolicy,
    pub geocoding: GeocodingConfig,
    pub revisit_unmatched: bool,
    pub sources: Vec<SourceConfig>,
}

impl RunConfig {
    pub fn from_toml(config: &TomlConfig, data_folder: &Path) -> Self {
        let mapping_file = resolve_relative(data_folder, &config.paths.mapping_file);
        let quota_ledger = config
            .paths
            .quota_ledger
            .as_deref()
            .map(|p| resolve_relative(data_folder, p))
            .unwrap_or_else(|| QuotaLedger::path_for(&mapping_file));

        Self {
            data_folder: data_folder.to_path_buf(),
            input_file: resolve_relative(data_folder, &config.paths.input_file),
            mapping_file,
            quota_ledger,
            scoring: config.scoring.clone(),
            backoff: BackoffPolicy::from_config(&config.backoff),
            geocoding: config.geocoding.clone(),
            revisit_unmatched: config.run.revisit_unmatched,
            sources: config.sources.clone(),
        }
    }

    pub fn matcher(&self) -> Matcher {
        Matcher::new(self.scoring.clone())
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.name.clone()).collect()
    }

    pub fn adapter_quotas(&self) -> Vec<AdapterQuota> {
        self.sources
            .iter()
            .flat_map(|source| {
                source.adapters.iter().map(move |adapter| AdapterQuota {
                    source: source.name.clone(),
                    label: adapter_label(&source.name, adapter),
                    per_day: match adapter {
                        AdapterConfig::StructuredApi(c) => c.requests_per_day,
                        AdapterConfig::RenderedPage(c) => c.requests_per_day,
                    },
                })
            })
            .collect()
    }

    /// Build one chain per source, adapters in configured order.
    ///
    /// A structured API tier without a key is left out with a warning; a
    /// source left with no adapters at all is dropped from the run.
    pub fn build_chains(&self, ledger: Arc<QuotaLedger>) -> ResolveResult<Vec<SourceChain>> {
        let mut chains = Vec::with_capacity(self.sources.len());

        for source in &self.sources {
            let mut adapters: Vec<Arc<dyn SourceAdapter>> = Vec::new();

            for adapter in &source.adapters {
                let label = adapter_label(&source.name, adapter);
                match adapter {
                    AdapterConfig::StructuredApi(api) => {
                        let Some(api_key) = resolve_api_key(&source.name, api) else {
                            tracing::warn!(
                                adapter = %label,
                                env = %api.api_key_env,
                                "No API key configured; skipping adapter"
                            );
                            continue;
                        };
                        let gate = RequestGate::new(
                            Duration::from_millis(api.min_interval_ms),
                            QuotaGuard::new(
                                label.clone(),
                                api.requests_per_run,
                                api.requests_per_day,
                                Arc::clone(&ledger),
                            ),
                            self.backoff.clone(),
                        );
                        let settings = StructuredApiSettings {
                            base_url: api.base_url.clone(),
                            api_key,
                            search_limit: api.search_limit,
                            categories: api.categories.clone(),
                            timeout: Duration::from_secs(api.timeout_secs),
                            user_agent: USER_AGENT.to_string(),
                        };
                        adapters.push(Arc::new(StructuredApiAdapter::new(label, settings, gate)?));
                    }
                    AdapterConfig::RenderedPage(page) => {
                        let link_pattern = Regex::new(&page.link_pattern).map_err(|e| {
                            bizmap_common::Error::Config(format!(
                                "{}: invalid link_pattern: {}",
                                label, e
                            ))
                        })?;
                        let gate = RequestGate::new(
                            Duration::from_millis(page.min_interval_ms),
                            QuotaGuard::new(
                                label.clone(),
                                page.requests_per_run,
                                page.requests_per_day,
                                Arc::clone(&ledger),
                            ),
                            self.backoff.clone(),
                        );
                        let renderer = Arc::new(HttpPageRenderer::new(
                            label.clone(),
                            Duration::from_secs(page.timeout_secs),
                        )?);
                        let settings = RenderedPageSettings {
                            home_url: page.home_url.clone(),
                            search_url: page.search_url.clone(),
                            link_pattern,
                            settle: Duration::from_millis(page.settle_ms),
                        };
                        adapters.push(Arc::new(RenderedPageAdapter::new(
                            label, renderer, settings, gate,
                        )));
                    }
                }
            }

            if adapters.is_empty() {
                tracing::warn!(source = %source.name, "No usable adapters; source skipped this run");
                continue;
            }
            chains.push(SourceChain::new(source.name.clone(), adapters));
        }

        if chains.is_empty() {
            return Err(bizmap_common::Error::Config(
                "no source has a usable adapter (check API key environment variables)".to_string(),
            )
            .into());
        }

        Ok(chains)
    }
}
