//! Configuration file model and resolution
//!
//! Every field carries a default, so an empty `bizmap.toml` (or no file at
//! all) yields a usable configuration. Secrets are never read from here
//! directly; structured API adapters name an environment variable instead.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "BIZMAP_CONFIG";

/// Environment variable naming the data folder
pub const DATA_DIR_ENV_VAR: &str = "BIZMAP_DATA_DIR";

/// Top-level `bizmap.toml` contents
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub logging: LoggingConfig,
    pub paths: PathsConfig,
    pub scoring: ScoringConfig,
    pub backoff: BackoffConfig,
    pub geocoding: GeocodingConfig,
    pub run: RunOptions,
    /// External directories, one mapping slot each, in processing order
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            paths: PathsConfig::default(),
            scoring: ScoringConfig::default(),
            backoff: BackoffConfig::default(),
            geocoding: GeocodingConfig::default(),
            run: RunOptions::default(),
            sources: default_sources(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// File locations. Relative paths resolve against the data folder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_folder: Option<PathBuf>,
    /// Keyed collection of source records
    pub input_file: PathBuf,
    /// Checkpoint / mapping output
    pub mapping_file: PathBuf,
    /// Daily quota ledger (defaults to `<mapping_file>.quota.json`)
    pub quota_ledger: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_folder: None,
            input_file: PathBuf::from("records.json"),
            mapping_file: PathBuf::from("mapping.json"),
            quota_ledger: None,
        }
    }
}

/// Matcher thresholds and bonuses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Candidates below this name similarity are discarded outright
    pub name_floor: f64,
    pub city_bonus: f64,
    pub phone_bonus: f64,
    /// `exact_name` reason at or above this similarity
    pub exact_name_threshold: f64,
    /// `high_name_similarity` reason at or above this similarity
    pub high_similarity_threshold: f64,
    /// Only the first N candidates of an adapter response are scored
    pub max_candidates: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            name_floor: 70.0,
            city_bonus: 10.0,
            phone_bonus: 20.0,
            exact_name_threshold: 90.0,
            high_similarity_threshold: 80.0,
            max_candidates: 10,
        }
    }
}

/// Retry policy shared by every adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Total attempts per request, including the first
    pub max_attempts: u32,
    /// Wait before attempt `n + 1` is `base_delay_ms * n`
    pub base_delay_ms: u64,
    pub retryable_statuses: Vec<u16>,
    /// Treat connect/timeout failures like a retryable status
    pub retry_network_errors: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2000,
            retryable_statuses: vec![429, 503],
            retry_network_errors: true,
        }
    }
}

/// Reverse/forward geocoder used by the neighborhood pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodingConfig {
    pub base_url: String,
    pub user_agent: String,
    /// Courtesy spacing between requests (the public Nominatim asks for >= 1s)
    pub min_interval_ms: u64,
    pub timeout_secs: u64,
    /// Save the snapshot after this many updated records
    pub batch_size: usize,
    /// Stop the pass after this many unexpected failures in a row
    pub max_consecutive_errors: u32,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://nominatim.openstreetmap.org".to_string(),
            user_agent: concat!("bizmap/", env!("CARGO_PKG_VERSION")).to_string(),
            min_interval_ms: 1200,
            timeout_secs: 15,
            batch_size: 50,
            max_consecutive_errors: 10,
        }
    }
}

/// Per-run behaviour switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Re-query null slots that an earlier run already searched
    pub revisit_unmatched: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            revisit_unmatched: true,
        }
    }
}

/// One external directory and its adapters in priority order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Slot name in the mapping file (e.g. "yelp")
    pub name: String,
    pub adapters: Vec<AdapterConfig>,
}

/// Adapter tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterConfig {
    StructuredApi(StructuredApiConfig),
    RenderedPage(RenderedPageConfig),
}

/// Structured search endpoint (metered)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredApiConfig {
    pub base_url: String,
    /// Environment variable holding the bearer token
    pub api_key_env: String,
    /// Inline fallback; the environment variable wins when both are set
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_search_limit")]
    pub search_limit: u32,
    #[serde(default)]
    pub categories: Option<String>,
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_interval")]
    pub min_interval_ms: u64,
    #[serde(default)]
    pub requests_per_run: Option<u32>,
    #[serde(default)]
    pub requests_per_day: Option<u32>,
}

/// Rendered search page (courtesy-limited)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderedPageConfig {
    /// Visited once per session before the first query
    pub home_url: String,
    /// Search page URL with `{query}` and `{location}` placeholders
    pub search_url: String,
    /// Regex matched against link hrefs; capture group 1 is the listing id
    pub link_pattern: String,
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    #[serde(default = "default_page_interval")]
    pub min_interval_ms: u64,
    #[serde(default = "default_page_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub requests_per_run: Option<u32>,
    #[serde(default)]
    pub requests_per_day: Option<u32>,
}

fn default_search_limit() -> u32 {
    10
}

fn default_api_timeout() -> u64 {
    10
}

fn default_api_interval() -> u64 {
    200
}

fn default_settle_ms() -> u64 {
    4000
}

fn default_page_interval() -> u64 {
    2000
}

fn default_page_timeout() -> u64 {
    15
}

/// Built-in directory set used when the config file names none
pub fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig {
            name: "yelp".to_string(),
            adapters: vec![
                AdapterConfig::StructuredApi(StructuredApiConfig {
                    base_url: "https://api.yelp.com/v3".to_string(),
                    api_key_env: "YELP_API_KEY".to_string(),
                    api_key: None,
                    search_limit: default_search_limit(),
                    categories: Some("restaurants".to_string()),
                    timeout_secs: default_api_timeout(),
                    min_interval_ms: default_api_interval(),
                    requests_per_run: None,
                    requests_per_day: Some(5000),
                }),
                AdapterConfig::RenderedPage(RenderedPageConfig {
                    home_url: "https://www.yelp.com/".to_string(),
                    search_url: "https://www.yelp.com/search?find_desc={query}&find_loc={location}"
                        .to_string(),
                    link_pattern: r"/biz/([^/?#]+)".to_string(),
                    settle_ms: default_settle_ms(),
                    min_interval_ms: default_page_interval(),
                    timeout_secs: default_page_timeout(),
                    requests_per_run: None,
                    requests_per_day: None,
                }),
            ],
        },
        SourceConfig {
            name: "tripadvisor".to_string(),
            adapters: vec![AdapterConfig::RenderedPage(RenderedPageConfig {
                home_url: "https://www.tripadvisor.com/".to_string(),
                search_url: "https://www.tripadvisor.com/Search?q={query}".to_string(),
                link_pattern: r"/Restaurant_Review-(g\d+-d\d+)".to_string(),
                settle_ms: 5000,
                min_interval_ms: default_page_interval(),
                timeout_secs: default_page_timeout(),
                requests_per_run: None,
                requests_per_day: None,
            })],
        },
    ]
}

/// Locate the config file.
///
/// Priority:
/// 1. Command-line argument
/// 2. `BIZMAP_CONFIG` environment variable
/// 3. `<config_dir>/bizmap/bizmap.toml` if it exists
///
/// Returns `None` when nothing is found; callers fall back to defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir()
        .map(|d| d.join("bizmap").join("bizmap.toml"))
        .filter(|p| p.exists())
}

/// Load and parse a config file. `None` yields the built-in defaults.
pub fn load_toml_config(path: Option<&Path>) -> Result<TomlConfig> {
    let Some(path) = path else {
        return Ok(TomlConfig::default());
    };

    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let config: TomlConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

impl TomlConfig {
    /// Reject configurations that cannot drive a run
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(Error::Config("at least one [[sources]] entry is required".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if source.name.trim().is_empty() {
                return Err(Error::Config("source name must not be empty".to_string()));
            }
            if !seen.insert(source.name.as_str()) {
                return Err(Error::Config(format!("duplicate source name '{}'", source.name)));
            }
            if source.adapters.is_empty() {
                return Err(Error::Config(format!(
                    "source '{}' has no adapters",
                    source.name
                )));
            }
        }

        if self.backoff.max_attempts == 0 {
            return Err(Error::Config("backoff.max_attempts must be at least 1".to_string()));
        }

        Ok(())
    }
}

/// Data folder resolution:
/// 1. Command-line argument
/// 2. `BIZMAP_DATA_DIR` environment variable
/// 3. `[paths] data_folder` from the config file
/// 4. OS-dependent default
pub fn resolve_data_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(DATA_DIR_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.paths.data_folder {
        return path.clone();
    }

    get_default_data_folder()
}

fn get_default_data_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("bizmap"))
        .unwrap_or_else(|| PathBuf::from("./bizmap_data"))
}

/// Join `path` onto `base` unless it is already absolute
pub fn resolve_relative(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
