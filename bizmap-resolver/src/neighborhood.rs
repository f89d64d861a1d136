//! Neighborhood inference for place snapshots
//!
//! Tiers, each tried only when the previous one produced nothing:
//! 1. Reverse geocode the coordinates
//! 2. Forward geocode the free-text address
//! 3. Parse the address string heuristically
//!
//! The two network tiers go through the same [`RequestGate`] contract as the
//! directory adapters. A 403 from the geocoder skips both network tiers for
//! that record only.

use crate::error::{classify_status, ResolveError, ResolveResult};
use crate::repair::repair_file;
use crate::throttle::{BackoffPolicy, QuotaGuard, RequestGate};
use crate::types::Coordinates;
use async_trait::async_trait;
use bizmap_common::config::GeocodingConfig;
use bizmap_common::fs::{write_backup, write_json_atomic};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Address fields consulted in order, most specific first
pub const NEIGHBORHOOD_FIELDS: &[&str] = &[
    "neighbourhood",
    "suburb",
    "city_district",
    "quarter",
    "residential",
    "subdistrict",
    "district",
];

/// Words that mark an address component as a locality
pub const LOCALITY_INDICATORS: &[&str] = &[
    "Heights", "Park", "Square", "Village", "Hills", "Beach", "Bay", "North", "South", "East",
    "West", "Central",
];

/// One element of a place snapshot. Unknown fields pass through untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neighborhood: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl PlaceRecord {
    pub fn has_neighborhood(&self) -> bool {
        self.neighborhood
            .as_deref()
            .map(|n| !n.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Which tier produced a neighborhood
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborhoodTier {
    Reverse,
    Forward,
    AddressParse,
}

/// Reverse and forward geocoding returning a neighborhood name
#[async_trait]
pub trait GeocodeProvider: Send + Sync {
    async fn reverse(&self, coordinates: Coordinates) -> ResolveResult<Option<String>>;
    async fn forward(&self, address: &str) -> ResolveResult<Option<String>>;
}

/// First populated neighborhood field of a geocoder `address` block
pub fn neighborhood_from_address_block(result: &Value) -> Option<String> {
    let address = result.get("address")?.as_object()?;
    NEIGHBORHOOD_FIELDS.iter().find_map(|field| {
        address
            .get(*field)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    })
}

/// Nominatim-style geocoder
pub struct NominatimClient {
    client: Client,
    base_url: String,
    gate: RequestGate,
}

impl NominatimClient {
    pub fn new(config: &GeocodingConfig, backoff: BackoffPolicy) -> ResolveResult<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ResolveError::Unexpected(format!("Failed to build HTTP client: {}", e)))?;

        let gate = RequestGate::new(
            Duration::from_millis(config.min_interval_ms),
            QuotaGuard::unlimited("geocoder"),
            backoff,
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            gate,
        })
    }

    async fn get(&self, path: &str, query: &[(&str, String)]) -> ResolveResult<Value> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| ResolveError::network("geocoder", e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("geocoder", status, &body)
                .unwrap_or_else(|| ResolveError::upstream("geocoder", status, &body)));
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ResolveError::Unexpected(format!("geocoder: invalid response body: {}", e)))
    }
}

#[async_trait]
impl GeocodeProvider for NominatimClient {
    async fn reverse(&self, coordinates: Coordinates) -> ResolveResult<Option<String>> {
        let query = [
            ("lat", coordinates.lat.to_string()),
            ("lon", coordinates.lng.to_string()),
            ("format", "json".to_string()),
            ("addressdetails", "1".to_string()),
            ("zoom", "18".to_string()),
        ];
        let result = self.gate.execute(|| self.get("reverse", &query)).await?;
        Ok(neighborhood_from_address_block(&result))
    }

    async fn forward(&self, address: &str) -> ResolveResult<Option<String>> {
        let query = [
            ("q", address.to_string()),
            ("format", "json".to_string()),
            ("addressdetails", "1".to_string()),
            ("limit", "1".to_string()),
        ];
        let results = self.gate.execute(|| self.get("search", &query)).await?;
        Ok(results
            .as_array()
            .and_then(|items| items.first())
            .and_then(neighborhood_from_address_block))
    }
}

fn state_code_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]{2}$").expect("state code pattern is valid"))
}

fn zip_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{5}").expect("zip pattern is valid"))
}

/// Pull a neighborhood out of `"street, <candidate>, city, ST 12345, USA"`.
///
/// The second comma-separated component is accepted when it is a short
/// capitalised phrase containing a locality indicator, or a single
/// alphabetic word, and is none of: a state code, a ZIP, the city, the state.
pub fn parse_neighborhood_from_address(
    address: &str,
    city: Option<&str>,
    state: Option<&str>,
) -> Option<String> {
    let cleaned = address.replace(", USA", "");
    let parts: Vec<&str> = cleaned.trim().split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }

    let candidate = parts[1];
    if candidate.is_empty()
        || state_code_regex().is_match(candidate)
        || zip_regex().is_match(candidate)
    {
        return None;
    }

    let same_as = |other: Option<&str>| {
        other
            .map(|o| o.trim().eq_ignore_ascii_case(candidate))
            .unwrap_or(false)
    };
    if same_as(city) || same_as(state) {
        return None;
    }

    let words = candidate.split_whitespace().count();
    let capitalised = candidate.chars().next().map(char::is_uppercase).unwrap_or(false);
    if words > 3 || !capitalised {
        return None;
    }

    if LOCALITY_INDICATORS.iter().any(|i| candidate.contains(i)) {
        return Some(candidate.to_string());
    }

    if words == 1 && candidate.chars().all(char::is_alphabetic) {
        return Some(candidate.to_string());
    }

    None
}

/// Run the tiers for one place
pub async fn resolve_neighborhood(
    place: &PlaceRecord,
    geocoder: &dyn GeocodeProvider,
) -> ResolveResult<Option<(String, NeighborhoodTier)>> {
    let mut geocoder_blocked = false;
    let mut last_error = None;

    if let Some(coordinates) = place.location.filter(Coordinates::is_valid) {
        match geocoder.reverse(coordinates).await {
            Ok(Some(name)) => return Ok(Some((name, NeighborhoodTier::Reverse))),
            Ok(None) => {}
            Err(e @ ResolveError::PermanentBlock { .. }) => {
                tracing::warn!(error = %e, "Geocoder refused request, skipping network tiers");
                geocoder_blocked = true;
            }
            Err(e) => {
                tracing::debug!(error = %e, "Reverse geocode failed, trying next tier");
                last_error = Some(e);
            }
        }
    }

    let address = place.address.as_deref().map(str::trim).filter(|a| !a.is_empty());

    if let (Some(address), false) = (address, geocoder_blocked) {
        match geocoder.forward(address).await {
            Ok(Some(name)) => return Ok(Some((name, NeighborhoodTier::Forward))),
            Ok(None) => {}
            Err(e @ ResolveError::PermanentBlock { .. }) => {
                tracing::warn!(error = %e, "Geocoder refused request, skipping network tiers");
            }
            Err(e) => {
                tracing::debug!(error = %e, "Forward geocode failed, trying next tier");
                last_error = Some(e);
            }
        }
    }

    let parsed = address
        .and_then(|a| parse_neighborhood_from_address(a, place.city.as_deref(), place.state.as_deref()))
        .map(|name| (name, NeighborhoodTier::AddressParse));

    // A network failure only counts when no tier produced a name
    match (parsed, last_error) {
        (Some(found), _) => Ok(Some(found)),
        (None, Some(e)) => Err(e),
        (None, None) => Ok(None),
    }
}

/// How the pass ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    Completed,
    Interrupted,
    TooManyErrors,
}

/// Counters for one neighborhood pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NeighborhoodSummary {
    pub total: usize,
    pub already_filled: usize,
    pub updated: usize,
    pub by_reverse: usize,
    pub by_forward: usize,
    pub by_address: usize,
    pub not_found: usize,
    pub errors: usize,
    pub status: Option<PassStatus>,
}

fn load_places(path: &Path) -> ResolveResult<Vec<PlaceRecord>> {
    let text = std::fs::read_to_string(path)?;
    match serde_json::from_str(&text) {
        Ok(places) => Ok(places),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "Snapshot failed to parse, attempting repair");
            repair_file(path)?;
            let repaired = std::fs::read_to_string(path)?;
            serde_json::from_str(&repaired).map_err(|e| ResolveError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    }
}

/// Writes the snapshot back, backing up the original before the first write
struct SnapshotWriter<'a> {
    path: &'a Path,
    backed_up: bool,
}

impl SnapshotWriter<'_> {
    fn save(&mut self, places: &[PlaceRecord]) -> ResolveResult<()> {
        if !self.backed_up {
            write_backup(self.path)?;
            self.backed_up = true;
        }
        write_json_atomic(self.path, places)?;
        Ok(())
    }
}

/// Fill missing neighborhoods in the snapshot at `path`, in place
pub async fn fill_neighborhoods(
    path: &Path,
    geocoder: &dyn GeocodeProvider,
    config: &GeocodingConfig,
    cancel: &CancellationToken,
) -> ResolveResult<NeighborhoodSummary> {
    let mut places = load_places(path)?;
    let mut writer = SnapshotWriter {
        path,
        backed_up: false,
    };
    let mut summary = NeighborhoodSummary {
        total: places.len(),
        ..Default::default()
    };
    let batch_size = config.batch_size.max(1);
    let mut unsaved = 0usize;
    let mut consecutive_errors = 0u32;
    let mut status = PassStatus::Completed;

    for index in 0..places.len() {
        if places[index].has_neighborhood() {
            summary.already_filled += 1;
            continue;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                status = PassStatus::Interrupted;
                break;
            }
            result = resolve_neighborhood(&places[index], geocoder) => result,
        };

        let label = places[index].title.clone().unwrap_or_else(|| format!("#{}", index));
        match result {
            Ok(Some((name, tier))) => {
                tracing::info!(place = %label, neighborhood = %name, tier = ?tier, "Neighborhood found");
                match tier {
                    NeighborhoodTier::Reverse => summary.by_reverse += 1,
                    NeighborhoodTier::Forward => summary.by_forward += 1,
                    NeighborhoodTier::AddressParse => summary.by_address += 1,
                }
                places[index].neighborhood = Some(name);
                summary.updated += 1;
                unsaved += 1;
                consecutive_errors = 0;
            }
            Ok(None) => {
                tracing::debug!(place = %label, "No neighborhood found");
                summary.not_found += 1;
                consecutive_errors = 0;
            }
            Err(e) => {
                tracing::error!(place = %label, error = %e, "Neighborhood lookup failed");
                summary.errors += 1;
                consecutive_errors += 1;
                if consecutive_errors >= config.max_consecutive_errors.max(1) {
                    status = PassStatus::TooManyErrors;
                    break;
                }
            }
        }

        if unsaved >= batch_size {
            writer.save(&places)?;
            tracing::info!(updated = summary.updated, "Progress saved");
            unsaved = 0;
        }
    }

    if unsaved > 0 {
        writer.save(&places)?;
    }

    summary.status = Some(status);
    tracing::info!(
        total = summary.total,
        updated = summary.updated,
        not_found = summary.not_found,
        errors = summary.errors,
        status = ?status,
        "Neighborhood pass finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_address_parse_indicator_phrase() {
        assert_eq!(
            parse_neighborhood_from_address("123 Main St, Crown Heights, Brooklyn, NY 11213, USA", Some("Brooklyn"), None),
            Some("Crown Heights".to_string())
        );
    }

    #[test]
    fn test_address_parse_single_word() {
        assert_eq!(
            parse_neighborhood_from_address("55 Elm St, Hyde, Austin, TX 78751", Some("Austin"), None),
            Some("Hyde".to_string())
        );
    }

    #[test]
    fn test_address_parse_rejections() {
        // state code
        assert_eq!(parse_neighborhood_from_address("1 A St, TX, 78701", None, None), None);
        // zip
        assert_eq!(parse_neighborhood_from_address("1 A St, 78701, Austin", None, None), None);
        // the city itself
        assert_eq!(
            parse_neighborhood_from_address("1 A St, Austin, TX 78701, USA", Some("Austin"), None),
            None
        );
        // too few parts
        assert_eq!(parse_neighborhood_from_address("1 A St, Austin", None, None), None);
        // lowercase, multi-word without an indicator, or too long
        assert_eq!(parse_neighborhood_from_address("1 A St, downtown, Austin, TX", None, None), None);
        assert_eq!(parse_neighborhood_from_address("1 A St, Suite 200, Austin, TX", None, None), None);
        assert_eq!(
            parse_neighborhood_from_address("1 A St, Near The Old Mill Park, Austin, TX", None, None),
            None
        );
    }

    #[test]
    fn test_neighborhood_field_priority() {
        let result = json!({"address": {"suburb": "Hyde Park", "neighbourhood": "North Loop", "city": "Austin"}});
        assert_eq!(neighborhood_from_address_block(&result), Some("North Loop".to_string()));

        let result = json!({"address": {"district": "Travis", "city_district": "Central"}});
        assert_eq!(neighborhood_from_address_block(&result), Some("Central".to_string()));

        assert_eq!(neighborhood_from_address_block(&json!({"error": "Unable to geocode"})), None);
    }

    #[test]
    fn test_place_record_preserves_unknown_fields() {
        let json = r#"{"title": "Jade", "address": "1 A St", "city": "Austin",
                       "location": {"lat": 30.1, "lng": -97.7}, "rating": 4.2, "tags": ["x"]}"#;
        let place: PlaceRecord = serde_json::from_str(json).unwrap();
        assert!(!place.has_neighborhood());
        let back = serde_json::to_value(&place).unwrap();
        assert_eq!(back["rating"], 4.2);
        assert_eq!(back["tags"][0], "x");
        assert!(back.get("neighborhood").is_none());
    }

    #[tokio::test]
    async fn test_nominatim_reverse_and_forward() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/reverse")
                    .query_param("format", "json")
                    .query_param("zoom", "18")
                    .header("user-agent", "bizmap-test");
                then.status(200)
                    .json_body(json!({"address": {"suburb": "Mueller", "city": "Austin"}}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/search").query_param("limit", "1");
                then.status(200).json_body(json!([]));
            })
            .await;

        let config = GeocodingConfig {
            base_url: server.base_url(),
            user_agent: "bizmap-test".to_string(),
            min_interval_ms: 0,
            ..GeocodingConfig::default()
        };
        let client = NominatimClient::new(&config, BackoffPolicy::default()).unwrap();

        let found = client.reverse(Coordinates { lat: 30.3, lng: -97.7 }).await.unwrap();
        assert_eq!(found.as_deref(), Some("Mueller"));
        assert_eq!(client.forward("1 A St, Austin, TX").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_nominatim_server_error_is_upstream() {
        use httpmock::prelude::*;

        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/search");
                then.status(500).body("overloaded");
            })
            .await;

        let config = GeocodingConfig {
            base_url: server.base_url(),
            min_interval_ms: 0,
            ..GeocodingConfig::default()
        };
        let client = NominatimClient::new(&config, BackoffPolicy::default()).unwrap();

        let err = client.forward("1 A St, Austin, TX").await.unwrap_err();
        assert!(matches!(err, ResolveError::Upstream { status: 500, .. }));
        mock.assert_calls_async(1).await;
    }
}
