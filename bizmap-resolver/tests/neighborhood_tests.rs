//! Integration tests for neighborhood inference
//!
//! Tier ordering against a scripted geocoder, and the in-place fill pass over
//! a snapshot file.

mod helpers;

use bizmap_common::config::GeocodingConfig;
use bizmap_resolver::neighborhood::{
    fill_neighborhoods, resolve_neighborhood, NeighborhoodTier, PassStatus, PlaceRecord,
};
use bizmap_resolver::types::Coordinates;
use bizmap_resolver::ResolveError;
use helpers::{FakeGeocoder, GeocodeReply};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn place(location: Option<Coordinates>, address: Option<&str>) -> PlaceRecord {
    serde_json::from_value(json!({
        "title": "Golden Dragon",
        "address": address,
        "city": "Brooklyn",
        "location": location,
    }))
    .unwrap()
}

fn brooklyn() -> Option<Coordinates> {
    Some(Coordinates {
        lat: 40.6694,
        lng: -73.9422,
    })
}

const ADDRESS: &str = "123 Main St, Crown Heights, Brooklyn, NY 11213, USA";

// ============================================================================
// Tier ordering
// ============================================================================

#[tokio::test]
async fn test_reverse_hit_short_circuits_later_tiers() {
    let geocoder = FakeGeocoder::new(
        GeocodeReply::Found("Prospect Heights".to_string()),
        GeocodeReply::Found("Should Not Be Used".to_string()),
    );

    let found = resolve_neighborhood(&place(brooklyn(), Some(ADDRESS)), &geocoder)
        .await
        .unwrap();

    assert_eq!(found, Some(("Prospect Heights".to_string(), NeighborhoodTier::Reverse)));
    assert_eq!(geocoder.reverse_calls(), 1);
    assert_eq!(geocoder.forward_calls(), 0);
}

#[tokio::test]
async fn test_forward_used_when_reverse_finds_nothing() {
    let geocoder = FakeGeocoder::new(
        GeocodeReply::Nothing,
        GeocodeReply::Found("Crown Heights".to_string()),
    );

    let found = resolve_neighborhood(&place(brooklyn(), Some(ADDRESS)), &geocoder)
        .await
        .unwrap();

    assert_eq!(found, Some(("Crown Heights".to_string(), NeighborhoodTier::Forward)));
    assert_eq!(geocoder.forward_calls(), 1);
}

#[tokio::test]
async fn test_invalid_coordinates_skip_reverse() {
    let geocoder = FakeGeocoder::new(GeocodeReply::Found("X".to_string()), GeocodeReply::Nothing);
    let zero = Some(Coordinates { lat: 0.0, lng: 0.0 });

    let found = resolve_neighborhood(&place(zero, Some(ADDRESS)), &geocoder)
        .await
        .unwrap();

    assert_eq!(geocoder.reverse_calls(), 0);
    assert_eq!(geocoder.forward_calls(), 1);
    assert_eq!(found, Some(("Crown Heights".to_string(), NeighborhoodTier::AddressParse)));
}

#[tokio::test]
async fn test_blocked_geocoder_falls_through_to_address_parse() {
    let geocoder = FakeGeocoder::new(
        GeocodeReply::Blocked,
        GeocodeReply::Found("Should Not Be Used".to_string()),
    );

    let found = resolve_neighborhood(&place(brooklyn(), Some(ADDRESS)), &geocoder)
        .await
        .unwrap();

    assert_eq!(found, Some(("Crown Heights".to_string(), NeighborhoodTier::AddressParse)));
    assert_eq!(geocoder.forward_calls(), 0);
}

#[tokio::test]
async fn test_failing_geocoder_still_parses_address() {
    let geocoder = FakeGeocoder::new(GeocodeReply::Fail(500), GeocodeReply::Fail(500));

    let found = resolve_neighborhood(&place(brooklyn(), Some(ADDRESS)), &geocoder)
        .await
        .unwrap();

    assert_eq!(found, Some(("Crown Heights".to_string(), NeighborhoodTier::AddressParse)));
    assert_eq!(geocoder.reverse_calls(), 1);
    assert_eq!(geocoder.forward_calls(), 1);
}

#[tokio::test]
async fn test_failure_reported_when_no_tier_finds_anything() {
    let geocoder = FakeGeocoder::new(GeocodeReply::Fail(500), GeocodeReply::Nothing);

    let err = resolve_neighborhood(&place(brooklyn(), None), &geocoder)
        .await
        .unwrap_err();

    assert!(matches!(err, ResolveError::Upstream { status: 500, .. }));
}

// ============================================================================
// Fill pass
// ============================================================================

#[tokio::test]
async fn test_fill_pass_updates_missing_and_preserves_fields() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("places.json");
    let snapshot = json!([
        {"title": "A", "neighborhood": "Williamsburg", "rating": 4.1},
        {"title": "B", "location": {"lat": 40.6694, "lng": -73.9422}, "rating": 3.9},
        {"title": "C", "address": "9 Elm St, Flatbush, Brooklyn, NY 11226", "city": "Brooklyn"},
    ]);
    std::fs::write(&path, serde_json::to_string_pretty(&snapshot).unwrap()).unwrap();

    let geocoder = FakeGeocoder::new(
        GeocodeReply::Found("Crown Heights".to_string()),
        GeocodeReply::Nothing,
    );
    let config = GeocodingConfig {
        batch_size: 1,
        ..GeocodingConfig::default()
    };

    let summary = fill_neighborhoods(&path, &geocoder, &config, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, Some(PassStatus::Completed));
    assert_eq!(summary.already_filled, 1);
    assert_eq!(summary.updated, 2);
    assert_eq!(summary.by_reverse, 1);
    assert_eq!(summary.by_address, 1);

    let written: Vec<Value> =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(written[0]["neighborhood"], "Williamsburg");
    assert_eq!(written[1]["neighborhood"], "Crown Heights");
    assert_eq!(written[1]["rating"], 3.9);
    assert_eq!(written[2]["neighborhood"], "Flatbush");
    assert!(written[0].get("address").is_none());

    // Original kept before the first in-place write
    let backup = temp.path().join("places.json.backup");
    let original: Value = serde_json::from_str(&std::fs::read_to_string(backup).unwrap()).unwrap();
    assert_eq!(original, snapshot);
}

#[tokio::test]
async fn test_fill_pass_stops_after_repeated_failures() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("places.json");
    let places: Vec<Value> = (0..5)
        .map(|i| json!({"title": format!("P{}", i), "location": {"lat": 40.7, "lng": -73.9}}))
        .collect();
    std::fs::write(&path, serde_json::to_string(&places).unwrap()).unwrap();

    // Reverse fails with something other than a block on every call
    struct Failing;

    #[async_trait::async_trait]
    impl bizmap_resolver::neighborhood::GeocodeProvider for Failing {
        async fn reverse(
            &self,
            _coordinates: Coordinates,
        ) -> bizmap_resolver::ResolveResult<Option<String>> {
            Err(bizmap_resolver::ResolveError::Unexpected("geocoder down".to_string()))
        }

        async fn forward(&self, _address: &str) -> bizmap_resolver::ResolveResult<Option<String>> {
            Ok(None)
        }
    }

    let config = GeocodingConfig {
        max_consecutive_errors: 3,
        ..GeocodingConfig::default()
    };
    let summary = fill_neighborhoods(&path, &Failing, &config, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.status, Some(PassStatus::TooManyErrors));
    assert_eq!(summary.errors, 3);
    assert_eq!(summary.updated, 0);
    // Nothing updated, so nothing written and no backup
    assert!(!temp.path().join("places.json.backup").exists());
}
