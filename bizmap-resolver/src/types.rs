//! Core data model
//!
//! - [`SourceRecord`]: first-party input, immutable
//! - [`RawCandidate`]: one adapter result, tagged by the shape its source returns
//! - [`CandidateMatch`]: the single best scored candidate for a record
//! - [`MappingEntry`]: checkpointed state of one record across every source

use crate::error::{ResolveError, ResolveResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

// ============================================================================
// Input
// ============================================================================

/// Latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    /// Both components finite and in range, and not the (0, 0) placeholder
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
            && !(self.lat == 0.0 && self.lng == 0.0)
    }
}

/// First-party location record to be matched
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub id: String,
    pub name: String,
    pub city: String,
    pub state: String,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub coordinates: Option<Coordinates>,
}

impl SourceRecord {
    /// Minimal record, for tests and programmatic callers
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        city: impl Into<String>,
        state: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            city: city.into(),
            state: state.into(),
            phone: None,
            address: None,
            coordinates: None,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }
}

/// Address as stored in the input: one line, or split into parts
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum AddressField {
    Line(String),
    Parts {
        #[serde(default)]
        city: Option<String>,
        #[serde(default)]
        state: Option<String>,
        #[serde(default)]
        full: Option<String>,
    },
}

/// On-disk shape of one input record (the id is the map key)
#[derive(Debug, Clone, Deserialize)]
struct SourceRecordFields {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    address: Option<AddressField>,
    #[serde(default, alias = "location")]
    coordinates: Option<Coordinates>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl SourceRecordFields {
    /// `None` when name, city or state is missing
    fn into_record(self, id: String) -> Option<SourceRecord> {
        let (line, nested_city, nested_state) = match self.address {
            Some(AddressField::Line(line)) => (Some(line), None, None),
            Some(AddressField::Parts { city, state, full }) => (full, city, state),
            None => (None, None, None),
        };

        Some(SourceRecord {
            id,
            name: non_blank(self.name)?,
            city: non_blank(self.city).or_else(|| non_blank(nested_city))?,
            state: non_blank(self.state).or_else(|| non_blank(nested_state))?,
            phone: non_blank(self.phone),
            address: non_blank(line),
            coordinates: self.coordinates,
        })
    }
}

/// Load the keyed input collection.
///
/// Each record is decoded on its own: a malformed record, or one missing
/// name, city or state, is skipped with a warning and the rest still load.
/// Only an unreadable file or a top level that is not an object fails.
/// Output is ordered by id.
pub fn load_source_records(path: &Path) -> ResolveResult<Vec<SourceRecord>> {
    let content = std::fs::read_to_string(path)?;
    let raw: BTreeMap<String, Value> =
        serde_json::from_str(&content).map_err(|e| ResolveError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

    let total = raw.len();
    let mut records = Vec::with_capacity(total);
    for (id, value) in raw {
        let fields: SourceRecordFields = match serde_json::from_value(value) {
            Ok(fields) => fields,
            Err(e) => {
                tracing::warn!(record_id = %id, error = %e, "Skipping malformed input record");
                continue;
            }
        };

        match fields.into_record(id.clone()) {
            Some(record) => records.push(record),
            None => tracing::warn!(record_id = %id, "Skipping input record without name/city/state"),
        }
    }

    let skipped = total - records.len();
    if skipped > 0 {
        tracing::warn!(
            path = %path.display(),
            loaded = records.len(),
            skipped,
            "Some input records could not be used"
        );
    }

    Ok(records)
}

// ============================================================================
// Adapter output
// ============================================================================

/// Listing returned by a structured search endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessListing {
    pub id: String,
    pub alias: Option<String>,
    pub name: String,
    pub url: String,
    pub phone: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<u32>,
}

/// Listing scraped from a link on a rendered search page
#[derive(Debug, Clone, PartialEq)]
pub struct ListingLink {
    /// Listing id taken from the URL path
    pub id: String,
    /// Link text
    pub name: String,
    /// Absolute URL without query string
    pub url: String,
}

/// Raw candidate, one variant per candidate shape
#[derive(Debug, Clone, PartialEq)]
pub enum RawCandidate {
    Business(BusinessListing),
    Link(ListingLink),
}

impl RawCandidate {
    pub fn external_id(&self) -> &str {
        match self {
            RawCandidate::Business(b) => &b.id,
            RawCandidate::Link(l) => &l.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            RawCandidate::Business(b) => &b.name,
            RawCandidate::Link(l) => &l.name,
        }
    }

    pub fn url(&self) -> &str {
        match self {
            RawCandidate::Business(b) => &b.url,
            RawCandidate::Link(l) => &l.url,
        }
    }

    /// Links carry no structured location
    pub fn city(&self) -> Option<&str> {
        match self {
            RawCandidate::Business(b) => b.city.as_deref(),
            RawCandidate::Link(_) => None,
        }
    }

    pub fn phone(&self) -> Option<&str> {
        match self {
            RawCandidate::Business(b) => b.phone.as_deref(),
            RawCandidate::Link(_) => None,
        }
    }
}

// ============================================================================
// Match output
// ============================================================================

/// Condition that contributed to a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchReason {
    CityMatch,
    PhoneMatch,
    ExactName,
    HighNameSimilarity,
}

/// Best scored candidate for one record from one source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateMatch {
    /// External listing id
    pub id: String,
    pub name: String,
    pub url: String,
    /// Name similarity plus bonuses
    #[serde(default, alias = "matchScore")]
    pub score: f64,
    #[serde(default, alias = "matchReason")]
    pub match_reasons: Vec<MatchReason>,
}

/// Detail block attached to a matched slot by the enrichment pass.
///
/// Named fields are the ones the pipeline inspects; everything else the
/// source returned is kept verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListingDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hours: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_phone: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub photos: Vec<String>,
    #[serde(default)]
    pub photos_count: usize,
    #[serde(default, deserialize_with = "null_as_default")]
    pub transactions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_closed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attributes: BTreeMap<String, Value>,
    /// Absolute, query-free menu URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub menu_url: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Sources send `null` where the field is simply absent
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Populated mapping slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSlot {
    #[serde(flatten)]
    pub candidate: CandidateMatch,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ListingDetails>,
}

impl From<CandidateMatch> for SourceSlot {
    fn from(candidate: CandidateMatch) -> Self {
        Self {
            candidate,
            details: None,
        }
    }
}

// ============================================================================
// Checkpoint entry
// ============================================================================

/// Checkpointed state of one record.
///
/// Serialized with one top-level key per source:
/// `{"id", "name", "city", "state", "phone", "<source>": null | {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEntry {
    #[serde(alias = "buffetId")]
    pub id: String,
    #[serde(alias = "buffetName")]
    pub name: String,
    pub city: String,
    pub state: String,
    #[serde(default)]
    pub phone: Option<String>,
    /// When each source's chain last ran to completion for this record
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub last_searched: BTreeMap<String, DateTime<Utc>>,
    #[serde(flatten)]
    pub slots: BTreeMap<String, Option<SourceSlot>>,
}

impl MappingEntry {
    /// Fresh entry with a null slot for each source
    pub fn for_record<'a>(
        record: &SourceRecord,
        sources: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            city: record.city.clone(),
            state: record.state.clone(),
            phone: record.phone.clone(),
            last_searched: BTreeMap::new(),
            slots: sources.into_iter().map(|s| (s.to_string(), None)).collect(),
        }
    }

    pub fn slot(&self, source: &str) -> Option<&SourceSlot> {
        self.slots.get(source).and_then(|s| s.as_ref())
    }

    pub fn slot_mut(&mut self, source: &str) -> Option<&mut SourceSlot> {
        self.slots.get_mut(source).and_then(|s| s.as_mut())
    }

    pub fn is_populated(&self, source: &str) -> bool {
        self.slot(source).is_some()
    }

    /// Every named source slot holds a match
    pub fn is_complete<'a>(&self, mut sources: impl Iterator<Item = &'a str>) -> bool {
        sources.all(|s| self.is_populated(s))
    }

    /// Make sure a (null) slot exists for `source`
    pub fn ensure_slot(&mut self, source: &str) {
        self.slots.entry(source.to_string()).or_insert(None);
    }

    /// Fill a null slot. A populated slot is never replaced.
    ///
    /// Returns `true` when the slot changed.
    pub fn fill_slot(&mut self, source: &str, candidate: CandidateMatch) -> bool {
        match self.slots.get_mut(source) {
            Some(Some(_)) => false,
            Some(slot @ None) => {
                *slot = Some(candidate.into());
                true
            }
            None => {
                self.slots.insert(source.to_string(), Some(candidate.into()));
                true
            }
        }
    }

    /// Fold a newer view of the same record into `self` without ever
    /// reverting a populated slot, dropping details, or losing a slot.
    pub fn absorb(&mut self, newer: MappingEntry) {
        for (source, slot) in newer.slots {
            match (self.slots.get_mut(&source), slot) {
                (Some(Some(existing)), Some(incoming)) => {
                    if existing.details.is_none() && incoming.details.is_some() {
                        existing.details = incoming.details;
                    }
                }
                (Some(existing @ None), Some(incoming)) => *existing = Some(incoming),
                (Some(_), None) => {}
                (None, slot) => {
                    self.slots.insert(source, slot);
                }
            }
        }

        for (source, at) in newer.last_searched {
            let keep = self
                .last_searched
                .get(&source)
                .map(|prev| *prev < at)
                .unwrap_or(true);
            if keep {
                self.last_searched.insert(source, at);
            }
        }

        if self.phone.is_none() {
            self.phone = newer.phone;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_match(id: &str) -> CandidateMatch {
        CandidateMatch {
            id: id.to_string(),
            name: "Golden Dragon".to_string(),
            url: format!("https://dir.test/biz/{}", id),
            score: 110.0,
            match_reasons: vec![MatchReason::CityMatch, MatchReason::ExactName],
        }
    }

    fn sample_entry() -> MappingEntry {
        let record = SourceRecord::new("r1", "Golden Dragon Buffet", "Austin", "TX");
        MappingEntry::for_record(&record, ["yelp", "tripadvisor"])
    }

    #[test]
    fn test_entry_serializes_slots_at_top_level() {
        let mut entry = sample_entry();
        entry.fill_slot("yelp", sample_match("golden-dragon-austin"));

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["id"], "r1");
        assert_eq!(json["tripadvisor"], Value::Null);
        assert_eq!(json["yelp"]["id"], "golden-dragon-austin");
        assert_eq!(json["yelp"]["matchReasons"][0], "city_match");
        assert!(json["yelp"].get("details").is_none());
    }

    #[test]
    fn test_entry_accepts_legacy_keys() {
        let json = r#"{
            "buffetId": "b7",
            "buffetName": "Panda Garden",
            "city": "Reno",
            "state": "NV",
            "phone": "",
            "yelp": null,
            "tripadvisor": null
        }"#;
        let entry: MappingEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry.id, "b7");
        assert_eq!(entry.name, "Panda Garden");
        assert_eq!(entry.slots.len(), 2);
        assert!(!entry.is_populated("yelp"));
    }

    #[test]
    fn test_entry_accepts_legacy_populated_slot() {
        let json = r#"{
            "buffetId": "b9",
            "buffetName": "China King Buffet",
            "city": "Tulsa",
            "state": "OK",
            "phone": "(918) 555-0110",
            "yelp": {
                "id": "xyz",
                "alias": "china-king-buffet-tulsa",
                "name": "China King Buffet",
                "url": "https://www.yelp.com/biz/china-king-buffet-tulsa",
                "rating": 3.5,
                "reviewCount": 42,
                "city": "Tulsa",
                "matchScore": 125,
                "matchReason": ["city_match", "phone_match", "exact_name"]
            },
            "tripadvisor": null
        }"#;
        let entry: MappingEntry = serde_json::from_str(json).unwrap();

        assert!(entry.is_populated("yelp"));
        let slot = entry.slot("yelp").unwrap();
        assert_eq!(slot.candidate.id, "xyz");
        assert_eq!(slot.candidate.score, 125.0);
        assert_eq!(
            slot.candidate.match_reasons,
            vec![MatchReason::CityMatch, MatchReason::PhoneMatch, MatchReason::ExactName]
        );

        // Written back in the current key names
        let back = serde_json::to_value(&entry).unwrap();
        assert_eq!(back["id"], "b9");
        assert_eq!(back["yelp"]["score"], 125.0);
        assert!(back["yelp"].get("matchScore").is_none());
    }

    fn load(json: Value) -> ResolveResult<Vec<SourceRecord>> {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("records.json");
        std::fs::write(&path, json.to_string()).unwrap();
        load_source_records(&path)
    }

    #[test]
    fn test_malformed_record_does_not_reject_input() {
        let records = load(serde_json::json!({
            "a": {"name": "Golden Dragon", "city": "Austin", "state": "TX", "phone": "(512) 555-0199"},
            "b": {"name": "Lucky Star", "city": "Austin", "state": "TX", "phone": 5125550199u64},
            "c": {"name": "No City Buffet", "state": "TX"},
            "d": "not a record",
        }))
        .unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "a");
        assert_eq!(records[0].phone.as_deref(), Some("(512) 555-0199"));
    }

    #[test]
    fn test_nested_address_parts() {
        let records = load(serde_json::json!({
            "b1": {
                "name": "Panda Garden",
                "phone": "",
                "address": {"city": "Reno", "state": "NV", "full": "12 Virginia St, Reno, NV 89501"},
                "location": {"lat": 39.52, "lng": -119.81}
            },
            "b2": {"name": "King Buffet", "city": "Tulsa", "state": "OK", "address": "1 Main St"},
        }))
        .unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].city, "Reno");
        assert_eq!(records[0].state, "NV");
        assert_eq!(records[0].address.as_deref(), Some("12 Virginia St, Reno, NV 89501"));
        assert_eq!(records[0].phone, None);
        assert!(records[0].coordinates.is_some());
        assert_eq!(records[1].address.as_deref(), Some("1 Main St"));
    }

    #[test]
    fn test_non_object_input_is_corrupt() {
        assert!(matches!(load(serde_json::json!([1, 2])), Err(ResolveError::Corrupt { .. })));
    }

    #[test]
    fn test_fill_slot_never_overwrites() {
        let mut entry = sample_entry();
        assert!(entry.fill_slot("yelp", sample_match("first")));
        assert!(!entry.fill_slot("yelp", sample_match("second")));
        assert_eq!(entry.slot("yelp").unwrap().candidate.id, "first");
    }

    #[test]
    fn test_absorb_is_monotonic() {
        let mut stored = sample_entry();
        stored.fill_slot("yelp", sample_match("kept"));

        let mut newer = sample_entry();
        newer.fill_slot("tripadvisor", sample_match("added"));

        stored.absorb(newer);

        assert_eq!(stored.slot("yelp").unwrap().candidate.id, "kept");
        assert_eq!(stored.slot("tripadvisor").unwrap().candidate.id, "added");
    }

    #[test]
    fn test_is_complete() {
        let mut entry = sample_entry();
        entry.fill_slot("yelp", sample_match("a"));
        assert!(entry.is_complete(["yelp"].into_iter()));
        assert!(!entry.is_complete(["yelp", "tripadvisor"].into_iter()));
    }

    #[test]
    fn test_details_tolerate_nulls_and_keep_extra_fields() {
        let json = r#"{
            "rating": 4.5,
            "photos": null,
            "attributes": null,
            "transactions": ["pickup"],
            "specialties": {"restaurant": "dim sum"}
        }"#;
        let details: ListingDetails = serde_json::from_str(json).unwrap();
        assert_eq!(details.rating, Some(4.5));
        assert!(details.photos.is_empty());
        assert!(details.attributes.is_empty());
        assert_eq!(details.transactions, vec!["pickup".to_string()]);
        assert_eq!(details.extra["specialties"]["restaurant"], "dim sum");
    }

    #[test]
    fn test_coordinates_validity() {
        assert!(Coordinates { lat: 30.27, lng: -97.74 }.is_valid());
        assert!(!Coordinates { lat: 0.0, lng: 0.0 }.is_valid());
        assert!(!Coordinates { lat: 91.0, lng: 0.0 }.is_valid());
        assert!(!Coordinates { lat: f64::NAN, lng: 1.0 }.is_valid());
    }
}
