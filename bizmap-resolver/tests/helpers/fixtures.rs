//! Input fixtures

use bizmap_resolver::adapters::{SourceAdapter, SourceChain};
use bizmap_resolver::types::SourceRecord;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const NAMES: &[&str] = &[
    "Golden Dragon",
    "Jade Palace",
    "Lucky Star",
    "China King",
    "Panda Garden",
    "Great Wall",
    "Hunan Wok",
    "Peking House",
    "Dragon Pearl",
    "Mandarin Court",
];

/// `count` distinct Austin records with ids `r00`, `r01`, ...
pub fn sample_records(count: usize) -> Vec<SourceRecord> {
    (0..count)
        .map(|i| {
            let name = match NAMES.get(i) {
                Some(name) => name.to_string(),
                None => format!("Restaurant Number {}", i),
            };
            SourceRecord::new(format!("r{:02}", i), name, "Austin", "TX")
                .with_phone(format!("(512) 555-{:04}", i))
        })
        .collect()
}

/// Write `records` as the keyed input file and return its path
pub fn write_records(dir: &Path, records: &[SourceRecord]) -> PathBuf {
    let mut map = Map::new();
    for record in records {
        map.insert(
            record.id.clone(),
            json!({
                "name": record.name,
                "city": record.city,
                "state": record.state,
                "phone": record.phone,
            }),
        );
    }
    let path = dir.join("records.json");
    std::fs::write(&path, serde_json::to_string_pretty(&Value::Object(map)).unwrap()).unwrap();
    path
}

/// Single-adapter chain for `source`
pub fn chain_of(source: &str, adapter: Arc<dyn SourceAdapter>) -> SourceChain {
    SourceChain::new(source, vec![adapter])
}
