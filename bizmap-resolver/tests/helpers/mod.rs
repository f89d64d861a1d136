//! Test Helper Utilities
//!
//! Shared utilities for testing bizmap-resolver

#![allow(dead_code)]

pub mod fakes;
pub mod fixtures;

// Re-export commonly used items
pub use fakes::{Behavior, CountingAdapter, FakeGeocoder, GeocodeReply};
pub use fixtures::{chain_of, sample_records, write_records};
