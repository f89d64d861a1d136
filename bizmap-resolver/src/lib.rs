//! bizmap resolver library
//!
//! Matches first-party location records against external business
//! directories, checkpoints every result, enriches matches with listing
//! details, infers neighborhoods for place snapshots and repairs truncated
//! JSON snapshots.

pub mod adapters;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod matcher;
pub mod neighborhood;
pub mod normalizer;
pub mod progress;
pub mod quota;
pub mod repair;
pub mod throttle;
pub mod types;
pub mod workflow;

pub use crate::error::{ResolveError, ResolveResult};
pub use crate::checkpoint::MappingStore;
pub use crate::config::RunConfig;
pub use crate::matcher::Matcher;
pub use crate::workflow::{EnrichmentRun, MatchRun, RunOutcome, RunStatus};
