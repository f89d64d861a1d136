//! # bizmap common library
//!
//! Shared code for the bizmap crates:
//! - Error and result types
//! - TOML configuration model and file resolution
//! - Atomic file writes
//! - Logging initialisation

pub mod config;
pub mod error;
pub mod fs;
pub mod logging;

pub use error::{Error, Result};
