//! # Autopilot Core
//!
//! Shared building blocks for the automation engine:
//! - `json` — immutable JSON value with numeric cross-type equality
//! - `predicate` — AND/OR/NOT matcher trees over JSON values
//! - `version` — version range constraints used by predicates
//! - `config` — TOML configuration
//! - `error` — the unified error type

pub mod config;
pub mod error;
pub mod json;
pub mod predicate;
pub mod version;

pub use config::AutopilotConfig;
pub use error::{AutopilotError, Result};
pub use json::JsonValue;
pub use predicate::{JsonMatcher, JsonPredicate, ValueMatcher};
pub use version::VersionConstraint;
