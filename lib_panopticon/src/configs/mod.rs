//! # Configuration Modules
//!
//! Settings for the Lighthouse link, the two Redis instances and the
//! dispatcher. Loading (files, environment, CLI) is left to the binaries.

/// Serde settings structs with defaults.
pub mod settings;

pub use settings::{LighthouseSettings, PanopticonSettings, RedisSettings};
