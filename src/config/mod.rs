//! Configuration module
//!
//! Loads server configuration from an optional TOML file.

mod settings;

pub use settings::*;
