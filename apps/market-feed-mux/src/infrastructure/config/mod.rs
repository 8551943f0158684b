//! Configuration Module
//!
//! Configuration loading for the feed endpoint and the replay binary.

mod settings;

pub use settings::{ConfigError, FeedConfig, ReconnectSettings};
