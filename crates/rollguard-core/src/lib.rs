//! rollguard-core: configuration and small shared helpers.
//!
//! `rollguard.toml` is parsed into [`RollguardConfig`]. Every other crate
//! receives its settings from here rather than reading the file itself.

pub mod config;
pub mod duration;

pub use config::*;
pub use duration::parse_duration;

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
