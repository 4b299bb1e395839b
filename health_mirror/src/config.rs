//! Engine configuration: defaults, TOML parsing, loading.
//!
//! The engine runs with built-in defaults unless a TOML file overrides them:
//!
//! ```toml
//! retention_days = 60
//! max_write_attempts = 3
//! backoff_base_ms = 200
//! ```
//!
//! Entrypoints:
//! - Parse from a TOML string: [`load_config_str`]
//! - Parse from a file path: [`load_config_path`]

use anyhow::Context;
use serde::Deserialize;

/// Tunables for one ingestion engine instance.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Rolling retention window, in days, relative to a batch's newest timestamp.
    /// Upsert rows older than this are dropped before they reach storage.
    pub retention_days: i64,
    /// Attempt cap for bulk write steps that hit a transient storage conflict.
    pub max_write_attempts: u32,
    /// Base backoff before a retry, in milliseconds. The sleep grows linearly
    /// with the attempt number and carries random jitter on top.
    pub backoff_base_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention_days: 60,
            max_write_attempts: 3,
            backoff_base_ms: 200,
        }
    }
}

/// Parse an [`EngineConfig`] from a TOML string.
pub fn load_config_str(s: &str) -> anyhow::Result<EngineConfig> {
    toml::from_str(s).context("parsing engine config")
}

/// Read and parse an [`EngineConfig`] from a TOML file.
pub fn load_config_path(path: &str) -> anyhow::Result<EngineConfig> {
    let s = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    load_config_str(&s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_mirror_window() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.retention_days, 60);
        assert_eq!(cfg.max_write_attempts, 3);
        assert_eq!(cfg.backoff_base_ms, 200);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = load_config_str("retention_days = 30").unwrap();
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.max_write_attempts, 3);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(load_config_str("retention_weeks = 4").is_err());
    }
}
