//! Runtime configuration
//!
//! Configuration arrives as JSON text (from the C boundary or a CLI file).
//! Empty text or `{}` selects the defaults; unknown fields are rejected so a
//! typo never silently falls back to a default.

use std::path::PathBuf;

use crate::{Error, Result};

pub(crate) const WASM_PAGE_BYTES: usize = 64 * 1024;

/// Process-wide configuration for the runtime
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Directory for the durable log. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
    /// fsync the log after every commit
    pub sync_writes: bool,
    /// Largest module accepted by deploy
    pub max_module_bytes: usize,
    /// Fuel granted to calls that do not name a budget
    pub default_budget: u64,
    /// Largest budget a caller may request
    pub max_budget: u64,
    /// Linear memory ceiling per instance
    pub max_memory_bytes: usize,
    /// Maximum nesting of cross-contract calls (the top-level call is depth 1)
    pub max_call_depth: u32,
    pub max_key_bytes: usize,
    pub max_value_bytes: usize,
    pub max_result_bytes: usize,
    /// Fuel charged for every host function call
    pub host_call_fuel: u64,
    /// Fuel charged per byte moved across the sandbox boundary
    pub byte_fuel: u64,
    /// Bounded wait for a callee's lock during nested calls
    pub lock_timeout_ms: u64,
    /// `tracing` filter directive installed by binaries that own a subscriber
    pub log_filter: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            data_dir: None,
            sync_writes: true,
            max_module_bytes: 4 * 1024 * 1024,
            default_budget: 10_000_000,
            max_budget: 1_000_000_000,
            max_memory_bytes: 16 * 1024 * 1024,
            max_call_depth: 8,
            max_key_bytes: 1024,
            max_value_bytes: 1024 * 1024,
            max_result_bytes: 4 * 1024 * 1024,
            host_call_fuel: 100,
            byte_fuel: 1,
            lock_timeout_ms: 50,
            log_filter: None,
        }
    }
}

impl RuntimeConfig {
    /// Parse configuration text and validate it
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(RuntimeConfig::default());
        }
        let config: RuntimeConfig = serde_json::from_str(trimmed)
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every ceiling is usable
    pub fn validate(&self) -> Result<()> {
        if self.max_module_bytes == 0 {
            return Err(Error::InvalidConfig("max_module_bytes must be > 0".into()));
        }
        if self.default_budget == 0 {
            return Err(Error::InvalidConfig("default_budget must be > 0".into()));
        }
        if self.default_budget > self.max_budget {
            return Err(Error::InvalidConfig(format!(
                "default_budget {} exceeds max_budget {}",
                self.default_budget, self.max_budget
            )));
        }
        if self.max_memory_bytes < WASM_PAGE_BYTES {
            return Err(Error::InvalidConfig(format!(
                "max_memory_bytes must be at least one wasm page ({} bytes)",
                WASM_PAGE_BYTES
            )));
        }
        if self.max_call_depth == 0 {
            return Err(Error::InvalidConfig("max_call_depth must be >= 1".into()));
        }
        if self.max_key_bytes == 0 || self.max_value_bytes == 0 || self.max_result_bytes == 0 {
            return Err(Error::InvalidConfig(
                "key, value and result ceilings must be > 0".into(),
            ));
        }
        if let Some(dir) = &self.data_dir {
            if dir.as_os_str().is_empty() {
                return Err(Error::InvalidConfig("data_dir must not be empty".into()));
            }
        }
        Ok(())
    }

    /// Builder-style helper used by embedders and tests
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_is_default() {
        assert_eq!(RuntimeConfig::parse("").unwrap(), RuntimeConfig::default());
        assert_eq!(RuntimeConfig::parse("  \n").unwrap(), RuntimeConfig::default());
        assert_eq!(RuntimeConfig::parse("{}").unwrap(), RuntimeConfig::default());
    }

    #[test]
    fn test_partial_override_keeps_other_defaults() {
        let config = RuntimeConfig::parse(r#"{"default_budget": 5000, "max_call_depth": 2}"#)
            .unwrap();
        assert_eq!(config.default_budget, 5000);
        assert_eq!(config.max_call_depth, 2);
        assert_eq!(
            config.max_module_bytes,
            RuntimeConfig::default().max_module_bytes
        );
    }

    #[test]
    fn test_malformed_json_is_invalid_config() {
        let err = RuntimeConfig::parse("{not json").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = RuntimeConfig::parse(r#"{"max_modul_bytes": 10}"#).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        for text in [
            r#"{"max_module_bytes": 0}"#,
            r#"{"default_budget": 0}"#,
            r#"{"default_budget": 10, "max_budget": 5}"#,
            r#"{"max_memory_bytes": 1024}"#,
            r#"{"max_call_depth": 0}"#,
            r#"{"max_result_bytes": 0}"#,
            r#"{"data_dir": ""}"#,
        ] {
            let err = RuntimeConfig::parse(text).unwrap_err();
            assert!(
                matches!(err, Error::InvalidConfig(_)),
                "{} should be rejected",
                text
            );
        }
    }

    #[test]
    fn test_equal_text_parses_equal() {
        let a = RuntimeConfig::parse(r#"{"default_budget": 42}"#).unwrap();
        let b = RuntimeConfig::parse("{ \"default_budget\" : 42 }").unwrap();
        assert_eq!(a, b);
    }
}
