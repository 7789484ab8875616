//! Operator configuration
//!
//! Defaults with environment variable overrides. Command-line flags in the
//! binary take precedence over both.

use crate::synth::{SynthesisConfig, DEFAULT_GROUP};
use std::time::Duration;

/// Operator configuration with sensible defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorConfig {
    /// Group of derived CRDs (env: DERIVED_GROUP)
    pub derived_group: String,

    /// Let `spec.customGroup` override `derived_group` (env: HONOR_CUSTOM_GROUP)
    pub honor_custom_group: bool,

    /// Requeue delay after a failed reconciliation (env: ERROR_REQUEUE_SECS)
    pub error_requeue: Duration,

    /// Log format, `text` or `json` (env: LOG_FORMAT)
    pub log_format: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            derived_group: DEFAULT_GROUP.to_string(),
            honor_custom_group: false,
            error_requeue: Duration::from_secs(60),
            log_format: "text".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Create configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(group) = lookup("DERIVED_GROUP").filter(|g| !g.is_empty()) {
            config.derived_group = group;
        }

        if let Some(honor) = lookup("HONOR_CUSTOM_GROUP") {
            if let Ok(parsed) = honor.parse::<bool>() {
                config.honor_custom_group = parsed;
            }
        }

        if let Some(secs) = lookup("ERROR_REQUEUE_SECS") {
            if let Ok(parsed) = secs.parse::<u64>() {
                config.error_requeue = Duration::from_secs(parsed);
            }
        }

        if let Some(format) = lookup("LOG_FORMAT") {
            config.log_format = format;
        }

        config
    }

    pub fn synthesis(&self) -> SynthesisConfig {
        SynthesisConfig {
            group: self.derived_group.clone(),
            honor_custom_group: self.honor_custom_group,
        }
    }
}
