//! Stages: the configurable units of work inside a pipeline.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Opaque stage configuration (key -> JSON value)
pub type StageConfig = BTreeMap<String, serde_json::Value>;

/// A single stage instance, owned by exactly one pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Identifier, unique within the owning pipeline
    pub id: String,

    /// Registered stage type; fixed once the stage is appended
    kind: String,

    /// Current configuration
    #[serde(default)]
    pub config: StageConfig,

    /// Whether a configure has been applied
    #[serde(default)]
    pub configured: bool,

    /// Whether the stage participates in the active execution order
    #[serde(default = "default_linked")]
    pub linked: bool,
}

fn default_linked() -> bool {
    true
}

impl Stage {
    /// Create an unconfigured, linked stage
    pub fn new(id: impl Into<String>, kind: impl Into<String>, config: StageConfig) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            config,
            configured: false,
            linked: true,
        }
    }

    /// The stage type tag
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Merge configuration into this stage (later keys win) and mark it configured
    pub fn configure(&mut self, config: StageConfig) {
        self.config.extend(config);
        self.configured = true;
    }

    /// Look up a string-valued configuration key
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}
