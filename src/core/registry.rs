//! Stage registry: maps stage-type names to stage descriptors.
//!
//! The registry is assembled once at startup (built-in kinds plus any
//! declared in config) and shared read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{EngineError, Result};
use crate::domain::{Stage, StageConfig};

/// Contract every stage type implements
pub trait StageKind: Send + Sync {
    /// Registered type name
    fn name(&self) -> &str;

    /// Validate the stage's configuration and produce its environment
    /// contribution, or a human-readable reason it cannot be resolved
    fn resolve(&self, stage: &Stage) -> std::result::Result<Vec<(String, String)>, String>;
}

/// Process-wide table of stage kinds
#[derive(Clone, Default)]
pub struct StageRegistry {
    kinds: HashMap<String, Arc<dyn StageKind>>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("kinds", &self.names())
            .finish()
    }
}

impl StageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in kinds: compute, command, env
    pub fn builtin() -> Self {
        Self::new()
            .with_kind(ComputeKind)
            .with_kind(CommandKind)
            .with_kind(EnvKind)
    }

    /// Built-in kinds plus kinds declared in configuration
    pub fn with_declared(declared: &[DeclaredKind]) -> Self {
        declared
            .iter()
            .cloned()
            .fold(Self::builtin(), |registry, kind| registry.with_kind(kind))
    }

    /// Register a kind (replaces any kind with the same name)
    pub fn with_kind(mut self, kind: impl StageKind + 'static) -> Self {
        self.kinds.insert(kind.name().to_string(), Arc::new(kind));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.kinds.contains_key(name)
    }

    /// Registered kind names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct a new, unconfigured stage of a registered kind
    pub fn instantiate(&self, kind: &str, id: impl Into<String>, config: StageConfig) -> Result<Stage> {
        if !self.contains(kind) {
            return Err(EngineError::UnknownStageType(kind.to_string()));
        }
        Ok(Stage::new(id, kind, config))
    }

    /// Resolve a stage through its kind's contract
    pub fn resolve(&self, stage: &Stage) -> std::result::Result<Vec<(String, String)>, String> {
        match self.kinds.get(stage.kind()) {
            Some(kind) => kind.resolve(stage),
            None => Err(format!("stage type '{}' is not registered", stage.kind())),
        }
    }
}

/// Environment variable name for a stage-scoped key: `<STAGE_ID>_<KEY>`
pub fn env_key(stage_id: &str, key: &str) -> String {
    format!("{}_{}", sanitize(stage_id), sanitize(key))
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Render a JSON scalar as an environment value
pub fn scalar_value(key: &str, value: &Value) -> std::result::Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Null => Ok(String::new()),
        Value::Array(_) | Value::Object(_) => {
            Err(format!("key '{}' must be a scalar value, got {}", key, value))
        }
    }
}

/// Export every key of `config` as a stage-scoped variable
fn export_scoped(stage_id: &str, config: &StageConfig) -> std::result::Result<Vec<(String, String)>, String> {
    config
        .iter()
        .map(|(key, value)| Ok((env_key(stage_id, key), scalar_value(key, value)?)))
        .collect()
}

/// General compute stage: optional positive `threads` (default 1)
#[derive(Debug, Clone, Copy)]
pub struct ComputeKind;

impl StageKind for ComputeKind {
    fn name(&self) -> &str {
        "compute"
    }

    fn resolve(&self, stage: &Stage) -> std::result::Result<Vec<(String, String)>, String> {
        let threads = match stage.config.get("threads") {
            None => 1,
            Some(Value::Number(n)) => n.as_u64().filter(|t| *t >= 1).ok_or_else(|| {
                format!("threads must be a positive integer, got {}", n)
            })?,
            Some(Value::String(s)) => s
                .parse::<u64>()
                .ok()
                .filter(|t| *t >= 1)
                .ok_or_else(|| format!("threads must be a positive integer, got '{}'", s))?,
            Some(other) => return Err(format!("threads must be a positive integer, got {}", other)),
        };

        let mut config = stage.config.clone();
        config.insert("threads".to_string(), Value::from(threads));
        export_scoped(&stage.id, &config)
    }
}

/// Shell command stage: requires a non-empty string `cmd`
#[derive(Debug, Clone, Copy)]
pub struct CommandKind;

impl StageKind for CommandKind {
    fn name(&self) -> &str {
        "command"
    }

    fn resolve(&self, stage: &Stage) -> std::result::Result<Vec<(String, String)>, String> {
        match stage.config.get("cmd") {
            None => return Err("missing required key 'cmd'".to_string()),
            Some(Value::String(cmd)) if !cmd.trim().is_empty() => {}
            Some(other) => return Err(format!("cmd must be a non-empty string, got {}", other)),
        }
        export_scoped(&stage.id, &stage.config)
    }
}

/// Environment stage: exports every key verbatim, without a stage prefix
#[derive(Debug, Clone, Copy)]
pub struct EnvKind;

impl StageKind for EnvKind {
    fn name(&self) -> &str {
        "env"
    }

    fn resolve(&self, stage: &Stage) -> std::result::Result<Vec<(String, String)>, String> {
        stage
            .config
            .iter()
            .map(|(key, value)| {
                if key.is_empty() || key.contains('=') || key.contains('\0') {
                    return Err(format!("'{}' is not a valid environment variable name", key));
                }
                Ok((key.clone(), scalar_value(key, value)?))
            })
            .collect()
    }
}

/// A stage kind declared in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeclaredKind {
    /// Type name used in append requests
    pub name: String,

    /// Keys that must be present at build time
    #[serde(default)]
    pub required: Vec<String>,

    /// Values used when the stage does not set a key
    #[serde(default)]
    pub defaults: StageConfig,
}

impl StageKind for DeclaredKind {
    fn name(&self) -> &str {
        &self.name
    }

    fn resolve(&self, stage: &Stage) -> std::result::Result<Vec<(String, String)>, String> {
        let mut config = self.defaults.clone();
        config.extend(stage.config.clone());

        if let Some(missing) = self.required.iter().find(|key| !config.contains_key(*key)) {
            return Err(format!("missing required key '{}'", missing));
        }

        export_scoped(&stage.id, &config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stage_with(kind: &str, pairs: &[(&str, Value)]) -> Stage {
        let config = pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        Stage::new("stage-a", kind, config)
    }

    fn lookup<'a>(vars: &'a [(String, String)], key: &str) -> Option<&'a str> {
        vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_instantiate_unknown_type() {
        let registry = StageRegistry::builtin();
        let err = registry
            .instantiate("quantum", "q1", StageConfig::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownStageType(ref t) if t == "quantum"));
    }

    #[test]
    fn test_instantiate_returns_unconfigured_stage() {
        let registry = StageRegistry::builtin();
        let stage = registry
            .instantiate("compute", "c1", [("threads".to_string(), json!(2))].into_iter().collect())
            .unwrap();

        assert_eq!(stage.kind(), "compute");
        assert!(!stage.configured);
        assert!(stage.linked);
        assert_eq!(stage.config.get("threads"), Some(&json!(2)));
    }

    #[test]
    fn test_builtin_names() {
        assert_eq!(StageRegistry::builtin().names(), vec!["command", "compute", "env"]);
    }

    #[test]
    fn test_env_key_sanitizes() {
        assert_eq!(env_key("stage-a", "block.size"), "STAGE_A_BLOCK_SIZE");
    }

    #[test]
    fn test_compute_threads_default_and_validation() {
        let vars = ComputeKind.resolve(&stage_with("compute", &[])).unwrap();
        assert_eq!(lookup(&vars, "STAGE_A_THREADS"), Some("1"));

        let vars = ComputeKind
            .resolve(&stage_with("compute", &[("threads", json!(4)), ("label", json!("fast"))]))
            .unwrap();
        assert_eq!(lookup(&vars, "STAGE_A_THREADS"), Some("4"));
        assert_eq!(lookup(&vars, "STAGE_A_LABEL"), Some("fast"));

        let vars = ComputeKind
            .resolve(&stage_with("compute", &[("threads", json!("8"))]))
            .unwrap();
        assert_eq!(lookup(&vars, "STAGE_A_THREADS"), Some("8"));

        assert!(ComputeKind.resolve(&stage_with("compute", &[("threads", json!(0))])).is_err());
        assert!(ComputeKind.resolve(&stage_with("compute", &[("threads", json!(-2))])).is_err());
        assert!(ComputeKind.resolve(&stage_with("compute", &[("threads", json!(true))])).is_err());
    }

    #[test]
    fn test_command_requires_cmd() {
        let err = CommandKind.resolve(&stage_with("command", &[])).unwrap_err();
        assert_eq!(err, "missing required key 'cmd'");

        assert!(CommandKind.resolve(&stage_with("command", &[("cmd", json!("  "))])).is_err());

        let vars = CommandKind
            .resolve(&stage_with("command", &[("cmd", json!("make all"))]))
            .unwrap();
        assert_eq!(lookup(&vars, "STAGE_A_CMD"), Some("make all"));
    }

    #[test]
    fn test_env_exports_verbatim() {
        let vars = EnvKind
            .resolve(&stage_with("env", &[("PATH", json!("/opt/bin")), ("DEBUG", json!(true))]))
            .unwrap();
        assert_eq!(lookup(&vars, "PATH"), Some("/opt/bin"));
        assert_eq!(lookup(&vars, "DEBUG"), Some("true"));

        assert!(EnvKind.resolve(&stage_with("env", &[("A=B", json!("x"))])).is_err());
    }

    #[test]
    fn test_nested_values_rejected() {
        let err = ComputeKind
            .resolve(&stage_with("compute", &[("hosts", json!(["a", "b"]))]))
            .unwrap_err();
        assert!(err.contains("hosts"));
    }

    #[test]
    fn test_declared_kind_defaults_and_required() {
        let declared = DeclaredKind {
            name: "ior".to_string(),
            required: vec!["nprocs".to_string()],
            defaults: [("block".to_string(), json!("1m"))].into_iter().collect(),
        };
        let registry = StageRegistry::with_declared(&[declared]);
        assert!(registry.contains("ior"));
        assert!(registry.contains("compute"));

        let err = registry.resolve(&stage_with("ior", &[])).unwrap_err();
        assert_eq!(err, "missing required key 'nprocs'");

        let vars = registry
            .resolve(&stage_with("ior", &[("nprocs", json!(16))]))
            .unwrap();
        assert_eq!(lookup(&vars, "STAGE_A_NPROCS"), Some("16"));
        assert_eq!(lookup(&vars, "STAGE_A_BLOCK"), Some("1m"));
    }

    #[test]
    fn test_resolve_unregistered_kind() {
        let registry = StageRegistry::new();
        let err = registry.resolve(&stage_with("compute", &[])).unwrap_err();
        assert!(err.contains("not registered"));
    }
}
