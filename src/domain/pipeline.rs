//! Pipeline definition and lifecycle transitions.
//!
//! A Pipeline is an ordered list of stages plus lifecycle state. All
//! transition rules live here as plain methods; loading, locking and
//! persisting are the controller's job.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use super::stage::{Stage, StageConfig};
use crate::core::error::{EngineError, Result};

const MAX_ID_LEN: usize = 128;

/// Check that a pipeline or stage identifier is usable as a storage key
pub fn validate_identifier(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        Some("must not be empty")
    } else if id.len() > MAX_ID_LEN {
        Some("must be at most 128 characters")
    } else if id.starts_with('.') {
        Some("must not start with '.'")
    } else if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        Some("may only contain letters, digits, '-', '_' and '.'")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(EngineError::InvalidIdentifier {
            id: id.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Lifecycle state of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Stages may be edited; no environment yet
    Unbuilt,

    /// Environment materialized, ready to run
    Built,

    /// Handed to the executor
    Running,

    /// Torn down (terminal)
    Destroyed,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::Unbuilt
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Unbuilt => "unbuilt",
            Self::Built => "built",
            Self::Running => "running",
            Self::Destroyed => "destroyed",
        };
        f.write_str(label)
    }
}

/// How a run ended, as reported by the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunOutcome {
    Succeeded,
    Failed { error: String },
    Cancelled,
}

/// Bookkeeping for the most recent run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
}

/// A named, ordered collection of stages with lifecycle state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Immutable identifier
    id: String,

    #[serde(default)]
    state: PipelineState,

    /// Stages in slot order; unlinked stages keep their slot
    #[serde(default)]
    stages: Vec<Stage>,

    /// Materialized at build time
    #[serde(default)]
    environment: BTreeMap<String, String>,

    /// Stages changed while running; the finished run must not count as built
    #[serde(default)]
    stale: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default)]
    last_run: Option<RunRecord>,
}

impl Pipeline {
    /// Create an empty, unbuilt pipeline
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        validate_identifier(&id)?;
        let now = Utc::now();

        Ok(Self {
            id,
            state: PipelineState::Unbuilt,
            stages: Vec::new(),
            environment: BTreeMap::new(),
            stale: false,
            created_at: now,
            updated_at: now,
            last_run: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// All stages in slot order, linked or not
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stage(&self, stage_id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    /// Ids of linked stages, in execution order
    pub fn stage_order(&self) -> Vec<&str> {
        self.stages
            .iter()
            .filter(|s| s.linked)
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Linked, configured stages: what a build resolves and a run executes
    pub fn runnable_stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().filter(|s| s.linked && s.configured)
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn last_run(&self) -> Option<&RunRecord> {
        self.last_run.as_ref()
    }

    /// Record a modification time
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Pick the next free `<kind>-<ordinal>` id
    pub fn next_stage_id(&self, kind: &str) -> String {
        let mut ordinal = self.stages.iter().filter(|s| s.kind() == kind).count() + 1;
        loop {
            let candidate = format!("{}-{}", kind, ordinal);
            if self.stage(&candidate).is_none() {
                return candidate;
            }
            ordinal += 1;
        }
    }

    /// Add a stage at the end of the order
    pub fn append_stage(&mut self, stage: Stage) -> Result<&Stage> {
        self.ensure_alive("append")?;
        validate_identifier(&stage.id)?;

        if self.stage(&stage.id).is_some() {
            return Err(EngineError::DuplicateStageId {
                pipeline_id: self.id.clone(),
                stage_id: stage.id,
            });
        }

        let index = self.stages.len();
        self.stages.push(stage);
        self.invalidate_build();
        Ok(&self.stages[index])
    }

    /// Merge configuration into an existing stage
    pub fn configure_stage(&mut self, stage_id: &str, config: StageConfig) -> Result<&Stage> {
        self.ensure_alive("configure")?;
        let index = self.stage_index(stage_id)?;

        self.stages[index].configure(config);
        self.invalidate_build();
        Ok(&self.stages[index])
    }

    /// Detach a stage from the active order, keeping its slot and configuration
    pub fn unlink_stage(&mut self, stage_id: &str) -> Result<()> {
        self.ensure_alive("unlink")?;
        let index = self.stage_index(stage_id)?;

        self.stages[index].linked = false;
        self.invalidate_build();
        Ok(())
    }

    /// Re-attach a previously unlinked stage in its original slot
    pub fn relink_stage(&mut self, stage_id: &str) -> Result<()> {
        self.ensure_alive("relink")?;
        let index = self.stage_index(stage_id)?;

        self.stages[index].linked = true;
        self.invalidate_build();
        Ok(())
    }

    /// Permanently delete a stage
    pub fn remove_stage(&mut self, stage_id: &str) -> Result<Stage> {
        self.ensure_alive("remove")?;
        let index = self.stage_index(stage_id)?;

        let removed = self.stages.remove(index);
        self.invalidate_build();
        Ok(removed)
    }

    /// Materialize the environment from linked, configured stages in order.
    ///
    /// `resolve` is the per-type contract: it either yields the stage's
    /// environment contribution or a reason the configuration is unusable.
    /// The first failing stage aborts the build and leaves state untouched.
    /// A variable may only be set once: a stage producing a name that the
    /// pipeline or an earlier stage already set fails the build.
    pub fn build_with<F>(&mut self, mut resolve: F) -> Result<()>
    where
        F: FnMut(&Stage) -> std::result::Result<Vec<(String, String)>, String>,
    {
        if self.state != PipelineState::Unbuilt {
            return Err(self.transition_error("build"));
        }

        for stage in self.stages.iter().filter(|s| s.linked && !s.configured) {
            warn!(pipeline = %self.id, stage = %stage.id, "Skipping unconfigured stage");
        }

        let included: Vec<&str> = self.runnable_stages().map(|s| s.id.as_str()).collect();

        let mut environment = BTreeMap::new();
        let mut set_by: BTreeMap<String, String> = BTreeMap::new();
        for (key, value) in [
            ("PIPELINE_ID", self.id.clone()),
            ("PIPELINE_STAGES", included.join(",")),
        ] {
            environment.insert(key.to_string(), value);
            set_by.insert(key.to_string(), "the pipeline".to_string());
        }

        for stage in self.runnable_stages() {
            let vars = resolve(stage).map_err(|reason| EngineError::BuildFailed {
                stage_id: stage.id.clone(),
                reason,
            })?;
            for (key, value) in vars {
                if let Some(owner) = set_by.get(&key) {
                    return Err(EngineError::BuildFailed {
                        stage_id: stage.id.clone(),
                        reason: format!(
                            "environment variable '{}' is already set by {}",
                            key, owner
                        ),
                    });
                }
                set_by.insert(key.clone(), format!("stage '{}'", stage.id));
                environment.insert(key, value);
            }
        }

        self.environment = environment;
        self.state = PipelineState::Built;
        Ok(())
    }

    /// Transition Built -> Running and open a new run record
    pub fn start_run(&mut self) -> Result<Uuid> {
        match self.state {
            PipelineState::Built => {}
            PipelineState::Unbuilt => return Err(EngineError::NotBuilt(self.id.clone())),
            _ => return Err(self.transition_error("run")),
        }

        let run_id = Uuid::new_v4();
        self.state = PipelineState::Running;
        self.stale = false;
        self.last_run = Some(RunRecord {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            outcome: None,
        });
        Ok(run_id)
    }

    /// Apply an executor completion. Returns false when it does not belong
    /// to the current run.
    pub fn finish_run(&mut self, run_id: Uuid, outcome: RunOutcome) -> bool {
        if self.state != PipelineState::Running {
            return false;
        }

        match self.last_run.as_mut() {
            Some(record) if record.run_id == run_id => {
                record.finished_at = Some(Utc::now());
                record.outcome = Some(outcome);
            }
            _ => return false,
        }

        if self.stale {
            self.state = PipelineState::Unbuilt;
            self.environment.clear();
            self.stale = false;
        } else {
            self.state = PipelineState::Built;
        }
        true
    }

    /// Roll a run back to Built after the executor refused it
    pub fn abort_run(&mut self, run_id: Uuid, reason: impl Into<String>) -> bool {
        self.finish_run(
            run_id,
            RunOutcome::Failed {
                error: reason.into(),
            },
        )
    }

    pub fn mark_destroyed(&mut self) {
        self.state = PipelineState::Destroyed;
        self.environment.clear();
    }

    fn stage_index(&self, stage_id: &str) -> Result<usize> {
        self.stages
            .iter()
            .position(|s| s.id == stage_id)
            .ok_or_else(|| EngineError::StageNotFound {
                pipeline_id: self.id.clone(),
                stage_id: stage_id.to_string(),
            })
    }

    fn ensure_alive(&self, operation: &'static str) -> Result<()> {
        if self.state == PipelineState::Destroyed {
            return Err(self.transition_error(operation));
        }
        Ok(())
    }

    fn transition_error(&self, operation: &'static str) -> EngineError {
        EngineError::InvalidStateTransition {
            pipeline_id: self.id.clone(),
            operation,
            state: self.state,
        }
    }

    /// Stage edits invalidate a finished build
    fn invalidate_build(&mut self) {
        match self.state {
            PipelineState::Built => {
                self.state = PipelineState::Unbuilt;
                self.environment.clear();
            }
            PipelineState::Running => self.stale = true,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(pairs: &[(&str, serde_json::Value)]) -> StageConfig {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn configured(id: &str, kind: &str) -> Stage {
        let mut stage = Stage::new(id, kind, StageConfig::new());
        stage.configure(StageConfig::new());
        stage
    }

    fn echo_resolver(stage: &Stage) -> std::result::Result<Vec<(String, String)>, String> {
        Ok(vec![(format!("{}_KIND", stage.id.to_uppercase()), stage.kind().to_string())])
    }

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("p1").is_ok());
        assert!(validate_identifier("ml.train-v2_final").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier(".hidden").is_err());
        assert!(validate_identifier("../escape").is_err());
        assert!(validate_identifier("has space").is_err());
        assert!(validate_identifier(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_new_pipeline_is_unbuilt_and_empty() {
        let pipeline = Pipeline::new("p1").unwrap();
        assert_eq!(pipeline.id(), "p1");
        assert_eq!(pipeline.state(), PipelineState::Unbuilt);
        assert!(pipeline.stages().is_empty());
        assert!(pipeline.environment().is_empty());
    }

    #[test]
    fn test_append_adds_to_end() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.append_stage(Stage::new("a", "compute", StageConfig::new())).unwrap();
        pipeline.append_stage(Stage::new("b", "compute", StageConfig::new())).unwrap();

        assert_eq!(pipeline.stage_order(), vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_stage_id_rejected() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.append_stage(Stage::new("a", "compute", StageConfig::new())).unwrap();
        let err = pipeline
            .append_stage(Stage::new("a", "command", StageConfig::new()))
            .unwrap_err();

        assert!(matches!(err, EngineError::DuplicateStageId { .. }));
        assert_eq!(pipeline.stages().len(), 1);
    }

    #[test]
    fn test_next_stage_id_skips_taken_ordinals() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        assert_eq!(pipeline.next_stage_id("compute"), "compute-1");

        pipeline.append_stage(Stage::new("compute-1", "compute", StageConfig::new())).unwrap();
        pipeline.append_stage(Stage::new("compute-2", "compute", StageConfig::new())).unwrap();
        pipeline.remove_stage("compute-1").unwrap();

        // One compute stage left, but compute-2 is taken
        assert_eq!(pipeline.next_stage_id("compute"), "compute-3");
        assert_eq!(pipeline.next_stage_id("command"), "command-1");
    }

    #[test]
    fn test_configure_missing_stage() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        let err = pipeline.configure_stage("ghost", StageConfig::new()).unwrap_err();
        assert!(matches!(err, EngineError::StageNotFound { .. }));
    }

    #[test]
    fn test_unlink_keeps_config_and_relink_restores_slot() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        for id in ["a", "b", "c"] {
            pipeline.append_stage(configured(id, "compute")).unwrap();
        }
        pipeline.configure_stage("b", config(&[("threads", json!(2))])).unwrap();

        pipeline.unlink_stage("b").unwrap();
        assert_eq!(pipeline.stage_order(), vec!["a", "c"]);
        assert_eq!(pipeline.stage("b").unwrap().config.get("threads"), Some(&json!(2)));

        pipeline.relink_stage("b").unwrap();
        assert_eq!(pipeline.stage_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_remove_deletes_stage() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.append_stage(configured("a", "compute")).unwrap();
        pipeline.append_stage(configured("b", "compute")).unwrap();

        let removed = pipeline.remove_stage("a").unwrap();
        assert_eq!(removed.id, "a");
        assert_eq!(pipeline.stage_order(), vec!["b"]);
        assert!(pipeline.stage("a").is_none());
    }

    #[test]
    fn test_build_materializes_environment_in_order() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.append_stage(configured("a", "compute")).unwrap();
        pipeline.append_stage(Stage::new("pending", "compute", StageConfig::new())).unwrap();
        pipeline.append_stage(configured("b", "command")).unwrap();

        pipeline.build_with(echo_resolver).unwrap();

        assert_eq!(pipeline.state(), PipelineState::Built);
        let env = pipeline.environment();
        assert_eq!(env.get("PIPELINE_ID").map(String::as_str), Some("p1"));
        assert_eq!(env.get("PIPELINE_STAGES").map(String::as_str), Some("a,b"));
        assert_eq!(env.get("A_KIND").map(String::as_str), Some("compute"));
        assert_eq!(env.get("B_KIND").map(String::as_str), Some("command"));
        assert!(!env.contains_key("PENDING_KIND"));
    }

    #[test]
    fn test_build_reports_first_failing_stage() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        for id in ["a", "bad1", "bad2"] {
            pipeline.append_stage(configured(id, "compute")).unwrap();
        }

        let err = pipeline
            .build_with(|stage| {
                if stage.id.starts_with("bad") {
                    Err(format!("{} is broken", stage.id))
                } else {
                    Ok(Vec::new())
                }
            })
            .unwrap_err();

        match err {
            EngineError::BuildFailed { stage_id, reason } => {
                assert_eq!(stage_id, "bad1");
                assert_eq!(reason, "bad1 is broken");
            }
            other => panic!("Expected BuildFailed, got {:?}", other),
        }
        assert_eq!(pipeline.state(), PipelineState::Unbuilt);
        assert!(pipeline.environment().is_empty());
    }

    #[test]
    fn test_build_rejects_colliding_variables() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.append_stage(configured("a-b", "compute")).unwrap();
        pipeline.append_stage(configured("a_b", "compute")).unwrap();

        let err = pipeline
            .build_with(|stage| {
                Ok(vec![(
                    crate::core::registry::env_key(&stage.id, "kind"),
                    stage.kind().to_string(),
                )])
            })
            .unwrap_err();
        match err {
            EngineError::BuildFailed { stage_id, reason } => {
                assert_eq!(stage_id, "a_b");
                assert!(reason.contains("A_B_KIND"), "{}", reason);
                assert!(reason.contains("stage 'a-b'"), "{}", reason);
            }
            other => panic!("Expected BuildFailed, got {:?}", other),
        }
        assert_eq!(pipeline.state(), PipelineState::Unbuilt);
        assert!(pipeline.environment().is_empty());
    }

    #[test]
    fn test_build_protects_pipeline_variables() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.append_stage(configured("vars", "env")).unwrap();

        let err = pipeline
            .build_with(|_| Ok(vec![("PIPELINE_ID".to_string(), "spoofed".to_string())]))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::BuildFailed { ref reason, .. } if reason.contains("the pipeline")
        ));
        assert_eq!(pipeline.state(), PipelineState::Unbuilt);
    }

    #[test]
    fn test_build_requires_unbuilt() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.build_with(echo_resolver).unwrap();

        let err = pipeline.build_with(echo_resolver).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidStateTransition { operation: "build", .. }
        ));
    }

    #[test]
    fn test_stage_edit_invalidates_build() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.append_stage(configured("a", "compute")).unwrap();
        pipeline.build_with(echo_resolver).unwrap();

        pipeline.configure_stage("a", config(&[("threads", json!(4))])).unwrap();

        assert_eq!(pipeline.state(), PipelineState::Unbuilt);
        assert!(pipeline.environment().is_empty());
    }

    #[test]
    fn test_run_requires_build() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        let err = pipeline.start_run().unwrap_err();
        assert!(matches!(err, EngineError::NotBuilt(_)));
    }

    #[test]
    fn test_run_lifecycle_returns_to_built() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.append_stage(configured("a", "compute")).unwrap();
        pipeline.build_with(echo_resolver).unwrap();

        let run_id = pipeline.start_run().unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert!(matches!(
            pipeline.start_run().unwrap_err(),
            EngineError::InvalidStateTransition { operation: "run", .. }
        ));

        // A completion for some other run is ignored
        assert!(!pipeline.finish_run(Uuid::new_v4(), RunOutcome::Succeeded));
        assert_eq!(pipeline.state(), PipelineState::Running);

        assert!(pipeline.finish_run(run_id, RunOutcome::Succeeded));
        assert_eq!(pipeline.state(), PipelineState::Built);
        assert_eq!(
            pipeline.last_run().unwrap().outcome,
            Some(RunOutcome::Succeeded)
        );
        assert!(!pipeline.environment().is_empty());
    }

    #[test]
    fn test_edit_while_running_marks_stale() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.append_stage(configured("a", "compute")).unwrap();
        pipeline.build_with(echo_resolver).unwrap();
        let run_id = pipeline.start_run().unwrap();

        pipeline.append_stage(configured("b", "compute")).unwrap();
        assert_eq!(pipeline.state(), PipelineState::Running);
        assert!(pipeline.is_stale());

        assert!(pipeline.finish_run(run_id, RunOutcome::Cancelled));
        assert_eq!(pipeline.state(), PipelineState::Unbuilt);
        assert!(!pipeline.is_stale());
        assert!(pipeline.environment().is_empty());
    }

    #[test]
    fn test_destroyed_pipeline_rejects_edits() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.mark_destroyed();

        let err = pipeline
            .append_stage(Stage::new("a", "compute", StageConfig::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidStateTransition { operation: "append", .. }
        ));
    }

    #[test]
    fn test_serialization_preserves_order_and_state() {
        let mut pipeline = Pipeline::new("p1").unwrap();
        pipeline.append_stage(configured("z", "compute")).unwrap();
        pipeline.append_stage(configured("a", "compute")).unwrap();
        pipeline.unlink_stage("z").unwrap();
        pipeline.build_with(echo_resolver).unwrap();

        let json = serde_json::to_string(&pipeline).unwrap();
        let parsed: Pipeline = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.id(), "p1");
        assert_eq!(parsed.state(), PipelineState::Built);
        assert_eq!(parsed.stages().len(), 2);
        assert_eq!(parsed.stage_order(), vec!["a"]);
        assert_eq!(parsed.environment(), pipeline.environment());
    }
}
