//! Executor interfaces for running built pipelines.
//!
//! The lifecycle controller never runs stages itself. It hands a built
//! pipeline to an `Executor`, which reports back later through a
//! completion channel.

pub mod local;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::domain::{RunOutcome, Stage};

// Re-export the local executor
pub use local::{ExecutorSettings, LocalExecutor};

/// Sending half of the completion channel
pub type CompletionSender = mpsc::UnboundedSender<Completion>;

/// Receiving half of the completion channel
pub type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

/// A finished (or cancelled) run, as reported by an executor
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub pipeline_id: String,
    pub run_id: Uuid,
    pub outcome: RunOutcome,
}

/// Everything an executor needs to run one pipeline
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub pipeline_id: String,

    /// Identifies this run in the eventual completion
    pub run_id: Uuid,

    /// Linked, configured stages in execution order
    pub stages: Vec<Stage>,

    /// Environment materialized at build time
    pub environment: BTreeMap<String, String>,

    pub completions: CompletionSender,
}

impl LaunchRequest {
    /// Report the run's outcome. Returns false if nobody is listening.
    pub fn report(&self, outcome: RunOutcome) -> bool {
        self.completions
            .send(Completion {
                pipeline_id: self.pipeline_id.clone(),
                run_id: self.run_id,
                outcome,
            })
            .is_ok()
    }
}

/// Trait for execution backends
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Accept a run. Must return promptly; the outcome arrives through
    /// `LaunchRequest::report`.
    async fn launch(&self, request: LaunchRequest) -> Result<()>;

    /// Stop whatever is running for `pipeline_id`. Succeeds if nothing is.
    async fn teardown(&self, pipeline_id: &str) -> Result<()>;
}
