//! Lifecycle controller: the single entry point for pipeline operations.
//!
//! Every mutating operation follows the same shape: take the per-id lock,
//! load the pipeline from the store, apply a domain transition, save it
//! back. A failed save fails the operation and nothing is returned.
//!
//! The per-id lock has two layers: an in-process mutex so tasks of this
//! controller queue up cheaply, and the store's record lock so other
//! processes sharing the store wait as well.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::{EngineError, Result};
use super::locks::KeyedLocks;
use super::registry::StageRegistry;
use crate::adapters::{
    Completion, CompletionReceiver, CompletionSender, Executor, LaunchRequest, LocalExecutor,
};
use crate::config::ResolvedConfig;
use crate::domain::{validate_identifier, Pipeline, Stage, StageConfig};
use crate::store::{self, PipelineStore, RecordLock};

/// Exclusive hold on one pipeline id for a whole load → mutate → save.
/// The store lock is released before the in-process one.
struct PipelineGuard {
    _record: RecordLock,
    _local: OwnedMutexGuard<()>,
}

/// Coordinates store, registry and executor
pub struct LifecycleController {
    store: Arc<dyn PipelineStore>,
    registry: Arc<StageRegistry>,
    executor: Arc<dyn Executor>,
    locks: KeyedLocks,
    completion_tx: CompletionSender,
    completion_rx: Mutex<Option<CompletionReceiver>>,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn PipelineStore>,
        registry: Arc<StageRegistry>,
        executor: Arc<dyn Executor>,
    ) -> Self {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            store,
            registry,
            executor,
            locks: KeyedLocks::new(),
            completion_tx,
            completion_rx: Mutex::new(Some(completion_rx)),
        }
    }

    /// Wire up the configured store, declared stage kinds and local executor
    pub fn from_config(config: &ResolvedConfig) -> Result<Self> {
        let store = store::open(config.store_backend, &config.store_path)?;
        let registry = StageRegistry::with_declared(&config.stage_types);
        let executor = LocalExecutor::new(config.executor.clone());

        info!(
            backend = store.backend(),
            path = %config.store_path.display(),
            kinds = ?registry.names(),
            "Lifecycle controller ready"
        );
        Ok(Self::new(store, Arc::new(registry), Arc::new(executor)))
    }

    pub fn store(&self) -> &Arc<dyn PipelineStore> {
        &self.store
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    /// Take the receiving end of the completion channel. Only the first
    /// caller gets it.
    pub fn take_completions(&self) -> Option<CompletionReceiver> {
        self.completion_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Apply executor completions in the background for as long as the
    /// controller lives
    pub fn spawn_completion_listener(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut completions = self.take_completions()?;
        let controller = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            while let Some(completion) = completions.recv().await {
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                if let Err(e) = controller.complete(completion).await {
                    error!(error = %e, "Failed to record run completion");
                }
            }
        }))
    }

    /// Resolve an explicit id, or fall back to the current pipeline
    pub async fn resolve(&self, id: Option<&str>) -> Result<String> {
        match id {
            Some(id) => {
                validate_identifier(id)?;
                Ok(id.to_string())
            }
            None => self
                .store
                .current()
                .await?
                .ok_or(EngineError::NoCurrentPipeline),
        }
    }

    /// Create an empty pipeline and make it current
    #[instrument(skip(self), fields(pipeline = %id))]
    pub async fn create(&self, id: &str) -> Result<Pipeline> {
        let _guard = self.locks.acquire(id).await;
        let pipeline = self.store.create(id).await?;

        // Pointer update is best-effort once the record exists
        if let Err(e) = self.store.set_current(Some(id)).await {
            warn!(error = %e, "Created pipeline but could not make it current");
        }

        info!("Created pipeline");
        Ok(pipeline)
    }

    /// Load a pipeline (or the current one) and make it current
    #[instrument(skip(self))]
    pub async fn load(&self, id: Option<&str>) -> Result<Pipeline> {
        let id = self.resolve(id).await?;
        let pipeline = self.store.load(&id).await?;
        self.store.set_current(Some(&id)).await?;

        debug!(pipeline = %id, state = %pipeline.state(), "Loaded pipeline");
        Ok(pipeline)
    }

    /// Read-only snapshot; leaves the current pointer alone
    pub async fn inspect(&self, id: Option<&str>) -> Result<Pipeline> {
        let id = self.resolve(id).await?;
        self.store.load(&id).await
    }

    /// Stored pipeline ids, optionally filtered by a glob pattern
    pub async fn list(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let matcher = pattern
            .map(|p| {
                glob::Pattern::new(p).map_err(|e| EngineError::InvalidPattern {
                    pattern: p.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let ids = self.store.list().await?;
        Ok(match matcher {
            Some(matcher) => ids.into_iter().filter(|id| matcher.matches(id)).collect(),
            None => ids,
        })
    }

    /// Append a stage of a registered kind
    #[instrument(skip(self, config), fields(pipeline = %id))]
    pub async fn append(
        &self,
        id: &str,
        kind: &str,
        stage_id: Option<String>,
        configure_now: bool,
        config: StageConfig,
    ) -> Result<Stage> {
        let registry = self.registry.clone();
        let kind = kind.to_string();

        let stage = self
            .mutate(id, move |pipeline| {
                let stage_id = stage_id.unwrap_or_else(|| pipeline.next_stage_id(&kind));
                let stage = if configure_now {
                    let mut stage = registry.instantiate(&kind, stage_id, StageConfig::new())?;
                    stage.configure(config);
                    stage
                } else {
                    registry.instantiate(&kind, stage_id, config)?
                };
                pipeline.append_stage(stage).cloned()
            })
            .await?;

        info!(stage = %stage.id, kind = %stage.kind(), "Appended stage");
        Ok(stage)
    }

    /// Merge configuration into a stage
    #[instrument(skip(self, config), fields(pipeline = %id))]
    pub async fn configure(&self, id: &str, stage_id: &str, config: StageConfig) -> Result<Stage> {
        let stage = self
            .mutate(id, |pipeline| pipeline.configure_stage(stage_id, config).cloned())
            .await?;

        info!(stage = %stage_id, "Configured stage");
        Ok(stage)
    }

    /// Detach a stage from the active order
    #[instrument(skip(self), fields(pipeline = %id))]
    pub async fn unlink(&self, id: &str, stage_id: &str) -> Result<()> {
        self.mutate(id, |pipeline| pipeline.unlink_stage(stage_id))
            .await?;
        info!(stage = %stage_id, "Unlinked stage");
        Ok(())
    }

    /// Re-attach an unlinked stage in its original slot
    #[instrument(skip(self), fields(pipeline = %id))]
    pub async fn relink(&self, id: &str, stage_id: &str) -> Result<()> {
        self.mutate(id, |pipeline| pipeline.relink_stage(stage_id))
            .await?;
        info!(stage = %stage_id, "Relinked stage");
        Ok(())
    }

    /// Permanently delete a stage
    #[instrument(skip(self), fields(pipeline = %id))]
    pub async fn remove(&self, id: &str, stage_id: &str) -> Result<Stage> {
        let stage = self
            .mutate(id, |pipeline| pipeline.remove_stage(stage_id))
            .await?;
        info!(stage = %stage_id, "Removed stage");
        Ok(stage)
    }

    /// Materialize the environment and mark the pipeline Built
    #[instrument(skip(self), fields(pipeline = %id))]
    pub async fn build(&self, id: &str) -> Result<Pipeline> {
        let registry = self.registry.clone();
        let pipeline = self
            .mutate(id, move |pipeline| {
                pipeline.build_with(|stage| registry.resolve(stage))?;
                Ok(pipeline.clone())
            })
            .await?;

        info!(vars = pipeline.environment().len(), "Built pipeline");
        Ok(pipeline)
    }

    /// Transition to Running and hand the pipeline to the executor.
    ///
    /// The Running state is saved before the hand-off. If the executor
    /// refuses the run, the pipeline is rolled back and saved again.
    #[instrument(skip(self), fields(pipeline = %id))]
    pub async fn run(&self, id: &str) -> Result<Uuid> {
        let _guard = self.hold(id).await?;
        let mut pipeline = self.store.load(id).await?;

        let run_id = pipeline.start_run()?;
        pipeline.touch();
        self.store.save(&pipeline).await?;

        let request = LaunchRequest {
            pipeline_id: id.to_string(),
            run_id,
            stages: pipeline.runnable_stages().cloned().collect(),
            environment: pipeline.environment().clone(),
            completions: self.completion_tx.clone(),
        };

        if let Err(e) = self.executor.launch(request).await {
            let reason = format!("{:#}", e);
            warn!(%run_id, error = %reason, "Executor refused run; rolling back");

            pipeline.abort_run(run_id, reason.clone());
            pipeline.touch();
            let reason = match self.store.save(&pipeline).await {
                Ok(()) => reason,
                Err(save_err) => {
                    error!(
                        %run_id,
                        error = %save_err,
                        "Rollback not saved; pipeline is still recorded as running"
                    );
                    format!(
                        "{}; rollback to built was not saved ({}), destroy the pipeline to recover",
                        reason, save_err
                    )
                }
            };

            return Err(EngineError::ExecutionFailed {
                executor: self.executor.name().to_string(),
                reason,
            });
        }

        info!(%run_id, executor = self.executor.name(), "Pipeline running");
        Ok(run_id)
    }

    /// Record an executor completion. Returns the updated pipeline, or
    /// None when the completion no longer applies.
    #[instrument(skip(self, completion), fields(pipeline = %completion.pipeline_id, run_id = %completion.run_id))]
    pub async fn complete(&self, completion: Completion) -> Result<Option<Pipeline>> {
        let _guard = self.hold(&completion.pipeline_id).await?;

        let mut pipeline = match self.store.load(&completion.pipeline_id).await {
            Ok(pipeline) => pipeline,
            Err(e) if e.is_pipeline_missing() => {
                debug!("Ignoring completion for missing pipeline");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if !pipeline.finish_run(completion.run_id, completion.outcome.clone()) {
            debug!("Ignoring completion for a run that is not current");
            return Ok(None);
        }

        pipeline.touch();
        self.store.save(&pipeline).await?;

        info!(outcome = ?completion.outcome, state = %pipeline.state(), "Run completed");
        Ok(Some(pipeline))
    }

    /// Tear down and delete a pipeline. Destroying a missing pipeline
    /// succeeds and returns None.
    #[instrument(skip(self), fields(pipeline = %id))]
    pub async fn destroy(&self, id: &str) -> Result<Option<Pipeline>> {
        validate_identifier(id)?;
        let _guard = self.hold(id).await?;

        let mut pipeline = match self.store.load(id).await {
            Ok(pipeline) => pipeline,
            Err(e) if e.is_pipeline_missing() => {
                debug!("Pipeline already gone");
                self.clear_current_if(id).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        self.executor
            .teardown(id)
            .await
            .map_err(|e| EngineError::ExecutionFailed {
                executor: self.executor.name().to_string(),
                reason: format!("{:#}", e),
            })?;

        self.store.delete(id).await?;
        self.clear_current_if(id).await?;
        pipeline.mark_destroyed();

        info!("Destroyed pipeline");
        Ok(Some(pipeline))
    }

    async fn clear_current_if(&self, id: &str) -> Result<()> {
        if self.store.current().await?.as_deref() == Some(id) {
            self.store.set_current(None).await?;
        }
        Ok(())
    }

    /// Take both lock layers for `id`
    async fn hold(&self, id: &str) -> Result<PipelineGuard> {
        let local = self.locks.acquire(id).await;
        let record = self.store.lock_record(id).await?;
        Ok(PipelineGuard {
            _record: record,
            _local: local,
        })
    }

    /// Load, apply `op`, save. Serialized per pipeline id, across
    /// processes when the store is shared.
    async fn mutate<T, F>(&self, id: &str, op: F) -> Result<T>
    where
        F: FnOnce(&mut Pipeline) -> Result<T> + Send,
        T: Send,
    {
        let _guard = self.hold(id).await?;
        let mut pipeline = self.store.load(id).await?;

        let value = op(&mut pipeline)?;
        pipeline.touch();
        self.store.save(&pipeline).await?;

        Ok(value)
    }
}
