//! Local executor: runs each stage's `cmd` as a shell subprocess.
//!
//! Stages run one after another with the build environment applied.
//! Stages without a `cmd` key contribute environment only and are skipped.

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Executor, LaunchRequest};
use crate::domain::{RunOutcome, Stage};

/// Default per-stage timeout
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 300;

/// Settings for the local executor (the `executor:` section of the config file)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Shell used as `<shell> -c <cmd>`
    pub shell: String,

    pub stage_timeout_seconds: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            stage_timeout_seconds: DEFAULT_STAGE_TIMEOUT_SECS,
        }
    }
}

impl ExecutorSettings {
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_seconds)
    }
}

struct Job {
    run_id: Uuid,
    handle: AbortHandle,
}

type JobTable = Arc<Mutex<HashMap<String, Job>>>;

/// Executor that runs stages on this machine
pub struct LocalExecutor {
    settings: ExecutorSettings,
    jobs: JobTable,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(ExecutorSettings::default())
    }
}

impl LocalExecutor {
    pub fn new(settings: ExecutorSettings) -> Self {
        Self {
            settings,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of runs currently in flight
    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Run every stage in order, stopping at the first failure
async fn run_stages(settings: &ExecutorSettings, request: &LaunchRequest) -> RunOutcome {
    for stage in &request.stages {
        let Some(cmd) = stage.config_str("cmd") else {
            debug!(stage = %stage.id, "No command; nothing to execute");
            continue;
        };

        if let Err(e) = run_stage(settings, request, stage, cmd).await {
            return RunOutcome::Failed {
                error: format!("{:#}", e),
            };
        }
    }
    RunOutcome::Succeeded
}

async fn run_stage(
    settings: &ExecutorSettings,
    request: &LaunchRequest,
    stage: &Stage,
    cmd: &str,
) -> Result<()> {
    info!(pipeline = %request.pipeline_id, stage = %stage.id, "Running stage");
    let stage_timeout = settings.stage_timeout();

    let child = Command::new(&settings.shell)
        .arg("-c")
        .arg(cmd)
        .envs(&request.environment)
        .env("PIPELINE_RUN_ID", request.run_id.to_string())
        .env("STAGE_ID", &stage.id)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("Failed to spawn stage '{}'", stage.id))?;

    let output = timeout(stage_timeout, child.wait_with_output())
        .await
        .with_context(|| format!("Stage '{}' timed out after {:?}", stage.id, stage_timeout))?
        .with_context(|| format!("Failed to wait for stage '{}'", stage.id))?;

    for line in String::from_utf8_lossy(&output.stdout).lines() {
        debug!(stage = %stage.id, "{}", line);
    }

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);
        bail!(
            "Stage '{}' failed with exit code {}: {}",
            stage.id,
            exit_code,
            stderr.trim()
        );
    }

    Ok(())
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    async fn launch(&self, request: LaunchRequest) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(job) = jobs.get(&request.pipeline_id) {
            bail!(
                "pipeline '{}' already has run {} in flight",
                request.pipeline_id,
                job.run_id
            );
        }

        let pipeline_id = request.pipeline_id.clone();
        let run_id = request.run_id;
        let settings = self.settings.clone();
        let table = self.jobs.clone();

        let handle = tokio::spawn(async move {
            let outcome = run_stages(&settings, &request).await;

            // Teardown may already have replaced or removed this job
            {
                let mut jobs = table.lock().unwrap_or_else(PoisonError::into_inner);
                if jobs
                    .get(&request.pipeline_id)
                    .is_some_and(|job| job.run_id == request.run_id)
                {
                    jobs.remove(&request.pipeline_id);
                }
            }

            info!(pipeline = %request.pipeline_id, run_id = %request.run_id, ?outcome, "Run finished");
            if !request.report(outcome) {
                warn!(pipeline = %request.pipeline_id, "Completion dropped; no listener");
            }
        });

        jobs.insert(
            pipeline_id,
            Job {
                run_id,
                handle: handle.abort_handle(),
            },
        );
        Ok(())
    }

    async fn teardown(&self, pipeline_id: &str) -> Result<()> {
        let job = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(pipeline_id);

        if let Some(job) = job {
            info!(pipeline = %pipeline_id, run_id = %job.run_id, "Cancelling run");
            job.handle.abort();
        }
        Ok(())
    }
}

/// Environment passed to stage commands, for display
pub fn describe_environment(environment: &BTreeMap<String, String>) -> Vec<String> {
    environment
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect()
}
