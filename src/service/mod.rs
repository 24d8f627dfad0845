//! Request/response boundary over the lifecycle controller.
//!
//! Requests are JSON objects tagged by `method`. Every reply is either a
//! structured result or `{"error": {operation, kind, message}}`; engine
//! errors never cross this boundary in any other form.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::{EngineError, LifecycleController};
use crate::domain::{Pipeline, StageConfig};

/// Config keys that override `configure_now` on append
const CONFIGURE_NOW_KEYS: [&str; 2] = ["configure_now", "do_configure"];

fn default_true() -> bool {
    true
}

/// A single boundary request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Create {
        pipeline_id: String,
    },
    Load {
        #[serde(default)]
        pipeline_id: Option<String>,
    },
    Append {
        pipeline_id: String,
        stage_type: String,
        #[serde(default)]
        stage_id: Option<String>,
        #[serde(default = "default_true")]
        configure_now: bool,
        #[serde(default)]
        config: StageConfig,
    },
    Configure {
        pipeline_id: String,
        stage_id: String,
        #[serde(default)]
        config: StageConfig,
    },
    Unlink {
        pipeline_id: String,
        stage_id: String,
    },
    Relink {
        pipeline_id: String,
        stage_id: String,
    },
    Remove {
        pipeline_id: String,
        stage_id: String,
    },
    Build {
        pipeline_id: String,
    },
    Run {
        pipeline_id: String,
    },
    Destroy {
        pipeline_id: String,
    },
    List {
        #[serde(default)]
        pattern: Option<String>,
    },
    Inspect {
        #[serde(default)]
        pipeline_id: Option<String>,
    },
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Create { .. } => Operation::Create,
            Self::Load { .. } => Operation::Load,
            Self::Append { .. } => Operation::Append,
            Self::Configure { .. } => Operation::Configure,
            Self::Unlink { .. } => Operation::Unlink,
            Self::Relink { .. } => Operation::Relink,
            Self::Remove { .. } => Operation::Remove,
            Self::Build { .. } => Operation::Build,
            Self::Run { .. } => Operation::Run,
            Self::Destroy { .. } => Operation::Destroy,
            Self::List { .. } => Operation::List,
            Self::Inspect { .. } => Operation::Inspect,
        }
    }
}

/// Boundary operation names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Load,
    Append,
    Configure,
    Unlink,
    Relink,
    Remove,
    Build,
    Run,
    Destroy,
    List,
    Inspect,
}

impl Operation {
    /// Capitalized name used in error messages
    pub fn title(&self) -> &'static str {
        match self {
            Self::Create => "Create",
            Self::Load => "Load",
            Self::Append => "Append",
            Self::Configure => "Configure",
            Self::Unlink => "Unlink",
            Self::Relink => "Relink",
            Self::Remove => "Remove",
            Self::Build => "Build",
            Self::Run => "Run",
            Self::Destroy => "Destroy",
            Self::List => "List",
            Self::Inspect => "Inspect",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.title().to_ascii_lowercase())
    }
}

/// Lifecycle status reported by status-style replies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Created,
    Loaded,
    Built,
    Running,
    Destroyed,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Loaded => "loaded",
            Self::Built => "built",
            Self::Running => "running",
            Self::Destroyed => "destroyed",
        })
    }
}

/// Operation-specific reply payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Detail {
    Status(Status),
    /// Stage type that was appended
    Appended(String),
    Configured(String),
    Unlinked(String),
    Relinked(String),
    Removed(String),
    Pipelines(Vec<String>),
    Pipeline(Box<Pipeline>),
}

/// Successful reply
#[derive(Debug, Clone, Serialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,

    /// Id of the appended stage
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,

    #[serde(flatten)]
    pub detail: Detail,
}

impl Reply {
    fn new(pipeline_id: impl Into<String>, detail: Detail) -> Self {
        Self {
            pipeline_id: Some(pipeline_id.into()),
            stage_id: None,
            run_id: None,
            detail,
        }
    }

    fn status(pipeline_id: impl Into<String>, status: Status) -> Self {
        Self::new(pipeline_id, Detail::Status(status))
    }
}

/// Uniform failure shape at the boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ServiceError {
    /// Operation that failed (snake_case), or "request" for unparseable input
    pub operation: String,

    /// Stable category, see `EngineError::kind`
    pub kind: String,

    /// "<Operation> failed: <cause>"
    pub message: String,
}

impl ServiceError {
    pub fn from_engine(operation: Operation, err: &EngineError) -> Self {
        Self {
            operation: operation.to_string(),
            kind: err.kind().to_string(),
            message: format!("{} failed: {}", operation.title(), err),
        }
    }

    /// A request that could not be decoded
    pub fn invalid_request(cause: impl fmt::Display) -> Self {
        Self {
            operation: "request".to_string(),
            kind: "invalid_request".to_string(),
            message: format!("Request failed: {}", cause),
        }
    }

    /// The `{"error": {...}}` wire form
    pub fn envelope(&self) -> serde_json::Value {
        serde_json::json!({ "error": self })
    }
}

/// Remove a boolean `configure_now`/`do_configure` key from an append config
fn take_configure_flag(config: &mut StageConfig) -> Option<bool> {
    let mut flag = None;
    for key in CONFIGURE_NOW_KEYS {
        if let Some(value) = config.get(key).and_then(|v| v.as_bool()) {
            config.remove(key);
            flag = flag.or(Some(value));
        }
    }
    flag
}

/// Thin translation layer from requests to controller calls
#[derive(Clone)]
pub struct PipelineService {
    controller: Arc<LifecycleController>,
}

impl PipelineService {
    pub fn new(controller: Arc<LifecycleController>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    /// Execute one request
    pub async fn handle(&self, request: Request) -> Result<Reply, ServiceError> {
        let operation = request.operation();
        debug!(%operation, "Handling request");

        self.dispatch(request).await.map_err(|e| {
            warn!(%operation, kind = e.kind(), error = %e, "Request failed");
            ServiceError::from_engine(operation, &e)
        })
    }

    async fn dispatch(&self, request: Request) -> Result<Reply, EngineError> {
        let ctl = &self.controller;

        Ok(match request {
            Request::Create { pipeline_id } => {
                ctl.create(&pipeline_id).await?;
                Reply::status(pipeline_id, Status::Created)
            }
            Request::Load { pipeline_id } => {
                let pipeline = ctl.load(pipeline_id.as_deref()).await?;
                Reply::status(pipeline.id(), Status::Loaded)
            }
            Request::Append {
                pipeline_id,
                stage_type,
                stage_id,
                configure_now,
                mut config,
            } => {
                let configure_now = take_configure_flag(&mut config).unwrap_or(configure_now);
                let stage = ctl
                    .append(&pipeline_id, &stage_type, stage_id, configure_now, config)
                    .await?;
                Reply {
                    stage_id: Some(stage.id),
                    ..Reply::new(pipeline_id, Detail::Appended(stage_type))
                }
            }
            Request::Configure {
                pipeline_id,
                stage_id,
                config,
            } => {
                ctl.configure(&pipeline_id, &stage_id, config).await?;
                Reply::new(pipeline_id, Detail::Configured(stage_id))
            }
            Request::Unlink {
                pipeline_id,
                stage_id,
            } => {
                ctl.unlink(&pipeline_id, &stage_id).await?;
                Reply::new(pipeline_id, Detail::Unlinked(stage_id))
            }
            Request::Relink {
                pipeline_id,
                stage_id,
            } => {
                ctl.relink(&pipeline_id, &stage_id).await?;
                Reply::new(pipeline_id, Detail::Relinked(stage_id))
            }
            Request::Remove {
                pipeline_id,
                stage_id,
            } => {
                ctl.remove(&pipeline_id, &stage_id).await?;
                Reply::new(pipeline_id, Detail::Removed(stage_id))
            }
            Request::Build { pipeline_id } => {
                ctl.build(&pipeline_id).await?;
                Reply::status(pipeline_id, Status::Built)
            }
            Request::Run { pipeline_id } => {
                let run_id = ctl.run(&pipeline_id).await?;
                Reply {
                    run_id: Some(run_id),
                    ..Reply::status(pipeline_id, Status::Running)
                }
            }
            Request::Destroy { pipeline_id } => {
                ctl.destroy(&pipeline_id).await?;
                Reply::status(pipeline_id, Status::Destroyed)
            }
            Request::List { pattern } => Reply {
                pipeline_id: None,
                stage_id: None,
                run_id: None,
                detail: Detail::Pipelines(ctl.list(pattern.as_deref()).await?),
            },
            Request::Inspect { pipeline_id } => {
                let pipeline = ctl.inspect(pipeline_id.as_deref()).await?;
                Reply::new(pipeline.id().to_string(), Detail::Pipeline(Box::new(pipeline)))
            }
        })
    }

    /// Decode one JSON request, execute it, and encode the reply
    pub async fn handle_line(&self, line: &str) -> String {
        let outcome = match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => Err(ServiceError::invalid_request(e)),
        };

        match outcome {
            Ok(reply) => serde_json::to_string(&reply).unwrap_or_else(|e| {
                ServiceError::invalid_request(format!("could not encode reply: {}", e))
                    .envelope()
                    .to_string()
            }),
            Err(error) => error.envelope().to_string(),
        }
    }

    /// Serve JSON-lines requests until `reader` reaches EOF
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let reply = self.handle_line(&line).await;
            writer.write_all(reply.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok(())
    }
}
