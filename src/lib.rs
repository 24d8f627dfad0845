//! stagectl - Persistent pipeline lifecycle engine
//!
//! Manages named pipelines: ordered lists of configurable stages that are
//! built into an environment, handed to an executor, and torn down.
//!
//! # Architecture
//!
//! The store is the source of truth:
//! - Every operation loads a pipeline, mutates it, and saves it back
//! - Mutations on one pipeline id are serialized; distinct ids run in parallel
//! - Execution is delegated to an executor that reports completion later
//!
//! # Modules
//!
//! - `domain`: Data structures (Pipeline, Stage, lifecycle state)
//! - `core`: Lifecycle controller, stage registry, errors
//! - `store`: Durable pipeline storage (file, SQLite, memory)
//! - `adapters`: Execution backends (local subprocess)
//! - `service`: Request/response boundary
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! stagectl create p1
//! stagectl append compute --id stageA threads=4
//! stagectl build
//! stagectl run
//! stagectl destroy p1
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod service;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{EngineError, LifecycleController, StageKind, StageRegistry};
pub use domain::{Pipeline, PipelineState, RunOutcome, Stage, StageConfig};
pub use service::{PipelineService, Reply, Request, ServiceError};
pub use store::{FileStore, MemoryStore, PipelineStore, SqliteStore, StoreBackend};
