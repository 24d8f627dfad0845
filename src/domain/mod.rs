//! Domain types for the pipeline engine.
//!
//! This module contains the core data structures:
//! - Pipeline: Ordered stages plus lifecycle state
//! - Stage: A configurable unit of work

pub mod pipeline;
pub mod stage;

// Re-export commonly used types
pub use pipeline::{validate_identifier, Pipeline, PipelineState, RunOutcome, RunRecord};
pub use stage::{Stage, StageConfig};
