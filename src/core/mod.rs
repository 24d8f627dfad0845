//! Core engine logic.
//!
//! This module contains:
//! - LifecycleController: load -> mutate -> save, per-id serialization
//! - StageRegistry: stage kinds and their build-time contract
//! - KeyedLocks: per-pipeline async mutexes
//! - EngineError: the failure taxonomy

pub mod controller;
pub mod error;
pub mod locks;
pub mod registry;

// Re-export commonly used types
pub use controller::LifecycleController;
pub use error::{EngineError, Result};
pub use locks::KeyedLocks;
pub use registry::{DeclaredKind, StageKind, StageRegistry};
