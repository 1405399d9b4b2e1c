//! Prelude module for convenient imports.

pub use crate::error::{ProgramFault, Result, SandboxError};
pub use crate::sandbox::{
    config::{BackendSelection, EngineConfig, ResourceLimits},
    executor::{Executor, Sandbox},
    outcome::{ExecutionMetadata, ExecutionOutcome, RawRun},
};
