//! # CodeQuest Sandbox
//!
//! Execution engine for short Python programs written by children on a
//! learning platform.
//!
//! A submission first passes a static pre-filter that rejects obviously
//! dangerous source text. Admitted programs run on exactly one backend,
//! chosen once when the [`Sandbox`] is built:
//!
//! - **Container**: a throwaway Docker container with no network, a
//!   read-only mount of the program, capped memory, CPU and process count.
//! - **Restricted**: RustPython compiled to WebAssembly and run under
//!   wasmtime, with a hard memory ceiling, an epoch deadline, optional fuel
//!   and an allow-listed set of builtins. The guest sees no filesystem and no
//!   network.
//!
//! Every run ends in one [`ExecutionOutcome`]; the engine never returns an
//! error to the caller for anything the submitted program does.
//!
//! ## Example
//!
//! ```rust,no_run
//! use codequest_sandbox::prelude::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let config = EngineConfig::builder()
//!         .timeout(Duration::from_secs(5))
//!         .backend(BackendSelection::Restricted)
//!         .build();
//!
//!     let sandbox = Sandbox::new(config).await?;
//!     let outcome = sandbox.execute("print(1 + 1)").await;
//!
//!     assert_eq!(outcome.stdout(), Some("2"));
//!     assert!(outcome.is_success());
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! [`EngineConfig::from_env`] reads `SANDBOX_*` variables such as
//! `SANDBOX_BACKEND`, `SANDBOX_DOCKER_HOST` and `SANDBOX_TIMEOUT_MS`. The
//! restricted backend loads its interpreter from `SANDBOX_INTERPRETER_PATH`
//! (default `assets/rustpython.wasm`).

pub mod error;
pub mod prelude;
pub mod sandbox;

// Re-export main types at crate root for convenience
pub use error::{ProgramFault, Result, SandboxError};
pub use sandbox::config::{BackendSelection, EngineConfig, EngineConfigBuilder, ResourceLimits};
pub use sandbox::executor::{Executor, Sandbox};
pub use sandbox::filter::{BlockRules, Screening};
pub use sandbox::outcome::{ExecutionMetadata, ExecutionOutcome, RawRun};
