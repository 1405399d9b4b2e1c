//! Backend trait and the dispatcher in front of it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::sandbox::config::{BackendSelection, EngineConfig};
use crate::sandbox::container::ContainerExecutor;
use crate::sandbox::filter::{BlockRules, Screening};
use crate::sandbox::outcome::{normalize, ExecutionMetadata, ExecutionOutcome, RawRun};
use crate::sandbox::restricted::RestrictedExecutor;

/// An isolation backend.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Short stable name used in logs and metadata.
    fn name(&self) -> &'static str;

    /// Run one program to completion or failure.
    ///
    /// Timeouts come back as [`SandboxError::Timeout`]; any other error means
    /// the backend itself failed.
    async fn run(&self, code: &str) -> Result<RawRun>;
}

/// The execution engine: pre-filter, one backend, normalizer.
///
/// Cheap to share behind an `Arc`; every request owns its own execution
/// state.
pub struct Sandbox {
    config: Arc<EngineConfig>,
    rules: Arc<BlockRules>,
    executor: Arc<dyn Executor>,
}

impl Sandbox {
    /// Validate `config` and pick the backend.
    ///
    /// In `Auto` mode the container backend is used only when an endpoint is
    /// configured and answers a ping; otherwise the restricted interpreter
    /// takes over. Loading that interpreter fails if its wasm file is missing.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let rules = BlockRules::new(&config.extra_block_patterns)?;
        let executor = select_executor(&config).await?;
        info!(backend = executor.name(), "execution backend selected");
        Ok(Self {
            config: Arc::new(config),
            rules: Arc::new(rules),
            executor,
        })
    }

    /// Build a sandbox around a caller-supplied backend.
    pub fn with_executor(config: EngineConfig, executor: Arc<dyn Executor>) -> Result<Self> {
        config.validate()?;
        let rules = BlockRules::new(&config.extra_block_patterns)?;
        Ok(Self {
            config: Arc::new(config),
            rules: Arc::new(rules),
            executor,
        })
    }

    /// The configuration this sandbox was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Name of the selected backend.
    pub fn backend_name(&self) -> &'static str {
        self.executor.name()
    }

    /// Execute a program. Never fails and never hangs past the timeout plus
    /// backend overhead.
    pub async fn execute(&self, code: &str) -> ExecutionOutcome {
        self.execute_with_metadata(code).await.0
    }

    /// Execute a program and report which backend ran it and for how long.
    pub async fn execute_with_metadata(&self, code: &str) -> (ExecutionOutcome, ExecutionMetadata) {
        let run_id = Uuid::new_v4();
        let backend = self.executor.name();
        let span = info_span!("execute", %run_id, backend);
        async move {
            let started = Instant::now();

            if let Screening::Blocked(reason) = self.rules.screen(code) {
                info!(%reason, "submission blocked");
                let metadata = ExecutionMetadata {
                    backend,
                    duration: started.elapsed(),
                    output_truncated: false,
                };
                return (ExecutionOutcome::Blocked { reason }, metadata);
            }

            let result = self.dispatch(code).await;
            let output_truncated = matches!(&result, Ok(run) if run.truncated);
            let outcome = normalize(result, self.config.limits.timeout);
            let duration = started.elapsed();
            debug!(outcome = outcome.kind(), ?duration, "execution finished");

            let metadata = ExecutionMetadata {
                backend,
                duration,
                output_truncated,
            };
            (outcome, metadata)
        }
        .instrument(span)
        .await
    }

    /// Run on a separate task so that a panicking backend surfaces as an
    /// error instead of tearing down the caller.
    async fn dispatch(&self, code: &str) -> Result<RawRun> {
        let executor = Arc::clone(&self.executor);
        let code = code.to_owned();
        let task = tokio::spawn(async move { executor.run(&code).await }.instrument(Span::current()));
        match task.await {
            Ok(result) => result,
            Err(e) => Err(SandboxError::Runtime(anyhow::anyhow!("backend task failed: {e}"))),
        }
    }
}

async fn select_executor(config: &EngineConfig) -> Result<Arc<dyn Executor>> {
    debug!(
        selection = ?config.backend,
        endpoint = ?config.docker_endpoint,
        "selecting execution backend"
    );
    let restricted = || -> Result<Arc<dyn Executor>> { Ok(Arc::new(RestrictedExecutor::new(config)?)) };

    match config.backend {
        BackendSelection::Restricted => restricted(),
        BackendSelection::Container => {
            let container = ContainerExecutor::new(config)?;
            container.check_image().await;
            Ok(Arc::new(container))
        }
        BackendSelection::Auto => {
            let Some(endpoint) = config.docker_endpoint.as_deref() else {
                warn!("no container endpoint configured; using the restricted interpreter");
                return restricted();
            };
            let container = match ContainerExecutor::new(config) {
                Ok(container) => container,
                Err(e) => {
                    warn!(endpoint, error = %e, "cannot open container client; using the restricted interpreter");
                    return restricted();
                }
            };
            match container.ping().await {
                Ok(()) => {
                    container.check_image().await;
                    Ok(Arc::new(container))
                }
                Err(e) => {
                    warn!(endpoint, error = %e, "container backend unreachable; using the restricted interpreter");
                    restricted()
                }
            }
        }
    }
}
