//! Container executor.
//!
//! Every request gets its own [`ExecutionUnit`]: a temp directory holding
//! `main.py`, mounted read-only into a fresh container with no network, a
//! memory ceiling, a CPU share and all capabilities dropped. The unit is
//! released before the result leaves this module, whatever happened.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use futures_util::stream::StreamExt;
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{Result, SandboxError};
use crate::sandbox::config::{EngineConfig, ResourceLimits};
use crate::sandbox::executor::Executor;
use crate::sandbox::io::CapturedOutput;
use crate::sandbox::outcome::RawRun;

/// Where the program directory is mounted inside the container.
const WORK_DIR: &str = "/work";
const SCRIPT_NAME: &str = "main.py";

/// Open a client for `endpoint` without contacting the daemon.
pub fn connect(endpoint: Option<&str>, timeout: Duration) -> Result<Docker> {
    let secs = timeout.as_secs().max(1);
    let docker = match endpoint.map(str::trim) {
        None | Some("") | Some("local") => Docker::connect_with_local_defaults()?,
        Some(path) if path.starts_with("unix://") => {
            Docker::connect_with_unix(path, secs, API_DEFAULT_VERSION)?
        }
        Some(addr) if addr.starts_with("tcp://") || addr.starts_with("http://") => {
            Docker::connect_with_http(addr, secs, API_DEFAULT_VERSION)?
        }
        Some(other) => {
            return Err(SandboxError::Config(format!(
                "unsupported docker endpoint `{other}`"
            )))
        }
    };
    Ok(docker.with_timeout(timeout))
}

/// Executor that runs each program in a throwaway container.
#[derive(Debug, Clone)]
pub struct ContainerExecutor {
    docker: Docker,
    image: String,
    limits: ResourceLimits,
    backend_timeout: Duration,
}

impl ContainerExecutor {
    /// Create an executor for the configured endpoint. Nothing is sent to
    /// the daemon until [`ping`](Self::ping) or the first run.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let docker = connect(config.docker_endpoint.as_deref(), config.backend_timeout)?;
        Ok(Self {
            docker,
            image: config.image.clone(),
            limits: config.limits.clone(),
            backend_timeout: config.backend_timeout,
        })
    }

    /// Check that the daemon answers within the backend timeout.
    pub async fn ping(&self) -> Result<()> {
        self.infra("ping", self.docker.ping()).await?;
        Ok(())
    }

    /// Warn early when the runtime image is not present on the daemon.
    /// Images are never pulled here; a missing image fails each run instead.
    pub async fn check_image(&self) {
        if let Err(e) = self.infra("inspect image", self.docker.inspect_image(&self.image)).await {
            warn!(image = %self.image, error = %e, "runtime image is not available");
        }
    }

    /// Run an infrastructure call under the backend timeout.
    async fn infra<T, F>(&self, what: &str, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, bollard::errors::Error>>,
    {
        match tokio::time::timeout(self.backend_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SandboxError::BackendUnavailable(format!(
                "{what} did not answer within {:?}",
                self.backend_timeout
            ))),
        }
    }

    fn container_body(&self, mount_source: &str) -> ContainerCreateBody {
        let memory = i64::try_from(self.limits.memory).unwrap_or(i64::MAX);
        ContainerCreateBody {
            image: Some(self.image.clone()),
            cmd: Some(vec![
                "python".to_string(),
                format!("{WORK_DIR}/{SCRIPT_NAME}"),
            ]),
            working_dir: Some(WORK_DIR.to_string()),
            network_disabled: Some(self.limits.network_disabled()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{mount_source}:{WORK_DIR}:ro")]),
                network_mode: Some("none".to_string()),
                memory: Some(memory),
                memory_swap: Some(memory),
                nano_cpus: Some(self.limits.nano_cpus()),
                pids_limit: Some(self.limits.pids_limit),
                cap_drop: Some(vec!["ALL".to_string()]),
                security_opt: Some(vec!["no-new-privileges".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    async fn run_in(&self, unit: &mut ExecutionUnit) -> Result<RawRun> {
        let body = self.container_body(&unit.mount_source()?);
        let options = CreateContainerOptions {
            name: Some(format!("cq-run-{}", unit.run_id)),
            ..Default::default()
        };
        let created = self
            .infra("create container", self.docker.create_container(Some(options), body))
            .await?;
        unit.container = Some(created.id.clone());
        debug!(run_id = %unit.run_id, container = %created.id, "container created");

        self.infra(
            "start container",
            self.docker
                .start_container(&created.id, None::<StartContainerOptions>),
        )
        .await?;

        let exit_status = self.wait(&created.id).await?;
        let output = self.infra("read logs", self.collect_logs(&created.id)).await?;
        let (stdout, truncated) = output.into_parts();

        // The combined log is the program's output; the normalizer moves it
        // to stderr when the exit status says the program failed.
        Ok(RawRun {
            stdout,
            stderr: String::new(),
            exit_status,
            truncated,
        })
    }

    async fn wait(&self, id: &str) -> Result<i64> {
        let mut stream = self.docker.wait_container(id, None::<WaitContainerOptions>);
        match tokio::time::timeout(self.limits.timeout, stream.next()).await {
            Err(_) => Err(SandboxError::Timeout(self.limits.timeout)),
            Ok(Some(Ok(response))) => Ok(response.status_code),
            // Non-zero exits are reported through the error channel.
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => Ok(code),
            Ok(Some(Err(e))) => Err(e.into()),
            Ok(None) => Err(SandboxError::BackendUnavailable(
                "container wait stream ended without a status".to_string(),
            )),
        }
    }

    async fn collect_logs(&self, id: &str) -> std::result::Result<CapturedOutput, bollard::errors::Error> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut output = CapturedOutput::with_limit(self.limits.max_output_bytes);
        while let Some(chunk) = stream.next().await {
            match chunk? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => output.push_bytes(&message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(output)
    }
}

#[async_trait]
impl Executor for ContainerExecutor {
    fn name(&self) -> &'static str {
        "container"
    }

    async fn run(&self, code: &str) -> Result<RawRun> {
        let mut unit = ExecutionUnit::create(self.docker.clone(), code).await?;
        let result = self.run_in(&mut unit).await;
        self.conclude(&mut unit, result).await
    }
}

impl ContainerExecutor {
    /// Log how the run ended and release its unit on every path.
    async fn conclude(&self, unit: &mut ExecutionUnit, result: Result<RawRun>) -> Result<RawRun> {
        if let Err(e) = &result {
            if e.is_timeout() {
                warn!(run_id = %unit.run_id, timeout = ?self.limits.timeout, "container run timed out");
            } else {
                error!(run_id = %unit.run_id, error = %e, "container run failed");
            }
        }
        unit.release(self.backend_timeout).await;
        result
    }
}

/// The temp directory and container owned by one request.
///
/// [`release`](Self::release) is the normal exit path. If the owning future
/// is dropped first, `Drop` removes the directory and schedules the
/// container's removal on the current runtime.
#[derive(Debug)]
pub struct ExecutionUnit {
    run_id: Uuid,
    docker: Docker,
    dir: Option<TempDir>,
    container: Option<String>,
}

impl ExecutionUnit {
    /// Create the directory and write the program into it.
    pub async fn create(docker: Docker, code: &str) -> Result<Self> {
        let run_id = Uuid::new_v4();
        let dir = tempfile::Builder::new().prefix("cq_").tempdir()?;
        let mut file = tokio::fs::File::create(dir.path().join(SCRIPT_NAME)).await?;
        file.write_all(code.as_bytes()).await?;
        file.flush().await?;
        debug!(run_id = %run_id, dir = %dir.path().display(), "execution unit created");
        Ok(Self {
            run_id,
            docker,
            dir: Some(dir),
            container: None,
        })
    }

    /// Identifier used in the container name and in logs.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Host directory holding `main.py`, until the unit is released.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(TempDir::path)
    }

    fn mount_source(&self) -> Result<String> {
        let path = self.path().ok_or_else(|| {
            SandboxError::Runtime(anyhow::anyhow!("execution unit already released"))
        })?;
        path.to_str().map(str::to_string).ok_or_else(|| {
            SandboxError::Runtime(anyhow::anyhow!(
                "temp directory path is not valid UTF-8: {}",
                path.display()
            ))
        })
    }

    /// Remove the container and the directory. Failures are logged only.
    pub async fn release(&mut self, timeout: Duration) {
        if let Some(id) = self.container.take() {
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match tokio::time::timeout(timeout, self.docker.remove_container(&id, Some(options))).await {
                Ok(Ok(())) => debug!(run_id = %self.run_id, container = %id, "container removed"),
                Ok(Err(e)) => {
                    warn!(run_id = %self.run_id, container = %id, error = %e, "failed to remove container")
                }
                Err(_) => {
                    warn!(run_id = %self.run_id, container = %id, "container removal timed out")
                }
            }
        }
        if let Some(dir) = self.dir.take() {
            if let Err(e) = dir.close() {
                warn!(run_id = %self.run_id, error = %e, "failed to remove temp directory");
            }
        }
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        let Some(id) = self.container.take() else {
            return;
        };
        warn!(run_id = %self.run_id, container = %id, "execution unit dropped before release");
        let docker = self.docker.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let options = RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    };
                    if let Err(e) = docker.remove_container(&id, Some(options)).await {
                        warn!(container = %id, error = %e, "background container removal failed");
                    }
                });
            }
            Err(_) => error!(container = %id, "no runtime available to remove container"),
        }
    }
}
