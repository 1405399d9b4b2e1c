//! Engine configuration with builder pattern.
//!
//! Configuration is read once at process start and shared read-only by every
//! execution. Nothing here is settable per request.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, SandboxError};

/// Default runtime image for the container backend.
pub const DEFAULT_IMAGE: &str = "python:3.11-alpine";

/// Default location of the RustPython wasm build.
pub const DEFAULT_INTERPRETER_PATH: &str = "assets/rustpython.wasm";

/// Fixed resource ceilings applied to every execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    /// Maximum wall-clock time for one run.
    pub timeout: Duration,
    /// Memory ceiling in bytes.
    pub memory: u64,
    /// Fraction of one CPU core granted to a container.
    pub cpu_share: f64,
    /// Captured output beyond this many bytes is dropped.
    pub max_output_bytes: usize,
    /// Optional fuel budget for the restricted backend, in wasm fuel units.
    pub max_steps: Option<u64>,
    /// Python recursion limit for the restricted backend.
    pub max_recursion: usize,
    /// Process count ceiling inside a container.
    pub pids_limit: i64,
    network_disabled: bool,
}

impl ResourceLimits {
    /// Network access is disabled for every backend and cannot be turned on.
    pub fn network_disabled(&self) -> bool {
        self.network_disabled
    }

    /// CPU share expressed in the daemon's nano-CPU unit.
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_share * 1_000_000_000.0).round() as i64
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            memory: 128 * 1024 * 1024, // 128MB
            cpu_share: 0.5,
            max_output_bytes: 64 * 1024,
            max_steps: None,
            max_recursion: 200,
            pids_limit: 64,
            network_disabled: true,
        }
    }
}

/// Which backend the dispatcher may pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendSelection {
    /// Use the container backend when an endpoint is configured and answers,
    /// otherwise fall back to the restricted interpreter.
    #[default]
    Auto,
    /// Always use the container backend; failures surface per request.
    Container,
    /// Always use the restricted wasm interpreter.
    Restricted,
}

impl FromStr for BackendSelection {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "container" | "docker" => Ok(Self::Container),
            "restricted" | "in-process" | "fallback" => Ok(Self::Restricted),
            other => Err(SandboxError::Config(format!("unknown backend `{other}`"))),
        }
    }
}

/// Configuration for the execution engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Resource ceilings shared by both backends.
    pub limits: ResourceLimits,
    /// Backend selection policy.
    pub backend: BackendSelection,
    /// Container daemon endpoint: `local`, `unix://...`, `tcp://...` or `http://...`.
    pub docker_endpoint: Option<String>,
    /// Runtime image for the container backend.
    pub image: String,
    /// RustPython wasm module for the restricted backend.
    pub interpreter_path: PathBuf,
    /// Ceiling for any single call to the container daemon.
    pub backend_timeout: Duration,
    /// Extra regex block patterns appended to the default rule set.
    pub extra_block_patterns: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: ResourceLimits::default(),
            backend: BackendSelection::Auto,
            docker_endpoint: None,
            image: DEFAULT_IMAGE.to_string(),
            interpreter_path: PathBuf::from(DEFAULT_INTERPRETER_PATH),
            backend_timeout: Duration::from_secs(10),
            extra_block_patterns: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Create a new builder for EngineConfig.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Build a configuration from `SANDBOX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = Self::builder();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("SANDBOX_BACKEND") {
            builder = builder.backend(v.parse()?);
        }
        if let Some(v) = get("SANDBOX_DOCKER_HOST") {
            builder = builder.docker_endpoint(v.trim());
        }
        if let Some(v) = get("SANDBOX_IMAGE") {
            builder = builder.image(v.trim());
        }
        if let Some(v) = get("SANDBOX_INTERPRETER_PATH") {
            builder = builder.interpreter_path(v.trim());
        }
        if let Some(v) = get("SANDBOX_TIMEOUT_MS") {
            builder = builder.timeout(Duration::from_millis(parse_num("SANDBOX_TIMEOUT_MS", &v)?));
        }
        if let Some(v) = get("SANDBOX_MEMORY_MB") {
            let mb: u64 = parse_num("SANDBOX_MEMORY_MB", &v)?;
            let bytes = mb.checked_mul(1024 * 1024).ok_or_else(|| {
                SandboxError::Config(format!("SANDBOX_MEMORY_MB: {mb} MiB does not fit in bytes"))
            })?;
            builder = builder.memory(bytes);
        }
        if let Some(v) = get("SANDBOX_CPU_SHARE") {
            builder = builder.cpu_share(parse_num("SANDBOX_CPU_SHARE", &v)?);
        }
        if let Some(v) = get("SANDBOX_MAX_OUTPUT_BYTES") {
            builder = builder.max_output_bytes(parse_num("SANDBOX_MAX_OUTPUT_BYTES", &v)?);
        }
        if let Some(v) = get("SANDBOX_MAX_STEPS") {
            builder = builder.max_steps(parse_num("SANDBOX_MAX_STEPS", &v)?);
        }
        if let Some(v) = get("SANDBOX_BACKEND_TIMEOUT_MS") {
            builder = builder.backend_timeout(Duration::from_millis(parse_num(
                "SANDBOX_BACKEND_TIMEOUT_MS",
                &v,
            )?));
        }
        if let Some(v) = get("SANDBOX_EXTRA_BLOCK_PATTERNS") {
            for pattern in v.split(';').map(str::trim).filter(|p| !p.is_empty()) {
                builder = builder.block_pattern(pattern);
            }
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }

    /// Reject limits that would make every run fail or never finish.
    pub fn validate(&self) -> Result<()> {
        if self.limits.timeout.is_zero() {
            return Err(SandboxError::Config("timeout must be positive".to_string()));
        }
        if self.limits.memory == 0 {
            return Err(SandboxError::Config("memory ceiling must be positive".to_string()));
        }
        if !(self.limits.cpu_share > 0.0 && self.limits.cpu_share <= 64.0) {
            return Err(SandboxError::Config(format!(
                "cpu share {} is outside (0, 64]",
                self.limits.cpu_share
            )));
        }
        if self.backend_timeout.is_zero() {
            return Err(SandboxError::Config("backend timeout must be positive".to_string()));
        }
        if self.backend == BackendSelection::Container && self.docker_endpoint.is_none() {
            return Err(SandboxError::Config(
                "container backend requires SANDBOX_DOCKER_HOST".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_num<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| SandboxError::Config(format!("{key}: cannot parse `{value}`")))
}

/// Builder for creating EngineConfig instances.
#[derive(Debug, Clone, Default)]
pub struct EngineConfigBuilder {
    timeout: Option<Duration>,
    memory: Option<u64>,
    cpu_share: Option<f64>,
    max_output_bytes: Option<usize>,
    max_steps: Option<u64>,
    max_recursion: Option<usize>,
    pids_limit: Option<i64>,
    backend: Option<BackendSelection>,
    docker_endpoint: Option<String>,
    image: Option<String>,
    interpreter_path: Option<PathBuf>,
    backend_timeout: Option<Duration>,
    extra_block_patterns: Vec<String>,
}

impl EngineConfigBuilder {
    /// Set the wall-clock timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the memory ceiling in bytes.
    pub fn memory(mut self, bytes: u64) -> Self {
        self.memory = Some(bytes);
        self
    }

    /// Set the CPU share (fraction of one core).
    pub fn cpu_share(mut self, share: f64) -> Self {
        self.cpu_share = Some(share);
        self
    }

    /// Set the captured output cap in bytes.
    pub fn max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    /// Set the restricted backend's fuel budget.
    pub fn max_steps(mut self, steps: u64) -> Self {
        self.max_steps = Some(steps);
        self
    }

    /// Set the restricted backend's recursion limit.
    pub fn max_recursion(mut self, depth: usize) -> Self {
        self.max_recursion = Some(depth);
        self
    }

    /// Set the container process limit.
    pub fn pids_limit(mut self, pids: i64) -> Self {
        self.pids_limit = Some(pids);
        self
    }

    /// Set the backend selection policy.
    pub fn backend(mut self, backend: BackendSelection) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the container daemon endpoint.
    pub fn docker_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.docker_endpoint = Some(endpoint.into());
        self
    }

    /// Set the container runtime image.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set the path to the RustPython wasm interpreter.
    pub fn interpreter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.interpreter_path = Some(path.into());
        self
    }

    /// Set the per-call ceiling for container daemon requests.
    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.backend_timeout = Some(timeout);
        self
    }

    /// Append an extra regex block pattern.
    pub fn block_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.extra_block_patterns.push(pattern.into());
        self
    }

    /// Build the EngineConfig.
    pub fn build(self) -> EngineConfig {
        let default = EngineConfig::default();
        let limits = default.limits;
        EngineConfig {
            limits: ResourceLimits {
                timeout: self.timeout.unwrap_or(limits.timeout),
                memory: self.memory.unwrap_or(limits.memory),
                cpu_share: self.cpu_share.unwrap_or(limits.cpu_share),
                max_output_bytes: self.max_output_bytes.unwrap_or(limits.max_output_bytes),
                max_steps: self.max_steps.or(limits.max_steps),
                max_recursion: self.max_recursion.unwrap_or(limits.max_recursion),
                pids_limit: self.pids_limit.unwrap_or(limits.pids_limit),
                network_disabled: true,
            },
            backend: self.backend.unwrap_or(default.backend),
            docker_endpoint: self.docker_endpoint.or(default.docker_endpoint),
            image: self.image.unwrap_or(default.image),
            interpreter_path: self.interpreter_path.unwrap_or(default.interpreter_path),
            backend_timeout: self.backend_timeout.unwrap_or(default.backend_timeout),
            extra_block_patterns: self.extra_block_patterns,
        }
    }
}
