//! Sandbox configuration
//!
//! Execution limits and isolation settings, read from the environment once at
//! startup and frozen for the lifetime of the process.

use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;

/// Which isolation mechanism runs untrusted programs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackend {
    /// Direct child process confined with rlimits, a private session and
    /// namespaces
    Native,
    /// IOI isolate boxes (cgroups, namespaces, minimal filesystem)
    Isolate,
}

impl FromStr for SandboxBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "native" => Ok(SandboxBackend::Native),
            "isolate" => Ok(SandboxBackend::Isolate),
            other => anyhow::bail!("Unknown sandbox backend: {}", other),
        }
    }
}

/// Namespace jail policy for the native backend.
///
/// The jail gives each program private user, mount, PID, network and IPC
/// namespaces, a read-only runtime filesystem rooted at its scratch
/// directory, and an unprivileged uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationMode {
    /// Rlimits and a private session only
    Off,
    /// Use the jail when the host supports it, otherwise fall back to `Off`
    /// at startup
    BestEffort,
    /// Refuse to start when the jail cannot be built
    Required,
}

impl FromStr for IsolationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "off" => Ok(IsolationMode::Off),
            "best_effort" => Ok(IsolationMode::BestEffort),
            "required" => Ok(IsolationMode::Required),
            other => anyhow::bail!("Unknown isolation mode: {}", other),
        }
    }
}

/// Sandbox configuration
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    pub isolation: IsolationMode,
    /// Wall-clock limit per execution in milliseconds (default: 5000ms)
    pub time_limit_ms: u32,
    /// Memory limit per execution in MB (default: 256MB)
    pub memory_limit_mb: u32,
    /// Maximum number of processes
    pub max_processes: u32,
    /// Maximum open files
    pub max_open_files: u32,
    /// Maximum size of a written file in KB
    pub max_file_size_kb: u32,
    /// Captured bytes per output stream in KB
    pub max_output_kb: u32,
    /// Worker ID for isolate box ID allocation (0-9)
    pub worker_id: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Native,
            isolation: IsolationMode::BestEffort,
            time_limit_ms: 5_000,
            memory_limit_mb: 256,
            max_processes: 256,
            max_open_files: 64,
            max_file_size_kb: 16 * 1024,
            max_output_kb: 1024,
            worker_id: 0,
        }
    }
}

impl SandboxConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            backend: env_or("SANDBOX_BACKEND", defaults.backend)?,
            isolation: env_or("SANDBOX_ISOLATION", defaults.isolation)?,
            time_limit_ms: env_or("EXEC_TIME_LIMIT_MS", defaults.time_limit_ms)?,
            memory_limit_mb: env_or("EXEC_MEMORY_LIMIT_MB", defaults.memory_limit_mb)?,
            max_processes: env_or("EXEC_MAX_PROCESSES", defaults.max_processes)?,
            max_open_files: defaults.max_open_files,
            max_file_size_kb: defaults.max_file_size_kb,
            max_output_kb: env_or("EXEC_MAX_OUTPUT_KB", defaults.max_output_kb)?,
            worker_id: env_or("WORKER_ID", defaults.worker_id)?,
        })
    }
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {}={}: {}", key, value, e)),
        Err(_) => Ok(default),
    }
}

/// Global sandbox configuration
static SANDBOX_CONFIG: OnceLock<SandboxConfig> = OnceLock::new();

/// Freeze the sandbox configuration for this process
pub fn init_config(config: SandboxConfig) -> anyhow::Result<&'static SandboxConfig> {
    let mut pending = Some(config);
    let frozen = SANDBOX_CONFIG.get_or_init(|| pending.take().unwrap_or_default());

    // Still holding it means another configuration won the race
    if pending.is_some() {
        anyhow::bail!("Sandbox configuration already initialized");
    }
    Ok(frozen)
}

/// Global counter for box ID allocation within worker's range
static BOX_ID_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Get next isolate box ID.
/// Isolate only supports box IDs 0-9999; each worker (0-9) owns a range of
/// 1000 IDs so concurrent workers never collide.
pub fn next_box_id(worker_id: u32) -> u32 {
    let counter = BOX_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    (worker_id % 10) * 1000 + (counter % 1000)
}
