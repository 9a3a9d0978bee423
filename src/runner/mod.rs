//! Runner module - Execution abstraction layer
//!
//! This module provides a unified interface for running untrusted programs:
//! - `SandboxedRunner`: direct child process confined with rlimits and
//!   namespaces
//! - `IsolateRunner`: execution inside an IOI isolate box
//!
//! Every call writes the source into a fresh location, launches a fresh
//! process, feeds stdin, and enforces the wall-clock deadline.
//!
//! The runner module does NOT:
//! - Compare outputs or determine verdicts
//! - Resolve language tags
//! - Know about test cases

pub mod isolated;
pub mod sandboxed;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::languages::LanguageConfig;
use crate::sandbox::{SandboxBackend, SandboxConfig};

/// Command specification for execution
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program path or name
    pub program: String,
    /// Arguments to the program
    pub args: Vec<String>,
    /// Environment variables (key=value)
    pub env: Vec<String>,
    /// Working directory
    pub work_dir: Option<std::path::PathBuf>,
}

impl CommandSpec {
    pub fn with_env(mut self, env: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.env = env.into_iter().map(|e| e.into()).collect();
        self
    }

    pub fn with_work_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.work_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Self {
        let mut iter = cmd.iter();
        let program = iter.next().cloned().unwrap_or_default();
        let args: Vec<String> = iter.cloned().collect();
        Self {
            program,
            args,
            env: Vec::new(),
            work_dir: None,
        }
    }

    /// Split `key=value` pairs, skipping malformed entries
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|e| e.split_once('='))
    }
}

/// Resource limits for one execution
#[derive(Debug, Clone)]
pub struct RunLimits {
    /// Wall-clock limit in milliseconds
    pub time_ms: u32,
    /// Memory limit in MB
    pub memory_mb: u32,
}

impl RunLimits {
    pub fn new(time_ms: u32, memory_mb: u32) -> Self {
        Self { time_ms, memory_mb }
    }

    pub fn from_config(config: &SandboxConfig) -> Self {
        Self::new(config.time_limit_ms, config.memory_limit_mb)
    }

    /// Limits adjusted by the language's time/memory bonus
    pub fn for_language(&self, language: &LanguageConfig) -> Self {
        Self::new(
            language.calculate_time_limit(self.time_ms),
            language.calculate_memory_limit(self.memory_mb),
        )
    }
}

impl Default for RunLimits {
    fn default() -> Self {
        Self::from_config(&SandboxConfig::default())
    }
}

/// Execution status (raw, no verdict interpretation)
#[derive(Debug, Clone, PartialEq)]
pub enum RunStatus {
    /// Program exited with code 0
    Success,
    /// Program exited with a non-zero code
    NonZeroExit(i32),
    /// Killed by a signal other than the deadline kill
    Signaled(i32),
    /// Deadline elapsed; the process group has been killed
    TimedOut,
    /// The program could not be started at all
    LaunchFailed(String),
}

/// Outcome of running a program
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub stdout: String,
    pub stderr: String,
    pub status: RunStatus,
    /// Wall-clock time in milliseconds
    pub time_ms: u64,
}

impl RunOutcome {
    pub fn launch_failed(reason: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            status: RunStatus::LaunchFailed(reason.into()),
            time_ms: 0,
        }
    }
}

/// Runner trait for executing untrusted programs
#[async_trait]
pub trait Runner: Send + Sync {
    /// Run `source` with the language's recipe, feeding `stdin`.
    ///
    /// A program failing (non-zero exit, timeout, missing interpreter) is
    /// reported through `RunOutcome::status`; `Err` is reserved for faults of
    /// the runner itself (I/O errors while supervising the child).
    async fn run(
        &self,
        language: &LanguageConfig,
        source: &str,
        stdin: &str,
        limits: &RunLimits,
    ) -> Result<RunOutcome>;
}

/// Build the runner selected by the sandbox configuration
pub fn build_runner(config: &'static SandboxConfig) -> Arc<dyn Runner> {
    match config.backend {
        SandboxBackend::Native => Arc::new(SandboxedRunner::new(config)),
        SandboxBackend::Isolate => Arc::new(IsolateRunner::new(config)),
    }
}

// Re-exports
pub use isolated::IsolateRunner;
pub use sandboxed::SandboxedRunner;
