//! Sandboxed runner implementation using isolate
//!
//! Executes untrusted user code in an isolate box: cgroup memory limit,
//! separate PID/network/mount namespaces and a read-only runtime filesystem.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Instant;
use tracing::{debug, warn};

use super::{RunLimits, RunOutcome, RunStatus, Runner};
use crate::languages::LanguageConfig;
use crate::sandbox::{
    is_cgroups_available, next_box_id, IsolateBox, IsolateStatus, Limits, SandboxConfig,
};

/// Runner that executes code in isolate sandbox
pub struct IsolateRunner {
    config: &'static SandboxConfig,
}

impl IsolateRunner {
    pub fn new(config: &'static SandboxConfig) -> Self {
        Self { config }
    }

    /// Run a program in a freshly initialized box
    pub async fn execute(
        &self,
        language: &LanguageConfig,
        source: &str,
        stdin_content: &str,
        limits: &RunLimits,
    ) -> Result<RunOutcome> {
        let use_cgroups = is_cgroups_available().await;
        let box_id = next_box_id(self.config.worker_id);

        let isolate_box = match IsolateBox::new(box_id, use_cgroups).await {
            Ok(isolate_box) => isolate_box,
            Err(e) => {
                warn!("Failed to prepare isolate box {}: {:#}", box_id, e);
                return Ok(RunOutcome::launch_failed(format!("{:#}", e)));
            }
        };

        let result = self
            .run_in_box(&isolate_box, language, source, stdin_content, limits)
            .await;

        // Cleanup even when the run itself failed
        if let Err(e) = isolate_box.cleanup().await {
            warn!("Failed to clean up isolate box {}: {:#}", box_id, e);
        }

        result
    }

    async fn run_in_box(
        &self,
        isolate_box: &IsolateBox,
        language: &LanguageConfig,
        source: &str,
        stdin_content: &str,
        limits: &RunLimits,
    ) -> Result<RunOutcome> {
        isolate_box.write_file(&language.source_file, source).await?;

        let sandbox_limits = Limits {
            time_ms: limits.time_ms,
            memory_mb: limits.memory_mb,
            processes: self.config.max_processes,
            open_files: self.config.max_open_files,
            fsize_kb: self.config.max_file_size_kb,
        };

        let start = Instant::now();
        let outcome = isolate_box
            .run(
                &language.command(),
                &sandbox_limits,
                stdin_content,
                self.config.max_output_kb as usize * 1024,
            )
            .await?;
        let elapsed = start.elapsed();

        debug!(
            "isolate finished: status={:?} time={}ms wall={}ms mem={}KB",
            outcome.meta.status,
            outcome.meta.time_ms,
            outcome.meta.wall_time_ms,
            outcome.meta.memory_kb
        );

        let status = run_status(outcome.meta.status, outcome.meta.exit_code, outcome.meta.message);

        Ok(RunOutcome {
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            status,
            time_ms: elapsed.as_millis() as u64,
        })
    }
}

fn run_status(status: IsolateStatus, exit_code: i32, message: Option<String>) -> RunStatus {
    match status {
        IsolateStatus::Ok => RunStatus::Success,
        IsolateStatus::RuntimeError => RunStatus::NonZeroExit(exit_code),
        IsolateStatus::TimeOut => RunStatus::TimedOut,
        IsolateStatus::Signal(sig) => RunStatus::Signaled(sig),
        IsolateStatus::InternalError => RunStatus::LaunchFailed(
            message.unwrap_or_else(|| "isolate internal error".to_string()),
        ),
    }
}

#[async_trait]
impl Runner for IsolateRunner {
    async fn run(
        &self,
        language: &LanguageConfig,
        source: &str,
        stdin: &str,
        limits: &RunLimits,
    ) -> Result<RunOutcome> {
        self.execute(language, source, stdin, limits).await
    }
}
