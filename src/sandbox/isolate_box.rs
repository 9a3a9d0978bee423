//! Isolate box management
//!
//! Low-level wrapper around the isolate sandbox for secure code execution.
//! Manages box initialization, cleanup, and command execution.
//!
//! See: https://github.com/ioi/isolate

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::OnceLock;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, warn};

use super::meta::{parse_meta, IsolateMeta};
use crate::runner::CommandSpec;

/// Cached cgroup availability
static USE_CGROUPS: OnceLock<bool> = OnceLock::new();

/// Box reserved for the cgroup support check
const CGROUP_CHECK_BOX_ID: u32 = 9999;

/// Check if isolate cgroups are available
pub async fn is_cgroups_available() -> bool {
    if let Some(value) = USE_CGROUPS.get() {
        return *value;
    }

    let check_id = CGROUP_CHECK_BOX_ID.to_string();
    let test_result = Command::new("isolate")
        .args(["--box-id", &check_id, "--cg", "--init"])
        .output()
        .await;

    let _ = Command::new("isolate")
        .args(["--box-id", &check_id, "--cg", "--cleanup"])
        .output()
        .await;

    let available = matches!(test_result, Ok(r) if r.status.success());

    let _ = USE_CGROUPS.set(available);
    available
}

/// Ensure the isolate binary works at all; return an error otherwise
pub async fn ensure_isolate_available() -> Result<()> {
    let output = Command::new("isolate")
        .arg("--version")
        .output()
        .await
        .context("isolate binary not found; install isolate or use SANDBOX_BACKEND=native")?;

    if !output.status.success() {
        anyhow::bail!(
            "isolate --version failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    if !is_cgroups_available().await {
        warn!("isolate cgroup support unavailable, falling back to address-space limits");
    }
    Ok(())
}

/// Resource limits for sandbox execution
#[derive(Debug, Clone)]
pub struct Limits {
    /// Wall-clock limit in milliseconds
    pub time_ms: u32,
    /// Memory limit in MB
    pub memory_mb: u32,
    /// Maximum number of processes
    pub processes: u32,
    /// Maximum open files
    pub open_files: u32,
    /// Maximum file size in KB
    pub fsize_kb: u32,
}

/// Raw outcome from sandbox execution (no verdict interpretation)
#[derive(Debug)]
pub struct SandboxOutcome {
    /// Parsed meta file contents
    pub meta: IsolateMeta,
    pub stdout: String,
    pub stderr: String,
}

/// Isolate box manager
pub struct IsolateBox {
    box_id: u32,
    box_path: PathBuf,
    use_cgroups: bool,
}

impl IsolateBox {
    /// Create and initialize a new isolate box
    pub async fn new(box_id: u32, use_cgroups: bool) -> Result<Self> {
        // Clean up any box left behind by a crashed run
        let _ = Command::new("isolate")
            .args(cgroup_args(box_id, use_cgroups, "--cleanup"))
            .output()
            .await;

        let output = Command::new("isolate")
            .args(cgroup_args(box_id, use_cgroups, "--init"))
            .output()
            .await
            .context("Failed to run isolate --init")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to initialize isolate box: {}", stderr.trim());
        }

        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        debug!(
            "Initialized isolate box {} at {:?} (cgroups: {})",
            box_id, box_path, use_cgroups
        );

        Ok(Self {
            box_id,
            box_path,
            use_cgroups,
        })
    }

    /// The box/box subdirectory, working directory of the program
    pub fn work_dir(&self) -> PathBuf {
        self.box_path.join("box")
    }

    /// Write a file into the box's working directory
    pub async fn write_file(&self, name: &str, content: &str) -> Result<()> {
        let dest = self.work_dir().join(name);
        fs::write(&dest, content)
            .await
            .with_context(|| format!("Failed to write {:?}", dest))
    }

    /// Read at most `cap` bytes of a file from the box's working directory
    async fn read_output(&self, name: &str, cap: usize) -> Result<String> {
        let path = self.work_dir().join(name);
        let mut bytes = fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {:?}", path))?;
        bytes.truncate(cap);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Run a command in the isolate box with `stdin` as its input
    pub async fn run(
        &self,
        command: &CommandSpec,
        limits: &Limits,
        stdin: &str,
        output_cap: usize,
    ) -> Result<SandboxOutcome> {
        let meta_dir = tempfile::tempdir()?;
        let meta_file = meta_dir.path().join("meta.txt");

        self.write_file("stdin.txt", stdin).await?;

        let time_limit_secs = f64::from(limits.time_ms) / 1000.0;
        let memory_limit_kb = limits.memory_mb.saturating_mul(1024);

        let mut args = vec!["--box-id".to_string(), self.box_id.to_string()];

        if self.use_cgroups {
            args.push("--cg".to_string());
            args.push(format!("--cg-mem={}", memory_limit_kb));
        } else {
            args.push(format!("--mem={}", memory_limit_kb));
        }

        args.extend([
            format!("--time={}", time_limit_secs),
            format!("--wall-time={}", time_limit_secs),
            format!("--meta={}", meta_file.display()),
            "--stdin=stdin.txt".to_string(),
            "--stdout=stdout.txt".to_string(),
            "--stderr=stderr.txt".to_string(),
            format!("--processes={}", limits.processes),
            format!("--open-files={}", limits.open_files),
            format!("--fsize={}", limits.fsize_kb),
            // Read-only runtime mounts; no network unless --share-net is given
            "--dir=/usr".to_string(),
            "--dir=/lib".to_string(),
            "--dir=/lib64:maybe".to_string(),
            "--dir=/etc:noexec".to_string(),
            "--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
            "--env=HOME=/box".to_string(),
        ]);

        for env in &command.env {
            args.push(format!("--env={}", env));
        }

        args.push("--run".to_string());
        args.push("--".to_string());

        // Prepend /usr/bin/ to bare program names; isolate does not search PATH
        if command.program.starts_with('/') || command.program.starts_with("./") {
            args.push(command.program.clone());
        } else {
            args.push(format!("/usr/bin/{}", command.program));
        }
        args.extend(command.args.iter().cloned());

        debug!("Running isolate with args: {:?}", args);

        let output = Command::new("isolate")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run isolate")?;

        let meta_content = fs::read_to_string(&meta_file).await.ok();
        let meta = checked_meta(output.status.code(), &output.stderr, meta_content.as_deref())?;

        Ok(SandboxOutcome {
            meta,
            stdout: self.read_output("stdout.txt", output_cap).await?,
            stderr: self.read_output("stderr.txt", output_cap).await?,
        })
    }

    /// Cleanup the isolate box
    pub async fn cleanup(self) -> Result<()> {
        Command::new("isolate")
            .args(cgroup_args(self.box_id, self.use_cgroups, "--cleanup"))
            .output()
            .await
            .context("Failed to run isolate --cleanup")?;
        debug!("Cleaned up isolate box {}", self.box_id);
        Ok(())
    }
}

/// Validate how `isolate --run` itself ended before trusting its meta file.
///
/// isolate exits 0 when the program succeeded and 1 when the program failed
/// (non-zero exit, signal, time limit); anything else is isolate's own
/// failure. A run without a meta file never reached the program.
fn checked_meta(exit_code: Option<i32>, stderr: &[u8], meta: Option<&str>) -> Result<IsolateMeta> {
    if !matches!(exit_code, Some(0) | Some(1)) {
        anyhow::bail!(
            "isolate exited with {:?}: {}",
            exit_code,
            String::from_utf8_lossy(stderr).trim()
        );
    }

    match meta {
        Some(content) if !content.trim().is_empty() => Ok(parse_meta(content)),
        _ => anyhow::bail!(
            "isolate left no meta file: {}",
            String::from_utf8_lossy(stderr).trim()
        ),
    }
}

fn cgroup_args(box_id: u32, use_cgroups: bool, action: &str) -> Vec<String> {
    let mut args = vec!["--box-id".to_string(), box_id.to_string()];
    if use_cgroups {
        args.push("--cg".to_string());
    }
    args.push(action.to_string());
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::meta::IsolateStatus;

    #[test]
    fn test_cgroup_args() {
        assert_eq!(
            cgroup_args(7, true, "--init"),
            vec!["--box-id", "7", "--cg", "--init"]
        );
        assert_eq!(cgroup_args(7, false, "--cleanup"), vec!["--box-id", "7", "--cleanup"]);
    }

    #[test]
    fn test_missing_meta_is_an_error() {
        let err = checked_meta(Some(0), b"Cannot open meta file", None).unwrap_err();
        assert!(err.to_string().contains("no meta file"));
        assert!(checked_meta(Some(1), b"", Some("  \n")).is_err());
    }

    #[test]
    fn test_isolate_failure_exit_is_an_error() {
        let meta = "time:0.010\nexitcode:0\n";
        let err = checked_meta(Some(2), b"Box not initialized", Some(meta)).unwrap_err();
        assert!(err.to_string().contains("Box not initialized"));
        assert!(checked_meta(None, b"", Some(meta)).is_err());
    }

    #[test]
    fn test_program_failure_keeps_meta() {
        let meta = checked_meta(Some(1), b"", Some("status:RE\nexitcode:3\n")).unwrap();
        assert_eq!(meta.status, IsolateStatus::RuntimeError);
        assert_eq!(meta.exit_code, 3);

        let meta = checked_meta(Some(0), b"", Some("time:0.010\nexitcode:0\n")).unwrap();
        assert_eq!(meta.status, IsolateStatus::Ok);
    }
}
