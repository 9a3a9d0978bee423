//! Sandboxed runner implementation using native process confinement
//!
//! Executes untrusted user code as a direct child process. The source is
//! written to a fresh scratch directory, the child runs in its own session
//! with a cleared environment, hard rlimits and, when the host allows it, a
//! namespace jail (see `sandbox::confine`). The whole process group is
//! killed on deadline, on exit, or when the caller drops the future.

use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{RunLimits, RunOutcome, RunStatus, Runner};
use crate::languages::LanguageConfig;
use crate::sandbox::{
    jail_enabled, Confinement, IsolationMode, Jail, SandboxBackend, SandboxConfig, JAIL_WORK_DIR,
};

/// Time allowed for a killed process tree to release its pipes
const TEARDOWN_GRACE: Duration = Duration::from_millis(500);

/// Signal the kernel sends when RLIMIT_CPU is exceeded
const SIGXCPU: i32 = Signal::SIGXCPU as i32;

/// Runner that executes code as a confined child process
pub struct SandboxedRunner {
    config: &'static SandboxConfig,
}

impl SandboxedRunner {
    pub fn new(config: &'static SandboxConfig) -> Self {
        Self { config }
    }

    /// Run a command in a fresh scratch directory
    pub async fn execute(
        &self,
        language: &LanguageConfig,
        source: &str,
        stdin_content: &str,
        limits: &RunLimits,
    ) -> Result<RunOutcome> {
        let workspace = Workspace::create(self.config.isolation).await?;
        tokio::fs::write(workspace.work_dir.join(&language.source_file), source)
            .await
            .context("Failed to write source file")?;

        let spec = language.command().with_work_dir(workspace.program_dir());
        let confinement = Confinement::new(self.config, limits.time_ms, limits.memory_mb);

        let mut cmd = workspace.command(&spec.program, confinement);
        cmd.args(&spec.args)
            .envs(spec.env_pairs())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            "Spawning {:?} {:?} in {:?} (limit {}ms, jailed: {})",
            spec.program,
            spec.args,
            spec.work_dir,
            limits.time_ms,
            workspace.jail.is_some()
        );

        let start = Instant::now();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to launch {}: {}", spec.program, e);
                return Ok(RunOutcome::launch_failed(format!(
                    "failed to launch {}: {}",
                    spec.program, e
                )));
            }
        };

        // The child called setsid(), so its pid is also its process group id
        let mut group = ProcessGroup::new(child.id());

        let cap = self.config.max_output_kb as usize * 1024;
        let stdout = child.stdout.take().map(|out| spawn_reader(out, cap));
        let stderr = child.stderr.take().map(|err| spawn_reader(err, cap));

        // Written from a task so a program that never reads its input
        // cannot stall the deadline; dropping the handle closes the pipe.
        let stdin_writer = child.stdin.take().map(|mut stdin| {
            let input = stdin_content.to_owned();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    if e.kind() != io::ErrorKind::BrokenPipe {
                        debug!("Failed to write stdin: {}", e);
                    }
                }
            })
        });

        let deadline = Duration::from_millis(u64::from(limits.time_ms));
        let status = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(Ok(exit)) => match (exit.code(), exit.signal()) {
                (Some(0), _) => RunStatus::Success,
                (Some(code), _) => RunStatus::NonZeroExit(code),
                (None, Some(SIGXCPU)) => RunStatus::TimedOut,
                (None, Some(sig)) => RunStatus::Signaled(sig),
                (None, None) => RunStatus::Signaled(0),
            },
            Ok(Err(e)) => {
                group.kill();
                return Err(e).context("Failed to wait for program");
            }
            Err(_) => {
                debug!("Deadline of {}ms elapsed, killing process group", limits.time_ms);
                group.kill();
                if tokio::time::timeout(TEARDOWN_GRACE, child.wait()).await.is_err() {
                    warn!("Timed out process did not exit within teardown grace");
                }
                RunStatus::TimedOut
            }
        };
        let elapsed = start.elapsed();

        // Reap anything the program left running in its group
        group.kill();
        if let Some(writer) = stdin_writer {
            writer.abort();
        }

        let stdout = collect(stdout).await?;
        let stderr = collect(stderr).await?;

        Ok(RunOutcome {
            stdout,
            stderr,
            status,
            time_ms: elapsed.as_millis() as u64,
        })
    }
}

#[async_trait]
impl Runner for SandboxedRunner {
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

/// Settle the isolation mode against what this host supports.
///
/// `BestEffort` falls back to `Off` with a warning when a jail cannot be
/// built; `Required` turns that into a startup error.
pub async fn resolve_isolation(mut config: SandboxConfig) -> Result<SandboxConfig> {
    if config.backend != SandboxBackend::Native || !jail_enabled(config.isolation) {
        return Ok(config);
    }

    match check_jail(&config).await {
        Ok(()) => info!("Namespace jail available for native runs"),
        Err(e) if config.isolation == IsolationMode::Required => {
            return Err(e.context("SANDBOX_ISOLATION=required but no jail can be built"));
        }
        Err(e) => {
            warn!(
                "Namespace jail unavailable, programs will run with rlimits only: {:#}",
                e
            );
            config.isolation = IsolationMode::Off;
        }
    }
    Ok(config)
}

/// Run a shell inside a jail and make sure it can write its work directory
async fn check_jail(config: &SandboxConfig) -> Result<()> {
    let workspace = Workspace::create(IsolationMode::Required).await?;
    let confinement = Confinement::new(config, 2000, config.memory_limit_mb);

    let mut cmd = workspace.command("sh", confinement);
    cmd.args(["-c", "echo ok > jail-check"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let output = tokio::time::timeout(Duration::from_secs(5), cmd.output())
        .await
        .context("Jailed shell did not finish")?
        .context("Failed to launch a jailed shell")?;
    if !output.status.success() {
        anyhow::bail!(
            "jailed shell exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

/// Scratch directory of one run, removed on drop
struct Workspace {
    _dir: TempDir,
    /// Host path of the program's working directory
    work_dir: PathBuf,
    jail: Option<Jail>,
}

impl Workspace {
    async fn create(isolation: IsolationMode) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("grader-run-")
            .tempdir()
            .context("Failed to create scratch directory")?;
        let work_dir = dir.path().join("work");
        tokio::fs::create_dir(&work_dir)
            .await
            .context("Failed to create work directory")?;

        let jail = if jail_enabled(isolation) {
            Some(Jail::prepare(dir.path()).context("Failed to prepare jail")?)
        } else {
            None
        };

        Ok(Self {
            _dir: dir,
            work_dir,
            jail,
        })
    }

    /// The working directory as the program sees it
    fn program_dir(&self) -> &Path {
        match self.jail {
            Some(_) => Path::new(JAIL_WORK_DIR),
            None => &self.work_dir,
        }
    }

    /// A confined command with a cleared environment
    fn command(&self, program: &str, confinement: Confinement) -> Command {
        let confinement = match &self.jail {
            Some(jail) => confinement.with_jail(jail.clone()),
            None => confinement,
        };

        let mut cmd = Command::new(program);
        cmd.current_dir(&self.work_dir)
            .env_clear()
            .env("PATH", "/usr/local/bin:/usr/bin:/bin")
            .env("HOME", self.program_dir())
            .env("TMPDIR", self.program_dir())
            .env("LANG", "C.UTF-8")
            .kill_on_drop(true);

        // SAFETY: `Confinement::apply` only performs async-signal-safe
        // syscalls; everything it needs was allocated by `Jail::prepare`.
        unsafe {
            cmd.pre_exec(move || confinement.apply());
        }
        cmd
    }
}

/// Kills the child's process group when told to or when dropped.
///
/// Dropping covers cancellation: if the request future is dropped mid-run,
/// nothing the program spawned outlives it. In a jail the group holds the
/// namespace init, whose death takes the rest of the namespace with it.
struct ProcessGroup {
    pgid: Option<Pid>,
}

impl ProcessGroup {
    fn new(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.map(|pid| Pid::from_raw(pid as i32)),
        }
    }

    fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("Failed to kill process group {}: {}", pgid, e),
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Read a stream up to `cap` bytes, then drain and discard the rest
fn spawn_reader<R>(mut reader: R, cap: usize) -> JoinHandle<io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        (&mut reader).take(cap as u64).read_to_end(&mut buf).await?;
        let discarded = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
        if discarded > 0 {
            debug!("Discarded {} bytes of output over the capture cap", discarded);
        }
        Ok(buf)
    })
}

async fn collect(handle: Option<JoinHandle<io::Result<Vec<u8>>>>) -> Result<String> {
    let Some(handle) = handle else {
        return Ok(String::new());
    };

    let abort = handle.abort_handle();
    let bytes = match tokio::time::timeout(TEARDOWN_GRACE, handle).await {
        Ok(joined) => joined
            .context("Output reader panicked")?
            .context("Failed to read program output")?,
        Err(_) => {
            // Only reachable without a jail: a descendant left the process
            // group and still holds the pipe
            warn!("Output pipe still open after teardown, abandoning reader");
            abort.abort();
            Vec::new()
        }
    };

    Ok(String::from_utf8_lossy(&bytes).into_owned())
}
