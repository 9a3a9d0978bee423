//! Native process confinement
//!
//! Applied in the forked child right before `exec`: the program gets its own
//! session, hard resource limits and, unless isolation is off, a namespace
//! jail:
//!
//! - private user, mount, PID, network and IPC namespaces
//! - a read-only root built from the scratch directory, with the runtime
//!   directories bound in read-only and only `/work` writable
//! - the unprivileged `JAIL_ID` uid and gid, mapped through the user
//!   namespace or switched to when the grader runs as root
//!
//! The spawned process forks the program off as PID 1 of the new PID
//! namespace and stays behind as a waiter. When PID 1 exits or is killed the
//! kernel kills everything else in the namespace, so nothing the program
//! started can outlive it, even after `setsid`.
//!
//! `apply` runs between `fork` and `exec` and must stay async-signal-safe:
//! no allocation, no locks, no logging. Everything that allocates happens in
//! `Jail::prepare` on the grader side.

use std::ffi::{CStr, CString};
use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use nix::errno::Errno;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::prctl;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::signal::{kill, signal, SigHandler, Signal};
use nix::sys::statvfs::{statvfs, FsFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{
    chdir, chroot, close, fork, getegid, geteuid, getpid, setgroups, setresgid, setresuid,
    setsid, ForkResult, Gid, Pid, Uid,
};

use super::config::{IsolationMode, SandboxConfig};

/// uid and gid programs run as inside the jail ("nobody")
pub const JAIL_ID: u32 = 65534;

/// Writable working directory inside the jail
pub const JAIL_WORK_DIR: &str = "/work";

/// Host directories bound read-only into the jail
const RUNTIME_DIRS: [&str; 4] = ["/usr", "/bin", "/lib", "/lib64"];

/// Device nodes bound into the jail's `/dev`
const DEVICES: [&str; 3] = ["/dev/null", "/dev/zero", "/dev/urandom"];

/// Limits applied to a single native execution
#[derive(Debug, Clone)]
pub struct Confinement {
    pub cpu_secs: u64,
    pub address_space_bytes: u64,
    pub file_size_bytes: u64,
    pub open_files: u64,
    pub processes: u64,
    pub jail: Option<Jail>,
}

impl Confinement {
    pub fn new(config: &SandboxConfig, time_ms: u32, memory_mb: u32) -> Self {
        // CPU rlimit is a backstop behind the wall-clock deadline
        let cpu_secs = (u64::from(time_ms) + 999) / 1000 + 1;
        Self {
            cpu_secs,
            address_space_bytes: u64::from(memory_mb) * 1024 * 1024,
            file_size_bytes: u64::from(config.max_file_size_kb) * 1024,
            open_files: u64::from(config.max_open_files),
            processes: u64::from(config.max_processes),
            jail: None,
        }
    }

    pub fn with_jail(mut self, jail: Jail) -> Self {
        self.jail = Some(jail);
        self
    }

    /// Confine the calling process. Called from `pre_exec`.
    pub fn apply(&self) -> io::Result<()> {
        setsid()?;

        // Taken before RLIMIT_NOFILE is lowered: every inherited descriptor
        // is below it
        let (fd_ceiling, _) = getrlimit(Resource::RLIMIT_NOFILE)?;

        if let Some(jail) = &self.jail {
            jail.enter()?;
        }

        set_limit(Resource::RLIMIT_CORE, 0, 0)?;
        set_limit(Resource::RLIMIT_CPU, self.cpu_secs, self.cpu_secs + 1)?;
        set_limit(
            Resource::RLIMIT_AS,
            self.address_space_bytes,
            self.address_space_bytes,
        )?;
        set_limit(
            Resource::RLIMIT_FSIZE,
            self.file_size_bytes,
            self.file_size_bytes,
        )?;
        set_limit(Resource::RLIMIT_NOFILE, self.open_files, self.open_files)?;
        set_limit(Resource::RLIMIT_NPROC, self.processes, self.processes)?;

        if self.jail.is_some() {
            fork_namespace_init(fd_ceiling)?;
        }
        Ok(())
    }
}

/// Whether runs should be jailed under this isolation mode
pub fn jail_enabled(mode: IsolationMode) -> bool {
    mode != IsolationMode::Off
}

/// How the jail ends up unprivileged
#[derive(Debug, Clone, PartialEq, Eq)]
enum Identity {
    /// The grader is an ordinary user: a user namespace maps `JAIL_ID` onto it
    Mapped { uid_map: Vec<u8>, gid_map: Vec<u8> },
    /// The grader is root: switch to `JAIL_ID` once the jail is built
    Switched,
}

#[derive(Debug, Clone)]
struct Bind {
    source: CString,
    target: CString,
    /// Flags for the read-only remount, `None` keeps the bind writable
    read_only: Option<MsFlags>,
}

/// Everything the child needs to build the jail, computed up front
#[derive(Debug, Clone)]
pub struct Jail {
    root: CString,
    root_flags: MsFlags,
    binds: Vec<Bind>,
    identity: Identity,
}

impl Jail {
    /// Lay out the jail skeleton inside `scratch`.
    ///
    /// `scratch/work` must already exist; it becomes `/work`, the only
    /// writable place in the jail.
    pub fn prepare(scratch: &Path) -> io::Result<Self> {
        let uid = geteuid();
        let identity = if uid.is_root() {
            Identity::Switched
        } else {
            Identity::Mapped {
                uid_map: format!("{} {} 1", JAIL_ID, uid).into_bytes(),
                gid_map: format!("{} {} 1", JAIL_ID, getegid()).into_bytes(),
            }
        };

        let work = scratch.join(relative(JAIL_WORK_DIR));
        if identity == Identity::Switched {
            // The jail user walks a root-owned root and owns only /work
            fs::set_permissions(scratch, Permissions::from_mode(0o755))?;
            std::os::unix::fs::chown(&work, Some(JAIL_ID), Some(JAIL_ID))?;
        }

        let mut binds = Vec::new();
        for dir in RUNTIME_DIRS {
            let host = Path::new(dir);
            let target = scratch.join(relative(dir));
            let meta = match fs::symlink_metadata(host) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            if meta.file_type().is_symlink() {
                // Merged-/usr hosts: keep the link, it resolves inside the jail
                std::os::unix::fs::symlink(fs::read_link(host)?, &target)?;
            } else {
                fs::create_dir(&target)?;
                binds.push(Bind {
                    source: c_path(host)?,
                    target: c_path(&target)?,
                    read_only: Some(read_only_flags(host)?),
                });
            }
        }

        fs::create_dir(scratch.join("dev"))?;
        for device in DEVICES {
            let host = Path::new(device);
            if !host.exists() {
                continue;
            }
            let target = scratch.join(relative(device));
            fs::File::create(&target)?;
            binds.push(Bind {
                source: c_path(host)?,
                target: c_path(&target)?,
                read_only: None,
            });
        }

        binds.push(Bind {
            source: c_path(&work)?,
            target: c_path(&work)?,
            read_only: None,
        });

        Ok(Self {
            root: c_path(scratch)?,
            root_flags: read_only_flags(scratch)?,
            binds,
            identity,
        })
    }

    /// Build the jail around the calling process
    fn enter(&self) -> io::Result<()> {
        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWIPC;
        if matches!(self.identity, Identity::Mapped { .. }) {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        unshare(flags)?;

        // Nothing below may propagate back to the host
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&str>,
        )?;

        let root = self.root.as_c_str();
        mount(Some(root), root, None::<&str>, MsFlags::MS_BIND, None::<&str>)?;
        for bind in &self.binds {
            bind_mount(bind.source.as_c_str(), bind.target.as_c_str(), bind.read_only)?;
        }
        remount_read_only(root, self.root_flags)?;

        if let Identity::Mapped { uid_map, gid_map } = &self.identity {
            write_proc("/proc/self/setgroups", b"deny")?;
            write_proc("/proc/self/uid_map", uid_map)?;
            write_proc("/proc/self/gid_map", gid_map)?;
        }

        chroot(root)?;
        chdir(JAIL_WORK_DIR)?;

        if self.identity == Identity::Switched {
            let gid = Gid::from_raw(JAIL_ID);
            let uid = Uid::from_raw(JAIL_ID);
            setgroups(&[])?;
            setresgid(gid, gid, gid)?;
            setresuid(uid, uid, uid)?;
        }

        prctl::set_no_new_privs()?;
        Ok(())
    }
}

fn bind_mount(source: &CStr, target: &CStr, read_only: Option<MsFlags>) -> io::Result<()> {
    mount(Some(source), target, None::<&str>, MsFlags::MS_BIND, None::<&str>)?;
    if let Some(flags) = read_only {
        remount_read_only(target, flags)?;
    }
    Ok(())
}

fn remount_read_only(target: &CStr, flags: MsFlags) -> io::Result<()> {
    mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | flags,
        None::<&str>,
    )?;
    Ok(())
}

fn write_proc(path: &str, content: &[u8]) -> io::Result<()> {
    // Map files take the whole mapping in a single write
    OpenOptions::new().write(true).open(path)?.write_all(content)
}

/// Read-only remount flags for a bind of `path`.
///
/// A remount inside a user namespace may not clear flags the source mount
/// carries, so noexec and the atime mode are kept as found.
fn read_only_flags(path: &Path) -> io::Result<MsFlags> {
    let found = statvfs(path)?.flags();

    let mut flags = MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
    if found.contains(FsFlags::ST_NOEXEC) {
        flags |= MsFlags::MS_NOEXEC;
    }
    if found.contains(FsFlags::ST_NODIRATIME) {
        flags |= MsFlags::MS_NODIRATIME;
    }
    if found.contains(FsFlags::ST_NOATIME) {
        flags |= MsFlags::MS_NOATIME;
    } else if found.contains(FsFlags::ST_RELATIME) {
        flags |= MsFlags::MS_RELATIME;
    } else {
        flags |= MsFlags::MS_STRICTATIME;
    }
    Ok(flags)
}

fn relative(path: &str) -> &str {
    path.trim_start_matches('/')
}

fn c_path(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains a NUL byte"))
}

/// Fork the program off as PID 1 of the new PID namespace. The child
/// returns to `exec`; the calling process turns into a waiter and never
/// returns.
fn fork_namespace_init(fd_ceiling: u64) -> io::Result<()> {
    // SAFETY: the caller is the single-threaded child of `spawn`
    match unsafe { fork() }? {
        ForkResult::Child => {
            prctl::set_pdeathsig(Signal::SIGKILL)?;
            Ok(())
        }
        ForkResult::Parent { child } => {
            close_inherited(fd_ceiling);
            mirror_exit(child)
        }
    }
}

/// Drop every inherited descriptor, std's exec status pipe included, so the
/// launcher hears about the program's `exec` and not about this waiter.
fn close_inherited(fd_ceiling: u64) {
    // SAFETY: close_range only touches this process's descriptor table
    let closed = unsafe { nix::libc::syscall(nix::libc::SYS_close_range, 0u32, u32::MAX, 0u32) };
    if closed != 0 {
        let ceiling = fd_ceiling.min(1 << 20) as i32;
        for fd in 0..ceiling {
            let _ = close(fd);
        }
    }
}

/// Wait for the namespace init and leave the same way it did
fn mirror_exit(child: Pid) -> ! {
    // The grader's SIGCHLD handler came along with the fork
    // SAFETY: restoring a default disposition
    let _ = unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) };

    let code = loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                // SAFETY: restoring a default disposition before re-raising
                let _ = unsafe { signal(sig, SigHandler::SigDfl) };
                let _ = kill(getpid(), sig);
                break 128 + sig as i32;
            }
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(_) => break 127,
        }
    };

    // SAFETY: leave without running any of the grader's exit handlers
    unsafe { nix::libc::_exit(code) }
}

/// Lower a resource limit, never above the current hard limit
fn set_limit(resource: Resource, soft: u64, hard: u64) -> io::Result<()> {
    let (_, current_hard) = getrlimit(resource)?;
    let hard = hard.min(current_hard);
    setrlimit(resource, soft.min(hard), hard)?;
    Ok(())
}
