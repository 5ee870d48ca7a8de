use std::ffi::{CStr, CString};
use std::io::Read;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::mount::MsFlags;
use nix::sched::CloneFlags;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use sandbox::{
    ExecRequest, ExecutionErrorKind, ExecutionResult, IsolationBackend, IsolationClass,
    OutputBuffer, Result, SandboxConfig, SandboxError, SandboxInstance, SetupStep, exit_code,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::cgroup::CgroupHandle;
use crate::rlimits::ResourceLimiter;
use crate::seccomp::SyscallFilter;
use crate::workspace::Workspace;

const CHILD_STACK_SIZE: usize = 1024 * 1024;
const DEFAULT_PATH: &str = "PATH=/usr/local/bin:/usr/bin:/bin";
const HOSTNAME: &[u8] = b"sandbox";

/// Host directories bound read-only into the pivoted root so dynamically
/// linked targets can run. Missing ones are skipped.
const RO_BINDS: &[&str] = &["/usr", "/bin", "/sbin", "/lib", "/lib64", "/etc"];

/// Device nodes bound from the host into the private `/dev` tmpfs.
const DEV_BINDS: &[&str] = &["null", "zero", "urandom", "random"];

/// Namespace isolation: the target runs in fresh user/PID/mount/UTS/IPC
/// (and, without network access, net) namespaces with a pivoted root,
/// cgroup v2 limits, rlimits, and optionally seccomp.
///
/// Two handshake pipes order the setup: the child blocks until the parent
/// has written its id mappings and attached it to the cgroup, and a
/// close-on-exec status pipe carries the failing step back if anything
/// breaks before `exec`.
pub struct NamespaceBackend;

#[async_trait]
impl IsolationBackend for NamespaceBackend {
    fn name(&self) -> &'static str {
        "namespace"
    }

    fn class(&self) -> IsolationClass {
        IsolationClass::Namespace
    }

    fn available(&self, caps: &sandbox::Capabilities) -> bool {
        caps.namespaces && caps.cgroups
    }

    async fn create(&self, config: &SandboxConfig) -> Result<Box<dyn SandboxInstance>> {
        let id = Uuid::new_v4();
        let workspace = Workspace::create(config.work_dir(), id).await?;
        let cgroup = match CgroupHandle::create(id, config) {
            Ok(cg) => cg,
            Err(e) => {
                workspace.remove().await;
                return Err(e);
            }
        };
        let filter = if config.enable_seccomp() {
            match SyscallFilter::from_profile(config.seccomp_profile()) {
                Ok(f) => Some(Arc::new(f)),
                Err(e) => {
                    cgroup.destroy().await;
                    workspace.remove().await;
                    return Err(e);
                }
            }
        } else {
            None
        };
        info!(id = %id, backend = self.name(), "instance created");
        Ok(Box::new(NamespaceInstance {
            id,
            config: config.clone(),
            workspace,
            cgroup: Some(cgroup),
            filter,
        }))
    }
}

struct NamespaceInstance {
    id: Uuid,
    config: SandboxConfig,
    workspace: Workspace,
    /// `None` once destroyed.
    cgroup: Option<CgroupHandle>,
    filter: Option<Arc<SyscallFilter>>,
}

#[async_trait]
impl SandboxInstance for NamespaceInstance {
    fn id(&self) -> Uuid {
        self.id
    }

    fn backend(&self) -> &'static str {
        "namespace"
    }

    fn work_dir(&self) -> &Path {
        self.workspace.path()
    }

    async fn execute(&mut self, request: ExecRequest<'_>) -> Result<ExecutionResult> {
        let Some(cgroup) = &self.cgroup else {
            return Err(SandboxError::Terminated);
        };
        if !self.config.command_allowed(request.command) {
            return Err(SandboxError::PermissionDenied(request.command.to_string()));
        }

        let exe = resolve_command(request.command)?;
        let plan = ChildPlan::prepare(
            &self.config,
            self.workspace.path(),
            &exe,
            request.args,
            self.filter.clone(),
        )?;
        let pipes = Pipes::create()?;
        let userns = !nix::unistd::Uid::effective().is_root();

        let mut flags = CloneFlags::CLONE_NEWPID
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWIPC;
        if userns {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if !self.config.enable_network() {
            flags |= CloneFlags::CLONE_NEWNET;
        }

        let started = Instant::now();
        let pid = spawn_child(&plan, &pipes, flags)?;
        debug!(id = %self.id, pid = pid.as_raw(), command = request.command, "child cloned");

        // Child-end fds live on in the child's copied fd table.
        drop(pipes.child_ends);

        // Release the child only after its identity and limits exist.
        if let Err(e) = self.release_child(pid, cgroup, userns, pipes.sync_w) {
            reap_after_kill(pid, cgroup);
            return Err(e);
        }

        let stdout_task = drain_fd_task(pipes.stdout_r);
        let stderr_task = drain_fd_task(pipes.stderr_r);

        let deadline = request
            .timeout
            .unwrap_or_else(|| Duration::from_secs(self.config.cpu_time_limit()));

        // Resolves at exec (EOF via close-on-exec), at a reported failure,
        // or at the deadline if the child wedged during setup.
        match read_status(pipes.status_r, deadline).await {
            Ok(None) => {}
            Ok(Some((step, errno))) => {
                reap_after_kill(pid, cgroup);
                return Err(SandboxError::Setup {
                    step,
                    detail: errno.desc().to_string(),
                });
            }
            Err(e) => {
                reap_after_kill(pid, cgroup);
                return Err(e);
            }
        }

        // The setup wait consumed part of the budget; the target gets the rest.
        let remaining = deadline.saturating_sub(started.elapsed());
        let (wait_status, timed_out) = wait_with_deadline(pid, cgroup, remaining).await;

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut result = if timed_out {
            debug!(id = %self.id, "execution timed out");
            let mut r = ExecutionResult::failed(
                exit_code::TIMED_OUT,
                ExecutionErrorKind::Timeout,
                format!("wall clock limit {deadline:?} exceeded"),
            );
            r.stdout = stdout;
            r.stderr = stderr;
            r
        } else {
            let code = match wait_status {
                Some(WaitStatus::Exited(_, code)) => code,
                Some(WaitStatus::Signaled(_, sig, _)) => 128 + sig as i32,
                _ => exit_code::SETUP_FAILED,
            };
            ExecutionResult::completed(code, stdout, stderr)
        };
        result.execution_time_ms = elapsed_ms;
        result.memory_used_bytes = cgroup.memory_peak();
        if cgroup.was_oom_killed() && result.error.is_none() && !result.success {
            result.error = Some(sandbox::ExecutionError {
                kind: ExecutionErrorKind::Runtime,
                detail: "memory limit exceeded (oom killed)".into(),
            });
        }
        Ok(result)
    }

    async fn reset(&mut self) -> Result<()> {
        let Some(cgroup) = &self.cgroup else {
            return Err(SandboxError::Terminated);
        };
        // Anything the target left behind dies before the scratch is wiped.
        cgroup.kill_all();
        self.workspace.wipe().await
    }

    async fn destroy(&mut self) -> Result<()> {
        if let Some(cgroup) = self.cgroup.take() {
            cgroup.destroy().await;
            let pivot = self.workspace.path().with_extension("root");
            let _ = tokio::fs::remove_dir_all(pivot).await;
            self.workspace.remove().await;
            info!(id = %self.id, "instance destroyed");
        }
        Ok(())
    }
}

impl NamespaceInstance {
    fn release_child(
        &self,
        pid: Pid,
        cgroup: &CgroupHandle,
        userns: bool,
        sync_w: OwnedFd,
    ) -> Result<()> {
        if userns {
            write_id_maps(pid)?;
        }
        cgroup.attach(u32::try_from(pid.as_raw()).unwrap_or(0))?;
        nix::unistd::write(&sync_w, b"1").map_err(|e| SandboxError::Setup {
            step: SetupStep::Handshake,
            detail: format!("release child: {e}"),
        })?;
        Ok(())
    }
}

/// Map the caller's uid/gid to root inside the new user namespace so the
/// child can mount.
fn write_id_maps(pid: Pid) -> Result<()> {
    let dir = PathBuf::from(format!("/proc/{pid}"));
    let uid = nix::unistd::Uid::effective();
    let gid = nix::unistd::Gid::effective();
    let write = |file: &str, content: String| {
        std::fs::write(dir.join(file), content).map_err(|e| SandboxError::Setup {
            step: SetupStep::Clone,
            detail: format!("write {file}: {e}"),
        })
    };
    write("uid_map", format!("0 {uid} 1"))?;
    write("setgroups", "deny".to_string())?;
    write("gid_map", format!("0 {gid} 1"))?;
    Ok(())
}

fn reap_after_kill(pid: Pid, cgroup: &CgroupHandle) {
    cgroup.kill_all();
    let _ = nix::sys::signal::kill(pid, Signal::SIGKILL);
    let _ = waitpid(pid, None);
}

/// Non-blocking waitpid poll against a wall-clock deadline. On expiry the
/// whole cgroup is killed and the child reaped.
async fn wait_with_deadline(
    pid: Pid,
    cgroup: &CgroupHandle,
    deadline: Duration,
) -> (Option<WaitStatus>, bool) {
    let started = Instant::now();
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {}
            Ok(status) => return (Some(status), false),
            Err(_) => return (None, false),
        }
        if started.elapsed() >= deadline {
            reap_after_kill(pid, cgroup);
            return (None, true);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn drain_fd_task(fd: OwnedFd) -> tokio::task::JoinHandle<OutputBuffer> {
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::from(fd);
        let mut buf = OutputBuffer::new();
        let mut chunk = [0u8; 8192];
        loop {
            match file.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.push(chunk.get(..n).unwrap_or_default()),
            }
        }
        buf
    })
}

/// Await the status pipe under the execution deadline: EOF means the child
/// reached `exec`, a 5-byte message names the failed step and errno, and
/// expiry means the child stalled somewhere in setup (a hung mount can
/// block it indefinitely, so the wait must not be open-ended).
async fn read_status(fd: OwnedFd, deadline: Duration) -> Result<Option<(SetupStep, Errno)>> {
    let task = tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::from(fd);
        let mut buf = [0u8; 5];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(buf.get_mut(filled..).unwrap_or(&mut [])) {
                Ok(0) | Err(_) => break,
                Ok(n) => filled += n,
            }
        }
        (buf, filled)
    });
    let Ok(joined) = tokio::time::timeout(deadline, task).await else {
        return Err(SandboxError::Timeout(deadline));
    };
    let Ok((buf, filled)) = joined else {
        return Ok(None);
    };
    if filled < 5 {
        return Ok(None);
    }
    let [code, e0, e1, e2, e3] = buf;
    let step = decode_step(code);
    let errno_raw = i32::from_le_bytes([e0, e1, e2, e3]);
    Ok(Some((step, Errno::from_raw(errno_raw))))
}

fn step_code(step: SetupStep) -> u8 {
    match step {
        SetupStep::Handshake => 1,
        SetupStep::Mount => 2,
        SetupStep::Hostname => 3,
        SetupStep::Privileges => 4,
        SetupStep::Seccomp => 5,
        SetupStep::Spawn => 6,
        _ => 0,
    }
}

fn decode_step(code: u8) -> SetupStep {
    match code {
        1 => SetupStep::Handshake,
        2 => SetupStep::Mount,
        3 => SetupStep::Hostname,
        4 => SetupStep::Privileges,
        5 => SetupStep::Seccomp,
        6 => SetupStep::Spawn,
        _ => SetupStep::Clone,
    }
}

/// Resolve a bare command name against the directories that get bound into
/// the pivoted root.
fn resolve_command(command: &str) -> Result<PathBuf> {
    let path = Path::new(command);
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    which::which(command).map_err(|e| SandboxError::Setup {
        step: SetupStep::Spawn,
        detail: format!("resolve {command}: {e}"),
    })
}

struct Pipes {
    sync_w: OwnedFd,
    status_r: OwnedFd,
    stdout_r: OwnedFd,
    stderr_r: OwnedFd,
    /// Dropped in the parent right after clone.
    child_ends: ChildEnds,
}

struct ChildEnds {
    sync_r: OwnedFd,
    status_w: OwnedFd,
    stdout_w: OwnedFd,
    stderr_w: OwnedFd,
    devnull: OwnedFd,
}

impl Pipes {
    fn create() -> Result<Self> {
        let mk = || {
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| SandboxError::Setup {
                step: SetupStep::Handshake,
                detail: format!("pipe2: {e}"),
            })
        };
        let (sync_r, sync_w) = mk()?;
        let (status_r, status_w) = mk()?;
        let (stdout_r, stdout_w) = mk()?;
        let (stderr_r, stderr_w) = mk()?;
        let devnull = std::fs::File::open("/dev/null")
            .map(OwnedFd::from)
            .map_err(|e| SandboxError::Setup {
                step: SetupStep::Handshake,
                detail: format!("open /dev/null: {e}"),
            })?;
        Ok(Self {
            sync_w,
            status_r,
            stdout_r,
            stderr_r,
            child_ends: ChildEnds {
                sync_r,
                status_w,
                stdout_w,
                stderr_w,
                devnull,
            },
        })
    }
}

/// Everything the child needs, computed before `clone` so the child makes
/// no heap allocations until `exec`.
struct ChildPlan {
    new_root: CString,
    old_root: CString,
    /// (host source, target under new root) read-only binds.
    ro_binds: Vec<(CString, CString)>,
    /// Host workspace dir, bound read-write at /work.
    work_src: CString,
    work_dst: CString,
    proc_dst: CString,
    dev_dst: CString,
    tmp_dst: CString,
    /// (host device path, bind target) pairs under the private /dev.
    dev_binds: Vec<(CString, CString)>,
    exe: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    limiter: ResourceLimiter,
    filter: Option<Arc<SyscallFilter>>,
    /// Switch to `nobody` after mounting. Set when running as real root,
    /// where no user namespace confines the child's capabilities.
    drop_to_nobody: bool,
}

fn cstring(s: impl Into<Vec<u8>>) -> Result<CString> {
    CString::new(s).map_err(|_| SandboxError::Setup {
        step: SetupStep::Spawn,
        detail: "interior nul byte".into(),
    })
}

fn cstring_path(p: &Path) -> Result<CString> {
    cstring(p.as_os_str().as_encoded_bytes().to_vec())
}

impl ChildPlan {
    fn prepare(
        config: &SandboxConfig,
        workspace: &Path,
        exe: &Path,
        args: &[String],
        filter: Option<Arc<SyscallFilter>>,
    ) -> Result<Self> {
        // Sibling of the workspace so the /work bind stays clean.
        let root = workspace.with_extension("root");
        std::fs::create_dir_all(&root).map_err(|e| SandboxError::Setup {
            step: SetupStep::Workspace,
            detail: format!("create pivot root: {e}"),
        })?;

        let drop_to_nobody = nix::unistd::Uid::effective().is_root();
        if drop_to_nobody {
            // The de-privileged child still has to write its scratch dir.
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(workspace, std::fs::Permissions::from_mode(0o777))
                .map_err(|e| SandboxError::Setup {
                    step: SetupStep::Workspace,
                    detail: format!("open up workspace: {e}"),
                })?;
        }

        let mut ro_binds = Vec::new();
        for src in RO_BINDS {
            if Path::new(src).exists() {
                ro_binds.push((
                    cstring(*src)?,
                    cstring_path(&root.join(src.trim_start_matches('/')))?,
                ));
            }
        }

        let dev = root.join("dev");
        let mut dev_binds = Vec::new();
        for name in DEV_BINDS {
            let host = Path::new("/dev").join(name);
            if host.exists() {
                dev_binds.push((cstring_path(&host)?, cstring_path(&dev.join(name))?));
            }
        }

        let exe_c = cstring_path(exe)?;
        let mut argv = vec![exe_c.clone()];
        for arg in args {
            argv.push(cstring(arg.as_str())?);
        }

        let mut envp = Vec::new();
        let mut has_path = false;
        for (k, v) in config.environment() {
            has_path |= k == "PATH";
            envp.push(cstring(format!("{k}={v}"))?);
        }
        if !has_path {
            envp.push(cstring(DEFAULT_PATH)?);
        }

        Ok(Self {
            old_root: cstring_path(&root.join(".old_root"))?,
            ro_binds,
            work_src: cstring_path(workspace)?,
            work_dst: cstring_path(&root.join("work"))?,
            proc_dst: cstring_path(&root.join("proc"))?,
            dev_dst: cstring_path(&dev)?,
            tmp_dst: cstring_path(&root.join("tmp"))?,
            dev_binds,
            new_root: cstring_path(&root)?,
            exe: exe_c,
            argv,
            envp,
            limiter: ResourceLimiter::from_config(config),
            filter,
            drop_to_nobody,
        })
    }
}

fn spawn_child(plan: &ChildPlan, pipes: &Pipes, flags: CloneFlags) -> Result<Pid> {
    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let sync_r = pipes.child_ends.sync_r.as_raw_fd();
    let status_w = pipes.child_ends.status_w.as_raw_fd();
    let stdout_w = pipes.child_ends.stdout_w.as_raw_fd();
    let stderr_w = pipes.child_ends.stderr_w.as_raw_fd();
    let devnull = pipes.child_ends.devnull.as_raw_fd();

    let cb = Box::new(|| {
        child_entry(plan, sync_r, status_w, stdout_w, stderr_w, devnull);
        // child_entry only returns on failure, after reporting the step.
        125
    });

    // SAFETY: the callback confines itself to async-signal-safe operations;
    // all heap data it touches was allocated before the clone.
    unsafe { nix::sched::clone(cb, &mut stack, flags, Some(libc::SIGCHLD)) }.map_err(|e| {
        SandboxError::Setup {
            step: SetupStep::Clone,
            detail: format!("clone: {e}"),
        }
    })
}

/// Runs in the cloned child. Reports the failing step over the status pipe
/// and exits 125 on any error; on success `exec` replaces the process.
fn child_entry(
    plan: &ChildPlan,
    sync_r: RawFd,
    status_w: RawFd,
    stdout_w: RawFd,
    stderr_w: RawFd,
    devnull: RawFd,
) {
    if let Err((step, errno)) = child_run(plan, sync_r, stdout_w, stderr_w, devnull) {
        let [e0, e1, e2, e3] = errno.to_le_bytes();
        let msg = [step_code(step), e0, e1, e2, e3];
        // SAFETY: write on an inherited pipe fd with a stack buffer.
        unsafe {
            libc::write(status_w, msg.as_ptr().cast(), msg.len());
        }
    }
}

type ChildResult = std::result::Result<(), (SetupStep, i32)>;

fn child_run(
    plan: &ChildPlan,
    sync_r: RawFd,
    stdout_w: RawFd,
    stderr_w: RawFd,
    devnull: RawFd,
) -> ChildResult {
    wait_for_release(sync_r)?;

    if nix::unistd::setsid().is_err() {
        return Err((SetupStep::Privileges, Errno::last_raw()));
    }
    // SAFETY: static buffer, length matches.
    if unsafe { libc::sethostname(HOSTNAME.as_ptr().cast(), HOSTNAME.len()) } != 0 {
        return Err((SetupStep::Hostname, Errno::last_raw()));
    }

    build_root(plan).map_err(|e| (SetupStep::Mount, e as i32))?;

    // SAFETY: dup2 onto the standard descriptors; clears close-on-exec.
    unsafe {
        if libc::dup2(devnull, 0) < 0
            || libc::dup2(stdout_w, 1) < 0
            || libc::dup2(stderr_w, 2) < 0
        {
            return Err((SetupStep::Handshake, Errno::last_raw()));
        }
    }

    // Mounting is done; shrink the bounding set so no capability can be
    // regained across execve, then give up the ids themselves.
    let mut cap = 0;
    loop {
        // SAFETY: prctl with immediate arguments only.
        if unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) } != 0 {
            // EINVAL marks one past the highest capability.
            if Errno::last() == Errno::EINVAL {
                break;
            }
            return Err((SetupStep::Privileges, Errno::last_raw()));
        }
        cap += 1;
    }

    // Mounting needed root; nothing after this point does. Switching uid
    // clears effective and permitted capabilities.
    if plan.drop_to_nobody {
        const NOBODY: libc::uid_t = 65534;
        // SAFETY: plain id-changing syscalls, no memory handed over.
        let failed = unsafe {
            libc::setgroups(0, std::ptr::null()) != 0
                || libc::setresgid(NOBODY, NOBODY, NOBODY) != 0
                || libc::setresuid(NOBODY, NOBODY, NOBODY) != 0
        };
        if failed {
            return Err((SetupStep::Privileges, Errno::last_raw()));
        }
    }

    // SAFETY: only async-signal-safe calls; must precede the seccomp load.
    if unsafe { plan.limiter.apply() }.is_err() {
        return Err((SetupStep::Privileges, Errno::last_raw()));
    }
    if let Some(filter) = &plan.filter
        && filter.install().is_err()
    {
        return Err((SetupStep::Seccomp, Errno::last_raw()));
    }

    let _ = nix::unistd::execve(&plan.exe, &plan.argv, &plan.envp);
    Err((SetupStep::Spawn, Errno::last_raw()))
}

fn wait_for_release(sync_r: RawFd) -> ChildResult {
    let mut byte = [0u8; 1];
    loop {
        // SAFETY: blocking read on an inherited pipe fd into a stack buffer.
        let n = unsafe { libc::read(sync_r, byte.as_mut_ptr().cast(), 1) };
        if n == 1 {
            return Ok(());
        }
        if n == 0 {
            // Parent dropped the pipe without releasing us.
            return Err((SetupStep::Handshake, libc::EPIPE));
        }
        if Errno::last() != Errno::EINTR {
            return Err((SetupStep::Handshake, Errno::last_raw()));
        }
    }
}

/// Assemble the pivoted root: tmpfs base, read-only system binds, rw /work,
/// fresh /proc, private /dev and /tmp, then `pivot_root` and detach the old
/// root so nothing outside the workspace stays reachable.
fn build_root(plan: &ChildPlan) -> std::result::Result<(), Errno> {
    let none: Option<&CStr> = None;

    // Keep our mount changes out of the host's propagation group.
    nix::mount::mount(
        none,
        c"/",
        none,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        none,
    )?;
    nix::mount::mount(
        Some(c"tmpfs"),
        plan.new_root.as_c_str(),
        Some(c"tmpfs"),
        MsFlags::MS_NOSUID,
        none,
    )?;

    for (src, dst) in &plan.ro_binds {
        mkdir_c(dst)?;
        nix::mount::mount(
            Some(src.as_c_str()),
            dst.as_c_str(),
            none,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            none,
        )?;
        nix::mount::mount(
            none,
            dst.as_c_str(),
            none,
            MsFlags::MS_BIND
                | MsFlags::MS_REMOUNT
                | MsFlags::MS_REC
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID,
            none,
        )?;
    }

    mkdir_c(&plan.work_dst)?;
    nix::mount::mount(
        Some(plan.work_src.as_c_str()),
        plan.work_dst.as_c_str(),
        none,
        MsFlags::MS_BIND | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        none,
    )?;

    mkdir_c(&plan.proc_dst)?;
    nix::mount::mount(
        Some(c"proc"),
        plan.proc_dst.as_c_str(),
        Some(c"proc"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        none,
    )?;

    mkdir_c(&plan.dev_dst)?;
    nix::mount::mount(
        Some(c"tmpfs"),
        plan.dev_dst.as_c_str(),
        Some(c"tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        none,
    )?;
    for (host, dst) in &plan.dev_binds {
        touch_c(dst)?;
        nix::mount::mount(
            Some(host.as_c_str()),
            dst.as_c_str(),
            none,
            MsFlags::MS_BIND,
            none,
        )?;
    }

    mkdir_c(&plan.tmp_dst)?;
    nix::mount::mount(
        Some(c"tmpfs"),
        plan.tmp_dst.as_c_str(),
        Some(c"tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(c"mode=1777"),
    )?;

    mkdir_c(&plan.old_root)?;
    nix::unistd::pivot_root(plan.new_root.as_c_str(), plan.old_root.as_c_str())?;
    nix::unistd::chdir(c"/")?;
    nix::mount::umount2(c"/.old_root", nix::mount::MntFlags::MNT_DETACH)?;
    // SAFETY: NUL-terminated literal.
    unsafe { libc::rmdir(c"/.old_root".as_ptr()) };
    nix::unistd::chdir(c"/work")?;
    Ok(())
}

fn mkdir_c(path: &CString) -> std::result::Result<(), Errno> {
    // SAFETY: NUL-terminated path; EEXIST is fine for reused workspaces.
    if unsafe { libc::mkdir(path.as_ptr(), 0o755) } != 0 && Errno::last() != Errno::EEXIST {
        return Err(Errno::last());
    }
    Ok(())
}

fn touch_c(path: &CString) -> std::result::Result<(), Errno> {
    // SAFETY: NUL-terminated path; mode passed explicitly for O_CREAT.
    let fd =
        unsafe { libc::open(path.as_ptr(), libc::O_CREAT | libc::O_WRONLY, 0o644 as libc::c_uint) };
    if fd < 0 {
        return Err(Errno::last());
    }
    // SAFETY: fd was just opened.
    unsafe { libc::close(fd) };
    Ok(())
}
