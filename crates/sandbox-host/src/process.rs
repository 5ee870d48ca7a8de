use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sandbox::{
    ExecRequest, ExecutionErrorKind, ExecutionResult, IsolationBackend,
    IsolationClass, OutputBuffer, Result, SandboxConfig, SandboxError, SandboxInstance, SetupStep,
    exit_code,
};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};
use uuid::Uuid;

use crate::rlimits::ResourceLimiter;
use crate::seccomp::SyscallFilter;
use crate::workspace::Workspace;

/// Plain child-process isolation: rlimits, a scrubbed environment, its own
/// session, and optionally a seccomp filter. No namespace or filesystem
/// isolation; the weakest backend and the only one that works everywhere.
pub struct ProcessBackend;

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    fn class(&self) -> IsolationClass {
        IsolationClass::Process
    }

    fn available(&self, _caps: &sandbox::Capabilities) -> bool {
        true
    }

    async fn create(&self, config: &SandboxConfig) -> Result<Box<dyn SandboxInstance>> {
        let id = Uuid::new_v4();
        let workspace = Workspace::create(config.work_dir(), id).await?;
        // Compile once per instance; installs are per-exec.
        let filter = if config.enable_seccomp() {
            Some(Arc::new(SyscallFilter::from_profile(
                config.seccomp_profile(),
            )?))
        } else {
            None
        };
        info!(id = %id, backend = self.name(), "instance created");
        Ok(Box::new(ProcessInstance {
            id,
            config: config.clone(),
            workspace,
            filter,
            destroyed: false,
        }))
    }
}

struct ProcessInstance {
    id: Uuid,
    config: SandboxConfig,
    workspace: Workspace,
    filter: Option<Arc<SyscallFilter>>,
    destroyed: bool,
}

#[async_trait]
impl SandboxInstance for ProcessInstance {
    fn id(&self) -> Uuid {
        self.id
    }

    fn backend(&self) -> &'static str {
        "process"
    }

    fn work_dir(&self) -> &Path {
        self.workspace.path()
    }

    async fn execute(&mut self, request: ExecRequest<'_>) -> Result<ExecutionResult> {
        if self.destroyed {
            return Err(SandboxError::Terminated);
        }
        if !self.config.command_allowed(request.command) {
            return Err(SandboxError::PermissionDenied(request.command.to_string()));
        }

        let mut cmd = tokio::process::Command::new(request.command);
        cmd.args(request.args)
            .current_dir(self.workspace.path())
            .env_clear()
            .envs(self.config.environment())
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let limiter = ResourceLimiter::from_config(&self.config);
        let filter = self.filter.clone();
        // SAFETY: the closure only makes async-signal-safe calls (setsid,
        // setrlimit, prctl, seccomp); the filter program was compiled before
        // the fork.
        unsafe {
            cmd.pre_exec(move || {
                if libc::setsid() == -1 {
                    return Err(io::Error::last_os_error());
                }
                limiter.apply()?;
                if let Some(f) = &filter {
                    f.install()?;
                }
                Ok(())
            });
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| SandboxError::Setup {
            step: SetupStep::Spawn,
            detail: format!("{}: {e}", request.command),
        })?;

        let stdout_task = child.stdout.take().map(|s| tokio::spawn(drain(s)));
        let stderr_task = child.stderr.take().map(|s| tokio::spawn(drain(s)));

        let deadline = request
            .timeout
            .unwrap_or_else(|| Duration::from_secs(self.config.cpu_time_limit()));

        let (status, timed_out) = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => (Some(status), false),
            Ok(Err(e)) => return Err(SandboxError::Io(e)),
            Err(_) => {
                kill_process_group(&child);
                let _ = child.wait().await;
                (None, true)
            }
        };

        let stdout = collect(stdout_task).await;
        let stderr = collect(stderr_task).await;
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut result = if timed_out {
            debug!(id = %self.id, command = request.command, "execution timed out");
            let mut r = ExecutionResult::failed(
                exit_code::TIMED_OUT,
                ExecutionErrorKind::Timeout,
                format!("wall clock limit {deadline:?} exceeded"),
            );
            r.stdout = stdout;
            r.stderr = stderr;
            r
        } else {
            let code = status.map_or(exit_code::SETUP_FAILED, exit_status_code);
            ExecutionResult::completed(code, stdout, stderr)
        };
        result.execution_time_ms = elapsed_ms;
        Ok(result)
    }

    async fn reset(&mut self) -> Result<()> {
        if self.destroyed {
            return Err(SandboxError::Terminated);
        }
        self.workspace.wipe().await
    }

    async fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.workspace.remove().await;
        info!(id = %self.id, "instance destroyed");
        Ok(())
    }
}

/// Exit code from a wait status: the code itself, or `128 + signal` for a
/// signalled exit, mirroring shell conventions.
pub(crate) fn exit_status_code(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(exit_code::SETUP_FAILED)
}

/// Read a stream to EOF into a bounded buffer.
pub(crate) async fn drain(mut stream: impl tokio::io::AsyncRead + Unpin) -> OutputBuffer {
    let mut buf = OutputBuffer::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.push(chunk.get(..n).unwrap_or_default()),
        }
    }
    buf
}

pub(crate) async fn collect(
    task: Option<tokio::task::JoinHandle<OutputBuffer>>,
) -> OutputBuffer {
    match task {
        Some(t) => t.await.unwrap_or_default(),
        None => OutputBuffer::new(),
    }
}

/// Kill the child's entire process group. Requires the child to have called
/// `setsid` so its PGID equals its PID.
pub(crate) fn kill_process_group(child: &tokio::process::Child) {
    if let Some(pid) = child.id()
        && let Ok(pid) = i32::try_from(pid)
    {
        let pgid = nix::unistd::Pid::from_raw(pid);
        let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::{SandboxConfigBuilder, SecurityLevel};

    fn minimal_config(dir: &Path) -> SandboxConfig {
        SandboxConfigBuilder::new(SecurityLevel::Minimal)
            .work_dir(dir)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn runs_a_command_and_captures_output() {
        let base = tempfile::tempdir().unwrap();
        let config = minimal_config(base.path());
        let mut instance = ProcessBackend.create(&config).await.unwrap();

        let args = vec!["hello".to_string()];
        let result = instance
            .execute(ExecRequest::new("/bin/echo", &args))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout.to_string_lossy().trim(), "hello");
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_not_an_error() {
        let base = tempfile::tempdir().unwrap();
        let config = minimal_config(base.path());
        let mut instance = ProcessBackend.create(&config).await.unwrap();

        let args = vec!["-c".to_string(), "exit 3".to_string()];
        let result = instance
            .execute(ExecRequest::new("/bin/sh", &args))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn timeout_kills_the_target_and_flags_the_result() {
        let base = tempfile::tempdir().unwrap();
        let config = minimal_config(base.path());
        let mut instance = ProcessBackend.create(&config).await.unwrap();

        let args = vec!["5".to_string()];
        let started = Instant::now();
        let result = instance
            .execute(
                ExecRequest::new("/bin/sleep", &args)
                    .with_timeout(Duration::from_millis(200)),
            )
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(result.timed_out);
        assert_eq!(result.exit_code, exit_code::TIMED_OUT);
        assert!(!result.success);
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn memory_limit_stops_a_runaway_allocation() {
        let base = tempfile::tempdir().unwrap();
        let config = SandboxConfigBuilder::new(SecurityLevel::Minimal)
            .work_dir(base.path())
            .memory_limit(32 * 1024 * 1024)
            .build()
            .unwrap();
        let mut instance = ProcessBackend.create(&config).await.unwrap();

        // Doubles a shell variable until the address-space limit kills the
        // allocation. The timeout only backstops a shell that survives it.
        let args = vec!["-c".to_string(), "s=x; while :; do s=$s$s; done".to_string()];
        let result = instance
            .execute(ExecRequest::new("/bin/sh", &args).with_timeout(Duration::from_secs(10)))
            .await
            .unwrap();
        assert!(!result.success);
        assert!(!result.timed_out, "hit the clock instead of the limit");
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn whitelist_rejects_before_spawn() {
        let base = tempfile::tempdir().unwrap();
        let config = SandboxConfigBuilder::new(SecurityLevel::Minimal)
            .work_dir(base.path())
            .allow_command("/bin/echo")
            .build()
            .unwrap();
        let mut instance = ProcessBackend.create(&config).await.unwrap();

        let args: Vec<String> = Vec::new();
        let err = instance
            .execute(ExecRequest::new("/bin/ls", &args))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::PermissionDenied(_)));
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn environment_is_scrubbed() {
        let base = tempfile::tempdir().unwrap();
        // SAFETY: test-only; no other thread reads the environment here.
        unsafe { std::env::set_var("SECRET_TOKEN", "hunter2") };
        let config = SandboxConfigBuilder::new(SecurityLevel::Minimal)
            .work_dir(base.path())
            .env("VISIBLE", "yes")
            .build()
            .unwrap();
        let mut instance = ProcessBackend.create(&config).await.unwrap();

        let args = vec!["-c".to_string(), "env".to_string()];
        let result = instance
            .execute(ExecRequest::new("/bin/sh", &args))
            .await
            .unwrap();
        let env = result.stdout.to_string_lossy();
        assert!(env.contains("VISIBLE=yes"));
        assert!(!env.contains("SECRET_TOKEN"));
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn commands_run_inside_the_work_dir() {
        let base = tempfile::tempdir().unwrap();
        let config = minimal_config(base.path());
        let mut instance = ProcessBackend.create(&config).await.unwrap();

        let args = vec!["-c".to_string(), "pwd".to_string()];
        let result = instance
            .execute(ExecRequest::new("/bin/sh", &args))
            .await
            .unwrap();
        let pwd = result.stdout.to_string_lossy();
        assert_eq!(
            Path::new(pwd.trim()).file_name(),
            instance.work_dir().file_name()
        );
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn reset_wipes_scratch_files() {
        let base = tempfile::tempdir().unwrap();
        let config = minimal_config(base.path());
        let mut instance = ProcessBackend.create(&config).await.unwrap();

        let args = vec!["-c".to_string(), "echo x > leftover.txt".to_string()];
        instance
            .execute(ExecRequest::new("/bin/sh", &args))
            .await
            .unwrap();
        assert!(instance.work_dir().join("leftover.txt").exists());
        instance.reset().await.unwrap();
        assert!(!instance.work_dir().join("leftover.txt").exists());
        instance.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_fences_execute() {
        let base = tempfile::tempdir().unwrap();
        let config = minimal_config(base.path());
        let mut instance = ProcessBackend.create(&config).await.unwrap();
        let dir = instance.work_dir().to_path_buf();

        instance.destroy().await.unwrap();
        assert!(!dir.exists());
        instance.destroy().await.unwrap();

        let args: Vec<String> = Vec::new();
        let err = instance
            .execute(ExecRequest::new("/bin/echo", &args))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Terminated));
    }

    #[tokio::test]
    async fn output_past_the_cap_is_truncated() {
        let base = tempfile::tempdir().unwrap();
        let config = minimal_config(base.path());
        let mut instance = ProcessBackend.create(&config).await.unwrap();

        // 2 MiB of zeros through stdout against a 1 MiB cap.
        let args = vec![
            "-c".to_string(),
            "head -c 2097152 /dev/zero".to_string(),
        ];
        let result = instance
            .execute(ExecRequest::new("/bin/sh", &args))
            .await
            .unwrap();
        assert!(result.stdout.truncated());
        assert_eq!(result.stdout.len(), sandbox::OUTPUT_CAP);
        instance.destroy().await.unwrap();
    }

    #[test]
    fn signal_exits_map_to_128_plus_signal() {
        let status = std::process::ExitStatus::from_raw(libc::SIGKILL);
        assert_eq!(exit_status_code(status), 128 + libc::SIGKILL);
    }
}
