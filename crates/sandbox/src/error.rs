use std::time::Duration;

use crate::config::SecurityLevel;

/// Reserved exit codes for result-shaped consumers.
///
/// `0` is success and any other value is the target's own exit status; the
/// sentinels below are only used when folding an engine error into an
/// [`ExecutionResult`](crate::ExecutionResult), in which case the target
/// either never ran or was forcibly terminated.
pub mod exit_code {
    /// Target was forcibly terminated after exceeding its timeout.
    pub const TIMED_OUT: i32 = 124;
    /// Namespace/cgroup/seccomp installation failed before `exec`.
    pub const SETUP_FAILED: i32 = 125;
    /// Command rejected by the whitelist; nothing was spawned.
    pub const PERMISSION_DENIED: i32 = 126;
    /// Wasm module requested an import outside the allow-list.
    pub const IMPORT_NOT_ALLOWED: i32 = 127;
}

/// Configuration rejected before any resource was allocated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NonPositiveLimit { field: &'static str },

    #[error("security level {level} requires a non-empty command whitelist")]
    EmptyCommandWhitelist { level: SecurityLevel },

    #[error("syscall appears in both allow and deny lists: {0}")]
    ConflictingSyscall(String),

    #[error("environment variable not allowed in sandbox: {0}")]
    ForbiddenEnvVar(String),

    #[error("work_dir must be an absolute path: {0}")]
    RelativeWorkDir(String),
}

/// Which setup step failed, for auditing. Step names never include
/// host-side paths or secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStep {
    Workspace,
    Cgroup,
    Clone,
    Mount,
    Hostname,
    Privileges,
    Seccomp,
    Handshake,
    Spawn,
    Attach,
    WasmEngine,
    WasmModule,
    WasmInstantiate,
}

impl std::fmt::Display for SetupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Workspace => "workspace",
            Self::Cgroup => "cgroup",
            Self::Clone => "clone",
            Self::Mount => "mount",
            Self::Hostname => "hostname",
            Self::Privileges => "privileges",
            Self::Seccomp => "seccomp",
            Self::Handshake => "handshake",
            Self::Spawn => "spawn",
            Self::Attach => "attach",
            Self::WasmEngine => "wasm-engine",
            Self::WasmModule => "wasm-module",
            Self::WasmInstantiate => "wasm-instantiate",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("setup failed at {step}: {detail}")]
    Setup { step: SetupStep, detail: String },

    #[error("module rejected: {0}")]
    Compilation(String),

    #[error("execution failed: {0}")]
    Runtime(String),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("command not whitelisted: {0}")]
    PermissionDenied(String),

    #[error("import not allowed: {0}")]
    ImportNotAllowed(String),

    #[error("platform cannot satisfy security level {level}: {detail}")]
    PlatformUnsupported {
        level: SecurityLevel,
        detail: String,
    },

    #[error("sandbox is busy with another invocation")]
    Busy,

    #[error("unknown sandbox handle: {0}")]
    UnknownHandle(uuid::Uuid),

    #[error("sandbox already terminated")]
    Terminated,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// The reserved exit code used when folding this error into an
    /// [`ExecutionResult`](crate::ExecutionResult).
    pub fn sentinel_exit_code(&self) -> i32 {
        match self {
            Self::Timeout(_) => exit_code::TIMED_OUT,
            Self::PermissionDenied(_) => exit_code::PERMISSION_DENIED,
            Self::ImportNotAllowed(_) => exit_code::IMPORT_NOT_ALLOWED,
            _ => exit_code::SETUP_FAILED,
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
