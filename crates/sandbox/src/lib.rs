mod backend;
mod config;
mod error;
mod types;

pub use backend::{IsolationBackend, IsolationClass, SandboxInstance};
pub use config::{
    DEFAULT_ALLOWED_SYSCALLS, DEFAULT_DENIED_SYSCALLS, SandboxConfig, SandboxConfigBuilder,
    SeccompProfile, SecurityLevel, ViolationAction, WasmSandboxConfig, WasmSandboxConfigBuilder,
};
pub use error::{ConfigError, Result, SandboxError, SetupStep, exit_code};
pub use types::{
    Capabilities, ExecRequest, ExecutionError, ExecutionErrorKind, ExecutionResult, OUTPUT_CAP,
    OutputBuffer,
};
