use std::path::Path;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::Result;
use crate::types::{Capabilities, ExecRequest, ExecutionResult};

/// Isolation strength, ordered weakest to strongest. The manager walks
/// backends strongest-first when picking one for a security level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IsolationClass {
    /// Plain child process with rlimits (and optionally seccomp).
    Process,
    /// Fresh namespaces, pivoted root, cgroup limits.
    Namespace,
}

impl std::fmt::Display for IsolationClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Process => f.write_str("process"),
            Self::Namespace => f.write_str("namespace"),
        }
    }
}

/// One live sandbox. Executions are serialized: `execute` takes `&mut self`
/// and the manager wraps instances in a mutex, returning
/// [`SandboxError::Busy`](crate::SandboxError::Busy) on contention.
#[async_trait]
pub trait SandboxInstance: Send {
    fn id(&self) -> Uuid;

    fn backend(&self) -> &'static str;

    /// Private scratch directory, wiped on reset and removed on destroy.
    fn work_dir(&self) -> &Path;

    /// Run one command to completion under the instance's limits.
    async fn execute(&mut self, request: ExecRequest<'_>) -> Result<ExecutionResult>;

    /// Return the instance to a clean state for reuse: scratch wiped,
    /// no leftover processes. Errors mean the instance must be destroyed.
    async fn reset(&mut self) -> Result<()>;

    /// Tear down everything the instance owns. Idempotent.
    async fn destroy(&mut self) -> Result<()>;
}

/// A way of building sandbox instances. Implementations are stateless
/// factories; all per-instance state lives in the instance.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn class(&self) -> IsolationClass;

    /// Whether this backend can operate given the probed kernel facilities.
    fn available(&self, caps: &Capabilities) -> bool;

    async fn create(&self, config: &SandboxConfig) -> Result<Box<dyn SandboxInstance>>;
}
