use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard cap on captured stdout/stderr, per stream.
pub const OUTPUT_CAP: usize = 1024 * 1024;

/// Bounded capture buffer. Bytes past the cap are dropped, never buffered,
/// so a target writing gigabytes cannot exhaust host memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputBuffer {
    data: Vec<u8>,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk, discarding anything past [`OUTPUT_CAP`].
    pub fn push(&mut self, chunk: &[u8]) {
        let remaining = OUTPUT_CAP.saturating_sub(self.data.len());
        if chunk.len() > remaining {
            self.data
                .extend_from_slice(chunk.get(..remaining).unwrap_or_default());
            self.truncated = true;
        } else {
            self.data.extend_from_slice(chunk);
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

impl From<Vec<u8>> for OutputBuffer {
    fn from(data: Vec<u8>) -> Self {
        let mut buf = Self::new();
        buf.push(&data);
        buf
    }
}

/// Why an execution was folded into a failed result instead of surfacing
/// as a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Timeout,
    SetupFailed,
    PermissionDenied,
    ImportNotAllowed,
    Compilation,
    Runtime,
    Terminated,
}

/// Structured error attached to a failed [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub detail: String,
}

/// One command (or module) to run inside an instance.
#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    /// Wall-clock deadline; `None` derives it from the config's CPU limit.
    pub timeout: Option<Duration>,
}

impl<'a> ExecRequest<'a> {
    pub fn new(command: &'a str, args: &'a [String]) -> Self {
        Self {
            command,
            args,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one execution. Produced for every run that got as far as an
/// instance; engine-level failures are folded in with a sentinel exit code
/// and a populated `error` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Target's exit status, or a reserved sentinel
    /// (see [`exit_code`](crate::exit_code)).
    pub exit_code: i32,
    pub stdout: OutputBuffer,
    pub stderr: OutputBuffer,
    pub execution_time_ms: u64,
    /// Peak memory if the backend can observe it (`memory.peak` or maxrss).
    pub memory_used_bytes: Option<u64>,
    pub timed_out: bool,
    /// Instructions consumed; Wasm backend only.
    pub fuel_consumed: Option<u64>,
    /// Set when the requested level wanted namespace isolation but the
    /// platform could only provide the plain process backend.
    pub backend_downgraded: bool,
    pub error: Option<ExecutionError>,
}

impl ExecutionResult {
    /// A clean result for a target that ran to completion.
    pub fn completed(exit_code: i32, stdout: OutputBuffer, stderr: OutputBuffer) -> Self {
        Self {
            success: exit_code == 0,
            exit_code,
            stdout,
            stderr,
            execution_time_ms: 0,
            memory_used_bytes: None,
            timed_out: false,
            fuel_consumed: None,
            backend_downgraded: false,
            error: None,
        }
    }

    /// A failed result carrying a sentinel exit code and structured error.
    pub fn failed(exit_code: i32, kind: ExecutionErrorKind, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code,
            stdout: OutputBuffer::new(),
            stderr: OutputBuffer::new(),
            execution_time_ms: 0,
            memory_used_bytes: None,
            timed_out: kind == ExecutionErrorKind::Timeout,
            fuel_consumed: None,
            backend_downgraded: false,
            error: Some(ExecutionError {
                kind,
                detail: detail.into(),
            }),
        }
    }
}

/// What the running kernel lets us do, probed once per manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// User/PID/mount/UTS/IPC namespaces can be created.
    pub namespaces: bool,
    /// A writable cgroup v2 hierarchy is mounted.
    pub cgroups: bool,
    /// seccomp filters can be installed.
    pub seccomp: bool,
}
