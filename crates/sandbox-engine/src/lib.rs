//! Top-level execution surface over the isolation backends.
//!
//! [`SandboxManager`] owns instance lifecycles and backend selection;
//! [`InstancePool`] amortizes setup cost for repeated runs of one
//! configuration. The free functions [`execute`] and [`execute_wasm`] are
//! the one-shot entry points: they never return `Err`, folding every
//! engine failure into an [`ExecutionResult`] with a reserved exit code so
//! callers get a single result shape.

mod manager;
mod pool;

use std::time::Duration;

use sandbox::{
    ExecutionErrorKind, ExecutionResult, SandboxConfig, SandboxError, WasmSandboxConfig,
};
use tracing::warn;

pub use manager::{SandboxHandle, SandboxManager};
pub use pool::InstancePool;
pub use sandbox_host::{NamespaceBackend, ProcessBackend, probe_capabilities};
pub use sandbox_wasm::WasmBackend;

/// Run one command in a fresh sandbox and tear it down.
///
/// Failures are folded into the result: the error kind and detail land in
/// `result.error` and the exit code is the matching reserved sentinel.
pub async fn execute(
    config: &SandboxConfig,
    command: &str,
    args: &[String],
    timeout: Option<Duration>,
) -> ExecutionResult {
    let manager = SandboxManager::new();
    let handle = match manager.create(config).await {
        Ok(handle) => handle,
        Err(e) => return fold_error(e),
    };
    let result = manager.execute(&handle, command, args, timeout).await;
    if let Err(e) = manager.destroy(&handle).await {
        warn!(id = %handle.id(), error = %e, "failed to destroy one-shot sandbox");
    }
    result.unwrap_or_else(fold_error)
}

/// Compile and run a Wasm module, folding failures into the result.
pub async fn execute_wasm(module: Vec<u8>, config: &WasmSandboxConfig) -> ExecutionResult {
    let backend = match WasmBackend::new() {
        Ok(backend) => backend,
        Err(e) => return fold_error(e),
    };
    backend
        .execute(module, config)
        .await
        .unwrap_or_else(fold_error)
}

/// Convert an engine error into a failed [`ExecutionResult`] carrying the
/// reserved exit code for its category.
fn fold_error(error: SandboxError) -> ExecutionResult {
    let kind = match &error {
        SandboxError::Timeout(_) => ExecutionErrorKind::Timeout,
        SandboxError::PermissionDenied(_) => ExecutionErrorKind::PermissionDenied,
        SandboxError::ImportNotAllowed(_) => ExecutionErrorKind::ImportNotAllowed,
        SandboxError::Compilation(_) => ExecutionErrorKind::Compilation,
        SandboxError::Runtime(_) => ExecutionErrorKind::Runtime,
        // The one-shot paths never contend for their private handle, so
        // Busy cannot surface here; if a caller folds manager errors, it is
        // transient contention rather than a setup fault.
        SandboxError::Busy => ExecutionErrorKind::Runtime,
        SandboxError::Terminated | SandboxError::UnknownHandle(_) => {
            ExecutionErrorKind::Terminated
        }
        SandboxError::Config(_)
        | SandboxError::Setup { .. }
        | SandboxError::PlatformUnsupported { .. }
        | SandboxError::Io(_) => ExecutionErrorKind::SetupFailed,
    };
    ExecutionResult::failed(error.sentinel_exit_code(), kind, error.to_string())
}
