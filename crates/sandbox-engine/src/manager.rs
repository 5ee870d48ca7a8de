use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sandbox::{
    Capabilities, ExecRequest, ExecutionResult, IsolationBackend, IsolationClass, Result,
    SandboxConfig, SandboxError, SandboxInstance,
};
use sandbox_host::{NamespaceBackend, ProcessBackend, probe_capabilities};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

/// Opaque reference to a live instance owned by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxHandle {
    id: Uuid,
    backend: &'static str,
    downgraded: bool,
}

impl SandboxHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// True when the platform could not provide namespace isolation and a
    /// permissive security level allowed falling back to the process
    /// backend.
    pub fn downgraded(&self) -> bool {
        self.downgraded
    }
}

struct Entry {
    instance: Mutex<Box<dyn SandboxInstance>>,
    downgraded: bool,
}

/// Lifecycle owner for sandbox instances.
///
/// Probes kernel capabilities once at construction, picks the strongest
/// available backend per `create`, and keeps every live instance in a
/// registry keyed by handle id. All methods are safe to call concurrently;
/// each instance runs at most one invocation at a time and a second caller
/// observes [`SandboxError::Busy`] instead of queueing.
pub struct SandboxManager {
    caps: Capabilities,
    /// Strongest first.
    backends: Vec<Arc<dyn IsolationBackend>>,
    registry: Mutex<HashMap<Uuid, Arc<Entry>>>,
}

impl Default for SandboxManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxManager {
    pub fn new() -> Self {
        Self::with_backends(
            probe_capabilities(),
            vec![Arc::new(NamespaceBackend), Arc::new(ProcessBackend)],
        )
    }

    /// Build a manager over an explicit backend set, strongest first.
    /// Lets tests substitute mock backends and capabilities.
    pub fn with_backends(caps: Capabilities, backends: Vec<Arc<dyn IsolationBackend>>) -> Self {
        Self {
            caps,
            backends,
            registry: Mutex::new(HashMap::new()),
        }
    }

    /// Cached result of the construction-time capability probe.
    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }

    /// Pick the strongest backend the platform supports, or fail when the
    /// security level demands more than the platform can give.
    pub(crate) fn select_backend(
        &self,
        config: &SandboxConfig,
    ) -> Result<(Arc<dyn IsolationBackend>, bool)> {
        let Some(backend) = self
            .backends
            .iter()
            .filter(|b| b.available(&self.caps))
            .max_by_key(|b| b.class())
        else {
            return Err(SandboxError::PlatformUnsupported {
                level: config.security_level(),
                detail: "no isolation backend available".into(),
            });
        };

        let downgraded = backend.class() < IsolationClass::Namespace;
        if downgraded && config.security_level().requires_namespace_isolation() {
            return Err(SandboxError::PlatformUnsupported {
                level: config.security_level(),
                detail: "namespace isolation unavailable on this platform".into(),
            });
        }
        if downgraded {
            warn!(
                level = %config.security_level(),
                backend = backend.name(),
                "namespace isolation unavailable, downgrading"
            );
        }
        Ok((Arc::clone(backend), downgraded))
    }

    /// Create a new instance and register it under a fresh handle.
    pub async fn create(&self, config: &SandboxConfig) -> Result<SandboxHandle> {
        let (backend, downgraded) = self.select_backend(config)?;
        let instance = backend.create(config).await?;
        let id = instance.id();
        let entry = Arc::new(Entry {
            instance: Mutex::new(instance),
            downgraded,
        });
        self.registry.lock().await.insert(id, entry);
        info!(id = %id, backend = backend.name(), downgraded, "handle created");
        Ok(SandboxHandle {
            id,
            backend: backend.name(),
            downgraded,
        })
    }

    /// Run one command on the handle's instance. A concurrent call on the
    /// same handle fails fast with [`SandboxError::Busy`].
    pub async fn execute(
        &self,
        handle: &SandboxHandle,
        command: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let entry = self.lookup(handle.id).await?;
        let mut guard = entry
            .instance
            .try_lock()
            .map_err(|_| SandboxError::Busy)?;

        let mut request = ExecRequest::new(command, args);
        if let Some(timeout) = timeout {
            request = request.with_timeout(timeout);
        }
        let mut result = guard.execute(request).await?;
        result.backend_downgraded = entry.downgraded;
        Ok(result)
    }

    /// Reset the handle's instance to a clean state for reuse.
    pub async fn reset(&self, handle: &SandboxHandle) -> Result<()> {
        let entry = self.lookup(handle.id).await?;
        let mut guard = entry
            .instance
            .try_lock()
            .map_err(|_| SandboxError::Busy)?;
        guard.reset().await
    }

    /// Tear down the handle's instance. Idempotent: destroying an unknown
    /// or already-destroyed handle is a no-op. Waits for an in-flight
    /// execution to finish first.
    pub async fn destroy(&self, handle: &SandboxHandle) -> Result<()> {
        let entry = self.registry.lock().await.remove(&handle.id);
        if let Some(entry) = entry {
            entry.instance.lock().await.destroy().await?;
        }
        Ok(())
    }

    /// Destroy every live instance. Called at shutdown.
    pub async fn destroy_all(&self) {
        let entries: Vec<_> = self.registry.lock().await.drain().collect();
        for (id, entry) in entries {
            if let Err(e) = entry.instance.lock().await.destroy().await {
                warn!(id = %id, error = %e, "failed to destroy instance at shutdown");
            }
        }
    }

    async fn lookup(&self, id: Uuid) -> Result<Arc<Entry>> {
        self.registry
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(SandboxError::UnknownHandle(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use sandbox::{SandboxConfigBuilder, SecurityLevel, SetupStep};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Backend whose instances sleep on execute, for contention tests.
    struct MockBackend {
        class: IsolationClass,
        created: Arc<AtomicUsize>,
    }

    impl MockBackend {
        fn new(class: IsolationClass) -> Self {
            Self {
                class,
                created: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl IsolationBackend for MockBackend {
        fn name(&self) -> &'static str {
            match self.class {
                IsolationClass::Process => "mock-process",
                IsolationClass::Namespace => "mock-namespace",
            }
        }

        fn class(&self) -> IsolationClass {
            self.class
        }

        fn available(&self, caps: &Capabilities) -> bool {
            match self.class {
                IsolationClass::Process => true,
                IsolationClass::Namespace => caps.namespaces,
            }
        }

        async fn create(&self, _config: &SandboxConfig) -> Result<Box<dyn SandboxInstance>> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockInstance {
                id: Uuid::new_v4(),
                work_dir: PathBuf::from("/tmp"),
                destroys: 0,
            }))
        }
    }

    struct MockInstance {
        id: Uuid,
        work_dir: PathBuf,
        destroys: usize,
    }

    #[async_trait]
    impl SandboxInstance for MockInstance {
        fn id(&self) -> Uuid {
            self.id
        }

        fn backend(&self) -> &'static str {
            "mock"
        }

        fn work_dir(&self) -> &Path {
            &self.work_dir
        }

        async fn execute(&mut self, _request: ExecRequest<'_>) -> Result<ExecutionResult> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(ExecutionResult::completed(
                0,
                sandbox::OutputBuffer::new(),
                sandbox::OutputBuffer::new(),
            ))
        }

        async fn reset(&mut self) -> Result<()> {
            Ok(())
        }

        async fn destroy(&mut self) -> Result<()> {
            self.destroys += 1;
            assert_eq!(self.destroys, 1, "instance destroyed twice");
            Ok(())
        }
    }

    /// Backend that always fails to create, for error-path tests.
    struct FailingBackend;

    #[async_trait]
    impl IsolationBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn class(&self) -> IsolationClass {
            IsolationClass::Namespace
        }

        fn available(&self, _caps: &Capabilities) -> bool {
            true
        }

        async fn create(&self, _config: &SandboxConfig) -> Result<Box<dyn SandboxInstance>> {
            Err(SandboxError::Setup {
                step: SetupStep::Clone,
                detail: "mock failure".into(),
            })
        }
    }

    fn all_caps() -> Capabilities {
        Capabilities {
            namespaces: true,
            cgroups: true,
            seccomp: true,
        }
    }

    fn no_caps() -> Capabilities {
        Capabilities::default()
    }

    fn config(level: SecurityLevel) -> SandboxConfig {
        let mut builder = SandboxConfigBuilder::new(level).work_dir("/tmp/sandbox-tests");
        if level.requires_command_whitelist() {
            builder = builder.allow_command("true");
        }
        builder.build().unwrap()
    }

    fn manager(caps: Capabilities) -> SandboxManager {
        SandboxManager::with_backends(
            caps,
            vec![
                Arc::new(MockBackend::new(IsolationClass::Namespace)),
                Arc::new(MockBackend::new(IsolationClass::Process)),
            ],
        )
    }

    #[tokio::test]
    async fn picks_the_strongest_available_backend() {
        let m = manager(all_caps());
        let handle = m.create(&config(SecurityLevel::Minimal)).await.unwrap();
        assert_eq!(handle.backend(), "mock-namespace");
        assert!(!handle.downgraded());
        m.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn downgrades_at_permissive_levels_with_a_flag() {
        let m = manager(no_caps());
        let handle = m.create(&config(SecurityLevel::Standard)).await.unwrap();
        assert_eq!(handle.backend(), "mock-process");
        assert!(handle.downgraded());

        let args: Vec<String> = Vec::new();
        let result = m.execute(&handle, "true", &args, None).await.unwrap();
        assert!(result.backend_downgraded);
        m.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn strict_refuses_to_downgrade() {
        let m = manager(no_caps());
        let err = m.create(&config(SecurityLevel::Strict)).await.unwrap_err();
        assert!(matches!(err, SandboxError::PlatformUnsupported { .. }));
    }

    #[tokio::test]
    async fn paranoid_refuses_to_downgrade() {
        let m = manager(no_caps());
        let err = m
            .create(&config(SecurityLevel::Paranoid))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::PlatformUnsupported { .. }));
    }

    #[tokio::test]
    async fn concurrent_execute_on_one_handle_returns_busy() {
        let m = Arc::new(manager(all_caps()));
        let handle = m.create(&config(SecurityLevel::Minimal)).await.unwrap();

        let m2 = Arc::clone(&m);
        let first = tokio::spawn(async move {
            let args: Vec<String> = Vec::new();
            m2.execute(&handle, "true", &args, None).await
        });
        // Let the first call take the instance lock.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let args: Vec<String> = Vec::new();
        let second = m.execute(&handle, "true", &args, None).await;
        assert!(matches!(second, Err(SandboxError::Busy)));

        // The first call is unaffected by the rejected one.
        assert!(first.await.unwrap().unwrap().success);
        m.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let m = manager(all_caps());
        let handle = m.create(&config(SecurityLevel::Minimal)).await.unwrap();
        m.destroy(&handle).await.unwrap();
        // MockInstance asserts it is never destroyed twice.
        m.destroy(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn execute_after_destroy_is_unknown_handle() {
        let m = manager(all_caps());
        let handle = m.create(&config(SecurityLevel::Minimal)).await.unwrap();
        m.destroy(&handle).await.unwrap();

        let args: Vec<String> = Vec::new();
        let err = m.execute(&handle, "true", &args, None).await.unwrap_err();
        assert!(matches!(err, SandboxError::UnknownHandle(_)));
    }

    #[tokio::test]
    async fn creation_failure_leaves_no_registry_entry() {
        let m = SandboxManager::with_backends(all_caps(), vec![Arc::new(FailingBackend)]);
        let err = m.create(&config(SecurityLevel::Minimal)).await.unwrap_err();
        assert!(matches!(err, SandboxError::Setup { .. }));
        assert!(m.registry.lock().await.is_empty());
    }

    #[tokio::test]
    async fn destroy_all_clears_the_registry() {
        let m = manager(all_caps());
        for _ in 0..3 {
            m.create(&config(SecurityLevel::Minimal)).await.unwrap();
        }
        m.destroy_all().await;
        assert!(m.registry.lock().await.is_empty());
    }
}
