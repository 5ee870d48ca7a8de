use std::collections::VecDeque;
use std::sync::Arc;

use sandbox::{IsolationBackend, Result, SandboxConfig, SandboxInstance};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Warm pool of instances for one configuration, amortizing namespace and
/// filter setup across invocations.
///
/// A checked-out instance is exclusively owned until checked back in.
/// Check-in resets the instance and verifies the reset took (work dir
/// exists and is empty) before it becomes eligible for reuse; anything
/// that fails verification is destroyed instead of reused.
pub struct InstancePool {
    backend: Arc<dyn IsolationBackend>,
    config: SandboxConfig,
    idle: Mutex<VecDeque<Box<dyn SandboxInstance>>>,
    max_idle: usize,
}

impl InstancePool {
    pub fn new(
        backend: Arc<dyn IsolationBackend>,
        config: SandboxConfig,
        max_idle: usize,
    ) -> Self {
        Self {
            backend,
            config,
            idle: Mutex::new(VecDeque::with_capacity(max_idle)),
            max_idle,
        }
    }

    /// Pre-create instances up to the idle capacity.
    pub async fn warm(&self) -> Result<()> {
        let mut created = Vec::new();
        for _ in 0..self.max_idle {
            created.push(self.backend.create(&self.config).await?);
        }
        let mut idle = self.idle.lock().await;
        idle.extend(created);
        info!(size = idle.len(), backend = self.backend.name(), "pool warmed");
        Ok(())
    }

    /// Take a warm instance, or create a fresh one when none are idle.
    pub async fn checkout(&self) -> Result<Box<dyn SandboxInstance>> {
        if let Some(instance) = self.idle.lock().await.pop_front() {
            return Ok(instance);
        }
        self.backend.create(&self.config).await
    }

    /// Return an instance for reuse. Destroys it instead if the reset
    /// fails, verification fails, or the pool is already full.
    pub async fn checkin(&self, mut instance: Box<dyn SandboxInstance>) {
        if let Err(e) = instance.reset().await {
            warn!(id = %instance.id(), error = %e, "reset failed, destroying instance");
            Self::discard(instance).await;
            return;
        }
        if !verify_clean(instance.as_ref()).await {
            warn!(id = %instance.id(), "reset verification failed, destroying instance");
            Self::discard(instance).await;
            return;
        }
        let mut idle = self.idle.lock().await;
        if idle.len() >= self.max_idle {
            drop(idle);
            Self::discard(instance).await;
            return;
        }
        idle.push_back(instance);
    }

    /// Destroy all idle instances.
    pub async fn drain(&self) {
        let instances: Vec<_> = self.idle.lock().await.drain(..).collect();
        for instance in instances {
            Self::discard(instance).await;
        }
    }

    pub async fn idle_len(&self) -> usize {
        self.idle.lock().await.len()
    }

    async fn discard(mut instance: Box<dyn SandboxInstance>) {
        if let Err(e) = instance.destroy().await {
            warn!(id = %instance.id(), error = %e, "failed to destroy pooled instance");
        }
    }
}

/// Canary check after reset: the work dir must exist and hold nothing.
async fn verify_clean(instance: &dyn SandboxInstance) -> bool {
    let mut entries = match tokio::fs::read_dir(instance.work_dir()).await {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    matches!(entries.next_entry().await, Ok(None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::{SandboxConfigBuilder, SecurityLevel};
    use sandbox_host::ProcessBackend;

    fn config(dir: &std::path::Path) -> SandboxConfig {
        SandboxConfigBuilder::new(SecurityLevel::Minimal)
            .work_dir(dir)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn checkout_prefers_warm_instances() {
        let base = tempfile::tempdir().unwrap();
        let pool = InstancePool::new(Arc::new(ProcessBackend), config(base.path()), 2);
        pool.warm().await.unwrap();
        assert_eq!(pool.idle_len().await, 2);

        let instance = pool.checkout().await.unwrap();
        assert_eq!(pool.idle_len().await, 1);
        pool.checkin(instance).await;
        assert_eq!(pool.idle_len().await, 2);
        pool.drain().await;
        assert_eq!(pool.idle_len().await, 0);
    }

    #[tokio::test]
    async fn dirty_instances_are_cleaned_on_checkin() {
        let base = tempfile::tempdir().unwrap();
        let pool = InstancePool::new(Arc::new(ProcessBackend), config(base.path()), 1);

        let instance = pool.checkout().await.unwrap();
        tokio::fs::write(instance.work_dir().join("junk"), b"x")
            .await
            .unwrap();
        pool.checkin(instance).await;

        let reused = pool.checkout().await.unwrap();
        assert!(!reused.work_dir().join("junk").exists());
        pool.checkin(reused).await;
        pool.drain().await;
    }

    #[tokio::test]
    async fn overflow_checkins_are_destroyed() {
        let base = tempfile::tempdir().unwrap();
        let pool = InstancePool::new(Arc::new(ProcessBackend), config(base.path()), 1);

        let a = pool.checkout().await.unwrap();
        let b = pool.checkout().await.unwrap();
        let b_dir = b.work_dir().to_path_buf();
        pool.checkin(a).await;
        pool.checkin(b).await;
        assert_eq!(pool.idle_len().await, 1);
        // The overflow instance was destroyed, not leaked.
        assert!(!b_dir.exists());
        pool.drain().await;
    }
}
