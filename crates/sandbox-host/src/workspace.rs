use std::path::{Path, PathBuf};

use sandbox::{Result, SandboxError, SetupStep};
use tracing::warn;
use uuid::Uuid;

/// Private scratch directory for one instance, created under the configured
/// base directory and named by the instance id.
#[derive(Debug, Clone)]
pub(crate) struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub(crate) async fn create(base: &Path, id: Uuid) -> Result<Self> {
        let root = base.join(id.to_string());
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| SandboxError::Setup {
                step: SetupStep::Workspace,
                detail: format!("create {}: {e}", root.display()),
            })?;
        Ok(Self { root })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.root
    }

    /// Wipe all contents but keep the directory itself, for reuse.
    pub(crate) async fn wipe(&self) -> Result<()> {
        let mut entries =
            tokio::fs::read_dir(&self.root)
                .await
                .map_err(|e| SandboxError::Setup {
                    step: SetupStep::Workspace,
                    detail: format!("read {}: {e}", self.root.display()),
                })?;
        while let Some(entry) = entries.next_entry().await.map_err(SandboxError::Io)? {
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let removed = if is_dir {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            if let Err(e) = removed {
                return Err(SandboxError::Setup {
                    step: SetupStep::Workspace,
                    detail: format!("remove {}: {e}", path.display()),
                });
            }
        }
        Ok(())
    }

    /// Remove the directory entirely. Idempotent; a missing directory is
    /// not an error.
    pub(crate) async fn remove(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.root).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.root.display(), error = %e, "failed to remove workspace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_wipe_remove_cycle() {
        let base = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let ws = Workspace::create(base.path(), id).await.unwrap();
        assert!(ws.path().is_dir());

        tokio::fs::write(ws.path().join("scratch.txt"), b"data")
            .await
            .unwrap();
        tokio::fs::create_dir(ws.path().join("nested")).await.unwrap();
        ws.wipe().await.unwrap();
        assert!(ws.path().is_dir());
        assert!(
            tokio::fs::read_dir(ws.path())
                .await
                .unwrap()
                .next_entry()
                .await
                .unwrap()
                .is_none()
        );

        ws.remove().await;
        assert!(!ws.path().exists());
        // Second remove is a no-op.
        ws.remove().await;
    }
}
