use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::{Result, SandboxConfig, SandboxError, SetupStep};
use tracing::{debug, warn};
use uuid::Uuid;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";
const PARENT: &str = "sandbox";

/// CPU quota period in microseconds.
const CPU_PERIOD: u64 = 100_000;

/// One cgroup v2 leaf owning the limits for a single instance.
///
/// Created as `/sys/fs/cgroup/sandbox/<id>` with `memory.max`,
/// `memory.swap.max=0`, `cpu.max`, and `pids.max` written before any
/// process is attached.
#[derive(Debug)]
pub struct CgroupHandle {
    path: PathBuf,
}

impl CgroupHandle {
    /// Create the leaf and write all limit files. Fails closed: any write
    /// error tears the directory back down.
    pub fn create(id: Uuid, config: &SandboxConfig) -> Result<Self> {
        let parent = Path::new(CGROUP_ROOT).join(PARENT);
        if !parent.exists() {
            std::fs::create_dir_all(&parent).map_err(|e| setup(format!("create parent: {e}")))?;
            enable_controllers(Path::new(CGROUP_ROOT))?;
        }

        let path = parent.join(id.to_string());
        std::fs::create_dir_all(&path)
            .map_err(|e| setup(format!("create {}: {e}", path.display())))?;

        let handle = Self { path };
        if let Err(e) = handle.write_limits(config) {
            handle.remove_dir();
            return Err(e);
        }
        debug!(id = %id, "cgroup created");
        Ok(handle)
    }

    /// `cpu.max` is a rate, not an amount: quota == period pins the group
    /// to one core so the wall-clock deadline also bounds total CPU, while
    /// the configured `cpu_time_limit` is enforced as an amount by
    /// RLIMIT_CPU in the child. Deriving a quota from a seconds budget
    /// would conflate the two.
    fn write_limits(&self, config: &SandboxConfig) -> Result<()> {
        self.write("memory.max", &config.memory_limit().to_string())?;
        // Swap would let the target sidestep memory.max.
        self.write("memory.swap.max", "0")?;
        self.write("cpu.max", &format!("{CPU_PERIOD} {CPU_PERIOD}"))?;
        self.write("pids.max", &config.process_limit().to_string())?;
        Ok(())
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        std::fs::write(self.path.join(file), value)
            .map_err(|e| setup(format!("write {file}: {e}")))
    }

    /// Attach a process by writing its PID to `cgroup.procs`.
    pub fn attach(&self, pid: u32) -> Result<()> {
        std::fs::write(self.path.join("cgroup.procs"), pid.to_string()).map_err(|e| {
            SandboxError::Setup {
                step: SetupStep::Attach,
                detail: format!("attach pid {pid}: {e}"),
            }
        })
    }

    /// Peak memory observed by the controller, if the kernel exposes it.
    pub fn memory_peak(&self) -> Option<u64> {
        let content = std::fs::read_to_string(self.path.join("memory.peak")).ok()?;
        content.trim().parse().ok()
    }

    /// Whether the memory controller OOM-killed anything in this group.
    pub fn was_oom_killed(&self) -> bool {
        let Ok(content) = std::fs::read_to_string(self.path.join("memory.events")) else {
            return false;
        };
        content
            .lines()
            .find_map(|l| l.strip_prefix("oom_kill "))
            .and_then(|c| c.trim().parse::<u64>().ok())
            .is_some_and(|n| n > 0)
    }

    /// Kill every process in the group via `cgroup.kill`. Catches anything
    /// the target forked that escaped its process group.
    pub fn kill_all(&self) {
        if let Err(e) = std::fs::write(self.path.join("cgroup.kill"), "1")
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "cgroup.kill failed");
        }
    }

    /// Kill stragglers and remove the leaf. rmdir fails with EBUSY until
    /// the kernel has reaped all members, so retry briefly.
    pub async fn destroy(self) {
        self.kill_all();
        for _ in 0..10 {
            if !self.path.exists() || std::fs::remove_dir(&self.path).is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        warn!(path = %self.path.display(), "cgroup still busy after retries");
    }

    fn remove_dir(&self) {
        if let Err(e) = std::fs::remove_dir(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), error = %e, "failed to remove cgroup");
        }
    }
}

fn setup(detail: String) -> SandboxError {
    SandboxError::Setup {
        step: SetupStep::Cgroup,
        detail,
    }
}

/// Enable the controllers our limit files need in the root's subtree.
fn enable_controllers(root: &Path) -> Result<()> {
    let subtree = root.join("cgroup.subtree_control");
    let current = std::fs::read_to_string(&subtree).unwrap_or_default();
    let mut wanted = Vec::new();
    for c in ["memory", "cpu", "pids"] {
        if !current.split_whitespace().any(|have| have == c) {
            wanted.push(format!("+{c}"));
        }
    }
    if !wanted.is_empty() {
        std::fs::write(&subtree, wanted.join(" "))
            .map_err(|e| setup(format!("enable controllers: {e}")))?;
    }
    Ok(())
}
