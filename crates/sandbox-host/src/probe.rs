use std::path::Path;

use nix::unistd::Uid;
use sandbox::Capabilities;
use tracing::debug;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Probe what the running kernel lets us do, without allocating anything.
///
/// All checks are read-only; the result is cached by the manager for its
/// lifetime, so a facility toggled after startup is not observed.
pub fn probe_capabilities() -> Capabilities {
    let caps = Capabilities {
        namespaces: namespaces_available(),
        cgroups: cgroups_available(),
        seccomp: seccomp_available(),
    };
    debug!(
        namespaces = caps.namespaces,
        cgroups = caps.cgroups,
        seccomp = caps.seccomp,
        "probed kernel capabilities"
    );
    caps
}

fn namespaces_available() -> bool {
    let ns = Path::new("/proc/self/ns");
    for kind in ["user", "pid", "mnt", "uts", "ipc"] {
        if !ns.join(kind).exists() {
            return false;
        }
    }
    if Uid::effective().is_root() {
        return true;
    }
    // Unprivileged callers need user namespaces enabled. Debian kernels gate
    // this behind a sysctl; mainline gates on max_user_namespaces.
    if let Ok(v) = std::fs::read_to_string("/proc/sys/kernel/unprivileged_userns_clone") {
        return v.trim() != "0";
    }
    match std::fs::read_to_string("/proc/sys/user/max_user_namespaces") {
        Ok(v) => v.trim().parse::<u64>().map(|n| n > 0).unwrap_or(false),
        Err(_) => false,
    }
}

fn cgroups_available() -> bool {
    let root = Path::new(CGROUP_ROOT);
    // cgroup.controllers only exists on a v2 hierarchy.
    if !root.join("cgroup.controllers").exists() {
        return false;
    }
    nix::unistd::access(root, nix::unistd::AccessFlags::W_OK).is_ok()
}

fn seccomp_available() -> bool {
    Path::new("/proc/sys/kernel/seccomp/actions_avail").exists()
}
