use std::io;

use sandbox::SandboxConfig;

/// Resource limits resolved to the raw values installed in the child.
///
/// Applied between `fork` and `exec`, so everything here must stay
/// async-signal-safe: raw `libc` calls only, no allocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResourceLimiter {
    cpu_secs: u64,
    memory_bytes: u64,
    file_size_bytes: u64,
    nproc: u32,
}

impl ResourceLimiter {
    pub(crate) fn from_config(config: &SandboxConfig) -> Self {
        Self {
            cpu_secs: config.cpu_time_limit(),
            memory_bytes: config.memory_limit(),
            file_size_bytes: config.file_size_limit(),
            nproc: config.process_limit(),
        }
    }

    /// Install all rlimits, then set `PR_SET_NO_NEW_PRIVS`. The ordering
    /// matters: no-new-privs must be in place before any seccomp filter is
    /// loaded by an unprivileged process.
    ///
    /// # Safety
    /// Must only be called in the forked child, before `exec`.
    pub(crate) unsafe fn apply(&self) -> io::Result<()> {
        // SAFETY: setrlimit and prctl are async-signal-safe.
        unsafe {
            set_rlimit(libc::RLIMIT_CPU, self.cpu_secs)?;
            set_rlimit(libc::RLIMIT_AS, self.memory_bytes)?;
            set_rlimit(libc::RLIMIT_FSIZE, self.file_size_bytes)?;
            set_rlimit(libc::RLIMIT_NPROC, u64::from(self.nproc))?;
            // Core dumps could leak target state into the work dir.
            set_rlimit(libc::RLIMIT_CORE, 0)?;

            if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}

unsafe fn set_rlimit(resource: libc::__rlimit_resource_t, value: u64) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value,
        rlim_max: value,
    };
    // SAFETY: limit outlives the call; setrlimit does not retain the pointer.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
