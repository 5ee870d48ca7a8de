use std::collections::BTreeMap;
use std::io;

use sandbox::{SandboxError, SeccompProfile, SetupStep, ViolationAction};
use seccompiler::{BpfProgram, SeccompAction, SeccompFilter, TargetArch};
use tracing::debug;

/// Compiled default-deny syscall filter.
///
/// Built on the parent side so the expensive compilation happens before
/// `fork`; [`SyscallFilter::install`] in the child is a single `seccomp(2)`
/// load. Requires `PR_SET_NO_NEW_PRIVS` to already be set when running
/// unprivileged.
pub struct SyscallFilter {
    program: BpfProgram,
}

impl SyscallFilter {
    /// Compile the profile's effective allow-list for the current
    /// architecture. Names the architecture does not have are skipped,
    /// which under default-deny only ever narrows the filter.
    pub fn from_profile(profile: &SeccompProfile) -> Result<Self, SandboxError> {
        let arch = TargetArch::try_from(std::env::consts::ARCH).map_err(|_| {
            SandboxError::Setup {
                step: SetupStep::Seccomp,
                detail: format!("unsupported architecture: {}", std::env::consts::ARCH),
            }
        })?;

        let mut rules: BTreeMap<i64, Vec<seccompiler::SeccompRule>> = BTreeMap::new();
        for name in profile.effective_allowed() {
            match resolve_syscall(name) {
                // An empty rule vec matches the syscall unconditionally.
                Some(nr) => {
                    rules.insert(nr, Vec::new());
                }
                None => debug!(syscall = name, "skipping syscall unknown on this arch"),
            }
        }

        let mismatch_action = match profile.violation_action {
            ViolationAction::ReturnErrno => SeccompAction::Errno(libc::EPERM as u32),
            ViolationAction::KillProcess => SeccompAction::KillProcess,
        };

        let filter = SeccompFilter::new(rules, mismatch_action, SeccompAction::Allow, arch)
            .map_err(|e| SandboxError::Setup {
                step: SetupStep::Seccomp,
                detail: format!("build filter: {e}"),
            })?;

        let program: BpfProgram = filter.try_into().map_err(|e| SandboxError::Setup {
            step: SetupStep::Seccomp,
            detail: format!("compile filter: {e}"),
        })?;

        Ok(Self { program })
    }

    /// Install the filter on the calling thread. Called between `fork` and
    /// `exec`; the program was compiled up front so this is only the load.
    pub fn install(&self) -> io::Result<()> {
        seccompiler::apply_filter(&self.program).map_err(io::Error::other)
    }
}

/// Syscall number for `name` on the compilation target, or `None` if the
/// architecture does not have it (e.g. `open`/`dup2` on aarch64, which only
/// has the `*at` variants).
#[allow(clippy::too_many_lines)]
fn resolve_syscall(name: &str) -> Option<i64> {
    let nr: libc::c_long = match name {
        // Universal across the supported architectures.
        "brk" => libc::SYS_brk,
        "chdir" => libc::SYS_chdir,
        "chroot" => libc::SYS_chroot,
        "clock_getres" => libc::SYS_clock_getres,
        "clock_gettime" => libc::SYS_clock_gettime,
        "clock_nanosleep" => libc::SYS_clock_nanosleep,
        "clone" => libc::SYS_clone,
        "clone3" => libc::SYS_clone3,
        "close" => libc::SYS_close,
        "close_range" => libc::SYS_close_range,
        "dup" => libc::SYS_dup,
        "dup3" => libc::SYS_dup3,
        "epoll_create1" => libc::SYS_epoll_create1,
        "epoll_ctl" => libc::SYS_epoll_ctl,
        "epoll_pwait" => libc::SYS_epoll_pwait,
        "eventfd2" => libc::SYS_eventfd2,
        "execve" => libc::SYS_execve,
        "exit" => libc::SYS_exit,
        "exit_group" => libc::SYS_exit_group,
        "faccessat" => libc::SYS_faccessat,
        "faccessat2" => libc::SYS_faccessat2,
        "fchdir" => libc::SYS_fchdir,
        "fchmod" => libc::SYS_fchmod,
        "fchmodat" => libc::SYS_fchmodat,
        "fcntl" => libc::SYS_fcntl,
        "flock" => libc::SYS_flock,
        "fstat" => libc::SYS_fstat,
        "fstatfs" => libc::SYS_fstatfs,
        "fsync" => libc::SYS_fsync,
        "ftruncate" => libc::SYS_ftruncate,
        "futex" => libc::SYS_futex,
        "getcwd" => libc::SYS_getcwd,
        "getdents64" => libc::SYS_getdents64,
        "getegid" => libc::SYS_getegid,
        "geteuid" => libc::SYS_geteuid,
        "getgid" => libc::SYS_getgid,
        "getgroups" => libc::SYS_getgroups,
        "getpgid" => libc::SYS_getpgid,
        "getpid" => libc::SYS_getpid,
        "getppid" => libc::SYS_getppid,
        "getrandom" => libc::SYS_getrandom,
        "getresgid" => libc::SYS_getresgid,
        "getresuid" => libc::SYS_getresuid,
        "getrlimit" => libc::SYS_getrlimit,
        "getsid" => libc::SYS_getsid,
        "gettid" => libc::SYS_gettid,
        "gettimeofday" => libc::SYS_gettimeofday,
        "getuid" => libc::SYS_getuid,
        "ioctl" => libc::SYS_ioctl,
        "kexec_load" => libc::SYS_kexec_load,
        "lseek" => libc::SYS_lseek,
        "madvise" => libc::SYS_madvise,
        "memfd_create" => libc::SYS_memfd_create,
        "mkdirat" => libc::SYS_mkdirat,
        "mmap" => libc::SYS_mmap,
        "mount" => libc::SYS_mount,
        "move_mount" => libc::SYS_move_mount,
        "mprotect" => libc::SYS_mprotect,
        "mremap" => libc::SYS_mremap,
        "munmap" => libc::SYS_munmap,
        "nanosleep" => libc::SYS_nanosleep,
        "newfstatat" => libc::SYS_newfstatat,
        "open_tree" => libc::SYS_open_tree,
        "openat" => libc::SYS_openat,
        "pipe2" => libc::SYS_pipe2,
        "pivot_root" => libc::SYS_pivot_root,
        "ppoll" => libc::SYS_ppoll,
        "prctl" => libc::SYS_prctl,
        "pread64" => libc::SYS_pread64,
        "prlimit64" => libc::SYS_prlimit64,
        "pselect6" => libc::SYS_pselect6,
        "ptrace" => libc::SYS_ptrace,
        "pwrite64" => libc::SYS_pwrite64,
        "read" => libc::SYS_read,
        "readlinkat" => libc::SYS_readlinkat,
        "readv" => libc::SYS_readv,
        "reboot" => libc::SYS_reboot,
        "renameat" => libc::SYS_renameat,
        "rseq" => libc::SYS_rseq,
        "rt_sigaction" => libc::SYS_rt_sigaction,
        "rt_sigprocmask" => libc::SYS_rt_sigprocmask,
        "rt_sigreturn" => libc::SYS_rt_sigreturn,
        "rt_sigsuspend" => libc::SYS_rt_sigsuspend,
        "rt_sigtimedwait" => libc::SYS_rt_sigtimedwait,
        "sched_getaffinity" => libc::SYS_sched_getaffinity,
        "sched_yield" => libc::SYS_sched_yield,
        "set_robust_list" => libc::SYS_set_robust_list,
        "set_tid_address" => libc::SYS_set_tid_address,
        "setns" => libc::SYS_setns,
        "setpgid" => libc::SYS_setpgid,
        "setsid" => libc::SYS_setsid,
        "sigaltstack" => libc::SYS_sigaltstack,
        "statfs" => libc::SYS_statfs,
        "statx" => libc::SYS_statx,
        "swapoff" => libc::SYS_swapoff,
        "swapon" => libc::SYS_swapon,
        "sysinfo" => libc::SYS_sysinfo,
        "tgkill" => libc::SYS_tgkill,
        "times" => libc::SYS_times,
        "umask" => libc::SYS_umask,
        "umount2" => libc::SYS_umount2,
        "uname" => libc::SYS_uname,
        "unlinkat" => libc::SYS_unlinkat,
        "unshare" => libc::SYS_unshare,
        "utimensat" => libc::SYS_utimensat,
        "wait4" => libc::SYS_wait4,
        "waitid" => libc::SYS_waitid,
        "write" => libc::SYS_write,
        "writev" => libc::SYS_writev,
        "add_key" => libc::SYS_add_key,
        "bpf" => libc::SYS_bpf,
        "delete_module" => libc::SYS_delete_module,
        "finit_module" => libc::SYS_finit_module,
        "init_module" => libc::SYS_init_module,
        "kexec_file_load" => libc::SYS_kexec_file_load,
        "keyctl" => libc::SYS_keyctl,
        "perf_event_open" => libc::SYS_perf_event_open,
        "process_vm_readv" => libc::SYS_process_vm_readv,
        "process_vm_writev" => libc::SYS_process_vm_writev,
        "request_key" => libc::SYS_request_key,
        // Legacy variants replaced by *at on aarch64.
        #[cfg(target_arch = "x86_64")]
        "access" => libc::SYS_access,
        #[cfg(target_arch = "x86_64")]
        "arch_prctl" => libc::SYS_arch_prctl,
        #[cfg(target_arch = "x86_64")]
        "dup2" => libc::SYS_dup2,
        #[cfg(target_arch = "x86_64")]
        "epoll_wait" => libc::SYS_epoll_wait,
        #[cfg(target_arch = "x86_64")]
        "fork" => libc::SYS_fork,
        #[cfg(target_arch = "x86_64")]
        "getpgrp" => libc::SYS_getpgrp,
        #[cfg(target_arch = "x86_64")]
        "lstat" => libc::SYS_lstat,
        #[cfg(target_arch = "x86_64")]
        "mkdir" => libc::SYS_mkdir,
        #[cfg(target_arch = "x86_64")]
        "open" => libc::SYS_open,
        #[cfg(target_arch = "x86_64")]
        "pipe" => libc::SYS_pipe,
        #[cfg(target_arch = "x86_64")]
        "poll" => libc::SYS_poll,
        #[cfg(target_arch = "x86_64")]
        "readlink" => libc::SYS_readlink,
        #[cfg(target_arch = "x86_64")]
        "rename" => libc::SYS_rename,
        #[cfg(target_arch = "x86_64")]
        "rmdir" => libc::SYS_rmdir,
        #[cfg(target_arch = "x86_64")]
        "select" => libc::SYS_select,
        #[cfg(target_arch = "x86_64")]
        "stat" => libc::SYS_stat,
        #[cfg(target_arch = "x86_64")]
        "unlink" => libc::SYS_unlink,
        #[cfg(target_arch = "x86_64")]
        "vfork" => libc::SYS_vfork,
        _ => return None,
    };
    Some(nr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox::{DEFAULT_ALLOWED_SYSCALLS, DEFAULT_DENIED_SYSCALLS};

    #[test]
    fn baseline_profile_compiles() {
        let profile = SeccompProfile::default();
        SyscallFilter::from_profile(&profile).unwrap();
    }

    #[test]
    fn kill_action_profile_compiles() {
        let profile = SeccompProfile::baseline(ViolationAction::KillProcess);
        SyscallFilter::from_profile(&profile).unwrap();
    }

    #[test]
    fn unknown_syscall_names_are_skipped_not_fatal() {
        let mut profile = SeccompProfile::default();
        profile.allowed.insert("not_a_real_syscall".into());
        SyscallFilter::from_profile(&profile).unwrap();
    }

    #[test]
    fn denied_syscalls_all_resolve() {
        // Every default-deny entry must map to a real number on the host
        // arch, otherwise the deny list is untestable.
        for name in DEFAULT_DENIED_SYSCALLS {
            assert!(
                resolve_syscall(name).is_some(),
                "unresolved deny entry: {name}"
            );
        }
    }

    #[test]
    fn core_allowed_syscalls_resolve() {
        for name in ["read", "write", "close", "execve", "exit_group", "openat"] {
            assert!(resolve_syscall(name).is_some(), "{name} unresolved");
        }
    }

    #[test]
    fn most_of_the_allow_list_resolves_on_the_host() {
        let resolved = DEFAULT_ALLOWED_SYSCALLS
            .iter()
            .filter(|n| resolve_syscall(n).is_some())
            .count();
        // Legacy names are absent on aarch64; everything else must resolve.
        assert!(resolved * 4 >= DEFAULT_ALLOWED_SYSCALLS.len() * 3);
    }
}
