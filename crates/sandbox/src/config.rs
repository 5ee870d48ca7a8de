use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Environment variables that can hijack the dynamic loader; never allowed
/// into a sandbox environment.
const DANGEROUS_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_LIBRARY_PATH",
];

/// Baseline syscall allow-list: enough for a dynamically linked target to
/// reach `main`, do file IO inside its work directory, and exit. Names not
/// present on the target architecture are skipped at filter-build time —
/// under a default-deny filter that is fail-closed, not a hole.
pub const DEFAULT_ALLOWED_SYSCALLS: &[&str] = &[
    "access",
    "arch_prctl",
    "brk",
    "chdir",
    "clock_getres",
    "clone",
    "clone3",
    "clock_gettime",
    "clock_nanosleep",
    "close",
    "close_range",
    "dup",
    "dup2",
    "dup3",
    "epoll_create1",
    "epoll_ctl",
    "epoll_pwait",
    "epoll_wait",
    "eventfd2",
    "execve",
    "exit",
    "exit_group",
    "faccessat",
    "faccessat2",
    "fchdir",
    "fchmod",
    "fchmodat",
    "fcntl",
    "flock",
    "fork",
    "fstat",
    "fstatfs",
    "fsync",
    "ftruncate",
    "futex",
    "getcwd",
    "getdents64",
    "getegid",
    "geteuid",
    "getgid",
    "getgroups",
    "getpgid",
    "getpgrp",
    "getpid",
    "getppid",
    "getrandom",
    "getresgid",
    "getresuid",
    "getrlimit",
    "getsid",
    "gettid",
    "gettimeofday",
    "getuid",
    "ioctl",
    "lseek",
    "lstat",
    "madvise",
    "memfd_create",
    "mkdir",
    "mkdirat",
    "mmap",
    "mprotect",
    "mremap",
    "munmap",
    "nanosleep",
    "newfstatat",
    "open",
    "openat",
    "pipe",
    "pipe2",
    "poll",
    "ppoll",
    "prctl",
    "pread64",
    "prlimit64",
    "pselect6",
    "pwrite64",
    "read",
    "readlink",
    "readlinkat",
    "readv",
    "rename",
    "renameat",
    "rmdir",
    "rseq",
    "rt_sigaction",
    "rt_sigprocmask",
    "rt_sigreturn",
    "rt_sigsuspend",
    "rt_sigtimedwait",
    "sched_getaffinity",
    "sched_yield",
    "select",
    "set_robust_list",
    "set_tid_address",
    "setpgid",
    "sigaltstack",
    "stat",
    "statfs",
    "statx",
    "sysinfo",
    "tgkill",
    "times",
    "umask",
    "uname",
    "unlink",
    "unlinkat",
    "utimensat",
    "vfork",
    "wait4",
    "waitid",
    "write",
    "writev",
];

/// High-risk syscalls that stay denied even if a caller extends the
/// allow-list carelessly: tracing, mount manipulation, kernel module and
/// namespace escape vectors.
pub const DEFAULT_DENIED_SYSCALLS: &[&str] = &[
    "add_key",
    "bpf",
    "chroot",
    "delete_module",
    "finit_module",
    "init_module",
    "kexec_file_load",
    "kexec_load",
    "keyctl",
    "mount",
    "move_mount",
    "open_tree",
    "perf_event_open",
    "pivot_root",
    "process_vm_readv",
    "process_vm_writev",
    "ptrace",
    "reboot",
    "request_key",
    "setns",
    "swapoff",
    "swapon",
    "umount2",
    "unshare",
];

/// What happens when the target invokes a syscall outside the allow-list.
///
/// The upstream design left this ambiguous; it is an explicit caller choice
/// here, defaulted per security level (Paranoid kills, everything else
/// returns `EPERM`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationAction {
    /// The syscall fails with `EPERM`; the target keeps running.
    ReturnErrno,
    /// The whole process is killed on the first violation.
    KillProcess,
}

/// Allow/deny syscall policy installed in OS-backend children.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeccompProfile {
    pub allowed: BTreeSet<String>,
    pub denied: BTreeSet<String>,
    pub violation_action: ViolationAction,
}

impl SeccompProfile {
    /// Baseline default-deny profile with the given violation action.
    pub fn baseline(violation_action: ViolationAction) -> Self {
        Self {
            allowed: DEFAULT_ALLOWED_SYSCALLS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            denied: DEFAULT_DENIED_SYSCALLS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            violation_action,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(conflict) = self.allowed.intersection(&self.denied).next() {
            return Err(ConfigError::ConflictingSyscall(conflict.clone()));
        }
        Ok(())
    }

    /// Effective allow-list: `allowed` minus `denied`.
    pub fn effective_allowed(&self) -> impl Iterator<Item = &str> {
        self.allowed
            .iter()
            .filter(|s| !self.denied.contains(*s))
            .map(String::as_str)
    }
}

impl Default for SeccompProfile {
    fn default() -> Self {
        Self::baseline(ViolationAction::ReturnErrno)
    }
}

/// Declarative isolation policy, resolved into concrete limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityLevel {
    Minimal,
    Standard,
    Strict,
    Paranoid,
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minimal => f.write_str("minimal"),
            Self::Standard => f.write_str("standard"),
            Self::Strict => f.write_str("strict"),
            Self::Paranoid => f.write_str("paranoid"),
        }
    }
}

struct LevelDefaults {
    cpu_time_limit: u64,
    memory_limit: u64,
    file_size_limit: u64,
    process_limit: u32,
    enable_seccomp: bool,
    violation_action: ViolationAction,
}

impl SecurityLevel {
    /// Strict and Paranoid require namespace isolation; lower levels may
    /// fall back to the plain process backend with a warning flag.
    pub fn requires_namespace_isolation(self) -> bool {
        matches!(self, Self::Strict | Self::Paranoid)
    }

    /// Strict and Paranoid refuse to run commands without a whitelist.
    pub fn requires_command_whitelist(self) -> bool {
        matches!(self, Self::Strict | Self::Paranoid)
    }

    fn defaults(self) -> LevelDefaults {
        const MIB: u64 = 1024 * 1024;
        match self {
            Self::Minimal => LevelDefaults {
                cpu_time_limit: 60,
                memory_limit: 512 * MIB,
                file_size_limit: 64 * MIB,
                process_limit: 64,
                enable_seccomp: false,
                violation_action: ViolationAction::ReturnErrno,
            },
            Self::Standard => LevelDefaults {
                cpu_time_limit: 30,
                memory_limit: 256 * MIB,
                file_size_limit: 32 * MIB,
                process_limit: 32,
                enable_seccomp: true,
                violation_action: ViolationAction::ReturnErrno,
            },
            Self::Strict => LevelDefaults {
                cpu_time_limit: 15,
                memory_limit: 128 * MIB,
                file_size_limit: 16 * MIB,
                process_limit: 16,
                enable_seccomp: true,
                violation_action: ViolationAction::ReturnErrno,
            },
            Self::Paranoid => LevelDefaults {
                cpu_time_limit: 10,
                memory_limit: 64 * MIB,
                file_size_limit: 8 * MIB,
                process_limit: 4,
                enable_seccomp: true,
                violation_action: ViolationAction::KillProcess,
            },
        }
    }
}

/// Validated, immutable sandbox configuration.
///
/// Constructed only through [`SandboxConfigBuilder`]; no resource is ever
/// allocated before validation succeeds, and resolved limits cannot change
/// for the lifetime of any instance created from this config.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    work_dir: PathBuf,
    cpu_time_limit: u64,
    memory_limit: u64,
    file_size_limit: u64,
    process_limit: u32,
    enable_network: bool,
    allowed_hosts: BTreeSet<String>,
    security_level: SecurityLevel,
    allowed_commands: BTreeSet<String>,
    enable_seccomp: bool,
    seccomp_profile: SeccompProfile,
    environment: BTreeMap<String, String>,
}

impl SandboxConfig {
    /// Base directory under which instances create their private work dirs.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// CPU time ceiling in seconds.
    pub fn cpu_time_limit(&self) -> u64 {
        self.cpu_time_limit
    }

    /// Memory ceiling in bytes.
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    /// Largest file the target may create, in bytes.
    pub fn file_size_limit(&self) -> u64 {
        self.file_size_limit
    }

    /// Process/thread count ceiling.
    pub fn process_limit(&self) -> u32 {
        self.process_limit
    }

    pub fn enable_network(&self) -> bool {
        self.enable_network
    }

    /// Hosts the caller intends to allow. Carried for proxy-fronted setups;
    /// not enforced at packet level by the engine itself.
    pub fn allowed_hosts(&self) -> &BTreeSet<String> {
        &self.allowed_hosts
    }

    pub fn security_level(&self) -> SecurityLevel {
        self.security_level
    }

    pub fn allowed_commands(&self) -> &BTreeSet<String> {
        &self.allowed_commands
    }

    pub fn enable_seccomp(&self) -> bool {
        self.enable_seccomp
    }

    pub fn seccomp_profile(&self) -> &SeccompProfile {
        &self.seccomp_profile
    }

    /// The exact environment the target sees; nothing is inherited.
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    /// Whitelist check. An empty whitelist means "allow all", which
    /// validation forbids at Strict/Paranoid. Matches the command as given
    /// and by basename, so `/usr/bin/python3` passes a `python3` entry.
    pub fn command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }
        if self.allowed_commands.contains(command) {
            return true;
        }
        Path::new(command)
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| self.allowed_commands.contains(n))
    }
}

/// Builder resolving level defaults with per-field overrides.
#[derive(Debug, Clone)]
pub struct SandboxConfigBuilder {
    security_level: SecurityLevel,
    work_dir: Option<PathBuf>,
    cpu_time_limit: Option<u64>,
    memory_limit: Option<u64>,
    file_size_limit: Option<u64>,
    process_limit: Option<u32>,
    enable_network: bool,
    allowed_hosts: BTreeSet<String>,
    allowed_commands: BTreeSet<String>,
    enable_seccomp: Option<bool>,
    seccomp_profile: Option<SeccompProfile>,
    environment: BTreeMap<String, String>,
}

impl SandboxConfigBuilder {
    pub fn new(security_level: SecurityLevel) -> Self {
        Self {
            security_level,
            work_dir: None,
            cpu_time_limit: None,
            memory_limit: None,
            file_size_limit: None,
            process_limit: None,
            enable_network: false,
            allowed_hosts: BTreeSet::new(),
            allowed_commands: BTreeSet::new(),
            enable_seccomp: None,
            seccomp_profile: None,
            environment: BTreeMap::new(),
        }
    }

    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    pub fn cpu_time_limit(mut self, seconds: u64) -> Self {
        self.cpu_time_limit = Some(seconds);
        self
    }

    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn file_size_limit(mut self, bytes: u64) -> Self {
        self.file_size_limit = Some(bytes);
        self
    }

    pub fn process_limit(mut self, count: u32) -> Self {
        self.process_limit = Some(count);
        self
    }

    pub fn enable_network(mut self) -> Self {
        self.enable_network = true;
        self
    }

    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.insert(host.into());
        self
    }

    pub fn allow_command(mut self, command: impl Into<String>) -> Self {
        self.allowed_commands.insert(command.into());
        self
    }

    pub fn enable_seccomp(mut self, enabled: bool) -> Self {
        self.enable_seccomp = Some(enabled);
        self
    }

    pub fn seccomp_profile(mut self, profile: SeccompProfile) -> Self {
        self.seccomp_profile = Some(profile);
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Resolve defaults and validate. Fails before any resource allocation.
    pub fn build(self) -> Result<SandboxConfig, ConfigError> {
        let defaults = self.security_level.defaults();

        let cpu_time_limit = self.cpu_time_limit.unwrap_or(defaults.cpu_time_limit);
        let memory_limit = self.memory_limit.unwrap_or(defaults.memory_limit);
        let file_size_limit = self.file_size_limit.unwrap_or(defaults.file_size_limit);
        let process_limit = self.process_limit.unwrap_or(defaults.process_limit);

        if cpu_time_limit == 0 {
            return Err(ConfigError::NonPositiveLimit {
                field: "cpu_time_limit",
            });
        }
        if memory_limit == 0 {
            return Err(ConfigError::NonPositiveLimit {
                field: "memory_limit",
            });
        }
        if file_size_limit == 0 {
            return Err(ConfigError::NonPositiveLimit {
                field: "file_size_limit",
            });
        }
        if process_limit == 0 {
            return Err(ConfigError::NonPositiveLimit {
                field: "process_limit",
            });
        }

        if self.security_level.requires_command_whitelist() && self.allowed_commands.is_empty() {
            return Err(ConfigError::EmptyCommandWhitelist {
                level: self.security_level,
            });
        }

        for key in self.environment.keys() {
            if DANGEROUS_ENV_VARS.contains(&key.as_str()) {
                return Err(ConfigError::ForbiddenEnvVar(key.clone()));
            }
        }

        let work_dir = self
            .work_dir
            .unwrap_or_else(|| std::env::temp_dir().join("sandbox"));
        if !work_dir.is_absolute() {
            return Err(ConfigError::RelativeWorkDir(
                work_dir.display().to_string(),
            ));
        }

        let seccomp_profile = self
            .seccomp_profile
            .unwrap_or_else(|| SeccompProfile::baseline(defaults.violation_action));
        seccomp_profile.validate()?;

        Ok(SandboxConfig {
            work_dir,
            cpu_time_limit,
            memory_limit,
            file_size_limit,
            process_limit,
            enable_network: self.enable_network,
            allowed_hosts: self.allowed_hosts,
            security_level: self.security_level,
            allowed_commands: self.allowed_commands,
            enable_seccomp: self.enable_seccomp.unwrap_or(defaults.enable_seccomp),
            seccomp_profile,
            environment: self.environment,
        })
    }
}

/// Validated configuration for Wasm module execution.
#[derive(Debug, Clone)]
pub struct WasmSandboxConfig {
    memory_limit: u64,
    fuel: u64,
    timeout: Duration,
    allowed_imports: BTreeSet<String>,
}

impl WasmSandboxConfig {
    /// Linear-memory ceiling in bytes.
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    /// Instruction budget; exhaustion terminates the module.
    pub fn fuel(&self) -> u64 {
        self.fuel
    }

    /// Wall-clock deadline raced against fuel exhaustion.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Host symbols the module may import. Entries match either the bare
    /// import name or `module.name` qualified form.
    pub fn allowed_imports(&self) -> &BTreeSet<String> {
        &self.allowed_imports
    }

    pub fn import_allowed(&self, module: &str, name: &str) -> bool {
        self.allowed_imports.contains(name)
            || self.allowed_imports.contains(&format!("{module}.{name}"))
    }
}

#[derive(Debug, Clone)]
pub struct WasmSandboxConfigBuilder {
    memory_limit: u64,
    fuel: u64,
    timeout: Duration,
    allowed_imports: BTreeSet<String>,
}

impl Default for WasmSandboxConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl WasmSandboxConfigBuilder {
    pub fn new() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            fuel: 1_000_000,
            timeout: Duration::from_secs(30),
            allowed_imports: BTreeSet::new(),
        }
    }

    pub fn memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn allow_import(mut self, symbol: impl Into<String>) -> Self {
        self.allowed_imports.insert(symbol.into());
        self
    }

    pub fn build(self) -> Result<WasmSandboxConfig, ConfigError> {
        if self.memory_limit == 0 {
            return Err(ConfigError::NonPositiveLimit {
                field: "memory_limit",
            });
        }
        if self.fuel == 0 {
            return Err(ConfigError::NonPositiveLimit { field: "fuel" });
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::NonPositiveLimit { field: "timeout" });
        }
        Ok(WasmSandboxConfig {
            memory_limit: self.memory_limit,
            fuel: self.fuel,
            timeout: self.timeout,
            allowed_imports: self.allowed_imports,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_defaults_resolve() {
        let config = SandboxConfigBuilder::new(SecurityLevel::Standard)
            .build()
            .unwrap();
        assert_eq!(config.cpu_time_limit(), 30);
        assert_eq!(config.memory_limit(), 256 * 1024 * 1024);
        assert_eq!(config.process_limit(), 32);
        assert!(config.enable_seccomp());
        assert!(!config.enable_network());
    }

    #[test]
    fn explicit_fields_override_level_defaults() {
        let config = SandboxConfigBuilder::new(SecurityLevel::Minimal)
            .cpu_time_limit(5)
            .memory_limit(1024)
            .enable_seccomp(true)
            .build()
            .unwrap();
        assert_eq!(config.cpu_time_limit(), 5);
        assert_eq!(config.memory_limit(), 1024);
        assert!(config.enable_seccomp());
    }

    #[test]
    fn zero_limit_rejected() {
        let err = SandboxConfigBuilder::new(SecurityLevel::Minimal)
            .memory_limit(0)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::NonPositiveLimit {
                field: "memory_limit"
            }
        );
    }

    #[test]
    fn strict_requires_command_whitelist() {
        let err = SandboxConfigBuilder::new(SecurityLevel::Strict)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommandWhitelist { .. }));

        let config = SandboxConfigBuilder::new(SecurityLevel::Strict)
            .allow_command("python3")
            .build()
            .unwrap();
        assert!(config.command_allowed("python3"));
    }

    #[test]
    fn paranoid_requires_command_whitelist() {
        let err = SandboxConfigBuilder::new(SecurityLevel::Paranoid)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommandWhitelist { .. }));
    }

    #[test]
    fn paranoid_defaults_to_kill_on_violation() {
        let config = SandboxConfigBuilder::new(SecurityLevel::Paranoid)
            .allow_command("true")
            .build()
            .unwrap();
        assert_eq!(
            config.seccomp_profile().violation_action,
            ViolationAction::KillProcess
        );
    }

    #[test]
    fn command_allowed_matches_basename() {
        let config = SandboxConfigBuilder::new(SecurityLevel::Strict)
            .allow_command("python3")
            .build()
            .unwrap();
        assert!(config.command_allowed("/usr/bin/python3"));
        assert!(!config.command_allowed("/usr/bin/python2"));
        assert!(!config.command_allowed("bash"));
    }

    #[test]
    fn empty_whitelist_allows_all_at_permissive_levels() {
        let config = SandboxConfigBuilder::new(SecurityLevel::Minimal)
            .build()
            .unwrap();
        assert!(config.command_allowed("anything"));
    }

    #[test]
    fn dangerous_env_vars_rejected() {
        let err = SandboxConfigBuilder::new(SecurityLevel::Minimal)
            .env("LD_PRELOAD", "/tmp/evil.so")
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ForbiddenEnvVar("LD_PRELOAD".into()));
    }

    #[test]
    fn relative_work_dir_rejected() {
        let err = SandboxConfigBuilder::new(SecurityLevel::Minimal)
            .work_dir("relative/path")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::RelativeWorkDir(_)));
    }

    #[test]
    fn seccomp_profile_conflict_rejected() {
        let mut profile = SeccompProfile::default();
        profile.allowed.insert("ptrace".into());
        let err = SandboxConfigBuilder::new(SecurityLevel::Standard)
            .seccomp_profile(profile)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::ConflictingSyscall("ptrace".into()));
    }

    #[test]
    fn default_lists_do_not_overlap() {
        SeccompProfile::default().validate().unwrap();
    }

    #[test]
    fn effective_allowed_excludes_denied() {
        let mut profile = SeccompProfile::default();
        profile.denied.insert("write".into());
        // validate() would reject this; effective_allowed() is the backstop.
        assert!(!profile.effective_allowed().any(|s| s == "write"));
        assert!(profile.effective_allowed().any(|s| s == "read"));
    }

    #[test]
    fn environment_is_deterministically_ordered() {
        let config = SandboxConfigBuilder::new(SecurityLevel::Minimal)
            .env("Z", "1")
            .env("A", "2")
            .build()
            .unwrap();
        let keys: Vec<&str> = config.environment().keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["A", "Z"]);
    }

    #[test]
    fn wasm_builder_validates_limits() {
        assert!(
            WasmSandboxConfigBuilder::new()
                .fuel(0)
                .build()
                .is_err()
        );
        assert!(
            WasmSandboxConfigBuilder::new()
                .memory_limit(0)
                .build()
                .is_err()
        );
        let config = WasmSandboxConfigBuilder::new()
            .fuel(1000)
            .allow_import("env.log")
            .build()
            .unwrap();
        assert!(config.import_allowed("env", "log"));
        assert!(!config.import_allowed("env", "spawn"));
    }

    #[test]
    fn wasm_import_matching_bare_and_qualified() {
        let config = WasmSandboxConfigBuilder::new()
            .allow_import("log")
            .allow_import("wasi.clock")
            .build()
            .unwrap();
        assert!(config.import_allowed("env", "log"));
        assert!(config.import_allowed("wasi", "clock"));
        assert!(!config.import_allowed("env", "clock"));
    }
}
