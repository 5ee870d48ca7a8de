//! OS-level isolation backends.
//!
//! [`ProcessBackend`] runs targets as plain child processes under rlimits
//! (plus seccomp where enabled); [`NamespaceBackend`] adds fresh namespaces,
//! a pivoted root, and cgroup v2 limits. Both implement the
//! [`sandbox::IsolationBackend`] contract.

mod cgroup;
mod namespace;
mod probe;
mod process;
mod rlimits;
mod seccomp;
mod workspace;

pub use cgroup::CgroupHandle;
pub use namespace::NamespaceBackend;
pub use probe::probe_capabilities;
pub use process::ProcessBackend;
pub use seccomp::SyscallFilter;
