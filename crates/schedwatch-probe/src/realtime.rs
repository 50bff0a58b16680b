//! Process setup for prompt scheduling.
//!
//! Provides the platform-specific steps that let the probe itself get CPU
//! time ahead of ordinary workloads:
//! - Memory locking (mlockall) to prevent page faults
//! - Real-time round-robin scheduling at maximum priority
//! - Moving the process to the root cgroup, where RT runtime is granted
//!
//! None of these are fatal. A probe without them still runs, it just
//! reports more false positives.

use schedwatch_common::config::{CgroupMode, RealtimeConfig};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// Default cgroup filesystem mount point.
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Result of process setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeStatus {
    /// Whether memory was locked successfully.
    pub memory_locked: bool,
    /// Whether `SCHED_RR` was applied.
    pub rr_scheduler: bool,
    /// Root cgroup the process was moved into, if any.
    pub cgroup: Option<CgroupVersion>,
}

/// Cgroup hierarchy version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupVersion {
    /// Legacy `cpu` controller hierarchy.
    V1,
    /// Unified hierarchy.
    V2,
}

/// Apply memory locking, cgroup placement and RR scheduling.
///
/// With [`CgroupMode::Auto`] the RR scheduler is tried silently first;
/// only when that fails is the process moved to the root cgroup and the
/// scheduler retried with warnings enabled.
pub fn apply_process_setup(config: &RealtimeConfig) -> RealtimeStatus {
    let mut status = RealtimeStatus::default();

    if config.lock_memory {
        status.memory_locked = lock_memory();
    }

    if config.root_cgroup == CgroupMode::On {
        status.cgroup = move_to_root_cgroup(Path::new(CGROUP_ROOT), std::process::id());
    }

    if config.set_priority {
        let silent = config.root_cgroup == CgroupMode::Auto;
        status.rr_scheduler = set_rr_scheduler(silent);

        if !status.rr_scheduler && config.root_cgroup == CgroupMode::Auto {
            status.cgroup = move_to_root_cgroup(Path::new(CGROUP_ROOT), std::process::id());
            status.rr_scheduler = set_rr_scheduler(false);
        }
    }

    info!(?status, "Process setup complete");
    status
}

/// Raise `RLIMIT_MEMLOCK` and lock all current and future pages.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn lock_memory() -> bool {
    use nix::sys::mman::{mlockall, MlockAllFlags};

    let rlimit = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };

    // SAFETY: setrlimit reads a valid rlimit struct
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } == -1 {
        warn!("Could not increase RLIMIT_MEMLOCK, not locking memory");
        return false;
    }

    debug!("Locking memory pages with mlockall");
    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            info!("Memory locked successfully");
            true
        }
        Err(e) => {
            warn!("Could not mlockall: {e}");
            false
        }
    }
}

/// Memory locking is unsupported here; always `false`.
#[cfg(not(target_os = "linux"))]
pub fn lock_memory() -> bool {
    warn!("mlockall not available on this platform");
    false
}

/// Switch to `SCHED_RR` at the maximum RR priority.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn set_rr_scheduler(silent: bool) -> bool {
    // SAFETY: sched_get_priority_max has no side effects
    let max_prio = unsafe { libc::sched_get_priority_max(libc::SCHED_RR) };
    if max_prio == -1 {
        if !silent {
            let err = std::io::Error::last_os_error();
            warn!("Can't get maximum SCHED_RR priority: {err}");
        }
        return false;
    }

    let param = libc::sched_param {
        sched_priority: max_prio,
    };

    // SAFETY: sched_setscheduler is safe when called with valid parameters
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_RR, &param) } == -1 {
        if !silent {
            let err = std::io::Error::last_os_error();
            warn!("Can't set SCHED_RR: {err}");
        }
        return false;
    }

    info!(priority = max_prio, "SCHED_RR scheduler configured");
    true
}

/// Real-time scheduling is unsupported here; always `false`.
#[cfg(not(target_os = "linux"))]
pub fn set_rr_scheduler(silent: bool) -> bool {
    if !silent {
        warn!("Real-time scheduling not available on this platform");
    }
    false
}

/// Write `pid` into the root cgroup's task list under `root`.
///
/// Prefers the v1 `cpu` hierarchy when it exposes `cpu.rt_runtime_us`,
/// otherwise the v2 `cgroup.procs`. Returns the hierarchy written to.
pub fn move_to_root_cgroup(root: &Path, pid: u32) -> Option<CgroupVersion> {
    let (version, tasks) = if root.join("cpu/cpu.rt_runtime_us").exists() {
        debug!("Moving main pid to cgroup v1 root cgroup");
        (CgroupVersion::V1, root.join("cpu/tasks"))
    } else if root.join("cgroup.procs").exists() {
        debug!("Moving main pid to cgroup v2 root cgroup");
        (CgroupVersion::V2, root.join("cgroup.procs"))
    } else {
        debug!(
            "cpu.rt_runtime_us or cgroup.procs doesn't exist -> \
             system without cgroup or with disabled CONFIG_RT_GROUP_SCHED"
        );
        return None;
    };

    let mut file = match OpenOptions::new().write(true).open(&tasks) {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %tasks.display(), "Can't open cgroups tasks file for writing: {e}");
            return None;
        }
    };

    if let Err(e) = writeln!(file, "{pid}") {
        warn!("Can't write pid into cgroups tasks file: {e}");
        return None;
    }

    Some(version)
}
