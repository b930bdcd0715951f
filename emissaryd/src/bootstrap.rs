//! Process hardening applied before any backend touches a PIN or key.
//!
//! Every step is best-effort: failures are logged and the daemon carries on.

/// Disable core dumps and ptrace-style memory reads, then lock memory so PIN
/// buffers are never swapped out.
#[cfg(unix)]
pub fn harden_process() {
    disable_core_dumps();
    set_not_dumpable();
    lock_memory();
}

#[cfg(not(unix))]
pub fn harden_process() {}

#[cfg(unix)]
fn disable_core_dumps() {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: setrlimit reads a fully initialised rlimit struct.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    if ret == 0 {
        tracing::debug!("RLIMIT_CORE set to 0");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!(error = %err, "could not disable core dumps");
    }
}

#[cfg(target_os = "linux")]
fn set_not_dumpable() {
    // SAFETY: PR_SET_DUMPABLE takes plain integer arguments.
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, 0i64, 0i64, 0i64, 0i64) };
    if ret == 0 {
        tracing::debug!("process marked non-dumpable");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!(error = %err, "PR_SET_DUMPABLE failed");
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_not_dumpable() {}

#[cfg(unix)]
fn lock_memory() {
    // SAFETY: mlockall has no memory-safety preconditions.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::info!("memory locked");
    } else {
        // Usually EPERM or ENOMEM without CAP_IPC_LOCK.
        let err = std::io::Error::last_os_error();
        tracing::warn!(error = %err, "mlockall failed, running without locked memory");
    }
}
