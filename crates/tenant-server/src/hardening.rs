//! Production hardening: memory pinning and core dump prevention.
//!
//! The master pool credentials, vault keyring, and decrypted tenant
//! connection strings all pass through this process's memory at some point.
//! On Unix, two syscalls reduce how much of that can leak onto disk:
//!
//! 1. **`disable_core_dumps`** — sets `RLIMIT_CORE` to 0, so a crash never
//!    writes a core file containing key material.
//! 2. **`lock_memory`** — calls `mlockall(MCL_CURRENT | MCL_FUTURE)` to pin
//!    all current and future pages, preventing the OS from swapping
//!    sensitive data to disk.
//!
//! Both functions are no-ops on non-Unix platforms.

/// Disable core dumps by setting `RLIMIT_CORE` to 0.
///
/// # Errors
///
/// Returns an error string if the `setrlimit` syscall fails.
#[cfg(unix)]
pub fn disable_core_dumps() -> Result<(), String> {
    // SAFETY: `setrlimit` is a POSIX syscall given a valid `rlimit` struct
    // with both fields zeroed. It only affects the kernel's willingness to
    // write core dumps for this process.
    #[allow(unsafe_code)]
    let result = unsafe {
        let rlim = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
        libc::setrlimit(libc::RLIMIT_CORE, &rlim)
    };

    if result == 0 {
        Ok(())
    } else {
        Err(format!("setrlimit(RLIMIT_CORE, 0) failed with errno {}", std::io::Error::last_os_error()))
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn disable_core_dumps() -> Result<(), String> {
    Ok(())
}

/// Pin all current and future memory pages with `mlockall`.
///
/// Requires `CAP_IPC_LOCK` on Linux or running as root. Set
/// `TENANT_DISABLE_MLOCK=true` to skip this in local development.
///
/// # Errors
///
/// Returns an error string if the `mlockall` syscall fails.
#[cfg(unix)]
pub fn lock_memory() -> Result<(), String> {
    // SAFETY: `mlockall` is a POSIX syscall given well-defined flags. It
    // only instructs the kernel to keep this process's pages resident.
    #[allow(unsafe_code)]
    let result = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };

    if result == 0 {
        Ok(())
    } else {
        Err(format!("mlockall(MCL_CURRENT | MCL_FUTURE) failed with errno {}", std::io::Error::last_os_error()))
    }
}

/// No-op on non-Unix platforms.
#[cfg(not(unix))]
pub fn lock_memory() -> Result<(), String> {
    Ok(())
}
