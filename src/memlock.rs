//! Keeping secrets out of swap.
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLock {
    /// All current and future pages of the process are locked.
    Locked,
    /// Locking failed; secrets rely on being zeroed when dropped.
    Fallback,
}

/// Lock the memory of this process, for its whole lifetime.
///
/// Failing to lock is not fatal: the run goes on with reduced assurance.
pub fn lock_memory() -> MemoryLock {
    match mlockall() {
        Ok(()) => {
            debug!("process memory locked");
            MemoryLock::Locked
        }
        Err(e) => {
            warn!("locking memory failed ({e}), secrets may be swapped out; continuing with reduced assurance");
            MemoryLock::Fallback
        }
    }
}

#[cfg(unix)]
fn mlockall() -> std::io::Result<()> {
    // SAFETY: mlockall takes no pointers and only changes paging of this process.
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn mlockall() -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "memory locking is not available on this platform",
    ))
}
