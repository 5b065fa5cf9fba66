//! Memory protection for session key material
//!
//! 1. **Core dump prevention**: `setrlimit(RLIMIT_CORE, 0)` so a crash never
//!    writes unlocked keys to disk.
//!
//! 2. **Secret buffers**: key bytes live in an `mlock`ed heap buffer that is
//!    overwritten with random bytes and then zeroed when wiped or dropped.
//!
//! Both hardening measures are best-effort: containers and unprivileged users
//! may not permit them, so failures are logged and never fatal.

use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicBool, Ordering};
use zeroize::Zeroize;

static CORE_DUMPS_DISABLED: AtomicBool = AtomicBool::new(false);

/// Disable core dumps for the current process.
///
/// Returns `true` if core dumps are disabled (including by an earlier call).
pub fn disable_core_dumps() -> bool {
    if CORE_DUMPS_DISABLED.swap(true, Ordering::SeqCst) {
        return true;
    }

    #[cfg(unix)]
    {
        let ok = unix::disable_core_dumps_impl();
        if !ok {
            CORE_DUMPS_DISABLED.store(false, Ordering::SeqCst);
        }
        ok
    }

    #[cfg(not(unix))]
    {
        log::warn!("core dump prevention not supported on this platform");
        CORE_DUMPS_DISABLED.store(false, Ordering::SeqCst);
        false
    }
}

/// Heap buffer for private key bytes.
///
/// `wipe()` overwrites the contents with fresh random bytes and then zeroes
/// them; `Drop` does the same and releases the memory lock.
pub struct SecretBuffer {
    data: Vec<u8>,
    locked: bool,
}

impl SecretBuffer {
    /// Copy `bytes` into a new locked buffer.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let data = bytes.to_vec();
        let locked = if data.is_empty() {
            true
        } else {
            // SAFETY: `data` is a live allocation of exactly `data.len()` bytes
            // and is unlocked in `Drop` before being freed.
            unsafe { mlock(data.as_ptr(), data.len()) }
        };
        if !locked {
            log::debug!("mlock failed for {} byte secret buffer", data.len());
        }
        Self { data, locked }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether the memory is actually locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Overwrite with random bytes, then zero. The length is preserved.
    pub fn wipe(&mut self) {
        OsRng.fill_bytes(&mut self.data);
        self.data.as_mut_slice().zeroize();
    }
}

impl Drop for SecretBuffer {
    fn drop(&mut self) {
        self.wipe();
        if self.locked && !self.data.is_empty() {
            // SAFETY: same pointer and length that were passed to `mlock`.
            unsafe {
                munlock(self.data.as_ptr(), self.data.len());
            }
        }
    }
}

/// Lock a memory region so it is never swapped to disk.
///
/// # Safety
///
/// `ptr` must point to a valid allocation of at least `len` bytes.
unsafe fn mlock(ptr: *const u8, len: usize) -> bool {
    #[cfg(unix)]
    {
        unix::mlock_impl(ptr, len)
    }

    #[cfg(not(unix))]
    {
        let _ = (ptr, len);
        false
    }
}

/// # Safety
///
/// `ptr` and `len` must match a previous successful `mlock` call.
unsafe fn munlock(ptr: *const u8, len: usize) -> bool {
    #[cfg(unix)]
    {
        unix::munlock_impl(ptr, len)
    }

    #[cfg(not(unix))]
    {
        let _ = (ptr, len);
        true
    }
}

#[cfg(unix)]
mod unix {
    pub fn disable_core_dumps_impl() -> bool {
        // SAFETY: setrlimit with RLIMIT_CORE=0 is a standard POSIX operation
        unsafe {
            let rlim = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            if libc::setrlimit(libc::RLIMIT_CORE, &rlim) != 0 {
                log::warn!(
                    "failed to disable core dumps: {}",
                    std::io::Error::last_os_error()
                );
                return false;
            }
        }
        true
    }

    pub unsafe fn mlock_impl(ptr: *const u8, len: usize) -> bool {
        libc::mlock(ptr as *const libc::c_void, len) == 0
    }

    pub unsafe fn munlock_impl(ptr: *const u8, len: usize) -> bool {
        libc::munlock(ptr as *const libc::c_void, len) == 0
    }
}
