//! Platform adapter: monotonic timestamps, the tick→nanosecond ratio, and
//! the host `write` entrypoint used for output capture.
//!
//! Timestamps are opaque ticks taken in the hook fast path; the drain loop
//! multiplies by the ratio exactly once per emitted event. On Linux the
//! monotonic clock already reports nanoseconds so the ratio is 1.0; on macOS
//! the ratio comes from the mach timebase and falls back to 1.0 if the
//! timebase read fails.

use std::ffi::CStr;

use crate::error::PlatformError;

/// Signature of the host `write(2)` entrypoint.
pub type WriteFn =
    unsafe extern "C" fn(libc::c_int, *const libc::c_void, libc::size_t) -> libc::ssize_t;

/// Resolved platform primitives. Built once at agent load.
pub struct Platform {
    ratio: f64,
    write_fn: Option<WriteFn>,
}

impl Platform {
    /// Resolve the platform. Fatal if the OS is unsupported or the
    /// monotonic clock cannot be resolved; a missing `write` symbol only
    /// disables output capture.
    pub fn init() -> Result<Self, PlatformError> {
        if !cfg!(any(target_os = "linux", target_os = "macos")) {
            return Err(PlatformError::UnavailablePlatform(std::env::consts::OS));
        }

        if cfg!(target_os = "linux") && resolve_symbol(c"clock_gettime").is_none() {
            return Err(PlatformError::SymbolNotFound("clock_gettime"));
        }

        let write_fn = resolve_symbol(c"write").map(|ptr| {
            // Function pointers round-trip through dlsym addresses.
            unsafe { std::mem::transmute::<*mut libc::c_void, WriteFn>(ptr) }
        });
        if write_fn.is_none() {
            log::warn!("write(2) not resolvable; output capture disabled, tracing continues");
        }

        Ok(Self {
            ratio: ticks_to_ns_ratio(),
            write_fn,
        })
    }

    pub fn ticks_to_ns_ratio(&self) -> f64 {
        self.ratio
    }

    pub fn write_fn(&self) -> Option<WriteFn> {
        self.write_fn
    }
}

fn resolve_symbol(name: &CStr) -> Option<*mut libc::c_void> {
    let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if ptr.is_null() { None } else { Some(ptr) }
}

/// Current monotonic timestamp in opaque ticks.
///
/// Called from hook callbacks: must not allocate or lock.
#[cfg(target_os = "linux")]
#[inline]
pub fn timestamp_ticks() -> u64 {
    use nix::time::{ClockId, clock_gettime};
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64) * 1_000_000_000 + (ts.tv_nsec() as u64),
        Err(_) => 0,
    }
}

#[cfg(target_os = "macos")]
#[inline]
pub fn timestamp_ticks() -> u64 {
    unsafe { libc::mach_absolute_time() }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
#[inline]
pub fn timestamp_ticks() -> u64 {
    0
}

/// Ratio converting ticks to nanoseconds. Computed once at startup.
#[cfg(target_os = "linux")]
fn ticks_to_ns_ratio() -> f64 {
    // CLOCK_MONOTONIC is already nanoseconds.
    1.0
}

#[cfg(target_os = "macos")]
fn ticks_to_ns_ratio() -> f64 {
    let mut info = libc::mach_timebase_info { numer: 0, denom: 0 };
    let rc = unsafe { libc::mach_timebase_info(&mut info) };
    if rc != 0 || info.denom == 0 {
        return 1.0;
    }
    info.numer as f64 / info.denom as f64
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn ticks_to_ns_ratio() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_monotonic() {
        let a = timestamp_ticks();
        let b = timestamp_ticks();
        assert!(b >= a);
    }

    #[test]
    fn platform_resolves() {
        let platform = Platform::init().expect("supported platform");
        assert!(platform.ticks_to_ns_ratio() > 0.0);
        // write(2) is resolvable on every supported libc.
        assert!(platform.write_fn().is_some());
    }
}
