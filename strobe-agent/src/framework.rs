//! Seams to the dynamic instrumentation framework that injects the agent.
//!
//! The framework owns function interception, symbol resolution, backtraces,
//! and the RPC channel back to the daemon. The agent only ever sees these
//! traits; production wires them to the framework's C API, tests wire them
//! to in-process fakes. Memory range queries and thread enumeration have
//! first-party implementations because the agent shares an address space
//! with the target.

use std::sync::Mutex;

use crate::error::{AttachError, MemoryError};

/// Per-invocation context handed to hook callbacks by the framework.
///
/// The framework guarantees a stable `thread_id` and call `depth` per
/// invocation; `retval` is only meaningful on exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct Invocation {
    pub user_data: u64,
    pub thread_id: u32,
    pub depth: u32,
    pub arg0: u64,
    pub arg1: u64,
    pub retval: u64,
    /// Frame pointer at the interception site; 0 when unavailable.
    pub frame_pointer: u64,
}

/// Opaque handle to an installed entry/exit listener.
pub type ListenerId = u64;

/// Function interception at runtime code addresses.
pub trait Interceptor: Send + Sync {
    fn attach(&self, address: u64, user_data: u64) -> Result<ListenerId, AttachError>;
    fn detach(&self, listener: ListenerId);
}

/// Typed access to target memory. `read`/`write` must fail, never fault,
/// on bad addresses.
pub trait MemoryAccess: Send + Sync {
    fn is_readable(&self, addr: u64, len: usize) -> bool;
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError>;
    fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError>;
}

/// Thread enumeration for the drain-side name cache.
pub trait ThreadRegistry: Send + Sync {
    fn enumerate(&self) -> Vec<(u32, Option<String>)>;
}

/// One backtrace frame, symbolized when the framework can.
#[derive(Debug, Clone)]
pub struct Frame {
    pub address: u64,
    pub symbol: Option<String>,
}

/// Backtrace capture on the current thread.
pub trait Backtracer: Send + Sync {
    fn capture(&self, max_frames: usize) -> Vec<Frame>;
}

/// Backtracer for frameworks without unwind support.
pub struct NullBacktracer;

impl Backtracer for NullBacktracer {
    fn capture(&self, _max_frames: usize) -> Vec<Frame> {
        Vec::new()
    }
}

/// Runtime layout of the main module, for ASLR slide computation.
pub trait ModuleMap: Send + Sync {
    fn main_module_base(&self) -> u64;
}

/// Export/symbol lookup in the target process.
pub trait SymbolResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<u64>;
}

/// Host-callable expression environment. Native targets get a limited
/// evaluator; interpreted runtimes expose full locals/globals.
pub trait ExprEvaluator: Send + Sync {
    fn eval(&self, expr: &str) -> Result<serde_json::Value, String>;
}

/// Evaluator for targets with no expression environment.
pub struct NullEvaluator;

impl ExprEvaluator for NullEvaluator {
    fn eval(&self, expr: &str) -> Result<serde_json::Value, String> {
        Err(format!("no expression environment for {expr:?}"))
    }
}

/// Message channel back to the daemon.
pub trait Transport: Send + Sync {
    fn post(&self, message: serde_json::Value);
}

/// Transport that collects posted messages in memory. Used by embedders
/// without an RPC channel and throughout the test suite.
#[derive(Default)]
pub struct CollectingTransport {
    messages: Mutex<Vec<serde_json::Value>>,
}

impl CollectingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<serde_json::Value> {
        std::mem::take(&mut self.messages.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn snapshot(&self) -> Vec<serde_json::Value> {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Transport for CollectingTransport {
    fn post(&self, message: serde_json::Value) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
    }
}

/// In-process memory access backed by the OS mapping table.
///
/// Readable ranges are cached from `/proc/self/maps` and refreshed on a
/// miss; the target rarely unmaps code or data mid-session, so a stale
/// positive is the framework's race to lose, not ours.
pub struct ProcessMemory {
    ranges: Mutex<Vec<MappedRange>>,
}

#[derive(Debug, Clone, Copy)]
struct MappedRange {
    start: u64,
    end: u64,
    readable: bool,
    writable: bool,
}

impl ProcessMemory {
    pub fn new() -> Self {
        Self {
            ranges: Mutex::new(load_ranges()),
        }
    }

    fn query(&self, addr: u64, len: usize, write: bool) -> bool {
        let end = match addr.checked_add(len as u64) {
            Some(end) => end,
            None => return false,
        };
        let mut ranges = self.ranges.lock().unwrap_or_else(|e| e.into_inner());
        if !covered(&ranges, addr, end, write) {
            *ranges = load_ranges();
        }
        covered(&ranges, addr, end, write)
    }
}

impl Default for ProcessMemory {
    fn default() -> Self {
        Self::new()
    }
}

fn covered(ranges: &[MappedRange], start: u64, end: u64, write: bool) -> bool {
    ranges.iter().any(|r| {
        r.start <= start && end <= r.end && r.readable && (!write || r.writable)
    })
}

#[cfg(target_os = "linux")]
fn load_ranges() -> Vec<MappedRange> {
    use procfs::process::{MMPermissions, Process};
    let maps = match Process::myself().and_then(|p| p.maps()) {
        Ok(maps) => maps,
        Err(err) => {
            log::warn!("failed to read /proc/self/maps: {err}");
            return Vec::new();
        }
    };
    maps.into_iter()
        .map(|m| MappedRange {
            start: m.address.0,
            end: m.address.1,
            readable: m.perms.contains(MMPermissions::READ),
            writable: m.perms.contains(MMPermissions::WRITE),
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn load_ranges() -> Vec<MappedRange> {
    // On macOS range queries come from the framework; without them we have
    // no safe first-party answer, so refuse everything.
    Vec::new()
}

impl MemoryAccess for ProcessMemory {
    fn is_readable(&self, addr: u64, len: usize) -> bool {
        addr != 0 && self.query(addr, len, false)
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        if !self.is_readable(addr, buf.len()) {
            return Err(MemoryError::AddressNotReadable(addr));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        if addr == 0 || !self.query(addr, data.len(), true) {
            return Err(MemoryError::AddressNotReadable(addr));
        }
        // Natural-size aligned writes go out as one store; anything else
        // is a plain byte copy with no atomicity promise.
        unsafe {
            match data.len() {
                1 => std::ptr::write_volatile(addr as *mut u8, data[0]),
                2 if addr % 2 == 0 => std::ptr::write_volatile(
                    addr as *mut u16,
                    u16::from_le_bytes(data.try_into().unwrap()),
                ),
                4 if addr % 4 == 0 => std::ptr::write_volatile(
                    addr as *mut u32,
                    u32::from_le_bytes(data.try_into().unwrap()),
                ),
                8 if addr % 8 == 0 => std::ptr::write_volatile(
                    addr as *mut u64,
                    u64::from_le_bytes(data.try_into().unwrap()),
                ),
                _ => std::ptr::copy_nonoverlapping(data.as_ptr(), addr as *mut u8, data.len()),
            }
        }
        Ok(())
    }
}

/// Thread enumeration from `/proc/self/task`.
pub struct ProcThreads;

impl ThreadRegistry for ProcThreads {
    #[cfg(target_os = "linux")]
    fn enumerate(&self) -> Vec<(u32, Option<String>)> {
        let entries = match std::fs::read_dir("/proc/self/task") {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let tid: u32 = e.file_name().to_str()?.parse().ok()?;
                let name = std::fs::read_to_string(e.path().join("comm"))
                    .ok()
                    .map(|s| s.trim_end().to_string())
                    .filter(|s| !s.is_empty());
                Some((tid, name))
            })
            .collect()
    }

    #[cfg(not(target_os = "linux"))]
    fn enumerate(&self) -> Vec<(u32, Option<String>)> {
        Vec::new()
    }
}
