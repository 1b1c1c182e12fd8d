//! Crash capture: turns a process exception into one last `crash` event
//! before control returns to the OS default handler.
//!
//! Runs on the crashing thread inside the framework's exception callback.
//! A short sleep gives the RPC channel time to deliver; nothing here may
//! assume the process survives.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::framework::{Backtracer, MemoryAccess, Transport};
use crate::protocol::{AgentMessage, FrameInfo, TraceEvent, format_hex};

const CRASH_FLUSH_SLEEP: Duration = Duration::from_millis(100);
const CRASH_FRAMES: usize = 32;
const FRAME_WINDOW_BEFORE: u64 = 512;
const FRAME_WINDOW_AFTER: u64 = 128;

/// Exception context as delivered by the framework's process-wide handler.
#[derive(Debug, Clone)]
pub struct ExceptionInfo {
    /// Signal name, e.g. "SIGSEGV".
    pub signal: String,
    pub fault_address: u64,
    pub thread_id: u32,
    /// Register values in this architecture's canonical order.
    pub registers: Vec<u64>,
    pub frame_pointer: u64,
    /// "read" / "write" / "execute" when the signal exposes it.
    pub memory_access: Option<String>,
}

/// Canonical register order for the crash dump.
#[cfg(target_arch = "x86_64")]
pub fn register_names() -> &'static [&'static str] {
    &[
        "rax", "rbx", "rcx", "rdx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15", "rip",
    ]
}

#[cfg(target_arch = "aarch64")]
pub fn register_names() -> &'static [&'static str] {
    &[
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "fp", "lr", "sp", "pc",
    ]
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn register_names() -> &'static [&'static str] {
    &[]
}

fn register_dump(values: &[u64]) -> BTreeMap<String, String> {
    register_names()
        .iter()
        .zip(values)
        .map(|(name, value)| (name.to_string(), format_hex(*value)))
        .collect()
}

/// Assemble and post the crash event, sleep for delivery, then return so
/// the framework can hand the signal back to the default handler.
pub fn handle_exception(
    info: &ExceptionInfo,
    backtracer: &dyn Backtracer,
    mem: &dyn MemoryAccess,
    transport: &dyn Transport,
) {
    std::thread::sleep(CRASH_FLUSH_SLEEP);

    let backtrace = backtracer
        .capture(CRASH_FRAMES)
        .into_iter()
        .map(|f| FrameInfo {
            address: format_hex(f.address),
            symbol: f.symbol,
        })
        .collect();

    let (frame_memory, frame_base) = capture_frame(mem, info.frame_pointer);

    transport.post(
        AgentMessage::Events {
            events: vec![TraceEvent::Crash {
                signal: info.signal.clone(),
                fault_address: format_hex(info.fault_address),
                registers: register_dump(&info.registers),
                backtrace,
                frame_memory,
                frame_base,
                memory_access: info.memory_access.clone(),
            }],
        }
        .to_value(),
    );
}

fn capture_frame(mem: &dyn MemoryAccess, fp: u64) -> (String, String) {
    if fp == 0 {
        return (String::new(), String::new());
    }
    let start = fp.saturating_sub(FRAME_WINDOW_BEFORE);
    let len = (fp - start + FRAME_WINDOW_AFTER) as usize;
    let mut buf = vec![0u8; len];
    if mem.read(start, &mut buf).is_err() {
        return (String::new(), format_hex(fp));
    }
    let hex: String = buf.iter().map(|b| format!("{b:02x}")).collect();
    (hex, format_hex(fp))
}
