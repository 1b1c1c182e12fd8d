//! Output capture: observes the host's write(2) on stdout/stderr and
//! queues the text for the drain loop to ship as events.
//!
//! The write hook runs on arbitrary host threads; it filters, guards
//! against re-entrancy from the agent's own send path, applies the caps,
//! and parks chunks in a queue the agent thread flushes on its tick.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::metrics::Metrics;
use crate::platform;

/// Per-session output cap; one truncation indicator once exceeded.
const SESSION_BYTE_CAP: u64 = 50 * 1024 * 1024;
/// Individual writes above this ship an indicator instead of the payload.
const SINGLE_WRITE_CAP: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub fd: i32,
    pub text: String,
    pub ticks: u64,
}

pub struct OutputCapture {
    reentry: AtomicBool,
    cap_reached: AtomicBool,
    queue: Mutex<VecDeque<OutputChunk>>,
}

impl OutputCapture {
    pub fn new() -> Self {
        Self {
            reentry: AtomicBool::new(false),
            cap_reached: AtomicBool::new(false),
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Mark the agent's own send path so it is not re-captured. The
    /// framework serializes agent callbacks, so one global flag suffices.
    pub fn reentry_guard(&self) -> ReentryGuard<'_> {
        self.reentry.store(true, Ordering::Relaxed);
        ReentryGuard { capture: self }
    }

    /// The write(2) hook body. Returns false when the write was ignored.
    pub fn on_write(&self, fd: i32, data: &[u8], metrics: &Metrics) -> bool {
        if fd != 1 && fd != 2 {
            return false;
        }
        if self.reentry.load(Ordering::Relaxed) {
            return false;
        }
        if self.cap_reached.load(Ordering::Relaxed) {
            return false;
        }

        let total = metrics.add_output_bytes(data.len() as u64);
        let text = if total > SESSION_BYTE_CAP {
            if self.cap_reached.swap(true, Ordering::Relaxed) {
                return false;
            }
            "[output truncated: session byte cap reached]".to_string()
        } else if data.len() > SINGLE_WRITE_CAP {
            format!("[write of {} bytes truncated]", data.len())
        } else {
            String::from_utf8_lossy(data).into_owned()
        };

        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(OutputChunk {
                fd,
                text,
                ticks: platform::timestamp_ticks(),
            });
        true
    }

    /// Drain queued chunks. Called on the agent thread each tick.
    pub fn take(&self) -> Vec<OutputChunk> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    pub fn reset(&self) {
        self.cap_reached.store(false, Ordering::Relaxed);
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ReentryGuard<'a> {
    capture: &'a OutputCapture,
}

impl Drop for ReentryGuard<'_> {
    fn drop(&mut self) {
        self.capture.reentry.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_stdout_and_stderr_are_captured() {
        let capture = OutputCapture::new();
        let metrics = Metrics::new();
        assert!(capture.on_write(1, b"out", &metrics));
        assert!(capture.on_write(2, b"err", &metrics));
        assert!(!capture.on_write(3, b"file", &metrics));

        let chunks = capture.take();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].fd, 1);
        assert_eq!(chunks[0].text, "out");
        assert_eq!(chunks[1].fd, 2);
        assert!(capture.take().is_empty());
    }

    #[test]
    fn reentry_guard_suppresses_own_writes() {
        let capture = OutputCapture::new();
        let metrics = Metrics::new();
        {
            let _guard = capture.reentry_guard();
            assert!(!capture.on_write(1, b"agent send", &metrics));
        }
        assert!(capture.on_write(1, b"host write", &metrics));
    }

    #[test]
    fn oversized_single_write_becomes_indicator() {
        let capture = OutputCapture::new();
        let metrics = Metrics::new();
        let big = vec![b'x'; SINGLE_WRITE_CAP + 1];
        assert!(capture.on_write(1, &big, &metrics));
        let chunks = capture.take();
        assert_eq!(chunks[0].text, format!("[write of {} bytes truncated]", big.len()));
    }

    #[test]
    fn session_cap_emits_one_indicator_then_drops() {
        let capture = OutputCapture::new();
        let metrics = Metrics::new();
        // Pre-load the counter to just under the cap.
        metrics.add_output_bytes(SESSION_BYTE_CAP - 1);

        assert!(capture.on_write(1, b"ab", &metrics));
        assert!(!capture.on_write(1, b"cd", &metrics));
        assert!(!capture.on_write(2, b"ef", &metrics));

        let chunks = capture.take();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("session byte cap"));
    }
}
