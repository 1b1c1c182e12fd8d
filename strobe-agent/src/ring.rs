//! Trace ring - producer and consumer over one shared region.
//!
//! # Architecture
//!
//! The ring is a single anonymous mapping laid out per `strobe-wire`:
//! a 128-byte header followed by 16384 fixed-size entries. Hook callbacks
//! are the producers; the drain loop is the only consumer.
//!
//! - Producers claim slots with an atomic fetch-add on `write_idx` and
//!   then write the record fields. There is no completion marker: the
//!   drain interval (10ms) dwarfs a record write, so every slot inside
//!   the consumed window is fully written by the time it is read.
//! - The consumer snapshots `write_idx`, clamps to one capacity window
//!   on overflow (counting the loss), copies the window, and advances
//!   `read_idx` to the snapshot.
//!
//! Producers and the consumer never block, and the consumer never writes
//! producer-owned fields.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use memmap2::MmapMut;
use strobe_wire::{
    MAX_FAST_WATCHES, RING_CAPACITY, RING_HEADER_SIZE, RING_MASK, RING_REGION_SIZE,
    RingEntry, RingHeader, SAMPLE_INTERVAL_MAX,
};

/// Offsets of the atomic header fields, kept in sync with `RingHeader`.
const WRITE_IDX_OFFSET: usize = 0;
const READ_IDX_OFFSET: usize = 4;
const OVERFLOW_COUNT_OFFSET: usize = 8;
const SAMPLE_INTERVAL_OFFSET: usize = 12;
const GLOBAL_COUNTER_OFFSET: usize = 16;
const WATCH_COUNT_OFFSET: usize = 24;

/// The mapped ring region. Shared between the producer handles cloned into
/// hook callbacks and the single drainer on the agent thread.
pub struct RingShared {
    mmap: MmapMut,
}

// SAFETY: all cross-thread fields are accessed through atomics; entry slots
// are plain data raced only within the documented visibility window.
unsafe impl Send for RingShared {}
unsafe impl Sync for RingShared {}

impl RingShared {
    pub fn new() -> io::Result<Arc<Self>> {
        // map_anon returns zeroed pages, which is exactly the initial
        // header state: indices 0, interval 0 (bumped to 1 below).
        let mmap = MmapMut::map_anon(RING_REGION_SIZE)?;
        let shared = Arc::new(Self { mmap });
        shared.u32_at(SAMPLE_INTERVAL_OFFSET).store(1, Ordering::Relaxed);
        Ok(shared)
    }

    fn base(&self) -> *mut u8 {
        self.mmap.as_ptr() as *mut u8
    }

    fn u32_at(&self, offset: usize) -> &AtomicU32 {
        // SAFETY: offset is a const within the header, 4-aligned by layout.
        unsafe { AtomicU32::from_ptr(self.base().add(offset) as *mut u32) }
    }

    fn entry_ptr(&self, slot: u32) -> *mut RingEntry {
        debug_assert!(slot < RING_CAPACITY);
        unsafe {
            self.base()
                .add(RING_HEADER_SIZE + slot as usize * std::mem::size_of::<RingEntry>())
                as *mut RingEntry
        }
    }

    /// Snapshot of the whole header (drain-side diagnostics and tests).
    pub fn header(&self) -> RingHeader {
        unsafe { std::ptr::read_volatile(self.base() as *const RingHeader) }
    }

    pub fn sample_interval(&self) -> u32 {
        self.u32_at(SAMPLE_INTERVAL_OFFSET).load(Ordering::Relaxed)
    }

    /// Publish a new global sampling interval. Clamped to [1, 256];
    /// a single u32 store, relaxed snapshots on the reader side.
    pub fn set_sample_interval(&self, interval: u32) {
        let clamped = interval.clamp(1, SAMPLE_INTERVAL_MAX);
        self.u32_at(SAMPLE_INTERVAL_OFFSET)
            .store(clamped, Ordering::Relaxed);
    }

    /// Publish the fast-path watch table. Slots first, count last with
    /// release ordering so callbacks never see a half-written slot.
    pub fn publish_watch_table(&self, watches: &[FastWatchSlot]) {
        debug_assert!(watches.len() <= MAX_FAST_WATCHES);
        let header = self.base() as *mut RingHeader;
        unsafe {
            self.u32_at(WATCH_COUNT_OFFSET).store(0, Ordering::Release);
            for slot in 0..MAX_FAST_WATCHES {
                let w = watches.get(slot).copied().unwrap_or_default();
                std::ptr::write_volatile(&mut (*header).watch_addrs[slot], w.address);
                std::ptr::write_volatile(&mut (*header).watch_sizes[slot], w.size);
                std::ptr::write_volatile(&mut (*header).watch_deref_depths[slot], w.deref_depth);
                std::ptr::write_volatile(&mut (*header).watch_deref_offsets[slot], w.deref_offset);
            }
        }
        self.u32_at(WATCH_COUNT_OFFSET)
            .store(watches.len() as u32, Ordering::Release);
    }

    pub fn overflow_count(&self) -> u32 {
        self.u32_at(OVERFLOW_COUNT_OFFSET).load(Ordering::Relaxed)
    }
}

/// One fast-path watch as published into the header.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastWatchSlot {
    pub address: u64,
    pub size: u8,
    pub deref_depth: u8,
    pub deref_offset: u64,
}

/// Producer handle for hook callbacks. Cheap to clone; wait-free.
#[derive(Clone)]
pub struct RingProducer {
    shared: Arc<RingShared>,
}

/// Outcome of the light-hook sampling gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleGate {
    /// Record the call; `sampled` reports whether the interval was active.
    Record { sampled: bool },
    /// Drop the call without claiming a slot.
    Skip,
}

impl RingProducer {
    pub fn new(shared: Arc<RingShared>) -> Self {
        Self { shared }
    }

    pub fn shared(&self) -> &Arc<RingShared> {
        &self.shared
    }

    /// Light-hook entry gate: with an interval above 1, keep one call in
    /// `interval` using the shared global counter.
    #[inline]
    pub fn sample_gate(&self) -> SampleGate {
        let interval = self.shared.sample_interval();
        if interval <= 1 {
            return SampleGate::Record { sampled: false };
        }
        let count = self
            .shared
            .u32_at(GLOBAL_COUNTER_OFFSET)
            .fetch_add(1, Ordering::Relaxed);
        if count % interval != 0 {
            SampleGate::Skip
        } else {
            SampleGate::Record { sampled: true }
        }
    }

    /// Claim the next slot and write the record.
    #[inline]
    pub fn enqueue(&self, entry: &RingEntry) {
        let idx = self
            .shared
            .u32_at(WRITE_IDX_OFFSET)
            .fetch_add(1, Ordering::AcqRel);
        let slot = idx & RING_MASK;
        unsafe {
            std::ptr::write_volatile(self.shared.entry_ptr(slot), *entry);
        }
    }

    /// Read the published fast-path watch table into `values`.
    ///
    /// Per-slot semantics: depth 0 reads the configured address directly;
    /// depth 1 reads a pointer there and then `pointer + offset`. Null or
    /// misaligned effective addresses store 0. Returns the slot count.
    ///
    /// Runs inside hook callbacks: raw reads only, no allocation.
    #[inline]
    pub fn sample_watches(&self, values: &mut [u64; MAX_FAST_WATCHES]) -> u8 {
        let header = self.shared.base() as *const RingHeader;
        let count = self
            .shared
            .u32_at(WATCH_COUNT_OFFSET)
            .load(Ordering::Acquire)
            .min(MAX_FAST_WATCHES as u32);
        for slot in 0..MAX_FAST_WATCHES {
            values[slot] = 0;
        }
        for slot in 0..count as usize {
            let (addr, size, depth, offset) = unsafe {
                (
                    std::ptr::read_volatile(&(*header).watch_addrs[slot]),
                    std::ptr::read_volatile(&(*header).watch_sizes[slot]),
                    std::ptr::read_volatile(&(*header).watch_deref_depths[slot]),
                    std::ptr::read_volatile(&(*header).watch_deref_offsets[slot]),
                )
            };
            values[slot] = read_watch_value(addr, size, depth, offset);
        }
        count as u8
    }
}

/// Fast-path scalar read with null and natural-alignment checks.
#[inline]
fn read_watch_value(addr: u64, size: u8, deref_depth: u8, deref_offset: u64) -> u64 {
    let effective = if deref_depth == 0 {
        addr
    } else {
        if addr == 0 || addr % std::mem::size_of::<u64>() as u64 != 0 {
            return 0;
        }
        let pointer = unsafe { std::ptr::read_volatile(addr as *const u64) };
        if pointer == 0 {
            return 0;
        }
        pointer.wrapping_add(deref_offset)
    };
    if effective == 0 || effective % size.max(1) as u64 != 0 {
        return 0;
    }
    unsafe {
        match size {
            1 => std::ptr::read_volatile(effective as *const u8) as u64,
            2 => std::ptr::read_volatile(effective as *const u16) as u64,
            4 => std::ptr::read_volatile(effective as *const u32) as u64,
            8 => std::ptr::read_volatile(effective as *const u64),
            _ => 0,
        }
    }
}

/// Counters for the single consumer.
#[derive(Debug, Default, Clone)]
pub struct DrainStats {
    pub batches: u64,
    pub entries_drained: u64,
    pub entries_lost: u64,
}

/// One drained window, in producer commit order.
pub struct DrainBatch {
    pub entries: Vec<RingEntry>,
    /// Entries overwritten before this drain could observe them.
    pub lost: u32,
}

/// The single consumer. Owns `read_idx`; never blocks.
pub struct RingDrainer {
    shared: Arc<RingShared>,
    stats: DrainStats,
}

impl RingDrainer {
    pub fn new(shared: Arc<RingShared>) -> Self {
        Self {
            shared,
            stats: DrainStats::default(),
        }
    }

    pub fn stats(&self) -> &DrainStats {
        &self.stats
    }

    /// Drain everything committed since the previous batch.
    ///
    /// Overflow clamping: when more than one capacity of entries arrived,
    /// resume at the newest window and count the loss. Remaining entries
    /// keep producer order.
    pub fn drain(&mut self) -> DrainBatch {
        let write_idx = self.shared.u32_at(WRITE_IDX_OFFSET).load(Ordering::Acquire);
        let read_idx = self.shared.u32_at(READ_IDX_OFFSET).load(Ordering::Relaxed);

        let pending = write_idx.wrapping_sub(read_idx);
        let (start, count, lost) = if pending > RING_CAPACITY {
            let lost = pending - RING_CAPACITY;
            (write_idx.wrapping_sub(RING_CAPACITY), RING_CAPACITY, lost)
        } else {
            (read_idx, pending, 0)
        };

        if lost > 0 {
            let overflow = self.shared.u32_at(OVERFLOW_COUNT_OFFSET);
            overflow.store(overflow.load(Ordering::Relaxed).wrapping_add(lost), Ordering::Relaxed);
            self.stats.entries_lost += lost as u64;
        }

        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count {
            let slot = start.wrapping_add(i) & RING_MASK;
            entries.push(unsafe { std::ptr::read_volatile(self.shared.entry_ptr(slot)) });
        }

        self.shared
            .u32_at(READ_IDX_OFFSET)
            .store(write_idx, Ordering::Relaxed);

        self.stats.batches += 1;
        self.stats.entries_drained += entries.len() as u64;

        DrainBatch { entries, lost }
    }
}
