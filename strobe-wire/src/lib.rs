use bytemuck::{Pod, Zeroable};

// =============================================================================
// TRACE RING - Shared Protocol Definitions
// =============================================================================
//
// This defines the memory layout of the lock-free ring buffer that carries
// enter/exit records from hook callbacks (running on arbitrary target-app
// threads) to the drain loop (running on the agent thread).
//
// ARCHITECTURE:
//   - Multiple producers (hook callbacks, wait-free)
//   - Single consumer (the drain loop)
//   - Ordering via an atomic monotonic write index; slot = index & mask
//   - No per-slot completion marker: the 10ms drain interval is orders of
//     magnitude longer than a record write, so the consumer always observes
//     fully written slots within the live window
//
// MEMORY LAYOUT:
//   [0..128]   RingHeader  - indices, sampling knobs, fast-path watch table
//   [128..]    RingEntry × RING_CAPACITY (80 bytes each)
//
// The layout is shared with native-callable code and must stay byte-stable.
// =============================================================================

/// Ring capacity in entries. Must be a power of 2 for efficient masking.
pub const RING_CAPACITY: u32 = 16384;

/// Bit mask for wrapping the write index (RING_CAPACITY - 1).
pub const RING_MASK: u32 = RING_CAPACITY - 1;

/// Header size in bytes; entries start at this offset.
pub const RING_HEADER_SIZE: usize = 128;

/// Size of one ring entry in bytes.
pub const RING_ENTRY_SIZE: usize = 80;

/// Total size of the shared region.
pub const RING_REGION_SIZE: usize = RING_HEADER_SIZE + RING_CAPACITY as usize * RING_ENTRY_SIZE;

/// Number of fast-path watch slots in the header.
pub const MAX_FAST_WATCHES: usize = 4;

/// Upper bound on the global sampling interval.
pub const SAMPLE_INTERVAL_MAX: u32 = 256;

/// Record kinds stored in `RingEntry::event_type`.
pub mod entry_kind {
    /// Function entry record.
    pub const ENTER: u8 = 0;
    /// Function exit record.
    pub const EXIT: u8 = 1;
}

/// Ring header, 128 bytes.
///
/// Field disciplines:
///   - `write_idx` is advanced only by atomic fetch-add in hook callbacks
///   - `read_idx` is written only by the single drainer
///   - `sample_interval` and the watch table are written by the agent thread
///     with single stores; callbacks take relaxed snapshots
///   - `watch_count` is published last so callbacks never observe a
///     half-written watch slot
///
/// Layout (offsets are part of the wire contract):
///   [0..4]    write_idx           [4..8]    read_idx
///   [8..12]   overflow_count      [12..16]  sample_interval
///   [16..20]  global_counter      [24..28]  watch_count
///   [32..64]  watch_addrs[4]      [64..68]  watch_sizes[4]
///   [68..72]  watch_deref_depths[4]
///   [72..104] watch_deref_offsets[4]
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct RingHeader {
    pub write_idx: u32,
    pub read_idx: u32,
    pub overflow_count: u32,
    pub sample_interval: u32,
    pub global_counter: u32,
    pub _pad0: u32,
    pub watch_count: u32,
    pub _pad1: u32,
    pub watch_addrs: [u64; MAX_FAST_WATCHES],
    pub watch_sizes: [u8; MAX_FAST_WATCHES],
    pub watch_deref_depths: [u8; MAX_FAST_WATCHES],
    pub watch_deref_offsets: [u64; MAX_FAST_WATCHES],
    pub _pad2: [u8; 24],
}

/// One fixed-size trace record, 80 bytes.
///
/// Layout:
///   [0..8]   timestamp    [8..16]  arg0      [16..24] arg1
///   [24..32] retval       [32..36] func_id   [36..40] thread_id
///   [40..44] depth        [44]     event_type
///   [45]     sampled      [46]     watch_entry_count
///   [48..80] watch_values[4]
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct RingEntry {
    pub timestamp: u64,
    pub arg0: u64,
    pub arg1: u64,
    pub retval: u64,
    pub func_id: u32,
    pub thread_id: u32,
    pub depth: u32,
    pub event_type: u8,
    pub sampled: u8,
    pub watch_entry_count: u8,
    pub _pad: u8,
    pub watch_values: [u64; MAX_FAST_WATCHES],
}

impl RingEntry {
    pub const fn zeroed() -> Self {
        Self {
            timestamp: 0,
            arg0: 0,
            arg1: 0,
            retval: 0,
            func_id: 0,
            thread_id: 0,
            depth: 0,
            event_type: entry_kind::ENTER,
            sampled: 0,
            watch_entry_count: 0,
            _pad: 0,
            watch_values: [0; MAX_FAST_WATCHES],
        }
    }
}

// Byte-stable layout: the offsets below are consumed by native-callable code
// and by the daemon's header documentation. A failure here is a wire break.
const _: () = {
    use core::mem::{align_of, offset_of, size_of};

    assert!(size_of::<RingHeader>() == RING_HEADER_SIZE);
    assert!(align_of::<RingHeader>() == 8);
    assert!(offset_of!(RingHeader, write_idx) == 0);
    assert!(offset_of!(RingHeader, read_idx) == 4);
    assert!(offset_of!(RingHeader, overflow_count) == 8);
    assert!(offset_of!(RingHeader, sample_interval) == 12);
    assert!(offset_of!(RingHeader, global_counter) == 16);
    assert!(offset_of!(RingHeader, watch_count) == 24);
    assert!(offset_of!(RingHeader, watch_addrs) == 32);
    assert!(offset_of!(RingHeader, watch_sizes) == 64);
    assert!(offset_of!(RingHeader, watch_deref_depths) == 68);
    assert!(offset_of!(RingHeader, watch_deref_offsets) == 72);

    assert!(size_of::<RingEntry>() == RING_ENTRY_SIZE);
    assert!(offset_of!(RingEntry, timestamp) == 0);
    assert!(offset_of!(RingEntry, arg0) == 8);
    assert!(offset_of!(RingEntry, arg1) == 16);
    assert!(offset_of!(RingEntry, retval) == 24);
    assert!(offset_of!(RingEntry, func_id) == 32);
    assert!(offset_of!(RingEntry, thread_id) == 36);
    assert!(offset_of!(RingEntry, depth) == 40);
    assert!(offset_of!(RingEntry, event_type) == 44);
    assert!(offset_of!(RingEntry, sampled) == 45);
    assert!(offset_of!(RingEntry, watch_entry_count) == 46);
    assert!(offset_of!(RingEntry, watch_values) == 48);

    assert!(RING_CAPACITY.is_power_of_two());
    assert!(RING_MASK == RING_CAPACITY - 1);
};
