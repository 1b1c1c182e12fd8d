//! Drain loop: consumes the trace ring on a timer, rebuilds per-thread
//! call stacks, and assembles typed events for the daemon.
//!
//! Everything here runs on the agent thread. Stacks, the thread-name
//! cache, and the event-id counter are plain owned state; the only shared
//! structure touched is the ring itself.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::{Value, json};
use strobe_wire::{RingEntry, entry_kind};

use crate::framework::{ExprEvaluator, MemoryAccess, ThreadRegistry};
use crate::hooks::HookEngine;
use crate::metrics::Metrics;
use crate::protocol::{EventIdGen, TraceEvent, format_hex};
use crate::ring::RingDrainer;
use crate::sampler::RateTracker;
use crate::serialize::{Serializer, TypeInfo, TypeKind};
use crate::watch::WatchSet;

/// Clear per-thread stacks after this many emitted events, bounding growth
/// when exits are lost to overflow.
const STACK_CLEANUP_EVERY: u64 = 50_000;

struct StackEntry {
    event_id: String,
    depth: u32,
    enter_ns: u64,
}

/// Thread-name cache: the first unknown tid triggers one enumeration;
/// afterwards every lookup is O(1). Names are never invalidated.
pub struct ThreadNameCache {
    names: HashMap<u32, Option<String>>,
}

impl ThreadNameCache {
    pub fn new() -> Self {
        Self {
            names: HashMap::new(),
        }
    }

    pub fn lookup(&mut self, tid: u32, threads: &dyn ThreadRegistry) -> Option<String> {
        if let Some(name) = self.names.get(&tid) {
            return name.clone();
        }
        for (id, name) in threads.enumerate() {
            self.names.entry(id).or_insert(name);
        }
        self.names.entry(tid).or_insert(None).clone()
    }
}

impl Default for ThreadNameCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Ring consumer plus event assembly state.
pub struct EventAssembler {
    drainer: RingDrainer,
    ratio: f64,
    ids: Option<EventIdGen>,
    stacks: HashMap<u32, Vec<StackEntry>>,
    thread_names: ThreadNameCache,
    emitted_at_last_cleanup: u64,
    serialization_depth: u8,
}

/// One drain tick's output.
pub struct DrainOutcome {
    pub events: Vec<TraceEvent>,
    /// Raw entry count before rate gating, fed to the adaptive sampler.
    pub drained: usize,
}

impl EventAssembler {
    pub fn new(drainer: RingDrainer, ratio: f64) -> Self {
        Self {
            drainer,
            ratio,
            ids: None,
            stacks: HashMap::new(),
            thread_names: ThreadNameCache::new(),
            emitted_at_last_cleanup: 0,
            serialization_depth: 0,
        }
    }

    pub fn start_session(&mut self, session_id: &str) {
        self.ids = Some(EventIdGen::new(session_id));
        self.stacks.clear();
        self.emitted_at_last_cleanup = 0;
    }

    pub fn session_id(&self) -> Option<&str> {
        self.ids.as_ref().map(|ids| ids.session_id())
    }

    pub fn set_serialization_depth(&mut self, depth: u8) {
        self.serialization_depth = depth;
    }

    /// Allocate an event id outside the drain path (output capture,
    /// interpreted tracers, poll snapshots share the session counter).
    pub fn next_event_id(&mut self) -> Option<String> {
        self.ids.as_mut().map(|ids| ids.next())
    }

    /// Direct access to the session id source, for batch consumers.
    pub fn ids_mut(&mut self) -> Option<&mut EventIdGen> {
        self.ids.as_mut()
    }

    pub fn ratio(&self) -> f64 {
        self.ratio
    }

    pub fn ticks_to_ns(&self, ticks: u64) -> u64 {
        (ticks as f64 * self.ratio) as u64
    }

    /// Reset to the pre-initialize state. Used by dispose.
    pub fn reset(&mut self) {
        self.ids = None;
        self.stacks.clear();
        self.emitted_at_last_cleanup = 0;
    }

    /// One drain tick: consume the ring and assemble events in slot order.
    #[allow(clippy::too_many_arguments)]
    pub fn tick(
        &mut self,
        engine: &HookEngine,
        watches: &WatchSet,
        tracker: &mut RateTracker,
        evaluator: &dyn ExprEvaluator,
        mem: &dyn MemoryAccess,
        threads: &dyn ThreadRegistry,
        metrics: &Metrics,
        now: Instant,
    ) -> DrainOutcome {
        if self.ids.is_none() {
            return DrainOutcome {
                events: Vec::new(),
                drained: 0,
            };
        }

        let emitted = self.ids.as_ref().map(|i| i.emitted()).unwrap_or(0);
        if emitted - self.emitted_at_last_cleanup >= STACK_CLEANUP_EVERY {
            self.stacks.clear();
            self.emitted_at_last_cleanup = emitted;
        }

        let batch = self.drainer.drain();
        let drained = batch.entries.len();
        metrics.add_drained(drained as u64);
        metrics.add_lost(batch.lost as u64);

        tracker.tick(now);

        let mut events = Vec::with_capacity(drained);
        for entry in &batch.entries {
            let Some(hook) = engine.lookup(entry.func_id) else {
                metrics.inc_removed_func_skip();
                continue;
            };
            if !tracker.observe(entry.func_id, now) {
                metrics.inc_rate_dropped();
                continue;
            }

            let event = self.assemble(entry, hook, watches, evaluator, mem, threads, metrics);
            events.push(event);
        }
        metrics.add_emitted(events.len() as u64);

        DrainOutcome { events, drained }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &mut self,
        entry: &RingEntry,
        hook: &crate::hooks::Hook,
        watches: &WatchSet,
        evaluator: &dyn ExprEvaluator,
        mem: &dyn MemoryAccess,
        threads: &dyn ThreadRegistry,
        metrics: &Metrics,
    ) -> TraceEvent {
        let timestamp_ns = self.ticks_to_ns(entry.timestamp);
        let thread_name = self.thread_names.lookup(entry.thread_id, threads);
        let ids = self.ids.as_mut().expect("session checked in tick");
        let id = ids.next();

        let mut watch_values = std::collections::BTreeMap::new();
        for (label, slot) in watches.fast_matches(entry.func_id) {
            if slot < entry.watch_entry_count as usize {
                watch_values.insert(label.to_string(), json!(entry.watch_values[slot]));
            }
        }
        for expr_watch in watches.exprs_matching(entry.func_id) {
            let value = match evaluator.eval(&expr_watch.expr) {
                Ok(value) => value,
                Err(_) => {
                    metrics.inc_expr_watch_error();
                    json!("<error>")
                }
            };
            watch_values.insert(expr_watch.label.clone(), value);
        }

        let stack = self.stacks.entry(entry.thread_id).or_default();
        if entry.event_type == entry_kind::ENTER {
            while stack.last().map(|top| top.depth >= entry.depth).unwrap_or(false) {
                stack.pop();
            }
            let parent_event_id = stack.last().map(|top| top.event_id.clone());
            stack.push(StackEntry {
                event_id: id.clone(),
                depth: entry.depth,
                enter_ns: timestamp_ns,
            });

            TraceEvent::FunctionEnter {
                id,
                session_id: ids.session_id().to_string(),
                timestamp_ns,
                thread_id: entry.thread_id,
                thread_name,
                parent_event_id,
                function_name: hook.target.name.clone(),
                function_name_raw: hook.target.raw_name.clone(),
                source_file: hook.target.source_file.clone(),
                line: hook.target.line,
                arguments: materialize_arguments(
                    entry,
                    &hook.target.arg_types,
                    self.serialization_depth,
                    mem,
                ),
                sampled: entry.sampled != 0,
                watch_values,
            }
        } else {
            let (parent_event_id, duration_ns) = match stack.last() {
                Some(top) if top.depth == entry.depth => {
                    let top = stack.pop().expect("checked non-empty");
                    let duration = timestamp_ns.saturating_sub(top.enter_ns);
                    (Some(top.event_id), Some(duration))
                }
                _ => (None, None),
            };

            TraceEvent::FunctionExit {
                id,
                session_id: ids.session_id().to_string(),
                timestamp_ns,
                thread_id: entry.thread_id,
                thread_name,
                parent_event_id,
                function_name: hook.target.name.clone(),
                function_name_raw: hook.target.raw_name.clone(),
                source_file: hook.target.source_file.clone(),
                line: hook.target.line,
                return_value: format_hex(entry.retval),
                duration_ns,
                watch_values,
            }
        }
    }
}

/// Entry arguments: typed serialization when the daemon supplied argument
/// types and a serialization depth; raw hex words otherwise.
fn materialize_arguments(
    entry: &RingEntry,
    arg_types: &[TypeInfo],
    depth: u8,
    mem: &dyn MemoryAccess,
) -> Vec<Value> {
    let raw = [entry.arg0, entry.arg1];
    if depth == 0 || arg_types.is_empty() {
        return raw.iter().map(|v| json!(format_hex(*v))).collect();
    }
    let serializer = Serializer::new(mem, depth);
    arg_types
        .iter()
        .take(raw.len())
        .enumerate()
        .map(|(i, ty)| materialize_one(raw[i], ty, &serializer))
        .collect()
}

fn materialize_one(raw: u64, ty: &TypeInfo, serializer: &Serializer) -> Value {
    match ty.kind {
        TypeKind::Int if ty.signed => {
            let size = ty.byte_size.clamp(1, 8);
            let shift = 64 - size * 8;
            json!(((raw << shift) as i64) >> shift)
        }
        TypeKind::Int | TypeKind::Uint => {
            let size = ty.byte_size.clamp(1, 8);
            let mask = if size == 8 {
                u64::MAX
            } else {
                (1u64 << (size * 8)) - 1
            };
            json!(raw & mask)
        }
        // Aggregates arrive by reference in the argument word.
        TypeKind::Struct | TypeKind::Array | TypeKind::Bytes => serializer.serialize(raw, ty),
        TypeKind::Pointer => match &ty.pointee {
            Some(_) if raw != 0 => serializer.serialize(raw, ty),
            _ => json!(format_hex(raw)),
        },
        // Float args travel in FP registers the hook does not capture.
        TypeKind::Float => json!(format_hex(raw)),
    }
}
