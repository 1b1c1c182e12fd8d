//! Native hook engine: installs entry/exit listeners at runtime addresses
//! and feeds the trace ring from the hook fast path.
//!
//! The registry, func-id counter, and slide are owned by the agent thread.
//! Hook callbacks see none of that: everything they need is packed into the
//! listener's user-data word (`(func_id << 1) | is_light`) plus a cloned
//! ring producer, so the fast path never allocates or locks.

use std::collections::HashMap;
use std::sync::Arc;

use strobe_wire::{MAX_FAST_WATCHES, RingEntry, entry_kind};

use crate::error::AttachError;
use crate::framework::{Interceptor, Invocation, ListenerId, ModuleMap};
use crate::platform;
use crate::protocol::HookMode;
use crate::ring::{RingProducer, SampleGate};
use crate::serialize::TypeInfo;

/// Func-ids stay below 2^29 so `(id << 1) | bit` is non-negative under
/// signed 32-bit arithmetic in the framework's user-data word.
pub const FUNC_ID_LIMIT: u32 = 1 << 29;

#[inline]
pub fn encode_user_data(func_id: u32, light: bool) -> u64 {
    ((func_id as u64) << 1) | (light as u64)
}

#[inline]
pub fn decode_user_data(user_data: u64) -> (u32, bool) {
    ((user_data >> 1) as u32, user_data & 1 == 1)
}

/// A function the daemon asked to trace.
#[derive(Debug, Clone)]
pub struct FunctionTarget {
    /// Static (pre-slide) address; runtime address when `no_slide`.
    pub address: u64,
    pub name: String,
    pub raw_name: Option<String>,
    pub source_file: Option<String>,
    pub line: Option<u32>,
    pub no_slide: bool,
    pub arg_types: Vec<TypeInfo>,
}

/// One installed hook.
#[derive(Debug)]
pub struct Hook {
    pub func_id: u32,
    pub mode: HookMode,
    pub target: FunctionTarget,
    pub runtime_address: u64,
    listener: ListenerId,
}

pub struct HookEngine {
    interceptor: Arc<dyn Interceptor>,
    slide: i64,
    by_address: HashMap<u64, Hook>,
    by_func_id: HashMap<u32, u64>,
    next_func_id: u32,
}

impl HookEngine {
    pub fn new(interceptor: Arc<dyn Interceptor>) -> Self {
        Self {
            interceptor,
            slide: 0,
            by_address: HashMap::new(),
            by_func_id: HashMap::new(),
            next_func_id: 1,
        }
    }

    /// Compute the ASLR slide once from the daemon-reported static base and
    /// the runtime base of the main module. Later image bases are ignored.
    pub fn set_image_base(&mut self, static_base: u64, modules: &dyn ModuleMap) {
        let runtime_base = modules.main_module_base();
        let slide = runtime_base.wrapping_sub(static_base) as i64;
        if self.slide != slide && !self.by_address.is_empty() {
            log::warn!("image base changed after hooks were installed; keeping slide {}", self.slide);
            return;
        }
        self.slide = slide;
    }

    pub fn slide(&self) -> i64 {
        self.slide
    }

    fn runtime_address(&self, target: &FunctionTarget) -> u64 {
        if target.no_slide {
            target.address
        } else {
            target.address.wrapping_add(self.slide as u64)
        }
    }

    /// Install a hook. Idempotent per runtime address: re-installing
    /// returns the existing func-id. Returns None when the framework
    /// rejects the address (the assigned id is reclaimed) or ids ran out.
    pub fn install(&mut self, target: FunctionTarget, mode: HookMode) -> Option<u32> {
        let addr = self.runtime_address(&target);
        if let Some(existing) = self.by_address.get(&addr) {
            return Some(existing.func_id);
        }
        if self.next_func_id >= FUNC_ID_LIMIT {
            log::warn!("func-id space exhausted; dropping hook on {}", target.name);
            return None;
        }

        let func_id = self.next_func_id;
        let user_data = encode_user_data(func_id, mode == HookMode::Light);
        let listener = match self.interceptor.attach(addr, user_data) {
            Ok(listener) => listener,
            Err(AttachError::AddressTooSmall) | Err(AttachError::NotExecutable) => {
                log::debug!("hook on {} at 0x{addr:x} rejected; dropped", target.name);
                return None;
            }
        };

        self.next_func_id += 1;
        self.by_func_id.insert(func_id, addr);
        self.by_address.insert(
            addr,
            Hook {
                func_id,
                mode,
                target,
                runtime_address: addr,
                listener,
            },
        );
        Some(func_id)
    }

    /// Remove by static address (or raw address when `no_slide`).
    pub fn remove(&mut self, static_address: u64, no_slide: bool) -> bool {
        let addr = if no_slide {
            static_address
        } else {
            static_address.wrapping_add(self.slide as u64)
        };
        match self.by_address.remove(&addr) {
            Some(hook) => {
                self.interceptor.detach(hook.listener);
                self.by_func_id.remove(&hook.func_id);
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, func_id: u32) -> Option<&Hook> {
        self.by_func_id
            .get(&func_id)
            .and_then(|addr| self.by_address.get(addr))
    }

    pub fn len(&self) -> usize {
        self.by_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }

    /// Installed (name, func-id) pairs, for watch pattern resolution.
    pub fn named_ids(&self) -> impl Iterator<Item = (&str, u32)> {
        self.by_address
            .values()
            .map(|h| (h.target.name.as_str(), h.func_id))
    }

    /// Detach everything. Used by dispose.
    pub fn clear(&mut self) {
        for (_, hook) in self.by_address.drain() {
            self.interceptor.detach(hook.listener);
        }
        self.by_func_id.clear();
        self.next_func_id = 1;
    }
}

/// The hook fast path. Cloned into the framework's callback context;
/// carries only the ring producer.
#[derive(Clone)]
pub struct HookDispatch {
    producer: RingProducer,
}

impl HookDispatch {
    pub fn new(producer: RingProducer) -> Self {
        Self { producer }
    }

    /// Entry callback. Wait-free; light hooks pass the sampling gate first.
    pub fn on_enter(&self, inv: &Invocation) {
        let (func_id, light) = decode_user_data(inv.user_data);
        let sampled = if light {
            match self.producer.sample_gate() {
                SampleGate::Skip => return,
                SampleGate::Record { sampled } => sampled,
            }
        } else {
            false
        };

        let mut watch_values = [0u64; MAX_FAST_WATCHES];
        let watch_entry_count = self.producer.sample_watches(&mut watch_values);

        self.producer.enqueue(&RingEntry {
            timestamp: platform::timestamp_ticks(),
            arg0: inv.arg0,
            arg1: inv.arg1,
            retval: 0,
            func_id,
            thread_id: inv.thread_id,
            depth: inv.depth,
            event_type: entry_kind::ENTER,
            sampled: sampled as u8,
            watch_entry_count,
            _pad: 0,
            watch_values,
        });
    }

    /// Exit callback. Light hooks are enter-only.
    pub fn on_exit(&self, inv: &Invocation) {
        let (func_id, light) = decode_user_data(inv.user_data);
        if light {
            return;
        }

        let mut watch_values = [0u64; MAX_FAST_WATCHES];
        let watch_entry_count = self.producer.sample_watches(&mut watch_values);

        self.producer.enqueue(&RingEntry {
            timestamp: platform::timestamp_ticks(),
            arg0: inv.arg0,
            arg1: inv.arg1,
            retval: inv.retval,
            func_id,
            thread_id: inv.thread_id,
            depth: inv.depth,
            event_type: entry_kind::EXIT,
            sampled: 0,
            watch_entry_count,
            _pad: 0,
            watch_values,
        });
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::ring::{RingDrainer, RingShared};

    #[test]
    fn user_data_roundtrips_and_stays_non_negative() {
        let encoded = encode_user_data(FUNC_ID_LIMIT - 1, true);
        assert_eq!(decode_user_data(encoded), (FUNC_ID_LIMIT - 1, true));
        assert!((encoded as u32 as i32) >= 0);

        let encoded = encode_user_data(7, false);
        assert_eq!(decode_user_data(encoded), (7, false));
    }

    #[test]
    fn install_applies_slide_and_is_idempotent() {
        let interceptor = Arc::new(MockInterceptor::default());
        let mut engine = HookEngine::new(interceptor.clone());
        engine.set_image_base(0x10_0000, &FixedModuleMap(0x10_1000));
        assert_eq!(engine.slide(), 0x1000);

        let id = engine.install(target(0x100, "foo"), HookMode::Full).unwrap();
        assert_eq!(id, 1);
        assert!(interceptor.user_data_for(0x1100).is_some());

        // Same address: same id, no second listener.
        let again = engine.install(target(0x100, "foo"), HookMode::Full).unwrap();
        assert_eq!(again, id);
        assert_eq!(interceptor.attached_count(), 1);
    }

    #[test]
    fn no_slide_targets_bypass_the_shift() {
        let interceptor = Arc::new(MockInterceptor::default());
        let mut engine = HookEngine::new(interceptor.clone());
        engine.set_image_base(0, &FixedModuleMap(0x5000));

        let mut raw = target(0x2000, "raw");
        raw.no_slide = true;
        engine.install(raw, HookMode::Full).unwrap();
        assert!(interceptor.user_data_for(0x2000).is_some());
    }

    #[test]
    fn rejected_address_reclaims_func_id() {
        let interceptor = Arc::new(MockInterceptor::rejecting(&[0x300]));
        let mut engine = HookEngine::new(interceptor);

        let mut bad = target(0x300, "bad");
        bad.no_slide = true;
        assert!(engine.install(bad, HookMode::Full).is_none());

        // The dropped hook's id is handed to the next install.
        let id = engine.install(target(0x400, "good"), HookMode::Full).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn remove_restores_registry() {
        let interceptor = Arc::new(MockInterceptor::default());
        let mut engine = HookEngine::new(interceptor.clone());

        engine.install(target(0x100, "foo"), HookMode::Full).unwrap();
        assert!(engine.remove(0x100, false));
        assert!(engine.is_empty());
        assert_eq!(interceptor.attached_count(), 0);
        assert!(!engine.remove(0x100, false));
    }

    #[test]
    fn dispatch_records_enter_and_exit() {
        let shared = RingShared::new().unwrap();
        let dispatch = HookDispatch::new(crate::ring::RingProducer::new(shared.clone()));
        let mut drainer = RingDrainer::new(shared);

        let inv = Invocation {
            user_data: encode_user_data(1, false),
            thread_id: 42,
            arg0: 0xA,
            arg1: 0xB,
            ..Invocation::default()
        };
        dispatch.on_enter(&inv);
        dispatch.on_exit(&Invocation { retval: 0xC, ..inv });

        let batch = drainer.drain();
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.entries[0].event_type, entry_kind::ENTER);
        assert_eq!(batch.entries[0].arg0, 0xA);
        assert_eq!(batch.entries[1].event_type, entry_kind::EXIT);
        assert_eq!(batch.entries[1].retval, 0xC);
        assert_eq!(batch.entries[1].thread_id, 42);
    }

    #[test]
    fn light_hooks_skip_exit_and_obey_interval() {
        let shared = RingShared::new().unwrap();
        let dispatch = HookDispatch::new(crate::ring::RingProducer::new(shared.clone()));
        let mut drainer = RingDrainer::new(shared.clone());

        let inv = Invocation {
            user_data: encode_user_data(2, true),
            thread_id: 1,
            ..Invocation::default()
        };
        dispatch.on_exit(&inv);
        assert!(drainer.drain().entries.is_empty());

        shared.set_sample_interval(8);
        for _ in 0..64 {
            dispatch.on_enter(&inv);
        }
        let batch = drainer.drain();
        assert_eq!(batch.entries.len(), 8);
        assert!(batch.entries.iter().all(|e| e.sampled == 1));
    }
}
