//! Watch configuration: up to four fast-path slots published into the ring
//! header (read by every hook callback) plus an unbounded set of expression
//! watches evaluated at drain time.
//!
//! A watch matches a hook when it is global or its resolved func-id set
//! contains the hook's id. `on` patterns are globs resolved against the
//! names of installed hooks at configuration time.

use std::collections::HashSet;

use regex::Regex;

use crate::error::CommandError;
use crate::hooks::HookEngine;
use crate::protocol::{ExprWatchSpec, WatchSpec, parse_hex_addr};
use crate::ring::{FastWatchSlot, RingShared};
use strobe_wire::MAX_FAST_WATCHES;

#[derive(Debug)]
pub struct FastWatch {
    pub label: String,
    pub slot: usize,
    on_func_ids: HashSet<u32>,
    global: bool,
}

#[derive(Debug)]
pub struct ExprWatch {
    pub label: String,
    pub expr: String,
    on_func_ids: HashSet<u32>,
    global: bool,
}

impl ExprWatch {
    pub fn matches(&self, func_id: u32) -> bool {
        self.global || self.on_func_ids.contains(&func_id)
    }
}

#[derive(Default)]
pub struct WatchSet {
    fast: Vec<FastWatch>,
    exprs: Vec<ExprWatch>,
}

impl WatchSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and publish a new watch configuration, replacing the
    /// previous one. Fast-path slots land in the ring header; glob `on`
    /// patterns are resolved against installed hook names now.
    pub fn configure(
        &mut self,
        shared: &RingShared,
        slide: i64,
        specs: &[WatchSpec],
        expr_specs: &[ExprWatchSpec],
        engine: &HookEngine,
    ) -> Result<usize, CommandError> {
        if specs.len() > MAX_FAST_WATCHES {
            return Err(CommandError::validation(format!(
                "at most {MAX_FAST_WATCHES} fast watches, got {}",
                specs.len()
            )));
        }
        for spec in specs {
            if !matches!(spec.size, 1 | 2 | 4 | 8) {
                return Err(CommandError::validation(format!(
                    "watch {:?}: size must be 1, 2, 4 or 8",
                    spec.label
                )));
            }
            if spec.deref_depth > 1 {
                return Err(CommandError::validation(format!(
                    "watch {:?}: deref depth must be 0 or 1",
                    spec.label
                )));
            }
        }

        let mut slots = Vec::with_capacity(specs.len());
        let mut fast = Vec::with_capacity(specs.len());
        for (slot, spec) in specs.iter().enumerate() {
            let address = parse_hex_addr(&spec.address)?.wrapping_add(slide as u64);
            slots.push(FastWatchSlot {
                address,
                size: spec.size,
                deref_depth: spec.deref_depth,
                deref_offset: spec.deref_offset,
            });
            fast.push(FastWatch {
                label: spec.label.clone(),
                slot,
                on_func_ids: resolve_patterns(&spec.on, engine.named_ids()),
                global: spec.global,
            });
        }

        shared.publish_watch_table(&slots);
        self.fast = fast;
        self.exprs = expr_specs
            .iter()
            .map(|spec| ExprWatch {
                label: spec.label.clone(),
                expr: spec.expr.clone(),
                on_func_ids: resolve_patterns(&spec.on, engine.named_ids()),
                global: spec.global,
            })
            .collect();

        Ok(self.fast.len() + self.exprs.len())
    }

    pub fn clear(&mut self, shared: &RingShared) {
        shared.publish_watch_table(&[]);
        self.fast.clear();
        self.exprs.clear();
    }

    /// Fast watches matching a func-id: (label, header slot index).
    pub fn fast_matches(&self, func_id: u32) -> impl Iterator<Item = (&str, usize)> {
        self.fast
            .iter()
            .filter(move |w| w.global || w.on_func_ids.contains(&func_id))
            .map(|w| (w.label.as_str(), w.slot))
    }

    pub fn exprs_matching(&self, func_id: u32) -> impl Iterator<Item = &ExprWatch> {
        self.exprs.iter().filter(move |w| w.matches(func_id))
    }

    pub fn is_empty(&self) -> bool {
        self.fast.is_empty() && self.exprs.is_empty()
    }
}

/// Compile a glob into an anchored regex (`*` → any run, `?` → any char).
pub fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).ok()
}

/// Resolve glob patterns against installed hook names.
pub fn resolve_patterns<'a>(
    patterns: &[String],
    names: impl Iterator<Item = (&'a str, u32)>,
) -> HashSet<u32> {
    let regexes: Vec<Regex> = patterns.iter().filter_map(|p| glob_to_regex(p)).collect();
    if regexes.is_empty() {
        return HashSet::new();
    }
    names
        .filter(|(name, _)| regexes.iter().any(|r| r.is_match(name)))
        .map(|(_, id)| id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::test_support::{MockInterceptor, target};
    use crate::protocol::HookMode;
    use std::sync::Arc;

    fn engine_with_hooks() -> HookEngine {
        let mut engine = HookEngine::new(Arc::new(MockInterceptor::default()));
        engine.install(target(0x100, "alloc_page"), HookMode::Full);
        engine.install(target(0x200, "free_page"), HookMode::Full);
        engine.install(target(0x300, "compute"), HookMode::Full);
        engine
    }

    fn watch_spec(label: &str, size: u8) -> WatchSpec {
        WatchSpec {
            label: label.into(),
            address: "0x1000".into(),
            size,
            type_kind: None,
            deref_depth: 0,
            deref_offset: 0,
            on: Vec::new(),
            global: true,
        }
    }

    #[test]
    fn glob_patterns_resolve_to_func_ids() {
        let engine = engine_with_hooks();
        let ids = resolve_patterns(&["*_page".into()], engine.named_ids());
        assert_eq!(ids.len(), 2);
        let ids = resolve_patterns(&["compute".into()], engine.named_ids());
        assert_eq!(ids.len(), 1);
        let ids = resolve_patterns(&[], engine.named_ids());
        assert!(ids.is_empty());
    }

    #[test]
    fn configure_publishes_slots_and_filters() {
        let shared = RingShared::new().unwrap();
        let engine = engine_with_hooks();
        let mut watches = WatchSet::new();

        let mut scoped = watch_spec("pages", 8);
        scoped.global = false;
        scoped.on = vec!["*_page".into()];

        let count = watches
            .configure(&shared, 0x10, &[watch_spec("g", 4), scoped], &[], &engine)
            .unwrap();
        assert_eq!(count, 2);

        let header = shared.header();
        assert_eq!(header.watch_count, 2);
        assert_eq!(header.watch_addrs[0], 0x1010);

        // Global watch matches everything; scoped one only the page funcs.
        assert_eq!(watches.fast_matches(3).count(), 1);
        assert_eq!(watches.fast_matches(1).count(), 2);
    }

    #[test]
    fn invalid_configurations_reject_the_command() {
        let shared = RingShared::new().unwrap();
        let engine = engine_with_hooks();
        let mut watches = WatchSet::new();

        let specs: Vec<WatchSpec> = (0..5).map(|i| watch_spec(&format!("w{i}"), 4)).collect();
        assert!(watches.configure(&shared, 0, &specs, &[], &engine).is_err());

        assert!(watches
            .configure(&shared, 0, &[watch_spec("w", 3)], &[], &engine)
            .is_err());

        let mut deep = watch_spec("w", 4);
        deep.deref_depth = 2;
        assert!(watches.configure(&shared, 0, &[deep], &[], &engine).is_err());

        // Nothing was published by the failed attempts.
        assert_eq!(shared.header().watch_count, 0);
    }

    #[test]
    fn expr_watches_filter_by_func() {
        let shared = RingShared::new().unwrap();
        let engine = engine_with_hooks();
        let mut watches = WatchSet::new();

        let exprs = vec![
            ExprWatchSpec {
                label: "depth".into(),
                expr: "queue.depth".into(),
                on: vec!["compute".into()],
                global: false,
            },
            ExprWatchSpec {
                label: "all".into(),
                expr: "counter".into(),
                on: Vec::new(),
                global: true,
            },
        ];
        watches.configure(&shared, 0, &[], &exprs, &engine).unwrap();

        assert_eq!(watches.exprs_matching(3).count(), 2);
        assert_eq!(watches.exprs_matching(1).count(), 1);
    }
}
