//! JS tracer for the ubiquitous engine.
//!
//! Two capture paths, both feeding `globalThis.__strobe_trace`:
//!
//! - CommonJS: the module-compile entrypoint is instrumented and newly
//!   loaded exports are wrapped in enter/exit proxies. Wrapped functions
//!   are remembered by identity so a module reloaded twice is never
//!   double-wrapped.
//! - ES modules: a loader hook rewrites module source, inserting a trace
//!   prologue into every function declaration before the engine compiles
//!   it.
//!
//! Variable reads go through indirect eval with a module-cache search as
//! fallback; writes compile a `{expr} = __v` setter only after the target
//! passes a simple-assignment-target check.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::CommandError;
use crate::interp::{
    InterpEvent, InterpEventQueue, InterpKind, InterpreterTracer, TracerCapabilities,
    target_matches,
};
use crate::platform;
use crate::protocol::{BreakpointSpec, LogpointSpec, TargetSpec};

/// Seam to the engine embedding. All calls run on engine threads or via
/// the engine's locked API.
pub trait NodeRuntime: Send + Sync {
    /// Instrument the module-compile entrypoint (CJS path).
    fn register_compile_hook(&self) -> Result<(), String>;
    /// Register the ESM loader hook that feeds sources through
    /// `rewrite_module_source`.
    fn register_loader_hook(&self) -> Result<(), String>;
    fn eval(&self, code: &str) -> Result<Value, String>;
    /// Search the module cache for a dotted expression.
    fn module_cache_lookup(&self, expr: &str) -> Option<Value>;
    /// Apply a validated `{expr} = __v` assignment.
    fn assign(&self, expr: &str, value: &Value) -> Result<(), String>;
}

static ASSIGNMENT_TARGET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_$][A-Za-z0-9_$]*(\.[A-Za-z_$][A-Za-z0-9_$]*|\[\d+\])*$")
        .expect("static regex")
});

/// A valid left-hand side for a variable write: dotted identifiers with
/// numeric indexing only.
pub fn is_simple_assignment_target(expr: &str) -> bool {
    ASSIGNMENT_TARGET.is_match(expr)
}

static FN_DECL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:export\s+)?(?:async\s+)?function\s+([A-Za-z_$][A-Za-z0-9_$]*)\s*\(")
        .expect("static regex")
});

/// Rewrite ES-module source: insert a trace prologue right after the
/// opening brace of every function declaration. Declarations only; arrow
/// functions and methods keep the proxy path.
pub fn rewrite_module_source(source: &str, url: &str) -> String {
    let mut insertions: Vec<(usize, String)> = Vec::new();
    for caps in FN_DECL.captures_iter(source) {
        let name = &caps[1];
        let params_open = caps.get(0).map(|m| m.end()).unwrap_or(0);
        if let Some(body) = body_brace_offset(source, params_open) {
            insertions.push((
                body + 1,
                format!(
                    " if (typeof globalThis.__strobe_trace === 'function') \
                     globalThis.__strobe_trace('enter', '{name}', '{url}', 0);"
                ),
            ));
        }
    }

    let mut out = String::with_capacity(source.len() + insertions.len() * 96);
    let mut cursor = 0;
    for (pos, text) in insertions {
        out.push_str(&source[cursor..pos]);
        out.push_str(&text);
        cursor = pos;
    }
    out.push_str(&source[cursor..]);
    out
}

/// Index of the body's opening brace, given the offset just past the
/// parameter list's `(`. Tolerates nested parens in default parameters.
fn body_brace_offset(source: &str, params_open: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut depth = 1usize;
    let mut i = params_open;
    while i < bytes.len() && depth > 0 {
        match bytes[i] {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    while i < bytes.len() {
        match bytes[i] {
            b'{' => return Some(i),
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            _ => return None,
        }
    }
    None
}

#[derive(Default)]
struct SharedState {
    hooks: Mutex<Vec<TargetSpec>>,
    /// Function identities already wrapped; prevents double-wrapping.
    wrapped: Mutex<HashSet<u64>>,
}

pub struct NodeTracer<R: NodeRuntime> {
    runtime: R,
    queue: Arc<InterpEventQueue>,
    state: Arc<SharedState>,
    hooks_registered: bool,
    loader_degraded: Option<String>,
}

impl<R: NodeRuntime> NodeTracer<R> {
    pub fn new(runtime: R, queue: Arc<InterpEventQueue>) -> Self {
        Self {
            runtime,
            queue,
            state: Arc::new(SharedState::default()),
            hooks_registered: false,
            loader_degraded: None,
        }
    }

    fn ensure_registered(&mut self) {
        if self.hooks_registered {
            return;
        }
        if let Err(err) = self.runtime.register_compile_hook() {
            log::warn!("module-compile hook unavailable: {err}");
        }
        if let Err(err) = self.runtime.register_loader_hook() {
            // CJS wrapping still works; only ESM coverage is lost.
            self.loader_degraded = Some(format!("ESM loader hook unavailable: {err}"));
        }
        self.hooks_registered = true;
    }

    /// Should this export be wrapped? Marks the identity as wrapped when
    /// the answer is yes, so the caller wraps at most once.
    pub fn should_wrap(&self, function_identity: u64, name: &str, url: &str) -> bool {
        let hooks = self.state.hooks.lock().unwrap_or_else(|e| e.into_inner());
        if !hooks.iter().any(|t| target_matches(t, url, None, name)) {
            return false;
        }
        self.state
            .wrapped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(function_identity)
    }

    /// The `__strobe_trace` callback body: both the proxy wrappers and the
    /// rewritten prologues land here.
    pub fn on_trace(&self, phase: &str, name: &str, url: &str, thread_id: u32) {
        let hooked = self
            .state
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|t| target_matches(t, url, None, name));
        if !hooked {
            return;
        }
        let kind = match phase {
            "enter" => InterpKind::Enter,
            "exit" => InterpKind::Exit,
            _ => return,
        };
        self.queue.push(InterpEvent {
            kind,
            function: name.to_string(),
            file: url.to_string(),
            line: None,
            thread_id,
            ticks: platform::timestamp_ticks(),
            args: Vec::new(),
            return_value: None,
        });
    }
}

impl<R: NodeRuntime> InterpreterTracer for NodeTracer<R> {
    fn install_hooks(&mut self, targets: &[TargetSpec]) -> usize {
        self.ensure_registered();
        let mut hooks = self.state.hooks.lock().unwrap_or_else(|e| e.into_inner());
        let mut added = 0;
        for target in targets {
            if !hooks.contains(target) {
                hooks.push(target.clone());
                added += 1;
            }
        }
        added
    }

    fn remove_hooks(&mut self, targets: &[TargetSpec]) -> usize {
        let mut hooks = self.state.hooks.lock().unwrap_or_else(|e| e.into_inner());
        let before = hooks.len();
        hooks.retain(|h| !targets.contains(h));
        before - hooks.len()
    }

    fn hooks(&self) -> Vec<TargetSpec> {
        self.state
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update_breakpoints(
        &mut self,
        add: &[BreakpointSpec],
        _remove: &[String],
    ) -> Result<(), CommandError> {
        if add.is_empty() {
            return Ok(());
        }
        Err(CommandError::validation(
            "breakpoints are not supported on the node runtime",
        ))
    }

    fn update_logpoints(
        &mut self,
        add: &[LogpointSpec],
        _remove: &[String],
    ) -> Result<(), CommandError> {
        if add.is_empty() {
            return Ok(());
        }
        Err(CommandError::validation(
            "logpoints are not supported on the node runtime",
        ))
    }

    fn read_variable(&self, expr: &str) -> Result<Value, String> {
        match self.runtime.eval(&format!("({expr})")) {
            Ok(value) => Ok(value),
            Err(eval_err) => self
                .runtime
                .module_cache_lookup(expr)
                .ok_or(eval_err),
        }
    }

    fn write_variable(&self, expr: &str, value: &Value) -> Result<(), String> {
        if !is_simple_assignment_target(expr) {
            return Err(format!("refusing write to non-simple target {expr:?}"));
        }
        self.runtime.assign(expr, value)
    }

    fn capabilities(&self) -> TracerCapabilities {
        TracerCapabilities {
            runtime: "node",
            multi_hook: true,
            breakpoints: false,
            variable_write: true,
            degraded: self.loader_degraded.clone(),
        }
    }

    fn dispose(&mut self) {
        self.state
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.state
            .wrapped
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
