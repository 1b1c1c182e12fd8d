//! JS tracer for the alternative engine.
//!
//! Hooks the engine's public-API function-invocation entrypoint. With one
//! active hook every invocation is attributed to it; with several, the
//! callee's `.name` is read through the engine's string-copy API and
//! matched against hook names. Release builds that strip those symbols
//! degrade the tracer to single-hook capability, which is reported in the
//! capabilities response.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::CommandError;
use crate::interp::{
    InterpEvent, InterpEventQueue, InterpKind, InterpreterTracer, TracerCapabilities,
};
use crate::interp::node::is_simple_assignment_target;
use crate::platform;
use crate::protocol::{BreakpointSpec, LogpointSpec, TargetSpec};

/// Seam to the engine embedding.
pub trait JscRuntime: Send + Sync {
    /// Instrument the function-invocation entrypoint.
    fn register_invoke_hook(&self) -> Result<(), String>;
    /// Whether the string-copy API symbols resolved (stripped builds
    /// lose them).
    fn has_string_copy_api(&self) -> bool;
    /// Callee name via the string-copy API. None when unavailable.
    fn function_name(&self, function_ref: u64) -> Option<String>;
    fn eval(&self, code: &str) -> Result<Value, String>;
    fn assign(&self, expr: &str, value: &Value) -> Result<(), String>;
}

pub struct JscTracer<R: JscRuntime> {
    runtime: R,
    queue: Arc<InterpEventQueue>,
    hooks: Arc<Mutex<Vec<TargetSpec>>>,
    hook_registered: bool,
    name_matching: bool,
}

impl<R: JscRuntime> JscTracer<R> {
    pub fn new(runtime: R, queue: Arc<InterpEventQueue>) -> Self {
        let name_matching = runtime.has_string_copy_api();
        Self {
            runtime,
            queue,
            hooks: Arc::new(Mutex::new(Vec::new())),
            hook_registered: false,
            name_matching,
        }
    }

    fn ensure_registered(&mut self) {
        if self.hook_registered {
            return;
        }
        if let Err(err) = self.runtime.register_invoke_hook() {
            log::warn!("invoke hook unavailable: {err}");
            return;
        }
        self.hook_registered = true;
    }

    /// Invocation-entry callback.
    pub fn on_invoke(&self, function_ref: u64, thread_id: u32) {
        self.record(function_ref, thread_id, InterpKind::Enter, None);
    }

    /// Invocation-return callback.
    pub fn on_invoke_complete(&self, function_ref: u64, thread_id: u32, retval: u64) {
        self.record(function_ref, thread_id, InterpKind::Exit, Some(retval));
    }

    fn record(&self, function_ref: u64, thread_id: u32, kind: InterpKind, retval: Option<u64>) {
        let hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        let target = match hooks.len() {
            0 => return,
            // One hook: every invocation is attributed to it.
            1 => Some(&hooks[0]),
            _ if self.name_matching => {
                let name = self.runtime.function_name(function_ref);
                name.and_then(|n| hooks.iter().find(|t| t.name == n))
            }
            // Degraded: multi-hook installs were refused, so this arm is
            // only reachable after a racing install; attribute nothing.
            _ => None,
        };
        let Some(target) = target else { return };

        self.queue.push(InterpEvent {
            kind,
            function: target.name.clone(),
            file: target.file.clone(),
            line: target.line,
            thread_id,
            ticks: platform::timestamp_ticks(),
            args: Vec::new(),
            return_value: retval,
        });
    }
}

impl<R: JscRuntime> InterpreterTracer for JscTracer<R> {
    /// In degraded mode only the first hook is honored; extras are
    /// dropped and the shortfall shows in the return count.
    fn install_hooks(&mut self, targets: &[TargetSpec]) -> usize {
        self.ensure_registered();
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        let mut added = 0;
        for target in targets {
            if !self.name_matching && !hooks.is_empty() {
                log::warn!(
                    "dropping hook on {:?}: engine name lookup unavailable, single-hook mode",
                    target.name
                );
                continue;
            }
            if !hooks.contains(target) {
                hooks.push(target.clone());
                added += 1;
            }
        }
        added
    }

    fn remove_hooks(&mut self, targets: &[TargetSpec]) -> usize {
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        let before = hooks.len();
        hooks.retain(|h| !targets.contains(h));
        before - hooks.len()
    }

    fn hooks(&self) -> Vec<TargetSpec> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner()).clone()
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
            "breakpoints are not supported on the jsc runtime",
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
            "logpoints are not supported on the jsc runtime",
        ))
    }

    fn read_variable(&self, expr: &str) -> Result<Value, String> {
        self.runtime.eval(&format!("({expr})"))
    }

    fn write_variable(&self, expr: &str, value: &Value) -> Result<(), String> {
        if !is_simple_assignment_target(expr) {
            return Err(format!("refusing write to non-simple target {expr:?}"));
        }
        self.runtime.assign(expr, value)
    }

    fn capabilities(&self) -> TracerCapabilities {
        TracerCapabilities {
            runtime: "jsc",
            multi_hook: self.name_matching,
            breakpoints: false,
            variable_write: true,
            degraded: (!self.name_matching).then(|| {
                "string-copy API symbols unavailable; single-hook capability".to_string()
            }),
        }
    }

    fn dispose(&mut self) {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
