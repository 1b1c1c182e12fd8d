//! Python tracer.
//!
//! Two installation modes, chosen by interpreter version:
//!
//! - Monitoring (>= 3.12): a `sys.monitoring` tool (id 0) observes
//!   function starts for the low-overhead global tracer. A secondary
//!   classic trace function is installed only while breakpoints or
//!   logpoints exist, because only classic tracing surfaces frame objects.
//! - Legacy: a classic per-thread trace function, installed for all
//!   threads when the interpreter has an all-threads setter, otherwise for
//!   the current thread plus the new-thread default.
//!
//! The tracer function is installed once; hook/breakpoint/logpoint updates
//! mutate shared lists the trace callback reads on every event, so nothing
//! is ever reinstalled from the agent's thread. Pausing waits on the
//! shared per-id event; the interpreter glue releases the GIL around the
//! wait so the agent thread keeps running.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::breakpoints::{PauseTable, render_template};
use crate::error::CommandError;
use crate::framework::Transport;
use crate::interp::{
    InterpEvent, InterpEventQueue, InterpKind, InterpreterTracer, TracerCapabilities,
    target_matches,
};
use crate::platform;
use crate::protocol::{
    AgentMessage, BreakpointSpec, FrameInfo, LogpointSpec, TargetSpec, TraceEvent,
};

/// Seam to the embedded interpreter. Implementations run Python C-API
/// calls under the GIL; errors are returned, never raised into the host.
pub trait PyRuntime: Send + Sync {
    fn version(&self) -> (u32, u32);
    /// `threading.settrace_all_threads` availability (3.10+).
    fn has_all_threads_setter(&self) -> bool;
    fn install_monitoring_tracer(&self) -> Result<(), String>;
    fn remove_monitoring_tracer(&self);
    fn install_classic_tracer(&self, all_threads: bool) -> Result<(), String>;
    fn remove_classic_tracer(&self);
    /// Run a statement (`PyRun_SimpleString`); nonzero status is an error.
    fn run_string(&self, code: &str) -> Result<(), String>;
    /// Fetch `builtins.__strobe_result` left behind by `run_string`.
    fn read_result_attr(&self) -> Result<Value, String>;
    /// Append to the `builtins.__strobe_errors` list; failures continue.
    fn record_error(&self, context: &str, error: &str);
    /// Evaluate a predicate in the paused frame's locals/globals.
    fn eval_condition(
        &self,
        condition: &str,
        locals: &BTreeMap<String, Value>,
    ) -> Result<bool, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TraceMode {
    Monitoring,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PyEventKind {
    Call,
    Return,
    Line,
}

#[derive(Debug, Clone)]
pub struct PyFrameSummary {
    pub function: String,
    pub file: String,
    pub line: u32,
}

/// One interpreter trace event as delivered by the glue.
#[derive(Debug, Clone)]
pub struct PyTraceEvent {
    pub kind: PyEventKind,
    pub file: String,
    pub line: u32,
    pub function: String,
    pub thread_id: u32,
    /// Frame locals; present only on classic-trace events.
    pub locals: BTreeMap<String, Value>,
    /// Innermost-first frame chain for pause backtraces.
    pub stack: Vec<PyFrameSummary>,
}

/// Lists shared with the trace callback. Mutated under short locks from
/// the agent thread; the callback only reads.
#[derive(Default)]
struct SharedLists {
    hooks: Mutex<Vec<TargetSpec>>,
    breakpoints: Mutex<Vec<BreakpointSpec>>,
    logpoints: Mutex<Vec<LogpointSpec>>,
}

pub struct PythonTracer<R: PyRuntime> {
    runtime: R,
    queue: Arc<InterpEventQueue>,
    pause: Arc<PauseTable>,
    transport: Arc<dyn Transport>,
    lists: Arc<SharedLists>,
    mode: TraceMode,
    global_tracer_installed: bool,
    classic_installed: bool,
}

impl<R: PyRuntime> PythonTracer<R> {
    pub fn new(
        runtime: R,
        queue: Arc<InterpEventQueue>,
        pause: Arc<PauseTable>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let mode = if runtime.version() >= (3, 12) {
            TraceMode::Monitoring
        } else {
            TraceMode::Legacy
        };
        Self {
            runtime,
            queue,
            pause,
            transport,
            lists: Arc::new(SharedLists::default()),
            mode,
            global_tracer_installed: false,
            classic_installed: false,
        }
    }

    fn ensure_global_tracer(&mut self) {
        if self.global_tracer_installed {
            return;
        }
        let result = match self.mode {
            TraceMode::Monitoring => self.runtime.install_monitoring_tracer(),
            TraceMode::Legacy => self
                .runtime
                .install_classic_tracer(self.runtime.has_all_threads_setter()),
        };
        match result {
            Ok(()) => self.global_tracer_installed = true,
            Err(err) => self.runtime.record_error("install tracer", &err),
        }
    }

    /// Classic tracing is needed (in monitoring mode) exactly while
    /// breakpoints or logpoints exist, because they require frame objects.
    fn sync_classic_tracer(&mut self) {
        if self.mode != TraceMode::Monitoring {
            return;
        }
        let needed = {
            let bps = self.lists.breakpoints.lock().unwrap_or_else(|e| e.into_inner());
            let lps = self.lists.logpoints.lock().unwrap_or_else(|e| e.into_inner());
            !bps.is_empty() || !lps.is_empty()
        };
        if needed && !self.classic_installed {
            match self.runtime.install_classic_tracer(true) {
                Ok(()) => self.classic_installed = true,
                Err(err) => self.runtime.record_error("install classic tracer", &err),
            }
        } else if !needed && self.classic_installed {
            self.runtime.remove_classic_tracer();
            self.classic_installed = false;
        }
    }

    /// The trace-function body. Runs on interpreter threads.
    pub fn on_trace_event(&self, event: &PyTraceEvent) {
        match event.kind {
            PyEventKind::Call => {
                if self.hook_matches(event) {
                    self.queue.push(InterpEvent {
                        kind: InterpKind::Enter,
                        function: event.function.clone(),
                        file: event.file.clone(),
                        line: Some(event.line),
                        thread_id: event.thread_id,
                        ticks: platform::timestamp_ticks(),
                        args: event.locals.values().cloned().collect(),
                        return_value: None,
                    });
                }
            }
            PyEventKind::Return => {
                if self.hook_matches(event) {
                    self.queue.push(InterpEvent {
                        kind: InterpKind::Exit,
                        function: event.function.clone(),
                        file: event.file.clone(),
                        line: Some(event.line),
                        thread_id: event.thread_id,
                        ticks: platform::timestamp_ticks(),
                        args: Vec::new(),
                        return_value: None,
                    });
                }
            }
            PyEventKind::Line => {
                self.check_logpoints(event);
                self.check_breakpoints(event);
            }
        }
    }

    fn hook_matches(&self, event: &PyTraceEvent) -> bool {
        self.lists
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|t| target_matches(t, &event.file, None, &event.function))
    }

    fn check_breakpoints(&self, event: &PyTraceEvent) {
        let matched: Option<BreakpointSpec> = {
            let bps = self.lists.breakpoints.lock().unwrap_or_else(|e| e.into_inner());
            bps.iter()
                .find(|bp| {
                    bp.line == Some(event.line)
                        && bp
                            .file
                            .as_deref()
                            .map(|f| event.file == f || event.file.ends_with(f))
                            .unwrap_or(false)
                })
                .cloned()
        };
        let Some(bp) = matched else { return };

        if let Some(condition) = &bp.condition {
            match self.runtime.eval_condition(condition, &event.locals) {
                Ok(true) => {}
                Ok(false) => return,
                Err(err) => {
                    self.transport.post(
                        AgentMessage::ConditionError {
                            breakpoint_id: bp.id.clone(),
                            error: err,
                        }
                        .to_value(),
                    );
                    return;
                }
            }
        }

        let backtrace = event
            .stack
            .iter()
            .map(|f| FrameInfo {
                address: format!("{}:{}", f.file, f.line),
                symbol: Some(f.function.clone()),
            })
            .collect();
        self.transport.post(
            AgentMessage::Events {
                events: vec![TraceEvent::Pause {
                    breakpoint_id: bp.id.clone(),
                    thread_id: event.thread_id,
                    file: Some(event.file.clone()),
                    line: Some(event.line),
                    function: Some(event.function.clone()),
                    address: None,
                    backtrace,
                    locals: event.locals.clone(),
                    frame_memory: String::new(),
                    frame_base: String::new(),
                }],
            }
            .to_value(),
        );
        // The glue releases the GIL around this wait.
        self.pause.wait(&bp.id, event.thread_id);
    }

    fn check_logpoints(&self, event: &PyTraceEvent) {
        let rendered: Vec<(String, String, Option<u32>)> = {
            let lps = self.lists.logpoints.lock().unwrap_or_else(|e| e.into_inner());
            lps.iter()
                .filter(|lp| {
                    lp.line == Some(event.line)
                        && lp
                            .file
                            .as_deref()
                            .map(|f| event.file == f || event.file.ends_with(f))
                            .unwrap_or(false)
                })
                .map(|lp| {
                    (
                        lp.id.clone(),
                        render_template(&lp.message, &event.locals),
                        lp.line,
                    )
                })
                .collect()
        };
        for (id, message, line) in rendered {
            self.transport.post(
                AgentMessage::Events {
                    events: vec![TraceEvent::Logpoint { id, message, line }],
                }
                .to_value(),
            );
        }
    }
}

/// Render a JSON value as a Python literal for `run_string` assignments.
pub fn py_literal(value: &Value) -> String {
    match value {
        Value::Null => "None".to_string(),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(py_literal).collect();
            format!("[{}]", inner.join(", "))
        }
        Value::Object(map) => {
            let inner: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("{}: {}", py_literal(&Value::String(k.clone())), py_literal(v)))
                .collect();
            format!("{{{}}}", inner.join(", "))
        }
    }
}

impl<R: PyRuntime> InterpreterTracer for PythonTracer<R> {
    fn install_hooks(&mut self, targets: &[TargetSpec]) -> usize {
        self.ensure_global_tracer();
        let mut hooks = self.lists.hooks.lock().unwrap_or_else(|e| e.into_inner());
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
        let mut hooks = self.lists.hooks.lock().unwrap_or_else(|e| e.into_inner());
        let before = hooks.len();
        hooks.retain(|h| !targets.contains(h));
        before - hooks.len()
    }

    fn hooks(&self) -> Vec<TargetSpec> {
        self.lists
            .hooks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update_breakpoints(
        &mut self,
        add: &[BreakpointSpec],
        remove: &[String],
    ) -> Result<(), CommandError> {
        {
            let mut bps = self.lists.breakpoints.lock().unwrap_or_else(|e| e.into_inner());
            bps.retain(|bp| !remove.contains(&bp.id));
            for bp in add {
                bps.retain(|existing| existing.id != bp.id);
                bps.push(bp.clone());
            }
        }
        self.ensure_global_tracer();
        self.sync_classic_tracer();
        Ok(())
    }

    fn update_logpoints(
        &mut self,
        add: &[LogpointSpec],
        remove: &[String],
    ) -> Result<(), CommandError> {
        {
            let mut lps = self.lists.logpoints.lock().unwrap_or_else(|e| e.into_inner());
            lps.retain(|lp| !remove.contains(&lp.id));
            for lp in add {
                lps.retain(|existing| existing.id != lp.id);
                lps.push(lp.clone());
            }
        }
        self.ensure_global_tracer();
        self.sync_classic_tracer();
        Ok(())
    }

    fn read_variable(&self, expr: &str) -> Result<Value, String> {
        let code = format!(
            "import builtins\nbuiltins.__strobe_result = ({expr})",
        );
        if let Err(err) = self.runtime.run_string(&code) {
            self.runtime.record_error(expr, &err);
            return Err(err);
        }
        self.runtime.read_result_attr()
    }

    fn write_variable(&self, expr: &str, value: &Value) -> Result<(), String> {
        let code = format!("{expr} = {}", py_literal(value));
        if let Err(err) = self.runtime.run_string(&code) {
            self.runtime.record_error(expr, &err);
            return Err(err);
        }
        Ok(())
    }

    fn capabilities(&self) -> TracerCapabilities {
        TracerCapabilities {
            runtime: "python",
            multi_hook: true,
            breakpoints: true,
            variable_write: true,
            degraded: None,
        }
    }

    fn dispose(&mut self) {
        if self.classic_installed {
            self.runtime.remove_classic_tracer();
            self.classic_installed = false;
        }
        if self.global_tracer_installed {
            match self.mode {
                TraceMode::Monitoring => self.runtime.remove_monitoring_tracer(),
                TraceMode::Legacy => self.runtime.remove_classic_tracer(),
            }
            self.global_tracer_installed = false;
        }
        self.lists.hooks.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.lists
            .breakpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.lists
            .logpoints
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}
