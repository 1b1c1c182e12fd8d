//! Interpreted-runtime tracers: Python plus two JS engines, all behind one
//! uniform contract.
//!
//! These tracers hook interpreter-level APIs instead of code addresses.
//! They do not touch the ring, the slide, the adaptive sampler, or native
//! object serialization: assembled events go into a small in-agent queue
//! that the agent flushes on a 50ms timer.

pub mod jsc;
pub mod node;
pub mod python;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::error::CommandError;
use crate::protocol::{
    BreakpointSpec, EventIdGen, LogpointSpec, TargetSpec, TraceEvent, format_hex,
};

/// Flush cadence for the interp event queue.
pub const INTERP_FLUSH_MS: u64 = 50;

/// What a tracer reports it can do. `degraded` explains a lost capability
/// (e.g. stripped engine symbols).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TracerCapabilities {
    pub runtime: &'static str,
    pub multi_hook: bool,
    pub breakpoints: bool,
    pub variable_write: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

/// The uniform tracer contract the façade multiplexes over.
pub trait InterpreterTracer {
    fn install_hooks(&mut self, targets: &[TargetSpec]) -> usize;
    fn remove_hooks(&mut self, targets: &[TargetSpec]) -> usize;
    fn hooks(&self) -> Vec<TargetSpec>;
    fn update_breakpoints(
        &mut self,
        add: &[BreakpointSpec],
        remove: &[String],
    ) -> Result<(), CommandError>;
    fn update_logpoints(
        &mut self,
        add: &[LogpointSpec],
        remove: &[String],
    ) -> Result<(), CommandError>;
    fn read_variable(&self, expr: &str) -> Result<Value, String>;
    fn write_variable(&self, expr: &str, value: &Value) -> Result<(), String>;
    fn capabilities(&self) -> TracerCapabilities;
    fn dispose(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpKind {
    Enter,
    Exit,
}

/// One raw tracer observation, before ids and pairing are applied.
#[derive(Debug, Clone)]
pub struct InterpEvent {
    pub kind: InterpKind,
    pub function: String,
    pub file: String,
    pub line: Option<u32>,
    pub thread_id: u32,
    pub ticks: u64,
    pub args: Vec<Value>,
    pub return_value: Option<u64>,
}

/// Queue between interpreter-thread callbacks and the agent flush timer.
#[derive(Default)]
pub struct InterpEventQueue {
    queue: Mutex<VecDeque<InterpEvent>>,
}

impl InterpEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: InterpEvent) {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(event);
    }

    pub fn take(&self) -> Vec<InterpEvent> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct OpenFrame {
    event_id: String,
    function: String,
    enter_ns: u64,
}

/// Pairs raw interp events into enter/exit trace events. Interpreter frame
/// events nest strictly, so a plain per-thread stack reconciles them.
#[derive(Default)]
pub struct InterpAssembler {
    stacks: HashMap<u32, Vec<OpenFrame>>,
}

impl InterpAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.stacks.clear();
    }

    pub fn assemble(
        &mut self,
        raw: Vec<InterpEvent>,
        ids: &mut EventIdGen,
        ratio: f64,
    ) -> Vec<TraceEvent> {
        let mut events = Vec::with_capacity(raw.len());
        for event in raw {
            let timestamp_ns = (event.ticks as f64 * ratio) as u64;
            let id = ids.next();
            let stack = self.stacks.entry(event.thread_id).or_default();
            match event.kind {
                InterpKind::Enter => {
                    let parent_event_id = stack.last().map(|f| f.event_id.clone());
                    stack.push(OpenFrame {
                        event_id: id.clone(),
                        function: event.function.clone(),
                        enter_ns: timestamp_ns,
                    });
                    events.push(TraceEvent::FunctionEnter {
                        id,
                        session_id: ids.session_id().to_string(),
                        timestamp_ns,
                        thread_id: event.thread_id,
                        thread_name: None,
                        parent_event_id,
                        function_name: event.function,
                        function_name_raw: None,
                        source_file: Some(event.file),
                        line: event.line,
                        arguments: event.args,
                        sampled: false,
                        watch_values: BTreeMap::new(),
                    });
                }
                InterpKind::Exit => {
                    // Pop to the matching open frame; unmatched exits are
                    // parentless (their enter predates tracing).
                    let matched = match stack.last() {
                        Some(top) if top.function == event.function => stack.pop(),
                        _ => None,
                    };
                    let (parent_event_id, duration_ns) = match matched {
                        Some(frame) => (
                            Some(frame.event_id),
                            Some(timestamp_ns.saturating_sub(frame.enter_ns)),
                        ),
                        None => (None, None),
                    };
                    events.push(TraceEvent::FunctionExit {
                        id,
                        session_id: ids.session_id().to_string(),
                        timestamp_ns,
                        thread_id: event.thread_id,
                        thread_name: None,
                        parent_event_id,
                        function_name: event.function,
                        function_name_raw: None,
                        source_file: Some(event.file),
                        line: event.line,
                        return_value: format_hex(event.return_value.unwrap_or(0)),
                        duration_ns,
                        watch_values: BTreeMap::new(),
                    });
                }
            }
        }
        events
    }
}

/// Does a hook target match an observed frame? File matching is by path
/// suffix so relative compile-time paths still bind; the line, when the
/// target carries one, must match the function's definition line.
pub fn target_matches(target: &TargetSpec, file: &str, line: Option<u32>, name: &str) -> bool {
    if target.name != name {
        return false;
    }
    if !(file == target.file || file.ends_with(&target.file)) {
        return false;
    }
    match (target.line, line) {
        (Some(want), Some(got)) => want == got,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: InterpKind, function: &str, ticks: u64) -> InterpEvent {
        InterpEvent {
            kind,
            function: function.into(),
            file: "app.py".into(),
            line: Some(10),
            thread_id: 1,
            ticks,
            args: Vec::new(),
            return_value: None,
        }
    }

    #[test]
    fn queue_hands_off_in_order() {
        let queue = InterpEventQueue::new();
        queue.push(raw(InterpKind::Enter, "a", 1));
        queue.push(raw(InterpKind::Exit, "a", 2));
        assert_eq!(queue.len(), 2);
        let taken = queue.take();
        assert_eq!(taken[0].function, "a");
        assert!(queue.is_empty());
    }

    #[test]
    fn assembler_pairs_nested_frames() {
        let mut assembler = InterpAssembler::new();
        let mut ids = EventIdGen::new("S");
        let events = assembler.assemble(
            vec![
                raw(InterpKind::Enter, "outer", 10),
                raw(InterpKind::Enter, "inner", 20),
                raw(InterpKind::Exit, "inner", 30),
                raw(InterpKind::Exit, "outer", 40),
            ],
            &mut ids,
            1.0,
        );

        match &events[1] {
            TraceEvent::FunctionEnter {
                parent_event_id, ..
            } => assert_eq!(parent_event_id.as_deref(), Some("S-1")),
            other => panic!("unexpected: {other:?}"),
        }
        match &events[2] {
            TraceEvent::FunctionExit {
                parent_event_id,
                duration_ns,
                ..
            } => {
                assert_eq!(parent_event_id.as_deref(), Some("S-2"));
                assert_eq!(*duration_ns, Some(10));
            }
            other => panic!("unexpected: {other:?}"),
        }
        match &events[3] {
            TraceEvent::FunctionExit { duration_ns, .. } => {
                assert_eq!(*duration_ns, Some(30));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unmatched_exit_is_parentless() {
        let mut assembler = InterpAssembler::new();
        let mut ids = EventIdGen::new("S");
        let events = assembler.assemble(vec![raw(InterpKind::Exit, "orphan", 5)], &mut ids, 1.0);
        match &events[0] {
            TraceEvent::FunctionExit {
                parent_event_id,
                duration_ns,
                ..
            } => {
                assert!(parent_event_id.is_none());
                assert!(duration_ns.is_none());
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn target_matching_uses_suffix_and_line() {
        let target = TargetSpec {
            file: "src/app.py".into(),
            line: Some(10),
            name: "handler".into(),
        };
        assert!(target_matches(&target, "/srv/project/src/app.py", Some(10), "handler"));
        assert!(!target_matches(&target, "/srv/project/src/app.py", Some(11), "handler"));
        assert!(!target_matches(&target, "/srv/other.py", Some(10), "handler"));
        assert!(!target_matches(&target, "/srv/project/src/app.py", Some(10), "other"));

        let lineless = TargetSpec {
            file: "app.py".into(),
            line: None,
            name: "handler".into(),
        };
        assert!(target_matches(&lineless, "app.py", Some(99), "handler"));
    }
}
