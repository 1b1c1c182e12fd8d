//! Breakpoints, logpoints, and one-shot step hooks.
//!
//! All three bind through the same interception mechanism. A breakpoint
//! hit runs entirely on the target thread: hit-count gate, optional
//! predicate, context capture, `pause` emission, then a blocking wait on a
//! per-id event until the daemon sends a resume. Logpoints render a message
//! template and never suspend. Step hooks are one-shot per originating
//! thread and self-uninstall on first fire.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use dashmap::DashMap;
use serde_json::{Value, json};

use crate::error::CommandError;
use crate::framework::{
    Backtracer, ExprEvaluator, Interceptor, Invocation, ListenerId, MemoryAccess, Transport,
};
use crate::protocol::{
    AgentMessage, BreakpointSpec, FrameInfo, LogpointSpec, TraceEvent, format_hex, parse_hex_addr,
};

/// Frames captured into pause events.
const MAX_PAUSE_FRAMES: usize = 16;
/// Frame memory window around the frame pointer.
const FRAME_WINDOW_BEFORE: u64 = 512;
const FRAME_WINDOW_AFTER: u64 = 128;

/// One process-wide suspension event. Waiters block until signalled.
struct PauseSignal {
    resumed: Mutex<bool>,
    cond: Condvar,
}

impl PauseSignal {
    fn new() -> Self {
        Self {
            resumed: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut resumed = self.resumed.lock().unwrap_or_else(|e| e.into_inner());
        while !*resumed {
            resumed = self
                .cond
                .wait(resumed)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn signal(&self) {
        *self.resumed.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.cond.notify_all();
    }
}

/// Per-id suspension events plus the thread → id index used by resume.
#[derive(Default)]
pub struct PauseTable {
    signals: DashMap<String, Arc<PauseSignal>>,
    paused_threads: DashMap<u32, String>,
}

impl PauseTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block the calling thread until the id's event is signalled.
    pub fn wait(&self, id: &str, thread_id: u32) {
        let signal = self
            .signals
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(PauseSignal::new()))
            .clone();
        self.paused_threads.insert(thread_id, id.to_string());
        signal.wait();
        self.paused_threads.remove(&thread_id);
    }

    /// Deliver a resume to whatever id the thread is paused at.
    pub fn resume_thread(&self, thread_id: u32) -> bool {
        let Some((_, id)) = self.paused_threads.remove(&thread_id) else {
            return false;
        };
        match self.signals.remove(&id) {
            Some((_, signal)) => {
                signal.signal();
                true
            }
            None => false,
        }
    }

    pub fn paused_count(&self) -> usize {
        self.paused_threads.len()
    }

    /// Session teardown: wake everything.
    pub fn release_all(&self) {
        self.paused_threads.clear();
        for entry in self.signals.iter() {
            entry.value().signal();
        }
        self.signals.clear();
    }
}

enum TrapKind {
    Breakpoint {
        condition: Option<String>,
        hit_gate: u32,
        hits: AtomicU32,
    },
    Logpoint {
        template: String,
    },
    Step {
        thread_id: u32,
        group: Arc<StepGroup>,
    },
}

/// A set of one-shot step listeners that fire at most once collectively.
struct StepGroup {
    fired: AtomicBool,
    listeners: Mutex<Vec<(u64, ListenerId)>>,
}

struct TrapEntry {
    id: String,
    static_address: u64,
    file: Option<String>,
    line: Option<u32>,
    function: Option<String>,
    kind: TrapKind,
}

/// Shared callback state: everything a trap hit needs on the target thread.
pub struct TrapDispatch {
    entries: DashMap<u64, Arc<TrapEntry>>,
    next_token: AtomicU64,
    pause: Arc<PauseTable>,
    transport: Arc<dyn Transport>,
    evaluator: Arc<dyn ExprEvaluator>,
    backtracer: Arc<dyn Backtracer>,
    mem: Arc<dyn MemoryAccess>,
    interceptor: Arc<dyn Interceptor>,
}

impl TrapDispatch {
    /// Entry callback for every trap listener.
    pub fn on_hit(&self, inv: &Invocation) {
        let Some(entry) = self.entries.get(&inv.user_data).map(|e| e.clone()) else {
            return;
        };
        match &entry.kind {
            TrapKind::Breakpoint {
                condition,
                hit_gate,
                hits,
            } => self.on_breakpoint(&entry, condition.as_deref(), *hit_gate, hits, inv),
            TrapKind::Logpoint { template } => self.on_logpoint(&entry, template, inv),
            TrapKind::Step { thread_id, group } => {
                self.on_step(&entry, *thread_id, group, inv)
            }
        }
    }

    fn on_breakpoint(
        &self,
        entry: &TrapEntry,
        condition: Option<&str>,
        hit_gate: u32,
        hits: &AtomicU32,
        inv: &Invocation,
    ) {
        let hit = hits.fetch_add(1, Ordering::Relaxed) + 1;
        if hit < hit_gate {
            return;
        }
        if let Some(condition) = condition {
            match self.evaluator.eval(condition) {
                Ok(value) if truthy(&value) => {}
                Ok(_) => return,
                Err(err) => {
                    // Predicate errors degrade to no pause.
                    self.transport.post(
                        AgentMessage::ConditionError {
                            breakpoint_id: entry.id.clone(),
                            error: err,
                        }
                        .to_value(),
                    );
                    return;
                }
            }
        }

        self.emit_pause(entry, None, inv);
        self.pause.wait(&entry.id, inv.thread_id);
    }

    fn on_logpoint(&self, entry: &TrapEntry, template: &str, inv: &Invocation) {
        let message = render_template(template, &invocation_vars(inv));
        self.transport.post(
            AgentMessage::Events {
                events: vec![TraceEvent::Logpoint {
                    id: entry.id.clone(),
                    message,
                    line: entry.line,
                }],
            }
            .to_value(),
        );
    }

    fn on_step(
        &self,
        entry: &TrapEntry,
        thread_id: u32,
        group: &Arc<StepGroup>,
        inv: &Invocation,
    ) {
        if inv.thread_id != thread_id {
            return;
        }
        if group.fired.swap(true, Ordering::AcqRel) {
            return;
        }
        // Self-uninstall the whole one-shot group before pausing.
        let listeners = std::mem::take(
            &mut *group.listeners.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for (token, listener) in listeners {
            self.entries.remove(&token);
            self.interceptor.detach(listener);
        }

        self.emit_pause(entry, Some(entry.static_address), inv);
        self.pause.wait(&entry.id, inv.thread_id);
    }

    fn emit_pause(&self, entry: &TrapEntry, landing: Option<u64>, inv: &Invocation) {
        let backtrace = self
            .backtracer
            .capture(MAX_PAUSE_FRAMES)
            .into_iter()
            .map(|f| FrameInfo {
                address: format_hex(f.address),
                symbol: f.symbol,
            })
            .collect();

        let mut locals = BTreeMap::new();
        for (name, value) in invocation_vars(inv) {
            locals.insert(name, value);
        }

        let (frame_memory, frame_base) = self.capture_frame(inv.frame_pointer);

        self.transport.post(
            AgentMessage::Events {
                events: vec![TraceEvent::Pause {
                    breakpoint_id: entry.id.clone(),
                    thread_id: inv.thread_id,
                    file: entry.file.clone(),
                    line: entry.line,
                    function: entry.function.clone(),
                    address: landing.map(format_hex),
                    backtrace,
                    locals,
                    frame_memory,
                    frame_base,
                }],
            }
            .to_value(),
        );
    }

    /// Frame memory window around the frame pointer, as hex.
    fn capture_frame(&self, fp: u64) -> (String, String) {
        if fp == 0 {
            return (String::new(), String::new());
        }
        let start = fp.saturating_sub(FRAME_WINDOW_BEFORE);
        let len = (fp - start + FRAME_WINDOW_AFTER) as usize;
        let mut buf = vec![0u8; len];
        if self.mem.read(start, &mut buf).is_err() {
            return (String::new(), format_hex(fp));
        }
        let hex: String = buf.iter().map(|b| format!("{b:02x}")).collect();
        (hex, format_hex(fp))
    }
}

fn invocation_vars(inv: &Invocation) -> BTreeMap<String, Value> {
    let mut vars = BTreeMap::new();
    vars.insert("arg0".to_string(), json!(format_hex(inv.arg0)));
    vars.insert("arg1".to_string(), json!(format_hex(inv.arg1)));
    vars
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(_) => true,
    }
}

/// Render a `{name}` message template. Substituted values get quotes and
/// backslashes escaped; keys containing `__`, `.` or `[` are refused to
/// block attribute traversal and the placeholder stays verbatim.
pub fn render_template(template: &str, vars: &BTreeMap<String, Value>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        match tail.find('}') {
            Some(close) => {
                let key = &tail[..close];
                if key.contains("__") || key.contains('.') || key.contains('[') {
                    out.push('{');
                    out.push_str(key);
                    out.push('}');
                } else {
                    match vars.get(key) {
                        Some(Value::String(s)) => out.push_str(&escape(s)),
                        Some(other) => out.push_str(&escape(&other.to_string())),
                        None => {
                            out.push('{');
                            out.push_str(key);
                            out.push('}');
                        }
                    }
                }
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Agent-thread owner of installed traps.
pub struct TrapService {
    dispatch: Arc<TrapDispatch>,
    installed: HashMap<String, Vec<(u64, ListenerId)>>,
}

impl TrapService {
    pub fn new(
        interceptor: Arc<dyn Interceptor>,
        transport: Arc<dyn Transport>,
        evaluator: Arc<dyn ExprEvaluator>,
        backtracer: Arc<dyn Backtracer>,
        mem: Arc<dyn MemoryAccess>,
        pause: Arc<PauseTable>,
    ) -> Self {
        Self {
            dispatch: Arc::new(TrapDispatch {
                entries: DashMap::new(),
                next_token: AtomicU64::new(1),
                pause,
                transport,
                evaluator,
                backtracer,
                mem,
                interceptor,
            }),
            installed: HashMap::new(),
        }
    }

    pub fn dispatch(&self) -> Arc<TrapDispatch> {
        self.dispatch.clone()
    }

    fn attach_entry(
        &mut self,
        address: u64,
        entry: TrapEntry,
    ) -> Result<(u64, ListenerId), CommandError> {
        let token = self.dispatch.next_token.fetch_add(1, Ordering::Relaxed);
        let listener = self
            .dispatch
            .interceptor
            .attach(address, token)
            .map_err(|err| CommandError::validation(format!("cannot trap 0x{address:x}: {err}")))?;
        let id = entry.id.clone();
        self.dispatch.entries.insert(token, Arc::new(entry));
        self.installed.entry(id).or_default().push((token, listener));
        Ok((token, listener))
    }

    pub fn add_breakpoint(&mut self, spec: &BreakpointSpec, slide: i64) -> Result<(), CommandError> {
        let static_address = spec
            .address
            .as_deref()
            .map(parse_hex_addr)
            .transpose()?
            .ok_or_else(|| {
                CommandError::validation(format!("breakpoint {:?} has no resolved address", spec.id))
            })?;
        let runtime = static_address.wrapping_add(slide as u64);
        self.remove(&spec.id);
        self.attach_entry(
            runtime,
            TrapEntry {
                id: spec.id.clone(),
                static_address,
                file: spec.file.clone(),
                line: spec.line,
                function: spec.function.clone(),
                kind: TrapKind::Breakpoint {
                    condition: spec.condition.clone(),
                    hit_gate: spec.hit_count.unwrap_or(1).max(1),
                    hits: AtomicU32::new(0),
                },
            },
        )?;
        Ok(())
    }

    pub fn add_logpoint(&mut self, spec: &LogpointSpec, slide: i64) -> Result<(), CommandError> {
        let static_address = spec
            .address
            .as_deref()
            .map(parse_hex_addr)
            .transpose()?
            .ok_or_else(|| {
                CommandError::validation(format!("logpoint {:?} has no resolved address", spec.id))
            })?;
        let runtime = static_address.wrapping_add(slide as u64);
        self.remove(&spec.id);
        self.attach_entry(
            runtime,
            TrapEntry {
                id: spec.id.clone(),
                static_address,
                file: spec.file.clone(),
                line: spec.line,
                function: None,
                kind: TrapKind::Logpoint {
                    template: spec.message.clone(),
                },
            },
        )?;
        Ok(())
    }

    /// Install one-shot step hooks for a thread. Landing addresses are
    /// static; the runtime address is reported back minus the slide.
    pub fn add_step_hooks(
        &mut self,
        thread_id: u32,
        one_shot: &[String],
        return_address: Option<&str>,
        slide: i64,
    ) -> Result<(), CommandError> {
        let id = format!("step-{thread_id}");
        self.remove(&id);

        let group = Arc::new(StepGroup {
            fired: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        });

        let mut addresses: Vec<u64> = one_shot
            .iter()
            .map(|a| parse_hex_addr(a))
            .collect::<Result<_, _>>()?;
        if let Some(ra) = return_address {
            addresses.push(parse_hex_addr(ra)?);
        }

        for static_address in addresses {
            let runtime = static_address.wrapping_add(slide as u64);
            let (token, listener) = self.attach_entry(
                runtime,
                TrapEntry {
                    id: id.clone(),
                    static_address,
                    file: None,
                    line: None,
                    function: None,
                    kind: TrapKind::Step {
                        thread_id,
                        group: group.clone(),
                    },
                },
            )?;
            group
                .listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((token, listener));
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> bool {
        match self.installed.remove(id) {
            Some(listeners) => {
                for (token, listener) in listeners {
                    // Step groups may have detached themselves already.
                    if self.dispatch.entries.remove(&token).is_some() {
                        self.dispatch.interceptor.detach(listener);
                    }
                }
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        let ids: Vec<String> = self.installed.keys().cloned().collect();
        for id in ids {
            self.remove(&id);
        }
        self.dispatch.pause.release_all();
    }

    pub fn len(&self) -> usize {
        self.installed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{CollectingTransport, Frame, NullEvaluator, ProcessMemory};
    use crate::hooks::test_support::MockInterceptor;
    use std::time::Duration;

    struct FixedBacktrace;

    impl Backtracer for FixedBacktrace {
        fn capture(&self, _max: usize) -> Vec<Frame> {
            vec![
                Frame {
                    address: 0x1010,
                    symbol: Some("foo".into()),
                },
                Frame {
                    address: 0x2020,
                    symbol: None,
                },
            ]
        }
    }

    /// Evaluator returning a canned value per expression.
    struct TableEvaluator(BTreeMap<String, Result<Value, String>>);

    impl ExprEvaluator for TableEvaluator {
        fn eval(&self, expr: &str) -> Result<Value, String> {
            self.0
                .get(expr)
                .cloned()
                .unwrap_or_else(|| Err(format!("unknown expr {expr:?}")))
        }
    }

    fn service_with(
        evaluator: Arc<dyn ExprEvaluator>,
    ) -> (TrapService, Arc<CollectingTransport>, Arc<PauseTable>) {
        let transport = Arc::new(CollectingTransport::new());
        let pause = Arc::new(PauseTable::new());
        let service = TrapService::new(
            Arc::new(MockInterceptor::default()),
            transport.clone(),
            evaluator,
            Arc::new(FixedBacktrace),
            Arc::new(ProcessMemory::new()),
            pause.clone(),
        );
        (service, transport, pause)
    }

    fn bp(id: &str, addr: &str) -> BreakpointSpec {
        BreakpointSpec {
            id: id.into(),
            address: Some(addr.into()),
            file: Some("main.c".into()),
            line: Some(12),
            function: Some("foo".into()),
            condition: None,
            hit_count: None,
        }
    }

    fn hit(dispatch: &Arc<TrapDispatch>, token: u64, thread_id: u32) -> std::thread::JoinHandle<()> {
        let dispatch = dispatch.clone();
        std::thread::spawn(move || {
            dispatch.on_hit(&Invocation {
                user_data: token,
                thread_id,
                arg0: 200,
                ..Invocation::default()
            });
        })
    }

    fn wait_for_pause(pause: &PauseTable) {
        for _ in 0..200 {
            if pause.paused_count() > 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("thread never paused");
    }

    #[test]
    fn breakpoint_pauses_and_resumes() {
        let (mut service, transport, pause) = service_with(Arc::new(NullEvaluator));
        service.add_breakpoint(&bp("bp1", "0x100"), 0).unwrap();
        let dispatch = service.dispatch();

        let worker = hit(&dispatch, 1, 42);
        wait_for_pause(&pause);

        // The pause event went out before the thread blocked.
        let events = transport.snapshot();
        let pause_event = events
            .iter()
            .find(|m| m["type"] == "events")
            .expect("pause batch");
        assert_eq!(pause_event["events"][0]["type"], "pause");
        assert_eq!(pause_event["events"][0]["breakpointId"], "bp1");
        assert_eq!(pause_event["events"][0]["threadId"], 42);
        assert_eq!(pause_event["events"][0]["file"], "main.c");
        assert!(pause_event["events"][0]["backtrace"].is_array());

        assert!(pause.resume_thread(42));
        worker.join().unwrap();
        assert_eq!(pause.paused_count(), 0);
    }

    #[test]
    fn hit_count_gate_defers_the_pause() {
        let (mut service, transport, pause) = service_with(Arc::new(NullEvaluator));
        let mut spec = bp("bp2", "0x100");
        spec.hit_count = Some(3);
        service.add_breakpoint(&spec, 0).unwrap();
        let dispatch = service.dispatch();

        // First two hits pass through without pausing or emitting.
        for _ in 0..2 {
            dispatch.on_hit(&Invocation {
                user_data: 1,
                thread_id: 7,
                ..Invocation::default()
            });
        }
        assert!(transport.snapshot().is_empty());

        let worker = hit(&dispatch, 1, 7);
        wait_for_pause(&pause);
        pause.resume_thread(7);
        worker.join().unwrap();
    }

    #[test]
    fn false_condition_means_no_pause() {
        let mut table = BTreeMap::new();
        table.insert("args[0] > 100".to_string(), Ok(json!(false)));
        let (mut service, transport, _pause) = service_with(Arc::new(TableEvaluator(table)));

        let mut spec = bp("bp3", "0x100");
        spec.condition = Some("args[0] > 100".into());
        service.add_breakpoint(&spec, 0).unwrap();

        service.dispatch().on_hit(&Invocation {
            user_data: 1,
            thread_id: 1,
            arg0: 50,
            ..Invocation::default()
        });
        assert!(transport.snapshot().is_empty());
    }

    #[test]
    fn condition_error_degrades_to_condition_error_event() {
        let (mut service, transport, _pause) = service_with(Arc::new(NullEvaluator));
        let mut spec = bp("bp4", "0x100");
        spec.condition = Some("bogus".into());
        service.add_breakpoint(&spec, 0).unwrap();

        service.dispatch().on_hit(&Invocation {
            user_data: 1,
            thread_id: 1,
            ..Invocation::default()
        });

        let events = transport.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["type"], "condition_error");
        assert_eq!(events[0]["breakpointId"], "bp4");
    }

    #[test]
    fn logpoint_renders_and_never_suspends() {
        let (mut service, transport, pause) = service_with(Arc::new(NullEvaluator));
        service
            .add_logpoint(
                &LogpointSpec {
                    id: "lp1".into(),
                    address: Some("0x200".into()),
                    file: None,
                    line: Some(33),
                    message: "first arg is {arg0}".into(),
                },
                0,
            )
            .unwrap();

        service.dispatch().on_hit(&Invocation {
            user_data: 1,
            thread_id: 1,
            arg0: 0xAB,
            ..Invocation::default()
        });

        assert_eq!(pause.paused_count(), 0);
        let events = transport.snapshot();
        let logpoint = &events[0]["events"][0];
        assert_eq!(logpoint["type"], "logpoint");
        assert_eq!(logpoint["message"], "first arg is 0xab");
        assert_eq!(logpoint["line"], 33);
    }

    #[test]
    fn step_hooks_fire_once_for_the_right_thread() {
        let (mut service, transport, pause) = service_with(Arc::new(NullEvaluator));
        service
            .add_step_hooks(9, &["0x300".into(), "0x310".into()], None, 0x1000)
            .unwrap();
        let dispatch = service.dispatch();

        // Wrong thread: ignored, hooks stay armed.
        dispatch.on_hit(&Invocation {
            user_data: 1,
            thread_id: 8,
            ..Invocation::default()
        });
        assert!(transport.take().is_empty());

        let worker = hit(&dispatch, 1, 9);
        wait_for_pause(&pause);

        let events = transport.take();
        let pause_event = &events[0]["events"][0];
        assert_eq!(pause_event["type"], "pause");
        assert_eq!(pause_event["breakpointId"], "step-9");
        // Landing address is reported slide-subtracted.
        assert_eq!(pause_event["address"], "0x300");

        pause.resume_thread(9);
        worker.join().unwrap();

        // The group self-uninstalled: the second landing is dead.
        dispatch.on_hit(&Invocation {
            user_data: 2,
            thread_id: 9,
            ..Invocation::default()
        });
        assert!(transport.take().is_empty());
    }

    #[test]
    fn remove_and_clear_detach_listeners() {
        let (mut service, _transport, _pause) = service_with(Arc::new(NullEvaluator));
        service.add_breakpoint(&bp("a", "0x100"), 0).unwrap();
        service.add_breakpoint(&bp("b", "0x200"), 0).unwrap();
        assert_eq!(service.len(), 2);

        assert!(service.remove("a"));
        assert!(!service.remove("a"));
        assert_eq!(service.len(), 1);

        service.clear();
        assert!(service.is_empty());
    }

    #[test]
    fn template_rendering_escapes_and_blocks_traversal() {
        let mut vars = BTreeMap::new();
        vars.insert("name".to_string(), json!("a\"b\\c"));
        vars.insert("n".to_string(), json!(7));

        assert_eq!(
            render_template("hello {name} x{n}", &vars),
            "hello a\\\"b\\\\c x7"
        );
        // Traversal-shaped keys stay verbatim.
        assert_eq!(
            render_template("{a.b} {__class__} {x[0]}", &vars),
            "{a.b} {__class__} {x[0]}"
        );
        // Unknown keys stay verbatim too.
        assert_eq!(render_template("{missing}", &vars), "{missing}");
        assert_eq!(render_template("unterminated {oops", &vars), "unterminated {oops");
    }
}
