//! Agent façade: owns every component, dispatches daemon commands, and
//! drives the cooperative timers on a dedicated single-threaded runtime.
//!
//! The framework's receive primitive is one-shot by design, so the
//! dispatcher re-registers each command's handler before processing it;
//! a handler failure still produces a response so the daemon never hangs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use strobe_wire::RING_CAPACITY;

use crate::breakpoints::{PauseTable, TrapDispatch, TrapService};
use crate::drain::EventAssembler;
use crate::framework::{
    Backtracer, ExprEvaluator, Interceptor, MemoryAccess, ModuleMap, ThreadRegistry, Transport,
};
use crate::hooks::{FunctionTarget, HookDispatch, HookEngine};
use crate::interp::{InterpAssembler, InterpEventQueue, InterpreterTracer};
use crate::memory::{self, PollState};
use crate::metrics::Metrics;
use crate::output::OutputCapture;
use crate::platform::Platform;
use crate::protocol::{
    AgentMessage, Command, HookAction, HookMode, TraceEvent, parse_hex_addr,
};
use crate::ring::{RingDrainer, RingProducer, RingShared};
use crate::sampler::{AdaptiveSampler, RateTracker, RateTrackerConfig};
use crate::watch::WatchSet;

/// Drain cadence.
const DRAIN_INTERVAL: Duration = Duration::from_millis(10);
/// Interp queue flush cadence.
const INTERP_FLUSH_INTERVAL: Duration = Duration::from_millis(crate::interp::INTERP_FLUSH_MS);
/// Drain ticks between `sampling_stats` reports (~1s).
const STATS_EVERY_TICKS: u64 = 100;

/// Framework bindings handed to the agent at load.
pub struct AgentDeps {
    pub interceptor: Arc<dyn Interceptor>,
    pub transport: Arc<dyn Transport>,
    pub evaluator: Arc<dyn ExprEvaluator>,
    pub mem: Arc<dyn MemoryAccess>,
    pub threads: Arc<dyn ThreadRegistry>,
    pub modules: Arc<dyn ModuleMap>,
    pub backtracer: Arc<dyn Backtracer>,
}

/// One-shot command registration table. `accept` consumes the arming for
/// a command kind; the dispatcher re-arms before processing so back-to-
/// back commands are never missed.
pub struct OneShotReceiver {
    armed: HashSet<&'static str>,
}

const COMMAND_KINDS: &[&str] = &[
    "initialize",
    "hooks",
    "watches",
    "read_memory",
    "write_memory",
    "breakpoints",
    "logpoints",
    "step",
    "resume",
    "dispose",
];

impl OneShotReceiver {
    pub fn new() -> Self {
        Self {
            armed: COMMAND_KINDS.iter().copied().collect(),
        }
    }

    pub fn accept(&mut self, kind: &str) -> bool {
        self.armed.remove(kind)
    }

    pub fn rearm(&mut self, kind: &'static str) {
        self.armed.insert(kind);
    }

    pub fn is_armed(&self, kind: &str) -> bool {
        self.armed.contains(kind)
    }
}

impl Default for OneShotReceiver {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Agent {
    shared: Arc<RingShared>,
    engine: HookEngine,
    watches: WatchSet,
    assembler: EventAssembler,
    sampler: AdaptiveSampler,
    tracker: RateTracker,
    traps: TrapService,
    pause: Arc<PauseTable>,
    output: Arc<OutputCapture>,
    metrics: Arc<Metrics>,
    interp_queue: Arc<InterpEventQueue>,
    interp_assembler: InterpAssembler,
    tracers: Vec<Box<dyn InterpreterTracer + Send>>,
    poll: Option<PollState>,
    receiver: OneShotReceiver,
    deps: AgentDeps,
    platform: Platform,
    drain_ticks: u64,
}

impl Agent {
    pub fn new(platform: Platform, deps: AgentDeps) -> std::io::Result<Self> {
        let shared = RingShared::new()?;
        let pause = Arc::new(PauseTable::new());
        let traps = TrapService::new(
            deps.interceptor.clone(),
            deps.transport.clone(),
            deps.evaluator.clone(),
            deps.backtracer.clone(),
            deps.mem.clone(),
            pause.clone(),
        );
        let assembler = EventAssembler::new(
            RingDrainer::new(shared.clone()),
            platform.ticks_to_ns_ratio(),
        );
        Ok(Self {
            engine: HookEngine::new(deps.interceptor.clone()),
            watches: WatchSet::new(),
            assembler,
            sampler: AdaptiveSampler::new(),
            tracker: RateTracker::new(RateTrackerConfig::default()),
            traps,
            pause,
            output: Arc::new(OutputCapture::new()),
            metrics: Arc::new(Metrics::new()),
            interp_queue: Arc::new(InterpEventQueue::new()),
            interp_assembler: InterpAssembler::new(),
            tracers: Vec::new(),
            poll: None,
            receiver: OneShotReceiver::new(),
            deps,
            platform,
            shared,
            drain_ticks: 0,
        })
    }

    /// Platform primitives, including the resolved `write` entrypoint the
    /// embedder hooks for output capture.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// The hook fast path for the framework's enter/exit callbacks.
    pub fn hook_dispatch(&self) -> HookDispatch {
        HookDispatch::new(RingProducer::new(self.shared.clone()))
    }

    /// The trap callback for breakpoint/logpoint/step listeners.
    pub fn trap_dispatch(&self) -> Arc<TrapDispatch> {
        self.traps.dispatch()
    }

    pub fn output_capture(&self) -> Arc<OutputCapture> {
        self.output.clone()
    }

    pub fn interp_queue(&self) -> Arc<InterpEventQueue> {
        self.interp_queue.clone()
    }

    pub fn pause_table(&self) -> Arc<PauseTable> {
        self.pause.clone()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    pub fn register_tracer(&mut self, tracer: Box<dyn InterpreterTracer + Send>) {
        let caps = tracer.capabilities();
        log::info!(
            "registered {} tracer (multiHook={}, degraded={:?})",
            caps.runtime,
            caps.multi_hook,
            caps.degraded
        );
        self.tracers.push(tracer);
    }

    pub fn announce_loaded(&self) {
        self.post(AgentMessage::AgentLoaded {
            pid: std::process::id(),
        });
    }

    /// Post with the output re-entrancy guard held, so the transport's own
    /// write(2) is never re-captured.
    fn post(&self, message: AgentMessage) {
        let _guard = self.output.reentry_guard();
        self.deps.transport.post(message.to_value());
    }

    /// Entry point for one daemon message.
    pub fn handle_message(&mut self, value: Value) {
        let command: Command = match serde_json::from_value(value) {
            Ok(command) => command,
            Err(err) => {
                log::warn!("unparsable command: {err}");
                self.post(AgentMessage::Log {
                    level: "error".into(),
                    message: format!("unparsable command: {err}"),
                });
                return;
            }
        };

        let kind = command.kind();
        if !self.receiver.accept(kind) {
            log::warn!("command {kind} arrived while handler was not registered");
        }
        // Re-register before processing: a command arriving mid-handler
        // must find the handler armed.
        self.receiver.rearm(kind);

        let response = self.dispatch(&command).unwrap_or_else(|err| {
            log::warn!("{kind} failed: {err}");
            self.fallback_response(&command, &err)
        });
        self.post(response);
    }

    /// A failed handler still answers, so the daemon does not hang.
    fn fallback_response(&self, command: &Command, err: &anyhow::Error) -> AgentMessage {
        match command {
            Command::Hooks { .. } => AgentMessage::HooksUpdated {
                installed: 0,
                dropped: 0,
            },
            Command::Watches { .. } => AgentMessage::WatchesUpdated { count: 0 },
            Command::ReadMemory { .. } | Command::WriteMemory { .. } => {
                AgentMessage::ReadResponse {
                    results: Vec::new(),
                }
            }
            _ => AgentMessage::Log {
                level: "error".into(),
                message: format!("{} failed: {err}", command.kind()),
            },
        }
    }

    fn dispatch(&mut self, command: &Command) -> anyhow::Result<AgentMessage> {
        match command {
            Command::Initialize { session_id } => {
                self.assembler.start_session(session_id);
                self.interp_assembler.clear();
                self.output.reset();
                log::info!("session {session_id} initialized");
                Ok(AgentMessage::Initialized {
                    session_id: session_id.clone(),
                })
            }

            Command::Hooks {
                action,
                functions,
                targets,
                image_base,
                mode,
                serialization_depth,
            } => {
                if let Some(base) = image_base.as_deref() {
                    self.engine
                        .set_image_base(parse_hex_addr(base)?, self.deps.modules.as_ref());
                }
                if let Some(depth) = serialization_depth {
                    self.assembler.set_serialization_depth(*depth);
                }
                let mode = mode.unwrap_or(HookMode::Full);
                let mut installed = 0u32;
                let mut dropped = 0u32;
                match action {
                    HookAction::Add => {
                        for spec in functions {
                            let target = FunctionTarget {
                                address: parse_hex_addr(&spec.address)?,
                                name: spec.name.clone(),
                                raw_name: spec.raw_name.clone(),
                                source_file: spec.source_file.clone(),
                                line: spec.line,
                                no_slide: spec.no_slide,
                                arg_types: spec.arg_types.clone(),
                            };
                            match self.engine.install(target, mode) {
                                Some(_) => installed += 1,
                                None => dropped += 1,
                            }
                        }
                        for tracer in &mut self.tracers {
                            installed += tracer.install_hooks(targets) as u32;
                        }
                    }
                    HookAction::Remove => {
                        for spec in functions {
                            if self.engine.remove(parse_hex_addr(&spec.address)?, spec.no_slide)
                            {
                                installed += 1;
                            }
                        }
                        for tracer in &mut self.tracers {
                            installed += tracer.remove_hooks(targets) as u32;
                        }
                    }
                }
                Ok(AgentMessage::HooksUpdated { installed, dropped })
            }

            Command::Watches {
                watches,
                expr_watches,
            } => {
                let count = self.watches.configure(
                    &self.shared,
                    self.engine.slide(),
                    watches,
                    expr_watches,
                    &self.engine,
                )?;
                Ok(AgentMessage::WatchesUpdated {
                    count: count as u32,
                })
            }

            Command::ReadMemory {
                recipes,
                image_base,
                poll,
            } => {
                if let Some(base) = image_base.as_deref() {
                    self.engine
                        .set_image_base(parse_hex_addr(base)?, self.deps.modules.as_ref());
                }
                let slide = self.engine.slide();
                match poll {
                    Some(spec) => {
                        // A new poll supersedes any active one.
                        if self.poll.is_some() {
                            log::info!("superseding active poll");
                        }
                        self.poll = Some(PollState::new(
                            *spec,
                            recipes.clone(),
                            slide,
                            Instant::now(),
                        )?);
                        Ok(AgentMessage::Log {
                            level: "info".into(),
                            message: "poll started".into(),
                        })
                    }
                    None => Ok(AgentMessage::ReadResponse {
                        results: memory::read_recipes(self.deps.mem.as_ref(), recipes, slide)?,
                    }),
                }
            }

            Command::WriteMemory {
                recipes,
                image_base,
            } => {
                if let Some(base) = image_base.as_deref() {
                    self.engine
                        .set_image_base(parse_hex_addr(base)?, self.deps.modules.as_ref());
                }
                Ok(AgentMessage::ReadResponse {
                    results: memory::write_recipes(
                        self.deps.mem.as_ref(),
                        recipes,
                        self.engine.slide(),
                    )?,
                })
            }

            Command::Breakpoints { add, remove } => {
                for id in remove {
                    self.traps.remove(id);
                }
                let mut errors = Vec::new();
                for spec in add {
                    if spec.address.is_some() {
                        if let Err(err) = self.traps.add_breakpoint(spec, self.engine.slide()) {
                            errors.push(err.to_string());
                        }
                    } else {
                        for tracer in &mut self.tracers {
                            if let Err(err) =
                                tracer.update_breakpoints(std::slice::from_ref(spec), &[])
                            {
                                errors.push(err.to_string());
                            }
                        }
                    }
                }
                for tracer in &mut self.tracers {
                    let _ = tracer.update_breakpoints(&[], remove);
                }
                Ok(ack("breakpoints", errors))
            }

            Command::Logpoints { add, remove } => {
                for id in remove {
                    self.traps.remove(id);
                }
                let mut errors = Vec::new();
                for spec in add {
                    if spec.address.is_some() {
                        if let Err(err) = self.traps.add_logpoint(spec, self.engine.slide()) {
                            errors.push(err.to_string());
                        }
                    } else {
                        for tracer in &mut self.tracers {
                            if let Err(err) =
                                tracer.update_logpoints(std::slice::from_ref(spec), &[])
                            {
                                errors.push(err.to_string());
                            }
                        }
                    }
                }
                for tracer in &mut self.tracers {
                    let _ = tracer.update_logpoints(&[], remove);
                }
                Ok(ack("logpoints", errors))
            }

            Command::Step {
                thread_id,
                one_shot,
                image_base,
                return_address,
            } => {
                if let Some(base) = image_base.as_deref() {
                    self.engine
                        .set_image_base(parse_hex_addr(base)?, self.deps.modules.as_ref());
                }
                self.traps.add_step_hooks(
                    *thread_id,
                    one_shot,
                    return_address.as_deref(),
                    self.engine.slide(),
                )?;
                Ok(ack("step", Vec::new()))
            }

            Command::Resume { thread_id, action } => {
                let delivered = self.pause.resume_thread(*thread_id);
                if !delivered {
                    log::warn!("resume for thread {thread_id} found no paused thread");
                }
                log::debug!("resume {action:?} delivered={delivered}");
                Ok(ack("resume", Vec::new()))
            }

            Command::Dispose => {
                self.dispose();
                Ok(AgentMessage::Log {
                    level: "info".into(),
                    message: "disposed".into(),
                })
            }
        }
    }

    /// Flush-and-stop: final drain, flush output and interp queues, tear
    /// every component back to its pre-initialize state.
    fn dispose(&mut self) {
        self.on_drain_tick();
        self.on_interp_flush();
        self.poll = None;
        self.traps.clear();
        self.engine.clear();
        self.watches.clear(&self.shared);
        for tracer in &mut self.tracers {
            tracer.dispose();
        }
        self.tracker.clear();
        self.sampler = AdaptiveSampler::new();
        self.shared.set_sample_interval(1);
        self.assembler.reset();
        self.interp_assembler.clear();
        self.output.reset();
        self.pause.release_all();
        log::info!("agent disposed");
    }

    /// The 10ms drain timer body.
    pub fn on_drain_tick(&mut self) {
        self.drain_tick(Instant::now());
    }

    fn drain_tick(&mut self, now: Instant) {
        let outcome = self.assembler.tick(
            &self.engine,
            &self.watches,
            &mut self.tracker,
            self.deps.evaluator.as_ref(),
            self.deps.mem.as_ref(),
            self.deps.threads.as_ref(),
            &self.metrics,
            now,
        );

        let mut events = outcome.events;
        self.collect_output_events(&mut events);
        self.poll_tick(now, &mut events);
        if !events.is_empty() {
            self.post(AgentMessage::Events { events });
        }

        for transition in self.tracker.take_transitions() {
            let function = self
                .engine
                .lookup(transition.func_id)
                .map(|h| h.target.name.clone())
                .unwrap_or_else(|| format!("func#{}", transition.func_id));
            self.post(AgentMessage::SamplingStateChange {
                function,
                enabled: transition.enabled,
            });
        }

        if let Some(interval) = self.sampler.observe(outcome.drained, RING_CAPACITY as usize) {
            self.shared.set_sample_interval(interval);
            log::info!("sampling interval -> {interval}");
        }

        self.drain_ticks += 1;
        if self.drain_ticks % STATS_EVERY_TICKS == 0 && self.assembler.session_id().is_some() {
            self.post(AgentMessage::SamplingStats {
                interval: self.sampler.interval(),
                stats: self.metrics.snapshot(),
            });
        }
    }

    fn collect_output_events(&mut self, events: &mut Vec<TraceEvent>) {
        for chunk in self.output.take() {
            let timestamp_ns = self.assembler.ticks_to_ns(chunk.ticks);
            let Some(id) = self.assembler.next_event_id() else {
                return;
            };
            let session_id = self
                .assembler
                .session_id()
                .unwrap_or_default()
                .to_string();
            events.push(if chunk.fd == 1 {
                TraceEvent::Stdout {
                    id,
                    session_id,
                    timestamp_ns,
                    text: chunk.text,
                }
            } else {
                TraceEvent::Stderr {
                    id,
                    session_id,
                    timestamp_ns,
                    text: chunk.text,
                }
            });
        }
    }

    fn poll_tick(&mut self, now: Instant, events: &mut Vec<TraceEvent>) {
        let expired = match &self.poll {
            None => return,
            Some(poll) => poll.expired(now),
        };
        if expired {
            self.poll = None;
            self.post(AgentMessage::PollComplete);
            return;
        }
        if let Some(poll) = self.poll.as_mut() {
            if poll.due(now) {
                let data =
                    memory::snapshot_data(self.deps.mem.as_ref(), &poll.recipes, poll.slide);
                if let Some(id) = self.assembler.next_event_id() {
                    events.push(TraceEvent::VariableSnapshot {
                        id,
                        timestamp_ns: self
                            .assembler
                            .ticks_to_ns(crate::platform::timestamp_ticks()),
                        thread_id: 0,
                        data,
                    });
                }
            }
        }
    }

    /// The 50ms interp flush timer body.
    pub fn on_interp_flush(&mut self) {
        if self.interp_queue.is_empty() {
            return;
        }
        let raw = self.interp_queue.take();
        let ratio = self.assembler.ratio();
        // Interp events share the session's id counter with the drain.
        let Some(ids) = self.assembler.ids_mut() else {
            return;
        };
        let events = self.interp_assembler.assemble(raw, ids, ratio);
        if !events.is_empty() {
            self.post(AgentMessage::Events { events });
        }
    }
}

fn ack(what: &str, errors: Vec<String>) -> AgentMessage {
    if errors.is_empty() {
        AgentMessage::Log {
            level: "info".into(),
            message: format!("{what} updated"),
        }
    } else {
        AgentMessage::Log {
            level: "warn".into(),
            message: format!("{what} updated with errors: {}", errors.join("; ")),
        }
    }
}

/// Spawns the agent thread: a current-thread runtime so timers and
/// command handlers are cooperative and serialized.
pub struct AgentHandle {
    tx: tokio::sync::mpsc::UnboundedSender<Value>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl AgentHandle {
    pub fn spawn(mut agent: Agent) -> std::io::Result<AgentHandle> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Value>();
        let join = std::thread::Builder::new()
            .name("strobe-agent".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        log::error!("agent runtime failed to start: {err}");
                        return;
                    }
                };
                runtime.block_on(async move {
                    agent.announce_loaded();
                    let mut drain = tokio::time::interval(DRAIN_INTERVAL);
                    let mut flush = tokio::time::interval(INTERP_FLUSH_INTERVAL);
                    loop {
                        tokio::select! {
                            command = rx.recv() => match command {
                                Some(value) => agent.handle_message(value),
                                None => break,
                            },
                            _ = drain.tick() => agent.on_drain_tick(),
                            _ = flush.tick() => agent.on_interp_flush(),
                        }
                    }
                });
            })?;
        Ok(AgentHandle {
            tx,
            join: Some(join),
        })
    }

    pub fn send(&self, command: Value) -> bool {
        self.tx.send(command).is_ok()
    }

    pub fn shutdown(mut self) {
        let _ = self.tx.send(serde_json::json!({"type": "dispose"}));
        drop(self.tx);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framework::{
        CollectingTransport, Invocation, NullBacktracer, NullEvaluator, ProcThreads,
        ProcessMemory,
    };
    use crate::hooks::encode_user_data;
    use crate::hooks::test_support::{FixedModuleMap, MockInterceptor};
    use serde_json::json;

    fn agent() -> (Agent, Arc<CollectingTransport>, Arc<MockInterceptor>) {
        let transport = Arc::new(CollectingTransport::new());
        let interceptor = Arc::new(MockInterceptor::default());
        let agent = Agent::new(
            Platform::init().expect("supported platform"),
            AgentDeps {
                interceptor: interceptor.clone(),
                transport: transport.clone(),
                evaluator: Arc::new(NullEvaluator),
                mem: Arc::new(ProcessMemory::new()),
                threads: Arc::new(ProcThreads),
                modules: Arc::new(FixedModuleMap(0x1000)),
                backtracer: Arc::new(NullBacktracer),
            },
        )
        .unwrap();
        (agent, transport, interceptor)
    }

    fn initialize(agent: &mut Agent, session: &str) {
        agent.handle_message(json!({"type": "initialize", "sessionId": session}));
    }

    fn add_hook(agent: &mut Agent, addr: &str, name: &str) {
        agent.handle_message(json!({
            "type": "hooks", "action": "add", "imageBase": "0x0",
            "functions": [{"address": addr, "name": name}]
        }));
    }

    #[test]
    fn happy_path_trace_roundtrip() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (mut agent, transport, _) = agent();
        initialize(&mut agent, "S");
        add_hook(&mut agent, "0x100", "foo");
        transport.take();

        // Host calls foo(0xA, 0xB) -> 0xC.
        let dispatch = agent.hook_dispatch();
        let inv = Invocation {
            user_data: encode_user_data(1, false),
            thread_id: 5,
            arg0: 0xA,
            arg1: 0xB,
            ..Invocation::default()
        };
        dispatch.on_enter(&inv);
        dispatch.on_exit(&Invocation { retval: 0xC, ..inv });

        agent.on_drain_tick();
        let messages = transport.take();
        let batch = messages
            .iter()
            .find(|m| m["type"] == "events")
            .expect("events batch");
        let events = batch["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["type"], "function_enter");
        assert_eq!(events[0]["id"], "S-1");
        assert_eq!(events[0]["functionName"], "foo");
        assert_eq!(events[0]["arguments"], json!(["0xa", "0xb"]));
        assert_eq!(events[1]["type"], "function_exit");
        assert_eq!(events[1]["id"], "S-2");
        assert_eq!(events[1]["parentEventId"], "S-1");
        assert_eq!(events[1]["returnValue"], "0xc");
    }

    #[test]
    fn responses_are_posted_per_command() {
        let (mut agent, transport, _) = agent();
        initialize(&mut agent, "S");
        let messages = transport.take();
        assert_eq!(messages[0]["type"], "initialized");
        assert_eq!(messages[0]["sessionId"], "S");

        add_hook(&mut agent, "0x100", "foo");
        let messages = transport.take();
        assert_eq!(messages[0]["type"], "hooks_updated");
        assert_eq!(messages[0]["installed"], 1);
    }

    #[test]
    fn failed_commands_still_answer() {
        let (mut agent, transport, _) = agent();
        initialize(&mut agent, "S");
        transport.take();

        // Five fast watches exceed the four header slots: validation error.
        let watches: Vec<Value> = (0..5)
            .map(|i| {
                json!({"label": format!("w{i}"), "address": "0x1000", "size": 4})
            })
            .collect();
        agent.handle_message(json!({"type": "watches", "watches": watches}));

        let messages = transport.take();
        assert_eq!(messages[0]["type"], "watches_updated");
        assert_eq!(messages[0]["count"], 0);
    }

    #[test]
    fn one_shot_receiver_is_rearmed_before_processing() {
        let (mut agent, transport, _) = agent();
        // Back-to-back commands of the same kind are all handled.
        initialize(&mut agent, "A");
        initialize(&mut agent, "B");
        let messages = transport.take();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1]["sessionId"], "B");
        assert!(agent.receiver.is_armed("initialize"));
    }

    #[test]
    fn dispose_then_initialize_resets_everything() {
        let (mut agent, transport, interceptor) = agent();
        initialize(&mut agent, "S");
        add_hook(&mut agent, "0x100", "foo");
        assert_eq!(interceptor.attached_count(), 1);

        agent.handle_message(json!({"type": "dispose"}));
        assert_eq!(interceptor.attached_count(), 0);
        assert!(agent.engine.is_empty());
        assert!(agent.assembler.session_id().is_none());

        initialize(&mut agent, "T");
        add_hook(&mut agent, "0x100", "foo");
        transport.take();

        let dispatch = agent.hook_dispatch();
        dispatch.on_enter(&Invocation {
            user_data: encode_user_data(1, false),
            thread_id: 1,
            ..Invocation::default()
        });
        agent.on_drain_tick();

        let messages = transport.take();
        let batch = messages.iter().find(|m| m["type"] == "events").unwrap();
        // Fresh session: ids restart at 1.
        assert_eq!(batch["events"][0]["id"], "T-1");
    }

    #[test]
    fn poll_supersession_keeps_only_the_newest() {
        let (mut agent, transport, _) = agent();
        initialize(&mut agent, "S");

        let cell: Box<u32> = Box::new(9);
        let recipe = json!({
            "label": "c",
            "address": format!("0x{:x}", &*cell as *const u32 as u64),
            "size": 4, "typeKind": "uint", "noSlide": true
        });

        agent.handle_message(json!({
            "type": "read_memory", "recipes": [recipe.clone()],
            "poll": {"intervalMs": 100, "durationMs": 5000}
        }));
        agent.handle_message(json!({
            "type": "read_memory", "recipes": [recipe],
            "poll": {"intervalMs": 200, "durationMs": 1000}
        }));
        transport.take();

        let start = Instant::now();
        // First poll would have fired at +100ms; only the second (200ms
        // cadence) produces snapshots now.
        agent.drain_tick(start + Duration::from_millis(110));
        assert!(transport.take().iter().all(|m| m["type"] != "events"));

        agent.drain_tick(start + Duration::from_millis(210));
        let messages = transport.take();
        let batch = messages.iter().find(|m| m["type"] == "events").unwrap();
        assert_eq!(batch["events"][0]["type"], "variable_snapshot");
        assert_eq!(batch["events"][0]["data"]["c"], 9);

        agent.drain_tick(start + Duration::from_millis(1100));
        let messages = transport.take();
        assert!(messages.iter().any(|m| m["type"] == "poll_complete"));
        assert!(agent.poll.is_none());
    }

    #[test]
    fn one_shot_read_returns_results_inline() {
        let (mut agent, transport, _) = agent();
        initialize(&mut agent, "S");
        transport.take();

        let cell: Box<u64> = Box::new(314);
        agent.handle_message(json!({
            "type": "read_memory",
            "recipes": [{
                "label": "c",
                "address": format!("0x{:x}", &*cell as *const u64 as u64),
                "size": 8, "typeKind": "uint", "noSlide": true
            }]
        }));

        let messages = transport.take();
        assert_eq!(messages[0]["type"], "read_response");
        assert_eq!(messages[0]["results"][0]["label"], "c");
        assert_eq!(messages[0]["results"][0]["value"], 314);
    }

    #[test]
    fn captured_output_ships_as_events() {
        let (mut agent, transport, _) = agent();
        initialize(&mut agent, "S");
        transport.take();

        agent.output.on_write(1, b"hello", &agent.metrics);
        agent.output.on_write(2, b"oops", &agent.metrics);
        agent.on_drain_tick();

        let messages = transport.take();
        let batch = messages.iter().find(|m| m["type"] == "events").unwrap();
        assert_eq!(batch["events"][0]["type"], "stdout");
        assert_eq!(batch["events"][0]["text"], "hello");
        assert_eq!(batch["events"][0]["sessionId"], "S");
        assert_eq!(batch["events"][1]["type"], "stderr");
    }

    #[test]
    fn interp_events_flush_with_session_ids() {
        let (mut agent, transport, _) = agent();
        initialize(&mut agent, "S");
        transport.take();

        agent.interp_queue().push(crate::interp::InterpEvent {
            kind: crate::interp::InterpKind::Enter,
            function: "handler".into(),
            file: "app.py".into(),
            line: Some(3),
            thread_id: 2,
            ticks: 100,
            args: Vec::new(),
            return_value: None,
        });
        agent.on_interp_flush();

        let messages = transport.take();
        let batch = messages.iter().find(|m| m["type"] == "events").unwrap();
        assert_eq!(batch["events"][0]["type"], "function_enter");
        assert_eq!(batch["events"][0]["id"], "S-1");
        assert_eq!(batch["events"][0]["sourceFile"], "app.py");
    }

    #[test]
    fn sampling_stats_report_on_cadence() {
        let (mut agent, transport, _) = agent();
        initialize(&mut agent, "S");
        transport.take();

        for _ in 0..STATS_EVERY_TICKS {
            agent.on_drain_tick();
        }
        let messages = transport.take();
        assert!(messages.iter().any(|m| m["type"] == "sampling_stats"));
    }
}
