//! Command and event types for the daemon channel.
//!
//! Messages are JSON tagged by a `type` field; keys are camelCase on the
//! wire. Commands arrive through the framework transport, events leave
//! through the same channel, batched for trace events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CommandError;
use crate::serialize::TypeInfo;

/// Commands the daemon sends to the agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    #[serde(rename_all = "camelCase")]
    Initialize { session_id: String },
    #[serde(rename_all = "camelCase")]
    Hooks {
        action: HookAction,
        #[serde(default)]
        functions: Vec<FunctionSpec>,
        #[serde(default)]
        targets: Vec<TargetSpec>,
        #[serde(default)]
        image_base: Option<String>,
        #[serde(default)]
        mode: Option<HookMode>,
        #[serde(default)]
        serialization_depth: Option<u8>,
    },
    #[serde(rename_all = "camelCase")]
    Watches {
        #[serde(default)]
        watches: Vec<WatchSpec>,
        #[serde(default)]
        expr_watches: Vec<ExprWatchSpec>,
    },
    #[serde(rename_all = "camelCase")]
    ReadMemory {
        recipes: Vec<Recipe>,
        #[serde(default)]
        image_base: Option<String>,
        #[serde(default)]
        poll: Option<PollSpec>,
    },
    #[serde(rename_all = "camelCase")]
    WriteMemory {
        recipes: Vec<Recipe>,
        #[serde(default)]
        image_base: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Breakpoints {
        #[serde(default)]
        add: Vec<BreakpointSpec>,
        #[serde(default)]
        remove: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Logpoints {
        #[serde(default)]
        add: Vec<LogpointSpec>,
        #[serde(default)]
        remove: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Step {
        thread_id: u32,
        #[serde(default)]
        one_shot: Vec<String>,
        #[serde(default)]
        image_base: Option<String>,
        #[serde(default)]
        return_address: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Resume {
        thread_id: u32,
        action: ResumeAction,
    },
    Dispose,
}

impl Command {
    /// Wire name of the command, used for one-shot handler registration.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Initialize { .. } => "initialize",
            Command::Hooks { .. } => "hooks",
            Command::Watches { .. } => "watches",
            Command::ReadMemory { .. } => "read_memory",
            Command::WriteMemory { .. } => "write_memory",
            Command::Breakpoints { .. } => "breakpoints",
            Command::Logpoints { .. } => "logpoints",
            Command::Step { .. } => "step",
            Command::Resume { .. } => "resume",
            Command::Dispose => "dispose",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookMode {
    #[default]
    Full,
    Light,
}

/// A native hook target: a DWARF-static address plus names and source info.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    pub address: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// Raw user-provided addresses bypass the ASLR slide.
    #[serde(default)]
    pub no_slide: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arg_types: Vec<TypeInfo>,
}

/// An interpreted hook target, identified by position rather than address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub file: String,
    #[serde(default)]
    pub line: Option<u32>,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchSpec {
    pub label: String,
    pub address: String,
    pub size: u8,
    #[serde(default)]
    pub type_kind: Option<String>,
    #[serde(default)]
    pub deref_depth: u8,
    #[serde(default)]
    pub deref_offset: u64,
    #[serde(default)]
    pub on: Vec<String>,
    #[serde(default)]
    pub global: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExprWatchSpec {
    pub label: String,
    pub expr: String,
    #[serde(default)]
    pub on: Vec<String>,
    #[serde(default)]
    pub global: bool,
}

/// A memory read/write description. Writes carry `value`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub label: String,
    pub address: String,
    #[serde(default)]
    pub size: u8,
    #[serde(default)]
    pub type_kind: Option<String>,
    #[serde(default)]
    pub deref_depth: u8,
    #[serde(default)]
    pub deref_offset: u64,
    #[serde(default)]
    pub no_slide: bool,
    #[serde(default, rename = "struct")]
    pub is_struct: bool,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    pub name: String,
    pub offset: u64,
    pub size: u8,
    #[serde(default)]
    pub type_kind: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSpec {
    pub interval_ms: u64,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointSpec {
    pub id: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub function: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub hit_count: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogpointSpec {
    pub id: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ResumeAction {
    #[serde(rename = "continue")]
    Continue,
    #[serde(rename = "step-over")]
    StepOver,
    #[serde(rename = "step-into")]
    StepInto,
    #[serde(rename = "step-out")]
    StepOut,
}

/// Messages the agent posts to the daemon.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    #[serde(rename_all = "camelCase")]
    AgentLoaded { pid: u32 },
    #[serde(rename_all = "camelCase")]
    Initialized { session_id: String },
    #[serde(rename_all = "camelCase")]
    HooksUpdated { installed: u32, dropped: u32 },
    #[serde(rename_all = "camelCase")]
    WatchesUpdated { count: u32 },
    Events { events: Vec<TraceEvent> },
    #[serde(rename_all = "camelCase")]
    SamplingStateChange { function: String, enabled: bool },
    #[serde(rename_all = "camelCase")]
    SamplingStats {
        interval: u32,
        stats: crate::metrics::MetricsSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    ReadResponse { results: Vec<ReadResult> },
    PollComplete,
    #[serde(rename_all = "camelCase")]
    ConditionError { breakpoint_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    Log { level: String, message: String },
}

impl AgentMessage {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|err| {
            serde_json::json!({"type": "log", "level": "error",
                "message": format!("unserializable message: {err}")})
        })
    }
}

/// Result of one read recipe. Exactly one of `value`/`fields`/`error`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadResult {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<BTreeMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_bytes: bool,
}

impl ReadResult {
    pub fn value(label: impl Into<String>, value: Value) -> Self {
        Self {
            label: label.into(),
            value: Some(value),
            fields: None,
            error: None,
            is_bytes: false,
        }
    }

    pub fn error(label: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: None,
            fields: None,
            error: Some(error.into()),
            is_bytes: false,
        }
    }
}

/// One backtrace frame as shipped in pause and crash events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
}

/// Events shipped inside `AgentMessage::Events` batches.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    #[serde(rename_all = "camelCase")]
    FunctionEnter {
        id: String,
        session_id: String,
        timestamp_ns: u64,
        thread_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_event_id: Option<String>,
        function_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        function_name_raw: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source_file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        arguments: Vec<Value>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        sampled: bool,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        watch_values: BTreeMap<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    FunctionExit {
        id: String,
        session_id: String,
        timestamp_ns: u64,
        thread_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        thread_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_event_id: Option<String>,
        function_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        function_name_raw: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        source_file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        return_value: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_ns: Option<u64>,
        #[serde(skip_serializing_if = "BTreeMap::is_empty")]
        watch_values: BTreeMap<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    Stdout {
        id: String,
        session_id: String,
        timestamp_ns: u64,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Stderr {
        id: String,
        session_id: String,
        timestamp_ns: u64,
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Crash {
        signal: String,
        fault_address: String,
        registers: BTreeMap<String, String>,
        backtrace: Vec<FrameInfo>,
        frame_memory: String,
        frame_base: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        memory_access: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    VariableSnapshot {
        id: String,
        timestamp_ns: u64,
        thread_id: u32,
        data: BTreeMap<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    Pause {
        breakpoint_id: String,
        thread_id: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        file: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        function: Option<String>,
        /// Static (slide-subtracted) landing address, for step planning.
        #[serde(skip_serializing_if = "Option::is_none")]
        address: Option<String>,
        backtrace: Vec<FrameInfo>,
        locals: BTreeMap<String, Value>,
        #[serde(skip_serializing_if = "String::is_empty")]
        frame_memory: String,
        #[serde(skip_serializing_if = "String::is_empty")]
        frame_base: String,
    },
    #[serde(rename_all = "camelCase")]
    Logpoint {
        id: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        line: Option<u32>,
    },
}

/// Monotonic `{session}-{counter}` event-id source.
#[derive(Debug, Clone)]
pub struct EventIdGen {
    session_id: String,
    counter: u64,
}

impl EventIdGen {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            counter: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn next(&mut self) -> String {
        self.counter += 1;
        format!("{}-{}", self.session_id, self.counter)
    }

    pub fn emitted(&self) -> u64 {
        self.counter
    }
}

/// Parse a `0x`-prefixed (or bare hex) address string.
pub fn parse_hex_addr(text: &str) -> Result<u64, CommandError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16)
        .map_err(|_| CommandError::validation(format!("bad address {text:?}")))
}

pub fn format_hex(value: u64) -> String {
    format!("0x{value:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_daemon_json() {
        let cmd: Command = serde_json::from_str(
            r#"{"type": "initialize", "sessionId": "demo-1"}"#,
        )
        .unwrap();
        assert!(matches!(cmd, Command::Initialize { ref session_id } if session_id == "demo-1"));

        let cmd: Command = serde_json::from_str(
            r#"{"type": "hooks", "action": "add", "mode": "light",
                "functions": [{"address": "0x1000", "name": "compute"}]}"#,
        )
        .unwrap();
        match cmd {
            Command::Hooks {
                action,
                functions,
                mode,
                ..
            } => {
                assert_eq!(action, HookAction::Add);
                assert_eq!(mode, Some(HookMode::Light));
                assert_eq!(functions[0].name, "compute");
                assert!(!functions[0].no_slide);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let cmd: Command = serde_json::from_str(
            r#"{"type": "read_memory", "recipes": [
                {"label": "c", "address": "0x2000", "size": 4, "typeKind": "int",
                 "derefDepth": 1, "derefOffset": 8, "noSlide": false}],
                "poll": {"intervalMs": 100, "durationMs": 5000}}"#,
        )
        .unwrap();
        match cmd {
            Command::ReadMemory { recipes, poll, .. } => {
                assert_eq!(recipes[0].deref_offset, 8);
                assert_eq!(poll.unwrap().interval_ms, 100);
            }
            other => panic!("unexpected: {other:?}"),
        }

        let cmd: Command = serde_json::from_str(
            r#"{"type": "resume", "threadId": 42, "action": "step-over"}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            Command::Resume {
                thread_id: 42,
                action: ResumeAction::StepOver
            }
        ));
    }

    #[test]
    fn events_serialize_with_camel_case_keys() {
        let mut ids = EventIdGen::new("s");
        let event = TraceEvent::FunctionEnter {
            id: ids.next(),
            session_id: "s".into(),
            timestamp_ns: 5,
            thread_id: 1,
            thread_name: None,
            parent_event_id: None,
            function_name: "main".into(),
            function_name_raw: None,
            source_file: None,
            line: None,
            arguments: vec![serde_json::json!("0xa")],
            sampled: false,
            watch_values: BTreeMap::new(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "function_enter");
        assert_eq!(value["id"], "s-1");
        assert_eq!(value["functionName"], "main");
        // Suppressed optionals stay off the wire.
        assert!(value.get("parentEventId").is_none());
        assert!(value.get("sampled").is_none());
    }

    #[test]
    fn event_ids_are_monotonic_per_session() {
        let mut ids = EventIdGen::new("sess");
        assert_eq!(ids.next(), "sess-1");
        assert_eq!(ids.next(), "sess-2");
        assert_eq!(ids.emitted(), 2);
    }

    #[test]
    fn hex_addresses_roundtrip() {
        assert_eq!(parse_hex_addr("0x2000").unwrap(), 0x2000);
        assert_eq!(parse_hex_addr("2000").unwrap(), 0x2000);
        assert!(parse_hex_addr("zz").is_err());
        assert_eq!(format_hex(0xc), "0xc");
    }
}
