use crate::capture::{CapturedValue, ExceptionCapture, StackFrame};
use crate::release::ReleaseRecord;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_COLLECTOR_URL: &str = "wss://api.aivory.net/ws/agent";

/// Collector error codes that permanently disable reconnection.
pub const AUTH_ERROR_CODES: &[&str] = &["auth_error", "invalid_api_key"];

/// JSON envelope exchanged with the collector over the agent channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(flatten)]
    pub msg: CollectorMsg,
    pub timestamp: i64,
}

impl Envelope {
    pub fn new(msg: CollectorMsg) -> Self {
        Self {
            msg,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum CollectorMsg {
    // agent → collector
    Register(RegisterPayload),
    Exception(Box<ExceptionPayload>),
    BreakpointHit(BreakpointHitPayload),
    Heartbeat(HeartbeatPayload),
    // collector → agent
    Registered(RegisteredPayload),
    Error(ErrorPayload),
    SetBreakpoint(SetBreakpointPayload),
    RemoveBreakpoint(RemoveBreakpointPayload),
}

/// Identity fields stamped on registration and on every capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeIdentity {
    pub agent_id: String,
    pub environment: String,
    pub runtime: String,
    pub runtime_version: String,
    pub platform: String,
    pub arch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegisterPayload {
    #[serde(flatten)]
    pub identity: RuntimeIdentity,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExceptionPayload {
    #[serde(flatten)]
    pub capture: ExceptionCapture,
    #[serde(flatten)]
    pub identity: RuntimeIdentity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakpointHitPayload {
    pub breakpoint_id: String,
    pub agent_id: String,
    pub stack_trace: Vec<StackFrame>,
    pub local_variables: BTreeMap<String, CapturedValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub agent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisteredPayload {
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: String,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorPayload {
    /// Credential failures are terminal; the transport must not reconnect.
    pub fn is_auth_error(&self) -> bool {
        AUTH_ERROR_CODES.contains(&self.code.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SetBreakpointPayload {
    pub id: String,
    pub file_path: String,
    /// 1-indexed, as shown to collector users.
    pub line_number: u32,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveBreakpointPayload {
    pub id: String,
}
