use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing inspector call. The protocol is JSON-RPC-shaped: calls carry an
/// id, replies echo it, events carry a method and no id.
#[derive(Debug, Serialize)]
pub struct CdpCall<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

/// One inbound inspector frame: either a reply (`id` + `result`/`error`) or
/// an event (`method` + `params`).
#[derive(Debug, Deserialize)]
pub struct CdpFrame {
    pub id: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<CdpErrorBody>,
    pub method: Option<String>,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CdpErrorBody {
    pub code: i64,
    pub message: String,
}

/// Typed view of the inspector events the session consumes. Everything else
/// coming off the socket is dropped at the client layer.
#[derive(Debug, Clone)]
pub enum InspectorEvent {
    ScriptParsed(ScriptParsedEvent),
    Paused(PausedEvent),
    Resumed,
    ExceptionThrown(ExceptionThrownEvent),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptParsedEvent {
    pub script_id: String,
    #[serde(default)]
    pub url: String,
}

pub const PAUSE_REASON_EXCEPTION: &str = "exception";
pub const PAUSE_REASON_PROMISE_REJECTION: &str = "promiseRejection";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedEvent {
    pub reason: String,
    /// For exception pauses, the thrown value.
    #[serde(default)]
    pub data: Option<RemoteObject>,
    #[serde(default)]
    pub call_frames: Vec<CallFrame>,
    #[serde(default)]
    pub hit_breakpoints: Vec<String>,
}

impl PausedEvent {
    pub fn is_exception(&self) -> bool {
        self.reason == PAUSE_REASON_EXCEPTION
    }

    pub fn is_promise_rejection(&self) -> bool {
        self.reason == PAUSE_REASON_PROMISE_REJECTION
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub call_frame_id: String,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub url: String,
    pub location: Location,
    #[serde(default)]
    pub scope_chain: Vec<Scope>,
}

/// Wire locations are 0-indexed; the public surface is 1-indexed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    #[serde(default)]
    pub script_id: String,
    pub line_number: u32,
    #[serde(default)]
    pub column_number: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scope {
    #[serde(rename = "type")]
    pub kind: ScopeKind,
    pub object: RemoteObject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeKind {
    Global,
    Local,
    With,
    Closure,
    Catch,
    Block,
    Script,
    Eval,
    Module,
    #[serde(other)]
    Other,
}

/// A value as reported by the inspector. `object_id` is only valid while the
/// host is paused.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type", default)]
    pub object_type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub object_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(default)]
    pub value: Option<RemoteObject>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionThrownEvent {
    pub exception_details: ExceptionDetails,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub exception: Option<RemoteObject>,
}
