use super::protocol::{
    CdpCall, CdpFrame, ExceptionThrownEvent, InspectorEvent, PausedEvent, ScriptParsedEvent,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum InspectorError {
    #[error("inspector is not connected")]
    Disconnected,
    #[error("inspector call timed out: {method}")]
    Timeout { method: String },
    #[error("inspector protocol error: {0}")]
    Protocol(String),
    #[error("inspector command failed ({code}): {message}")]
    Command { code: i64, message: String },
    #[error("inspector websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The slice of the host debugger protocol the agent needs. The wire
/// implementation is [`CdpClient`]; tests script a mock against the same
/// trait.
#[async_trait]
pub trait Inspector: Send + Sync {
    async fn enable(&self) -> Result<(), InspectorError>;
    /// `state` is the wire value: `all`, `uncaught`, or `none`.
    async fn set_pause_on_exceptions(&self, state: &str) -> Result<(), InspectorError>;
    /// Returns the debugger-assigned breakpoint id. `line_number` is
    /// 0-indexed on this surface.
    async fn set_breakpoint_by_url(
        &self,
        line_number: u32,
        url_regex: &str,
        condition: Option<&str>,
    ) -> Result<String, InspectorError>;
    async fn remove_breakpoint(&self, breakpoint_id: &str) -> Result<(), InspectorError>;
    /// Own properties of the object behind `object_id`. Valid only while the
    /// host is paused.
    async fn get_properties(
        &self,
        object_id: &str,
    ) -> Result<Vec<super::protocol::PropertyDescriptor>, InspectorError>;
    async fn resume(&self) -> Result<(), InspectorError>;
    async fn disable(&self) -> Result<(), InspectorError>;
}

type PendingReply = oneshot::Sender<Result<Value, InspectorError>>;

struct ClientInner {
    outbound: mpsc::UnboundedSender<String>,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_id: AtomicU64,
}

/// Inspector protocol client over a WebSocket. Calls are id-matched against
/// replies through a pending map; events are pushed to the channel handed out
/// at connect time.
#[derive(Clone)]
pub struct CdpClient {
    inner: Arc<ClientInner>,
}

impl CdpClient {
    pub async fn connect(
        url: &Url,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InspectorEvent>), InspectorError> {
        let (ws, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<InspectorEvent>();

        let inner = Arc::new(ClientInner {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = inner.clone();
        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader.handle_frame(&text, &event_tx),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            reader.fail_pending();
        });

        Ok((Self { inner }, event_rx))
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, InspectorError> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(id, tx);
        }

        let call = CdpCall { id, method, params };
        let encoded = serde_json::to_string(&call)
            .map_err(|err| InspectorError::Protocol(err.to_string()))?;
        if self.inner.outbound.send(encoded).is_err() {
            self.drop_pending(id);
            return Err(InspectorError::Disconnected);
        }

        match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(InspectorError::Disconnected),
            Err(_) => {
                self.drop_pending(id);
                Err(InspectorError::Timeout {
                    method: method.to_string(),
                })
            }
        }
    }

    fn drop_pending(&self, id: u64) {
        let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&id);
    }
}

impl ClientInner {
    fn handle_frame(&self, text: &str, events: &mpsc::UnboundedSender<InspectorEvent>) {
        let frame: CdpFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("inspector_frame_decode_error: {err}");
                return;
            }
        };

        if let Some(id) = frame.id {
            let reply = match frame.error {
                Some(body) => Err(InspectorError::Command {
                    code: body.code,
                    message: body.message,
                }),
                None => Ok(frame.result.unwrap_or(Value::Null)),
            };
            let sender = {
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                pending.remove(&id)
            };
            match sender {
                Some(sender) => {
                    let _ = sender.send(reply);
                }
                None => debug!("inspector_orphan_reply: id={id}"),
            }
            return;
        }

        let Some(method) = frame.method else {
            return;
        };
        let params = frame.params.unwrap_or(Value::Null);
        let event = match method.as_str() {
            "Debugger.scriptParsed" => serde_json::from_value::<ScriptParsedEvent>(params)
                .map(InspectorEvent::ScriptParsed),
            "Debugger.paused" => {
                serde_json::from_value::<PausedEvent>(params).map(InspectorEvent::Paused)
            }
            "Debugger.resumed" => Ok(InspectorEvent::Resumed),
            "Runtime.exceptionThrown" => serde_json::from_value::<ExceptionThrownEvent>(params)
                .map(InspectorEvent::ExceptionThrown),
            _ => return,
        };
        match event {
            Ok(event) => {
                let _ = events.send(event);
            }
            Err(err) => warn!("inspector_event_decode_error: {method}: {err}"),
        }
    }

    /// The socket is gone; everyone still waiting gets a disconnect.
    fn fail_pending(&self) {
        let drained: Vec<PendingReply> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().map(|(_, sender)| sender).collect()
        };
        for sender in drained {
            let _ = sender.send(Err(InspectorError::Disconnected));
        }
    }
}

#[async_trait]
impl Inspector for CdpClient {
    async fn enable(&self) -> Result<(), InspectorError> {
        self.call("Debugger.enable", json!({})).await?;
        self.call("Runtime.enable", json!({})).await?;
        Ok(())
    }

    async fn set_pause_on_exceptions(&self, state: &str) -> Result<(), InspectorError> {
        self.call("Debugger.setPauseOnExceptions", json!({ "state": state }))
            .await?;
        Ok(())
    }

    async fn set_breakpoint_by_url(
        &self,
        line_number: u32,
        url_regex: &str,
        condition: Option<&str>,
    ) -> Result<String, InspectorError> {
        let mut params = json!({
            "lineNumber": line_number,
            "urlRegex": url_regex,
        });
        if let Some(condition) = condition {
            params["condition"] = Value::String(condition.to_string());
        }
        let result = self.call("Debugger.setBreakpointByUrl", params).await?;
        result
            .get("breakpointId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                InspectorError::Protocol("setBreakpointByUrl reply missing breakpointId".to_string())
            })
    }

    async fn remove_breakpoint(&self, breakpoint_id: &str) -> Result<(), InspectorError> {
        self.call(
            "Debugger.removeBreakpoint",
            json!({ "breakpointId": breakpoint_id }),
        )
        .await?;
        Ok(())
    }

    async fn get_properties(
        &self,
        object_id: &str,
    ) -> Result<Vec<super::protocol::PropertyDescriptor>, InspectorError> {
        let result = self
            .call(
                "Runtime.getProperties",
                json!({ "objectId": object_id, "ownProperties": true }),
            )
            .await?;
        let descriptors = result.get("result").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(descriptors).map_err(|err| InspectorError::Protocol(err.to_string()))
    }

    async fn resume(&self) -> Result<(), InspectorError> {
        self.call("Debugger.resume", json!({})).await?;
        Ok(())
    }

    async fn disable(&self) -> Result<(), InspectorError> {
        self.call("Debugger.disable", json!({})).await?;
        Ok(())
    }
}
