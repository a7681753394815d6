use aivory_core::wire::{
    CollectorMsg, Envelope, HeartbeatPayload, RegisterPayload, RemoveBreakpointPayload,
    SetBreakpointPayload,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use url::Url;

pub const OUTBOUND_QUEUE_CAP: usize = 100;
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;

const BACKOFF_BASE_MS: u64 = 1_000;
const BACKOFF_CAP_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("api key is not a valid header value")]
    InvalidAuthHeader,
}

/// Delay before reconnect attempt `attempt` (1-based):
/// `min(1s * 2^(attempt-1), 60s)`.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let millis = BACKOFF_BASE_MS.saturating_mul(1u64 << exponent);
    Duration::from_millis(millis.min(BACKOFF_CAP_MS))
}

/// Collector commands surfaced to the debugger session through the command
/// sink. Dispatch never blocks the transport read loop.
#[derive(Debug, Clone)]
pub enum CollectorCommand {
    SetBreakpoint(SetBreakpointPayload),
    RemoveBreakpoint(RemoveBreakpointPayload),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    Disconnected,
    Connecting,
    Connected,
    Registered,
}

pub struct TransportSettings {
    pub url: Url,
    pub api_key: String,
    pub agent_id: String,
    pub register: RegisterPayload,
    pub heartbeat_interval: Duration,
    pub register_timeout: Duration,
    pub max_reconnect_attempts: u32,
}

/// Bounded FIFO buffer for messages admitted while not registered. Overflow
/// evicts the head, favouring recent telemetry over old.
struct SendQueue {
    items: VecDeque<Envelope>,
    cap: usize,
    dropped: u64,
}

impl SendQueue {
    fn new(cap: usize) -> Self {
        Self {
            items: VecDeque::new(),
            cap,
            dropped: 0,
        }
    }

    fn push(&mut self, envelope: Envelope) {
        if self.items.len() >= self.cap {
            self.items.pop_front();
            self.dropped += 1;
        }
        self.items.push_back(envelope);
    }

    fn drain(&mut self) -> Vec<Envelope> {
        self.items.drain(..).collect()
    }
}

struct Link {
    phase: LinkPhase,
    socket: Option<mpsc::UnboundedSender<String>>,
}

struct TransportInner {
    settings: TransportSettings,
    link: Mutex<Link>,
    queue: Mutex<SendQueue>,
    attempt: AtomicU32,
    reconnect_enabled: AtomicBool,
    shutting_down: AtomicBool,
    dropped_total: AtomicU64,
    command_tx: mpsc::UnboundedSender<CollectorCommand>,
}

/// One authenticated duplex session to the collector:
/// `Disconnected → Connecting → Connected → Registered`, with a bounded
/// outbound buffer drained in order on registration and capped exponential
/// reconnect backoff.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

enum Flow {
    Continue,
    Registered,
    Disconnect,
}

impl Transport {
    pub fn new(settings: TransportSettings) -> (Self, mpsc::UnboundedReceiver<CollectorCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(TransportInner {
            settings,
            link: Mutex::new(Link {
                phase: LinkPhase::Disconnected,
                socket: None,
            }),
            queue: Mutex::new(SendQueue::new(OUTBOUND_QUEUE_CAP)),
            attempt: AtomicU32::new(0),
            reconnect_enabled: AtomicBool::new(true),
            shutting_down: AtomicBool::new(false),
            dropped_total: AtomicU64::new(0),
            command_tx,
        });
        (Self { inner }, command_rx)
    }

    pub fn start(&self) {
        let inner = self.inner.clone();
        tokio::spawn(run_loop(inner));
    }

    /// Admit a message: straight to the socket while registered, otherwise
    /// into the bounded buffer.
    pub fn send(&self, msg: CollectorMsg) {
        let envelope = Envelope::new(msg);
        let link = lock(&self.inner.link);
        if link.phase == LinkPhase::Registered {
            if let Some(socket) = &link.socket {
                match serde_json::to_string(&envelope) {
                    Ok(text) => {
                        if socket.send(text).is_ok() {
                            return;
                        }
                    }
                    Err(err) => {
                        warn!("collector_encode_error: {err}");
                        return;
                    }
                }
            }
        }
        // Held across the queue push so registration cannot drain between
        // the phase check and the enqueue.
        let mut queue = lock(&self.inner.queue);
        queue.push(envelope);
        self.inner
            .dropped_total
            .store(queue.dropped, Ordering::Relaxed);
        drop(queue);
        drop(link);
    }

    pub fn phase(&self) -> LinkPhase {
        lock(&self.inner.link).phase
    }

    pub fn queued(&self) -> usize {
        lock(&self.inner.queue).items.len()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped_total.load(Ordering::Relaxed)
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.inner.reconnect_enabled.load(Ordering::Relaxed)
    }

    /// Snapshot of the buffered envelopes, oldest first.
    #[cfg(any(test, feature = "test-support"))]
    pub fn queued_envelopes(&self) -> Vec<Envelope> {
        lock(&self.inner.queue).items.iter().cloned().collect()
    }

    /// Close the session and stop reconnecting. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Relaxed);
        self.inner.reconnect_enabled.store(false, Ordering::Relaxed);
        let mut link = lock(&self.inner.link);
        link.phase = LinkPhase::Disconnected;
        link.socket = None;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn run_loop(inner: Arc<TransportInner>) {
    loop {
        if inner.shutting_down.load(Ordering::Relaxed)
            || !inner.reconnect_enabled.load(Ordering::Relaxed)
        {
            break;
        }

        {
            let mut link = lock(&inner.link);
            link.phase = LinkPhase::Connecting;
            link.socket = None;
        }
        run_connection(&inner).await;
        {
            let mut link = lock(&inner.link);
            link.phase = LinkPhase::Disconnected;
            link.socket = None;
        }

        if inner.shutting_down.load(Ordering::Relaxed)
            || !inner.reconnect_enabled.load(Ordering::Relaxed)
        {
            break;
        }
        let attempt = inner.attempt.fetch_add(1, Ordering::Relaxed) + 1;
        if attempt > inner.settings.max_reconnect_attempts {
            warn!("collector_reconnect_exhausted: attempts={attempt}");
            break;
        }
        let delay = reconnect_delay(attempt);
        debug!("collector_reconnect_scheduled: attempt={attempt} delay_ms={}", delay.as_millis());
        tokio::time::sleep(delay).await;
    }
}

async fn run_connection(inner: &Arc<TransportInner>) {
    let request = match build_request(&inner.settings) {
        Ok(request) => request,
        Err(err) => {
            error!("collector_request_error: {err}");
            inner.reconnect_enabled.store(false, Ordering::Relaxed);
            return;
        }
    };
    let (ws, _) = match connect_async(request).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!("collector_connect_error: {err}");
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    let (socket_tx, mut socket_rx) = mpsc::unbounded_channel::<String>();
    {
        let mut link = lock(&inner.link);
        link.phase = LinkPhase::Connected;
        link.socket = Some(socket_tx);
    }

    let register = Envelope::new(CollectorMsg::Register(inner.settings.register.clone()));
    match serde_json::to_string(&register) {
        Ok(text) => {
            if sink.send(Message::Text(text)).await.is_err() {
                warn!("collector_register_send_error");
                return;
            }
        }
        Err(err) => {
            error!("collector_register_encode_error: {err}");
            return;
        }
    }

    let mut registered = false;
    let register_deadline = tokio::time::sleep(inner.settings.register_timeout);
    tokio::pin!(register_deadline);
    let mut heartbeat = interval(inner.settings.heartbeat_interval);

    loop {
        tokio::select! {
            maybe_out = socket_rx.recv() => {
                match maybe_out {
                    Some(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // The sender was dropped: shutdown.
                    None => break,
                }
            }
            maybe_msg = stream.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        match dispatch_inbound(inner, &text) {
                            Flow::Continue => {}
                            Flow::Registered => {
                                registered = true;
                                heartbeat = interval_at(
                                    Instant::now() + inner.settings.heartbeat_interval,
                                    inner.settings.heartbeat_interval,
                                );
                            }
                            Flow::Disconnect => break,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("collector_read_error: {err}");
                        break;
                    }
                }
            }
            _ = &mut register_deadline, if !registered => {
                warn!("collector_register_timeout");
                break;
            }
            _ = heartbeat.tick(), if registered => {
                let envelope = Envelope::new(CollectorMsg::Heartbeat(HeartbeatPayload {
                    agent_id: inner.settings.agent_id.clone(),
                }));
                match serde_json::to_string(&envelope) {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!("collector_encode_error: {err}"),
                }
            }
        }
    }
    let _ = sink.close().await;
}

fn dispatch_inbound(inner: &Arc<TransportInner>, text: &str) -> Flow {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(err) => {
            match serde_json::from_str::<serde_json::Value>(text) {
                Ok(value) => {
                    let kind = value
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    debug!("collector_unknown_message: type={kind}");
                }
                Err(_) => warn!("collector_malformed_message: {err}"),
            }
            return Flow::Continue;
        }
    };

    match envelope.msg {
        CollectorMsg::Registered(_) => {
            enter_registered(inner);
            info!("collector_registered");
            Flow::Registered
        }
        CollectorMsg::Error(payload) => {
            if payload.is_auth_error() {
                error!(
                    "collector_auth_error: code={} message={}",
                    payload.code,
                    payload.message.as_deref().unwrap_or("")
                );
                inner.reconnect_enabled.store(false, Ordering::Relaxed);
                Flow::Disconnect
            } else {
                warn!(
                    "collector_error: code={} message={}",
                    payload.code,
                    payload.message.as_deref().unwrap_or("")
                );
                Flow::Continue
            }
        }
        CollectorMsg::SetBreakpoint(payload) => {
            let _ = inner.command_tx.send(CollectorCommand::SetBreakpoint(payload));
            Flow::Continue
        }
        CollectorMsg::RemoveBreakpoint(payload) => {
            let _ = inner
                .command_tx
                .send(CollectorCommand::RemoveBreakpoint(payload));
            Flow::Continue
        }
        _ => {
            debug!("collector_unexpected_message");
            Flow::Continue
        }
    }
}

/// Entering `Registered` drains the buffer in admission order before any new
/// send is admitted; both locks are held so a concurrent `send` cannot
/// interleave mid-drain.
fn enter_registered(inner: &Arc<TransportInner>) {
    let mut link = lock(&inner.link);
    let drained = lock(&inner.queue).drain();
    if let Some(socket) = &link.socket {
        for envelope in drained {
            match serde_json::to_string(&envelope) {
                Ok(text) => {
                    let _ = socket.send(text);
                }
                Err(err) => warn!("collector_encode_error: {err}"),
            }
        }
    }
    link.phase = LinkPhase::Registered;
    inner.attempt.store(0, Ordering::Relaxed);
}

fn build_request(
    settings: &TransportSettings,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, TransportError> {
    let mut request = settings.url.as_str().into_client_request()?;
    let bearer = format!("Bearer {}", settings.api_key);
    let value =
        HeaderValue::from_str(&bearer).map_err(|_| TransportError::InvalidAuthHeader)?;
    request.headers_mut().insert("Authorization", value);
    Ok(request)
}
