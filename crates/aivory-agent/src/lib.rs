//! In-process error-monitoring agent. Attaches to the host's inspector
//! protocol to pause on exceptions and harvest live locals, correlates them
//! with host-level exception hooks, and streams capture records to the
//! Aivory collector over a persistent authenticated channel.

pub mod config;
pub mod harvest;
pub mod inspector;
pub mod middleware;
pub mod pipeline;
pub mod stack;
pub mod transport;

pub use aivory_core::capture::{Breakpoint, CapturedValue, ExceptionCapture, StackFrame, TypeTag};
pub use aivory_core::release::{ReleaseOptions, ReleaseRecord};
pub use config::{AgentOptions, Config, ConfigError, HookFn};
pub use middleware::{capture_request_error, RequestContext};
pub use pipeline::{HostError, UserInfo};

use config::Config as ResolvedConfig;
use inspector::client::CdpClient;
use inspector::{DebuggerSession, HarvestCaches};
use once_cell::sync::Lazy;
use pipeline::ExceptionPipeline;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use transport::{
    Transport, TransportSettings, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_REGISTER_TIMEOUT,
};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum InitError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

struct Agent {
    transport: Transport,
    pipeline: Arc<ExceptionPipeline>,
    session: Option<Arc<DebuggerSession>>,
    tasks: Vec<JoinHandle<()>>,
}

/// One agent instance per process.
static AGENT: Lazy<tokio::sync::Mutex<Option<Agent>>> =
    Lazy::new(|| tokio::sync::Mutex::new(None));

/// Initialize the process-wide agent. Idempotent: a second call logs and
/// returns without touching the running instance.
pub async fn init(options: AgentOptions) -> Result<(), InitError> {
    let mut slot = AGENT.lock().await;
    if slot.is_some() {
        info!("agent_already_initialized");
        return Ok(());
    }

    let prior_uncaught = options.on_uncaught_exception.clone();
    let prior_rejection = options.on_unhandled_rejection.clone();
    let config = Arc::new(ResolvedConfig::resolve(&options)?);

    let (transport, command_rx) = Transport::new(TransportSettings {
        url: config.collector_url.clone(),
        api_key: config.api_key.clone(),
        agent_id: config.agent_id.clone(),
        register: aivory_core::wire::RegisterPayload {
            identity: config.identity(),
            hostname: config.hostname.clone(),
            release: config.release.clone(),
        },
        heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        register_timeout: DEFAULT_REGISTER_TIMEOUT,
        max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
    });
    transport.start();

    let caches = Arc::new(HarvestCaches::new());
    let pipeline = Arc::new(ExceptionPipeline::new(
        config.clone(),
        transport.clone(),
        caches.clone(),
        prior_uncaught,
        prior_rejection,
    ));

    let mut session = None;
    let mut tasks = Vec::new();
    if let Some(url) = &config.inspector_url {
        match CdpClient::connect(url).await {
            Ok((client, events)) => {
                let debugger = Arc::new(DebuggerSession::new(
                    Arc::new(client),
                    config.clone(),
                    transport.clone(),
                    caches.clone(),
                ));
                if let Err(err) = debugger.initialize().await {
                    warn!("debugger_enable_error: {err}");
                }
                tasks.push(tokio::spawn(debugger.clone().run(
                    events,
                    command_rx,
                    pipeline.clone(),
                )));
                session = Some(debugger);
            }
            Err(err) => warn!("debugger_connect_error: {err}"),
        }
    } else {
        debug!("debugger_disabled: no inspector url configured");
    }

    info!(
        "agent_initialized: id={} environment={}",
        config.agent_id, config.environment
    );
    *slot = Some(Agent {
        transport,
        pipeline,
        session,
        tasks,
    });
    Ok(())
}

pub async fn is_initialized() -> bool {
    AGENT.lock().await.is_some()
}

/// Tear the agent down: exception hooks go first so an in-flight exception
/// cannot race the transport shutdown, then breakpoints and the debugger,
/// then the collector channel.
pub async fn shutdown() {
    let agent = AGENT.lock().await.take();
    let Some(agent) = agent else {
        debug!("agent_not_initialized");
        return;
    };
    for task in &agent.tasks {
        task.abort();
    }
    if let Some(session) = &agent.session {
        session.teardown().await;
    }
    agent.transport.shutdown();
    info!("agent_shut_down");
}

/// Manually report an error, optionally with extra context.
pub async fn capture_exception(error: HostError, context: Option<BTreeMap<String, Value>>) {
    let pipeline = AGENT.lock().await.as_ref().map(|agent| agent.pipeline.clone());
    match pipeline {
        Some(pipeline) => pipeline.capture(&error, context).await,
        None => debug!("capture_dropped: agent not initialized"),
    }
}

/// Merge entries into the context attached to every subsequent capture.
pub async fn set_context(entries: BTreeMap<String, Value>) {
    if let Some(agent) = AGENT.lock().await.as_ref() {
        agent.pipeline.set_context(entries);
    }
}

pub async fn set_user(user: UserInfo) {
    if let Some(agent) = AGENT.lock().await.as_ref() {
        agent.pipeline.set_user(user);
    }
}
