use crate::config::{Config, HookFn};
use crate::inspector::CaptureSource;
use crate::stack;
use crate::transport::Transport;
use aivory_core::capture::ExceptionCapture;
use aivory_core::wire::{CollectorMsg, ExceptionPayload};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// How long the hook path waits for an in-flight harvest before emitting
/// without locals.
pub const HARVEST_WAIT: Duration = Duration::from_millis(100);
/// Grace period before the deferred error-exit, letting the transport flush.
pub const EXIT_FLUSH_DELAY: Duration = Duration::from_millis(500);

const CONTEXT_TYPE_UNCAUGHT: &str = "uncaughtException";
const CONTEXT_TYPE_REJECTION: &str = "unhandledRejection";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An exception as observed from the host: a name, a message, and the host's
/// textual stack when one exists.
#[derive(Debug, Clone)]
pub struct HostError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl HostError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Rejections can carry arbitrary non-error values; they surface as a
    /// generic `Error` whose message is the value's printable form.
    pub fn from_rejection_value(value: impl Into<String>) -> Self {
        Self::new("Error", value)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UserInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Builds capture records from host-level exception hooks and manual
/// reports, joins them with harvested locals, and hands them to the
/// transport. Never lets an agent fault alter the host's error semantics.
pub struct ExceptionPipeline {
    config: Arc<Config>,
    transport: Transport,
    source: Arc<dyn CaptureSource>,
    context: Mutex<BTreeMap<String, Value>>,
    user: Mutex<Option<UserInfo>>,
    prior_uncaught: Option<HookFn>,
    prior_rejection: Option<HookFn>,
    exit_hook: Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
}

impl ExceptionPipeline {
    pub fn new(
        config: Arc<Config>,
        transport: Transport,
        source: Arc<dyn CaptureSource>,
        prior_uncaught: Option<HookFn>,
        prior_rejection: Option<HookFn>,
    ) -> Self {
        Self {
            context: Mutex::new(config.base_context.clone()),
            config,
            transport,
            source,
            user: Mutex::new(None),
            prior_uncaught,
            prior_rejection,
            exit_hook: Mutex::new(None),
        }
    }

    pub fn set_context(&self, entries: BTreeMap<String, Value>) {
        lock(&self.context).extend(entries);
    }

    pub fn set_user(&self, user: UserInfo) {
        *lock(&self.user) = Some(user);
    }

    /// Replace the deferred error-exit with a callback. Used by embedders and
    /// tests that must observe the exit without the process dying.
    pub fn set_exit_hook(&self, hook: Arc<dyn Fn() + Send + Sync>) {
        *lock(&self.exit_hook) = Some(hook);
    }

    /// Manual report path: sampling, parse, harvest-join, emit. No handler
    /// chaining, no exit.
    pub async fn capture(&self, error: &HostError, context: Option<BTreeMap<String, Value>>) {
        if !self.config.sample() {
            debug!("capture_sampled_out");
            return;
        }
        self.build_and_emit(error, context.unwrap_or_default()).await;
    }

    /// Uncaught-exception hook. Capture, then chain to the pre-existing
    /// handler; with none, preserve the host's die-on-uncaught behavior via
    /// a deferred exit so the transport can flush.
    pub async fn handle_uncaught_exception(&self, error: HostError) {
        if self.config.sample() {
            let context = BTreeMap::from([(
                "type".to_string(),
                Value::String(CONTEXT_TYPE_UNCAUGHT.to_string()),
            )]);
            self.build_and_emit(&error, context).await;
        } else {
            debug!("uncaught_sampled_out");
        }

        match &self.prior_uncaught {
            Some(handler) => handler(&error),
            None => {
                error!("uncaught_exception: {}: {}", error.name, error.message);
                self.schedule_exit();
            }
        }
    }

    /// Unhandled-rejection hook. Chains like the uncaught path but never
    /// exits; hosts only warn on unhandled rejections.
    pub async fn handle_unhandled_rejection(&self, error: HostError) {
        if self.config.sample() {
            let context = BTreeMap::from([(
                "type".to_string(),
                Value::String(CONTEXT_TYPE_REJECTION.to_string()),
            )]);
            self.build_and_emit(&error, context).await;
        } else {
            debug!("rejection_sampled_out");
        }

        if let Some(handler) = &self.prior_rejection {
            handler(&error);
        }
    }

    /// Entry point for the inspector's thrown-exception events.
    pub(crate) async fn on_exception_thrown(
        &self,
        event: crate::inspector::protocol::ExceptionThrownEvent,
    ) {
        let details = event.exception_details;
        let description = details
            .exception
            .as_ref()
            .and_then(|exception| exception.description.clone());
        let class_hint = details
            .exception
            .as_ref()
            .and_then(|exception| exception.class_name.as_deref());
        let (name, message) = stack::exception_header(description.as_deref(), class_hint);
        let mut error = HostError::new(name, message);
        if let Some(stack) = description {
            error = error.with_stack(stack);
        }

        if details.text.contains("in promise") {
            self.handle_unhandled_rejection(error).await;
        } else {
            self.handle_uncaught_exception(error).await;
        }
    }

    /// Shared emit path: stack parse, stack-key lookup with a bounded wait
    /// for an in-flight harvest, dedup against the debugger path, assemble,
    /// send. Returns whether a message left for the collector.
    async fn build_and_emit(
        &self,
        error: &HostError,
        event_context: BTreeMap<String, Value>,
    ) -> bool {
        let frames = error
            .stack
            .as_deref()
            .map(stack::parse_stack_trace)
            .unwrap_or_default();

        let dedup_key =
            stack::dedup_fingerprint(&error.name, frames.iter().map(|frame| frame.line_number));
        if self.source.was_sent_via_debugger(&dedup_key) {
            debug!("capture_deduplicated: {dedup_key}");
            return false;
        }

        let stack_key =
            stack::stack_key(error.stack.as_deref(), Utc::now().timestamp_millis());
        if let Some(mut signal) = self.source.pending_signal(&stack_key) {
            if tokio::time::timeout(HARVEST_WAIT, signal.changed())
                .await
                .is_err()
            {
                warn!("harvest_wait_timeout: emitting without locals");
            }
        }
        let local_variables = self
            .source
            .take_harvest(&stack_key)
            .map(|harvest| harvest.locals)
            .unwrap_or_default();

        let capture = ExceptionCapture {
            id: Uuid::new_v4().to_string(),
            exception_type: error.name.clone(),
            message: error.message.clone(),
            fingerprint: stack::capture_fingerprint(&error.name, &frames),
            stack_trace: frames,
            local_variables,
            context: self.merged_context(event_context),
            captured_at: Utc::now(),
        };
        self.transport
            .send(CollectorMsg::Exception(Box::new(ExceptionPayload {
                capture,
                identity: self.config.identity(),
                release: self.config.release.clone(),
            })));
        true
    }

    fn merged_context(&self, event_context: BTreeMap<String, Value>) -> BTreeMap<String, Value> {
        let mut context = lock(&self.context).clone();
        if let Some(user) = lock(&self.user).as_ref() {
            context.insert("user".to_string(), json!(user));
        }
        context.extend(event_context);
        context
    }

    fn schedule_exit(&self) {
        let hook = lock(&self.exit_hook).clone();
        tokio::spawn(async move {
            tokio::time::sleep(EXIT_FLUSH_DELAY).await;
            match hook {
                Some(hook) => hook(),
                None => std::process::exit(1),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentOptions;
    use crate::harvest::Harvest;
    use crate::inspector::HarvestCaches;
    use crate::transport::{
        Transport, TransportSettings, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_RECONNECT_ATTEMPTS,
        DEFAULT_REGISTER_TIMEOUT,
    };
    use aivory_core::capture::{CapturedValue, TypeTag};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    fn test_config(sampling_rate: f64) -> Arc<Config> {
        let options = AgentOptions {
            api_key: Some("test-key".to_string()),
            sampling_rate: Some(sampling_rate),
            ..AgentOptions::default()
        };
        Arc::new(Config::resolve_with(&options, &|_| None).expect("config"))
    }

    /// Transport left disconnected so every send lands in the buffer, where
    /// the tests can read it back.
    fn idle_transport(config: &Config) -> Transport {
        let (transport, _commands) = Transport::new(TransportSettings {
            url: Url::parse("ws://127.0.0.1:1/ws").expect("url"),
            api_key: config.api_key.clone(),
            agent_id: config.agent_id.clone(),
            register: aivory_core::wire::RegisterPayload {
                identity: config.identity(),
                hostname: config.hostname.clone(),
                release: None,
            },
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            register_timeout: DEFAULT_REGISTER_TIMEOUT,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        });
        transport
    }

    fn pipeline_with(
        sampling_rate: f64,
        prior_uncaught: Option<HookFn>,
    ) -> (Arc<ExceptionPipeline>, Transport, Arc<HarvestCaches>) {
        let config = test_config(sampling_rate);
        let transport = idle_transport(&config);
        let caches = Arc::new(HarvestCaches::new());
        let pipeline = Arc::new(ExceptionPipeline::new(
            config,
            transport.clone(),
            caches.clone(),
            prior_uncaught,
            None,
        ));
        (pipeline, transport, caches)
    }

    fn queued_exceptions(transport: &Transport) -> Vec<ExceptionPayload> {
        transport
            .queued_envelopes()
            .into_iter()
            .filter_map(|envelope| match envelope.msg {
                CollectorMsg::Exception(payload) => Some(*payload),
                _ => None,
            })
            .collect()
    }

    const STACK: &str =
        "Error: boom\n    at work (/srv/app/job.js:7:3)\n    at main (/srv/app/main.js:2:1)";

    #[tokio::test]
    async fn manual_capture_emits_one_exception() {
        let (pipeline, transport, _caches) = pipeline_with(1.0, None);
        let error = HostError::new("Error", "boom").with_stack(STACK);

        pipeline.capture(&error, None).await;

        let captures = queued_exceptions(&transport);
        assert_eq!(captures.len(), 1);
        let capture = &captures[0].capture;
        assert_eq!(capture.exception_type, "Error");
        assert_eq!(capture.message, "boom");
        assert_eq!(capture.fingerprint.len(), 16);
        assert_eq!(capture.stack_trace[0].line_number, 7);
    }

    #[tokio::test]
    async fn capture_consumes_cached_harvest() {
        let (pipeline, transport, caches) = pipeline_with(1.0, None);
        let key = stack::stack_key(Some(STACK), 0);
        let mut harvest = Harvest::default();
        harvest
            .locals
            .insert("x".to_string(), CapturedValue::leaf("x", TypeTag::Number, "42"));
        caches.store(key, harvest);

        let error = HostError::new("Error", "boom").with_stack(STACK);
        pipeline.capture(&error, None).await;

        let captures = queued_exceptions(&transport);
        assert_eq!(captures[0].capture.local_variables["x"].value, "42");
        // One-time consume: a second capture of the same error sees nothing.
        pipeline.capture(&error, None).await;
        let captures = queued_exceptions(&transport);
        assert!(captures[1].capture.local_variables.is_empty());
    }

    #[tokio::test]
    async fn capture_waits_for_pending_harvest() {
        let (pipeline, transport, caches) = pipeline_with(1.0, None);
        let key = stack::stack_key(Some(STACK), 0);
        let done = caches.register_pending(&key);

        let finisher = {
            let caches = caches.clone();
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                let mut harvest = Harvest::default();
                harvest
                    .locals
                    .insert("y".to_string(), CapturedValue::leaf("y", TypeTag::Number, "9"));
                caches.store(key.clone(), harvest);
                caches.finish_pending(&key, done);
            })
        };

        let error = HostError::new("Error", "boom").with_stack(STACK);
        pipeline.capture(&error, None).await;
        finisher.await.expect("finisher");

        let captures = queued_exceptions(&transport);
        assert_eq!(captures[0].capture.local_variables["y"].value, "9");
    }

    #[tokio::test]
    async fn harvest_wait_times_out_and_emits_without_locals() {
        let (pipeline, transport, caches) = pipeline_with(1.0, None);
        let key = stack::stack_key(Some(STACK), 0);
        // Pending forever: the sender never fires.
        let _done = caches.register_pending(&key);

        let started = tokio::time::Instant::now();
        let error = HostError::new("Error", "boom").with_stack(STACK);
        pipeline.capture(&error, None).await;

        assert!(started.elapsed() >= HARVEST_WAIT);
        let captures = queued_exceptions(&transport);
        assert_eq!(captures.len(), 1);
        assert!(captures[0].capture.local_variables.is_empty());
    }

    #[tokio::test]
    async fn debugger_reported_fingerprints_are_suppressed() {
        let (pipeline, transport, caches) = pipeline_with(1.0, None);
        let error = HostError::new("Error", "boom").with_stack(STACK);
        let dedup_key = stack::dedup_fingerprint("Error", [7, 2]);
        caches.mark_sent(dedup_key);

        pipeline.capture(&error, None).await;

        assert!(queued_exceptions(&transport).is_empty());
    }

    #[tokio::test]
    async fn sampled_out_captures_are_silent() {
        let (pipeline, transport, _caches) = pipeline_with(0.0, None);
        let error = HostError::new("Error", "boom").with_stack(STACK);
        pipeline.capture(&error, None).await;
        assert!(queued_exceptions(&transport).is_empty());
    }

    #[tokio::test]
    async fn uncaught_without_prior_handler_schedules_exit() {
        let (pipeline, transport, _caches) = pipeline_with(1.0, None);
        let exits = Arc::new(AtomicUsize::new(0));
        let observed = exits.clone();
        pipeline.set_exit_hook(Arc::new(move || {
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        let error = HostError::new("TypeError", "boom").with_stack(STACK);
        pipeline.handle_uncaught_exception(error).await;

        assert_eq!(exits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(EXIT_FLUSH_DELAY + Duration::from_millis(100)).await;
        assert_eq!(exits.load(Ordering::SeqCst), 1);

        let captures = queued_exceptions(&transport);
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].capture.exception_type, "TypeError");
        assert_eq!(
            captures[0].capture.context["type"],
            Value::String("uncaughtException".to_string())
        );
    }

    #[tokio::test]
    async fn uncaught_with_prior_handler_chains_and_does_not_exit() {
        let chained = Arc::new(AtomicUsize::new(0));
        let observed = chained.clone();
        let prior: HookFn = Arc::new(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        let (pipeline, _transport, _caches) = pipeline_with(1.0, Some(prior));
        let exits = Arc::new(AtomicUsize::new(0));
        let observed_exits = exits.clone();
        pipeline.set_exit_hook(Arc::new(move || {
            observed_exits.fetch_add(1, Ordering::SeqCst);
        }));

        let error = HostError::new("TypeError", "boom").with_stack(STACK);
        pipeline.handle_uncaught_exception(error).await;
        tokio::time::sleep(EXIT_FLUSH_DELAY + Duration::from_millis(100)).await;

        assert_eq!(chained.load(Ordering::SeqCst), 1);
        assert_eq!(exits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn chaining_happens_even_when_sampled_out() {
        let chained = Arc::new(AtomicUsize::new(0));
        let observed = chained.clone();
        let prior: HookFn = Arc::new(move |_| {
            observed.fetch_add(1, Ordering::SeqCst);
        });
        let (pipeline, transport, _caches) = pipeline_with(0.0, Some(prior));

        let error = HostError::new("TypeError", "boom").with_stack(STACK);
        pipeline.handle_uncaught_exception(error).await;

        assert_eq!(chained.load(Ordering::SeqCst), 1);
        assert!(queued_exceptions(&transport).is_empty());
    }

    #[tokio::test]
    async fn non_error_rejection_value_becomes_generic_error() {
        let (pipeline, transport, _caches) = pipeline_with(1.0, None);
        let error = HostError::from_rejection_value("nope");
        pipeline.handle_unhandled_rejection(error).await;

        let captures = queued_exceptions(&transport);
        assert_eq!(captures.len(), 1);
        assert_eq!(captures[0].capture.exception_type, "Error");
        assert_eq!(captures[0].capture.message, "nope");
        assert_eq!(
            captures[0].capture.context["type"],
            Value::String("unhandledRejection".to_string())
        );
    }

    #[tokio::test]
    async fn context_and_user_are_merged_into_captures() {
        let (pipeline, transport, _caches) = pipeline_with(1.0, None);
        pipeline.set_context(BTreeMap::from([(
            "service".to_string(),
            Value::String("checkout".to_string()),
        )]));
        pipeline.set_user(UserInfo {
            id: Some("u-7".to_string()),
            email: None,
            username: Some("jo".to_string()),
        });

        let error = HostError::new("Error", "boom").with_stack(STACK);
        pipeline
            .capture(
                &error,
                Some(BTreeMap::from([(
                    "order_id".to_string(),
                    Value::String("o-42".to_string()),
                )])),
            )
            .await;

        let context = &queued_exceptions(&transport)[0].capture.context;
        assert_eq!(context["service"], Value::String("checkout".to_string()));
        assert_eq!(context["order_id"], Value::String("o-42".to_string()));
        assert_eq!(context["user"]["id"], Value::String("u-7".to_string()));
        assert_eq!(context["user"]["username"], Value::String("jo".to_string()));
    }
}
