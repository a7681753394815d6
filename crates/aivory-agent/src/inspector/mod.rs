pub mod client;
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
pub mod protocol;

use crate::config::Config;
use crate::harvest::{harvest_call_frames, Harvest, HarvestLimits};
use crate::pipeline::ExceptionPipeline;
use crate::stack;
use crate::transport::{CollectorCommand, Transport};
use aivory_core::capture::{Breakpoint, ExceptionCapture};
use aivory_core::wire::{
    BreakpointHitPayload, CollectorMsg, ExceptionPayload, RemoveBreakpointPayload,
    SetBreakpointPayload,
};
use chrono::Utc;
use client::{Inspector, InspectorError};
use protocol::{InspectorEvent, PausedEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub(crate) const LOCALS_CACHE_CAP: usize = 100;
pub(crate) const CACHE_MAX_AGE: Duration = Duration::from_secs(5);
pub(crate) const DEDUP_CAP: usize = 100;
pub(crate) const RATE_LIMIT_MAX: usize = 50;
pub(crate) const RATE_WINDOW: Duration = Duration::from_secs(1);

const PAUSE_ON_EXCEPTIONS_ALL: &str = "all";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Insertion-ordered map with a hard capacity: the oldest entry is evicted
/// first.
struct FifoMap<V> {
    order: VecDeque<String>,
    entries: HashMap<String, V>,
    cap: usize,
}

impl<V> FifoMap<V> {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            entries: HashMap::new(),
            cap,
        }
    }

    fn insert(&mut self, key: String, value: V) {
        if self.entries.insert(key.clone(), value).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn take(&mut self, key: &str) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    fn retain(&mut self, mut keep: impl FnMut(&V) -> bool) {
        let entries = &mut self.entries;
        self.order.retain(|key| {
            let kept = entries.get(key).map(&mut keep).unwrap_or(false);
            if !kept {
                entries.remove(key);
            }
            kept
        });
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Insertion-ordered set with FIFO eviction once the cap is exceeded.
struct FifoSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    cap: usize,
}

impl FifoSet {
    fn new(cap: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            cap,
        }
    }

    fn insert(&mut self, value: String) {
        if !self.members.insert(value.clone()) {
            return;
        }
        self.order.push_back(value);
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }

    fn contains(&self, value: &str) -> bool {
        self.members.contains(value)
    }

    fn len(&self) -> usize {
        self.members.len()
    }
}

/// Rolling one-second ceiling on exception pauses: an event is admitted only
/// while fewer than 50 admissions sit inside the trailing window. Events past
/// the limit are counted and take the fast path: resume without capture.
struct RateLimiter {
    recent: VecDeque<Instant>,
    skipped: u64,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            recent: VecDeque::new(),
            skipped: 0,
        }
    }

    fn allow(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.recent.front() {
            if now.duration_since(*oldest) >= RATE_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= RATE_LIMIT_MAX {
            self.skipped += 1;
            return false;
        }
        self.recent.push_back(now);
        true
    }
}

struct CachedHarvest {
    harvest: Harvest,
    created_at: Instant,
}

struct PendingHarvest {
    created_at: Instant,
    done: watch::Receiver<bool>,
}

/// Harvest state bridging the paused-inspection moment and the later
/// exception-hook report. Written by the debugger session, read by the
/// exception pipeline through [`CaptureSource`].
pub struct HarvestCaches {
    pending: Mutex<HashMap<String, PendingHarvest>>,
    cached: Mutex<FifoMap<CachedHarvest>>,
    dedup: Mutex<FifoSet>,
}

impl HarvestCaches {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            cached: Mutex::new(FifoMap::new(LOCALS_CACHE_CAP)),
            dedup: Mutex::new(FifoSet::new(DEDUP_CAP)),
        }
    }

    pub(crate) fn register_pending(&self, stack_key: &str) -> watch::Sender<bool> {
        let (done_tx, done_rx) = watch::channel(false);
        lock(&self.pending).insert(
            stack_key.to_string(),
            PendingHarvest {
                created_at: Instant::now(),
                done: done_rx,
            },
        );
        done_tx
    }

    pub(crate) fn store(&self, stack_key: String, harvest: Harvest) {
        let mut cached = lock(&self.cached);
        let now = Instant::now();
        cached.retain(|entry| now.duration_since(entry.created_at) < CACHE_MAX_AGE);
        cached.insert(
            stack_key,
            CachedHarvest {
                harvest,
                created_at: now,
            },
        );
    }

    pub(crate) fn finish_pending(&self, stack_key: &str, done_tx: watch::Sender<bool>) {
        lock(&self.pending).remove(stack_key);
        let _ = done_tx.send(true);
    }

    pub(crate) fn mark_sent(&self, fingerprint: String) {
        lock(&self.dedup).insert(fingerprint);
    }
}

impl Default for HarvestCaches {
    fn default() -> Self {
        Self::new()
    }
}

/// The narrow capability the exception pipeline gets over session-owned
/// state: look up a harvest by stack key, wait on an in-flight one, and check
/// whether the debugger path already reported a fingerprint.
pub trait CaptureSource: Send + Sync {
    /// One-time consume: a hit removes the entry.
    fn take_harvest(&self, stack_key: &str) -> Option<Harvest>;
    fn pending_signal(&self, stack_key: &str) -> Option<watch::Receiver<bool>>;
    fn was_sent_via_debugger(&self, fingerprint: &str) -> bool;
}

impl CaptureSource for HarvestCaches {
    fn take_harvest(&self, stack_key: &str) -> Option<Harvest> {
        let mut cached = lock(&self.cached);
        let now = Instant::now();
        cached.retain(|entry| now.duration_since(entry.created_at) < CACHE_MAX_AGE);
        cached.take(stack_key).map(|entry| entry.harvest)
    }

    fn pending_signal(&self, stack_key: &str) -> Option<watch::Receiver<bool>> {
        lock(&self.pending)
            .get(stack_key)
            .filter(|pending| pending.created_at.elapsed() < CACHE_MAX_AGE)
            .map(|pending| pending.done.clone())
    }

    fn was_sent_via_debugger(&self, fingerprint: &str) -> bool {
        lock(&self.dedup).contains(fingerprint)
    }
}

/// Owns the connection to the host debugger: pause-on-exception handling,
/// the breakpoint registry, and the harvest caches the pipeline reads.
pub struct DebuggerSession {
    inspector: Arc<dyn Inspector>,
    config: Arc<Config>,
    transport: Transport,
    caches: Arc<HarvestCaches>,
    breakpoints: Mutex<HashMap<String, Breakpoint>>,
    scripts: Mutex<HashMap<String, String>>,
    rate: Mutex<RateLimiter>,
}

impl DebuggerSession {
    pub fn new(
        inspector: Arc<dyn Inspector>,
        config: Arc<Config>,
        transport: Transport,
        caches: Arc<HarvestCaches>,
    ) -> Self {
        Self {
            inspector,
            config,
            transport,
            caches,
            breakpoints: Mutex::new(HashMap::new()),
            scripts: Mutex::new(HashMap::new()),
            rate: Mutex::new(RateLimiter::new()),
        }
    }

    /// Enable the debugger and declare pause on all exceptions, caught and
    /// uncaught.
    pub async fn initialize(&self) -> Result<(), InspectorError> {
        self.inspector.enable().await?;
        self.inspector
            .set_pause_on_exceptions(PAUSE_ON_EXCEPTIONS_ALL)
            .await?;
        Ok(())
    }

    /// Event pump: inspector events on one side, collector commands on the
    /// other. Returns when the inspector event stream closes.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<InspectorEvent>,
        mut commands: mpsc::UnboundedReceiver<CollectorCommand>,
        pipeline: Arc<ExceptionPipeline>,
    ) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                maybe_event = events.recv() => {
                    match maybe_event {
                        Some(InspectorEvent::ScriptParsed(event)) => {
                            lock(&self.scripts).insert(event.script_id, event.url);
                        }
                        Some(InspectorEvent::Paused(event)) => self.on_paused(event).await,
                        Some(InspectorEvent::Resumed) => {}
                        Some(InspectorEvent::ExceptionThrown(event)) => {
                            pipeline.on_exception_thrown(event).await;
                        }
                        None => break,
                    }
                }
                maybe_command = commands.recv(), if commands_open => {
                    match maybe_command {
                        Some(CollectorCommand::SetBreakpoint(payload)) => {
                            self.install_breakpoint(payload).await;
                        }
                        Some(CollectorCommand::RemoveBreakpoint(payload)) => {
                            self.remove_breakpoint(payload).await;
                        }
                        None => commands_open = false,
                    }
                }
            }
        }
    }

    /// Pause dispatch. Whatever happens, the host gets exactly one resume.
    pub async fn on_paused(&self, mut event: PausedEvent) {
        self.resolve_frame_urls(&mut event.call_frames);
        if event.is_exception() || event.is_promise_rejection() {
            self.on_exception_pause(event).await;
            return;
        }
        if let Some(backend_id) = self.match_breakpoint(&event.hit_breakpoints) {
            self.on_breakpoint_pause(&backend_id, &event).await;
            return;
        }
        self.resume_host().await;
    }

    async fn on_exception_pause(&self, event: PausedEvent) {
        if !lock(&self.rate).allow(Instant::now()) {
            debug!("exception_rate_limited");
            self.resume_host().await;
            return;
        }

        let description = event
            .data
            .as_ref()
            .and_then(|data| data.description.clone());
        let class_hint = event
            .data
            .as_ref()
            .and_then(|data| data.class_name.as_deref());
        let (exception_type, message) =
            stack::exception_header(description.as_deref(), class_hint);

        let stack_key = stack::stack_key(description.as_deref(), Utc::now().timestamp_millis());
        let fingerprint = stack::dedup_fingerprint(
            &exception_type,
            event
                .call_frames
                .iter()
                .map(|frame| frame.location.line_number + 1),
        );

        // Call frames are only valid while paused: harvest first, resume
        // last.
        let done = self.caches.register_pending(&stack_key);
        let limits = HarvestLimits::from(self.config.as_ref());
        let harvest =
            harvest_call_frames(self.inspector.as_ref(), &event.call_frames, &limits).await;
        self.caches.store(stack_key.clone(), harvest.clone());
        self.caches.finish_pending(&stack_key, done);

        if event.is_exception() {
            self.caches.mark_sent(fingerprint.clone());
            self.emit_exception(&exception_type, &message, &harvest);
        }
        self.resume_host().await;
    }

    /// Debugger-path capture: assembled from the pause itself, so the report
    /// carries locals even for exceptions the host later swallows.
    fn emit_exception(&self, exception_type: &str, message: &str, harvest: &Harvest) {
        let capture = ExceptionCapture {
            id: Uuid::new_v4().to_string(),
            exception_type: exception_type.to_string(),
            message: message.to_string(),
            fingerprint: stack::capture_fingerprint(exception_type, &harvest.stack_trace),
            stack_trace: harvest.stack_trace.clone(),
            local_variables: harvest.locals.clone(),
            context: self.config.base_context.clone(),
            captured_at: Utc::now(),
        };
        self.transport
            .send(CollectorMsg::Exception(Box::new(ExceptionPayload {
                capture,
                identity: self.config.identity(),
                release: self.config.release.clone(),
            })));
    }

    fn match_breakpoint(&self, hit_breakpoints: &[String]) -> Option<String> {
        let registry = lock(&self.breakpoints);
        for hit in hit_breakpoints {
            for (backend_id, breakpoint) in registry.iter() {
                if breakpoint.session_id.as_deref() == Some(hit.as_str()) {
                    return Some(backend_id.clone());
                }
            }
        }
        None
    }

    async fn on_breakpoint_pause(&self, backend_id: &str, event: &PausedEvent) {
        let limits = HarvestLimits::from(self.config.as_ref());
        let harvest =
            harvest_call_frames(self.inspector.as_ref(), &event.call_frames, &limits).await;
        self.transport
            .send(CollectorMsg::BreakpointHit(BreakpointHitPayload {
                breakpoint_id: backend_id.to_string(),
                agent_id: self.config.agent_id.clone(),
                stack_trace: harvest.stack_trace,
                local_variables: harvest.locals,
            }));
        self.resume_host().await;
    }

    /// Install a collector breakpoint. A duplicate backend id replaces the
    /// existing breakpoint.
    pub async fn install_breakpoint(&self, payload: SetBreakpointPayload) {
        if !self.config.enable_breakpoints {
            debug!("breakpoints_disabled: id={}", payload.id);
            return;
        }

        let previous = lock(&self.breakpoints)
            .get(&payload.id)
            .and_then(|breakpoint| breakpoint.session_id.clone());
        if let Some(session_id) = previous {
            if let Err(err) = self.inspector.remove_breakpoint(&session_id).await {
                debug!("breakpoint_replace_remove_error: id={} {err}", payload.id);
            }
        }

        let line_index = payload.line_number.saturating_sub(1);
        let url_regex = breakpoint_url_regex(&payload.file_path);
        match self
            .inspector
            .set_breakpoint_by_url(line_index, &url_regex, payload.condition.as_deref())
            .await
        {
            Ok(session_id) => {
                info!(
                    "breakpoint_installed: id={} path={} line={}",
                    payload.id, payload.file_path, payload.line_number
                );
                lock(&self.breakpoints).insert(
                    payload.id.clone(),
                    Breakpoint {
                        backend_id: payload.id,
                        session_id: Some(session_id),
                        file_path_pattern: payload.file_path,
                        line_number: payload.line_number,
                        condition: payload.condition,
                    },
                );
            }
            Err(err) => warn!("breakpoint_install_error: id={} {err}", payload.id),
        }
    }

    /// Best-effort removal: the registry entry goes away regardless of the
    /// debugger's acknowledgement.
    pub async fn remove_breakpoint(&self, payload: RemoveBreakpointPayload) {
        let removed = lock(&self.breakpoints).remove(&payload.id);
        match removed {
            Some(breakpoint) => {
                if let Some(session_id) = breakpoint.session_id {
                    if let Err(err) = self.inspector.remove_breakpoint(&session_id).await {
                        debug!("breakpoint_remove_error: id={} {err}", payload.id);
                    }
                }
                info!("breakpoint_removed: id={}", payload.id);
            }
            None => debug!("breakpoint_unknown: id={}", payload.id),
        }
    }

    /// Remove all breakpoints, disable the debugger, drop the session.
    pub async fn teardown(&self) {
        let entries: Vec<Breakpoint> = {
            let mut registry = lock(&self.breakpoints);
            registry.drain().map(|(_, breakpoint)| breakpoint).collect()
        };
        for breakpoint in entries {
            if let Some(session_id) = breakpoint.session_id {
                if let Err(err) = self.inspector.remove_breakpoint(&session_id).await {
                    debug!("breakpoint_teardown_error: {err}");
                }
            }
        }
        if let Err(err) = self.inspector.disable().await {
            debug!("debugger_disable_error: {err}");
        }
        lock(&self.scripts).clear();
    }

    /// Frames sometimes arrive without a URL; the parsed-script table fills
    /// them in by script id.
    fn resolve_frame_urls(&self, frames: &mut [protocol::CallFrame]) {
        let scripts = lock(&self.scripts);
        if scripts.is_empty() {
            return;
        }
        for frame in frames.iter_mut() {
            if frame.url.is_empty() {
                if let Some(url) = scripts.get(&frame.location.script_id) {
                    frame.url = url.clone();
                }
            }
        }
    }

    async fn resume_host(&self) {
        if let Err(err) = self.inspector.resume().await {
            warn!("debugger_resume_error: {err}");
        }
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn breakpoint(&self, backend_id: &str) -> Option<Breakpoint> {
        lock(&self.breakpoints).get(backend_id).cloned()
    }
}

/// URL regex sent to the debugger for a path-based breakpoint: any prefix,
/// separators matching either slash style, anchored at the end.
fn breakpoint_url_regex(path: &str) -> String {
    let mut pattern = String::from(".*");
    for ch in path.chars() {
        match ch {
            '/' | '\\' => pattern.push_str(r"[\\/]"),
            '.' | '+' | '*' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' => {
                pattern.push('\\');
                pattern.push(ch);
            }
            _ => pattern.push(ch),
        }
    }
    pattern.push('$');
    pattern
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_map_is_bounded_and_evicts_oldest_first() {
        let mut map = FifoMap::new(LOCALS_CACHE_CAP);
        for n in 0..250 {
            map.insert(format!("key-{n}"), n);
        }
        assert_eq!(map.len(), LOCALS_CACHE_CAP);
        // The newest 100 survive.
        assert!(map.take("key-149").is_none());
        assert_eq!(map.take("key-150"), Some(150));
        assert_eq!(map.take("key-249"), Some(249));
    }

    #[test]
    fn fifo_map_holds_min_of_inserts_and_cap() {
        let mut map = FifoMap::new(LOCALS_CACHE_CAP);
        for n in 0..7 {
            map.insert(format!("key-{n}"), n);
        }
        assert_eq!(map.len(), 7);
    }

    #[test]
    fn fifo_map_take_consumes_the_entry() {
        let mut map = FifoMap::new(4);
        map.insert("a".to_string(), 1);
        assert_eq!(map.take("a"), Some(1));
        assert_eq!(map.take("a"), None);
    }

    #[test]
    fn fifo_set_is_bounded_and_evicts_oldest_first() {
        let mut set = FifoSet::new(DEDUP_CAP);
        for n in 0..150 {
            set.insert(format!("fp-{n}"));
        }
        assert_eq!(set.len(), DEDUP_CAP);
        assert!(!set.contains("fp-49"));
        assert!(set.contains("fp-50"));
        assert!(set.contains("fp-149"));
    }

    #[test]
    fn fifo_set_duplicate_insert_does_not_grow() {
        let mut set = FifoSet::new(DEDUP_CAP);
        for _ in 0..10 {
            set.insert("same".to_string());
        }
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn rate_limiter_allows_fifty_per_window() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new();
        let mut allowed = 0;
        for _ in 0..60 {
            if limiter.allow(start + Duration::from_millis(3)) {
                allowed += 1;
            }
        }
        assert_eq!(allowed, RATE_LIMIT_MAX);
        assert_eq!(limiter.skipped, 10);
    }

    #[test]
    fn rate_limiter_refills_as_the_window_slides_past() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_MAX {
            assert!(limiter.allow(start));
        }
        assert!(!limiter.allow(start));
        assert!(limiter.allow(start + Duration::from_millis(1_100)));
    }

    #[test]
    fn rate_limiter_window_rolls_across_burst_boundaries() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new();
        // Fill the window late in one second...
        for _ in 0..RATE_LIMIT_MAX {
            assert!(limiter.allow(start + Duration::from_millis(990)));
        }
        // ...then a second burst just past the one-second mark still sees the
        // trailing window full.
        for offset in [1_010, 1_200, 1_500, 1_900] {
            assert!(!limiter.allow(start + Duration::from_millis(offset)));
        }
        // Only once the first burst ages out does admission resume.
        assert!(limiter.allow(start + Duration::from_millis(1_995)));
        assert_eq!(limiter.skipped, 4);
    }

    #[test]
    fn breakpoint_regex_matches_either_slash_style() {
        let pattern = breakpoint_url_regex("src/foo.js");
        assert_eq!(pattern, r".*src[\\/]foo\.js$");
        let compiled = regex::Regex::new(&pattern).expect("valid regex");
        assert!(compiled.is_match("file:///srv/app/src/foo.js"));
        assert!(compiled.is_match(r"C:\app\src\foo.js"));
        assert!(!compiled.is_match("src/foo.jsx"));
        assert!(!compiled.is_match("src/bar.js"));
    }

    #[test]
    fn capture_source_take_is_one_time() {
        let caches = HarvestCaches::new();
        caches.store("key".to_string(), Harvest::default());
        assert!(caches.take_harvest("key").is_some());
        assert!(caches.take_harvest("key").is_none());
    }

    #[test]
    fn dedup_marks_are_visible_through_capture_source() {
        let caches = HarvestCaches::new();
        assert!(!caches.was_sent_via_debugger("TypeError|42"));
        caches.mark_sent("TypeError|42".to_string());
        assert!(caches.was_sent_via_debugger("TypeError|42"));
    }
}
