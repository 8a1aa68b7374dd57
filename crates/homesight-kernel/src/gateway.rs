//! [`InferenceGateway`] – the single serialization point in front of the
//! shared accelerator.
//!
//! Every inference call of every session passes through here. The gateway
//! owns one lane per [`Backend`]; each lane has a small number of execution
//! slots and a bounded waiting queue.
//!
//! # Admission rules
//!
//! 1. A session never has more than one call executing on a lane. A second
//!    request from the same session waits even when a slot is free.
//! 2. A session never has more than one request waiting on a lane. A newer
//!    request evicts the older waiting one, which completes as
//!    [`Completion::Stale`].
//! 3. When the queue is full and the submitting session has nothing to
//!    evict, the request fails with [`HomeError::GatewayBusy`]. Other
//!    sessions' requests are never evicted.
//!
//! # Staleness
//!
//! Every request carries a [`CycleKey`]. The gateway remembers the newest key
//! registered per session (see [`InferenceGateway::advance`]). A request
//! whose key has been overtaken is dropped before it reaches the backend if
//! it is still waiting, and its reply is discarded if it was already running.
//! Running calls are never interrupted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use homesight_types::{Backend, CycleKey, HomeError, SessionId};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

/// Limits of one backend lane.
#[derive(Debug, Clone, PartialEq)]
pub struct LaneConfig {
    /// Concurrent execution slots.
    pub capacity: usize,
    /// Requests allowed to wait for a slot.
    pub queue_depth: usize,
    /// Hard per-call timeout.
    pub timeout: Duration,
    /// Minimum spacing between two dispatches, if any.
    pub min_spacing: Option<Duration>,
}

impl LaneConfig {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            capacity: 1,
            queue_depth: 4,
            timeout,
            min_spacing: None,
        }
    }
}

/// Configuration for [`InferenceGateway`].
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub vision: LaneConfig,
    pub planning: LaneConfig,
    /// Consecutive failures after which a backend is reported unavailable.
    pub unavailable_after: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            vision: LaneConfig::with_timeout(Duration::from_secs(20)),
            planning: LaneConfig::with_timeout(Duration::from_secs(30)),
            unavailable_after: 3,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Requests and the backend seam
// ────────────────────────────────────────────────────────────────────────────

/// One inference call.
#[derive(Clone)]
pub struct InferenceRequest {
    pub key: CycleKey,
    pub system: String,
    pub prompt: String,
    /// Encoded image sent alongside the prompt (vision calls).
    pub image: Option<Arc<[u8]>>,
    pub max_tokens: u32,
    /// JSON Schema the reply must follow, when the backend supports it.
    pub response_schema: Option<serde_json::Value>,
}

impl InferenceRequest {
    pub fn new(key: CycleKey, prompt: impl Into<String>) -> Self {
        Self {
            key,
            system: String::new(),
            prompt: prompt.into(),
            image: None,
            max_tokens: 512,
            response_schema: None,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_image(mut self, image: Arc<[u8]>) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_schema(mut self, schema: serde_json::Value) -> Self {
        self.response_schema = Some(schema);
        self
    }
}

impl fmt::Debug for InferenceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceRequest")
            .field("key", &self.key)
            .field("prompt_len", &self.prompt.len())
            .field("image_len", &self.image.as_ref().map(|i| i.len()))
            .field("max_tokens", &self.max_tokens)
            .field("has_schema", &self.response_schema.is_some())
            .finish()
    }
}

/// Reply text plus the time the backend took.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceReply {
    pub text: String,
    pub latency: Duration,
}

/// Result of a gateway call that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Fresh(InferenceReply),
    /// The request was overtaken by a newer key or evicted from the queue;
    /// any reply was dropped.
    Stale,
}

/// An inference service reached over a request/response boundary.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Run one call and return the raw reply text.
    ///
    /// # Errors
    ///
    /// [`HomeError::InferenceBackend`] for transport failures and malformed
    /// responses.
    async fn infer(&self, request: &InferenceRequest) -> Result<String, HomeError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Lanes
// ────────────────────────────────────────────────────────────────────────────

enum Admission {
    Go,
    Evicted,
}

struct Waiter {
    ticket: u64,
    session_id: SessionId,
    wake: oneshot::Sender<Admission>,
}

#[derive(Default)]
struct LaneState {
    running: usize,
    running_sessions: HashSet<SessionId>,
    waiting: VecDeque<Waiter>,
    next_ticket: u64,
}

#[derive(Default)]
struct LaneCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    evicted: AtomicU64,
    stale: AtomicU64,
    rejected: AtomicU64,
    busy_micros: AtomicU64,
    consecutive_failures: AtomicU32,
}

struct Lane {
    backend: Backend,
    driver: Arc<dyn InferenceBackend>,
    config: LaneConfig,
    state: Mutex<LaneState>,
    limiter: Option<DefaultDirectRateLimiter>,
    counters: LaneCounters,
}

enum Ticket<'a> {
    Admitted,
    Waiting(Waiting<'a>),
}

impl Lane {
    fn new(backend: Backend, driver: Arc<dyn InferenceBackend>, config: LaneConfig) -> Self {
        let limiter = config
            .min_spacing
            .and_then(Quota::with_period)
            .map(RateLimiter::direct);
        Self {
            backend,
            driver,
            config,
            state: Mutex::new(LaneState::default()),
            limiter,
            counters: LaneCounters::default(),
        }
    }

    fn enqueue(&self, session_id: &SessionId) -> Result<Ticket<'_>, HomeError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        // Any waiter eligible for a free slot has already been admitted, so a
        // free slot plus an idle session means nobody is ahead of us.
        if state.running < self.config.capacity && !state.running_sessions.contains(session_id) {
            state.running += 1;
            state.running_sessions.insert(session_id.clone());
            return Ok(Ticket::Admitted);
        }

        if let Some(pos) = state.waiting.iter().position(|w| &w.session_id == session_id) {
            if let Some(old) = state.waiting.remove(pos) {
                self.counters.evicted.fetch_add(1, Ordering::Relaxed);
                debug!(backend = %self.backend, session = %session_id, "older queued request evicted");
                let _ = old.wake.send(Admission::Evicted);
            }
        } else if state.waiting.len() >= self.config.queue_depth {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(HomeError::GatewayBusy {
                backend: self.backend,
                details: format!("queue full ({} waiting)", state.waiting.len()),
            });
        }

        let (wake, rx) = oneshot::channel();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.waiting.push_back(Waiter {
            ticket,
            session_id: session_id.clone(),
            wake,
        });
        Ok(Ticket::Waiting(Waiting {
            lane: self,
            ticket,
            session_id: session_id.clone(),
            rx: Some(rx),
        }))
    }

    fn release(&self, session_id: &SessionId) {
        let mut guard = lock(&self.state);
        Self::release_locked(&mut guard, &self.config, session_id);
    }

    fn release_locked(state: &mut LaneState, config: &LaneConfig, session_id: &SessionId) {
        state.running = state.running.saturating_sub(1);
        state.running_sessions.remove(session_id);
        while state.running < config.capacity {
            let Some(pos) = state
                .waiting
                .iter()
                .position(|w| !state.running_sessions.contains(&w.session_id))
            else {
                break;
            };
            let Some(waiter) = state.waiting.remove(pos) else {
                break;
            };
            if waiter.wake.send(Admission::Go).is_ok() {
                state.running += 1;
                state.running_sessions.insert(waiter.session_id);
            }
        }
    }

    fn record_failure(&self, unavailable_after: u32) {
        let streak = self.counters.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if streak == unavailable_after {
            warn!(backend = %self.backend, streak, "backend marked unavailable");
        }
    }

    fn snapshot(&self, uptime: Duration, unavailable_after: u32) -> LaneSnapshot {
        let (in_flight, queue_depth) = {
            let state = lock(&self.state);
            (state.running, state.waiting.len())
        };
        let c = &self.counters;
        let busy_micros = c.busy_micros.load(Ordering::Relaxed);
        let window = uptime.as_micros() as f64 * self.config.capacity.max(1) as f64;
        let utilization = if window > 0.0 {
            (busy_micros as f64 / window).min(1.0)
        } else {
            0.0
        };
        let consecutive_failures = c.consecutive_failures.load(Ordering::Relaxed);
        LaneSnapshot {
            backend: self.backend,
            capacity: self.config.capacity,
            in_flight,
            queue_depth,
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            stale: c.stale.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            busy_ms: busy_micros / 1_000,
            utilization,
            consecutive_failures,
            available: consecutive_failures < unavailable_after,
        }
    }
}

/// A request parked in a lane's queue. Dropping it before admission removes
/// it from the queue; dropping it after an unobserved admission frees the
/// slot again.
struct Waiting<'a> {
    lane: &'a Lane,
    ticket: u64,
    session_id: SessionId,
    rx: Option<oneshot::Receiver<Admission>>,
}

impl Waiting<'_> {
    async fn admitted(&mut self) -> Admission {
        let outcome = match self.rx.as_mut() {
            Some(rx) => rx.await.unwrap_or(Admission::Evicted),
            None => Admission::Evicted,
        };
        self.rx = None;
        outcome
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let mut guard = lock(&self.lane.state);
        let state = &mut *guard;
        if let Some(pos) = state.waiting.iter().position(|w| w.ticket == self.ticket) {
            state.waiting.remove(pos);
        } else if let Ok(Admission::Go) = rx.try_recv() {
            Lane::release_locked(state, &self.lane.config, &self.session_id);
        }
    }
}

/// An occupied execution slot, released on drop.
struct Slot<'a> {
    lane: &'a Lane,
    session_id: SessionId,
}

impl Drop for Slot<'_> {
    fn drop(&mut self) {
        self.lane.release(&self.session_id);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Snapshots
// ────────────────────────────────────────────────────────────────────────────

/// Point-in-time metrics of one lane.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneSnapshot {
    pub backend: Backend,
    pub capacity: usize,
    pub in_flight: usize,
    pub queue_depth: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub evicted: u64,
    pub stale: u64,
    pub rejected: u64,
    pub busy_ms: u64,
    /// Busy time over uptime times capacity, in `0.0..=1.0`.
    pub utilization: f64,
    pub consecutive_failures: u32,
    pub available: bool,
}

/// Point-in-time metrics of both lanes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewaySnapshot {
    pub vision: LaneSnapshot,
    pub planning: LaneSnapshot,
}

impl GatewaySnapshot {
    pub fn lane(&self, backend: Backend) -> &LaneSnapshot {
        match backend {
            Backend::Vision => &self.vision,
            Backend::Planning => &self.planning,
        }
    }

    /// Requests waiting across both lanes.
    pub fn queue_depth(&self) -> usize {
        self.vision.queue_depth + self.planning.queue_depth
    }

    pub fn all_available(&self) -> bool {
        self.vision.available && self.planning.available
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Gateway
// ────────────────────────────────────────────────────────────────────────────

/// Serializes, rate-limits and time-boxes calls to the vision and planning
/// backends, and drops replies that a newer cycle has made irrelevant.
pub struct InferenceGateway {
    vision: Lane,
    planning: Lane,
    latest: Mutex<HashMap<SessionId, (u64, u64)>>,
    unavailable_after: u32,
    started: Instant,
}

impl InferenceGateway {
    pub fn new(
        config: GatewayConfig,
        vision: Arc<dyn InferenceBackend>,
        planning: Arc<dyn InferenceBackend>,
    ) -> Self {
        Self {
            vision: Lane::new(Backend::Vision, vision, config.vision),
            planning: Lane::new(Backend::Planning, planning, config.planning),
            latest: Mutex::new(HashMap::new()),
            unavailable_after: config.unavailable_after.max(1),
            started: Instant::now(),
        }
    }

    fn lane(&self, backend: Backend) -> &Lane {
        match backend {
            Backend::Vision => &self.vision,
            Backend::Planning => &self.planning,
        }
    }

    /// Register `key` as the newest key of its session, unless a newer one is
    /// already registered. Every older outstanding request of the session
    /// becomes stale.
    pub fn advance(&self, key: &CycleKey) {
        let mut latest = lock(&self.latest);
        let entry = latest.entry(key.session_id.clone()).or_insert(key.position());
        if key.position() > *entry {
            *entry = key.position();
        }
    }

    /// `true` when a newer key than `key` is registered for its session.
    pub fn is_stale(&self, key: &CycleKey) -> bool {
        lock(&self.latest)
            .get(&key.session_id)
            .is_some_and(|latest| *latest > key.position())
    }

    /// Drop the key registry entry of a stopped session.
    pub fn forget(&self, session_id: &SessionId) {
        lock(&self.latest).remove(session_id);
    }

    /// Run `request` on `backend`.
    ///
    /// # Errors
    ///
    /// - [`HomeError::GatewayBusy`] – the lane queue is full.
    /// - [`HomeError::InferenceTimeout`] – the call exceeded the lane timeout.
    ///   Never retried here.
    /// - [`HomeError::InferenceBackend`] – the backend failed.
    pub async fn execute(
        &self,
        backend: Backend,
        request: InferenceRequest,
    ) -> Result<Completion, HomeError> {
        let lane = self.lane(backend);
        self.advance(&request.key);
        if self.is_stale(&request.key) {
            lane.counters.stale.fetch_add(1, Ordering::Relaxed);
            return Ok(Completion::Stale);
        }
        lane.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let session_id = request.key.session_id.clone();
        match lane.enqueue(&session_id)? {
            Ticket::Admitted => {}
            Ticket::Waiting(mut waiting) => {
                if let Admission::Evicted = waiting.admitted().await {
                    return Ok(Completion::Stale);
                }
            }
        }
        let slot = Slot { lane, session_id };

        if self.is_stale(&request.key) {
            lane.counters.stale.fetch_add(1, Ordering::Relaxed);
            debug!(%backend, key = %request.key, "stale before dispatch; backend skipped");
            return Ok(Completion::Stale);
        }
        if let Some(limiter) = &lane.limiter {
            limiter.until_ready().await;
        }

        let started = Instant::now();
        let result = tokio::time::timeout(lane.config.timeout, lane.driver.infer(&request)).await;
        let latency = started.elapsed();
        drop(slot);
        lane.counters
            .busy_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);

        let error = match result {
            Err(_) => {
                lane.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                let after_ms = lane.config.timeout.as_millis() as u64;
                warn!(%backend, key = %request.key, after_ms, "inference timed out");
                HomeError::InferenceTimeout { backend, after_ms }
            }
            Ok(Err(e)) => {
                lane.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(%backend, key = %request.key, error = %e, "inference failed");
                match e {
                    HomeError::InferenceBackend { .. } => e,
                    other => HomeError::InferenceBackend {
                        backend,
                        details: other.to_string(),
                    },
                }
            }
            Ok(Ok(text)) => {
                lane.counters.completed.fetch_add(1, Ordering::Relaxed);
                lane.counters.consecutive_failures.store(0, Ordering::Relaxed);
                if self.is_stale(&request.key) {
                    lane.counters.stale.fetch_add(1, Ordering::Relaxed);
                    debug!(%backend, key = %request.key, "superseded while running; reply dropped");
                    return Ok(Completion::Stale);
                }
                return Ok(Completion::Fresh(InferenceReply { text, latency }));
            }
        };

        // Lane health counts every failure; the caller only hears about it
        // while its request is still the newest of the session.
        lane.record_failure(self.unavailable_after);
        if self.is_stale(&request.key) {
            lane.counters.stale.fetch_add(1, Ordering::Relaxed);
            debug!(%backend, key = %request.key, "superseded while running; failure dropped");
            return Ok(Completion::Stale);
        }
        Err(error)
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        let uptime = self.started.elapsed();
        GatewaySnapshot {
            vision: self.vision.snapshot(uptime, self.unavailable_after),
            planning: self.planning.snapshot(uptime, self.unavailable_after),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Backend that sleeps, then answers or fails, while recording how many
    /// calls per session run at the same time.
    #[derive(Default)]
    struct ScriptedBackend {
        delay: Duration,
        fail: bool,
        calls: AtomicUsize,
        active: Mutex<HashMap<SessionId, usize>>,
        peak_per_session: AtomicUsize,
        active_total: AtomicUsize,
        peak_total: AtomicUsize,
    }

    impl ScriptedBackend {
        fn slow(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                ..Self::default()
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                fail: true,
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        async fn infer(&self, request: &InferenceRequest) -> Result<String, HomeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let total = self.active_total.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_total.fetch_max(total, Ordering::SeqCst);
            {
                let mut active = lock(&self.active);
                let n = active.entry(request.key.session_id.clone()).or_default();
                *n += 1;
                self.peak_per_session.fetch_max(*n, Ordering::SeqCst);
            }
            tokio::time::sleep(self.delay).await;
            *lock(&self.active)
                .entry(request.key.session_id.clone())
                .or_default() -= 1;
            self.active_total.fetch_sub(1, Ordering::SeqCst);
            if self.fail {
                Err(HomeError::InferenceBackend {
                    backend: Backend::Vision,
                    details: "boom".into(),
                })
            } else {
                Ok(format!("reply to {}", request.key))
            }
        }
    }

    fn key(session: &str, seq: u64) -> CycleKey {
        CycleKey::new(SessionId::new(session), 0, seq)
    }

    fn gateway(vision: Arc<ScriptedBackend>, lane: LaneConfig) -> Arc<InferenceGateway> {
        let config = GatewayConfig {
            vision: lane,
            ..GatewayConfig::default()
        };
        Arc::new(InferenceGateway::new(
            config,
            vision,
            ScriptedBackend::slow(Duration::ZERO),
        ))
    }

    fn lane(capacity: usize, queue_depth: usize) -> LaneConfig {
        LaneConfig {
            capacity,
            queue_depth,
            timeout: Duration::from_secs(5),
            min_spacing: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_call_returns_reply_and_counts() {
        let backend = ScriptedBackend::slow(Duration::from_millis(200));
        let gw = gateway(backend.clone(), lane(1, 4));
        let out = gw
            .execute(Backend::Vision, InferenceRequest::new(key("porch", 1), "describe"))
            .await
            .unwrap();
        let Completion::Fresh(reply) = out else {
            panic!("expected a fresh reply, got {out:?}");
        };
        assert_eq!(reply.text, "reply to porch@0:1");
        assert!(reply.latency >= Duration::from_millis(200));

        let snap = gw.snapshot();
        assert_eq!(snap.vision.submitted, 1);
        assert_eq!(snap.vision.completed, 1);
        assert_eq!(snap.vision.in_flight, 0);
        assert!(snap.vision.available);
        assert_eq!(snap.planning.submitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out_without_retry() {
        let backend = ScriptedBackend::slow(Duration::from_secs(8));
        let gw = gateway(backend.clone(), lane(1, 4));
        let err = gw
            .execute(Backend::Vision, InferenceRequest::new(key("porch", 1), "describe"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            HomeError::InferenceTimeout {
                backend: Backend::Vision,
                after_ms: 5_000
            }
        );
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        let snap = gw.snapshot();
        assert_eq!(snap.vision.timed_out, 1);
        assert_eq!(snap.vision.in_flight, 0, "slot must be released after timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_running_call_finishes_but_reply_is_dropped() {
        let backend = ScriptedBackend::slow(Duration::from_secs(1));
        let gw = gateway(backend.clone(), lane(1, 4));
        let running = {
            let gw = gw.clone();
            tokio::spawn(async move {
                gw.execute(Backend::Vision, InferenceRequest::new(key("porch", 1), "p"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gw.advance(&key("porch", 2));

        assert_eq!(running.await.unwrap(), Ok(Completion::Stale));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(gw.snapshot().vision.stale, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_call_that_times_out_completes_as_stale() {
        let backend = ScriptedBackend::slow(Duration::from_secs(8));
        let gw = gateway(backend.clone(), lane(1, 4));
        let running = {
            let gw = gw.clone();
            tokio::spawn(async move {
                gw.execute(Backend::Vision, InferenceRequest::new(key("porch", 1), "p"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        gw.advance(&key("porch", 2));

        assert_eq!(running.await.unwrap(), Ok(Completion::Stale));
        let snap = gw.snapshot();
        assert_eq!(snap.vision.timed_out, 1, "lane health still sees the timeout");
        assert_eq!(snap.vision.stale, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_stale_request_never_reaches_backend() {
        let backend = ScriptedBackend::slow(Duration::from_secs(1));
        let gw = gateway(backend.clone(), lane(1, 4));
        let hog = {
            let gw = gw.clone();
            tokio::spawn(async move {
                gw.execute(Backend::Vision, InferenceRequest::new(key("kitchen", 1), "p"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let queued = {
            let gw = gw.clone();
            tokio::spawn(async move {
                gw.execute(Backend::Vision, InferenceRequest::new(key("porch", 1), "p"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gw.snapshot().vision.queue_depth, 1);
        gw.advance(&key("porch", 2));

        assert!(matches!(hog.await.unwrap(), Ok(Completion::Fresh(_))));
        assert_eq!(queued.await.unwrap(), Ok(Completion::Stale));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_request_evicts_same_session_waiter_only() {
        let backend = ScriptedBackend::slow(Duration::from_secs(1));
        let gw = gateway(backend.clone(), lane(1, 2));
        let spawn = |session: &'static str, seq: u64| {
            let gw = gw.clone();
            tokio::spawn(async move {
                gw.execute(Backend::Vision, InferenceRequest::new(key(session, seq), "p"))
                    .await
            })
        };
        let hog = spawn("kitchen", 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let other = spawn("garage", 1);
        let old = spawn("porch", 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let new = spawn("porch", 2);

        assert_eq!(old.await.unwrap(), Ok(Completion::Stale));
        assert!(matches!(hog.await.unwrap(), Ok(Completion::Fresh(_))));
        assert!(matches!(other.await.unwrap(), Ok(Completion::Fresh(_))));
        assert!(matches!(new.await.unwrap(), Ok(Completion::Fresh(_))));
        assert_eq!(gw.snapshot().vision.evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_rejects_other_sessions() {
        let backend = ScriptedBackend::slow(Duration::from_secs(1));
        let gw = gateway(backend.clone(), lane(1, 1));
        let spawn = |session: &'static str| {
            let gw = gw.clone();
            tokio::spawn(async move {
                gw.execute(Backend::Vision, InferenceRequest::new(key(session, 1), "p"))
                    .await
            })
        };
        let _hog = spawn("kitchen");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _queued = spawn("garage");
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = gw
            .execute(Backend::Vision, InferenceRequest::new(key("porch", 1), "p"))
            .await
            .unwrap_err();
        assert!(matches!(err, HomeError::GatewayBusy { backend: Backend::Vision, .. }));
        assert_eq!(gw.snapshot().vision.rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_call_per_session_under_load() {
        let backend = ScriptedBackend::slow(Duration::from_millis(300));
        let gw = gateway(backend.clone(), lane(2, 8));
        let mut handles = Vec::new();
        for round in 1..=5u64 {
            for session in ["porch", "kitchen", "garage"] {
                let gw = gw.clone();
                handles.push(tokio::spawn(async move {
                    gw.execute(Backend::Vision, InferenceRequest::new(key(session, round), "p"))
                        .await
                }));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        for h in handles {
            let _ = h.await.unwrap();
        }
        assert_eq!(backend.peak_per_session.load(Ordering::SeqCst), 1);
        assert!(backend.peak_total.load(Ordering::SeqCst) <= 2);
        let snap = gw.snapshot();
        assert_eq!(snap.vision.in_flight, 0);
        assert_eq!(snap.vision.queue_depth, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_waiter_leaves_the_queue() {
        let backend = ScriptedBackend::slow(Duration::from_secs(10));
        let gw = gateway(backend.clone(), lane(1, 4));
        let _hog = {
            let gw = gw.clone();
            tokio::spawn(async move {
                gw.execute(Backend::Vision, InferenceRequest::new(key("kitchen", 1), "p"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            gw.execute(Backend::Vision, InferenceRequest::new(key("porch", 1), "p")),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(gw.snapshot().vision.queue_depth, 0);
    }

    #[tokio::test]
    async fn repeated_failures_mark_backend_unavailable() {
        let backend = ScriptedBackend::failing();
        let gw = gateway(backend.clone(), lane(1, 4));
        for seq in 1..=3 {
            let err = gw
                .execute(Backend::Vision, InferenceRequest::new(key("porch", seq), "p"))
                .await
                .unwrap_err();
            assert!(err.is_inference_failure());
        }
        let snap = gw.snapshot();
        assert_eq!(snap.vision.failed, 3);
        assert!(!snap.vision.available);
        assert!(!snap.all_available());
        assert!(snap.planning.available);
    }

    #[tokio::test]
    async fn stale_key_is_refused_up_front() {
        let backend = ScriptedBackend::slow(Duration::ZERO);
        let gw = gateway(backend.clone(), lane(1, 4));
        gw.advance(&key("porch", 9));
        let out = gw
            .execute(Backend::Vision, InferenceRequest::new(key("porch", 3), "p"))
            .await
            .unwrap();
        assert_eq!(out, Completion::Stale);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);

        gw.forget(&SessionId::new("porch"));
        assert!(!gw.is_stale(&key("porch", 3)));
    }

    #[tokio::test]
    async fn min_spacing_delays_second_dispatch() {
        let backend = ScriptedBackend::slow(Duration::ZERO);
        let mut config = lane(1, 4);
        config.min_spacing = Some(Duration::from_millis(100));
        let gw = gateway(backend.clone(), config);
        let started = std::time::Instant::now();
        for seq in 1..=2 {
            gw.execute(Backend::Vision, InferenceRequest::new(key("porch", seq), "p"))
                .await
                .unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(90));
    }
}
