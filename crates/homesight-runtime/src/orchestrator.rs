//! [`Orchestrator`] – session registry and lifecycle control.
//!
//! Starting a session opens the camera stream, spawns a [`FrameSampler`]
//! and a session worker sharing one cancellation token, and registers the
//! session with the inactivity [`Watchdog`]. Stopping cancels both tasks,
//! waits for the worker, and forgets the session's gateway key.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use homesight_hal::sim::{SimCameraSource, SimDeviceController};
//! use homesight_hal::DeviceCatalog;
//! use homesight_kernel::{CapabilityManager, DeviceGate, GatewayConfig, InferenceGateway};
//! use homesight_middleware::EventBus;
//! use homesight_runtime::dispatcher::{ActionDispatcher, DispatcherConfig};
//! use homesight_runtime::inference_driver::OpenAiBackend;
//! use homesight_runtime::orchestrator::{Orchestrator, OrchestratorConfig};
//! use homesight_types::{Backend, SessionId, StreamSource};
//!
//! # async fn demo() -> Result<(), homesight_types::HomeError> {
//! let gateway = Arc::new(InferenceGateway::new(
//!     GatewayConfig::default(),
//!     Arc::new(OpenAiBackend::new(Backend::Vision, "http://localhost:11434", "llava")),
//!     Arc::new(OpenAiBackend::new(Backend::Planning, "http://localhost:11434", "llama3")),
//! ));
//! let gate = Arc::new(DeviceGate::new(CapabilityManager::new(), DeviceCatalog::new()));
//! let dispatcher = Arc::new(ActionDispatcher::new(
//!     gate,
//!     Arc::new(SimDeviceController::new()),
//!     DispatcherConfig::default(),
//! ));
//! let camera = Arc::new(SimCameraSource::new());
//! let feed = camera.add_camera("porch");
//!
//! let orchestrator = Orchestrator::new(
//!     OrchestratorConfig::default(),
//!     gateway,
//!     camera,
//!     dispatcher,
//!     Arc::new(EventBus::default()),
//! );
//! orchestrator
//!     .start_session(SessionId::new("porch"), StreamSource::new("porch", "sim://porch"))
//!     .await?;
//! feed.push_frame(vec![0u8; 64]);
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use homesight_hal::CameraSource;
use homesight_kernel::{GatewaySnapshot, InferenceGateway, Watchdog};
use homesight_memory::ActivityLog;
use homesight_middleware::EventBus;
use homesight_perception::{FrameSampler, PerceptionConfig, PerceptionStage, SamplingPolicy};
use homesight_types::{Event, EventPayload, HistoryEntry, HomeError, SessionId, SessionState, StreamSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, info, info_span, warn};

use crate::dispatcher::ActionDispatcher;
use crate::planning::{PlanningConfig, PlanningStage};
use crate::session::{SessionConfig, SessionServices, SessionView, SessionWorker, lock, read};

const EVENT_SOURCE: &str = "orchestrator";

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub sampling: SamplingPolicy,
    pub perception: PerceptionConfig,
    pub planning: PlanningConfig,
    pub session: SessionConfig,
    /// Sessions without an accepted frame for this long are reaped.
    pub inactivity_timeout: Duration,
    /// Activity log entries older than this are pruned.
    pub history_retention: Duration,
    /// Capacity of the sampler → worker channel.
    pub event_channel: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingPolicy::default(),
            perception: PerceptionConfig::default(),
            planning: PlanningConfig::default(),
            session: SessionConfig::default(),
            inactivity_timeout: Duration::from_secs(10 * 60),
            history_retention: Duration::from_secs(7 * 24 * 60 * 60),
            event_channel: 8,
        }
    }
}

/// Health summary for the management API.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub gateway: GatewaySnapshot,
    pub sessions: usize,
    pub by_state: HashMap<SessionState, usize>,
    pub errored: Vec<SessionId>,
}

impl HealthReport {
    /// Every backend available and no session in `Error`.
    pub fn is_healthy(&self) -> bool {
        self.gateway.all_available() && self.errored.is_empty()
    }
}

struct SessionHandle {
    view: Arc<RwLock<SessionView>>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
    sampler: JoinHandle<()>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    camera: Arc<dyn CameraSource>,
    services: SessionServices,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        gateway: Arc<InferenceGateway>,
        camera: Arc<dyn CameraSource>,
        dispatcher: Arc<ActionDispatcher>,
        bus: Arc<EventBus>,
    ) -> Self {
        let planning = Arc::new(PlanningStage::new(
            gateway.clone(),
            dispatcher.gate().catalog(),
            config.planning.clone(),
        ));
        Self {
            services: SessionServices {
                gateway,
                planning,
                dispatcher,
                bus,
                activity: None,
                watchdog: Arc::new(Mutex::new(Watchdog::new())),
            },
            config,
            camera,
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Journal every history entry to `log`.
    pub fn with_activity_log(mut self, log: ActivityLog) -> Self {
        self.services.activity = Some(Arc::new(Mutex::new(log)));
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.services.bus
    }

    pub fn gateway(&self) -> &Arc<InferenceGateway> {
        &self.services.gateway
    }

    /// Open `source` and start the session's sampler and worker.
    ///
    /// # Errors
    ///
    /// - [`HomeError::SessionExists`] – `session_id` is already running.
    /// - [`HomeError::Stream`] – the camera stream could not be opened.
    pub async fn start_session(&self, session_id: SessionId, source: StreamSource) -> Result<(), HomeError> {
        if lock(&self.sessions).contains_key(&session_id) {
            return Err(HomeError::SessionExists(session_id));
        }
        let stream = self.camera.open(&session_id, &source).await?;

        let mut sessions = lock(&self.sessions);
        if sessions.contains_key(&session_id) {
            return Err(HomeError::SessionExists(session_id));
        }

        let cancel = self.shutdown.child_token();
        let (tx, rx) = mpsc::channel(self.config.event_channel.max(1));
        let view = Arc::new(RwLock::new(SessionView::new(
            session_id.clone(),
            source.clone(),
            self.config.session.history_capacity,
        )));
        let span = info_span!("session", session = %session_id, camera = %source.camera_id);

        let sampler = FrameSampler::new(session_id.clone(), self.config.sampling);
        let sampler = tokio::spawn(sampler.run(stream, tx, cancel.clone()).instrument(span.clone()));

        let perception = PerceptionStage::new(self.services.gateway.clone(), self.config.perception.clone());
        let worker = SessionWorker::new(
            self.config.session.clone(),
            self.services.clone(),
            view.clone(),
            perception,
            rx,
            cancel.clone(),
        );
        let worker = tokio::spawn(worker.run().instrument(span));

        lock(&self.services.watchdog).track(&session_id, self.config.inactivity_timeout);
        sessions.insert(
            session_id.clone(),
            SessionHandle {
                view,
                cancel,
                worker,
                sampler,
            },
        );
        drop(sessions);

        info!(session = %session_id, camera = %source.camera_id, "session started");
        let _ = self.services.bus.publish(Event::new(
            EVENT_SOURCE,
            EventPayload::SessionStarted { session_id, source },
        ));
        Ok(())
    }

    /// Stop a session and wait for its worker to finish.
    ///
    /// # Errors
    ///
    /// [`HomeError::UnknownSession`] when no such session is running.
    pub async fn stop_session(&self, session_id: &SessionId) -> Result<(), HomeError> {
        self.stop_with_reason(session_id, "stopped").await
    }

    async fn stop_with_reason(&self, session_id: &SessionId, reason: &str) -> Result<(), HomeError> {
        let handle = lock(&self.sessions)
            .remove(session_id)
            .ok_or_else(|| HomeError::UnknownSession(session_id.clone()))?;
        handle.cancel.cancel();
        if let Err(e) = handle.worker.await {
            warn!(session = %session_id, error = %e, "session worker ended abnormally");
        }
        if let Err(e) = handle.sampler.await {
            warn!(session = %session_id, error = %e, "frame sampler ended abnormally");
        }
        self.services.gateway.forget(session_id);
        lock(&self.services.watchdog).forget(session_id);

        info!(session = %session_id, reason, "session stopped");
        let _ = self.services.bus.publish(Event::new(
            EVENT_SOURCE,
            EventPayload::SessionStopped {
                session_id: session_id.clone(),
                reason: reason.to_string(),
            },
        ));
        Ok(())
    }

    fn with_view<T>(&self, session_id: &SessionId, f: impl FnOnce(&SessionView) -> T) -> Result<T, HomeError> {
        let sessions = lock(&self.sessions);
        let handle = sessions
            .get(session_id)
            .ok_or_else(|| HomeError::UnknownSession(session_id.clone()))?;
        Ok(f(&read(&handle.view)))
    }

    /// # Errors
    ///
    /// [`HomeError::UnknownSession`].
    pub fn session_state(&self, session_id: &SessionId) -> Result<SessionState, HomeError> {
        self.with_view(session_id, |v| v.state)
    }

    /// # Errors
    ///
    /// [`HomeError::UnknownSession`].
    pub fn session_view(&self, session_id: &SessionId) -> Result<SessionView, HomeError> {
        self.with_view(session_id, SessionView::clone)
    }

    /// Up to `limit` history entries, most recent first.
    ///
    /// # Errors
    ///
    /// [`HomeError::UnknownSession`].
    pub fn recent_history(&self, session_id: &SessionId, limit: usize) -> Result<Vec<HistoryEntry>, HomeError> {
        self.with_view(session_id, |v| v.history.recent(limit))
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = lock(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn health(&self) -> HealthReport {
        let mut by_state = HashMap::new();
        let mut errored = Vec::new();
        let sessions = lock(&self.sessions);
        for (id, handle) in sessions.iter() {
            let state = read(&handle.view).state;
            *by_state.entry(state).or_insert(0) += 1;
            if state == SessionState::Error {
                errored.push(id.clone());
            }
        }
        errored.sort();
        HealthReport {
            gateway: self.services.gateway.snapshot(),
            sessions: sessions.len(),
            by_state,
            errored,
        }
    }

    /// Stop every session whose inactivity timeout elapsed. Returns the ids
    /// stopped.
    pub async fn reap_inactive(&self) -> Vec<SessionId> {
        let expired = lock(&self.services.watchdog).expired();
        let mut reaped = Vec::with_capacity(expired.len());
        for session_id in expired {
            warn!(session = %session_id, "no frames accepted within inactivity timeout");
            if self.stop_with_reason(&session_id, "inactive").await.is_ok() {
                reaped.push(session_id);
            }
        }
        reaped
    }

    /// Drop activity log entries older than the retention period. Returns
    /// the number removed; zero without an activity log.
    ///
    /// # Errors
    ///
    /// [`HomeError::Config`] when the log cannot be pruned.
    pub fn prune_activity(&self) -> Result<usize, HomeError> {
        let Some(log) = &self.services.activity else {
            return Ok(0);
        };
        let retention = chrono::Duration::from_std(self.config.history_retention)
            .map_err(|e| HomeError::Config(format!("history retention: {e}")))?;
        lock(log)
            .prune_older_than(Utc::now() - retention)
            .map_err(|e| HomeError::Config(format!("activity log: {e}")))
    }

    /// Stop every session.
    pub async fn shutdown(&self) {
        for session_id in self.sessions() {
            let _ = self.stop_with_reason(&session_id, "shutdown").await;
        }
        self.shutdown.cancel();
    }
}
