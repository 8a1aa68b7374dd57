//! Per-camera session worker.
//!
//! One tokio task per camera. The worker owns the session's
//! [`SessionStateMachine`] and runs at most one pipeline step at a time:
//! perception, then planning, then dispatch. Sampler events keep arriving
//! while a step runs; newer frames are parked as the next cycle's input and,
//! while perceiving or planning, advance the gateway key so the running
//! step's reply is dropped.
//!
//! The worker publishes its state through a shared [`SessionView`] that the
//! orchestrator reads without involving the worker.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use homesight_kernel::{InferenceGateway, Watchdog};
use homesight_memory::{ActivityLog, SessionHistory};
use homesight_middleware::EventBus;
use homesight_perception::{PerceptionOutcome, PerceptionStage, SamplerEvent};
use homesight_types::{
    CommandOutcome, CycleKey, Event, EventPayload, FrameSample, HistoryEntry, HomeError,
    PerceptionResult, PlanningDecision, SessionId, SessionState, Stage, StageFailure, StreamSource,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, info, warn};

use crate::dispatcher::{ActionDispatcher, ActionReport};
use crate::duplicate_guard::DuplicateGuard;
use crate::planning::{PlanningOutcome, PlanningStage};
use crate::state_machine::{FrameVerdict, SessionStateMachine};

const EVENT_SOURCE: &str = "session";

#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub history_capacity: usize,
    /// Pause in `Idle` between cycles.
    pub cooldown: Duration,
    /// Let newer frames supersede a running perception or planning step.
    pub supersede_in_flight: bool,
    /// Consecutive superseded cycles before one is allowed to finish.
    pub starvation_limit: u32,
    /// Consecutive inference failures that put the session in `Error`.
    pub max_inference_failures: u32,
    /// Time spent in `Error` after a backend fault before sampling again.
    pub error_backoff: Duration,
    /// Window of the repeated-action suppressor.
    pub duplicate_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: 32,
            cooldown: Duration::ZERO,
            supersede_in_flight: true,
            starvation_limit: 3,
            max_inference_failures: 5,
            error_backoff: Duration::from_secs(10),
            duplicate_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionCounters {
    pub frames_accepted: u64,
    pub frames_rejected: u64,
    pub cycles: u64,
    pub superseded: u64,
    pub perceptions: u64,
    pub reused: u64,
    pub decisions: u64,
    pub suppressed: u64,
    pub commands_succeeded: u64,
    pub commands_failed: u64,
    pub failures: u64,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone)]
pub struct SessionView {
    pub session_id: SessionId,
    pub source: StreamSource,
    pub state: SessionState,
    pub epoch: u64,
    /// `(epoch, sequence)` of the newest accepted frame.
    pub last_accepted: Option<(u64, u64)>,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub counters: SessionCounters,
    pub history: SessionHistory,
}

impl SessionView {
    pub fn new(session_id: SessionId, source: StreamSource, history_capacity: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            source,
            state: SessionState::Idle,
            epoch: 0,
            last_accepted: None,
            started_at: now,
            last_activity: now,
            counters: SessionCounters::default(),
            history: SessionHistory::new(history_capacity),
        }
    }
}

/// Collaborators shared by every session of an orchestrator.
#[derive(Clone)]
pub struct SessionServices {
    pub gateway: Arc<InferenceGateway>,
    pub planning: Arc<PlanningStage>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub bus: Arc<EventBus>,
    pub activity: Option<Arc<Mutex<ActivityLog>>>,
    pub watchdog: Arc<Mutex<Watchdog>>,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─────────────────────────────────────────────────────────────────────────────
// Pipeline steps
// ─────────────────────────────────────────────────────────────────────────────

enum CycleStep {
    Perceived {
        stage: PerceptionStage,
        sample: FrameSample,
        result: Result<PerceptionOutcome, HomeError>,
    },
    Planned {
        perception: PerceptionResult,
        result: Result<PlanningOutcome, HomeError>,
    },
    Acted {
        /// `(epoch, sequence)` of the frame the decision came from.
        source: (u64, u64),
        report: ActionReport,
    },
}

type StepFuture = Pin<Box<dyn Future<Output = CycleStep> + Send>>;

async fn next_step(inflight: &mut Option<StepFuture>) -> CycleStep {
    match inflight {
        Some(step) => step.await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<SamplerEvent>>) -> Option<SamplerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn perception_key(p: &PerceptionResult) -> CycleKey {
    CycleKey::new(p.session_id.clone(), p.epoch, p.source_sequence)
}

// ─────────────────────────────────────────────────────────────────────────────
// Worker
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) struct SessionWorker {
    id: SessionId,
    config: SessionConfig,
    services: SessionServices,
    view: Arc<RwLock<SessionView>>,
    machine: SessionStateMachine,
    perception: Option<PerceptionStage>,
    reset_perception: bool,
    duplicates: DuplicateGuard,
    events: Option<mpsc::Receiver<SamplerEvent>>,
    inflight: Option<StepFuture>,
    pending: Option<FrameSample>,
    resume_at: Option<Instant>,
    inference_failures: u32,
    cancel: CancellationToken,
}

impl SessionWorker {
    pub(crate) fn new(
        config: SessionConfig,
        services: SessionServices,
        view: Arc<RwLock<SessionView>>,
        perception: PerceptionStage,
        events: mpsc::Receiver<SamplerEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let id = read(&view).session_id.clone();
        Self {
            machine: SessionStateMachine::new(
                id.clone(),
                config.supersede_in_flight,
                config.starvation_limit,
            ),
            duplicates: DuplicateGuard::new(config.duplicate_window),
            id,
            config,
            services,
            view,
            perception: Some(perception),
            reset_perception: false,
            events: Some(events),
            inflight: None,
            pending: None,
            resume_at: None,
            inference_failures: 0,
            cancel,
        }
    }

    /// Run until cancelled.
    pub(crate) async fn run(mut self) {
        self.set_state(SessionState::Sampling);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                step = next_step(&mut self.inflight) => {
                    self.inflight = None;
                    self.on_step(step);
                }
                _ = wait_until(self.resume_at) => {
                    self.resume_at = None;
                    self.on_resume();
                }
                event = next_event(&mut self.events) => match event {
                    Some(event) => self.on_sampler_event(event),
                    None => self.events = None,
                },
            }
        }
        self.set_state(SessionState::Stopped);
        info!(session = %self.id, counters = ?read(&self.view).counters, "session worker stopped");
    }

    // ── State & recording ───────────────────────────────────────────────────

    fn set_state(&mut self, to: SessionState) -> bool {
        match self.machine.transition(to) {
            Ok(from) => {
                self.state_changed(from, to);
                true
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "transition refused");
                false
            }
        }
    }

    fn state_changed(&self, from: SessionState, to: SessionState) {
        write(&self.view).state = to;
        debug!(session = %self.id, %from, %to, "state changed");
        let _ = self.services.bus.publish(Event::new(
            EVENT_SOURCE,
            EventPayload::SessionStateChanged {
                session_id: self.id.clone(),
                from,
                to,
            },
        ));
    }

    fn counters(&self, update: impl FnOnce(&mut SessionCounters)) {
        update(&mut write(&self.view).counters);
    }

    fn record(&self, entry: HistoryEntry) {
        if let Some(log) = &self.services.activity
            && let Err(e) = lock(log).append(&entry)
        {
            warn!(session = %self.id, error = %e, "activity log append failed");
        }
        write(&self.view).history.push(entry.clone());
        let _ = self.services.bus.publish(Event::new(
            EVENT_SOURCE,
            EventPayload::History {
                session_id: self.id.clone(),
                entry,
            },
        ));
    }

    fn record_failure(&self, stage: Stage, epoch: u64, sequence: u64, error: HomeError) {
        self.counters(|c| c.failures += 1);
        self.record(HistoryEntry::Failure(StageFailure {
            session_id: self.id.clone(),
            stage,
            epoch,
            sequence,
            error,
            at: Utc::now(),
        }));
    }

    fn alert(&self, message: String) {
        let _ = self.services.bus.publish(Event::new(
            EVENT_SOURCE,
            EventPayload::Alert {
                session_id: Some(self.id.clone()),
                message,
            },
        ));
    }

    // ── Sampler events ──────────────────────────────────────────────────────

    fn on_sampler_event(&mut self, event: SamplerEvent) {
        match event {
            SamplerEvent::Sample(sample) => self.on_sample(sample),
            SamplerEvent::Disconnected { reason } => self.on_stream_lost(reason),
            SamplerEvent::Reconnected { epoch } => {
                write(&self.view).epoch = epoch;
                self.pending = None;
                self.reset_perception = true;
                if self.machine.state() == SessionState::Error {
                    info!(session = %self.id, epoch, "stream recovered");
                    self.resume_at = None;
                    self.set_state(SessionState::Sampling);
                    self.try_start_pending();
                }
            }
            SamplerEvent::Ended => {
                self.on_stream_lost("stream ended".to_string());
                self.events = None;
            }
        }
    }

    fn on_stream_lost(&mut self, reason: String) {
        let (epoch, sequence) = self.machine.last_accepted().unwrap_or_default();
        let camera = read(&self.view).source.camera_id.clone();
        self.record_failure(
            Stage::Stream,
            epoch,
            sequence,
            HomeError::Stream {
                camera,
                details: reason.clone(),
            },
        );
        self.resume_at = None;
        if self.machine.state() != SessionState::Error {
            self.set_state(SessionState::Error);
        }
        self.alert(format!("camera stream lost: {reason}"));
    }

    fn on_sample(&mut self, sample: FrameSample) {
        let key = sample.key();
        let verdict = self.machine.offer_frame(&key);
        if verdict == FrameVerdict::Rejected {
            debug!(session = %self.id, %key, "stale frame rejected");
            self.counters(|c| c.frames_rejected += 1);
            return;
        }

        {
            let mut view = write(&self.view);
            view.counters.frames_accepted += 1;
            view.last_accepted = Some(key.position());
            view.last_activity = Utc::now();
        }
        lock(&self.services.watchdog).touch(&self.id);

        match verdict {
            FrameVerdict::StartCycle if self.inflight.is_none() => self.start_cycle(sample),
            FrameVerdict::Deferred { supersedes: true } => {
                debug!(session = %self.id, %key, "newer frame supersedes running cycle");
                self.services.gateway.advance(&key);
                self.pending = Some(sample);
            }
            _ => self.pending = Some(sample),
        }
    }

    // ── Cycle steps ─────────────────────────────────────────────────────────

    fn try_start_pending(&mut self) {
        if self.machine.state() == SessionState::Sampling
            && self.inflight.is_none()
            && let Some(sample) = self.pending.take()
        {
            self.start_cycle(sample);
        }
    }

    fn start_cycle(&mut self, sample: FrameSample) {
        let Some(mut stage) = self.perception.take() else {
            self.pending = Some(sample);
            return;
        };
        if std::mem::take(&mut self.reset_perception) {
            stage.reset();
        }
        let key = sample.key();
        if let Err(e) = self.machine.begin_cycle(&key) {
            warn!(session = %self.id, error = %e, "cannot start cycle");
            self.perception = Some(stage);
            self.pending = Some(sample);
            return;
        }
        self.state_changed(SessionState::Sampling, SessionState::Perceiving);
        self.counters(|c| c.cycles += 1);

        let span = debug_span!("perceive", epoch = key.epoch, seq = key.sequence);
        self.inflight = Some(Box::pin(
            async move {
                let result = stage.perceive(&sample).await;
                CycleStep::Perceived {
                    stage,
                    sample,
                    result,
                }
            }
            .instrument(span),
        ));
    }

    fn on_step(&mut self, step: CycleStep) {
        match step {
            CycleStep::Perceived {
                stage,
                sample,
                result,
            } => {
                self.perception = Some(stage);
                self.on_perceived(sample, result);
            }
            CycleStep::Planned { perception, result } => self.on_planned(perception, result),
            CycleStep::Acted { source, report } => self.on_acted(source, report),
        }
    }

    /// `true` when the machine is still in `state` for the cycle at `key`.
    fn owns_cycle(&self, state: SessionState, key: &CycleKey) -> bool {
        self.machine.state() == state && self.machine.cycle() == Some(key.position())
    }

    fn on_perceived(&mut self, sample: FrameSample, result: Result<PerceptionOutcome, HomeError>) {
        let key = sample.key();
        if !self.owns_cycle(SessionState::Perceiving, &key) {
            debug!(session = %self.id, %key, "perception for abandoned cycle dropped");
            self.try_start_pending();
            return;
        }

        match result {
            Ok(PerceptionOutcome::Fresh(result) | PerceptionOutcome::Reused(result))
                if self.machine.accepts_result(&key) =>
            {
                if result.reused {
                    self.counters(|c| c.reused += 1);
                } else {
                    self.inference_failures = 0;
                    self.counters(|c| c.perceptions += 1);
                }
                let history = read(&self.view).history.recent(usize::MAX);
                self.record(HistoryEntry::Perception(result.clone()));
                self.set_state(SessionState::Planning);
                self.start_planning(result, history);
            }
            Err(error) if self.machine.accepts_result(&key) => {
                self.record_failure(Stage::Perception, key.epoch, key.sequence, error.clone());
                self.set_state(SessionState::Sampling);
                self.machine.finish_cycle(false);
                if !self.on_stage_error(&error) {
                    self.try_start_pending();
                }
            }
            _ => {
                debug!(session = %self.id, %key, "perception superseded");
                self.set_state(SessionState::Sampling);
                self.machine.finish_cycle(true);
                self.counters(|c| c.superseded += 1);
                self.try_start_pending();
            }
        }
    }

    fn start_planning(&mut self, perception: PerceptionResult, history: Vec<HistoryEntry>) {
        let planning = self.services.planning.clone();
        let span = debug_span!("plan", epoch = perception.epoch, seq = perception.source_sequence);
        self.inflight = Some(Box::pin(
            async move {
                let result = planning.plan(&perception, &history).await;
                CycleStep::Planned { perception, result }
            }
            .instrument(span),
        ));
    }

    fn on_planned(&mut self, perception: PerceptionResult, result: Result<PlanningOutcome, HomeError>) {
        let key = perception_key(&perception);
        if !self.owns_cycle(SessionState::Planning, &key) {
            debug!(session = %self.id, %key, "decision for abandoned cycle dropped");
            self.try_start_pending();
            return;
        }
        let current = self.machine.accepts_result(&key);

        match result {
            Ok(PlanningOutcome::Decided(decision)) if current => self.on_decision(decision),
            Ok(PlanningOutcome::Unparseable { decision, error }) if current => {
                self.inference_failures = 0;
                self.record_failure(Stage::Planning, key.epoch, key.sequence, error);
                self.counters(|c| c.decisions += 1);
                self.record(HistoryEntry::Decision(decision));
                self.finish_to_idle(false);
            }
            Err(error) if current => {
                self.record_failure(Stage::Planning, key.epoch, key.sequence, error.clone());
                self.set_state(SessionState::Idle);
                self.machine.finish_cycle(false);
                if !self.on_stage_error(&error) {
                    self.enter_idle();
                }
            }
            _ => {
                debug!(session = %self.id, %key, "decision superseded");
                self.counters(|c| c.superseded += 1);
                self.finish_to_idle(true);
            }
        }
    }

    fn on_decision(&mut self, decision: PlanningDecision) {
        self.inference_failures = 0;
        self.counters(|c| c.decisions += 1);

        if decision.action.is_noop() {
            self.record(HistoryEntry::Decision(decision));
            self.finish_to_idle(false);
            return;
        }
        if self.duplicates.is_duplicate(&decision.action) {
            debug!(session = %self.id, kind = ?decision.action.kind(), "repeated action suppressed");
            self.counters(|c| c.suppressed += 1);
            self.record(HistoryEntry::Suppressed(decision));
            self.finish_to_idle(false);
            return;
        }

        self.record(HistoryEntry::Decision(decision.clone()));
        self.duplicates.record(&decision.action);
        self.set_state(SessionState::Acting);

        let dispatcher = self.services.dispatcher.clone();
        let source = (decision.epoch, decision.source_sequence);
        let span = debug_span!("act", decision = %decision.id);
        self.inflight = Some(Box::pin(
            async move {
                let report = dispatcher.dispatch(&decision).await;
                CycleStep::Acted { source, report }
            }
            .instrument(span),
        ));
    }

    fn on_acted(&mut self, source: (u64, u64), report: ActionReport) {
        let (epoch, sequence) = source;
        for command in report.commands {
            match &command.outcome {
                CommandOutcome::Failed { reason } => {
                    self.counters(|c| c.commands_failed += 1);
                    self.alert(format!("{} {} failed: {reason}", command.device_id, command.command));
                    let error = HomeError::DeviceCommand {
                        device_id: command.device_id.clone(),
                        details: reason.clone(),
                    };
                    self.record(HistoryEntry::Command(command));
                    self.record_failure(Stage::Dispatch, epoch, sequence, error);
                }
                _ => {
                    self.counters(|c| c.commands_succeeded += 1);
                    self.record(HistoryEntry::Command(command));
                }
            }
        }
        if self.machine.state() == SessionState::Acting {
            self.finish_to_idle(false);
        } else {
            self.try_start_pending();
        }
    }

    fn finish_to_idle(&mut self, superseded: bool) {
        self.set_state(SessionState::Idle);
        self.machine.finish_cycle(superseded);
        self.enter_idle();
    }

    fn enter_idle(&mut self) {
        if self.config.cooldown.is_zero() {
            self.set_state(SessionState::Sampling);
            self.try_start_pending();
        } else {
            self.resume_at = Some(Instant::now() + self.config.cooldown);
        }
    }

    fn on_resume(&mut self) {
        match self.machine.state() {
            SessionState::Idle | SessionState::Error => {
                self.set_state(SessionState::Sampling);
                self.try_start_pending();
            }
            _ => {}
        }
    }

    /// Count inference failures; returns `true` when the session entered
    /// `Error`.
    fn on_stage_error(&mut self, error: &HomeError) -> bool {
        if !error.is_inference_failure() {
            return false;
        }
        self.inference_failures += 1;
        if self.inference_failures < self.config.max_inference_failures {
            return false;
        }
        warn!(
            session = %self.id,
            failures = self.inference_failures,
            backoff_ms = self.config.error_backoff.as_millis() as u64,
            "inference keeps failing; backing off"
        );
        self.inference_failures = 0;
        self.set_state(SessionState::Error);
        self.resume_at = Some(Instant::now() + self.config.error_backoff);
        self.alert(format!("inference backend fault: {error}"));
        true
    }
}
