//! `homesight-types` – shared data model for the perceive → plan → act loop.
//!
//! Every other crate in the workspace speaks in these types: the frame
//! samples produced by the sampler, the scene descriptions produced by the
//! vision model, the decisions produced by the planning model, the device
//! commands issued by the dispatcher, and the single [`HomeError`] taxonomy
//! that all of them report failures with.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identifier of one camera session (one session per camera).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Where a session's frames come from, as handed out by the media relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSource {
    /// Camera device identifier, e.g. `"living_room_cam"`.
    pub camera_id: String,
    /// Stream or snapshot URL served by the media relay.
    pub url: String,
}

impl StreamSource {
    pub fn new(camera_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            camera_id: camera_id.into(),
            url: url.into(),
        }
    }
}

/// The two inference backends sharing the accelerator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Vision,
    Planning,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Vision => f.write_str("vision"),
            Backend::Planning => f.write_str("planning"),
        }
    }
}

/// Cancellation key attached to every inference request.
///
/// A key identifies the session and the `(epoch, sequence)` position of the
/// frame that started the cycle. Keys of one session are totally ordered by
/// that pair; a key is stale once a greater key has been registered for the
/// same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CycleKey {
    pub session_id: SessionId,
    /// Stream sub-epoch; incremented on every reconnect.
    pub epoch: u64,
    /// Frame sample sequence number within the epoch.
    pub sequence: u64,
}

impl CycleKey {
    pub fn new(session_id: SessionId, epoch: u64, sequence: u64) -> Self {
        Self {
            session_id,
            epoch,
            sequence,
        }
    }

    /// The `(epoch, sequence)` pair used for ordering.
    pub fn position(&self) -> (u64, u64) {
        (self.epoch, self.sequence)
    }

    /// `true` when `self` is strictly newer than `other` for the same session.
    /// Keys of different sessions are never comparable.
    pub fn is_newer_than(&self, other: &CycleKey) -> bool {
        self.session_id == other.session_id && self.position() > other.position()
    }
}

impl fmt::Display for CycleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.session_id, self.epoch, self.sequence)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────────────────

/// Whether the sampler kept a frame for processing or dropped it as backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleDecision {
    Kept,
    Dropped,
}

/// One sampled frame. Immutable once produced; the payload is shared, not
/// copied, when the sample moves between stages.
#[derive(Clone)]
pub struct FrameSample {
    pub session_id: SessionId,
    pub epoch: u64,
    /// Strictly increasing within an epoch, starting at 1.
    pub sequence: u64,
    /// Sequence number assigned by the camera-stream reader.
    pub source_sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub width: u32,
    pub height: u32,
    /// Opaque encoded frame bytes (typically JPEG).
    pub payload: Arc<[u8]>,
    pub decision: SampleDecision,
    /// Source frames discarded since the previous sample.
    pub dropped_before: u64,
}

impl FrameSample {
    pub fn key(&self) -> CycleKey {
        CycleKey::new(self.session_id.clone(), self.epoch, self.sequence)
    }
}

impl fmt::Debug for FrameSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameSample")
            .field("session_id", &self.session_id)
            .field("epoch", &self.epoch)
            .field("sequence", &self.sequence)
            .field("source_sequence", &self.source_sequence)
            .field("captured_at", &self.captured_at)
            .field("size", &format_args!("{}x{}", self.width, self.height))
            .field("payload_len", &self.payload.len())
            .field("decision", &self.decision)
            .field("dropped_before", &self.dropped_before)
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Perception
// ─────────────────────────────────────────────────────────────────────────────

/// An object or person the vision model reported in the scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SceneEntity {
    pub label: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

/// Structured scene description for one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptionResult {
    pub session_id: SessionId,
    pub epoch: u64,
    pub source_sequence: u64,
    pub description: String,
    #[serde(default)]
    pub entities: Vec<SceneEntity>,
    #[serde(default)]
    pub confidence: Option<f32>,
    pub latency_ms: u64,
    /// `true` when the result was reused from the previous near-identical frame.
    #[serde(default)]
    pub reused: bool,
    pub completed_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Planning
// ─────────────────────────────────────────────────────────────────────────────

/// The closed set of actions the planning model may choose.
///
/// Serialized as `{"action": "<Variant>", "payload": {...}}`; the JSON Schema
/// of this type is handed to the planning model to constrain its output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "action", content = "payload")]
pub enum HomeAction {
    /// Nothing worth doing.
    NoOp,
    /// Push a notification to the household.
    Notify { message: String },
    /// Send a command to one device, e.g. `light.living_room` / `turn_on`.
    ActuateDevice {
        device_id: String,
        command: String,
        #[serde(default)]
        value: Option<String>,
    },
    /// Run a pre-configured manual scene.
    RunScene { scene_id: String },
}

/// Discriminant of [`HomeAction`], used in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    NoOp,
    Notify,
    ActuateDevice,
    RunScene,
}

impl HomeAction {
    pub fn kind(&self) -> ActionKind {
        match self {
            HomeAction::NoOp => ActionKind::NoOp,
            HomeAction::Notify { .. } => ActionKind::Notify,
            HomeAction::ActuateDevice { .. } => ActionKind::ActuateDevice,
            HomeAction::RunScene { .. } => ActionKind::RunScene,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, HomeAction::NoOp)
    }
}

/// A planning model decision, consumed once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningDecision {
    pub id: Uuid,
    pub session_id: SessionId,
    pub epoch: u64,
    /// Frame sequence of the perception the decision was based on.
    pub source_sequence: u64,
    pub action: HomeAction,
    pub rationale: String,
    pub decided_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Device commands
// ─────────────────────────────────────────────────────────────────────────────

/// What the device-control collaborator receives for one attempt.
///
/// `command_id` is stable across retries so the collaborator can deduplicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub command_id: Uuid,
    pub device_id: String,
    pub command: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Lifecycle of one device command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandOutcome {
    Pending,
    Succeeded,
    Failed { reason: String },
}

impl CommandOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CommandOutcome::Pending)
    }
}

/// One device command issued on behalf of a [`PlanningDecision`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCommand {
    pub command_id: Uuid,
    pub session_id: SessionId,
    pub decision_id: Uuid,
    pub device_id: String,
    pub command: String,
    #[serde(default)]
    pub value: Option<String>,
    /// Wall-clock time of every submission attempt.
    pub attempts: Vec<DateTime<Utc>>,
    pub outcome: CommandOutcome,
}

impl ActionCommand {
    pub fn new(
        session_id: SessionId,
        decision_id: Uuid,
        device_id: impl Into<String>,
        command: impl Into<String>,
        value: Option<String>,
    ) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            session_id,
            decision_id,
            device_id: device_id.into(),
            command: command.into(),
            value,
            attempts: Vec::new(),
            outcome: CommandOutcome::Pending,
        }
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    /// The request sent to the device-control collaborator.
    pub fn request(&self) -> DeviceRequest {
        DeviceRequest {
            command_id: self.command_id,
            device_id: self.device_id.clone(),
            command: self.command.clone(),
            value: self.value.clone(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a camera session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    Sampling,
    Perceiving,
    Planning,
    Acting,
    Error,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Sampling => "sampling",
            SessionState::Perceiving => "perceiving",
            SessionState::Planning => "planning",
            SessionState::Acting => "acting",
            SessionState::Error => "error",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Pipeline stage a failure was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Stream,
    Perception,
    Planning,
    Dispatch,
}

/// A failure recorded into session history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    pub session_id: SessionId,
    pub stage: Stage,
    pub epoch: u64,
    pub sequence: u64,
    pub error: HomeError,
    pub at: DateTime<Utc>,
}

/// One entry of a session's bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    Perception(PerceptionResult),
    Decision(PlanningDecision),
    /// A decision converted to a no-op because it repeated a recent action.
    Suppressed(PlanningDecision),
    Command(ActionCommand),
    Failure(StageFailure),
}

impl HistoryEntry {
    pub fn session_id(&self) -> &SessionId {
        match self {
            HistoryEntry::Perception(p) => &p.session_id,
            HistoryEntry::Decision(d) | HistoryEntry::Suppressed(d) => &d.session_id,
            HistoryEntry::Command(c) => &c.session_id,
            HistoryEntry::Failure(f) => &f.session_id,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            HistoryEntry::Perception(p) => p.completed_at,
            HistoryEntry::Decision(d) | HistoryEntry::Suppressed(d) => d.decided_at,
            HistoryEntry::Command(c) => c.attempts.last().copied().unwrap_or_else(Utc::now),
            HistoryEntry::Failure(f) => f.at,
        }
    }

    /// Short kind label, e.g. `"perception"`.
    pub fn kind(&self) -> &'static str {
        match self {
            HistoryEntry::Perception(_) => "perception",
            HistoryEntry::Decision(_) => "decision",
            HistoryEntry::Suppressed(_) => "suppressed",
            HistoryEntry::Command(_) => "command",
            HistoryEntry::Failure(_) => "failure",
        }
    }

    /// One-line human-readable summary used in prompts and logs.
    pub fn summary(&self) -> String {
        match self {
            HistoryEntry::Perception(p) => format!("saw: {}", p.description),
            HistoryEntry::Decision(d) => format!("decided {:?}: {}", d.action, d.rationale),
            HistoryEntry::Suppressed(d) => format!("skipped repeated {:?}", d.action),
            HistoryEntry::Command(c) => match &c.outcome {
                CommandOutcome::Pending => format!("{} {} pending", c.device_id, c.command),
                CommandOutcome::Succeeded => format!(
                    "{} {} succeeded after {} attempt(s)",
                    c.device_id,
                    c.command,
                    c.attempt_count()
                ),
                CommandOutcome::Failed { reason } => {
                    format!("{} {} failed: {reason}", c.device_id, c.command)
                }
            },
            HistoryEntry::Failure(f) => format!("{:?} failed: {}", f.stage, f.error),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bus events
// ─────────────────────────────────────────────────────────────────────────────

/// Unified event wrapper for the internal event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    /// e.g. `"homesight-runtime::session"`
    pub source: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(source: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: source.into(),
            payload,
        }
    }
}

/// Variants of data routed over the event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EventPayload {
    SessionStarted {
        session_id: SessionId,
        source: StreamSource,
    },
    SessionStateChanged {
        session_id: SessionId,
        from: SessionState,
        to: SessionState,
    },
    SessionStopped {
        session_id: SessionId,
        reason: String,
    },
    /// A new entry appended to a session's history.
    History {
        session_id: SessionId,
        entry: HistoryEntry,
    },
    Alert {
        session_id: Option<SessionId>,
        message: String,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities & errors
// ─────────────────────────────────────────────────────────────────────────────

/// What the planner identity is allowed to make the dispatcher do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    /// Command the given device id; `"*"` grants every device.
    DeviceControl(String),
    /// Push household notifications.
    Notify,
    /// Run the given manual scene; `"*"` grants every scene.
    RunScene(String),
}

/// Global error type spanning stream, inference, planning and device failures.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HomeError {
    #[error("Stream error on {camera}: {details}")]
    Stream { camera: String, details: String },

    #[error("{backend} inference timed out after {after_ms} ms")]
    InferenceTimeout { backend: Backend, after_ms: u64 },

    #[error("{backend} backend error: {details}")]
    InferenceBackend { backend: Backend, details: String },

    #[error("Planning parse error: {0}")]
    PlanningParse(String),

    #[error("Device command failed on {device_id}: {details}")]
    DeviceCommand { device_id: String, details: String },

    #[error("{backend} gateway busy: {details}")]
    GatewayBusy { backend: Backend, details: String },

    #[error("Capability Denied: {0:?}")]
    Unauthorized(Capability),

    #[error("Invalid session transition {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("Session already running: {0}")]
    SessionExists(SessionId),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl HomeError {
    /// `false` only for errors that no retry or re-sample can fix.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, HomeError::Config(_) | HomeError::InvalidTransition { .. })
    }

    /// `true` for inference failures that count towards a backend fault.
    pub fn is_inference_failure(&self) -> bool {
        matches!(
            self,
            HomeError::InferenceTimeout { .. } | HomeError::InferenceBackend { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(action: HomeAction) -> PlanningDecision {
        PlanningDecision {
            id: Uuid::new_v4(),
            session_id: SessionId::new("cam"),
            epoch: 0,
            source_sequence: 3,
            action,
            rationale: "motion at the door".into(),
            decided_at: Utc::now(),
        }
    }

    #[test]
    fn home_action_uses_adjacent_tagging() {
        let action = HomeAction::ActuateDevice {
            device_id: "light.hall".into(),
            command: "turn_on".into(),
            value: None,
        };
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["action"], "ActuateDevice");
        assert_eq!(json["payload"]["device_id"], "light.hall");
    }

    #[test]
    fn noop_parses_without_payload() {
        let action: HomeAction = serde_json::from_str(r#"{"action":"NoOp"}"#).unwrap();
        assert!(action.is_noop());
        assert_eq!(action.kind(), ActionKind::NoOp);
    }

    #[test]
    fn home_action_schema_lists_every_variant() {
        let schema = serde_json::to_string(&schemars::schema_for!(HomeAction)).unwrap();
        for variant in ["NoOp", "Notify", "ActuateDevice", "RunScene"] {
            assert!(schema.contains(variant), "schema is missing {variant}");
        }
    }

    #[test]
    fn cycle_key_ordering_is_epoch_major() {
        let sid = SessionId::new("cam");
        let old = CycleKey::new(sid.clone(), 0, 42);
        let reconnected = CycleKey::new(sid.clone(), 1, 1);
        assert!(reconnected.is_newer_than(&old));
        assert!(!old.is_newer_than(&reconnected));
        assert!(!old.is_newer_than(&old));
    }

    #[test]
    fn cycle_keys_of_other_sessions_never_compare() {
        let a = CycleKey::new(SessionId::new("a"), 5, 5);
        let b = CycleKey::new(SessionId::new("b"), 0, 1);
        assert!(!a.is_newer_than(&b));
        assert!(!b.is_newer_than(&a));
    }

    #[test]
    fn frame_sample_debug_hides_payload() {
        let sample = FrameSample {
            session_id: SessionId::new("cam"),
            epoch: 0,
            sequence: 1,
            source_sequence: 10,
            captured_at: Utc::now(),
            width: 2,
            height: 2,
            payload: Arc::from(vec![7u8; 64]),
            decision: SampleDecision::Kept,
            dropped_before: 0,
        };
        let debug = format!("{sample:?}");
        assert!(debug.contains("payload_len: 64"));
        assert!(!debug.contains("7, 7"));
    }

    #[test]
    fn action_command_request_keeps_command_id() {
        let cmd = ActionCommand::new(
            SessionId::new("cam"),
            Uuid::new_v4(),
            "plug.kettle",
            "turn_off",
            None,
        );
        assert_eq!(cmd.request().command_id, cmd.command_id);
        assert_eq!(cmd.attempt_count(), 0);
        assert!(!cmd.outcome.is_terminal());
    }

    #[test]
    fn history_entry_roundtrip_keeps_kind() {
        let entry = HistoryEntry::Decision(decision(HomeAction::Notify {
            message: "someone is at the door".into(),
        }));
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"kind\":\"decision\""));
        let back: HistoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
        assert_eq!(back.kind(), "decision");
    }

    #[test]
    fn failure_summary_mentions_error() {
        let entry = HistoryEntry::Failure(StageFailure {
            session_id: SessionId::new("cam"),
            stage: Stage::Perception,
            epoch: 0,
            sequence: 9,
            error: HomeError::InferenceTimeout {
                backend: Backend::Vision,
                after_ms: 5000,
            },
            at: Utc::now(),
        });
        assert!(entry.summary().contains("timed out after 5000 ms"));
    }

    #[test]
    fn error_classification() {
        let timeout = HomeError::InferenceTimeout {
            backend: Backend::Planning,
            after_ms: 1,
        };
        assert!(timeout.is_recoverable());
        assert!(timeout.is_inference_failure());
        assert!(!HomeError::Config("bad".into()).is_recoverable());
        assert!(!HomeError::PlanningParse("garbage".into()).is_inference_failure());
    }

    #[test]
    fn home_error_display() {
        let err = HomeError::Unauthorized(Capability::DeviceControl("lock.front".into()));
        assert!(err.to_string().contains("Capability Denied"));
        let err = HomeError::DeviceCommand {
            device_id: "lock.front".into(),
            details: "jammed".into(),
        };
        assert!(err.to_string().contains("lock.front"));
    }
}
