//! `homesight-runtime` – the perceive → plan → act engine.
//!
//! Wires camera sessions through the inference gateway to home devices.
//!
//! # Modules
//!
//! - [`orchestrator`] – [`Orchestrator`][orchestrator::Orchestrator]:
//!   starts and stops sessions, answers state/history/health queries and
//!   reaps sessions whose camera went quiet.
//! - [`session`] – the per-session worker: consumes sampled frames, runs
//!   perception, planning and dispatch as one cycle at a time, and records
//!   every outcome to the session history, the activity log and the event
//!   bus.
//! - [`state_machine`] – [`SessionStateMachine`][state_machine::SessionStateMachine]:
//!   the legal `Idle → Sampling → Perceiving → Planning → Acting` transitions
//!   plus frame ordering and supersession rules.
//! - [`planning`] – [`PlanningStage`][planning::PlanningStage]: builds the
//!   planning prompt from the scene, the recent history and the device
//!   catalog, and parses the reply into a [`HomeAction`][homesight_types::HomeAction].
//!   A reply that cannot be parsed becomes a no-op, never an error.
//! - [`dispatcher`] – [`ActionDispatcher`][dispatcher::ActionDispatcher]:
//!   authorizes decisions through the kernel
//!   [`DeviceGate`][homesight_kernel::DeviceGate] and delivers device commands
//!   with bounded retries and idempotency keys.
//! - [`duplicate_guard`] – suppresses repeating the same action within a
//!   window.
//! - [`inference_driver`] – [`OpenAiBackend`][inference_driver::OpenAiBackend]:
//!   an OpenAI-compatible chat-completions client for local model servers
//!   such as [Ollama](https://ollama.com). The
//!   [`PlannerReply`][planning::PlannerReply] JSON Schema is sent via
//!   `response_format` on planning calls.
//! - [`snapshot_camera`] and [`http_devices`] – HTTP collaborators for a
//!   media relay's snapshot endpoint and a home-automation command API.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter. Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable export.

pub mod dispatcher;
pub mod duplicate_guard;
pub mod http_devices;
pub mod inference_driver;
pub mod orchestrator;
pub mod planning;
pub mod session;
pub mod snapshot_camera;
pub mod state_machine;
pub mod telemetry;

#[cfg(test)]
mod test_support;

pub use dispatcher::{ActionDispatcher, ActionReport, DispatcherConfig};
pub use duplicate_guard::DuplicateGuard;
pub use http_devices::HttpDeviceController;
pub use inference_driver::{InferenceDriverError, OpenAiBackend};
pub use orchestrator::{HealthReport, Orchestrator, OrchestratorConfig};
pub use planning::{PlannerReply, PlanningConfig, PlanningOutcome, PlanningStage};
pub use session::{SessionConfig, SessionCounters, SessionView};
pub use snapshot_camera::SnapshotCamera;
pub use state_machine::SessionStateMachine;
pub use telemetry::{TracerProviderGuard, init_tracing};

// The device gate is the only path from a decision to a device; re-exported
// so embedders can build one without depending on homesight-kernel.
pub use homesight_kernel::DeviceGate;
