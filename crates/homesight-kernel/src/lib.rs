//! `homesight-kernel` – shared-resource arbitration and safety.
//!
//! The kernel does not perceive or decide anything. It guards the two
//! resources every session competes for (the inference accelerator and the
//! household's devices) and keeps an eye on sessions that went quiet.
//!
//! # Modules
//!
//! - [`gateway`] – [`InferenceGateway`][gateway::InferenceGateway]:
//!   bounded execution slots per inference backend, per-session admission,
//!   hard timeouts, stale-reply dropping and utilization metrics.
//! - [`capability_manager`] – [`CapabilityManager`][capability_manager::CapabilityManager]:
//!   which device, notification and scene capabilities the planner holds.
//! - [`device_gate`] – [`DeviceGate`][device_gate::DeviceGate]: the single
//!   check every planned action passes before the dispatcher may touch a
//!   device. Combines capability checks with catalog validation.
//! - [`watchdog`] – [`Watchdog`][watchdog::Watchdog]: per-session inactivity
//!   deadlines used for reaping.

pub mod capability_manager;
pub mod device_gate;
pub mod gateway;
pub mod watchdog;

pub use capability_manager::CapabilityManager;
pub use device_gate::DeviceGate;
pub use gateway::{
    Completion, GatewayConfig, GatewaySnapshot, InferenceBackend, InferenceGateway,
    InferenceReply, InferenceRequest, LaneConfig, LaneSnapshot,
};
pub use watchdog::{Liveness, Watchdog};
