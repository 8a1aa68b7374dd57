//! Device-control collaborator.

use async_trait::async_trait;
use homesight_types::{CommandOutcome, DeviceRequest, HomeError};
use uuid::Uuid;

/// Synchronous acknowledgement of one submitted command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAck {
    /// The command took effect immediately.
    Completed,
    /// The command was accepted and runs on; poll
    /// [`DeviceController::outcome`] for the result.
    Accepted,
    /// The device refused the command. Not retried.
    Rejected { reason: String },
}

/// Submits device commands.
///
/// Implementations must treat `request.command_id` as an idempotency key:
/// submitting the same id twice has the same effect as submitting it once.
#[async_trait]
pub trait DeviceController: Send + Sync {
    /// Submit one attempt of a command.
    ///
    /// # Errors
    ///
    /// An `Err` is a transient failure (transport error, device busy) and
    /// may be retried with the same `command_id`.
    async fn submit(&self, request: &DeviceRequest) -> Result<DeviceAck, HomeError>;

    /// Current outcome of a previously [`DeviceAck::Accepted`] command.
    async fn outcome(&self, _command_id: Uuid) -> Result<CommandOutcome, HomeError> {
        Ok(CommandOutcome::Succeeded)
    }
}
