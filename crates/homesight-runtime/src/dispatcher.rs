//! [`ActionDispatcher`] – planning decisions in, device commands out.
//!
//! Every decision passes the [`DeviceGate`] first. Authorized actions are
//! resolved into one [`ActionCommand`] per target and submitted to the
//! [`DeviceController`]. Each command keeps one `command_id` across all of
//! its attempts so the controller can deduplicate retries.
//!
//! Transient failures (an `Err` from the controller or an attempt timeout)
//! are retried with exponential backoff up to `max_retries` times after the
//! first attempt. Rejections are final. An `Accepted` acknowledgement is
//! followed by polling for the eventual outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use homesight_hal::{DeviceAck, DeviceController};
use homesight_kernel::DeviceGate;
use homesight_types::{ActionCommand, CommandOutcome, HomeAction, PlanningDecision};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Identity checked against the capability manager.
    pub identity: String,
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub attempt_timeout: Duration,
    /// How long to wait for the outcome of an accepted command.
    pub outcome_timeout: Duration,
    pub outcome_poll: Duration,
    /// Devices that receive `Notify` actions.
    pub notify_targets: Vec<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            identity: "planner".to_string(),
            max_retries: 3,
            backoff_initial: Duration::from_millis(250),
            backoff_max: Duration::from_secs(4),
            attempt_timeout: Duration::from_secs(5),
            outcome_timeout: Duration::from_secs(30),
            outcome_poll: Duration::from_millis(500),
            notify_targets: vec!["app_notify".to_string()],
        }
    }
}

/// Result of dispatching one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionReport {
    pub decision_id: Uuid,
    pub commands: Vec<ActionCommand>,
}

impl ActionReport {
    /// `true` when every command succeeded (vacuously for no-ops).
    pub fn succeeded(&self) -> bool {
        self.commands
            .iter()
            .all(|c| c.outcome == CommandOutcome::Succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ActionCommand> {
        self.commands
            .iter()
            .filter(|c| matches!(c.outcome, CommandOutcome::Failed { .. }))
    }
}

pub struct ActionDispatcher {
    gate: Arc<DeviceGate>,
    controller: Arc<dyn DeviceController>,
    config: DispatcherConfig,
}

impl ActionDispatcher {
    pub fn new(
        gate: Arc<DeviceGate>,
        controller: Arc<dyn DeviceController>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            gate,
            controller,
            config,
        }
    }

    pub fn gate(&self) -> &DeviceGate {
        &self.gate
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// The commands `decision` resolves to, all pending and unattempted.
    pub fn resolve(&self, decision: &PlanningDecision) -> Vec<ActionCommand> {
        let command = |device: &str, cmd: &str, value: Option<String>| {
            ActionCommand::new(decision.session_id.clone(), decision.id, device, cmd, value)
        };
        match &decision.action {
            HomeAction::NoOp => Vec::new(),
            HomeAction::ActuateDevice {
                device_id,
                command: cmd,
                value,
            } => vec![command(device_id, cmd, value.clone())],
            HomeAction::Notify { message } => self
                .config
                .notify_targets
                .iter()
                .map(|target| command(target, "notify", Some(message.clone())))
                .collect(),
            HomeAction::RunScene { scene_id } => vec![command(&format!("scene:{scene_id}"), "run", None)],
        }
    }

    /// Gate, resolve and execute `decision`. Never fails as a whole; every
    /// problem ends up as a failed command in the report.
    pub async fn dispatch(&self, decision: &PlanningDecision) -> ActionReport {
        let mut commands = self.resolve(decision);
        if commands.is_empty()
            && let HomeAction::Notify { message } = &decision.action
        {
            warn!(session = %decision.session_id, "notification dropped: no notify targets configured");
            let mut command = ActionCommand::new(
                decision.session_id.clone(),
                decision.id,
                "notify",
                "notify",
                Some(message.clone()),
            );
            command.outcome = CommandOutcome::Failed {
                reason: "no notify targets configured".to_string(),
            };
            return ActionReport {
                decision_id: decision.id,
                commands: vec![command],
            };
        }

        if let Err(e) = self
            .gate
            .authorize_and_verify(&self.config.identity, &decision.action)
        {
            warn!(session = %decision.session_id, error = %e, "action blocked by device gate");
            for command in &mut commands {
                command.outcome = CommandOutcome::Failed {
                    reason: e.to_string(),
                };
            }
            return ActionReport {
                decision_id: decision.id,
                commands,
            };
        }

        let mut executed = Vec::with_capacity(commands.len());
        for command in commands {
            executed.push(self.execute(command).await);
        }
        let report = ActionReport {
            decision_id: decision.id,
            commands: executed,
        };
        info!(
            session = %decision.session_id,
            kind = ?decision.action.kind(),
            commands = report.commands.len(),
            succeeded = report.succeeded(),
            "decision dispatched"
        );
        report
    }

    /// Drive one command to a terminal outcome.
    ///
    /// Re-executing a command keeps its `command_id`, so the controller
    /// applies it at most once.
    pub async fn execute(&self, mut command: ActionCommand) -> ActionCommand {
        let mut backoff = self.config.backoff_initial;
        loop {
            command.attempts.push(Utc::now());
            let attempt = command.attempt_count();
            let request = command.request();

            let last_error = match tokio::time::timeout(
                self.config.attempt_timeout,
                self.controller.submit(&request),
            )
            .await
            {
                Ok(Ok(DeviceAck::Completed)) => {
                    command.outcome = CommandOutcome::Succeeded;
                    break;
                }
                Ok(Ok(DeviceAck::Accepted)) => {
                    command.outcome = self.await_outcome(&command).await;
                    break;
                }
                Ok(Ok(DeviceAck::Rejected { reason })) => {
                    command.outcome = CommandOutcome::Failed {
                        reason: format!("rejected: {reason}"),
                    };
                    break;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => format!(
                    "attempt timed out after {} ms",
                    self.config.attempt_timeout.as_millis()
                ),
            };

            if attempt > self.config.max_retries as usize {
                warn!(device = %command.device_id, command_id = %command.command_id, attempt, error = %last_error, "device command failed; giving up");
                command.outcome = CommandOutcome::Failed {
                    reason: format!("gave up after {attempt} attempts: {last_error}"),
                };
                break;
            }
            debug!(device = %command.device_id, attempt, error = %last_error, backoff_ms = backoff.as_millis() as u64, "device command failed; retrying");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.backoff_max);
        }
        command
    }

    async fn await_outcome(&self, command: &ActionCommand) -> CommandOutcome {
        let poll = async {
            loop {
                match self.controller.outcome(command.command_id).await {
                    Ok(outcome) if outcome.is_terminal() => return outcome,
                    Ok(_) => {}
                    Err(e) => {
                        debug!(command_id = %command.command_id, error = %e, "outcome poll failed")
                    }
                }
                tokio::time::sleep(self.config.outcome_poll).await;
            }
        };
        match tokio::time::timeout(self.config.outcome_timeout, poll).await {
            Ok(outcome) => outcome,
            Err(_) => CommandOutcome::Failed {
                reason: format!(
                    "no outcome within {} ms",
                    self.config.outcome_timeout.as_millis()
                ),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homesight_hal::sim::SimDeviceController;
    use homesight_hal::{DeviceCatalog, DeviceInfo, SceneInfo};
    use homesight_kernel::CapabilityManager;
    use homesight_types::{Capability, SessionId};

    fn dispatcher(controller: Arc<SimDeviceController>) -> ActionDispatcher {
        let mut caps = CapabilityManager::new();
        caps.grant("planner", Capability::DeviceControl("light.porch".into()));
        caps.grant("planner", Capability::DeviceControl("lock.front".into()));
        caps.grant("planner", Capability::Notify);
        caps.grant("planner", Capability::RunScene("*".into()));
        let catalog = DeviceCatalog::new()
            .with_device(DeviceInfo::new("light.porch", "Porch light", "light").with_commands(["turn_on", "turn_off"]))
            .with_device(DeviceInfo::new("lock.front", "Front lock", "lock"))
            .with_device(DeviceInfo::new("garage.door", "Garage door", "cover"))
            .with_scene(SceneInfo::new("away", "Away"));
        ActionDispatcher::new(
            Arc::new(DeviceGate::new(caps, catalog)),
            controller,
            DispatcherConfig::default(),
        )
    }

    fn decision(action: HomeAction) -> PlanningDecision {
        PlanningDecision {
            id: Uuid::new_v4(),
            session_id: SessionId::new("porch"),
            epoch: 0,
            source_sequence: 1,
            action,
            rationale: "test".into(),
            decided_at: Utc::now(),
        }
    }

    fn light_on() -> HomeAction {
        HomeAction::ActuateDevice {
            device_id: "light.porch".into(),
            command: "turn_on".into(),
            value: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fails_twice_then_succeeds_on_third_attempt() {
        let controller = Arc::new(SimDeviceController::new());
        controller.fail_next("light.porch", 2);
        let report = dispatcher(controller.clone()).dispatch(&decision(light_on())).await;

        assert_eq!(report.commands.len(), 1);
        let command = &report.commands[0];
        assert_eq!(command.outcome, CommandOutcome::Succeeded);
        assert_eq!(command.attempt_count(), 3);
        assert_eq!(controller.applied().len(), 1);
        assert!(report.succeeded());
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_retry_bound() {
        let controller = Arc::new(SimDeviceController::new());
        controller.fail_next("light.porch", 10);
        let report = dispatcher(controller.clone()).dispatch(&decision(light_on())).await;

        let command = &report.commands[0];
        assert_eq!(command.attempt_count(), 4);
        assert!(matches!(&command.outcome, CommandOutcome::Failed { reason } if reason.contains("gave up")));
        assert_eq!(controller.submissions(), 4);
        assert_eq!(report.failed().count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_is_not_retried() {
        let controller = Arc::new(SimDeviceController::new());
        controller.reject("light.porch", "device offline");
        let report = dispatcher(controller.clone()).dispatch(&decision(light_on())).await;
        assert_eq!(report.commands[0].attempt_count(), 1);
        assert!(matches!(&report.commands[0].outcome, CommandOutcome::Failed { reason } if reason.contains("device offline")));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempt_times_out_and_is_retried() {
        let controller = Arc::new(SimDeviceController::new());
        controller.stall("light.porch", Duration::from_secs(6));
        let report = dispatcher(controller.clone()).dispatch(&decision(light_on())).await;
        let command = &report.commands[0];
        assert_eq!(command.attempt_count(), 4);
        assert!(matches!(&command.outcome, CommandOutcome::Failed { reason } if reason.contains("timed out")));
    }

    #[tokio::test(start_paused = true)]
    async fn executing_same_command_twice_applies_once() {
        let controller = Arc::new(SimDeviceController::new());
        let dispatcher = dispatcher(controller.clone());
        let command = dispatcher.resolve(&decision(light_on())).remove(0);

        let first = dispatcher.execute(command.clone()).await;
        let second = dispatcher.execute(command).await;
        assert_eq!(first.command_id, second.command_id);
        assert_eq!(second.outcome, CommandOutcome::Succeeded);
        assert_eq!(controller.applied().len(), 1);
        assert_eq!(controller.submissions(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn accepted_command_waits_for_outcome() {
        let controller = Arc::new(SimDeviceController::new());
        controller.long_running("lock.front");
        let report = dispatcher(controller.clone())
            .dispatch(&decision(HomeAction::ActuateDevice {
                device_id: "lock.front".into(),
                command: "lock".into(),
                value: None,
            }))
            .await;
        assert_eq!(report.commands[0].outcome, CommandOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn unauthorized_device_is_never_submitted() {
        let controller = Arc::new(SimDeviceController::new());
        let report = dispatcher(controller.clone())
            .dispatch(&decision(HomeAction::ActuateDevice {
                device_id: "garage.door".into(),
                command: "open".into(),
                value: None,
            }))
            .await;
        assert!(matches!(&report.commands[0].outcome, CommandOutcome::Failed { reason } if reason.contains("Capability Denied")));
        assert_eq!(report.commands[0].attempt_count(), 0);
        assert_eq!(controller.submissions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn notify_fans_out_and_scene_targets_scene_id() {
        let controller = Arc::new(SimDeviceController::new());
        let d = dispatcher(controller.clone());
        let report = d
            .dispatch(&decision(HomeAction::Notify {
                message: "parcel delivered".into(),
            }))
            .await;
        assert_eq!(report.commands[0].device_id, "app_notify");
        assert_eq!(report.commands[0].value.as_deref(), Some("parcel delivered"));

        let report = d
            .dispatch(&decision(HomeAction::RunScene {
                scene_id: "away".into(),
            }))
            .await;
        assert_eq!(report.commands[0].device_id, "scene:away");
        assert_eq!(report.commands[0].command, "run");
        assert_eq!(controller.applied().len(), 2);
    }

    #[tokio::test]
    async fn notify_without_targets_reports_a_failed_command() {
        let controller = Arc::new(SimDeviceController::new());
        let mut d = dispatcher(controller.clone());
        d.config.notify_targets.clear();
        let report = d
            .dispatch(&decision(HomeAction::Notify {
                message: "parcel delivered".into(),
            }))
            .await;
        assert_eq!(report.commands.len(), 1);
        assert!(!report.succeeded());
        assert!(matches!(
            &report.commands[0].outcome,
            CommandOutcome::Failed { reason } if reason.contains("no notify targets")
        ));
        assert_eq!(controller.submissions(), 0);
    }

    #[tokio::test]
    async fn noop_dispatches_nothing() {
        let controller = Arc::new(SimDeviceController::new());
        let report = dispatcher(controller.clone()).dispatch(&decision(HomeAction::NoOp)).await;
        assert!(report.commands.is_empty());
        assert!(report.succeeded());
        assert_eq!(controller.submissions(), 0);
    }
}
