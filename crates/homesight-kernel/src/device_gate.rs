//! [`DeviceGate`] – single interception point between planning and devices.
//!
//! Before a planned [`HomeAction`] may be turned into device commands it
//! must pass [`DeviceGate::authorize_and_verify`], which runs two independent
//! checks in order:
//!
//! 1. **Capability check** ([`CapabilityManager`]): the acting identity must
//!    hold the capability matching the action. Missing grants yield
//!    [`HomeError::Unauthorized`].
//! 2. **Catalog check** ([`DeviceCatalog`]): the target device or scene must
//!    exist and the device must support the command. Violations yield
//!    [`HomeError::DeviceCommand`].
//!
//! # Example
//!
//! ```
//! use homesight_hal::{DeviceCatalog, DeviceInfo};
//! use homesight_kernel::{CapabilityManager, DeviceGate};
//! use homesight_types::{Capability, HomeAction};
//!
//! let mut caps = CapabilityManager::new();
//! caps.grant("planner", Capability::DeviceControl("light.hall".into()));
//! let catalog = DeviceCatalog::new()
//!     .with_device(DeviceInfo::new("light.hall", "Hall light", "light").with_commands(["turn_on"]));
//!
//! let gate = DeviceGate::new(caps, catalog);
//! let on = HomeAction::ActuateDevice {
//!     device_id: "light.hall".into(),
//!     command: "turn_on".into(),
//!     value: None,
//! };
//! assert!(gate.authorize_and_verify("planner", &on).is_ok());
//! ```

use homesight_hal::DeviceCatalog;
use homesight_types::{Capability, HomeAction, HomeError};

use crate::capability_manager::CapabilityManager;

/// Capability plus catalog check for planned actions.
#[derive(Debug, Clone)]
pub struct DeviceGate {
    capability_manager: CapabilityManager,
    catalog: DeviceCatalog,
}

impl DeviceGate {
    pub fn new(capability_manager: CapabilityManager, catalog: DeviceCatalog) -> Self {
        Self {
            capability_manager,
            catalog,
        }
    }

    pub fn catalog(&self) -> &DeviceCatalog {
        &self.catalog
    }

    /// Authorize `identity` for `action` and validate the target against the
    /// catalog. [`HomeAction::NoOp`] always passes.
    ///
    /// | Action | Required [`Capability`] |
    /// |--------|------------------------|
    /// | `ActuateDevice { device_id, .. }` | `DeviceControl(device_id)` |
    /// | `Notify { .. }` | `Notify` |
    /// | `RunScene { scene_id }` | `RunScene(scene_id)` |
    ///
    /// # Errors
    ///
    /// - [`HomeError::Unauthorized`] – the identity lacks the capability.
    /// - [`HomeError::DeviceCommand`] – unknown device or scene, or a
    ///   command the device does not support.
    pub fn authorize_and_verify(&self, identity: &str, action: &HomeAction) -> Result<(), HomeError> {
        let Some(required) = Self::capability_for(action) else {
            return Ok(());
        };
        self.capability_manager.check(identity, &required)?;
        self.verify_target(action)
    }

    fn capability_for(action: &HomeAction) -> Option<Capability> {
        match action {
            HomeAction::NoOp => None,
            HomeAction::Notify { .. } => Some(Capability::Notify),
            HomeAction::ActuateDevice { device_id, .. } => {
                Some(Capability::DeviceControl(device_id.clone()))
            }
            HomeAction::RunScene { scene_id } => Some(Capability::RunScene(scene_id.clone())),
        }
    }

    fn verify_target(&self, action: &HomeAction) -> Result<(), HomeError> {
        match action {
            HomeAction::ActuateDevice {
                device_id, command, ..
            } => match self.catalog.device(device_id) {
                None => Err(HomeError::DeviceCommand {
                    device_id: device_id.clone(),
                    details: "unknown device".to_string(),
                }),
                Some(device) if !device.supports(command) => Err(HomeError::DeviceCommand {
                    device_id: device_id.clone(),
                    details: format!("unsupported command '{command}'"),
                }),
                Some(_) => Ok(()),
            },
            HomeAction::RunScene { scene_id } if self.catalog.scene(scene_id).is_none() => {
                Err(HomeError::DeviceCommand {
                    device_id: format!("scene:{scene_id}"),
                    details: "unknown scene".to_string(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use homesight_hal::{DeviceInfo, SceneInfo};

    fn gate() -> DeviceGate {
        let mut caps = CapabilityManager::new();
        caps.grant("planner", Capability::DeviceControl("light.hall".into()));
        caps.grant("planner", Capability::DeviceControl("light.attic".into()));
        caps.grant("planner", Capability::RunScene("*".into()));
        let catalog = DeviceCatalog::new()
            .with_device(
                DeviceInfo::new("light.hall", "Hall light", "light")
                    .with_commands(["turn_on", "turn_off"]),
            )
            .with_device(DeviceInfo::new("lock.front", "Front lock", "lock"))
            .with_scene(SceneInfo::new("good_night", "Good night"));
        DeviceGate::new(caps, catalog)
    }

    fn actuate(device_id: &str, command: &str) -> HomeAction {
        HomeAction::ActuateDevice {
            device_id: device_id.into(),
            command: command.into(),
            value: None,
        }
    }

    #[test]
    fn authorized_known_command_passes() {
        assert!(gate()
            .authorize_and_verify("planner", &actuate("light.hall", "turn_on"))
            .is_ok());
    }

    #[test]
    fn noop_always_passes() {
        assert!(gate().authorize_and_verify("nobody", &HomeAction::NoOp).is_ok());
    }

    #[test]
    fn missing_grant_is_unauthorized() {
        let result = gate().authorize_and_verify("planner", &actuate("lock.front", "unlock"));
        assert!(matches!(
            result,
            Err(HomeError::Unauthorized(Capability::DeviceControl(id))) if id == "lock.front"
        ));
        let result = gate().authorize_and_verify(
            "planner",
            &HomeAction::Notify {
                message: "hi".into(),
            },
        );
        assert!(matches!(result, Err(HomeError::Unauthorized(Capability::Notify))));
    }

    #[test]
    fn capability_is_checked_before_catalog() {
        // Granted but not in the catalog.
        let result = gate().authorize_and_verify("planner", &actuate("light.attic", "turn_on"));
        assert!(matches!(result, Err(HomeError::DeviceCommand { details, .. }) if details == "unknown device"));
    }

    #[test]
    fn unsupported_command_is_rejected() {
        let result = gate().authorize_and_verify("planner", &actuate("light.hall", "strobe"));
        assert!(matches!(result, Err(HomeError::DeviceCommand { .. })));
    }

    #[test]
    fn scenes_are_checked_against_catalog() {
        let g = gate();
        let known = HomeAction::RunScene {
            scene_id: "good_night".into(),
        };
        let unknown = HomeAction::RunScene {
            scene_id: "party".into(),
        };
        assert!(g.authorize_and_verify("planner", &known).is_ok());
        assert!(matches!(
            g.authorize_and_verify("planner", &unknown),
            Err(HomeError::DeviceCommand { device_id, .. }) if device_id == "scene:party"
        ));
    }
}
