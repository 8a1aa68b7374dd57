//! [`CapabilityManager`] – which actions an identity may trigger.
//!
//! Grants are per identity (normally the single `"planner"` identity the
//! dispatcher acts for). Device and scene grants accept the wildcard id
//! `"*"`.

use std::collections::{HashMap, HashSet};

use homesight_types::{Capability, HomeError};

/// Wildcard id matching every device or scene.
pub const ANY: &str = "*";

/// Manages the set of [`Capability`] grants for each identity.
///
/// # Example
///
/// ```
/// use homesight_kernel::capability_manager::CapabilityManager;
/// use homesight_types::Capability;
///
/// let mut mgr = CapabilityManager::new();
/// mgr.grant("planner", Capability::DeviceControl("light.hall".into()));
///
/// assert!(mgr.check("planner", &Capability::DeviceControl("light.hall".into())).is_ok());
/// assert!(mgr.check("planner", &Capability::DeviceControl("lock.front".into())).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CapabilityManager {
    grants: HashMap<String, HashSet<Capability>>,
}

impl CapabilityManager {
    /// Create an empty manager with no grants.
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `cap` to `identity`. Duplicate grants are ignored.
    pub fn grant(&mut self, identity: &str, cap: Capability) {
        self.grants
            .entry(identity.to_string())
            .or_default()
            .insert(cap);
    }

    /// Grant everything: all devices, all scenes, notifications.
    pub fn grant_all(&mut self, identity: &str) {
        self.grant(identity, Capability::DeviceControl(ANY.to_string()));
        self.grant(identity, Capability::RunScene(ANY.to_string()));
        self.grant(identity, Capability::Notify);
    }

    /// Revoke `cap` from `identity`. Revoking a wildcard does not revoke
    /// individual grants.
    pub fn revoke(&mut self, identity: &str, cap: &Capability) {
        if let Some(set) = self.grants.get_mut(identity) {
            set.remove(cap);
        }
    }

    /// `Ok(())` when `identity` holds `cap` directly or through a wildcard,
    /// [`HomeError::Unauthorized`] otherwise.
    pub fn check(&self, identity: &str, cap: &Capability) -> Result<(), HomeError> {
        let Some(set) = self.grants.get(identity) else {
            return Err(HomeError::Unauthorized(cap.clone()));
        };
        let wildcard = match cap {
            Capability::DeviceControl(_) => Some(Capability::DeviceControl(ANY.to_string())),
            Capability::RunScene(_) => Some(Capability::RunScene(ANY.to_string())),
            Capability::Notify => None,
        };
        if set.contains(cap) || wildcard.is_some_and(|w| set.contains(&w)) {
            Ok(())
        } else {
            Err(HomeError::Unauthorized(cap.clone()))
        }
    }
}
