//! [`DeviceCatalog`] – the devices and manual scenes the planner may target.
//!
//! The catalog serves two readers: the planning prompt, which lists every
//! entry so the model only names devices that exist, and the dispatcher,
//! which refuses commands for ids or commands the catalog does not know.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One controllable device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Stable identifier, e.g. `"light.living_room"`.
    pub id: String,
    /// Human-friendly name shown to the planner.
    pub name: String,
    /// Device class, e.g. `"light"`, `"plug"`, `"speaker"`.
    #[serde(default)]
    pub kind: String,
    /// Commands the device accepts. Empty means any command.
    #[serde(default)]
    pub commands: Vec<String>,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: kind.into(),
            commands: Vec::new(),
        }
    }

    pub fn with_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.commands = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn supports(&self, command: &str) -> bool {
        self.commands.is_empty() || self.commands.iter().any(|c| c == command)
    }
}

/// One pre-configured manual scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneInfo {
    pub id: String,
    pub name: String,
}

impl SceneInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Registry of devices and scenes, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct DeviceCatalog {
    devices: BTreeMap<String, DeviceInfo>,
    scenes: BTreeMap<String, SceneInfo>,
}

impl DeviceCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. A previous entry with the same id is replaced.
    pub fn register_device(&mut self, device: DeviceInfo) {
        self.devices.insert(device.id.clone(), device);
    }

    /// Register a scene. A previous entry with the same id is replaced.
    pub fn register_scene(&mut self, scene: SceneInfo) {
        self.scenes.insert(scene.id.clone(), scene);
    }

    pub fn with_device(mut self, device: DeviceInfo) -> Self {
        self.register_device(device);
        self
    }

    pub fn with_scene(mut self, scene: SceneInfo) -> Self {
        self.register_scene(scene);
        self
    }

    pub fn device(&self, id: &str) -> Option<&DeviceInfo> {
        self.devices.get(id)
    }

    pub fn scene(&self, id: &str) -> Option<&SceneInfo> {
        self.scenes.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceInfo> {
        self.devices.values()
    }

    pub fn scenes(&self) -> impl Iterator<Item = &SceneInfo> {
        self.scenes.values()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.scenes.is_empty()
    }

    /// Plain-text listing for the planning prompt, one entry per line.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        if self.devices.is_empty() {
            out.push_str("Devices: none\n");
        } else {
            out.push_str("Devices:\n");
            for d in self.devices.values() {
                let commands = if d.commands.is_empty() {
                    "any".to_string()
                } else {
                    d.commands.join(", ")
                };
                out.push_str(&format!(
                    "- {} ({}, {}): commands [{}]\n",
                    d.id, d.name, d.kind, commands
                ));
            }
        }
        if !self.scenes.is_empty() {
            out.push_str("Scenes:\n");
            for s in self.scenes.values() {
                out.push_str(&format!("- {} ({})\n", s.id, s.name));
            }
        }
        out
    }
}
