//! Configuration file – reads/writes `~/.homesight/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use homesight_hal::{DeviceCatalog, DeviceInfo, SceneInfo};

const CONFIG_PATH_VAR: &str = "HOMESIGHT_CONFIG";

/// One camera session started at launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Camera id; doubles as the session id.
    pub id: String,
    /// Snapshot URL of the camera on the media relay.
    pub snapshot_url: String,
}

/// One controllable device offered to the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub name: String,
    pub kind: String,
    /// Supported commands; empty means any.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    pub id: String,
    pub name: String,
}

/// Persisted configuration stored in `~/.homesight/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the OpenAI-compatible vision model server.
    #[serde(default = "default_inference_url")]
    pub vision_url: String,

    #[serde(default = "default_vision_model")]
    pub vision_model: String,

    /// Base URL of the OpenAI-compatible planning model server.
    #[serde(default = "default_inference_url")]
    pub planning_url: String,

    #[serde(default = "default_planning_model")]
    pub planning_model: String,

    /// Bearer token for both model servers, if they need one.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub inference_api_key: String,

    /// Base URL of the home-automation command API.
    #[serde(default = "default_device_url")]
    pub device_url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_api_key: String,

    /// Sampling interval per camera.
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u64,

    /// How often a camera snapshot is pulled from the relay.
    #[serde(default = "default_snapshot_poll_ms")]
    pub snapshot_poll_ms: u64,

    /// SQLite activity log; journaling is off when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_log: Option<PathBuf>,

    /// Devices receiving `Notify` actions.
    #[serde(default = "default_notify_targets")]
    pub notify_targets: Vec<String>,

    #[serde(default)]
    pub cameras: Vec<CameraConfig>,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,

    #[serde(default)]
    pub scenes: Vec<SceneConfig>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("vision_url", &self.vision_url)
            .field("vision_model", &self.vision_model)
            .field("planning_url", &self.planning_url)
            .field("planning_model", &self.planning_model)
            .field("inference_api_key", redacted(&self.inference_api_key))
            .field("device_url", &self.device_url)
            .field("device_api_key", redacted(&self.device_api_key))
            .field("sampling_interval_ms", &self.sampling_interval_ms)
            .field("snapshot_poll_ms", &self.snapshot_poll_ms)
            .field("activity_log", &self.activity_log)
            .field("notify_targets", &self.notify_targets)
            .field("cameras", &self.cameras)
            .field("devices", &self.devices)
            .field("scenes", &self.scenes)
            .finish()
    }
}

fn redacted(secret: &str) -> &'static dyn std::fmt::Debug {
    if secret.is_empty() { &"<not set>" } else { &"<redacted>" }
}

fn default_inference_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_vision_model() -> String {
    "llava".to_string()
}
fn default_planning_model() -> String {
    "llama3".to_string()
}
fn default_device_url() -> String {
    "http://localhost:8123/api/homesight".to_string()
}
fn default_sampling_interval_ms() -> u64 {
    2000
}
fn default_snapshot_poll_ms() -> u64 {
    500
}
fn default_notify_targets() -> Vec<String> {
    vec!["app_notify".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vision_url: default_inference_url(),
            vision_model: default_vision_model(),
            planning_url: default_inference_url(),
            planning_model: default_planning_model(),
            inference_api_key: String::new(),
            device_url: default_device_url(),
            device_api_key: String::new(),
            sampling_interval_ms: default_sampling_interval_ms(),
            snapshot_poll_ms: default_snapshot_poll_ms(),
            activity_log: None,
            notify_targets: default_notify_targets(),
            cameras: Vec::new(),
            devices: Vec::new(),
            scenes: Vec::new(),
        }
    }
}

impl Config {
    /// The device catalog the planner chooses from.
    pub fn catalog(&self) -> DeviceCatalog {
        let mut catalog = DeviceCatalog::new();
        for d in &self.devices {
            catalog.register_device(DeviceInfo::new(&d.id, &d.name, &d.kind).with_commands(d.commands.iter()));
        }
        for s in &self.scenes {
            catalog.register_scene(SceneInfo::new(&s.id, &s.name));
        }
        catalog
    }
}

/// Return the config path: `$HOMESIGHT_CONFIG` or `~/.homesight/config.toml`.
pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_PATH_VAR)
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

/// Build the config path relative to the given home directory.
pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".homesight").join("config.toml")
}

/// Load the config from disk. Returns `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    load_from(&config_path())
}

pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    let mut cfg: Config = toml::from_str(&raw).map_err(|e| format!("Failed to parse config: {}", e))?;
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Apply `HOMESIGHT_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `HOMESIGHT_VISION_URL` | `vision_url` |
/// | `HOMESIGHT_VISION_MODEL` | `vision_model` |
/// | `HOMESIGHT_PLANNING_URL` | `planning_url` |
/// | `HOMESIGHT_PLANNING_MODEL` | `planning_model` |
/// | `HOMESIGHT_DEVICE_URL` | `device_url` |
/// | `HOMESIGHT_SAMPLING_INTERVAL_MS` | `sampling_interval_ms` |
pub fn apply_env_overrides(cfg: &mut Config) {
    apply_overrides(cfg, |name| std::env::var(name).ok());
}

fn apply_overrides(cfg: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("HOMESIGHT_VISION_URL") {
        cfg.vision_url = v;
    }
    if let Some(v) = var("HOMESIGHT_VISION_MODEL") {
        cfg.vision_model = v;
    }
    if let Some(v) = var("HOMESIGHT_PLANNING_URL") {
        cfg.planning_url = v;
    }
    if let Some(v) = var("HOMESIGHT_PLANNING_MODEL") {
        cfg.planning_model = v;
    }
    if let Some(v) = var("HOMESIGHT_DEVICE_URL") {
        cfg.device_url = v;
    }
    if let Some(v) = var("HOMESIGHT_SAMPLING_INTERVAL_MS")
        && let Ok(ms) = v.parse::<u64>()
        && ms > 0
    {
        cfg.sampling_interval_ms = ms;
    }
}

/// Save the config to disk, creating the parent directory if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| format!("Failed to serialize config: {}", e))?;
    // Owner-only read/write (rw-------) on Unix; the file may hold API keys.
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw).map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn debug_redacts_api_keys() {
        let cfg = Config {
            inference_api_key: "sk-super-secret".into(),
            device_api_key: "ha-long-lived-token".into(),
            ..Config::default()
        };
        let debug_str = format!("{:?}", cfg);
        assert!(!debug_str.contains("sk-super-secret"));
        assert!(!debug_str.contains("ha-long-lived-token"));
        assert!(debug_str.contains("<redacted>"));
    }

    #[test]
    fn debug_shows_not_set_for_empty_keys() {
        assert!(format!("{:?}", Config::default()).contains("<not set>"));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = std::fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_keeps_cameras_and_catalog() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        let cfg = Config {
            cameras: vec![CameraConfig {
                id: "porch".into(),
                snapshot_url: "http://relay:1984/api/frame.jpeg?src=porch".into(),
            }],
            devices: vec![DeviceConfig {
                id: "light.porch".into(),
                name: "Porch light".into(),
                kind: "light".into(),
                commands: vec!["turn_on".into(), "turn_off".into()],
            }],
            scenes: vec![SceneConfig {
                id: "welcome".into(),
                name: "Welcome home".into(),
            }],
            ..Config::default()
        };
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded.cameras, cfg.cameras);
        assert_eq!(loaded.devices, cfg.devices);
        let catalog = loaded.catalog();
        assert!(catalog.device("light.porch").unwrap().supports("turn_on"));
        assert!(!catalog.device("light.porch").unwrap().supports("unlock"));
        assert!(catalog.scene("welcome").is_some());
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: Config = toml::from_str("vision_model = \"qwen2.5-vl\"\n").unwrap();
        assert_eq!(cfg.vision_model, "qwen2.5-vl");
        assert_eq!(cfg.planning_model, "llama3");
        assert_eq!(cfg.sampling_interval_ms, 2000);
        assert_eq!(cfg.notify_targets, vec!["app_notify".to_string()]);
        assert!(cfg.cameras.is_empty());
    }

    #[test]
    fn config_path_points_to_homesight_dir() {
        let p = config_path_for_home("/home/testuser");
        assert!(p.to_string_lossy().contains(".homesight"));
        assert!(p.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn overrides_replace_urls_and_models() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            vars(&[
                ("HOMESIGHT_VISION_URL", "http://gpu-box:11434"),
                ("HOMESIGHT_PLANNING_MODEL", "qwen2.5"),
                ("HOMESIGHT_DEVICE_URL", "http://hub.local/api"),
                ("HOMESIGHT_SAMPLING_INTERVAL_MS", "750"),
            ]),
        );
        assert_eq!(cfg.vision_url, "http://gpu-box:11434");
        assert_eq!(cfg.planning_model, "qwen2.5");
        assert_eq!(cfg.device_url, "http://hub.local/api");
        assert_eq!(cfg.sampling_interval_ms, 750);
        assert_eq!(cfg.vision_model, "llava");
    }

    #[test]
    fn invalid_interval_is_ignored() {
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, vars(&[("HOMESIGHT_SAMPLING_INTERVAL_MS", "soon")]));
        assert_eq!(cfg.sampling_interval_ms, 2000);
        apply_overrides(&mut cfg, vars(&[("HOMESIGHT_SAMPLING_INTERVAL_MS", "0")]));
        assert_eq!(cfg.sampling_interval_ms, 2000);
    }
}
