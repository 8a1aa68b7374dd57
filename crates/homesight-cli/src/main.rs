//! `homesight-cli` – camera-driven home automation
//!
//! This binary is the entry point of the homesight stack. It:
//!
//! 1. Loads `~/.homesight/config.toml` (or `$HOMESIGHT_CONFIG`), writing a
//!    default file on first run.
//! 2. Probes the vision and planning model servers and reports whether the
//!    configured models are served.
//! 3. Starts one session per configured camera and logs session activity.
//! 4. Reaps cameras that went quiet, prunes the activity log and logs a
//!    health line periodically.
//! 5. Intercepts **Ctrl-C** to stop every session cleanly and exit.

mod config;
mod probe;

use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use homesight_kernel::{CapabilityManager, DeviceGate, GatewayConfig, InferenceGateway};
use homesight_memory::ActivityLog;
use homesight_middleware::EventBus;
use homesight_perception::SamplingPolicy;
use homesight_runtime::{
    ActionDispatcher, DispatcherConfig, HttpDeviceController, OpenAiBackend, Orchestrator, OrchestratorConfig,
    SnapshotCamera, init_tracing,
};
use homesight_types::{Backend, Capability, Event, EventPayload, HistoryEntry, SessionId, StreamSource};

const REAP_EVERY: Duration = Duration::from_secs(60);
const HEALTH_EVERY: Duration = Duration::from_secs(300);
const PRUNE_EVERY: Duration = Duration::from_secs(60 * 60);

fn main() {
    // RUST_LOG filters (default "info"); HOMESIGHT_LOG_FORMAT=json for JSON
    // lines; OTEL_EXPORTER_OTLP_ENDPOINT enables span export.
    let _otel = init_tracing("homesight");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!("  Config loaded from {}", config::config_path().display().to_string().bold());
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    probe_backend("vision", &cfg.vision_url, &cfg.vision_model);
    probe_backend("planning", &cfg.planning_url, &cfg.planning_model);
    println!();

    if cfg.cameras.is_empty() {
        println!(
            "  {} Add a {} entry to {} and restart.",
            "No cameras configured.".yellow(),
            "[[cameras]]".bold(),
            config::config_path().display()
        );
        return;
    }

    let shutdown = CancellationToken::new();
    let bus = Arc::new(EventBus::default());
    install_ctrlc(shutdown.clone(), bus.clone());

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the async runtime");
            std::process::exit(1);
        }
    };
    runtime.block_on(run(cfg, bus, shutdown));
    println!("{}", "  ✓ Exiting homesight.".green());
}

// ─────────────────────────────────────────────────────────────────────────────
// Run loop
// ─────────────────────────────────────────────────────────────────────────────

async fn run(cfg: config::Config, bus: Arc<EventBus>, shutdown: CancellationToken) {
    let orchestrator = build_orchestrator(&cfg, bus.clone());
    tokio::spawn(log_events(bus, shutdown.clone()));

    for camera in &cfg.cameras {
        let id = SessionId::new(camera.id.as_str());
        let source = StreamSource::new(camera.id.as_str(), camera.snapshot_url.as_str());
        match orchestrator.start_session(id, source).await {
            Ok(()) => println!("  {} {}", "▶".green(), camera.id.bold()),
            Err(e) => println!("  {} {}: {}", "✗".red(), camera.id.bold(), e),
        }
    }
    if orchestrator.sessions().is_empty() {
        println!("  {}", "No camera could be opened.".red());
        return;
    }
    println!("\n  Running. Press {} to stop.\n", "Ctrl-C".bold());

    let mut reap = tokio::time::interval(REAP_EVERY);
    let mut health = tokio::time::interval(HEALTH_EVERY);
    let mut prune = tokio::time::interval(PRUNE_EVERY);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = reap.tick() => {
                for id in orchestrator.reap_inactive().await {
                    warn!(session = %id, "camera went quiet; session stopped");
                }
            }
            _ = health.tick() => {
                let report = orchestrator.health();
                info!(
                    sessions = report.sessions,
                    errored = report.errored.len(),
                    queue_depth = report.gateway.queue_depth(),
                    vision_available = report.gateway.vision.available,
                    planning_available = report.gateway.planning.available,
                    vision_utilization = report.gateway.vision.utilization,
                    "health"
                );
            }
            _ = prune.tick() => match orchestrator.prune_activity() {
                Ok(0) => {}
                Ok(n) => info!(removed = n, "activity log pruned"),
                Err(e) => warn!(error = %e, "activity log pruning failed"),
            },
        }
    }

    orchestrator.shutdown().await;
    println!("{}", "  ✓ All sessions stopped.".green());
}

fn build_orchestrator(cfg: &config::Config, bus: Arc<EventBus>) -> Orchestrator {
    let mut vision = OpenAiBackend::new(Backend::Vision, cfg.vision_url.as_str(), cfg.vision_model.as_str());
    let mut planning = OpenAiBackend::new(Backend::Planning, cfg.planning_url.as_str(), cfg.planning_model.as_str());
    if !cfg.inference_api_key.is_empty() {
        vision = vision.with_api_key(cfg.inference_api_key.as_str());
        planning = planning.with_api_key(cfg.inference_api_key.as_str());
    }
    let gateway = Arc::new(InferenceGateway::new(
        GatewayConfig::default(),
        Arc::new(vision),
        Arc::new(planning),
    ));

    // The planner may touch exactly what the catalog lists.
    let dispatcher_config = DispatcherConfig {
        notify_targets: cfg.notify_targets.clone(),
        ..DispatcherConfig::default()
    };
    let mut caps = CapabilityManager::new();
    caps.grant(&dispatcher_config.identity, Capability::Notify);
    for d in &cfg.devices {
        caps.grant(&dispatcher_config.identity, Capability::DeviceControl(d.id.clone()));
    }
    for s in &cfg.scenes {
        caps.grant(&dispatcher_config.identity, Capability::RunScene(s.id.clone()));
    }
    let gate = Arc::new(DeviceGate::new(caps, cfg.catalog()));

    let mut devices = HttpDeviceController::new(cfg.device_url.as_str());
    if !cfg.device_api_key.is_empty() {
        devices = devices.with_api_key(cfg.device_api_key.as_str());
    }
    let dispatcher = Arc::new(ActionDispatcher::new(gate, Arc::new(devices), dispatcher_config));

    let camera = Arc::new(SnapshotCamera::new(Duration::from_millis(cfg.snapshot_poll_ms.max(1))));
    let orchestrator_config = OrchestratorConfig {
        sampling: SamplingPolicy::Interval(Duration::from_millis(cfg.sampling_interval_ms.max(1))),
        ..OrchestratorConfig::default()
    };
    let orchestrator = Orchestrator::new(orchestrator_config, gateway, camera, dispatcher, bus);

    match &cfg.activity_log {
        Some(path) => match ActivityLog::open(path) {
            Ok(log) => {
                info!(path = %path.display(), "activity log enabled");
                orchestrator.with_activity_log(log)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "activity log unavailable; journaling disabled");
                orchestrator
            }
        },
        None => orchestrator,
    }
}

/// Mirror decisions, device commands and alerts into the log.
async fn log_events(bus: Arc<EventBus>, shutdown: CancellationToken) {
    let mut events = bus.subscribe_all();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => match event.payload {
                EventPayload::History { session_id, entry } => match &entry {
                    HistoryEntry::Decision(_) | HistoryEntry::Command(_) => {
                        info!(session = %session_id, kind = entry.kind(), "{}", entry.summary());
                    }
                    HistoryEntry::Failure(_) => {
                        warn!(session = %session_id, kind = entry.kind(), "{}", entry.summary());
                    }
                    HistoryEntry::Perception(_) | HistoryEntry::Suppressed(_) => {}
                },
                EventPayload::Alert { session_id, message } => match session_id {
                    Some(id) => warn!(session = %id, "{message}"),
                    None => warn!("{message}"),
                },
                _ => {}
            },
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "event log fell behind");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn install_ctrlc(shutdown: CancellationToken, bus: Arc<EventBus>) {
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping sessions …".yellow().bold());
        let _ = bus.publish(Event::new(
            "homesight-cli",
            EventPayload::Alert {
                session_id: None,
                message: "operator requested shutdown".to_string(),
            },
        ));
        shutdown.cancel();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Startup helpers
// ─────────────────────────────────────────────────────────────────────────────

fn first_run() -> config::Config {
    let cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Default config written to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

fn probe_backend(role: &str, url: &str, model: &str) {
    print!("  Probing {} server at {} … ", role, url.dimmed());
    match probe::fetch_models(url) {
        Ok(models) if probe::serves(&models, model) => {
            println!("{} ({} ready)", "online".green(), model.bold());
        }
        Ok(models) => {
            println!("{}", "online".green());
            println!(
                "  {} {} is not served here ({} model(s) available).",
                "⚠".yellow(),
                model.bold(),
                models.len()
            );
        }
        Err(e) => {
            println!("{}", "offline".yellow());
            println!("  {}", e.dimmed());
        }
    }
}

fn print_banner() {
    println!();
    println!("{}", r#"   __                         _       __    __ "#.bold().cyan());
    println!("{}", r#"  / /  ___  __ _  ___ ___ (_)__ _ / /  / /_"#.bold().cyan());
    println!("{}", r#" / _ \/ _ \/  ' \/ -_|_-</ / _ `// _ \/ __/"#.bold().cyan());
    println!("{}", r#"/_//_/\___/_/_/_/\__/___/_/\_, //_//_/\__/ "#.bold().cyan());
    println!("{}", r#"                          /___/            "#.bold().cyan());
    println!();
    println!("  {} {}", "homesight".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Camera-driven home automation");
    println!();
}
