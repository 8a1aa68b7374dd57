//! In-process simulated collaborators for tests and headless runs.
//!
//! [`SimCameraSource`] hands out streams fed from test code through a
//! [`SimCameraFeed`]; [`SimDeviceController`] records every command it
//! applies and can be scripted to fail, reject, stall, or run long.
//!
//! # Example
//!
//! ```rust
//! use homesight_hal::sim::SimCameraSource;
//!
//! let source = SimCameraSource::new();
//! let feed = source.add_camera("porch_cam");
//! feed.push_frame(vec![0u8; 64]);
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use homesight_types::{CommandOutcome, DeviceRequest, HomeError, SessionId, StreamSource};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::camera::{CameraFrame, CameraSource, CameraStream, StreamEvent};
use crate::device::{DeviceAck, DeviceController};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ────────────────────────────────────────────────────────────────────────────
// Camera
// ────────────────────────────────────────────────────────────────────────────

/// Camera source whose streams are driven by [`SimCameraFeed`] handles.
#[derive(Default)]
pub struct SimCameraSource {
    pending: Mutex<HashMap<String, mpsc::UnboundedReceiver<StreamEvent>>>,
}

impl SimCameraSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the feed for `camera_id`. The next [`CameraSource::open`] for
    /// that camera id receives everything pushed into the returned feed.
    pub fn add_camera(&self, camera_id: impl Into<String>) -> SimCameraFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.pending).insert(camera_id.into(), rx);
        SimCameraFeed {
            tx,
            next_sequence: Arc::new(AtomicU64::new(1)),
        }
    }
}

#[async_trait]
impl CameraSource for SimCameraSource {
    async fn open(
        &self,
        session_id: &SessionId,
        source: &StreamSource,
    ) -> Result<Box<dyn CameraStream>, HomeError> {
        let rx = lock(&self.pending)
            .remove(&source.camera_id)
            .ok_or_else(|| HomeError::Stream {
                camera: source.camera_id.clone(),
                details: "no simulated feed for camera".to_string(),
            })?;
        debug!(session = %session_id, camera = %source.camera_id, "sim stream opened");
        Ok(Box::new(SimCameraStream { rx }))
    }
}

struct SimCameraStream {
    rx: mpsc::UnboundedReceiver<StreamEvent>,
}

#[async_trait]
impl CameraStream for SimCameraStream {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

/// Test-side handle pushing events into one simulated stream. Dropping every
/// clone ends the stream.
#[derive(Clone)]
pub struct SimCameraFeed {
    tx: mpsc::UnboundedSender<StreamEvent>,
    next_sequence: Arc<AtomicU64>,
}

impl SimCameraFeed {
    /// Push a frame with the next source sequence number. Returns the number
    /// used.
    pub fn push_frame(&self, data: Vec<u8>) -> u64 {
        let seq = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        self.send(StreamEvent::Frame(CameraFrame::new(seq, 8, 8, data)));
        seq
    }

    /// Push a frame with an explicit source sequence number (for out-of-order
    /// and wrap-around scenarios). Does not advance the automatic counter.
    pub fn push_frame_with_sequence(&self, source_sequence: u64, data: Vec<u8>) {
        self.send(StreamEvent::Frame(CameraFrame::new(source_sequence, 8, 8, data)));
    }

    pub fn disconnect(&self, reason: impl Into<String>) {
        self.send(StreamEvent::Disconnected {
            reason: reason.into(),
        });
    }

    pub fn reconnect(&self) {
        self.send(StreamEvent::Reconnected);
    }

    fn send(&self, event: StreamEvent) {
        // The stream side may already be gone; that is the same as a camera
        // nobody watches.
        let _ = self.tx.send(event);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Devices
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct DeviceState {
    /// Command ids already applied, with the ack they got.
    seen: HashMap<Uuid, DeviceAck>,
    applied: Vec<DeviceRequest>,
    submissions: usize,
    transient_failures: HashMap<String, u32>,
    rejections: HashMap<String, String>,
    long_running: HashSet<String>,
    delays: HashMap<String, Duration>,
    pending_outcomes: HashMap<Uuid, CommandOutcome>,
}

/// Device controller that applies commands in memory.
///
/// Deduplicates by `command_id`: a repeated id is acknowledged again but not
/// applied twice.
#[derive(Default)]
pub struct SimDeviceController {
    state: Mutex<DeviceState>,
}

impl SimDeviceController {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` submissions to `device_id` fail transiently.
    pub fn fail_next(&self, device_id: impl Into<String>, count: u32) {
        lock(&self.state)
            .transient_failures
            .insert(device_id.into(), count);
    }

    /// Every submission to `device_id` is rejected with `reason`.
    pub fn reject(&self, device_id: impl Into<String>, reason: impl Into<String>) {
        lock(&self.state)
            .rejections
            .insert(device_id.into(), reason.into());
    }

    /// Submissions to `device_id` are acknowledged as
    /// [`DeviceAck::Accepted`] and complete on the first outcome poll.
    pub fn long_running(&self, device_id: impl Into<String>) {
        lock(&self.state).long_running.insert(device_id.into());
    }

    /// Every submission to `device_id` takes `delay` before answering.
    pub fn stall(&self, device_id: impl Into<String>, delay: Duration) {
        lock(&self.state).delays.insert(device_id.into(), delay);
    }

    /// Requests that took effect, in order, one per distinct command id.
    pub fn applied(&self) -> Vec<DeviceRequest> {
        lock(&self.state).applied.clone()
    }

    /// Every submission attempt, including failed and duplicate ones.
    pub fn submissions(&self) -> usize {
        lock(&self.state).submissions
    }
}

#[async_trait]
impl DeviceController for SimDeviceController {
    async fn submit(&self, request: &DeviceRequest) -> Result<DeviceAck, HomeError> {
        let delay = {
            let mut state = lock(&self.state);
            state.submissions += 1;
            state.delays.get(&request.device_id).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = lock(&self.state);
        if let Some(remaining) = state.transient_failures.get_mut(&request.device_id)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(HomeError::DeviceCommand {
                device_id: request.device_id.clone(),
                details: "simulated transient failure".to_string(),
            });
        }
        if let Some(reason) = state.rejections.get(&request.device_id) {
            return Ok(DeviceAck::Rejected {
                reason: reason.clone(),
            });
        }
        if let Some(ack) = state.seen.get(&request.command_id) {
            debug!(command_id = %request.command_id, "duplicate command ignored");
            return Ok(ack.clone());
        }

        let ack = if state.long_running.contains(&request.device_id) {
            state
                .pending_outcomes
                .insert(request.command_id, CommandOutcome::Pending);
            DeviceAck::Accepted
        } else {
            DeviceAck::Completed
        };
        state.seen.insert(request.command_id, ack.clone());
        state.applied.push(request.clone());
        Ok(ack)
    }

    async fn outcome(&self, command_id: Uuid) -> Result<CommandOutcome, HomeError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        match state.pending_outcomes.get_mut(&command_id) {
            Some(outcome) => {
                *outcome = CommandOutcome::Succeeded;
                Ok(outcome.clone())
            }
            None if state.seen.contains_key(&command_id) => Ok(CommandOutcome::Succeeded),
            None => Ok(CommandOutcome::Failed {
                reason: format!("unknown command {command_id}"),
            }),
        }
    }
}
