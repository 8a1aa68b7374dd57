//! [`FrameSampler`] – bounded-rate sampling of a camera stream.
//!
//! The sampler never buffers: it holds at most one pending frame (the
//! freshest) and overwrites it whenever a newer one arrives. At each sampling
//! point the pending frame becomes a [`FrameSample`] and the count of frames
//! overwritten since the previous sample is recorded in it.
//!
//! Reconnects open a new sub-epoch: the epoch counter increments and the
//! sample sequence restarts at 1, so `(epoch, sequence)` stays strictly
//! increasing for the lifetime of the session.
//!
//! [`SamplerCore`] holds the pure bookkeeping; [`FrameSampler::run`] drives
//! it from a [`CameraStream`] and a Tokio interval.

use std::time::Duration;

use homesight_hal::{CameraFrame, CameraStream, StreamEvent};
use homesight_types::{FrameSample, SampleDecision, SessionId};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Source-sequence gap treated as a counter wrap-around rather than an
/// out-of-order frame.
pub const WRAP_GAP: u64 = 10_000;

/// When the sampler emits a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingPolicy {
    /// The freshest frame, once per period.
    Interval(Duration),
    /// Every Nth accepted source frame.
    EveryNth(u32),
}

impl Default for SamplingPolicy {
    fn default() -> Self {
        SamplingPolicy::Interval(Duration::from_secs(1))
    }
}

/// Counters kept by [`SamplerCore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub received: u64,
    pub out_of_order: u64,
    pub dropped: u64,
    pub emitted: u64,
}

/// What the sampler tells its session.
#[derive(Debug, Clone)]
pub enum SamplerEvent {
    Sample(FrameSample),
    Disconnected { reason: String },
    Reconnected { epoch: u64 },
    /// The stream ended for good.
    Ended,
}

// ────────────────────────────────────────────────────────────────────────────
// Core bookkeeping
// ────────────────────────────────────────────────────────────────────────────

/// Latest-frame slot, sequence numbering and sub-epochs.
#[derive(Debug)]
pub struct SamplerCore {
    session_id: SessionId,
    policy: SamplingPolicy,
    epoch: u64,
    next_sequence: u64,
    pending: Option<CameraFrame>,
    last_source_sequence: Option<u64>,
    dropped_since_sample: u64,
    accepted_since_sample: u32,
    stats: SamplerStats,
}

impl SamplerCore {
    pub fn new(session_id: SessionId, policy: SamplingPolicy) -> Self {
        Self {
            session_id,
            policy,
            epoch: 0,
            next_sequence: 1,
            pending: None,
            last_source_sequence: None,
            dropped_since_sample: 0,
            accepted_since_sample: 0,
            stats: SamplerStats::default(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    /// Offer a frame from the stream. Out-of-order frames are ignored. Under
    /// [`SamplingPolicy::EveryNth`] this may return the sample to emit.
    pub fn offer(&mut self, frame: CameraFrame) -> Option<FrameSample> {
        if let Some(last) = self.last_source_sequence
            && frame.source_sequence <= last
            && last - frame.source_sequence < WRAP_GAP
        {
            self.stats.out_of_order += 1;
            debug!(
                session = %self.session_id,
                last,
                got = frame.source_sequence,
                "out-of-order frame ignored"
            );
            return None;
        }
        self.last_source_sequence = Some(frame.source_sequence);
        self.stats.received += 1;
        if self.pending.replace(frame).is_some() {
            self.dropped_since_sample += 1;
            self.stats.dropped += 1;
        }
        self.accepted_since_sample = self.accepted_since_sample.saturating_add(1);

        match self.policy {
            SamplingPolicy::EveryNth(n) if self.accepted_since_sample >= n.max(1) => self.take_sample(),
            _ => None,
        }
    }

    /// A sampling tick. Returns the freshest pending frame, if any.
    pub fn tick(&mut self) -> Option<FrameSample> {
        self.take_sample()
    }

    fn take_sample(&mut self) -> Option<FrameSample> {
        let frame = self.pending.take()?;
        let sample = FrameSample {
            session_id: self.session_id.clone(),
            epoch: self.epoch,
            sequence: self.next_sequence,
            source_sequence: frame.source_sequence,
            captured_at: frame.captured_at,
            width: frame.width,
            height: frame.height,
            payload: frame.data,
            decision: SampleDecision::Kept,
            dropped_before: self.dropped_since_sample,
        };
        self.next_sequence += 1;
        self.dropped_since_sample = 0;
        self.accepted_since_sample = 0;
        self.stats.emitted += 1;
        Some(sample)
    }

    /// The stream dropped. A pending frame from before the drop is discarded.
    pub fn on_disconnect(&mut self) {
        if self.pending.take().is_some() {
            self.stats.dropped += 1;
        }
        self.accepted_since_sample = 0;
    }

    /// The stream is back. Opens a new sub-epoch and returns it.
    pub fn on_reconnect(&mut self) -> u64 {
        self.epoch += 1;
        self.next_sequence = 1;
        self.pending = None;
        self.last_source_sequence = None;
        self.dropped_since_sample = 0;
        self.accepted_since_sample = 0;
        self.epoch
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Async driver
// ────────────────────────────────────────────────────────────────────────────

/// Drives a [`SamplerCore`] from a live stream.
pub struct FrameSampler {
    core: SamplerCore,
}

impl FrameSampler {
    pub fn new(session_id: SessionId, policy: SamplingPolicy) -> Self {
        Self {
            core: SamplerCore::new(session_id, policy),
        }
    }

    /// Read `stream` until it ends, `cancel` fires, or the receiver of `tx`
    /// goes away.
    pub async fn run(
        mut self,
        mut stream: Box<dyn CameraStream>,
        tx: mpsc::Sender<SamplerEvent>,
        cancel: CancellationToken,
    ) {
        let mut ticker = match self.core.policy {
            SamplingPolicy::Interval(period) => {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                Some(ticker)
            }
            SamplingPolicy::EveryNth(_) => None,
        };
        info!(session = %self.core.session_id, policy = ?self.core.policy, "frame sampler started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = next_tick(&mut ticker) => self.core.tick().map(SamplerEvent::Sample),
                event = stream.next_event() => match event {
                    Some(StreamEvent::Frame(frame)) => self.core.offer(frame).map(SamplerEvent::Sample),
                    Some(StreamEvent::Disconnected { reason }) => {
                        warn!(session = %self.core.session_id, %reason, "stream disconnected");
                        self.core.on_disconnect();
                        Some(SamplerEvent::Disconnected { reason })
                    }
                    Some(StreamEvent::Reconnected) => {
                        let epoch = self.core.on_reconnect();
                        info!(session = %self.core.session_id, epoch, "stream reconnected");
                        Some(SamplerEvent::Reconnected { epoch })
                    }
                    None => {
                        let _ = tx.send(SamplerEvent::Ended).await;
                        break;
                    }
                },
            };
            if let Some(event) = event
                && tx.send(event).await.is_err()
            {
                break;
            }
        }
        debug!(session = %self.core.session_id, stats = ?self.core.stats(), "frame sampler stopped");
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
