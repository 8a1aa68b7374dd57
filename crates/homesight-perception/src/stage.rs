//! [`PerceptionStage`] – one frame sample in, one scene description out.
//!
//! Each session owns its own stage, so the near-duplicate cache is per
//! camera. The cache anchors on the last frame that actually went through
//! the vision model; reused results do not move the anchor.

use std::sync::Arc;

use chrono::Utc;
use homesight_kernel::{Completion, InferenceGateway, InferenceRequest};
use homesight_types::{Backend, FrameSample, HomeError, PerceptionResult};
use tracing::debug;

use crate::fingerprint::Fingerprint;
use crate::parse::parse_scene;

const DEFAULT_SYSTEM_PROMPT: &str = "You are the eyes of a smart-home assistant. \
You look at one still frame from a household camera and report what is happening.";

const DEFAULT_PROMPT: &str = "Describe the scene in this camera frame. Mention people, \
pets, vehicles, open doors or windows, and anything unusual. Answer with JSON only: \
{\"description\": string, \"entities\": [{\"label\": string, \"confidence\": number}], \
\"confidence\": number}";

#[derive(Debug, Clone, PartialEq)]
pub struct PerceptionConfig {
    /// Reuse the previous result for near-identical frames.
    pub dedup: bool,
    /// Maximum fingerprint Hamming distance (of 64 bits) for reuse.
    pub max_distance: u32,
    pub max_tokens: u32,
    pub system_prompt: String,
    pub prompt: String,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            dedup: true,
            max_distance: 4,
            max_tokens: 512,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

/// What [`PerceptionStage::perceive`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum PerceptionOutcome {
    /// A new description from the vision model.
    Fresh(PerceptionResult),
    /// The previous description, reused for a near-identical frame.
    Reused(PerceptionResult),
    /// A newer frame overtook this one; nothing to apply.
    Superseded,
}

struct CachedScene {
    fingerprint: Fingerprint,
    result: PerceptionResult,
}

pub struct PerceptionStage {
    gateway: Arc<InferenceGateway>,
    config: PerceptionConfig,
    last: Option<CachedScene>,
}

impl PerceptionStage {
    pub fn new(gateway: Arc<InferenceGateway>, config: PerceptionConfig) -> Self {
        Self {
            gateway,
            config,
            last: None,
        }
    }

    /// Describe `sample`.
    ///
    /// # Errors
    ///
    /// Gateway errors ([`HomeError::InferenceTimeout`],
    /// [`HomeError::InferenceBackend`], [`HomeError::GatewayBusy`]) and empty
    /// replies. The cache is left untouched on error.
    pub async fn perceive(&mut self, sample: &FrameSample) -> Result<PerceptionOutcome, HomeError> {
        let fingerprint = Fingerprint::compute(sample.payload.clone()).await;
        if self.config.dedup
            && let Some(last) = &self.last
            && last.fingerprint.is_near(&fingerprint, self.config.max_distance)
        {
            debug!(session = %sample.session_id, seq = sample.sequence, "near-identical frame; scene reused");
            let mut result = last.result.clone();
            result.epoch = sample.epoch;
            result.source_sequence = sample.sequence;
            result.latency_ms = 0;
            result.reused = true;
            result.completed_at = Utc::now();
            return Ok(PerceptionOutcome::Reused(result));
        }

        let request = InferenceRequest::new(sample.key(), self.config.prompt.clone())
            .with_system(self.config.system_prompt.clone())
            .with_image(sample.payload.clone())
            .with_max_tokens(self.config.max_tokens);
        let reply = match self.gateway.execute(Backend::Vision, request).await? {
            Completion::Fresh(reply) => reply,
            Completion::Stale => return Ok(PerceptionOutcome::Superseded),
        };

        let scene = parse_scene(&reply.text)?;
        let result = PerceptionResult {
            session_id: sample.session_id.clone(),
            epoch: sample.epoch,
            source_sequence: sample.sequence,
            description: scene.description,
            entities: scene.entities,
            confidence: scene.confidence,
            latency_ms: reply.latency.as_millis() as u64,
            reused: false,
            completed_at: Utc::now(),
        };
        self.last = Some(CachedScene {
            fingerprint,
            result: result.clone(),
        });
        Ok(PerceptionOutcome::Fresh(result))
    }

    /// Forget the cached scene, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.last = None;
    }
}
