//! [`PlanningStage`] – scene context in, one [`HomeAction`] decision out.
//!
//! The planning model sees the current scene, the session's recent history
//! (most recent first, cut to a character budget), and the device catalog.
//! It answers with JSON constrained by the schema of [`PlannerReply`].
//!
//! Replies are parsed into a [`ParsedDecision`]; anything that does not parse
//! becomes a [`ParsedDecision::ParseError`], which callers treat as a no-op.

use std::sync::Arc;

use chrono::Utc;
use homesight_hal::DeviceCatalog;
use homesight_kernel::{Completion, InferenceGateway, InferenceRequest};
use homesight_perception::parse::extract_json;
use homesight_types::{
    Backend, CycleKey, HistoryEntry, HomeAction, HomeError, PerceptionResult, PlanningDecision,
};
use schemars::{JsonSchema, schema_for};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

const DEFAULT_SYSTEM_PROMPT: &str = "You are the planner of a smart-home assistant. \
You receive what a household camera currently sees and decide on at most one action. \
Prefer NoOp unless the scene clearly calls for a notification, a device command, or a scene. \
Only use device ids, commands, and scene ids from the catalog.";

/// What the planning model is asked to return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PlannerReply {
    pub action: HomeAction,
    /// One sentence on why.
    #[serde(default)]
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanningConfig {
    /// History entries offered to the model.
    pub history_window: usize,
    /// Character budget for the history section of the prompt.
    pub history_budget: usize,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for PlanningConfig {
    fn default() -> Self {
        Self {
            history_window: 8,
            history_budget: 2_000,
            max_tokens: 256,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reply parsing
// ─────────────────────────────────────────────────────────────────────────────

/// A planning reply, parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedDecision {
    Decision { action: HomeAction, rationale: String },
    /// Carries a [`HomeError::PlanningParse`].
    ParseError(HomeError),
}

/// Parse a planning reply.
///
/// Accepts the [`PlannerReply`] shape, or a bare [`HomeAction`] object,
/// optionally wrapped in code fences or prose.
pub fn parse_decision(text: &str) -> ParsedDecision {
    let Some(json) = extract_json(text) else {
        return ParsedDecision::ParseError(HomeError::PlanningParse(format!(
            "no JSON object in reply: {}",
            preview(text)
        )));
    };
    if let Ok(reply) = serde_json::from_str::<PlannerReply>(json) {
        return ParsedDecision::Decision {
            action: reply.action,
            rationale: reply.rationale,
        };
    }
    match serde_json::from_str::<HomeAction>(json) {
        Ok(action) => ParsedDecision::Decision {
            action,
            rationale: String::new(),
        },
        Err(e) => ParsedDecision::ParseError(HomeError::PlanningParse(format!(
            "{e}: {}",
            preview(json)
        ))),
    }
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    match text.char_indices().nth(MAX) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Stage
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PlanningOutcome {
    Decided(PlanningDecision),
    /// The reply did not parse; `decision` is the no-op standing in for it.
    Unparseable {
        decision: PlanningDecision,
        error: HomeError,
    },
    /// A newer frame overtook this cycle; nothing to apply.
    Superseded,
}

impl PlanningOutcome {
    pub fn decision(&self) -> Option<&PlanningDecision> {
        match self {
            PlanningOutcome::Decided(d) | PlanningOutcome::Unparseable { decision: d, .. } => Some(d),
            PlanningOutcome::Superseded => None,
        }
    }
}

pub struct PlanningStage {
    gateway: Arc<InferenceGateway>,
    config: PlanningConfig,
    catalog: String,
    schema: serde_json::Value,
}

impl PlanningStage {
    pub fn new(gateway: Arc<InferenceGateway>, catalog: &DeviceCatalog, config: PlanningConfig) -> Self {
        let schema = serde_json::to_value(schema_for!(PlannerReply)).unwrap_or(serde_json::Value::Null);
        Self {
            gateway,
            config,
            catalog: catalog.describe(),
            schema,
        }
    }

    /// Decide what to do about `perception`.
    ///
    /// `history` is most recent first. The cycle key is the perception's
    /// frame position, so a newer frame accepted meanwhile supersedes the
    /// call.
    ///
    /// # Errors
    ///
    /// Gateway errors. Unparseable replies are not errors.
    pub async fn plan(
        &self,
        perception: &PerceptionResult,
        history: &[HistoryEntry],
    ) -> Result<PlanningOutcome, HomeError> {
        let key = CycleKey::new(
            perception.session_id.clone(),
            perception.epoch,
            perception.source_sequence,
        );
        let mut request = InferenceRequest::new(key, self.build_prompt(perception, history))
            .with_system(self.config.system_prompt.clone())
            .with_max_tokens(self.config.max_tokens);
        if !self.schema.is_null() {
            request = request.with_schema(self.schema.clone());
        }

        let reply = match self.gateway.execute(Backend::Planning, request).await? {
            Completion::Fresh(reply) => reply,
            Completion::Stale => return Ok(PlanningOutcome::Superseded),
        };

        let decision = |action: HomeAction, rationale: String| PlanningDecision {
            id: Uuid::new_v4(),
            session_id: perception.session_id.clone(),
            epoch: perception.epoch,
            source_sequence: perception.source_sequence,
            action,
            rationale,
            decided_at: Utc::now(),
        };
        Ok(match parse_decision(&reply.text) {
            ParsedDecision::Decision { action, rationale } => {
                debug!(session = %perception.session_id, kind = ?action.kind(), "planning decided");
                PlanningOutcome::Decided(decision(action, rationale))
            }
            ParsedDecision::ParseError(error) => {
                warn!(session = %perception.session_id, %error, "planning reply unparseable; no-op");
                PlanningOutcome::Unparseable {
                    decision: decision(HomeAction::NoOp, "unparseable planning reply".to_string()),
                    error,
                }
            }
        })
    }

    fn build_prompt(&self, perception: &PerceptionResult, history: &[HistoryEntry]) -> String {
        let mut prompt = format!("Current scene: {}\n", perception.description);
        if !perception.entities.is_empty() {
            let labels: Vec<&str> = perception.entities.iter().map(|e| e.label.as_str()).collect();
            prompt.push_str(&format!("Detected: {}\n", labels.join(", ")));
        }

        let mut budget = self.config.history_budget;
        let mut lines = Vec::new();
        for entry in history.iter().take(self.config.history_window) {
            let line = format!("- {}\n", entry.summary());
            if line.len() > budget {
                break;
            }
            budget -= line.len();
            lines.push(line);
        }
        if !lines.is_empty() {
            prompt.push_str("Recent history (most recent first):\n");
            prompt.extend(lines);
        }

        prompt.push('\n');
        prompt.push_str(&self.catalog);
        prompt.push_str(
            "\nAnswer with JSON only: {\"action\": {\"action\": \"NoOp\" | \"Notify\" | \
             \"ActuateDevice\" | \"RunScene\", \"payload\": {...}}, \"rationale\": string}",
        );
        prompt
    }
}
