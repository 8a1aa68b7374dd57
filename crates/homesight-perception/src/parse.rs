//! Tolerant parsing of model replies.
//!
//! Models wrap JSON in code fences or chat around it. [`extract_json`] finds
//! the outermost JSON object in a reply; [`parse_scene`] turns a vision reply
//! into a scene description, falling back to the raw text.

use homesight_types::{Backend, HomeError, SceneEntity};
use serde::Deserialize;

/// The first balanced `{...}` object in `text` that is valid JSON, with code
/// fences and surrounding prose stripped. Candidates start at every `{`, so
/// a stray brace in leading prose does not hide a later object. `None` when
/// no candidate parses.
pub fn extract_json(text: &str) -> Option<&str> {
    text.match_indices('{').find_map(|(start, _)| {
        balanced_object(&text[start..])
            .filter(|span| serde_json::from_str::<serde_json::Value>(span).is_ok())
    })
}

/// The balanced object at the start of `text`, which begins with `{`.
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// A scene as reported by the vision model.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    pub description: String,
    pub entities: Vec<SceneEntity>,
    pub confidence: Option<f32>,
}

#[derive(Deserialize)]
struct SceneReply {
    description: String,
    #[serde(default)]
    entities: Vec<SceneEntity>,
    #[serde(default)]
    confidence: Option<f32>,
}

/// Parse a vision reply. Structured JSON is preferred; any other non-empty
/// reply becomes a free-form description.
///
/// # Errors
///
/// [`HomeError::InferenceBackend`] when the reply is empty or only
/// whitespace.
pub fn parse_scene(text: &str) -> Result<Scene, HomeError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(HomeError::InferenceBackend {
            backend: Backend::Vision,
            details: "empty scene description".to_string(),
        });
    }
    if let Some(json) = extract_json(trimmed)
        && let Ok(reply) = serde_json::from_str::<SceneReply>(json)
        && !reply.description.trim().is_empty()
    {
        return Ok(Scene {
            description: reply.description.trim().to_string(),
            entities: reply.entities,
            confidence: reply.confidence.map(|c| c.clamp(0.0, 1.0)),
        });
    }
    Ok(Scene {
        description: trimmed.to_string(),
        entities: Vec::new(),
        confidence: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_from_code_fence() {
        let reply = "Sure!\n```json\n{\"a\": {\"b\": 1}}\n```\nanything else?";
        assert_eq!(extract_json(reply), Some("{\"a\": {\"b\": 1}}"));
    }

    #[test]
    fn braces_inside_strings_are_ignored() {
        let reply = r#"{"description": "a sign reading } and {", "entities": []}"#;
        assert_eq!(extract_json(reply), Some(reply));
    }

    #[test]
    fn stray_brace_in_prose_does_not_hide_the_object() {
        let reply = r#"Looking at {the frame I'd say: {"action": "NoOp"} done"#;
        assert_eq!(extract_json(reply), Some(r#"{"action": "NoOp"}"#));
        let reply = r#"Set {x} aside. {"action": "NoOp"}"#;
        assert_eq!(extract_json(reply), Some(r#"{"action": "NoOp"}"#));
    }

    #[test]
    fn unbalanced_object_is_none() {
        assert_eq!(extract_json("{\"a\": 1"), None);
        assert_eq!(extract_json("no json here"), None);
    }

    #[test]
    fn structured_scene() {
        let scene = parse_scene(
            r#"{"description": "a person at the door", "entities": [{"label": "person", "confidence": 0.9}], "confidence": 1.4}"#,
        )
        .unwrap();
        assert_eq!(scene.description, "a person at the door");
        assert_eq!(scene.entities.len(), 1);
        assert_eq!(scene.entities[0].label, "person");
        assert_eq!(scene.confidence, Some(1.0));
    }

    #[test]
    fn free_text_scene() {
        let scene = parse_scene("  The living room is empty.  ").unwrap();
        assert_eq!(scene.description, "The living room is empty.");
        assert!(scene.entities.is_empty());
        assert_eq!(scene.confidence, None);
    }

    #[test]
    fn json_without_description_falls_back_to_text() {
        let scene = parse_scene(r#"{"objects": 3}"#).unwrap();
        assert_eq!(scene.description, r#"{"objects": 3}"#);
    }

    #[test]
    fn empty_reply_is_backend_error() {
        assert!(matches!(
            parse_scene(" \n "),
            Err(HomeError::InferenceBackend {
                backend: Backend::Vision,
                ..
            })
        ));
    }
}
