//! Startup probes for the model servers.
//!
//! Pings an OpenAI-compatible server's `/v1/models` endpoint and lists the
//! models it serves. Runs before the async runtime starts, so it uses the
//! blocking client.

use std::time::Duration;

use serde::Deserialize;

/// A single entry of the `/v1/models` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServedModel {
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ServedModel>,
}

/// Return the models served at `base_url`, or why the server could not be
/// reached.
pub fn fetch_models(base_url: &str) -> Result<Vec<ServedModel>, String> {
    let url = format!("{}/v1/models", base_url.trim_end_matches('/'));
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(3))
        .build()
        .map_err(|e| format!("HTTP client unavailable: {}", e))?;
    let response = client
        .get(&url)
        .send()
        .map_err(|e| format!("model server unreachable at {}: {}", url, e))?;

    if !response.status().is_success() {
        return Err(format!("model server returned HTTP {}", response.status()));
    }

    let models: ModelsResponse = response
        .json()
        .map_err(|e| format!("Failed to parse model list: {}", e))?;
    Ok(models.data)
}

/// `true` when `model` is listed. Servers that tag models (`llava:13b`)
/// match on the name before the tag as well.
pub fn serves(models: &[ServedModel], model: &str) -> bool {
    models
        .iter()
        .any(|m| m.id == model || m.id.split(':').next() == Some(model))
}
