//! [`HttpDeviceController`] – device control over a home-automation HTTP API.
//!
//! | Call | Request | Response |
//! |---|---|---|
//! | submit | `POST {base}/commands` `{command_id, device_id, command, params}` | `{"status": "completed" \| "accepted" \| "rejected", "reason"?}` |
//! | outcome | `GET {base}/commands/{command_id}` | `{"status": "pending" \| "succeeded" \| "failed", "reason"?}` |
//!
//! Transport errors and non-2xx replies are transient and surface as
//! [`HomeError::DeviceCommand`]; the dispatcher decides whether to retry.

use async_trait::async_trait;
use homesight_hal::{DeviceAck, DeviceController};
use homesight_types::{CommandOutcome, DeviceRequest, HomeError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize)]
struct CommandBody<'a> {
    command_id: Uuid,
    device_id: &'a str,
    command: &'a str,
    params: Params<'a>,
}

#[derive(Serialize)]
struct Params<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<&'a str>,
}

#[derive(Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum AckBody {
    Completed,
    Accepted,
    Rejected {
        #[serde(default)]
        reason: Option<String>,
    },
}

impl From<AckBody> for DeviceAck {
    fn from(body: AckBody) -> Self {
        match body {
            AckBody::Completed => DeviceAck::Completed,
            AckBody::Accepted => DeviceAck::Accepted,
            AckBody::Rejected { reason } => DeviceAck::Rejected {
                reason: reason.unwrap_or_else(|| "no reason given".to_string()),
            },
        }
    }
}

pub struct HttpDeviceController {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpDeviceController {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            client,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }
}

fn transport_error(device_id: &str, e: reqwest::Error) -> HomeError {
    HomeError::DeviceCommand {
        device_id: device_id.to_string(),
        details: e.to_string(),
    }
}

#[async_trait]
impl DeviceController for HttpDeviceController {
    async fn submit(&self, request: &DeviceRequest) -> Result<DeviceAck, HomeError> {
        let body = CommandBody {
            command_id: request.command_id,
            device_id: &request.device_id,
            command: &request.command,
            params: Params {
                value: request.value.as_deref(),
            },
        };
        let ack: AckBody = self
            .authorized(self.client.post(format!("{}/commands", self.base_url)))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport_error(&request.device_id, e))?
            .json()
            .await
            .map_err(|e| transport_error(&request.device_id, e))?;
        Ok(ack.into())
    }

    async fn outcome(&self, command_id: Uuid) -> Result<CommandOutcome, HomeError> {
        let url = format!("{}/commands/{command_id}", self.base_url);
        let device = format!("command:{command_id}");
        self.authorized(self.client.get(url))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| transport_error(&device, e))?
            .json::<CommandOutcome>()
            .await
            .map_err(|e| transport_error(&device, e))
    }
}
