//! Controller-side clients for talking to a device.
//!
//! [`RelayController`] reaches a device through the relay, [`LocalController`]
//! talks to its local HTTP endpoint directly. Both speak the same command
//! protocol through [`CommandChannel`].

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::commands::router::{CONFIG_FIELD, GET_CONFIG, HEARTBEAT, SET_CONFIG};
use crate::transport::http_polling::{RelayEndpoints, DATA_FIELD, NEW_DATA};
use crate::transport::{CommandResult, COMMAND_FIELD, RESPONSE_CODE_FIELD, STATUS_FIELD};

pub const COMMAND_PATH: &str = "/api/v1/command";

// Response codes stay below 10^14 so they survive a round trip through a
// JavaScript number.
const RESPONSE_CODE_LIMIT: u128 = 100_000_000_000_000;

/// Build `{"Command": .., "Value1": .., ...}` from positional values.
pub fn build_message(command: &str, values: &[Value]) -> Map<String, Value> {
    let mut message = Map::new();
    message.insert(COMMAND_FIELD.to_string(), Value::from(command));
    for (i, value) in values.iter().take(4).enumerate() {
        message.insert(format!("Value{}", i + 1), value.clone());
    }
    message
}

fn new_response_code() -> u64 {
    (Uuid::new_v4().as_u128() % RESPONSE_CODE_LIMIT) as u64
}

/// A way of delivering commands to a device.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Deliver `message`. When `wait_for_response` is false the command is
    /// only handed off and `None` is returned.
    async fn send(&self, message: Map<String, Value>, wait_for_response: bool) -> Result<Option<CommandResult>>;

    async fn send_command(&self, command: &str, values: &[Value]) -> Result<CommandResult> {
        self.send(build_message(command, values), true)
            .await?
            .ok_or_else(|| anyhow!("no response to {command}"))
    }

    async fn get_config(&self) -> Result<Value> {
        let result = self.send_command(GET_CONFIG, &[]).await?;
        if !result.is_success() {
            bail!(
                "GetConfig failed: {}",
                result.error_text.as_deref().unwrap_or("no status")
            );
        }
        Ok(Value::Object(result.body))
    }

    /// True only when the device accepted and stored the config.
    async fn set_config(&self, config: Value) -> Result<bool> {
        let result = self.send_command(SET_CONFIG, &[config]).await?;
        Ok(result.is_success())
    }

    async fn heartbeat(&self) -> Result<CommandResult> {
        self.send_command(HEARTBEAT, &[]).await
    }
}

fn parse_result(raw: &str) -> Result<CommandResult> {
    match serde_json::from_str::<Value>(raw).context("parsing command result")? {
        Value::Object(body) => Ok(CommandResult::from_body(body)),
        other => bail!("command result is not an object: {other}"),
    }
}

/// Sends commands through the relay and long-polls for the answer.
#[derive(Debug, Clone)]
pub struct RelayController {
    http: Client,
    endpoints: RelayEndpoints,
    response_timeout: Duration,
}

impl RelayController {
    pub fn new(relay_url: &str, channel: &str) -> Result<Self> {
        let http = Client::builder().build().context("building http client")?;
        Ok(Self {
            http,
            endpoints: RelayEndpoints::new(relay_url, channel),
            response_timeout: Duration::from_secs(35),
        })
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    async fn await_response(&self, response_code: &str) -> Result<CommandResult> {
        let url = self.endpoints.response_poll_url(response_code);
        debug!(url = %url, "waiting for device response");

        let body = self
            .http
            .get(&url)
            .timeout(self.response_timeout)
            .send()
            .await
            .context("response poll send")?
            .error_for_status()
            .context("response poll status")?
            .text()
            .await
            .context("read response poll body")?;

        let reply: Value = serde_json::from_str(&body).context("parse response poll json")?;
        if reply.get(STATUS_FIELD).and_then(Value::as_str) != Some(NEW_DATA) {
            bail!("Disconnected: relay returned no response for code {response_code}");
        }
        let data = reply
            .get(DATA_FIELD)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("response poll has no Data"))?;
        let decoded = urlencoding::decode(data).context("decode response data")?;

        let mut result = parse_result(&decoded)?;
        result.response_code = Some(response_code.to_string());
        Ok(result)
    }
}

#[async_trait]
impl CommandChannel for RelayController {
    async fn send(&self, mut message: Map<String, Value>, wait_for_response: bool) -> Result<Option<CommandResult>> {
        let response_code = if wait_for_response {
            let code = new_response_code();
            message.insert(RESPONSE_CODE_FIELD.to_string(), Value::from(code));
            Some(code.to_string())
        } else {
            None
        };

        let json = Value::Object(message).to_string();
        let url = self.endpoints.command_url();
        debug!(url = %url, response_code = response_code.as_deref().unwrap_or(""), "posting command to relay");

        self.http
            .post(&url)
            .form(&[("data", json)])
            .send()
            .await
            .context("command post send")?
            .error_for_status()
            .context("command post status")?;

        match response_code {
            Some(code) => Ok(Some(self.await_response(&code).await?)),
            None => Ok(None),
        }
    }
}

/// Sends commands straight to a device's local endpoint.
#[derive(Debug, Clone)]
pub struct LocalController {
    http: Client,
    command_url: String,
}

impl LocalController {
    /// `base_url` is the device root, e.g. `http://10.0.0.12:8356`.
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            command_url: format!("{}{}", base_url.trim_end_matches('/'), COMMAND_PATH),
        })
    }
}

#[async_trait]
impl CommandChannel for LocalController {
    async fn send(&self, message: Map<String, Value>, wait_for_response: bool) -> Result<Option<CommandResult>> {
        let body = Value::Object(message).to_string();
        let raw = self
            .http
            .post(&self.command_url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .context("local command send")?
            .error_for_status()
            .context("local command status")?
            .text()
            .await
            .context("read local command body")?;

        if !wait_for_response {
            return Ok(None);
        }
        parse_result(&raw).map(Some)
    }
}
