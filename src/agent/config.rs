use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use crate::commands::config_store::DEFAULT_CONFIG_FILE;

pub const CHANNEL_ENV: &str = "RAPCOM_CHANNEL";
pub const RELAY_URL_ENV: &str = "RAPCOM_RELAY_URL";

pub const DEFAULT_RELAY_URL: &str = "http://relay.quinndamerell.com";
pub const DEFAULT_REDIRECT_URL: &str = "http://prism.quinndamerell.com/";

/// Service settings. These configure the agent itself; the remotely managed
/// document lives in `config_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Relay channel name this device answers on.
    pub channel: String,
    pub relay_url: String,
    pub bind_address: String,
    pub local_port: u16,
    pub local_port_fallback: u16,
    /// Served under `/local`.
    pub document_root: PathBuf,
    /// Where every unknown local path is redirected.
    pub redirect_url: String,
    pub config_path: PathBuf,
    /// How long an unanswered long-poll is trusted before a new one is sent.
    pub poll_timeout_secs: u64,
    /// Upper bound on a single wait inside a worker iteration.
    pub poll_wait_secs: u64,
    /// Delay before re-polling after the relay could not be reached.
    pub error_backoff_secs: u64,
    pub enable_local: bool,
    pub enable_relay: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            channel: "rapcom".to_string(),
            relay_url: DEFAULT_RELAY_URL.to_string(),
            bind_address: "0.0.0.0".to_string(),
            local_port: 80,
            local_port_fallback: 8356,
            document_root: PathBuf::from("local"),
            redirect_url: DEFAULT_REDIRECT_URL.to_string(),
            config_path: PathBuf::from(DEFAULT_CONFIG_FILE),
            poll_timeout_secs: 30,
            poll_wait_secs: 10,
            error_backoff_secs: 30,
            enable_local: true,
            enable_relay: true,
        }
    }
}

impl Settings {
    /// Read settings from `path`, falling back to defaults when the file does
    /// not exist. Environment overrides are applied last.
    pub fn from_file(path: &str) -> Result<Self> {
        let mut settings = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<Settings>(&raw).context("parsing settings JSON")?,
            Err(e) if e.kind() == ErrorKind::NotFound => Settings::default(),
            Err(e) => return Err(e).context("reading settings file"),
        };
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(channel) = std::env::var(CHANNEL_ENV) {
            if !channel.is_empty() {
                self.channel = channel;
            }
        }
        if let Ok(url) = std::env::var(RELAY_URL_ENV) {
            if !url.is_empty() {
                self.relay_url = url;
            }
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}
