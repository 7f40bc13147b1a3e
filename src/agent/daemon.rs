use std::sync::Arc;

use anyhow::Result;
use serde_json::{Map, Value};
use tokio::signal;
use tracing::{info, warn};

use crate::agent::config::Settings;
use crate::agent::service::RapcomService;
use crate::commands::diff::changed_fields;
use crate::commands::listener::CommandListener;
use crate::transport::{CommandStatus, COMMAND_FIELD, ERROR_TEXT_FIELD, STATUS_FIELD};

/// Listener used when the agent runs standalone: logs config changes and
/// rejects commands it has no handler for.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl CommandListener for LoggingListener {
    fn on_config_change(&self, old: &Value, new: &Value) {
        for (field, change) in changed_fields(old, new) {
            info!(field = %field, change = ?change, "config field changed");
        }
    }

    fn on_command(&self, request: &Value, response: &mut Map<String, Value>) {
        let command = request
            .get(COMMAND_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default();
        warn!(command, "no handler for command");
        response.insert(
            STATUS_FIELD.to_string(),
            Value::from(CommandStatus::Error.as_str()),
        );
        response.insert(
            ERROR_TEXT_FIELD.to_string(),
            Value::from(format!("Unknown command: {command}")),
        );
    }
}

pub async fn run(settings: Settings) -> Result<()> {
    info!(channel = %settings.channel, "Agent daemon starting");

    let listener: Arc<dyn CommandListener> = Arc::new(LoggingListener);
    let mut service = RapcomService::new(settings, Some(&listener));
    service.start().await?;
    info!(
        local_port = service.local_port().unwrap_or_default(),
        "agent ready"
    );

    // Wait for shutdown signal (Ctrl+C) then let go of the workers
    signal::ctrl_c().await?;
    info!("shutdown signal received, stopping daemon");
    drop(service);

    Ok(())
}
