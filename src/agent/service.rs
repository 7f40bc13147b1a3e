use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::agent::config::Settings;
use crate::agent::worker::BackgroundWorker;
use crate::commands::config_store::ConfigStore;
use crate::commands::listener::CommandListener;
use crate::commands::router::CommandRouter;
use crate::comms::local_api::{LocalServer, LocalServerOptions};
use crate::transport::http_polling::RelayPollClient;

/// Owns the command router and both transports.
///
/// The service holds the only external handles to its workers; dropping it
/// lets them wind down on their next loop iteration.
pub struct RapcomService {
    settings: Settings,
    router: Arc<CommandRouter>,
    local_server: Option<Arc<LocalServer>>,
    poll_client: Option<Arc<RelayPollClient>>,
    started: bool,
}

impl RapcomService {
    /// Load the config document and prepare the router. Nothing is bound
    /// until [`start`](Self::start).
    pub fn new(settings: Settings, listener: Option<&Arc<dyn CommandListener>>) -> Self {
        let store = ConfigStore::new(settings.config_path.clone());
        let router = match listener {
            Some(listener) => CommandRouter::with_listener(store, listener),
            None => CommandRouter::new(store, None),
        };
        Self {
            settings,
            router: Arc::new(router),
            local_server: None,
            poll_client: None,
            started: false,
        }
    }

    /// Bind the local server and start both workers. Calling it again is a
    /// no-op.
    pub async fn start(&mut self) -> Result<()> {
        if self.started {
            return Ok(());
        }

        if self.settings.enable_local {
            let options = LocalServerOptions::from_settings(&self.settings);
            let server = Arc::new(LocalServer::setup(self.router.clone(), &options).await);
            if let Some(port) = server.bound_port() {
                self.router.set_local_port(port);
            }
            server.start();
            self.local_server = Some(server);
        }

        if self.settings.enable_relay {
            let client = Arc::new(RelayPollClient::from_settings(self.router.clone(), &self.settings)?);
            client.start();
            info!(
                channel = %self.settings.channel,
                relay = %self.settings.relay_url,
                "relay polling started"
            );
            self.poll_client = Some(client);
        }

        self.started = true;
        Ok(())
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Copy of the current config document.
    pub fn config(&self) -> Value {
        self.router.config()
    }

    pub fn save_config(&self) -> Result<()> {
        self.router.save()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.router.local_port()
    }

    pub fn is_running(&self) -> bool {
        let local = self.local_server.as_ref().is_some_and(|s| s.is_running());
        let relay = self.poll_client.as_ref().is_some_and(|c| c.is_running());
        local || relay
    }
}
