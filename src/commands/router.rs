//! Command dispatch and ownership of the live config document.
//!
//! Both transports hand raw request bytes to [`CommandRouter::dispatch`].
//! Built-in commands are answered here; everything else goes to the
//! registered [`CommandListener`].

use anyhow::Result;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, info, warn};

use crate::commands::config_store::ConfigStore;
use crate::commands::listener::CommandListener;
use crate::transport::{CommandEnvelope, CommandError, CommandResult};
use crate::utils::net;

pub const GET_CONFIG: &str = "GetConfig";
pub const SET_CONFIG: &str = "SetConfig";
pub const HEARTBEAT: &str = "Heartbeat";
pub const CONFIG_FIELD: &str = "Value1";

pub struct CommandRouter {
    store: ConfigStore,
    config: RwLock<Value>,
    // Serializes snapshot -> replace -> persist -> notify.
    update_lock: Mutex<()>,
    listener: Option<Weak<dyn CommandListener>>,
    local_port: AtomicU16,
}

impl CommandRouter {
    /// Load the config document from `store` and route unrecognized commands
    /// to `listener` for as long as it stays alive.
    pub fn new(store: ConfigStore, listener: Option<Weak<dyn CommandListener>>) -> Self {
        let config = store.load();
        info!(
            path = %store.path().display(),
            fields = config.as_object().map_or(0, Map::len),
            "config loaded"
        );
        Self {
            store,
            config: RwLock::new(config),
            update_lock: Mutex::new(()),
            listener,
            local_port: AtomicU16::new(0),
        }
    }

    pub fn with_listener(store: ConfigStore, listener: &Arc<dyn CommandListener>) -> Self {
        Self::new(store, Some(Arc::downgrade(listener)))
    }

    /// Deep copy of the current config document.
    pub fn config(&self) -> Value {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Write the current document to storage.
    pub fn save(&self) -> Result<()> {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let doc = self.config();
        self.store.save(&doc)
    }

    /// Port the local server ended up listening on, reported by `Heartbeat`.
    pub fn set_local_port(&self, port: u16) {
        self.local_port.store(port, Ordering::Release);
    }

    pub fn local_port(&self) -> Option<u16> {
        match self.local_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    /// Handle one raw command request from any transport.
    pub fn dispatch(&self, raw: &[u8]) -> CommandResult {
        let envelope = match CommandEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "rejecting command");
                return CommandResult::error(&e);
            }
        };

        debug!(
            command = %envelope.command,
            response_code = envelope.response_code.as_deref().unwrap_or(""),
            "dispatching command"
        );

        let mut result = match envelope.command.as_str() {
            GET_CONFIG => self.handle_get_config(),
            SET_CONFIG => self.handle_set_config(&envelope),
            HEARTBEAT => self.handle_heartbeat(),
            _ => self.forward(&envelope),
        };
        result.response_code = envelope.response_code;
        result
    }

    /// Replace the whole document, persist it, then tell the listener.
    ///
    /// If the save fails the previous document is restored and the listener
    /// is not called.
    pub fn set_config(&self, new_config: Map<String, Value>) -> Result<(), CommandError> {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let new_config = Value::Object(new_config);
        let old_config = {
            let mut current = self.config.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, new_config.clone())
        };

        if let Err(e) = self.store.save(&new_config) {
            warn!(error = %format!("{e:#}"), "config save failed, keeping previous config");
            *self.config.write().unwrap_or_else(PoisonError::into_inner) = old_config;
            return Err(CommandError::SaveFailed(e.to_string()));
        }

        info!("config updated");
        if let Some(listener) = self.listener() {
            listener.on_config_change(&old_config, &new_config);
        }
        Ok(())
    }

    fn listener(&self) -> Option<Arc<dyn CommandListener>> {
        self.listener.as_ref().and_then(Weak::upgrade)
    }

    fn handle_get_config(&self) -> CommandResult {
        let body = match self.config() {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        CommandResult::success(body)
    }

    fn handle_set_config(&self, envelope: &CommandEnvelope) -> CommandResult {
        let new_config = match envelope.field(CONFIG_FIELD) {
            Some(Value::Object(map)) => map.clone(),
            _ => return CommandResult::error(&CommandError::MissingConfig),
        };

        match self.set_config(new_config) {
            Ok(()) => CommandResult::success(Map::new()),
            Err(e) => CommandResult::error(&e),
        }
    }

    fn handle_heartbeat(&self) -> CommandResult {
        let mut body = Map::new();
        body.insert("LocalIp".to_string(), Value::from(net::local_ip().to_string()));
        body.insert(
            "LocalPort".to_string(),
            self.local_port().map_or(Value::Null, Value::from),
        );
        CommandResult::success(body)
    }

    fn forward(&self, envelope: &CommandEnvelope) -> CommandResult {
        let mut response = Map::new();
        match self.listener() {
            Some(listener) => listener.on_command(&envelope.raw, &mut response),
            None => debug!(command = %envelope.command, "no listener for command"),
        }
        CommandResult::from_body(response)
    }
}
