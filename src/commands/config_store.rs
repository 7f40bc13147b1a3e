use anyhow::{Context, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_CONFIG_FILE: &str = "rapcomConfig.json";

/// On-disk home of the config document.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document. Anything short of a readable JSON object yields an
    /// empty object.
    pub fn load(&self) -> Value {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "no config file, starting empty");
                return Value::Object(Map::new());
            }
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(doc @ Value::Object(_)) => doc,
            Ok(_) => {
                warn!(path = %self.path.display(), "config root is not an object, starting empty");
                Value::Object(Map::new())
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config file is not valid JSON, starting empty");
                Value::Object(Map::new())
            }
        }
    }

    /// Overwrite the file with the compact serialization of `doc`.
    pub fn save(&self, doc: &Value) -> Result<()> {
        let json = serde_json::to_string(doc).context("serializing config")?;
        fs::write(&self.path, json)
            .with_context(|| format!("writing config to {}", self.path.display()))?;
        Ok(())
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_FILE)
    }
}
