use serde_json::{Map, Value};

/// Receiver for commands the router does not handle itself and for
/// configuration changes.
///
/// Both hooks run synchronously on whichever transport task received the
/// triggering request, so they must not block for long. `on_config_change`
/// is called while config updates are serialized; calling back into
/// `SetConfig` from it will deadlock. Reading the config is fine.
pub trait CommandListener: Send + Sync {
    /// Called after a new config has been applied and saved.
    fn on_config_change(&self, old: &Value, new: &Value);

    /// Called with the full request for unrecognized commands. `response`
    /// starts out empty; anything written to it, `Status` included, is
    /// returned to the caller.
    fn on_command(&self, request: &Value, response: &mut Map<String, Value>);
}
