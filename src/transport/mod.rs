pub mod controller;
pub mod http_polling;

use serde_json::{Map, Value};
use thiserror::Error;

pub const STATUS_FIELD: &str = "Status";
pub const ERROR_TEXT_FIELD: &str = "ErrorText";
pub const COMMAND_FIELD: &str = "Command";
pub const RESPONSE_CODE_FIELD: &str = "ResponseCode";

/// Outcome reported in a result's `Status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Success,
    Error,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Success => "Success",
            CommandStatus::Error => "Error",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "Success" => Some(CommandStatus::Success),
            "Error" => Some(CommandStatus::Error),
            _ => None,
        }
    }
}

/// Protocol-level failures. The display text is what goes out as `ErrorText`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("Parse Error")]
    Parse,
    #[error("Failed to find Command")]
    MissingCommand,
    #[error("Failed to find new config")]
    MissingConfig,
    #[error("Failed to save config: {0}")]
    SaveFailed(String),
}

/// An inbound command request.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub command: String,
    /// Correlation token for relay responses; absent for local requests.
    pub response_code: Option<String>,
    /// The complete request object, payload fields included.
    pub raw: Value,
}

impl CommandEnvelope {
    pub fn parse(bytes: &[u8]) -> Result<Self, CommandError> {
        let raw: Value = serde_json::from_slice(bytes).map_err(|_| CommandError::Parse)?;
        let command = raw
            .get(COMMAND_FIELD)
            .and_then(Value::as_str)
            .ok_or(CommandError::MissingCommand)?
            .to_string();

        let response_code = match raw.get(RESPONSE_CODE_FIELD) {
            Some(Value::String(code)) => Some(code.clone()),
            Some(Value::Number(code)) => Some(code.to_string()),
            _ => None,
        }
        .filter(|code| !code.is_empty());

        Ok(Self {
            command,
            response_code,
            raw,
        })
    }

    /// A payload field such as `Value1`.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.raw.get(name)
    }
}

/// The outbound counterpart of a [`CommandEnvelope`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
    /// `None` when nobody handled the command.
    pub status: Option<CommandStatus>,
    pub error_text: Option<String>,
    /// Command-specific result fields.
    pub body: Map<String, Value>,
    /// Echo of the request's response code.
    pub response_code: Option<String>,
}

impl CommandResult {
    pub fn success(body: Map<String, Value>) -> Self {
        Self {
            status: Some(CommandStatus::Success),
            body,
            ..Self::default()
        }
    }

    pub fn error(err: &CommandError) -> Self {
        Self {
            status: Some(CommandStatus::Error),
            error_text: Some(err.to_string()),
            ..Self::default()
        }
    }

    /// Build a result from a wire object, lifting `Status` and `ErrorText`
    /// out of the body when they carry protocol values.
    pub fn from_body(mut body: Map<String, Value>) -> Self {
        let status = body
            .get(STATUS_FIELD)
            .and_then(Value::as_str)
            .and_then(CommandStatus::parse);
        if status.is_some() {
            body.remove(STATUS_FIELD);
        }
        let error_text = match body.remove(ERROR_TEXT_FIELD) {
            Some(Value::String(text)) => Some(text),
            Some(other) => {
                body.insert(ERROR_TEXT_FIELD.to_string(), other);
                None
            }
            None => None,
        };

        Self {
            status,
            error_text,
            body,
            response_code: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Some(CommandStatus::Success)
    }

    /// `Status` and `ErrorText` are reserved: when set they replace any body
    /// field of the same name.
    pub fn to_value(&self) -> Value {
        let mut out = self.body.clone();
        if let Some(status) = self.status {
            out.insert(STATUS_FIELD.to_string(), Value::from(status.as_str()));
        }
        if let Some(text) = &self.error_text {
            out.insert(ERROR_TEXT_FIELD.to_string(), Value::from(text.as_str()));
        }
        Value::Object(out)
    }

    /// Compact JSON as sent on the wire.
    pub fn to_json_string(&self) -> String {
        self.to_value().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_reads_command_and_string_response_code() {
        let env = CommandEnvelope::parse(br#"{"Command":"GetConfig","ResponseCode":"abc"}"#).unwrap();
        assert_eq!(env.command, "GetConfig");
        assert_eq!(env.response_code.as_deref(), Some("abc"));
    }

    #[test]
    fn numeric_response_code_becomes_decimal_string() {
        let env = CommandEnvelope::parse(br#"{"Command":"X","ResponseCode":12345678901234}"#).unwrap();
        assert_eq!(env.response_code.as_deref(), Some("12345678901234"));
    }

    #[test]
    fn missing_or_odd_response_code_is_absent() {
        let env = CommandEnvelope::parse(br#"{"Command":"X"}"#).unwrap();
        assert!(env.response_code.is_none());
        let env = CommandEnvelope::parse(br#"{"Command":"X","ResponseCode":true}"#).unwrap();
        assert!(env.response_code.is_none());
        let env = CommandEnvelope::parse(br#"{"Command":"X","ResponseCode":""}"#).unwrap();
        assert!(env.response_code.is_none());
    }

    #[test]
    fn parse_errors_are_classified() {
        assert_eq!(CommandEnvelope::parse(b"{nope").unwrap_err(), CommandError::Parse);
        assert_eq!(
            CommandEnvelope::parse(br#"{"Value1":{}}"#).unwrap_err(),
            CommandError::MissingCommand
        );
        assert_eq!(
            CommandEnvelope::parse(br#"{"Command":7}"#).unwrap_err(),
            CommandError::MissingCommand
        );
    }

    #[test]
    fn error_result_serializes_status_and_text() {
        let v = CommandResult::error(&CommandError::Parse).to_value();
        assert_eq!(v, json!({"Status": "Error", "ErrorText": "Parse Error"}));
    }

    #[test]
    fn unhandled_result_serializes_empty_object() {
        assert_eq!(CommandResult::default().to_json_string(), "{}");
    }

    #[test]
    fn from_body_lifts_protocol_fields() {
        let body = json!({"Status": "Success", "LocalPort": 80})
            .as_object()
            .cloned()
            .unwrap();
        let res = CommandResult::from_body(body);
        assert!(res.is_success());
        assert_eq!(res.body.get("LocalPort"), Some(&json!(80)));
        assert!(res.body.get("Status").is_none());

        let body = json!({"Status": "Pending"}).as_object().cloned().unwrap();
        let res = CommandResult::from_body(body);
        assert!(res.status.is_none());
        assert_eq!(res.body.get("Status"), Some(&json!("Pending")));
    }

    #[test]
    fn status_and_error_text_are_reserved_keys() {
        let body = json!({"Status": "Idle", "ErrorText": "stale", "mode": 1})
            .as_object()
            .cloned()
            .unwrap();
        let mut res = CommandResult::success(body);
        res.error_text = Some("late".to_string());

        let wire = res.to_value();
        assert_eq!(wire, json!({"Status": "Success", "ErrorText": "late", "mode": 1}));

        // Read back, the reserved keys are lifted out of the body again.
        let back = CommandResult::from_body(wire.as_object().cloned().unwrap());
        assert!(back.is_success());
        assert_eq!(back.error_text.as_deref(), Some("late"));
        assert_eq!(Value::Object(back.body), json!({"mode": 1}));
    }
}
