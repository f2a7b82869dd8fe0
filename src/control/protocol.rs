//! Control message types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

/// Message type of every request.
pub const COMMAND_TYPE: &str = "AGENT_COMMAND";

/// Message type of every response.
pub const RESPONSE_TYPE: &str = "AGENT_RESPONSE";

/// A control request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlRequest {
    /// Message type.
    #[serde(rename = "type", default = "default_command_type")]
    pub kind: String,
    /// Method name. Older senders call it `action`.
    #[serde(alias = "action")]
    pub method: String,
    /// Positional (array) or named (object) arguments.
    #[serde(default)]
    pub args: Value,
    /// Echoed back on the response.
    #[serde(default, alias = "messageId")]
    pub correlation_id: Option<Value>,
}

fn default_command_type() -> String {
    COMMAND_TYPE.to_string()
}

impl ControlRequest {
    /// Create a new request.
    pub fn new(method: impl Into<String>, args: Value) -> Self {
        Self {
            kind: COMMAND_TYPE.to_string(),
            method: method.into(),
            args,
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<Value>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Argument by name, or by position when args is an array.
    pub fn arg(&self, index: usize, name: &str) -> Option<&Value> {
        match &self.args {
            Value::Array(items) => items.get(index),
            Value::Object(map) => map.get(name),
            Value::Null => None,
            // A bare scalar is the first argument.
            other if index == 0 => Some(other),
            _ => None,
        }
    }

    pub fn str_arg(&self, index: usize, name: &str) -> Result<&str, ValidationError> {
        self.arg(index, name)
            .and_then(Value::as_str)
            .ok_or_else(|| ValidationError::MissingArgument {
                name: name.to_string(),
            })
    }

    /// Integer argument; numeric strings are accepted.
    pub fn u64_arg(&self, index: usize, name: &str) -> Result<u64, ValidationError> {
        self.opt_u64_arg(index, name)?
            .ok_or_else(|| ValidationError::MissingArgument {
                name: name.to_string(),
            })
    }

    /// Like [`ControlRequest::u64_arg`], but absent or `null` is `None`.
    /// A present value that is not a whole non-negative number is an error.
    pub fn opt_u64_arg(&self, index: usize, name: &str) -> Result<Option<u64>, ValidationError> {
        let value = match self.arg(index, name) {
            None | Some(Value::Null) => return Ok(None),
            Some(value) => value,
        };
        let parsed = match value {
            Value::String(s) => s.trim().parse().ok(),
            other => other.as_u64(),
        };
        parsed
            .map(Some)
            .ok_or_else(|| ValidationError::InvalidArgument {
                name: name.to_string(),
                value: value.to_string(),
            })
    }
}

/// A control response. Exactly one of `result` and `error` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub method: String,
    pub correlation_id: Option<Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok(request: &ControlRequest, result: Value) -> Self {
        Self {
            kind: RESPONSE_TYPE.to_string(),
            method: request.method.clone(),
            correlation_id: request.correlation_id.clone(),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(request: &ControlRequest, error: impl std::fmt::Display) -> Self {
        Self {
            kind: RESPONSE_TYPE.to_string(),
            method: request.method.clone(),
            correlation_id: request.correlation_id.clone(),
            success: false,
            result: None,
            error: Some(error.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_request_accepts_action_and_message_id_aliases() {
        let request: ControlRequest = serde_json::from_value(json!({
            "type": "AGENT_COMMAND",
            "action": "setInterval",
            "args": [45],
            "messageId": "m-1"
        }))
        .unwrap();
        assert_eq!(request.method, "setInterval");
        assert_eq!(request.correlation_id, Some(json!("m-1")));
        assert_eq!(request.u64_arg(0, "seconds").unwrap(), 45);
    }

    #[test]
    fn test_named_and_scalar_args() {
        let named = ControlRequest::new("addActionRoute", json!({"action": "reflect", "path": "/r"}));
        assert_eq!(named.str_arg(0, "action").unwrap(), "reflect");
        assert_eq!(named.str_arg(1, "path").unwrap(), "/r");

        let scalar = ControlRequest::new("setInterval", json!("60"));
        assert_eq!(scalar.u64_arg(0, "seconds").unwrap(), 60);
        assert!(scalar.arg(1, "other").is_none());

        let empty = ControlRequest::new("getStatus", Value::Null);
        assert_eq!(
            empty.str_arg(0, "name"),
            Err(ValidationError::MissingArgument {
                name: "name".to_string()
            })
        );
    }

    #[test]
    fn test_integer_args_reject_wrong_kinds() {
        for bad in [json!([-5]), json!({"seconds": 5.5}), json!(["soon"]), json!([true])] {
            let request = ControlRequest::new("setInterval", bad.clone());
            assert!(
                matches!(
                    request.u64_arg(0, "seconds"),
                    Err(ValidationError::InvalidArgument { ref name, .. }) if name == "seconds"
                ),
                "{} should be rejected as invalid",
                bad
            );
        }

        let missing = ControlRequest::new("setInterval", json!({"other": 5}));
        assert_eq!(
            missing.u64_arg(0, "seconds"),
            Err(ValidationError::MissingArgument {
                name: "seconds".to_string()
            })
        );
        assert_eq!(missing.opt_u64_arg(0, "seconds"), Ok(None));
        assert_eq!(
            ControlRequest::new("getTemporalEvents", json!({"count": null})).opt_u64_arg(0, "count"),
            Ok(None)
        );
    }

    #[test]
    fn test_response_shape() {
        let request = ControlRequest::new("stop", Value::Null).with_correlation_id(7);
        let ok = serde_json::to_value(ControlResponse::ok(&request, json!({"status": "stopped"})))
            .unwrap();
        assert_eq!(ok["type"], "AGENT_RESPONSE");
        assert_eq!(ok["correlationId"], 7);
        assert_eq!(ok["success"], true);
        assert!(ok.get("error").is_none());

        let err = serde_json::to_value(ControlResponse::err(&request, "nope")).unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["error"], "nope");
        assert!(err.get("result").is_none());
    }
}
