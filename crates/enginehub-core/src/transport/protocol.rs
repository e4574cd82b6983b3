//! Message types carried inside frames.
//!
//! The framed transport exchanges one `FramedRequest` for one `FramedReply`.
//! Channel sessions exchange `InstanceMessage` / `HubMessage`, tagged by
//! `"type"`.

use crate::error::{HubError, Result};
use crate::models::{CapabilityDescriptor, Command, CommandResponse};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Request body on the framed transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramedRequest {
    #[serde(rename = "type")]
    pub command: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl FramedRequest {
    pub fn from_command(command: &Command) -> Self {
        Self {
            command: command.name.clone(),
            params: command.params.clone(),
            id: Some(command.correlation_id.clone()),
        }
    }

    pub fn ping() -> Self {
        Self {
            command: "ping".to_string(),
            params: Map::new(),
            id: None,
        }
    }
}

/// Response body on the framed transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramedReply {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl FramedReply {
    pub fn success(result: Value) -> Self {
        Self {
            status: "success".to_string(),
            result: Some(result),
            error: None,
            message: None,
            data: None,
        }
    }

    /// Convert into a correlated response.
    pub fn into_response(self, correlation_id: &str) -> Result<CommandResponse> {
        match self.status.as_str() {
            "success" => Ok(CommandResponse::success(
                correlation_id,
                self.result.unwrap_or(Value::Null),
            )),
            "error" => {
                let message = self
                    .error
                    .or(self.message)
                    .unwrap_or_else(|| "unknown error".to_string());
                Ok(CommandResponse::failure(correlation_id, message, self.data))
            }
            other => Err(HubError::protocol(format!(
                "unexpected response status '{}'",
                other
            ))),
        }
    }

    /// Whether this reply is a successful pong.
    pub fn is_pong(&self) -> bool {
        self.status == "success"
            && self
                .result
                .as_ref()
                .and_then(|r| r.get("message"))
                .and_then(Value::as_str)
                == Some("pong")
    }
}

/// Frames sent by an instance over its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceMessage {
    Register {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        instance_name: String,
        #[serde(default)]
        instance_hash: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        engine_version: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        project_path: Option<String>,
        #[serde(default)]
        capabilities: Vec<CapabilityDescriptor>,
    },
    CommandResult {
        id: String,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Unregister {},
    CapabilitiesChanged {
        #[serde(default)]
        capabilities: Vec<CapabilityDescriptor>,
    },
    Pong {},
}

impl InstanceMessage {
    pub fn decode(frame: &[u8]) -> Result<Self> {
        serde_json::from_slice(frame)
            .map_err(|e| HubError::protocol(format!("invalid channel frame: {}", e)))
    }
}

/// Frames sent by the hub to an instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    /// Handshake acknowledgement carrying the effective session id.
    Registered { session_id: String },
    Execute {
        id: String,
        name: String,
        params: Map<String, Value>,
        /// Seconds the instance may spend on the command.
        timeout: f64,
    },
    Ping {},
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_register_frame_parses_with_defaults() {
        let msg = InstanceMessage::decode(
            br#"{"type":"register","instance_name":"Alpha","instance_hash":"111"}"#,
        )
        .unwrap();
        match msg {
            InstanceMessage::Register {
                session_id,
                instance_hash,
                capabilities,
                ..
            } => {
                assert!(session_id.is_none());
                assert_eq!(instance_hash, "111");
                assert!(capabilities.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_unregister_parses_without_body() {
        let msg = InstanceMessage::decode(br#"{"type":"unregister"}"#).unwrap();
        assert_eq!(msg, InstanceMessage::Unregister {});
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = InstanceMessage::decode(br#"{"type":"teleport"}"#).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }

    #[test]
    fn test_execute_is_tagged() {
        let msg = HubMessage::Execute {
            id: "c-1".into(),
            name: "ping".into(),
            params: Map::new(),
            timeout: 2.0,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "execute");
        assert_eq!(value["name"], "ping");
    }

    #[test]
    fn test_reply_conversion() {
        let ok = FramedReply::success(json!({"message": "pong"}));
        assert!(ok.is_pong());
        assert!(ok.into_response("c-1").unwrap().is_success());

        let failed: FramedReply =
            serde_json::from_value(json!({"status": "error", "message": "no scene"})).unwrap();
        let resp = failed.into_response("c-2").unwrap();
        assert!(!resp.is_success());

        let weird: FramedReply = serde_json::from_value(json!({"status": "maybe"})).unwrap();
        assert!(weird.into_response("c-3").is_err());
    }
}
