//! Commands, responses and the built-in/custom command split.

use crate::config::is_builtin_command;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A command routed to one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    /// Opaque to the hub.
    pub params: Map<String, Value>,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_hint: Option<String>,
}

impl Command {
    pub fn new(name: impl Into<String>, params: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            params,
            correlation_id: Uuid::new_v4().to_string(),
            target_hint: None,
        }
    }

    /// Build a command from any JSON value; non-object params become empty.
    pub fn from_value(name: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self::new(name, params)
    }

    pub fn with_target(mut self, hint: Option<String>) -> Self {
        self.target_hint = hint;
        self
    }

    /// The same command under a fresh correlation id, for a retry attempt.
    pub fn reissue(&self) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }
}

/// Outcome reported by an instance.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Success(Value),
    Failure { message: String, data: Option<Value> },
}

/// Response correlated to a command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub correlation_id: String,
    pub outcome: CommandOutcome,
}

impl CommandResponse {
    pub fn success(correlation_id: impl Into<String>, payload: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            outcome: CommandOutcome::Success(payload),
        }
    }

    pub fn failure(
        correlation_id: impl Into<String>,
        message: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            outcome: CommandOutcome::Failure {
                message: message.into(),
                data,
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, CommandOutcome::Success(_))
    }
}

/// A command name resolved once per dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandTarget {
    /// One of the fixed commands every instance understands.
    Builtin(String),
    /// An announced capability, with params checked against its schema.
    Custom { name: String, params: Map<String, Value> },
}

impl CommandTarget {
    /// Built-in names need no capability lookup.
    pub fn builtin(name: &str) -> Option<Self> {
        is_builtin_command(name).then(|| CommandTarget::Builtin(name.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            CommandTarget::Builtin(name) => name,
            CommandTarget::Custom { name, .. } => name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_reissue_keeps_payload_and_changes_id() {
        let cmd = Command::from_value("manage_scene", json!({"action": "load"}))
            .with_target(Some("Alpha@111".into()));
        let retry = cmd.reissue();
        assert_ne!(cmd.correlation_id, retry.correlation_id);
        assert_eq!(cmd.params, retry.params);
        assert_eq!(retry.target_hint.as_deref(), Some("Alpha@111"));
    }

    #[test]
    fn test_non_object_params_become_empty() {
        let cmd = Command::from_value("ping", json!([1, 2]));
        assert!(cmd.params.is_empty());
    }

    #[test]
    fn test_builtin_classification() {
        assert_eq!(
            CommandTarget::builtin("ping"),
            Some(CommandTarget::Builtin("ping".into()))
        );
        assert_eq!(CommandTarget::builtin("bake_lighting"), None);
    }
}
