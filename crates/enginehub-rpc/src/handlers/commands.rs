//! Command dispatch handler.

use super::{caller_context, get_f64_param, get_str_param, require_str_param};
use crate::server::AppState;
use enginehub_core::HubError;
use serde_json::{json, Value};
use std::time::Duration;

/// `dispatch {command, params?, target?, timeout?}`
///
/// `timeout` (seconds) bounds the whole dispatch, retries included.
pub async fn dispatch(state: &AppState, params: &Value) -> enginehub_core::Result<Value> {
    let caller = caller_context(params);
    let command = require_str_param(params, "command", "command")?;
    let target = get_str_param(params, "target", "target")
        .or_else(|| get_str_param(params, "instance", "instance"));

    let command_params = match params.get("params") {
        None | Some(Value::Null) => json!({}),
        Some(value @ Value::Object(_)) => value.clone(),
        Some(_) => {
            return Err(HubError::InvalidParams {
                message: "'params' must be an object".to_string(),
            })
        }
    };

    match caller_timeout(params)? {
        Some(timeout) => {
            state
                .hub
                .dispatch_with_timeout(&caller, &command, command_params, target, timeout)
                .await
        }
        None => {
            state
                .hub
                .dispatch(&caller, &command, command_params, target)
                .await
        }
    }
}

/// The optional `timeout` parameter as a duration.
fn caller_timeout(params: &Value) -> enginehub_core::Result<Option<Duration>> {
    let Some(secs) = get_f64_param(params, "timeout", "timeout") else {
        return Ok(None);
    };
    let invalid = || HubError::InvalidParams {
        message: "'timeout' must be a positive number of seconds".to_string(),
    };
    if secs <= 0.0 {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;
    use enginehub_core::ErrorKind;

    #[test]
    fn test_caller_timeout_accepts_positive_seconds() {
        assert_eq!(caller_timeout(&json!({})).unwrap(), None);
        assert_eq!(
            caller_timeout(&json!({"timeout": 2.5})).unwrap(),
            Some(Duration::from_millis(2500))
        );
    }

    #[test]
    fn test_caller_timeout_rejects_unrepresentable_values() {
        for bad in [json!(1e20), json!(f64::MAX), json!(0), json!(-1)] {
            let err = caller_timeout(&json!({ "timeout": bad })).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParams);
        }
    }
}
