//! JSON-RPC request handlers, split by domain.

mod commands;
mod instances;

use crate::server::AppState;
use crate::wrapper::wrap_response;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use enginehub_core::{CallerContext, HubError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

// ============================================================================
// JSON-RPC types
// ============================================================================

/// JSON-RPC 2.0 request structure.
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 response structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 error structure.
#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: String) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            result: None,
            error: Some(JsonRpcError {
                code,
                message,
                data: None,
            }),
            id,
        }
    }

    /// Error response carrying the hub's error kind and, where relevant,
    /// the identities a caller can pick from.
    pub fn from_hub_error(id: Option<Value>, err: &HubError) -> Self {
        let mut data = json!({ "kind": err.kind().as_str() });
        if let Some(available) = err.available_instances() {
            data["available"] = json!(available);
        }
        if let HubError::Remote {
            data: Some(remote), ..
        } = err.root_cause()
        {
            data["remote"] = remote.clone();
        }

        let mut response = Self::error(id, err.to_rpc_error_code(), err.to_string());
        if let Some(error) = response.error.as_mut() {
            error.data = Some(data);
        }
        response
    }
}

// ============================================================================
// Parameter extraction helpers
// ============================================================================

/// Extract an optional string parameter, supporting both snake_case and camelCase.
pub(crate) fn get_str_param<'a>(params: &'a Value, snake: &str, camel: &str) -> Option<&'a str> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_str())
}

/// Extract a required string parameter or return an error.
pub(crate) fn require_str_param(
    params: &Value,
    snake: &str,
    camel: &str,
) -> enginehub_core::Result<String> {
    get_str_param(params, snake, camel)
        .map(String::from)
        .ok_or_else(|| HubError::InvalidParams {
            message: format!("Missing required parameter: {}", snake),
        })
}

/// Extract an optional bool parameter, supporting both snake_case and camelCase.
pub(crate) fn get_bool_param(params: &Value, snake: &str, camel: &str) -> Option<bool> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_bool())
}

/// Extract an optional float parameter, supporting both snake_case and camelCase.
pub(crate) fn get_f64_param(params: &Value, snake: &str, camel: &str) -> Option<f64> {
    params
        .get(snake)
        .or_else(|| params.get(camel))
        .and_then(|v| v.as_f64())
}

/// Caller context named by `client_id`, or the shared global one.
pub(crate) fn caller_context(params: &Value) -> CallerContext {
    match get_str_param(params, "client_id", "clientId") {
        Some(id) if !id.trim().is_empty() => CallerContext::new(id.trim()),
        _ => CallerContext::default(),
    }
}

// ============================================================================
// HTTP endpoints
// ============================================================================

/// Health check endpoint.
pub async fn handle_health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Main JSON-RPC handler.
pub async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    Json(request): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    let method = &request.method;
    let params = request.params.unwrap_or(Value::Object(Default::default()));
    let id = request.id.clone();

    debug!("RPC call: {}({:?})", method, params);

    if method == "health_check" {
        let sessions = state.hub.list_sessions().len();
        return (
            StatusCode::OK,
            Json(JsonRpcResponse::success(
                id,
                json!({"status": "ok", "sessions": sessions}),
            )),
        );
    }

    let result = dispatch_method(&state, method, &params).await;

    match result {
        Ok(value) => {
            let wrapped = wrap_response(method, value);
            (StatusCode::OK, Json(JsonRpcResponse::success(id, wrapped)))
        }
        Err(e) => {
            error!("RPC error for {}: {}", method, e);
            (StatusCode::OK, Json(JsonRpcResponse::from_hub_error(id, &e)))
        }
    }
}

// ============================================================================
// Method dispatcher
// ============================================================================

/// Dispatch a method call to the appropriate domain handler.
async fn dispatch_method(
    state: &AppState,
    method: &str,
    params: &Value,
) -> enginehub_core::Result<Value> {
    match method {
        // Commands
        "dispatch" => commands::dispatch(state, params).await,

        // Instances & sessions
        "set_active_instance" => instances::set_active_instance(state, params).await,
        "clear_active_instance" => instances::clear_active_instance(state, params).await,
        "get_active_instance" => instances::get_active_instance(state, params).await,
        "list_instances" => instances::list_instances(state, params).await,
        "list_capabilities" => instances::list_capabilities(state, params).await,
        "list_sessions" => instances::list_sessions(state, params).await,

        _ => {
            warn!("Method not found: {}", method);
            Err(HubError::Other(format!("Method not found: {}", method)))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_rpc_response_success() {
        let response = JsonRpcResponse::success(Some(json!(1)), json!({"data": "test"}));
        assert!(response.error.is_none());
        assert!(response.result.is_some());
    }

    #[test]
    fn test_hub_error_carries_kind_and_available() {
        let err = HubError::AmbiguousTarget {
            available: vec!["Alpha@111".into(), "Beta@222".into()],
        };
        let response = JsonRpcResponse::from_hub_error(Some(json!(7)), &err);
        let error = response.error.unwrap();

        assert_eq!(error.code, -32002);
        let data = error.data.unwrap();
        assert_eq!(data["kind"], "ambiguous_target");
        assert_eq!(data["available"], json!(["Alpha@111", "Beta@222"]));
    }

    #[test]
    fn test_remote_failure_data_is_forwarded() {
        let err = HubError::Remote {
            command: "manage_scene".into(),
            message: "scene not found".into(),
            data: Some(json!({"path": "Assets/Missing.unity"})),
        };
        let response = JsonRpcResponse::from_hub_error(None, &err);
        let data = response.error.unwrap().data.unwrap();
        assert_eq!(data["remote"]["path"], "Assets/Missing.unity");
    }

    #[test]
    fn test_caller_context_accepts_both_spellings() {
        assert_eq!(caller_context(&json!({"client_id": "a"})).as_str(), "a");
        assert_eq!(caller_context(&json!({"clientId": "b"})).as_str(), "b");
        assert_eq!(caller_context(&json!({"client_id": "  "})).as_str(), "global");
        assert_eq!(caller_context(&json!({})).as_str(), "global");
    }

    #[test]
    fn test_require_str_param_reports_snake_name() {
        let err = require_str_param(&json!({}), "session_id", "sessionId").unwrap_err();
        assert!(err.to_string().contains("session_id"));
    }
}
