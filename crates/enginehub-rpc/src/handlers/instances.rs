//! Instance selection, listing and session handlers.

use super::{caller_context, get_bool_param, require_str_param};
use crate::server::AppState;
use serde_json::{json, Value};

pub async fn set_active_instance(state: &AppState, params: &Value) -> enginehub_core::Result<Value> {
    let caller = caller_context(params);
    let identity = require_str_param(params, "instance", "instance")?;
    let descriptor = state.hub.set_active_instance(&caller, &identity).await?;
    Ok(json!({
        "client_id": caller.as_str(),
        "instance": descriptor,
    }))
}

pub async fn clear_active_instance(
    state: &AppState,
    params: &Value,
) -> enginehub_core::Result<Value> {
    let caller = caller_context(params);
    let cleared = state.hub.clear_active_instance(&caller);
    Ok(json!({
        "client_id": caller.as_str(),
        "cleared": cleared.map(|id| id.to_string()),
    }))
}

pub async fn get_active_instance(
    state: &AppState,
    params: &Value,
) -> enginehub_core::Result<Value> {
    let caller = caller_context(params);
    Ok(json!({
        "client_id": caller.as_str(),
        "instance": state.hub.active_instance(&caller).map(|id| id.to_string()),
    }))
}

pub async fn list_instances(state: &AppState, params: &Value) -> enginehub_core::Result<Value> {
    let force_refresh = get_bool_param(params, "force_refresh", "forceRefresh").unwrap_or(false);
    let instances = state.hub.list_instances(force_refresh).await?;
    Ok(serde_json::to_value(instances)?)
}

pub async fn list_capabilities(state: &AppState, params: &Value) -> enginehub_core::Result<Value> {
    let session_id = require_str_param(params, "session_id", "sessionId")?;
    Ok(serde_json::to_value(state.hub.list_capabilities(&session_id))?)
}

pub async fn list_sessions(state: &AppState, _params: &Value) -> enginehub_core::Result<Value> {
    Ok(serde_json::to_value(state.hub.list_sessions())?)
}
