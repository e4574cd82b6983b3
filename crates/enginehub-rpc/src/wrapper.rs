//! Response wrapping for RPC clients.
//!
//! Clients expect `{success: bool, ...}` envelopes with list results under a
//! named key. Command payloads pass through untouched.

use serde_json::{json, Value};

/// Wrap API responses in the envelope clients expect.
pub fn wrap_response(method: &str, result: Value) -> Value {
    match method {
        "list_instances" => list_envelope("instances", result),
        "list_sessions" => list_envelope("sessions", result),
        "list_capabilities" => list_envelope("capabilities", result),

        "set_active_instance" | "clear_active_instance" | "get_active_instance" => {
            let mut wrapped = json!({"success": true});
            if let (Some(target), Value::Object(fields)) = (wrapped.as_object_mut(), result) {
                target.extend(fields);
            }
            wrapped
        }

        // Instance payloads are returned as-is
        _ => result,
    }
}

fn list_envelope(key: &str, result: Value) -> Value {
    let items = if result.is_null() { json!([]) } else { result };
    let mut wrapped = json!({"success": true});
    wrapped[key] = items;
    wrapped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_methods_are_wrapped() {
        let wrapped = wrap_response("list_instances", json!([{"id": "Alpha@111"}]));
        assert_eq!(wrapped["success"], true);
        assert_eq!(wrapped["instances"][0]["id"], "Alpha@111");

        let empty = wrap_response("list_sessions", Value::Null);
        assert_eq!(empty["sessions"], json!([]));
    }

    #[test]
    fn test_selection_fields_are_merged() {
        let wrapped = wrap_response(
            "clear_active_instance",
            json!({"client_id": "global", "cleared": "Alpha@111"}),
        );
        assert_eq!(wrapped["success"], true);
        assert_eq!(wrapped["cleared"], "Alpha@111");
    }

    #[test]
    fn test_dispatch_payload_passes_through() {
        let payload = json!({"hierarchy": []});
        assert_eq!(wrap_response("dispatch", payload.clone()), payload);
    }
}
