//! Per-session capability announcements and dispatch-time validation.

use crate::error::{HubError, Result};
use crate::models::{CapabilityDescriptor, Command, CommandTarget};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Capabilities announced by each channel session.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    by_session: RwLock<HashMap<String, Vec<CapabilityDescriptor>>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the full capability set for a session.
    pub fn announce(&self, session_id: &str, capabilities: Vec<CapabilityDescriptor>) {
        debug!(
            "Session {} announced {} capabilities",
            session_id,
            capabilities.len()
        );
        self.by_session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string(), capabilities);
    }

    /// Current capabilities of a session; empty when the session is unknown.
    pub fn list(&self, session_id: &str) -> Vec<CapabilityDescriptor> {
        self.by_session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop every capability of a session.
    pub fn purge(&self, session_id: &str) -> bool {
        self.by_session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some()
    }

    pub fn clear(&self) {
        self.by_session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Classify a command for a target and check custom commands against the
    /// session's announced schema.
    ///
    /// Declared defaults are filled in for absent parameters. Instances reached
    /// without a session announce nothing, so only built-ins reach them.
    pub fn resolve_target(&self, session_id: Option<&str>, command: &Command) -> Result<CommandTarget> {
        if let Some(builtin) = CommandTarget::builtin(&command.name) {
            return Ok(builtin);
        }

        let invalid = |message: String| HubError::InvalidCapability {
            command: command.name.clone(),
            session_id: session_id.map(str::to_string),
            message,
        };

        let session_id = session_id.ok_or_else(|| {
            invalid("the target instance has no session and announces no custom commands".into())
        })?;

        let sessions = self.by_session.read().unwrap_or_else(PoisonError::into_inner);
        let announced = sessions.get(session_id).map(Vec::as_slice).unwrap_or(&[]);

        let capability = announced
            .iter()
            .find(|c| c.name == command.name)
            .ok_or_else(|| {
                let names: Vec<&str> = announced.iter().map(|c| c.name.as_str()).collect();
                invalid(format!(
                    "not announced by session {}; announced: [{}]",
                    session_id,
                    names.join(", ")
                ))
            })?;

        let mut params = command.params.clone();
        for param in &capability.parameters {
            if params.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) => {
                    params.insert(param.name.clone(), default.clone());
                }
                None if param.required => {
                    return Err(invalid(format!(
                        "missing required parameter '{}'",
                        param.name
                    )));
                }
                None => {}
            }
        }

        Ok(CommandTarget::Custom {
            name: command.name.clone(),
            params,
        })
    }
}
