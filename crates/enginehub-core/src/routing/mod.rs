//! Target resolution and per-caller active-instance pins.
//!
//! Unhinted commands resolve to the caller's pin, then the configured default
//! instance, then the only live instance. With several live instances and no
//! pin the router fails with `AmbiguousTarget` rather than guessing.

mod source;

pub use source::{HubInstanceSource, InstanceSource};

use crate::config::RoutingConfig;
use crate::error::{HubError, Result};
use crate::models::{InstanceDescriptor, InstanceId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Scope of an active-instance pin, typically one client session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerContext(String);

impl CallerContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallerContext {
    fn default() -> Self {
        Self(RoutingConfig::DEFAULT_CALLER.to_string())
    }
}

impl fmt::Display for CallerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CallerContext {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Resolves target hints to live instances.
pub struct InstanceRouter {
    source: Arc<dyn InstanceSource>,
    pins: RwLock<HashMap<CallerContext, InstanceId>>,
    default_instance: Option<String>,
    resolve_wait: Duration,
    poll_interval: Duration,
}

impl InstanceRouter {
    pub fn new(source: Arc<dyn InstanceSource>) -> Self {
        Self {
            source,
            pins: RwLock::new(HashMap::new()),
            default_instance: None,
            resolve_wait: RoutingConfig::SESSION_RESOLVE_MAX_WAIT,
            poll_interval: RoutingConfig::SESSION_RESOLVE_POLL,
        }
    }

    /// Fallback pin for callers without one of their own.
    pub fn with_default_instance(mut self, hint: Option<String>) -> Self {
        self.default_instance = hint.filter(|h| !h.trim().is_empty());
        self
    }

    /// How long to wait for a missing instance to (re)appear.
    pub fn with_resolve_wait(mut self, wait: Duration) -> Self {
        self.resolve_wait = wait;
        self
    }

    pub async fn live_instances(&self, force_refresh: bool) -> Result<Vec<InstanceDescriptor>> {
        self.source.live_instances(force_refresh).await
    }

    /// Resolve a hint, or the caller's pin when there is none.
    ///
    /// Missing instances are polled for up to the resolve wait, so a command
    /// issued mid-reload lands once the instance is back. Ambiguity never waits.
    pub async fn resolve(
        &self,
        hint: Option<&str>,
        caller: &CallerContext,
    ) -> Result<InstanceDescriptor> {
        let hint = hint.map(str::trim).filter(|h| !h.is_empty());
        let started = Instant::now();
        let mut force_refresh = false;

        loop {
            let live = self.source.live_instances(force_refresh).await?;
            let can_wait = started.elapsed() < self.resolve_wait;

            let outcome = match hint {
                Some(hint) => match_hint(hint, &live),
                None => self.resolve_unhinted(caller, &live, can_wait),
            };

            match outcome {
                Err(HubError::NoInstance) | Err(HubError::UnknownInstance { .. }) if can_wait => {
                    let remaining = self.resolve_wait.saturating_sub(started.elapsed());
                    debug!(
                        "No match for {:?} yet; polling again ({:?} left)",
                        hint, remaining
                    );
                    tokio::time::sleep(self.poll_interval.min(remaining)).await;
                    force_refresh = true;
                }
                other => return other,
            }
        }
    }

    fn resolve_unhinted(
        &self,
        caller: &CallerContext,
        live: &[InstanceDescriptor],
        can_wait: bool,
    ) -> Result<InstanceDescriptor> {
        if let Some(pin) = self.active_pin(caller) {
            match live.iter().find(|d| d.id == pin) {
                Some(descriptor) => return Ok(descriptor.clone()),
                None if can_wait => {
                    return Err(HubError::UnknownInstance {
                        hint: pin.to_string(),
                        available: identities(live),
                    })
                }
                None => self.invalidate_pin(caller, &pin),
            }
        } else if let Some(default) = &self.default_instance {
            if let Ok(descriptor) = match_hint(default, live) {
                return Ok(descriptor);
            }
        }

        match live {
            [] => Err(HubError::NoInstance),
            [only] => Ok(only.clone()),
            _ => Err(HubError::AmbiguousTarget {
                available: identities(live),
            }),
        }
    }

    /// Pin `hint` for `caller` after checking it resolves live.
    pub async fn set_active(
        &self,
        caller: &CallerContext,
        hint: &str,
    ) -> Result<InstanceDescriptor> {
        let hint = hint.trim();
        if hint.is_empty() {
            return Err(HubError::InvalidParams {
                message: "instance identity must not be empty".to_string(),
            });
        }

        let descriptor = self.resolve(Some(hint), caller).await?;
        self.pins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(caller.clone(), descriptor.identity().clone());
        info!("Caller {} pinned to {}", caller, descriptor.identity());
        Ok(descriptor)
    }

    /// Remove the caller's pin, returning it.
    pub fn clear_active(&self, caller: &CallerContext) -> Option<InstanceId> {
        self.pins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(caller)
    }

    pub fn active_pin(&self, caller: &CallerContext) -> Option<InstanceId> {
        self.pins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(caller)
            .cloned()
    }

    pub fn clear_all(&self) {
        self.pins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn invalidate_pin(&self, caller: &CallerContext, pin: &InstanceId) {
        let mut pins = self.pins.write().unwrap_or_else(PoisonError::into_inner);
        if pins.get(caller) == Some(pin) {
            pins.remove(caller);
            info!("Pinned instance {} for caller {} is gone; pin cleared", pin, caller);
        }
    }
}

fn identities(live: &[InstanceDescriptor]) -> Vec<String> {
    let mut ids: Vec<String> = live.iter().map(|d| d.id.to_string()).collect();
    ids.sort();
    ids
}

/// Match a hint against the live set.
///
/// Accepts `name@hash`, a bare hash, or a name that matches exactly one
/// instance. A name shared by several instances is ambiguous.
pub fn match_hint(hint: &str, live: &[InstanceDescriptor]) -> Result<InstanceDescriptor> {
    if let Some(found) = live.iter().find(|d| d.id.to_string() == hint) {
        return Ok(found.clone());
    }

    let by_hash: Vec<&InstanceDescriptor> = live.iter().filter(|d| d.hash == hint).collect();
    if let [only] = by_hash.as_slice() {
        return Ok((*only).clone());
    }

    let by_name: Vec<&InstanceDescriptor> = live.iter().filter(|d| d.name == hint).collect();
    match by_name.as_slice() {
        [only] => Ok((*only).clone()),
        [] => Err(HubError::UnknownInstance {
            hint: hint.to_string(),
            available: identities(live),
        }),
        many => {
            let mut available: Vec<String> = many.iter().map(|d| d.id.to_string()).collect();
            available.sort();
            Err(HubError::AmbiguousTarget { available })
        }
    }
}
