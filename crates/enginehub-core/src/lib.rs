//! EngineHub Core - command routing for running engine instances.
//!
//! Routes commands to one of several concurrently running engine instances.
//! Instances are reached either over a connect-per-call framed socket (found by
//! scanning status files) or over a long-lived channel the instance opens to the
//! hub. Callers can pin an instance per context; commands are retried on
//! transient send failures; custom commands are validated against what each
//! session announced.
//!
//! # Example
//!
//! ```rust,ignore
//! use enginehub_core::{CallerContext, EngineHub, HubSettings};
//!
//! #[tokio::main]
//! async fn main() -> enginehub_core::Result<()> {
//!     let hub = EngineHub::builder(HubSettings::from_env())
//!         .channel_listener("127.0.0.1:0")
//!         .build()
//!         .await?;
//!
//!     let caller = CallerContext::default();
//!     for instance in hub.list_instances(false).await? {
//!         println!("{} ({:?})", instance.id, instance.status);
//!     }
//!
//!     hub.set_active_instance(&caller, "MyGame@1a2b3c").await?;
//!     let state = hub
//!         .dispatch(&caller, "get_editor_state", serde_json::json!({}), None)
//!         .await?;
//!     println!("{state}");
//!
//!     hub.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod registry;
pub mod routing;
pub mod transport;

mod builder;

pub use builder::EngineHubBuilder;
pub use config::HubSettings;
pub use discovery::{InstanceDiscovery, LivenessProbe};
pub use dispatch::{CommandDispatcher, DispatchReceipt, RetryPolicy};
pub use error::{ErrorKind, HubError, Result};
pub use models::{
    CapabilityDescriptor, Command, InstanceDescriptor, InstanceId, InstanceStatus,
    ParameterDescriptor, SessionSummary,
};
pub use registry::{CapabilityRegistry, ConnectionRegistry};
pub use routing::{CallerContext, InstanceRouter};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::info;
use transport::{SessionChannelClient, SessionListenerHandle};

/// Shared state behind an `EngineHub`.
pub(crate) struct HubInner {
    pub(crate) settings: HubSettings,
    pub(crate) discovery: Arc<InstanceDiscovery>,
    pub(crate) capabilities: Arc<CapabilityRegistry>,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) router: Arc<InstanceRouter>,
    pub(crate) dispatcher: CommandDispatcher,
    pub(crate) listener: Mutex<Option<SessionListenerHandle>>,
}

/// Caller-facing entry point. Cheap to clone.
#[derive(Clone)]
pub struct EngineHub {
    pub(crate) inner: Arc<HubInner>,
}

impl EngineHub {
    pub fn builder(settings: HubSettings) -> EngineHubBuilder {
        EngineHubBuilder::new(settings)
    }

    /// Hub with default settings and no channel listener.
    pub async fn new(settings: HubSettings) -> Result<Self> {
        EngineHubBuilder::new(settings).build().await
    }

    pub fn settings(&self) -> &HubSettings {
        &self.inner.settings
    }

    /// Address instances connect their channels to, if listening.
    pub fn channel_addr(&self) -> Option<SocketAddr> {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|l| l.addr())
    }

    /// Send `command_name` with `params` and return the instance's payload.
    pub async fn dispatch(
        &self,
        caller: &CallerContext,
        command_name: &str,
        params: serde_json::Value,
        target_hint: Option<&str>,
    ) -> Result<serde_json::Value> {
        let command = Command::from_value(command_name, params)
            .with_target(target_hint.map(str::to_string));
        self.dispatch_command(command, caller, None)
            .await
            .map(|receipt| receipt.payload)
    }

    /// Like [`dispatch`](Self::dispatch), bounded by a caller-imposed timeout.
    ///
    /// On expiry the in-flight send is cancelled and its waiter released.
    pub async fn dispatch_with_timeout(
        &self,
        caller: &CallerContext,
        command_name: &str,
        params: serde_json::Value,
        target_hint: Option<&str>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let command = Command::from_value(command_name, params)
            .with_target(target_hint.map(str::to_string));
        let name = command.name.clone();

        tokio::time::timeout(timeout, self.dispatch_command(command, caller, Some(timeout)))
            .await
            .map_err(|_| HubError::Timeout {
                operation: format!("dispatch of '{}'", name),
                after: timeout,
            })?
            .map(|receipt| receipt.payload)
    }

    /// Dispatch a prepared command and report where it was delivered.
    pub async fn dispatch_command(
        &self,
        command: Command,
        caller: &CallerContext,
        timeout: Option<Duration>,
    ) -> Result<DispatchReceipt> {
        self.inner.dispatcher.dispatch(command, caller, timeout).await
    }

    /// Pin `identity` for unhinted commands from `caller`.
    pub async fn set_active_instance(
        &self,
        caller: &CallerContext,
        identity: &str,
    ) -> Result<InstanceDescriptor> {
        self.inner.router.set_active(caller, identity).await
    }

    pub fn clear_active_instance(&self, caller: &CallerContext) -> Option<InstanceId> {
        self.inner.router.clear_active(caller)
    }

    pub fn active_instance(&self, caller: &CallerContext) -> Option<InstanceId> {
        self.inner.router.active_pin(caller)
    }

    /// Every live instance, over either transport.
    pub async fn list_instances(&self, force_refresh: bool) -> Result<Vec<InstanceDescriptor>> {
        self.inner.router.live_instances(force_refresh).await
    }

    /// Capabilities announced by a session; empty for unknown sessions.
    pub fn list_capabilities(&self, session_id: &str) -> Vec<CapabilityDescriptor> {
        self.inner.capabilities.list(session_id)
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        self.inner.connections.list_sessions()
    }

    /// Live channel for a session id.
    pub fn session_channel(&self, session_id: &str) -> Option<Arc<SessionChannelClient>> {
        self.inner
            .connections
            .lookup(registry::SessionKey::Session(session_id))
    }

    pub fn discovery(&self) -> &Arc<InstanceDiscovery> {
        &self.inner.discovery
    }

    /// Stop the listener, close every channel and clear all routing state.
    ///
    /// Commands pending on a closed channel fail with a connection error.
    pub fn shutdown(&self) {
        if let Some(mut listener) = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            listener.shutdown();
        }

        let channels = self.inner.connections.drain();
        let closed = channels.len();
        for channel in channels {
            channel.close();
        }

        self.inner.router.clear_all();
        self.inner.discovery.invalidate();
        info!("Engine hub shut down ({} session(s) closed)", closed);
    }
}
