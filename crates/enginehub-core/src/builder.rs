//! Builder for configuring `EngineHub` initialization.

use crate::config::HubSettings;
use crate::discovery::{InstanceDiscovery, LivenessProbe};
use crate::dispatch::{CommandDispatcher, HubTransports, RetryPolicy};
use crate::error::Result;
use crate::registry::{CapabilityRegistry, ConnectionRegistry};
use crate::routing::{HubInstanceSource, InstanceRouter};
use crate::transport::SessionListener;
use crate::{EngineHub, HubInner};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Builder for configuring `EngineHub` initialization.
///
/// # Example
///
/// ```rust,ignore
/// use enginehub_core::{EngineHub, HubSettings};
///
/// let hub = EngineHub::builder(HubSettings::from_env())
///     .channel_listener("127.0.0.1:6500")
///     .build()
///     .await?;
/// ```
pub struct EngineHubBuilder {
    settings: HubSettings,
    channel_addr: Option<String>,
    probe: Option<Arc<dyn LivenessProbe>>,
    retry: Option<RetryPolicy>,
}

impl EngineHubBuilder {
    pub fn new(settings: HubSettings) -> Self {
        Self {
            settings,
            channel_addr: None,
            probe: None,
            retry: None,
        }
    }

    /// Accept instance channels on `addr`. Port 0 picks a free port.
    ///
    /// Default: no listener (framed instances only).
    pub fn channel_listener(mut self, addr: impl Into<String>) -> Self {
        self.channel_addr = Some(addr.into());
        self
    }

    /// Replace the framed ping used to validate discovered instances.
    pub fn liveness_probe(mut self, probe: Arc<dyn LivenessProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Default: [`RetryPolicy::default`] with the settings' reload wait.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Construct the services and start the channel listener, if any.
    pub async fn build(self) -> Result<EngineHub> {
        let settings = self.settings;

        let discovery = Arc::new(match self.probe {
            Some(probe) => InstanceDiscovery::with_probe(&settings, probe),
            None => InstanceDiscovery::new(&settings),
        });
        let capabilities = Arc::new(CapabilityRegistry::new());
        let connections = Arc::new(ConnectionRegistry::new(capabilities.clone()));

        let source = Arc::new(HubInstanceSource::new(
            discovery.clone(),
            connections.clone(),
        ));
        let router = Arc::new(
            InstanceRouter::new(source)
                .with_default_instance(settings.default_instance.clone())
                .with_resolve_wait(settings.session_resolve_wait),
        );

        let transports = Arc::new(HubTransports::new(
            settings.host.clone(),
            connections.clone(),
        ));
        let retry = self
            .retry
            .unwrap_or_else(|| RetryPolicy::default().with_reload_wait(settings.reload_wait));
        let dispatcher = CommandDispatcher::new(router.clone(), capabilities.clone(), transports)
            .with_retry_policy(retry)
            .with_default_timeout(settings.command_timeout)
            .with_reload_preflight(discovery.clone());

        let listener = match &self.channel_addr {
            Some(addr) => Some(SessionListener::start(addr.as_str(), connections.clone()).await?),
            None => None,
        };

        info!(
            "Engine hub ready (status dir {}, channel listener {})",
            settings.status_dir.display(),
            listener
                .as_ref()
                .map(|l| l.addr().to_string())
                .unwrap_or_else(|| "disabled".to_string())
        );

        Ok(EngineHub {
            inner: Arc::new(HubInner {
                settings,
                discovery,
                capabilities,
                connections,
                router,
                dispatcher,
                listener: Mutex::new(listener),
            }),
        })
    }
}
