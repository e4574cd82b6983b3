//! The live instance set the router resolves against.

use crate::discovery::InstanceDiscovery;
use crate::error::Result;
use crate::models::InstanceDescriptor;
use crate::registry::ConnectionRegistry;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

/// Anything that can list the currently live instances.
#[async_trait]
pub trait InstanceSource: Send + Sync {
    async fn live_instances(&self, force_refresh: bool) -> Result<Vec<InstanceDescriptor>>;
}

/// Channel sessions plus discovered framed instances.
///
/// An identity with a live session is reported once, reachable over its
/// channel, even if a status file also advertises a port for it. A failed
/// status directory scan falls back to the last cached scan result.
pub struct HubInstanceSource {
    discovery: Arc<InstanceDiscovery>,
    connections: Arc<ConnectionRegistry>,
}

impl HubInstanceSource {
    pub fn new(discovery: Arc<InstanceDiscovery>, connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            discovery,
            connections,
        }
    }
}

#[async_trait]
impl InstanceSource for HubInstanceSource {
    async fn live_instances(&self, force_refresh: bool) -> Result<Vec<InstanceDescriptor>> {
        let mut live = self.connections.descriptors();
        let seen: HashSet<_> = live.iter().map(|d| d.identity().clone()).collect();

        let framed = match self.discovery.scan(force_refresh).await {
            Ok(framed) => framed,
            Err(e) => {
                let cached = self.discovery.cached();
                warn!(
                    "Instance scan failed ({}); using {} session(s) and {} cached instance(s)",
                    e,
                    live.len(),
                    cached.len()
                );
                cached
            }
        };
        for descriptor in framed {
            if seen.contains(descriptor.identity()) {
                if let Some(channel) = live.iter_mut().find(|d| d.id == descriptor.id) {
                    channel.port = descriptor.port;
                    channel.pid = descriptor.pid;
                }
            } else {
                live.push(descriptor);
            }
        }

        live.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubSettings;
    use crate::models::InstanceId;
    use crate::registry::CapabilityRegistry;
    use crate::transport::{ChannelEvent, SessionChannelClient};
    use tempfile::TempDir;
    use tokio::io::{duplex, split};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_unreadable_status_dir_keeps_channel_sessions() {
        let dir = TempDir::new().unwrap();
        let not_a_dir = dir.path().join("status");
        std::fs::write(&not_a_dir, b"").unwrap();

        let settings = HubSettings::default().with_status_dir(&not_a_dir);
        let discovery = Arc::new(InstanceDiscovery::new(&settings));
        let connections = Arc::new(ConnectionRegistry::new(Arc::new(CapabilityRegistry::new())));

        let (hub_side, _instance_side) = duplex(4096);
        let (reader, writer) = split(hub_side);
        let (events, _events_rx) = mpsc::channel::<ChannelEvent>(8);
        let identity = InstanceId::new("Gamma", "333");
        connections.register(
            Some("s-1"),
            InstanceDescriptor::new("Gamma", "333"),
            vec![],
            |session_id| SessionChannelClient::spawn(session_id, identity, reader, writer, events),
        );

        let source = HubInstanceSource::new(discovery, connections);
        let live = source.live_instances(true).await.unwrap();

        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id.to_string(), "Gamma@333");
        assert_eq!(live[0].session_id.as_deref(), Some("s-1"));
    }
}
