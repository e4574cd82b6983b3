//! Liveness probes for discovered instances.

use crate::error::{HubError, Result};
use crate::models::InstanceDescriptor;
use crate::transport::FramedSocketClient;
use async_trait::async_trait;
use std::time::Duration;

/// Checks that an advertised endpoint is really a live instance.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, descriptor: &InstanceDescriptor) -> Result<()>;
}

/// Framed `ping` expecting a `pong`, under a short timeout.
#[derive(Debug, Clone)]
pub struct FramedProbe {
    host: String,
    timeout: Duration,
}

impl FramedProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

#[async_trait]
impl LivenessProbe for FramedProbe {
    async fn probe(&self, descriptor: &InstanceDescriptor) -> Result<()> {
        let port = descriptor.port.ok_or_else(|| {
            HubError::protocol(format!("{} advertises no port", descriptor.identity()))
        })?;
        FramedSocketClient::new(self.host.clone(), port)
            .probe(self.timeout)
            .await
    }
}
