//! TCP listener accepting instance-initiated session channels.
//!
//! Each accepted connection must open with a `register` frame. The listener
//! records it in the [`ConnectionRegistry`], which settles the session id and
//! starts a [`SessionChannelClient`] that answers with `registered`. Control
//! events from every channel are applied by a single event task so registry
//! mutations never run on a channel's reader.

use super::channel::{ChannelEvent, SessionChannelClient};
use super::framing::{frame_error, read_frame};
use super::protocol::InstanceMessage;
use crate::config::TransportConfig;
use crate::error::{FailurePhase, HubError, Result};
use crate::models::{InstanceDescriptor, InstanceId, InstanceStatus};
use crate::registry::{ConnectionRegistry, SessionKey};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Handle to a running session listener. Dropping shuts it down.
pub struct SessionListenerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
    event_task: Option<tokio::task::JoinHandle<()>>,
}

impl SessionListenerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting new channels. Existing sessions are left to the registry.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.event_task.take() {
            handle.abort();
        }
    }
}

impl Drop for SessionListenerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.accept_task.take() {
            handle.abort();
        }
    }
}

/// Accepts channel connections from instances.
pub struct SessionListener;

impl SessionListener {
    /// Bind `addr` (port 0 picks a free port) and start accepting channels.
    pub async fn start(
        addr: impl tokio::net::ToSocketAddrs,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<SessionListenerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("Session listener accepting instance channels on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (events_tx, events_rx) = mpsc::channel(TransportConfig::CONTROL_QUEUE_DEPTH);

        let event_task = tokio::spawn(Self::event_loop(events_rx, registry.clone()));
        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            registry,
            events_tx,
            shutdown_rx,
        ));

        Ok(SessionListenerHandle {
            addr,
            port: addr.port(),
            shutdown_tx: Some(shutdown_tx),
            accept_task: Some(accept_task),
            event_task: Some(event_task),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        registry: Arc<ConnectionRegistry>,
        events: mpsc::Sender<ChannelEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Session listener shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if registry.len() >= TransportConfig::MAX_CHANNEL_CONNECTIONS {
                                warn!(
                                    "Rejecting channel from {}: at max capacity ({})",
                                    peer_addr,
                                    TransportConfig::MAX_CHANNEL_CONNECTIONS
                                );
                                continue;
                            }

                            let registry = registry.clone();
                            let events = events.clone();
                            tokio::spawn(async move {
                                debug!("Channel connection from {}", peer_addr);
                                if let Err(e) = Self::handshake(stream, peer_addr, &registry, events).await {
                                    warn!("Channel handshake from {} failed: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Session listener accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handshake(
        stream: TcpStream,
        peer_addr: SocketAddr,
        registry: &ConnectionRegistry,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Result<()> {
        let endpoint = peer_addr.to_string();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", endpoint, e);
        }
        let (mut reader, writer) = stream.into_split();

        let frame = tokio::time::timeout(TransportConfig::HANDSHAKE_TIMEOUT, read_frame(&mut reader))
            .await
            .map_err(|_| HubError::Timeout {
                operation: format!("handshake from {}", endpoint),
                after: TransportConfig::HANDSHAKE_TIMEOUT,
            })?
            .map_err(|e| frame_error(e, &endpoint, FailurePhase::Handshake))?
            .ok_or_else(|| HubError::protocol("channel closed before register"))?;

        let (proposed, name, hash, engine_version, project_path, capabilities) =
            match InstanceMessage::decode(&frame)? {
                InstanceMessage::Register {
                    session_id,
                    instance_name,
                    instance_hash,
                    engine_version,
                    project_path,
                    capabilities,
                } => (
                    session_id,
                    instance_name,
                    instance_hash,
                    engine_version,
                    project_path,
                    capabilities,
                ),
                other => {
                    return Err(HubError::protocol(format!(
                        "first frame must be register, got {:?}",
                        other
                    )))
                }
            };

        if hash.trim().is_empty() || name.trim().is_empty() {
            return Err(HubError::protocol("register requires instance_name and instance_hash"));
        }

        let identity = InstanceId::new(name.trim(), hash.trim());

        let mut descriptor = InstanceDescriptor::new(identity.name.clone(), identity.hash.clone())
            .with_status(InstanceStatus::Ready)
            .with_project_path(project_path.unwrap_or_default());
        descriptor.engine_version = engine_version;

        let registered = registry.register(
            proposed.as_deref(),
            descriptor,
            capabilities,
            |session_id| SessionChannelClient::spawn(session_id, identity, reader, writer, events),
        );
        for prior in registered.superseded {
            prior.close();
        }
        debug!(
            "Channel from {} registered as {}",
            endpoint, registered.session_id
        );

        Ok(())
    }

    async fn event_loop(mut events: mpsc::Receiver<ChannelEvent>, registry: Arc<ConnectionRegistry>) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::CapabilitiesChanged {
                    session_id,
                    capabilities,
                } => {
                    if registry.contains(&session_id) {
                        registry.capabilities().announce(&session_id, capabilities);
                    } else {
                        debug!("Capabilities from unknown session {} ignored", session_id);
                    }
                }
                ChannelEvent::Unregister { session_id } => {
                    if let Some(channel) = registry.unregister(&session_id) {
                        channel.close();
                    }
                }
                ChannelEvent::Pong { session_id } => {
                    registry.touch(&session_id);
                }
                ChannelEvent::Closed { session_id } => {
                    let current_is_closed = registry
                        .lookup(SessionKey::Session(&session_id))
                        .map(|channel| channel.is_closed())
                        .unwrap_or(false);
                    if current_is_closed {
                        registry.unregister(&session_id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CapabilityDescriptor;
    use crate::transport::framing::write_frame;
    use crate::transport::protocol::HubMessage;
    use crate::registry::CapabilityRegistry;
    use std::time::Duration;

    async fn start() -> (SessionListenerHandle, Arc<ConnectionRegistry>) {
        let registry = Arc::new(ConnectionRegistry::new(Arc::new(CapabilityRegistry::new())));
        let handle = SessionListener::start("127.0.0.1:0", registry.clone())
            .await
            .unwrap();
        (handle, registry)
    }

    async fn register(port: u16, session_id: Option<&str>, name: &str, hash: &str) -> (TcpStream, String) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let register = InstanceMessage::Register {
            session_id: session_id.map(str::to_string),
            instance_name: name.into(),
            instance_hash: hash.into(),
            engine_version: None,
            project_path: None,
            capabilities: vec![CapabilityDescriptor::new("bake_lighting")],
        };
        write_frame(&mut stream, &serde_json::to_vec(&register).unwrap())
            .await
            .unwrap();
        let ack = read_frame(&mut stream).await.unwrap().unwrap();
        match serde_json::from_slice::<HubMessage>(&ack).unwrap() {
            HubMessage::Registered { session_id } => (stream, session_id),
            other => panic!("unexpected ack: {other:?}"),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_handshake_registers_session_and_capabilities() {
        let (handle, registry) = start().await;
        let (_stream, session_id) = register(handle.port, Some("proposed-1"), "Alpha", "111").await;

        assert_eq!(session_id, "proposed-1");
        wait_until(|| registry.contains("proposed-1")).await;
        assert_eq!(registry.capabilities().list("proposed-1").len(), 1);
    }

    #[tokio::test]
    async fn test_proposed_id_held_by_other_identity_is_replaced() {
        let (handle, registry) = start().await;
        let (_alpha, _) = register(handle.port, Some("shared"), "Alpha", "111").await;
        wait_until(|| registry.contains("shared")).await;

        let (_beta, beta_id) = register(handle.port, Some("shared"), "Beta", "222").await;
        assert_ne!(beta_id, "shared");
    }

    #[tokio::test]
    async fn test_disconnect_unregisters_and_purges() {
        let (handle, registry) = start().await;
        let (stream, session_id) = register(handle.port, None, "Alpha", "111").await;
        wait_until(|| registry.contains(&session_id)).await;

        drop(stream);
        wait_until(|| !registry.contains(&session_id)).await;
        assert!(registry.capabilities().list(&session_id).is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_previous_session() {
        let (handle, registry) = start().await;
        let (_old, old_id) = register(handle.port, None, "Alpha", "111").await;
        wait_until(|| registry.contains(&old_id)).await;
        let (_new, new_id) = register(handle.port, None, "Alpha", "111").await;
        wait_until(|| registry.contains(&new_id)).await;

        assert!(!registry.contains(&old_id));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_pong_refreshes_last_seen() {
        let (handle, registry) = start().await;
        let (mut stream, session_id) = register(handle.port, None, "Alpha", "111").await;
        wait_until(|| registry.contains(&session_id)).await;
        let registered_at = registry.list_sessions()[0].last_seen;

        tokio::time::sleep(Duration::from_millis(5)).await;
        write_frame(&mut stream, br#"{"type":"pong"}"#).await.unwrap();

        wait_until(|| registry.list_sessions()[0].last_seen > registered_at).await;
        assert_eq!(registry.list_sessions()[0].session_id, session_id);
    }

    #[tokio::test]
    async fn test_non_register_first_frame_is_rejected() {
        let (handle, registry) = start().await;
        let mut stream = TcpStream::connect(("127.0.0.1", handle.port)).await.unwrap();
        write_frame(&mut stream, br#"{"type":"pong"}"#).await.unwrap();

        let next = read_frame(&mut stream).await;
        assert!(matches!(next, Ok(None) | Err(_)));
        assert!(registry.is_empty());
    }
}
