//! Session channel transport.
//!
//! A channel is opened by the instance and handed over after its handshake.
//! Each channel owns two background tasks:
//!
//! - the **writer** opens with the `registered` acknowledgement, then drains an
//!   mpsc queue of outbound `HubMessage`s and sends periodic keepalive pings
//! - the **reader** routes `command_result` frames to the correlation table and
//!   forwards control frames as [`ChannelEvent`]s; it never runs application
//!   logic inline
//!
//! When the channel closes every pending waiter fails with a connection error
//! and is removed from the table.

use super::framing::{read_frame, write_frame};
use super::protocol::{HubMessage, InstanceMessage};
use super::TransportClient;
use crate::config::TransportConfig;
use crate::error::{ConnectionFailure, FailurePhase, HubError, Result};
use crate::models::{CapabilityDescriptor, Command, CommandResponse, InstanceId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Control traffic from a channel, handled off the reader task.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    CapabilitiesChanged {
        session_id: String,
        capabilities: Vec<CapabilityDescriptor>,
    },
    Unregister {
        session_id: String,
    },
    /// The instance answered a ping.
    Pong {
        session_id: String,
    },
    Closed {
        session_id: String,
    },
}

type Waiter = oneshot::Sender<Result<CommandResponse>>;

/// Correlation id to pending waiter.
#[derive(Default)]
struct PendingTable {
    waiters: Mutex<HashMap<String, Waiter>>,
}

impl PendingTable {
    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<String, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: String, waiter: Waiter) {
        self.waiters().insert(id, waiter);
    }

    fn take(&self, id: &str) -> Option<Waiter> {
        self.waiters().remove(id)
    }

    fn len(&self) -> usize {
        self.waiters().len()
    }

    /// Fail and remove every waiter.
    fn fail_all(&self, endpoint: &str, reason: ConnectionFailure) -> usize {
        let drained: Vec<(String, Waiter)> = self.waiters().drain().collect();
        let count = drained.len();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(HubError::connection(
                endpoint,
                FailurePhase::Send,
                reason,
                "session channel closed while the command was pending",
            )));
        }
        count
    }
}

/// Removes a waiter when its `send` finishes, times out or is cancelled.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.table.take(self.id);
    }
}

/// Client side of one instance-initiated session channel.
pub struct SessionChannelClient {
    session_id: String,
    identity: InstanceId,
    outbound: mpsc::Sender<HubMessage>,
    pending: Arc<PendingTable>,
    close_tx: watch::Sender<bool>,
    /// Bumped on every pong.
    pongs: watch::Sender<u64>,
}

impl std::fmt::Debug for SessionChannelClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionChannelClient")
            .field("session_id", &self.session_id)
            .field("identity", &self.identity)
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionChannelClient {
    /// Take ownership of a handshaken channel and start its reader and writer.
    ///
    /// The first frame written is `registered` with `session_id`. Control
    /// frames and the final close are delivered on `events`.
    pub fn spawn<R, W>(
        session_id: impl Into<String>,
        identity: InstanceId,
        reader: R,
        writer: W,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session_id = session_id.into();
        let (outbound, outbound_rx) = mpsc::channel(TransportConfig::WRITER_QUEUE_DEPTH);
        let (close_tx, close_rx) = watch::channel(false);
        let (pongs, _) = watch::channel(0u64);
        let pending = Arc::new(PendingTable::default());

        let client = Arc::new(Self {
            session_id: session_id.clone(),
            identity,
            outbound,
            pending: pending.clone(),
            close_tx: close_tx.clone(),
            pongs: pongs.clone(),
        });

        tokio::spawn(writer_loop(
            session_id.clone(),
            writer,
            outbound_rx,
            close_tx.clone(),
            close_rx.clone(),
        ));
        tokio::spawn(reader_loop(
            session_id, reader, pending, pongs, events, close_tx, close_rx,
        ));

        client
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn identity(&self) -> &InstanceId {
        &self.identity
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Number of commands still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Close the channel and fail every pending waiter.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
        let failed = self
            .pending
            .fail_all(&self.endpoint(), ConnectionFailure::ChannelClosed);
        if failed > 0 {
            debug!("Closed session {} with {} pending command(s)", self.session_id, failed);
        }
    }

    /// Send a ping and wait for the next pong.
    pub async fn ping(&self, timeout: Duration) -> Result<()> {
        let mut pongs = self.pongs.subscribe();
        pongs.borrow_and_update();
        let mut closed = self.close_tx.subscribe();

        if self.is_closed() {
            return Err(self.closed_error(ConnectionFailure::NotConnected, "session channel is closed"));
        }
        if self.outbound.send(HubMessage::Ping {}).await.is_err() {
            return Err(self.closed_error(
                ConnectionFailure::ChannelClosed,
                "session writer has stopped",
            ));
        }

        let answered = tokio::time::timeout(timeout, async {
            tokio::select! {
                changed = pongs.changed() => changed.is_ok(),
                _ = closed.wait_for(|closed| *closed) => false,
            }
        })
        .await;

        match answered {
            Ok(true) => Ok(()),
            Ok(false) => Err(self.closed_error(
                ConnectionFailure::ChannelClosed,
                "session channel closed while waiting for a pong",
            )),
            Err(_) => Err(HubError::Timeout {
                operation: format!("readiness ping on {}", self.endpoint()),
                after: timeout,
            }),
        }
    }

    fn closed_error(&self, reason: ConnectionFailure, message: &str) -> HubError {
        HubError::connection(self.endpoint(), FailurePhase::Send, reason, message)
    }
}

#[async_trait]
impl TransportClient for SessionChannelClient {
    async fn send(&self, command: &Command, timeout: Duration) -> Result<CommandResponse> {
        let id = command.correlation_id.as_str();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.to_string(), tx);
        let _guard = PendingGuard {
            table: &self.pending,
            id,
        };

        // Checked after insertion: a close racing with this send either sees
        // the waiter and fails it, or has already flipped the flag.
        if self.is_closed() {
            return Err(self.closed_error(ConnectionFailure::NotConnected, "session channel is closed"));
        }

        let message = HubMessage::Execute {
            id: id.to_string(),
            name: command.name.clone(),
            params: command.params.clone(),
            timeout: timeout.as_secs_f64(),
        };
        if self.outbound.send(message).await.is_err() {
            return Err(self.closed_error(
                ConnectionFailure::ChannelClosed,
                "session writer has stopped",
            ));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.closed_error(
                ConnectionFailure::ChannelClosed,
                "session channel dropped the pending command",
            )),
            Err(_) => Err(HubError::Timeout {
                operation: format!("'{}' on {}", command.name, self.endpoint()),
                after: timeout,
            }),
        }
    }

    async fn ready(&self, timeout: Duration) -> Result<()> {
        self.ping(timeout).await
    }

    fn endpoint(&self) -> String {
        format!("session:{}", self.session_id)
    }
}

async fn writer_loop<W>(
    session_id: String,
    mut writer: W,
    mut outbound: mpsc::Receiver<HubMessage>,
    close_tx: watch::Sender<bool>,
    mut close_rx: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut keepalive = tokio::time::interval(TransportConfig::KEEPALIVE_INTERVAL);
    keepalive.tick().await;

    let ack = HubMessage::Registered {
        session_id: session_id.clone(),
    };
    if let Err(e) = write_message(&session_id, &mut writer, &ack).await {
        debug!("Session {} acknowledgement failed: {}", session_id, e);
        close_tx.send_replace(true);
        return;
    }

    loop {
        let message = tokio::select! {
            _ = close_rx.changed() => break,
            _ = keepalive.tick() => HubMessage::Ping {},
            next = outbound.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        if let Err(e) = write_message(&session_id, &mut writer, &message).await {
            debug!("Session {} writer stopped: {}", session_id, e);
            break;
        }
    }

    close_tx.send_replace(true);
}

async fn write_message<W>(
    session_id: &str,
    writer: &mut W,
    message: &HubMessage,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match serde_json::to_vec(message) {
        Ok(payload) => write_frame(writer, &payload).await,
        Err(e) => {
            warn!("Dropping unserializable frame for session {}: {}", session_id, e);
            Ok(())
        }
    }
}

async fn reader_loop<R>(
    session_id: String,
    mut reader: R,
    pending: Arc<PendingTable>,
    pongs: watch::Sender<u64>,
    events: mpsc::Sender<ChannelEvent>,
    close_tx: watch::Sender<bool>,
    mut close_rx: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let endpoint = format!("session:{}", session_id);

    loop {
        if *close_rx.borrow() {
            break;
        }

        let frame = tokio::select! {
            _ = close_rx.changed() => break,
            result = read_frame(&mut reader) => match result {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    debug!("Session {} closed by instance", session_id);
                    break;
                }
                Err(e) => {
                    debug!("Session {} read failed: {}", session_id, e);
                    break;
                }
            },
        };

        if frame.is_empty() {
            continue;
        }

        let message = match InstanceMessage::decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring frame on session {}: {}", session_id, e);
                continue;
            }
        };

        let event = match message {
            InstanceMessage::CommandResult {
                id,
                success,
                result,
                error,
            } => {
                let response = if success {
                    CommandResponse::success(&id, result.unwrap_or(serde_json::Value::Null))
                } else {
                    CommandResponse::failure(
                        &id,
                        error.unwrap_or_else(|| "command failed".to_string()),
                        result,
                    )
                };
                match pending.take(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(Ok(response));
                    }
                    None => debug!("Late result {} on session {} discarded", id, session_id),
                }
                continue;
            }
            InstanceMessage::CapabilitiesChanged { capabilities } => {
                ChannelEvent::CapabilitiesChanged {
                    session_id: session_id.clone(),
                    capabilities,
                }
            }
            InstanceMessage::Unregister {} => ChannelEvent::Unregister {
                session_id: session_id.clone(),
            },
            InstanceMessage::Pong {} => {
                pongs.send_modify(|count| *count = count.wrapping_add(1));
                ChannelEvent::Pong {
                    session_id: session_id.clone(),
                }
            }
            InstanceMessage::Register { .. } => {
                warn!("Session {} sent a second register frame", session_id);
                continue;
            }
        };

        if events.send(event).await.is_err() {
            break;
        }
    }

    close_tx.send_replace(true);
    let failed = pending.fail_all(&endpoint, ConnectionFailure::ChannelClosed);
    if failed > 0 {
        warn!(
            "Session {} closed with {} pending command(s)",
            session_id, failed
        );
    }
    let _ = events.send(ChannelEvent::Closed { session_id }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    struct FakeInstance {
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeInstance {
        async fn next_execute(&mut self) -> (String, String) {
            loop {
                let frame = read_frame(&mut self.reader).await.unwrap().unwrap();
                match serde_json::from_slice::<HubMessage>(&frame).unwrap() {
                    HubMessage::Execute { id, name, .. } => return (id, name),
                    _ => continue,
                }
            }
        }

        async fn next_message(&mut self) -> HubMessage {
            let frame = read_frame(&mut self.reader).await.unwrap().unwrap();
            serde_json::from_slice(&frame).unwrap()
        }

        /// Answer the next ping with a pong.
        async fn answer_ping(&mut self) {
            loop {
                if let HubMessage::Ping {} = self.next_message().await {
                    self.send(InstanceMessage::Pong {}).await;
                    return;
                }
            }
        }

        async fn send(&mut self, message: InstanceMessage) {
            let bytes = serde_json::to_vec(&message).unwrap();
            write_frame(&mut self.writer, &bytes).await.unwrap();
        }
    }

    fn open_channel() -> (Arc<SessionChannelClient>, FakeInstance, mpsc::Receiver<ChannelEvent>) {
        let (hub_side, instance_side) = duplex(64 * 1024);
        let (hub_read, hub_write) = split(hub_side);
        let (reader, writer) = split(instance_side);
        let (events_tx, events_rx) = mpsc::channel(16);
        let client = SessionChannelClient::spawn(
            "s-1",
            InstanceId::new("Alpha", "111"),
            hub_read,
            hub_write,
            events_tx,
        );
        (client, FakeInstance { reader, writer }, events_rx)
    }

    #[tokio::test]
    async fn test_send_correlates_response() {
        let (client, mut instance, _events) = open_channel();

        let cmd = Command::from_value("manage_scene", json!({"action": "load"}));
        let expected_id = cmd.correlation_id.clone();
        let send = tokio::spawn({
            let client = client.clone();
            async move { client.send(&cmd, Duration::from_secs(2)).await }
        });

        let (id, name) = instance.next_execute().await;
        assert_eq!(id, expected_id);
        assert_eq!(name, "manage_scene");
        instance
            .send(InstanceMessage::CommandResult {
                id,
                success: true,
                result: Some(json!({"loaded": true})),
                error: None,
            })
            .await;

        let resp = send.await.unwrap().unwrap();
        assert!(resp.is_success());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_forced_close_fails_pending_and_clears_table() {
        let (client, mut instance, mut events) = open_channel();

        let send = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send(&Command::from_value("refresh", json!({})), Duration::from_secs(5))
                    .await
            }
        });

        instance.next_execute().await;
        assert_eq!(client.pending_count(), 1);
        drop(instance);

        let err = send.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_retryable());
        assert_eq!(client.pending_count(), 0);
        assert!(client.is_closed());

        let mut saw_close = false;
        while let Some(event) = events.recv().await {
            if event == (ChannelEvent::Closed { session_id: "s-1".into() }) {
                saw_close = true;
                break;
            }
        }
        assert!(saw_close);
    }

    #[tokio::test]
    async fn test_timeout_releases_waiter() {
        let (client, mut instance, _events) = open_channel();

        let send = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .send(&Command::from_value("ping", json!({})), Duration::from_millis(100))
                    .await
            }
        });
        instance.next_execute().await;

        let err = send.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_control_frames_become_events() {
        let (_client, mut instance, mut events) = open_channel();

        instance
            .send(InstanceMessage::CapabilitiesChanged {
                capabilities: vec![CapabilityDescriptor::new("bake_lighting")],
            })
            .await;
        instance.send(InstanceMessage::Unregister {}).await;

        match events.recv().await.unwrap() {
            ChannelEvent::CapabilitiesChanged { capabilities, .. } => {
                assert_eq!(capabilities[0].name, "bake_lighting")
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::Unregister {
                session_id: "s-1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_send_after_close_is_not_connected() {
        let (client, _instance, _events) = open_channel();
        client.close();

        let err = client
            .send(&Command::from_value("ping", json!({})), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            HubError::Connection { reason, .. } => {
                assert_eq!(reason, ConnectionFailure::NotConnected)
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_registered_is_first_frame() {
        let (_client, mut instance, _events) = open_channel();
        assert_eq!(
            instance.next_message().await,
            HubMessage::Registered {
                session_id: "s-1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_close_racing_sends_leaves_no_waiters() {
        let (client, _instance, _events) = open_channel();

        let sends: Vec<_> = (0..32)
            .map(|_| {
                let client = client.clone();
                tokio::spawn(async move {
                    client
                        .send(&Command::from_value("refresh", json!({})), Duration::from_secs(30))
                        .await
                })
            })
            .collect();
        tokio::task::yield_now().await;
        client.close();

        for send in sends {
            let outcome = tokio::time::timeout(Duration::from_secs(2), send)
                .await
                .expect("send outlived the close")
                .unwrap();
            assert_eq!(outcome.unwrap_err().kind(), ErrorKind::Connection);
        }
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_waits_for_pong_and_reports_it() {
        let (client, mut instance, mut events) = open_channel();

        let ping = tokio::spawn({
            let client = client.clone();
            async move { client.ping(Duration::from_secs(2)).await }
        });
        instance.answer_ping().await;

        ping.await.unwrap().unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ChannelEvent::Pong {
                session_id: "s-1".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unanswered_ping_times_out() {
        let (client, _instance, _events) = open_channel();

        let err = client.ping(Duration::from_millis(100)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_ping_on_closed_channel_fails_fast() {
        let (client, _instance, _events) = open_channel();
        client.close();

        let err = client.ping(Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}
