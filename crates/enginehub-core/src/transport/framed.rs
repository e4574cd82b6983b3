//! Connect-per-call framed socket transport.
//!
//! Every `send` opens a fresh TCP connection, writes one frame, reads exactly
//! one response frame and drops the connection. Zero-length frames received
//! while waiting are heartbeats from an instance still working on the command.

use super::framing::{frame_error, read_frame, write_frame};
use super::protocol::{FramedReply, FramedRequest};
use super::TransportClient;
use crate::config::{DiscoveryConfig, TransportConfig};
use crate::error::{ConnectionFailure, FailurePhase, HubError, Result};
use crate::models::{Command, CommandResponse};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;

/// Framed transport client for one instance port.
#[derive(Debug, Clone)]
pub struct FramedSocketClient {
    host: String,
    port: u16,
}

impl FramedSocketClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    async fn connect(&self, phase: FailurePhase) -> Result<TcpStream> {
        let endpoint = self.endpoint();
        let stream = tokio::time::timeout(
            TransportConfig::CONNECT_TIMEOUT,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| {
            HubError::connection(
                &endpoint,
                phase,
                ConnectionFailure::Unreachable,
                format!("connect timed out after {:?}", TransportConfig::CONNECT_TIMEOUT),
            )
        })?
        .map_err(|e| HubError::from_io(e, &endpoint, phase))?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", endpoint, e);
        }
        Ok(stream)
    }

    /// Write one request and read its reply on a fresh connection.
    ///
    /// Replies longer than `max_reply` bytes are a protocol error.
    async fn exchange(
        &self,
        request: &FramedRequest,
        phase: FailurePhase,
        max_reply: usize,
    ) -> Result<FramedReply> {
        let endpoint = self.endpoint();
        let mut stream = self.connect(phase).await?;
        let (mut reader, mut writer) = stream.split();

        let payload = serde_json::to_vec(request)?;
        write_frame(&mut writer, &payload)
            .await
            .map_err(|e| frame_error(e, &endpoint, phase))?;

        let started = Instant::now();
        let mut heartbeats = 0u32;
        loop {
            let frame = read_frame(&mut reader)
                .await
                .map_err(|e| frame_error(e, &endpoint, phase))?
                .ok_or_else(|| {
                    HubError::connection(
                        &endpoint,
                        phase,
                        ConnectionFailure::ClosedMidRead,
                        "instance closed the connection before responding",
                    )
                })?;

            if frame.is_empty() {
                heartbeats += 1;
                debug!("Heartbeat {} from {}", heartbeats, endpoint);
                if heartbeats > TransportConfig::MAX_HEARTBEAT_FRAMES {
                    return Err(HubError::Timeout {
                        operation: format!(
                            "'{}' on {} (heartbeat limit reached)",
                            request.command, endpoint
                        ),
                        after: started.elapsed(),
                    });
                }
                continue;
            }

            if frame.len() > max_reply {
                return Err(HubError::protocol(format!(
                    "reply from {} is {} bytes, limit is {}",
                    endpoint,
                    frame.len(),
                    max_reply
                )));
            }

            return serde_json::from_slice::<FramedReply>(&frame).map_err(|e| {
                HubError::protocol(format!("invalid response from {}: {}", endpoint, e))
            });
        }
    }

    /// Short liveness probe: a framed `ping` that must answer `pong`.
    pub async fn probe(&self, timeout: Duration) -> Result<()> {
        let endpoint = self.endpoint();
        let reply = tokio::time::timeout(
            timeout,
            self.exchange(
                &FramedRequest::ping(),
                FailurePhase::Probe,
                DiscoveryConfig::MAX_PROBE_RESPONSE,
            ),
        )
        .await
        .map_err(|_| HubError::Timeout {
            operation: format!("probe of {}", endpoint),
            after: timeout,
        })??;

        if reply.is_pong() {
            Ok(())
        } else {
            Err(HubError::protocol(format!(
                "{} answered the probe without a pong",
                endpoint
            )))
        }
    }
}

#[async_trait]
impl TransportClient for FramedSocketClient {
    async fn send(&self, command: &Command, timeout: Duration) -> Result<CommandResponse> {
        let request = FramedRequest::from_command(command);
        let exchange = self.exchange(&request, FailurePhase::Send, TransportConfig::MAX_FRAME_SIZE);
        let reply = tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| HubError::Timeout {
                operation: format!("'{}' on {}", command.name, self.endpoint()),
                after: timeout,
            })??;

        reply.into_response(&command.correlation_id)
    }

    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;
    use tokio::net::TcpListener;

    /// Bind a one-shot fake instance that runs `handler` on its first connection.
    async fn fake_instance<F, Fut>(handler: F) -> u16
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                handler(stream).await;
            }
        });
        port
    }

    async fn reply(stream: &mut TcpStream, body: serde_json::Value) {
        let bytes = serde_json::to_vec(&body).unwrap();
        write_frame(stream, &bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_roundtrip() {
        let port = fake_instance(|mut stream| async move {
            let frame = read_frame(&mut stream).await.unwrap().unwrap();
            let req: FramedRequest = serde_json::from_slice(&frame).unwrap();
            assert_eq!(req.command, "manage_scene");
            reply(&mut stream, json!({"status": "success", "result": {"echo": req.params}})).await;
        })
        .await;

        let client = FramedSocketClient::new("127.0.0.1", port);
        let cmd = Command::from_value("manage_scene", json!({"action": "get_hierarchy"}));
        let resp = client.send(&cmd, Duration::from_secs(2)).await.unwrap();

        assert_eq!(resp.correlation_id, cmd.correlation_id);
        assert_eq!(
            resp.outcome,
            crate::models::CommandOutcome::Success(json!({"echo": {"action": "get_hierarchy"}}))
        );
    }

    #[tokio::test]
    async fn test_close_mid_read_is_retryable() {
        let port = fake_instance(|mut stream| async move {
            let _ = read_frame(&mut stream).await;
            drop(stream);
        })
        .await;

        let client = FramedSocketClient::new("127.0.0.1", port);
        let err = client
            .send(&Command::from_value("refresh", json!({})), Duration::from_secs(2))
            .await
            .unwrap_err();

        assert!(err.is_retryable(), "unexpected error: {err:?}");
        match err {
            HubError::Connection { reason, .. } => {
                assert_eq!(reason, ConnectionFailure::ClosedMidRead)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_heartbeats_are_tolerated() {
        let port = fake_instance(|mut stream| async move {
            let _ = read_frame(&mut stream).await;
            for _ in 0..3 {
                write_frame(&mut stream, &[]).await.unwrap();
            }
            reply(&mut stream, json!({"status": "success", "result": "done"})).await;
        })
        .await;

        let client = FramedSocketClient::new("127.0.0.1", port);
        let resp = client
            .send(&Command::from_value("run_tests", json!({})), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(resp.is_success());
    }

    #[tokio::test]
    async fn test_malformed_response_is_protocol_error() {
        let port = fake_instance(|mut stream| async move {
            let _ = read_frame(&mut stream).await;
            write_frame(&mut stream, b"not json").await.unwrap();
        })
        .await;

        let client = FramedSocketClient::new("127.0.0.1", port);
        let err = client
            .send(&Command::from_value("ping", json!({})), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_send_times_out() {
        let port = fake_instance(|mut stream| async move {
            let _ = read_frame(&mut stream).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;

        let client = FramedSocketClient::new("127.0.0.1", port);
        let err = client
            .send(&Command::from_value("ping", json!({})), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_probe_requires_pong() {
        let port = fake_instance(|mut stream| async move {
            let _ = read_frame(&mut stream).await;
            reply(&mut stream, json!({"status": "success", "result": {"message": "pong"}})).await;
        })
        .await;
        FramedSocketClient::new("127.0.0.1", port)
            .probe(DiscoveryConfig::PROBE_TIMEOUT)
            .await
            .unwrap();

        let port = fake_instance(|mut stream| async move {
            let _ = read_frame(&mut stream).await;
            reply(&mut stream, json!({"status": "success", "result": {}})).await;
        })
        .await;
        assert!(FramedSocketClient::new("127.0.0.1", port)
            .probe(DiscoveryConfig::PROBE_TIMEOUT)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_oversized_pong_fails_the_check() {
        let port = fake_instance(|mut stream| async move {
            let _ = read_frame(&mut stream).await;
            let padding = "x".repeat(DiscoveryConfig::MAX_PROBE_RESPONSE);
            reply(
                &mut stream,
                json!({"status": "success", "result": {"message": "pong", "padding": padding}}),
            )
            .await;
        })
        .await;

        let err = FramedSocketClient::new("127.0.0.1", port)
            .probe(DiscoveryConfig::PROBE_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_refused_connection_classified() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = FramedSocketClient::new("127.0.0.1", port)
            .send(&Command::from_value("ping", json!({})), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }
}
