//! Single entry point for sending a command to an instance.
//!
//! Per call: `Idle -> Resolving -> Sending -> {Succeeded | Retrying -> Sending | Failed}`.
//! Resolution and capability checks happen once, before the first send, and
//! their errors are never retried. Each send attempt looks the transport up
//! again, so a retry after a reload reaches the instance's new session.
//!
//! Before each send a framed instance's status file is read again; one that
//! reports a reload is waited on instead of contacted. Fast-fail commands sent
//! over a channel are preceded by a readiness ping.

use super::retry::RetryPolicy;
use crate::config::TransportConfig;
use crate::discovery::InstanceDiscovery;
use crate::error::{ConnectionFailure, FailurePhase, HubError, Result};
use crate::models::{
    Command, CommandOutcome, CommandResponse, CommandTarget, InstanceDescriptor, InstanceId,
    Reachability,
};
use crate::registry::{CapabilityRegistry, ConnectionRegistry, SessionKey};
use crate::routing::{CallerContext, InstanceRouter};
use crate::transport::{FramedSocketClient, TransportClient};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Where a dispatch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Idle,
    Resolving,
    Sending,
    Retrying,
    Succeeded,
    Failed,
}

impl DispatchPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchPhase::Succeeded | DispatchPhase::Failed)
    }

    /// Whether `next` may follow this phase.
    pub fn can_transition(&self, next: DispatchPhase) -> bool {
        use DispatchPhase::*;
        matches!(
            (self, next),
            (Idle, Resolving)
                | (Resolving, Sending)
                | (Resolving, Failed)
                | (Sending, Succeeded)
                | (Sending, Retrying)
                | (Sending, Failed)
                | (Retrying, Sending)
        )
    }
}

impl fmt::Display for DispatchPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Phase tracker for one dispatch.
struct DispatchRun<'a> {
    command: &'a str,
    correlation_id: &'a str,
    phase: DispatchPhase,
}

impl DispatchRun<'_> {
    fn advance(&mut self, next: DispatchPhase) {
        debug_assert!(
            self.phase.can_transition(next),
            "invalid dispatch transition {} -> {}",
            self.phase,
            next
        );
        debug!(
            "Dispatch {} ({}): {} -> {}",
            self.command, self.correlation_id, self.phase, next
        );
        self.phase = next;
    }
}

/// Maps an instance to the transport that reaches it.
pub trait TransportResolver: Send + Sync {
    fn transport_for(&self, instance: &InstanceDescriptor) -> Result<Arc<dyn TransportClient>>;
}

/// Channel sessions from the connection registry, framed sockets otherwise.
pub struct HubTransports {
    host: String,
    connections: Arc<ConnectionRegistry>,
}

impl HubTransports {
    pub fn new(host: impl Into<String>, connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            host: host.into(),
            connections,
        }
    }
}

impl TransportResolver for HubTransports {
    fn transport_for(&self, instance: &InstanceDescriptor) -> Result<Arc<dyn TransportClient>> {
        match instance.reachability() {
            Some(Reachability::Channel { session_id }) => {
                let channel: Arc<dyn TransportClient> = self
                    .connections
                    .lookup(SessionKey::Identity(instance.identity()))
                    .ok_or_else(|| {
                        HubError::connection(
                            format!("session:{}", session_id),
                            FailurePhase::Send,
                            ConnectionFailure::NotConnected,
                            format!("{} has no live session", instance.identity()),
                        )
                    })?;
                Ok(channel)
            }
            Some(Reachability::Framed { port }) => {
                Ok(Arc::new(FramedSocketClient::new(self.host.clone(), port)))
            }
            None => Err(HubError::connection(
                instance.identity().to_string(),
                FailurePhase::Resolve,
                ConnectionFailure::Unreachable,
                "instance advertises neither a port nor a session",
            )),
        }
    }
}

/// What a successful dispatch delivered, and where.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchReceipt {
    pub correlation_id: String,
    pub instance: InstanceId,
    /// `"framed"` or `"channel"`.
    pub transport: &'static str,
    pub attempts: u32,
    pub payload: Value,
}

/// Resolves, validates and sends commands with bounded retry.
pub struct CommandDispatcher {
    router: Arc<InstanceRouter>,
    capabilities: Arc<CapabilityRegistry>,
    transports: Arc<dyn TransportResolver>,
    retry: RetryPolicy,
    default_timeout: Duration,
    status_files: Option<Arc<InstanceDiscovery>>,
}

impl CommandDispatcher {
    pub fn new(
        router: Arc<InstanceRouter>,
        capabilities: Arc<CapabilityRegistry>,
        transports: Arc<dyn TransportResolver>,
    ) -> Self {
        Self {
            router,
            capabilities,
            transports,
            retry: RetryPolicy::default(),
            default_timeout: TransportConfig::COMMAND_TIMEOUT,
            status_files: None,
        }
    }

    /// Check `discovery`'s status files for a reload before each framed send.
    pub fn with_reload_preflight(mut self, discovery: Arc<InstanceDiscovery>) -> Self {
        self.status_files = Some(discovery);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn router(&self) -> &Arc<InstanceRouter> {
        &self.router
    }

    /// Timeout for one send of `command`.
    ///
    /// Fast-fail commands get the short timeout. Others honour
    /// `timeout_seconds` / `timeoutSeconds`, clamped, plus a cushion for the
    /// instance to report back.
    pub fn effective_timeout(&self, command: &Command) -> Duration {
        if TransportConfig::FAST_FAIL_COMMANDS.contains(&command.name.as_str()) {
            return TransportConfig::FAST_FAIL_TIMEOUT;
        }

        let requested = command
            .params
            .get("timeout_seconds")
            .or_else(|| command.params.get("timeoutSeconds"))
            .and_then(Value::as_f64)
            .filter(|secs| secs.is_finite() && *secs > 0.0);

        match requested {
            Some(secs) => {
                let clamped = secs.clamp(
                    TransportConfig::MIN_REQUESTED_TIMEOUT.as_secs_f64(),
                    TransportConfig::MAX_REQUESTED_TIMEOUT.as_secs_f64(),
                );
                Duration::from_secs_f64(clamped) + TransportConfig::SERVER_WAIT_CUSHION
            }
            None => self.default_timeout,
        }
    }

    /// Dispatch a command for `caller`.
    ///
    /// `timeout` overrides the per-command timeout for every send attempt.
    pub async fn dispatch(
        &self,
        command: Command,
        caller: &CallerContext,
        timeout: Option<Duration>,
    ) -> Result<DispatchReceipt> {
        let mut run = DispatchRun {
            command: &command.name,
            correlation_id: &command.correlation_id,
            phase: DispatchPhase::Idle,
        };

        run.advance(DispatchPhase::Resolving);
        let prepared = self.prepare(&command, caller).await;
        let (instance, command_to_send) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                run.advance(DispatchPhase::Failed);
                return Err(e);
            }
        };

        let timeout = timeout.unwrap_or_else(|| self.effective_timeout(&command_to_send));
        let reachability = instance.reachability();
        let transport_kind = reachability.as_ref().map(|r| r.kind()).unwrap_or("none");
        let status_files = match reachability {
            Some(Reachability::Framed { .. }) => self.status_files.as_deref(),
            _ => None,
        };
        let needs_readiness = command_to_send.name != "ping"
            && TransportConfig::FAST_FAIL_COMMANDS.contains(&command_to_send.name.as_str());
        let instance_ref = &instance;

        run.advance(DispatchPhase::Sending);
        let (result, state) = self
            .retry
            .execute(|state| {
                if state.attempt > 1 {
                    run.advance(DispatchPhase::Retrying);
                    run.advance(DispatchPhase::Sending);
                }
                let transport = self.transports.transport_for(&instance);
                let attempt_command = if state.attempt > 1 {
                    command_to_send.reissue()
                } else {
                    command_to_send.clone()
                };
                async move {
                    if let Some(status_files) = status_files {
                        if status_files.reports_reload(instance_ref.identity()).await {
                            return Err(HubError::Reloading {
                                endpoint: instance_ref.identity().to_string(),
                                retry_after: None,
                            });
                        }
                    }
                    let transport = transport?;
                    if needs_readiness {
                        transport.ready(TransportConfig::FAST_FAIL_TIMEOUT).await?;
                    }
                    let response = transport.send(&attempt_command, timeout).await?;
                    into_payload(transport.endpoint(), &attempt_command.name, response)
                }
            })
            .await;

        match result {
            Ok(payload) => {
                run.advance(DispatchPhase::Succeeded);
                info!(
                    "Dispatched '{}' to {} over {} in {} attempt(s)",
                    command.name,
                    instance.identity(),
                    transport_kind,
                    state.attempt
                );
                Ok(DispatchReceipt {
                    correlation_id: command.correlation_id.clone(),
                    instance: instance.identity().clone(),
                    transport: transport_kind,
                    attempts: state.attempt,
                    payload,
                })
            }
            Err(e) => {
                run.advance(DispatchPhase::Failed);
                Err(e)
            }
        }
    }

    /// Resolve the target and check the command against its capabilities.
    async fn prepare(
        &self,
        command: &Command,
        caller: &CallerContext,
    ) -> Result<(InstanceDescriptor, Command)> {
        let instance = self
            .router
            .resolve(command.target_hint.as_deref(), caller)
            .await
            .map_err(|e| e.in_phase(FailurePhase::Resolve))?;

        let target = self
            .capabilities
            .resolve_target(instance.session_id.as_deref(), command)?;

        let command = match target {
            CommandTarget::Builtin(_) => command.clone(),
            CommandTarget::Custom { params, .. } => Command {
                params,
                ..command.clone()
            },
        };

        Ok((instance, command))
    }
}

fn into_payload(endpoint: String, command: &str, response: CommandResponse) -> Result<Value> {
    match response.outcome {
        CommandOutcome::Success(payload) => Ok(payload),
        CommandOutcome::Failure {
            data: Some(data), ..
        } if is_reload_notice(&data) => Err(HubError::Reloading {
            endpoint,
            retry_after: retry_after(&data),
        }),
        CommandOutcome::Failure { message, data } => Err(HubError::Remote {
            command: command.to_string(),
            message,
            data,
        }),
    }
}

/// `{"reason": "reloading"}` or `{"state": "reloading"}`, any case.
fn is_reload_notice(data: &Value) -> bool {
    ["reason", "state"].iter().any(|key| {
        data.get(key)
            .and_then(Value::as_str)
            .is_some_and(|value| value.eq_ignore_ascii_case("reloading"))
    })
}

fn retry_after(data: &Value) -> Option<Duration> {
    data.get("retry_after_ms")
        .and_then(Value::as_f64)
        .filter(|ms| ms.is_finite() && *ms >= 0.0)
        .map(|ms| Duration::from_millis(ms as u64))
}
