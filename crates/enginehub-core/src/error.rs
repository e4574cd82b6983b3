//! Error types for the engine hub.
//!
//! Every failure a caller can observe is classified here before it reaches the
//! retry policy, so retry decisions never inspect error strings.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The part of a dispatch in which a connection failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePhase {
    /// Resolving which instance a command goes to.
    Resolve,
    /// Writing the command or awaiting its response.
    Send,
    /// Liveness probe during discovery.
    Probe,
    /// Inbound channel handshake.
    Handshake,
}

/// Why a connection failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// Nothing is listening on the endpoint.
    Refused,
    /// The peer reset or aborted the connection.
    Reset,
    /// The peer went away while a response was being read (typically a reload).
    ClosedMidRead,
    /// A session channel closed while the request was pending.
    ChannelClosed,
    /// No live channel exists for the session.
    NotConnected,
    /// Any other transport-level failure.
    Unreachable,
}

impl ConnectionFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionFailure::Refused => "refused",
            ConnectionFailure::Reset => "reset",
            ConnectionFailure::ClosedMidRead => "closed_mid_read",
            ConnectionFailure::ChannelClosed => "channel_closed",
            ConnectionFailure::NotConnected => "not_connected",
            ConnectionFailure::Unreachable => "unreachable",
        }
    }

    /// Classify an I/O error raised while talking to a peer.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => ConnectionFailure::Refused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ConnectionFailure::Reset
            }
            ErrorKind::UnexpectedEof => ConnectionFailure::ClosedMidRead,
            ErrorKind::NotConnected => ConnectionFailure::NotConnected,
            _ => ConnectionFailure::Unreachable,
        }
    }
}

impl std::fmt::Display for ConnectionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable, structured error kind surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Protocol,
    Timeout,
    UnknownInstance,
    AmbiguousTarget,
    NoInstance,
    InvalidCapability,
    Reloading,
    Dispatch,
    Remote,
    InvalidParams,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection_error",
            ErrorKind::Protocol => "protocol_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UnknownInstance => "unknown_instance",
            ErrorKind::AmbiguousTarget => "ambiguous_target",
            ErrorKind::NoInstance => "no_instance",
            ErrorKind::InvalidCapability => "invalid_capability",
            ErrorKind::Reloading => "reloading",
            ErrorKind::Dispatch => "dispatch_error",
            ErrorKind::Remote => "remote_error",
            ErrorKind::InvalidParams => "invalid_params",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for the engine hub.
#[derive(Debug, Error)]
pub enum HubError {
    // Transport errors
    #[error("Connection to {endpoint} failed ({reason}): {message}")]
    Connection {
        endpoint: String,
        phase: FailurePhase,
        reason: ConnectionFailure,
        message: String,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    // Routing errors
    #[error("Instance '{hint}' not found. Available instances: [{}]", .available.join(", "))]
    UnknownInstance { hint: String, available: Vec<String> },

    #[error(
        "Multiple instances are live; call set_active_instance with one of: [{}]",
        .available.join(", ")
    )]
    AmbiguousTarget { available: Vec<String> },

    #[error("No engine instances are currently live")]
    NoInstance,

    // Capability errors
    #[error("Command '{command}' is not available: {message}")]
    InvalidCapability {
        command: String,
        session_id: Option<String>,
        message: String,
    },

    // Dispatch errors
    #[error("{endpoint} is reloading; retry shortly")]
    Reloading {
        endpoint: String,
        /// Pause the instance asked for before the next attempt.
        retry_after: Option<Duration>,
    },

    #[error("Dispatch failed after {attempts} attempt(s): {source}")]
    Dispatch {
        attempts: u32,
        #[source]
        source: Box<HubError>,
    },

    #[error("Instance rejected '{command}': {message}")]
    Remote {
        command: String,
        message: String,
        data: Option<serde_json::Value>,
    },

    // Ambient errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, HubError>;

impl From<std::io::Error> for HubError {
    fn from(err: std::io::Error) -> Self {
        HubError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        HubError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl HubError {
    /// Build a connection error.
    pub fn connection(
        endpoint: impl Into<String>,
        phase: FailurePhase,
        reason: ConnectionFailure,
        message: impl Into<String>,
    ) -> Self {
        HubError::Connection {
            endpoint: endpoint.into(),
            phase,
            reason,
            message: message.into(),
        }
    }

    /// Classify an I/O failure against a peer as a connection error.
    pub fn from_io(err: std::io::Error, endpoint: impl Into<String>, phase: FailurePhase) -> Self {
        HubError::Connection {
            endpoint: endpoint.into(),
            phase,
            reason: ConnectionFailure::from_io(&err),
            message: err.to_string(),
        }
    }

    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        HubError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        HubError::Protocol {
            message: message.into(),
        }
    }

    /// Re-tag a connection error with the phase it was observed in.
    ///
    /// Other variants are returned unchanged.
    pub fn in_phase(self, phase: FailurePhase) -> Self {
        match self {
            HubError::Connection {
                endpoint,
                reason,
                message,
                ..
            } => HubError::Connection {
                endpoint,
                phase,
                reason,
                message,
            },
            other => other,
        }
    }

    /// The structured kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HubError::Connection { .. } => ErrorKind::Connection,
            HubError::Protocol { .. } | HubError::Json { .. } => ErrorKind::Protocol,
            HubError::Timeout { .. } => ErrorKind::Timeout,
            HubError::UnknownInstance { .. } => ErrorKind::UnknownInstance,
            HubError::AmbiguousTarget { .. } => ErrorKind::AmbiguousTarget,
            HubError::NoInstance => ErrorKind::NoInstance,
            HubError::InvalidCapability { .. } => ErrorKind::InvalidCapability,
            HubError::Reloading { .. } => ErrorKind::Reloading,
            HubError::Dispatch { .. } => ErrorKind::Dispatch,
            HubError::Remote { .. } => ErrorKind::Remote,
            HubError::InvalidParams { .. } => ErrorKind::InvalidParams,
            HubError::Io { .. } | HubError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Only connection failures observed while sending are transient.
    ///
    /// Reloads are waited out separately, see [`HubError::is_reloading`].
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            HubError::Connection {
                phase: FailurePhase::Send,
                ..
            }
        )
    }

    pub fn is_reloading(&self) -> bool {
        matches!(self, HubError::Reloading { .. })
    }

    /// Pause requested by a reloading instance.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root_cause() {
            HubError::Reloading { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// The innermost error, looking through retry exhaustion.
    pub fn root_cause(&self) -> &HubError {
        match self {
            HubError::Dispatch { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Identities a caller can pin, for routing failures that name them.
    pub fn available_instances(&self) -> Option<&[String]> {
        match self.root_cause() {
            HubError::UnknownInstance { available, .. }
            | HubError::AmbiguousTarget { available } => Some(available),
            _ => None,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Connection, timeout, reload in progress or exhausted retries
    /// - -32001: Unknown instance
    /// - -32002: Ambiguous target
    /// - -32003: No instance
    /// - -32004: Invalid capability
    /// - -32005: Protocol error
    /// - -32006: Instance reported a failure
    pub fn to_rpc_error_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Connection
            | ErrorKind::Timeout
            | ErrorKind::Reloading
            | ErrorKind::Dispatch => -32000,
            ErrorKind::UnknownInstance => -32001,
            ErrorKind::AmbiguousTarget => -32002,
            ErrorKind::NoInstance => -32003,
            ErrorKind::InvalidCapability => -32004,
            ErrorKind::Protocol => -32005,
            ErrorKind::Remote => -32006,
            ErrorKind::InvalidParams => -32602,
            ErrorKind::Internal => -32603,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_target_names_every_instance() {
        let err = HubError::AmbiguousTarget {
            available: vec!["Alpha@111".into(), "Beta@222".into()],
        };
        let text = err.to_string();
        assert!(text.contains("Alpha@111"));
        assert!(text.contains("Beta@222"));
        assert_eq!(err.available_instances().unwrap().len(), 2);
    }

    #[test]
    fn test_only_send_phase_connection_errors_retry() {
        let send = HubError::connection(
            "127.0.0.1:6400",
            FailurePhase::Send,
            ConnectionFailure::ClosedMidRead,
            "eof",
        );
        assert!(send.is_retryable());

        let resolve = send.in_phase(FailurePhase::Resolve);
        assert!(!resolve.is_retryable());

        assert!(!HubError::protocol("bad frame").is_retryable());
        assert!(!HubError::NoInstance.is_retryable());
        assert!(!HubError::Timeout {
            operation: "send".into(),
            after: Duration::from_secs(1),
        }
        .is_retryable());
    }

    #[test]
    fn test_io_classification() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert_eq!(ConnectionFailure::from_io(&eof), ConnectionFailure::ClosedMidRead);

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no");
        assert_eq!(ConnectionFailure::from_io(&refused), ConnectionFailure::Refused);
    }

    #[test]
    fn test_dispatch_error_exposes_root_cause() {
        let err = HubError::Dispatch {
            attempts: 3,
            source: Box::new(HubError::connection(
                "session:abc",
                FailurePhase::Send,
                ConnectionFailure::ChannelClosed,
                "closed",
            )),
        };
        assert_eq!(err.kind(), ErrorKind::Dispatch);
        assert_eq!(err.root_cause().kind(), ErrorKind::Connection);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(HubError::NoInstance.to_rpc_error_code(), -32003);
        assert_eq!(
            HubError::AmbiguousTarget { available: vec![] }.to_rpc_error_code(),
            -32002
        );
        assert_eq!(HubError::protocol("x").to_rpc_error_code(), -32005);
    }

    #[test]
    fn test_reloading_is_waited_not_retried() {
        let err = HubError::Reloading {
            endpoint: "127.0.0.1:6400".into(),
            retry_after: Some(Duration::from_millis(120)),
        };
        assert_eq!(err.kind(), ErrorKind::Reloading);
        assert!(err.is_reloading());
        assert!(!err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(120)));
        assert_eq!(err.to_rpc_error_code(), -32000);
    }
}
