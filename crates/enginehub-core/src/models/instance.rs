//! Instance identity and descriptor types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of an engine instance: its project name plus a stable hash.
///
/// Rendered as `name@hash`. Immutable for the lifetime of a live instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId {
    pub name: String,
    pub hash: String,
}

impl InstanceId {
    pub fn new(name: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.hash)
    }
}

impl FromStr for InstanceId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once('@') {
            Some((name, hash)) if !name.is_empty() && !hash.is_empty() => {
                Ok(InstanceId::new(name, hash))
            }
            _ => Err(format!("'{}' is not of the form name@hash", s)),
        }
    }
}

impl Serialize for InstanceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    #[default]
    Ready,
    Busy,
    Stale,
    Gone,
}

impl InstanceStatus {
    /// Whether commands may be routed to an instance in this status.
    pub fn is_routable(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Starting | InstanceStatus::Ready | InstanceStatus::Busy
        )
    }
}

/// How an instance is reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reachability {
    /// Connect-per-call framed socket on a loopback port.
    Framed { port: u16 },
    /// Long-lived channel the instance opened to the hub.
    Channel { session_id: String },
}

impl Reachability {
    pub fn kind(&self) -> &'static str {
        match self {
            Reachability::Framed { .. } => "framed",
            Reachability::Channel { .. } => "channel",
        }
    }
}

/// Everything the hub knows about one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    pub id: InstanceId,
    pub name: String,
    pub hash: String,
    #[serde(default)]
    pub project_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    /// Set when the instance announced a reload in progress.
    #[serde(default)]
    pub reloading: bool,
}

impl InstanceDescriptor {
    pub fn new(name: impl Into<String>, hash: impl Into<String>) -> Self {
        let name = name.into();
        let hash = hash.into();
        Self {
            id: InstanceId::new(name.clone(), hash.clone()),
            name,
            hash,
            project_path: String::new(),
            port: None,
            status: InstanceStatus::Ready,
            session_id: None,
            last_seen: Utc::now(),
            pid: None,
            engine_version: None,
            reloading: false,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_project_path(mut self, path: impl Into<String>) -> Self {
        self.project_path = path.into();
        self
    }

    pub fn identity(&self) -> &InstanceId {
        &self.id
    }

    /// A channel session wins over a framed port when both are known.
    pub fn reachability(&self) -> Option<Reachability> {
        if let Some(session_id) = &self.session_id {
            return Some(Reachability::Channel {
                session_id: session_id.clone(),
            });
        }
        self.port.map(|port| Reachability::Framed { port })
    }

    /// Whether the instance is marked as mid-reload.
    pub fn is_reloading(&self) -> bool {
        self.reloading || self.status == InstanceStatus::Busy
    }
}

/// A live channel session as reported by `list_sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub identity: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_version: Option<String>,
    pub connected_at: DateTime<Utc>,
    /// Last keepalive answer, or registration time if none yet.
    pub last_seen: DateTime<Utc>,
}
