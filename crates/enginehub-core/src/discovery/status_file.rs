//! Parsing of per-instance status files.

use crate::config::DiscoveryConfig;
use crate::models::{InstanceDescriptor, InstanceId, InstanceStatus};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;

/// On-disk shape of `enginehub-status-<hash>.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub status: Option<InstanceStatus>,
    #[serde(default)]
    pub reloading: bool,
    /// Why the instance is unavailable, e.g. `"reloading"`.
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default, alias = "last_heartbeat")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub engine_version: Option<String>,
}

/// Whether a file name looks like a status file.
pub fn is_status_file(file_name: &str) -> bool {
    file_name.starts_with(DiscoveryConfig::STATUS_FILE_PREFIX)
        && file_name.ends_with(DiscoveryConfig::STATUS_FILE_SUFFIX)
        && file_name.len()
            > DiscoveryConfig::STATUS_FILE_PREFIX.len() + DiscoveryConfig::STATUS_FILE_SUFFIX.len()
}

/// The `<hash>` part of a status file name.
pub fn hash_from_file_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix(DiscoveryConfig::STATUS_FILE_PREFIX)?
        .strip_suffix(DiscoveryConfig::STATUS_FILE_SUFFIX)
        .filter(|hash| !hash.is_empty())
}

/// Project name from a project path, skipping a trailing `Assets` folder.
///
/// `/work/MyGame/Assets` and `C:\work\MyGame\` both give `MyGame`.
pub fn project_name(project_path: &str) -> Option<String> {
    let mut parts = project_path
        .split(['/', '\\'])
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>();
    if parts.last() == Some(&"Assets") {
        parts.pop();
    }
    parts
        .last()
        .filter(|part| !part.ends_with(':'))
        .map(|part| part.to_string())
}

impl StatusFile {
    /// Set by either the `reloading` flag or `reason: "reloading"`.
    pub fn reports_reload(&self) -> bool {
        self.reloading
            || self
                .reason
                .as_deref()
                .is_some_and(|reason| reason.eq_ignore_ascii_case("reloading"))
    }

    /// Build a descriptor, deriving missing identity fields.
    ///
    /// `fallback_seen` (the file mtime) stands in for a missing `last_seen`.
    pub fn into_descriptor(
        self,
        path: &Path,
        fallback_seen: DateTime<Utc>,
    ) -> Result<InstanceDescriptor, String> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default();

        let reloading = self.reports_reload();

        let hash = self
            .hash
            .filter(|h| !h.trim().is_empty())
            .or_else(|| hash_from_file_name(file_name).map(str::to_string))
            .ok_or_else(|| "no instance hash".to_string())?;

        let name = self
            .name
            .filter(|n| !n.trim().is_empty())
            .or_else(|| project_name(&self.project_path))
            .ok_or_else(|| "no instance name or project path".to_string())?;

        let port = self
            .port
            .filter(|p| *p != 0)
            .ok_or_else(|| "no usable port".to_string())?;

        let status = if reloading {
            InstanceStatus::Busy
        } else {
            self.status.unwrap_or(InstanceStatus::Ready)
        };

        Ok(InstanceDescriptor {
            id: InstanceId::new(name.clone(), hash.clone()),
            name,
            hash,
            project_path: self.project_path,
            port: Some(port),
            status,
            session_id: None,
            last_seen: self.last_seen.unwrap_or(fallback_seen),
            pid: self.pid,
            engine_version: self.engine_version,
            reloading,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_file_name_matching() {
        assert!(is_status_file("enginehub-status-abc.json"));
        assert!(!is_status_file("enginehub-status-.json"));
        assert!(!is_status_file("enginehub-port.json"));
        assert_eq!(hash_from_file_name("enginehub-status-abc.json"), Some("abc"));
    }

    #[test]
    fn test_project_name_derivation() {
        assert_eq!(project_name("/work/MyGame/Assets").as_deref(), Some("MyGame"));
        assert_eq!(project_name("C:\\Projects\\Test\\").as_deref(), Some("Test"));
        assert_eq!(project_name(""), None);
    }

    #[test]
    fn test_missing_fields_are_derived() {
        let file: StatusFile = serde_json::from_str(
            r#"{"project_path":"/work/Alpha/Assets","port":6400,"reloading":true}"#,
        )
        .unwrap();
        let seen = Utc::now();
        let desc = file
            .into_descriptor(&PathBuf::from("/tmp/enginehub-status-111.json"), seen)
            .unwrap();

        assert_eq!(desc.id.to_string(), "Alpha@111");
        assert_eq!(desc.status, InstanceStatus::Busy);
        assert_eq!(desc.last_seen, seen);
    }

    #[test]
    fn test_port_is_required() {
        let file: StatusFile = serde_json::from_str(r#"{"name":"Alpha","hash":"111"}"#).unwrap();
        assert!(file
            .into_descriptor(&PathBuf::from("enginehub-status-111.json"), Utc::now())
            .is_err());
    }

    #[test]
    fn test_reason_reloading_counts_as_reload() {
        let file: StatusFile =
            serde_json::from_str(r#"{"name":"Alpha","port":6400,"reason":"Reloading"}"#).unwrap();
        assert!(file.reports_reload());

        let file: StatusFile = serde_json::from_str(r#"{"name":"Alpha","port":6400}"#).unwrap();
        assert!(!file.reports_reload());
    }
}
