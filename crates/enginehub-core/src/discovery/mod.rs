//! Instance discovery from status files.
//!
//! Instances reachable over the framed transport advertise themselves by
//! writing `enginehub-status-<hash>.json` into the status directory. A scan reads
//! every such file, deduplicates by identity (newest `last_seen` wins) and
//! probes each endpoint.
//!
//! Scans are single-flight: callers arriving while a physical scan runs wait
//! for it and share its result. Results are held in a short-TTL cache; entries
//! older than the freshness window are probed again before being served.

mod probe;
mod status_file;

pub use probe::{FramedProbe, LivenessProbe};
pub use status_file::{hash_from_file_name, is_status_file, project_name, StatusFile};

use crate::config::{DiscoveryConfig, HubSettings};
use crate::error::{HubError, Result};
use crate::models::{InstanceDescriptor, InstanceId, InstanceStatus};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use mini_moka::sync::Cache;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SNAPSHOT_KEY: &str = "instances";

/// A descriptor together with when it last passed validation.
#[derive(Debug, Clone)]
struct Validated {
    descriptor: InstanceDescriptor,
    validated_at: Instant,
}

/// Scans the status directory for framed instances.
pub struct InstanceDiscovery {
    status_dir: PathBuf,
    probe: Arc<dyn LivenessProbe>,
    freshness_window: Duration,
    reload_grace: Duration,
    snapshot: Cache<&'static str, Arc<Vec<Validated>>>,
    scan_gate: Mutex<()>,
    scan_count: AtomicU64,
}

impl InstanceDiscovery {
    /// Discovery using the framed ping probe.
    pub fn new(settings: &HubSettings) -> Self {
        let probe = Arc::new(FramedProbe::new(settings.host.clone(), settings.probe_timeout));
        Self::with_probe(settings, probe)
    }

    /// Discovery with a custom liveness probe.
    pub fn with_probe(settings: &HubSettings, probe: Arc<dyn LivenessProbe>) -> Self {
        Self {
            status_dir: settings.status_dir.clone(),
            probe,
            freshness_window: settings.freshness_window,
            reload_grace: settings.reload_grace,
            snapshot: Cache::builder()
                .time_to_live(settings.cache_ttl)
                .max_capacity(1)
                .build(),
            scan_gate: Mutex::new(()),
            scan_count: AtomicU64::new(0),
        }
    }

    pub fn status_dir(&self) -> &Path {
        &self.status_dir
    }

    /// Number of physical directory passes performed so far.
    pub fn scan_count(&self) -> u64 {
        self.scan_count.load(Ordering::SeqCst)
    }

    /// Live framed instances.
    ///
    /// Served from the cache unless `force_refresh` is set. Concurrent calls
    /// collapse into a single physical scan.
    pub async fn scan(&self, force_refresh: bool) -> Result<Vec<InstanceDescriptor>> {
        let passes_before = self.scan_count();

        if !force_refresh {
            if let Some(snapshot) = self.snapshot.get(&SNAPSHOT_KEY) {
                if self.is_fresh(&snapshot) {
                    return Ok(descriptors(&snapshot));
                }
            }
        }

        let _gate = self.scan_gate.lock().await;

        // Another caller may have finished a pass while we waited.
        if let Some(snapshot) = self.snapshot.get(&SNAPSHOT_KEY) {
            let joined_pass = self.scan_count() > passes_before;
            if joined_pass || (!force_refresh && self.is_fresh(&snapshot)) {
                return Ok(descriptors(&snapshot));
            }
            if !force_refresh {
                let revalidated = self.revalidate(&snapshot).await;
                let result = descriptors(&revalidated);
                self.snapshot.insert(SNAPSHOT_KEY, Arc::new(revalidated));
                return Ok(result);
            }
        }

        let found = self.read_descriptors().await?;
        let validated = self.validate_all(found).await;
        let result = descriptors(&validated);
        info!(
            "Discovered {} live instance(s) in {}",
            result.len(),
            self.status_dir.display()
        );
        self.snapshot.insert(SNAPSHOT_KEY, Arc::new(validated));
        Ok(result)
    }

    /// Descriptors from the last successful scan, without touching the disk.
    ///
    /// Empty once the cache entry has expired.
    pub fn cached(&self) -> Vec<InstanceDescriptor> {
        self.snapshot
            .get(&SNAPSHOT_KEY)
            .map(|snapshot| descriptors(&snapshot))
            .unwrap_or_default()
    }

    /// Whether `identity`'s status file reports a reload right now.
    ///
    /// Read from disk on every call. A missing or unreadable file reports none.
    pub async fn reports_reload(&self, identity: &InstanceId) -> bool {
        let path = self.status_dir.join(format!(
            "{}{}{}",
            DiscoveryConfig::STATUS_FILE_PREFIX,
            identity.hash,
            DiscoveryConfig::STATUS_FILE_SUFFIX
        ));
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    debug!("Could not read {}: {}", path.display(), e);
                }
                return false;
            }
        };
        match serde_json::from_slice::<StatusFile>(&bytes) {
            Ok(file) => file.reports_reload(),
            Err(e) => {
                debug!("Ignoring unparsable {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Drop the cached snapshot.
    pub fn invalidate(&self) {
        self.snapshot.invalidate_all();
    }

    /// One physical pass over the status directory.
    ///
    /// Malformed, partial or vanished files are skipped. Descriptors are
    /// deduplicated by identity, newest `last_seen` first.
    pub async fn read_descriptors(&self) -> Result<Vec<InstanceDescriptor>> {
        self.scan_count.fetch_add(1, Ordering::SeqCst);

        let mut entries = match tokio::fs::read_dir(&self.status_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Status directory {} does not exist", self.status_dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(HubError::io_with_path(e, &self.status_dir)),
        };

        let mut by_identity: HashMap<InstanceId, InstanceDescriptor> = HashMap::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| HubError::io_with_path(e, &self.status_dir))?
        {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !is_status_file(file_name) {
                continue;
            }

            let path = entry.path();
            let descriptor = match read_status_file(&path).await {
                Ok(descriptor) => descriptor,
                Err(reason) => {
                    warn!("Skipping status file {}: {}", path.display(), reason);
                    continue;
                }
            };

            match by_identity.get(descriptor.identity()) {
                Some(existing) if existing.last_seen >= descriptor.last_seen => {
                    debug!(
                        "Skipping older status entry {} for {}",
                        path.display(),
                        descriptor.identity()
                    );
                }
                _ => {
                    by_identity.insert(descriptor.identity().clone(), descriptor);
                }
            }
        }

        let mut found: Vec<InstanceDescriptor> = by_identity.into_values().collect();
        found.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then_with(|| a.id.cmp(&b.id)));
        Ok(found)
    }

    /// Probe one descriptor.
    ///
    /// A failed probe marks it `Stale`, unless it reported a reload within the
    /// grace window, in which case it stays `Busy`.
    pub async fn validate_live(&self, mut descriptor: InstanceDescriptor) -> InstanceDescriptor {
        match self.probe.probe(&descriptor).await {
            Ok(()) => {
                if descriptor.status == InstanceStatus::Stale {
                    descriptor.status = InstanceStatus::Ready;
                }
            }
            Err(e) => {
                let age = Utc::now()
                    .signed_duration_since(descriptor.last_seen)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if descriptor.is_reloading() && age < self.reload_grace {
                    debug!(
                        "{} failed its probe while reloading ({}); keeping it",
                        descriptor.identity(),
                        e
                    );
                    descriptor.status = InstanceStatus::Busy;
                } else {
                    debug!("{} failed its probe: {}", descriptor.identity(), e);
                    descriptor.status = InstanceStatus::Stale;
                }
            }
        }
        descriptor
    }

    async fn validate_all(&self, found: Vec<InstanceDescriptor>) -> Vec<Validated> {
        let checked = join_all(found.into_iter().map(|d| self.validate_live(d))).await;
        let now = Instant::now();
        checked
            .into_iter()
            .filter(|d| d.status.is_routable())
            .map(|descriptor| Validated {
                descriptor,
                validated_at: now,
            })
            .collect()
    }

    async fn revalidate(&self, snapshot: &[Validated]) -> Vec<Validated> {
        let (fresh, expired): (Vec<Validated>, Vec<Validated>) = snapshot
            .iter()
            .cloned()
            .partition(|v| v.validated_at.elapsed() < self.freshness_window);

        let mut result = fresh;
        result.extend(
            self.validate_all(expired.into_iter().map(|v| v.descriptor).collect())
                .await,
        );
        result.sort_by(|a, b| {
            b.descriptor
                .last_seen
                .cmp(&a.descriptor.last_seen)
                .then_with(|| a.descriptor.id.cmp(&b.descriptor.id))
        });
        result
    }

    fn is_fresh(&self, snapshot: &[Validated]) -> bool {
        snapshot
            .iter()
            .all(|v| v.validated_at.elapsed() < self.freshness_window)
    }
}

fn descriptors(snapshot: &[Validated]) -> Vec<InstanceDescriptor> {
    snapshot.iter().map(|v| v.descriptor.clone()).collect()
}

async fn read_status_file(path: &Path) -> std::result::Result<InstanceDescriptor, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    let modified: DateTime<Utc> = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    let file: StatusFile = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;
    file.into_descriptor(path, modified)
}
