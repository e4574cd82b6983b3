//! Centralized configuration for the engine hub.
//!
//! Constant structs hold the conservative policy defaults. `HubSettings` is the
//! runtime view, built from those defaults plus environment overrides.

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Instance discovery configuration.
pub struct DiscoveryConfig;

impl DiscoveryConfig {
    pub const STATUS_DIR_NAME: &'static str = ".enginehub";
    pub const STATUS_FILE_PREFIX: &'static str = "enginehub-status-";
    pub const STATUS_FILE_SUFFIX: &'static str = ".json";
    /// How long a scan result serves bursts of callers.
    pub const CACHE_TTL: Duration = Duration::from_secs(5);
    /// Cached entries older than this are probed again before use.
    pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(2);
    pub const PROBE_TIMEOUT: Duration = Duration::from_millis(300);
    /// A reloading instance that fails its probe is kept this long after its last heartbeat.
    pub const RELOAD_GRACE: Duration = Duration::from_secs(60);
    /// Largest reply accepted by the liveness ping.
    pub const MAX_PROBE_RESPONSE: usize = 10_000;
}

/// Transport configuration shared by both transports.
pub struct TransportConfig;

impl TransportConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
    pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
    pub const FAST_FAIL_TIMEOUT: Duration = Duration::from_secs(2);
    pub const FAST_FAIL_COMMANDS: &'static [&'static str] =
        &["ping", "read_console", "get_editor_state"];
    pub const MIN_REQUESTED_TIMEOUT: Duration = Duration::from_secs(1);
    pub const MAX_REQUESTED_TIMEOUT: Duration = Duration::from_secs(60 * 60);
    /// Extra time the hub waits beyond the timeout it forwards to an instance.
    pub const SERVER_WAIT_CUSHION: Duration = Duration::from_secs(5);
    /// Zero-length frames tolerated while a framed command is still running.
    pub const MAX_HEARTBEAT_FRAMES: u32 = 16;
    pub const WRITER_QUEUE_DEPTH: usize = 64;
    pub const CONTROL_QUEUE_DEPTH: usize = 64;
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
    pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
    pub const MAX_CHANNEL_CONNECTIONS: usize = 64;
}

/// Default retry policy constants.
pub struct RetryDefaults;

impl RetryDefaults {
    pub const MAX_ATTEMPTS: u32 = 3;
    pub const BASE_DELAY: Duration = Duration::from_millis(250);
    pub const MAX_DELAY: Duration = Duration::from_secs(3);
    pub const EXPONENTIAL_BASE: f64 = 2.0;
    /// Jitter multiplies each delay by a factor in `[JITTER_MIN, JITTER_MAX)`.
    pub const JITTER_MIN: f64 = 0.5;
    pub const JITTER_MAX: f64 = 1.5;
    /// How long a command keeps waiting on an instance that reports a reload.
    pub const RELOAD_MAX_WAIT: Duration = Duration::from_secs(2);
    pub const RELOAD_WAIT_CAP: Duration = Duration::from_secs(30);
    pub const RELOAD_MAX_RETRIES: u32 = 40;
    /// Pause between reload checks when the instance names none.
    pub const RELOAD_RETRY_DELAY: Duration = Duration::from_millis(250);
    /// Bounds applied to an instance's `retry_after_ms`.
    pub const RELOAD_MIN_DELAY: Duration = Duration::from_millis(50);
    pub const RELOAD_MAX_DELAY: Duration = Duration::from_millis(250);
}

/// Routing configuration.
pub struct RoutingConfig;

impl RoutingConfig {
    pub const DEFAULT_CALLER: &'static str = "global";
    pub const SESSION_RESOLVE_MAX_WAIT: Duration = Duration::from_secs(2);
    pub const SESSION_RESOLVE_WAIT_CAP: Duration = Duration::from_secs(30);
    pub const SESSION_RESOLVE_POLL: Duration = Duration::from_millis(250);
}

/// Commands every instance understands without announcing them.
pub const BUILTIN_COMMANDS: &[&str] = &[
    "ping",
    "get_editor_state",
    "read_console",
    "refresh",
    "execute_menu_item",
    "manage_asset",
    "manage_scene",
    "manage_object",
    "manage_script",
    "manage_editor",
    "run_tests",
    "batch_execute",
];

/// Runtime settings for an `EngineHub`.
#[derive(Debug, Clone)]
pub struct HubSettings {
    /// Directory scanned for instance descriptor files.
    pub status_dir: PathBuf,
    /// Host used for framed connections and probes.
    pub host: String,
    /// Fallback pin applied to caller contexts without one.
    pub default_instance: Option<String>,
    pub cache_ttl: Duration,
    pub freshness_window: Duration,
    pub probe_timeout: Duration,
    pub reload_grace: Duration,
    /// How long resolution waits for an instance to (re)appear.
    pub session_resolve_wait: Duration,
    pub command_timeout: Duration,
    /// How long a command waits through an instance reload.
    pub reload_wait: Duration,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            status_dir: default_status_dir(),
            host: TransportConfig::DEFAULT_HOST.to_string(),
            default_instance: None,
            cache_ttl: DiscoveryConfig::CACHE_TTL,
            freshness_window: DiscoveryConfig::FRESHNESS_WINDOW,
            probe_timeout: DiscoveryConfig::PROBE_TIMEOUT,
            reload_grace: DiscoveryConfig::RELOAD_GRACE,
            session_resolve_wait: RoutingConfig::SESSION_RESOLVE_MAX_WAIT,
            command_timeout: TransportConfig::COMMAND_TIMEOUT,
            reload_wait: RetryDefaults::RELOAD_MAX_WAIT,
        }
    }
}

impl HubSettings {
    pub const ENV_STATUS_DIR: &'static str = "ENGINEHUB_STATUS_DIR";
    pub const ENV_DEFAULT_INSTANCE: &'static str = "ENGINEHUB_DEFAULT_INSTANCE";
    pub const ENV_RESOLVE_WAIT: &'static str = "ENGINEHUB_SESSION_RESOLVE_MAX_WAIT_S";
    pub const ENV_HOST: &'static str = "ENGINEHUB_HOST";
    pub const ENV_RELOAD_WAIT: &'static str = "ENGINEHUB_RELOAD_MAX_WAIT_S";

    /// Build settings from the defaults plus environment overrides.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(dir) = lookup(Self::ENV_STATUS_DIR).filter(|v| !v.trim().is_empty()) {
            settings.status_dir = PathBuf::from(dir);
        }

        if let Some(host) = lookup(Self::ENV_HOST).filter(|v| !v.trim().is_empty()) {
            settings.host = host.trim().to_string();
        }

        settings.default_instance = lookup(Self::ENV_DEFAULT_INSTANCE)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        if let Some(raw) = lookup(Self::ENV_RESOLVE_WAIT) {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() => {
                    settings.session_resolve_wait =
                        clamp_secs(secs, RoutingConfig::SESSION_RESOLVE_WAIT_CAP);
                }
                _ => warn!(
                    "Invalid {}={:?}, using default {:?}",
                    Self::ENV_RESOLVE_WAIT,
                    raw,
                    RoutingConfig::SESSION_RESOLVE_MAX_WAIT
                ),
            }
        }

        if let Some(raw) = lookup(Self::ENV_RELOAD_WAIT) {
            match raw.trim().parse::<f64>() {
                Ok(secs) if secs.is_finite() => {
                    settings.reload_wait = clamp_secs(secs, RetryDefaults::RELOAD_WAIT_CAP);
                }
                _ => warn!(
                    "Invalid {}={:?}, using default {:?}",
                    Self::ENV_RELOAD_WAIT,
                    raw,
                    RetryDefaults::RELOAD_MAX_WAIT
                ),
            }
        }

        settings
    }

    pub fn with_status_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.status_dir = dir.into();
        self
    }

    pub fn with_session_resolve_wait(mut self, wait: Duration) -> Self {
        self.session_resolve_wait = wait.min(RoutingConfig::SESSION_RESOLVE_WAIT_CAP);
        self
    }

    pub fn with_default_instance(mut self, identity: impl Into<String>) -> Self {
        self.default_instance = Some(identity.into());
        self
    }

    pub fn with_reload_wait(mut self, wait: Duration) -> Self {
        self.reload_wait = wait.min(RetryDefaults::RELOAD_WAIT_CAP);
        self
    }
}

/// Seconds clamped to `[0, cap]`. `secs` must be finite.
fn clamp_secs(secs: f64, cap: Duration) -> Duration {
    Duration::from_secs_f64(secs.clamp(0.0, cap.as_secs_f64()))
}

/// `~/.enginehub`, or a relative `.enginehub` when no home directory exists.
pub fn default_status_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DiscoveryConfig::STATUS_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(DiscoveryConfig::STATUS_DIR_NAME))
}

/// Whether a command name belongs to the fixed built-in set.
pub fn is_builtin_command(name: &str) -> bool {
    BUILTIN_COMMANDS.contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_env_overrides() {
        let settings = HubSettings::from_lookup(lookup(&[
            (HubSettings::ENV_STATUS_DIR, "/tmp/hub-status"),
            (HubSettings::ENV_DEFAULT_INSTANCE, " Alpha@111 "),
            (HubSettings::ENV_RESOLVE_WAIT, "0.5"),
        ]));

        assert_eq!(settings.status_dir, PathBuf::from("/tmp/hub-status"));
        assert_eq!(settings.default_instance.as_deref(), Some("Alpha@111"));
        assert_eq!(settings.session_resolve_wait, Duration::from_millis(500));
    }

    #[test]
    fn test_resolve_wait_is_clamped() {
        let settings = HubSettings::from_lookup(lookup(&[(HubSettings::ENV_RESOLVE_WAIT, "999")]));
        assert_eq!(settings.session_resolve_wait, RoutingConfig::SESSION_RESOLVE_WAIT_CAP);

        let settings = HubSettings::from_lookup(lookup(&[(HubSettings::ENV_RESOLVE_WAIT, "-3")]));
        assert_eq!(settings.session_resolve_wait, Duration::ZERO);
    }

    #[test]
    fn test_invalid_resolve_wait_keeps_default() {
        let settings = HubSettings::from_lookup(lookup(&[(HubSettings::ENV_RESOLVE_WAIT, "soon")]));
        assert_eq!(
            settings.session_resolve_wait,
            RoutingConfig::SESSION_RESOLVE_MAX_WAIT
        );
    }

    #[test]
    fn test_reload_wait_override_is_clamped() {
        let settings = HubSettings::from_lookup(lookup(&[(HubSettings::ENV_RELOAD_WAIT, "0.75")]));
        assert_eq!(settings.reload_wait, Duration::from_millis(750));

        let settings = HubSettings::from_lookup(lookup(&[(HubSettings::ENV_RELOAD_WAIT, "1e20")]));
        assert_eq!(settings.reload_wait, RetryDefaults::RELOAD_WAIT_CAP);

        let settings = HubSettings::from_lookup(lookup(&[(HubSettings::ENV_RELOAD_WAIT, "later")]));
        assert_eq!(settings.reload_wait, RetryDefaults::RELOAD_MAX_WAIT);
    }

    #[test]
    fn test_timeouts_are_reasonable() {
        assert!(DiscoveryConfig::FRESHNESS_WINDOW < DiscoveryConfig::CACHE_TTL);
        assert!(TransportConfig::FAST_FAIL_TIMEOUT < TransportConfig::COMMAND_TIMEOUT);
        assert!(is_builtin_command("ping"));
        assert!(!is_builtin_command("bake_lighting"));
    }
}
