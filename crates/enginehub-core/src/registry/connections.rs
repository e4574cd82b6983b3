//! Session identity to live channel mapping.
//!
//! Lock order: the connection map first, then the capability registry. Both are
//! updated under the connection write lock so no lookup observes a session
//! without its capabilities or capabilities without their session.

use super::capabilities::CapabilityRegistry;
use crate::models::{CapabilityDescriptor, InstanceDescriptor, InstanceId, SessionSummary};
use crate::transport::SessionChannelClient;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

/// Key for [`ConnectionRegistry::lookup`].
#[derive(Debug, Clone, Copy)]
pub enum SessionKey<'a> {
    Session(&'a str),
    Identity(&'a InstanceId),
}

struct SessionEntry {
    channel: Arc<SessionChannelClient>,
    descriptor: InstanceDescriptor,
    connected_at: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

/// Outcome of [`ConnectionRegistry::register`].
#[derive(Debug)]
pub struct Registered {
    /// Id the session was stored under.
    pub session_id: String,
    /// Channels replaced by this registration; close them.
    pub superseded: Vec<Arc<SessionChannelClient>>,
}

#[derive(Default)]
struct Sessions {
    by_session: HashMap<String, SessionEntry>,
    by_identity: HashMap<InstanceId, String>,
}

/// Live channel sessions, at most one per instance identity.
pub struct ConnectionRegistry {
    sessions: RwLock<Sessions>,
    capabilities: Arc<CapabilityRegistry>,
}

impl ConnectionRegistry {
    pub fn new(capabilities: Arc<CapabilityRegistry>) -> Self {
        Self {
            sessions: RwLock::new(Sessions::default()),
            capabilities,
        }
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    /// Store a session and its capabilities.
    ///
    /// The effective session id is settled under the write lock: `proposed` is
    /// kept unless another identity holds it, in which case a fresh id is
    /// minted. `open` is called with that id to start the channel. Any prior
    /// session for the same identity is removed along with its capabilities
    /// and returned so the caller can close its channel outside the lock.
    pub fn register<F>(
        &self,
        proposed: Option<&str>,
        descriptor: InstanceDescriptor,
        capabilities: Vec<CapabilityDescriptor>,
        open: F,
    ) -> Registered
    where
        F: FnOnce(&str) -> Arc<SessionChannelClient>,
    {
        let identity = descriptor.identity().clone();
        let mut superseded = Vec::new();

        let session_id = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

            let session_id = match proposed.map(str::trim).filter(|id| !id.is_empty()) {
                Some(id) => match sessions.by_session.get(id) {
                    Some(holder) if holder.descriptor.identity() != &identity => {
                        warn!(
                            "Session id {} is held by {}; issuing a fresh one for {}",
                            id,
                            holder.descriptor.identity(),
                            identity
                        );
                        Uuid::new_v4().to_string()
                    }
                    _ => id.to_string(),
                },
                None => Uuid::new_v4().to_string(),
            };

            if let Some(prior_id) = sessions.by_identity.get(&identity).cloned() {
                if prior_id != session_id {
                    if let Some(prior) = sessions.by_session.remove(&prior_id) {
                        self.capabilities.purge(&prior_id);
                        warn!(
                            "Session {} for {} superseded by {}",
                            prior_id, identity, session_id
                        );
                        superseded.push(prior.channel);
                    }
                }
            }

            // Same identity reconnecting under the same id.
            if let Some(prior) = sessions.by_session.remove(&session_id) {
                superseded.push(prior.channel);
            }

            let channel = open(&session_id);
            let now = Utc::now();
            sessions
                .by_identity
                .insert(identity.clone(), session_id.clone());
            sessions.by_session.insert(
                session_id.clone(),
                SessionEntry {
                    channel,
                    descriptor: descriptor.with_session(session_id.as_str()),
                    connected_at: now,
                    last_seen: now,
                },
            );
            self.capabilities.announce(&session_id, capabilities);
            session_id
        };

        info!("Registered session {} for {}", session_id, identity);
        Registered {
            session_id,
            superseded,
        }
    }

    /// Record that a session answered a keepalive. Returns false for unknown sessions.
    pub fn touch(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.by_session.get_mut(session_id) {
            Some(entry) => {
                entry.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remove a session and purge its capabilities. Absent sessions are a no-op.
    pub fn unregister(&self, session_id: &str) -> Option<Arc<SessionChannelClient>> {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let entry = sessions.by_session.remove(session_id)?;
            let identity = entry.descriptor.identity();
            if sessions.by_identity.get(identity).map(String::as_str) == Some(session_id) {
                sessions.by_identity.remove(identity);
            }
            self.capabilities.purge(session_id);
            entry
        };

        info!(
            "Unregistered session {} for {}",
            session_id,
            removed.descriptor.identity()
        );
        Some(removed.channel)
    }

    /// Current channel for a session id or an instance identity.
    pub fn lookup(&self, key: SessionKey<'_>) -> Option<Arc<SessionChannelClient>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let session_id = match key {
            SessionKey::Session(id) => id,
            SessionKey::Identity(identity) => sessions.by_identity.get(identity)?.as_str(),
        };
        sessions
            .by_session
            .get(session_id)
            .map(|entry| entry.channel.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_session
            .contains_key(session_id)
    }

    /// Identity currently holding a session id.
    pub fn identity_of(&self, session_id: &str) -> Option<InstanceId> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_session
            .get(session_id)
            .map(|entry| entry.descriptor.identity().clone())
    }

    /// Descriptors of every live session.
    pub fn descriptors(&self) -> Vec<InstanceDescriptor> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .by_session
            .values()
            .filter(|entry| !entry.channel.is_closed())
            .map(|entry| {
                let mut descriptor = entry.descriptor.clone();
                descriptor.last_seen = entry.last_seen;
                descriptor
            })
            .collect()
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut summaries: Vec<SessionSummary> = sessions
            .by_session
            .iter()
            .map(|(session_id, entry)| SessionSummary {
                session_id: session_id.clone(),
                identity: entry.descriptor.identity().clone(),
                engine_version: entry.descriptor.engine_version.clone(),
                connected_at: entry.connected_at,
                last_seen: entry.last_seen,
            })
            .collect();
        summaries.sort_by(|a, b| a.identity.cmp(&b.identity));
        summaries
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_session
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every session, returning their channels for closing.
    pub fn drain(&self) -> Vec<Arc<SessionChannelClient>> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.by_identity.clear();
        self.capabilities.clear();
        sessions
            .by_session
            .drain()
            .map(|(_, entry)| entry.channel)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelEvent;
    use tokio::io::{duplex, split, DuplexStream};
    use tokio::sync::mpsc;

    /// A channel over an in-memory pipe; keep the returned stream alive.
    fn channel(session_id: &str, identity: &InstanceId) -> (Arc<SessionChannelClient>, DuplexStream) {
        let (hub_side, instance_side) = duplex(4096);
        let (reader, writer) = split(hub_side);
        let (events, _rx) = mpsc::channel::<ChannelEvent>(8);
        let client = SessionChannelClient::spawn(session_id, identity.clone(), reader, writer, events);
        (client, instance_side)
    }

    fn registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(CapabilityRegistry::new()))
    }

    struct Opened {
        registered: Registered,
        channel: Arc<SessionChannelClient>,
        _pipe: DuplexStream,
    }

    fn open(
        registry: &ConnectionRegistry,
        proposed: Option<&str>,
        name: &str,
        hash: &str,
        capabilities: Vec<CapabilityDescriptor>,
    ) -> Opened {
        let descriptor = InstanceDescriptor::new(name, hash);
        let identity = descriptor.identity().clone();
        let mut opened = None;
        let registered = registry.register(proposed, descriptor, capabilities, |session_id| {
            let (client, pipe) = channel(session_id, &identity);
            opened = Some((client.clone(), pipe));
            client
        });
        let (channel, pipe) = opened.unwrap();
        Opened {
            registered,
            channel,
            _pipe: pipe,
        }
    }

    #[tokio::test]
    async fn test_new_session_supersedes_prior_for_identity() {
        let registry = registry();
        let alpha = InstanceId::new("Alpha", "111");
        let a = open(
            &registry,
            Some("session-a"),
            "Alpha",
            "111",
            vec![CapabilityDescriptor::new("bake_lighting")],
        );
        let b = open(&registry, Some("session-b"), "Alpha", "111", vec![]);

        let superseded = &b.registered.superseded;
        assert_eq!(superseded.len(), 1);
        assert!(Arc::ptr_eq(&superseded[0], &a.channel));
        assert!(registry.lookup(SessionKey::Session("session-a")).is_none());
        let found = registry.lookup(SessionKey::Session("session-b")).unwrap();
        assert!(Arc::ptr_eq(&found, &b.channel));
        let by_identity = registry.lookup(SessionKey::Identity(&alpha)).unwrap();
        assert!(Arc::ptr_eq(&by_identity, &b.channel));
        assert!(registry.capabilities().list("session-a").is_empty());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent_and_purges() {
        let registry = registry();
        let beta = InstanceId::new("Beta", "222");
        let _beta = open(
            &registry,
            Some("s-1"),
            "Beta",
            "222",
            vec![CapabilityDescriptor::new("capture")],
        );

        assert!(registry.unregister("s-1").is_some());
        assert!(registry.unregister("s-1").is_none());
        assert!(registry.lookup(SessionKey::Identity(&beta)).is_none());
        assert!(registry.capabilities().list("s-1").is_empty());
    }

    #[tokio::test]
    async fn test_stale_unregister_keeps_newer_identity_mapping() {
        let registry = registry();
        let alpha = InstanceId::new("Alpha", "111");
        let _a = open(&registry, Some("session-a"), "Alpha", "111", vec![]);
        let _b = open(&registry, Some("session-b"), "Alpha", "111", vec![]);

        assert!(registry.unregister("session-a").is_none());
        assert!(registry.lookup(SessionKey::Identity(&alpha)).is_some());
    }

    #[tokio::test]
    async fn test_missing_id_is_minted() {
        let registry = registry();
        let opened = open(&registry, None, "Alpha", "111", vec![]);
        let session_id = &opened.registered.session_id;

        assert!(!session_id.is_empty());
        assert_eq!(opened.channel.session_id(), session_id);
        assert!(registry.contains(session_id));
    }

    #[tokio::test]
    async fn test_id_held_by_other_identity_gets_fresh_id() {
        let registry = registry();
        let alpha = open(&registry, Some("shared"), "Alpha", "111", vec![]);
        let beta = open(
            &registry,
            Some("shared"),
            "Beta",
            "222",
            vec![CapabilityDescriptor::new("capture")],
        );

        assert_eq!(alpha.registered.session_id, "shared");
        assert_ne!(beta.registered.session_id, "shared");
        assert!(beta.registered.superseded.is_empty());
        assert_eq!(beta.channel.session_id(), beta.registered.session_id);
        assert_eq!(registry.identity_of("shared"), Some(InstanceId::new("Alpha", "111")));
        assert_eq!(
            registry.capabilities().list(&beta.registered.session_id).len(),
            1
        );
        assert!(registry.capabilities().list("shared").is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_on_one_id_never_share_it() {
        let registry = Arc::new(registry());
        let mut tasks = Vec::new();
        for i in 0..8 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let name = format!("Inst{i}");
                let opened = open(&registry, Some("contested"), &name, &i.to_string(), vec![]);
                (opened.registered.session_id.clone(), opened)
            }));
        }

        let mut ids = std::collections::HashSet::new();
        let mut keep = Vec::new();
        for task in tasks {
            let (id, opened) = task.await.unwrap();
            assert!(ids.insert(id));
            keep.push(opened);
        }
        assert_eq!(registry.len(), 8);
        assert!(ids.contains("contested"));
    }

    #[tokio::test]
    async fn test_touch_moves_last_seen() {
        let registry = registry();
        let _a = open(&registry, Some("s-1"), "Alpha", "111", vec![]);
        let before = registry.list_sessions()[0].last_seen;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(registry.touch("s-1"));
        assert!(!registry.touch("missing"));

        let after = registry.list_sessions()[0].last_seen;
        assert!(after > before);
        assert_eq!(registry.descriptors()[0].last_seen, after);
    }

    #[tokio::test]
    async fn test_descriptors_and_sessions() {
        let registry = registry();
        let alpha = InstanceId::new("Alpha", "111");
        let mut desc = InstanceDescriptor::new("Alpha", "111");
        desc.engine_version = Some("2022.3".into());
        let mut keep = None;
        registry.register(Some("s-1"), desc, vec![], |session_id| {
            let (client, pipe) = channel(session_id, &alpha);
            keep = Some(pipe);
            client
        });

        let descriptors = registry.descriptors();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].session_id.as_deref(), Some("s-1"));

        let sessions = registry.list_sessions();
        assert_eq!(sessions[0].identity, alpha);
        assert_eq!(sessions[0].engine_version.as_deref(), Some("2022.3"));
        assert!(sessions[0].last_seen >= sessions[0].connected_at);

        assert_eq!(registry.drain().len(), 1);
        assert!(registry.is_empty());
    }
}
