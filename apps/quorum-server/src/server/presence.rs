use std::{collections::HashMap, sync::Arc};

use quorum_core::UserId;
use quorum_protocol::PresenceEntryPayload;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::core::Identity;

#[derive(Debug, Clone)]
pub(crate) struct ConnectionPresence {
    pub(crate) user_id: UserId,
    pub(crate) display_name: String,
    pub(crate) is_privileged: bool,
    pub(crate) connected_at_unix: i64,
}

/// Per-process registry of connected identities. Tracks connections, not
/// users: a user with several tabs open stays online until the last one
/// drops. There is no cross-process authority — remote views converge
/// through `user:online`/`user:offline` bus events only.
#[derive(Clone, Debug, Default)]
pub(crate) struct PresenceRegistry {
    connections: Arc<RwLock<HashMap<Uuid, ConnectionPresence>>>,
}

impl PresenceRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns true when this is the user's first
    /// live connection on this process, i.e. the `absent → online`
    /// transition that warrants an online broadcast.
    pub(crate) async fn connect(
        &self,
        connection_id: Uuid,
        identity: &Identity,
        now_unix: i64,
    ) -> bool {
        let mut connections = self.connections.write().await;
        let was_online = connections
            .values()
            .any(|entry| entry.user_id == identity.user_id);
        connections.insert(
            connection_id,
            ConnectionPresence {
                user_id: identity.user_id,
                display_name: identity.display_name.clone(),
                is_privileged: identity.is_privileged,
                connected_at_unix: now_unix,
            },
        );
        !was_online
    }

    /// Drop a connection. Returns the removed entry and whether it was
    /// the user's last connection (`online → absent`).
    pub(crate) async fn disconnect(
        &self,
        connection_id: Uuid,
    ) -> Option<(ConnectionPresence, bool)> {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(&connection_id)?;
        let still_online = connections
            .values()
            .any(|entry| entry.user_id == removed.user_id);
        Some((removed, !still_online))
    }

    /// Snapshot of currently-known identities, one entry per user,
    /// ordered by connect time. `privileged_only` scopes the snapshot to
    /// the members room.
    pub(crate) async fn snapshot(&self, privileged_only: bool) -> Vec<PresenceEntryPayload> {
        let connections = self.connections.read().await;
        let mut by_user: HashMap<UserId, &ConnectionPresence> = HashMap::new();
        for entry in connections.values() {
            if privileged_only && !entry.is_privileged {
                continue;
            }
            by_user
                .entry(entry.user_id)
                .and_modify(|existing| {
                    if entry.connected_at_unix < existing.connected_at_unix {
                        *existing = entry;
                    }
                })
                .or_insert(entry);
        }

        let mut entries: Vec<&ConnectionPresence> = by_user.into_values().collect();
        entries.sort_by(|a, b| {
            a.connected_at_unix
                .cmp(&b.connected_at_unix)
                .then_with(|| a.user_id.to_string().cmp(&b.user_id.to_string()))
        });
        entries
            .into_iter()
            .map(|entry| PresenceEntryPayload {
                user_id: entry.user_id.to_string(),
                name: entry.display_name.clone(),
                is_privileged: entry.is_privileged,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use quorum_core::UserId;
    use uuid::Uuid;

    use super::PresenceRegistry;
    use crate::server::core::Identity;

    fn identity(name: &str, privileged: bool) -> Identity {
        Identity {
            user_id: UserId::new(),
            display_name: name.to_owned(),
            is_privileged: privileged,
        }
    }

    #[tokio::test]
    async fn first_connection_reports_online_transition() {
        let registry = PresenceRegistry::new();
        let alice = identity("Alice", false);

        assert!(registry.connect(Uuid::new_v4(), &alice, 100).await);
        assert!(!registry.connect(Uuid::new_v4(), &alice, 101).await);
    }

    #[tokio::test]
    async fn offline_fires_only_on_last_disconnect() {
        let registry = PresenceRegistry::new();
        let alice = identity("Alice", false);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        registry.connect(first, &alice, 100).await;
        registry.connect(second, &alice, 101).await;

        let (_, was_last) = registry.disconnect(first).await.unwrap();
        assert!(!was_last, "user still has a live connection");

        let (_, was_last) = registry.disconnect(second).await.unwrap();
        assert!(was_last, "last connection should mark the user offline");
    }

    #[tokio::test]
    async fn snapshot_dedupes_users_and_honors_privilege_scope() {
        let registry = PresenceRegistry::new();
        let alice = identity("Alice", true);
        let bob = identity("Bob", false);
        registry.connect(Uuid::new_v4(), &alice, 100).await;
        registry.connect(Uuid::new_v4(), &alice, 105).await;
        registry.connect(Uuid::new_v4(), &bob, 102).await;

        let all = registry.snapshot(false).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].name, "Alice");
        assert_eq!(all[1].name, "Bob");

        let members = registry.snapshot(true).await;
        assert_eq!(members.len(), 1);
        assert!(members[0].is_privileged);
    }
}
