//! Registry-authoritative membership (SPEC_FULL.md §4.1) and the node-side
//! peer client used for election, Berkeley sync, heartbeats, and pull-sync.
//!
//! Grounded on the teacher's `src/state/membership.rs` (`ClusterMembership`,
//! `set_leader` clearing the leader role from every other node) and
//! `examples/original_source/reference/reference.py::handle_heartbeat`, which
//! is the direct source for clearing `is_coordinator` on every other server
//! when one asserts it (the resolved Open Question in SPEC_FULL.md §9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::RwLock;

use crate::model::RegistryEntry;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// The registry's view of the cluster. Used directly by the `registry` binary.
#[derive(Default)]
pub struct Membership {
    nodes: RwLock<HashMap<u64, RegistryEntry>>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, node_id: u64, address: String, port: u16) -> Vec<RegistryEntry> {
        let mut guard = self.nodes.write().await;
        guard.insert(
            node_id,
            RegistryEntry {
                node_id,
                address,
                port,
                last_heartbeat_wall: now_millis(),
                is_leader: false,
            },
        );
        guard.values().cloned().collect()
    }

    pub async fn list(&self) -> Vec<RegistryEntry> {
        self.nodes.read().await.values().cloned().collect()
    }

    /// Refresh a member's heartbeat timestamp and, if it claims leadership,
    /// clear the flag on every other member. Returns the full member list, or
    /// `None` if the node was never registered.
    pub async fn heartbeat(&self, node_id: u64, is_leader: bool) -> Option<Vec<RegistryEntry>> {
        let mut guard = self.nodes.write().await;
        if !guard.contains_key(&node_id) {
            return None;
        }
        if is_leader {
            for (id, entry) in guard.iter_mut() {
                entry.is_leader = *id == node_id;
            }
        } else if let Some(entry) = guard.get_mut(&node_id) {
            entry.is_leader = false;
        }
        if let Some(entry) = guard.get_mut(&node_id) {
            entry.last_heartbeat_wall = now_millis();
        }
        Some(guard.values().cloned().collect())
    }

    /// Evict members whose last heartbeat is older than `timeout_millis`.
    pub async fn evict_stale(&self, timeout_millis: i64) -> Vec<u64> {
        let now = now_millis();
        let mut guard = self.nodes.write().await;
        let stale: Vec<u64> = guard
            .iter()
            .filter(|(_, entry)| now - entry.last_heartbeat_wall > timeout_millis)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            guard.remove(id);
        }
        stale
    }
}

/// The node-side cache of the registry's member list, refreshed on every
/// heartbeat response and consulted by election/replication/pull-sync.
#[derive(Default)]
pub struct MembershipView {
    members: RwLock<HashMap<u64, RegistryEntry>>,
    leader_id: RwLock<Option<u64>>,
}

impl MembershipView {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn replace(&self, entries: Vec<RegistryEntry>) {
        let leader = entries.iter().find(|e| e.is_leader).map(|e| e.node_id);
        *self.members.write().await = entries.into_iter().map(|e| (e.node_id, e)).collect();
        *self.leader_id.write().await = leader;
    }

    pub async fn peers(&self, exclude: u64) -> Vec<RegistryEntry> {
        self.members
            .read()
            .await
            .values()
            .filter(|e| e.node_id != exclude)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<RegistryEntry> {
        self.members.read().await.values().cloned().collect()
    }

    pub async fn address_of(&self, node_id: u64) -> Option<String> {
        self.members
            .read()
            .await
            .get(&node_id)
            .map(|e| format!("{}:{}", e.address, e.port))
    }

    pub async fn leader_id(&self) -> Option<u64> {
        *self.leader_id.read().await
    }

    pub async fn set_leader(&self, leader_id: Option<u64>) {
        *self.leader_id.write().await = leader_id;
    }

    pub async fn contains(&self, node_id: u64) -> bool {
        self.members.read().await.contains_key(&node_id)
    }
}
