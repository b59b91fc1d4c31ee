//! Data model types (SPEC_FULL.md §3).
//!
//! Field and derive shape grounded on the teacher's
//! `examples/.../src/state/membership.rs`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// ISO-8601 wall-clock timestamp for persisted/replicated records.
pub fn iso_now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// A registered cluster member, as tracked by the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegistryEntry {
    pub node_id: u64,
    pub address: String,
    pub port: u16,
    /// Milliseconds since the Unix epoch of the last accepted heartbeat.
    pub last_heartbeat_wall: i64,
    pub is_leader: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct User {
    pub username: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Channel {
    pub name: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Publication {
    pub id: Uuid,
    pub channel: String,
    pub author: String,
    pub content: String,
    pub wall_time: String,
    pub lamport: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectMessage {
    pub id: Uuid,
    pub from: String,
    pub to: String,
    pub content: String,
    pub wall_time: String,
    pub lamport: u64,
}

/// A replication event broadcast after every state mutation (SPEC_FULL.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ReplicationEventKind,
    pub payload: ReplicationPayload,
    pub lamport: u64,
    pub wall_time: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationEventKind {
    Login,
    Channel,
    Publication,
    Message,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ReplicationPayload {
    User(User),
    Channel(Channel),
    Publication(Publication),
    Message(DirectMessage),
}
