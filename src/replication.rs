//! Gossip-style replication and pull-based convergence (SPEC_FULL.md §4.5).
//!
//! Grounded on the teacher's `src/replication/follower.rs`/`leader.rs` (apply-
//! loop shape) and `examples/original_source/server/server.py::subscriber_loop`
//! (handling the "replication" topic) plus `sync_servers.py` (merge-by-id).

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::LogicalClock;
use crate::cluster::MembershipView;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::fabric::RequestClient;
use crate::model::{iso_now, Publication, ReplicationEvent, ReplicationEventKind, ReplicationPayload};
use crate::store::DataStore;
use crate::wire::{read_frame, write_frame, RequestFrame, ResponseData, ServiceRequest};

/// Publishes replication events and accepts peer subscribers, standing in
/// for the peer-to-peer publish socket named in SPEC_FULL.md §4.5/§6.
pub struct ReplicationBus {
    node_id: u64,
    tx: broadcast::Sender<ReplicationEvent>,
    clock: Arc<LogicalClock>,
}

impl ReplicationBus {
    pub fn new(node_id: u64, clock: Arc<LogicalClock>) -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        Arc::new(Self { node_id, tx, clock })
    }

    /// Build and broadcast a replication event for a mutation.
    pub fn publish(&self, kind: ReplicationEventKind, payload: ReplicationPayload) {
        let event = ReplicationEvent {
            id: Uuid::new_v4(),
            kind,
            payload,
            lamport: self.clock.tick(),
            wall_time: iso_now(),
        };
        // No subscribers is not an error: pub/sub is lossy by design, repaired
        // by pull-sync.
        let _ = self.tx.send(event);
    }

    /// Bind the publish endpoint and accept subscriber connections, streaming
    /// every published event to each as it arrives.
    pub async fn serve(self: Arc<Self>, bind_address: String) -> Result<()> {
        let listener = TcpListener::bind(&bind_address)
            .await
            .map_err(|e| Error::TransportError(format!("bind {bind_address}: {e}")))?;
        tracing::info!(address = %bind_address, node_id = self.node_id, "replication bus listening");

        loop {
            let (socket, peer) = listener.accept().await?;
            let mut rx = self.tx.subscribe();
            tokio::spawn(async move {
                let mut socket = socket;
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            if write_frame(&mut socket, &event).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                tracing::debug!(%peer, "replication subscriber disconnected");
            });
        }
    }
}

/// Idempotently apply an inbound replication event to the store
/// (SPEC_FULL.md §4.5 inbound path, steps 1-4).
pub async fn apply_event(store: &DataStore, clock: &LogicalClock, event: ReplicationEvent) {
    clock.merge(event.lamport);
    match event.payload {
        ReplicationPayload::User(user) => {
            store.add_user(user).await;
        }
        ReplicationPayload::Channel(channel) => {
            store.add_channel(channel).await;
        }
        ReplicationPayload::Publication(publication) => {
            store.append_publication(publication).await;
        }
        ReplicationPayload::Message(message) => {
            store.append_message(message).await;
        }
    }
}

/// Connect to one peer's replication endpoint and apply every event it
/// streams until the connection drops (caller retries on the next
/// membership refresh).
pub async fn subscribe_to_peer(
    address: String,
    store: Arc<DataStore>,
    clock: Arc<LogicalClock>,
) -> Result<()> {
    let mut socket = TcpStream::connect(&address)
        .await
        .map_err(|e| Error::PeerUnreachable {
            node_id: 0,
            reason: e.to_string(),
        })?;
    loop {
        let event: ReplicationEvent = read_frame(&mut socket).await?;
        apply_event(&store, &clock, event).await;
    }
}

/// Periodic pull-based convergence (SPEC_FULL.md §4.5 "Pull-based convergence").
pub struct PullSync {
    node_id: u64,
    config: Arc<NodeConfig>,
    membership: Arc<MembershipView>,
    store: Arc<DataStore>,
    clock: Arc<LogicalClock>,
    client: Arc<dyn RequestClient>,
}

impl PullSync {
    pub fn new(
        node_id: u64,
        config: Arc<NodeConfig>,
        membership: Arc<MembershipView>,
        store: Arc<DataStore>,
        clock: Arc<LogicalClock>,
        client: Arc<dyn RequestClient>,
    ) -> Self {
        Self {
            node_id,
            config,
            membership,
            store,
            clock,
            client,
        }
    }

    /// Run one pass: pull users and channels from every peer unconditionally,
    /// and pull messages/publications when local cardinality is below the
    /// configured watermark.
    pub async fn run_once(&self) {
        let peers = self.membership.peers(self.node_id).await;
        if peers.is_empty() {
            return;
        }

        let sync_logs = self.store.message_count().await < self.config.replication.log_sync_watermark
            || self.store.publication_count().await < self.config.replication.log_sync_watermark;

        for peer in &peers {
            let address = format!("{}:{}", peer.address, peer.port);
            self.pull_users(&address).await;
            self.pull_channels(&address).await;
            if sync_logs {
                self.pull_messages(&address).await;
                self.pull_publications(&address).await;
            }
        }

        self.store.advance_journal_watermark(self.clock.current()).await;
    }

    /// Pull the user list from every peer once (SPEC_FULL.md §4.6 "Pull-sync,
    /// then return user list"), for handlers that must answer with a
    /// converged view rather than wait for the next periodic `run_once`.
    pub async fn sync_users(&self) {
        for peer in self.membership.peers(self.node_id).await {
            let address = format!("{}:{}", peer.address, peer.port);
            self.pull_users(&address).await;
        }
    }

    /// Pull the channel list from every peer once (SPEC_FULL.md §4.6
    /// "Pull-sync, then return channel list").
    pub async fn sync_channels(&self) {
        for peer in self.membership.peers(self.node_id).await {
            let address = format!("{}:{}", peer.address, peer.port);
            self.pull_channels(&address).await;
        }
    }

    async fn pull_users(&self, address: &str) {
        let frame = RequestFrame {
            lamport: self.clock.tick(),
            request: ServiceRequest::SyncUsers,
        };
        if let Ok(response) = self.client.call(address, frame).await {
            if let Some(ResponseData::Users(users)) = response.data {
                self.store.merge_users(users).await;
            }
        }
    }

    async fn pull_channels(&self, address: &str) {
        let frame = RequestFrame {
            lamport: self.clock.tick(),
            request: ServiceRequest::SyncChannels,
        };
        if let Ok(response) = self.client.call(address, frame).await {
            if let Some(ResponseData::Channels(channels)) = response.data {
                self.store.merge_channels(channels).await;
            }
        }
    }

    async fn pull_messages(&self, address: &str) {
        let frame = RequestFrame {
            lamport: self.clock.tick(),
            request: ServiceRequest::SyncMessages,
        };
        if let Ok(response) = self.client.call(address, frame).await {
            if let Some(ResponseData::Messages(messages)) = response.data {
                self.store.merge_messages(messages).await;
            }
        }
    }

    async fn pull_publications(&self, address: &str) {
        let frame = RequestFrame {
            lamport: self.clock.tick(),
            request: ServiceRequest::SyncPublications,
        };
        if let Ok(response) = self.client.call(address, frame).await {
            if let Some(ResponseData::Publications(publications)) = response.data {
                self.store.merge_publications(publications).await;
            }
        }
    }
}
