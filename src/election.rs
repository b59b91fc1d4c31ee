//! Bully leader election over per-peer ephemeral request sockets
//! (SPEC_FULL.md §4.3).
//!
//! Grounded on the teacher's `src/state/election.rs` (state-machine /
//! `ElectionConfig` shape) and
//! `examples/other_examples/1f2ab567_AbdelrahmanIhab-distinsta__src-bully.rs.rs`
//! (direct Bully wire protocol: `Election`/`Answer`/`Coordinator` over a
//! fresh, timeout-bounded TCP connection per call).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::cluster::MembershipView;
use crate::clock::LogicalClock;
use crate::config::NodeConfig;
use crate::fabric::RequestClient;
use crate::wire::{RequestFrame, ServiceRequest, ServiceResponse, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Follower,
    Candidate,
    Leader,
}

/// Drives Bully elections for one node.
pub struct ElectionCoordinator {
    node_id: u64,
    config: Arc<NodeConfig>,
    membership: Arc<MembershipView>,
    clock: Arc<LogicalClock>,
    client: Arc<dyn RequestClient>,
    state: Mutex<ElectionState>,
    in_progress: Mutex<bool>,
    last_coordinator_seen: Mutex<Option<Instant>>,
}

impl ElectionCoordinator {
    pub fn new(
        node_id: u64,
        config: Arc<NodeConfig>,
        membership: Arc<MembershipView>,
        clock: Arc<LogicalClock>,
        client: Arc<dyn RequestClient>,
    ) -> Self {
        Self {
            node_id,
            config,
            membership,
            clock,
            client,
            state: Mutex::new(ElectionState::Follower),
            in_progress: Mutex::new(false),
            last_coordinator_seen: Mutex::new(None),
        }
    }

    pub async fn state(&self) -> ElectionState {
        *self.state.lock().await
    }

    pub async fn is_leader(&self) -> bool {
        *self.state.lock().await == ElectionState::Leader
    }

    /// Whether a `COORDINATOR` was observed recently enough to suppress a
    /// fresh election from an `ELECTION` trigger (SPEC_FULL.md §4.3 step 4).
    async fn within_suppression_window(&self) -> bool {
        match *self.last_coordinator_seen.lock().await {
            Some(at) => at.elapsed() < self.config.coordinator_suppress(),
            None => false,
        }
    }

    /// Whether a `COORDINATOR` arrived at or after `since` — used to decide
    /// whether a candidate's await-coordinator wait settled a leader, distinct
    /// from `within_suppression_window`'s unrelated ELECTION-debounce question.
    async fn coordinator_seen_since(&self, since: Instant) -> bool {
        matches!(*self.last_coordinator_seen.lock().await, Some(at) if at >= since)
    }

    /// Record an observed `COORDINATOR{c}` message, whether from the wire or
    /// from our own election winning.
    pub async fn observe_coordinator(&self, coordinator_id: u64) {
        *self.last_coordinator_seen.lock().await = Some(Instant::now());
        self.membership.set_leader(Some(coordinator_id)).await;
        *self.state.lock().await = if coordinator_id == self.node_id {
            ElectionState::Leader
        } else {
            ElectionState::Follower
        };
    }

    /// Handle an incoming `ELECTION{from}` request: always reply OK, and
    /// start our own election unless we've recently seen a coordinator.
    pub async fn handle_election_request(self: &Arc<Self>, _from: u64) {
        if !self.within_suppression_window().await {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                this.run_election().await;
            });
        }
    }

    /// Run one Bully election round (SPEC_FULL.md §4.3 steps 1-3), retrying
    /// if a higher peer answers but no coordinator is observed in time.
    pub async fn run_election(self: &Arc<Self>) {
        {
            let mut in_progress = self.in_progress.lock().await;
            if *in_progress {
                return;
            }
            *in_progress = true;
        }
        *self.state.lock().await = ElectionState::Candidate;

        loop {
            let peers = self.membership.peers(self.node_id).await;
            let higher: Vec<_> = peers
                .into_iter()
                .filter(|p| p.node_id > self.node_id)
                .collect();

            if higher.is_empty() {
                self.become_leader().await;
                break;
            }

            let mut answered = false;
            for peer in &higher {
                let address = format!("{}:{}", peer.address, peer.port);
                let frame = RequestFrame {
                    lamport: self.clock.tick(),
                    request: ServiceRequest::Election { from: self.node_id },
                };
                match timeout(
                    self.config.election_reply_timeout(),
                    self.client.call(&address, frame),
                )
                .await
                {
                    Ok(Ok(response)) if response.status == Status::Ok => answered = true,
                    _ => {}
                }
            }

            if !answered {
                self.become_leader().await;
                break;
            }

            tracing::info!(node_id = self.node_id, "received answer, awaiting coordinator");
            let wait_started = Instant::now();
            tokio::time::sleep(self.config.await_coordinator()).await;
            if self.coordinator_seen_since(wait_started).await {
                break;
            }
            tracing::info!(node_id = self.node_id, "no coordinator observed, retrying election");
        }

        *self.in_progress.lock().await = false;
    }

    async fn become_leader(self: &Arc<Self>) {
        tracing::info!(node_id = self.node_id, "won election, becoming leader");
        self.observe_coordinator(self.node_id).await;

        let peers = self.membership.peers(self.node_id).await;
        for peer in peers {
            let address = format!("{}:{}", peer.address, peer.port);
            let frame = RequestFrame {
                lamport: self.clock.tick(),
                request: ServiceRequest::Coordinator {
                    coordinator_id: self.node_id,
                },
            };
            let _ = self.client.call(&address, frame).await;
        }
    }

    /// Background monitor: trigger an election if the registry-advertised
    /// leader disappears or goes quiet for longer than `leader_dead`.
    pub async fn run_coordinator_monitor(self: Arc<Self>) {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        loop {
            interval.tick().await;
            let leader_id = self.membership.leader_id().await;
            let missing = match leader_id {
                None => true,
                Some(id) => id != self.node_id && !self.membership.contains(id).await,
            };
            if missing {
                tracing::warn!(node_id = self.node_id, "leader missing, starting election");
                let this = Arc::clone(&self);
                tokio::spawn(async move { this.run_election().await });
            }
        }
    }
}

/// Build the `ServiceResponse` for an inbound `ELECTION` request: always OK.
pub fn election_ok_response(lamport: u64) -> ServiceResponse {
    ServiceResponse::ok(lamport, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoPeersClient;
    #[async_trait]
    impl RequestClient for NoPeersClient {
        async fn call(&self, _address: &str, _frame: RequestFrame) -> Result<ServiceResponse> {
            unreachable!("no peers should ever be called")
        }
    }

    #[tokio::test]
    async fn sole_node_becomes_leader_immediately() {
        let config = Arc::new(NodeConfig::default_for(5, 5555));
        let membership = MembershipView::new();
        let clock = Arc::new(LogicalClock::new());
        let coordinator = Arc::new(ElectionCoordinator::new(
            5,
            config,
            membership.clone(),
            clock,
            Arc::new(NoPeersClient),
        ));

        coordinator.run_election().await;
        assert!(coordinator.is_leader().await);
        assert_eq!(membership.leader_id().await, Some(5));
    }

    struct RefusingClient {
        calls: AtomicUsize,
    }
    #[async_trait]
    impl RequestClient for RefusingClient {
        async fn call(&self, _address: &str, _frame: RequestFrame) -> Result<ServiceResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(crate::error::Error::TransportError("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn becomes_leader_when_higher_peers_unreachable() {
        let config = Arc::new(NodeConfig::default_for(3, 5555));
        let membership = MembershipView::new();
        membership
            .replace(vec![
                crate::model::RegistryEntry {
                    node_id: 3,
                    address: "127.0.0.1".into(),
                    port: 5555,
                    last_heartbeat_wall: 0,
                    is_leader: false,
                },
                crate::model::RegistryEntry {
                    node_id: 9,
                    address: "127.0.0.1".into(),
                    port: 1,
                    last_heartbeat_wall: 0,
                    is_leader: false,
                },
            ])
            .await;
        let clock = Arc::new(LogicalClock::new());
        let client = Arc::new(RefusingClient {
            calls: AtomicUsize::new(0),
        });
        let coordinator = Arc::new(ElectionCoordinator::new(
            3,
            config,
            membership.clone(),
            clock,
            client,
        ));

        coordinator.run_election().await;
        assert!(coordinator.is_leader().await);
    }
}
