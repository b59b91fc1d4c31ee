//! Berkeley clock synchronization, leader-driven (SPEC_FULL.md §4.4).
//!
//! Grounded on the teacher's RTT-aware peer timing in `src/network/client.rs`
//! and the algorithm description in SPEC_FULL.md §4.4.

use std::sync::Arc;
use std::time::Instant;

use crate::clock::{LogicalClock, PhysicalClock};
use crate::cluster::MembershipView;
use crate::config::NodeConfig;
use crate::fabric::RequestClient;
use crate::wire::{RequestFrame, ResponseData, ServiceRequest};

pub struct BerkeleySynchronizer {
    node_id: u64,
    config: Arc<NodeConfig>,
    membership: Arc<MembershipView>,
    clock: Arc<LogicalClock>,
    physical: Arc<PhysicalClock>,
    client: Arc<dyn RequestClient>,
}

impl BerkeleySynchronizer {
    pub fn new(
        node_id: u64,
        config: Arc<NodeConfig>,
        membership: Arc<MembershipView>,
        clock: Arc<LogicalClock>,
        physical: Arc<PhysicalClock>,
        client: Arc<dyn RequestClient>,
    ) -> Self {
        Self {
            node_id,
            config,
            membership,
            clock,
            physical,
            client,
        }
    }

    /// Run one synchronization round as the leader (SPEC_FULL.md §4.4 steps 1-5).
    /// Returns the max pairwise offset spread observed among sampled peers,
    /// for callers that want to assert monotone improvement across rounds.
    pub async fn run_round(&self) -> i64 {
        let t_leader = self.physical.now_millis();
        let peers = self.membership.peers(self.node_id).await;

        let mut samples: Vec<(u64, String, i64)> = Vec::new();
        for peer in &peers {
            let address = format!("{}:{}", peer.address, peer.port);
            let sent_at = Instant::now();
            let frame = RequestFrame {
                lamport: self.clock.tick(),
                request: ServiceRequest::Clock,
            };
            let response = match self.client.call(&address, frame).await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(peer = peer.node_id, error = %e, "clock sample skipped");
                    continue;
                }
            };
            let rtt_half_millis = sent_at.elapsed().as_millis() as i64 / 2;
            if let Some(ResponseData::ClockSample { wall_millis, .. }) = response.data {
                samples.push((peer.node_id, address, wall_millis + rtt_half_millis));
            }
        }

        if samples.is_empty() {
            return 0;
        }

        let sum: i64 = samples.iter().map(|(_, _, s)| *s).sum::<i64>() + t_leader;
        let avg = sum / (samples.len() as i64 + 1);

        let max_spread = samples
            .iter()
            .map(|(_, _, s)| (s - t_leader).abs())
            .max()
            .unwrap_or(0);

        for (node_id, address, sample) in &samples {
            let delta = avg - sample;
            let frame = RequestFrame {
                lamport: self.clock.tick(),
                request: ServiceRequest::AdjustClock { delta_millis: delta },
            };
            if let Err(e) = self.client.call(address, frame).await {
                tracing::debug!(peer = node_id, error = %e, "adjust_clock delivery failed");
            }
        }

        self.physical.adjust(avg - t_leader);
        max_spread
    }

    /// The node's timing config, so the request handler can read
    /// `berkeley_every_n` without a second copy of it.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}
