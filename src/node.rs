//! Node orchestration: spawns every long-lived task named in SPEC_FULL.md §5
//! and wires them to cooperative shutdown.
//!
//! Grounded on the teacher's `run_start` in `src/main.rs` (task-spawning
//! shape) and `tokio::sync::watch`-based shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};

use crate::api::{self, ApiState};
use crate::berkeley::BerkeleySynchronizer;
use crate::clock::{LogicalClock, PhysicalClock};
use crate::cluster::MembershipView;
use crate::config::NodeConfig;
use crate::election::ElectionCoordinator;
use crate::error::Result;
use crate::fabric::tcp::{TcpPubFabric, TcpRequestClient, TcpRequestFabric};
use crate::fabric::{RequestClient, RequestFabric};
use crate::handler::{self, HandlerContext};
use crate::replication::{self, ReplicationBus};
use crate::store::DataStore;
use crate::wire::{RequestFrame, ResponseData, ServiceRequest};

pub struct Node {
    config: Arc<NodeConfig>,
    store: Arc<DataStore>,
    clock: Arc<LogicalClock>,
    physical: Arc<PhysicalClock>,
    membership: Arc<MembershipView>,
    client: Arc<dyn RequestClient>,
    replication: Arc<ReplicationBus>,
    election: Arc<ElectionCoordinator>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        let config = Arc::new(config);
        let clock = Arc::new(LogicalClock::new());
        let membership = MembershipView::new();
        let client: Arc<dyn RequestClient> = Arc::new(TcpRequestClient::new(
            Duration::from_secs(2),
            Duration::from_secs(5),
        ));
        let election = Arc::new(ElectionCoordinator::new(
            config.node_id,
            config.clone(),
            membership.clone(),
            clock.clone(),
            client.clone(),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            store: Arc::new(DataStore::new(config.data_dir().clone())),
            replication: ReplicationBus::new(config.node_id, clock.clone()),
            physical: Arc::new(PhysicalClock::new()),
            config,
            clock,
            membership,
            client,
            election,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// A cloneable, `'static` callback that triggers shutdown, for wiring
    /// into `ctrlc::set_handler`.
    pub fn shutdown_handle(&self) -> impl Fn() + Send + 'static {
        let tx = self.shutdown_tx.clone();
        move || {
            let _ = tx.send(true);
        }
    }

    /// Run the node until shutdown is requested. Spawns every task in
    /// SPEC_FULL.md §5 and returns once the request-serving task exits.
    pub async fn run(self) -> Result<()> {
        self.store.load().await?;

        let pub_fabric = Arc::new(TcpPubFabric::new(format!(
            "{}:{}",
            self.config.proxy.host, self.config.proxy.port
        )));

        let berkeley = Arc::new(BerkeleySynchronizer::new(
            self.config.node_id,
            self.config.clone(),
            self.membership.clone(),
            self.clock.clone(),
            self.physical.clone(),
            self.client.clone(),
        ));

        let pull_sync = Arc::new(replication::PullSync::new(
            self.config.node_id,
            self.config.clone(),
            self.membership.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.client.clone(),
        ));

        let ctx = Arc::new(HandlerContext {
            store: self.store.clone(),
            clock: self.clock.clone(),
            physical: self.physical.clone(),
            replication: self.replication.clone(),
            pub_fabric,
            election: self.election.clone(),
            pull_sync: pull_sync.clone(),
            berkeley,
            request_counter: Arc::new(Mutex::new(0)),
        });

        tokio::spawn(self.replication.clone().serve(format!(
            "0.0.0.0:{}",
            self.config.replication_port()
        )));

        tokio::spawn(run_heartbeat_task(
            self.config.clone(),
            self.membership.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.client.clone(),
            self.shutdown_rx.clone(),
        ));

        tokio::spawn(self.election.clone().run_coordinator_monitor());

        tokio::spawn(run_pull_sync_task(
            self.config.clone(),
            pull_sync,
            self.shutdown_rx.clone(),
        ));

        if self.config.api.enabled {
            let api_state = ApiState {
                node_id: self.config.node_id,
                membership: self.membership.clone(),
                election: self.election.clone(),
            };
            let bind_address = self.config.api.bind_address.clone();
            tokio::spawn(async move {
                if let Ok(listener) = tokio::net::TcpListener::bind(&bind_address).await {
                    let _ = axum::serve(listener, api::router(api_state)).await;
                } else {
                    tracing::warn!(address = %bind_address, "status API failed to bind");
                }
            });
        }

        let fabric = TcpRequestFabric::new(self.config.bind_address(), self.shutdown_rx.clone());
        let handler_ctx = ctx;
        fabric
            .serve(Arc::new(move |frame: RequestFrame| {
                let ctx = handler_ctx.clone();
                Box::pin(async move { handler::handle(&ctx, frame.lamport, frame.request).await })
            }))
            .await
    }
}

async fn run_heartbeat_task(
    config: Arc<NodeConfig>,
    membership: Arc<MembershipView>,
    store: Arc<DataStore>,
    clock: Arc<LogicalClock>,
    client: Arc<dyn RequestClient>,
    mut shutdown: watch::Receiver<bool>,
) {
    let registry_address = format!("{}:{}", config.registry.host, config.registry.port);

    let register_frame = RequestFrame {
        lamport: clock.tick(),
        request: ServiceRequest::Register {
            node_id: config.node_id,
            address: config.advertise_address(),
            port: config.port,
        },
    };
    if let Ok(response) = client.call(&registry_address, register_frame).await {
        if let Some(ResponseData::Members(members)) = response.data {
            membership.replace(members).await;
        }
    }

    let mut subscribed: std::collections::HashSet<u64> = std::collections::HashSet::new();
    let mut interval = tokio::time::interval(config.heartbeat_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        let is_leader = membership.leader_id().await == Some(config.node_id);
        let frame = RequestFrame {
            lamport: clock.tick(),
            request: ServiceRequest::Heartbeat {
                node_id: config.node_id,
                is_leader,
            },
        };
        match client.call(&registry_address, frame).await {
            Ok(response) => {
                if let Some(ResponseData::Members(members)) = response.data {
                    membership.replace(members).await;
                }
            }
            Err(e) => tracing::debug!(error = %e, "heartbeat failed, retrying next tick"),
        }

        for peer in membership.peers(config.node_id).await {
            if !subscribed.insert(peer.node_id) {
                continue;
            }
            let address = format!("{}:{}", peer.address, peer.port + 1000);
            tokio::spawn(replication::subscribe_to_peer(
                address,
                store.clone(),
                clock.clone(),
            ));
        }
    }
}

async fn run_pull_sync_task(
    config: Arc<NodeConfig>,
    pull_sync: Arc<replication::PullSync>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::time::sleep(config.pull_sync_startup_delay()).await;
    let mut interval = tokio::time::interval(config.pull_sync_interval());
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        pull_sync.run_once().await;
    }
}
