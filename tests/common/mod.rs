//! Shared harness for the end-to-end scenarios in SPEC_FULL.md §8: spins up
//! in-process registry/node instances bound to ephemeral ports, the closest
//! analogue to the literal multi-process scenarios without spawning real OS
//! processes (SPEC_FULL.md §8.1).

use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;
use std::time::Duration;

use relaymesh::clock::LogicalClock;
use relaymesh::cluster::Membership;
use relaymesh::config::NodeConfig;
use relaymesh::fabric::tcp::{TcpRequestClient, TcpRequestFabric};
use relaymesh::fabric::{RequestClient, RequestFabric};
use relaymesh::node::Node;
use relaymesh::wire::{RequestFrame, ResponseData, ServiceRequest, ServiceResponse};

/// Grab an OS-assigned free port by binding then immediately releasing it.
pub fn free_port() -> u16 {
    StdTcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Start an in-process registry (mirrors `src/bin/registry.rs`'s handler)
/// with a short eviction sweep so failover scenarios don't have to wait out
/// the production-sized default.
pub async fn spawn_registry(heartbeat_timeout_millis: i64) -> u16 {
    let port = free_port();
    let membership = Arc::new(Membership::new());
    let clock = Arc::new(LogicalClock::new());
    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    {
        let membership = membership.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(500));
            loop {
                interval.tick().await;
                membership.evict_stale(heartbeat_timeout_millis).await;
            }
        });
    }

    tokio::spawn(async move {
        let fabric = TcpRequestFabric::new(format!("127.0.0.1:{port}"), shutdown_rx);
        let _ = fabric
            .serve(Arc::new(move |frame: RequestFrame| {
                let membership = membership.clone();
                let clock = clock.clone();
                Box::pin(async move { registry_handle(&membership, &clock, frame).await })
            }))
            .await;
    });

    wait_for_port(port).await;
    port
}

async fn registry_handle(
    membership: &Membership,
    clock: &LogicalClock,
    frame: RequestFrame,
) -> ServiceResponse {
    clock.merge(frame.lamport);
    let lamport = clock.tick();
    match frame.request {
        ServiceRequest::Register {
            node_id,
            address,
            port,
        } => {
            let members = membership.register(node_id, address, port).await;
            ServiceResponse::ok(lamport, Some(ResponseData::Members(members)))
        }
        ServiceRequest::ListServers => {
            let members = membership.list().await;
            ServiceResponse::ok(lamport, Some(ResponseData::Members(members)))
        }
        ServiceRequest::Heartbeat { node_id, is_leader } => {
            match membership.heartbeat(node_id, is_leader).await {
                Some(members) => {
                    ServiceResponse::ok(lamport, Some(ResponseData::Members(members)))
                }
                None => ServiceResponse::error(lamport, "node not registered"),
            }
        }
        _ => ServiceResponse::error(lamport, "unsupported on the registry"),
    }
}

/// A node config wired for fast-converging tests: short heartbeat/pull-sync
/// intervals, no HTTP status server, an isolated data directory.
pub fn test_node_config(
    node_id: u64,
    port: u16,
    registry_port: u16,
    data_dir: &std::path::Path,
) -> NodeConfig {
    let mut config = NodeConfig::default_for(node_id, port);
    config.registry.host = "127.0.0.1".into();
    config.registry.port = registry_port;
    config.data_dir = data_dir.to_path_buf();
    config.api.enabled = false;
    config.timing.heartbeat_interval_ms = 100;
    config.replication.pull_sync_startup_delay_s = 0;
    config.replication.pull_sync_interval_s = 1;
    config
}

/// Start a node in the background, returning a shutdown callback the test
/// can call to simulate the node crashing or being taken down gracefully.
pub fn start_node(config: NodeConfig) -> Box<dyn Fn() + Send> {
    let node = Node::new(config);
    let shutdown = node.shutdown_handle();
    tokio::spawn(node.run());
    Box::new(shutdown)
}

pub async fn wait_for_port(port: u16) {
    for _ in 0..100 {
        if tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .is_ok()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("port {port} never came up");
}

pub fn test_client() -> TcpRequestClient {
    TcpRequestClient::new(Duration::from_secs(1), Duration::from_secs(2))
}

pub async fn send(
    client: &TcpRequestClient,
    address: &str,
    request: ServiceRequest,
) -> ServiceResponse {
    client
        .call(
            address,
            RequestFrame {
                lamport: 0,
                request,
            },
        )
        .await
        .expect("request should succeed")
}
