//! Standalone registry process (SPEC_FULL.md §2, §4.1).
//!
//! Grounded on the teacher's `src/main.rs` CLI shape and
//! `examples/original_source/reference/reference.py` (register/list/heartbeat
//! verbs, periodic eviction of stale members).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use relaymesh::clock::LogicalClock;
use relaymesh::cluster::Membership;
use relaymesh::config::RegistryConfig;
use relaymesh::error::Result;
use relaymesh::fabric::tcp::TcpRequestFabric;
use relaymesh::fabric::RequestFabric;
use relaymesh::wire::{RequestFrame, ResponseData, ServiceRequest, ServiceResponse};

#[derive(Parser)]
#[command(name = "relaymesh-registry")]
#[command(author, version, about = "Cluster membership registry", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "registry.toml")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = std::fs::read_to_string(&cli.config)
        .ok()
        .and_then(|content| toml::from_str::<RegistryConfig>(&content).ok())
        .unwrap_or_default();

    tracing::info!(port = config.port, "starting relaymesh registry");

    let membership = Arc::new(Membership::new());
    let clock = Arc::new(LogicalClock::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    {
        let membership = membership.clone();
        let timeout_millis = (config.heartbeat_timeout_s * 1000) as i64;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                interval.tick().await;
                for node_id in membership.evict_stale(timeout_millis).await {
                    tracing::info!(node_id, "evicted inactive node");
                }
            }
        });
    }

    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })
    .ok();

    let fabric = TcpRequestFabric::new(format!("0.0.0.0:{}", config.port), shutdown_rx);
    fabric
        .serve(Arc::new(move |frame: RequestFrame| {
            let membership = membership.clone();
            let clock = clock.clone();
            Box::pin(async move { handle(&membership, &clock, frame).await })
        }))
        .await
}

async fn handle(
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
                Some(members) => ServiceResponse::ok(lamport, Some(ResponseData::Members(members))),
                None => ServiceResponse::error(lamport, "node not registered"),
            }
        }
        _ => ServiceResponse::error(lamport, "unsupported on the registry"),
    }
}

fn init_logging(level: &str) {
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
