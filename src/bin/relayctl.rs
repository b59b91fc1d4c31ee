//! relayctl - command line tool for talking to a RelayMesh node.
//!
//! Grounded on the teacher's `src/bin/wolfctl.rs` (reqwest against the
//! ambient HTTP status API for read-only queries; a raw protocol client for
//! commands that mutate state).

use clap::{Parser, Subcommand};
use serde::Deserialize;

use relaymesh::error::{Error, Result};
use relaymesh::fabric::tcp::TcpRequestClient;
use relaymesh::fabric::RequestClient;
use relaymesh::wire::{RequestFrame, ServiceRequest};

#[derive(Parser)]
#[command(name = "relayctl")]
#[command(about = "Control and query a RelayMesh node", long_about = None)]
struct Cli {
    /// Node address for client requests (host:port)
    #[arg(short, long, default_value = "127.0.0.1:5555")]
    node: String,

    /// Node's HTTP status API address
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    api: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show cluster members as seen by this node
    Members,
    /// Show the current leader
    Leader,
    /// Register a user
    Login { user: String },
    /// Create a channel
    Channel { channel: String },
    /// Publish to a channel
    Publish {
        user: String,
        channel: String,
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct MembersResponse {
    members: Vec<relaymesh::model::RegistryEntry>,
}

#[derive(Debug, Deserialize)]
struct LeaderResponse {
    leader_id: Option<u64>,
    is_leader: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Members => {
            let response: MembersResponse = reqwest::get(format!("{}/members", cli.api))
                .await
                .map_err(|e| Error::TransportError(e.to_string()))?
                .json()
                .await
                .map_err(|e| Error::TransportError(e.to_string()))?;
            for member in response.members {
                println!(
                    "{}\t{}:{}\tleader={}",
                    member.node_id, member.address, member.port, member.is_leader
                );
            }
        }
        Commands::Leader => {
            let response: LeaderResponse = reqwest::get(format!("{}/leader", cli.api))
                .await
                .map_err(|e| Error::TransportError(e.to_string()))?
                .json()
                .await
                .map_err(|e| Error::TransportError(e.to_string()))?;
            println!(
                "leader_id={:?} this_node_is_leader={}",
                response.leader_id, response.is_leader
            );
        }
        Commands::Login { user } => send(&cli.node, ServiceRequest::Login { user }).await?,
        Commands::Channel { channel } => send(&cli.node, ServiceRequest::Channel { channel }).await?,
        Commands::Publish {
            user,
            channel,
            message,
        } => {
            send(
                &cli.node,
                ServiceRequest::Publish {
                    user,
                    channel,
                    message,
                },
            )
            .await?
        }
    }

    Ok(())
}

async fn send(node: &str, request: ServiceRequest) -> Result<()> {
    let client = TcpRequestClient::new(
        std::time::Duration::from_secs(2),
        std::time::Duration::from_secs(5),
    );
    let response = client
        .call(node, RequestFrame { lamport: 0, request })
        .await?;
    println!("{response:?}");
    Ok(())
}
