//! Thin abstractions over the two externally-owned collaborators named in
//! SPEC_FULL.md §1/§6: the request broker and the pub/sub routing proxy. The
//! core only needs to serve/consume these seams; their internal
//! implementation (round-robin dealer/router, XSUB/XPUB fan-out) is out of
//! scope. A concrete TCP-backed implementation stands in for both so the node
//! can be exercised standalone and in tests.
//!
//! Grounded on the teacher's `src/network/client.rs` (pooled, timeout-wrapped
//! send) and `src/network/server.rs` (accept-loop shape).

pub mod tcp;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::sync::Arc;

use crate::error::Result;
use crate::wire::{RequestFrame, ServiceResponse};

/// A handler that turns one decoded request into a response.
pub type Handler = Arc<dyn Fn(RequestFrame) -> BoxFuture<'static, ServiceResponse> + Send + Sync>;

/// Server side: accept client/broker connections, decode a `RequestFrame`,
/// hand it to `handler`, and write back whatever `ServiceResponse` it returns.
#[async_trait]
pub trait RequestFabric: Send + Sync {
    async fn serve(&self, handler: Handler) -> Result<()>;
}

/// Client side: a single request/response round trip against a peer or the registry.
#[async_trait]
pub trait RequestClient: Send + Sync {
    async fn call(&self, address: &str, frame: RequestFrame) -> Result<ServiceResponse>;
}

/// The client-facing publish/subscribe relay (SPEC_FULL.md §4.6 "fabric relay").
#[async_trait]
pub trait PubFabric: Send + Sync {
    /// Publish `payload` under `topic` (a channel name or destination username).
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Subscribe to every `(topic, payload)` relayed through the fabric
    /// (SPEC_FULL.md §6). Topic filtering, if any, is the caller's job.
    async fn subscribe(&self) -> Result<BoxStream<'static, (String, Vec<u8>)>>;
}
