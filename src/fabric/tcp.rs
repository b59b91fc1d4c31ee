//! TCP-backed stand-ins for the broker and the pub/sub proxy.
//!
//! Grounded on the teacher's `src/network/server.rs` (accept loop with a
//! shared handler closure) and `src/network/client.rs` (connect-with-timeout,
//! one-shot request).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;

use super::{Handler, PubFabric, RequestClient, RequestFabric};
use crate::error::{Error, Result};
use crate::wire::{read_frame, write_frame, RequestFrame, ServiceResponse};

/// Backs the broker's backend socket: accepts client/broker connections and
/// dispatches each request to the supplied handler.
pub struct TcpRequestFabric {
    bind_address: String,
    shutdown: watch::Receiver<bool>,
}

impl TcpRequestFabric {
    pub fn new(bind_address: impl Into<String>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            bind_address: bind_address.into(),
            shutdown,
        }
    }
}

#[async_trait]
impl RequestFabric for TcpRequestFabric {
    async fn serve(&self, handler: Handler) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address)
            .await
            .map_err(|e| Error::TransportError(format!("bind {}: {e}", self.bind_address)))?;
        tracing::info!(address = %self.bind_address, "request fabric listening");

        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => {
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, handler).await {
                                    tracing::debug!(%peer, error = %e, "request connection ended");
                                }
                            });
                        }
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

async fn handle_connection(mut socket: TcpStream, handler: Handler) -> Result<()> {
    loop {
        let frame: RequestFrame = match read_frame(&mut socket).await {
            Ok(frame) => frame,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        let response = handler(frame).await;
        write_frame(&mut socket, &response).await?;
    }
}

/// A single request/response round trip to a peer or the registry, used by
/// election, Berkeley sync, heartbeats, and pull-sync.
pub struct TcpRequestClient {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpRequestClient {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

#[async_trait]
impl RequestClient for TcpRequestClient {
    async fn call(&self, address: &str, frame: RequestFrame) -> Result<ServiceResponse> {
        timeout(self.request_timeout, self.call_inner(address, frame))
            .await
            .map_err(|_| Error::TransportError(format!("request to {address} timed out")))?
    }
}

impl TcpRequestClient {
    async fn call_inner(&self, address: &str, frame: RequestFrame) -> Result<ServiceResponse> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| Error::TransportError(format!("connect to {address} timed out")))?
            .map_err(|e| Error::TransportError(format!("connect to {address}: {e}")))?;
        stream.set_nodelay(true).ok();
        write_frame(&mut stream, &frame).await?;
        read_frame(&mut stream).await
    }
}

/// First byte of a connection to a [`TcpPubFabricProxy`]: which role the
/// connecting side plays.
const ROLE_PUBLISH: u8 = 1;
const ROLE_SUBSCRIBE: u8 = 2;

async fn read_topic_frame(stream: &mut TcpStream) -> Result<(String, Vec<u8>)> {
    let topic_len = stream.read_u32_le().await? as usize;
    let mut topic_bytes = vec![0u8; topic_len];
    stream.read_exact(&mut topic_bytes).await?;
    let payload_len = stream.read_u32_le().await? as usize;
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;
    let topic = String::from_utf8(topic_bytes)
        .map_err(|e| Error::ProtocolError(format!("non-utf8 topic: {e}")))?;
    Ok((topic, payload))
}

async fn write_topic_frame(stream: &mut TcpStream, topic: &str, payload: &[u8]) -> Result<()> {
    let topic_bytes = topic.as_bytes();
    stream.write_u32_le(topic_bytes.len() as u32).await?;
    stream.write_all(topic_bytes).await?;
    stream.write_u32_le(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Client side of the publish fabric: connects to the XSUB/XPUB proxy stand-in
/// to publish a `(topic, payload)` frame or to subscribe to the full stream.
pub struct TcpPubFabric {
    proxy_address: String,
}

impl TcpPubFabric {
    pub fn new(proxy_address: impl Into<String>) -> Self {
        Self {
            proxy_address: proxy_address.into(),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        timeout(
            Duration::from_millis(500),
            TcpStream::connect(&self.proxy_address),
        )
        .await
        .map_err(|_| Error::TransportError(format!("connect to {} timed out", self.proxy_address)))?
        .map_err(|e| Error::TransportError(format!("connect to {}: {e}", self.proxy_address)))
    }
}

#[async_trait]
impl PubFabric for TcpPubFabric {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut stream = self.connect().await?;
        stream.write_u8(ROLE_PUBLISH).await?;
        write_topic_frame(&mut stream, topic, payload).await
    }

    async fn subscribe(&self) -> Result<BoxStream<'static, (String, Vec<u8>)>> {
        let mut stream = self.connect().await?;
        stream.write_u8(ROLE_SUBSCRIBE).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(128);
        tokio::spawn(async move {
            loop {
                match read_topic_frame(&mut stream).await {
                    Ok(item) => {
                        if tx.send(item).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// A small in-process stand-in for the XSUB/XPUB proxy itself: publishers and
/// subscribers both dial the same bind address, and the first byte on the
/// connection says which role they're playing. Grounded on
/// `ReplicationBus::serve`'s accept-loop-plus-broadcast shape.
pub struct TcpPubFabricProxy {
    tx: broadcast::Sender<(String, Vec<u8>)>,
}

impl TcpPubFabricProxy {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(1024);
        Arc::new(Self { tx })
    }

    pub async fn serve(self: Arc<Self>, bind_address: String) -> Result<()> {
        let listener = TcpListener::bind(&bind_address)
            .await
            .map_err(|e| Error::TransportError(format!("bind {bind_address}: {e}")))?;
        tracing::info!(address = %bind_address, "pub fabric proxy listening");

        loop {
            let (socket, peer) = listener.accept().await?;
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle_connection(socket).await {
                    tracing::debug!(%peer, error = %e, "pub fabric connection ended");
                }
            });
        }
    }

    async fn handle_connection(&self, mut socket: TcpStream) -> Result<()> {
        let mut role = [0u8; 1];
        if socket.read_exact(&mut role).await.is_err() {
            return Ok(());
        }
        match role[0] {
            ROLE_PUBLISH => loop {
                let (topic, payload) = match read_topic_frame(&mut socket).await {
                    Ok(frame) => frame,
                    Err(_) => return Ok(()),
                };
                let _ = self.tx.send((topic, payload));
            },
            ROLE_SUBSCRIBE => {
                let mut rx = self.tx.subscribe();
                loop {
                    match rx.recv().await {
                        Ok((topic, payload)) => {
                            if write_topic_frame(&mut socket, &topic, &payload).await.is_err() {
                                return Ok(());
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
            }
            _ => Ok(()),
        }
    }
}
