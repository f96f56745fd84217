//! Stat backend RPC: block counts for statfs.
//!
//! The engine never surfaces a stat failure: the client wraps every call in
//! a 200 ms deadline and the caller substitutes synthetic values when the
//! backend is slow, unreachable, or absent.

use anyhow::{Context as _, Result};
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tarpc::server::{self, Channel};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const STATFS_DEADLINE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStat {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
}

impl FsStat {
    /// Values reported when no backend answers in time.
    pub fn synthetic() -> Self {
        const GIB: u64 = 1024 * 1024 * 1024;
        Self {
            block_size: 1024,
            blocks: GIB,
            blocks_free: GIB,
            blocks_available: GIB,
        }
    }
}

#[tarpc::service]
pub trait StatBackend {
    async fn stat(fs: String) -> FsStat;
}

/// The bundled backend. Reports a fixed geometry with 90% of the blocks
/// free.
#[derive(Debug, Clone)]
pub struct StatServer {
    pub block_size: u32,
    pub blocks: u64,
}

impl Default for StatServer {
    fn default() -> Self {
        Self {
            block_size: 4096,
            blocks: 1024 * 1024 * 4096,
        }
    }
}

impl StatBackend for StatServer {
    async fn stat(self, _context: tarpc::context::Context, fs: String) -> FsStat {
        debug!("stat request for {fs:?}");
        let free = self.blocks / 10 * 9;
        FsStat {
            block_size: self.block_size,
            blocks: self.blocks,
            blocks_free: free,
            blocks_available: free,
        }
    }
}

pub struct StatClient {
    client: StatBackendClient,
}

impl StatClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to stat backend at {addr}"))?;
        let framed = Framed::new(stream, LengthDelimitedCodec::new());
        let transport =
            tarpc::serde_transport::new(framed, tarpc::tokio_serde::formats::Bincode::default());
        let client =
            StatBackendClient::new(tarpc::client::Config::default(), transport).spawn();
        Ok(Self { client })
    }

    pub fn from_inner(client: StatBackendClient) -> Self {
        Self { client }
    }

    /// One stat round trip under the deadline; `None` on timeout or error.
    pub async fn stat(&self, fs: &str) -> Option<FsStat> {
        let call = self.client.stat(tarpc::context::current(), fs.to_string());
        match tokio::time::timeout(STATFS_DEADLINE, call).await {
            Ok(Ok(stat)) => Some(stat),
            Ok(Err(e)) => {
                debug!("stat backend error: {e}");
                None
            }
            Err(_) => {
                debug!("stat backend deadline exceeded");
                None
            }
        }
    }
}

pub async fn serve(
    addr: SocketAddr,
    service: StatServer,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding stat server to {addr}"))?;
    serve_with_listener(listener, service, shutdown).await
}

pub async fn serve_with_listener(
    listener: TcpListener,
    service: StatServer,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("stat server listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("stat server shutting down");
                break;
            }
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept stat connection: {e}");
                        continue;
                    }
                };
                let service = service.clone();
                let client_shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let framed = Framed::new(stream, LengthDelimitedCodec::new());
                    let transport = tarpc::serde_transport::new(
                        framed,
                        tarpc::tokio_serde::formats::Bincode::default(),
                    );
                    let channel = server::BaseChannel::with_defaults(transport);
                    debug!("stat client connected from {peer_addr}");
                    tokio::select! {
                        _ = client_shutdown.cancelled() => {}
                        _ = channel
                            .execute(service.serve())
                            .for_each(|response| async move {
                                tokio::spawn(response);
                            }) => {
                            debug!("stat client disconnected from {peer_addr}");
                        }
                    }
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_process_pair(service: StatServer) -> StatClient {
        let (client_transport, server_transport) = tarpc::transport::channel::unbounded();
        tokio::spawn(
            server::BaseChannel::with_defaults(server_transport)
                .execute(service.serve())
                .for_each(|response| async move {
                    tokio::spawn(response);
                }),
        );
        StatClient::from_inner(
            StatBackendClient::new(tarpc::client::Config::default(), client_transport).spawn(),
        )
    }

    #[tokio::test]
    async fn test_backend_reports_ninety_percent_free() {
        let blocks = 1_000_000u64;
        let client = in_process_pair(StatServer {
            block_size: 4096,
            blocks,
        });
        let stat = client.stat("testfs").await.unwrap();
        assert_eq!(stat.block_size, 4096);
        assert_eq!(stat.blocks, blocks);
        assert_eq!(stat.blocks_free, blocks / 10 * 9);
        assert_eq!(stat.blocks_available, blocks / 10 * 9);
    }

    #[tokio::test]
    async fn test_synthetic_values() {
        let stat = FsStat::synthetic();
        assert_eq!(stat.block_size, 1024);
        assert_eq!(stat.blocks, 1024 * 1024 * 1024);
        assert_eq!(stat.blocks, stat.blocks_free);
        assert_eq!(stat.blocks, stat.blocks_available);
    }
}
