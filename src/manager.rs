//! Snapshot manager RPC.
//!
//! Snapshot creation is serialized on a single worker; the RPC returns a
//! creation id immediately and clients poll `get_snapshot` for the status
//! transition from "in progress" to "done".

use crate::snapshot::SnapshotEngine;
use crate::task::spawn_named;
use anyhow::{Context as _, Result};
use dashmap::DashMap;
use futures::prelude::*;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;
use tarpc::server::{self, Channel};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const STATUS_IN_PROGRESS: &str = "in progress";
pub const STATUS_DONE: &str = "done";
pub const STATUS_FAILED: &str = "failed";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub name: String,
    /// Content hash once the snapshot is done, empty while in progress.
    pub id: String,
    pub created: SystemTime,
    pub status: String,
}

#[tarpc::service]
pub trait Manager {
    async fn create_snapshot(name: String) -> Result<u64, String>;
    async fn get_snapshot(creation_id: u64) -> Result<SnapshotStatus, String>;
}

#[derive(Clone)]
pub struct ManagerServer {
    fs_name: String,
    results: Arc<DashMap<u64, SnapshotStatus>>,
    next_id: Arc<AtomicU64>,
    queue: mpsc::Sender<(u64, String)>,
}

impl ManagerServer {
    /// Start the single snapshot worker and return the service handle.
    pub fn start(
        fs_name: String,
        snapshots: Arc<SnapshotEngine>,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let results: Arc<DashMap<u64, SnapshotStatus>> = Arc::new(DashMap::new());
        let (tx, mut rx) = mpsc::channel::<(u64, String)>(16);

        let worker_results = Arc::clone(&results);
        let worker = spawn_named("snapshot-worker", async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    request = rx.recv() => {
                        let Some((creation_id, name)) = request else { return };
                        let outcome = snapshots.create_sync_snapshot(&name).await;
                        if let Some(mut entry) = worker_results.get_mut(&creation_id) {
                            match outcome {
                                Ok(hash) => {
                                    entry.id = hash;
                                    entry.status = STATUS_DONE.to_string();
                                }
                                Err(e) => {
                                    error!("snapshot {name:?} failed: {e}");
                                    entry.status = format!("{STATUS_FAILED}: {e}");
                                }
                            }
                        }
                    }
                }
            }
        });

        (
            Self {
                fs_name,
                results,
                next_id: Arc::new(AtomicU64::new(0)),
                queue: tx,
            },
            worker,
        )
    }
}

impl Manager for ManagerServer {
    async fn create_snapshot(
        self,
        _context: tarpc::context::Context,
        name: String,
    ) -> Result<u64, String> {
        if name.is_empty() || name.eq_ignore_ascii_case(&self.fs_name) {
            return Err("wrong fs name".to_string());
        }
        let creation_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.results.insert(
            creation_id,
            SnapshotStatus {
                name: name.clone(),
                id: String::new(),
                created: SystemTime::now(),
                status: STATUS_IN_PROGRESS.to_string(),
            },
        );
        self.queue
            .send((creation_id, name))
            .await
            .map_err(|_| "snapshot worker is gone".to_string())?;
        Ok(creation_id)
    }

    async fn get_snapshot(
        self,
        _context: tarpc::context::Context,
        creation_id: u64,
    ) -> Result<SnapshotStatus, String> {
        self.results
            .get(&creation_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| format!("snapshot with id {creation_id} not found"))
    }
}

pub async fn serve(
    addr: SocketAddr,
    service: ManagerServer,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding manager server to {addr}"))?;
    info!("manager server listening on {addr}");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("manager server shutting down");
                break;
            }
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to accept manager connection: {e}");
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
                    info!("manager client connected from {peer_addr}");
                    tokio::select! {
                        _ = client_shutdown.cancelled() => {}
                        _ = channel
                            .execute(service.serve())
                            .for_each(|response| async move {
                                tokio::spawn(response);
                            }) => {
                            info!("manager client disconnected from {peer_addr}");
                        }
                    }
                });
            }
        }
    }
    Ok(())
}
