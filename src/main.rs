use anyhow::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod cache;
mod cli;
mod codec;
mod config;
mod db;
mod fs;
mod manager;
mod snapshot;
mod stat;
mod stripe;
mod task;
mod wal;


#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse_args();

    match cli.command {
        cli::Commands::Run {
            mount_point,
            metadata_path,
            stat_address,
            read_only,
            debug,
            cache_size,
            shutdown_timeout,
            manager_address,
            filesystem_name,
        } => {
            init_tracing(debug);
            let settings = config::Settings {
                root: metadata_path,
                fs_name: filesystem_name,
                cache_size,
                read_only,
                debug,
                mount_point: Some(mount_point),
                stat_address,
                manager_address: Some(manager_address),
                shutdown_timeout: Duration::from_secs(shutdown_timeout),
            };
            run(settings).await
        }
        cli::Commands::StatServer { address } => {
            init_tracing(false);
            let shutdown = CancellationToken::new();
            let server = shutdown.clone();
            tokio::spawn(async move {
                wait_for_signal().await;
                server.cancel();
            });
            stat::serve(address, stat::StatServer::default(), shutdown).await
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

async fn run(settings: config::Settings) -> Result<()> {
    info!(
        "starting {} (mount point {:?}, debug={})",
        settings.fs_name, settings.mount_point, settings.debug
    );
    let shutdown_timeout = settings.shutdown_timeout;
    let manager_address = settings.manager_address;
    let engine = fs::MetaFs::open(settings).await?;

    let shutdown = CancellationToken::new();
    let mut manager_task = None;
    if let Some(addr) = manager_address {
        let (service, worker) = manager::ManagerServer::start(
            engine.fs_name().to_string(),
            engine.snapshots(),
            shutdown.clone(),
        );
        let server_shutdown = shutdown.clone();
        let server = task::spawn_named("manager-server", async move {
            if let Err(e) = manager::serve(addr, service, server_shutdown).await {
                error!("manager server failed: {e:#}");
            }
        });
        manager_task = Some((worker, server));
    }

    // The kernel mount adapter would attach here and translate fuse ops into
    // engine calls; this binary serves the engine and its RPC surfaces.
    info!("ledgerfs running, ctrl-c or SIGTERM to stop");
    wait_for_signal().await;

    info!("shutting down");
    shutdown.cancel();
    if let Some((worker, server)) = manager_task {
        let _ = worker.await;
        let _ = server.await;
    }
    match tokio::time::timeout(shutdown_timeout, engine.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("engine close failed: {e}"),
        Err(_) => warn!("engine close exceeded the shutdown timeout"),
    }
    Ok(())
}

async fn wait_for_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
