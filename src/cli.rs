use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ledgerfs")]
#[command(author, version, about = "KV-backed filesystem metadata engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the metadata engine with its manager RPC server
    Run {
        /// Path the filesystem would be mounted at
        #[arg(long)]
        mount_point: PathBuf,
        /// Directory holding the metadata stores, WAL, and marker files
        #[arg(long, default_value = "/tmp/ledgerfs")]
        metadata_path: PathBuf,
        /// Address of the stat backend server
        #[arg(long)]
        stat_address: Option<SocketAddr>,
        /// Open in read-only mode
        #[arg(long)]
        read_only: bool,
        /// Verbose logging
        #[arg(long)]
        debug: bool,
        /// Attribute-cache population threshold
        #[arg(long, default_value_t = crate::config::DEFAULT_CACHE_SIZE)]
        cache_size: usize,
        /// Seconds to wait for a clean shutdown
        #[arg(long, default_value_t = 60)]
        shutdown_timeout: u64,
        /// Snapshot manager listen address
        #[arg(long, default_value = "127.0.0.1:50052")]
        manager_address: SocketAddr,
        /// Filesystem name reported to the stat backend
        #[arg(long, default_value = crate::config::DEFAULT_FS_NAME)]
        filesystem_name: String,
    },
    /// Run the bundled stat backend server
    StatServer {
        #[arg(long, default_value = "127.0.0.1:50051")]
        address: SocketAddr,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
