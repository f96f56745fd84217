use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CACHE_SIZE: usize = 10_000;
pub const DEFAULT_FS_NAME: &str = "ledgerfs#head";

/// Engine and server settings, normally filled in from the CLI.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for stores, WAL, and marker files.
    pub root: PathBuf,
    pub fs_name: String,
    /// Attribute-cache population threshold.
    pub cache_size: usize,
    pub read_only: bool,
    pub debug: bool,
    pub mount_point: Option<PathBuf>,
    pub stat_address: Option<SocketAddr>,
    pub manager_address: Option<SocketAddr>,
    pub shutdown_timeout: Duration,
}

impl Settings {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            fs_name: DEFAULT_FS_NAME.to_string(),
            cache_size: DEFAULT_CACHE_SIZE,
            read_only: false,
            debug: false,
            mount_point: None,
            stat_address: None,
            manager_address: None,
            shutdown_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }
}
