//! Striped reader/writer lock keyed by inode id.
//!
//! A fixed array of stripes serializes metadata operations per inode without
//! per-inode allocation. The stripe is selected by `id % width`; the default
//! width is the process open-files limit.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct StripedLock {
    stripes: Vec<RwLock<()>>,
}

/// Write guards for a two-stripe operation, held until drop.
pub struct PairGuard<'a> {
    _first: RwLockWriteGuard<'a, ()>,
    _second: Option<RwLockWriteGuard<'a, ()>>,
}

impl StripedLock {
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            stripes: (0..width).map(|_| RwLock::new(())).collect(),
        }
    }

    /// Width defaults to `RLIMIT_NOFILE`, matching the number of inodes the
    /// kernel can plausibly have in flight.
    pub fn with_default_width() -> Self {
        Self::new(nofile_limit())
    }

    pub fn width(&self) -> usize {
        self.stripes.len()
    }

    fn stripe(&self, id: u64) -> usize {
        (id % self.stripes.len() as u64) as usize
    }

    pub async fn read(&self, id: u64) -> RwLockReadGuard<'_, ()> {
        self.stripes[self.stripe(id)].read().await
    }

    pub async fn write(&self, id: u64) -> RwLockWriteGuard<'_, ()> {
        self.stripes[self.stripe(id)].write().await
    }

    /// Acquire write locks for two ids in stripe order. Acquisition order is
    /// fixed by stripe index so concurrent pair-lockers cannot deadlock, and
    /// ids sharing a stripe collapse to a single guard.
    pub async fn write_pair(&self, a: u64, b: u64) -> PairGuard<'_> {
        let (sa, sb) = (self.stripe(a), self.stripe(b));
        if sa == sb {
            return PairGuard {
                _first: self.stripes[sa].write().await,
                _second: None,
            };
        }
        let (lo, hi) = if sa < sb { (sa, sb) } else { (sb, sa) };
        let first = self.stripes[lo].write().await;
        let second = self.stripes[hi].write().await;
        PairGuard {
            _first: first,
            _second: Some(second),
        }
    }
}

/// Soft `RLIMIT_NOFILE` for the current process, with a conservative fallback.
pub fn nofile_limit() -> usize {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc == 0 && limit.rlim_cur > 0 {
        limit.rlim_cur as usize
    } else {
        1024
    }
}
