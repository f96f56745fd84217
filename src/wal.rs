//! Write-ahead log for the attribute cache.
//!
//! The log is a directory of numbered segment files `<N>.wal`. Each segment
//! is an append-only sequence of lines `base64(key)#base64(value)#{0|1}`,
//! the final field being the tombstone bit. The highest-numbered segment is
//! the active one; `dump` rotates to a fresh segment and asynchronously
//! applies the previous one to the attribute store in batches, deleting the
//! segment file only after its last batch has committed. A dump that dies
//! mid-way leaves the segment behind, and the next process start picks it up
//! again through the highest-N rule, so dumps are idempotent.

use crate::codec;
use crate::db::MetaStore;
use crate::fs::errors::FsError;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tracing::{debug, warn};

pub const WAL_BATCH_MAX: usize = 500;
const SEGMENT_SUFFIX: &str = ".wal";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub tombstoned: bool,
}

pub fn encode_line(entry: &WalEntry) -> String {
    format!(
        "{}#{}#{}\n",
        BASE64.encode(&entry.key),
        BASE64.encode(&entry.value),
        if entry.tombstoned { "1" } else { "0" }
    )
}

pub fn decode_line(line: &str, position: usize) -> Result<WalEntry, FsError> {
    let parts: Vec<&str> = line.split('#').collect();
    if parts.len() != 3 {
        return Err(FsError::Replay(format!(
            "malformed entry at line {position}"
        )));
    }
    let key = BASE64
        .decode(parts[0])
        .map_err(|e| FsError::Replay(format!("unable to decode entry key in line {position}: {e}")))?;
    let value = BASE64
        .decode(parts[1])
        .map_err(|e| {
            FsError::Replay(format!("unable to decode entry value in line {position}: {e}"))
        })?;
    let tombstoned = match parts[2] {
        "0" => false,
        "1" => true,
        other => {
            return Err(FsError::Replay(format!(
                "bad tombstone flag {other:?} at line {position}"
            )));
        }
    };
    Ok(WalEntry {
        key: Bytes::from(key),
        value: Bytes::from(value),
        tombstoned,
    })
}

struct ActiveSegment {
    file: std::fs::File,
    path: PathBuf,
    counter: u64,
}

pub struct Wal {
    dir: PathBuf,
    active: Mutex<ActiveSegment>,
    store: Arc<MetaStore>,
    dumps: tokio::sync::Mutex<JoinSet<Result<(), FsError>>>,
    /// Secondary target for dump batches while a snapshot copy is running.
    mirror: RwLock<Option<Arc<MetaStore>>>,
    /// Segments below the active counter found at open: a dump died before
    /// removing them. Drained by `recover_stale`.
    stale: Mutex<Vec<PathBuf>>,
}

impl Wal {
    /// Open the highest-numbered segment in `dir`, creating `0.wal` when the
    /// directory is empty.
    pub fn open(dir: impl Into<PathBuf>, store: Arc<MetaStore>) -> Result<Self, FsError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| FsError::Failed(e.to_string()))?;

        let mut counter = 0u64;
        let mut numbers = Vec::new();
        let entries = std::fs::read_dir(&dir).map_err(|e| FsError::Failed(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| FsError::Failed(e.to_string()))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(SEGMENT_SUFFIX) else {
                continue;
            };
            if let Ok(n) = stem.parse::<u64>() {
                counter = counter.max(n);
                numbers.push(n);
            }
        }
        numbers.sort_unstable();
        let stale: Vec<PathBuf> = numbers
            .iter()
            .filter(|&&n| n < counter)
            .map(|&n| segment_path(&dir, n))
            .collect();

        let path = segment_path(&dir, counter);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| FsError::Failed(e.to_string()))?;
        trim_torn_tail(&path, &file)?;
        debug!("opened wal segment {:?}", path);

        Ok(Self {
            dir,
            active: Mutex::new(ActiveSegment {
                file,
                path,
                counter,
            }),
            store,
            dumps: tokio::sync::Mutex::new(JoinSet::new()),
            mirror: RwLock::new(None),
            stale: Mutex::new(stale),
        })
    }

    /// Flush segments left behind by a dump that never finished, oldest
    /// first. Re-applying a partially flushed segment is harmless: the same
    /// puts and deletes land again.
    pub async fn recover_stale(&self) -> Result<usize, FsError> {
        let stale = std::mem::take(&mut *self.stale.lock().unwrap());
        let count = stale.len();
        for path in stale {
            warn!("recovering undumped wal segment {:?}", path);
            let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
            flush_segment(Arc::clone(&self.store), None, path, tx).await?;
        }
        Ok(count)
    }

    pub fn segment_counter(&self) -> u64 {
        self.active.lock().unwrap().counter
    }

    /// Append one entry to the active segment. No fsync per entry; durability
    /// comes from the dump protocol.
    pub fn append(&self, entry: &WalEntry) -> Result<(), FsError> {
        let line = encode_line(entry);
        let mut active = self.active.lock().unwrap();
        active
            .file
            .write_all(line.as_bytes())
            .map_err(|e| FsError::Failed(e.to_string()))
    }

    /// Decode every record of the active segment, in order. A final line
    /// without its newline is treated as a torn write: dropped with a warning.
    /// Any other malformed line is fatal.
    pub async fn replay(&self) -> Result<Vec<WalEntry>, FsError> {
        let path = self.active.lock().unwrap().path.clone();
        read_segment(&path).await
    }

    /// Rotate to a new segment and asynchronously flush the previous one into
    /// the attribute store, reporting each flushed key on `output`.
    pub async fn dump(&self, output: UnboundedSender<u64>) -> Result<(), FsError> {
        let previous = self.rotate()?;
        let store = Arc::clone(&self.store);
        let mirror = self.mirror.read().unwrap().clone();
        self.dumps
            .lock()
            .await
            .spawn(async move { flush_segment(store, mirror, previous, output).await });
        Ok(())
    }

    fn rotate(&self) -> Result<PathBuf, FsError> {
        let mut active = self.active.lock().unwrap();
        let previous = active.path.clone();
        let next = active.counter + 1;
        let path = segment_path(&self.dir, next);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)
            .map_err(|e| FsError::Failed(e.to_string()))?;
        active.file = file;
        active.path = path;
        active.counter = next;
        debug!("rotated wal to segment {}", next);
        Ok(previous)
    }

    /// Block until every in-flight dump has finished.
    pub async fn wait(&self) -> Result<(), FsError> {
        let mut dumps = self.dumps.lock().await;
        while let Some(result) = dumps.join_next().await {
            result.map_err(|e| FsError::Failed(e.to_string()))??;
        }
        Ok(())
    }

    pub fn set_mirror(&self, mirror: Arc<MetaStore>) {
        *self.mirror.write().unwrap() = Some(mirror);
    }

    pub fn clear_mirror(&self) {
        *self.mirror.write().unwrap() = None;
    }

    pub async fn close(&self) -> Result<(), FsError> {
        self.wait().await?;
        let active = self.active.lock().unwrap();
        active
            .file
            .sync_all()
            .map_err(|e| FsError::Failed(e.to_string()))
    }
}

fn segment_path(dir: &Path, counter: u64) -> PathBuf {
    dir.join(format!("{counter}{SEGMENT_SUFFIX}"))
}

/// Cut a torn final line off the active segment before any append lands
/// behind it. Appends resume on a clean line boundary, so the segment stays
/// decodable after a crash mid-write.
fn trim_torn_tail(path: &Path, file: &std::fs::File) -> Result<(), FsError> {
    let data = std::fs::read(path).map_err(|e| FsError::Failed(e.to_string()))?;
    if data.is_empty() || data.last() == Some(&b'\n') {
        return Ok(());
    }
    let keep = data.iter().rposition(|&b| b == b'\n').map_or(0, |pos| pos + 1) as u64;
    warn!(
        "dropping torn tail of wal segment {:?} ({} bytes)",
        path,
        data.len() as u64 - keep
    );
    file.set_len(keep).map_err(|e| FsError::Failed(e.to_string()))
}

async fn read_segment(path: &Path) -> Result<Vec<WalEntry>, FsError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| FsError::Failed(e.to_string()))?;
    let mut reader = tokio::io::BufReader::new(file);
    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut position = 0usize;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .await
            .map_err(|e| FsError::Failed(e.to_string()))?;
        if n == 0 {
            break;
        }
        position += 1;
        if buf.last() != Some(&b'\n') {
            warn!(
                "dropping truncated trailing line {} of wal segment {:?}",
                position, path
            );
            break;
        }
        let line = std::str::from_utf8(&buf[..n - 1])
            .map_err(|e| FsError::Replay(format!("non-utf8 entry at line {position}: {e}")))?;
        entries.push(decode_line(line, position)?);
    }
    Ok(entries)
}

/// Apply one drained segment to the attribute store in batches, mirroring
/// each batch when a snapshot copy is in flight, then remove the file.
async fn flush_segment(
    store: Arc<MetaStore>,
    mirror: Option<Arc<MetaStore>>,
    path: PathBuf,
    output: UnboundedSender<u64>,
) -> Result<(), FsError> {
    let entries = read_segment(&path).await?;
    for chunk in entries.chunks(WAL_BATCH_MAX) {
        let mut batch = store.new_batch();
        for entry in chunk {
            if entry.tombstoned {
                batch.delete(&entry.key);
            } else {
                batch.put(&entry.key, &entry.value);
            }
        }
        store.write(batch).await?;
        if let Some(mirror) = &mirror {
            let mut batch = mirror.new_batch();
            for entry in chunk {
                if entry.tombstoned {
                    batch.delete(&entry.key);
                } else {
                    batch.put(&entry.key, &entry.value);
                }
            }
            mirror.write(batch).await?;
        }
        // Keys are reported only once their batch has committed, so a
        // processed cache item is always backed by the store.
        for entry in chunk {
            let key = codec::bytes_to_u64(&entry.key)?;
            let _ = output.send(key);
        }
    }
    tokio::fs::remove_file(&path)
        .await
        .map_err(|e| FsError::Failed(e.to_string()))?;
    debug!("flushed and removed wal segment {:?}", path);
    Ok(())
}
