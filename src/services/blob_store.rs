//! src/services/blob_store.rs
//!
//! BlobStore: content-addressed payload storage on local disk. Payloads are
//! staged in `base_path/.staging`, hashed while they stream in, and published
//! by an atomic rename to `base_path/{algorithm}/{hex[0..2]}/{hex[2..4]}/{hex}`.
//! A digest only becomes visible to readers once its bytes are fsynced and
//! renamed into place.
//!
//! Deletion is coordinated through per-digest locks and pins. Callers that
//! must decide whether a blob is still referenced take [`BlobStore::lock`]
//! and pass the guard to [`BlobStore::delete`]; ingests hold a [`BlobPin`]
//! from the moment their write is published until their catalog row exists.

use crate::models::digest::{Digest, DigestAlgorithm};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use std::{
    collections::HashMap,
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::{Duration, SystemTime},
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, Take},
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
    time,
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STAGING_DIR: &str = ".staging";
const RETRY_BASE_MS: u64 = 25;
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(Digest),
    #[error("invalid range [{start}, {end}) for blob of {total} bytes")]
    InvalidRange { start: u64, end: u64, total: u64 },
    #[error("range [{start}, {end}) is not satisfiable for blob of {total} bytes")]
    RangeNotSatisfiable { start: u64, end: u64, total: u64 },
    #[error("payload exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("no data received within {0:?}")]
    IdleTimeout(Duration),
    #[error("upload stream interrupted: {0}")]
    Source(io::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// What `open_range` does with an `end` past the end of the blob.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RangeEndPolicy {
    /// Serve up to the last byte.
    #[default]
    Clamp,
    /// Fail with [`BlobError::RangeNotSatisfiable`].
    Reject,
}

impl std::str::FromStr for RangeEndPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clamp" => Ok(Self::Clamp),
            "reject" => Ok(Self::Reject),
            other => Err(format!("unknown range end policy `{}`", other)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlobStoreOptions {
    pub algorithm: DigestAlgorithm,
    /// Upper bound on bytes held in memory per read stream.
    pub chunk_size: usize,
    /// Extra attempts for the publish step after a transient I/O failure.
    pub write_retries: u32,
    pub end_policy: RangeEndPolicy,
}

impl Default for BlobStoreOptions {
    fn default() -> Self {
        Self {
            algorithm: DigestAlgorithm::Sha256,
            chunk_size: DEFAULT_CHUNK_SIZE,
            write_retries: 3,
            end_policy: RangeEndPolicy::Clamp,
        }
    }
}

/// Limits enforced while a payload streams in.
#[derive(Clone, Debug, Default)]
pub struct PutLimits {
    pub max_bytes: Option<u64>,
    /// Longest allowed gap between two chunks.
    pub idle_timeout: Option<Duration>,
}

/// Outcome of a successful `put`.
///
/// Holds a pin on the digest: the blob cannot be garbage-collected until the
/// receipt is dropped.
#[derive(Debug)]
pub struct BlobReceipt {
    pub digest: Digest,
    pub byte_length: u64,
    /// True when identical content was already stored.
    pub deduplicated: bool,
    pub pin: BlobPin,
}

#[derive(Clone)]
pub struct BlobStore {
    /// Root directory for blobs and the staging area.
    pub base_path: PathBuf,
    options: BlobStoreOptions,
    locks: DigestLocks,
    pins: Arc<Mutex<HashMap<Digest, usize>>>,
    open_readers: Arc<AtomicUsize>,
}

impl BlobStore {
    pub fn new(base_path: impl Into<PathBuf>, options: BlobStoreOptions) -> Self {
        Self {
            base_path: base_path.into(),
            options,
            locks: DigestLocks::default(),
            pins: Arc::new(Mutex::new(HashMap::new())),
            open_readers: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.options.algorithm
    }

    pub fn chunk_size(&self) -> usize {
        self.options.chunk_size
    }

    /// Number of read streams that have not been dropped yet.
    pub fn open_readers(&self) -> usize {
        self.open_readers.load(Ordering::SeqCst)
    }

    /// Directory uploads are written to before they are published.
    pub fn staging_dir(&self) -> PathBuf {
        self.base_path.join(STAGING_DIR)
    }

    /// Physical location of a blob: `{base}/{algorithm}/{hex[0:2]}/{hex[2:4]}/{hex}`.
    fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        self.base_path
            .join(digest.algorithm().as_str())
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex)
    }

    /// Store a payload without size or idle limits.
    pub async fn put<S>(&self, stream: S) -> BlobResult<BlobReceipt>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.put_with_limits(stream, &PutLimits::default()).await
    }

    /// Stream a payload to disk, hashing as it goes, then publish it under its
    /// digest.
    ///
    /// - Bytes land in a uniquely named staging file, never in the final path.
    /// - Any failure while receiving discards the staging file.
    /// - Publishing happens under the digest lock; if the digest already
    ///   exists the staged copy is dropped and the existing blob is kept.
    /// - The transient publish step is retried with backoff.
    pub async fn put_with_limits<S>(&self, stream: S, limits: &PutLimits) -> BlobResult<BlobReceipt>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let staging = self.staging_dir();
        fs::create_dir_all(&staging).await?;
        let tmp_path = staging.join(format!(".tmp-{}", Uuid::new_v4()));

        let (digest, byte_length) = match self.stage(stream, limits, &tmp_path).await {
            Ok(staged) => staged,
            Err(err) => {
                discard(&tmp_path).await;
                warn!("discarded partial upload {}: {}", tmp_path.display(), err);
                return Err(err);
            }
        };

        let guard = self.lock(&digest).await;
        let deduplicated = match self.publish(&tmp_path, &guard).await {
            Ok(deduplicated) => deduplicated,
            Err(err) => {
                discard(&tmp_path).await;
                return Err(err);
            }
        };
        let pin = self.pin(&digest);
        drop(guard);

        if deduplicated {
            debug!(%digest, byte_length, "blob already present, staged copy dropped");
        } else {
            info!(%digest, byte_length, "stored blob");
        }

        Ok(BlobReceipt {
            digest,
            byte_length,
            deduplicated,
            pin,
        })
    }

    async fn stage<S>(
        &self,
        stream: S,
        limits: &PutLimits,
        tmp_path: &Path,
    ) -> BlobResult<(Digest, u64)>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut file = File::create(tmp_path).await?;
        let mut hasher = self.options.algorithm.hasher();
        let mut byte_length: u64 = 0;

        pin_mut!(stream);
        loop {
            let next = match limits.idle_timeout {
                Some(idle) => time::timeout(idle, stream.next())
                    .await
                    .map_err(|_| BlobError::IdleTimeout(idle))?,
                None => stream.next().await,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(BlobError::Source)?;

            byte_length += chunk.len() as u64;
            if let Some(limit) = limits.max_bytes {
                if byte_length > limit {
                    return Err(BlobError::PayloadTooLarge { limit });
                }
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok((hasher.finalize(), byte_length))
    }

    async fn publish(&self, tmp_path: &Path, guard: &DigestGuard) -> BlobResult<bool> {
        let target = self.blob_path(guard.digest());
        let mut attempt = 0;
        loop {
            match try_publish(tmp_path, &target).await {
                Ok(deduplicated) => return Ok(deduplicated),
                Err(err) if attempt < self.options.write_retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(RETRY_BASE_MS << attempt.min(6));
                    warn!(
                        digest = %guard.digest(),
                        attempt,
                        "publishing blob failed ({}), retrying in {:?}",
                        err,
                        backoff
                    );
                    time::sleep(backoff).await;
                }
                Err(err) => return Err(BlobError::Io(err)),
            }
        }
    }

    pub async fn exists(&self, digest: &Digest) -> BlobResult<bool> {
        Ok(fs::try_exists(self.blob_path(digest)).await?)
    }

    /// Size of a stored blob.
    pub async fn size(&self, digest: &Digest) -> BlobResult<u64> {
        let meta = fs::metadata(self.blob_path(digest))
            .await
            .map_err(|err| not_found_or_io(err, digest))?;
        Ok(meta.len())
    }

    /// Open a stream over the half-open byte range `[start, end)`.
    ///
    /// The stream yields at most `chunk_size` bytes per item and reads the
    /// next chunk from disk only when polled. Dropping it closes the file.
    pub async fn open_range(&self, digest: &Digest, start: u64, end: u64) -> BlobResult<BlobReadStream> {
        let path = self.blob_path(digest);
        let mut file = File::open(&path)
            .await
            .map_err(|err| not_found_or_io(err, digest))?;
        let total = file.metadata().await?.len();
        let end = resolve_window(start, end, total, self.options.end_policy)?;

        file.seek(SeekFrom::Start(start)).await?;
        let reader = file.take(end - start);
        debug!(%digest, start, end, total, "opened blob range");

        Ok(BlobReadStream {
            inner: ReaderStream::with_capacity(reader, self.options.chunk_size),
            start,
            end,
            total,
            _guard: ReaderGuard::new(self.open_readers.clone()),
        })
    }

    /// Take the exclusive lock for `digest`.
    ///
    /// Publishing, catalog registration and deletion of the same digest are
    /// serialized on this lock.
    pub async fn lock(&self, digest: &Digest) -> DigestGuard {
        self.locks.lock(digest).await
    }

    /// Keep `digest` alive until the returned pin is dropped.
    pub fn pin(&self, digest: &Digest) -> BlobPin {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        *pins.entry(digest.clone()).or_insert(0) += 1;
        BlobPin {
            digest: digest.clone(),
            pins: self.pins.clone(),
        }
    }

    pub fn is_pinned(&self, digest: &Digest) -> bool {
        let pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        pins.get(digest).copied().unwrap_or(0) > 0
    }

    /// Remove the blob named by `guard`, unless an ingest still pins it.
    ///
    /// The caller is responsible for checking catalog references while
    /// holding the same guard. Returns whether bytes were removed.
    pub async fn delete(&self, guard: &DigestGuard) -> BlobResult<bool> {
        let digest = guard.digest();
        if self.is_pinned(digest) {
            debug!(%digest, "blob is pinned by an in-flight ingest, keeping it");
            return Ok(false);
        }

        let file_path = self.blob_path(digest);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed blob file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("blob file {} already missing", file_path.display());
                return Ok(false);
            }
            Err(err) => return Err(BlobError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let algorithm_root = self.base_path.join(digest.algorithm().as_str());
            prune_empty_dirs(parent, &algorithm_root).await;
        }

        info!(%digest, "deleted blob");
        Ok(true)
    }

    /// Every digest currently published, in no particular order.
    pub async fn digests(&self) -> BlobResult<Vec<Digest>> {
        let mut found = Vec::new();
        for algorithm in DigestAlgorithm::all() {
            let root = self.base_path.join(algorithm.as_str());
            for shard_a in list_dir(&root).await? {
                for shard_b in list_dir(&shard_a).await? {
                    for blob in list_dir(&shard_b).await? {
                        let Some(name) = blob.file_name().and_then(|n| n.to_str()) else {
                            continue;
                        };
                        match Digest::parse(&format!("{}:{}", algorithm, name)) {
                            Some(digest) => found.push(digest),
                            None => debug!("ignoring stray file {}", blob.display()),
                        }
                    }
                }
            }
        }
        Ok(found)
    }

    /// Remove staging files untouched for longer than `older_than`.
    ///
    /// Live uploads write continuously, so anything this old belongs to a
    /// process that died mid-upload.
    pub async fn clean_staging(&self, older_than: Duration) -> BlobResult<usize> {
        let now = SystemTime::now();
        let mut removed = 0;
        for path in list_dir(&self.staging_dir()).await? {
            let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(BlobError::Io(err)),
            };
            let age = now.duration_since(modified).unwrap_or_default();
            if age >= older_than {
                match fs::remove_file(&path).await {
                    Ok(_) => removed += 1,
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(BlobError::Io(err)),
                }
            }
        }
        Ok(removed)
    }
}

/// Validate `[start, end)` against a blob of `total` bytes and return the
/// effective end.
///
/// An empty blob accepts exactly the empty window `[0, 0)`.
pub fn resolve_window(start: u64, end: u64, total: u64, policy: RangeEndPolicy) -> BlobResult<u64> {
    if start > end || (start >= total && !(total == 0 && start == 0)) {
        return Err(BlobError::InvalidRange { start, end, total });
    }
    if end > total {
        return match policy {
            RangeEndPolicy::Clamp => Ok(total),
            RangeEndPolicy::Reject => Err(BlobError::RangeNotSatisfiable { start, end, total }),
        };
    }
    Ok(end)
}

async fn try_publish(tmp_path: &Path, target: &Path) -> io::Result<bool> {
    if fs::try_exists(target).await? {
        match fs::remove_file(tmp_path).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        return Ok(true);
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(tmp_path, target).await?;
    Ok(false)
}

async fn discard(tmp_path: &Path) {
    if let Err(err) = fs::remove_file(tmp_path).await {
        if err.kind() != ErrorKind::NotFound {
            warn!("failed to remove staging file {}: {}", tmp_path.display(), err);
        }
    }
}

fn not_found_or_io(err: io::Error, digest: &Digest) -> BlobError {
    if err.kind() == ErrorKind::NotFound {
        BlobError::NotFound(digest.clone())
    } else {
        BlobError::Io(err)
    }
}

/// Entries of `dir`, or nothing when it does not exist.
async fn list_dir(dir: &Path) -> BlobResult<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(BlobError::Io(err)),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    Ok(paths)
}

/// Recursively remove empty shard directories up to `stop`.
async fn prune_empty_dirs(start: &Path, stop: &Path) {
    let mut current = start.to_path_buf();
    while current.starts_with(stop) && current != stop {
        match fs::remove_dir(&current).await {
            Ok(_) => {
                if let Some(parent) = current.parent() {
                    current = parent.to_path_buf();
                } else {
                    break;
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => break,
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
            Err(err) => {
                debug!("failed to prune directory {}: {}", current.display(), err);
                break;
            }
        }
    }
}

/// Per-digest async mutexes, created on demand and dropped once unused.
#[derive(Clone, Default)]
struct DigestLocks {
    slots: Arc<Mutex<HashMap<Digest, Weak<AsyncMutex<()>>>>>,
}

impl DigestLocks {
    async fn lock(&self, digest: &Digest) -> DigestGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.retain(|_, slot| slot.strong_count() > 0);
            match slots.get(digest).and_then(Weak::upgrade) {
                Some(slot) => slot,
                None => {
                    let slot = Arc::new(AsyncMutex::new(()));
                    slots.insert(digest.clone(), Arc::downgrade(&slot));
                    slot
                }
            }
        };
        DigestGuard {
            digest: digest.clone(),
            _guard: slot.lock_owned().await,
        }
    }
}

/// Proof of holding the lock for one digest.
pub struct DigestGuard {
    digest: Digest,
    _guard: OwnedMutexGuard<()>,
}

impl DigestGuard {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

/// Keeps a digest from being garbage-collected while alive.
#[derive(Debug)]
pub struct BlobPin {
    digest: Digest,
    pins: Arc<Mutex<HashMap<Digest, usize>>>,
}

impl BlobPin {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl Drop for BlobPin {
    fn drop(&mut self) {
        let mut pins = self.pins.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = pins.get_mut(&self.digest) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                pins.remove(&self.digest);
            }
        }
    }
}

struct ReaderGuard(Arc<AtomicUsize>);

impl ReaderGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Chunked, pull-driven read over a window of one blob.
pub struct BlobReadStream {
    inner: ReaderStream<Take<File>>,
    start: u64,
    end: u64,
    total: u64,
    _guard: ReaderGuard,
}

impl BlobReadStream {
    /// First byte served.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// One past the last byte served.
    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Size of the whole blob.
    pub fn total(&self) -> u64 {
        self.total
    }
}

impl Stream for BlobReadStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
