//! Cloud filter fetching and the content-addressed cache.
//!
//! Remote effect assets are fetched out-of-band from the frame path. The
//! cache is keyed by the asset's SHA-256 checksum, not its filename: a hit
//! is only a hit if the bytes on disk still hash to the expected value, so a
//! corrupted entry can never reach a caller. Transfers land in a temp
//! directory and are atomically renamed into the cache on success only.
//!
//! Concurrent fetches for the same asset coalesce into one transfer whose
//! result fans out to every requester. Each requester holds its own handle
//! and can cancel independently; the transfer itself aborts once every
//! requester has cancelled, and a cancelled handle never observes a stale
//! success afterwards.
//!
//! Transient failures (network, checksum mismatch) get exactly one automatic
//! retry before surfacing. If the configured cache root is unwritable the
//! manager degrades to no-cache mode: every fetch transfers to the process
//! temp directory and nothing persists.

use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, ErrorCode, Result};

const DOWNLOAD_CHUNK_BYTES: usize = 64 * 1024;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Reference to a remote filter asset. The checksum is the lowercase hex
/// SHA-256 of the asset content and doubles as its cache key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterRef {
    pub id: String,
    pub url: String,
    pub checksum: String,
}

/// Terminal outcome of a fetch.
#[derive(Debug, Clone)]
pub enum FetchStatus {
    Completed(PathBuf),
    Cancelled,
    Failed(Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Cancelled,
}

/// Transport seam for the actual byte transfer. Production uses `ureq`;
/// tests substitute in-memory bodies.
pub trait FilterTransport: Send + Sync {
    /// Stream the asset into `sink`, reporting progress in [0, 1] and
    /// polling `cancelled` between chunks.
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(f32),
        cancelled: &dyn Fn() -> bool,
    ) -> Result<DownloadOutcome>;
}

/// HTTP transport backed by `ureq` with a per-fetch timeout independent of
/// the license check timeout.
pub struct HttpTransport {
    agent: ureq::Agent,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout_connect(timeout)
                .timeout_read(timeout)
                .build(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS))
    }
}

impl FilterTransport for HttpTransport {
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        progress: &mut dyn FnMut(f32),
        cancelled: &dyn Fn() -> bool,
    ) -> Result<DownloadOutcome> {
        let response = self
            .agent
            .get(url)
            .call()
            .map_err(|e| Error::with_cause(ErrorCode::NetworkError, format!("GET {}", url), e))?;

        let total: Option<u64> = response
            .header("Content-Length")
            .and_then(|v| v.parse().ok());
        let mut reader = response.into_reader();
        let mut buf = vec![0u8; DOWNLOAD_CHUNK_BYTES];
        let mut received: u64 = 0;

        loop {
            if cancelled() {
                return Ok(DownloadOutcome::Cancelled);
            }
            let n = reader.read(&mut buf).map_err(|e| {
                Error::with_cause(ErrorCode::NetworkError, "read interrupted", e)
            })?;
            if n == 0 {
                break;
            }
            sink.write_all(&buf[..n])
                .map_err(|e| Error::with_cause(ErrorCode::MemoryError, "cache write failed", e))?;
            received += n as u64;
            if let Some(total) = total.filter(|&t| t > 0) {
                progress((received as f32 / total as f32).min(1.0));
            }
        }
        progress(1.0);
        Ok(DownloadOutcome::Completed)
    }
}

// -------------------- Fetch handles --------------------

pub type ProgressFn = Box<dyn Fn(f32) + Send>;

struct HandleShared {
    cancelled: AtomicBool,
    result: Mutex<Option<FetchStatus>>,
    done: Condvar,
}

impl HandleShared {
    fn deliver(&self, status: FetchStatus) {
        let mut slot = self.result.lock().unwrap();
        // First delivery wins: a cancellation that already resolved this
        // handle is never overwritten by a late success.
        if slot.is_none() {
            *slot = Some(status);
            self.done.notify_all();
        }
    }
}

/// Caller-side handle for one fetch request. Cancellation affects only this
/// requester; a coalesced transfer keeps running for the others.
pub struct FetchHandle {
    shared: Arc<HandleShared>,
    inflight: Option<Arc<Inflight>>,
}

impl FetchHandle {
    fn resolved(status: FetchStatus) -> Self {
        Self {
            shared: Arc::new(HandleShared {
                cancelled: AtomicBool::new(false),
                result: Mutex::new(Some(status)),
                done: Condvar::new(),
            }),
            inflight: None,
        }
    }

    /// Block until the fetch reaches a terminal state.
    pub fn wait(&self) -> FetchStatus {
        let mut slot = self.shared.result.lock().unwrap();
        loop {
            if let Some(status) = slot.as_ref() {
                return status.clone();
            }
            slot = self.shared.done.wait(slot).unwrap();
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<FetchStatus> {
        let mut slot = self.shared.result.lock().unwrap();
        loop {
            if let Some(status) = slot.as_ref() {
                return Some(status.clone());
            }
            let (next, res) = self.shared.done.wait_timeout(slot, timeout).unwrap();
            slot = next;
            if res.timed_out() && slot.is_none() {
                return None;
            }
        }
    }

    /// Cancel this requester's interest. Resolves the handle to `Cancelled`
    /// immediately; the underlying transfer stops once no requester remains.
    pub fn cancel(&self) {
        if self.shared.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.deliver(FetchStatus::Cancelled);
        if let Some(inflight) = &self.inflight {
            inflight.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.shared.result.lock().unwrap().is_some()
    }
}

// -------------------- In-flight coalescing --------------------

struct Inflight {
    /// Requesters that have not cancelled. The transfer aborts at zero.
    active: AtomicUsize,
    waiters: Mutex<Vec<(Arc<HandleShared>, Option<ProgressFn>)>>,
}

impl Inflight {
    fn attach(&self, progress: Option<ProgressFn>) -> Arc<HandleShared> {
        let shared = Arc::new(HandleShared {
            cancelled: AtomicBool::new(false),
            result: Mutex::new(None),
            done: Condvar::new(),
        });
        self.active.fetch_add(1, Ordering::SeqCst);
        self.waiters.lock().unwrap().push((shared.clone(), progress));
        shared
    }

    fn report_progress(&self, fraction: f32) {
        let waiters = self.waiters.lock().unwrap();
        for (shared, progress) in waiters.iter() {
            if shared.cancelled.load(Ordering::SeqCst) {
                continue;
            }
            if let Some(progress) = progress {
                progress(fraction.clamp(0.0, 1.0));
            }
        }
    }

    fn resolve(&self, status: FetchStatus) {
        let waiters = std::mem::take(&mut *self.waiters.lock().unwrap());
        for (shared, _) in waiters {
            if shared.cancelled.load(Ordering::SeqCst) {
                shared.deliver(FetchStatus::Cancelled);
            } else {
                shared.deliver(status.clone());
            }
        }
    }
}

// -------------------- Manager --------------------

/// Asynchronous filter fetcher with a content-addressed cache.
pub struct CloudFilterManager {
    cache_root: Option<PathBuf>,
    tmp_root: PathBuf,
    transport: Arc<dyn FilterTransport>,
    inflight: Mutex<HashMap<String, Arc<Inflight>>>,
    transfers: AtomicU64,
}

impl CloudFilterManager {
    /// Probe the cache root for writability; fall back to no-cache mode if
    /// the probe fails.
    pub fn new(cache_path: Option<PathBuf>, transport: Arc<dyn FilterTransport>) -> Arc<Self> {
        let cache_root = cache_path.and_then(|root| match probe_writable(&root) {
            Ok(()) => Some(root),
            Err(e) => {
                log::warn!(
                    "cloud cache at {} unwritable ({}); degrading to no-cache mode",
                    root.display(),
                    e
                );
                None
            }
        });

        let tmp_root = match &cache_root {
            Some(root) => root.join("tmp"),
            None => std::env::temp_dir().join(format!("effects-kernel-{}", std::process::id())),
        };

        Arc::new(Self {
            cache_root,
            tmp_root,
            transport,
            inflight: Mutex::new(HashMap::new()),
            transfers: AtomicU64::new(0),
        })
    }

    pub fn is_cache_enabled(&self) -> bool {
        self.cache_root.is_some()
    }

    /// Path an asset would occupy in the cache, if caching is enabled.
    pub fn cache_entry_path(&self, checksum: &str) -> Option<PathBuf> {
        self.cache_root.as_ref().map(|root| root.join(checksum))
    }

    /// Total network transfers started. Cache hits and coalesced joins do
    /// not count.
    pub fn transfer_count(&self) -> u64 {
        self.transfers.load(Ordering::SeqCst)
    }

    /// Request an asset. Returns immediately with a handle; completion,
    /// progress and cancellation all flow through it.
    ///
    /// A verified cache hit resolves the handle before this returns and
    /// emits no progress events.
    pub fn fetch(self: &Arc<Self>, filter: &FilterRef, progress: Option<ProgressFn>) -> FetchHandle {
        if let Err(e) = validate_checksum(&filter.checksum) {
            return FetchHandle::resolved(FetchStatus::Failed(e));
        }

        // Cache hit validated by content identity, not filename.
        if let Some(entry) = self.cache_entry_path(&filter.checksum) {
            if entry.exists() {
                match file_checksum(&entry) {
                    Ok(actual) if actual == filter.checksum => {
                        log::debug!("cache hit for {} ({})", filter.id, filter.checksum);
                        return FetchHandle::resolved(FetchStatus::Completed(entry));
                    }
                    _ => {
                        // Corrupted entry: never surface it; evict and refetch.
                        log::warn!("evicting corrupted cache entry {}", entry.display());
                        let _ = fs::remove_file(&entry);
                    }
                }
            }
        }

        // Coalesce with an in-flight transfer for the same content.
        let mut inflight = self.inflight.lock().unwrap();
        if let Some(entry) = inflight.get(&filter.checksum) {
            let shared = entry.attach(progress);
            return FetchHandle {
                shared,
                inflight: Some(entry.clone()),
            };
        }

        let entry = Arc::new(Inflight {
            active: AtomicUsize::new(0),
            waiters: Mutex::new(Vec::new()),
        });
        let shared = entry.attach(progress);
        inflight.insert(filter.checksum.clone(), entry.clone());
        drop(inflight);

        let manager = self.clone();
        let filter = filter.clone();
        let entry_thread = entry.clone();
        std::thread::spawn(move || {
            let status = manager.run_transfer(&filter, &entry_thread);
            manager.inflight.lock().unwrap().remove(&filter.checksum);
            entry_thread.resolve(status);
        });

        FetchHandle {
            shared,
            inflight: Some(entry),
        }
    }

    /// One transfer with a single bounded retry for transient failures.
    fn run_transfer(&self, filter: &FilterRef, entry: &Arc<Inflight>) -> FetchStatus {
        let mut last_error = None;
        for attempt in 0..2 {
            if entry.active.load(Ordering::SeqCst) == 0 {
                return FetchStatus::Cancelled;
            }
            if attempt > 0 {
                log::info!("retrying fetch of {} after {:?}", filter.id, last_error);
            }
            match self.attempt_transfer(filter, entry) {
                Ok(Some(path)) => return FetchStatus::Completed(path),
                Ok(None) => return FetchStatus::Cancelled,
                Err(e) => last_error = Some(e),
            }
        }
        let error = last_error
            .unwrap_or_else(|| Error::new(ErrorCode::Unknown, "fetch failed without error"));
        log::warn!("fetch of {} failed: {}", filter.id, error);
        FetchStatus::Failed(error)
    }

    /// Returns Ok(Some(path)) on success, Ok(None) on cancellation.
    fn attempt_transfer(&self, filter: &FilterRef, entry: &Arc<Inflight>) -> Result<Option<PathBuf>> {
        self.transfers.fetch_add(1, Ordering::SeqCst);
        fs::create_dir_all(&self.tmp_root).map_err(|e| {
            Error::with_cause(ErrorCode::MemoryError, "temp dir unavailable", e)
        })?;
        let temp_path = self.tmp_root.join(temp_name(&filter.checksum));

        let result = self.stream_to(&temp_path, filter, entry);
        match result {
            Ok(DownloadOutcome::Cancelled) => {
                let _ = fs::remove_file(&temp_path);
                Ok(None)
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                Err(e)
            }
            Ok(DownloadOutcome::Completed) => {
                let actual = file_checksum(&temp_path)?;
                if actual != filter.checksum {
                    let _ = fs::remove_file(&temp_path);
                    return Err(Error::new(
                        ErrorCode::EffectLoadFailed,
                        format!(
                            "checksum mismatch for {}: expected {}, got {}",
                            filter.id, filter.checksum, actual
                        ),
                    ));
                }

                match self.cache_entry_path(&filter.checksum) {
                    Some(final_path) => {
                        // Atomic publish: the entry becomes visible only as
                        // a fully verified file.
                        fs::rename(&temp_path, &final_path).map_err(|e| {
                            Error::with_cause(ErrorCode::MemoryError, "cache publish failed", e)
                        })?;
                        Ok(Some(final_path))
                    }
                    // No-cache mode: hand back the verified temp file.
                    None => Ok(Some(temp_path)),
                }
            }
        }
    }

    fn stream_to(
        &self,
        temp_path: &Path,
        filter: &FilterRef,
        entry: &Arc<Inflight>,
    ) -> Result<DownloadOutcome> {
        let mut sink = File::create(temp_path).map_err(|e| {
            Error::with_cause(ErrorCode::MemoryError, "temp file create failed", e)
        })?;
        let entry_progress = entry.clone();
        let entry_cancel = entry.clone();
        let outcome = self.transport.download(
            &filter.url,
            &mut sink,
            &mut move |fraction| entry_progress.report_progress(fraction),
            &move || entry_cancel.active.load(Ordering::SeqCst) == 0,
        )?;
        sink.sync_all()
            .map_err(|e| Error::with_cause(ErrorCode::MemoryError, "temp file sync failed", e))?;
        Ok(outcome)
    }
}

// -------------------- Helpers --------------------

fn validate_checksum(checksum: &str) -> Result<()> {
    if checksum.len() != 64 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::invalid_parameter(format!(
            "checksum '{}' is not hex sha-256",
            checksum
        )));
    }
    Ok(())
}

pub fn content_checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        Error::with_cause(ErrorCode::ResourceNotFound, "cache entry unreadable", e)
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DOWNLOAD_CHUNK_BYTES];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::with_cause(ErrorCode::MemoryError, "cache read failed", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn temp_name(checksum: &str) -> String {
    let mut suffix = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut suffix);
    format!("{}.{}.part", checksum, hex::encode(suffix))
}

fn probe_writable(root: &Path) -> std::io::Result<()> {
    fs::create_dir_all(root)?;
    fs::create_dir_all(root.join("tmp"))?;
    let probe = root.join(".probe");
    fs::write(&probe, b"ok")?;
    fs::remove_file(&probe)?;
    Ok(())
}
