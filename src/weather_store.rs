use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::blob_client::BlobClient;
use crate::errors::{CoreError, Result};
use crate::npz;

const MAX_CACHED_ARRAYS: usize = 25;
const ELEVATION_FILE_NAME: &str = "worldelev.npy";
const ELEVATION_EXPECTED_BYTES: u64 = 451_008_128;
const LOCK_WAIT_POLL: Duration = Duration::from_secs(1);
const LOCK_WAIT_MAX: Duration = Duration::from_secs(5 * 60);

/// On-disk cache of weather arrays and the elevation grid, shared across
/// worker processes via advisory file locks and coordinated in-process via
/// an in-progress map so sibling tasks on this worker don't duplicate a
/// download that's already running.
pub struct WeatherArrayStore {
    cache_dir: PathBuf,
    blob: BlobClient,
    in_progress: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
    extracting: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl WeatherArrayStore {
    pub fn new(cache_dir: PathBuf, blob: BlobClient) -> Self {
        Self {
            cache_dir,
            blob,
            in_progress: Arc::new(Mutex::new(HashMap::new())),
            extracting: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    /// Guarantee `name` exists locally (downloading if necessary) and, for
    /// `.npz` archives, that the decompressed `.data.npy` sibling exists.
    /// Returns the path callers should actually open for reading: the
    /// sibling for archives, the file itself otherwise.
    pub async fn ensure_cached(&self, name: &str) -> Result<PathBuf> {
        let path = self.path_for(name);
        self.ensure_raw_cached(name, &path).await?;

        if name.ends_with(".npz") {
            let sibling = self.sibling_data_path(&path);
            self.ensure_extracted(&path, &sibling).await?;
            touch(&sibling);
            return Ok(sibling);
        }
        Ok(path)
    }

    fn sibling_data_path(&self, npz_path: &Path) -> PathBuf {
        let mut s = npz_path.as_os_str().to_owned();
        s.push(".data.npy");
        PathBuf::from(s)
    }

    async fn ensure_raw_cached(&self, name: &str, path: &Path) -> Result<()> {
        // Fast path.
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.len() > 0 {
                if name == ELEVATION_FILE_NAME && meta.len() != ELEVATION_EXPECTED_BYTES {
                    warn!(name, expected = ELEVATION_EXPECTED_BYTES, actual = meta.len(), "elevation grid size mismatch, re-downloading");
                    let _ = tokio::fs::remove_file(path).await;
                } else {
                    touch(path);
                    return Ok(());
                }
            }
        }

        // In-process dedup: only one task on this worker performs the
        // cross-process-locked download; siblings wait on a Notify.
        let (lead, notify) = {
            let mut map = self.in_progress.lock().await;
            if let Some(existing) = map.get(name) {
                (false, existing.clone())
            } else {
                let notify = Arc::new(Notify::new());
                map.insert(name.to_string(), notify.clone());
                (true, notify)
            }
        };

        if !lead {
            notify.notified().await;
            if tokio::fs::metadata(path).await.map(|m| m.len() > 0).unwrap_or(false) {
                return Ok(());
            }
            return Err(CoreError::other(format!(
                "{name} download completed on a sibling task but file is missing"
            )));
        }

        let result = self.download_locked(name, path).await;
        notify.notify_waiters();
        self.in_progress.lock().await.remove(name);
        result
    }

    /// Cross-process coordination: acquire an exclusive flock on a sentinel
    /// file named after the target. If another process holds it, poll for up
    /// to 5 minutes for the file to appear before falling back to a blocking
    /// acquire and downloading ourselves.
    async fn download_locked(&self, name: &str, path: &Path) -> Result<()> {
        let lock_path = self.path_for(&format!(".{name}.lock"));
        tokio::fs::create_dir_all(&self.cache_dir).await?;

        let cache_dir = self.cache_dir.clone();
        let lock_path_clone = lock_path.clone();
        let path_clone = path.to_path_buf();
        let waited = tokio::task::spawn_blocking(move || -> io::Result<bool> {
            acquire_or_wait(&lock_path_clone, &path_clone, LOCK_WAIT_MAX, LOCK_WAIT_POLL)
        })
        .await
        .map_err(|e| CoreError::other(format!("lock task panicked: {e}")))??;

        if waited {
            // Someone else finished the download while we waited.
            if tokio::fs::metadata(path).await.map(|m| m.len() > 0).unwrap_or(false) {
                return Ok(());
            }
        }

        // We now (logically) hold the lock via the blocking task below;
        // re-check existence once more before downloading.
        if tokio::fs::metadata(path).await.map(|m| m.len() > 0).unwrap_or(false) {
            release_lock(&lock_path);
            return Ok(());
        }

        self.evict_if_over_capacity().await;

        let tmp_path = path.with_extension(format!(
            "{}.tmp",
            path.extension().and_then(|e| e.to_str()).unwrap_or("tmp")
        ));
        let is_large = name == ELEVATION_FILE_NAME || name.ends_with(".npz") || name.ends_with(".npy");
        let is_npz = name.ends_with(".npz");

        let download_result = self.blob.download_to(name, &tmp_path, is_large, is_npz).await;
        let result = match download_result {
            Ok(_) => {
                if is_npz {
                    if let Err(e) = npz::validate(&tmp_path) {
                        let _ = std::fs::remove_file(&tmp_path);
                        Err(e)
                    } else {
                        finalize_download(&tmp_path, path, name)
                    }
                } else {
                    finalize_download(&tmp_path, path, name)
                }
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        };

        release_lock(&lock_path);
        let _ = cache_dir; // kept for symmetry with blocking closure capture
        result
    }

    async fn evict_if_over_capacity(&self) {
        let dir = self.cache_dir.clone();
        let _ = tokio::task::spawn_blocking(move || evict_lru(&dir)).await;
    }

    /// One-time decompression of the `data` member of an `.npz` archive into
    /// an uncompressed, memory-mappable `.data.npy` sibling. In-process
    /// deduplicated via `extracting`; idempotent across processes since the
    /// write is atomic-rename.
    async fn ensure_extracted(&self, npz_path: &Path, sibling: &Path) -> Result<()> {
        if tokio::fs::metadata(sibling).await.map(|m| m.len() > 0).unwrap_or(false) {
            return Ok(());
        }

        let key = sibling.to_string_lossy().to_string();
        let (lead, notify) = {
            let mut map = self.extracting.lock().await;
            if let Some(existing) = map.get(&key) {
                (false, existing.clone())
            } else {
                let notify = Arc::new(Notify::new());
                map.insert(key.clone(), notify.clone());
                (true, notify)
            }
        };

        if !lead {
            notify.notified().await;
            return Ok(());
        }

        let result = self.extract_once(npz_path, sibling).await;
        notify.notify_waiters();
        self.extracting.lock().await.remove(&key);
        result
    }

    async fn extract_once(&self, npz_path: &Path, sibling: &Path) -> Result<()> {
        if tokio::fs::metadata(sibling).await.map(|m| m.len() > 0).unwrap_or(false) {
            return Ok(());
        }
        info!(?npz_path, "extracting weather archive to memory-mappable sibling");
        let npz_path = npz_path.to_path_buf();
        let data = tokio::task::spawn_blocking(move || npz::extract_data_npy(&npz_path))
            .await
            .map_err(|e| CoreError::other(format!("extraction task panicked: {e}")))??;

        let tmp = sibling.with_extension("npy.tmp");
        tokio::fs::write(&tmp, &data).await?;
        let f = tokio::fs::File::open(&tmp).await?;
        f.sync_all().await?;
        drop(f);
        tokio::fs::rename(&tmp, sibling).await?;
        Ok(())
    }

    /// Delete all files for a retired cycle, then re-run the LRU sweep to
    /// catch anything left over the limit.
    pub async fn purge_cycle(&self, old_cycle: &str) -> Result<()> {
        let old_cycle = old_cycle.trim().to_string();
        if old_cycle.is_empty() {
            return Ok(());
        }
        let dir = self.cache_dir.clone();
        tokio::task::spawn_blocking(move || purge_cycle_files(&dir, &old_cycle)).await
            .map_err(|e| CoreError::other(format!("purge task panicked: {e}")))?;
        self.evict_if_over_capacity().await;
        Ok(())
    }
}

/// Bump a file's mtime so the LRU sweep sees it as recently used. `noatime`
/// mounts are common enough that we can't rely on read-triggered atime
/// updates, so eviction orders by mtime and callers touch on every access.
fn touch(path: &Path) {
    let now = std::time::SystemTime::now();
    let _ = filetime_touch(path, now);
}

fn filetime_touch(path: &Path, now: std::time::SystemTime) -> io::Result<()> {
    let f = OpenOptions::new().append(true).open(path)?;
    f.set_modified(now)
}

fn finalize_download(tmp_path: &Path, final_path: &Path, name: &str) -> Result<()> {
    let size = std::fs::metadata(tmp_path)?.len();
    if size == 0 {
        return Err(CoreError::other(format!("downloaded {name} is empty")));
    }
    if name == ELEVATION_FILE_NAME && size != ELEVATION_EXPECTED_BYTES {
        let _ = std::fs::remove_file(tmp_path);
        return Err(CoreError::CorruptedArchive(format!(
            "{name} expected {ELEVATION_EXPECTED_BYTES} bytes, got {size}"
        )));
    }
    std::fs::rename(tmp_path, final_path)?;
    Ok(())
}

/// Acquire an exclusive, non-blocking flock on `lock_path`. If another
/// process holds it, poll for the target file's appearance for up to
/// `max_wait`; if it never appears, fall back to a blocking acquire so this
/// process becomes the downloader. Returns `true` if we waited for another
/// process (caller should re-check file existence before downloading).
///
/// The lock is intentionally leaked to the caller (released via
/// `release_lock`) rather than tied to a guard, since it must outlive the
/// spawn_blocking call that acquired it.
fn acquire_or_wait(lock_path: &Path, target: &Path, max_wait: Duration, poll: Duration) -> io::Result<bool> {
    let lock_file = OpenOptions::new().create(true).append(true).open(lock_path)?;
    let fd = lock_file.as_raw_fd();

    let rc = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        std::mem::forget(lock_file);
        return Ok(false);
    }

    debug!(?lock_path, "lock held by another process, waiting for download to complete");
    let start = std::time::Instant::now();
    while start.elapsed() < max_wait {
        std::thread::sleep(poll);
        if target.exists() && std::fs::metadata(target).map(|m| m.len() > 0).unwrap_or(false) {
            return Ok(true);
        }
    }

    warn!(?lock_path, "timed out waiting for peer download, acquiring lock ourselves");
    let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    std::mem::forget(lock_file);
    Ok(target.exists() && std::fs::metadata(target).map(|m| m.len() > 0).unwrap_or(false))
}

fn release_lock(lock_path: &Path) {
    if let Ok(f) = OpenOptions::new().write(true).open(lock_path) {
        unsafe {
            libc::flock(f.as_raw_fd(), libc::LOCK_UN);
        }
    }
    let _ = std::fs::remove_file(lock_path);
}

fn evict_lru(dir: &Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    let mut cached: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(n) => n,
            None => continue,
        };
        if name == ELEVATION_FILE_NAME || name.starts_with('.') {
            continue;
        }
        if !(name.ends_with(".npz") || name.ends_with(".npz.data.npy")) {
            continue;
        }
        if let Ok(meta) = entry.metadata() {
            if let Ok(modified) = meta.modified() {
                cached.push((path, modified));
            }
        }
    }

    if cached.len() < MAX_CACHED_ARRAYS {
        return;
    }
    cached.sort_by_key(|(_, t)| *t);
    let remove_count = cached.len() - MAX_CACHED_ARRAYS + 1;
    for (path, _) in cached.into_iter().take(remove_count) {
        let _ = std::fs::remove_file(&path);
    }
}

fn purge_cycle_files(dir: &Path, old_cycle: &str) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };
    let prefix = format!("{old_cycle}_");
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if name.starts_with(&prefix) && (name.ends_with(".npz") || name.ends_with(".npz.data.npy")) {
                if std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
    }
    if removed > 0 {
        info!(old_cycle, removed, "purged retired cycle files from disk cache");
    }
}
