//! Disk-backed retention of rectified images.
//!
//! [`RetentionStore`] keeps at most `capacity` JPEG files in one directory.
//! Every save writes a new file and then evicts the oldest files (by
//! modification time) until the directory is back under capacity.
//!
//! ## Naming
//!
//! File names are `<prefix><YYYYmmdd_HHMMSS_ffffff>_<seq>.jpg`. The UTC
//! timestamp has microsecond resolution and never steps back at a DST change.
//! `seq` is a process-wide counter padded to ten digits, so two saves in the
//! same microsecond still get distinct names that sort in write order. The final
//! rename is no-clobber; if another process already took the name, the next
//! sequence number is tried.
//!
//! ## Writes and visibility
//!
//! Bytes go to a hidden temp file in the store directory which is then
//! renamed into place, so readers never see a half-written JPEG. On synced or
//! network filesystems a fresh file may not show up in a directory listing
//! right away; the store polls for it up to `visibility_timeout` and then
//! continues with a warning.
//!
//! ## Eviction
//!
//! Every `*.jpg` entry counts toward capacity. Ordering is modification time
//! ascending with the file name as tie-break. A pass started by a save only
//! considers files that sort strictly before the one it wrote, so concurrent
//! writers never delete each other's newer results. A failed delete is logged and left for
//! the next pass; it never fails the save that triggered it. Concurrent saves
//! may briefly leave up to `writers − 1` extra files, which the next save
//! removes.

use crate::config::PipelineConfig;
use crate::error::CardflatError;
use crate::pipeline::codec;
use image::RgbImage;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Extension of every artifact the store manages.
pub const EXTENSION: &str = "jpg";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A file written by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub file_name: String,
    pub created: SystemTime,
}

impl StoredArtifact {
    /// Public URL of the artifact under `prefix`, e.g. `/images/<file>`.
    pub fn url(&self, prefix: &str) -> String {
        format!("{}/{}", prefix.trim_end_matches('/'), self.file_name)
    }
}

/// Capacity-bounded directory of JPEG artifacts with oldest-first eviction.
#[derive(Debug, Clone)]
pub struct RetentionStore {
    dir: PathBuf,
    capacity: usize,
    quality: u8,
    prefix: String,
    visibility_timeout: Duration,
}

impl RetentionStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>, capacity: usize, quality: u8) -> Result<Self, CardflatError> {
        let dir = dir.into();
        if capacity == 0 {
            return Err(CardflatError::InvalidConfig(
                "Store capacity must be ≥ 1".into(),
            ));
        }
        std::fs::create_dir_all(&dir).map_err(|e| CardflatError::Storage {
            path: dir.clone(),
            source: e,
        })?;
        debug!("Opened retention store at {} (capacity {})", dir.display(), capacity);
        Ok(Self {
            dir,
            capacity,
            quality: quality.clamp(1, 100),
            prefix: "corrected_".to_string(),
            visibility_timeout: Duration::from_secs(2),
        })
    }

    /// Open a store using capacity, quality and timeout from `config`.
    pub fn from_config(dir: impl Into<PathBuf>, config: &PipelineConfig) -> Result<Self, CardflatError> {
        Ok(Self::open(dir, config.capacity, config.store_quality)?
            .with_visibility_timeout(Duration::from_millis(config.visibility_timeout_ms)))
    }

    /// File-name prefix for new artifacts. Default: `corrected_`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }

    /// JPEG-encode `image` at the store's quality and save it.
    pub async fn save(&self, image: &RgbImage) -> Result<StoredArtifact, CardflatError> {
        self.save_with_quality(image, self.quality).await
    }

    /// JPEG-encode `image` at `quality` and save it.
    pub async fn save_with_quality(
        &self,
        image: &RgbImage,
        quality: u8,
    ) -> Result<StoredArtifact, CardflatError> {
        let image = image.clone();
        let jpeg = tokio::task::spawn_blocking(move || codec::encode_jpeg(&image, quality))
            .await
            .map_err(|e| CardflatError::Internal(format!("Encode task panicked: {}", e)))??;
        self.save_bytes(jpeg).await
    }

    /// Save already-compressed JPEG bytes, then enforce capacity.
    pub async fn save_bytes(&self, jpeg: Vec<u8>) -> Result<StoredArtifact, CardflatError> {
        let dir = self.dir.clone();
        let prefix = self.prefix.clone();
        let len = jpeg.len();
        let path = tokio::task::spawn_blocking(move || write_unique(&dir, &prefix, &jpeg))
            .await
            .map_err(|e| CardflatError::Internal(format!("Write task panicked: {}", e)))??;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("Saved image: {} ({} bytes)", file_name, len);

        self.wait_visible(&path).await;
        let created = tokio::fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .unwrap_or_else(|_| SystemTime::now());
        self.evict(Some(&path)).await;

        Ok(StoredArtifact {
            path,
            file_name,
            created,
        })
    }

    /// Current artifacts, oldest first.
    pub async fn artifacts(&self) -> Result<Vec<StoredArtifact>, CardflatError> {
        let storage_err = |source| CardflatError::Storage {
            path: self.dir.clone(),
            source,
        };
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(storage_err)?;
        let mut artifacts = Vec::new();

        while let Some(entry) = entries.next_entry().await.map_err(storage_err)? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            // Entries can vanish between listing and stat when another
            // writer evicts them.
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            artifacts.push(StoredArtifact {
                file_name: entry.file_name().to_string_lossy().into_owned(),
                path,
                created: meta.modified().unwrap_or(UNIX_EPOCH),
            });
        }

        artifacts.sort_by(|a, b| {
            a.created
                .cmp(&b.created)
                .then_with(|| a.file_name.cmp(&b.file_name))
        });
        Ok(artifacts)
    }

    /// Run an eviction pass now. Returns the number of files removed.
    pub async fn cleanup(&self) -> usize {
        self.evict(None).await
    }

    async fn evict(&self, keep: Option<&Path>) -> usize {
        let artifacts = match self.artifacts().await {
            Ok(a) => a,
            Err(e) => {
                warn!("Skipping cleanup: {}", e);
                return 0;
            }
        };
        if artifacts.len() <= self.capacity {
            return 0;
        }

        let excess = artifacts.len() - self.capacity;
        // Only files older than the caller's own may go.
        let candidates = match keep {
            Some(own) => match artifacts.iter().position(|a| a.path == own) {
                Some(idx) => &artifacts[..idx],
                None => {
                    debug!("{} not listed yet; skipping cleanup", own.display());
                    return 0;
                }
            },
            None => &artifacts[..],
        };

        let mut removed = 0;
        for artifact in candidates.iter().take(excess) {
            match tokio::fs::remove_file(&artifact.path).await {
                Ok(()) => {
                    removed += 1;
                    info!("Deleted old image: {}", artifact.file_name);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!("{} already removed by another writer", artifact.file_name);
                }
                Err(e) => {
                    warn!(
                        "Failed to delete {}: {} (retrying on next save)",
                        artifact.file_name, e
                    );
                }
            }
        }
        removed
    }

    async fn wait_visible(&self, path: &Path) -> bool {
        let deadline = Instant::now() + self.visibility_timeout;
        loop {
            if tokio::fs::try_exists(path).await.unwrap_or(false) {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    "{} not visible after {:?}; continuing",
                    path.display(),
                    self.visibility_timeout
                );
                return false;
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}

/// Write `bytes` to a fresh, uniquely named file in `dir`.
fn write_unique(dir: &Path, prefix: &str, bytes: &[u8]) -> Result<PathBuf, CardflatError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| CardflatError::Storage {
            path: dir.to_path_buf(),
            source: e,
        })?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.flush())
        .map_err(|e| CardflatError::Storage {
            path: tmp.path().to_path_buf(),
            source: e,
        })?;

    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S_%6f").to_string();
    loop {
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let path = dir.join(format!("{prefix}{stamp}_{seq:010}.{EXTENSION}"));
        match tmp.persist_noclobber(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!("{} taken, trying next sequence number", path.display());
                tmp = e.file;
            }
            Err(e) => {
                return Err(CardflatError::Storage {
                    path,
                    source: e.error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::collections::HashSet;
    use std::fs::File;
    use tempfile::TempDir;

    fn fast_store(dir: &Path, capacity: usize) -> RetentionStore {
        RetentionStore::open(dir, capacity, 90)
            .unwrap()
            .with_visibility_timeout(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn save_writes_a_decodable_jpeg() {
        let tmp = TempDir::new().unwrap();
        let store = fast_store(tmp.path(), 5);
        let img = RgbImage::from_pixel(32, 16, Rgb([200, 10, 10]));

        let artifact = store.save(&img).await.unwrap();
        assert!(artifact.file_name.starts_with("corrected_"));
        assert!(artifact.file_name.ends_with(".jpg"));

        let back = image::open(&artifact.path).unwrap();
        assert_eq!((back.width(), back.height()), (32, 16));
    }

    #[tokio::test]
    async fn capacity_keeps_most_recent() {
        let tmp = TempDir::new().unwrap();
        let store = fast_store(tmp.path(), 3);
        let img = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));

        let mut names = Vec::new();
        for _ in 0..5 {
            names.push(store.save(&img).await.unwrap().file_name);
        }

        let kept: Vec<String> = store
            .artifacts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.file_name)
            .collect();
        assert_eq!(kept, names[2..].to_vec());
    }

    #[tokio::test]
    async fn eviction_follows_modification_time() {
        let tmp = TempDir::new().unwrap();
        let store = fast_store(tmp.path(), 2);
        let base = SystemTime::now() - Duration::from_secs(3600);

        // Names sort opposite to age so only mtime can explain the result.
        for (name, age_secs) in [("a.jpg", 10u64), ("b.jpg", 30), ("c.jpg", 20)] {
            let f = File::create(tmp.path().join(name)).unwrap();
            f.set_modified(base - Duration::from_secs(age_secs)).unwrap();
        }

        assert_eq!(store.cleanup().await, 1);
        let kept: Vec<String> = store
            .artifacts()
            .await
            .unwrap()
            .into_iter()
            .map(|a| a.file_name)
            .collect();
        assert_eq!(kept, vec!["c.jpg", "a.jpg"]);
    }

    #[tokio::test]
    async fn other_files_are_ignored() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("notes.txt"), b"keep me").unwrap();
        std::fs::write(tmp.path().join("frame.png"), b"keep me").unwrap();
        let store = fast_store(tmp.path(), 1);

        store.save_bytes(vec![0xFF, 0xD8, 0xFF]).await.unwrap();
        store.save_bytes(vec![0xFF, 0xD8, 0xFF]).await.unwrap();

        assert_eq!(store.artifacts().await.unwrap().len(), 1);
        assert!(tmp.path().join("notes.txt").exists());
        assert!(tmp.path().join("frame.png").exists());
    }

    #[tokio::test]
    async fn rapid_saves_never_collide() {
        let tmp = TempDir::new().unwrap();
        let store = fast_store(tmp.path(), 100);
        let mut names = HashSet::new();
        for _ in 0..40 {
            let a = store.save_bytes(vec![1, 2, 3]).await.unwrap();
            assert!(names.insert(a.file_name));
        }
        assert_eq!(store.artifacts().await.unwrap().len(), 40);
    }

    #[tokio::test]
    async fn write_failure_is_storage_error() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("gone");
        let store = fast_store(&dir, 3);
        std::fs::remove_dir_all(&dir).unwrap();

        let err = store.save_bytes(vec![1]).await.unwrap_err();
        assert!(matches!(err, CardflatError::Storage { .. }), "got: {err:?}");
    }

    #[tokio::test]
    async fn failed_delete_does_not_fail_save() {
        let tmp = TempDir::new().unwrap();
        // A directory can't be removed with remove_file.
        std::fs::create_dir(tmp.path().join("stuck.jpg")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let store = fast_store(tmp.path(), 1);

        let artifact = store.save_bytes(vec![0xFF, 0xD8]).await.unwrap();
        assert!(artifact.path.exists());
        assert!(tmp.path().join("stuck.jpg").exists());
    }

    #[tokio::test]
    async fn concurrent_saves_settle_at_capacity() {
        let tmp = TempDir::new().unwrap();
        let store = fast_store(tmp.path(), 4);
        let handles: Vec<_> = (0..12)
            .map(|_| {
                let s = store.clone();
                tokio::spawn(async move { s.save_bytes(vec![7; 64]).await })
            })
            .collect();
        for h in handles {
            let artifact = h.await.unwrap().unwrap();
            assert!(!artifact.file_name.is_empty());
        }
        store.cleanup().await;
        assert_eq!(store.artifacts().await.unwrap().len(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn racing_writers_never_empty_the_store() {
        for _ in 0..50 {
            let tmp = TempDir::new().unwrap();
            let store = fast_store(tmp.path(), 1);
            let (a, b) = (store.clone(), store.clone());
            let first = tokio::spawn(async move { a.save_bytes(vec![1; 32]).await });
            let second = tokio::spawn(async move { b.save_bytes(vec![2; 32]).await });
            first.await.unwrap().unwrap();
            second.await.unwrap().unwrap();

            let kept = store.artifacts().await.unwrap();
            assert!(
                (1..=2).contains(&kept.len()),
                "store holds {} files",
                kept.len()
            );
            store.cleanup().await;
            assert_eq!(store.artifacts().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn eviction_never_touches_newer_files() {
        let tmp = TempDir::new().unwrap();
        let store = fast_store(tmp.path(), 1);
        let own = store.save_bytes(vec![1]).await.unwrap();

        // Pretend another writer landed a newer file before our pass ran.
        let newer = tmp.path().join("corrected_99991231_235959_999999_9999999999.jpg");
        std::fs::write(&newer, b"newer").unwrap();
        File::options()
            .write(true)
            .open(&newer)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(60))
            .unwrap();

        assert_eq!(store.evict(Some(&own.path)).await, 0);
        assert!(newer.exists());
        assert!(own.path.exists());
    }

    #[tokio::test]
    async fn artifact_time_matches_listing() {
        let tmp = TempDir::new().unwrap();
        let store = fast_store(tmp.path(), 3);
        let saved = store.save_bytes(vec![0xFF, 0xD8]).await.unwrap();
        let listed = store.artifacts().await.unwrap();
        assert_eq!(listed, vec![saved]);
    }

    #[tokio::test]
    async fn names_carry_utc_stamp_and_wide_sequence() {
        let tmp = TempDir::new().unwrap();
        let store = fast_store(tmp.path(), 3);
        let before = chrono::Utc::now().format("%Y%m%d").to_string();
        let name = store.save_bytes(vec![1]).await.unwrap().file_name;
        let after = chrono::Utc::now().format("%Y%m%d").to_string();

        let stem = name
            .strip_prefix("corrected_")
            .and_then(|n| n.strip_suffix(".jpg"))
            .unwrap();
        let parts: Vec<&str> = stem.split('_').collect();
        assert_eq!(parts.len(), 4, "{name}");
        assert!(parts[0] == before || parts[0] == after, "{name}");
        assert_eq!(parts[3].len(), 10, "{name}");
        assert!(parts[3].bytes().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn zero_capacity_rejected() {
        let tmp = TempDir::new().unwrap();
        assert!(RetentionStore::open(tmp.path(), 0, 90).is_err());
    }

    #[test]
    fn url_joins_prefix() {
        let a = StoredArtifact {
            path: PathBuf::from("/srv/images/x.jpg"),
            file_name: "x.jpg".into(),
            created: UNIX_EPOCH,
        };
        assert_eq!(a.url("/images/"), "/images/x.jpg");
        assert_eq!(a.url("/images"), "/images/x.jpg");
    }
}
