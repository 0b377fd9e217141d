//! Byte-quota cache over the object store and recency index.
//!
//! Tracks used bytes, evicts oldest-first when a publication would exceed the
//! quota, and reconstructs the in-memory index from on-disk state (ordered by
//! file access time) at startup.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use filetime::FileTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use super::recency::{Entry, RecencyIndex, Visit};
use super::store::{CachedObject, ObjectStore, TempObject, TMP_SUBDIR};

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Size-bounded content cache keyed by registry-relative path.
pub struct Cache {
    store: ObjectStore,
    index: RecencyIndex,
    used_bytes: AtomicU64,
    max_bytes: u64,
}

impl Cache {
    /// Open the cache at `root` with a byte quota of `max_bytes`.
    ///
    /// Walks the root, removes leftover staged files under `-/tmp/`, and
    /// seeds the recency index with every published object in ascending
    /// access-time order, so the tail ends up coldest.
    pub fn open(root: &Path, max_bytes: u64) -> Result<Self> {
        let store = ObjectStore::open(root)?;
        let index = RecencyIndex::new();

        let walk_start = Instant::now();
        let mut seeded: Vec<(String, u64, FileTime)> = Vec::new();
        let mut used: u64 = 0;
        let mut stale_temps: usize = 0;
        for entry in WalkDir::new(root) {
            let entry = entry.context("walk cache dir")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(root)
                .context("walk produced a path outside the cache root")?;
            if rel.starts_with(TMP_SUBDIR) {
                if let Err(e) = std::fs::remove_file(entry.path()) {
                    warn!(path = %entry.path().display(), error = %e, "failed to remove stale staged file");
                } else {
                    stale_temps += 1;
                }
                continue;
            }
            let meta = entry
                .metadata()
                .with_context(|| format!("stat {}", entry.path().display()))?;
            used += meta.len();
            seeded.push((
                rel.to_string_lossy().into_owned(),
                meta.len(),
                FileTime::from_last_access_time(&meta),
            ));
        }
        let walk_elapsed = walk_start.elapsed();

        let sort_start = Instant::now();
        seeded.sort_by_key(|(_, _, atime)| *atime);
        let sort_elapsed = sort_start.elapsed();

        // On noatime mounts every access time reads the same and the seeded
        // ordering is arbitrary; the LRU re-converges after a few writes.
        if seeded.len() > 1 && seeded.iter().all(|(_, _, atime)| *atime == seeded[0].2) {
            warn!("all cached objects share one access time; initial recency ordering is arbitrary (noatime mount?)");
        }

        let insert_start = Instant::now();
        for (path, size, _) in &seeded {
            index.insert_or_replace(Entry {
                path: path.clone(),
                size: *size,
            });
        }
        let insert_elapsed = insert_start.elapsed();

        let fill = if max_bytes > 0 {
            used as f64 / max_bytes as f64 * 100.0
        } else {
            0.0
        };
        info!(
            objects = seeded.len(),
            used_bytes = used,
            max_bytes,
            fill = format!("{fill:.1}%"),
            stale_temps_removed = stale_temps,
            walk_ms = walk_elapsed.as_millis() as u64,
            sort_ms = sort_elapsed.as_millis() as u64,
            insert_ms = insert_elapsed.as_millis() as u64,
            "cache opened"
        );

        Ok(Self {
            store,
            index,
            used_bytes: AtomicU64::new(used),
            max_bytes,
        })
    }

    /// Look up a cached object. A hit promotes the entry to the head of the
    /// recency index; nothing is ever inserted here.
    pub fn get(&self, path: &str) -> Result<Option<CachedObject>> {
        let cached = self.store.get(path)?;
        if cached.is_some() {
            self.index.touch(path);
        }
        Ok(cached)
    }

    /// Stage a new object for writing.
    pub fn create(&self, media_type: &str, etag: &str) -> Result<TempObject> {
        self.store.open_temp(media_type, etag)
    }

    /// Publish a staged object at `path`, evicting old objects to make room
    /// and reconciling the byte accounting for a replaced entry.
    pub fn publish(&self, tmp: TempObject, path: &str, size: u64) -> Result<()> {
        self.evict(size)?;
        self.store.publish(tmp, path)?;

        let (old, _replaced) = self.index.insert_or_replace(Entry {
            path: path.to_string(),
            size,
        });
        if let Some(old) = old {
            self.used_bytes.fetch_sub(old.size, Ordering::Relaxed);
        }
        self.used_bytes.fetch_add(size, Ordering::Relaxed);
        debug!(path, size, used_bytes = self.used_bytes(), "published cache object");
        Ok(())
    }

    /// Rewrite the last-validated timestamp of a cached object.
    pub fn touch_validated(&self, path: &str) -> Result<()> {
        self.store.touch_validated(path)
    }

    /// Absolute on-disk path of a cache key, for file serving.
    pub fn object_path(&self, path: &str) -> PathBuf {
        self.store.object_path(path)
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn object_count(&self) -> usize {
        self.index.len()
    }

    /// Remove oldest objects until `requested` more bytes fit in the quota.
    ///
    /// Usage is re-checked per entry, so concurrent evictions stay
    /// idempotent: a file another request already removed is tolerated and
    /// only actually-freed bytes are subtracted from the counter. An object
    /// larger than the whole quota empties the cache and is then admitted
    /// anyway (single-object overshoot).
    fn evict(&self, requested: u64) -> Result<()> {
        if self.used_bytes().saturating_add(requested) <= self.max_bytes {
            return Ok(());
        }

        let mut evicted_objects: u64 = 0;
        let mut evicted_bytes: u64 = 0;
        self.index.range(|entry| {
            if self.used_bytes().saturating_add(requested) <= self.max_bytes {
                return Ok(Visit::Stop);
            }
            if self.store.remove(&entry.path)? {
                self.used_bytes.fetch_sub(entry.size, Ordering::Relaxed);
                evicted_bytes += entry.size;
            }
            evicted_objects += 1;
            Ok(Visit::Evict)
        })?;

        if evicted_objects > 0 {
            info!(
                evicted_objects,
                evicted_bytes,
                requested,
                used_bytes = self.used_bytes(),
                "evicted cache objects"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn publish_bytes(cache: &Cache, path: &str, bytes: &[u8]) {
        let mut tmp = cache.create("application/octet-stream", "\"test\"").unwrap();
        tmp.file_mut().write_all(bytes).await.unwrap();
        tmp.file_mut().flush().await.unwrap();
        cache.publish(tmp, path, bytes.len() as u64).unwrap();
    }

    #[test]
    fn open_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 1000).unwrap();
        assert_eq!(cache.used_bytes(), 0);
        assert_eq!(cache.object_count(), 0);
    }

    #[test]
    fn open_removes_stale_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join(TMP_SUBDIR);
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("1234567890abcdef"), b"partial upload").unwrap();

        let cache = Cache::open(dir.path(), 1000).unwrap();
        assert_eq!(cache.used_bytes(), 0);
        assert_eq!(cache.object_count(), 0);
        assert!(!staging.join("1234567890abcdef").exists());
    }

    #[tokio::test]
    async fn open_seeds_recency_from_atime() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = Cache::open(dir.path(), 1000).unwrap();
            publish_bytes(&cache, "reg/a", &[0u8; 100]).await;
            publish_bytes(&cache, "reg/b", &[0u8; 100]).await;
            publish_bytes(&cache, "reg/c", &[0u8; 100]).await;
        }

        // b is coldest, then a, then c.
        let base = 1_700_000_000;
        for (path, offset) in [("reg/a", 10), ("reg/b", 0), ("reg/c", 20)] {
            let full = dir.path().join(path);
            filetime::set_file_atime(&full, FileTime::from_unix_time(base + offset, 0)).unwrap();
        }

        let cache = Cache::open(dir.path(), 250).unwrap();
        assert_eq!(cache.used_bytes(), 300);
        assert_eq!(cache.object_count(), 3);

        // Publishing 100 more bytes must free down to 150: b then a go.
        publish_bytes(&cache, "reg/d", &[0u8; 100]).await;
        assert!(!dir.path().join("reg/b").exists());
        assert!(!dir.path().join("reg/a").exists());
        assert!(dir.path().join("reg/c").exists());
        assert!(dir.path().join("reg/d").exists());
        assert_eq!(cache.used_bytes(), 200);
    }

    #[tokio::test]
    async fn get_promotes_entry_so_eviction_skips_it() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 1000).unwrap();

        publish_bytes(&cache, "reg/a", &[0u8; 400]).await;
        publish_bytes(&cache, "reg/b", &[0u8; 400]).await;
        assert!(cache.get("reg/a").unwrap().is_some());

        publish_bytes(&cache, "reg/c", &[0u8; 400]).await;

        assert!(dir.path().join("reg/a").exists());
        assert!(!dir.path().join("reg/b").exists());
        assert!(dir.path().join("reg/c").exists());
        assert_eq!(cache.used_bytes(), 800);
    }

    #[tokio::test]
    async fn oversize_object_empties_cache_and_is_admitted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 500).unwrap();

        publish_bytes(&cache, "reg/a", &[0u8; 200]).await;
        publish_bytes(&cache, "reg/b", &[0u8; 200]).await;
        publish_bytes(&cache, "reg/big", &[0u8; 800]).await;

        assert!(!dir.path().join("reg/a").exists());
        assert!(!dir.path().join("reg/b").exists());
        assert!(dir.path().join("reg/big").exists());
        assert_eq!(cache.used_bytes(), 800);
        assert_eq!(cache.object_count(), 1);
    }

    #[tokio::test]
    async fn eviction_tolerates_files_removed_behind_its_back() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 500).unwrap();

        publish_bytes(&cache, "reg/a", &[0u8; 200]).await;
        publish_bytes(&cache, "reg/b", &[0u8; 200]).await;
        std::fs::remove_file(dir.path().join("reg/a")).unwrap();

        // Forces an eviction pass over the now-missing a.
        publish_bytes(&cache, "reg/c", &[0u8; 400]).await;
        assert!(dir.path().join("reg/c").exists());
    }

    #[tokio::test]
    async fn republishing_a_key_reconciles_used_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 1000).unwrap();

        publish_bytes(&cache, "reg/obj", &[0u8; 300]).await;
        assert_eq!(cache.used_bytes(), 300);

        publish_bytes(&cache, "reg/obj", &[0u8; 120]).await;
        assert_eq!(cache.used_bytes(), 120);
        assert_eq!(cache.object_count(), 1);
        assert_eq!(
            std::fs::read(cache.object_path("reg/obj")).unwrap().len(),
            120
        );
    }

    #[tokio::test]
    async fn get_after_eviction_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path(), 300).unwrap();

        publish_bytes(&cache, "reg/a", &[0u8; 200]).await;
        publish_bytes(&cache, "reg/b", &[0u8; 200]).await;

        assert!(cache.get("reg/a").unwrap().is_none());
        assert!(cache.get("reg/b").unwrap().is_some());
    }
}
