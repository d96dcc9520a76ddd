//! Content-addressed artifact cache.
//!
//! Objects live at `<root>/objects/<sha256>` and are only ever created by
//! renaming a fully written and verified temp file, so a path handed out by
//! the cache always holds bytes matching its name. `index.json` tracks sizes
//! and when each object was last referenced by a playlist.

use chrono::{DateTime, Utc};
use futures::Stream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use super::error::{AgentError, AgentResult};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub size: u64,
    pub last_referenced: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheIndex {
    entries: BTreeMap<String, CacheEntry>,
}

impl CacheIndex {
    fn used(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadProgress {
    pub sha256: String,
    pub received: u64,
    pub total: u64,
}

pub struct ContentCache {
    root: PathBuf,
    max_bytes: u64,
    index: Mutex<CacheIndex>,
    /// Held while an object is being written or removed.
    entry_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    pinned: StdMutex<HashSet<String>>,
    /// Bytes promised to in-flight downloads.
    reserved: AtomicU64,
}

/// Space held for one download; released on drop, including when the
/// download task is aborted.
struct Reservation<'a> {
    reserved: &'a AtomicU64,
    bytes: u64,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.reserved.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

/// Holds an object's lock; the lock itself is forgotten once nobody else
/// holds or waits on it.
struct EntryGuard<'a> {
    cache: &'a ContentCache,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.cache.prune_entry_locks();
    }
}

/// A temp file being written. Deleted on drop unless it was published,
/// which covers failed verification and aborted downloads alike.
struct PartFile {
    path: PathBuf,
    published: bool,
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!("Discarded {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::debug!("Could not remove {}: {}", self.path.display(), e),
        }
    }
}

impl ContentCache {
    /// Opens (or creates) a cache under `root`, dropping leftovers from an
    /// interrupted run: temp files, index entries without an object, and
    /// objects the index doesn't know about.
    pub async fn open(root: impl Into<PathBuf>, max_bytes: u64) -> AgentResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join("objects")).await?;
        let tmp = root.join("tmp");
        if tokio::fs::try_exists(&tmp).await? {
            tokio::fs::remove_dir_all(&tmp).await?;
        }
        tokio::fs::create_dir_all(&tmp).await?;

        let mut index = match tokio::fs::read(root.join(INDEX_FILE)).await {
            Ok(raw) => serde_json::from_slice::<CacheIndex>(&raw).unwrap_or_else(|e| {
                tracing::warn!("Cache index unreadable, starting empty: {}", e);
                CacheIndex::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheIndex::default(),
            Err(e) => return Err(e.into()),
        };

        let mut on_disk = HashSet::new();
        let mut dir = tokio::fs::read_dir(root.join("objects")).await?;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if index.entries.contains_key(&name) {
                on_disk.insert(name);
            } else {
                tracing::debug!("Removing untracked cache object {}", name);
                tokio::fs::remove_file(entry.path()).await?;
            }
        }
        index.entries.retain(|sha, _| on_disk.contains(sha));

        let cache = ContentCache {
            root,
            max_bytes,
            index: Mutex::new(index),
            entry_locks: StdMutex::new(HashMap::new()),
            pinned: StdMutex::new(HashSet::new()),
            reserved: AtomicU64::new(0),
        };
        {
            let index = cache.index.lock().await;
            cache.persist(&index).await?;
            tracing::info!(
                "Content cache at {}: {} objects, {} bytes of {}",
                cache.root.display(),
                index.entries.len(),
                index.used(),
                max_bytes
            );
        }
        Ok(cache)
    }

    pub fn object_path(&self, sha256: &str) -> PathBuf {
        self.root.join("objects").join(sha256)
    }

    /// Path of a verified object, if present.
    pub async fn get(&self, sha256: &str) -> Option<PathBuf> {
        let index = self.index.lock().await;
        index
            .entries
            .contains_key(sha256)
            .then(|| self.object_path(sha256))
    }

    pub async fn contains(&self, sha256: &str) -> bool {
        self.index.lock().await.entries.contains_key(sha256)
    }

    pub async fn used_bytes(&self) -> u64 {
        self.index.lock().await.used()
    }

    pub async fn len(&self) -> usize {
        self.index.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn entry(&self, sha256: &str) -> Option<CacheEntry> {
        self.index.lock().await.entries.get(sha256).cloned()
    }

    /// Replaces the set of objects the active playlist needs. Pinned objects
    /// are never evicted.
    pub fn set_pinned(&self, pinned: HashSet<String>) {
        if let Ok(mut guard) = self.pinned.lock() {
            *guard = pinned;
        }
    }

    fn is_pinned(&self, sha256: &str) -> bool {
        self.pinned
            .lock()
            .map(|p| p.contains(sha256))
            .unwrap_or(true)
    }

    /// Marks objects as referenced by the current playlist.
    pub async fn touch<'a>(
        &self,
        hashes: impl IntoIterator<Item = &'a str>,
        now: DateTime<Utc>,
    ) -> AgentResult<()> {
        let mut index = self.index.lock().await;
        let mut changed = false;
        for sha in hashes {
            if let Some(entry) = index.entries.get_mut(sha) {
                entry.last_referenced = now;
                changed = true;
            }
        }
        if changed {
            self.persist(&index).await?;
        }
        Ok(())
    }

    fn prune_entry_locks(&self) {
        if let Ok(mut locks) = self.entry_locks.lock() {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
    }

    fn entry_lock(&self, sha256: &str) -> Arc<Mutex<()>> {
        match self.entry_locks.lock() {
            Ok(mut locks) => locks
                .entry(sha256.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone(),
            Err(_) => Arc::new(Mutex::new(())),
        }
    }

    /// Streams an artifact into the cache, verifying its SHA-256 before it
    /// becomes visible. Returns the object path.
    pub async fn store<S>(
        &self,
        sha256: &str,
        expected_size: u64,
        mut body: S,
        progress: Option<mpsc::Sender<DownloadProgress>>,
        now: DateTime<Utc>,
    ) -> AgentResult<PathBuf>
    where
        S: Stream<Item = AgentResult<Vec<u8>>> + Unpin,
    {
        let sha256 = sha256.to_ascii_lowercase();
        let _entry = EntryGuard {
            cache: self,
            guard: Some(self.entry_lock(&sha256).lock_owned().await),
        };
        if let Some(path) = self.get(&sha256).await {
            return Ok(path);
        }

        let _reservation = self.reserve(expected_size).await?;
        let (mut part, written) = self
            .write_verified(&sha256, expected_size, &mut body, progress)
            .await?;

        let mut index = self.index.lock().await;
        let final_path = self.object_path(&sha256);
        tokio::fs::rename(&part.path, &final_path).await?;
        part.published = true;
        index.entries.insert(
            sha256.clone(),
            CacheEntry {
                size: written,
                last_referenced: now,
            },
        );
        self.persist(&index).await?;
        tracing::debug!("Cached {} ({} bytes)", sha256, written);
        Ok(final_path)
    }

    async fn write_verified<S>(
        &self,
        sha256: &str,
        expected_size: u64,
        body: &mut S,
        progress: Option<mpsc::Sender<DownloadProgress>>,
    ) -> AgentResult<(PartFile, u64)>
    where
        S: Stream<Item = AgentResult<Vec<u8>>> + Unpin,
    {
        let part = PartFile {
            path: self
                .root
                .join("tmp")
                .join(format!("{}.{}.part", sha256, uuid::Uuid::new_v4())),
            published: false,
        };
        let mut file = tokio::fs::File::create(&part.path).await?;
        let mut hasher = Sha256::new();
        let mut received = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            if let Some(tx) = &progress {
                // Progress is advisory; a slow reader just misses updates.
                let _ = tx.try_send(DownloadProgress {
                    sha256: sha256.to_string(),
                    received,
                    total: expected_size,
                });
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        if actual != sha256 {
            return Err(AgentError::IntegrityFailure {
                expected: sha256.to_string(),
                actual,
            });
        }
        Ok((part, received))
    }

    /// Makes room for `needed` more bytes by evicting the least recently
    /// referenced unpinned objects, then reserves the space.
    async fn reserve(&self, needed: u64) -> AgentResult<Reservation<'_>> {
        let mut index = self.index.lock().await;
        let mut evicted = false;
        loop {
            let committed = index.used() + self.reserved.load(Ordering::SeqCst);
            if committed + needed <= self.max_bytes {
                self.reserved.fetch_add(needed, Ordering::SeqCst);
                break;
            }
            let Some((sha, guard)) = self.eviction_candidate(&index) else {
                return Err(AgentError::CacheFull {
                    needed,
                    available: self.max_bytes.saturating_sub(committed),
                });
            };
            self.remove_locked(&mut index, &sha, guard).await?;
            evicted = true;
        }
        let reservation = Reservation {
            reserved: &self.reserved,
            bytes: needed,
        };
        self.prune_entry_locks();
        if evicted {
            self.persist(&index).await?;
        }
        Ok(reservation)
    }

    fn eviction_candidate(&self, index: &CacheIndex) -> Option<(String, OwnedMutexGuard<()>)> {
        let mut candidates: Vec<(&String, &CacheEntry)> = index
            .entries
            .iter()
            .filter(|(sha, _)| !self.is_pinned(sha))
            .collect();
        candidates.sort_by_key(|(sha, e)| (e.last_referenced, (*sha).clone()));
        candidates.into_iter().find_map(|(sha, _)| {
            self.entry_lock(sha)
                .try_lock_owned()
                .ok()
                .map(|guard| (sha.clone(), guard))
        })
    }

    async fn remove_locked(
        &self,
        index: &mut CacheIndex,
        sha256: &str,
        _guard: OwnedMutexGuard<()>,
    ) -> AgentResult<()> {
        match tokio::fs::remove_file(self.object_path(sha256)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        index.entries.remove(sha256);
        tracing::debug!("Evicted {}", sha256);
        Ok(())
    }

    /// Evicts every object that isn't pinned. Returns how many were removed.
    pub async fn clear(&self) -> AgentResult<usize> {
        let mut index = self.index.lock().await;
        let victims: Vec<String> = index
            .entries
            .keys()
            .filter(|sha| !self.is_pinned(sha))
            .cloned()
            .collect();
        let mut removed = 0;
        for sha in victims {
            if let Ok(guard) = self.entry_lock(&sha).try_lock_owned() {
                self.remove_locked(&mut index, &sha, guard).await?;
                removed += 1;
            }
        }
        self.prune_entry_locks();
        self.persist(&index).await?;
        tracing::info!("Cache cleared: {} objects removed", removed);
        Ok(removed)
    }

    async fn persist(&self, index: &CacheIndex) -> AgentResult<()> {
        let raw = serde_json::to_vec_pretty(index)
            .map_err(|e| AgentError::Io(std::io::Error::other(e)))?;
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, self.root.join(INDEX_FILE)).await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sha(data: &[u8]) -> String {
        hex::encode(Sha256::digest(data))
    }

    fn body(data: &[u8]) -> impl Stream<Item = AgentResult<Vec<u8>>> + Unpin {
        let chunks: Vec<AgentResult<Vec<u8>>> = data.chunks(3).map(|c| Ok(c.to_vec())).collect();
        futures::stream::iter(chunks)
    }

    async fn put(cache: &ContentCache, data: &[u8], at: DateTime<Utc>) -> AgentResult<PathBuf> {
        cache
            .store(&sha(data), data.len() as u64, body(data), None, at)
            .await
    }

    #[tokio::test]
    async fn stores_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), 1024).await.unwrap();
        let path = put(&cache, b"hologram", Utc::now()).await.unwrap();
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hologram");
        assert!(cache.contains(&sha(b"hologram")).await);
        assert_eq!(cache.used_bytes().await, 8);
    }

    #[tokio::test]
    async fn hash_mismatch_never_becomes_visible() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), 1024).await.unwrap();
        let claimed = sha(b"expected bytes");
        let err = cache
            .store(&claimed, 14, body(b"tampered bytes"), None, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::IntegrityFailure { .. }));
        assert!(cache.get(&claimed).await.is_none());
        assert!(!cache.object_path(&claimed).exists());
        let mut tmp = tokio::fs::read_dir(dir.path().join("tmp")).await.unwrap();
        assert!(tmp.next_entry().await.unwrap().is_none());
        assert_eq!(cache.used_bytes().await, 0);
    }

    #[tokio::test]
    async fn evicts_least_recently_referenced_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), 20).await.unwrap();
        let t0 = Utc::now();
        put(&cache, b"aaaaaaaa", t0).await.unwrap();
        put(&cache, b"bbbbbbbb", t0 + Duration::seconds(1)).await.unwrap();
        cache.touch([sha(b"aaaaaaaa").as_str()], t0 + Duration::seconds(2)).await.unwrap();

        put(&cache, b"cccccccc", t0 + Duration::seconds(3)).await.unwrap();
        assert!(cache.contains(&sha(b"aaaaaaaa")).await);
        assert!(!cache.contains(&sha(b"bbbbbbbb")).await);
        assert!(cache.contains(&sha(b"cccccccc")).await);
    }

    #[tokio::test]
    async fn pinned_objects_survive_and_full_cache_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), 10).await.unwrap();
        put(&cache, b"pinned!!", Utc::now()).await.unwrap();
        cache.set_pinned([sha(b"pinned!!")].into_iter().collect());

        let err = put(&cache, b"newcomer", Utc::now()).await.unwrap_err();
        assert!(matches!(err, AgentError::CacheFull { needed: 8, .. }));
        assert!(cache.contains(&sha(b"pinned!!")).await);
    }

    #[tokio::test]
    async fn clear_keeps_pinned() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), 1024).await.unwrap();
        put(&cache, b"keep", Utc::now()).await.unwrap();
        put(&cache, b"drop", Utc::now()).await.unwrap();
        cache.set_pinned([sha(b"keep")].into_iter().collect());

        assert_eq!(cache.clear().await.unwrap(), 1);
        assert!(cache.contains(&sha(b"keep")).await);
        assert!(!cache.contains(&sha(b"drop")).await);
    }

    #[tokio::test]
    async fn index_survives_reopen_and_strays_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache = ContentCache::open(dir.path(), 1024).await.unwrap();
            put(&cache, b"durable", Utc::now()).await.unwrap();
        }
        tokio::fs::write(dir.path().join("objects").join("stray"), b"x")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("tmp").join("half.part"), b"x")
            .await
            .unwrap();

        let cache = ContentCache::open(dir.path(), 1024).await.unwrap();
        assert_eq!(cache.len().await, 1);
        assert!(cache.contains(&sha(b"durable")).await);
        assert!(!dir.path().join("objects").join("stray").exists());
        assert!(!dir.path().join("tmp").join("half.part").exists());
    }

    #[tokio::test]
    async fn abandoned_download_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(ContentCache::open(dir.path(), 1024).await.unwrap());
        let (tx, mut rx) = mpsc::channel(16);
        let claimed = sha(b"never finishes");

        let first: Vec<AgentResult<Vec<u8>>> = vec![Ok(b"never".to_vec())];
        let stalled = futures::stream::iter(first).chain(futures::stream::pending());
        let task = tokio::spawn({
            let cache = Arc::clone(&cache);
            let claimed = claimed.clone();
            async move { cache.store(&claimed, 14, stalled, Some(tx), Utc::now()).await }
        });
        rx.recv().await.unwrap();
        let mut tmp = tokio::fs::read_dir(dir.path().join("tmp")).await.unwrap();
        assert!(tmp.next_entry().await.unwrap().is_some());

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        let mut tmp = tokio::fs::read_dir(dir.path().join("tmp")).await.unwrap();
        assert!(tmp.next_entry().await.unwrap().is_none());
        assert!(!cache.contains(&claimed).await);
        assert_eq!(cache.reserved.load(Ordering::SeqCst), 0);
        assert!(cache.entry_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn entry_locks_do_not_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), 24).await.unwrap();
        for i in 0..10u8 {
            put(&cache, &[b'a' + i; 8], Utc::now()).await.unwrap();
        }
        assert_eq!(cache.len().await, 3);
        assert!(cache.entry_locks.lock().unwrap().is_empty());
        cache.clear().await.unwrap();
        assert!(cache.entry_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), 1024).await.unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let data = b"0123456789";
        cache
            .store(&sha(data), 10, body(data), Some(tx), Utc::now())
            .await
            .unwrap();
        let mut last = None;
        while let Ok(p) = rx.try_recv() {
            last = Some(p);
        }
        assert_eq!(
            last,
            Some(DownloadProgress {
                sha256: sha(data),
                received: 10,
                total: 10
            })
        );
    }
}
