//
// metadata_cache.rs
//
// Timestamp-validated, disk-persisted cache of expensive scan results
//

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Snapshot format written by [`MetadataCache::save`].
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("resource path must be absolute: {}", .0.display())]
    RelativePath(PathBuf),
    #[error("cannot read the modification time of {}: {source}", path.display())]
    Clock { path: PathBuf, source: anyhow::Error },
    #[error("scanning {} failed: {source}", path.display())]
    Scan { path: PathBuf, source: anyhow::Error },
    #[error("cache snapshot {} does not exist", .0.display())]
    Missing(PathBuf),
    #[error("cache snapshot {} is corrupt: {source}", path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("cache snapshot {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source of resource modification times.
#[async_trait]
pub trait ResourceClock: Send + Sync {
    async fn last_modified(&self, path: &Path) -> anyhow::Result<DateTime<Utc>>;
}

/// Reads modification times from the file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSystemClock;

#[async_trait]
impl ResourceClock for FileSystemClock {
    async fn last_modified(&self, path: &Path) -> anyhow::Result<DateTime<Utc>> {
        let modified = tokio::fs::metadata(path).await?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }
}

/// The expensive computation whose results are cached.
#[async_trait]
pub trait MetadataScanner<T>: Send + Sync {
    async fn scan(&self, path: &Path) -> anyhow::Result<T>;
}

/// A cached scan result and the modification time it was computed against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<T> {
    pub scan_result: T,
    pub timestamp_utc: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
    /// Valid while the resource has not been modified after the stored timestamp.
    pub fn is_valid_at(&self, modified: DateTime<Utc>) -> bool {
        modified <= self.timestamp_utc
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotOut<'a, T> {
    version: u32,
    entries: BTreeMap<&'a Path, &'a CacheEntry<T>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotIn<T> {
    #[serde(default)]
    version: u32,
    entries: BTreeMap<PathBuf, CacheEntry<T>>,
}

struct CacheState<T> {
    entries: HashMap<PathBuf, CacheEntry<T>>,
    dirty: bool,
    /// Bumped on every mutation; lets `save` tell whether it wrote the latest state.
    revision: u64,
    /// Per-path scan gates. Holding a gate means "I am scanning this path".
    in_flight: HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
}

/// Keyed store from absolute resource path to scan result.
///
/// All mutations happen under one lock, but scans run outside it: lookups
/// for other paths proceed while a scan is in flight, and concurrent lookups
/// of the same path wait on a per-path gate so the scanner runs at most once
/// per invalidation.
pub struct MetadataCache<T> {
    clock: Arc<dyn ResourceClock>,
    scanner: Arc<dyn MetadataScanner<T>>,
    state: Mutex<CacheState<T>>,
}

impl<T> MetadataCache<T> {
    fn lock(&self) -> MutexGuard<'_, CacheState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> std::fmt::Debug for MetadataCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MetadataCache")
            .field("entries", &state.entries.len())
            .field("dirty", &state.dirty)
            .finish()
    }
}

impl<T> MetadataCache<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(scanner: Arc<dyn MetadataScanner<T>>) -> Self {
        Self::with_clock(scanner, Arc::new(FileSystemClock))
    }

    pub fn with_clock(scanner: Arc<dyn MetadataScanner<T>>, clock: Arc<dyn ResourceClock>) -> Self {
        Self {
            clock,
            scanner,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                dirty: false,
                revision: 0,
                in_flight: HashMap::new(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// True when entries changed since the last load, flush or save.
    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// Stored entry for `path`, without validating or scanning.
    pub fn peek(&self, path: &Path) -> Option<CacheEntry<T>> {
        self.lock().entries.get(path).cloned()
    }

    /// Scan result for `path`, rescanning when the resource changed since it
    /// was cached.
    pub async fn get(&self, path: &Path) -> Result<T, CacheError> {
        if !path.is_absolute() {
            return Err(CacheError::RelativePath(path.to_path_buf()));
        }

        let modified = self.modified(path).await?;
        let gate = {
            let mut state = self.lock();
            if let Some(entry) = state.entries.get(path) {
                if entry.is_valid_at(modified) {
                    log::trace!("Metadata cache hit: {}", path.display());
                    return Ok(entry.scan_result.clone());
                }
            }
            Arc::clone(
                state
                    .in_flight
                    .entry(path.to_path_buf())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };

        let _scanning = gate.lock().await;
        let result = self.scan_once(path).await;
        self.release_gate(path, &gate);
        result
    }

    /// Runs with the path's gate held: whoever held it before may already
    /// have produced a fresh entry.
    async fn scan_once(&self, path: &Path) -> Result<T, CacheError> {
        let modified = self.modified(path).await?;
        if let Some(entry) = self.lock().entries.get(path) {
            if entry.is_valid_at(modified) {
                log::trace!("Metadata cache hit after waiting: {}", path.display());
                return Ok(entry.scan_result.clone());
            }
        }

        log::debug!("Scanning {}", path.display());
        let scan_result = self
            .scanner
            .scan(path)
            .await
            .map_err(|source| CacheError::Scan {
                path: path.to_path_buf(),
                source,
            })?;

        let mut state = self.lock();
        // Replace, never patch: the old entry described different content.
        state.entries.insert(
            path.to_path_buf(),
            CacheEntry {
                scan_result: scan_result.clone(),
                timestamp_utc: modified,
            },
        );
        state.dirty = true;
        state.revision += 1;
        Ok(scan_result)
    }

    fn release_gate(&self, path: &Path, gate: &Arc<tokio::sync::Mutex<()>>) {
        let mut state = self.lock();
        let unused = state
            .in_flight
            .get(path)
            .is_some_and(|current| Arc::ptr_eq(current, gate) && Arc::strong_count(gate) <= 2);
        if unused {
            state.in_flight.remove(path);
        }
    }

    /// Drop every entry. The cache is clean afterwards whatever was persisted.
    pub fn flush(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.dirty = false;
        state.revision += 1;
    }

    /// Replace all entries with the snapshot stored in `file`.
    ///
    /// A missing or unreadable snapshot is an error; the cache is left empty
    /// (and usable) in that case.
    pub async fn load(&self, file: &Path) -> Result<usize, CacheError> {
        let loaded = match read_snapshot::<T>(file).await {
            Ok(entries) => entries,
            Err(err) => {
                self.flush();
                return Err(err);
            }
        };
        let count = loaded.len();
        let mut state = self.lock();
        state.entries = loaded.into_iter().collect();
        state.dirty = false;
        state.revision += 1;
        log::debug!("Loaded {} metadata cache entries from {}", count, file.display());
        Ok(count)
    }

    /// Persist the entries to `file` if anything changed since the last
    /// load or save. Returns whether a snapshot was written.
    ///
    /// The snapshot is written to a temporary file beside `file` and renamed
    /// over it, so a crash never leaves a half-written cache behind.
    pub async fn save(&self, file: &Path) -> Result<bool, CacheError> {
        let (bytes, revision) = {
            let state = self.lock();
            if !state.dirty {
                return Ok(false);
            }
            let snapshot = SnapshotOut {
                version: FORMAT_VERSION,
                entries: state
                    .entries
                    .iter()
                    .map(|(path, entry)| (path.as_path(), entry))
                    .collect(),
            };
            let bytes = serde_json::to_vec_pretty(&snapshot).map_err(|err| CacheError::Io {
                path: file.to_path_buf(),
                source: err.into(),
            })?;
            (bytes, state.revision)
        };

        let target = file.to_path_buf();
        tokio::task::spawn_blocking(move || write_atomically(&target, &bytes))
            .await
            .map_err(|err| CacheError::Io {
                path: file.to_path_buf(),
                source: std::io::Error::other(err),
            })?
            .map_err(|source| CacheError::Io {
                path: file.to_path_buf(),
                source,
            })?;

        let mut state = self.lock();
        if state.revision == revision {
            state.dirty = false;
        }
        log::debug!("Saved metadata cache to {}", file.display());
        Ok(true)
    }

    async fn modified(&self, path: &Path) -> Result<DateTime<Utc>, CacheError> {
        self.clock
            .last_modified(path)
            .await
            .map_err(|source| CacheError::Clock {
                path: path.to_path_buf(),
                source,
            })
    }

}

async fn read_snapshot<T: DeserializeOwned>(
    file: &Path,
) -> Result<BTreeMap<PathBuf, CacheEntry<T>>, CacheError> {
    let bytes = match tokio::fs::read(file).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(CacheError::Missing(file.to_path_buf()));
        }
        Err(source) => {
            return Err(CacheError::Io {
                path: file.to_path_buf(),
                source,
            })
        }
    };
    let snapshot: SnapshotIn<T> =
        serde_json::from_slice(&bytes).map_err(|source| CacheError::Corrupt {
            path: file.to_path_buf(),
            source,
        })?;
    if snapshot.version > FORMAT_VERSION {
        log::warn!(
            "Metadata cache {} has format version {} (newer than {}); reading known fields only",
            file.display(),
            snapshot.version,
            FORMAT_VERSION
        );
    }
    Ok(snapshot.entries)
}

fn write_atomically(target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(target).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct ManualClock {
        times: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
    }

    impl ManualClock {
        fn set(&self, path: &str, time: DateTime<Utc>) {
            self.times.lock().unwrap().insert(PathBuf::from(path), time);
        }
    }

    #[async_trait]
    impl ResourceClock for ManualClock {
        async fn last_modified(&self, path: &Path) -> anyhow::Result<DateTime<Utc>> {
            self.times
                .lock()
                .unwrap()
                .get(path)
                .copied()
                .ok_or_else(|| anyhow::anyhow!("no such file"))
        }
    }

    #[derive(Default)]
    struct CountingScanner {
        scans: AtomicUsize,
    }

    #[async_trait]
    impl MetadataScanner<String> for CountingScanner {
        async fn scan(&self, path: &Path) -> anyhow::Result<String> {
            let n = self.scans.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if path.ends_with("broken.dll") {
                anyhow::bail!("not an assembly");
            }
            Ok(format!("{}#{n}", path.display()))
        }
    }

    fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn cache() -> (MetadataCache<String>, Arc<CountingScanner>, Arc<ManualClock>) {
        let scanner = Arc::new(CountingScanner::default());
        let clock = Arc::new(ManualClock::default());
        clock.set("/a/b.dll", epoch());
        clock.set("/a/c.dll", epoch());
        clock.set("/a/broken.dll", epoch());
        let cache = MetadataCache::with_clock(scanner.clone(), clock.clone());
        (cache, scanner, clock)
    }

    #[tokio::test]
    async fn test_unchanged_resource_scans_once() {
        let (cache, scanner, _) = cache();
        let first = cache.get(Path::new("/a/b.dll")).await.unwrap();
        let second = cache.get(Path::new("/a/b.dll")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(scanner.scans.load(Ordering::SeqCst), 1);
        assert!(cache.is_dirty());
    }

    #[tokio::test]
    async fn test_modified_resource_is_rescanned() {
        let (cache, scanner, clock) = cache();
        let first = cache.get(Path::new("/a/b.dll")).await.unwrap();
        clock.set("/a/b.dll", epoch() + Duration::seconds(1));
        let second = cache.get(Path::new("/a/b.dll")).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(scanner.scans.load(Ordering::SeqCst), 2);
        assert_eq!(
            cache.peek(Path::new("/a/b.dll")).unwrap().timestamp_utc,
            epoch() + Duration::seconds(1)
        );

        // An older time than stored is still a hit.
        clock.set("/a/b.dll", epoch());
        assert_eq!(cache.get(Path::new("/a/b.dll")).await.unwrap(), second);
        assert_eq!(scanner.scans.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_gets_for_one_path_scan_once() {
        let (cache, scanner, _) = cache();
        let path = Path::new("/a/b.dll");
        let (a, b, c, d) = tokio::join!(
            cache.get(path),
            cache.get(path),
            cache.get(path),
            cache.get(Path::new("/a/c.dll"))
        );
        assert_eq!(a.unwrap(), b.as_ref().unwrap().clone());
        assert_eq!(b.unwrap(), c.unwrap());
        assert!(d.is_ok());
        assert_eq!(scanner.scans.load(Ordering::SeqCst), 2);
        assert!(cache.lock().in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_failures_do_not_populate() {
        let (cache, _, _) = cache();
        assert!(matches!(
            cache.get(Path::new("relative.dll")).await,
            Err(CacheError::RelativePath(_))
        ));
        assert!(matches!(
            cache.get(Path::new("/a/missing.dll")).await,
            Err(CacheError::Clock { .. })
        ));
        assert!(matches!(
            cache.get(Path::new("/a/broken.dll")).await,
            Err(CacheError::Scan { .. })
        ));
        assert!(cache.is_empty());
        assert!(!cache.is_dirty());
    }

    #[tokio::test]
    async fn test_flush_clears_and_cleans() {
        let (cache, scanner, _) = cache();
        cache.get(Path::new("/a/b.dll")).await.unwrap();
        cache.flush();
        assert!(cache.is_empty());
        assert!(!cache.is_dirty());
        cache.get(Path::new("/a/b.dll")).await.unwrap();
        assert_eq!(scanner.scans.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("nested").join("cache.json");
        let (cache, _, _) = cache();

        assert!(!cache.save(&file).await.unwrap());
        assert!(!file.exists());

        let value = cache.get(Path::new("/a/b.dll")).await.unwrap();
        assert!(cache.save(&file).await.unwrap());
        assert!(!cache.is_dirty());
        assert!(!cache.save(&file).await.unwrap());

        let (restored, scanner, _) = super::tests::cache();
        assert_eq!(restored.load(&file).await.unwrap(), 1);
        assert!(!restored.is_dirty());
        assert_eq!(restored.get(Path::new("/a/b.dll")).await.unwrap(), value);
        assert_eq!(scanner.scans.load(Ordering::SeqCst), 0);

        let leftovers: Vec<_> = std::fs::read_dir(file.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers, ["cache.json"]);
    }

    #[tokio::test]
    async fn test_snapshot_format() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("cache.json");
        let (cache, _, _) = cache();
        cache.get(Path::new("/a/b.dll")).await.unwrap();
        cache.save(&file).await.unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        assert_eq!(json["version"], FORMAT_VERSION);
        let entry = &json["entries"]["/a/b.dll"];
        assert_eq!(entry["scanResult"], "/a/b.dll#1");
        assert!(entry["timestampUtc"].as_str().unwrap().starts_with("2023-11-14T22:13:20"));
    }

    #[tokio::test]
    async fn test_load_ignores_unknown_fields() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("cache.json");
        std::fs::write(
            &file,
            r#"{"version":2,"generator":"future","entries":{"/a/b.dll":{"scanResult":"old","timestampUtc":"2023-11-14T22:13:20Z","hash":"abc"}}}"#,
        )
        .unwrap();
        let (cache, scanner, _) = cache();
        assert_eq!(cache.load(&file).await.unwrap(), 1);
        assert_eq!(cache.get(Path::new("/a/b.dll")).await.unwrap(), "old");
        assert_eq!(scanner.scans.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_load_failures_leave_cache_empty() {
        let dir = TempDir::new().unwrap();
        let (cache, _, _) = cache();
        cache.get(Path::new("/a/b.dll")).await.unwrap();

        let missing = dir.path().join("missing.json");
        assert!(matches!(cache.load(&missing).await, Err(CacheError::Missing(_))));
        assert!(cache.is_empty());

        cache.get(Path::new("/a/b.dll")).await.unwrap();
        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "{\"entries\": {\"/a/b.dll\": 4").unwrap();
        assert!(matches!(cache.load(&corrupt).await, Err(CacheError::Corrupt { .. })));
        assert!(cache.is_empty());
        assert!(!cache.is_dirty());

        // Still usable.
        assert!(cache.get(Path::new("/a/c.dll")).await.is_ok());
    }
}
