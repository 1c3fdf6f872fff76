// Integration tests for the task-assembly metadata cache against the real
// filesystem clock.

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tempfile::TempDir;

use msbuild_ls::metadata_cache::{CacheError, MetadataCache, MetadataScanner};
use msbuild_ls::task_assembly::{TaskAssemblyMetadata, TaskMetadata, TaskParameter};

/// Reports one task per scan, named after the file and the scan count.
#[derive(Default)]
struct AssemblyScanner {
    scans: AtomicUsize,
}

#[async_trait]
impl MetadataScanner<TaskAssemblyMetadata> for AssemblyScanner {
    async fn scan(&self, path: &Path) -> anyhow::Result<TaskAssemblyMetadata> {
        let n = self.scans.fetch_add(1, Ordering::SeqCst) + 1;
        let bytes = tokio::fs::read(path).await?;
        anyhow::ensure!(bytes.starts_with(b"MZ"), "{} is not an assembly", path.display());
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        Ok(TaskAssemblyMetadata {
            tasks: vec![TaskMetadata {
                name: format!("{stem}{n}"),
                type_name: format!("Tasks.{stem}{n}"),
                parameters: vec![TaskParameter {
                    name: "Files".to_string(),
                    type_name: "Microsoft.Build.Framework.ITaskItem[]".to_string(),
                    required: true,
                    output: false,
                }],
            }],
        })
    }
}

fn set_mtime(path: &Path, time: SystemTime) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}

fn setup() -> (TempDir, MetadataCache<TaskAssemblyMetadata>, Arc<AssemblyScanner>) {
    let dir = TempDir::new().unwrap();
    let scanner = Arc::new(AssemblyScanner::default());
    let cache = MetadataCache::new(scanner.clone());
    (dir, cache, scanner)
}

#[tokio::test]
async fn test_unchanged_assembly_is_scanned_once() {
    let (dir, cache, scanner) = setup();
    let dll = dir.path().join("b.dll");
    std::fs::write(&dll, b"MZ1").unwrap();

    let first = cache.get(&dll).await.unwrap();
    let second = cache.get(&dll).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(scanner.scans.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_touched_assembly_is_rescanned() {
    let (dir, cache, scanner) = setup();
    let dll = dir.path().join("b.dll");
    std::fs::write(&dll, b"MZ1").unwrap();
    let base = SystemTime::now() - Duration::from_secs(3600);
    set_mtime(&dll, base);

    let first = cache.get(&dll).await.unwrap();
    set_mtime(&dll, base + Duration::from_secs(60));
    let second = cache.get(&dll).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(second.tasks[0].name, "b2");
    assert_eq!(scanner.scans.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_and_unscannable_resources_fail() {
    let (dir, cache, _) = setup();
    let missing = dir.path().join("missing.dll");
    assert!(matches!(cache.get(&missing).await, Err(CacheError::Clock { .. })));

    let text = dir.path().join("readme.dll");
    std::fs::write(&text, b"hello").unwrap();
    assert!(matches!(cache.get(&text).await, Err(CacheError::Scan { .. })));
    assert!(cache.is_empty());

    assert!(matches!(
        cache.get(Path::new("relative.dll")).await,
        Err(CacheError::RelativePath(_))
    ));
}

#[tokio::test]
async fn test_snapshot_survives_a_new_cache() {
    let (dir, cache, _) = setup();
    let dll = dir.path().join("Zip.dll");
    std::fs::write(&dll, b"MZ").unwrap();
    let scanned = cache.get(&dll).await.unwrap();

    let snapshot = dir.path().join("state").join("tasks.json");
    assert!(cache.save(&snapshot).await.unwrap());

    let scanner = Arc::new(AssemblyScanner::default());
    let restored = MetadataCache::new(scanner.clone());
    assert_eq!(restored.load(&snapshot).await.unwrap(), 1);
    assert_eq!(restored.get(&dll).await.unwrap(), scanned);
    assert_eq!(scanner.scans.load(Ordering::SeqCst), 0);
    assert!(!restored.is_dirty());
}

#[tokio::test]
async fn test_corrupt_snapshot_leaves_cache_usable() {
    let (dir, cache, scanner) = setup();
    let dll = dir.path().join("a.dll");
    std::fs::write(&dll, b"MZ").unwrap();
    cache.get(&dll).await.unwrap();

    let snapshot = dir.path().join("tasks.json");
    std::fs::write(&snapshot, "{ not json").unwrap();
    assert!(matches!(cache.load(&snapshot).await, Err(CacheError::Corrupt { .. })));
    assert!(cache.is_empty());

    cache.get(&dll).await.unwrap();
    assert_eq!(scanner.scans.load(Ordering::SeqCst), 2);
}
