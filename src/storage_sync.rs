use crate::object_store::{BucketStore, ListEntry};
use std::path::Path;
use tracing::{info, instrument, warn};

/// Whole-run sync failures. Per-object failures are counted in the
/// report instead, they never abort the run.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("source bucket \"{bucket}\" is not reachable")]
    SourceUnreachable {
        bucket: String,
        #[source]
        source: Option<anyhow::Error>,
    },
    #[error("failed to create target bucket \"{bucket}\"")]
    TargetBucket {
        bucket: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("failed to prepare staging directory {dir}")]
    Staging {
        dir: String,
        #[source]
        source: std::io::Error,
    },
    #[error("local directory {dir} is not usable")]
    LocalDir {
        dir: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one sync run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Objects discovered in the source bucket
    pub discovered: usize,
    /// Objects copied to the target bucket
    pub succeeded: usize,
    /// Objects that failed to download or upload
    pub failed: usize,
}

/// Mirror every object in the source bucket into the target bucket.
///
/// Objects are discovered with an explicit worklist of folder prefixes,
/// downloaded one at a time into `staging_dir` under their bucket path,
/// then re-uploaded to the same path on the target with replace
/// semantics. The sync is additive: target objects absent from the
/// source are left untouched. The staging directory is removed when the
/// run finishes, whether it succeeded or not.
#[instrument(skip(source, target), fields(bucket = %bucket))]
pub async fn sync_bucket(
    source: &dyn BucketStore,
    target: &dyn BucketStore,
    bucket: &str,
    staging_dir: &Path,
    max_object_bytes: u64,
) -> Result<SyncReport, SyncError> {
    match source.bucket_exists().await {
        Ok(true) => {}
        Ok(false) => {
            return Err(SyncError::SourceUnreachable {
                bucket: bucket.to_string(),
                source: None,
            })
        }
        Err(e) => {
            return Err(SyncError::SourceUnreachable {
                bucket: bucket.to_string(),
                source: Some(e),
            })
        }
    }

    target
        .ensure_bucket()
        .await
        .map_err(|e| SyncError::TargetBucket {
            bucket: bucket.to_string(),
            source: e,
        })?;

    tokio::fs::create_dir_all(staging_dir)
        .await
        .map_err(|e| SyncError::Staging {
            dir: staging_dir.display().to_string(),
            source: e,
        })?;

    let report = transfer_all(source, target, staging_dir, max_object_bytes).await;

    // Guaranteed cleanup, also after per-object failures
    if let Err(e) = tokio::fs::remove_dir_all(staging_dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(dir = %staging_dir.display(), error = %e, "Failed to remove staging directory");
        }
    }

    info!(
        discovered = report.discovered,
        succeeded = report.succeeded,
        failed = report.failed,
        "Storage sync completed"
    );

    Ok(report)
}

/// Walk the source bucket and copy each object. Never fails as a whole;
/// per-object and per-prefix problems are logged and counted.
async fn transfer_all(
    source: &dyn BucketStore,
    target: &dyn BucketStore,
    staging_dir: &Path,
    max_object_bytes: u64,
) -> SyncReport {
    let paths = discover_objects(source).await;
    info!(count = paths.len(), "Found objects to sync");

    let mut report = SyncReport {
        discovered: paths.len(),
        ..Default::default()
    };

    if paths.is_empty() {
        info!("Source bucket is empty, nothing to sync");
        return report;
    }

    for path in &paths {
        match transfer_one(source, target, staging_dir, path, max_object_bytes).await {
            Ok(()) => {
                report.succeeded += 1;
                metrics::counter!("sync.objects.copied").increment(1);
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Skipping object after transfer failure");
                report.failed += 1;
                metrics::counter!("sync.objects.failed").increment(1);
            }
        }
    }

    report
}

/// Enumerate every object path in the bucket. Folder prefixes go onto a
/// worklist instead of the call stack, so the traversal depth is bounded
/// regardless of the storage tree depth. A prefix that fails to list is
/// logged and skipped.
async fn discover_objects(source: &dyn BucketStore) -> Vec<String> {
    let mut paths = Vec::new();
    let mut worklist = vec![String::new()];

    while let Some(prefix) = worklist.pop() {
        match source.list(&prefix).await {
            Ok(entries) => {
                for entry in entries {
                    match entry {
                        ListEntry::Object(path) => paths.push(path),
                        ListEntry::Prefix(folder) => worklist.push(folder),
                    }
                }
            }
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "Failed to list prefix, skipping");
            }
        }
    }

    paths
}

/// Download every object in the bucket into `dest_dir`, preserving the
/// bucket paths as a local directory tree. Per-object failures are
/// logged and counted; the directory is kept afterwards, it is the
/// point of the run.
#[instrument(skip(source), fields(bucket = %bucket))]
pub async fn download_bucket(
    source: &dyn BucketStore,
    bucket: &str,
    dest_dir: &Path,
) -> Result<SyncReport, SyncError> {
    match source.bucket_exists().await {
        Ok(true) => {}
        Ok(false) => {
            return Err(SyncError::SourceUnreachable {
                bucket: bucket.to_string(),
                source: None,
            })
        }
        Err(e) => {
            return Err(SyncError::SourceUnreachable {
                bucket: bucket.to_string(),
                source: Some(e),
            })
        }
    }

    tokio::fs::create_dir_all(dest_dir)
        .await
        .map_err(|e| SyncError::LocalDir {
            dir: dest_dir.display().to_string(),
            source: e,
        })?;

    let paths = discover_objects(source).await;
    info!(count = paths.len(), "Found objects to download");

    let mut report = SyncReport {
        discovered: paths.len(),
        ..Default::default()
    };

    for path in &paths {
        match fetch_one(source, dest_dir, path).await {
            Ok(()) => {
                report.succeeded += 1;
                metrics::counter!("sync.objects.downloaded").increment(1);
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Skipping object after download failure");
                report.failed += 1;
                metrics::counter!("sync.objects.failed").increment(1);
            }
        }
    }

    info!(
        discovered = report.discovered,
        succeeded = report.succeeded,
        failed = report.failed,
        "Storage download completed"
    );

    Ok(report)
}

/// Upload every file under `src_dir` into the bucket, with replace
/// semantics. Keys are the file paths relative to `src_dir`, with
/// forward slashes. Per-file failures are logged and counted.
#[instrument(skip(target), fields(bucket = %bucket))]
pub async fn upload_dir(
    src_dir: &Path,
    target: &dyn BucketStore,
    bucket: &str,
) -> Result<SyncReport, SyncError> {
    target
        .ensure_bucket()
        .await
        .map_err(|e| SyncError::TargetBucket {
            bucket: bucket.to_string(),
            source: e,
        })?;

    let keys = discover_files(src_dir)
        .await
        .map_err(|e| SyncError::LocalDir {
            dir: src_dir.display().to_string(),
            source: e,
        })?;
    info!(count = keys.len(), "Found files to upload");

    let mut report = SyncReport {
        discovered: keys.len(),
        ..Default::default()
    };

    for key in &keys {
        match push_one(src_dir, key, target).await {
            Ok(()) => {
                report.succeeded += 1;
                metrics::counter!("sync.objects.uploaded").increment(1);
            }
            Err(e) => {
                warn!(path = %key, error = %e, "Skipping file after upload failure");
                report.failed += 1;
                metrics::counter!("sync.objects.failed").increment(1);
            }
        }
    }

    info!(
        discovered = report.discovered,
        succeeded = report.succeeded,
        failed = report.failed,
        "Storage upload completed"
    );

    Ok(report)
}

/// Walk the directory tree under `root` with the same worklist shape as
/// the bucket traversal, returning bucket keys for every regular file.
async fn discover_files(root: &Path) -> std::io::Result<Vec<String>> {
    let mut keys = Vec::new();
    let mut worklist = vec![root.to_path_buf()];

    while let Some(dir) = worklist.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                worklist.push(path);
            } else {
                let rel = path.strip_prefix(root).unwrap_or(&path);
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                keys.push(key);
            }
        }
    }

    Ok(keys)
}

/// Fetch one object and write it under the local directory.
async fn fetch_one(
    source: &dyn BucketStore,
    dest_dir: &Path,
    path: &str,
) -> anyhow::Result<()> {
    // A hostile key must not escape the destination directory
    if path.split('/').any(|part| part == "..") {
        anyhow::bail!("refusing path with parent traversal: {path}");
    }

    let data = source.download(path).await?;

    let local = dest_dir.join(path);
    if let Some(parent) = local.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&local, &data).await?;

    Ok(())
}

/// Read one local file and upload it under its relative key.
async fn push_one(root: &Path, key: &str, target: &dyn BucketStore) -> anyhow::Result<()> {
    let data = tokio::fs::read(root.join(key)).await?;
    target.upload(key, data).await?;
    Ok(())
}

/// Copy one object through the staging directory.
async fn transfer_one(
    source: &dyn BucketStore,
    target: &dyn BucketStore,
    staging_dir: &Path,
    path: &str,
    max_object_bytes: u64,
) -> anyhow::Result<()> {
    // A hostile key must not escape the staging directory
    if path.split('/').any(|part| part == "..") {
        anyhow::bail!("refusing path with parent traversal: {path}");
    }

    let data = source.download(path).await?;

    if data.len() as u64 > max_object_bytes {
        anyhow::bail!(
            "object {path} is {} bytes, over the {} byte limit",
            data.len(),
            max_object_bytes
        );
    }

    let staged = staging_dir.join(path);
    if let Some(parent) = staged.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&staged, &data).await?;

    let staged_data = tokio::fs::read(&staged).await?;
    target.upload(path, staged_data).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::{BTreeMap, BTreeSet};
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// In-memory bucket for exercising the sync loop.
    #[derive(Default)]
    struct MemoryBucket {
        objects: Mutex<BTreeMap<String, Vec<u8>>>,
        exists: bool,
        fail_downloads: BTreeSet<String>,
    }

    impl MemoryBucket {
        fn with_objects(entries: &[(&str, &[u8])]) -> Self {
            let objects = entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_vec()))
                .collect();
            Self {
                objects: Mutex::new(objects),
                exists: true,
                fail_downloads: BTreeSet::new(),
            }
        }

        fn empty() -> Self {
            Self {
                exists: true,
                ..Default::default()
            }
        }

        fn contents(&self) -> BTreeMap<String, Vec<u8>> {
            self.objects.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BucketStore for MemoryBucket {
        async fn bucket_exists(&self) -> Result<bool> {
            Ok(self.exists)
        }

        async fn ensure_bucket(&self) -> Result<()> {
            Ok(())
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ListEntry>> {
            let objects = self.objects.lock().unwrap();
            let base = if prefix.is_empty() {
                String::new()
            } else {
                format!("{prefix}/")
            };

            let mut entries = Vec::new();
            let mut seen_prefixes = BTreeSet::new();
            for key in objects.keys() {
                let Some(rest) = key.strip_prefix(&base) else {
                    continue;
                };
                match rest.split_once('/') {
                    None => entries.push(ListEntry::Object(key.clone())),
                    Some((folder, _)) => {
                        let full = format!("{base}{folder}");
                        if seen_prefixes.insert(full.clone()) {
                            entries.push(ListEntry::Prefix(full));
                        }
                    }
                }
            }
            Ok(entries)
        }

        async fn download(&self, path: &str) -> Result<Vec<u8>> {
            if self.fail_downloads.contains(path) {
                anyhow::bail!("simulated download failure for {path}");
            }
            self.objects
                .lock()
                .unwrap()
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no such object: {path}"))
        }

        async fn upload(&self, path: &str, body: Vec<u8>) -> Result<()> {
            self.objects.lock().unwrap().insert(path.to_string(), body);
            Ok(())
        }
    }

    fn staging_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("gallery-sync-test-{}-{}", std::process::id(), tag))
    }

    const LIMIT: u64 = 50 * 1024 * 1024;

    #[tokio::test]
    async fn sync_copies_all_objects_byte_identical() {
        let source =
            MemoryBucket::with_objects(&[("A/1.jpg", b"first"), ("B/2.jpg", b"second")]);
        let target = MemoryBucket::empty();
        let staging = staging_dir("copies-all");

        let report = sync_bucket(&source, &target, "wedding-images", &staging, LIMIT)
            .await
            .unwrap();

        assert_eq!(report.discovered, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(target.contents(), source.contents());
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let source = MemoryBucket::with_objects(&[("A/1.jpg", b"first"), ("B/2.jpg", b"second")]);
        let target = MemoryBucket::empty();
        let staging = staging_dir("idempotent");

        sync_bucket(&source, &target, "wedding-images", &staging, LIMIT)
            .await
            .unwrap();
        let report = sync_bucket(&source, &target, "wedding-images", &staging, LIMIT)
            .await
            .unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(target.contents().len(), 2);
        assert_eq!(target.contents(), source.contents());
    }

    #[tokio::test]
    async fn one_failed_download_does_not_abort_the_run() {
        let mut source =
            MemoryBucket::with_objects(&[("A/1.jpg", b"first"), ("B/2.jpg", b"second")]);
        source.fail_downloads.insert("A/1.jpg".to_string());
        let target = MemoryBucket::empty();
        let staging = staging_dir("partial-failure");

        let report = sync_bucket(&source, &target, "wedding-images", &staging, LIMIT)
            .await
            .unwrap();

        assert_eq!(report.discovered, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(target.contents().get("B/2.jpg").unwrap(), b"second");
        assert!(!target.contents().contains_key("A/1.jpg"));
        // Staging is cleaned up even when objects failed
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn sync_is_additive_never_subtractive() {
        let source = MemoryBucket::with_objects(&[("A/1.jpg", b"first")]);
        let target = MemoryBucket::with_objects(&[("old/keep.jpg", b"existing")]);
        let staging = staging_dir("additive");

        sync_bucket(&source, &target, "wedding-images", &staging, LIMIT)
            .await
            .unwrap();

        let contents = target.contents();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents.get("old/keep.jpg").unwrap(), b"existing");
        assert_eq!(contents.get("A/1.jpg").unwrap(), b"first");
    }

    #[tokio::test]
    async fn overwrites_stale_target_objects() {
        let source = MemoryBucket::with_objects(&[("A/1.jpg", b"new contents")]);
        let target = MemoryBucket::with_objects(&[("A/1.jpg", b"stale")]);
        let staging = staging_dir("overwrite");

        sync_bucket(&source, &target, "wedding-images", &staging, LIMIT)
            .await
            .unwrap();

        assert_eq!(target.contents().get("A/1.jpg").unwrap(), b"new contents");
    }

    #[tokio::test]
    async fn empty_source_bucket_is_a_clean_no_op() {
        let source = MemoryBucket::empty();
        let target = MemoryBucket::empty();
        let staging = staging_dir("empty-source");

        let report = sync_bucket(&source, &target, "wedding-images", &staging, LIMIT)
            .await
            .unwrap();

        assert_eq!(report, SyncReport::default());
        assert!(!staging.exists());
    }

    #[tokio::test]
    async fn unreachable_source_bucket_aborts_the_run() {
        let source = MemoryBucket::default(); // exists = false
        let target = MemoryBucket::empty();
        let staging = staging_dir("unreachable");

        let err = sync_bucket(&source, &target, "wedding-images", &staging, LIMIT)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::SourceUnreachable { .. }));
    }

    #[tokio::test]
    async fn oversized_object_counts_as_failure() {
        let source = MemoryBucket::with_objects(&[("big.jpg", b"0123456789"), ("ok.jpg", b"x")]);
        let target = MemoryBucket::empty();
        let staging = staging_dir("oversized");

        let report = sync_bucket(&source, &target, "wedding-images", &staging, 5)
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert!(!target.contents().contains_key("big.jpg"));
    }

    #[tokio::test]
    async fn traversal_paths_are_refused() {
        let source = MemoryBucket::with_objects(&[("../escape.jpg", b"nope"), ("ok.jpg", b"x")]);
        let target = MemoryBucket::empty();
        let staging = staging_dir("traversal");

        let report = sync_bucket(&source, &target, "wedding-images", &staging, LIMIT)
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert!(!target.contents().contains_key("../escape.jpg"));
    }

    #[tokio::test]
    async fn download_writes_bucket_tree_to_disk() {
        let source = MemoryBucket::with_objects(&[
            ("root.jpg", b"r" as &[u8]),
            ("a/1.jpg", b"one"),
            ("a/b/2.jpg", b"two"),
        ]);
        let dest = staging_dir("download-tree");

        let report = download_bucket(&source, "wedding-images", &dest)
            .await
            .unwrap();

        assert_eq!(report.discovered, 3);
        assert_eq!(report.succeeded, 3);
        assert_eq!(std::fs::read(dest.join("root.jpg")).unwrap(), b"r");
        assert_eq!(std::fs::read(dest.join("a/1.jpg")).unwrap(), b"one");
        assert_eq!(std::fs::read(dest.join("a/b/2.jpg")).unwrap(), b"two");
        // Unlike the sync staging dir, the download tree stays
        assert!(dest.exists());
        std::fs::remove_dir_all(&dest).unwrap();
    }

    #[tokio::test]
    async fn one_failed_download_does_not_abort_a_local_download() {
        let mut source =
            MemoryBucket::with_objects(&[("a/1.jpg", b"one"), ("a/2.jpg", b"two")]);
        source.fail_downloads.insert("a/1.jpg".to_string());
        let dest = staging_dir("download-partial");

        let report = download_bucket(&source, "wedding-images", &dest)
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(std::fs::read(dest.join("a/2.jpg")).unwrap(), b"two");
        assert!(!dest.join("a/1.jpg").exists());
        std::fs::remove_dir_all(&dest).unwrap();
    }

    #[tokio::test]
    async fn upload_pushes_directory_tree_with_relative_keys() {
        let src = staging_dir("upload-tree");
        std::fs::create_dir_all(src.join("a/b")).unwrap();
        std::fs::write(src.join("root.jpg"), b"r").unwrap();
        std::fs::write(src.join("a/1.jpg"), b"one").unwrap();
        std::fs::write(src.join("a/b/2.jpg"), b"two").unwrap();
        let target = MemoryBucket::empty();

        let report = upload_dir(&src, &target, "wedding-images").await.unwrap();

        assert_eq!(report.discovered, 3);
        assert_eq!(report.succeeded, 3);
        let contents = target.contents();
        assert_eq!(contents.get("root.jpg").unwrap(), b"r");
        assert_eq!(contents.get("a/1.jpg").unwrap(), b"one");
        assert_eq!(contents.get("a/b/2.jpg").unwrap(), b"two");
        std::fs::remove_dir_all(&src).unwrap();
    }

    #[tokio::test]
    async fn upload_overwrites_existing_objects() {
        let src = staging_dir("upload-overwrite");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.jpg"), b"fresh").unwrap();
        let target = MemoryBucket::with_objects(&[("a.jpg", b"stale")]);

        upload_dir(&src, &target, "wedding-images").await.unwrap();

        assert_eq!(target.contents().get("a.jpg").unwrap(), b"fresh");
        std::fs::remove_dir_all(&src).unwrap();
    }

    #[tokio::test]
    async fn upload_from_missing_directory_is_an_error() {
        let src = staging_dir("upload-missing");
        let target = MemoryBucket::empty();

        let err = upload_dir(&src, &target, "wedding-images")
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::LocalDir { .. }));
    }

    #[tokio::test]
    async fn discovers_nested_folders() {
        let source = MemoryBucket::with_objects(&[
            ("root.jpg", b"r" as &[u8]),
            ("a/1.jpg", b"1"),
            ("a/b/2.jpg", b"2"),
            ("a/b/c/3.jpg", b"3"),
        ]);

        let mut paths = discover_objects(&source).await;
        paths.sort();

        assert_eq!(paths, vec!["a/1.jpg", "a/b/2.jpg", "a/b/c/3.jpg", "root.jpg"]);
    }
}
