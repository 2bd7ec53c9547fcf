//! High availability preconditions and registry data migration

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use installation_operator::ha::{
    HaError, MigrationError, ObjectBody, ObjectStore, ProgressTracker, check_ha_preconditions,
    copy_archive,
};

/// Object store keeping objects in memory, optionally failing on one key
#[derive(Default)]
struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_on: Option<String>,
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_bucket(&self, _bucket: &str) -> Result<(), MigrationError> {
        Ok(())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        mut body: ObjectBody,
    ) -> Result<(), MigrationError> {
        if self.fail_on.as_deref() == Some(key) {
            return Err(MigrationError::Store(format!("upload of {} rejected", key)));
        }
        let mut content = Vec::new();
        while let Some(chunk) = body.next_chunk().await? {
            content.extend_from_slice(&chunk);
        }
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{}/{}", bucket, key), content);
        Ok(())
    }
}

/// Tar archive laid out like `tar -c -C dir .`
fn registry_archive(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_size(0);
    dir.set_mode(0o755);
    builder.append_data(&mut dir, "./docker/", std::io::empty()).unwrap();

    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Archive whose only entry claims `size` bytes but carries a single block
fn truncated_archive(size: u64) -> Vec<u8> {
    let mut header = tar::Header::new_gnu();
    header.set_path("./docker/huge").unwrap();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o644);
    header.set_cksum();

    let mut archive = header.as_bytes().to_vec();
    archive.extend_from_slice(&[0u8; 512]);
    archive
}

fn collect_progress() -> (Arc<Mutex<Vec<u8>>>, impl FnMut(u8) + Send + 'static) {
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    (reports, move |percent| sink.lock().unwrap().push(percent))
}

mod precondition_tests {
    use super::*;

    #[test]
    fn test_ready_cluster() {
        assert!(check_ha_preconditions(false, 3, false).is_ok());
    }

    #[test]
    fn test_two_controllers_rejected() {
        let err = check_ha_preconditions(false, 2, false).unwrap_err();
        assert!(matches!(err, HaError::NotEnoughControllers(2)));
        assert_eq!(
            err.to_string(),
            "High availability requires at least 3 controller nodes, found 2"
        );
    }

    #[test]
    fn test_already_enabled_checked_first() {
        let err = check_ha_preconditions(true, 1, true).unwrap_err();
        assert!(matches!(err, HaError::AlreadyEnabled));
    }

    #[test]
    fn test_restore_in_progress() {
        let err = check_ha_preconditions(false, 3, true).unwrap_err();
        assert!(matches!(err, HaError::RestoreInProgress));
    }
}

mod progress_tests {
    use super::*;

    #[test]
    fn test_reports_only_increases() {
        let mut tracker = ProgressTracker::new(4);
        let reports: Vec<u8> = (0..4).filter_map(|_| tracker.record()).collect();
        assert_eq!(reports, vec![25, 50, 75, 100]);
        assert_eq!(tracker.finish(), None);
    }

    #[test]
    fn test_empty_source_finishes_at_100() {
        let mut tracker = ProgressTracker::new(0);
        assert_eq!(tracker.finish(), Some(100));
        assert_eq!(tracker.finish(), None);
    }

    #[test]
    fn test_undercounted_total_is_capped() {
        let mut tracker = ProgressTracker::new(1);
        assert_eq!(tracker.record(), Some(100));
        assert_eq!(tracker.record(), None);
        assert_eq!(tracker.uploaded(), 2);
    }
}

mod migration_tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_every_file_uploaded_under_relative_key() {
        let archive = registry_archive(&[
            ("./docker/registry/v2/blobs/a/data", b"layer-a"),
            ("./docker/registry/v2/blobs/b/data", b"layer-b"),
            ("./docker/registry/v2/repositories/app/_manifests/link", b"sha256:abc"),
        ]);
        let store = Arc::new(MemoryStore::default());
        let (reports, progress) = collect_progress();

        let uploaded = copy_archive(
            std::io::Cursor::new(archive),
            3,
            store.clone(),
            "registry",
            progress,
        )
        .await
        .unwrap();

        assert_eq!(uploaded, 3);
        let objects = store.objects.lock().unwrap();
        assert_eq!(
            objects.keys().cloned().collect::<Vec<_>>(),
            vec![
                "registry/docker/registry/v2/blobs/a/data",
                "registry/docker/registry/v2/blobs/b/data",
                "registry/docker/registry/v2/repositories/app/_manifests/link",
            ]
        );
        assert_eq!(objects["registry/docker/registry/v2/blobs/a/data"], b"layer-a");
        assert_eq!(*reports.lock().unwrap(), vec![33, 66, 100]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_archive_larger_than_pipe() {
        let big = vec![7u8; 512 * 1024];
        let archive = registry_archive(&[("./docker/big", big.as_slice())]);
        let store = Arc::new(MemoryStore::default());
        let (reports, progress) = collect_progress();

        let uploaded = copy_archive(
            std::io::Cursor::new(archive),
            1,
            store.clone(),
            "registry",
            progress,
        )
        .await
        .unwrap();

        assert_eq!(uploaded, 1);
        assert_eq!(store.objects.lock().unwrap()["registry/docker/big"].len(), big.len());
        assert_eq!(*reports.lock().unwrap(), vec![100]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_upload_error_wins() {
        let archive = registry_archive(&[
            ("./docker/a", b"a"),
            ("./docker/b", b"b"),
            ("./docker/c", b"c"),
        ]);
        let store = Arc::new(MemoryStore {
            fail_on: Some("docker/b".to_string()),
            ..Default::default()
        });
        let (_, progress) = collect_progress();

        let err = copy_archive(
            std::io::Cursor::new(archive),
            3,
            store.clone(),
            "registry",
            progress,
        )
        .await
        .unwrap_err();

        match err {
            MigrationError::Store(message) => assert_eq!(message, "upload of docker/b rejected"),
            other => panic!("Expected store error, got {:?}", other),
        }
        let objects = store.objects.lock().unwrap();
        assert!(objects.contains_key("registry/docker/a"));
        assert!(!objects.contains_key("registry/docker/c"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_empty_archive_reports_completion() {
        let archive = registry_archive(&[]);
        let store = Arc::new(MemoryStore::default());
        let (reports, progress) = collect_progress();

        let uploaded = copy_archive(
            std::io::Cursor::new(archive),
            0,
            store.clone(),
            "registry",
            progress,
        )
        .await
        .unwrap();

        assert_eq!(uploaded, 0);
        assert_eq!(*reports.lock().unwrap(), vec![100]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_entries_stream_in_bounded_chunks() {
        let big = vec![3u8; 3 * 1024 * 1024 + 17];
        let archive = registry_archive(&[("./docker/layer", big.as_slice())]);
        let store = Arc::new(MemoryStore::default());
        let (_, progress) = collect_progress();

        copy_archive(
            std::io::Cursor::new(archive),
            1,
            store.clone(),
            "registry",
            progress,
        )
        .await
        .unwrap();

        assert_eq!(store.objects.lock().unwrap()["registry/docker/layer"], big);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_header_fails_without_allocating() {
        let store = Arc::new(MemoryStore::default());
        let (reports, progress) = collect_progress();

        let err = copy_archive(
            std::io::Cursor::new(truncated_archive(1 << 46)),
            1,
            store.clone(),
            "registry",
            progress,
        )
        .await
        .unwrap_err();

        match err {
            MigrationError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("Expected unexpected EOF, got {:?}", other),
        }
        assert!(store.objects.lock().unwrap().is_empty());
        assert!(reports.lock().unwrap().is_empty());
    }
}
