fn main() {
    println!("Run `cargo test -p merge-scenarios` to execute the end-to-end merge scenarios.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::Stream;
    use tempfile::TempDir;

    use chunkmerge_protocol::{ChunkMetadata, MergeStatus, UploadAck};
    use chunkmerge_transfer::{
        ChunkStore, MergeOutcome, MergeRegistry, MergeTarget, RetryPolicy, TransferError,
        sha256_hex,
    };
    use chunkmerge_upload_server::multipart::form_body;
    use chunkmerge_upload_server::{
        CoordinatorConfig, MergeDispatch, UploadCoordinator, UploadError,
    };

    const BOUNDARY: &str = "----scenario-boundary";

    fn content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    fn stream(
        file_name: &str,
        data: &[u8],
    ) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + use<> {
        let raw = form_body(BOUNDARY, &[(file_name, data)]);
        let pieces: Vec<Result<Bytes, std::io::Error>> = raw
            .chunks(64)
            .map(|piece| Ok(Bytes::copy_from_slice(piece)))
            .collect();
        futures_util::stream::iter(pieces)
    }

    async fn upload(
        coord: &UploadCoordinator,
        name: &str,
        part: u32,
        chunks: u32,
        data: &[u8],
    ) -> Result<UploadAck, UploadError> {
        let meta = ChunkMetadata {
            file_name: name.to_string(),
            part_number: part,
            chunks,
            size: data.len() as u32,
            ..Default::default()
        };
        coord
            .on_chunk_received(meta, Some(&content_type()), stream(name, data))
            .await
    }

    fn chunk_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".partNumber-"))
            .collect();
        names.sort();
        names
    }

    /// Deterministic pseudo-random bytes.
    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[tokio::test]
    async fn greeting_assembles_after_out_of_order_arrival() {
        let dir = TempDir::new().unwrap();
        let coord = UploadCoordinator::new(
            CoordinatorConfig::new(dir.path()),
            Arc::new(MergeRegistry::new()),
        );
        let store = ChunkStore::new(dir.path());

        // Part 2 lands first, part 1 second; the merge follows both.
        store
            .write("greeting.txt", 2, &mut &b"World"[..], 16)
            .await
            .unwrap();
        store
            .write("greeting.txt", 1, &mut &b"Hello, "[..], 16)
            .await
            .unwrap();

        let outcome = coord
            .merge(MergeTarget::new("greeting.txt").with_expected_chunks(2))
            .await
            .unwrap();

        let MergeOutcome::Merged(report) = outcome else {
            panic!("expected a merge");
        };
        assert_eq!(report.parts, vec![1, 2]);
        assert_eq!(fs::read(dir.path().join("greeting.txt")).unwrap(), b"Hello, World");
        assert!(chunk_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn upload_flow_acknowledges_every_chunk() {
        let dir = TempDir::new().unwrap();
        let coord = UploadCoordinator::new(
            CoordinatorConfig::new(dir.path()),
            Arc::new(MergeRegistry::new()),
        );

        let first = upload(&coord, "greeting.txt", 1, 2, b"Hello, ").await.unwrap();
        assert_eq!(first.merge, MergeStatus::NotTriggered);

        let last = upload(&coord, "greeting.txt", 2, 2, b"World").await.unwrap();
        let json = serde_json::to_value(&last).unwrap();
        assert_eq!(json["fileName"], "greeting.txt");
        assert_eq!(json["partNumber"], 2);
        assert_eq!(json["merge"]["status"], "completed");
        assert_eq!(json["merge"]["bytes"], 12);
        assert_eq!(json["merge"]["sha256"], sha256_hex(b"Hello, World"));
    }

    #[tokio::test]
    async fn shuffled_arrival_merges_in_part_order() {
        let dir = TempDir::new().unwrap();
        let coord = UploadCoordinator::new(
            CoordinatorConfig::new(dir.path()),
            Arc::new(MergeRegistry::new()),
        );

        let parts: Vec<Vec<u8>> = (1..=12).map(|n| payload(1000 + n * 37, n as u8)).collect();
        // Everything except the final chunk, in a scrambled order.
        for n in [7u32, 3, 11, 1, 9, 5, 2, 10, 4, 8, 6] {
            let ack = upload(&coord, "video.bin", n, 12, &parts[n as usize - 1])
                .await
                .unwrap();
            assert_eq!(ack.merge, MergeStatus::NotTriggered);
        }
        let ack = upload(&coord, "video.bin", 12, 12, &parts[11]).await.unwrap();

        let expected: Vec<u8> = parts.concat();
        match ack.merge {
            MergeStatus::Completed { parts, bytes, .. } => {
                assert_eq!(parts, (1..=12).collect::<Vec<u32>>());
                assert_eq!(bytes, expected.len() as u64);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(fs::read(dir.path().join("video.bin")).unwrap(), expected);
        assert!(chunk_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unrelated_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("base.partNumber-1"), b"one|").unwrap();
        fs::write(dir.path().join("base.partNumber-2"), b"two").unwrap();
        fs::write(dir.path().join("base.partNumber-abc"), b"junk").unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"keep me").unwrap();

        let coord = UploadCoordinator::new(
            CoordinatorConfig::new(dir.path()),
            Arc::new(MergeRegistry::new()),
        );
        let outcome = coord.merge(MergeTarget::new("base")).await.unwrap();

        let MergeOutcome::Merged(report) = outcome else {
            panic!("expected a merge");
        };
        assert_eq!(report.parts, vec![1, 2]);
        assert_eq!(fs::read(dir.path().join("base")).unwrap(), b"one|two");
        // Only decodable chunks are cleaned up.
        assert!(dir.path().join("base.partNumber-abc").exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[tokio::test]
    async fn cleanup_leaves_no_chunks_and_sizes_add_up() {
        let dir = TempDir::new().unwrap();
        let chunk_dir = dir.path().join("chunks");
        let mut config = CoordinatorConfig::new(&chunk_dir);
        config.output_dir = Some(dir.path().join("merged"));
        let coord = UploadCoordinator::new(config, Arc::new(MergeRegistry::new()));

        let sizes = [4096usize, 1, 70_000, 333];
        for (i, len) in sizes.iter().enumerate() {
            let part = i as u32 + 1;
            upload(&coord, "nested/data.bin", part, 4, &payload(*len, i as u8))
                .await
                .unwrap();
        }

        let merged = dir.path().join("merged/nested/data.bin");
        assert_eq!(
            fs::metadata(&merged).unwrap().len(),
            sizes.iter().sum::<usize>() as u64
        );
        assert!(chunk_files(&chunk_dir.join("nested")).is_empty());
        assert!(coord.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_chunk_merges_partially_by_default() {
        let dir = TempDir::new().unwrap();
        let coord = UploadCoordinator::new(
            CoordinatorConfig::new(dir.path()),
            Arc::new(MergeRegistry::new()),
        );

        let ack = upload(&coord, "pair.bin", 2, 2, b"second").await.unwrap();
        assert!(matches!(ack.merge, MergeStatus::Completed { bytes: 6, .. }));
        assert_eq!(fs::read(dir.path().join("pair.bin")).unwrap(), b"second");
    }

    #[tokio::test]
    async fn missing_chunk_is_refused_when_completeness_is_required() {
        let dir = TempDir::new().unwrap();
        let mut config = CoordinatorConfig::new(dir.path());
        config.merge.require_complete = true;
        let coord = UploadCoordinator::new(config, Arc::new(MergeRegistry::new()));

        let err = upload(&coord, "pair.bin", 2, 2, b"second").await.unwrap_err();
        match err {
            UploadError::Transfer(TransferError::Incomplete { missing, .. }) => {
                assert_eq!(missing, vec![1]);
            }
            other => panic!("expected Incomplete, got {other:?}"),
        }
        assert_eq!(chunk_files(dir.path()), vec!["pair.bin.partNumber-2"]);

        // The late chunk completes the set and the merge goes through.
        upload(&coord, "pair.bin", 1, 2, b"first|").await.unwrap();
        let ack = upload(&coord, "pair.bin", 2, 2, b"second").await.unwrap();
        assert!(matches!(ack.merge, MergeStatus::Completed { bytes: 12, .. }));
    }

    #[tokio::test]
    async fn reupload_replaces_previous_attempt() {
        let dir = TempDir::new().unwrap();
        let coord = UploadCoordinator::new(
            CoordinatorConfig::new(dir.path()),
            Arc::new(MergeRegistry::new()),
        );

        upload(&coord, "doc.txt", 1, 2, b"a much longer first attempt").await.unwrap();
        upload(&coord, "doc.txt", 1, 2, b"retry|").await.unwrap();
        upload(&coord, "doc.txt", 2, 2, b"end").await.unwrap();

        assert_eq!(fs::read(dir.path().join("doc.txt")).unwrap(), b"retry|end");
    }

    #[tokio::test]
    async fn bad_content_type_never_touches_disk() {
        let dir = TempDir::new().unwrap();
        let chunk_dir = dir.path().join("chunks");
        let coord = UploadCoordinator::new(
            CoordinatorConfig::new(&chunk_dir),
            Arc::new(MergeRegistry::new()),
        );
        let meta = ChunkMetadata {
            file_name: "x.bin".into(),
            part_number: 1,
            chunks: 1,
            ..Default::default()
        };

        let err = coord
            .on_chunk_received(meta, Some("text/plain"), stream("x.bin", b"data"))
            .await
            .unwrap_err();
        assert_eq!(err.to_response().code, 400);
        assert!(!chunk_dir.exists());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_merges_are_mutually_exclusive() {
        let dir = TempDir::new().unwrap();
        let late = dir.path().join("late-chunk");
        fs::write(dir.path().join("shared.bin.partNumber-1"), b"left|").unwrap();
        std::os::unix::fs::symlink(&late, dir.path().join("shared.bin.partNumber-2")).unwrap();

        let registry = Arc::new(MergeRegistry::new());
        let mut config = CoordinatorConfig::new(dir.path());
        config.merge.retry =
            RetryPolicy::new(400, Duration::from_millis(5), Duration::from_millis(5));
        // Two coordinators sharing one registry, as two request handlers would.
        let a = Arc::new(UploadCoordinator::new(config.clone(), Arc::clone(&registry)));
        let b = UploadCoordinator::new(config, Arc::clone(&registry));

        let running = {
            let a = Arc::clone(&a);
            tokio::spawn(async move { a.merge(MergeTarget::new("shared.bin")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let err = b.merge(MergeTarget::new("shared.bin")).await.unwrap_err();
        assert!(matches!(err, UploadError::MergeConflict(_)));
        // The loser did not remove anything.
        assert_eq!(chunk_files(dir.path()).len(), 2);

        let staging = late.with_extension("staging");
        fs::write(&staging, b"right").unwrap();
        fs::rename(&staging, &late).unwrap();

        let outcome = running.await.unwrap().unwrap();
        assert!(matches!(outcome, MergeOutcome::Merged(_)));
        assert_eq!(fs::read(dir.path().join("shared.bin")).unwrap(), b"left|right");
        assert!(registry.in_flight().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unreadable_chunk_keeps_chunks_for_retry() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("broken.bin.partNumber-1"), b"ok").unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("nowhere"),
            dir.path().join("broken.bin.partNumber-2"),
        )
        .unwrap();

        let mut config = CoordinatorConfig::new(dir.path());
        config.merge.retry = RetryPolicy::immediate(2);
        let coord = UploadCoordinator::new(config, Arc::new(MergeRegistry::new()));

        let err = coord.merge(MergeTarget::new("broken.bin")).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(matches!(
            err,
            UploadError::Transfer(TransferError::MergeFailed { part: 2, attempts: 2, .. })
        ));
        assert!(!dir.path().join("broken.bin").exists());
        assert_eq!(chunk_files(dir.path()).len(), 2);
    }

    #[tokio::test]
    async fn background_merge_finishes_on_drain() {
        let dir = TempDir::new().unwrap();
        let mut config = CoordinatorConfig::new(dir.path());
        config.dispatch = MergeDispatch::Background;
        let coord = UploadCoordinator::new(config, Arc::new(MergeRegistry::new()));

        upload(&coord, "bg.bin", 1, 2, b"back").await.unwrap();
        let ack = upload(&coord, "bg.bin", 2, 2, b"ground").await.unwrap();
        assert_eq!(ack.merge, MergeStatus::Scheduled);

        coord.drain().await;
        assert_eq!(fs::read(dir.path().join("bg.bin")).unwrap(), b"background");
    }
}
