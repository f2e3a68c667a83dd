mod common;

use bytes::Bytes;
use common::{FailingStorage, RecordingSink};
use metrics_reporter::buffer::{Batch, FlushTrigger};
use metrics_reporter::domain::{Event, ReportingState, UploadOptions, UploadSource, WireRecord};
use metrics_reporter::reliability::{RetryConfig, RetryPolicy};
use metrics_reporter::sender::{ContextSlot, EventWriter, MetricsWriter};
use metrics_reporter::upload::{LocalStorage, StorageBackend, UploadCoordinator};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;

fn writer(storage: Arc<dyn StorageBackend>, sink: Arc<RecordingSink>) -> EventWriter {
    let uploads = UploadCoordinator::new(storage, RetryPolicy::new(RetryConfig::immediate()), 4);
    EventWriter::new(uploads, sink, None, ContextSlot::default())
}

fn stream_event(state: &ReportingState, metric: &str, options: UploadOptions) -> Event {
    Event::media(
        state,
        metric,
        "clip",
        0,
        UploadSource::Stream(Bytes::from_static(b"payload")),
        UploadOptions {
            override_filename_ext: Some(".bin".to_string()),
            ..options
        },
    )
    .unwrap()
}

#[tokio::test]
async fn test_exhausted_retry_budget_is_recorded_on_event() {
    let storage = Arc::new(FailingStorage::default());
    let sink = Arc::new(RecordingSink::default());
    let writer = writer(storage.clone(), sink.clone());
    let state = ReportingState::default();

    let mut batch = Batch::new(
        vec![
            stream_event(&state, "media", UploadOptions::default()),
            Event::scalar(&state, "loss", "train", 0.5, 1).unwrap(),
        ],
        FlushTrigger::Explicit,
    );
    let summary = writer
        .write_batch(&mut batch, Some("https://storage.invalid/bucket"))
        .await
        .unwrap();

    assert_eq!(storage.attempts.load(Ordering::SeqCst), 3);
    assert_eq!(summary.uploads_failed, 1);
    let exception = batch.events()[0].upload_exception().unwrap();
    assert!(exception.contains("after 3 attempts"), "{exception}");

    // the rest of the batch still goes out
    let records = sink.records();
    assert_eq!(records.len(), 2);
    assert!(matches!(&records[0], WireRecord::Image { url: None, .. }));
    assert!(matches!(&records[1], WireRecord::Scalar { value, .. } if *value == 0.5));
}

#[tokio::test]
async fn test_failed_upload_is_not_repeated_on_retry() {
    let storage = Arc::new(FailingStorage::default());
    let sink = Arc::new(RecordingSink::default());
    let writer = writer(storage.clone(), sink.clone());
    let state = ReportingState::default();

    let mut batch = Batch::new(
        vec![stream_event(&state, "media", UploadOptions::default())],
        FlushTrigger::Explicit,
    );
    writer
        .write_batch(&mut batch, Some("https://storage.invalid"))
        .await
        .unwrap();
    writer
        .write_batch(&mut batch, Some("https://storage.invalid"))
        .await
        .unwrap();
    assert_eq!(storage.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_missing_local_file_is_not_retried() {
    let storage = Arc::new(FailingStorage::default());
    let sink = Arc::new(RecordingSink::default());
    let writer = writer(storage.clone(), sink.clone());
    let state = ReportingState::default();

    let event = Event::image(
        &state,
        "img",
        "val",
        0,
        UploadSource::LocalPath("/definitely/not/here.png".into()),
        UploadOptions::default(),
    )
    .unwrap();
    let mut batch = Batch::new(vec![event], FlushTrigger::Explicit);
    writer.write_batch(&mut batch, Some("/tmp")).await.unwrap();

    assert_eq!(storage.attempts.load(Ordering::SeqCst), 0);
    assert!(batch.events()[0].upload_exception().is_some());
}

#[tokio::test]
async fn test_local_file_is_uploaded_and_deleted() {
    let source_dir = tempfile::tempdir().unwrap();
    let storage_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("frame.raw.png");
    std::fs::write(&source, b"png-bytes").unwrap();

    let sink = Arc::new(RecordingSink::default());
    let writer = writer(Arc::new(LocalStorage), sink.clone());
    let state = ReportingState::default();

    let event = Event::image(
        &state,
        "frames",
        "cam 1",
        3,
        UploadSource::LocalPath(source.clone()),
        UploadOptions {
            delete_after_upload: true,
            ..Default::default()
        },
    )
    .unwrap();
    let mut batch = Batch::new(vec![event], FlushTrigger::Explicit);
    let storage_uri = storage_dir.path().display().to_string();
    writer
        .write_batch(&mut batch, Some(&storage_uri))
        .await
        .unwrap();

    assert!(!source.exists());
    let upload = batch.events()[0].upload().unwrap();
    assert_eq!(upload.key(), Some("frames/cam 1/frames_cam 1_00000000.raw.png"));
    let uploaded = std::path::Path::new(upload.url().unwrap());
    assert_eq!(std::fs::read(uploaded).unwrap(), b"png-bytes");
}

#[tokio::test]
async fn test_file_names_rotate_within_history() {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage_uri = storage_dir.path().display().to_string();
    let sink = Arc::new(RecordingSink::default());
    let writer = writer(Arc::new(LocalStorage), sink.clone());
    let state = ReportingState::default();

    let events = (0..12)
        .map(|_| {
            stream_event(
                &state,
                "media",
                UploadOptions {
                    file_history_size: Some(5),
                    ..Default::default()
                },
            )
        })
        .collect();
    let mut batch = Batch::new(events, FlushTrigger::Explicit);
    writer
        .write_batch(&mut batch, Some(&storage_uri))
        .await
        .unwrap();

    let keys: HashSet<_> = batch
        .events()
        .iter()
        .filter_map(|e| e.upload().and_then(|u| u.key()).map(str::to_string))
        .collect();
    assert_eq!(keys.len(), 5);
    assert!(keys.contains("media/clip/media_clip_00000004.bin"));
}

#[tokio::test]
async fn test_array_images_are_encoded_before_upload() {
    let storage_dir = tempfile::tempdir().unwrap();
    let storage_uri = storage_dir.path().display().to_string();
    let sink = Arc::new(RecordingSink::default());
    let writer = writer(Arc::new(LocalStorage), sink.clone());
    let state = ReportingState::default();

    let pixels = ndarray::ArrayD::<f32>::from_elem(ndarray::IxDyn(&[8, 8]), 0.5);
    let event = Event::image(
        &state,
        "masks",
        "val",
        0,
        UploadSource::Array(pixels.into()),
        UploadOptions::default(),
    )
    .unwrap();
    let mut batch = Batch::new(vec![event], FlushTrigger::Explicit);
    writer
        .write_batch(&mut batch, Some(&storage_uri))
        .await
        .unwrap();

    let url = batch.events()[0].upload().unwrap().url().unwrap().to_string();
    assert!(url.ends_with("masks/val/masks_val_00000000.jpeg"));
    let decoded = image::open(&url).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (8, 8));
}
