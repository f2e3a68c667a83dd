mod common;

use common::RecordingSink;
use metrics_reporter::domain::{ConsoleLevel, NonFinite, WireRecord};
use metrics_reporter::reporter::{ImageUpload, MediaUpload, ReportError};
use metrics_reporter::upload::LocalStorage;
use metrics_reporter::{DispatchMode, JobContext, Reporter, ReporterConfig};
use ndarray::{ArrayD, IxDyn};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn config(storage_uri: Option<String>) -> ReporterConfig {
    ReporterConfig {
        flush_period: Duration::from_secs(3600),
        storage_uri,
        ..Default::default()
    }
}

fn start(config: ReporterConfig, sink: Arc<RecordingSink>) -> Reporter {
    Reporter::builder(config)
        .sink(sink)
        .storage(Arc::new(LocalStorage))
        .start()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_flush_wait_delivers_reports_in_order() {
    let sink = Arc::new(RecordingSink::default());
    let reporter = start(config(None), sink.clone());

    reporter.report_scalar("loss", "train", 0.9, 0).unwrap();
    reporter.report_vector("weights", "layer1", &[1.0, 2.0], 0).unwrap();
    reporter
        .report_plot("roc", "val", r#"{"data":[]}"#, 0, None, true)
        .unwrap();
    assert!(reporter.flush(true, WAIT).await);
    assert!(!reporter.events_waiting());

    let types: Vec<_> = sink.records().iter().map(WireRecord::event_type).collect();
    assert_eq!(types, vec!["training_stats_scalar", "training_stats_vector", "plot"]);
    reporter.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn test_nan_warning_cadence() {
    let sink = Arc::new(RecordingSink::default());
    let reporter = start(config(None), sink.clone());
    reporter.set_reporting_nan_value(-1.0, 3);

    for i in 0..7 {
        reporter.report_scalar("loss", "train", f64::NAN, i).unwrap();
    }
    reporter.stop().await;

    assert_eq!(reporter.state().sanitizer.warnings(NonFinite::Nan), 3);
    assert_eq!(reporter.state().sanitizer.occurrences(NonFinite::Nan), 7);
    logs_assert(|lines: &[&str]| {
        let warnings = lines
            .iter()
            .filter(|line| line.contains("NaN value encountered, reporting it as -1"))
            .count();
        if warnings == 3 {
            Ok(())
        } else {
            Err(format!("expected 3 NaN warnings, got {warnings}"))
        }
    });

    let records = sink.records();
    assert_eq!(records.len(), 7);
    assert!(
        records
            .iter()
            .all(|r| matches!(r, WireRecord::Scalar { value, .. } if *value == -1.0))
    );
}

#[tokio::test]
async fn test_path_and_image_together_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let reporter = start(config(Some(dir.path().display().to_string())), sink.clone());

    let result = reporter.report_image_and_upload(
        "img",
        "val",
        0,
        ImageUpload {
            path: Some(dir.path().join("a.png")),
            image: Some(ArrayD::<u8>::zeros(IxDyn(&[2, 2])).into()),
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(ReportError::ExclusiveArguments(_))));
    assert!(!reporter.events_waiting());

    let result = reporter.report_image_plot_and_upload("img", "val", 0, ImageUpload::default());
    assert!(matches!(result, Err(ReportError::ExclusiveArguments(_))));

    reporter.stop().await;
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn test_invalid_image_shape_fails_at_report_time() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = start(
        config(Some(dir.path().display().to_string())),
        Arc::default(),
    );
    let result = reporter.report_image_and_upload(
        "img",
        "val",
        0,
        ImageUpload {
            image: Some(ArrayD::<u8>::zeros(IxDyn(&[2, 2, 5])).into()),
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(ReportError::Event(_))));
    reporter.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_media_upload_patches_url_before_sending() {
    let dir = tempfile::tempdir().unwrap();
    let storage_uri = dir.path().display().to_string();
    let sink = Arc::new(RecordingSink::default());
    let reporter = start(config(Some(storage_uri.clone())), sink.clone());

    reporter
        .report_media_and_upload(
            "audio",
            "sample",
            2,
            MediaUpload {
                stream: Some(bytes::Bytes::from_static(b"RIFF")),
                file_extension: Some("wav".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(reporter.flush(true, WAIT).await);

    match &sink.records()[0] {
        WireRecord::Image { url, key, header } => {
            assert_eq!(key.as_deref(), Some("audio/sample/audio_sample_00000000.wav"));
            assert_eq!(
                url.as_deref(),
                Some(format!("{storage_uri}/audio/sample/audio_sample_00000000.wav").as_str())
            );
            assert_eq!(header.iter, Some(2));
        }
        other => panic!("unexpected record {other:?}"),
    }
    reporter.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_context_attached_later_is_applied_at_write() {
    let sink = Arc::new(RecordingSink::default());
    let reporter = start(config(None), sink.clone());

    reporter.report_scalar("acc", "val", 0.7, 5).unwrap();
    reporter.attach_context(JobContext {
        task_id: "task-42".to_string(),
        worker: Some("gpu-7".to_string()),
        iteration_offset: 1000,
    });
    reporter.report_console("epoch done", ConsoleLevel::Info).unwrap();
    assert_eq!(reporter.max_iteration(), 5);
    reporter.report_scalar("acc", "val", 0.8, 6).unwrap();
    assert!(reporter.flush(true, WAIT).await);

    let records = sink.records();
    assert_eq!(records[0].task(), Some("task-42"));
    match &records[0] {
        WireRecord::Scalar { header, .. } => assert_eq!(header.iter, Some(1005)),
        other => panic!("unexpected record {other:?}"),
    }
    match &records[1] {
        WireRecord::Log { worker, task, .. } => {
            assert_eq!(worker, "gpu-7");
            assert_eq!(task.as_deref(), Some("task-42"));
        }
        other => panic!("unexpected record {other:?}"),
    }
    assert_eq!(reporter.max_iteration(), 1006);
    reporter.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_isolated_mode_reporter_survives_worker_death() {
    let sink = Arc::new(RecordingSink::default());
    let reporter = start(
        ReporterConfig {
            dispatch_mode: DispatchMode::Isolated,
            ..config(None)
        },
        sink.clone(),
    );
    assert_eq!(reporter.mode(), Some(DispatchMode::Isolated));

    reporter.report_scalar("loss", "train", 1.0, 0).unwrap();
    assert!(reporter.flush(true, WAIT).await);
    reporter.stop().await;
    assert_eq!(sink.records().len(), 1);
    assert_eq!(reporter.mode(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_http_sink_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let reporter = Reporter::start(ReporterConfig {
        events_endpoint: Some(format!("{}/events", server.uri())),
        api_token: Some("token".to_string()),
        ..config(None)
    })
    .unwrap();
    reporter.report_scalar("loss", "train", 0.25, 10).unwrap();
    reporter.report_console("hello", ConsoleLevel::Error).unwrap();
    reporter.stop().await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body = String::from_utf8(requests[0].body.clone()).unwrap();
    let lines: Vec<serde_json::Value> = body
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(lines[0]["type"], "training_stats_scalar");
    assert_eq!(lines[0]["value"], 0.25);
    assert_eq!(lines[1]["type"], "log");
    assert_eq!(lines[1]["level"], "error");
}

#[tokio::test]
async fn test_missing_endpoint_is_a_configuration_error() {
    let result = Reporter::start(config(None));
    assert!(matches!(result, Err(ReportError::MissingEndpoint)));
}
