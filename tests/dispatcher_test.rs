mod common;

use common::{RecordingWriter, plot};
use metrics_reporter::dispatch::{
    BackgroundDispatcher, DispatchMode, DispatchOptions, DispatcherState,
};
use metrics_reporter::{Reporter, ReporterConfig};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing_test::traced_test;

const LONG_POLL: Duration = Duration::from_secs(3600);

fn options(mode: DispatchMode, flush_threshold: usize) -> DispatchOptions {
    DispatchOptions {
        mode,
        poll_interval: LONG_POLL,
        flush_threshold,
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_events_are_written_in_enqueue_order() {
    let writer = Arc::new(RecordingWriter::default());
    let dispatcher =
        BackgroundDispatcher::start(writer.clone(), options(DispatchMode::Thread, 100)).unwrap();

    for name in ["e1", "e2", "e3"] {
        dispatcher.add_event(plot(name)).unwrap();
    }
    assert!(dispatcher.wait_for_events(Some(Duration::from_secs(5))).await);
    assert_eq!(writer.written(), vec!["e1", "e2", "e3"]);

    dispatcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_threshold_triggers_flush_without_timer() {
    let writer = Arc::new(RecordingWriter::default());
    let dispatcher =
        BackgroundDispatcher::start(writer.clone(), options(DispatchMode::Thread, 3)).unwrap();

    for name in ["a", "b", "c"] {
        dispatcher.add_event(plot(name)).unwrap();
    }
    assert!(writer.wait_for(3, Duration::from_secs(5)).await);
    assert_eq!(writer.written(), vec!["a", "b", "c"]);

    dispatcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_below_threshold_waits_for_timer() {
    let writer = Arc::new(RecordingWriter::default());
    let dispatcher =
        BackgroundDispatcher::start(writer.clone(), options(DispatchMode::Thread, 3)).unwrap();

    dispatcher.add_event(plot("a")).unwrap();
    assert!(!writer.wait_for(1, Duration::from_millis(200)).await);
    assert!(dispatcher.events_waiting());

    dispatcher.stop().await;
    assert_eq!(writer.written(), vec!["a"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_delivers_everything_and_is_idempotent() {
    for mode in [DispatchMode::Thread, DispatchMode::Isolated] {
        let writer = Arc::new(RecordingWriter::default());
        let dispatcher = BackgroundDispatcher::start(writer.clone(), options(mode, 100)).unwrap();

        for i in 0..5 {
            dispatcher.add_event(plot(&format!("e{i}"))).unwrap();
        }
        dispatcher.stop().await;
        assert_eq!(writer.written(), vec!["e0", "e1", "e2", "e3", "e4"]);
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert!(!dispatcher.is_alive());

        dispatcher.stop().await;
        assert_eq!(writer.written().len(), 5);
        assert_eq!(dispatcher.stats().events_written, 5);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn test_dead_isolated_worker_hands_off_to_thread() {
    let writer = Arc::new(RecordingWriter::default());
    let dispatcher =
        BackgroundDispatcher::start(writer.clone(), options(DispatchMode::Isolated, 100)).unwrap();
    assert_eq!(dispatcher.mode(), DispatchMode::Isolated);

    // queued but never dequeued by the isolated worker
    dispatcher.add_event(plot("queued-1")).unwrap();
    dispatcher.add_event(plot("queued-2")).unwrap();

    dispatcher.terminate_worker().await;
    assert!(!dispatcher.is_alive());

    dispatcher.add_event(plot("x")).unwrap();
    assert_eq!(dispatcher.mode(), DispatchMode::Thread);
    assert_eq!(dispatcher.state(), DispatcherState::Running(DispatchMode::Thread));
    assert_eq!(dispatcher.mode_switches(), 1);

    dispatcher.add_event(plot("y")).unwrap();
    assert!(dispatcher.wait_for_events(Some(Duration::from_secs(5))).await);
    assert_eq!(writer.written(), vec!["queued-1", "queued-2", "x", "y"]);
    assert_eq!(dispatcher.mode_switches(), 1);

    logs_assert(|lines: &[&str]| {
        let switches = lines
            .iter()
            .filter(|line| line.contains("switching to thread based reporting"))
            .count();
        if switches == 1 {
            Ok(())
        } else {
            Err(format!("expected one switch warning, got {switches}"))
        }
    });

    dispatcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_writer_panic_in_isolated_worker_is_survived() {
    let writer = Arc::new(RecordingWriter::default());
    writer.panic_on_write.store(true, Ordering::SeqCst);
    let dispatcher =
        BackgroundDispatcher::start(writer.clone(), options(DispatchMode::Isolated, 100)).unwrap();

    // lost together with the worker: it was already dequeued
    dispatcher.add_event(plot("in-flight")).unwrap();
    assert!(!dispatcher.wait_for_events(Some(Duration::from_secs(5))).await);
    assert!(!dispatcher.is_alive());

    dispatcher.add_event(plot("after")).unwrap();
    assert!(dispatcher.wait_for_events(Some(Duration::from_secs(5))).await);
    assert_eq!(writer.written(), vec!["after"]);
    assert_eq!(dispatcher.mode(), DispatchMode::Thread);
    assert_eq!(dispatcher.mode_switches(), 1);

    dispatcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_after_worker_death_flushes_orphaned_queue() {
    let writer = Arc::new(RecordingWriter::default());
    let dispatcher =
        BackgroundDispatcher::start(writer.clone(), options(DispatchMode::Isolated, 100)).unwrap();

    dispatcher.add_event(plot("orphan")).unwrap();
    dispatcher.terminate_worker().await;
    dispatcher.stop().await;

    assert_eq!(writer.written(), vec!["orphan"]);
    assert_eq!(dispatcher.mode_switches(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_mode_writes_before_signalling_empty() {
    let writer = Arc::new(RecordingWriter::default());
    let dispatcher = BackgroundDispatcher::start(
        writer.clone(),
        DispatchOptions {
            async_enable: true,
            ..options(DispatchMode::Thread, 100)
        },
    )
    .unwrap();

    dispatcher.add_event(plot("a")).unwrap();
    dispatcher.add_event(plot("b")).unwrap();
    assert!(dispatcher.wait_for_events(Some(Duration::from_secs(5))).await);
    assert_eq!(writer.written(), vec!["a", "b"]);
    assert!(!dispatcher.events_waiting());
    assert_eq!(dispatcher.stats().async_results, 1);

    dispatcher.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_producers_lose_nothing() {
    let writer = Arc::new(RecordingWriter::default());
    let dispatcher = Arc::new(
        BackgroundDispatcher::start(writer.clone(), options(DispatchMode::Thread, 16)).unwrap(),
    );

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                for i in 0..50 {
                    dispatcher.add_event(plot(&format!("p{p}-{i}"))).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.await.unwrap();
    }
    dispatcher.stop().await;

    let written = writer.written();
    assert_eq!(written.len(), 200);
    for p in 0..4 {
        let own: Vec<_> = written
            .iter()
            .filter(|name| name.starts_with(&format!("p{p}-")))
            .cloned()
            .collect();
        let expected: Vec<_> = (0..50).map(|i| format!("p{p}-{i}")).collect();
        assert_eq!(own, expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_dispatcher_still_drains() {
    for mode in [DispatchMode::Thread, DispatchMode::Isolated] {
        let writer = Arc::new(RecordingWriter::default());
        let dispatcher = BackgroundDispatcher::start(writer.clone(), options(mode, 100)).unwrap();

        dispatcher.add_event(plot("a")).unwrap();
        dispatcher.add_event(plot("b")).unwrap();
        drop(dispatcher);

        assert!(writer.wait_for(2, Duration::from_secs(5)).await, "{mode} worker lost its queue");
        assert_eq!(writer.written(), vec!["a", "b"]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_dispatcher_writes_orphaned_queue() {
    let writer = Arc::new(RecordingWriter::default());
    let dispatcher =
        BackgroundDispatcher::start(writer.clone(), options(DispatchMode::Isolated, 100)).unwrap();

    dispatcher.add_event(plot("orphan")).unwrap();
    dispatcher.terminate_worker().await;
    drop(dispatcher);

    assert!(writer.wait_for(1, Duration::from_secs(5)).await);
    assert_eq!(writer.written(), vec!["orphan"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reporter_dropped_without_stop_delivers_reports() {
    for mode in [DispatchMode::Thread, DispatchMode::Isolated] {
        let writer = Arc::new(RecordingWriter::default());
        let reporter = Reporter::builder(ReporterConfig {
            dispatch_mode: mode,
            flush_period: LONG_POLL,
            ..Default::default()
        })
        .writer(writer.clone())
        .start()
        .unwrap();

        reporter.report_scalar("loss", "train", 0.5, 0).unwrap();
        drop(reporter);

        assert!(writer.wait_for(1, Duration::from_secs(5)).await);
        assert_eq!(writer.written(), vec!["loss"]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_racing_hand_off_keeps_every_accepted_event() {
    for _ in 0..20 {
        let writer = Arc::new(RecordingWriter::default());
        let dispatcher = Arc::new(
            BackgroundDispatcher::start(writer.clone(), options(DispatchMode::Isolated, 100))
                .unwrap(),
        );
        dispatcher.add_event(plot("queued")).unwrap();
        dispatcher.terminate_worker().await;

        let producer = {
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                let mut accepted = 0usize;
                for i in 0..20 {
                    if dispatcher.add_event(plot(&format!("e{i}"))).is_ok() {
                        accepted += 1;
                    }
                    tokio::task::yield_now().await;
                }
                accepted
            })
        };
        dispatcher.stop().await;
        let accepted = producer.await.unwrap();

        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        assert_eq!(writer.written().len(), accepted + 1);
        assert_eq!(writer.written()[0], "queued");
    }
}
