//! Pipeline runtime behavior: ordering, counters, batching,
//! backpressure, shutdown.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use logpipe_core::Processor;
use logpipe_engine::Pipeline;
use logpipe_proc::FilterProcessor;

use support::*;

#[tokio::test]
async fn events_reach_the_sink_in_source_order() {
    let events = (0..25).map(|n| numbered_event(n, "INFO")).collect();
    let source = StaticSource::new(events);
    let sink = CollectingSink::new();
    let collected = Arc::clone(&sink.events);

    let pipeline = Pipeline::from_parts(
        test_config("ordering", 7, 0.05),
        vec![Box::new(source)],
        vec![],
        vec![Box::new(sink)],
    );

    pipeline.start().await;
    assert!(wait_for(|| collected.lock().unwrap().len() == 25, Duration::from_secs(5)).await);
    pipeline.stop().await;

    let lines: Vec<String> = collected
        .lock()
        .unwrap()
        .iter()
        .map(|e| e.raw_data.clone())
        .collect();
    let expected: Vec<String> = (0..25).map(|n| format!("line-{}", n)).collect();
    assert_eq!(lines, expected);

    let metrics = pipeline.metrics();
    assert_eq!(metrics.events_processed.load(Ordering::SeqCst), 25);
    assert_eq!(metrics.events_dropped.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.processing_errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn filtered_events_are_absent_from_every_sink_and_counted() {
    let mut filter = FilterProcessor::new("drop-debug");
    filter
        .configure(&serde_yaml::from_str("{condition: \"level != 'DEBUG'\"}").unwrap())
        .await
        .unwrap();

    let events = vec![
        numbered_event(0, "INFO"),
        numbered_event(1, "DEBUG"),
        numbered_event(2, "WARNING"),
        numbered_event(3, "ERROR"),
        numbered_event(4, "CRITICAL"),
    ];
    let source = StaticSource::new(events);
    let first = CollectingSink::new();
    let second = CollectingSink::new();
    let first_events = Arc::clone(&first.events);
    let second_events = Arc::clone(&second.events);

    let pipeline = Pipeline::from_parts(
        test_config("filtering", 100, 0.05),
        vec![Box::new(source)],
        vec![Box::new(filter)],
        vec![Box::new(first), Box::new(second)],
    );

    pipeline.start().await;
    assert!(wait_for(|| first_events.lock().unwrap().len() == 4, Duration::from_secs(5)).await);
    pipeline.stop().await;

    for events in [first_events, second_events] {
        let levels: Vec<String> = events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.fields["level"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(levels, vec!["INFO", "WARNING", "ERROR", "CRITICAL"]);
    }

    let metrics = pipeline.metrics();
    assert_eq!(metrics.events_processed.load(Ordering::SeqCst), 4);
    assert_eq!(metrics.events_dropped.load(Ordering::SeqCst), 1);
    // A filtered event is a drop, not an error.
    assert_eq!(metrics.processing_errors.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn processor_failure_drops_and_counts_an_error() {
    let events = (0..5).map(|n| numbered_event(n, "INFO")).collect();
    let source = StaticSource::new(events);
    let processor = FailOnProcessor::new(2);
    let sink = CollectingSink::new();
    let collected = Arc::clone(&sink.events);

    let pipeline = Pipeline::from_parts(
        test_config("failures", 100, 0.05),
        vec![Box::new(source)],
        vec![Box::new(processor)],
        vec![Box::new(sink)],
    );

    pipeline.start().await;
    assert!(wait_for(|| collected.lock().unwrap().len() == 4, Duration::from_secs(5)).await);
    pipeline.stop().await;

    let metrics = pipeline.metrics();
    assert_eq!(metrics.events_processed.load(Ordering::SeqCst), 4);
    assert_eq!(metrics.events_dropped.load(Ordering::SeqCst), 1);
    assert_eq!(metrics.processing_errors.load(Ordering::SeqCst), 1);
    // processed + dropped accounts for everything that entered the chain
    assert_eq!(
        metrics.events_processed.load(Ordering::SeqCst)
            + metrics.events_dropped.load(Ordering::SeqCst),
        5
    );
}

#[tokio::test]
async fn partial_batch_flushes_on_timeout() {
    let events = (0..3).map(|n| numbered_event(n, "INFO")).collect();
    let source = TricklingSource::new(events);
    let sink = CollectingSink::new();
    let collected = Arc::clone(&sink.events);
    let writes = Arc::clone(&sink.writes);

    let pipeline = Pipeline::from_parts(
        test_config("timeout-flush", 1000, 0.2),
        vec![Box::new(source)],
        vec![],
        vec![Box::new(sink)],
    );

    pipeline.start().await;
    // The source stays open, so only the timeout can flush these.
    assert!(wait_for(|| collected.lock().unwrap().len() == 3, Duration::from_millis(500)).await);
    assert_eq!(writes.load(Ordering::SeqCst), 1);
    pipeline.stop().await;
}

#[tokio::test]
async fn zero_timeout_flushes_every_event() {
    let events = (0..3).map(|n| numbered_event(n, "INFO")).collect();
    let source = StaticSource::new(events);
    let sink = CollectingSink::new();
    let collected = Arc::clone(&sink.events);
    let writes = Arc::clone(&sink.writes);

    let pipeline = Pipeline::from_parts(
        test_config("flush-each", 1000, 0.0),
        vec![Box::new(source)],
        vec![],
        vec![Box::new(sink)],
    );

    pipeline.start().await;
    assert!(wait_for(|| collected.lock().unwrap().len() == 3, Duration::from_secs(5)).await);
    pipeline.stop().await;

    assert_eq!(writes.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn stop_releases_components_exactly_once() {
    let source = StaticSource::new(vec![numbered_event(0, "INFO")]);
    let source_released = Arc::clone(&source.released);
    let processor = FailOnProcessor::new(usize::MAX);
    let processor_released = Arc::clone(&processor.released);
    let sink = CollectingSink::new();
    let sink_released = Arc::clone(&sink.released);
    let collected = Arc::clone(&sink.events);

    let pipeline = Pipeline::from_parts(
        test_config("release-once", 10, 0.05),
        vec![Box::new(source)],
        vec![Box::new(processor)],
        vec![Box::new(sink)],
    );

    pipeline.start().await;
    assert!(wait_for(|| collected.lock().unwrap().len() == 1, Duration::from_secs(5)).await);
    pipeline.stop().await;
    pipeline.stop().await;

    assert_eq!(source_released.load(Ordering::SeqCst), 1);
    assert_eq!(processor_released.load(Ordering::SeqCst), 1);
    assert_eq!(sink_released.load(Ordering::SeqCst), 1);
    assert!(!pipeline.is_running());
}

#[tokio::test]
async fn source_yielding_nothing_stops_cleanly() {
    let source = StaticSource::new(vec![]);
    let sink = CollectingSink::new();
    let writes = Arc::clone(&sink.writes);

    let pipeline = Pipeline::from_parts(
        test_config("empty", 10, 0.05),
        vec![Box::new(source)],
        vec![],
        vec![Box::new(sink)],
    );

    pipeline.start().await;
    assert!(wait_for(|| !pipeline.is_running(), Duration::from_secs(5)).await);
    pipeline.stop().await;

    let metrics = pipeline.metrics();
    assert_eq!(metrics.events_processed.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.events_dropped.load(Ordering::SeqCst), 0);
    assert_eq!(metrics.processing_errors.load(Ordering::SeqCst), 0);
    assert_eq!(writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sink_failure_is_isolated_and_counted() {
    let events = (0..4).map(|n| numbered_event(n, "INFO")).collect();
    let source = StaticSource::new(events);
    let failing = FailingSink::new();
    let healthy = CollectingSink::new();
    let collected = Arc::clone(&healthy.events);

    let pipeline = Pipeline::from_parts(
        test_config("sink-isolation", 2, 0.05),
        vec![Box::new(source)],
        vec![],
        vec![Box::new(failing), Box::new(healthy)],
    );

    pipeline.start().await;
    assert!(wait_for(|| collected.lock().unwrap().len() == 4, Duration::from_secs(5)).await);
    pipeline.stop().await;

    let metrics = pipeline.metrics();
    // Every event still counts as processed; each failed batch write
    // is one error.
    assert_eq!(metrics.events_processed.load(Ordering::SeqCst), 4);
    assert!(metrics.processing_errors.load(Ordering::SeqCst) >= 2);
}

#[tokio::test]
async fn slow_sink_applies_backpressure_upstream() {
    let source = FirehoseSource::new();
    let emitted = Arc::clone(&source.emitted);
    let sink = SlowSink::new(Duration::from_millis(300));
    let writes = Arc::clone(&sink.writes);
    let largest = Arc::clone(&sink.largest_batch);

    let pipeline = Pipeline::from_parts(
        test_config("backpressure", 10, 0.05),
        vec![Box::new(source)],
        vec![],
        vec![Box::new(sink)],
    );

    pipeline.start().await;
    tokio::time::sleep(Duration::from_millis(650)).await;
    pipeline.stop().await;

    // Two to three writes fit in the window; the driver blocks on
    // each, so the source can only run ahead by the channel bound
    // plus one in-flight batch.
    assert!(writes.load(Ordering::SeqCst) <= 3);
    assert!(largest.load(Ordering::SeqCst) <= 10);
    assert!(
        emitted.load(Ordering::SeqCst) <= 64,
        "source ran far ahead of the sink: {}",
        emitted.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn failed_source_read_is_retried() {
    let events = vec![numbered_event(0, "INFO"), numbered_event(1, "INFO")];
    let source = FlakySource::new(events);
    let sink = CollectingSink::new();
    let collected = Arc::clone(&sink.events);

    let pipeline = Pipeline::from_parts(
        test_config("retry", 10, 0.05),
        vec![Box::new(source)],
        vec![],
        vec![Box::new(sink)],
    );

    pipeline.start().await;
    assert!(wait_for(|| collected.lock().unwrap().len() == 2, Duration::from_secs(5)).await);
    pipeline.stop().await;

    let metrics = pipeline.metrics();
    assert_eq!(metrics.events_processed.load(Ordering::SeqCst), 2);
    assert_eq!(metrics.processing_errors.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn status_reports_counts_and_uptime() {
    let events = (0..2).map(|n| numbered_event(n, "INFO")).collect();
    let source = TricklingSource::new(events);
    let sink = CollectingSink::new();
    let collected = Arc::clone(&sink.events);

    let pipeline = Pipeline::from_parts(
        test_config("status", 10, 0.05),
        vec![Box::new(source)],
        vec![Box::new(FailOnProcessor::new(usize::MAX))],
        vec![Box::new(sink)],
    );

    let before = pipeline.status();
    assert!(!before.running);
    assert_eq!(before.sources, 1);
    assert_eq!(before.processors, 1);
    assert_eq!(before.sinks, 1);
    assert_eq!(before.uptime_seconds, 0.0);

    pipeline.start().await;
    assert!(wait_for(|| collected.lock().unwrap().len() == 2, Duration::from_secs(5)).await);
    let during = pipeline.status();
    assert!(during.running);
    assert!(during.uptime_seconds > 0.0);
    assert_eq!(during.events_processed, 2);

    pipeline.stop().await;
    let after = pipeline.status();
    assert!(!after.running);
    assert_eq!(after.uptime_seconds, 0.0);
}
