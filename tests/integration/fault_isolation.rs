//! A failing or slow backend never affects the others

use std::time::{Duration, Instant};

use metrics_fanout::backends::{BackendError, FailureKind};
use metrics_fanout::config::BackendKind;
use metrics_fanout::registry::RegisteredBackend;

use crate::helpers::*;

#[tokio::test]
async fn test_one_outcome_per_backend() {
    let adapters: Vec<_> = (0..4).map(|_| MockAdapter::new(Behavior::Accept)).collect();
    let backends = adapters
        .iter()
        .enumerate()
        .map(|(i, a)| RegisteredBackend::new(format!("b{i}"), BackendKind::InfluxDb1, a.clone()))
        .collect();
    let dispatcher = dispatcher_over(backends, Duration::from_secs(5));

    let outcome = dispatcher.dispatch(numbered_records(3)).await;

    assert_eq!(outcome.len(), 4);
    assert_eq!(outcome.succeeded(), 4);
    for adapter in &adapters {
        assert_eq!(adapter.batches().len(), 1);
        assert_eq!(adapter.batches()[0].len(), 3);
    }
}

#[tokio::test]
async fn test_failed_backend_does_not_affect_others() {
    let healthy = MockAdapter::new(Behavior::Accept);
    let broken = MockAdapter::new(Behavior::Fail(|| {
        BackendError::Authentication("HTTP 401: unauthorized".to_string())
    }));
    let dispatcher = dispatcher_over(
        vec![
            RegisteredBackend::new("broken", BackendKind::InfluxDb2, broken),
            RegisteredBackend::new("healthy", BackendKind::QuestDb, healthy.clone()),
        ],
        Duration::from_secs(5),
    );

    let outcome = dispatcher.dispatch(vec![tautulli_record(3)]).await;

    assert_eq!(outcome.succeeded(), 1);
    assert!(!outcome.all_failed());
    let failure = outcome.get("broken").unwrap().result.as_ref().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Authentication);
    assert!(!failure.kind.is_transient());
    assert_eq!(outcome.get("healthy").unwrap().result.as_ref().unwrap().written, 1);
    assert_eq!(healthy.batches()[0], vec![tautulli_record(3)]);
}

#[tokio::test]
async fn test_slow_backend_times_out_without_blocking() {
    let fast = MockAdapter::new(Behavior::Accept);
    let slow = MockAdapter::new(Behavior::Delay(Duration::from_secs(30)));
    let dispatcher = dispatcher_over(
        vec![
            RegisteredBackend::new("slow", BackendKind::VictoriaMetrics, slow),
            RegisteredBackend::new("fast", BackendKind::InfluxDb1, fast),
        ],
        Duration::from_millis(200),
    );

    let started = Instant::now();
    let outcome = dispatcher.dispatch(numbered_records(2)).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    let failure = outcome.get("slow").unwrap().result.as_ref().unwrap_err();
    assert_eq!(failure.kind, FailureKind::Timeout);
    assert!(failure.kind.is_transient());
    assert!(outcome.get("fast").unwrap().result.is_ok());
}

#[tokio::test]
async fn test_backends_written_concurrently() {
    let backends = (0..3)
        .map(|i| {
            RegisteredBackend::new(
                format!("slow{i}"),
                BackendKind::InfluxDb1,
                MockAdapter::new(Behavior::Delay(Duration::from_millis(500))),
            )
        })
        .collect();
    let dispatcher = dispatcher_over(backends, Duration::from_secs(5));

    let started = Instant::now();
    let outcome = dispatcher.dispatch(numbered_records(1)).await;
    let elapsed = started.elapsed();

    assert_eq!(outcome.succeeded(), 3);
    assert!(elapsed >= Duration::from_millis(500));
    assert!(
        elapsed < Duration::from_millis(1200),
        "dispatch took {elapsed:?}, writes ran one after another"
    );
}

#[tokio::test]
async fn test_every_backend_failing_is_reported() {
    let dispatcher = dispatcher_over(
        vec![
            RegisteredBackend::new(
                "a",
                BackendKind::InfluxDb1,
                MockAdapter::new(Behavior::Fail(|| {
                    BackendError::Connectivity("connection refused".to_string())
                })),
            ),
            RegisteredBackend::new(
                "b",
                BackendKind::Timescale,
                MockAdapter::new(Behavior::Fail(|| BackendError::Schema("denied".to_string()))),
            ),
        ],
        Duration::from_secs(5),
    );

    let outcome = dispatcher.dispatch(numbered_records(1)).await;

    assert!(outcome.all_failed());
    let kinds: Vec<_> = outcome.failures().map(|(_, f)| f.kind).collect();
    assert_eq!(kinds, vec![FailureKind::Connectivity, FailureKind::Schema]);
}

#[tokio::test]
async fn test_batches_reach_each_backend_in_order() {
    let adapter = MockAdapter::new(Behavior::Accept);
    let dispatcher = dispatcher_over(
        vec![RegisteredBackend::new("ordered", BackendKind::InfluxDb1, adapter.clone())],
        Duration::from_secs(5),
    );

    for i in 0..5 {
        dispatcher.dispatch(vec![tautulli_record(i)]).await;
    }

    let seen: Vec<_> = adapter
        .batches()
        .iter()
        .map(|b| b[0].fields["stream_count"].clone())
        .collect();
    let expected: Vec<_> = (0..5).map(metrics_fanout::FieldValue::Integer).collect();
    assert_eq!(seen, expected);
}
