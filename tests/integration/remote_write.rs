//! Remote-write pushes decoded on the receiving side

use metrics_fanout::backends::remote_write::proto::WriteRequest;
use metrics_fanout::backends::remote_write::RemoteWriteAdapter;
use metrics_fanout::backends::{BackendAdapter, FailureKind};
use metrics_fanout::config::BackendKind;
use metrics_fanout::MetricRecord;
use pretty_assertions::assert_eq;
use prost::Message;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn receiver(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/write"))
        .respond_with(ResponseTemplate::new(status))
        .mount(&server)
        .await;
    server
}

async fn received(server: &MockServer) -> Vec<WriteRequest> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| {
            let raw = snap::raw::Decoder::new()
                .decompress_vec(&request.body)
                .unwrap();
            WriteRequest::decode(raw.as_slice()).unwrap()
        })
        .collect()
}

fn labels(request: &WriteRequest, series: usize) -> Vec<(String, String)> {
    request.timeseries[series]
        .labels
        .iter()
        .map(|l| (l.name.clone(), l.value.clone()))
        .collect()
}

#[tokio::test]
async fn test_push_decodes_to_one_series_per_numeric_field() {
    let server = receiver(204).await;
    let adapter =
        RemoteWriteAdapter::new(&config_for(&server, BackendKind::RemoteWrite, "prom")).unwrap();

    let record = MetricRecord::new("Tautulli")
        .tag("server", "1")
        .tag("player-name", "tv")
        .field("stream_count", 3)
        .field("transcoding", true)
        .field("title", "Movie")
        .at(sample_time());

    let report = adapter.write(&[record]).await.unwrap();
    assert_eq!(report.written, 1);
    assert_eq!(report.dropped_values, 1);

    let requests = received(&server).await;
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.timeseries.len(), 2);

    assert_eq!(
        labels(request, 0),
        vec![
            ("__name__".to_string(), "Tautulli_stream_count".to_string()),
            ("player_name".to_string(), "tv".to_string()),
            ("server".to_string(), "1".to_string()),
        ]
    );
    let sample = &request.timeseries[0].samples[0];
    assert_eq!(sample.value, 3.0);
    assert_eq!(sample.timestamp, 1_704_812_598_000);

    assert_eq!(request.timeseries[1].samples[0].value, 1.0);
}

#[tokio::test]
async fn test_batch_without_numeric_fields_sends_nothing() {
    let server = receiver(204).await;
    let adapter =
        RemoteWriteAdapter::new(&config_for(&server, BackendKind::RemoteWrite, "prom")).unwrap();

    let report = adapter
        .write(&[MetricRecord::new("m").field("title", "text").at(sample_time())])
        .await
        .unwrap();

    assert_eq!(report.written, 0);
    assert_eq!(report.skipped, 1);
    assert!(received(&server).await.is_empty());
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let server = receiver(503).await;
    let adapter =
        RemoteWriteAdapter::new(&config_for(&server, BackendKind::RemoteWrite, "prom")).unwrap();

    let err = adapter
        .write(&[tautulli_record(1)])
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Connectivity);
    assert!(err.kind().is_transient());
}
