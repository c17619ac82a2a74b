//! One batch through the whole pipeline: configuration, registry,
//! dispatcher, and a line-protocol and a TimescaleDB backend side by side

use std::io::Write;
use std::sync::Arc;

use metrics_fanout::actors::DispatchHandle;
use metrics_fanout::backends::timescale::{MemoryExecutor, SqlValue, TimescaleAdapter};
use metrics_fanout::backends::lineproto::LineProtocolAdapter;
use metrics_fanout::backends::BackendAdapter;
use metrics_fanout::config::{read_config_file, BackendKind, DispatchConfig};
use metrics_fanout::registry::RegisteredBackend;
use metrics_fanout::{DefaultFactory, DispatchOptions, Dispatcher, Registry};
use pretty_assertions::assert_eq;
use wiremock::matchers::{body_string, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

const TAUTULLI_LINE: &str = "tautulli,server=1 stream_count=3i 1704812598000000000";

async fn influx_v1() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(204).insert_header("X-Influxdb-Version", "1.8.10"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"results": []})))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_batch_reaches_line_protocol_and_timescale() {
    let server = influx_v1().await;
    Mock::given(method("POST"))
        .and(path("/write"))
        .and(query_param("db", "varken"))
        .and(body_string(TAUTULLI_LINE))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let influx = LineProtocolAdapter::new(&config_for(&server, BackendKind::InfluxDb1, "influx"))
        .unwrap();
    influx.probe().await.unwrap();

    let executor = Arc::new(MemoryExecutor::new());
    let timescale = TimescaleAdapter::new("timescale", "", executor.clone());

    let dispatcher = dispatcher_over(
        vec![
            RegisteredBackend::new("influx", BackendKind::InfluxDb1, Arc::new(influx)),
            RegisteredBackend::new("timescale", BackendKind::Timescale, Arc::new(timescale)),
        ],
        std::time::Duration::from_secs(5),
    );

    let outcome = dispatcher.dispatch(vec![tautulli_record(3)]).await;

    assert_eq!(outcome.succeeded(), 2);
    assert_eq!(outcome.get("influx").unwrap().result.as_ref().unwrap().written, 1);

    let rows = executor.rows("tautulli");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("stream_count"), Some(&SqlValue::BigInt(Some(3))));
    assert_eq!(rows[0].get("server"), Some(&SqlValue::Text(Some("1".to_string()))));
    assert_eq!(rows[0].get("time"), Some(&SqlValue::Timestamp(sample_time())));
}

#[tokio::test]
async fn test_pipeline_from_config_file() {
    let server = influx_v1().await;
    Mock::given(method("POST"))
        .and(path("/write"))
        .and(query_param("db", "media"))
        .respond_with(ResponseTemplate::new(204))
        .expect(2)
        .mount(&server)
        .await;

    let url = url::Url::parse(&server.uri()).unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"{{
            "backends": [
                {{
                    "name": "influx",
                    "kind": "influxdb1",
                    "host": "{}",
                    "port": {},
                    "database": "media"
                }},
                {{
                    "name": "off",
                    "kind": "questdb",
                    "host": "nowhere",
                    "enabled": false
                }}
            ],
            "dispatch": {{ "batch_size": 2, "flush_interval_secs": 3600 }}
        }}"#,
        url.host_str().unwrap(),
        url.port().unwrap()
    )
    .unwrap();

    let config = read_config_file(file.path().to_str().unwrap()).unwrap();
    let registry = Registry::build(&config.backends, &DefaultFactory).await.unwrap();
    assert_eq!(registry.len(), 1);
    assert!(registry.rejected().is_empty());

    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        DispatchOptions::from(&config.dispatch),
    );
    let handle = DispatchHandle::spawn(dispatcher, &config.dispatch);

    // Two records fill one batch, the third waits for the explicit flush
    handle.submit(numbered_records(3)).await.unwrap();
    let outcome = handle.flush().await.unwrap().unwrap();
    assert_eq!(outcome.succeeded(), 1);

    let stats = handle.stats().await.unwrap();
    assert_eq!(stats.batches_dispatched, 2);
    assert_eq!(stats.records_dispatched, 3);
    assert_eq!(stats.total_failures, 0);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_flushes_pending_records() {
    let adapter = MockAdapter::new(Behavior::Accept);
    let registry = Registry::from_backends(vec![RegisteredBackend::new(
        "mock",
        BackendKind::QuestDb,
        adapter.clone(),
    )])
    .unwrap();
    let config = DispatchConfig {
        batch_size: 50,
        flush_interval_secs: 3600,
        ..DispatchConfig::default()
    };
    let handle = DispatchHandle::spawn(
        Dispatcher::new(Arc::new(registry), DispatchOptions::from(&config)),
        &config,
    );

    handle.submit(vec![tautulli_record(1)]).await.unwrap();
    handle.submit(vec![tautulli_record(2)]).await.unwrap();
    handle.shutdown().await.unwrap();

    let batches = adapter.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0], vec![tautulli_record(1), tautulli_record(2)]);
}

#[tokio::test]
async fn test_record_without_fields_reaches_no_backend() {
    let server = influx_v1().await;
    Mock::given(method("POST"))
        .and(path("/write"))
        .and(body_string(TAUTULLI_LINE))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let influx = LineProtocolAdapter::new(&config_for(&server, BackendKind::InfluxDb1, "influx"))
        .unwrap();
    let executor = Arc::new(MemoryExecutor::new());
    let timescale = TimescaleAdapter::new("timescale", "", executor.clone());
    let dispatcher = dispatcher_over(
        vec![
            RegisteredBackend::new("influx", BackendKind::InfluxDb1, Arc::new(influx)),
            RegisteredBackend::new("timescale", BackendKind::Timescale, Arc::new(timescale)),
        ],
        std::time::Duration::from_secs(5),
    );

    let empty = metrics_fanout::MetricRecord::new("tautulli")
        .tag("server", "1")
        .at(sample_time());
    let outcome = dispatcher.dispatch(vec![empty, tautulli_record(3)]).await;

    for backend in ["influx", "timescale"] {
        let report = outcome.get(backend).unwrap().result.as_ref().unwrap();
        assert_eq!(report.written, 1, "{backend}");
        assert_eq!(report.skipped, 1, "{backend}");
    }
    assert_eq!(executor.rows("tautulli").len(), 1);
}
