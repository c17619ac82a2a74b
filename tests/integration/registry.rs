//! Registry construction against mock backends

use assert_matches::assert_matches;
use metrics_fanout::backends::FailureKind;
use metrics_fanout::config::{BackendConfig, BackendKind};
use metrics_fanout::{DefaultFactory, Registry, RegistryError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn victoria(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/labels"))
        .respond_with(
            ResponseTemplate::new(status)
                .set_body_json(serde_json::json!({"status": "success", "data": []})),
        )
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_only_reachable_backends_are_registered() {
    let healthy = victoria(200).await;
    let locked = victoria(401).await;

    let configs = vec![
        config_for(&healthy, BackendKind::VictoriaMetrics, "a"),
        config_for(&locked, BackendKind::VictoriaMetrics, "b"),
    ];

    let registry = Registry::build(&configs, &DefaultFactory).await.unwrap();

    let ids: Vec<_> = registry.info().into_iter().map(|i| i.id).collect();
    assert_eq!(ids, vec!["a"]);
    assert_eq!(registry.rejected().len(), 1);
    assert_eq!(registry.rejected()[0].backend, "b");
    assert_eq!(registry.rejected()[0].failure, FailureKind::Authentication);
}

#[tokio::test]
async fn test_invalid_and_disabled_backends_leave_registry_empty() {
    let server = victoria(200).await;

    let mut invalid = BackendConfig::new(BackendKind::InfluxDb2, "localhost");
    invalid.name = Some("a".to_string());
    invalid.token = Some("t".to_string());

    let mut disabled = config_for(&server, BackendKind::VictoriaMetrics, "b");
    disabled.enabled = false;

    let result = Registry::build(&[invalid, disabled], &DefaultFactory).await;

    assert_matches!(result, Err(RegistryError::NoBackends { rejected }) => {
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].backend, "a");
        assert_eq!(rejected[0].failure, FailureKind::Configuration);
        assert!(rejected[0].reason.contains("org"));
    });
}

#[tokio::test]
async fn test_unreachable_backend_is_rejected_as_connectivity() {
    let healthy = victoria(200).await;
    let mut unreachable = BackendConfig::new(BackendKind::QuestDb, "127.0.0.1");
    unreachable.name = Some("gone".to_string());
    unreachable.port = Some(9);
    unreachable.timeout_secs = 1;

    let configs = vec![unreachable, config_for(&healthy, BackendKind::VictoriaMetrics, "vm")];
    let registry = Registry::build(&configs, &DefaultFactory).await.unwrap();

    assert_eq!(registry.len(), 1);
    assert_eq!(registry.backends()[0].id, "vm");
    assert!(registry.rejected()[0].failure.is_transient());
}
