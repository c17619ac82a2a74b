//! Helper functions for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use metrics_fanout::backends::{BackendAdapter, BackendError, BackendResult, WriteReport};
use metrics_fanout::config::{BackendConfig, BackendKind};
use metrics_fanout::registry::{RegisteredBackend, Registry};
use metrics_fanout::{DispatchOptions, Dispatcher, MetricRecord};
use wiremock::MockServer;

/// 2024-01-09T15:03:18Z
pub fn sample_time() -> DateTime<Utc> {
    Utc.timestamp_opt(1_704_812_598, 0).unwrap()
}

pub fn tautulli_record(stream_count: i64) -> MetricRecord {
    MetricRecord::new("tautulli")
        .tag("server", "1")
        .field("stream_count", stream_count)
        .at(sample_time())
}

pub fn numbered_records(n: usize) -> Vec<MetricRecord> {
    (0..n)
        .map(|i| {
            MetricRecord::new("bench")
                .tag("seq", i.to_string())
                .field("value", i as i64)
                .at(sample_time())
        })
        .collect()
}

/// Backend configuration pointing at a mock server
pub fn config_for(server: &MockServer, kind: BackendKind, name: &str) -> BackendConfig {
    let url = url::Url::parse(&server.uri()).unwrap();
    let mut config = BackendConfig::new(kind, url.host_str().unwrap());
    config.port = url.port();
    config.name = Some(name.to_string());
    config.timeout_secs = 2;
    config
}

/// How a [`MockAdapter`] answers writes
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Accept,
    Fail(fn() -> BackendError),
    Delay(Duration),
}

/// Adapter that records batches and answers with a fixed behavior
pub struct MockAdapter {
    behavior: Behavior,
    batches: Mutex<Vec<Vec<MetricRecord>>>,
}

impl MockAdapter {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            batches: Mutex::new(Vec::new()),
        })
    }

    pub fn batches(&self) -> Vec<Vec<MetricRecord>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
    async fn probe(&self) -> BackendResult<()> {
        Ok(())
    }

    async fn write(&self, batch: &[MetricRecord]) -> BackendResult<WriteReport> {
        self.batches.lock().unwrap().push(batch.to_vec());
        match &self.behavior {
            Behavior::Accept => Ok(WriteReport::written(batch.len())),
            Behavior::Fail(err) => Err(err()),
            Behavior::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(WriteReport::written(batch.len()))
            }
        }
    }

    fn endpoint(&self) -> String {
        "mock".to_string()
    }

    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}

pub fn dispatcher_over(backends: Vec<RegisteredBackend>, write_timeout: Duration) -> Dispatcher {
    let registry = Registry::from_backends(backends).unwrap();
    let options = DispatchOptions {
        write_timeout,
        ..DispatchOptions::default()
    };
    Dispatcher::new(Arc::new(registry), options)
}
