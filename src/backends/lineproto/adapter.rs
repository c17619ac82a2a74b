//! HTTP adapter for line-protocol backends
//!
//! InfluxDB 1.x/2.x/3.x, QuestDB and VictoriaMetrics all accept the same
//! newline-delimited payload; they differ only in endpoint, query
//! parameters, authentication and reachability probe.

use std::fmt;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use tracing::{debug, info, instrument, trace, warn};

use super::encode::encode_batch;
use crate::backends::adapter::{BackendAdapter, WriteReport};
use crate::backends::error::{BackendError, BackendResult};
use crate::config::{BackendConfig, BackendFamily, BackendKind, ConfigError};
use crate::record::MetricRecord;

/// Adapter for one line-protocol endpoint
///
/// Holds a reused HTTP client; the adapter itself is stateless across
/// writes.
pub struct LineProtocolAdapter {
    id: String,
    kind: BackendKind,
    client: Client,
    base_url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
    org: Option<String>,
    bucket: Option<String>,
}

impl fmt::Debug for LineProtocolAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LineProtocolAdapter")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("base_url", &self.base_url)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl LineProtocolAdapter {
    /// Build an adapter from a validated configuration
    ///
    /// No network traffic happens here; see [`BackendAdapter::probe`].
    pub fn new(config: &BackendConfig) -> BackendResult<Self> {
        if config.kind.family() != BackendFamily::LineProtocol {
            return Err(BackendError::Config(ConfigError::Invalid {
                backend: config.id(),
                reason: format!("{} is not a line-protocol backend", config.kind),
            }));
        }
        config.validate()?;

        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;

        let bucket = config.bucket.clone().or_else(|| {
            // InfluxDB 3 addresses databases through the v2 bucket parameter
            (config.kind == BackendKind::InfluxDb3).then(|| config.database().to_string())
        });

        Ok(Self {
            id: config.id(),
            kind: config.kind,
            client,
            base_url: config.base_url(),
            database: config.database().to_string(),
            username: config.username.clone().filter(|u| !u.is_empty()),
            password: config.password.clone(),
            token: config.token.clone(),
            org: config.org.clone(),
            bucket,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attach the credentials this backend kind expects
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match self.kind {
            BackendKind::InfluxDb2 | BackendKind::InfluxDb3 => match &self.token {
                Some(token) => request.header(AUTHORIZATION, format!("Token {token}")),
                None => request,
            },
            _ => match &self.username {
                Some(username) => request.basic_auth(username, self.password.as_ref()),
                None => request,
            },
        }
    }

    fn write_request(&self) -> RequestBuilder {
        let request = match self.kind {
            BackendKind::InfluxDb1 => self
                .client
                .post(self.url("/write"))
                .query(&[("db", self.database.as_str()), ("precision", "n")]),
            BackendKind::InfluxDb2 | BackendKind::InfluxDb3 => {
                let mut params = vec![("precision", "ns")];
                if let Some(bucket) = &self.bucket {
                    params.push(("bucket", bucket.as_str()));
                }
                if let Some(org) = &self.org {
                    params.push(("org", org.as_str()));
                }
                self.client.post(self.url("/api/v2/write")).query(&params)
            }
            BackendKind::VictoriaMetrics => self
                .client
                .post(self.url("/write"))
                .query(&[("db", self.database.as_str())]),
            _ => self.client.post(self.url("/write")),
        };

        self.authorize(request)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
    }

    /// Send a request and turn any non-2xx status into a classified error
    async fn send(&self, request: RequestBuilder) -> BackendResult<Response> {
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_status(status.as_u16(), body.trim()))
    }

    async fn probe_influxdb1(&self) -> BackendResult<()> {
        let response = self.send(self.client.get(self.url("/ping"))).await?;
        let version = response
            .headers()
            .get("X-Influxdb-Version")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
            .to_string();
        info!("{}: InfluxDB version {}", self.id, version);

        // CREATE DATABASE is idempotent and fails on bad credentials
        let statement = format!("CREATE DATABASE \"{}\"", self.database);
        let request = self
            .client
            .post(self.url("/query"))
            .query(&[("q", statement.as_str())]);
        self.send(self.authorize(request)).await?;

        Ok(())
    }

    async fn probe_influxdb2(&self) -> BackendResult<()> {
        self.send(self.client.get(self.url("/health"))).await?;

        let mut params = vec![];
        if let Some(org) = &self.org {
            params.push(("org", org.as_str()));
        }
        if let Some(bucket) = &self.bucket {
            params.push(("name", bucket.as_str()));
        }
        let request = self.client.get(self.url("/api/v2/buckets")).query(&params);
        let response = self.send(self.authorize(request)).await?;

        let found = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| body.get("buckets").and_then(|b| b.as_array()).map(|b| !b.is_empty()))
            .unwrap_or(true);

        if !found {
            warn!(
                "{}: bucket '{}' not found, create it before writing",
                self.id,
                self.bucket.as_deref().unwrap_or_default()
            );
        }

        Ok(())
    }
}

#[async_trait]
impl BackendAdapter for LineProtocolAdapter {
    #[instrument(skip(self), fields(backend = %self.id))]
    async fn probe(&self) -> BackendResult<()> {
        debug!("probing {} at {}", self.kind, self.base_url);

        match self.kind {
            BackendKind::InfluxDb1 => self.probe_influxdb1().await,
            BackendKind::InfluxDb2 => self.probe_influxdb2().await,
            BackendKind::InfluxDb3 => {
                let request = self.authorize(self.client.get(self.url("/health")));
                self.send(request).await.map(|_| ())
            }
            BackendKind::QuestDb => {
                let request = self
                    .client
                    .get(self.url("/exec"))
                    .query(&[("query", "SELECT 1")]);
                self.send(self.authorize(request)).await.map(|_| ())
            }
            BackendKind::VictoriaMetrics => {
                let request = self.client.get(self.url("/api/v1/labels"));
                self.send(self.authorize(request)).await.map(|_| ())
            }
            BackendKind::Timescale | BackendKind::RemoteWrite => Err(BackendError::Internal(
                format!("{} cannot be probed as line protocol", self.kind),
            )),
        }
    }

    #[instrument(skip(self, batch), fields(backend = %self.id, count = batch.len()))]
    async fn write(&self, batch: &[MetricRecord]) -> BackendResult<WriteReport> {
        let encoded = encode_batch(batch);

        let report = WriteReport {
            written: encoded.written,
            skipped: encoded.skipped,
            ..WriteReport::default()
        };

        if encoded.written == 0 {
            debug!("no valid records in batch, nothing to send");
            return Ok(report);
        }

        trace!("sending {} bytes of line protocol", encoded.payload.len());
        self.send(self.write_request().body(encoded.payload)).await?;

        debug!(
            "wrote {} points ({} skipped)",
            report.written, report.skipped
        );
        Ok(report)
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn close(&self) -> BackendResult<()> {
        debug!("closing {} adapter (no persistent connection)", self.id);
        Ok(())
    }
}
