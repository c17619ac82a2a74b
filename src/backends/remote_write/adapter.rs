use async_trait::async_trait;
use prost::Message;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use tracing::{debug, instrument, trace};

use super::proto::WriteRequest;
use super::series::build_request;
use crate::backends::adapter::{BackendAdapter, WriteReport};
use crate::backends::error::{BackendError, BackendResult};
use crate::config::{BackendConfig, BackendFamily, ConfigError};
use crate::record::MetricRecord;

const REMOTE_WRITE_VERSION: &str = "0.1.0";

/// Serialize and snappy-compress a request body
pub fn encode_request(request: &WriteRequest) -> BackendResult<Vec<u8>> {
    let raw = request.encode_to_vec();
    snap::raw::Encoder::new()
        .compress_vec(&raw)
        .map_err(|e| BackendError::Internal(format!("snappy compression failed: {e}")))
}

/// Adapter pushing samples to a Prometheus remote-write endpoint
pub struct RemoteWriteAdapter {
    id: String,
    client: Client,
    url: String,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

impl RemoteWriteAdapter {
    pub fn new(config: &BackendConfig) -> BackendResult<Self> {
        if config.kind.family() != BackendFamily::RemoteWrite {
            return Err(BackendError::Config(ConfigError::Invalid {
                backend: config.id(),
                reason: format!("{} is not a remote-write backend", config.kind),
            }));
        }
        config.validate()?;

        let client = Client::builder()
            .timeout(config.timeout())
            .connect_timeout(config.timeout())
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()?;

        Ok(Self {
            id: config.id(),
            client,
            url: format!("{}{}", config.base_url(), config.remote_write_path()),
            username: config.username.clone().filter(|u| !u.is_empty()),
            password: config.password.clone(),
            token: config.token.clone().filter(|t| !t.is_empty()),
        })
    }

    fn push_request(&self, body: Vec<u8>) -> RequestBuilder {
        let request = self
            .client
            .post(&self.url)
            .header(CONTENT_ENCODING, "snappy")
            .header(CONTENT_TYPE, "application/x-protobuf")
            .header("X-Prometheus-Remote-Write-Version", REMOTE_WRITE_VERSION)
            .body(body);

        match (&self.token, &self.username) {
            (Some(token), _) => request.bearer_auth(token),
            (None, Some(username)) => request.basic_auth(username, self.password.as_ref()),
            (None, None) => request,
        }
    }

    async fn push(&self, request: &WriteRequest) -> BackendResult<()> {
        let body = encode_request(request)?;
        trace!("pushing {} series in {} bytes", request.timeseries.len(), body.len());

        let response = self.push_request(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_status(status.as_u16(), body.trim()))
    }
}

#[async_trait]
impl BackendAdapter for RemoteWriteAdapter {
    #[instrument(skip(self), fields(backend = %self.id))]
    async fn probe(&self) -> BackendResult<()> {
        self.push(&WriteRequest::default()).await
    }

    #[instrument(skip(self, batch), fields(backend = %self.id, count = batch.len()))]
    async fn write(&self, batch: &[MetricRecord]) -> BackendResult<WriteReport> {
        let output = build_request(batch);

        let report = WriteReport {
            written: output.written,
            skipped: output.skipped,
            dropped_values: output.dropped_values,
            ..WriteReport::default()
        };

        if output.written == 0 {
            debug!("no series to push");
            return Ok(report);
        }

        self.push(&output.request).await?;
        debug!(
            "pushed {} series from {} records",
            output.request.timeseries.len(),
            output.written
        );
        Ok(report)
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }

    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}
