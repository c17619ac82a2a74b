//! Backend registry
//!
//! Built once at startup from the configured backends. Every enabled
//! configuration is validated, turned into an adapter and probed; failures
//! are logged and recorded as rejections without stopping the others. An
//! empty registry is the only fatal outcome.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::backends::lineproto::LineProtocolAdapter;
use crate::backends::remote_write::RemoteWriteAdapter;
use crate::backends::{BackendAdapter, BackendError, BackendResult, FailureKind};
use crate::config::{BackendConfig, BackendFamily, BackendKind, ConfigError};

/// Builds adapters from configurations
///
/// The registry goes through this trait so tests can substitute adapters.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn create(&self, config: &BackendConfig) -> BackendResult<Arc<dyn BackendAdapter>>;
}

/// Factory for the adapters shipped with the crate
pub struct DefaultFactory;

#[async_trait]
impl AdapterFactory for DefaultFactory {
    async fn create(&self, config: &BackendConfig) -> BackendResult<Arc<dyn BackendAdapter>> {
        match config.kind.family() {
            BackendFamily::LineProtocol => Ok(Arc::new(LineProtocolAdapter::new(config)?)),
            BackendFamily::RemoteWrite => Ok(Arc::new(RemoteWriteAdapter::new(config)?)),
            #[cfg(feature = "timescale")]
            BackendFamily::SqlTsdb => Ok(Arc::new(
                crate::backends::timescale::TimescaleAdapter::connect(config)?,
            )),
            #[cfg(not(feature = "timescale"))]
            BackendFamily::SqlTsdb => Err(BackendError::Config(ConfigError::Invalid {
                backend: config.id(),
                reason: "built without the 'timescale' feature".to_string(),
            })),
        }
    }
}

/// A configuration that did not make it into the registry
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub backend: String,
    pub kind: BackendKind,
    pub failure: FailureKind,
    pub reason: String,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.backend, self.kind, self.reason)
    }
}

#[derive(Debug)]
pub enum RegistryError {
    /// No configured backend could be registered
    NoBackends { rejected: Vec<Rejection> },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::NoBackends { rejected } if rejected.is_empty() => {
                write!(f, "no backends registered: no enabled backend configured")
            }
            RegistryError::NoBackends { rejected } => {
                write!(f, "no backends registered; rejected: ")?;
                for (i, rejection) in rejected.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{rejection}")?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// One live adapter and the lock serializing writes to it
pub struct RegisteredBackend {
    pub id: String,
    pub kind: BackendKind,
    pub adapter: Arc<dyn BackendAdapter>,
    write_lock: Mutex<()>,
}

impl RegisteredBackend {
    pub fn new(id: impl Into<String>, kind: BackendKind, adapter: Arc<dyn BackendAdapter>) -> Self {
        Self {
            id: id.into(),
            kind,
            adapter,
            write_lock: Mutex::new(()),
        }
    }

    /// Held for the duration of one write so batches reach this backend in order
    pub(crate) fn write_lock(&self) -> &Mutex<()> {
        &self.write_lock
    }
}

impl fmt::Debug for RegisteredBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBackend")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("endpoint", &self.adapter.endpoint())
            .finish()
    }
}

/// Summary of a registered backend
#[derive(Debug, Clone, PartialEq)]
pub struct BackendInfo {
    pub id: String,
    pub kind: BackendKind,
    pub endpoint: String,
}

#[derive(Debug)]
pub struct Registry {
    backends: Vec<Arc<RegisteredBackend>>,
    rejected: Vec<Rejection>,
}

impl Registry {
    /// Validate, create and probe every enabled backend, in order
    #[instrument(skip_all, fields(configured = configs.len()))]
    pub async fn build(
        configs: &[BackendConfig],
        factory: &dyn AdapterFactory,
    ) -> Result<Self, RegistryError> {
        let mut rejected = Vec::new();
        let mut seen = HashSet::new();
        let mut candidates = Vec::new();

        for config in configs {
            let id = config.id();
            if !config.enabled {
                debug!("{} is disabled, skipping", id);
                continue;
            }

            let checked = if seen.insert(id.clone()) {
                config.validate()
            } else {
                Err(ConfigError::DuplicateName(id.clone()))
            };

            match checked {
                Ok(()) => candidates.push(config),
                Err(e) => {
                    error!("rejecting backend {}: {}", id, e);
                    rejected.push(Rejection {
                        backend: id,
                        kind: config.kind,
                        failure: FailureKind::Configuration,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let results = join_all(candidates.iter().map(|config| async move {
            let result = Self::initialize(config, factory).await;
            (*config, result)
        }))
        .await;

        let mut backends = Vec::new();
        for (config, result) in results {
            let id = config.id();
            match result {
                Ok(adapter) => {
                    info!("registered {} backend {} at {}", config.kind, id, adapter.endpoint());
                    backends.push(Arc::new(RegisteredBackend::new(id, config.kind, adapter)));
                }
                Err(e) => {
                    error!("rejecting backend {}: {}", id, e);
                    rejected.push(Rejection {
                        backend: id,
                        kind: config.kind,
                        failure: e.kind(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        if backends.is_empty() {
            error!("no backend could be registered ({} rejected)", rejected.len());
            return Err(RegistryError::NoBackends { rejected });
        }

        if !rejected.is_empty() {
            warn!(
                "{} of {} enabled backends rejected",
                rejected.len(),
                backends.len() + rejected.len()
            );
        }
        info!("{} backends registered", backends.len());

        Ok(Self { backends, rejected })
    }

    async fn initialize(
        config: &BackendConfig,
        factory: &dyn AdapterFactory,
    ) -> BackendResult<Arc<dyn BackendAdapter>> {
        let adapter = factory.create(config).await?;

        match tokio::time::timeout(config.timeout(), adapter.probe()).await {
            Ok(Ok(())) => Ok(adapter),
            Ok(Err(e)) => {
                let _ = adapter.close().await;
                Err(e)
            }
            Err(_) => {
                let _ = adapter.close().await;
                Err(BackendError::Timeout(config.timeout()))
            }
        }
    }

    /// Registry over already-built backends, without probing
    pub fn from_backends(backends: Vec<RegisteredBackend>) -> Result<Self, RegistryError> {
        if backends.is_empty() {
            return Err(RegistryError::NoBackends { rejected: vec![] });
        }

        Ok(Self {
            backends: backends.into_iter().map(Arc::new).collect(),
            rejected: vec![],
        })
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backends(&self) -> &[Arc<RegisteredBackend>] {
        &self.backends
    }

    pub fn rejected(&self) -> &[Rejection] {
        &self.rejected
    }

    pub fn info(&self) -> Vec<BackendInfo> {
        self.backends
            .iter()
            .map(|b| BackendInfo {
                id: b.id.clone(),
                kind: b.kind,
                endpoint: b.adapter.endpoint(),
            })
            .collect()
    }

    /// Close every adapter; failures are logged, not returned
    pub async fn close_all(&self) {
        for backend in &self.backends {
            match backend.adapter.close().await {
                Ok(()) => debug!("closed {}", backend.id),
                Err(e) => error!("error closing {}: {}", backend.id, e),
            }
        }
    }
}
