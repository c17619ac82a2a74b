use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use tracing::trace;

use crate::record::DEFAULT_INTEGER_FIELDS;

/// Supported backend kinds, as written in the configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[serde(rename = "influxdb1")]
    InfluxDb1,
    #[serde(rename = "influxdb2")]
    InfluxDb2,
    #[serde(rename = "influxdb3")]
    InfluxDb3,
    #[serde(rename = "questdb")]
    QuestDb,
    #[serde(rename = "victoriametrics")]
    VictoriaMetrics,
    Timescale,
    RemoteWrite,
}

/// Wire-format family a backend kind belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendFamily {
    LineProtocol,
    SqlTsdb,
    RemoteWrite,
}

impl BackendKind {
    pub fn family(&self) -> BackendFamily {
        match self {
            BackendKind::InfluxDb1
            | BackendKind::InfluxDb2
            | BackendKind::InfluxDb3
            | BackendKind::QuestDb
            | BackendKind::VictoriaMetrics => BackendFamily::LineProtocol,
            BackendKind::Timescale => BackendFamily::SqlTsdb,
            BackendKind::RemoteWrite => BackendFamily::RemoteWrite,
        }
    }

    fn default_port(&self) -> u16 {
        match self {
            BackendKind::InfluxDb1 | BackendKind::InfluxDb2 => 8086,
            BackendKind::InfluxDb3 => 443,
            BackendKind::QuestDb => 9000,
            BackendKind::VictoriaMetrics | BackendKind::RemoteWrite => 8428,
            BackendKind::Timescale => 5432,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::InfluxDb1 => "influxdb1",
            BackendKind::InfluxDb2 => "influxdb2",
            BackendKind::InfluxDb3 => "influxdb3",
            BackendKind::QuestDb => "questdb",
            BackendKind::VictoriaMetrics => "victoriametrics",
            BackendKind::Timescale => "timescale",
            BackendKind::RemoteWrite => "remote_write",
        };
        write!(f, "{name}")
    }
}

/// A configuration that cannot be turned into an adapter
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A required connection attribute is absent
    Missing { backend: String, attribute: &'static str },

    /// An attribute is present but unusable
    Invalid { backend: String, reason: String },

    /// Two enabled backends share an identifier
    DuplicateName(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Missing { backend, attribute } => {
                write!(f, "{backend}: missing required attribute '{attribute}'")
            }
            ConfigError::Invalid { backend, reason } => write!(f, "{backend}: {reason}"),
            ConfigError::DuplicateName(name) => {
                write!(f, "backend name '{name}' is used more than once")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// One backend instance
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Identifier used in logs and dispatch outcomes
    pub name: Option<String>,

    pub kind: BackendKind,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    pub host: Option<String>,
    pub port: Option<u16>,

    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub org: Option<String>,
    pub bucket: Option<String>,
    pub database: Option<String>,

    #[serde(default)]
    pub ssl: bool,

    #[serde(default = "default_enabled")]
    pub verify_ssl: bool,

    /// Connect/request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Remote-write ingestion path
    pub path: Option<String>,

    /// Prefix prepended to every TimescaleDB table name
    #[serde(default)]
    pub table_prefix: String,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_write_timeout_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    500
}

fn default_flush_interval_secs() -> u64 {
    10
}

fn default_integer_fields() -> Vec<String> {
    DEFAULT_INTEGER_FIELDS.iter().map(|s| s.to_string()).collect()
}

const DEFAULT_DATABASE: &str = "varken";

const DEFAULT_REMOTE_WRITE_PATH: &str = "/api/v1/write";

impl BackendConfig {
    /// Minimal configuration for the given kind and host
    pub fn new(kind: BackendKind, host: impl Into<String>) -> Self {
        Self {
            name: None,
            kind,
            enabled: true,
            host: Some(host.into()),
            port: None,
            username: None,
            password: None,
            token: None,
            org: None,
            bucket: None,
            database: None,
            ssl: false,
            verify_ssl: true,
            timeout_secs: default_timeout_secs(),
            path: None,
            table_prefix: String::new(),
        }
    }

    pub fn host(&self) -> &str {
        self.host.as_deref().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.kind.default_port())
    }

    /// Backend identifier: explicit name or `kind@host:port`
    pub fn id(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}@{}:{}", self.kind, self.host(), self.port()),
        }
    }

    pub fn database(&self) -> &str {
        self.database.as_deref().unwrap_or(DEFAULT_DATABASE)
    }

    pub fn remote_write_path(&self) -> &str {
        self.path.as_deref().unwrap_or(DEFAULT_REMOTE_WRITE_PATH)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Base URL for HTTP backends
    pub fn base_url(&self) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.host(), self.port())
    }

    /// Check that every attribute this kind needs is present
    pub fn validate(&self) -> Result<(), ConfigError> {
        let backend = self.id();
        let missing = |attribute| ConfigError::Missing {
            backend: backend.clone(),
            attribute,
        };
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.is_empty());

        if !present(&self.host) {
            return Err(missing("host"));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                backend,
                reason: "timeout_secs must be greater than zero".to_string(),
            });
        }

        match self.kind {
            BackendKind::InfluxDb2 => {
                for (value, attribute) in [
                    (&self.token, "token"),
                    (&self.org, "org"),
                    (&self.bucket, "bucket"),
                ] {
                    if !present(value) {
                        return Err(missing(attribute));
                    }
                }
            }
            BackendKind::InfluxDb3 => {
                if !present(&self.token) {
                    return Err(missing("token"));
                }
                if !present(&self.bucket) && !present(&self.database) {
                    return Err(missing("bucket"));
                }
            }
            BackendKind::Timescale => {
                if !present(&self.username) {
                    return Err(missing("username"));
                }
                if !present(&self.database) {
                    return Err(missing("database"));
                }
            }
            BackendKind::InfluxDb1
            | BackendKind::QuestDb
            | BackendKind::VictoriaMetrics
            | BackendKind::RemoteWrite => {
                if present(&self.username) != present(&self.password) {
                    return Err(ConfigError::Invalid {
                        backend,
                        reason: "username and password must be set together".to_string(),
                    });
                }
            }
        }

        if self.kind == BackendKind::RemoteWrite && !self.remote_write_path().starts_with('/') {
            return Err(ConfigError::Invalid {
                backend,
                reason: "path must start with '/'".to_string(),
            });
        }

        Ok(())
    }
}

/// Dispatcher and dispatch actor settings
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound for one adapter write, in seconds
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,

    /// Buffered records that trigger a dispatch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time records wait in the buffer, in seconds
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,

    /// Field keys always coerced to integers
    #[serde(default = "default_integer_fields")]
    pub integer_fields: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            write_timeout_secs: default_write_timeout_secs(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval_secs(),
            integer_fields: default_integer_fields(),
        }
    }
}

impl DispatchConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backends: Vec<BackendConfig>,

    #[serde(default)]
    pub dispatch: DispatchConfig,
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
