//! SQL execution seam for the TimescaleDB adapter
//!
//! [`PgExecutor`] talks to a real server through a sqlx pool.
//! [`MemoryExecutor`] applies the same changes to in-process tables and is
//! used to exercise provisioning without a database.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::schema::{ColumnType, RowInsert, SchemaChange, SqlValue, TIME_COLUMN};
use crate::backends::error::{BackendError, BackendResult};

/// Operations the adapter needs from a SQL connection
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Verify the connection and make sure the timescaledb extension exists
    async fn prepare(&self) -> BackendResult<()>;

    /// Existing columns of a table, or `None` if the table does not exist
    async fn table_columns(&self, table: &str) -> BackendResult<Option<BTreeMap<String, ColumnType>>>;

    /// Apply one schema change atomically
    async fn apply(&self, change: &SchemaChange) -> BackendResult<()>;

    /// Run one insert statement, returning the rows written
    async fn insert(&self, insert: &RowInsert) -> BackendResult<u64>;

    fn endpoint(&self) -> String;

    async fn close(&self) -> BackendResult<()>;
}

#[cfg(feature = "timescale")]
pub use postgres::PgExecutor;

#[cfg(feature = "timescale")]
mod postgres {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
    use tracing::{debug, info, instrument, warn};

    use super::SqlExecutor;
    use crate::backends::error::{BackendError, BackendResult};
    use crate::backends::timescale::schema::{ColumnType, RowInsert, SchemaChange, SqlValue};
    use crate::config::BackendConfig;

    /// Upper bound for a single DDL statement
    const SCHEMA_STATEMENT_TIMEOUT: &str = "5s";

    /// Database errors during DDL are schema errors, not write errors
    fn schema_error(err: sqlx::Error) -> BackendError {
        match BackendError::from(err) {
            BackendError::Write { message, .. } => BackendError::Schema(message),
            other => other,
        }
    }

    /// Executor backed by a Postgres connection pool
    pub struct PgExecutor {
        pool: PgPool,
        endpoint: String,
    }

    impl PgExecutor {
        /// Build a lazily connecting pool; nothing is sent until [`SqlExecutor::prepare`]
        pub fn new(config: &BackendConfig) -> BackendResult<Self> {
            config.validate()?;

            let mut options = PgConnectOptions::new()
                .host(config.host())
                .port(config.port())
                .database(config.database())
                .ssl_mode(if config.ssl {
                    PgSslMode::Require
                } else {
                    PgSslMode::Prefer
                });

            if let Some(username) = &config.username {
                options = options.username(username);
            }
            if let Some(password) = &config.password {
                options = options.password(password);
            }

            let pool = PgPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(config.timeout())
                .connect_lazy_with(options);

            Ok(Self {
                pool,
                endpoint: format!(
                    "postgres://{}:{}/{}",
                    config.host(),
                    config.port(),
                    config.database()
                ),
            })
        }
    }

    #[async_trait]
    impl SqlExecutor for PgExecutor {
        #[instrument(skip(self), fields(endpoint = %self.endpoint))]
        async fn prepare(&self) -> BackendResult<()> {
            let version: String = sqlx::query_scalar("SELECT version()")
                .fetch_one(&self.pool)
                .await?;
            info!("connected to {}", version);

            let extension: Option<String> = sqlx::query_scalar(
                "SELECT extversion FROM pg_extension WHERE extname = 'timescaledb'",
            )
            .fetch_optional(&self.pool)
            .await?;

            match extension {
                Some(version) => debug!("timescaledb extension {} installed", version),
                None => {
                    warn!("timescaledb extension not found, creating it");
                    sqlx::query("CREATE EXTENSION IF NOT EXISTS timescaledb")
                        .execute(&self.pool)
                        .await
                        .map_err(schema_error)?;
                }
            }

            Ok(())
        }

        async fn table_columns(
            &self,
            table: &str,
        ) -> BackendResult<Option<BTreeMap<String, ColumnType>>> {
            let rows: Vec<(String, String)> = sqlx::query_as(
                r#"
                SELECT column_name, data_type
                FROM information_schema.columns
                WHERE table_schema = current_schema() AND table_name = $1
                "#,
            )
            .bind(table)
            .fetch_all(&self.pool)
            .await?;

            if rows.is_empty() {
                return Ok(None);
            }

            Ok(Some(
                rows.into_iter()
                    .map(|(name, data_type)| (name, ColumnType::from_data_type(&data_type)))
                    .collect(),
            ))
        }

        #[instrument(skip(self, change), fields(table = %change.table()))]
        async fn apply(&self, change: &SchemaChange) -> BackendResult<()> {
            let mut tx = self.pool.begin().await?;

            if matches!(change, SchemaChange::AddColumn { .. }) {
                let timeout = format!("SET LOCAL statement_timeout = '{SCHEMA_STATEMENT_TIMEOUT}'");
                sqlx::query(&timeout).execute(&mut *tx).await?;
            }

            for statement in change.statements() {
                debug!("{}", statement);
                sqlx::query(&statement)
                    .execute(&mut *tx)
                    .await
                    .map_err(schema_error)?;
            }

            tx.commit().await.map_err(schema_error)
        }

        async fn insert(&self, insert: &RowInsert) -> BackendResult<u64> {
            let sql = insert.to_sql();
            let mut query = sqlx::query(&sql);

            for value in insert.rows.iter().flatten() {
                query = match value {
                    SqlValue::Timestamp(ts) => query.bind(*ts),
                    SqlValue::BigInt(v) => query.bind(*v),
                    SqlValue::Double(v) => query.bind(*v),
                    SqlValue::Boolean(v) => query.bind(*v),
                    SqlValue::Text(v) => query.bind(v.as_deref()),
                };
            }

            let result = query.execute(&self.pool).await?;
            Ok(result.rows_affected())
        }

        fn endpoint(&self) -> String {
            self.endpoint.clone()
        }

        async fn close(&self) -> BackendResult<()> {
            self.pool.close().await;
            Ok(())
        }
    }
}

/// Table held by [`MemoryExecutor`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    pub columns: BTreeMap<String, ColumnType>,
    pub rows: Vec<BTreeMap<String, SqlValue>>,
    pub indexes: Vec<String>,
    pub hypertable: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemoryTable>,
    rejected: HashSet<String>,
    offline: bool,
    applied: Vec<SchemaChange>,
}

/// In-process executor with Postgres-like structural checks
///
/// Adding a column that already exists and inserting a value whose type
/// does not match its column are errors, so redundant or inconsistent
/// provisioning shows up in tests.
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    state: Mutex<MemoryState>,
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pre-create a table, as if another writer had provisioned it
    pub fn create_table(&self, table: &str, columns: &[(&str, ColumnType)]) {
        let mut table_columns = BTreeMap::from([(TIME_COLUMN.to_string(), ColumnType::Timestamp)]);
        table_columns.extend(columns.iter().map(|(n, t)| (n.to_string(), t.clone())));

        self.state().tables.insert(
            table.to_string(),
            MemoryTable {
                columns: table_columns,
                hypertable: true,
                ..MemoryTable::default()
            },
        );
    }

    /// Make every schema change against `table` fail
    pub fn reject_schema_changes_for(&self, table: &str) {
        self.state().rejected.insert(table.to_string());
    }

    /// Simulate the server going away
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    pub fn table(&self, table: &str) -> Option<MemoryTable> {
        self.state().tables.get(table).cloned()
    }

    pub fn column_names(&self, table: &str) -> Vec<String> {
        self.table(table)
            .map(|t| t.columns.into_keys().collect())
            .unwrap_or_default()
    }

    pub fn rows(&self, table: &str) -> Vec<BTreeMap<String, SqlValue>> {
        self.table(table).map(|t| t.rows).unwrap_or_default()
    }

    /// Schema changes applied so far, in order
    pub fn applied_changes(&self) -> Vec<SchemaChange> {
        self.state().applied.clone()
    }

    fn check_online(state: &MemoryState) -> BackendResult<()> {
        if state.offline {
            return Err(BackendError::Connectivity("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SqlExecutor for MemoryExecutor {
    async fn prepare(&self) -> BackendResult<()> {
        Self::check_online(&self.state())
    }

    async fn table_columns(&self, table: &str) -> BackendResult<Option<BTreeMap<String, ColumnType>>> {
        let state = self.state();
        Self::check_online(&state)?;
        Ok(state.tables.get(table).map(|t| t.columns.clone()))
    }

    async fn apply(&self, change: &SchemaChange) -> BackendResult<()> {
        let mut state = self.state();
        Self::check_online(&state)?;

        if state.rejected.contains(change.table()) {
            return Err(BackendError::Schema(format!(
                "permission denied for table {}",
                change.table()
            )));
        }

        match change {
            SchemaChange::CreateTable {
                table,
                columns,
                tag_columns,
            } => {
                if !state.tables.contains_key(table) {
                    let mut created = MemoryTable {
                        hypertable: true,
                        indexes: tag_columns.clone(),
                        ..MemoryTable::default()
                    };
                    created
                        .columns
                        .insert(TIME_COLUMN.to_string(), ColumnType::Timestamp);
                    created.columns.extend(columns.iter().cloned());
                    state.tables.insert(table.clone(), created);
                }
            }
            SchemaChange::AddColumn {
                table,
                column,
                column_type,
            } => {
                let existing = state
                    .tables
                    .get_mut(table)
                    .ok_or_else(|| BackendError::Schema(format!("relation {table} does not exist")))?;
                if existing.columns.contains_key(column) {
                    return Err(BackendError::Schema(format!(
                        "column {column} of relation {table} already exists"
                    )));
                }
                existing.columns.insert(column.clone(), column_type.clone());
            }
        }

        state.applied.push(change.clone());
        Ok(())
    }

    async fn insert(&self, insert: &RowInsert) -> BackendResult<u64> {
        let mut state = self.state();
        Self::check_online(&state)?;

        let table = state.tables.get_mut(&insert.table).ok_or_else(|| BackendError::Write {
            status: None,
            message: format!("relation {} does not exist", insert.table),
        })?;

        let mut rows = Vec::with_capacity(insert.rows.len());
        for values in &insert.rows {
            let mut row = BTreeMap::new();
            for (column, value) in insert.columns.iter().zip(values) {
                match table.columns.get(column) {
                    Some(ty) if *ty == value.column_type() => {
                        row.insert(column.clone(), value.clone());
                    }
                    Some(ty) => {
                        return Err(BackendError::Write {
                            status: None,
                            message: format!(
                                "column {column} is of type {ty} but expression is of type {}",
                                value.column_type()
                            ),
                        });
                    }
                    None => {
                        return Err(BackendError::Write {
                            status: None,
                            message: format!("column {column} does not exist"),
                        });
                    }
                }
            }
            rows.push(row);
        }

        let written = rows.len() as u64;
        table.rows.extend(rows);
        Ok(written)
    }

    fn endpoint(&self) -> String {
        "memory".to_string()
    }

    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}
