//! Table and column provisioning for the TimescaleDB adapter
//!
//! Every measurement maps to its own hypertable. Columns are added on
//! demand and never dropped or altered, so the schema only ever grows.
//!
//! ## Naming
//!
//! Measurement, tag and field names are lowercased and have spaces, `-`
//! and `.` replaced by `_`. Names that still do not match
//! `^[a-z_][a-z0-9_]*$`, or are longer than 63 bytes, are rejected. `time`
//! is reserved for the timestamp column.
//!
//! ## Cache
//!
//! [`SchemaProvisioner`] keeps one [`TableSchema`] per table behind its own
//! async mutex. Holding that lock serializes provisioning and insertion for
//! one table while leaving other tables free to proceed.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use super::executor::SqlExecutor;
use crate::backends::error::{BackendError, BackendResult};
use crate::record::{FieldValue, MetricRecord};

/// Postgres identifier length limit
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Timestamp column present in every table
pub const TIME_COLUMN: &str = "time";

/// Bind parameter limit of the Postgres wire protocol
pub const MAX_BIND_PARAMS: usize = 65535;

/// Normalize a name into a safe SQL identifier
pub fn sanitize_identifier(raw: &str) -> Option<String> {
    static IDENTIFIER: OnceLock<regex::Regex> = OnceLock::new();
    let pattern = IDENTIFIER.get_or_init(|| {
        regex::Regex::new(r"^[a-z_][a-z0-9_]*$").expect("failed to compile identifier regex")
    });

    let name: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            ' ' | '-' | '.' => '_',
            c => c,
        })
        .collect();

    (name.len() <= MAX_IDENTIFIER_LEN && pattern.is_match(&name)).then_some(name)
}

/// Column name for a tag or field key; `None` if the key is unusable
pub fn column_name(key: &str) -> Option<String> {
    sanitize_identifier(key).filter(|name| name != TIME_COLUMN)
}

/// Quote an identifier for use in a statement
fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Column types the adapter creates or understands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Timestamp,
    BigInt,
    Double,
    Boolean,
    Text,
    /// A type created outside this adapter
    Other(String),
}

impl ColumnType {
    /// Type used for a new column holding this value
    pub fn for_value(value: &FieldValue) -> Self {
        match value {
            FieldValue::Boolean(_) => ColumnType::Boolean,
            FieldValue::Integer(_) => ColumnType::BigInt,
            FieldValue::Float(_) => ColumnType::Double,
            FieldValue::String(_) => ColumnType::Text,
        }
    }

    /// Parse an `information_schema.columns.data_type` value
    pub fn from_data_type(data_type: &str) -> Self {
        match data_type.to_lowercase().as_str() {
            "timestamp with time zone" | "timestamptz" => ColumnType::Timestamp,
            "bigint" | "int8" => ColumnType::BigInt,
            "double precision" | "float8" => ColumnType::Double,
            "boolean" | "bool" => ColumnType::Boolean,
            "text" => ColumnType::Text,
            other => ColumnType::Other(other.to_string()),
        }
    }

    pub fn sql_type(&self) -> &str {
        match self {
            ColumnType::Timestamp => "TIMESTAMPTZ",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Double => "DOUBLE PRECISION",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Text => "TEXT",
            ColumnType::Other(name) => name,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql_type())
    }
}

/// A single bound parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Timestamp(DateTime<Utc>),
    BigInt(Option<i64>),
    Double(Option<f64>),
    Boolean(Option<bool>),
    Text(Option<String>),
}

impl SqlValue {
    /// Typed NULL for a column; `None` for types the adapter cannot bind
    pub fn null(column: &ColumnType) -> Option<Self> {
        match column {
            ColumnType::BigInt => Some(SqlValue::BigInt(None)),
            ColumnType::Double => Some(SqlValue::Double(None)),
            ColumnType::Boolean => Some(SqlValue::Boolean(None)),
            ColumnType::Text => Some(SqlValue::Text(None)),
            ColumnType::Timestamp | ColumnType::Other(_) => None,
        }
    }

    /// Convert a field value for a column of the given type
    ///
    /// Integers widen into `DOUBLE PRECISION`; every other mismatch is a
    /// conflict and yields `None`.
    pub fn convert(value: &FieldValue, column: &ColumnType) -> Option<Self> {
        match (value, column) {
            (FieldValue::Integer(i), ColumnType::BigInt) => Some(SqlValue::BigInt(Some(*i))),
            (FieldValue::Integer(i), ColumnType::Double) => Some(SqlValue::Double(Some(*i as f64))),
            (FieldValue::Float(f), ColumnType::Double) => Some(SqlValue::Double(Some(*f))),
            (FieldValue::Boolean(b), ColumnType::Boolean) => Some(SqlValue::Boolean(Some(*b))),
            (FieldValue::String(s), ColumnType::Text) => Some(SqlValue::Text(Some(s.clone()))),
            _ => None,
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            SqlValue::Timestamp(_) => ColumnType::Timestamp,
            SqlValue::BigInt(_) => ColumnType::BigInt,
            SqlValue::Double(_) => ColumnType::Double,
            SqlValue::Boolean(_) => ColumnType::Boolean,
            SqlValue::Text(_) => ColumnType::Text,
        }
    }
}

/// An additive DDL change
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    /// New hypertable with a time column, tag columns and field columns
    CreateTable {
        table: String,
        columns: Vec<(String, ColumnType)>,
        tag_columns: Vec<String>,
    },

    /// One nullable column added to an existing table
    AddColumn {
        table: String,
        column: String,
        column_type: ColumnType,
    },
}

impl SchemaChange {
    pub fn table(&self) -> &str {
        match self {
            SchemaChange::CreateTable { table, .. } | SchemaChange::AddColumn { table, .. } => table,
        }
    }

    /// Statements implementing the change, in execution order
    pub fn statements(&self) -> Vec<String> {
        match self {
            SchemaChange::CreateTable {
                table,
                columns,
                tag_columns,
            } => {
                let mut definitions = vec![format!("{} TIMESTAMPTZ NOT NULL", quote(TIME_COLUMN))];
                definitions.extend(
                    columns
                        .iter()
                        .map(|(name, ty)| format!("{} {}", quote(name), ty.sql_type())),
                );

                let mut statements = vec![format!(
                    "CREATE TABLE IF NOT EXISTS {} ({})",
                    quote(table),
                    definitions.join(", ")
                )];

                statements.extend(tag_columns.iter().map(|tag| {
                    format!(
                        "CREATE INDEX IF NOT EXISTS {} ON {} ({}, {} DESC)",
                        quote(&format!("{table}_{tag}_idx")),
                        quote(table),
                        quote(tag),
                        quote(TIME_COLUMN)
                    )
                }));

                statements.push(format!(
                    "SELECT create_hypertable('{}', '{}', if_not_exists => TRUE)",
                    table, TIME_COLUMN
                ));

                statements
            }
            SchemaChange::AddColumn {
                table,
                column,
                column_type,
            } => vec![format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                quote(table),
                quote(column),
                column_type.sql_type()
            )],
        }
    }
}

/// A parameterized multi-row insert into one table
#[derive(Debug, Clone, PartialEq)]
pub struct RowInsert {
    pub table: String,

    /// Column names, `time` first
    pub columns: Vec<String>,

    /// One value per column per row
    pub rows: Vec<Vec<SqlValue>>,
}

impl RowInsert {
    /// Render as `INSERT INTO t (..) VALUES ($1, ..), (..)`
    pub fn to_sql(&self) -> String {
        let columns = self
            .columns
            .iter()
            .map(|c| quote(c))
            .collect::<Vec<_>>()
            .join(", ");

        let width = self.columns.len();
        let values = (0..self.rows.len())
            .map(|row| {
                let params = (1..=width)
                    .map(|col| format!("${}", row * width + col))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({params})")
            })
            .collect::<Vec<_>>()
            .join(", ");

        format!("INSERT INTO {} ({}) VALUES {}", quote(&self.table), columns, values)
    }

    /// Split into statements that each stay under the bind parameter limit
    pub fn into_chunks(self) -> Vec<RowInsert> {
        let rows_per_chunk = (MAX_BIND_PARAMS / self.columns.len().max(1)).max(1);
        if self.rows.len() <= rows_per_chunk {
            return vec![self];
        }

        let RowInsert {
            table,
            columns,
            rows,
        } = self;

        rows.chunks(rows_per_chunk)
            .map(|chunk| RowInsert {
                table: table.clone(),
                columns: columns.clone(),
                rows: chunk.to_vec(),
            })
            .collect()
    }
}

/// Columns a group of records needs
///
/// The type of each column is inferred from the first value seen for it,
/// widened to `DOUBLE PRECISION` when integers and floats are mixed.
/// Tags are always `TEXT`.
#[derive(Debug, Default, PartialEq)]
pub struct RequiredColumns {
    pub columns: BTreeMap<String, ColumnType>,
    pub tags: BTreeSet<String>,
}

impl RequiredColumns {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a MetricRecord>) -> Self {
        let mut required = Self::default();

        for record in records {
            for key in record.tags.keys() {
                if let Some(name) = column_name(key) {
                    if !required.columns.contains_key(&name) {
                        required.columns.insert(name.clone(), ColumnType::Text);
                        required.tags.insert(name);
                    }
                }
            }
            for (key, value) in &record.fields {
                if let Some(name) = column_name(key) {
                    let seen = ColumnType::for_value(value);
                    required
                        .columns
                        .entry(name)
                        .and_modify(|current| {
                            // mixed integer and float values share a DOUBLE column
                            if matches!(
                                (&*current, &seen),
                                (ColumnType::BigInt, ColumnType::Double)
                            ) {
                                *current = ColumnType::Double;
                            }
                        })
                        .or_insert(seen);
                }
            }
        }

        required
    }
}

/// Cached view of one remote table
#[derive(Debug, Default)]
pub struct TableSchema {
    loaded: bool,
    exists: bool,
    columns: BTreeMap<String, ColumnType>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnType> {
        self.columns.get(name)
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Forget the cached columns so the next write reloads them
    pub fn invalidate(&mut self) {
        self.loaded = false;
        self.exists = false;
        self.columns.clear();
    }

    async fn load(&mut self, executor: &dyn SqlExecutor, table: &str) -> BackendResult<()> {
        match executor.table_columns(table).await? {
            Some(columns) => {
                debug!("loaded {} existing columns for {}", columns.len(), table);
                self.exists = true;
                self.columns = columns;
            }
            None => {
                self.exists = false;
                self.columns.clear();
            }
        }
        self.loaded = true;
        Ok(())
    }

    /// Bring the table up to date with the columns a batch needs
    ///
    /// Creates the table if it does not exist. A failing column addition
    /// is logged and leaves that column missing; values for it are dropped
    /// at insertion time. Returns the number of changes applied.
    pub async fn ensure(
        &mut self,
        executor: &dyn SqlExecutor,
        table: &str,
        required: &RequiredColumns,
    ) -> BackendResult<usize> {
        if !self.loaded {
            self.load(executor, table).await?;
        }

        if !self.exists {
            let change = SchemaChange::CreateTable {
                table: table.to_string(),
                columns: required
                    .columns
                    .iter()
                    .map(|(name, ty)| (name.clone(), ty.clone()))
                    .collect(),
                tag_columns: required.tags.iter().cloned().collect(),
            };

            executor.apply(&change).await?;
            info!("created hypertable {} with {} columns", table, required.columns.len());

            self.exists = true;
            self.columns.insert(TIME_COLUMN.to_string(), ColumnType::Timestamp);
            self.columns.extend(required.columns.clone());
            return Ok(1);
        }

        let mut applied = 0;
        for (column, column_type) in &required.columns {
            if self.columns.contains_key(column) {
                continue;
            }

            let change = SchemaChange::AddColumn {
                table: table.to_string(),
                column: column.clone(),
                column_type: column_type.clone(),
            };

            match executor.apply(&change).await {
                Ok(()) => {
                    debug!("added column {}.{} ({})", table, column, column_type);
                    self.columns.insert(column.clone(), column_type.clone());
                    applied += 1;
                }
                Err(e) if e.kind().is_transient() => return Err(e),
                Err(e) => warn!("could not add column {}.{}: {}", table, column, e),
            }
        }

        Ok(applied)
    }
}

/// Per-adapter schema cache
#[derive(Debug, Default)]
pub struct SchemaProvisioner {
    tables: Mutex<HashMap<String, Arc<AsyncMutex<TableSchema>>>>,
}

impl SchemaProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for one table's cached schema
    pub fn table(&self, table: &str) -> Arc<AsyncMutex<TableSchema>> {
        let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        tables.entry(table.to_string()).or_default().clone()
    }
}

/// Map a conflicting value to a schema error for logging
pub fn conflict(table: &str, column: &str, value: &FieldValue, column_type: &ColumnType) -> BackendError {
    BackendError::Schema(format!(
        "{table}.{column} is {column_type}, cannot store {} value",
        value.type_name()
    ))
}
