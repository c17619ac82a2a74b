//! TimescaleDB backend: one hypertable per measurement, columns added on demand

mod adapter;
pub mod executor;
pub mod schema;

pub use adapter::TimescaleAdapter;
#[cfg(feature = "timescale")]
pub use executor::PgExecutor;
pub use executor::{MemoryExecutor, MemoryTable, SqlExecutor};
pub use schema::{ColumnType, SchemaChange, SqlValue};
