use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use super::executor::SqlExecutor;
use super::schema::{
    ColumnType, RequiredColumns, RowInsert, SchemaProvisioner, SqlValue, TIME_COLUMN, column_name,
    conflict, sanitize_identifier,
};
use crate::backends::adapter::{BackendAdapter, WriteReport};
use crate::backends::error::BackendResult;
use crate::record::MetricRecord;

/// Adapter for TimescaleDB
///
/// Each measurement in a batch is provisioned and inserted independently;
/// a failure for one measurement is counted in [`WriteReport::failed`] and
/// does not stop the others.
pub struct TimescaleAdapter {
    id: String,
    table_prefix: String,
    executor: Arc<dyn SqlExecutor>,
    schema: SchemaProvisioner,
}

impl TimescaleAdapter {
    pub fn new(
        id: impl Into<String>,
        table_prefix: impl Into<String>,
        executor: Arc<dyn SqlExecutor>,
    ) -> Self {
        Self {
            id: id.into(),
            table_prefix: table_prefix.into(),
            executor,
            schema: SchemaProvisioner::new(),
        }
    }

    /// Build an adapter on a Postgres pool for the given configuration
    #[cfg(feature = "timescale")]
    pub fn connect(config: &crate::config::BackendConfig) -> BackendResult<Self> {
        let executor = super::executor::PgExecutor::new(config)?;
        Ok(Self::new(config.id(), config.table_prefix.clone(), Arc::new(executor)))
    }

    pub fn table_name(&self, measurement: &str) -> Option<String> {
        sanitize_identifier(&format!("{}{}", self.table_prefix, measurement))
    }

    /// Provision and insert one table's records while holding its schema lock
    async fn write_table(&self, table: &str, records: &[&MetricRecord]) -> BackendResult<WriteReport> {
        let lock = self.schema.table(table);
        let mut schema = lock.lock().await;

        let required = RequiredColumns::from_records(records.iter().copied());
        let changes = schema.ensure(self.executor.as_ref(), table, &required).await?;
        if changes > 0 {
            debug!("applied {} schema changes to {}", changes, table);
        }

        let mut report = WriteReport::default();

        // Only columns that exist after provisioning are written, each with
        // the NULL used when a record has no value for it
        let columns: Vec<(String, SqlValue)> = required
            .columns
            .keys()
            .filter_map(|c| {
                let null = schema.column(c).and_then(SqlValue::null)?;
                Some((c.clone(), null))
            })
            .collect();

        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let mut values: BTreeMap<String, SqlValue> = BTreeMap::new();

            for (key, value) in &record.tags {
                match column_name(key) {
                    Some(name) if schema.column(&name) == Some(&ColumnType::Text) => {
                        values
                            .entry(name)
                            .or_insert_with(|| SqlValue::Text(Some(value.clone())));
                    }
                    _ => report.dropped_values += 1,
                }
            }

            let mut fields_kept = 0;
            for (key, value) in &record.fields {
                let Some(name) = column_name(key) else {
                    warn!("{}: field '{}' has no valid column name, dropped", table, key);
                    report.dropped_values += 1;
                    continue;
                };
                let Some(column_type) = schema.column(&name).filter(|_| !values.contains_key(&name))
                else {
                    report.dropped_values += 1;
                    continue;
                };
                match SqlValue::convert(value, column_type) {
                    Some(converted) => {
                        values.insert(name, converted);
                        fields_kept += 1;
                    }
                    None => {
                        warn!("{}", conflict(table, &name, value, column_type));
                        report.dropped_values += 1;
                    }
                }
            }

            if fields_kept == 0 {
                report.failed += 1;
                continue;
            }

            let mut row = vec![SqlValue::Timestamp(record.timestamp)];
            row.extend(
                columns
                    .iter()
                    .map(|(column, null)| values.remove(column).unwrap_or_else(|| null.clone())),
            );
            rows.push(row);
        }

        if rows.is_empty() {
            return Ok(report);
        }

        let mut insert_columns = vec![TIME_COLUMN.to_string()];
        insert_columns.extend(columns.into_iter().map(|(name, _)| name));

        let insert = RowInsert {
            table: table.to_string(),
            columns: insert_columns,
            rows,
        };

        let total = insert.rows.len();
        for chunk in insert.into_chunks() {
            let count = chunk.rows.len();
            if let Err(e) = self.executor.insert(&chunk).await {
                // The remote schema may have changed underneath us
                schema.invalidate();
                report.failed += total - report.written;
                return if report.written == 0 {
                    Err(e)
                } else {
                    warn!("{}: insert failed after {} rows: {}", table, report.written, e);
                    Ok(report)
                };
            }
            report.written += count;
        }

        Ok(report)
    }
}

#[async_trait]
impl BackendAdapter for TimescaleAdapter {
    async fn probe(&self) -> BackendResult<()> {
        self.executor.prepare().await
    }

    #[instrument(skip(self, batch), fields(backend = %self.id, count = batch.len()))]
    async fn write(&self, batch: &[MetricRecord]) -> BackendResult<WriteReport> {
        let mut report = WriteReport::default();
        let mut groups: BTreeMap<String, Vec<&MetricRecord>> = BTreeMap::new();

        for record in batch {
            if let Err(e) = record.validate() {
                warn!("skipping invalid record for '{}': {}", record.measurement, e);
                report.skipped += 1;
                continue;
            }
            match self.table_name(&record.measurement) {
                Some(table) => groups.entry(table).or_default().push(record),
                None => {
                    warn!(
                        "skipping record: '{}' is not a usable table name",
                        record.measurement
                    );
                    report.skipped += 1;
                }
            }
        }

        if groups.is_empty() {
            return Ok(report);
        }

        let results = join_all(groups.iter().map(|(table, records)| async move {
            (table, records.len(), self.write_table(table, records).await)
        }))
        .await;

        let mut first_error = None;
        for (table, count, result) in results {
            match result {
                Ok(table_report) => report += table_report,
                Err(e) => {
                    warn!("{}: {} records not written: {}", table, count, e);
                    report.failed += count;
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if report.written == 0 => Err(e),
            _ => Ok(report),
        }
    }

    fn endpoint(&self) -> String {
        self.executor.endpoint()
    }

    async fn close(&self) -> BackendResult<()> {
        debug!("closing {}", self.id);
        self.executor.close().await
    }
}
