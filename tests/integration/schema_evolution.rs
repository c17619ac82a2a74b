//! TimescaleDB tables grow new columns as records gain fields

use std::sync::Arc;

use metrics_fanout::backends::timescale::{
    ColumnType, MemoryExecutor, SchemaChange, SqlValue, TimescaleAdapter,
};
use metrics_fanout::backends::BackendAdapter;
use metrics_fanout::MetricRecord;
use pretty_assertions::assert_eq;

use crate::helpers::*;

fn adapter() -> (TimescaleAdapter, Arc<MemoryExecutor>) {
    let executor = Arc::new(MemoryExecutor::new());
    (
        TimescaleAdapter::new("timescale", "", executor.clone()),
        executor,
    )
}

#[tokio::test]
async fn test_new_field_adds_exactly_one_column() {
    let (adapter, executor) = adapter();

    adapter.write(&[tautulli_record(3)]).await.unwrap();
    let columns_before = executor.column_names("tautulli");

    let richer = tautulli_record(4).field("bandwidth", 12.5);
    let report = adapter.write(&[richer]).await.unwrap();
    assert_eq!(report.written, 1);

    let mut columns_after = executor.column_names("tautulli");
    columns_after.retain(|c| !columns_before.contains(c));
    assert_eq!(columns_after, vec!["bandwidth".to_string()]);

    let changes = executor.applied_changes();
    assert_eq!(changes.len(), 2);
    assert_eq!(
        changes[1],
        SchemaChange::AddColumn {
            table: "tautulli".to_string(),
            column: "bandwidth".to_string(),
            column_type: ColumnType::Double,
        }
    );

    let rows = executor.rows("tautulli");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("stream_count"), Some(&SqlValue::BigInt(Some(3))));
    assert_eq!(rows[0].get("bandwidth"), None);
    assert_eq!(rows[1].get("bandwidth"), Some(&SqlValue::Double(Some(12.5))));
}

#[tokio::test]
async fn test_new_tag_becomes_text_column() {
    let (adapter, executor) = adapter();

    adapter.write(&[tautulli_record(1)]).await.unwrap();
    adapter
        .write(&[tautulli_record(2).tag("player", "Living Room")])
        .await
        .unwrap();

    let table = executor.table("tautulli").unwrap();
    assert_eq!(table.columns.get("player"), Some(&ColumnType::Text));
    assert_eq!(
        table.rows[1].get("player"),
        Some(&SqlValue::Text(Some("Living Room".to_string())))
    );
}

#[tokio::test]
async fn test_measurements_provisioned_independently() {
    let (adapter, executor) = adapter();
    executor.reject_schema_changes_for("sonarr");

    let batch = vec![
        tautulli_record(5),
        MetricRecord::new("sonarr").field("queue", 2).at(sample_time()),
    ];
    let report = adapter.write(&batch).await.unwrap();

    assert_eq!(report.written, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(executor.rows("tautulli").len(), 1);
    assert!(executor.table("sonarr").is_none());
}

#[tokio::test]
async fn test_unchanged_schema_is_not_altered_again() {
    let (adapter, executor) = adapter();

    for i in 0..3 {
        adapter.write(&[tautulli_record(i)]).await.unwrap();
    }

    assert_eq!(executor.applied_changes().len(), 1);
    assert_eq!(executor.rows("tautulli").len(), 3);
}
