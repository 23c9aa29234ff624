//! Partition lifecycle for snapshot-scoped tables.
//!
//! Every table keyed by `(mount_path, snapshot_id)` is partitioned on that
//! pair, so superseded snapshots are reclaimed with a partition drop rather
//! than row deletes. Dropping a partition that was never written counts as
//! success, which is what makes pre-ingest resets and first-time ingests
//! uniform.

use tokio_postgres::Client;
use uuid::Uuid;

use crate::db::{is_unknown_partition, quote_ident, sql_string_literal};
use crate::error::{Result, StoreError};

/// Every table partitioned by `(mount_path, snapshot_id)`. The commit-time
/// reclamation in [`crate::dguta`] drops the previous snapshot's partition
/// from each of these.
pub const SNAPSHOT_TABLES: [&str; 7] = [
    "wrstat_dguta",
    "wrstat_children",
    "wrstat_basedirs_group_usage",
    "wrstat_basedirs_user_usage",
    "wrstat_basedirs_group_subdirs",
    "wrstat_basedirs_user_subdirs",
    "wrstat_files",
];

/// Build the DROP PARTITION statement for one table and snapshot pair.
///
/// ALTER statements are not parameterized by the server, so the partition
/// tuple is rendered with escaped literals.
pub fn drop_partition_sql(table: &str, mount_path: &str, snapshot_id: Uuid) -> String {
    format!(
        "ALTER TABLE {} DROP PARTITION ({}, toUUID({}))",
        quote_ident(table),
        sql_string_literal(mount_path),
        sql_string_literal(&snapshot_id.to_string()),
    )
}

/// Drop one table's partition for a snapshot pair.
///
/// An "unknown partition" response from the server is success; everything
/// else surfaces.
pub async fn drop_partition(
    client: &Client,
    table: &str,
    mount_path: &str,
    snapshot_id: Uuid,
) -> Result<()> {
    let sql = drop_partition_sql(table, mount_path, snapshot_id);
    match client.batch_execute(&sql).await {
        Ok(()) => Ok(()),
        Err(e) if is_unknown_partition(&e) => {
            log::debug!(
                "Partition already absent; table={}, mount_path={}, snapshot_id={}",
                table,
                mount_path,
                snapshot_id
            );
            Ok(())
        }
        Err(e) => Err(StoreError::Database(e)),
    }
}

/// Drop the snapshot pair's partition from each named table.
pub async fn drop_partitions(
    client: &Client,
    tables: &[&str],
    mount_path: &str,
    snapshot_id: Uuid,
) -> Result<()> {
    for table in tables {
        drop_partition(client, table, mount_path, snapshot_id).await?;
    }
    Ok(())
}

/// Best-effort variant used on failure paths, where the original error
/// must win. Logs and swallows drop errors.
pub async fn drop_partitions_best_effort(
    client: &Client,
    tables: &[&str],
    mount_path: &str,
    snapshot_id: Uuid,
) {
    for table in tables {
        if let Err(e) = drop_partition(client, table, mount_path, snapshot_id).await {
            log::warn!(
                "Cleanup partition drop failed; table={}, mount_path={}, snapshot_id={}, error={}",
                table,
                mount_path,
                snapshot_id,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_partition_sql() {
        let id = Uuid::nil();
        let sql = drop_partition_sql("wrstat_dguta", "/mnt/a/", id);
        assert_eq!(
            sql,
            "ALTER TABLE `wrstat_dguta` DROP PARTITION \
             ('/mnt/a/', toUUID('00000000-0000-0000-0000-000000000000'))"
        );
    }

    #[test]
    fn test_drop_partition_sql_escapes_mount() {
        let sql = drop_partition_sql("wrstat_files", "/mnt/o'brien/", Uuid::nil());
        assert!(sql.contains("'/mnt/o\\'brien/'"));
    }

    #[test]
    fn test_snapshot_tables_complete() {
        // Every snapshot-scoped entity's table reclaims on commit
        assert!(SNAPSHOT_TABLES.contains(&"wrstat_dguta"));
        assert!(SNAPSHOT_TABLES.contains(&"wrstat_children"));
        assert!(SNAPSHOT_TABLES.contains(&"wrstat_basedirs_group_usage"));
        assert!(SNAPSHOT_TABLES.contains(&"wrstat_basedirs_user_usage"));
        assert!(SNAPSHOT_TABLES.contains(&"wrstat_basedirs_group_subdirs"));
        assert!(SNAPSHOT_TABLES.contains(&"wrstat_basedirs_user_subdirs"));
        assert!(SNAPSHOT_TABLES.contains(&"wrstat_files"));
        // History is snapshot-independent and must never appear here
        assert!(!SNAPSHOT_TABLES.contains(&"wrstat_basedirs_history"));
        assert!(!SNAPSHOT_TABLES.contains(&"wrstat_mounts"));
    }
}
