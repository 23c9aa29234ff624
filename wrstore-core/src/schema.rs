//! Schema bootstrap from embedded DDL.
//!
//! Statements are embedded at compile time and applied in lexicographic
//! filename order. Every statement is idempotent (`IF NOT EXISTS`), so the
//! bootstrap can run on every handle construction.

use tokio_postgres::Client;

use crate::error::{Result, StoreError};

/// Schema version this build reads and writes.
pub const SCHEMA_VERSION: i64 = 1;

/// Embedded DDL in lexicographic filename order.
const DDL: &[(&str, &str)] = &[
    ("001_mounts.sql", include_str!("../sql/001_mounts.sql")),
    (
        "002_active_snapshots.sql",
        include_str!("../sql/002_active_snapshots.sql"),
    ),
    ("003_dguta.sql", include_str!("../sql/003_dguta.sql")),
    ("004_children.sql", include_str!("../sql/004_children.sql")),
    (
        "005_basedirs_group_usage.sql",
        include_str!("../sql/005_basedirs_group_usage.sql"),
    ),
    (
        "006_basedirs_user_usage.sql",
        include_str!("../sql/006_basedirs_user_usage.sql"),
    ),
    (
        "007_basedirs_group_subdirs.sql",
        include_str!("../sql/007_basedirs_group_subdirs.sql"),
    ),
    (
        "008_basedirs_user_subdirs.sql",
        include_str!("../sql/008_basedirs_user_subdirs.sql"),
    ),
    (
        "009_basedirs_history.sql",
        include_str!("../sql/009_basedirs_history.sql"),
    ),
    ("010_files.sql", include_str!("../sql/010_files.sql")),
    (
        "011_schema_version.sql",
        include_str!("../sql/011_schema_version.sql"),
    ),
];

/// Apply the embedded DDL and enforce the schema-version gate.
///
/// Safe to call on every open; a populated database is a no-op apart from
/// the version check.
pub async fn ensure_schema(client: &Client) -> Result<()> {
    for (name, sql) in DDL {
        log::debug!("Applying DDL; statement={}", name);
        client.batch_execute(sql).await?;
    }

    ensure_version(client).await
}

/// Check the schema-version singleton, inserting it on a fresh database.
async fn ensure_version(client: &Client) -> Result<()> {
    let rows = client
        .query("SELECT version FROM wrstat_schema_version", &[])
        .await?;

    if rows.is_empty() {
        client
            .execute(
                "INSERT INTO wrstat_schema_version (version) VALUES ($1)",
                &[&SCHEMA_VERSION],
            )
            .await?;
        log::info!("Initialized schema; version={}", SCHEMA_VERSION);
        return Ok(());
    }

    for row in &rows {
        let found: i64 = row.get(0);
        if found != SCHEMA_VERSION {
            return Err(StoreError::SchemaVersion {
                found,
                expected: SCHEMA_VERSION,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ddl_lexicographic_order() {
        let names: Vec<&str> = DDL.iter().map(|(name, _)| *name).collect();
        let mut sorted = names.clone();
        sorted.sort_unstable();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_ddl_statements_idempotent() {
        for (name, sql) in DDL {
            assert!(
                sql.contains("IF NOT EXISTS"),
                "{} is not guarded by IF NOT EXISTS",
                name
            );
        }
    }

    #[test]
    fn test_ddl_covers_all_tables() {
        let all: String = DDL.iter().map(|(_, sql)| *sql).collect();
        for table in [
            "wrstat_mounts",
            "wrstat_active_snapshots",
            "wrstat_dguta",
            "wrstat_children",
            "wrstat_basedirs_group_usage",
            "wrstat_basedirs_user_usage",
            "wrstat_basedirs_group_subdirs",
            "wrstat_basedirs_user_subdirs",
            "wrstat_basedirs_history",
            "wrstat_files",
            "wrstat_schema_version",
        ] {
            assert!(all.contains(table), "missing DDL for {}", table);
        }
    }

    #[test]
    fn test_active_snapshot_view_uses_argmax() {
        let (_, view) = DDL
            .iter()
            .find(|(name, _)| name.starts_with("002"))
            .unwrap();
        assert!(view.contains("argMax(snapshot_id, switched_at)"));
        assert!(view.contains("argMax(updated_at, switched_at)"));
    }
}
