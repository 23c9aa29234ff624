//! Administrative maintenance of the basedirs history table.
//!
//! History rows are snapshot-independent and survive partition
//! reclamation, so rows for mounts that no longer belong to this
//! deployment (a renamed mountpoint, a copy restored from elsewhere) have
//! to be found and removed explicitly. Both operations are scoped by a
//! mount-path prefix and the destructive one sits behind the
//! test-environment guard.

use std::time::Duration;

use tokio_postgres::Client;

use crate::config::Config;
use crate::db::{connect_client, sql_string_literal, with_timeout};
use crate::error::Result;
use crate::guard::check_destructive;
use crate::paths::ensure_trailing_slash;
use crate::schema::ensure_schema;

/// One `(gid, mount_path)` pair whose history rows fall outside the
/// expected prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryIssue {
    pub gid: u32,
    pub mount_path: String,
}

fn find_invalid_sql() -> &'static str {
    "SELECT DISTINCT gid, mount_path FROM wrstat_basedirs_history \
     WHERE NOT startsWith(mount_path, $1) ORDER BY mount_path, gid"
}

/// The synchronous delete for rows outside the prefix. ALTER statements
/// are not parameterized by the server, so the prefix is escaped inline.
fn clean_sql(prefix: &str) -> String {
    format!(
        "ALTER TABLE wrstat_basedirs_history DELETE \
         WHERE NOT startsWith(mount_path, {}) \
         SETTINGS mutations_sync = 2",
        sql_string_literal(prefix),
    )
}

/// Maintainer handle with its own dedicated connection.
pub struct HistoryMaintainer {
    client: Client,
    database: String,
    timeout: Duration,
}

impl HistoryMaintainer {
    pub async fn connect(cfg: &Config) -> Result<Self> {
        let mut cfg = cfg.clone();
        cfg.validate()?;

        let client = connect_client(&cfg).await?;
        ensure_schema(&client).await?;

        Ok(Self {
            client,
            database: cfg.database,
            timeout: cfg.query_timeout,
        })
    }

    /// Distinct `(gid, mount_path)` pairs whose mount does not begin with
    /// the given prefix.
    pub async fn find_invalid(&self, prefix: &str) -> Result<Vec<HistoryIssue>> {
        let prefix = ensure_trailing_slash(prefix);

        let rows = with_timeout("find_invalid_history", self.timeout, async {
            Ok(self.client.query(find_invalid_sql(), &[&prefix]).await?)
        })
        .await?;

        let mut issues = Vec::with_capacity(rows.len());
        for row in &rows {
            issues.push(HistoryIssue {
                gid: crate::db::row_u32(row, 0, "gid")?,
                mount_path: row.get(1),
            });
        }
        Ok(issues)
    }

    /// Synchronously delete every history row whose mount does not begin
    /// with the given prefix. Refused by the test-environment guard on
    /// non-test databases.
    pub async fn clean(&self, prefix: &str) -> Result<()> {
        check_destructive("history clean", &self.database)?;

        let prefix = ensure_trailing_slash(prefix);
        log::info!(
            "Cleaning history outside prefix; prefix={}, database={}",
            prefix,
            self.database
        );

        self.client.batch_execute(&clean_sql(&prefix)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_invalid_sql_shape() {
        let sql = find_invalid_sql();
        assert!(sql.contains("SELECT DISTINCT gid, mount_path"));
        assert!(sql.contains("NOT startsWith(mount_path, $1)"));
    }

    #[test]
    fn test_clean_sql_synchronous_and_escaped() {
        let sql = clean_sql("/mnt/o'brien/");
        assert!(sql.contains("mutations_sync = 2"));
        assert!(sql.contains("NOT startsWith(mount_path, '/mnt/o\\'brien/')"));
        assert!(sql.starts_with("ALTER TABLE wrstat_basedirs_history DELETE"));
    }
}
