//! Directory-tree summaries over the aggregate table.
//!
//! Scoping rules: a directory inside a configured mountpoint gets a
//! single-mount plan whose snapshot id resolves to a scalar constant via a
//! subquery on the active-snapshot view; a directory above every mountpoint
//! gets an ancestor-scope plan joined against all active snapshots under
//! it. Both plans put the partition keys into PREWHERE.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_postgres::types::ToSql;

use crate::cache::NameCache;
use crate::config::Config;
use crate::db::{pooled, row_u64, with_timeout, Pool};
use crate::dguta::{AGE_ALL, AGE_BUCKETS};
use crate::error::{Result, StoreError};
use crate::paths::{ensure_trailing_slash, resolve_mount};
use crate::snapshot::list_active;

/// Optional filters applied to a directory summary.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Age-bucket code; the default is "all ages".
    pub age: u8,
    /// Restrict to these uids.
    pub uids: Option<Vec<u32>>,
    /// Restrict to these gids.
    pub gids: Option<Vec<u32>>,
    /// Restrict to entries matching this file-type mask.
    pub ft_mask: Option<u8>,
}

/// Aggregated summary of one directory subtree.
#[derive(Debug, Clone, Serialize)]
pub struct DirSummary {
    pub dir: String,
    pub count: u64,
    pub size: u64,
    /// Oldest access time in the subtree.
    pub atime: Option<DateTime<Utc>>,
    /// Newest modification time in the subtree.
    pub mtime: Option<DateTime<Utc>>,
    /// Age code of the dominant atime bucket (ties go to the newest).
    pub common_atime: u8,
    /// Age code of the dominant mtime bucket (ties go to the newest).
    pub common_mtime: u8,
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
    pub users: Vec<String>,
    pub groups: Vec<String>,
    /// Union of the file-type masks in the summary.
    pub ft: u8,
    /// The requested age bucket.
    pub age: u8,
    /// Scan time of the newest contributing snapshot.
    pub modtime: Option<DateTime<Utc>>,
}

/// Query scope for a normalized directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Scope {
    /// The directory sits inside this mountpoint.
    SingleMount { mount: String },
    /// The directory sits above the mountpoints; every active snapshot
    /// whose mount begins with it contributes.
    Ancestor,
}

impl Scope {
    /// The value bound as `$1`: the mount path, or the directory itself as
    /// a mount-path prefix.
    pub(crate) fn key<'a>(&'a self, dir: &'a str) -> &'a str {
        match self {
            Scope::SingleMount { mount } => mount,
            Scope::Ancestor => dir,
        }
    }
}

/// Choose the plan for a normalized directory.
pub(crate) fn plan_scope(dir: &str, mounts: &[String]) -> Scope {
    match resolve_mount(dir, mounts.iter().map(String::as_str)) {
        Some(mount) => Scope::SingleMount {
            mount: mount.to_string(),
        },
        None => Scope::Ancestor,
    }
}

/// PREWHERE clause scoping a snapshot-partitioned table, with `$1` as the
/// scope key. The single-mount form resolves the snapshot id into a scalar
/// constant; the ancestor form admits every active snapshot under the key.
pub(crate) fn scope_prewhere(scope: &Scope, table_alias: &str) -> String {
    let a = if table_alias.is_empty() {
        String::new()
    } else {
        format!("{}.", table_alias)
    };
    match scope {
        Scope::SingleMount { .. } => format!(
            "PREWHERE {a}mount_path = $1 AND {a}snapshot_id = \
             (SELECT snapshot_id FROM wrstat_active_snapshots WHERE mount_path = $1)",
            a = a
        ),
        Scope::Ancestor => format!(
            "PREWHERE ({a}mount_path, {a}snapshot_id) IN \
             (SELECT mount_path, snapshot_id FROM wrstat_active_snapshots \
              WHERE startsWith(mount_path, $1))",
            a = a
        ),
    }
}

fn dir_info_sql(scope: &Scope) -> String {
    let filters = "AND ($4 = 0 OR has($5, uid)) \
                   AND ($6 = 0 OR has($7, gid)) \
                   AND ($8 = 0 OR bitAnd(ft, $9) != 0)";

    match scope {
        Scope::SingleMount { .. } => format!(
            "SELECT \
                 sum(count) AS count, \
                 sum(size) AS size, \
                 min(atime_min) AS atime, \
                 max(mtime_max) AS mtime, \
                 sumForEach(atime_buckets) AS atime_buckets, \
                 sumForEach(mtime_buckets) AS mtime_buckets, \
                 groupUniqArray(uid) AS uids, \
                 groupUniqArray(gid) AS gids, \
                 groupBitOr(ft) AS ft, \
                 (SELECT updated_at FROM wrstat_active_snapshots WHERE mount_path = $1) \
                     AS modtime \
             FROM wrstat_dguta \
             {} \
             WHERE dir = $2 AND age = $3 {}",
            scope_prewhere(scope, ""),
            filters,
        ),
        Scope::Ancestor => format!(
            "SELECT \
                 sum(d.count) AS count, \
                 sum(d.size) AS size, \
                 min(d.atime_min) AS atime, \
                 max(d.mtime_max) AS mtime, \
                 sumForEach(d.atime_buckets) AS atime_buckets, \
                 sumForEach(d.mtime_buckets) AS mtime_buckets, \
                 groupUniqArray(d.uid) AS uids, \
                 groupUniqArray(d.gid) AS gids, \
                 groupBitOr(d.ft) AS ft, \
                 max(s.updated_at) AS modtime \
             FROM wrstat_dguta AS d \
             INNER JOIN wrstat_active_snapshots AS s \
                 ON d.mount_path = s.mount_path AND d.snapshot_id = s.snapshot_id \
             PREWHERE startsWith(d.mount_path, $1) \
             WHERE d.dir = $2 AND d.age = $3 \
             AND ($4 = 0 OR has($5, d.uid)) \
             AND ($6 = 0 OR has($7, d.gid)) \
             AND ($8 = 0 OR bitAnd(d.ft, $9) != 0)",
        ),
    }
}

fn dir_exists_sql(scope: &Scope) -> String {
    format!(
        "SELECT count() FROM wrstat_dguta {} WHERE dir = $2",
        scope_prewhere(scope, ""),
    )
}

fn children_sql(scope: &Scope) -> String {
    format!(
        "SELECT DISTINCT child FROM wrstat_children {} \
         WHERE parent_dir = $2 ORDER BY child",
        scope_prewhere(scope, ""),
    )
}

pub(crate) fn perm_sql(scope: &Scope) -> String {
    format!(
        "SELECT 1 FROM wrstat_dguta {} \
         WHERE dir = $2 AND age = $3 AND (uid = $4 OR has($5, gid)) LIMIT 1",
        scope_prewhere(scope, ""),
    )
}

/// Age code of the dominant bucket: the index of the rightmost maximum,
/// so ties resolve to the newest bucket.
pub(crate) fn common_age(buckets: &[i64]) -> u8 {
    let mut best_idx = 0usize;
    let mut best = i64::MIN;
    for (idx, &v) in buckets.iter().enumerate().take(AGE_BUCKETS) {
        if v >= best {
            best = v;
            best_idx = idx;
        }
    }
    best_idx as u8
}

fn epoch_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

/// Reader for directory summaries, child listings and ownership checks.
pub struct Tree {
    pool: Pool,
    timeout: Duration,
    mounts: Vec<String>,
    cache: Arc<NameCache>,
}

impl Tree {
    /// Build a reader on the shared pool. When the config carries no
    /// mountpoint override, mounts are loaded from the active snapshots.
    pub async fn new(pool: Pool, cfg: &Config, cache: Arc<NameCache>) -> Result<Self> {
        let mounts = if cfg.mountpoints.is_empty() {
            let conn = pooled(&pool).await?;
            list_active(&conn)
                .await?
                .into_iter()
                .map(|s| s.mount_path)
                .collect()
        } else {
            cfg.mountpoints.clone()
        };

        Ok(Self {
            pool,
            timeout: cfg.query_timeout,
            mounts,
            cache,
        })
    }

    pub fn set_cached_user(&self, uid: u32, name: &str) {
        self.cache.set_cached_user(uid, name);
    }

    pub fn set_cached_group(&self, gid: u32, name: &str) {
        self.cache.set_cached_group(gid, name);
    }

    /// Aggregate summary of one directory subtree in the active snapshots.
    ///
    /// `DirNotFound` when the directory has no aggregate row in any active
    /// snapshot; an empty summary when it exists but the filters exclude
    /// everything.
    pub async fn dir_info(&self, dir: &str, filter: &Filter) -> Result<DirSummary> {
        let dir = ensure_trailing_slash(dir);
        let scope = plan_scope(&dir, &self.mounts);
        let key = scope.key(&dir).to_string();

        let age = filter.age as i64;
        let (uid_on, uids) = tri_state(&filter.uids);
        let (gid_on, gids) = tri_state(&filter.gids);
        let (ft_on, ft_mask) = match filter.ft_mask {
            Some(mask) => (1i64, mask as i64),
            None => (0i64, 0i64),
        };

        let sql = dir_info_sql(&scope);
        let params: [&(dyn ToSql + Sync); 9] = [
            &key, &dir, &age, &uid_on, &uids, &gid_on, &gids, &ft_on, &ft_mask,
        ];

        let conn = pooled(&self.pool).await?;
        let rows = with_timeout("dir_info", self.timeout, async {
            Ok(conn.query(&sql, &params).await?)
        })
        .await?;

        let row = match rows.first() {
            Some(row) => row,
            None => return self.empty_or_not_found(&conn, &scope, &key, &dir, filter).await,
        };

        let count = row.get::<_, Option<i64>>(0).unwrap_or(0);
        if count == 0 {
            return self.empty_or_not_found(&conn, &scope, &key, &dir, filter).await;
        }

        let atime_buckets: Vec<i64> = row.get::<_, Option<Vec<i64>>>(4).unwrap_or_default();
        let mtime_buckets: Vec<i64> = row.get::<_, Option<Vec<i64>>>(5).unwrap_or_default();

        let mut uids: Vec<u32> = row
            .get::<_, Option<Vec<i64>>>(6)
            .unwrap_or_default()
            .into_iter()
            .map(|v| v as u32)
            .collect();
        uids.sort_unstable();
        let mut gids: Vec<u32> = row
            .get::<_, Option<Vec<i64>>>(7)
            .unwrap_or_default()
            .into_iter()
            .map(|v| v as u32)
            .collect();
        gids.sort_unstable();

        let users = uids.iter().map(|&uid| self.cache.user_name(uid)).collect();
        let groups = gids.iter().map(|&gid| self.cache.group_name(gid)).collect();

        Ok(DirSummary {
            dir: dir.clone(),
            count: u64::try_from(count).map_err(|_| StoreError::IntConversion {
                field: "count",
                value: count.to_string(),
            })?,
            size: row_u64(row, 1, "size")?,
            atime: row.get::<_, Option<i64>>(2).and_then(epoch_to_datetime),
            mtime: row.get::<_, Option<i64>>(3).and_then(epoch_to_datetime),
            common_atime: common_age(&atime_buckets),
            common_mtime: common_age(&mtime_buckets),
            uids,
            gids,
            users,
            groups,
            ft: row.get::<_, Option<i64>>(8).unwrap_or(0) as u8,
            age: filter.age,
            modtime: row.get(9),
        })
    }

    async fn empty_or_not_found(
        &self,
        conn: &tokio_postgres::Client,
        scope: &Scope,
        key: &str,
        dir: &str,
        filter: &Filter,
    ) -> Result<DirSummary> {
        let sql = dir_exists_sql(scope);
        let key = key.to_string();
        let dir_s = dir.to_string();
        let rows = with_timeout("dir_exists", self.timeout, async {
            Ok(conn.query(&sql, &[&key, &dir_s]).await?)
        })
        .await?;

        let exists = rows
            .first()
            .map(|row| row.get::<_, i64>(0) > 0)
            .unwrap_or(false);
        if !exists {
            return Err(StoreError::DirNotFound(dir.to_string()));
        }

        Ok(DirSummary {
            dir: dir.to_string(),
            count: 0,
            size: 0,
            atime: None,
            mtime: None,
            common_atime: 0,
            common_mtime: 0,
            uids: Vec::new(),
            gids: Vec::new(),
            users: Vec::new(),
            groups: Vec::new(),
            ft: 0,
            age: filter.age,
            modtime: None,
        })
    }

    /// Deduplicated, sorted child paths of a directory. Empty when none.
    pub async fn children(&self, dir: &str) -> Result<Vec<String>> {
        let dir = ensure_trailing_slash(dir);
        let scope = plan_scope(&dir, &self.mounts);
        let key = scope.key(&dir).to_string();
        let sql = children_sql(&scope);

        let conn = pooled(&self.pool).await?;
        let rows = with_timeout("children", self.timeout, async {
            Ok(conn.query(&sql, &[&key, &dir]).await?)
        })
        .await?;

        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// True when at least one all-ages aggregate row at this directory is
    /// owned by the uid or one of the gids.
    pub async fn perm_any_in_dir(&self, dir: &str, uid: u32, gids: &[u32]) -> Result<bool> {
        let dir = ensure_trailing_slash(dir);
        let scope = plan_scope(&dir, &self.mounts);
        let key = scope.key(&dir).to_string();
        let sql = perm_sql(&scope);

        let age = AGE_ALL as i64;
        let uid = uid as i64;
        let gids: Vec<i64> = gids.iter().map(|&g| g as i64).collect();

        let conn = pooled(&self.pool).await?;
        let rows = with_timeout("perm_any_in_dir", self.timeout, async {
            Ok(conn.query(&sql, &[&key, &dir, &age, &uid, &gids]).await?)
        })
        .await?;

        Ok(!rows.is_empty())
    }

    /// The mounts this reader plans against.
    pub fn mounts(&self) -> &[String] {
        &self.mounts
    }
}

/// Bind an optional id set as a `(enabled, values)` pair so one SQL shape
/// serves both the filtered and unfiltered cases.
fn tri_state(ids: &Option<Vec<u32>>) -> (i64, Vec<i64>) {
    match ids {
        Some(v) => (1, v.iter().map(|&x| x as i64).collect()),
        None => (0, Vec::new()),
    }
}
