//! File-level queries: directory listing, point stat, directory test and
//! glob search over the per-file rows.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_postgres::types::ToSql;
use tokio_postgres::Row;

use crate::cache::NameCache;
use crate::config::Config;
use crate::db::{build_pool, pooled, row_u32, row_u64, with_timeout, Pool};
use crate::error::{Result, StoreError};
use crate::fileingest::ENTRY_TYPE_DIR;
use crate::glob::{
    chunk_range, effective_limit, fetch_budget, group_by_mount, merge_paths,
    MAX_PATTERNS_PER_QUERY,
};
use crate::paths::{ensure_trailing_slash, split_parent_and_name};
use crate::snapshot::list_active;
use crate::tree::{plan_scope, scope_prewhere, Scope};

/// The accepted field names for file queries.
pub const FILE_FIELDS: [&str; 16] = [
    "path",
    "parent_dir",
    "name",
    "ext",
    "entry_type",
    "size",
    "apparent_size",
    "uid",
    "gid",
    "user",
    "group",
    "atime",
    "mtime",
    "ctime",
    "inode",
    "nlink",
];

/// One file row, annotated with user/group names where selected.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub parent_dir: String,
    pub name: String,
    pub ext: String,
    pub entry_type: u8,
    pub size: u64,
    pub apparent_size: u64,
    pub uid: u32,
    pub gid: u32,
    pub user: String,
    pub group: String,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub inode: u64,
    pub nlink: u64,
}

/// Reject field names outside the accepted set before any query runs.
pub fn validate_fields(fields: &[&str]) -> Result<()> {
    for field in fields {
        if !FILE_FIELDS.contains(field) {
            return Err(StoreError::UnknownField((*field).to_string()));
        }
    }
    Ok(())
}

/// SQL expression projecting one field.
fn field_expr(field: &str) -> &'static str {
    match field {
        "path" => "concat(parent_dir, name)",
        "parent_dir" => "parent_dir",
        "name" => "name",
        "ext" => "ext",
        "entry_type" => "entry_type",
        "size" => "size",
        "apparent_size" => "apparent_size",
        "uid" | "user" => "uid",
        "gid" | "group" => "gid",
        "atime" => "atime",
        "mtime" => "mtime",
        "ctime" => "ctime",
        "inode" => "inode",
        "nlink" => "nlink",
        _ => unreachable!("field validated"),
    }
}

fn projection(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| field_expr(f))
        .collect::<Vec<_>>()
        .join(", ")
}

fn apply_field(
    info: &mut FileInfo,
    field: &str,
    row: &Row,
    idx: usize,
    cache: &NameCache,
) -> Result<()> {
    match field {
        "path" => info.path = row.get(idx),
        "parent_dir" => info.parent_dir = row.get(idx),
        "name" => info.name = row.get(idx),
        "ext" => info.ext = row.get(idx),
        "entry_type" => info.entry_type = row.get::<_, i8>(idx) as u8,
        "size" => info.size = row_u64(row, idx, "size")?,
        "apparent_size" => info.apparent_size = row_u64(row, idx, "apparent_size")?,
        "uid" => info.uid = row_u32(row, idx, "uid")?,
        "gid" => info.gid = row_u32(row, idx, "gid")?,
        "user" => info.user = cache.user_name(row_u32(row, idx, "uid")?),
        "group" => info.group = cache.group_name(row_u32(row, idx, "gid")?),
        "atime" => info.atime = row.get(idx),
        "mtime" => info.mtime = row.get(idx),
        "ctime" => info.ctime = row.get(idx),
        "inode" => info.inode = row_u64(row, idx, "inode")?,
        "nlink" => info.nlink = row_u64(row, idx, "nlink")?,
        _ => unreachable!("field validated"),
    }
    Ok(())
}

fn map_row(fields: &[&str], row: &Row, cache: &NameCache) -> Result<FileInfo> {
    let mut info = FileInfo::default();
    for (idx, field) in fields.iter().enumerate() {
        apply_field(&mut info, field, row, idx, cache)?;
    }
    Ok(info)
}

fn glob_sql(scope: &Scope, n_patterns: usize, fields: &[&str]) -> String {
    let matches: Vec<String> = (0..n_patterns)
        .map(|i| format!("match(concat(parent_dir, name), ${})", 4 + i))
        .collect();
    let own_base = 4 + n_patterns;

    format!(
        "SELECT {} FROM wrstat_files {} \
         WHERE parent_dir >= $2 AND parent_dir < $3 \
         AND ({}) \
         AND (${} = 0 OR uid = ${} OR has(${}, gid)) \
         ORDER BY parent_dir, name LIMIT ${} OFFSET ${}",
        projection(fields),
        scope_prewhere(scope, ""),
        matches.join(" OR "),
        own_base,
        own_base + 1,
        own_base + 2,
        own_base + 3,
        own_base + 4,
    )
}

/// Client for file stat, listing and glob search against the active
/// snapshots.
pub struct FileClient {
    pool: Pool,
    timeout: Duration,
    mounts: Vec<String>,
    cache: Arc<NameCache>,
}

impl FileClient {
    /// Connect a standalone client with its own pool and cache.
    pub async fn connect(cfg: &Config) -> Result<Self> {
        let mut cfg = cfg.clone();
        cfg.validate()?;

        let pool = build_pool(&cfg).await?;
        {
            let conn = pooled(&pool).await?;
            crate::schema::ensure_schema(&conn).await?;
        }

        let cache = Arc::new(match &cfg.owners_path {
            Some(path) => NameCache::with_owners_file(path)?,
            None => NameCache::new(),
        });

        Self::new(pool, &cfg, cache).await
    }

    /// Build a client on the shared pool. When the config carries no
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

    /// List a directory's immediate entries ordered by name. `fields`
    /// restricts the populated columns; empty means all. Non-positive
    /// limits fall back to the safety cap.
    pub async fn list_dir(
        &self,
        dir: &str,
        fields: &[&str],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FileInfo>> {
        let fields = resolve_fields(fields)?;
        let dir = ensure_trailing_slash(dir);
        let scope = plan_scope(&dir, &self.mounts);
        let key = scope.key(&dir).to_string();

        let sql = format!(
            "SELECT {} FROM wrstat_files {} \
             WHERE parent_dir = $2 ORDER BY name LIMIT $3 OFFSET $4",
            projection(&fields),
            scope_prewhere(&scope, ""),
        );

        let limit = effective_limit(limit);
        let offset = offset.max(0);

        let conn = pooled(&self.pool).await?;
        let rows = with_timeout("list_dir", self.timeout, async {
            Ok(conn.query(&sql, &[&key, &dir, &limit, &offset]).await?)
        })
        .await?;

        rows.iter()
            .map(|row| map_row(&fields, row, &self.cache))
            .collect()
    }

    /// Stat one path by its `(parent_dir, name)` compound key.
    pub async fn stat_path(&self, path: &str, fields: &[&str]) -> Result<FileInfo> {
        let fields = resolve_fields(fields)?;
        match self.stat_exact(path, &fields).await? {
            Some(info) => Ok(info),
            None => Err(StoreError::PathNotFound(path.to_string())),
        }
    }

    async fn stat_exact(&self, path: &str, fields: &[&str]) -> Result<Option<FileInfo>> {
        let (parent_dir, name) = split_parent_and_name(path);
        let scope = plan_scope(&parent_dir, &self.mounts);
        let key = scope.key(&parent_dir).to_string();

        let sql = format!(
            "SELECT {} FROM wrstat_files {} \
             WHERE parent_dir = $2 AND name = $3 LIMIT 1",
            projection(fields),
            scope_prewhere(&scope, ""),
        );

        let conn = pooled(&self.pool).await?;
        let rows = with_timeout("stat_path", self.timeout, async {
            Ok(conn.query(&sql, &[&key, &parent_dir, &name]).await?)
        })
        .await?;

        match rows.first() {
            Some(row) => Ok(Some(map_row(fields, row, &self.cache)?)),
            None => Ok(None),
        }
    }

    /// True when the path exists and is a directory. Directory rows keep a
    /// trailing `/` in their name, so a bare path is retried with one.
    pub async fn is_dir(&self, path: &str) -> Result<bool> {
        let fields = ["entry_type"];

        if let Some(info) = self.stat_exact(path, &fields).await? {
            return Ok(info.entry_type == ENTRY_TYPE_DIR);
        }
        if !path.ends_with('/') {
            if let Some(info) = self
                .stat_exact(&ensure_trailing_slash(path), &fields)
                .await?
            {
                return Ok(info.entry_type == ENTRY_TYPE_DIR);
            }
        }
        Ok(false)
    }

    /// Find files matching gitignore-style patterns anchored under base
    /// directories.
    ///
    /// Work is grouped by mount and chunked to at most
    /// [`MAX_PATTERNS_PER_QUERY`] patterns per query; results are merged,
    /// sorted by full path and deduplicated. An optional ownership filter
    /// keeps rows owned by the uid or any of the gids.
    pub async fn find_by_glob(
        &self,
        base_dirs: &[&str],
        patterns: &[&str],
        ownership: Option<(u32, &[u32])>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FileInfo>> {
        if base_dirs.is_empty() || patterns.is_empty() {
            return Ok(Vec::new());
        }

        let fields: Vec<&str> = FILE_FIELDS.to_vec();
        let groups = group_by_mount(base_dirs, patterns, &self.mounts)?;

        let (own_on, own_uid, own_gids): (i64, i64, Vec<i64>) = match ownership {
            Some((uid, gids)) => (1, uid as i64, gids.iter().map(|&g| g as i64).collect()),
            None => (0, 0, Vec::new()),
        };

        let total_queries: usize = groups
            .values()
            .map(|works| works.len().div_ceil(MAX_PATTERNS_PER_QUERY))
            .sum();
        let single_query = total_queries == 1;

        let limit_n = effective_limit(limit);
        let offset_n = offset.max(0);
        let budget = fetch_budget(limit, offset);

        let mut merged: Vec<FileInfo> = Vec::new();
        let conn = pooled(&self.pool).await?;

        for (mount, works) in &groups {
            let scope = Scope::SingleMount {
                mount: mount.clone(),
            };

            for chunk in works.chunks(MAX_PATTERNS_PER_QUERY) {
                let (range_start, range_end) = chunk_range(chunk);
                let sql = glob_sql(&scope, chunk.len(), &fields);

                let (q_limit, q_offset) = if single_query {
                    (limit_n, offset_n)
                } else {
                    (budget, 0)
                };

                let mut params: Vec<&(dyn ToSql + Sync)> =
                    Vec::with_capacity(chunk.len() + 7);
                params.push(mount);
                params.push(&range_start);
                params.push(&range_end);
                for work in chunk {
                    params.push(&work.regex);
                }
                params.push(&own_on);
                params.push(&own_uid);
                params.push(&own_gids);
                params.push(&q_limit);
                params.push(&q_offset);

                let rows = with_timeout("find_by_glob", self.timeout, async {
                    Ok(conn.query(&sql, &params).await?)
                })
                .await?;

                for row in &rows {
                    merged.push(map_row(&fields, row, &self.cache)?);
                }
            }
        }

        if single_query {
            return Ok(merged);
        }
        Ok(merge_paths(merged, |f| f.path.as_str(), limit, offset))
    }

    /// True when at least one all-ages aggregate row at this directory is
    /// owned by the uid or one of the gids.
    pub async fn perm_any_in_dir(&self, dir: &str, uid: u32, gids: &[u32]) -> Result<bool> {
        let dir = ensure_trailing_slash(dir);
        let scope = plan_scope(&dir, &self.mounts);
        let key = scope.key(&dir).to_string();
        let sql = crate::tree::perm_sql(&scope);

        let age = crate::dguta::AGE_ALL as i64;
        let uid = uid as i64;
        let gids: Vec<i64> = gids.iter().map(|&g| g as i64).collect();

        let conn = pooled(&self.pool).await?;
        let rows = with_timeout("perm_any_in_dir", self.timeout, async {
            Ok(conn.query(&sql, &[&key, &dir, &age, &uid, &gids]).await?)
        })
        .await?;

        Ok(!rows.is_empty())
    }

    /// The mounts this client plans against.
    pub fn mounts(&self) -> &[String] {
        &self.mounts
    }
}

fn resolve_fields<'a>(fields: &[&'a str]) -> Result<Vec<&'a str>> {
    validate_fields(fields)?;
    if fields.is_empty() {
        Ok(FILE_FIELDS.to_vec())
    } else {
        Ok(fields.to_vec())
    }
}
