//! Base-directory usage: the batched store, the append-only history, and
//! the annotated reader.
//!
//! Usage rows for the "all ages" bucket are not written as they arrive:
//! their projected quota-exhaustion dates come from the history series,
//! which is still being appended during the run. They are buffered in
//! memory and inserted by `finalise` once the series can be read back.
//! Update-in-place never happens; every row is written once with its final
//! values.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio_postgres::types::Type;
use tokio_postgres::Client;
use uuid::Uuid;

use crate::batch::{bind_u64, Batch, Value};
use crate::cache::NameCache;
use crate::config::Config;
use crate::db::{connect_client, pooled, row_u32, row_u64, with_timeout, Pool};
use crate::dguta::AGE_ALL;
use crate::error::{Result, StoreError};
use crate::partition::drop_partitions;
use crate::paths::{ensure_trailing_slash, mount_key, resolve_mount_required};
use crate::quota::{date_quota_full, QuotaProjection, ZERO_DATE};
use crate::schema::ensure_schema;
use crate::snapshot::{list_active, snapshot_id};

/// One point in a group's usage history on a mount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPoint {
    pub date: NaiveDate,
    pub usage_size: u64,
    pub quota_size: u64,
    pub usage_inodes: u64,
    pub quota_inodes: u64,
}

/// Group usage at one basedir for one age bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupUsage {
    pub gid: u32,
    pub age: u8,
    pub basedir: String,
    pub uids: Vec<u32>,
    pub usage_size: u64,
    pub quota_size: u64,
    pub usage_inodes: u64,
    pub quota_inodes: u64,
    /// Newest modification time under the basedir, epoch seconds.
    pub mtime: i64,
}

/// User usage at one basedir for one age bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserUsage {
    pub uid: u32,
    pub age: u8,
    pub basedir: String,
    pub gids: Vec<u32>,
    pub usage_size: u64,
    pub quota_size: u64,
    pub usage_inodes: u64,
    pub quota_inodes: u64,
    pub mtime: i64,
}

/// One immediate subdirectory's contribution under a basedir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubDir {
    pub subdir: String,
    pub num_files: u64,
    pub size_files: u64,
    /// Newest modification time in the subdir, epoch seconds.
    pub last_modified: i64,
    /// Bytes per file-type code.
    pub file_usage: BTreeMap<u8, u64>,
}

/// Annotated group usage row returned by the reader.
#[derive(Debug, Clone, Serialize)]
pub struct GroupUsageRow {
    pub mount_path: String,
    pub gid: u32,
    pub name: String,
    pub owner: String,
    pub age: u8,
    pub basedir: String,
    pub uids: Vec<u32>,
    pub usage_size: u64,
    pub quota_size: u64,
    pub usage_inodes: u64,
    pub quota_inodes: u64,
    pub mtime: i64,
    pub date_no_space: NaiveDate,
    pub date_no_files: NaiveDate,
}

/// Annotated user usage row returned by the reader.
#[derive(Debug, Clone, Serialize)]
pub struct UserUsageRow {
    pub mount_path: String,
    pub uid: u32,
    pub name: String,
    pub age: u8,
    pub basedir: String,
    pub gids: Vec<u32>,
    pub usage_size: u64,
    pub quota_size: u64,
    pub usage_inodes: u64,
    pub quota_inodes: u64,
    pub mtime: i64,
}

/// Subdir breakdown row returned by the reader, in stored input order.
#[derive(Debug, Clone, Serialize)]
pub struct SubDirRow {
    pub pos: u32,
    pub subdir: String,
    pub num_files: u64,
    pub size_files: u64,
    pub last_modified: i64,
    pub file_usage: BTreeMap<u8, u64>,
}

const GROUP_USAGE_COLUMNS: &[&str] = &[
    "mount_path",
    "snapshot_id",
    "gid",
    "age",
    "basedir",
    "uids",
    "usage_size",
    "quota_size",
    "usage_inodes",
    "quota_inodes",
    "mtime",
    "date_no_space",
    "date_no_files",
];

const GROUP_USAGE_TYPES: &[Type] = &[
    Type::TEXT,
    Type::UUID,
    Type::INT8,
    Type::INT8,
    Type::TEXT,
    Type::INT8_ARRAY,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::DATE,
    Type::DATE,
];

const USER_USAGE_COLUMNS: &[&str] = &[
    "mount_path",
    "snapshot_id",
    "uid",
    "age",
    "basedir",
    "gids",
    "usage_size",
    "quota_size",
    "usage_inodes",
    "quota_inodes",
    "mtime",
];

const USER_USAGE_TYPES: &[Type] = &[
    Type::TEXT,
    Type::UUID,
    Type::INT8,
    Type::INT8,
    Type::TEXT,
    Type::INT8_ARRAY,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
];

const GROUP_SUBDIR_COLUMNS: &[&str] = &[
    "mount_path",
    "snapshot_id",
    "gid",
    "basedir",
    "age",
    "pos",
    "subdir",
    "num_files",
    "size_files",
    "last_modified",
    "ft_kinds",
    "ft_bytes",
];

const USER_SUBDIR_COLUMNS: &[&str] = &[
    "mount_path",
    "snapshot_id",
    "uid",
    "basedir",
    "age",
    "pos",
    "subdir",
    "num_files",
    "size_files",
    "last_modified",
    "ft_kinds",
    "ft_bytes",
];

const SUBDIR_TYPES: &[Type] = &[
    Type::TEXT,
    Type::UUID,
    Type::INT8,
    Type::TEXT,
    Type::INT8,
    Type::INT8,
    Type::TEXT,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8_ARRAY,
    Type::INT8_ARRAY,
];

fn bind_id_array(ids: &[u32]) -> Vec<i64> {
    ids.iter().map(|&v| v as i64).collect()
}

fn group_usage_row(
    mount_path: &str,
    id: Uuid,
    u: &GroupUsage,
    projection: QuotaProjection,
) -> Result<Vec<Value>> {
    Ok(vec![
        Value::Text(mount_path.to_string()),
        Value::Uuid(id),
        Value::Int(u.gid as i64),
        Value::Int(u.age as i64),
        Value::Text(u.basedir.clone()),
        Value::IntArray(bind_id_array(&u.uids)),
        Value::Int(bind_u64("usage_size", u.usage_size)?),
        Value::Int(bind_u64("quota_size", u.quota_size)?),
        Value::Int(bind_u64("usage_inodes", u.usage_inodes)?),
        Value::Int(bind_u64("quota_inodes", u.quota_inodes)?),
        Value::Int(u.mtime),
        Value::Date(projection.date_no_space.unwrap_or(ZERO_DATE)),
        Value::Date(projection.date_no_files.unwrap_or(ZERO_DATE)),
    ])
}

fn user_usage_row(mount_path: &str, id: Uuid, u: &UserUsage) -> Result<Vec<Value>> {
    Ok(vec![
        Value::Text(mount_path.to_string()),
        Value::Uuid(id),
        Value::Int(u.uid as i64),
        Value::Int(u.age as i64),
        Value::Text(u.basedir.clone()),
        Value::IntArray(bind_id_array(&u.gids)),
        Value::Int(bind_u64("usage_size", u.usage_size)?),
        Value::Int(bind_u64("quota_size", u.quota_size)?),
        Value::Int(bind_u64("usage_inodes", u.usage_inodes)?),
        Value::Int(bind_u64("quota_inodes", u.quota_inodes)?),
        Value::Int(u.mtime),
    ])
}

/// Split a file-usage map into the parallel arrays the table stores.
fn split_file_usage(file_usage: &BTreeMap<u8, u64>) -> Result<(Vec<i64>, Vec<i64>)> {
    let mut kinds = Vec::with_capacity(file_usage.len());
    let mut bytes = Vec::with_capacity(file_usage.len());
    for (&kind, &b) in file_usage {
        kinds.push(kind as i64);
        bytes.push(bind_u64("file_usage", b)?);
    }
    Ok((kinds, bytes))
}

/// Reconstitute the file-usage map from the stored parallel arrays.
fn zip_file_usage(kinds: &[i64], bytes: &[i64]) -> BTreeMap<u8, u64> {
    kinds
        .iter()
        .zip(bytes.iter())
        .map(|(&k, &b)| (k as u8, b.max(0) as u64))
        .collect()
}

fn subdir_row(
    mount_path: &str,
    id: Uuid,
    owner_id: u32,
    basedir: &str,
    age: u8,
    pos: u32,
    sub: &SubDir,
) -> Result<Vec<Value>> {
    let (kinds, bytes) = split_file_usage(&sub.file_usage)?;
    Ok(vec![
        Value::Text(mount_path.to_string()),
        Value::Uuid(id),
        Value::Int(owner_id as i64),
        Value::Text(basedir.to_string()),
        Value::Int(age as i64),
        Value::Int(pos as i64),
        Value::Text(sub.subdir.clone()),
        Value::Int(bind_u64("num_files", sub.num_files)?),
        Value::Int(bind_u64("size_files", sub.size_files)?),
        Value::Int(sub.last_modified),
        Value::IntArray(kinds),
        Value::IntArray(bytes),
    ])
}

/// Strict-newer policy: append only when no point is stored yet or the
/// candidate is strictly after the stored maximum.
fn history_accepts(stored_max: Option<NaiveDate>, candidate: NaiveDate) -> bool {
    match stored_max {
        None => true,
        Some(max) => candidate > max,
    }
}

/// Read a group's full history series on a mount, append-ordered by date.
pub(crate) async fn read_history(
    client: &Client,
    mount_path: &str,
    gid: u32,
) -> Result<Vec<HistoryPoint>> {
    let rows = client
        .query(
            "SELECT date, usage_size, quota_size, usage_inodes, quota_inodes \
             FROM wrstat_basedirs_history \
             WHERE mount_path = $1 AND gid = $2 ORDER BY date",
            &[&mount_path, &(gid as i64)],
        )
        .await?;

    let mut series = Vec::with_capacity(rows.len());
    for row in &rows {
        series.push(HistoryPoint {
            date: row.get(0),
            usage_size: row_u64(row, 1, "usage_size")?,
            quota_size: row_u64(row, 2, "quota_size")?,
            usage_inodes: row_u64(row, 3, "usage_inodes")?,
            quota_inodes: row_u64(row, 4, "quota_inodes")?,
        });
    }
    Ok(series)
}

async fn max_history_date(
    client: &Client,
    mount_path: &str,
    gid: u32,
) -> Result<Option<NaiveDate>> {
    let rows = client
        .query(
            "SELECT max(date) FROM wrstat_basedirs_history \
             WHERE mount_path = $1 AND gid = $2",
            &[&mount_path, &(gid as i64)],
        )
        .await?;

    let max: Option<NaiveDate> = match rows.first() {
        Some(row) => row.get(0),
        None => None,
    };
    // An aggregate over no rows yields the zero date rather than NULL
    Ok(max.filter(|d| *d != ZERO_DATE))
}

/// Batched store for basedirs usage, subdirs and history.
pub struct BaseDirsStore {
    client: Client,
    mount_path: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    group_usage: Batch,
    user_usage: Batch,
    group_subdirs: Batch,
    user_subdirs: Batch,
    deferred: Vec<GroupUsage>,
    ready: bool,
}

impl BaseDirsStore {
    /// Connect a store with its own dedicated connection and ensure the
    /// schema exists.
    pub async fn connect(cfg: &Config) -> Result<Self> {
        let mut cfg = cfg.clone();
        cfg.validate()?;

        let client = connect_client(&cfg).await?;
        ensure_schema(&client).await?;

        Ok(Self {
            client,
            mount_path: None,
            updated_at: None,
            group_usage: Batch::new(
                "wrstat_basedirs_group_usage",
                GROUP_USAGE_COLUMNS,
                GROUP_USAGE_TYPES,
                cfg.batch_size,
            ),
            user_usage: Batch::new(
                "wrstat_basedirs_user_usage",
                USER_USAGE_COLUMNS,
                USER_USAGE_TYPES,
                cfg.batch_size,
            ),
            group_subdirs: Batch::new(
                "wrstat_basedirs_group_subdirs",
                GROUP_SUBDIR_COLUMNS,
                SUBDIR_TYPES,
                cfg.batch_size,
            ),
            user_subdirs: Batch::new(
                "wrstat_basedirs_user_subdirs",
                USER_SUBDIR_COLUMNS,
                SUBDIR_TYPES,
                cfg.batch_size,
            ),
            deferred: Vec::new(),
            ready: false,
        })
    }

    pub fn set_mount_path(&mut self, mount_path: &str) {
        self.mount_path = Some(ensure_trailing_slash(mount_path));
        self.ready = false;
    }

    pub fn set_updated_at(&mut self, updated_at: DateTime<Utc>) {
        self.updated_at = Some(updated_at);
        self.ready = false;
    }

    fn snapshot(&self) -> Result<(String, Uuid)> {
        let mount = self
            .mount_path
            .clone()
            .ok_or_else(|| StoreError::Precondition("mount path not set".to_string()))?;
        let updated = self
            .updated_at
            .ok_or_else(|| StoreError::Precondition("updated_at not set".to_string()))?;
        let id = snapshot_id(&mount, updated);
        Ok((mount, id))
    }

    fn check_ready(&self) -> Result<()> {
        if !self.ready {
            return Err(StoreError::NotReset);
        }
        Ok(())
    }

    /// Drop this run's partitions and open fresh batches, aborting any
    /// batch left open by a previous incomplete run.
    pub async fn reset(&mut self) -> Result<()> {
        let (mount, id) = self.snapshot()?;

        drop_partitions(
            &self.client,
            &[
                "wrstat_basedirs_group_usage",
                "wrstat_basedirs_user_usage",
                "wrstat_basedirs_group_subdirs",
                "wrstat_basedirs_user_subdirs",
            ],
            &mount,
            id,
        )
        .await?;

        self.group_usage.prepare();
        self.user_usage.prepare();
        self.group_subdirs.prepare();
        self.user_subdirs.prepare();
        self.deferred.clear();
        self.ready = true;
        Ok(())
    }

    /// Store group usage. All-ages rows are deferred until `finalise` can
    /// project their quota-exhaustion dates from the history series;
    /// other ages are written immediately with the zero dates.
    pub async fn put_group_usage(&mut self, usage: &GroupUsage) -> Result<()> {
        self.check_ready()?;

        if usage.age == AGE_ALL {
            self.deferred.push(usage.clone());
            return Ok(());
        }

        let (mount, id) = self.snapshot()?;
        let row = group_usage_row(&mount, id, usage, QuotaProjection::default())?;
        if self.group_usage.append(row)? {
            self.group_usage.send(&self.client).await?;
        }
        Ok(())
    }

    /// Store user usage. Users carry no quota projection, so every age is
    /// written immediately.
    pub async fn put_user_usage(&mut self, usage: &UserUsage) -> Result<()> {
        self.check_ready()?;
        let (mount, id) = self.snapshot()?;

        let row = user_usage_row(&mount, id, usage)?;
        if self.user_usage.append(row)? {
            self.user_usage.send(&self.client).await?;
        }
        Ok(())
    }

    /// Store the subdir breakdown for a group's basedir. `pos` records the
    /// source slice index so readers reconstitute input order.
    pub async fn put_group_subdirs(
        &mut self,
        gid: u32,
        basedir: &str,
        age: u8,
        subdirs: &[SubDir],
    ) -> Result<()> {
        self.check_ready()?;
        let (mount, id) = self.snapshot()?;

        for (pos, sub) in subdirs.iter().enumerate() {
            let row = subdir_row(&mount, id, gid, basedir, age, pos as u32, sub)?;
            if self.group_subdirs.append(row)? {
                self.group_subdirs.send(&self.client).await?;
            }
        }
        Ok(())
    }

    /// Store the subdir breakdown for a user's basedir.
    pub async fn put_user_subdirs(
        &mut self,
        uid: u32,
        basedir: &str,
        age: u8,
        subdirs: &[SubDir],
    ) -> Result<()> {
        self.check_ready()?;
        let (mount, id) = self.snapshot()?;

        for (pos, sub) in subdirs.iter().enumerate() {
            let row = subdir_row(&mount, id, uid, basedir, age, pos as u32, sub)?;
            if self.user_subdirs.append(row)? {
                self.user_subdirs.send(&self.client).await?;
            }
        }
        Ok(())
    }

    /// Append one history point under the strict-newer policy. Returns
    /// whether the point was stored; out-of-order points are ignored.
    pub async fn append_group_history(
        &mut self,
        mount_path: &str,
        gid: u32,
        point: &HistoryPoint,
    ) -> Result<bool> {
        let mount_path = ensure_trailing_slash(mount_path);
        let stored_max = max_history_date(&self.client, &mount_path, gid).await?;

        if !history_accepts(stored_max, point.date) {
            log::debug!(
                "History point not newer, skipping; mount_path={}, gid={}, date={}",
                mount_path,
                gid,
                point.date
            );
            return Ok(false);
        }

        self.client
            .execute(
                "INSERT INTO wrstat_basedirs_history \
                 (mount_path, gid, date, usage_size, quota_size, usage_inodes, quota_inodes) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
                &[
                    &mount_path,
                    &(gid as i64),
                    &point.date,
                    &bind_u64("usage_size", point.usage_size)?,
                    &bind_u64("quota_size", point.quota_size)?,
                    &bind_u64("usage_inodes", point.usage_inodes)?,
                    &bind_u64("quota_inodes", point.quota_inodes)?,
                ],
            )
            .await?;
        Ok(true)
    }

    /// Insert the deferred all-ages rows with quota-exhaustion dates
    /// projected from each gid's history series.
    pub async fn finalise(&mut self) -> Result<()> {
        self.check_ready()?;
        let (mount, id) = self.snapshot()?;

        let mut projections: HashMap<u32, QuotaProjection> = HashMap::new();
        let deferred = std::mem::take(&mut self.deferred);

        for usage in &deferred {
            let projection = match projections.get(&usage.gid) {
                Some(p) => *p,
                None => {
                    let series = read_history(&self.client, &mount, usage.gid).await?;
                    let p = date_quota_full(&series);
                    projections.insert(usage.gid, p);
                    p
                }
            };

            let row = group_usage_row(&mount, id, usage, projection)?;
            if self.group_usage.append(row)? {
                self.group_usage.send(&self.client).await?;
            }
        }

        log::debug!(
            "Finalised deferred group usage; mount_path={}, rows={}",
            mount,
            deferred.len()
        );
        Ok(())
    }

    /// Send every open batch and release the connection. Deferred rows
    /// that were never finalised are finalised first.
    pub async fn close(mut self) -> Result<()> {
        if !self.deferred.is_empty() {
            self.finalise().await?;
        }

        self.group_usage.close(&self.client).await?;
        self.user_usage.close(&self.client).await?;
        self.group_subdirs.close(&self.client).await?;
        self.user_subdirs.close(&self.client).await?;
        Ok(())
    }
}

/// Annotated reader over the basedirs tables, resolving the active
/// snapshot per mount on every query.
pub struct BaseDirsReader {
    pool: Pool,
    timeout: Duration,
    mounts: Vec<String>,
    cache: Arc<NameCache>,
}

impl BaseDirsReader {
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

    /// Group usage across every mount's active snapshot for one age
    /// bucket, annotated with group names and owners.
    pub async fn group_usage(&self, age: u8) -> Result<Vec<GroupUsageRow>> {
        let conn = pooled(&self.pool).await?;
        let rows = with_timeout("group_usage", self.timeout, async {
            Ok(conn
                .query(
                    "SELECT mount_path, gid, basedir, uids, usage_size, quota_size, \
                            usage_inodes, quota_inodes, mtime, date_no_space, date_no_files \
                     FROM wrstat_basedirs_group_usage \
                     PREWHERE (mount_path, snapshot_id) IN \
                         (SELECT mount_path, snapshot_id FROM wrstat_active_snapshots) \
                     WHERE age = $1 \
                     ORDER BY mount_path, gid, basedir",
                    &[&(age as i64)],
                )
                .await?)
        })
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let gid = row_u32(row, 1, "gid")?;
            let uids: Vec<i64> = row.get(3);
            out.push(GroupUsageRow {
                mount_path: row.get(0),
                gid,
                name: self.cache.group_name(gid),
                owner: self.cache.owner(gid),
                age,
                basedir: row.get(2),
                uids: uids.into_iter().map(|v| v as u32).collect(),
                usage_size: row_u64(row, 4, "usage_size")?,
                quota_size: row_u64(row, 5, "quota_size")?,
                usage_inodes: row_u64(row, 6, "usage_inodes")?,
                quota_inodes: row_u64(row, 7, "quota_inodes")?,
                mtime: row.get(8),
                date_no_space: row.get(9),
                date_no_files: row.get(10),
            });
        }
        Ok(out)
    }

    /// User usage across every mount's active snapshot for one age bucket.
    pub async fn user_usage(&self, age: u8) -> Result<Vec<UserUsageRow>> {
        let conn = pooled(&self.pool).await?;
        let rows = with_timeout("user_usage", self.timeout, async {
            Ok(conn
                .query(
                    "SELECT mount_path, uid, basedir, gids, usage_size, quota_size, \
                            usage_inodes, quota_inodes, mtime \
                     FROM wrstat_basedirs_user_usage \
                     PREWHERE (mount_path, snapshot_id) IN \
                         (SELECT mount_path, snapshot_id FROM wrstat_active_snapshots) \
                     WHERE age = $1 \
                     ORDER BY mount_path, uid, basedir",
                    &[&(age as i64)],
                )
                .await?)
        })
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let uid = row_u32(row, 1, "uid")?;
            let gids: Vec<i64> = row.get(3);
            out.push(UserUsageRow {
                mount_path: row.get(0),
                uid,
                name: self.cache.user_name(uid),
                age,
                basedir: row.get(2),
                gids: gids.into_iter().map(|v| v as u32).collect(),
                usage_size: row_u64(row, 4, "usage_size")?,
                quota_size: row_u64(row, 5, "quota_size")?,
                usage_inodes: row_u64(row, 6, "usage_inodes")?,
                quota_inodes: row_u64(row, 7, "quota_inodes")?,
                mtime: row.get(8),
            });
        }
        Ok(out)
    }

    /// Subdir breakdown for a group's basedir, in stored input order.
    pub async fn group_subdirs(
        &self,
        gid: u32,
        basedir: &str,
        age: u8,
    ) -> Result<Vec<SubDirRow>> {
        self.subdirs("wrstat_basedirs_group_subdirs", gid, basedir, age)
            .await
    }

    /// Subdir breakdown for a user's basedir, in stored input order.
    pub async fn user_subdirs(&self, uid: u32, basedir: &str, age: u8) -> Result<Vec<SubDirRow>> {
        self.subdirs("wrstat_basedirs_user_subdirs", uid, basedir, age)
            .await
    }

    async fn subdirs(
        &self,
        table: &str,
        owner_id: u32,
        basedir: &str,
        age: u8,
    ) -> Result<Vec<SubDirRow>> {
        let id_column = if table.contains("group") { "gid" } else { "uid" };
        let sql = format!(
            "SELECT pos, subdir, num_files, size_files, last_modified, ft_kinds, ft_bytes \
             FROM {} \
             PREWHERE (mount_path, snapshot_id) IN \
                 (SELECT mount_path, snapshot_id FROM wrstat_active_snapshots) \
             WHERE {} = $1 AND basedir = $2 AND age = $3 \
             ORDER BY pos",
            crate::db::quote_ident(table),
            id_column,
        );

        let conn = pooled(&self.pool).await?;
        let rows = with_timeout("subdirs", self.timeout, async {
            Ok(conn
                .query(&sql, &[&(owner_id as i64), &basedir, &(age as i64)])
                .await?)
        })
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let kinds: Vec<i64> = row.get(5);
            let bytes: Vec<i64> = row.get(6);
            out.push(SubDirRow {
                pos: row_u32(row, 0, "pos")?,
                subdir: row.get(1),
                num_files: row_u64(row, 2, "num_files")?,
                size_files: row_u64(row, 3, "size_files")?,
                last_modified: row.get(4),
                file_usage: zip_file_usage(&kinds, &bytes),
            });
        }
        Ok(out)
    }

    /// A group's usage history for the mount owning `path`.
    pub async fn history(&self, gid: u32, path: &str) -> Result<Vec<HistoryPoint>> {
        let mount = resolve_mount_required(path, self.mounts.iter().map(String::as_str))?
            .to_string();

        let conn = pooled(&self.pool).await?;
        let series = with_timeout("history", self.timeout, async {
            read_history(&conn, &mount, gid).await
        })
        .await?;

        if series.is_empty() {
            return Err(StoreError::NoHistory {
                gid,
                mount_path: mount,
            });
        }
        Ok(series)
    }

    /// Per-mount scan timestamps keyed by the externally visible mount key
    /// (every `/` replaced with the full-width solidus). Use
    /// [`crate::paths::mount_key_to_path`] to decode keys back to paths.
    pub async fn mount_timestamps(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        let conn = pooled(&self.pool).await?;
        let snaps = with_timeout("mount_timestamps", self.timeout, async {
            list_active(&conn).await
        })
        .await?;

        Ok(snaps
            .into_iter()
            .map(|s| (mount_key(&s.mount_path), s.updated_at))
            .collect())
    }

    /// The mounts this reader resolves history paths against.
    pub fn mounts(&self) -> &[String] {
        &self.mounts
    }
}
