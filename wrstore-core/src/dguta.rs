//! Directory-aggregate ingest and the snapshot commit point.
//!
//! The DGUTA writer batches per-directory aggregates and parent/child
//! edges for one `(mount_path, updated_at)` run. Its `close` owns the
//! commit: after all writers have flushed, it appends the activation row
//! that atomically publishes the snapshot, then reclaims the previous
//! snapshot's partitions across every snapshot-scoped table.

use chrono::{DateTime, Utc};
use tokio_postgres::types::Type;
use tokio_postgres::Client;
use uuid::Uuid;

use crate::batch::{bind_u64, Batch, Value};
use crate::config::Config;
use crate::db::connect_client;
use crate::error::{Result, StoreError};
use crate::partition::{
    drop_partitions, drop_partitions_best_effort, SNAPSHOT_TABLES,
};
use crate::paths::ensure_trailing_slash;
use crate::schema::ensure_schema;
use crate::snapshot::{resolve_active, snapshot_id};

/// Age-bucket code for the distinguished "all ages" bucket.
pub const AGE_ALL: u8 = 0;

/// Number of fixed age classes; bucket arrays carry exactly this many slots.
pub const AGE_BUCKETS: usize = 9;

/// One per-directory aggregate row, keyed by directory, age bucket, gid,
/// uid and file-type mask.
#[derive(Debug, Clone, PartialEq)]
pub struct DirAggregate {
    /// Directory path, trailing `/`.
    pub dir: String,
    /// Age-bucket code, 0–8; 0 is "all ages".
    pub age: u8,
    pub gid: u32,
    pub uid: u32,
    /// File-type bitmask.
    pub ft: u8,
    pub count: u64,
    pub size: u64,
    /// Oldest access time in the aggregate, epoch seconds.
    pub atime_min: i64,
    /// Newest modification time in the aggregate, epoch seconds.
    pub mtime_max: i64,
    pub atime_buckets: [u64; AGE_BUCKETS],
    pub mtime_buckets: [u64; AGE_BUCKETS],
}

const DGUTA_COLUMNS: &[&str] = &[
    "mount_path",
    "snapshot_id",
    "dir",
    "age",
    "gid",
    "uid",
    "ft",
    "count",
    "size",
    "atime_min",
    "mtime_max",
    "atime_buckets",
    "mtime_buckets",
];

const DGUTA_TYPES: &[Type] = &[
    Type::TEXT,
    Type::UUID,
    Type::TEXT,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8_ARRAY,
    Type::INT8_ARRAY,
];

const CHILDREN_COLUMNS: &[&str] = &["mount_path", "snapshot_id", "parent_dir", "child"];

const CHILDREN_TYPES: &[Type] = &[Type::TEXT, Type::UUID, Type::TEXT, Type::TEXT];

/// Resolve the writer's target snapshot, failing before any side effect
/// when the mount path or scan time was never set.
fn require_snapshot(
    mount_path: &Option<String>,
    updated_at: &Option<DateTime<Utc>>,
) -> Result<(String, DateTime<Utc>, Uuid)> {
    let mount = mount_path
        .clone()
        .ok_or_else(|| StoreError::Precondition("mount path not set".to_string()))?;
    let updated = updated_at
        .ok_or_else(|| StoreError::Precondition("updated_at not set".to_string()))?;
    let id = snapshot_id(&mount, updated);
    Ok((mount, updated, id))
}

/// Build one buffered dguta row.
fn dguta_row(mount_path: &str, id: Uuid, agg: &DirAggregate) -> Result<Vec<Value>> {
    let atime_buckets = bind_buckets("atime_buckets", &agg.atime_buckets)?;
    let mtime_buckets = bind_buckets("mtime_buckets", &agg.mtime_buckets)?;

    Ok(vec![
        Value::Text(mount_path.to_string()),
        Value::Uuid(id),
        Value::Text(agg.dir.clone()),
        Value::Int(agg.age as i64),
        Value::Int(agg.gid as i64),
        Value::Int(agg.uid as i64),
        Value::Int(agg.ft as i64),
        Value::Int(bind_u64("count", agg.count)?),
        Value::Int(bind_u64("size", agg.size)?),
        Value::Int(agg.atime_min),
        Value::Int(agg.mtime_max),
        Value::IntArray(atime_buckets),
        Value::IntArray(mtime_buckets),
    ])
}

fn bind_buckets(field: &'static str, buckets: &[u64; AGE_BUCKETS]) -> Result<Vec<i64>> {
    buckets.iter().map(|&b| bind_u64(field, b)).collect()
}

/// Normalize a child edge: parent keeps its trailing `/`, the child is a
/// full path with none.
fn child_edge(parent_dir: &str, child: &str) -> (String, String) {
    let parent = ensure_trailing_slash(parent_dir);
    let child = if child.len() > 1 && child.ends_with('/') {
        child[..child.len() - 1].to_string()
    } else {
        child.to_string()
    };
    (parent, child)
}

/// Batched writer for directory aggregates and child edges, and the owner
/// of the snapshot commit.
pub struct DgutaWriter {
    client: Client,
    mount_path: Option<String>,
    updated_at: Option<DateTime<Utc>>,
    dguta: Batch,
    children: Batch,
    ready: bool,
}

impl DgutaWriter {
    /// Connect a writer with its own dedicated connection and ensure the
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
            dguta: Batch::new("wrstat_dguta", DGUTA_COLUMNS, DGUTA_TYPES, cfg.batch_size),
            children: Batch::new(
                "wrstat_children",
                CHILDREN_COLUMNS,
                CHILDREN_TYPES,
                cfg.batch_size,
            ),
            ready: false,
        })
    }

    /// Set the mount this run ingests. Normalized to a trailing `/`.
    pub fn set_mount_path(&mut self, mount_path: &str) {
        self.mount_path = Some(ensure_trailing_slash(mount_path));
        self.ready = false;
    }

    /// Set the scan time this run ingests.
    pub fn set_updated_at(&mut self, updated_at: DateTime<Utc>) {
        self.updated_at = Some(updated_at);
        self.ready = false;
    }

    /// The deterministic snapshot id this run writes under.
    pub fn snapshot_id(&self) -> Result<Uuid> {
        require_snapshot(&self.mount_path, &self.updated_at).map(|(_, _, id)| id)
    }

    /// Drop this run's target partitions and open fresh batches, aborting
    /// any batch left open by a previous incomplete ingest. Makes reruns
    /// of the same `(mount_path, updated_at)` idempotent.
    pub async fn reset(&mut self) -> Result<()> {
        let (mount, _, id) = require_snapshot(&self.mount_path, &self.updated_at)?;

        drop_partitions(
            &self.client,
            &["wrstat_dguta", "wrstat_children"],
            &mount,
            id,
        )
        .await?;

        self.dguta.prepare();
        self.children.prepare();
        self.ready = true;
        Ok(())
    }

    async fn ensure_ready(&mut self) -> Result<()> {
        if !self.ready {
            self.reset().await?;
        }
        Ok(())
    }

    /// Buffer one aggregate row, sending the batch when it fills.
    pub async fn add(&mut self, agg: &DirAggregate) -> Result<()> {
        self.ensure_ready().await?;
        let (mount, _, id) = require_snapshot(&self.mount_path, &self.updated_at)?;

        if self.dguta.append(dguta_row(&mount, id, agg)?)? {
            self.dguta.send(&self.client).await?;
        }
        Ok(())
    }

    /// Buffer one parent/child edge, sending the batch when it fills.
    pub async fn add_child(&mut self, parent_dir: &str, child: &str) -> Result<()> {
        self.ensure_ready().await?;
        let (mount, _, id) = require_snapshot(&self.mount_path, &self.updated_at)?;
        let (parent, child) = child_edge(parent_dir, child);

        let row = vec![
            Value::Text(mount),
            Value::Uuid(id),
            Value::Text(parent),
            Value::Text(child),
        ];
        if self.children.append(row)? {
            self.children.send(&self.client).await?;
        }
        Ok(())
    }

    /// Buffer the edges for every child of one directory.
    pub async fn add_children(&mut self, parent_dir: &str, children: &[String]) -> Result<()> {
        for child in children {
            self.add_child(parent_dir, child).await?;
        }
        Ok(())
    }

    /// Commit the snapshot.
    ///
    /// Flushes the remaining batches, reads the previously active snapshot,
    /// appends the activation row (the atomic publish), then drops the
    /// previous snapshot's partitions across every snapshot-scoped table.
    /// Any failure before the publish drops this run's partitions so an
    /// un-switched ingest never lingers.
    pub async fn close(mut self) -> Result<()> {
        let (mount, updated, id) = require_snapshot(&self.mount_path, &self.updated_at)?;

        if let Err(e) = self.flush_all().await {
            self.cleanup(&mount, id).await;
            return Err(e);
        }

        let previous = match resolve_active(&self.client, &mount).await {
            Ok(prev) => prev,
            Err(e) => {
                self.cleanup(&mount, id).await;
                return Err(e);
            }
        };

        let publish = self
            .client
            .execute(
                "INSERT INTO wrstat_mounts (mount_path, snapshot_id, updated_at, switched_at) \
                 VALUES ($1, $2, $3, now64(9))",
                &[&mount, &id, &updated],
            )
            .await;
        if let Err(e) = publish {
            self.cleanup(&mount, id).await;
            return Err(StoreError::Database(e));
        }

        log::info!(
            "Snapshot switched; mount_path={}, snapshot_id={}, rows={}, children={}",
            mount,
            id,
            self.dguta.appended_total(),
            self.children.appended_total()
        );

        if let Some(prev) = previous {
            if prev.snapshot_id != id {
                drop_partitions(&self.client, &SNAPSHOT_TABLES, &mount, prev.snapshot_id)
                    .await?;
                log::info!(
                    "Previous snapshot reclaimed; mount_path={}, snapshot_id={}",
                    mount,
                    prev.snapshot_id
                );
            }
        }

        Ok(())
    }

    async fn flush_all(&mut self) -> Result<()> {
        self.dguta.close(&self.client).await?;
        self.children.close(&self.client).await?;
        Ok(())
    }

    async fn cleanup(&self, mount: &str, id: Uuid) {
        drop_partitions_best_effort(
            &self.client,
            &["wrstat_dguta", "wrstat_children"],
            mount,
            id,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agg(dir: &str) -> DirAggregate {
        DirAggregate {
            dir: dir.to_string(),
            age: AGE_ALL,
            gid: 100,
            uid: 200,
            ft: 1,
            count: 3,
            size: 4096,
            atime_min: 1_600_000_000,
            mtime_max: 1_700_000_000,
            atime_buckets: [3, 0, 0, 0, 0, 0, 0, 0, 0],
            mtime_buckets: [0, 0, 0, 0, 0, 0, 0, 0, 3],
        }
    }

    #[test]
    fn test_require_snapshot_missing_mount() {
        let err = require_snapshot(&None, &Some(Utc::now())).unwrap_err();
        assert!(matches!(err, StoreError::Precondition(_)));
        assert!(err.to_string().contains("mount path"));
    }

    #[test]
    fn test_require_snapshot_missing_updated_at() {
        let err = require_snapshot(&Some("/mnt/a/".to_string()), &None).unwrap_err();
        assert!(err.to_string().contains("updated_at"));
    }

    #[test]
    fn test_require_snapshot_derives_id() {
        let t = DateTime::from_timestamp(1_754_000_000, 0).unwrap();
        let (mount, updated, id) =
            require_snapshot(&Some("/mnt/a/".to_string()), &Some(t)).unwrap();
        assert_eq!(mount, "/mnt/a/");
        assert_eq!(updated, t);
        assert_eq!(id, snapshot_id("/mnt/a/", t));
    }

    #[test]
    fn test_dguta_row_shape() {
        let id = Uuid::nil();
        let row = dguta_row("/mnt/a/", id, &agg("/mnt/a/projects/")).unwrap();
        assert_eq!(row.len(), DGUTA_COLUMNS.len());
        assert_eq!(row[0], Value::Text("/mnt/a/".to_string()));
        assert_eq!(row[2], Value::Text("/mnt/a/projects/".to_string()));
        assert_eq!(row[11], Value::IntArray(vec![3, 0, 0, 0, 0, 0, 0, 0, 0]));
        assert_eq!(row[12], Value::IntArray(vec![0, 0, 0, 0, 0, 0, 0, 0, 3]));
    }

    #[test]
    fn test_child_edge_normalization() {
        assert_eq!(
            child_edge("/mnt/a", "/mnt/a/sub/"),
            ("/mnt/a/".to_string(), "/mnt/a/sub".to_string())
        );
        assert_eq!(
            child_edge("/mnt/a/", "/mnt/a/file"),
            ("/mnt/a/".to_string(), "/mnt/a/file".to_string())
        );
    }

    #[test]
    fn test_column_type_parity() {
        assert_eq!(DGUTA_COLUMNS.len(), DGUTA_TYPES.len());
        assert_eq!(CHILDREN_COLUMNS.len(), CHILDREN_TYPES.len());
    }
}
