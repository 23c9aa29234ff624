//! Per-file metadata ingest.
//!
//! The file stream is the billion-row path, so its batch is a struct of
//! parallel per-column vectors appended slice-per-column and shipped with
//! one binary COPY per send. Row-at-a-time convenience sits on top of the
//! columnar buffer, not the other way around.

use chrono::{DateTime, Utc};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::binary_copy::BinaryCopyInWriter;
use tokio_postgres::Client;
use uuid::Uuid;

use crate::batch::bind_u64;
use crate::config::Config;
use crate::db::{connect_client, quote_ident};
use crate::error::{Result, StoreError};
use crate::partition::drop_partition;
use crate::paths::{derive_ext_lower, ensure_trailing_slash};
use crate::schema::ensure_schema;
use crate::snapshot::snapshot_id;

/// Entry-type byte for directories; directory names keep their trailing `/`.
pub const ENTRY_TYPE_DIR: u8 = b'd';

/// Entry-type byte for regular files.
pub const ENTRY_TYPE_FILE: u8 = b'f';

/// Entry-type byte for symlinks.
pub const ENTRY_TYPE_SYMLINK: u8 = b'l';

/// One file record from the upstream stats parser. `parent_dir` arrives
/// already normalized with its trailing `/`.
#[derive(Debug, Clone)]
pub struct FileRecord<'a> {
    pub parent_dir: &'a str,
    pub name: &'a str,
    pub entry_type: u8,
    pub size: u64,
    pub apparent_size: u64,
    pub uid: u32,
    pub gid: u32,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub inode: u64,
    pub nlink: u64,
}

const FILE_COLUMNS: &[&str] = &[
    "mount_path",
    "snapshot_id",
    "parent_dir",
    "name",
    "ext",
    "entry_type",
    "size",
    "apparent_size",
    "uid",
    "gid",
    "atime",
    "mtime",
    "ctime",
    "inode",
    "nlink",
];

const FILE_TYPES: &[Type] = &[
    Type::TEXT,
    Type::UUID,
    Type::TEXT,
    Type::TEXT,
    Type::TEXT,
    Type::CHAR,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
    Type::INT8,
];

/// Typed column buffers for the file stream.
#[derive(Debug, Default, Clone)]
pub struct FileColumns {
    pub parent_dirs: Vec<String>,
    pub names: Vec<String>,
    pub exts: Vec<String>,
    pub entry_types: Vec<i8>,
    pub sizes: Vec<i64>,
    pub apparent_sizes: Vec<i64>,
    pub uids: Vec<i64>,
    pub gids: Vec<i64>,
    pub atimes: Vec<i64>,
    pub mtimes: Vec<i64>,
    pub ctimes: Vec<i64>,
    pub inodes: Vec<i64>,
    pub nlinks: Vec<i64>,
}

impl FileColumns {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            parent_dirs: Vec::with_capacity(capacity),
            names: Vec::with_capacity(capacity),
            exts: Vec::with_capacity(capacity),
            entry_types: Vec::with_capacity(capacity),
            sizes: Vec::with_capacity(capacity),
            apparent_sizes: Vec::with_capacity(capacity),
            uids: Vec::with_capacity(capacity),
            gids: Vec::with_capacity(capacity),
            atimes: Vec::with_capacity(capacity),
            mtimes: Vec::with_capacity(capacity),
            ctimes: Vec::with_capacity(capacity),
            inodes: Vec::with_capacity(capacity),
            nlinks: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.parent_dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent_dirs.is_empty()
    }

    pub fn clear(&mut self) {
        self.parent_dirs.clear();
        self.names.clear();
        self.exts.clear();
        self.entry_types.clear();
        self.sizes.clear();
        self.apparent_sizes.clear();
        self.uids.clear();
        self.gids.clear();
        self.atimes.clear();
        self.mtimes.clear();
        self.ctimes.clear();
        self.inodes.clear();
        self.nlinks.clear();
    }

    /// Push one record, deriving its extension.
    pub fn push_record(&mut self, rec: &FileRecord<'_>) -> Result<()> {
        let is_dir = rec.entry_type == ENTRY_TYPE_DIR;
        self.parent_dirs.push(rec.parent_dir.to_string());
        self.names.push(rec.name.to_string());
        self.exts.push(derive_ext_lower(rec.name, is_dir));
        self.entry_types.push(rec.entry_type as i8);
        self.sizes.push(bind_u64("size", rec.size)?);
        self.apparent_sizes
            .push(bind_u64("apparent_size", rec.apparent_size)?);
        self.uids.push(rec.uid as i64);
        self.gids.push(rec.gid as i64);
        self.atimes.push(rec.atime);
        self.mtimes.push(rec.mtime);
        self.ctimes.push(rec.ctime);
        self.inodes.push(bind_u64("inode", rec.inode)?);
        self.nlinks.push(bind_u64("nlink", rec.nlink)?);
        Ok(())
    }

    /// Append another buffer slice-per-column.
    pub fn extend_from(&mut self, other: &FileColumns) {
        self.parent_dirs.extend_from_slice(&other.parent_dirs);
        self.names.extend_from_slice(&other.names);
        self.exts.extend_from_slice(&other.exts);
        self.entry_types.extend_from_slice(&other.entry_types);
        self.sizes.extend_from_slice(&other.sizes);
        self.apparent_sizes
            .extend_from_slice(&other.apparent_sizes);
        self.uids.extend_from_slice(&other.uids);
        self.gids.extend_from_slice(&other.gids);
        self.atimes.extend_from_slice(&other.atimes);
        self.mtimes.extend_from_slice(&other.mtimes);
        self.ctimes.extend_from_slice(&other.ctimes);
        self.inodes.extend_from_slice(&other.inodes);
        self.nlinks.extend_from_slice(&other.nlinks);
    }
}

/// Batched ingest of file rows for one snapshot.
pub struct FileIngest {
    client: Client,
    mount_path: String,
    snapshot_id: Uuid,
    cols: FileColumns,
    capacity: usize,
    closed: bool,
    sends: u64,
    appended_total: u64,
}

impl FileIngest {
    /// Connect an ingest for one `(mount_path, updated_at)` run.
    ///
    /// Drops this run's files partition first so a rerun is idempotent.
    pub async fn connect(
        cfg: &Config,
        mount_path: &str,
        updated_at: DateTime<Utc>,
    ) -> Result<Self> {
        let mut cfg = cfg.clone();
        cfg.validate()?;

        let mount_path = ensure_trailing_slash(mount_path);
        let id = snapshot_id(&mount_path, updated_at);

        let client = connect_client(&cfg).await?;
        ensure_schema(&client).await?;
        drop_partition(&client, "wrstat_files", &mount_path, id).await?;

        Ok(Self {
            client,
            mount_path,
            snapshot_id: id,
            cols: FileColumns::with_capacity(cfg.batch_size),
            capacity: cfg.batch_size,
            closed: false,
            sends: 0,
            appended_total: 0,
        })
    }

    /// The snapshot id this ingest writes under.
    pub fn snapshot_id(&self) -> Uuid {
        self.snapshot_id
    }

    /// Append pre-built column buffers slice-per-column, sending whenever
    /// the batch reaches capacity.
    pub async fn append_columns(&mut self, cols: &FileColumns) -> Result<()> {
        self.check_open()?;
        self.appended_total += cols.len() as u64;
        self.cols.extend_from(cols);
        if self.cols.len() >= self.capacity {
            self.send().await?;
        }
        Ok(())
    }

    /// Append a single record.
    pub async fn add(&mut self, rec: &FileRecord<'_>) -> Result<()> {
        self.check_open()?;
        self.cols.push_record(rec)?;
        self.appended_total += 1;
        if self.cols.len() >= self.capacity {
            self.send().await?;
        }
        Ok(())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(StoreError::Precondition(
                "file ingest already closed".to_string(),
            ));
        }
        Ok(())
    }

    async fn send(&mut self) -> Result<()> {
        if self.cols.is_empty() {
            return Ok(());
        }

        let sql = format!(
            "COPY {} ({}) FROM STDIN BINARY",
            quote_ident("wrstat_files"),
            FILE_COLUMNS.join(", ")
        );

        let sink = self.client.copy_in(&sql).await?;
        let writer = BinaryCopyInWriter::new(sink, FILE_TYPES);
        tokio::pin!(writer);

        let c = &self.cols;
        for i in 0..c.len() {
            let row: [&(dyn ToSql + Sync); 15] = [
                &self.mount_path,
                &self.snapshot_id,
                &c.parent_dirs[i],
                &c.names[i],
                &c.exts[i],
                &c.entry_types[i],
                &c.sizes[i],
                &c.apparent_sizes[i],
                &c.uids[i],
                &c.gids[i],
                &c.atimes[i],
                &c.mtimes[i],
                &c.ctimes[i],
                &c.inodes[i],
                &c.nlinks[i],
            ];
            writer.as_mut().write(&row).await?;
        }

        writer.finish().await?;
        self.sends += 1;
        log::debug!(
            "File batch sent; mount_path={}, rows={}, sends={}",
            self.mount_path,
            self.cols.len(),
            self.sends
        );
        self.cols.clear();
        Ok(())
    }

    /// Send any residue and release the connection.
    pub async fn close(mut self) -> Result<()> {
        self.check_open()?;
        self.send().await?;
        self.closed = true;
        log::info!(
            "File ingest closed; mount_path={}, snapshot_id={}, rows={}",
            self.mount_path,
            self.snapshot_id,
            self.appended_total
        );
        Ok(())
    }
}
