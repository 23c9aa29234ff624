//! Snapshot-consistent storage core for filesystem-usage analytics.
//!
//! Periodic scans of very large filesystems land here as snapshots in a
//! MergeTree-family columnar store: per-directory aggregates, parent/child
//! edges, per-group and per-user basedir usage with projected quota
//! exhaustion dates, and per-file metadata rows. Writers ingest one
//! `(mount_path, updated_at)` run into its own partition; an activation-row
//! append publishes the snapshot atomically; readers always resolve the
//! freshest snapshot per mountpoint and superseded partitions are dropped.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use wrstore_core::config::Config;
//! use wrstore_core::provider::Provider;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = Config::new("host=localhost dbname=wrstat", "wrstat");
//! let provider = Provider::open(&cfg).await?;
//! let tree = provider.tree().await?;
//! let summary = tree.dir_info("/lustre/scratch123", &Default::default()).await?;
//! println!("{} files, {} bytes", summary.count, summary.size);
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - [`config`] — Configuration and validation
//! - [`db`] — Connections, TLS, the read pool, quoting, error classification
//! - [`paths`] — Path splitting, extensions, range bounds, mount resolution
//! - [`snapshot`] — Snapshot ids, active-snapshot resolution, fingerprints
//! - [`schema`] — Embedded DDL bootstrap and the schema-version gate
//! - [`partition`] — Partition drops for snapshot-scoped tables
//! - [`batch`] — Batched insert lifecycle
//! - [`dguta`] — Aggregate ingest and the snapshot commit point
//! - [`fileingest`] — Columnar per-file ingest
//! - [`basedirs`] — Basedir usage store/reader and usage history
//! - [`quota`] — Quota-exhaustion date projection
//! - [`tree`] — Directory summaries, children, ownership checks
//! - [`files`] — File stat/list and glob search
//! - [`glob`] — Glob-to-regex translation and query planning
//! - [`history`] — History maintenance operations
//! - [`provider`] — Pool ownership, polling, generational reader swap
//! - [`cache`] — Name caches and the owners mapping
//! - [`guard`] — Test-environment guard for destructive operations
//! - [`error`] — Error types

pub mod basedirs;
pub mod batch;
pub mod cache;
pub mod config;
pub mod db;
pub mod dguta;
pub mod error;
pub mod fileingest;
pub mod files;
pub mod glob;
pub mod guard;
pub mod history;
pub mod partition;
pub mod paths;
pub mod provider;
pub mod quota;
pub mod schema;
pub mod snapshot;
pub mod tree;

pub use basedirs::{BaseDirsReader, BaseDirsStore, GroupUsage, HistoryPoint, SubDir, UserUsage};
pub use config::Config;
pub use dguta::{DgutaWriter, DirAggregate, AGE_ALL, AGE_BUCKETS};
pub use error::{Result, StoreError};
pub use fileingest::{FileIngest, FileRecord};
pub use files::{FileClient, FileInfo};
pub use history::HistoryMaintainer;
pub use provider::Provider;
pub use snapshot::snapshot_id;
pub use tree::{DirSummary, Filter, Tree};
