//! Integration tests for wrstore-core.
//!
//! Requires a running MergeTree-family analytic server reachable over the
//! driver's wire protocol. Set TEST_DATABASE_URL, e.g.:
//!   TEST_DATABASE_URL="host=localhost user=wrstore dbname=default"
//!
//! Each test creates its own uniquely named, test-prefixed database and
//! drops it afterwards. Without TEST_DATABASE_URL the tests return early
//! so the suite passes on machines with no server.
//!
//! Run with: cargo test --test integration_test

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};

use wrstore_core::basedirs::{BaseDirsStore, GroupUsage, HistoryPoint};
use wrstore_core::config::{dsn_with_database, Config};
use wrstore_core::db;
use wrstore_core::dguta::{DgutaWriter, DirAggregate, AGE_ALL};
use wrstore_core::fileingest::{FileIngest, FileRecord, ENTRY_TYPE_FILE};
use wrstore_core::files::FileClient;
use wrstore_core::provider::Provider;
use wrstore_core::quota::ZERO_DATE;
use wrstore_core::snapshot::snapshot_id;
use wrstore_core::StoreError;

static COUNTER: AtomicU64 = AtomicU64::new(0);

macro_rules! require_db {
    () => {
        match std::env::var("TEST_DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("TEST_DATABASE_URL not set; skipping integration test");
                return;
            }
        }
    };
}

/// Build a config pointing at a fresh uniquely named test database.
fn test_config(base_url: &str, prefix: &str) -> Config {
    let id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let database = format!("test_wrstore_{}_{}_{}", prefix, std::process::id(), id);

    let mut cfg = Config::new(dsn_with_database(base_url, &database), database);
    cfg.poll_interval = Duration::ZERO;
    cfg.batch_size = 10_000;
    cfg
}

async fn teardown(cfg: &Config) {
    if let Err(e) = db::drop_database(cfg).await {
        eprintln!("teardown failed for {}: {}", cfg.database, e);
    }
}

fn ts(rfc3339: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(rfc3339)
        .unwrap()
        .with_timezone(&Utc)
}

fn agg(dir: &str, uid: u32, gid: u32) -> DirAggregate {
    DirAggregate {
        dir: dir.to_string(),
        age: AGE_ALL,
        gid,
        uid,
        ft: 1,
        count: 10,
        size: 1 << 20,
        atime_min: 1_600_000_000,
        mtime_max: 1_700_000_000,
        atime_buckets: [10, 0, 0, 0, 0, 0, 0, 0, 0],
        mtime_buckets: [0, 0, 0, 0, 0, 0, 0, 0, 10],
    }
}

fn file(parent: &'static str, name: &'static str) -> FileRecord<'static> {
    FileRecord {
        parent_dir: parent,
        name,
        entry_type: ENTRY_TYPE_FILE,
        size: 2048,
        apparent_size: 2000,
        uid: 501,
        gid: 601,
        atime: 1_690_000_000,
        mtime: 1_695_000_000,
        ctime: 1_695_000_001,
        inode: 42,
        nlink: 1,
    }
}

/// Write one minimal committed snapshot: a dguta row for the mount root
/// plus the given children.
async fn write_snapshot(
    cfg: &Config,
    mount: &str,
    updated_at: DateTime<Utc>,
    dirs: &[&str],
    children: &[(&str, &str)],
) {
    let mut writer = DgutaWriter::connect(cfg).await.expect("writer connect");
    writer.set_mount_path(mount);
    writer.set_updated_at(updated_at);

    for dir in dirs {
        writer.add(&agg(dir, 501, 601)).await.expect("add dguta");
    }
    for (parent, child) in children {
        writer.add_child(parent, child).await.expect("add child");
    }

    writer.close().await.expect("writer close");
}

// ─── Scenarios ───

#[tokio::test]
async fn test_schema_bootstrap_idempotent() {
    let url = require_db!();
    let cfg = test_config(&url, "bootstrap");

    // First open bootstraps a fresh database
    let provider = Provider::open(&cfg).await.expect("first open");

    {
        let conn = provider.pool().get().await.expect("pooled conn");
        let rows = conn
            .query("SELECT version FROM wrstat_schema_version", &[])
            .await
            .expect("version query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get::<_, i64>(0), 1);
    }
    provider.close().await;

    // Second open is a no-op
    let provider = Provider::open(&cfg).await.expect("second open");
    {
        let conn = provider.pool().get().await.expect("pooled conn");
        let rows = conn
            .query("SELECT version FROM wrstat_schema_version", &[])
            .await
            .expect("version query");
        assert_eq!(rows.len(), 1);
    }
    provider.close().await;

    teardown(&cfg).await;
}

#[tokio::test]
async fn test_atomic_swap_replaces_children() {
    let url = require_db!();
    let cfg = test_config(&url, "swap");
    let mount = "/mnt/test/";

    write_snapshot(
        &cfg,
        mount,
        ts("2026-01-08T12:00:00Z"),
        &["/mnt/test/"],
        &[("/mnt/test/", "/mnt/test/oldchild")],
    )
    .await;

    let provider = Provider::open(&cfg).await.expect("open");
    let tree = provider.tree().await.expect("tree");
    assert_eq!(
        tree.children("/mnt/test").await.expect("children"),
        vec!["/mnt/test/oldchild".to_string()]
    );

    write_snapshot(
        &cfg,
        mount,
        ts("2026-01-09T12:00:00Z"),
        &["/mnt/test/", "/mnt/test/sub/"],
        &[("/mnt/test/", "/mnt/test/a"), ("/mnt/test/", "/mnt/test/b")],
    )
    .await;

    // A fresh reader sees only the new snapshot's children
    let tree = provider.tree().await.expect("tree");
    assert_eq!(
        tree.children("/mnt/test").await.expect("children"),
        vec!["/mnt/test/a".to_string(), "/mnt/test/b".to_string()]
    );

    provider.close().await;
    teardown(&cfg).await;
}

#[tokio::test]
async fn test_list_dir_active_snapshot_only() {
    let url = require_db!();
    let cfg = test_config(&url, "listdir");
    let mount = "/mnt/test/";

    // Older snapshot holds a file that must become invisible
    let t1 = ts("2026-01-08T12:00:00Z");
    let ingest = {
        let mut ingest = FileIngest::connect(&cfg, mount, t1).await.expect("ingest");
        ingest
            .add(&file("/mnt/test/dir/", "zzz_old.txt"))
            .await
            .expect("add");
        ingest
    };
    ingest.close().await.expect("ingest close");
    write_snapshot(&cfg, mount, t1, &["/mnt/test/"], &[]).await;

    let t2 = ts("2026-01-09T12:00:00Z");
    let mut ingest = FileIngest::connect(&cfg, mount, t2).await.expect("ingest");
    for name in ["a.txt", "b.txt", "c.txt"] {
        let rec = FileRecord {
            name,
            ..file("/mnt/test/dir/", "")
        };
        ingest.add(&rec).await.expect("add");
    }
    ingest.close().await.expect("ingest close");
    write_snapshot(&cfg, mount, t2, &["/mnt/test/"], &[]).await;

    let provider = Provider::open(&cfg).await.expect("open");
    let client = FileClient::new(provider.pool().clone(), &cfg, Arc::default())
        .await
        .expect("file client");

    let rows = client
        .list_dir("/mnt/test/dir", &[], 100, 0)
        .await
        .expect("list_dir");
    let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a.txt", "b.txt", "c.txt"]);

    let rows = client
        .list_dir("/mnt/test/dir", &[], 2, 1)
        .await
        .expect("list_dir paged");
    let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["b.txt", "c.txt"]);

    provider.close().await;
    teardown(&cfg).await;
}

#[tokio::test]
async fn test_perm_any_in_dir_ownership() {
    let url = require_db!();
    let cfg = test_config(&url, "perm");
    let mount = "/mnt/test/";

    let mut writer = DgutaWriter::connect(&cfg).await.expect("writer");
    writer.set_mount_path(mount);
    writer.set_updated_at(ts("2026-01-08T12:00:00Z"));
    writer
        .add(&agg("/mnt/test/dir/", 222, 111))
        .await
        .expect("add");
    writer.close().await.expect("close");

    let provider = Provider::open(&cfg).await.expect("open");
    let tree = provider.tree().await.expect("tree");

    assert!(tree
        .perm_any_in_dir("/mnt/test/dir", 222, &[])
        .await
        .expect("uid match"));
    assert!(tree
        .perm_any_in_dir("/mnt/test/dir", 999, &[111])
        .await
        .expect("gid match"));
    assert!(!tree
        .perm_any_in_dir("/mnt/test/dir", 999, &[999])
        .await
        .expect("no match"));

    provider.close().await;
    teardown(&cfg).await;
}

#[tokio::test]
async fn test_find_by_glob_returns_sorted_matches() {
    let url = require_db!();
    let cfg = test_config(&url, "glob");
    let mount = "/M/";
    let t = ts("2026-01-08T12:00:00Z");

    let mut ingest = FileIngest::connect(&cfg, mount, t).await.expect("ingest");
    ingest
        .add(&file("/M/humgen/projects/A/", "file1"))
        .await
        .expect("add");
    ingest
        .add(&file("/M/humgen/projects/A/", "file2"))
        .await
        .expect("add");
    ingest
        .add(&file("/M/humgen/projects/B/", "file3"))
        .await
        .expect("add");
    ingest
        .add(&file("/M/humgen/other/", "file4"))
        .await
        .expect("add");
    ingest.close().await.expect("ingest close");
    write_snapshot(&cfg, mount, t, &["/M/"], &[]).await;

    let provider = Provider::open(&cfg).await.expect("open");
    let mut cfg_mounted = cfg.clone();
    cfg_mounted.mountpoints = vec![mount.to_string()];
    let client = FileClient::new(provider.pool().clone(), &cfg_mounted, Arc::default())
        .await
        .expect("file client");

    let rows = client
        .find_by_glob(&["/M/"], &["**/projects/*/file*"], None, 100, 0)
        .await
        .expect("glob");
    let paths: Vec<&str> = rows.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(
        paths,
        vec![
            "/M/humgen/projects/A/file1",
            "/M/humgen/projects/A/file2",
            "/M/humgen/projects/B/file3",
        ]
    );

    provider.close().await;
    teardown(&cfg).await;
}

#[tokio::test]
async fn test_strict_newer_history() {
    let url = require_db!();
    let cfg = test_config(&url, "history");
    let mount = "/mnt/test/";

    let mut store = BaseDirsStore::connect(&cfg).await.expect("store");

    let d1 = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
    let d2 = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
    let d0 = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();

    let point = |date: NaiveDate| HistoryPoint {
        date,
        usage_size: 100,
        quota_size: 1000,
        usage_inodes: 10,
        quota_inodes: 100,
    };

    assert!(store
        .append_group_history(mount, 7, &point(d1))
        .await
        .expect("append d1"));
    assert!(store
        .append_group_history(mount, 7, &point(d2))
        .await
        .expect("append d2"));
    assert!(!store
        .append_group_history(mount, 7, &point(d0))
        .await
        .expect("append d0 ignored"));

    let provider = Provider::open(&cfg).await.expect("open");
    let mut cfg_mounted = cfg.clone();
    cfg_mounted.mountpoints = vec![mount.to_string()];
    let reader = wrstore_core::basedirs::BaseDirsReader::new(
        provider.pool().clone(),
        &cfg_mounted,
        Arc::default(),
    )
    .await
    .expect("reader");

    let series = reader.history(7, "/mnt/test/anything").await.expect("history");
    let dates: Vec<NaiveDate> = series.iter().map(|p| p.date).collect();
    assert_eq!(dates, vec![d1, d2]);

    provider.close().await;
    teardown(&cfg).await;
}

// ─── Lifecycle properties ───

#[tokio::test]
async fn test_idempotent_rerun_same_snapshot() {
    let url = require_db!();
    let cfg = test_config(&url, "rerun");
    let mount = "/mnt/test/";
    let t = ts("2026-01-08T12:00:00Z");

    for _ in 0..2 {
        write_snapshot(
            &cfg,
            mount,
            t,
            &["/mnt/test/"],
            &[("/mnt/test/", "/mnt/test/only")],
        )
        .await;
    }

    let provider = Provider::open(&cfg).await.expect("open");
    let tree = provider.tree().await.expect("tree");
    assert_eq!(
        tree.children("/mnt/test").await.expect("children"),
        vec!["/mnt/test/only".to_string()]
    );

    // The visible row set matches a single run
    let conn = provider.pool().get().await.expect("conn");
    let rows = conn
        .query(
            "SELECT count() FROM wrstat_dguta WHERE mount_path = $1 AND snapshot_id = $2",
            &[&mount, &snapshot_id(mount, t)],
        )
        .await
        .expect("count");
    assert_eq!(rows[0].get::<_, i64>(0), 1);
    drop(conn);

    provider.close().await;
    teardown(&cfg).await;
}

#[tokio::test]
async fn test_partition_reclamation_on_second_close() {
    let url = require_db!();
    let cfg = test_config(&url, "reclaim");
    let mount = "/mnt/test/";
    let t1 = ts("2026-01-08T12:00:00Z");
    let t2 = ts("2026-01-09T12:00:00Z");

    write_snapshot(&cfg, mount, t1, &["/mnt/test/"], &[]).await;
    write_snapshot(&cfg, mount, t2, &["/mnt/test/"], &[]).await;

    let provider = Provider::open(&cfg).await.expect("open");
    let conn = provider.pool().get().await.expect("conn");

    let old_rows = conn
        .query(
            "SELECT count() FROM wrstat_dguta WHERE mount_path = $1 AND snapshot_id = $2",
            &[&mount, &snapshot_id(mount, t1)],
        )
        .await
        .expect("old count");
    assert_eq!(old_rows[0].get::<_, i64>(0), 0, "previous partition lingers");

    let new_rows = conn
        .query(
            "SELECT count() FROM wrstat_dguta WHERE mount_path = $1 AND snapshot_id = $2",
            &[&mount, &snapshot_id(mount, t2)],
        )
        .await
        .expect("new count");
    assert_eq!(new_rows[0].get::<_, i64>(0), 1);
    drop(conn);

    provider.close().await;
    teardown(&cfg).await;
}

#[tokio::test]
async fn test_quota_date_backfill_on_finalise() {
    let url = require_db!();
    let cfg = test_config(&url, "quota");
    let mount = "/mnt/test/";
    let t = ts("2026-01-08T12:00:00Z");

    let mut store = BaseDirsStore::connect(&cfg).await.expect("store");
    store.set_mount_path(mount);
    store.set_updated_at(t);
    store.reset().await.expect("reset");

    // gid 7 grows 100 bytes/day toward a 10k quota; gid 8 has no history
    for (day, usage) in [(1u32, 100u64), (2, 200), (3, 300)] {
        store
            .append_group_history(
                mount,
                7,
                &HistoryPoint {
                    date: NaiveDate::from_ymd_opt(2026, 1, day).unwrap(),
                    usage_size: usage,
                    quota_size: 10_000,
                    usage_inodes: 1,
                    quota_inodes: 0,
                },
            )
            .await
            .expect("history");
    }

    let usage = |gid: u32| GroupUsage {
        gid,
        age: AGE_ALL,
        basedir: "/mnt/test/projects/team/".to_string(),
        uids: vec![501],
        usage_size: 300,
        quota_size: 10_000,
        usage_inodes: 1,
        quota_inodes: 0,
        mtime: 1_700_000_000,
    };
    store.put_group_usage(&usage(7)).await.expect("put 7");
    store.put_group_usage(&usage(8)).await.expect("put 8");
    store.finalise().await.expect("finalise");
    store.close().await.expect("close");

    write_snapshot(&cfg, mount, t, &["/mnt/test/"], &[]).await;

    let provider = Provider::open(&cfg).await.expect("open");
    let reader = wrstore_core::basedirs::BaseDirsReader::new(
        provider.pool().clone(),
        &cfg,
        Arc::default(),
    )
    .await
    .expect("reader");

    let rows = reader.group_usage(AGE_ALL).await.expect("group usage");
    let by_gid: BTreeMap<u32, _> = rows.into_iter().map(|r| (r.gid, r)).collect();

    assert_ne!(by_gid[&7].date_no_space, ZERO_DATE, "projection missing");
    // No inode quota -> zero date on that axis
    assert_eq!(by_gid[&7].date_no_files, ZERO_DATE);
    // No history -> both dates zero
    assert_eq!(by_gid[&8].date_no_space, ZERO_DATE);
    assert_eq!(by_gid[&8].date_no_files, ZERO_DATE);

    provider.close().await;
    teardown(&cfg).await;
}

#[tokio::test]
async fn test_dir_not_found_vs_filtered_empty() {
    let url = require_db!();
    let cfg = test_config(&url, "notfound");
    let mount = "/mnt/test/";

    write_snapshot(&cfg, mount, ts("2026-01-08T12:00:00Z"), &["/mnt/test/dir/"], &[]).await;

    let provider = Provider::open(&cfg).await.expect("open");
    let tree = provider.tree().await.expect("tree");

    let err = tree
        .dir_info("/mnt/test/nowhere", &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DirNotFound(_)));

    // The dir exists but the uid filter excludes every row
    let filter = wrstore_core::Filter {
        uids: Some(vec![999_999]),
        ..Default::default()
    };
    let summary = tree
        .dir_info("/mnt/test/dir", &filter)
        .await
        .expect("filtered empty is success");
    assert_eq!(summary.count, 0);

    provider.close().await;
    teardown(&cfg).await;
}

#[tokio::test]
async fn test_provider_swap_on_new_activation() {
    let url = require_db!();
    let mut cfg = test_config(&url, "poll");
    cfg.poll_interval = Duration::from_millis(200);
    let mount = "/mnt/test/";

    write_snapshot(&cfg, mount, ts("2026-01-08T12:00:00Z"), &["/mnt/test/"], &[]).await;

    let provider = Provider::open(&cfg).await.expect("open");
    let (notify_tx, mut notify_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
    provider.on_update(move || {
        let _ = notify_tx.send(());
    });

    // Give the poller a tick to record its baseline
    tokio::time::sleep(Duration::from_millis(500)).await;

    write_snapshot(
        &cfg,
        mount,
        ts("2026-01-09T12:00:00Z"),
        &["/mnt/test/", "/mnt/test/new/"],
        &[("/mnt/test/", "/mnt/test/new")],
    )
    .await;

    tokio::time::timeout(Duration::from_secs(10), notify_rx.recv())
        .await
        .expect("update callback never fired")
        .expect("callback channel closed");

    let tree = provider.tree().await.expect("tree");
    assert_eq!(
        tree.children("/mnt/test").await.expect("children"),
        vec!["/mnt/test/new".to_string()]
    );

    provider.close().await;
    teardown(&cfg).await;
}
