//! Snapshot identity and active-snapshot resolution.
//!
//! A snapshot is the complete row set for one `(mount_path, updated_at)`
//! pair. Its id is a UUIDv5 over a fixed namespace, so re-running an ingest
//! for the same pair lands in the same partition, and the activation table
//! append in [`crate::dguta`] is what makes a snapshot visible.

use chrono::{DateTime, SecondsFormat, Utc};
use tokio_postgres::Client;
use uuid::Uuid;

use crate::error::Result;

/// Namespace for snapshot id derivation. Fixed forever: changing it would
/// orphan every stored partition.
pub const SNAPSHOT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x9c, 0x1d, 0x11, 0x7a, 0x5e, 0x0b, 0x4f, 0x2d, 0x8f, 0x4a, 0x33, 0x60, 0x21, 0x9e, 0x44,
    0x7b,
]);

/// Canonical timestamp form used in ids and fingerprints: UTC RFC 3339 with
/// nine fractional digits.
pub fn canonical_timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Derive the deterministic snapshot id for a mount and scan time.
pub fn snapshot_id(mount_path: &str, updated_at: DateTime<Utc>) -> Uuid {
    let name = format!("{}|{}", mount_path, canonical_timestamp(updated_at));
    Uuid::new_v5(&SNAPSHOT_NAMESPACE, name.as_bytes())
}

/// One mount's currently active snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveSnapshot {
    pub mount_path: String,
    pub snapshot_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

/// Resolve the active snapshot for one mount, if any.
pub async fn resolve_active(
    client: &Client,
    mount_path: &str,
) -> Result<Option<ActiveSnapshot>> {
    let rows = client
        .query(
            "SELECT snapshot_id, updated_at FROM wrstat_active_snapshots \
             WHERE mount_path = $1",
            &[&mount_path],
        )
        .await?;

    Ok(rows.first().map(|row| ActiveSnapshot {
        mount_path: mount_path.to_string(),
        snapshot_id: row.get(0),
        updated_at: row.get(1),
    }))
}

/// List every mount's active snapshot, ordered by mount path.
pub async fn list_active(client: &Client) -> Result<Vec<ActiveSnapshot>> {
    let rows = client
        .query(
            "SELECT mount_path, snapshot_id, updated_at \
             FROM wrstat_active_snapshots ORDER BY mount_path",
            &[],
        )
        .await?;

    Ok(rows
        .iter()
        .map(|row| ActiveSnapshot {
            mount_path: row.get(0),
            snapshot_id: row.get(1),
            updated_at: row.get(2),
        })
        .collect())
}

/// Fingerprint of the active-snapshot set, used by the poller for change
/// detection: `mount_path|timestamp\n` pairs in mount order.
pub fn fingerprint(snapshots: &[ActiveSnapshot]) -> String {
    let mut out = String::new();
    for snap in snapshots {
        out.push_str(&snap.mount_path);
        out.push('|');
        out.push_str(&canonical_timestamp(snap.updated_at));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, TimeZone};

    fn at(secs: i64, nanos: u32) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, nanos).unwrap()
    }

    #[test]
    fn test_snapshot_id_deterministic() {
        let t = at(1_754_000_000, 123);
        assert_eq!(snapshot_id("/mnt/a/", t), snapshot_id("/mnt/a/", t));
    }

    #[test]
    fn test_snapshot_id_timezone_invariant() {
        let utc = at(1_754_000_000, 0);
        let offset = FixedOffset::east_opt(5 * 3600)
            .unwrap()
            .from_utc_datetime(&utc.naive_utc());
        assert_eq!(
            snapshot_id("/mnt/a/", utc),
            snapshot_id("/mnt/a/", offset.with_timezone(&Utc))
        );
    }

    #[test]
    fn test_snapshot_id_distinct_inputs() {
        let t1 = at(1_754_000_000, 0);
        let t2 = at(1_754_000_000, 1);
        assert_ne!(snapshot_id("/mnt/a/", t1), snapshot_id("/mnt/b/", t1));
        assert_ne!(snapshot_id("/mnt/a/", t1), snapshot_id("/mnt/a/", t2));
    }

    #[test]
    fn test_canonical_timestamp_fixed_width() {
        let t = at(1_700_000_000, 5);
        let s = canonical_timestamp(t);
        assert!(s.ends_with('Z'));
        let frac = s.split('.').nth(1).unwrap();
        assert_eq!(frac.len(), 9 + 1); // nine digits plus the Z
    }

    #[test]
    fn test_fingerprint_format_and_order() {
        let snaps = vec![
            ActiveSnapshot {
                mount_path: "/mnt/a/".to_string(),
                snapshot_id: snapshot_id("/mnt/a/", at(1_700_000_000, 0)),
                updated_at: at(1_700_000_000, 0),
            },
            ActiveSnapshot {
                mount_path: "/mnt/b/".to_string(),
                snapshot_id: snapshot_id("/mnt/b/", at(1_700_000_100, 0)),
                updated_at: at(1_700_000_100, 0),
            },
        ];

        let fp = fingerprint(&snaps);
        let lines: Vec<&str> = fp.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("/mnt/a/|2023-"));
        assert!(lines[1].starts_with("/mnt/b/|2023-"));

        // Any change in a timestamp changes the fingerprint
        let mut moved = snaps.clone();
        moved[1].updated_at = at(1_700_000_101, 0);
        assert_ne!(fingerprint(&moved), fp);
    }

    #[test]
    fn test_fingerprint_empty() {
        assert_eq!(fingerprint(&[]), "");
    }
}
