//! Uid/gid name caches and the owners-CSV mapping used to annotate read
//! results.
//!
//! Name resolution lives outside this crate (the id-to-name source differs
//! per deployment), so readers expose `set_cached_user`/`set_cached_group`
//! and fall back to the numeric id until told otherwise. Updates are
//! visible to subsequent reads within the same reader generation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::error::{Result, StoreError};

/// Mutable uid/gid name caches plus the immutable owners mapping.
#[derive(Debug, Default)]
pub struct NameCache {
    users: RwLock<HashMap<u32, String>>,
    groups: RwLock<HashMap<u32, String>>,
    owners: HashMap<u32, String>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a cache with the owners mapping loaded from a `gid,owner` CSV.
    pub fn with_owners_file(path: &Path) -> Result<Self> {
        Ok(Self {
            owners: load_owners_csv(path)?,
            ..Default::default()
        })
    }

    pub fn set_cached_user(&self, uid: u32, name: &str) {
        self.users
            .write()
            .expect("user cache lock poisoned")
            .insert(uid, name.to_string());
    }

    pub fn set_cached_group(&self, gid: u32, name: &str) {
        self.groups
            .write()
            .expect("group cache lock poisoned")
            .insert(gid, name.to_string());
    }

    /// Cached user name, or the numeric uid formatted.
    pub fn user_name(&self, uid: u32) -> String {
        self.users
            .read()
            .expect("user cache lock poisoned")
            .get(&uid)
            .cloned()
            .unwrap_or_else(|| uid.to_string())
    }

    /// Cached group name, or the numeric gid formatted.
    pub fn group_name(&self, gid: u32) -> String {
        self.groups
            .read()
            .expect("group cache lock poisoned")
            .get(&gid)
            .cloned()
            .unwrap_or_else(|| gid.to_string())
    }

    /// Owner for a gid from the owners CSV; empty when unmapped.
    pub fn owner(&self, gid: u32) -> String {
        self.owners.get(&gid).cloned().unwrap_or_default()
    }
}

/// Parse a `gid,owner` CSV. Blank lines are skipped; anything else that
/// fails to parse is an error rather than silently dropped.
fn load_owners_csv(path: &Path) -> Result<HashMap<u32, String>> {
    let content = std::fs::read_to_string(path).map_err(|e| StoreError::OwnersFile {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut owners = HashMap::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (gid, owner) = line.split_once(',').ok_or_else(|| StoreError::OwnersFile {
            path: path.display().to_string(),
            reason: format!("line {}: expected 'gid,owner'", lineno + 1),
        })?;

        let gid: u32 = gid.trim().parse().map_err(|_| StoreError::OwnersFile {
            path: path.display().to_string(),
            reason: format!("line {}: invalid gid '{}'", lineno + 1, gid),
        })?;

        owners.insert(gid, owner.trim().to_string());
    }

    Ok(owners)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cache_miss_formats_numeric_id() {
        let cache = NameCache::new();
        assert_eq!(cache.user_name(501), "501");
        assert_eq!(cache.group_name(601), "601");
        assert_eq!(cache.owner(601), "");
    }

    #[test]
    fn test_set_cached_names_visible() {
        let cache = NameCache::new();
        cache.set_cached_user(501, "alice");
        cache.set_cached_group(601, "hgi");
        assert_eq!(cache.user_name(501), "alice");
        assert_eq!(cache.group_name(601), "hgi");
        // Other ids still fall back
        assert_eq!(cache.user_name(502), "502");
    }

    #[test]
    fn test_owners_csv_load() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "601,Sam Smith").unwrap();
        writeln!(f).unwrap();
        writeln!(f, " 602 , Priya Patel ").unwrap();
        f.flush().unwrap();

        let cache = NameCache::with_owners_file(f.path()).unwrap();
        assert_eq!(cache.owner(601), "Sam Smith");
        assert_eq!(cache.owner(602), "Priya Patel");
        assert_eq!(cache.owner(999), "");
    }

    #[test]
    fn test_owners_csv_malformed_line() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "601,ok").unwrap();
        writeln!(f, "not-a-line").unwrap();
        f.flush().unwrap();

        let err = NameCache::with_owners_file(f.path()).unwrap_err();
        assert!(matches!(err, StoreError::OwnersFile { .. }));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_owners_csv_bad_gid() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "abc,owner").unwrap();
        f.flush().unwrap();

        let err = NameCache::with_owners_file(f.path()).unwrap_err();
        assert!(err.to_string().contains("invalid gid"));
    }

    #[test]
    fn test_owners_csv_missing_file() {
        let err =
            NameCache::with_owners_file(Path::new("/nonexistent/owners.csv")).unwrap_err();
        assert!(matches!(err, StoreError::OwnersFile { .. }));
    }
}
