//! Path normalization, parent/name splitting, extension derivation and
//! mountpoint resolution.
//!
//! Directory paths throughout the store carry a trailing `/`; a file's full
//! path is always `parent_dir + name`, and directory names keep their
//! trailing `/` so the concatenation invariant holds for both kinds.

use crate::error::{Result, StoreError};

/// The full-width solidus used in externally visible mount keys.
pub const MOUNT_KEY_SEPARATOR: char = '\u{FF0F}';

/// Trailing tokens that keep their preceding extension token
/// (`tar.gz`, `csv.bz2`, ...).
const COMPRESSED_SUFFIXES: [&str; 7] = ["gz", "bz2", "xz", "zst", "lz4", "lz", "br"];

/// Append a trailing `/` unless the path already ends with one.
pub fn ensure_trailing_slash(dir: &str) -> String {
    if dir.ends_with('/') {
        dir.to_string()
    } else {
        format!("{}/", dir)
    }
}

/// Split a path into `(parent_dir, name)`.
///
/// For a directory path (trailing `/`) the split point is the last `/`
/// before the final character, so the name keeps its trailing `/`.
/// The root `/` splits into parent `/` and an empty name.
pub fn split_parent_and_name(path: &str) -> (String, String) {
    if path == "/" {
        return ("/".to_string(), String::new());
    }

    let search_end = if path.ends_with('/') {
        path.len() - 1
    } else {
        path.len()
    };

    match path[..search_end].rfind('/') {
        Some(idx) => (path[..=idx].to_string(), path[idx + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}

/// Derive the lowercase extension for a file name.
///
/// Directories have no extension. A leading dot with no further dot
/// (`.bashrc`) yields empty. A compound extension is produced when the
/// trailing token is a known compressed suffix: `data.tar.gz` -> `tar.gz`.
pub fn derive_ext_lower(name: &str, is_dir: bool) -> String {
    if is_dir {
        return String::new();
    }

    let last_dot = match name.rfind('.') {
        Some(0) | None => return String::new(),
        Some(idx) => idx,
    };

    let ext = name[last_dot + 1..].to_lowercase();
    if ext.is_empty() {
        return ext;
    }

    if COMPRESSED_SUFFIXES.contains(&ext.as_str()) {
        let stem = &name[..last_dot];
        if let Some(prev_dot) = stem.rfind('.') {
            if prev_dot + 1 < stem.len() {
                return format!("{}.{}", stem[prev_dot + 1..].to_lowercase(), ext);
            }
        }
    }

    ext
}

/// Compute the smallest string strictly greater than every string with the
/// given prefix, for half-open range scans `[prefix, prefix_next(prefix))`.
///
/// The last byte below 0xFF is incremented and the remainder truncated; a
/// prefix of all 0xFF bytes gains a trailing NUL instead, making the range
/// effectively unbounded above within that prefix.
pub fn prefix_next(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();

    while let Some(&last) = bytes.last() {
        if last < 0xFF {
            *bytes.last_mut().unwrap() = last + 1;
            // Lossy is fine: range bounds never round-trip to text
            return String::from_utf8_lossy(&bytes).into_owned();
        }
        bytes.pop();
    }

    let mut out = prefix.to_string();
    out.push('\0');
    out
}

/// Resolve an absolute path to the longest configured mountpoint that
/// prefixes it. Mountpoints must carry their trailing `/`.
pub fn resolve_mount<'a, I>(path: &str, mounts: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let dir = if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    };

    mounts
        .into_iter()
        .filter(|m| dir.starts_with(*m))
        .max_by_key(|m| m.len())
}

/// Like [`resolve_mount`] but failing with `InvalidBasePath`.
pub fn resolve_mount_required<'a, I>(path: &str, mounts: I) -> Result<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    resolve_mount(path, mounts).ok_or_else(|| StoreError::InvalidBasePath(path.to_string()))
}

/// Encode a mount path as its externally visible key: every `/` replaced
/// with the full-width solidus.
pub fn mount_key(mount_path: &str) -> String {
    mount_path.replace('/', &MOUNT_KEY_SEPARATOR.to_string())
}

/// Reverse of [`mount_key`].
pub fn mount_key_to_path(key: &str) -> String {
    key.replace(MOUNT_KEY_SEPARATOR, "/")
}
