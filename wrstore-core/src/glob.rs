//! Glob matching support: gitignore-style pattern translation, mount
//! grouping, per-query chunking and result-set merging.
//!
//! The translation is strict about what is literal: every regex
//! metacharacter in the input pattern is escaped, so a hostile pattern
//! cannot smuggle expressions into the engine. Only `**`, `*` and `?`
//! carry glob meaning.

use std::collections::BTreeMap;

use crate::error::{Result, StoreError};
use crate::paths::{ensure_trailing_slash, prefix_next, resolve_mount_required};

/// Upper bound on `match()` predicates per SQL query; more patterns split
/// into further queries against the same mount.
pub const MAX_PATTERNS_PER_QUERY: usize = 32;

/// Safety cap substituted for non-positive limits to avoid unbounded reads.
pub const LIMIT_SAFETY_CAP: i64 = 1_000_000;

fn escape_regex_byte(c: char, out: &mut String) {
    if matches!(
        c,
        '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\' | '*' | '?'
    ) {
        out.push('\\');
    }
    out.push(c);
}

/// Translate a gitignore-style pattern anchored under a base directory
/// into an RE2-compatible regex over full file paths.
///
/// `**` crosses directories (`.*`), `*` matches within a component
/// (`[^/]*`), `?` matches one non-separator character (`[^/]`); everything
/// else is literal.
pub fn glob_to_regex(base_dir: &str, pattern: &str) -> Result<String> {
    let base = ensure_trailing_slash(base_dir);

    let mut out = String::with_capacity(base.len() + pattern.len() + 8);
    out.push('^');
    for c in base.chars() {
        escape_regex_byte(c, &mut out);
    }

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            other => escape_regex_byte(other, &mut out),
        }
    }
    out.push('$');

    // The engine's syntax is a superset of what the translation emits;
    // compiling catches anything that slipped through.
    regex_lite::Regex::new(&out).map_err(|e| StoreError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;

    Ok(out)
}

/// One glob's work item after translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GlobWork {
    pub base_dir: String,
    pub regex: String,
}

/// Group every `(base_dir, pattern)` combination by its owning mount, so
/// each mount is visited once. Fails with `InvalidBasePath` when a base
/// dir is under no mount.
pub(crate) fn group_by_mount(
    base_dirs: &[&str],
    patterns: &[&str],
    mounts: &[String],
) -> Result<BTreeMap<String, Vec<GlobWork>>> {
    let mut groups: BTreeMap<String, Vec<GlobWork>> = BTreeMap::new();

    for base in base_dirs {
        let base = ensure_trailing_slash(base);
        let mount =
            resolve_mount_required(&base, mounts.iter().map(String::as_str))?.to_string();

        for pattern in patterns {
            let regex = glob_to_regex(&base, pattern)?;
            let work = GlobWork {
                base_dir: base.clone(),
                regex,
            };
            let bucket = groups.entry(mount.clone()).or_default();
            if !bucket.contains(&work) {
                bucket.push(work);
            }
        }
    }

    Ok(groups)
}

/// The half-open `parent_dir` range covering every base dir in a chunk.
pub(crate) fn chunk_range(chunk: &[GlobWork]) -> (String, String) {
    let start = chunk
        .iter()
        .map(|w| w.base_dir.as_str())
        .min()
        .unwrap_or("")
        .to_string();
    let end = chunk
        .iter()
        .map(|w| prefix_next(&w.base_dir))
        .max()
        .unwrap_or_default();
    (start, end)
}

/// Sort merged results by full path, drop adjacent duplicates, then apply
/// offset and limit. Used whenever more than one query contributed.
pub(crate) fn merge_paths<T, F>(mut rows: Vec<T>, path_of: F, limit: i64, offset: i64) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    rows.sort_by(|a, b| path_of(a).cmp(path_of(b)));
    rows.dedup_by(|a, b| path_of(a) == path_of(b));

    let offset = offset.max(0) as usize;
    let limit = effective_limit(limit) as usize;
    rows.into_iter().skip(offset).take(limit).collect()
}

/// Non-positive limits become the safety cap.
pub(crate) fn effective_limit(limit: i64) -> i64 {
    if limit <= 0 {
        LIMIT_SAFETY_CAP
    } else {
        limit
    }
}

/// The per-query fetch budget when results merge in memory: limit + offset,
/// clamped against overflow.
pub(crate) fn fetch_budget(limit: i64, offset: i64) -> i64 {
    effective_limit(limit).saturating_add(offset.max(0))
}
