//! Configuration and validation for stores, writers and providers.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::paths::ensure_trailing_slash;

/// SSL/TLS connection mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SslMode {
    /// Never use TLS.
    Disable,
    /// Try TLS first, fall back to plaintext.
    #[default]
    Prefer,
    /// Require TLS — fail if the handshake fails.
    Require,
}

impl std::str::FromStr for SslMode {
    type Err = StoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "disable" | "disabled" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" | "required" => Ok(SslMode::Require),
            _ => Err(StoreError::Config(format!(
                "Invalid SSL mode '{}'. Use 'disable', 'prefer', or 'require'.",
                s
            ))),
        }
    }
}

/// Default per-query time budget.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default batch size for the batched writers.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Smallest usable batch size; lower configured values are raised to this.
pub const MIN_BATCH_SIZE: usize = 10_000;

/// Configuration shared by all store handles.
#[derive(Clone)]
pub struct Config {
    /// Full connection DSN for the analytic server, including the
    /// `database=` (or `dbname=`) parameter.
    pub dsn: String,
    /// Logical database name; must match the DSN's database parameter.
    pub database: String,
    /// Optional path to the `gid,owner` CSV used to annotate group usage.
    pub owners_path: Option<PathBuf>,
    /// Mountpoint override list. Empty means "derive from active snapshots".
    pub mountpoints: Vec<String>,
    /// Active-snapshot poll interval; zero disables polling.
    pub poll_interval: Duration,
    /// Per-query time budget.
    pub query_timeout: Duration,
    /// Maximum open connections in the provider's read pool.
    pub max_open: u32,
    /// Idle connections the pool keeps warm.
    pub max_idle: u32,
    /// Number of times to retry a failed connection (capped at 20).
    pub connect_retries: u32,
    /// SSL/TLS mode for server connections.
    pub ssl_mode: SslMode,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Rows per batch before an automatic send; values below
    /// [`MIN_BATCH_SIZE`] are raised to it.
    pub batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            database: String::new(),
            owners_path: None,
            mountpoints: Vec::new(),
            poll_interval: Duration::from_secs(60),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            max_open: 10,
            max_idle: 2,
            connect_retries: 0,
            ssl_mode: SslMode::Prefer,
            connect_timeout: Duration::from_secs(30),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("dsn", &"[REDACTED]")
            .field("database", &self.database)
            .field("owners_path", &self.owners_path)
            .field("mountpoints", &self.mountpoints)
            .field("poll_interval", &self.poll_interval)
            .field("query_timeout", &self.query_timeout)
            .field("max_open", &self.max_open)
            .field("max_idle", &self.max_idle)
            .field("connect_retries", &self.connect_retries)
            .field("ssl_mode", &self.ssl_mode)
            .field("connect_timeout", &self.connect_timeout)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl Config {
    /// Build a config from a DSN and database name with defaults elsewhere.
    pub fn new(dsn: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            database: database.into(),
            ..Default::default()
        }
    }

    /// Validate the configuration and normalize mountpoints in place.
    ///
    /// Every handle constructor calls this before touching the network.
    pub fn validate(&mut self) -> Result<()> {
        if self.dsn.is_empty() {
            return Err(StoreError::Config("DSN must not be empty".to_string()));
        }
        if self.database.is_empty() {
            return Err(StoreError::Config(
                "database name must not be empty".to_string(),
            ));
        }
        if self.database.contains('\0') || self.database.contains('`') {
            return Err(StoreError::Config(format!(
                "database name '{}' contains forbidden characters",
                self.database
            )));
        }

        match dsn_database(&self.dsn) {
            Some(db) if db == self.database => {}
            Some(db) => {
                return Err(StoreError::Config(format!(
                    "DSN database parameter '{}' does not match configured database '{}'",
                    db, self.database
                )));
            }
            None => {
                return Err(StoreError::Config(
                    "DSN has no database parameter".to_string(),
                ));
            }
        }

        for mp in &self.mountpoints {
            if !mp.starts_with('/') {
                return Err(StoreError::Config(format!(
                    "mountpoint '{}' is not absolute",
                    mp
                )));
            }
        }
        self.mountpoints = self
            .mountpoints
            .iter()
            .map(|m| ensure_trailing_slash(m))
            .collect();

        if self.connect_retries > 20 {
            self.connect_retries = 20;
            log::warn!("connect_retries capped at 20");
        }
        if self.batch_size < MIN_BATCH_SIZE {
            log::warn!(
                "batch_size raised to minimum; configured={}, minimum={}",
                self.batch_size,
                MIN_BATCH_SIZE
            );
            self.batch_size = MIN_BATCH_SIZE;
        }
        if self.query_timeout.is_zero() {
            self.query_timeout = DEFAULT_QUERY_TIMEOUT;
        }

        Ok(())
    }

    /// Whether active-snapshot polling is enabled.
    pub fn polling_enabled(&self) -> bool {
        !self.poll_interval.is_zero()
    }
}

/// Extract the database name from a DSN.
///
/// Understands both URL-style DSNs (`scheme://user@host:port/db?...`, with a
/// `database=`/`dbname=` query parameter taking precedence over the path)
/// and key=value DSNs (`host=... dbname=...`).
pub fn dsn_database(dsn: &str) -> Option<String> {
    if let Some((_, rest)) = dsn.split_once("://") {
        let (path_part, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };

        if let Some(q) = query {
            for param in q.split('&') {
                if let Some((key, value)) = param.split_once('=') {
                    if key.eq_ignore_ascii_case("database") || key.eq_ignore_ascii_case("dbname") {
                        return Some(value.to_string());
                    }
                }
            }
        }

        return match path_part.split_once('/') {
            Some((_, db)) if !db.is_empty() => Some(db.to_string()),
            _ => None,
        };
    }

    // key=value style
    for token in dsn.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            if key.eq_ignore_ascii_case("dbname") || key.eq_ignore_ascii_case("database") {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Rewrite the DSN's database parameter, preserving the DSN style.
///
/// Used when the target database does not exist yet and the bootstrap has
/// to reach the server-default database first.
pub fn dsn_with_database(dsn: &str, database: &str) -> String {
    if let Some((scheme, rest)) = dsn.split_once("://") {
        let (path_part, query) = match rest.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (rest, None),
        };

        let mut rewrote_query = false;
        let new_query = query.map(|q| {
            q.split('&')
                .map(|param| match param.split_once('=') {
                    Some((key, _))
                        if key.eq_ignore_ascii_case("database")
                            || key.eq_ignore_ascii_case("dbname") =>
                    {
                        rewrote_query = true;
                        format!("{}={}", key, database)
                    }
                    _ => param.to_string(),
                })
                .collect::<Vec<_>>()
                .join("&")
        });

        let new_path = if rewrote_query {
            path_part.to_string()
        } else {
            match path_part.split_once('/') {
                Some((authority, _)) => format!("{}/{}", authority, database),
                None => format!("{}/{}", path_part, database),
            }
        };

        return match new_query {
            Some(q) => format!("{}://{}?{}", scheme, new_path, q),
            None => format!("{}://{}", scheme, new_path),
        };
    }

    let mut rewrote = false;
    let mut tokens: Vec<String> = dsn
        .split_whitespace()
        .map(|token| match token.split_once('=') {
            Some((key, _))
                if key.eq_ignore_ascii_case("dbname") || key.eq_ignore_ascii_case("database") =>
            {
                rewrote = true;
                format!("{}={}", key, database)
            }
            _ => token.to_string(),
        })
        .collect();
    if !rewrote {
        tokens.push(format!("dbname={}", database));
    }
    tokens.join(" ")
}
