//! Database connections, TLS support, the read pool, identifier quoting and
//! error classification for the analytic server.
//!
//! The server is a MergeTree-family columnar store; all SQL emitted by this
//! crate uses that dialect (PREWHERE, partition DROP, array functions) while
//! the driver handles transport, parameter binding and bulk append.

use std::time::Duration;

use async_trait::async_trait;
use tokio_postgres::Client;

use crate::config::{dsn_with_database, Config, SslMode};
use crate::error::{Result, StoreError};

/// Server-default database used while bootstrapping a missing target
/// database.
pub const DEFAULT_DATABASE: &str = "default";

/// Quote a SQL identifier for the columnar dialect.
///
/// Wraps in back-ticks and backslash-escapes any embedded back-tick.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

/// Render a string as a SQL literal for statements the server does not
/// parameterize (partition tuples, ALTER statements).
pub fn sql_string_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Server error codes worth retrying: shutdown in progress plus the
/// connection-exception family.
const TRANSIENT_CODES: [&str; 6] = ["57P01", "57P02", "57P03", "08000", "08003", "08006"];

/// Credential rejections. Retrying these only hammers the auth backend.
const AUTH_FAILURE_CODES: [&str; 2] = ["28P01", "28000"];

/// Message fragments that mark a dropped network path when the driver has
/// no structured error to offer.
const NETWORK_ERROR_PATTERNS: [&str; 4] = [
    "connection reset",
    "broken pipe",
    "connection closed",
    "unexpected eof",
];

/// TLS connector trusting the Mozilla CA bundle, on the ring provider.
fn tls_connector() -> tokio_postgres_rustls::MakeRustlsConnect {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let provider = std::sync::Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .expect("ring provider supports the default protocol versions")
        .with_root_certificates(roots)
        .with_no_client_auth();

    tokio_postgres_rustls::MakeRustlsConnect::new(tls_config)
}

fn is_auth_failure(e: &tokio_postgres::Error) -> bool {
    e.as_db_error()
        .map(|db_err| AUTH_FAILURE_CODES.contains(&db_err.code().code()))
        .unwrap_or(false)
}

/// Classify the "database does not exist" variant raised on first connect
/// against a fresh server.
pub fn is_unknown_database(e: &tokio_postgres::Error) -> bool {
    if let Some(db_err) = e.as_db_error() {
        if db_err.code().code() == "3D000" {
            return true;
        }
        let msg = db_err.message().to_lowercase();
        return msg.contains("unknown database")
            || (msg.contains("database") && msg.contains("does not exist"));
    }
    false
}

/// Classify the "unknown partition" variant raised when dropping a
/// partition that was never written. Treated as success by callers.
pub fn is_unknown_partition(e: &tokio_postgres::Error) -> bool {
    let msg = match e.as_db_error() {
        Some(db_err) => db_err.message().to_lowercase(),
        None => e.to_string().to_lowercase(),
    };
    msg.contains("unknown partition") || msg.contains("no parts to drop")
}

/// Open a plaintext connection and park its driver future on the runtime.
async fn open_plain(dsn: &str) -> std::result::Result<Client, tokio_postgres::Error> {
    let (client, driver) = tokio_postgres::connect(dsn, tokio_postgres::NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = driver.await {
            log::error!("Plaintext connection task failed: {}", e);
        }
    });
    Ok(client)
}

/// Open a TLS connection and park its driver future on the runtime.
async fn open_tls(dsn: &str) -> std::result::Result<Client, tokio_postgres::Error> {
    let (client, driver) = tokio_postgres::connect(dsn, tls_connector()).await?;
    tokio::spawn(async move {
        if let Err(e) = driver.await {
            log::error!("TLS connection task failed: {}", e);
        }
    });
    Ok(client)
}

/// One connection attempt honoring the SSL mode, bounded by the connect
/// timeout. In `Prefer` mode a failed handshake degrades to plaintext.
async fn connect_once(
    dsn: &str,
    ssl_mode: &SslMode,
    connect_timeout: Duration,
) -> Result<Client> {
    let attempt = async {
        match ssl_mode {
            SslMode::Disable => open_plain(dsn).await,
            SslMode::Require => open_tls(dsn).await,
            SslMode::Prefer => match open_tls(dsn).await {
                Ok(client) => Ok(client),
                Err(tls_err) => {
                    log::debug!("Preferred TLS connect failed ({}), trying plaintext", tls_err);
                    open_plain(dsn).await
                }
            },
        }
    };

    if connect_timeout.is_zero() {
        return attempt.await.map_err(StoreError::Database);
    }
    with_timeout("connect", connect_timeout, async { Ok(attempt.await?) }).await
}

/// Delay before retry number `attempt`: capped exponential backoff plus up
/// to a second of jitter so simultaneous reconnects spread out.
fn backoff_delay(attempt: u32) -> Duration {
    let secs = (1u64 << attempt.min(5)).min(30);
    Duration::from_secs(secs) + Duration::from_millis(fastrand::u64(..1000))
}

/// Connect, retrying within the configured budget. Credential rejections
/// end the attempts immediately.
async fn connect_with_retries(dsn: &str, cfg: &Config) -> Result<Client> {
    let attempts = cfg.connect_retries + 1;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match connect_once(dsn, &cfg.ssl_mode, cfg.connect_timeout).await {
            Ok(client) => {
                if attempt > 1 {
                    log::info!("Connected after retry; attempt={}, attempts={}", attempt, attempts);
                }
                return Ok(client);
            }
            Err(StoreError::Database(e)) if is_auth_failure(&e) => {
                log::error!("Authentication rejected, giving up: {}", e);
                return Err(StoreError::Database(e));
            }
            Err(e) if attempt < attempts => {
                let delay = backoff_delay(attempt);
                log::info!(
                    "Connect failed, will retry; attempt={}, attempts={}, delay_ms={}, error={}",
                    attempt,
                    attempts,
                    delay.as_millis() as u64,
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Connect to the configured database, creating it on a fresh server.
///
/// When the target database is missing, connects to the server-default
/// database, issues `CREATE DATABASE IF NOT EXISTS`, then reconnects to
/// the intended database.
pub async fn connect_client(cfg: &Config) -> Result<Client> {
    match connect_with_retries(&cfg.dsn, cfg).await {
        Ok(client) => Ok(client),
        Err(StoreError::Database(e)) if is_unknown_database(&e) => {
            log::info!(
                "Target database missing, creating; database={}",
                cfg.database
            );
            create_database(cfg).await?;
            connect_with_retries(&cfg.dsn, cfg).await
        }
        Err(e) => Err(e),
    }
}

async fn create_database(cfg: &Config) -> Result<()> {
    let admin_dsn = dsn_with_database(&cfg.dsn, DEFAULT_DATABASE);
    let admin = connect_with_retries(&admin_dsn, cfg).await?;
    let sql = format!(
        "CREATE DATABASE IF NOT EXISTS {}",
        quote_ident(&cfg.database)
    );
    admin.batch_execute(&sql).await?;
    Ok(())
}

/// Drop the configured database. Subject to the test-environment guard.
pub async fn drop_database(cfg: &Config) -> Result<()> {
    crate::guard::check_destructive("drop database", &cfg.database)?;

    let admin_dsn = dsn_with_database(&cfg.dsn, DEFAULT_DATABASE);
    let admin = connect_with_retries(&admin_dsn, cfg).await?;
    let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(&cfg.database));
    admin.batch_execute(&sql).await?;
    Ok(())
}

/// Bound a round trip by the per-query time budget.
pub async fn with_timeout<T, F>(operation: &str, budget: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation: operation.to_string(),
            budget_secs: budget.as_secs(),
        }),
    }
}

/// Whether an error is transient, so the caller may reasonably retry.
///
/// Timeouts and pool exhaustion qualify outright. Driver errors qualify
/// when the connection is gone, the server reported a code in
/// [`TRANSIENT_CODES`], or the message reads like a dropped network path.
pub fn is_transient_error(e: &StoreError) -> bool {
    let db_e = match e {
        StoreError::Timeout { .. } | StoreError::Pool(_) => return true,
        StoreError::Database(db_e) => db_e,
        _ => return false,
    };

    if db_e.is_closed() {
        return true;
    }
    if let Some(db_err) = db_e.as_db_error() {
        return TRANSIENT_CODES.contains(&db_err.code().code());
    }

    let msg = db_e.to_string().to_lowercase();
    NETWORK_ERROR_PATTERNS.iter().any(|p| msg.contains(p))
}

/// Read an unsigned count column from its signed wire representation,
/// surfacing corruption instead of panicking or truncating.
pub(crate) fn row_u64(
    row: &tokio_postgres::Row,
    idx: usize,
    field: &'static str,
) -> Result<u64> {
    let value: i64 = row.get(idx);
    u64::try_from(value).map_err(|_| StoreError::IntConversion {
        field,
        value: value.to_string(),
    })
}

/// Read a uid/gid column from its signed wire representation.
pub(crate) fn row_u32(
    row: &tokio_postgres::Row,
    idx: usize,
    field: &'static str,
) -> Result<u32> {
    let value: i64 = row.get(idx);
    u32::try_from(value).map_err(|_| StoreError::IntConversion {
        field,
        value: value.to_string(),
    })
}

/// bb8 connection manager backed by [`connect_client`].
pub struct ConnectionManager {
    cfg: Config,
}

impl ConnectionManager {
    pub fn new(cfg: Config) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl bb8::ManageConnection for ConnectionManager {
    type Connection = Client;
    type Error = StoreError;

    async fn connect(&self) -> std::result::Result<Client, StoreError> {
        connect_client(&self.cfg).await
    }

    async fn is_valid(&self, conn: &mut Client) -> std::result::Result<(), StoreError> {
        conn.simple_query("").await?;
        Ok(())
    }

    fn has_broken(&self, conn: &mut Client) -> bool {
        conn.is_closed()
    }
}

/// Shared read pool handed to providers and readers.
pub type Pool = bb8::Pool<ConnectionManager>;

/// Build the provider's read pool honoring `max_open`/`max_idle`.
pub async fn build_pool(cfg: &Config) -> Result<Pool> {
    let max_open = cfg.max_open.max(1);
    let max_idle = cfg.max_idle.min(max_open);

    bb8::Pool::builder()
        .max_size(max_open)
        .min_idle(Some(max_idle))
        .connection_timeout(cfg.connect_timeout.max(Duration::from_secs(1)))
        .build(ConnectionManager::new(cfg.clone()))
        .await
}

/// Check out a pooled connection, mapping pool exhaustion to a store error.
pub async fn pooled(pool: &Pool) -> Result<bb8::PooledConnection<'_, ConnectionManager>> {
    pool.get().await.map_err(|e| match e {
        bb8::RunError::User(e) => e,
        bb8::RunError::TimedOut => {
            StoreError::Pool("timed out waiting for a pooled connection".to_string())
        }
    })
}
