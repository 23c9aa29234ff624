//! Error types for wrstore operations.

use thiserror::Error;

/// Extract the full error message from a tokio_postgres::Error,
/// including the underlying DbError details that Display hides.
pub fn format_db_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = db_err.message().to_string();
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        return msg;
    }
    // Fallback: walk the source chain
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        msg.push_str(&format!(": {}", s));
        source = s.source();
    }
    if e.is_closed() {
        msg.push_str("\n  Note: The database connection was closed unexpectedly.");
    }
    msg
}

/// All error types that wrstore operations can produce.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Invalid or missing configuration (empty DSN, bad database name, DSN mismatch).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A database query or connection operation failed.
    #[error("Database error: {}", format_db_error(.0))]
    Database(#[from] tokio_postgres::Error),

    /// The connection pool could not supply a connection.
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// A query exceeded its time budget and was cancelled.
    #[error("Query timed out after {budget_secs}s during {operation}")]
    Timeout {
        operation: String,
        budget_secs: u64,
    },

    /// A writer or store operation was called before its preconditions were met.
    #[error("Precondition not met: {0}")]
    Precondition(String),

    /// The store was used before `reset` prepared its batches.
    #[error("Store used before reset")]
    NotReset,

    /// The requested path has no row in the active snapshot.
    #[error("Path not found: {0}")]
    PathNotFound(String),

    /// The requested directory has no aggregate rows in any active snapshot.
    #[error("Directory not found: {0}")]
    DirNotFound(String),

    /// The supplied base path is not under any configured mountpoint.
    #[error("Invalid base path: {0}")]
    InvalidBasePath(String),

    /// A query option named a field outside the accepted set.
    #[error("Unknown field: {0}")]
    UnknownField(String),

    /// No history series exists for the requested group on this mount.
    #[error("No history for gid {gid} on {mount_path}")]
    NoHistory { gid: u32, mount_path: String },

    /// The stored schema version does not match the version this build expects.
    #[error("Schema version mismatch: found {found}, expected {expected}")]
    SchemaVersion { found: i64, expected: i64 },

    /// A destructive operation was refused by the test-environment guard.
    #[error("Refusing {operation} on database '{database}': {reason}")]
    SafetyGuard {
        operation: String,
        database: String,
        reason: String,
    },

    /// A glob pattern translated to a regex the engine rejects.
    #[error("Invalid glob pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// A numeric value did not fit the column or host type it was bound to.
    #[error("Integer conversion overflow for {field}: {value}")]
    IntConversion { field: &'static str, value: String },

    /// The owners CSV file could not be read or parsed.
    #[error("Owners file error at {path}: {reason}")]
    OwnersFile { path: String, reason: String },

    /// A filesystem I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience type alias for `Result<T, StoreError>`.
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// True for the "not found" family of errors, which callers commonly
    /// treat as empty rather than fatal.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::PathNotFound(_)
                | StoreError::DirNotFound(_)
                | StoreError::NoHistory { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        assert!(StoreError::PathNotFound("/a".to_string()).is_not_found());
        assert!(StoreError::DirNotFound("/a".to_string()).is_not_found());
        assert!(StoreError::NoHistory {
            gid: 1,
            mount_path: "/m/".to_string()
        }
        .is_not_found());
        assert!(!StoreError::NotReset.is_not_found());
        assert!(!StoreError::Config("x".to_string()).is_not_found());
    }

    #[test]
    fn test_timeout_display() {
        let e = StoreError::Timeout {
            operation: "dir_info".to_string(),
            budget_secs: 10,
        };
        assert_eq!(e.to_string(), "Query timed out after 10s during dir_info");
    }

    #[test]
    fn test_safety_guard_display() {
        let e = StoreError::SafetyGuard {
            operation: "history clean".to_string(),
            database: "prod".to_string(),
            reason: "test environment requires a test database".to_string(),
        };
        assert!(e.to_string().contains("history clean"));
        assert!(e.to_string().contains("prod"));
    }
}
