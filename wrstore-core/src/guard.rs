//! Test-environment guard for destructive operations.
//!
//! A process-wide environment indicator marks test runs. While it is set,
//! destructive operations (database drops, history cleans) are refused
//! unless they target a database whose name carries the test sentinel
//! prefix, so a misconfigured test run cannot reach production data.

use crate::error::{Result, StoreError};

/// Environment variable holding the process-wide environment indicator.
pub const ENV_VAR: &str = "WRSTORE_ENV";

/// Indicator value that marks a test environment.
pub const TEST_ENV: &str = "test";

/// Prefix a database name must carry to accept destructive operations
/// while the test indicator is set.
pub const TEST_DB_PREFIX: &str = "test_";

/// True when the process-wide environment indicator equals `test`.
pub fn in_test_environment() -> bool {
    std::env::var(ENV_VAR).map(|v| v == TEST_ENV).unwrap_or(false)
}

/// Refuse a destructive operation unless it is safe in this environment.
///
/// Outside the test environment every database is allowed. Inside it,
/// only databases named with the test sentinel prefix pass.
pub fn check_destructive(operation: &str, database: &str) -> Result<()> {
    if !in_test_environment() {
        return Ok(());
    }

    if database.starts_with(TEST_DB_PREFIX) {
        return Ok(());
    }

    Err(StoreError::SafetyGuard {
        operation: operation.to_string(),
        database: database.to_string(),
        reason: format!(
            "environment indicator is '{}' but the database name does not start with '{}'",
            TEST_ENV, TEST_DB_PREFIX
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment-variable manipulation is process-global; keep every case
    // in one test so parallel test threads cannot interleave.
    #[test]
    fn test_check_destructive() {
        let prev = std::env::var(ENV_VAR).ok();

        std::env::remove_var(ENV_VAR);
        assert!(check_destructive("drop database", "prod").is_ok());

        std::env::set_var(ENV_VAR, TEST_ENV);
        assert!(in_test_environment());
        assert!(check_destructive("drop database", "test_wrstore").is_ok());
        let err = check_destructive("history clean", "prod").unwrap_err();
        assert!(matches!(err, StoreError::SafetyGuard { .. }));

        std::env::set_var(ENV_VAR, "production");
        assert!(!in_test_environment());
        assert!(check_destructive("drop database", "prod").is_ok());

        match prev {
            Some(v) => std::env::set_var(ENV_VAR, v),
            None => std::env::remove_var(ENV_VAR),
        }
    }
}
