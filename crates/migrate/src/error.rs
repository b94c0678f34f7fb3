//! Error types for the migration engine
//!
//! Every failure the engine can report is a variant of [`MigrateError`]. Catalog
//! problems are split out into [`CatalogError`] because they are detected before
//! any statement runs.

use std::path::PathBuf;

use crate::migrations::definitions::{Direction, Version};

/// Boxed error from the underlying store, kept intact for diagnosis
pub type StoreError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Errors raised while loading or validating a migration catalog
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("Cannot read migration source '{}': {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write migration file '{}': {source}", path.display())]
    Unwritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration file '{file}' must be named <version>_<name>.<up|down>.sql")]
    MalformedFileName { file: String },

    #[error("Migration file '{file}' has an invalid version identifier")]
    MalformedVersion { file: String },

    #[error("Duplicate {direction} migration for version {version}")]
    Duplicate { version: Version, direction: Direction },

    #[error("Version {version} has a down migration but no up migration")]
    MissingForward { version: Version },
}

/// Error types for migration runs
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Migration lock is held by another process")]
    LockBusy,

    #[error("No migration has been applied yet")]
    NilVersion,

    #[error("No change")]
    NoChange,

    #[error("Database is dirty at version {version}; fix the schema and force the version")]
    Dirty { version: Version },

    #[error("Migration {version} ({direction}) failed at statement {index}: {source}")]
    Statement {
        version: Version,
        direction: Direction,
        index: usize,
        #[source]
        source: StoreError,
    },

    #[error("No down migration available for version {version}")]
    NoInverse { version: Version },

    #[error("Version {version} is not in the migration catalog")]
    UnknownVersion { version: Version },

    #[error("Requested {requested} migration steps but only {available} are available")]
    ShortLimit { requested: u64, available: u64 },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl MigrateError {
    /// `true` when there was nothing to do; callers treat this as success
    pub fn is_no_change(&self) -> bool {
        matches!(self, MigrateError::NoChange)
    }

    /// `true` only for errors a caller may retry after backing off
    pub fn is_retryable(&self) -> bool {
        matches!(self, MigrateError::LockBusy)
    }

    /// The version an operator has to inspect before forcing, if any
    pub fn stuck_version(&self) -> Option<Version> {
        match self {
            MigrateError::Dirty { version } | MigrateError::Statement { version, .. } => {
                Some(*version)
            }
            _ => None,
        }
    }
}

impl From<sqlx::Error> for MigrateError {
    fn from(err: sqlx::Error) -> Self {
        MigrateError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stuck_version_is_named() {
        let dirty = MigrateError::Dirty { version: 7 };
        assert_eq!(dirty.stuck_version(), Some(7));
        assert!(dirty.to_string().contains("version 7"));

        let failed = MigrateError::Statement {
            version: 3,
            direction: Direction::Down,
            index: 1,
            source: "relation \"users\" does not exist".into(),
        };
        assert_eq!(failed.stuck_version(), Some(3));
        let message = failed.to_string();
        assert!(message.contains("Migration 3 (down)"));
        assert!(message.contains("relation \"users\" does not exist"));
    }

    #[test]
    fn test_error_classification() {
        assert!(MigrateError::LockBusy.is_retryable());
        assert!(!MigrateError::Dirty { version: 1 }.is_retryable());
        assert!(MigrateError::NoChange.is_no_change());
        assert_eq!(MigrateError::NilVersion.stuck_version(), None);
    }

    #[test]
    fn test_catalog_error_converts() {
        let err: MigrateError = CatalogError::Duplicate {
            version: 2,
            direction: Direction::Up,
        }
        .into();
        assert!(matches!(err, MigrateError::Catalog(CatalogError::Duplicate { version: 2, .. })));
        assert_eq!(err.to_string(), "Catalog error: Duplicate up migration for version 2");
    }
}
