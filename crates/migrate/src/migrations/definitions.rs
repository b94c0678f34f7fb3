//! Migration Definitions - Core types and structures for migrations
//!
//! Defines the fundamental types used throughout the migration system including
//! Migration, TrackerRecord, and MigrationConfig structures.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Numeric migration version. Zero is reserved for "nothing applied".
pub type Version = u64;

/// Largest version a tracker can store (the PostgreSQL column is `BIGINT`)
pub const MAX_VERSION: Version = i64::MAX as Version;

/// Migration direction for execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Apply the migration (run UP statements)
    Up,
    /// Rollback the migration (run DOWN statements)
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            _ => Err(format!("Unknown migration direction: {}", s)),
        }
    }
}

/// One half of a migration pair, immutable once loaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Catalog version shared by the up and down halves
    pub version: Version,
    /// Human-readable name taken from the file slug
    pub name: String,
    /// Which half of the pair this is
    pub direction: Direction,
    /// Statements in execution order
    pub statements: Vec<String>,
    /// File the migration was read from, if any
    pub source: Option<PathBuf>,
}

impl Migration {
    pub fn new(
        version: Version,
        name: impl Into<String>,
        direction: Direction,
        statements: Vec<String>,
    ) -> Self {
        Self {
            version,
            name: name.into(),
            direction,
            statements,
            source: None,
        }
    }

    pub fn up(version: Version, name: impl Into<String>, statements: &[&str]) -> Self {
        Self::new(
            version,
            name,
            Direction::Up,
            statements.iter().map(|s| s.to_string()).collect(),
        )
    }

    pub fn down(version: Version, name: impl Into<String>, statements: &[&str]) -> Self {
        Self::new(
            version,
            name,
            Direction::Down,
            statements.iter().map(|s| s.to_string()).collect(),
        )
    }
}

/// The single persisted bookkeeping row: current version and dirty flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerRecord {
    pub version: Version,
    pub dirty: bool,
}

impl TrackerRecord {
    /// State before any migration has run
    pub fn initial() -> Self {
        Self::clean(0)
    }

    pub fn clean(version: Version) -> Self {
        Self {
            version,
            dirty: false,
        }
    }

    pub fn dirty(version: Version) -> Self {
        Self {
            version,
            dirty: true,
        }
    }
}

impl fmt::Display for TrackerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dirty {
            write!(f, "{} (dirty)", self.version)
        } else {
            write!(f, "{}", self.version)
        }
    }
}

/// How long a run is willing to wait for the migration lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    /// Block until the current holder releases the lock
    #[default]
    Wait,
    /// Fail with `LockBusy` if the lock is held
    NoWait,
    /// Keep retrying until the deadline, then fail with `LockBusy`
    Timeout(Duration),
}

/// Configuration for the migration system
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Directory where migration files are stored
    pub migrations_dir: PathBuf,
    /// Table name for tracking the applied version
    pub migrations_table: String,
    /// Lock acquisition policy for mutating runs
    pub lock_mode: LockMode,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migrations_dir: PathBuf::from("migrations"),
            migrations_table: "schema_migrations".to_string(),
            lock_mode: LockMode::Wait,
        }
    }
}

/// Result of a mutating run
#[derive(Debug, Clone)]
pub struct MigrationRunResult {
    /// Direction of the applied steps
    pub direction: Direction,
    /// Versions whose statements were executed, in execution order
    pub applied: Vec<Version>,
    /// Tracker state after the run
    pub final_state: TrackerRecord,
    /// Total execution time in milliseconds
    pub execution_time_ms: u128,
}

impl MigrationRunResult {
    pub fn applied_count(&self) -> usize {
        self.applied.len()
    }
}

/// Status of one catalog entry relative to the tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationStatus {
    pub version: Version,
    pub name: String,
    /// Version is at or below the tracked version
    pub applied: bool,
    /// A down migration exists for this version
    pub reversible: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_round_trips_through_text() {
        assert_eq!("UP".parse::<Direction>().unwrap(), Direction::Up);
        assert_eq!(Direction::Down.to_string(), "down");
        assert!("sideways".parse::<Direction>().is_err());
    }

    #[test]
    fn test_tracker_record_display() {
        assert_eq!(TrackerRecord::initial(), TrackerRecord { version: 0, dirty: false });
        assert_eq!(TrackerRecord::dirty(4).to_string(), "4 (dirty)");
        assert_eq!(TrackerRecord::clean(4).to_string(), "4");
    }

    #[test]
    fn test_default_config() {
        let config = MigrationConfig::default();
        assert_eq!(config.migrations_table, "schema_migrations");
        assert_eq!(config.migrations_dir, PathBuf::from("migrations"));
        assert_eq!(config.lock_mode, LockMode::Wait);
    }
}
