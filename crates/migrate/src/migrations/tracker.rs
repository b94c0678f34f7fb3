//! Version Tracker - The persisted `(version, dirty)` record
//!
//! Thin view over a driver's tracker row. It exists so callers see the
//! `NilVersion` distinction explicitly instead of an `Option`.

use crate::backends::Driver;
use crate::error::{MigrateError, MigrateResult};

use super::definitions::{TrackerRecord, Version};

/// Reads and writes the tracker row through a borrowed driver
pub struct VersionTracker<'a, D: Driver + ?Sized> {
    driver: &'a mut D,
}

impl<'a, D: Driver + ?Sized> VersionTracker<'a, D> {
    pub fn new(driver: &'a mut D) -> Self {
        Self { driver }
    }

    /// Current record; `NilVersion` when nothing was ever recorded
    pub async fn read(&mut self) -> MigrateResult<TrackerRecord> {
        self.driver
            .read_tracker()
            .await?
            .ok_or(MigrateError::NilVersion)
    }

    /// Current record, with a missing row read as the initial `(0, clean)` state
    pub async fn read_or_initial(&mut self) -> MigrateResult<TrackerRecord> {
        match self.read().await {
            Err(MigrateError::NilVersion) => Ok(TrackerRecord::initial()),
            other => other,
        }
    }

    pub async fn write(&mut self, record: TrackerRecord) -> MigrateResult<()> {
        tracing::debug!("Recording migration version {}", record);
        self.driver.write_tracker(record).await
    }

    /// Mark `version` as in progress before its statements run
    pub async fn mark_dirty(&mut self, version: Version) -> MigrateResult<()> {
        self.write(TrackerRecord::dirty(version)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryStore;

    #[tokio::test]
    async fn test_missing_record_is_nil_version() {
        let store = MemoryStore::new();
        let mut driver = store.driver();
        let mut tracker = VersionTracker::new(&mut driver);

        assert!(matches!(tracker.read().await, Err(MigrateError::NilVersion)));
        assert_eq!(tracker.read_or_initial().await.unwrap(), TrackerRecord::initial());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = MemoryStore::new();
        let mut driver = store.driver();
        let mut tracker = VersionTracker::new(&mut driver);

        tracker.mark_dirty(3).await.unwrap();
        assert_eq!(tracker.read().await.unwrap(), TrackerRecord::dirty(3));
        tracker.write(TrackerRecord::clean(3)).await.unwrap();
        assert_eq!(tracker.read().await.unwrap(), TrackerRecord::clean(3));
        assert_eq!(
            store.tracker_history(),
            vec![TrackerRecord::dirty(3), TrackerRecord::clean(3)]
        );
    }
}
