//! In-memory driver
//!
//! A fake target store for exercising the executor without a database server. It keeps
//! a tiny schema model (tables and their columns), a log of executed statements, the
//! tracker row, and a lock shared between every driver opened on the same store.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::Driver;
use crate::error::{MigrateError, MigrateResult};
use crate::migrations::definitions::{Migration, TrackerRecord};

static CREATE_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^CREATE\s+TABLE\s+(IF\s+NOT\s+EXISTS\s+)?(\w+)\s*\((.*)\)$").expect("valid pattern")
});
static DROP_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^DROP\s+TABLE\s+(IF\s+EXISTS\s+)?(\w+)").expect("valid pattern"));
static ADD_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^ALTER\s+TABLE\s+(\w+)\s+ADD\s+(COLUMN\s+)?(IF\s+NOT\s+EXISTS\s+)?(\w+)").expect("valid pattern")
});
static DROP_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^ALTER\s+TABLE\s+(\w+)\s+DROP\s+(COLUMN\s+)?(IF\s+EXISTS\s+)?(\w+)").expect("valid pattern")
});

const CONSTRAINT_KEYWORDS: [&str; 5] = ["primary", "unique", "constraint", "foreign", "check"];

/// Error reported by the in-memory store for a rejected statement
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct MemoryStoreError(pub String);

type Tables = BTreeMap<String, Vec<String>>;

#[derive(Debug, Default)]
struct StoreState {
    tracker: Option<TrackerRecord>,
    tracker_history: Vec<TrackerRecord>,
    tables: Tables,
    executed: Vec<String>,
    failures: Vec<String>,
    lock_holder: Option<u64>,
}

/// Shared in-memory target store. Clones refer to the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
    next_driver: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a non-transactional driver (statements and tracker write are separate steps)
    pub fn driver(&self) -> MemoryDriver {
        MemoryDriver {
            store: self.clone(),
            id: self.next_driver.fetch_add(1, Ordering::SeqCst) + 1,
            holds_lock: false,
            transactional: false,
        }
    }

    /// Open a driver that applies a migration and its tracker write atomically
    pub fn transactional_driver(&self) -> MemoryDriver {
        let mut driver = self.driver();
        driver.transactional = true;
        driver
    }

    /// Make every statement containing `pattern` fail
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.state().failures.push(pattern.into());
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn tracker(&self) -> Option<TrackerRecord> {
        self.state().tracker
    }

    /// Every tracker write in order, including dirty markers
    pub fn tracker_history(&self) -> Vec<TrackerRecord> {
        self.state().tracker_history.clone()
    }

    pub fn set_tracker(&self, record: Option<TrackerRecord>) {
        self.state().tracker = record;
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.state().tables.contains_key(&table.to_lowercase())
    }

    pub fn columns(&self, table: &str) -> Option<Vec<String>> {
        self.state().tables.get(&table.to_lowercase()).cloned()
    }

    /// Statements that were executed successfully, in order
    pub fn executed(&self) -> Vec<String> {
        self.state().executed.clone()
    }

    pub fn is_locked(&self) -> bool {
        self.state().lock_holder.is_some()
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Driver over a [`MemoryStore`]
#[derive(Debug)]
pub struct MemoryDriver {
    store: MemoryStore,
    id: u64,
    holds_lock: bool,
    transactional: bool,
}

impl MemoryDriver {
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    fn run_statements(
        &self,
        state: &mut StoreState,
        tables: &mut Tables,
        migration: &Migration,
    ) -> MigrateResult<()> {
        for (index, statement) in migration.statements.iter().enumerate() {
            if let Some(pattern) = state.failures.iter().find(|p| statement.contains(p.as_str())) {
                return Err(statement_error(
                    migration,
                    index,
                    format!("injected failure matching '{}'", pattern),
                ));
            }
            apply_statement(tables, statement)
                .map_err(|message| statement_error(migration, index, message))?;
            state.executed.push(statement.clone());
        }
        Ok(())
    }
}

impl Drop for MemoryDriver {
    fn drop(&mut self) {
        // Mirrors a closed session releasing its lock.
        if self.holds_lock {
            let mut state = self.store.state();
            if state.lock_holder == Some(self.id) {
                state.lock_holder = None;
            }
        }
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn supports_transactional_ddl(&self) -> bool {
        self.transactional
    }

    async fn try_lock(&mut self) -> MigrateResult<bool> {
        let mut state = self.store.state();
        match state.lock_holder {
            Some(holder) if holder != self.id => Ok(false),
            _ => {
                state.lock_holder = Some(self.id);
                self.holds_lock = true;
                Ok(true)
            }
        }
    }

    async fn unlock(&mut self) -> MigrateResult<()> {
        let mut state = self.store.state();
        if state.lock_holder == Some(self.id) {
            state.lock_holder = None;
        }
        self.holds_lock = false;
        Ok(())
    }

    async fn read_tracker(&mut self) -> MigrateResult<Option<TrackerRecord>> {
        Ok(self.store.tracker())
    }

    async fn write_tracker(&mut self, record: TrackerRecord) -> MigrateResult<()> {
        let mut state = self.store.state();
        state.tracker = Some(record);
        state.tracker_history.push(record);
        Ok(())
    }

    async fn execute(&mut self, migration: &Migration) -> MigrateResult<()> {
        let mut state = self.store.state();
        let mut tables = std::mem::take(&mut state.tables);
        let result = self.run_statements(&mut state, &mut tables, migration);
        // Without transactions, whatever ran before a failure stays applied.
        state.tables = tables;
        result
    }

    async fn execute_and_record(
        &mut self,
        migration: &Migration,
        record: TrackerRecord,
    ) -> MigrateResult<()> {
        if !self.transactional {
            self.execute(migration).await?;
            return self.write_tracker(record).await;
        }

        let mut state = self.store.state();
        let mut tables = state.tables.clone();
        let executed_before = state.executed.len();
        match self.run_statements(&mut state, &mut tables, migration) {
            Ok(()) => {
                state.tables = tables;
                state.tracker = Some(record);
                state.tracker_history.push(record);
                Ok(())
            }
            Err(e) => {
                state.executed.truncate(executed_before);
                Err(e)
            }
        }
    }
}

fn statement_error(migration: &Migration, index: usize, message: String) -> MigrateError {
    MigrateError::Statement {
        version: migration.version,
        direction: migration.direction,
        index,
        source: Box::new(MemoryStoreError(message)),
    }
}

/// Apply the schema effect of one statement. Statements outside the modelled subset
/// are accepted without effect.
fn apply_statement(tables: &mut Tables, statement: &str) -> Result<(), String> {
    let sql = statement.trim().trim_end_matches(';').trim();

    if let Some(caps) = CREATE_TABLE.captures(sql) {
        let table = caps[2].to_lowercase();
        if tables.contains_key(&table) {
            if caps.get(1).is_some() {
                return Ok(());
            }
            return Err(format!("relation \"{}\" already exists", table));
        }
        let columns = caps[3]
            .split(',')
            .filter_map(|def| def.split_whitespace().next())
            .map(|name| name.trim_matches('"').to_lowercase())
            .filter(|name| !CONSTRAINT_KEYWORDS.contains(&name.as_str()))
            .collect();
        tables.insert(table, columns);
    } else if let Some(caps) = DROP_TABLE.captures(sql) {
        let table = caps[2].to_lowercase();
        if tables.remove(&table).is_none() && caps.get(1).is_none() {
            return Err(format!("table \"{}\" does not exist", table));
        }
    } else if let Some(caps) = ADD_COLUMN.captures(sql) {
        let table = caps[1].to_lowercase();
        let column = caps[4].to_lowercase();
        let columns = tables
            .get_mut(&table)
            .ok_or_else(|| format!("relation \"{}\" does not exist", table))?;
        if columns.contains(&column) {
            if caps.get(3).is_some() {
                return Ok(());
            }
            return Err(format!("column \"{}\" of relation \"{}\" already exists", column, table));
        }
        columns.push(column);
    } else if let Some(caps) = DROP_COLUMN.captures(sql) {
        let table = caps[1].to_lowercase();
        let column = caps[4].to_lowercase();
        let columns = tables
            .get_mut(&table)
            .ok_or_else(|| format!("relation \"{}\" does not exist", table))?;
        let before = columns.len();
        columns.retain(|c| c != &column);
        if columns.len() == before && caps.get(3).is_none() {
            return Err(format!("column \"{}\" of relation \"{}\" does not exist", column, table));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_model() {
        let mut tables = Tables::new();
        apply_statement(
            &mut tables,
            "CREATE TABLE users (id SERIAL PRIMARY KEY, name TEXT NOT NULL, UNIQUE (name));",
        )
        .unwrap();
        assert_eq!(tables["users"], vec!["id".to_string(), "name".to_string()]);

        apply_statement(&mut tables, "ALTER TABLE users ADD COLUMN email TEXT").unwrap();
        assert!(tables["users"].contains(&"email".to_string()));
        assert!(apply_statement(&mut tables, "ALTER TABLE users ADD COLUMN email TEXT").is_err());
        apply_statement(&mut tables, "ALTER TABLE users ADD COLUMN IF NOT EXISTS email TEXT").unwrap();

        apply_statement(&mut tables, "ALTER TABLE users DROP COLUMN email").unwrap();
        assert!(!tables["users"].contains(&"email".to_string()));

        assert!(apply_statement(&mut tables, "CREATE TABLE users (id INT)").is_err());
        assert!(apply_statement(&mut tables, "ALTER TABLE ghosts ADD COLUMN x INT").is_err());
        apply_statement(&mut tables, "CREATE INDEX users_name ON users (name)").unwrap();

        apply_statement(&mut tables, "DROP TABLE users").unwrap();
        assert!(tables.is_empty());
        assert!(apply_statement(&mut tables, "DROP TABLE users").is_err());
        apply_statement(&mut tables, "DROP TABLE IF EXISTS users").unwrap();
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_released_on_drop() {
        let store = MemoryStore::new();
        let mut first = store.driver();
        let mut second = store.driver();

        assert!(first.try_lock().await.unwrap());
        assert!(first.try_lock().await.unwrap());
        assert!(!second.try_lock().await.unwrap());

        drop(first);
        assert!(!store.is_locked());
        assert!(second.try_lock().await.unwrap());
    }

    #[tokio::test]
    async fn test_non_transactional_failure_keeps_partial_effects() {
        let store = MemoryStore::new();
        let mut driver = store.driver();
        let migration = Migration::up(
            1,
            "partial",
            &["CREATE TABLE a (id INT)", "CREATE TABLE a (id INT)"],
        );

        let err = driver
            .execute_and_record(&migration, TrackerRecord::clean(1))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Statement { version: 1, index: 1, .. }));
        assert!(store.has_table("a"));
        assert_eq!(store.tracker(), None);
    }

    #[tokio::test]
    async fn test_transactional_failure_rolls_back() {
        let store = MemoryStore::new();
        let mut driver = store.transactional_driver();
        store.fail_on("boom");
        let migration = Migration::up(1, "atomic", &["CREATE TABLE a (id INT)", "SELECT boom"]);

        assert!(driver
            .execute_and_record(&migration, TrackerRecord::clean(1))
            .await
            .is_err());
        assert!(!store.has_table("a"));
        assert!(store.executed().is_empty());
        assert_eq!(store.tracker(), None);

        store.clear_failures();
        driver
            .execute_and_record(&migration, TrackerRecord::clean(1))
            .await
            .unwrap();
        assert!(store.has_table("a"));
        assert_eq!(store.tracker(), Some(TrackerRecord::clean(1)));
    }
}
