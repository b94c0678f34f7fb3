//! Migration Catalog - Loading, ordering and planning of migration files
//!
//! Reads paired `<version>_<name>.up.sql` / `<version>_<name>.down.sql` files from a
//! directory. Every structural problem is reported while loading, so a catalog that
//! loaded successfully can be planned against without touching the filesystem again.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Location, Token, Tokenizer};
use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::path::{Path, PathBuf};

use super::definitions::{Direction, Migration, Version, MAX_VERSION};
use crate::error::{CatalogError, MigrateError, MigrateResult};

static FILE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]+)_([^.]*)\.(up|down)\.sql$").expect("valid migration file pattern")
});

/// Forward migration and its optional inverse
#[derive(Debug, Clone)]
pub struct MigrationPair {
    pub up: Migration,
    pub down: Option<Migration>,
}

impl MigrationPair {
    pub fn name(&self) -> &str {
        &self.up.name
    }

    pub fn is_reversible(&self) -> bool {
        self.down.is_some()
    }
}

/// One step of a run: the migration to execute and the version recorded afterwards
#[derive(Debug, Clone, Copy)]
pub struct PlannedStep<'a> {
    pub migration: &'a Migration,
    pub target: Version,
}

/// How `create_migration` picks the version of a new pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionScheme {
    /// Latest version plus one, zero-padded to `width` digits
    Sequential { width: usize },
    /// UTC timestamp `YYYYMMDDHHMMSS`
    #[default]
    Timestamp,
}

/// Ordered, validated set of migrations
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    entries: BTreeMap<Version, MigrationPair>,
}

impl Catalog {
    /// Load every migration file from `dir`
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let dir = dir.as_ref();
        let unreadable = |source| CatalogError::Unreadable {
            path: dir.to_path_buf(),
            source,
        };

        let mut migrations = Vec::new();
        for entry in fs::read_dir(dir).map_err(unreadable)? {
            let path = entry.map_err(unreadable)?.path();
            if !path.is_file() || path.extension().map_or(true, |ext| ext != "sql") {
                continue;
            }
            migrations.push(parse_migration_file(&path)?);
        }

        let catalog = Self::from_migrations(migrations)?;
        tracing::debug!(
            "Loaded {} migration(s) from {}",
            catalog.len(),
            dir.display()
        );
        Ok(catalog)
    }

    /// Build a catalog from already-parsed migrations, applying the same checks as `load`
    pub fn from_migrations(migrations: Vec<Migration>) -> Result<Self, CatalogError> {
        let mut ups: BTreeMap<Version, Migration> = BTreeMap::new();
        let mut downs: BTreeMap<Version, Migration> = BTreeMap::new();

        for migration in migrations {
            if migration.version == 0 || migration.version > MAX_VERSION {
                return Err(CatalogError::MalformedVersion {
                    file: describe(&migration),
                });
            }
            let slot = match migration.direction {
                Direction::Up => &mut ups,
                Direction::Down => &mut downs,
            };
            if slot.contains_key(&migration.version) {
                return Err(CatalogError::Duplicate {
                    version: migration.version,
                    direction: migration.direction,
                });
            }
            slot.insert(migration.version, migration);
        }

        if let Some(version) = downs.keys().find(|v| !ups.contains_key(*v)) {
            return Err(CatalogError::MissingForward { version: *version });
        }

        let entries = ups
            .into_iter()
            .map(|(version, up)| {
                let down = downs.remove(&version);
                (version, MigrationPair { up, down })
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All versions in ascending order
    pub fn versions(&self) -> Vec<Version> {
        self.entries.keys().copied().collect()
    }

    pub fn contains(&self, version: Version) -> bool {
        self.entries.contains_key(&version)
    }

    pub fn pair(&self, version: Version) -> Option<&MigrationPair> {
        self.entries.get(&version)
    }

    pub fn pairs(&self) -> impl Iterator<Item = &MigrationPair> {
        self.entries.values()
    }

    pub fn get(&self, version: Version, direction: Direction) -> Option<&Migration> {
        let pair = self.entries.get(&version)?;
        match direction {
            Direction::Up => Some(&pair.up),
            Direction::Down => pair.down.as_ref(),
        }
    }

    pub fn latest(&self) -> Option<Version> {
        self.entries.keys().next_back().copied()
    }

    pub fn previous_before(&self, version: Version) -> Option<Version> {
        self.entries.range(..version).next_back().map(|(v, _)| *v)
    }

    /// Forward migrations with a version above `current`, ascending
    pub fn pending_after(&self, current: Version) -> Vec<&Migration> {
        self.entries
            .range((Excluded(current), Unbounded))
            .map(|(_, pair)| &pair.up)
            .collect()
    }

    /// Plan forward steps from `current`; `limit` of `None` means every pending migration.
    /// An empty plan means there is nothing to do.
    pub fn plan_forward(
        &self,
        current: Version,
        limit: Option<u64>,
    ) -> MigrateResult<Vec<PlannedStep<'_>>> {
        let pending = self.pending_after(current);
        let take = match limit {
            Some(requested) if !pending.is_empty() && (pending.len() as u64) < requested => {
                return Err(MigrateError::ShortLimit {
                    requested,
                    available: pending.len() as u64,
                });
            }
            Some(requested) => requested as usize,
            None => pending.len(),
        };

        Ok(pending
            .into_iter()
            .take(take)
            .map(|migration| PlannedStep {
                migration,
                target: migration.version,
            })
            .collect())
    }

    /// Plan `count` backward steps starting at `current`. Every step needs a down
    /// migration; a missing inverse fails the whole plan before anything runs.
    pub fn plan_backward(&self, current: Version, count: u64) -> MigrateResult<Vec<PlannedStep<'_>>> {
        if current == 0 || count == 0 {
            return Ok(Vec::new());
        }
        if !self.contains(current) {
            return Err(MigrateError::UnknownVersion { version: current });
        }

        let applied: Vec<(&Version, &MigrationPair)> =
            self.entries.range((Unbounded, Included(current))).rev().collect();
        if (applied.len() as u64) < count {
            return Err(MigrateError::ShortLimit {
                requested: count,
                available: applied.len() as u64,
            });
        }

        applied
            .into_iter()
            .take(count as usize)
            .map(|(version, pair)| {
                let migration = pair
                    .down
                    .as_ref()
                    .ok_or(MigrateError::NoInverse { version: *version })?;
                Ok(PlannedStep {
                    migration,
                    target: self.previous_before(*version).unwrap_or(0),
                })
            })
            .collect()
    }
}

/// Create an empty up/down pair in `dir` and return both paths
pub fn create_migration(
    dir: impl AsRef<Path>,
    name: &str,
    scheme: VersionScheme,
) -> MigrateResult<(PathBuf, PathBuf)> {
    let dir = dir.as_ref();
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(MigrateError::Configuration(format!(
            "Migration name '{}' has no usable characters",
            name
        )));
    }

    fs::create_dir_all(dir).map_err(|source| CatalogError::Unwritable {
        path: dir.to_path_buf(),
        source,
    })?;
    let existing = Catalog::load(dir)?;

    let (version, label) = match scheme {
        VersionScheme::Sequential { width } => {
            let next = existing
                .latest()
                .unwrap_or(0)
                .checked_add(1)
                .filter(|v| *v <= MAX_VERSION)
                .ok_or_else(|| {
                    MigrateError::Configuration("No sequential version left after the latest migration".to_string())
                })?;
            (next, format!("{:0width$}", next, width = width))
        }
        VersionScheme::Timestamp => {
            let label = Utc::now().format("%Y%m%d%H%M%S").to_string();
            let version = label
                .parse::<Version>()
                .ok()
                .filter(|v| *v <= MAX_VERSION)
                .ok_or_else(|| CatalogError::MalformedVersion { file: label.clone() })?;
            (version, label)
        }
    };
    if existing.contains(version) {
        return Err(CatalogError::Duplicate {
            version,
            direction: Direction::Up,
        }
        .into());
    }

    let created = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    // The header is SQL comments, so the name must stay on one line
    let title: String = name.chars().filter(|c| !c.is_control()).collect();
    let write_half = |direction: Direction| -> Result<PathBuf, CatalogError> {
        let path = dir.join(format!("{}_{}.{}.sql", label, slug, direction));
        let template = format!(
            "-- Migration: {}\n-- Version: {}\n-- Direction: {}\n-- Created: {}\n\n",
            title, version, direction, created
        );
        fs::write(&path, template).map_err(|source| CatalogError::Unwritable {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    };
    let up = write_half(Direction::Up)?;
    let down = write_half(Direction::Down)?;

    tracing::info!("Created migration {} ({})", version, slug);
    Ok((up, down))
}

/// Split a migration body on top-level `;` tokens.
///
/// Each statement keeps its original text, so quoting, dollar-quoted bodies and
/// formatting reach the database untouched. Leading comments are dropped and a
/// body with no executable tokens yields no statements.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    let tokens = match Tokenizer::new(&PostgreSqlDialect {}, sql).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(e) => {
            // The server's simple-query protocol accepts a multi-statement body as-is.
            tracing::warn!("SQL tokenizing failed, executing migration body as one statement: {}", e);
            let body = sql.trim();
            return if body.is_empty() { Vec::new() } else { vec![body.to_string()] };
        }
    };

    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect();

    let offset = |index: usize| {
        tokens
            .get(index)
            .map_or(sql.len(), |token| byte_offset(sql, &line_starts, &token.location))
    };

    let mut statements = Vec::new();
    let mut current: Option<(usize, usize)> = None;
    for (index, token) in tokens.iter().enumerate() {
        match token.token {
            // Comments are whitespace tokens too
            Token::Whitespace(_) => {}
            Token::SemiColon => {
                if let Some((begin, _)) = current.take() {
                    statements.push(sql[begin..offset(index + 1)].trim().to_string());
                }
            }
            _ => {
                let begin = current.map_or_else(|| offset(index), |(begin, _)| begin);
                current = Some((begin, offset(index + 1)));
            }
        }
    }
    if let Some((begin, end)) = current {
        statements.push(sql[begin..end].trim().to_string());
    }
    statements
}

/// Byte offset of a 1-based line/column (columns count chars) in `sql`
fn byte_offset(sql: &str, line_starts: &[usize], location: &Location) -> usize {
    let line = location.line.saturating_sub(1) as usize;
    let column = location.column.saturating_sub(1) as usize;
    let Some(&line_start) = line_starts.get(line) else {
        return sql.len();
    };
    sql[line_start..]
        .char_indices()
        .nth(column)
        .map_or(sql.len(), |(i, _)| line_start + i)
}

fn parse_migration_file(path: &Path) -> Result<Migration, CatalogError> {
    let file = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default()
        .to_string();

    let captures = FILE_NAME
        .captures(&file)
        .ok_or_else(|| CatalogError::MalformedFileName { file: file.clone() })?;

    let version = captures[1]
        .parse::<Version>()
        .ok()
        .filter(|v| (1..=MAX_VERSION).contains(v))
        .ok_or_else(|| CatalogError::MalformedVersion { file: file.clone() })?;
    let name = captures[2].replace('_', " ");
    let direction = if &captures[3] == "up" {
        Direction::Up
    } else {
        Direction::Down
    };

    let content = fs::read_to_string(path).map_err(|source| CatalogError::Unreadable {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(Migration {
        version,
        name,
        direction,
        statements: split_sql_statements(&content),
        source: Some(path.to_path_buf()),
    })
}

fn slugify(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn describe(migration: &Migration) -> String {
    migration
        .source
        .as_ref()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| format!("{}_{}.{}", migration.version, migration.name, migration.direction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, body: &str) {
        fs::write(dir.path().join(name), body).unwrap();
    }

    fn sample_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        write(&dir, "2_add_email.up.sql", "ALTER TABLE users ADD COLUMN email TEXT;");
        write(&dir, "2_add_email.down.sql", "ALTER TABLE users DROP COLUMN email;");
        write(&dir, "1_create_users.up.sql", "CREATE TABLE users (id INT);\nCREATE INDEX users_id ON users (id);");
        write(&dir, "1_create_users.down.sql", "DROP TABLE users;");
        write(&dir, "README.md", "not a migration");
        dir
    }

    #[test]
    fn test_load_orders_by_numeric_version() {
        let dir = sample_dir();
        write(&dir, "10_add_index.up.sql", "CREATE INDEX idx ON users (id);");

        let catalog = Catalog::load(dir.path()).unwrap();
        assert_eq!(catalog.versions(), vec![1, 2, 10]);
        assert_eq!(catalog.pair(1).unwrap().name(), "create users");
        assert_eq!(catalog.get(1, Direction::Up).unwrap().statements.len(), 2);
        assert!(catalog.get(10, Direction::Down).is_none());
        assert!(!catalog.pair(10).unwrap().is_reversible());
    }

    #[test]
    fn test_load_rejects_malformed_and_duplicate_entries() {
        let dir = sample_dir();
        write(&dir, "abc_broken.up.sql", "SELECT 1;");
        assert!(matches!(
            Catalog::load(dir.path()),
            Err(CatalogError::MalformedFileName { .. })
        ));

        let dir = sample_dir();
        write(&dir, "0_zero.up.sql", "SELECT 1;");
        assert!(matches!(
            Catalog::load(dir.path()),
            Err(CatalogError::MalformedVersion { .. })
        ));

        let dir = sample_dir();
        write(&dir, "99999999999999999999999_huge.up.sql", "SELECT 1;");
        assert!(matches!(
            Catalog::load(dir.path()),
            Err(CatalogError::MalformedVersion { .. })
        ));

        let dir = sample_dir();
        write(&dir, "0002_other_name.up.sql", "SELECT 1;");
        assert!(matches!(
            Catalog::load(dir.path()),
            Err(CatalogError::Duplicate { version: 2, direction: Direction::Up })
        ));
    }

    #[test]
    fn test_down_without_up_is_rejected() {
        let dir = sample_dir();
        write(&dir, "3_orphan.down.sql", "DROP TABLE orphan;");
        assert!(matches!(
            Catalog::load(dir.path()),
            Err(CatalogError::MissingForward { version: 3 })
        ));
    }

    #[test]
    fn test_missing_directory_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            Catalog::load(&missing),
            Err(CatalogError::Unreadable { .. })
        ));
    }

    #[test]
    fn test_plan_forward_and_limits() {
        let catalog = Catalog::load(sample_dir().path()).unwrap();

        let all: Vec<_> = catalog
            .plan_forward(0, None)
            .unwrap()
            .iter()
            .map(|s| s.target)
            .collect();
        assert_eq!(all, vec![1, 2]);

        let one = catalog.plan_forward(0, Some(1)).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].migration.version, 1);

        assert!(catalog.plan_forward(2, None).unwrap().is_empty());
        assert!(catalog.plan_forward(2, Some(3)).unwrap().is_empty());
        assert!(matches!(
            catalog.plan_forward(0, Some(3)),
            Err(MigrateError::ShortLimit { requested: 3, available: 2 })
        ));
    }

    #[test]
    fn test_plan_backward_targets_previous_version() {
        let catalog = Catalog::load(sample_dir().path()).unwrap();

        let steps = catalog.plan_backward(2, 2).unwrap();
        let shape: Vec<_> = steps
            .iter()
            .map(|s| (s.migration.version, s.migration.direction, s.target))
            .collect();
        assert_eq!(shape, vec![(2, Direction::Down, 1), (1, Direction::Down, 0)]);

        assert!(catalog.plan_backward(0, 1).unwrap().is_empty());
        assert!(matches!(
            catalog.plan_backward(7, 1),
            Err(MigrateError::UnknownVersion { version: 7 })
        ));
        assert!(matches!(
            catalog.plan_backward(1, 2),
            Err(MigrateError::ShortLimit { requested: 2, available: 1 })
        ));
    }

    #[test]
    fn test_plan_backward_requires_inverse() {
        let dir = sample_dir();
        write(&dir, "3_seed.up.sql", "INSERT INTO users VALUES (1);");
        let catalog = Catalog::load(dir.path()).unwrap();

        assert!(matches!(
            catalog.plan_backward(3, 1),
            Err(MigrateError::NoInverse { version: 3 })
        ));
    }

    #[test]
    fn test_split_sql_statements() {
        let statements = split_sql_statements(
            "-- Up migration\nCREATE TABLE users (id INT);\n\nDROP TABLE legacy;\n",
        );
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE users"));
        assert!(statements[1].ends_with(';'));

        assert!(split_sql_statements("-- nothing to do\n\n").is_empty());
    }

    #[test]
    fn test_split_keeps_original_text() {
        let function = "CREATE FUNCTION touch() RETURNS trigger AS $$ BEGIN NEW.x := 1; RETURN NEW; END; $$ LANGUAGE plpgsql;";
        let statements = split_sql_statements(function);
        assert_eq!(statements, vec![function.to_string()]);

        let body = "-- header\nINSERT INTO notes VALUES ('a;b', 'it''s');\n/* tail */ UPDATE  notes SET n = 1 -- trailing\n";
        let statements = split_sql_statements(body);
        assert_eq!(
            statements,
            vec![
                "INSERT INTO notes VALUES ('a;b', 'it''s');".to_string(),
                "UPDATE  notes SET n = 1".to_string(),
            ]
        );

        let tagged = "DO $body$ BEGIN PERFORM 1; END $body$;\nSELECT 'añadir';";
        let statements = split_sql_statements(tagged);
        assert_eq!(statements.len(), 2);
        assert_eq!(statements[0], "DO $body$ BEGIN PERFORM 1; END $body$;");
        assert_eq!(statements[1], "SELECT 'añadir';");
    }

    #[test]
    fn test_load_accepts_any_name_without_dots() {
        let dir = sample_dir();
        write(&dir, "3_add users.up.sql", "SELECT 1;");
        write(&dir, "4_añadir.up.sql", "SELECT 1;");
        write(&dir, "5_.up.sql", "SELECT 1;");
        write(&dir, "5_.down.sql", "SELECT 1;");

        let catalog = Catalog::load(dir.path()).unwrap();
        assert_eq!(catalog.versions(), vec![1, 2, 3, 4, 5]);
        assert_eq!(catalog.pair(3).unwrap().name(), "add users");
        assert_eq!(catalog.pair(4).unwrap().name(), "añadir");
        assert_eq!(catalog.pair(5).unwrap().name(), "");
        assert!(catalog.pair(5).unwrap().is_reversible());

        let dir = sample_dir();
        write(&dir, "3_v1.2.up.sql", "SELECT 1;");
        assert!(matches!(
            Catalog::load(dir.path()),
            Err(CatalogError::MalformedFileName { .. })
        ));
    }

    #[test]
    fn test_versions_beyond_tracker_range_are_rejected() {
        let dir = sample_dir();
        write(&dir, "18000000000000000000_x.up.sql", "SELECT 1;");
        assert!(matches!(
            Catalog::load(dir.path()),
            Err(CatalogError::MalformedVersion { .. })
        ));

        let dir = sample_dir();
        write(&dir, "9223372036854775807_last.up.sql", "SELECT 1;");
        let catalog = Catalog::load(dir.path()).unwrap();
        assert_eq!(catalog.latest(), Some(MAX_VERSION));

        let result = Catalog::from_migrations(vec![Migration::up(u64::MAX, "x", &["SELECT 1;"])]);
        assert!(matches!(result, Err(CatalogError::MalformedVersion { .. })));
    }

    #[test]
    fn test_create_migration_after_largest_version_fails() {
        let dir = TempDir::new().unwrap();
        write(&dir, "9223372036854775807_last.up.sql", "SELECT 1;");
        assert!(matches!(
            create_migration(dir.path(), "one more", VersionScheme::Sequential { width: 6 }),
            Err(MigrateError::Configuration(_))
        ));
    }

    #[test]
    fn test_create_migration_keeps_name_inside_header() {
        let dir = TempDir::new().unwrap();
        let (up, _) = create_migration(
            dir.path(),
            "add email\nDROP TABLE users;\r",
            VersionScheme::Sequential { width: 4 },
        )
        .unwrap();

        assert!(up.ends_with("0001_add_email_drop_table_users.up.sql"));
        let content = fs::read_to_string(&up).unwrap();
        assert!(content.contains("-- Migration: add emailDROP TABLE users;"));
        assert!(content.lines().all(|line| line.is_empty() || line.starts_with("--")));
        assert!(split_sql_statements(&content).is_empty());
    }

    #[test]
    fn test_create_migration_sequential() {
        let dir = sample_dir();
        let (up, down) =
            create_migration(dir.path(), "Add Avatar URL", VersionScheme::Sequential { width: 6 })
                .unwrap();

        assert!(up.ends_with("000003_add_avatar_url.up.sql"));
        assert!(down.ends_with("000003_add_avatar_url.down.sql"));
        let content = fs::read_to_string(&up).unwrap();
        assert!(content.contains("-- Migration: Add Avatar URL"));

        let catalog = Catalog::load(dir.path()).unwrap();
        assert_eq!(catalog.latest(), Some(3));
        assert!(catalog.get(3, Direction::Up).unwrap().statements.is_empty());
    }

    #[test]
    fn test_create_migration_rejects_empty_name() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            create_migration(dir.path(), "  --  ", VersionScheme::Timestamp),
            Err(MigrateError::Configuration(_))
        ));
    }
}
