use anyhow::{Context, Result};
use clap::Args;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use playhub_migrate::{LockMode, MigrationConfig};

/// Flags shared by every subcommand. They override the config file and environment.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Database connection URL
    #[arg(long, global = true, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// YAML settings file
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory holding <version>_<name>.<up|down>.sql files
    #[arg(long, global = true, value_name = "DIR")]
    pub migrations_dir: Option<PathBuf>,

    /// Version tracker table
    #[arg(long, global = true)]
    pub table: Option<String>,

    /// Fail immediately if another process holds the migration lock
    #[arg(long, global = true, conflicts_with = "lock_timeout")]
    pub no_wait: bool,

    /// Give up waiting for the migration lock after this many seconds
    #[arg(long, global = true, value_name = "SECS")]
    pub lock_timeout: Option<u64>,

    /// Log level filter (e.g. "info", "playhub_migrate=debug")
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrateSettings {
    pub database: DatabaseSettings,
    pub lock: LockSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    /// Environment variable consulted when `url` is not set
    pub url_env: String,
    pub migrations_dir: PathBuf,
    pub migrations_table: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSettings {
    pub wait: bool,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        let config = MigrationConfig::default();
        Self {
            url: None,
            url_env: "DATABASE_URL".to_string(),
            migrations_dir: config.migrations_dir,
            migrations_table: config.migrations_table,
        }
    }
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            wait: true,
            timeout_secs: None,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl MigrateSettings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid settings file {}", path.display()))?;
        Ok(settings)
    }

    /// Settings from the optional file, then the environment, then command-line flags
    pub fn resolve(args: &GlobalArgs) -> Result<Self> {
        let mut settings = match &args.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        settings.apply_env();
        settings.apply_args(args);
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(&self.database.url_env) {
            if !url.is_empty() {
                self.database.url = Some(url);
            }
        }
    }

    fn apply_args(&mut self, args: &GlobalArgs) {
        if let Some(url) = &args.database_url {
            self.database.url = Some(url.clone());
        }
        if let Some(dir) = &args.migrations_dir {
            self.database.migrations_dir = dir.clone();
        }
        if let Some(table) = &args.table {
            self.database.migrations_table = table.clone();
        }
        if args.no_wait {
            self.lock.wait = false;
            self.lock.timeout_secs = None;
        }
        if let Some(secs) = args.lock_timeout {
            self.lock.timeout_secs = Some(secs);
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
        if args.log_json {
            self.logging.json = true;
        }
    }

    pub fn database_url(&self) -> Result<&str> {
        self.database.url.as_deref().with_context(|| {
            format!(
                "{} environment variable or --database-url is required",
                self.database.url_env
            )
        })
    }

    pub fn lock_mode(&self) -> LockMode {
        match self.lock.timeout_secs {
            Some(secs) => LockMode::Timeout(Duration::from_secs(secs)),
            None if self.lock.wait => LockMode::Wait,
            None => LockMode::NoWait,
        }
    }

    pub fn migration_config(&self) -> MigrationConfig {
        MigrationConfig {
            migrations_dir: self.database.migrations_dir.clone(),
            migrations_table: self.database.migrations_table.clone(),
            lock_mode: self.lock_mode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    #[serial]
    fn test_defaults() {
        std::env::remove_var("DATABASE_URL");
        let settings = MigrateSettings::resolve(&GlobalArgs::default()).unwrap();

        assert!(settings.database_url().is_err());
        assert_eq!(settings.lock_mode(), LockMode::Wait);
        let config = settings.migration_config();
        assert_eq!(config.migrations_dir, PathBuf::from("migrations"));
        assert_eq!(config.migrations_table, "schema_migrations");
    }

    #[test]
    #[serial]
    fn test_file_then_env_then_flags() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("migrate.yaml");
        fs::write(
            &path,
            "database:\n  url: postgres://file/playhub\n  url_env: PLAYHUB_DB_URL\n  migrations_table: app_versions\nlock:\n  timeout_secs: 30\n",
        )
        .unwrap();

        std::env::remove_var("PLAYHUB_DB_URL");
        let args = GlobalArgs {
            config: Some(path.clone()),
            ..GlobalArgs::default()
        };
        let settings = MigrateSettings::resolve(&args).unwrap();
        assert_eq!(settings.database_url().unwrap(), "postgres://file/playhub");
        assert_eq!(settings.database.migrations_table, "app_versions");
        assert_eq!(settings.lock_mode(), LockMode::Timeout(Duration::from_secs(30)));

        std::env::set_var("PLAYHUB_DB_URL", "postgres://env/playhub");
        let settings = MigrateSettings::resolve(&args).unwrap();
        assert_eq!(settings.database_url().unwrap(), "postgres://env/playhub");

        let args = GlobalArgs {
            database_url: Some("postgres://flag/playhub".to_string()),
            no_wait: true,
            table: Some("flag_versions".to_string()),
            ..args
        };
        let settings = MigrateSettings::resolve(&args).unwrap();
        assert_eq!(settings.database_url().unwrap(), "postgres://flag/playhub");
        assert_eq!(settings.database.migrations_table, "flag_versions");
        assert_eq!(settings.lock_mode(), LockMode::NoWait);

        std::env::remove_var("PLAYHUB_DB_URL");
    }

    #[test]
    fn test_invalid_file_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("broken.yaml");
        fs::write(&path, "database: [not, a, map]\n").unwrap();

        let err = MigrateSettings::load(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid settings file"));
        assert!(MigrateSettings::load(&temp_dir.path().join("missing.yaml")).is_err());
    }
}
