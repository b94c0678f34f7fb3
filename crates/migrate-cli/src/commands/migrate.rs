use anyhow::{Context, Result};

use playhub_migrate::{
    create_migration, MigrateResult, MigrationRunResult, MigrationStatus, Migrator, PostgresDriver,
    TrackerRecord, Version, VersionScheme,
};

use crate::settings::MigrateSettings;

pub async fn up(settings: &MigrateSettings) -> Result<()> {
    let mut migrator = connect(settings).await?;
    let result = migrator.up().await;
    close(migrator).await;
    report(result.context("Failed to run migrations")?);
    Ok(())
}

pub async fn down(settings: &MigrateSettings) -> Result<()> {
    let mut migrator = connect(settings).await?;
    let result = migrator.down().await;
    close(migrator).await;
    report(result.context("Failed to roll back migration")?);
    Ok(())
}

pub async fn steps(settings: &MigrateSettings, steps: i64) -> Result<()> {
    let mut migrator = connect(settings).await?;
    let result = migrator.steps(steps).await;
    close(migrator).await;
    report(result.with_context(|| format!("Failed to run {} migration steps", steps))?);
    Ok(())
}

pub async fn version(settings: &MigrateSettings) -> Result<()> {
    let mut migrator = connect(settings).await?;
    let result = migrator.version().await;
    close(migrator).await;
    let state = result.context("Failed to read migration version")?;
    println!("Current version: {}", state);
    Ok(())
}

pub async fn force(settings: &MigrateSettings, version: Version) -> Result<()> {
    let mut migrator = connect(settings).await?;
    let result = migrator.force(version).await;
    close(migrator).await;
    let state = result.with_context(|| format!("Failed to force version {}", version))?;
    println!("Forced version: {}", state);
    Ok(())
}

pub async fn status(settings: &MigrateSettings) -> Result<()> {
    let mut migrator = connect(settings).await?;
    let result = status_report(&mut migrator).await;
    close(migrator).await;
    let (state, entries) = result.context("Failed to read migration status")?;

    println!("Migration Status:");
    println!("================");
    println!("Current version: {}", state);
    if entries.is_empty() {
        println!("No migrations found");
        return Ok(());
    }

    for entry in &entries {
        let marker = if entry.applied { "applied" } else { "pending" };
        let reversible = if entry.reversible { "" } else { "  (no down)" };
        println!("  [{}] {} {}{}", marker, entry.version, entry.name, reversible);
    }
    let pending = entries.iter().filter(|entry| !entry.applied).count();
    println!("\n{} migration(s), {} pending", entries.len(), pending);
    Ok(())
}

pub async fn create(settings: &MigrateSettings, name: &str, sequential: bool, digits: usize) -> Result<()> {
    let scheme = if sequential {
        VersionScheme::Sequential { width: digits }
    } else {
        VersionScheme::Timestamp
    };
    let (up, down) = create_migration(&settings.database.migrations_dir, name, scheme)
        .with_context(|| format!("Failed to create migration '{}'", name))?;

    println!("Created migration:");
    println!("  {}", up.display());
    println!("  {}", down.display());
    Ok(())
}

async fn connect(settings: &MigrateSettings) -> Result<Migrator<PostgresDriver>> {
    let url = settings.database_url()?;
    Migrator::connect(url, settings.migration_config())
        .await
        .context("Failed to create migrator")
}

async fn status_report(
    migrator: &mut Migrator<PostgresDriver>,
) -> MigrateResult<(TrackerRecord, Vec<MigrationStatus>)> {
    let state = migrator.version().await?;
    let entries = migrator.status().await?;
    Ok((state, entries))
}

async fn close(migrator: Migrator<PostgresDriver>) {
    if let Err(e) = migrator.close().await {
        tracing::warn!("Failed to close database connection: {}", e);
    }
}

fn report(result: Option<MigrationRunResult>) {
    match result {
        Some(result) => println!(
            "Applied {} migration(s) {}: {:?}, now at version {} ({} ms)",
            result.applied_count(),
            result.direction,
            result.applied,
            result.final_state,
            result.execution_time_ms
        ),
        None => println!("No change"),
    }
}
