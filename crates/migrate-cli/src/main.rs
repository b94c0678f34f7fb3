mod commands;
mod logging;
mod settings;

use clap::{Parser, Subcommand};
use commands::migrate;
use playhub_migrate::{MigrateError, Version};
use settings::{GlobalArgs, MigrateSettings};

#[derive(Parser)]
#[command(name = "playhub-migrate")]
#[command(about = "Versioned database migrations for the playhub backend")]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all pending migrations
    Up,

    /// Roll back the last migration
    Down,

    /// Run N migrations forward, or back when N is negative
    Steps {
        /// Number of steps
        #[arg(long, allow_negative_numbers = true)]
        steps: i64,
    },

    /// Show the current migration version
    Version,

    /// Set the migration version without running migrations (clears the dirty flag)
    Force {
        /// Version to record
        #[arg(long)]
        version: Version,
    },

    /// List migrations and whether they are applied
    Status,

    /// Create a new up/down migration pair
    Create {
        /// Migration name
        name: String,

        /// Use the next sequential version instead of a timestamp
        #[arg(long)]
        seq: bool,

        /// Zero-padded width of sequential versions
        #[arg(long, default_value_t = 6)]
        digits: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        let stuck = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<MigrateError>())
            .and_then(MigrateError::stuck_version);
        if let Some(version) = stuck {
            eprintln!(
                "Repair the schema for version {} by hand, then run `playhub-migrate force --version <v>`",
                version
            );
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = MigrateSettings::resolve(&cli.global)?;
    logging::init_logging(&settings.logging).map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    match cli.command {
        Commands::Up => migrate::up(&settings).await,
        Commands::Down => migrate::down(&settings).await,
        Commands::Steps { steps } => migrate::steps(&settings, steps).await,
        Commands::Version => migrate::version(&settings).await,
        Commands::Force { version } => migrate::force(&settings, version).await,
        Commands::Status => migrate::status(&settings).await,
        Commands::Create { name, seq, digits } => migrate::create(&settings, &name, seq, digits).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_negative_steps_and_global_flags() {
        let cli = Cli::try_parse_from([
            "playhub-migrate",
            "steps",
            "--steps",
            "-2",
            "--no-wait",
            "--table",
            "versions",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Steps { steps: -2 }));
        assert!(cli.global.no_wait);
        assert_eq!(cli.global.table.as_deref(), Some("versions"));
    }

    #[test]
    fn test_force_requires_version() {
        assert!(Cli::try_parse_from(["playhub-migrate", "force"]).is_err());
        let cli = Cli::try_parse_from(["playhub-migrate", "force", "--version", "3"]).unwrap();
        assert!(matches!(cli.command, Commands::Force { version: 3 }));
    }

    #[test]
    fn test_no_wait_conflicts_with_timeout() {
        let result = Cli::try_parse_from([
            "playhub-migrate",
            "up",
            "--no-wait",
            "--lock-timeout",
            "5",
        ]);
        assert!(result.is_err());
    }
}
