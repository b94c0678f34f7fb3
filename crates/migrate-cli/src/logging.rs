//! Log output for the migration CLI
//!
//! Logs go to stderr so command output on stdout stays scriptable.

use std::io;
use tracing_subscriber::{fmt::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::settings::LoggingSettings;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(settings: &LoggingSettings) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&settings.level))?;

    if settings.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stderr).json())
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(Layer::new().with_writer(io::stderr).with_target(false))
            .try_init()?;
    }

    tracing::debug!(
        "Logging initialized (level: {}, format: {})",
        settings.level,
        if settings.json { "JSON" } else { "text" }
    );
    Ok(())
}
