//! Tracing subscriber setup.
//!
//! Logs go to stderr so stdout stays parseable for `--json` output and
//! query results. `RUST_LOG` overrides the configured level.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::{LogFormat, LoggingConfig};

/// Install the global subscriber. Calling it twice is harmless.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::builder()
        .with_default_directive(
            config
                .level
                .parse()
                .with_context(|| format!("invalid log level '{}'", config.level))?,
        )
        .from_env_lossy();

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let result = match config.format {
        LogFormat::Json => builder.json().with_current_span(true).try_init(),
        LogFormat::Text => builder.try_init(),
    };
    // A subscriber installed earlier (tests, embedding hosts) wins.
    let _ = result;
    Ok(())
}
