use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::LoggingConfig;

static INSTALLED: OnceLock<()> = OnceLock::new();

/// Installs the global `tracing` subscriber.
///
/// `RUST_LOG` wins over the configured filter. Calling this again, or after
/// another subscriber was installed, leaves the existing one in place.
pub fn init(config: &LoggingConfig) {
    if INSTALLED.get().is_some() {
        return;
    }

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_ansi(config.ansi);

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer);

    // Another subscriber may already be installed by the host process.
    let _ = subscriber.try_init();
    let _ = INSTALLED.set(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_repeatable() {
        let config = LoggingConfig {
            filter: "not a [valid filter".into(),
            ansi: false,
        };
        init(&config);
        init(&LoggingConfig::default());
        tracing::info!("logging initialised");
    }
}
