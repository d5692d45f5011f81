use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

use crate::config::AppConfig;

/// Installs the global subscriber. `LOG_FORMAT=json` (the default) is meant for
/// production log shipping; anything else prints compact text.
pub fn init(cfg: &AppConfig) -> anyhow::Result<()> {
    let rust_log_env = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&rust_log_env))?;
    let subscriber = Registry::default().with(env_filter);

    if cfg.log_format == "json" {
        subscriber
            .with(fmt::layer().json().flatten_event(true).with_current_span(false))
            .try_init()?;
    } else {
        subscriber.with(fmt::layer().compact()).try_init()?;
    }
    Ok(())
}
