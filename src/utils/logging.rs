use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

static INIT: OnceCell<()> = OnceCell::new();

/// Install the global tracing subscriber. RUST_LOG wins when set,
/// otherwise the configured level applies crate-wide. Calling this a
/// second time is a no-op.
pub fn init_tracing(config: &LoggingConfig) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("telegram_max_bridge={},warn", config.level))
        });

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);

        if config.format == "json" {
            builder.json().init();
        } else {
            builder.init();
        }
    });
}
