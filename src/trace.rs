//! Tracing subscriber wiring, keyed off [`LogLevel`](crate::config::LogLevel).

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LogLevel;

/// Install the global tracing subscriber. `LogLevel::None` installs
/// nothing, leaving the default no-op dispatcher in place.
pub fn init_tracing(level: LogLevel) {
    let Some(default_directive) = level.as_filter_directive() else {
        return;
    };

    let directive = default_directive
        .parse()
        .unwrap_or_else(|_| tracing::Level::ERROR.into());

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::builder().with_default_directive(directive).from_env_lossy())
        .init();
}
