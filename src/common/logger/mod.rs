use tracing::Dispatch;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod formatter;

pub use formatter::*;

use crate::{common::types::AnyResult, configs::LoggingConfig};

/// Builds the `EnvFilter` directive string for a logging section.
///
/// Noisy transport crates are pinned to `warn` unless the user filters
/// mention them explicitly.
pub fn filter_directive(config: Option<&LoggingConfig>) -> String {
    let log_level = config.and_then(|l| l.level.as_deref()).unwrap_or("info");
    let filters = config.and_then(|l| l.filters.as_deref()).unwrap_or("");

    if filters.is_empty() {
        format!("{},tungstenite=warn,tokio_tungstenite=warn", log_level)
    } else {
        format!(
            "{},tungstenite=warn,tokio_tungstenite=warn,{}",
            log_level, filters
        )
    }
}

/// Builds a dispatcher with the stock formatter without installing it.
///
/// Pass the result to `Gateway::with_logger` / `VoiceConnection` to scope
/// output to a single component.
pub fn build_dispatch(config: Option<&LoggingConfig>) -> Dispatch {
    let env_filter = EnvFilter::new(filter_directive(config));
    let stdout_layer = fmt::layer()
        .event_format(CustomFormatter::new(true))
        .with_ansi(true);

    Dispatch::new(tracing_subscriber::registry().with(env_filter).with(stdout_layer))
}

/// Installs the stock subscriber as the process-wide default.
///
/// `RUST_LOG` overrides the configured level when set.
pub fn init(config: Option<&LoggingConfig>) -> AnyResult<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(config)));

    let stdout_layer = fmt::layer()
        .event_format(CustomFormatter::new(true))
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .try_init()?;
    Ok(())
}

/// The dispatcher in effect for the calling thread.
///
/// Components capture this at construction, so with no subscriber
/// installed (as in tests) they log nowhere.
pub fn current() -> Dispatch {
    tracing::dispatcher::get_default(Dispatch::clone)
}
