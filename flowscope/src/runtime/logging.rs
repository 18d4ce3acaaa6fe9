//! Process-wide `tracing` subscriber.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::runtime::conf::{Conf, LogFormat};

/// Builds the filter: `RUST_LOG` when set, otherwise `warn` for dependencies and
/// the configured level for flowscope itself.
pub fn env_filter(conf: &Conf) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,flowscope={}", conf.log_level)))
}

/// Installs the global subscriber. Also bridges `log` records (emitted by
/// `aya_log::EbpfLogger` for classifier-side log lines) into `tracing`.
pub fn init_tracing(conf: &Conf) {
    let filter = env_filter(conf);
    let registry = tracing_subscriber::registry().with(filter);

    // A subscriber may already be installed (tests, embedding); keep the first one.
    let result = match conf.log_format {
        LogFormat::Full => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_target(true))
            .try_init(),
    };
    if let Err(e) = result {
        tracing::debug!(
            event.name = "logging.already_initialized",
            error.message = %e,
            "tracing subscriber already installed"
        );
    }
}
