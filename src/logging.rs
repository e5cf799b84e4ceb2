use std::sync::Once;

use tracing_subscriber::{EnvFilter, prelude::*};

use crate::config::LogFormat;

static INIT: Once = Once::new();

fn build_env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Installs the global subscriber once. Logs go to stderr so command output
/// on stdout stays machine-readable.
///
/// `RUST_LOG` wins over `verbose`.
pub fn init(log_format: LogFormat, verbose: bool) {
    INIT.call_once(|| {
        let env_filter = build_env_filter(verbose);
        let registry = tracing_subscriber::registry();
        match log_format {
            LogFormat::Text => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .compact()
                    .with_filter(env_filter);
                let _ = registry.with(fmt_layer).try_init();
            }
            LogFormat::Json => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .json()
                    .with_filter(env_filter);
                let _ = registry.with(fmt_layer).try_init();
            }
        }
    });
}
