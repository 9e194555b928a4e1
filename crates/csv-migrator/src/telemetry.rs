//! Global tracing setup: `log` macros are bridged into a `tracing-subscriber`
//! registry that writes to stderr, leaving stdout for command output.

use std::sync::atomic::{AtomicBool, Ordering};

use log::LevelFilter;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, layer::Layer, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

static TELEMETRY_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Installs the subscriber once. `RUST_LOG` wins over the configured level.
pub fn init_tracing(logging: &LoggingConfig) {
    if TELEMETRY_INITIALIZED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }

    if let Err(err) = LogTracer::builder()
        .with_max_level(LevelFilter::Trace)
        .init()
    {
        eprintln!("Warning: failed to install log bridge: {}", err);
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.to_ascii_lowercase()));

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer().json().with_writer(std::io::stderr).boxed(),
        LogFormat::Pretty => fmt::layer().with_writer(std::io::stderr).boxed(),
    };

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        TELEMETRY_INITIALIZED.store(false, Ordering::SeqCst);
        eprintln!("Warning: failed to set tracing subscriber: {}", err);
    }
}
