//! Structured logging for tether nodes.
//!
//! Console output with uptime timestamps and module paths, plus a JSON log file
//! in debug builds. `RUST_LOG` wins over the configured level.

use std::fs::File;
use std::path::Path;

use tether_config::Config;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,tether_net=info";

/// Initialize the global tracing subscriber.
///
/// * `log_dir` - directory for `tether.log`. Falls back to `config.debug.log_dir`.
/// * `debug_build` - file logging is only enabled in debug builds.
/// * `config` - supplies the log level when `RUST_LOG` is unset.
///
/// ```no_run
/// use tether_config::Config;
/// use tether_log::init_logging;
///
/// let config = Config::default();
/// init_logging(Some(std::path::Path::new("./logs")), true, Some(&config));
/// ```
pub fn init_logging(log_dir: Option<&Path>, debug_build: bool, config: Option<&Config>) {
    let filter_str = filter_directive(config);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true)
        .with_timer(fmt::time::uptime());

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    let log_dir = log_dir.or_else(|| config.and_then(|c| c.debug.log_dir.as_deref()));
    if debug_build
        && let Some(log_dir) = log_dir
        && std::fs::create_dir_all(log_dir).is_ok()
        && let Ok(log_file) = File::create(log_dir.join("tether.log"))
    {
        subscriber.with(json_file_layer(log_file)).init();
        tracing::debug!(path = %log_dir.join("tether.log").display(), "File logging enabled");
        return;
    }

    subscriber.init();
}

/// The default filter: `info` everywhere, including the transport.
pub fn default_env_filter() -> EnvFilter {
    EnvFilter::new(DEFAULT_FILTER)
}

fn filter_directive(config: Option<&Config>) -> String {
    match config {
        Some(config) if !config.debug.log_level.is_empty() => config.debug.log_level.clone(),
        _ => DEFAULT_FILTER.to_string(),
    }
}

/// One JSON object per line, no ANSI codes.
fn json_file_layer<S>(log_file: File) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .json()
}
