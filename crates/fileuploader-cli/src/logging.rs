use std::env;

use fileuploader_tokens::config::{Config, LogFormat};
use fileuploader_tokens::logging::init_json_logging;
use sentry::integrations::tracing::EventFilter;
use tracing::Metadata;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

/// The default filter directives for a configured level.
///
/// Above `info`, only our own crates get chatty.
fn default_directives(level: LevelFilter) -> String {
    let name = level.to_string().to_ascii_lowercase();
    if level <= LevelFilter::INFO {
        return name;
    }
    format!("info,fileuploader_cli={name},fileuploader_tokens={name}")
}

/// Errors become Sentry events, warnings and infos are kept as logs.
fn sentry_event_filter(metadata: &Metadata<'_>) -> EventFilter {
    match *metadata.level() {
        tracing::Level::ERROR => EventFilter::Event | EventFilter::Log,
        tracing::Level::WARN | tracing::Level::INFO => EventFilter::Log,
        _ => EventFilter::Ignore,
    }
}

/// Installs the global log subscriber according to `config.logging`.
///
/// `RUST_LOG` overrides the configured level. Logs go to stderr, so stdout only carries tokens.
///
/// # Safety
/// This may set `RUST_BACKTRACE` with [`std::env::set_var`], and must therefore be called while
/// the process is still single-threaded.
pub unsafe fn init_logging(config: &Config) {
    let logging = &config.logging;
    if logging.enable_backtraces {
        // SAFETY: upheld by the caller.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let directives =
        env::var("RUST_LOG").unwrap_or_else(|_| default_directives(logging.level));

    let pretty = match logging.format {
        LogFormat::Json => {
            if let Err(error) = init_json_logging(&directives, std::io::stderr) {
                eprintln!("failed to set up logging: {error}");
            }
            return;
        }
        LogFormat::Pretty => true,
        LogFormat::Simplified => false,
        LogFormat::Auto => console::user_attended_stderr(),
    };

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_timer(UtcTime::rfc_3339());
    let fmt_layer = if pretty {
        layer.pretty().boxed()
    } else {
        layer.compact().with_ansi(false).boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer.with_filter(EnvFilter::new(&directives)))
        .with(sentry::integrations::tracing::layer().event_filter(sentry_event_filter))
        .init();
}

/// Reports a fatal error, through the logger if it is up and to stderr otherwise.
pub fn ensure_log_error(error: &anyhow::Error) {
    if LevelFilter::current() >= LevelFilter::ERROR {
        tracing::error!("{error:?}");
    } else {
        eprintln!("{error:?}");
    }
}
