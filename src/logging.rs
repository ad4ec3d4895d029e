//! Logging setup.
//!
//! The library only emits `tracing` events and spans; nothing is
//! printed until the embedding program installs a subscriber. Call
//! [`setup`] once at startup for the default compact stdout logger.
//!
//! Workers log inside a `worker_main` span carrying their index, and
//! run on threads named `sackfix-worker-{index}`, so interleaved
//! output can be told apart.

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::config::ConfigError;

/// Env var holding full `tracing_subscriber` filter directives, e.g.
/// `sackfix=debug,sackfix::store=trace`. Overrides the level passed to
/// [`setup`].
pub const LOG_ENV: &str = "SACKFIX_LOG";

fn get_log_level(level: Option<&str>) -> Result<LevelFilter, ConfigError> {
    match level.map(str::to_lowercase).as_deref() {
        Some("trace") => Ok(LevelFilter::TRACE),
        Some("debug") => Ok(LevelFilter::DEBUG),
        Some("info") => Ok(LevelFilter::INFO),
        Some("warn") => Ok(LevelFilter::WARN),
        Some("error") => Ok(LevelFilter::ERROR),
        Some(level) => Err(ConfigError::BadLogLevel(level.to_string())),
        None => Ok(LevelFilter::INFO),
    }
}

fn fmt_layer<S>() -> impl Layer<S> + Send + Sync + 'static
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .compact()
        // Show source file
        .with_file(true)
        // Display source code line numbers
        .with_line_number(true)
        // Display the thread ID and name an event was recorded on
        .with_thread_ids(true)
        .with_thread_names(true)
}

/// Install a global stdout subscriber for `sackfix` events at
/// `log_level` (default "info").
///
/// If [`LOG_ENV`] is set its directives are used instead. Calling
/// this when a global subscriber already exists logs a warning and
/// leaves the existing one in place.
pub fn setup(log_level: Option<&str>) -> Result<(), ConfigError> {
    let level = get_log_level(log_level)?;
    let logs: Box<dyn Layer<Registry> + Send + Sync> = match std::env::var(LOG_ENV) {
        Ok(directives) => {
            let filter = EnvFilter::try_new(&directives)
                .map_err(|err| ConfigError::BadLogFilter(format!("{directives:?}: {err}")))?;
            fmt_layer().with_filter(filter).boxed()
        }
        Err(_) => fmt_layer()
            .with_filter(Targets::new().with_target("sackfix", level))
            .boxed(),
    };
    set_global_subscriber(Registry::default().with(logs));
    Ok(())
}

// Try to set a global default subscriber, logging the error without
// failing if it was already set.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    // This can fail if tracing was already initialized, which happens
    // in tests and when an embedding program set up its own.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_level_parses() {
    assert_eq!(get_log_level(None), Ok(LevelFilter::INFO));
    assert_eq!(get_log_level(Some("DEBUG")), Ok(LevelFilter::DEBUG));
    assert_eq!(get_log_level(Some("warn")), Ok(LevelFilter::WARN));
    assert_eq!(
        get_log_level(Some("loud")),
        Err(ConfigError::BadLogLevel("loud".to_string()))
    );
}

#[test]
fn setup_twice_is_harmless() {
    assert!(setup(Some("trace")).is_ok());
    assert!(setup(Some("error")).is_ok());
}
