//! Log output for processes embedding the crate.
//!
//! The crate only emits `tracing` events and spans. Call [`setup`]
//! once at startup if nothing else installs a subscriber.

use tracing::level_filters::LevelFilter;
use tracing::Subscriber;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::Registry;

use crate::errors::StateError;
use crate::errors::StateResult;

/// Parse a log level name. No level means `ERROR`.
pub fn log_level(level: Option<&str>) -> StateResult<LevelFilter> {
    match level.map(|level| level.to_lowercase()) {
        None => Ok(LevelFilter::ERROR),
        Some(level) => match level.as_str() {
            "trace" => Ok(LevelFilter::TRACE),
            "debug" => Ok(LevelFilter::DEBUG),
            "info" => Ok(LevelFilter::INFO),
            "warn" => Ok(LevelFilter::WARN),
            "error" => Ok(LevelFilter::ERROR),
            level => Err(StateError::invalid_config(&format!(
                "wrong log level: {level}"
            ))),
        },
    }
}

/// Install a global subscriber that prints this crate's events at
/// `level` and above.
///
/// `RUST_LOG`, if set, takes precedence over `level`.
pub fn setup(level: Option<&str>) -> StateResult<()> {
    let level = log_level(level)?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("operator_state={level}")));

    let logs = tracing_subscriber::fmt::Layer::default()
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_filter(filter);
    set_global_subscriber(Registry::default().with(logs));
    Ok(())
}

// Setting the global subscriber fails if one was already set, which
// happens when tests or embedders call `setup` more than once.
fn set_global_subscriber<S>(subscriber: S)
where
    S: Subscriber + Send + Sync + 'static,
{
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        tracing::warn!("{err}");
    }
}

#[test]
fn log_level_defaults_to_error() {
    assert_eq!(log_level(None).unwrap(), LevelFilter::ERROR);
    assert_eq!(log_level(Some("DEBUG")).unwrap(), LevelFilter::DEBUG);
    assert!(matches!(
        log_level(Some("loud")),
        Err(StateError::InvalidConfig(_))
    ));
}

#[test]
fn setup_twice_is_harmless() {
    setup(Some("info")).unwrap();
    setup(None).unwrap();
}
