use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    EnvFilter, filter::Targets, fmt, prelude::__tracing_subscriber_SubscriberExt,
    util::SubscriberInitExt,
};

/// Installs the global subscriber.
///
/// `verbose` turns on debug output for this crate. Otherwise `level` (from
/// config or `LOG_LEVEL`) applies, defaulting to `info`. `RUST_LOG`, when
/// set, replaces the level for the env filter. Other crates log at WARN.
pub fn init_logging(verbose: bool, level: Option<&str>) {
    let level = if verbose {
        "debug"
    } else {
        level.unwrap_or("info")
    };
    let app_level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);
    let app_filter = Targets::new()
        .with_target("fxagg", app_level)
        .with_default(LevelFilter::WARN);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(app_filter)
        .with(env_filter)
        .init();
}
