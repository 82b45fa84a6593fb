use std::io;
use tracing::Level;
use tracing_subscriber::filter::FilterFn;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,html5ever=error,selectors=error";

/// Logs go to stderr; stdout carries progress lines and the session.
pub fn configure_logging() {
    // html5ever complains about most real-world markup
    let quiet_parsers = FilterFn::new(|metadata| {
        !(metadata.level() == &Level::WARN && metadata.target().starts_with("html5ever"))
    });

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let stderr_log = fmt::layer()
        .with_writer(io::stderr)
        .with_target(false)
        .with_filter(filter)
        .with_filter(quiet_parsers);

    // A second call (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::registry().with(stderr_log).try_init();
}
