use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global subscriber: stderr output (compact, or JSON lines when
/// `json` is set) plus a Sentry layer.
///
/// `level` is the default filter for this crate; `RUST_LOG` overrides it.
/// ERROR events become Sentry issues (so orphaned scenarios alert), WARN
/// events become breadcrumbs. The Sentry layer is a no-op without a DSN.
pub fn init(level: &str, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,scenariodb={level}")));

    let stderr_layer = if json {
        fmt::layer()
            .with_writer(std::io::stderr)
            .json()
            .with_current_span(false)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_thread_ids(false)
            .compact()
            .boxed()
    };

    let sentry_layer = sentry_tracing::layer().event_filter(|meta| match *meta.level() {
        tracing::Level::ERROR => sentry_tracing::EventFilter::Event,
        tracing::Level::WARN => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stderr_layer)
        .with(sentry_layer)
        .init();

    tracing::debug!(level, json, "Tracing initialized");
}
