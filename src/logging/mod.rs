use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Initialize the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise "info", or "debug" with `verbose`.
/// The returned guard must be held by main so buffered log lines are flushed
/// on shutdown.
pub fn init_logging(verbose: bool) -> WorkerGuard {
    let default = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());

    let formatting_layer = fmt::layer()
        .with_target(true)
        .compact()
        .with_writer(writer);

    let subscriber = Registry::default().with(filter).with(formatting_layer);
    // ignore the error so tests can call this more than once
    let _ = tracing::subscriber::set_global_default(subscriber);
    guard
}
