use morrigan_core::config::LoggerConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Keeps the rotating file writer's background flush thread alive for the
/// life of the process; dropping it stops log writes silently.
pub struct LoggingGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initializes the process-wide `tracing` subscriber from `logger.*`
/// configuration: an `EnvFilter` seeded by `logger.level` (overridable via
/// `RUST_LOG`), a console layer gated by `logger.console`, and — when
/// `logger.logDir` is set — a daily-rotating file sink.
pub fn init(config: &LoggerConfig) -> LoggingGuard {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = config
        .console
        .then(|| tracing_subscriber::fmt::layer().with_target(true));

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "morrigan.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // `try_init` rather than `init`: a process only gets one global
    // subscriber, but `setup()` may run more than once in the same process
    // (e.g. the supervisor's own test module starts several independent
    // servers in one test binary). A later caller's config losing the race
    // is harmless here — only the first subscriber installed ever logs.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    LoggingGuard {
        _file_guard: file_guard,
    }
}
