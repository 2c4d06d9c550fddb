use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// `$HOME/<app>-<action>.log`
pub fn log_file(app: &str, action: &str) -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(format!("{app}-{action}.log")))
}

/// Status lines to stdout at `info` (`debug` with `--verbose`); the log
/// file always gets `debug`. `RUST_LOG` overrides the console level.
pub fn init(app: &str, action: &str, verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let console = fmt::layer()
        .with_writer(std::io::stdout)
        .without_time()
        .with_target(false)
        .with_level(false)
        .with_filter(console_filter);

    let file = log_file(app, action).and_then(|path| {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    let file_layer = file.map(|f| {
        fmt::layer()
            .with_writer(Mutex::new(f))
            .with_ansi(false)
            .with_target(false)
            .with_filter(EnvFilter::new("debug"))
    });

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .init();
}
