use dirs::home_dir;
use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, time::FormatTime},
    prelude::*,
    EnvFilter,
};

/// Set up file + stdout logging. The returned guard must stay alive for the
/// lifetime of the process or buffered log lines are lost.
pub fn setup_logging(verbose: bool, log_file: Option<&str>) -> Result<WorkerGuard, io::Error> {
    let log_file = match log_file {
        Some(path) => PathBuf::from(path),
        None => default_log_path()?,
    };

    if let Some(parent) = log_file.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file_appender = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)?;

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let log_level = if verbose { Level::DEBUG } else { Level::INFO };
    let env_filter = EnvFilter::new(format!(
        "haulsync={},warn",
        log_level.as_str().to_lowercase()
    ));

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_timer(ChronoLocalTimer)
        .with_filter(env_filter.clone());

    let stderr_layer = fmt::layer()
        .with_writer(io::stderr)
        .with_ansi(true)
        .with_timer(ChronoLocalTimer)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer);

    // A subscriber may already be installed (tests); that is not an error.
    let _ = tracing::subscriber::set_global_default(registry);

    Ok(guard)
}

fn default_log_path() -> Result<PathBuf, io::Error> {
    let mut path = home_dir()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Could not find home directory"))?;
    path.push(".haulsync.log");
    Ok(path)
}

struct ChronoLocalTimer;

impl FormatTime for ChronoLocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(w, "{}", now.format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}
