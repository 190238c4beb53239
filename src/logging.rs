use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "PERMSYNC_LOG";

fn filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "permsync=debug" } else { "permsync=warn" })
    })
}

#[cfg(feature = "debug-log")]
mod inner {
    use super::filter;
    use std::fs;
    use std::path::PathBuf;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::{fmt, prelude::*};

    static LOG_PATH: std::sync::OnceLock<PathBuf> = std::sync::OnceLock::new();

    pub type LogGuard = Option<WorkerGuard>;

    pub fn init(verbose: bool) -> LogGuard {
        let log_path = PathBuf::from("permsync-debug.log");

        let file = match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Failed to open log file: {e}");
                super::init_stderr(verbose);
                return None;
            }
        };

        let (non_blocking, guard) = tracing_appender::non_blocking(file);

        let subscriber = tracing_subscriber::registry()
            .with(filter(verbose))
            .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
            .with(
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            );

        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("Failed to set tracing subscriber");
            return None;
        }

        LOG_PATH.set(log_path).ok();

        tracing::info!("Debug logging initialized");

        Some(guard)
    }

    pub fn log_file_path() -> Option<&'static PathBuf> {
        LOG_PATH.get()
    }
}

#[cfg(not(feature = "debug-log"))]
mod inner {
    use std::path::PathBuf;

    pub type LogGuard = ();

    #[inline(always)]
    pub fn init(verbose: bool) -> LogGuard {
        super::init_stderr(verbose);
    }

    #[inline(always)]
    pub fn log_file_path() -> Option<&'static PathBuf> {
        None
    }
}

fn init_stderr(verbose: bool) {
    let result = tracing_subscriber::fmt()
        .with_env_filter(filter(verbose))
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();

    if result.is_err() {
        eprintln!("Failed to set tracing subscriber");
    }
}

pub use inner::*;
