use std::process::ExitCode;

use clap::Parser;

use permsync::cli::{self, Cli};
use permsync::config::AppConfig;
use permsync::logging;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let _log_guard = logging::init(cli.verbose);
    if let Some(path) = logging::log_file_path() {
        tracing::debug!("Writing debug log to {}", path.display());
    }

    let config = AppConfig::load();

    match cli::run(cli, config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("✗ {e}");
            ExitCode::FAILURE
        }
    }
}
