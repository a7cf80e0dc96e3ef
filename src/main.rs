mod api;
mod app_versions;
mod appspaces;
mod backup;
mod cli;
mod config;
mod database;
mod error;
mod job;
mod migration_jobs;
mod pause;
mod sandbox;
mod scheduler;
mod server;
#[cfg(test)]
mod test_support;

use clap::Parser;
use cli::Cli;
use config::Config;
use directories::ProjectDirs;
use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, FlexiLoggerError, Logger, LoggerHandle, Naming,
};
use log::{debug, error};
use std::path::Path;

fn main() {
    let cli = Cli::parse();

    let Some(project_dirs) = ProjectDirs::from("", "", "appspace-migrator") else {
        eprintln!("Could not determine the application data directory");
        std::process::exit(1);
    };
    let data_dir = project_dirs.data_local_dir();

    let config = Config::load_config(data_dir, cli.config.as_deref());

    // Keep the handle alive for the life of the process
    let _logger = match setup_logging(&config, data_dir) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize logging: {}", e);
            std::process::exit(1);
        }
    };
    debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

    if let Err(err) = cli.run(&config) {
        error!("{:?}", err);
        eprintln!("{}", err);
        std::process::exit(1);
    }
}

/// Log to rotating files in the data directory, duplicating warnings and
/// errors to stderr. `RUST_LOG` overrides the configured level.
fn setup_logging(config: &Config, data_dir: &Path) -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_env_or_str(format!("appspace_migrator={}", config.logging.migrator))?
        .log_to_file(
            FileSpec::default()
                .directory(data_dir.join("logs"))
                .basename("appspace-migrator"),
        )
        .rotate(
            Criterion::Size(10 * 1024 * 1024),
            Naming::Timestamps,
            Cleanup::KeepLogFiles(7),
        )
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_files(flexi_logger::detailed_format)
        .start()
}
