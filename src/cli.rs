use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use crate::app_versions::AppVersion;
use crate::appspaces::Appspace;
use crate::config::Config;
use crate::database::Database;
use crate::error::MigratorError;
use crate::migration_jobs::MigrationJob;

#[derive(Parser)]
#[command(
    name = "appspace-migrator",
    version,
    about = "Appspace Migrator: schedules and runs appspace schema migrations"
)]
pub struct Cli {
    /// Config file to use instead of config.toml in the data directory
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the server (default if no command specified)
    Serve,

    /// Register an installed app version and the schema it expects
    AddVersion {
        #[arg(long)]
        app_id: i64,
        #[arg(long)]
        version: String,
        #[arg(long)]
        schema: i64,
        /// Where the version's code lives
        #[arg(long)]
        location: String,
    },

    /// Create an appspace and queue the migration that initializes it
    CreateAppspace {
        #[arg(long)]
        owner_id: i64,
        #[arg(long)]
        app_id: i64,
        #[arg(long)]
        version: String,
        /// Data directory of the new appspace
        #[arg(long)]
        data: String,
    },

    /// Queue a migration of an appspace to an app version
    Migrate {
        #[arg(long)]
        appspace_id: i64,
        #[arg(long)]
        version: String,
        #[arg(long)]
        owner_id: i64,
        /// Run ahead of non-priority jobs
        #[arg(long, default_value_t = false)]
        priority: bool,
    },

    /// List an appspace's migration jobs, newest first
    Jobs {
        #[arg(long)]
        appspace_id: i64,
    },
}

impl Cli {
    pub fn run(self, config: &Config) -> Result<(), MigratorError> {
        // Default to Serve if no command specified
        match self.command.unwrap_or(Command::Serve) {
            Command::Serve => Self::start_server(config),
            Command::AddVersion {
                app_id,
                version,
                schema,
                location,
            } => {
                let conn = Self::open_database(config)?.get_connection()?;
                let added = AppVersion::create(&conn, app_id, &version, schema, &location)?;
                println!(
                    "Added version {} of app {} (schema {})",
                    added.version, added.app_id, added.schema
                );
                Ok(())
            }
            Command::CreateAppspace {
                owner_id,
                app_id,
                version,
                data,
            } => {
                let conn = Self::open_database(config)?.get_connection()?;
                let appspace = Appspace::create_for_version(&conn, owner_id, app_id, &version, &data)?;
                let job = MigrationJob::create(&conn, owner_id, appspace.appspace_id, &version, true)?;
                println!(
                    "Created appspace {}; initial migration queued as job {}",
                    appspace.appspace_id, job.job_id
                );
                Ok(())
            }
            Command::Migrate {
                appspace_id,
                version,
                owner_id,
                priority,
            } => {
                let conn = Self::open_database(config)?.get_connection()?;
                let appspace = Appspace::get_by_id(&conn, appspace_id)?
                    .ok_or_else(|| MigratorError::NotFound(format!("appspace {}", appspace_id)))?;
                if AppVersion::get(&conn, appspace.app_id, &version)?.is_none() {
                    return Err(MigratorError::NotFound(format!(
                        "app version {} of app {}",
                        version, appspace.app_id
                    )));
                }

                let job = MigrationJob::create(&conn, owner_id, appspace_id, &version, priority)?;
                println!(
                    "Queued job {} to migrate appspace {} to version {}",
                    job.job_id, appspace_id, version
                );
                Ok(())
            }
            Command::Jobs { appspace_id } => {
                let conn = Self::open_database(config)?.get_connection()?;
                let jobs = MigrationJob::get_for_appspace(&conn, appspace_id)?;
                if jobs.is_empty() {
                    println!("No migration jobs for appspace {}", appspace_id);
                }
                for job in jobs {
                    println!("{}", Self::format_job(&job));
                }
                Ok(())
            }
        }
    }

    fn open_database(config: &Config) -> Result<Database, MigratorError> {
        Database::open(std::path::Path::new(&config.database.path))
    }

    fn format_job(job: &MigrationJob) -> String {
        let state = match (job.finished, &job.error) {
            _ if job.is_pending() => "pending".to_string(),
            (None, _) => "running".to_string(),
            (Some(_), None) => "ok".to_string(),
            (Some(_), Some(error)) => format!("failed: {}", error),
        };
        format!(
            "{:>6}  {:<12} {:<3} created {}  {}",
            job.job_id,
            job.to_version,
            if job.priority { "(p)" } else { "" },
            Self::format_time(job.created),
            state
        )
    }

    fn format_time(timestamp: i64) -> String {
        chrono::DateTime::from_timestamp(timestamp, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| timestamp.to_string())
    }

    fn start_server(config: &Config) -> Result<(), MigratorError> {
        let host = config.server.host.clone();
        let port = config.server.port;

        info!("Starting server on {}:{}", host, port);

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| MigratorError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async {
            let web_server = crate::server::WebServer::new(host, port);
            web_server.start(config).await
        })
    }
}
