use axum::{
    http::StatusCode,
    response::Html,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::api::{self, AppState};
use crate::backup::{BackupCollaborator, DirectoryBackup};
use crate::config::Config;
use crate::database::Database;
use crate::error::MigratorError;
use crate::job::MigrationServices;
use crate::pause::{AppspaceLocks, PauseCoordinator};
use crate::sandbox::ProcessSandboxRunner;
use crate::scheduler::MigrationScheduler;

pub struct WebServer {
    host: String,
    port: u16,
}

impl WebServer {
    pub fn new(host: String, port: u16) -> Self {
        Self { host, port }
    }

    pub async fn start(&self, config: &Config) -> Result<(), MigratorError> {
        let addr: SocketAddr = format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| MigratorError::Error(format!("Invalid address: {}", e)))?;

        let db = Database::open(std::path::Path::new(&config.database.path))?;
        let locks: Arc<dyn PauseCoordinator> = Arc::new(AppspaceLocks::new());
        let services = Arc::new(MigrationServices {
            pause: Arc::clone(&locks),
            sandboxes: Arc::new(ProcessSandboxRunner::new(
                &config.sandbox.command,
                &config.sandbox.args,
            )),
            backup: config.backup.enabled.then(|| {
                Arc::new(DirectoryBackup::new(std::path::Path::new(
                    &config.backup.directory,
                ))) as Arc<dyn BackupCollaborator>
            }),
        });

        let scheduler = MigrationScheduler::new(db.clone(), services, config.scheduler.settings());
        scheduler.start()?;

        let app = Self::create_router(AppState::new(db, scheduler.clone(), locks));

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MigratorError::Error(format!("Failed to bind to {}: {}", addr, e)))?;

        println!("Appspace migrator listening on http://{}", addr);
        log::info!("Server ready to handle requests on {}", addr);

        // Start the server with graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                log::info!("Shutdown signal received, draining migration scheduler...");
                println!("\nShutdown signal received - waiting for running migrations...");

                scheduler.stop().await;

                log::info!("Server shutdown complete");
                println!("   Server stopped");
            })
            .await
            .map_err(|e| MigratorError::Error(format!("Server error: {}", e)))?;

        Ok(())
    }

    fn create_router(app_state: AppState) -> Router {
        Router::new()
            // Health check
            .route("/health", get(health_check))

            // Catalog
            .route("/api/apps/{app_id}/versions", post(api::versions::add_version))
            .route("/api/appspaces", post(api::appspaces::create_appspace))
            .route("/api/appspaces/{appspace_id}", delete(api::appspaces::delete_appspace))

            // Migrations
            .route(
                "/api/appspaces/{appspace_id}/migrations",
                post(api::migrations::submit_migration).get(api::migrations::list_migrations),
            )
            .route("/api/migrations/events", get(api::migrations::all_events))
            .route("/api/migrations/running", get(api::migrations::running_migrations))
            .route("/api/migrations/{job_id}", get(api::migrations::get_migration))
            .route("/api/migrations/{job_id}/events", get(api::migrations::job_events))

            .with_state(app_state)
    }
}

async fn health_check() -> (StatusCode, Html<&'static str>) {
    (
        StatusCode::OK,
        Html("<h1>Appspace Migrator</h1><p>Server is running</p>"),
    )
}

/// Waits for a shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received SIGINT (Ctrl+C)");
        },
        _ = terminate => {
            log::info!("Received SIGTERM");
        },
    }
}
