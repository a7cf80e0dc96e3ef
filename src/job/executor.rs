use crossbeam_channel::RecvTimeoutError;
use log::{error, info, warn};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use super::job_status::JobStatus;
use super::progress::JobProgress;
use crate::app_versions::AppVersion;
use crate::appspaces::Appspace;
use crate::backup::{BackupCollaborator, BackupHandle};
use crate::database::Database;
use crate::error::MigratorError;
use crate::migration_jobs::MigrationJob;
use crate::pause::PauseCoordinator;
use crate::sandbox::{MigrationSandbox, SandboxMessage, SandboxRunner};

/// Collaborators a migration needs besides the database
pub struct MigrationServices {
    pub pause: Arc<dyn PauseCoordinator>,
    pub sandboxes: Arc<dyn SandboxRunner>,
    pub backup: Option<Arc<dyn BackupCollaborator>>,
}

/// Schema change a job has to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationPlan {
    pub from_schema: i64,
    pub to_schema: i64,
}

impl MigrationPlan {
    pub fn is_noop(&self) -> bool {
        self.from_schema == self.to_schema
    }

    /// Down migrations run the installed version's code, since only that
    /// code knows how to undo its own schema
    pub fn migrate_down(&self) -> bool {
        self.to_schema < self.from_schema
    }
}

/// Runs one claimed migration job to completion on the calling thread
pub struct MigrationExecutor {
    db: Database,
    services: Arc<MigrationServices>,
    job: MigrationJob,
    progress: Arc<JobProgress>,
    migration_timeout: Option<Duration>,
}

impl MigrationExecutor {
    pub fn new(
        db: Database,
        services: Arc<MigrationServices>,
        job: MigrationJob,
        progress: Arc<JobProgress>,
        migration_timeout: Option<Duration>,
    ) -> Self {
        Self {
            db,
            services,
            job,
            progress,
            migration_timeout,
        }
    }

    /// Execute the job. Always ends with the job in `Finished`, even when a
    /// collaborator panics.
    pub fn run(self) {
        let job_id = self.job.job_id;
        let appspace_id = self.job.appspace_id;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.migrate()))
            .unwrap_or_else(|payload| Err(panicked(payload.as_ref())));

        let error = match outcome {
            Ok(()) => {
                info!(
                    "Migration job {} for appspace {} completed",
                    job_id, appspace_id
                );
                None
            }
            Err(e) => {
                error!(
                    "Migration job {} for appspace {} failed: {}",
                    job_id, appspace_id, e
                );
                Some(e.to_string())
            }
        };

        self.progress.finish(error);
    }

    fn migrate(&self) -> Result<(), MigratorError> {
        let appspace_id = self.job.appspace_id;

        // Held until this function returns, whatever the path
        let _pause = self
            .services
            .pause
            .wait_temp_paused(appspace_id, "migration");

        self.services.sandboxes.stop_appspace(appspace_id)?;

        let (appspace, plan, to_version, sandbox_version) = {
            let conn = self.db.get_connection()?;

            let appspace = Appspace::get_by_id(&conn, appspace_id)?.ok_or_else(|| {
                MigratorError::NotFound(format!(
                    "appspace {} no longer exists (deleted while job {} was queued?)",
                    appspace_id, self.job.job_id
                ))
            })?;

            let cur_schema = Appspace::get_schema(&conn, appspace_id)?;
            self.progress.set_cur_schema(cur_schema);

            let to_version = AppVersion::get(&conn, appspace.app_id, &self.job.to_version)?
                .ok_or_else(|| {
                    MigratorError::NotFound(format!(
                        "app version {} of app {} targeted by job {}",
                        self.job.to_version, appspace.app_id, self.job.job_id
                    ))
                })?;

            let plan = MigrationPlan {
                from_schema: cur_schema,
                to_schema: to_version.schema,
            };

            if plan.is_noop() {
                Appspace::set_app_version(&conn, appspace_id, &to_version.version)?;
                info!(
                    "Appspace {} already at schema {}; switched to app version {}",
                    appspace_id, cur_schema, to_version.version
                );
                return Ok(());
            }

            let sandbox_version = if plan.migrate_down() {
                AppVersion::get(&conn, appspace.app_id, &appspace.app_version)?.ok_or_else(
                    || {
                        MigratorError::NotFound(format!(
                            "installed app version {} of app {} needed to migrate down",
                            appspace.app_version, appspace.app_id
                        ))
                    },
                )?
            } else {
                to_version.clone()
            };

            (appspace, plan, to_version, sandbox_version)
        };

        info!(
            "Migrating appspace {} {} from schema {} to {} with app version {}",
            appspace_id,
            if plan.migrate_down() { "down" } else { "up" },
            plan.from_schema,
            plan.to_schema,
            sandbox_version.version
        );

        let backup = match &self.services.backup {
            Some(collaborator) => Some(collaborator.backup_no_pause(&appspace).map_err(|e| {
                MigratorError::Error(format!("backup before migration failed: {}", e))
            })?),
            None => None,
        };

        self.progress.set_status(JobStatus::Running);

        let sandbox_result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_sandbox(&sandbox_version, &appspace, plan)
        }))
        .unwrap_or_else(|payload| Err(panicked(payload.as_ref())));
        if let Err(e) = sandbox_result {
            return Err(self.restore_after_failure(&appspace, backup.as_ref(), e));
        }

        let conn = self.db.get_connection()?;
        Appspace::commit_migration(&conn, appspace_id, plan.to_schema, &to_version.version)?;
        self.progress.set_cur_schema(plan.to_schema);

        Ok(())
    }

    fn run_sandbox(
        &self,
        version: &AppVersion,
        appspace: &Appspace,
        plan: MigrationPlan,
    ) -> Result<(), MigratorError> {
        let mut sandbox = self
            .services
            .sandboxes
            .start_for_migration(version, appspace)?;
        let result = self.exchange(sandbox.as_mut(), plan);
        sandbox.graceful();
        result
    }

    /// Send the single migrate request and wait for its single reply
    fn exchange(
        &self,
        sandbox: &mut dyn MigrationSandbox,
        plan: MigrationPlan,
    ) -> Result<(), MigratorError> {
        let message = SandboxMessage::migrate(plan.from_schema, plan.to_schema)?;
        let replies = sandbox.send_message(&message)?;

        let reply = match self.migration_timeout {
            Some(timeout) => match replies.recv_timeout(timeout) {
                Ok(reply) => reply,
                Err(RecvTimeoutError::Timeout) => {
                    sandbox.kill();
                    return Err(MigratorError::Sandbox(format!(
                        "no reply from migration sandbox within {:?}",
                        timeout
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => return Err(Self::sandbox_gone()),
            },
            None => replies.recv().map_err(|_| Self::sandbox_gone())?,
        };

        if reply.ok {
            Ok(())
        } else {
            Err(MigratorError::Migration(reply.error.unwrap_or_else(|| {
                "migration failed without an error message".to_string()
            })))
        }
    }

    fn sandbox_gone() -> MigratorError {
        MigratorError::Sandbox("migration sandbox exited without replying".into())
    }

    /// Put the pre-migration snapshot back, folding the outcome into the
    /// job's error text
    fn restore_after_failure(
        &self,
        appspace: &Appspace,
        backup: Option<&BackupHandle>,
        err: MigratorError,
    ) -> MigratorError {
        let (Some(collaborator), Some(handle)) = (&self.services.backup, backup) else {
            warn!(
                "No backup configured; appspace {} left as the failed migration left it",
                appspace.appspace_id
            );
            return err;
        };

        match collaborator.restore_backup(appspace, handle) {
            Ok(()) => MigratorError::Migration(format!("{}; appspace restored", err)),
            Err(restore_err) => {
                error!(
                    "Failed to restore appspace {} from backup {}: {}",
                    appspace.appspace_id, handle.0, restore_err
                );
                MigratorError::Migration(format!(
                    "{}; failed to restore appspace: {}",
                    err, restore_err
                ))
            }
        }
    }
}

fn panicked(payload: &(dyn Any + Send)) -> MigratorError {
    let message = if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    };
    MigratorError::Error(format!("migration job panicked: {}", message))
}
