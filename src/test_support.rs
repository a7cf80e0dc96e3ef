//! Shared fixtures and fake collaborators for unit tests

use rusqlite::Connection;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use crate::api::AppState;
use crate::app_versions::AppVersion;
use crate::appspaces::Appspace;
use crate::backup::{BackupCollaborator, BackupHandle};
use crate::database::{Database, DbConnection};
use crate::error::MigratorError;
use crate::job::MigrationServices;
use crate::pause::{AppspaceLocks, PauseCoordinator, PauseGuard};
use crate::sandbox::{MigrationSandbox, SandboxMessage, SandboxReply, SandboxRunner};
use crate::scheduler::{MigrationScheduler, SchedulerSettings};

// ============================================================================
// Database
// ============================================================================

pub struct TestDb {
    _dir: TempDir,
    pub db: Database,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("migrator.db")).unwrap();
        Self { _dir: dir, db }
    }

    pub fn conn(&self) -> DbConnection {
        self.db.get_connection().unwrap()
    }
}

/// Versions of app 1: 1.0.0 at schema 1, 2.0.0 and 2.1.0 at schema 2
pub fn seed_versions(conn: &Connection) {
    for (version, schema) in [("1.0.0", 1), ("2.0.0", 2), ("2.1.0", 2)] {
        if AppVersion::get(conn, 1, version).unwrap().is_none() {
            AppVersion::create(conn, 1, version, schema, &format!("/apps/1/{}", version)).unwrap();
        }
    }
}

/// An appspace of app 1 on `app_version` whose data sits at `schema`
pub fn seed_appspace(conn: &Connection, app_version: &str, schema: i64) -> Appspace {
    seed_versions(conn);
    let appspace = Appspace::create(conn, 1, 1, app_version, "/data/appspace").unwrap();
    Appspace::set_schema(conn, appspace.appspace_id, schema).unwrap();
    appspace
}

pub fn services(
    pause: &Arc<CountingPause>,
    sandbox: &Arc<FakeSandboxRunner>,
    backup: Option<&Arc<FakeBackup>>,
) -> Arc<MigrationServices> {
    Arc::new(MigrationServices {
        pause: pause.clone(),
        sandboxes: sandbox.clone(),
        backup: backup.map(|b| b.clone() as Arc<dyn BackupCollaborator>),
    })
}

/// Handler state over a scheduler that is never started, so submitted jobs
/// stay pending. The locks are the ones handlers pause through.
pub fn test_state(test_db: &TestDb) -> (AppState, AppspaceLocks) {
    let locks = AppspaceLocks::new();
    let services = Arc::new(MigrationServices {
        pause: Arc::new(locks.clone()),
        sandboxes: Arc::new(FakeSandboxRunner::new(SandboxBehavior::Reply(
            SandboxReply::success(),
        ))),
        backup: None,
    });
    let scheduler = MigrationScheduler::new(
        test_db.db.clone(),
        services,
        SchedulerSettings {
            tick_interval: Duration::from_secs(60),
            migration_timeout: None,
            subscriber_buffer: 8,
        },
    );
    let state = AppState::new(test_db.db.clone(), scheduler, Arc::new(locks.clone()));
    (state, locks)
}

// ============================================================================
// Pause
// ============================================================================

#[derive(Default)]
pub struct CountingPause {
    pub acquired: AtomicUsize,
    pub released: Arc<AtomicUsize>,
}

impl PauseCoordinator for CountingPause {
    fn wait_temp_paused(&self, _appspace_id: i64, _reason: &str) -> PauseGuard {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let released = self.released.clone();
        PauseGuard::new(move || {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn lock_closed(&self, _appspace_id: i64) -> Option<PauseGuard> {
        Some(PauseGuard::new(|| {}))
    }
}

// ============================================================================
// Sandbox
// ============================================================================

#[derive(Clone)]
pub enum SandboxBehavior {
    Reply(SandboxReply),
    /// Exits without replying
    Crash,
    /// Never replies
    Hang,
    /// Panics when sent a message
    Panic,
    /// Replies with success once the gate receives a value or closes
    Gated(crossbeam_channel::Receiver<()>),
}

#[derive(Debug, Clone, Default)]
pub struct SandboxRecord {
    pub started_versions: Vec<String>,
    pub stopped_appspaces: Vec<i64>,
    pub messages: Vec<SandboxMessage>,
    pub graceful: usize,
    pub killed: usize,
    pub active: usize,
    pub max_active: usize,
}

pub struct FakeSandboxRunner {
    behavior: SandboxBehavior,
    record: Arc<Mutex<SandboxRecord>>,
}

impl FakeSandboxRunner {
    pub fn new(behavior: SandboxBehavior) -> Self {
        Self {
            behavior,
            record: Arc::new(Mutex::new(SandboxRecord::default())),
        }
    }

    pub fn snapshot(&self) -> SandboxRecord {
        self.record.lock().unwrap().clone()
    }
}

impl SandboxRunner for FakeSandboxRunner {
    fn stop_appspace(&self, appspace_id: i64) -> Result<(), MigratorError> {
        self.record.lock().unwrap().stopped_appspaces.push(appspace_id);
        Ok(())
    }

    fn start_for_migration(
        &self,
        version: &AppVersion,
        _appspace: &Appspace,
    ) -> Result<Box<dyn MigrationSandbox>, MigratorError> {
        let mut record = self.record.lock().unwrap();
        record.started_versions.push(version.version.clone());
        record.active += 1;
        record.max_active = record.max_active.max(record.active);

        Ok(Box::new(FakeSandbox {
            behavior: self.behavior.clone(),
            record: self.record.clone(),
            hung: None,
            done: false,
        }))
    }
}

struct FakeSandbox {
    behavior: SandboxBehavior,
    record: Arc<Mutex<SandboxRecord>>,
    hung: Option<crossbeam_channel::Sender<SandboxReply>>,
    done: bool,
}

impl FakeSandbox {
    fn shut_down(&mut self) {
        if !self.done {
            self.done = true;
            self.record.lock().unwrap().active -= 1;
        }
    }
}

impl MigrationSandbox for FakeSandbox {
    fn send_message(
        &mut self,
        message: &SandboxMessage,
    ) -> Result<crossbeam_channel::Receiver<SandboxReply>, MigratorError> {
        self.record.lock().unwrap().messages.push(message.clone());
        let (tx, rx) = crossbeam_channel::bounded(1);

        match &self.behavior {
            SandboxBehavior::Reply(reply) => {
                let _ = tx.send(reply.clone());
            }
            SandboxBehavior::Crash => drop(tx),
            SandboxBehavior::Hang => self.hung = Some(tx),
            SandboxBehavior::Panic => panic!("sandbox transport blew up"),
            SandboxBehavior::Gated(gate) => {
                let gate = gate.clone();
                std::thread::spawn(move || {
                    let _ = gate.recv();
                    let _ = tx.send(SandboxReply::success());
                });
            }
        }

        Ok(rx)
    }

    fn kill(&mut self) {
        self.hung = None;
        if !self.done {
            self.record.lock().unwrap().killed += 1;
        }
        self.shut_down();
    }

    fn graceful(&mut self) {
        if !self.done {
            self.record.lock().unwrap().graceful += 1;
        }
        self.shut_down();
    }
}

// ============================================================================
// Backup
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct BackupRecord {
    pub backups: Vec<i64>,
    pub restores: Vec<(i64, BackupHandle)>,
}

#[derive(Default)]
pub struct FakeBackup {
    pub fail_backup: bool,
    pub fail_restore: bool,
    pub record: Mutex<BackupRecord>,
}

impl FakeBackup {
    pub fn snapshot(&self) -> BackupRecord {
        self.record.lock().unwrap().clone()
    }
}

impl BackupCollaborator for FakeBackup {
    fn backup_no_pause(&self, appspace: &Appspace) -> Result<BackupHandle, MigratorError> {
        if self.fail_backup {
            return Err(MigratorError::Error("disk full".into()));
        }
        let mut record = self.record.lock().unwrap();
        record.backups.push(appspace.appspace_id);
        Ok(BackupHandle(format!("backup-{}", record.backups.len())))
    }

    fn restore_backup(
        &self,
        appspace: &Appspace,
        backup: &BackupHandle,
    ) -> Result<(), MigratorError> {
        self.record
            .lock()
            .unwrap()
            .restores
            .push((appspace.appspace_id, backup.clone()));
        if self.fail_restore {
            return Err(MigratorError::Error("restore exploded".into()));
        }
        Ok(())
    }
}
