use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::appspaces::Appspace;
use crate::error::MigratorError;

/// Names one snapshot of an appspace's data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHandle(pub String);

pub trait BackupCollaborator: Send + Sync {
    /// Snapshot the appspace's data. The caller must already hold a pause on
    /// the appspace.
    fn backup_no_pause(&self, appspace: &Appspace) -> Result<BackupHandle, MigratorError>;

    /// Replace the appspace's data with the snapshot
    fn restore_backup(&self, appspace: &Appspace, backup: &BackupHandle)
        -> Result<(), MigratorError>;
}

/// Snapshots are plain directory copies under
/// `<backup_root>/appspace-<id>/<timestamp>`
pub struct DirectoryBackup {
    backup_root: PathBuf,
}

impl DirectoryBackup {
    pub fn new(backup_root: &Path) -> Self {
        Self {
            backup_root: backup_root.to_path_buf(),
        }
    }

    fn appspace_dir(&self, appspace_id: i64) -> PathBuf {
        self.backup_root.join(format!("appspace-{}", appspace_id))
    }

    fn copy_dir_all(src: &Path, dst: &Path) -> Result<(), MigratorError> {
        fs::create_dir_all(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let target = dst.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                Self::copy_dir_all(&entry.path(), &target)?;
            } else {
                fs::copy(entry.path(), &target)?;
            }
        }
        Ok(())
    }
}

impl BackupCollaborator for DirectoryBackup {
    fn backup_no_pause(&self, appspace: &Appspace) -> Result<BackupHandle, MigratorError> {
        let source = Path::new(&appspace.data_location);
        if !source.is_dir() {
            return Err(MigratorError::NotFound(format!(
                "data directory {} for appspace {}",
                source.display(),
                appspace.appspace_id
            )));
        }

        let name = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let dest = self.appspace_dir(appspace.appspace_id).join(&name);
        Self::copy_dir_all(source, &dest)?;

        info!(
            "Backed up appspace {} to {}",
            appspace.appspace_id,
            dest.display()
        );
        Ok(BackupHandle(name))
    }

    fn restore_backup(
        &self,
        appspace: &Appspace,
        backup: &BackupHandle,
    ) -> Result<(), MigratorError> {
        if backup.0.is_empty() || backup.0.contains(['/', '\\']) || backup.0.starts_with('.') {
            return Err(MigratorError::Error(format!("Invalid backup name '{}'", backup.0)));
        }

        let source = self.appspace_dir(appspace.appspace_id).join(&backup.0);
        if !source.is_dir() {
            return Err(MigratorError::NotFound(format!(
                "backup {} for appspace {}",
                backup.0, appspace.appspace_id
            )));
        }

        let target = Path::new(&appspace.data_location);
        if target.exists() {
            fs::remove_dir_all(target)?;
        }
        Self::copy_dir_all(&source, target)?;

        info!(
            "Restored appspace {} from backup {}",
            appspace.appspace_id, backup.0
        );
        Ok(())
    }
}
