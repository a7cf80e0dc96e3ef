use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// Appspace-scoped pause and lock primitive shared by migrations, backups
/// and deletion
pub trait PauseCoordinator: Send + Sync {
    /// Block until the appspace is temporarily paused on behalf of the caller.
    /// The pause lasts until the returned guard is dropped.
    fn wait_temp_paused(&self, appspace_id: i64, reason: &str) -> PauseGuard;

    /// Exclusive hold: nothing else may touch the appspace while the guard
    /// lives. Returns None if the appspace is paused or already locked.
    fn lock_closed(&self, appspace_id: i64) -> Option<PauseGuard>;
}

/// Releases its hold exactly once, when dropped
pub struct PauseGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl PauseGuard {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for PauseGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

#[derive(Default)]
struct HoldState {
    temp_pauses: usize,
    closed: bool,
}

#[derive(Default)]
struct LocksInner {
    holds: Mutex<HashMap<i64, HoldState>>,
    changed: Condvar,
}

/// In-process `PauseCoordinator`
///
/// Temporary pauses may stack (a backup and a migration may both hold one).
/// A closed lock excludes everything: temporary pauses wait for it to be
/// released, and it cannot be taken while any pause is held.
#[derive(Clone, Default)]
pub struct AppspaceLocks {
    inner: Arc<LocksInner>,
}

impl AppspaceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn is_paused(&self, appspace_id: i64) -> bool {
        let holds = self.inner.holds.lock().unwrap();
        holds
            .get(&appspace_id)
            .is_some_and(|h| h.temp_pauses > 0 || h.closed)
    }

    fn release(inner: &LocksInner, appspace_id: i64, closed: bool) {
        let mut holds = inner.holds.lock().unwrap();
        if let Some(hold) = holds.get_mut(&appspace_id) {
            if closed {
                hold.closed = false;
            } else {
                hold.temp_pauses = hold.temp_pauses.saturating_sub(1);
            }
            if hold.temp_pauses == 0 && !hold.closed {
                holds.remove(&appspace_id);
            }
        }
        inner.changed.notify_all();
    }
}

impl PauseCoordinator for AppspaceLocks {
    fn wait_temp_paused(&self, appspace_id: i64, reason: &str) -> PauseGuard {
        let mut holds = self.inner.holds.lock().unwrap();
        while holds.get(&appspace_id).is_some_and(|h| h.closed) {
            debug!(
                "Appspace {} is locked closed, waiting to pause ({})",
                appspace_id, reason
            );
            holds = self.inner.changed.wait(holds).unwrap();
        }
        holds.entry(appspace_id).or_default().temp_pauses += 1;
        drop(holds);

        info!("Appspace {} paused: {}", appspace_id, reason);

        let inner = Arc::clone(&self.inner);
        PauseGuard::new(move || {
            Self::release(&inner, appspace_id, false);
            debug!("Appspace {} pause released", appspace_id);
        })
    }

    fn lock_closed(&self, appspace_id: i64) -> Option<PauseGuard> {
        let mut holds = self.inner.holds.lock().unwrap();
        if holds.contains_key(&appspace_id) {
            return None;
        }
        holds.entry(appspace_id).or_default().closed = true;
        drop(holds);

        let inner = Arc::clone(&self.inner);
        Some(PauseGuard::new(move || {
            Self::release(&inner, appspace_id, true);
        }))
    }
}
