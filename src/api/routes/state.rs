use std::sync::Arc;

use crate::database::Database;
use crate::pause::PauseCoordinator;
use crate::scheduler::MigrationScheduler;

/// Shared application state passed to all Axum handlers via `.with_state()`.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub scheduler: MigrationScheduler,
    /// The same coordinator the scheduler's migrations pause through
    pub pause: Arc<dyn PauseCoordinator>,
}

impl AppState {
    pub fn new(
        db: Database,
        scheduler: MigrationScheduler,
        pause: Arc<dyn PauseCoordinator>,
    ) -> Self {
        Self {
            db,
            scheduler,
            pause,
        }
    }
}
