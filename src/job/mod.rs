mod executor;
mod job_status;
mod progress;

pub use executor::{MigrationExecutor, MigrationServices};
pub use job_status::JobStatus;
pub use progress::{JobProgress, StatusEvent, StatusSubscriber};
