use serde::{Deserialize, Serialize};

/// Lifecycle of a claimed migration job. Transitions are linear:
/// Started → Running → Finished, with Running skipped when no schema change
/// is needed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Started,  // Claimed by the scheduler, not yet migrating
    Running,  // Sandbox migration in progress
    Finished, // Terminal; success unless an error is attached
}

impl JobStatus {
    pub fn full_name(&self) -> &'static str {
        match self {
            JobStatus::Started => "Started",
            JobStatus::Running => "Running",
            JobStatus::Finished => "Finished",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished)
    }

    /// Whether `next` may follow `self`. Re-publishing the same status is
    /// allowed; going backwards is not.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next >= *self
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_name())
    }
}
