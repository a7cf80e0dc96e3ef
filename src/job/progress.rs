use log::warn;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::job_status::JobStatus;
use crate::migration_jobs::MigrationJob;

// ============================================================================
// Status protocol
// ============================================================================

/// Immutable snapshot of a running job, published at every status change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: i64,
    pub appspace_id: i64,
    pub status: JobStatus,
    pub started: Option<i64>,
    pub finished: Option<i64>,
    pub error: Option<String>,
    pub cur_schema: i64,
}

/// Where a job's status events go
pub enum StatusSubscriber {
    /// Never drops an event. The scheduler's fan-in uses this.
    Lossless(mpsc::UnboundedSender<StatusEvent>),
    /// Bounded; when full the event is dropped for this observer only, and
    /// the observer is expected to re-fetch the current snapshot.
    Observer(mpsc::Sender<StatusEvent>),
}

enum Delivery {
    Delivered,
    Dropped,
    Closed,
}

impl StatusSubscriber {
    fn deliver(&self, event: &StatusEvent) -> Delivery {
        match self {
            StatusSubscriber::Lossless(tx) => match tx.send(event.clone()) {
                Ok(()) => Delivery::Delivered,
                Err(_) => Delivery::Closed,
            },
            StatusSubscriber::Observer(tx) => match tx.try_send(event.clone()) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(_)) => Delivery::Dropped,
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            },
        }
    }
}

// ============================================================================
// JobProgress
// ============================================================================

struct JobProgressState {
    // Identity (immutable after construction)
    job_id: i64,
    appspace_id: i64,

    status: JobStatus,
    started: Option<i64>,
    finished: Option<i64>,
    error: Option<String>,
    cur_schema: i64,

    subscribers: Vec<StatusSubscriber>,
}

impl JobProgressState {
    fn snapshot(&self) -> StatusEvent {
        StatusEvent {
            job_id: self.job_id,
            appspace_id: self.appspace_id,
            status: self.status,
            started: self.started,
            finished: self.finished,
            error: self.error.clone(),
            cur_schema: self.cur_schema,
        }
    }

    /// Push the current snapshot to every subscriber without blocking,
    /// pruning subscribers that have gone away
    fn publish(&mut self) {
        let event = self.snapshot();
        let job_id = self.job_id;
        self.subscribers.retain(|subscriber| match subscriber.deliver(&event) {
            Delivery::Delivered => true,
            Delivery::Dropped => {
                warn!(
                    "Status subscriber for job {} is full, dropped {} event",
                    job_id, event.status
                );
                true
            }
            Delivery::Closed => false,
        });
    }
}

/// Shared status of one running job
///
/// Only the thread executing the job changes status; the scheduler and any
/// number of observers subscribe to the changes.
pub struct JobProgress {
    state: Mutex<JobProgressState>,
}

impl JobProgress {
    /// New progress for a just-claimed job. Nothing is published until the
    /// first `set_status`.
    pub fn new(job: &MigrationJob) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(JobProgressState {
                job_id: job.job_id,
                appspace_id: job.appspace_id,
                status: JobStatus::Started,
                started: job.started,
                finished: None,
                error: None,
                cur_schema: 0,
                subscribers: Vec::new(),
            }),
        })
    }

    pub fn subscribe(&self, subscriber: StatusSubscriber) {
        self.state.lock().unwrap().subscribers.push(subscriber);
    }

    /// Subscribe an observer with a bounded buffer. Returns the current
    /// snapshot along with the receiver; earlier events are not replayed.
    pub fn subscribe_observer(&self, buffer: usize) -> (StatusEvent, mpsc::Receiver<StatusEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut state = self.state.lock().unwrap();
        if !state.status.is_terminal() {
            state.subscribers.push(StatusSubscriber::Observer(tx));
        }
        (state.snapshot(), rx)
    }

    pub fn set_status(&self, status: JobStatus) {
        let mut state = self.state.lock().unwrap();
        if !state.status.can_transition_to(status) {
            warn!(
                "Ignoring status change {} -> {} for job {}",
                state.status, status, state.job_id
            );
            return;
        }

        state.status = status;
        if status == JobStatus::Started && state.started.is_none() {
            state.started = Some(chrono::Utc::now().timestamp());
        }
        state.publish();
    }

    pub fn set_cur_schema(&self, schema: i64) {
        self.state.lock().unwrap().cur_schema = schema;
    }

    /// Move to the terminal status. No error means success.
    pub fn finish(&self, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        if state.status.is_terminal() {
            warn!("Job {} finished twice; ignoring", state.job_id);
            return;
        }

        state.status = JobStatus::Finished;
        state.finished = Some(chrono::Utc::now().timestamp());
        state.error = error;
        state.publish();
        // Terminal: nobody will hear from this job again
        state.subscribers.clear();
    }

    pub fn snapshot(&self) -> StatusEvent {
        self.state.lock().unwrap().snapshot()
    }
}
