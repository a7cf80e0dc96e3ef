use log::{debug, error, info, warn, Level};
use logging_timer::timer;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::appspaces::Appspace;
use crate::database::Database;
use crate::error::MigratorError;
use crate::job::{
    JobProgress, JobStatus, MigrationExecutor, MigrationServices, StatusEvent, StatusSubscriber,
};
use crate::migration_jobs::MigrationJob;

/// Jobs allowed to execute at the same time
const MAX_RUNNING_JOBS: usize = 1;

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// `None` waits for the sandbox indefinitely
    pub migration_timeout: Option<Duration>,
    /// Buffer of each per-job observer channel
    pub subscriber_buffer: usize,
}

/// A claimed job that has not yet been seen to finish
struct RunningJob {
    appspace_id: i64,
    progress: Arc<JobProgress>,
}

struct SchedulerState {
    running: HashMap<i64, RunningJob>,
    fan_in: Option<mpsc::UnboundedSender<StatusEvent>>,
    drained: Option<oneshot::Sender<()>>,
    ticker: Option<(CancellationToken, JoinHandle<()>)>,
    consumer: Option<JoinHandle<()>>,
}

struct SchedulerInner {
    db: Database,
    services: Arc<MigrationServices>,
    settings: SchedulerSettings,
    state: Mutex<SchedulerState>,
    stopped: AtomicBool,
    wake: Notify,
    broadcaster: broadcast::Sender<StatusEvent>,
}

/// Claims pending migration jobs one at a time and runs them on blocking
/// workers. Cheap to clone; all clones drive the same scheduler.
#[derive(Clone)]
pub struct MigrationScheduler {
    inner: Arc<SchedulerInner>,
}

impl MigrationScheduler {
    pub fn new(
        db: Database,
        services: Arc<MigrationServices>,
        settings: SchedulerSettings,
    ) -> Self {
        let (broadcaster, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(SchedulerInner {
                db,
                services,
                settings,
                state: Mutex::new(SchedulerState {
                    running: HashMap::new(),
                    fan_in: None,
                    drained: None,
                    ticker: None,
                    consumer: None,
                }),
                stopped: AtomicBool::new(true),
                wake: Notify::new(),
                broadcaster,
            }),
        }
    }

    /// Start claiming jobs. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), MigratorError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.ticker.is_some() {
            return Err(MigratorError::Error(
                "Migration scheduler is already started".into(),
            ));
        }

        self.inner.recover()?;

        let (fan_in, fan_in_rx) = mpsc::unbounded_channel();
        state.running.clear();
        state.fan_in = Some(fan_in);
        state.consumer = Some(tokio::spawn(SchedulerInner::consume(
            Arc::clone(&self.inner),
            fan_in_rx,
        )));

        self.inner.stopped.store(false, Ordering::SeqCst);

        let token = CancellationToken::new();
        let ticker = tokio::spawn(SchedulerInner::tick_loop(
            Arc::clone(&self.inner),
            token.clone(),
        ));
        state.ticker = Some((token, ticker));

        info!(
            "Migration scheduler started (checking every {:?})",
            self.inner.settings.tick_interval
        );
        Ok(())
    }

    /// Stop claiming, wait for running jobs to finish, then shut down the
    /// status loop. Returns immediately when nothing is running.
    pub async fn stop(&self) {
        let (ticker, drained, consumer) = {
            let mut state = self.inner.state.lock().unwrap();
            self.inner.stopped.store(true, Ordering::SeqCst);

            let drained = if state.running.is_empty() {
                None
            } else {
                let (tx, rx) = oneshot::channel();
                state.drained = Some(tx);
                Some(rx)
            };
            (state.ticker.take(), drained, state.consumer.take())
        };

        if let Some((token, handle)) = ticker {
            token.cancel();
            let _ = handle.await;
        }

        if let Some(drained) = drained {
            info!("Waiting for running migration jobs to finish...");
            let _ = drained.await;
        }

        // The consumer exits once the last sender is gone
        self.inner.state.lock().unwrap().fan_in = None;
        if let Some(consumer) = consumer {
            let _ = consumer.await;
        }

        info!("Migration scheduler stopped");
    }

    /// Ask for an immediate claim instead of waiting for the next tick
    pub fn wake_up(&self) {
        let state = self.inner.state.lock().unwrap();
        if self.inner.stopped.load(Ordering::SeqCst) || !state.running.is_empty() {
            return;
        }
        self.inner.wake.notify_one();
    }

    /// Queue a migration. Priority jobs are claimed right away when the
    /// scheduler is idle.
    pub fn submit(
        &self,
        owner_id: i64,
        appspace_id: i64,
        to_version: &str,
        priority: bool,
    ) -> Result<MigrationJob, MigratorError> {
        let conn = self.inner.db.get_connection()?;
        let job = MigrationJob::create(&conn, owner_id, appspace_id, to_version, priority)?;
        info!(
            "Queued migration job {} for appspace {} to version {}{}",
            job.job_id,
            appspace_id,
            to_version,
            if priority { " (priority)" } else { "" }
        );

        if priority {
            self.wake_up();
        }
        Ok(job)
    }

    /// Every status event of every job. Slow receivers skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.inner.broadcaster.subscribe()
    }

    /// Current snapshot and live events of one running job
    pub fn subscribe_job(&self, job_id: i64) -> Option<(StatusEvent, mpsc::Receiver<StatusEvent>)> {
        let state = self.inner.state.lock().unwrap();
        state.running.get(&job_id).map(|running| {
            running
                .progress
                .subscribe_observer(self.inner.settings.subscriber_buffer)
        })
    }

    pub fn job_status(&self, job_id: i64) -> Option<StatusEvent> {
        let state = self.inner.state.lock().unwrap();
        state
            .running
            .get(&job_id)
            .map(|running| running.progress.snapshot())
    }

    pub fn running_jobs(&self) -> Vec<StatusEvent> {
        let state = self.inner.state.lock().unwrap();
        let mut jobs: Vec<StatusEvent> = state
            .running
            .values()
            .map(|running| running.progress.snapshot())
            .collect();
        jobs.sort_by_key(|event| event.job_id);
        jobs
    }
}

impl SchedulerInner {
    /// Close out jobs a previous process left half done and report appspaces
    /// whose schema and version disagree
    fn recover(&self) -> Result<(), MigratorError> {
        let conn = self.db.get_connection()?;

        let interrupted = MigrationJob::finish_interrupted(&conn)?;
        if interrupted > 0 {
            warn!(
                "Marked {} interrupted migration job(s) as finished",
                interrupted
            );
        }

        for mismatch in Appspace::find_schema_mismatches(&conn)? {
            warn!(
                "Appspace {} is at schema {} but app version {} expects schema {}",
                mismatch.appspace_id,
                mismatch.appspace_schema,
                mismatch.app_version,
                mismatch.version_schema
            );
        }

        Ok(())
    }

    async fn tick_loop(inner: Arc<SchedulerInner>, token: CancellationToken) {
        let mut interval = tokio::time::interval(inner.settings.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
                _ = inner.wake.notified() => {}
            }

            if let Err(e) = inner.start_next() {
                error!("Failed to start next migration job: {}", e);
            }
        }

        debug!("Scheduler tick loop exited");
    }

    fn start_next(&self) -> Result<(), MigratorError> {
        let _tmr = timer!(Level::Trace; "MigrationScheduler::start_next");
        let mut state = self.state.lock().unwrap();

        if self.stopped.load(Ordering::SeqCst) || state.running.len() >= MAX_RUNNING_JOBS {
            return Ok(());
        }
        let Some(fan_in) = state.fan_in.clone() else {
            return Ok(());
        };

        let conn = self.db.get_connection()?;
        for candidate in MigrationJob::get_pending(&conn)? {
            if state.running.len() >= MAX_RUNNING_JOBS {
                break;
            }

            if state
                .running
                .values()
                .any(|running| running.appspace_id == candidate.appspace_id)
            {
                debug!(
                    "Skipping job {}: appspace {} already has a running job",
                    candidate.job_id, candidate.appspace_id
                );
                continue;
            }

            let started = chrono::Utc::now().timestamp();
            if !MigrationJob::set_started(&conn, candidate.job_id, started)? {
                debug!(
                    "Job {} was started or removed elsewhere",
                    candidate.job_id
                );
                continue;
            }

            let mut job = candidate;
            job.started = Some(started);
            self.launch_locked(&mut state, job, fan_in.clone());
        }

        Ok(())
    }

    fn launch_locked(
        &self,
        state: &mut SchedulerState,
        job: MigrationJob,
        fan_in: mpsc::UnboundedSender<StatusEvent>,
    ) {
        let job_id = job.job_id;
        let appspace_id = job.appspace_id;

        info!(
            "Starting migration job {} for appspace {} to version {}",
            job_id, appspace_id, job.to_version
        );

        let progress = JobProgress::new(&job);
        progress.subscribe(StatusSubscriber::Lossless(fan_in));

        // Registered before the first event so the consumer always finds it
        state.running.insert(
            job_id,
            RunningJob {
                appspace_id,
                progress: Arc::clone(&progress),
            },
        );
        progress.set_status(JobStatus::Started);

        let executor = MigrationExecutor::new(
            self.db.clone(),
            Arc::clone(&self.services),
            job,
            progress,
            self.settings.migration_timeout,
        );
        tokio::task::spawn_blocking(move || executor.run());
    }

    async fn consume(inner: Arc<SchedulerInner>, mut events: mpsc::UnboundedReceiver<StatusEvent>) {
        while let Some(event) = events.recv().await {
            // No receivers is fine
            let _ = inner.broadcaster.send(event.clone());

            if event.status.is_terminal() {
                inner.on_job_finished(&event);
            }
        }

        debug!("Scheduler status loop exited");
    }

    fn on_job_finished(&self, event: &StatusEvent) {
        let _tmr = timer!(Level::Trace; "MigrationScheduler::on_job_finished");

        if let Some(error) = &event.error {
            warn!("Migration job {} finished with error: {}", event.job_id, error);
        }

        let finished = event
            .finished
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        let persisted = self.db.get_connection().and_then(|conn| {
            MigrationJob::set_finished(&conn, event.job_id, finished, event.error.as_deref())
        });
        if let Err(e) = persisted {
            error!(
                "Failed to record completion of migration job {}: {}",
                event.job_id, e
            );
        }

        let mut state = self.state.lock().unwrap();
        state.running.remove(&event.job_id);

        if self.stopped.load(Ordering::SeqCst) {
            if state.running.is_empty() {
                if let Some(drained) = state.drained.take() {
                    let _ = drained.send(());
                }
            }
        } else {
            self.wake.notify_one();
        }
    }
}
