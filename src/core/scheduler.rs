//! Runtime side of the cron job list: registers recurring jobs with the cron
//! engine, arms one-shot timers and reloads everything when the file changes.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::executor::RunOutcome;
use crate::core::lifecycle::LifecycleComponent;
use crate::core::schedule::{CronJob, load_jobs, remove_job, to_cron_expression, to_six_field};

/// Where scheduled firings go. Resolves when the run has finished.
#[async_trait]
pub trait CronDispatch: Send + Sync {
    async fn dispatch(&self, job: &CronJob) -> RunOutcome;
}

/// Translate and validate a schedule, returning the six-field expression the
/// cron engine will run.
pub fn validate_schedule(schedule: &str) -> Result<String> {
    let six = to_six_field(&to_cron_expression(schedule));
    Job::new(six.as_str(), |_uuid, _l| {})
        .map_err(|e| anyhow!("invalid schedule '{}' ({}): {}", schedule, six, e))?;
    Ok(six)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadSummary {
    pub recurring: usize,
    pub one_shot: usize,
    pub skipped: usize,
}

type FileStamp = Option<(SystemTime, u64)>;

#[derive(Default)]
struct SchedulerState {
    cron_ids: Vec<Uuid>,
    timers: Vec<JoinHandle<()>>,
    stamp: FileStamp,
}

pub struct TaskScheduler {
    path: PathBuf,
    engine: JobScheduler,
    dispatch: Arc<dyn CronDispatch>,
    poll: Duration,
    state: Mutex<SchedulerState>,
    // One-shot ids currently firing; a reload must not fire them again.
    in_flight: Arc<std::sync::Mutex<HashSet<String>>>,
    watcher: CancellationToken,
}

async fn file_stamp(path: &Path) -> FileStamp {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some((meta.modified().ok()?, meta.len()))
}

impl TaskScheduler {
    pub fn new(path: PathBuf, engine: JobScheduler, dispatch: Arc<dyn CronDispatch>, poll: Duration) -> Self {
        Self {
            path,
            engine,
            dispatch,
            poll,
            state: Mutex::new(SchedulerState::default()),
            in_flight: Arc::new(std::sync::Mutex::new(HashSet::new())),
            watcher: CancellationToken::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drop everything currently scheduled and rebuild from the file.
    pub async fn reload(&self) -> Result<LoadSummary> {
        let mut state = self.state.lock().await;
        self.clear(&mut state).await;
        state.stamp = file_stamp(&self.path).await;

        let jobs = load_jobs(&self.path).await?;
        let mut summary = LoadSummary::default();
        for job in jobs.into_iter().filter(|j| j.enabled) {
            let registered = if job.is_one_shot() {
                self.arm_one_shot(&mut state, job)
            } else {
                self.register_recurring(&mut state, job).await
            };
            match registered {
                Some(true) => summary.one_shot += 1,
                Some(false) => summary.recurring += 1,
                None => summary.skipped += 1,
            }
        }
        info!(
            "Schedule loaded from {}: {} recurring, {} one-shot, {} skipped",
            self.path.display(),
            summary.recurring,
            summary.one_shot,
            summary.skipped
        );
        Ok(summary)
    }

    async fn clear(&self, state: &mut SchedulerState) {
        for id in state.cron_ids.drain(..) {
            if let Err(e) = self.engine.remove(&id).await {
                warn!("Could not remove cron job {}: {}", id, e);
            }
        }
        for timer in state.timers.drain(..) {
            timer.abort();
        }
    }

    async fn register_recurring(&self, state: &mut SchedulerState, job: CronJob) -> Option<bool> {
        let expr = to_six_field(&to_cron_expression(&job.schedule));
        let dispatch = self.dispatch.clone();
        let job_id = job.id.clone();
        let cron_job = match Job::new_async(expr.as_str(), move |_uuid, _l| {
            let dispatch = dispatch.clone();
            let job = job.clone();
            Box::pin(async move {
                info!("Cron job [{}] firing", job.id);
                dispatch.dispatch(&job).await;
            })
        }) {
            Ok(cron_job) => cron_job,
            Err(e) => {
                warn!("Skipping cron job [{}]: invalid schedule '{}': {}", job_id, expr, e);
                return None;
            }
        };
        match self.engine.add(cron_job).await {
            Ok(uuid) => {
                debug!("Cron job [{}] registered as {} ({})", job_id, uuid, expr);
                state.cron_ids.push(uuid);
                Some(false)
            }
            Err(e) => {
                error!("Failed to register cron job [{}]: {}", job_id, e);
                None
            }
        }
    }

    fn arm_one_shot(&self, state: &mut SchedulerState, job: CronJob) -> Option<bool> {
        let run_at = match job.run_at_utc() {
            Ok(Some(at)) => at,
            Ok(None) => {
                warn!("Skipping one-shot job [{}]: no run_at", job.id);
                return None;
            }
            Err(e) => {
                warn!("Skipping one-shot job [{}]: {}", job.id, e);
                return None;
            }
        };
        if self.is_in_flight(&job.id) {
            debug!("One-shot job [{}] already firing", job.id);
            return Some(true);
        }

        match (run_at - Utc::now()).to_std() {
            Ok(delay) if !delay.is_zero() => {
                debug!("One-shot job [{}] due in {:?}", job.id, delay);
                let path = self.path.clone();
                let dispatch = self.dispatch.clone();
                let in_flight = self.in_flight.clone();
                state.timers.push(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    spawn_one_shot(path, dispatch, in_flight, job);
                }));
            }
            _ => {
                info!("One-shot job [{}] is past due, firing now", job.id);
                spawn_one_shot(self.path.clone(), self.dispatch.clone(), self.in_flight.clone(), job);
            }
        }
        Some(true)
    }

    fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.lock().map(|s| s.contains(id)).unwrap_or(false)
    }

    /// Poll the file and reload on change until [`TaskScheduler::stop_watching`].
    pub fn watch(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let token = self.watcher.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.poll);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let current = file_stamp(&this.path).await;
                let previous = this.state.lock().await.stamp;
                if current == previous {
                    continue;
                }
                info!("Schedule file changed, reloading");
                if let Err(e) = this.reload().await {
                    error!("Schedule reload failed: {:#}", e);
                }
            }
            debug!("Schedule watcher stopped");
        })
    }

    pub fn stop_watching(&self) {
        self.watcher.cancel();
    }

    pub async fn shutdown(&self) {
        self.stop_watching();
        let mut state = self.state.lock().await;
        self.clear(&mut state).await;
    }
}

/// Fire in a detached task so reloads never cut a run short. The entry is
/// removed from the file once the run is over, whatever its outcome.
fn spawn_one_shot(
    path: PathBuf,
    dispatch: Arc<dyn CronDispatch>,
    in_flight: Arc<std::sync::Mutex<HashSet<String>>>,
    job: CronJob,
) {
    if let Ok(mut set) = in_flight.lock()
        && !set.insert(job.id.clone())
    {
        return;
    }
    tokio::spawn(async move {
        let outcome = dispatch.dispatch(&job).await;
        info!("One-shot job [{}] finished: {}", job.id, outcome.status.as_str());
        match remove_job(&path, &job.id).await {
            Ok(true) => debug!("One-shot job [{}] removed", job.id),
            Ok(false) => debug!("One-shot job [{}] was already gone", job.id),
            Err(e) => error!("Could not remove one-shot job [{}]: {:#}", job.id, e),
        }
        if let Ok(mut set) = in_flight.lock() {
            set.remove(&job.id);
        }
    });
}

/// Lifecycle adapter: initial load on start, watcher stopped on shutdown.
pub struct SchedulerComponent {
    scheduler: Arc<TaskScheduler>,
    watcher: Option<JoinHandle<()>>,
}

impl SchedulerComponent {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            scheduler,
            watcher: None,
        }
    }
}

#[async_trait]
impl LifecycleComponent for SchedulerComponent {
    fn name(&self) -> &str {
        "scheduler"
    }

    async fn on_start(&mut self) -> Result<()> {
        info!("Loading scheduled jobs from {}", self.scheduler.path().display());
        if let Err(e) = self.scheduler.reload().await {
            error!("Initial schedule load failed: {:#}", e);
        }
        self.watcher = Some(self.scheduler.watch());
        Ok(())
    }

    async fn on_shutdown(&mut self) -> Result<()> {
        self.scheduler.shutdown().await;
        if let Some(watcher) = self.watcher.take() {
            let _ = watcher.await;
        }
        Ok(())
    }
}
