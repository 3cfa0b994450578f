//! Evolution Trigger
//!
//! Dispatches a training job each time the record count reaches a new
//! multiple of the batch size, unless a job is already running. Crossings
//! seen while a job runs are dropped, not queued: the next multiple after the
//! job resolves fires instead, and a boundary that already had a job never
//! fires twice.

use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::job::{JobHistory, TrainingJob};
use super::EvolutionRunner;

/// What `on_new_record` did with a count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerDecision {
    /// Count is zero or not a multiple of the batch size
    BelowThreshold,
    /// A job was already dispatched for this count or a later one
    AlreadyDispatched,
    /// A job is running; this crossing is dropped
    Suppressed { running: Uuid },
    /// Eligible for dispatch
    Ready,
    Dispatched { job_id: Uuid },
}

impl TriggerDecision {
    pub fn is_dispatch(&self) -> bool {
        matches!(self, TriggerDecision::Dispatched { .. })
    }
}

/// Pure threshold and debounce state
#[derive(Debug, Clone)]
pub struct Debouncer {
    batch_size: u64,
    /// Count the most recent job was dispatched for
    last_dispatched: u64,
    running: Option<Uuid>,
}

impl Debouncer {
    pub fn new(batch_size: usize, last_dispatched: u64) -> Self {
        Self {
            batch_size: batch_size.max(1) as u64,
            last_dispatched,
            running: None,
        }
    }

    pub fn evaluate(&self, count: u64) -> TriggerDecision {
        if count == 0 || count % self.batch_size != 0 {
            return TriggerDecision::BelowThreshold;
        }
        if let Some(running) = self.running {
            return TriggerDecision::Suppressed { running };
        }
        if count <= self.last_dispatched {
            return TriggerDecision::AlreadyDispatched;
        }
        TriggerDecision::Ready
    }

    pub fn begin(&mut self, job_id: Uuid, count: u64) {
        self.running = Some(job_id);
        self.last_dispatched = self.last_dispatched.max(count);
    }

    /// Mark `job_id` resolved; a stale id is ignored
    pub fn finish(&mut self, job_id: Uuid) {
        if self.running == Some(job_id) {
            self.running = None;
        }
    }

    pub fn running(&self) -> Option<Uuid> {
        self.running
    }

    pub fn last_dispatched(&self) -> u64 {
        self.last_dispatched
    }
}

struct TriggerState {
    debouncer: Debouncer,
    handle: Option<JoinHandle<TrainingJob>>,
    last_job: Option<TrainingJob>,
}

/// Threshold trigger that runs jobs on background tasks
pub struct EvolutionTrigger {
    state: Arc<Mutex<TriggerState>>,
    runner: Arc<EvolutionRunner>,
}

impl EvolutionTrigger {
    pub fn new(batch_size: usize, runner: Arc<EvolutionRunner>) -> Self {
        let history = runner.history();
        let last_dispatched = history.last_dispatched_count().unwrap_or_else(|e| {
            warn!("Could not read job history, trigger starts fresh: {:#}", e);
            0
        });
        let last_job = history.last().ok().flatten();
        debug!("Evolution trigger armed above {} records", last_dispatched);

        Self {
            state: Arc::new(Mutex::new(TriggerState {
                debouncer: Debouncer::new(batch_size, last_dispatched),
                handle: None,
                last_job,
            })),
            runner,
        }
    }

    /// Decide on `count` and dispatch a background job if it is due
    pub async fn on_new_record(&self, count: u64) -> TriggerDecision {
        let mut state = self.state.lock().await;

        let decision = state.debouncer.evaluate(count);
        match decision {
            TriggerDecision::Ready => {}
            TriggerDecision::Suppressed { running } => {
                info!(running_job = %running, "Threshold reached at {} records while a job runs; skipped", count);
                return decision;
            }
            _ => return decision,
        }

        let job = TrainingJob::new(count);
        let job_id = job.id;
        state.debouncer.begin(job_id, count);
        info!(job_id = %job_id, "Threshold reached at {} records; dispatching training", count);

        let runner = self.runner.clone();
        let shared = self.state.clone();
        state.handle = Some(tokio::spawn(async move {
            let fallback = job.clone();
            let task_runner = runner.clone();
            // Inner task so a panic still resolves the job
            let finished = match tokio::spawn(async move { task_runner.run_job(job).await }).await {
                Ok(job) => job,
                Err(e) => {
                    error!(job_id = %job_id, "Training job aborted: {}", e);
                    let mut job = fallback;
                    job.start();
                    job.fail_with("Panic", e.to_string());
                    if let Err(e) = runner.history().append(&job) {
                        warn!(job_id = %job_id, "Could not record training job: {:#}", e);
                    }
                    job
                }
            };

            let mut state = shared.lock().await;
            state.debouncer.finish(job_id);
            state.last_job = Some(finished.clone());
            finished
        }));

        TriggerDecision::Dispatched { job_id }
    }

    /// Id of the running job, if any
    pub async fn in_flight(&self) -> Option<Uuid> {
        self.state.lock().await.debouncer.running()
    }

    /// Most recently resolved job, including ones from earlier runs
    pub async fn last_job(&self) -> Option<TrainingJob> {
        self.state.lock().await.last_job.clone()
    }

    /// Wait for the dispatched job, if any, and return it
    pub async fn wait_idle(&self) -> Option<TrainingJob> {
        let handle = self.state.lock().await.handle.take()?;
        match handle.await {
            Ok(job) => Some(job),
            Err(e) => {
                warn!("Training task ended abnormally: {}", e);
                None
            }
        }
    }

    pub fn history(&self) -> &JobHistory {
        self.runner.history()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_only_on_multiples() {
        let debouncer = Debouncer::new(10, 0);
        assert_eq!(debouncer.evaluate(0), TriggerDecision::BelowThreshold);
        assert_eq!(debouncer.evaluate(9), TriggerDecision::BelowThreshold);
        assert_eq!(debouncer.evaluate(10), TriggerDecision::Ready);
        assert_eq!(debouncer.evaluate(15), TriggerDecision::BelowThreshold);
    }

    #[test]
    fn test_long_job_spanning_boundaries() {
        let mut debouncer = Debouncer::new(10, 0);
        let job = Uuid::new_v4();

        assert_eq!(debouncer.evaluate(20), TriggerDecision::Ready);
        debouncer.begin(job, 20);

        assert_eq!(debouncer.evaluate(30), TriggerDecision::Suppressed { running: job });
        debouncer.finish(job);

        // The dropped boundary does not fire late, nor does the dispatched one
        assert_eq!(debouncer.evaluate(35), TriggerDecision::BelowThreshold);
        assert_eq!(debouncer.evaluate(20), TriggerDecision::AlreadyDispatched);
        assert_eq!(debouncer.evaluate(40), TriggerDecision::Ready);
    }

    #[test]
    fn test_rearm_after_failure() {
        let mut debouncer = Debouncer::new(10, 0);
        let job = Uuid::new_v4();
        debouncer.begin(job, 10);
        debouncer.finish(job);
        assert_eq!(debouncer.running(), None);
        assert_eq!(debouncer.evaluate(10), TriggerDecision::AlreadyDispatched);
        assert_eq!(debouncer.evaluate(20), TriggerDecision::Ready);
    }

    #[test]
    fn test_stale_finish_ignored() {
        let mut debouncer = Debouncer::new(10, 0);
        let job = Uuid::new_v4();
        debouncer.begin(job, 10);
        debouncer.finish(Uuid::new_v4());
        assert_eq!(debouncer.running(), Some(job));
    }

    #[test]
    fn test_restored_from_history() {
        let debouncer = Debouncer::new(10, 30);
        assert_eq!(debouncer.evaluate(30), TriggerDecision::AlreadyDispatched);
        assert_eq!(debouncer.evaluate(40), TriggerDecision::Ready);
        assert_eq!(debouncer.last_dispatched(), 30);
    }

    #[test]
    fn test_batch_size_one() {
        let mut debouncer = Debouncer::new(1, 0);
        assert_eq!(debouncer.evaluate(1), TriggerDecision::Ready);
        debouncer.begin(Uuid::new_v4(), 1);
        assert!(matches!(debouncer.evaluate(2), TriggerDecision::Suppressed { .. }));
    }
}
