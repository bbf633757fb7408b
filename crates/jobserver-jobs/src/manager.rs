// ABOUTME: Job manager: submits jobs from templates, admits them under a worker budget and routes control requests.
// ABOUTME: Admission is priority-ordered and FIFO among equals; worker slots return to the budget when dropped.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobserver_core::{
    ConnectionRecord, JobPriority, JobReturnCode, JobState, JobStatusRecord, JobUpdateRecord,
    MonotonicClock, ServerConfig,
};
use jobserver_store::{Database, Filter, Query, SetMode};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{JobError, ManagerError};
use crate::job::{self, JobHandle};
use crate::state::{JobSnapshot, Request};
use crate::template::{JobParameters, JobTemplate, TemplateInfo, TemplateRegistry};

/// Outcome of [`JobManager::start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
    /// A worker slot was free; the job is starting.
    Running,
    /// The job waits for a slot.
    Queued,
}

/// A job [`JobManager::pause_all`] could not pause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseFailure {
    pub job_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PauseAllReport {
    pub paused: Vec<String>,
    pub already_paused: Vec<String>,
    pub failures: Vec<PauseFailure>,
}

impl PauseAllReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Status of a job, live or archived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: String,
    pub init_time: DateTime<Utc>,
    pub archived: bool,
    /// Last logged state; `None` only if the job has no updates at all.
    pub state: Option<JobState>,
    /// Present while the job is still tracked in memory.
    pub live: Option<JobSnapshot>,
}

#[derive(Debug, PartialEq, Eq)]
struct Queued {
    priority: JobPriority,
    seq: u64,
    job_id: String,
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Default)]
struct Scheduler {
    budget: usize,
    running: usize,
    next_seq: u64,
    queue: BinaryHeap<Queued>,
    /// Jobs that have been started, so a second start is rejected.
    started: HashSet<String>,
}

impl Scheduler {
    fn enqueue(&mut self, job_id: &str, priority: JobPriority) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(Queued {
            priority,
            seq,
            job_id: job_id.to_string(),
        });
    }
}

struct ManagerShared {
    db: Arc<Database>,
    clock: Arc<MonotonicClock>,
    templates: RwLock<TemplateRegistry>,
    jobs: Mutex<HashMap<String, JobHandle>>,
    scheduler: Mutex<Scheduler>,
}

/// A granted unit of the worker budget. Dropping it frees the slot and
/// admits the next queued job.
pub(crate) struct WorkerSlot {
    shared: Weak<ManagerShared>,
    job_id: String,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        {
            let mut scheduler = lock(&shared.scheduler);
            scheduler.running = scheduler.running.saturating_sub(1);
        }
        tracing::debug!(job_id = %self.job_id, "worker slot released");
        pump(&shared);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Grant free slots to queued jobs, best first. The scheduler lock is only
/// held while choosing; slots are handed over after it is released.
fn pump(shared: &Arc<ManagerShared>) -> Vec<String> {
    let grants: Vec<(String, WorkerSlot)> = {
        let mut scheduler = lock(&shared.scheduler);
        let mut grants = Vec::new();
        while scheduler.running < scheduler.budget {
            let Some(next) = scheduler.queue.pop() else {
                break;
            };
            scheduler.running += 1;
            let slot = WorkerSlot {
                shared: Arc::downgrade(shared),
                job_id: next.job_id.clone(),
            };
            grants.push((next.job_id, slot));
        }
        grants
    };

    let mut admitted = Vec::new();
    for (job_id, slot) in grants {
        let handle = lock(&shared.jobs).get(&job_id).cloned();
        let Some(handle) = handle else {
            tracing::warn!(job_id = %job_id, "queued job vanished before admission");
            continue;
        };
        if handle.admit(slot) {
            tracing::debug!(job_id = %job_id, "job admitted");
            admitted.push(job_id);
        } else {
            tracing::warn!(job_id = %job_id, "job actor gone before admission");
        }
    }
    admitted
}

/// Owns every in-flight job. Cheap to clone.
#[derive(Clone)]
pub struct JobManager {
    shared: Arc<ManagerShared>,
}

impl JobManager {
    pub fn new(db: Arc<Database>, templates: TemplateRegistry, max_workers: usize) -> Self {
        let scheduler = Scheduler {
            budget: max_workers,
            ..Scheduler::default()
        };
        Self {
            shared: Arc::new(ManagerShared {
                db,
                clock: Arc::new(MonotonicClock::new()),
                templates: RwLock::new(templates),
                jobs: Mutex::new(HashMap::new()),
                scheduler: Mutex::new(scheduler),
            }),
        }
    }

    /// A manager with the builtin templates and the configured budget.
    pub fn from_config(db: Arc<Database>, config: &ServerConfig) -> Self {
        Self::new(db, TemplateRegistry::builtin(), config.max_workers)
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.shared.db
    }

    /// The clock stamping every update this manager writes. Anything else
    /// writing server updates to the same store should share it.
    pub fn clock(&self) -> &Arc<MonotonicClock> {
        &self.shared.clock
    }

    pub fn register_template(&self, template: JobTemplate) {
        self.shared
            .templates
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .register(template);
    }

    fn template(&self, name: &str) -> Result<Arc<JobTemplate>, ManagerError> {
        self.shared
            .templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .ok_or_else(|| ManagerError::TemplateNotFound(name.to_string()))
    }

    pub fn get_job_template(&self, name: &str) -> Result<TemplateInfo, ManagerError> {
        Ok(self.template(name)?.info())
    }

    pub fn list_job_templates(&self) -> Vec<TemplateInfo> {
        self.shared
            .templates
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .list()
    }

    fn handle(&self, job_id: &str) -> Result<JobHandle, ManagerError> {
        lock(&self.shared.jobs)
            .get(job_id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(job_id.to_string()))
    }

    /// Validate the parameters, persist the job and its `Pending` update,
    /// and spawn its actor. The job does not run until [`start`](Self::start).
    pub fn submit(&self, job_id: &str, params: JobParameters) -> Result<JobSnapshot, ManagerError> {
        let template = self.template(&params.template)?;
        let resolved =
            template
                .resolve(&params.values)
                .map_err(|reason| ManagerError::InvalidParameters {
                    template: template.name.clone(),
                    reason,
                })?;

        let status = JobStatusRecord::new(job_id);
        self.shared.db.set_entry(&status, SetMode::Insert)?;
        let pending =
            JobUpdateRecord::new(job_id, self.shared.clock.now(), JobState::Pending, "submitted");
        self.shared.db.set_entry(&pending, SetMode::Insert)?;

        let stages = template.build_stages(&resolved);
        let snapshot = JobSnapshot {
            job_id: job_id.to_string(),
            template: template.name.clone(),
            priority: resolved.priority(),
            state: JobState::Pending,
            result: None,
            stage_index: 0,
            stage_count: stages.len(),
            current_stage: None,
            fault: None,
            init_time: status.init_time,
        };
        let handle = job::spawn(
            snapshot.clone(),
            stages,
            Arc::clone(&self.shared.db),
            Arc::clone(&self.shared.clock),
        );
        lock(&self.shared.jobs).insert(job_id.to_string(), handle);

        tracing::info!(job_id = %job_id, template = %template.name, "job submitted");
        Ok(snapshot)
    }

    /// Queue a pending job for a worker slot. Never blocks: the job is
    /// either admitted now or waits in the queue.
    pub fn start(&self, job_id: &str) -> Result<Admission, ManagerError> {
        let snapshot = self.handle(job_id)?.snapshot();
        {
            let mut scheduler = lock(&self.shared.scheduler);
            if snapshot.state != JobState::Pending || scheduler.started.contains(job_id) {
                return Err(JobError::InvalidTransition {
                    job_id: job_id.to_string(),
                    state: snapshot.state,
                    request: Request::Start,
                }
                .into());
            }
            scheduler.started.insert(job_id.to_string());
            scheduler.enqueue(job_id, snapshot.priority);
        }

        let admitted = pump(&self.shared);
        if admitted.iter().any(|id| id == job_id) {
            tracing::info!(job_id = %job_id, "job started");
            Ok(Admission::Running)
        } else {
            tracing::info!(job_id = %job_id, "job queued");
            Ok(Admission::Queued)
        }
    }

    pub async fn pause(&self, job_id: &str) -> Result<JobState, ManagerError> {
        self.control(job_id, Request::Pause, None).await
    }

    pub async fn resume(&self, job_id: &str) -> Result<JobState, ManagerError> {
        self.control(job_id, Request::Resume, None).await
    }

    pub async fn cancel(&self, job_id: &str) -> Result<JobState, ManagerError> {
        self.control(job_id, Request::Cancel, None).await
    }

    /// Route a request to a job, optionally on behalf of a known client.
    /// Returns the state the job is in once the request is logged.
    pub async fn control(
        &self,
        job_id: &str,
        request: Request,
        client_token: Option<&str>,
    ) -> Result<JobState, ManagerError> {
        if let Some(token) = client_token
            && self
                .shared
                .db
                .get_entry::<ConnectionRecord>(&[token.into()])?
                .is_none()
        {
            return Err(ManagerError::ClientNotFound(token.to_string()));
        }

        if request == Request::Start {
            self.start(job_id)?;
            return Ok(self.handle(job_id)?.snapshot().state);
        }

        let handle = self.handle(job_id)?;
        let state = handle
            .control(request, client_token.map(str::to_string))
            .await?;

        if request == Request::Cancel {
            lock(&self.shared.scheduler)
                .queue
                .retain(|queued| queued.job_id != job_id);
        }
        tracing::info!(job_id = %job_id, %request, state = %state, "control request applied");
        Ok(state)
    }

    /// Resize the worker budget. Running jobs are never preempted; a larger
    /// budget admits queued jobs immediately.
    pub fn update_available_workers(&self, workers: usize) {
        lock(&self.shared.scheduler).budget = workers;
        tracing::info!(workers, "worker budget updated");
        pump(&self.shared);
    }

    pub fn available_workers(&self) -> usize {
        lock(&self.shared.scheduler).budget
    }

    pub fn running_workers(&self) -> usize {
        lock(&self.shared.scheduler).running
    }

    /// Queued job ids, next to be admitted first.
    pub fn queued_jobs(&self) -> Vec<String> {
        let scheduler = lock(&self.shared.scheduler);
        let mut queued: Vec<&Queued> = scheduler.queue.iter().collect();
        queued.sort_by(|a, b| b.cmp(a));
        queued.into_iter().map(|q| q.job_id.clone()).collect()
    }

    /// Pause every running job. Jobs already pausing or paused count as
    /// paused; any other unfinished job is reported as a failure.
    pub async fn pause_all(&self) -> PauseAllReport {
        let mut report = PauseAllReport::default();
        let handles: Vec<(String, JobHandle)> = lock(&self.shared.jobs)
            .iter()
            .map(|(id, handle)| (id.clone(), handle.clone()))
            .collect();

        for (job_id, handle) in handles {
            let snapshot = handle.snapshot();
            if snapshot.is_finished() {
                continue;
            }
            match snapshot.state {
                JobState::Pausing | JobState::Paused => report.already_paused.push(job_id),
                JobState::Running => match self.control(&job_id, Request::Pause, None).await {
                    Ok(_) => report.paused.push(job_id),
                    Err(err) => report.failures.push(PauseFailure {
                        job_id,
                        reason: err.to_string(),
                    }),
                },
                other => report.failures.push(PauseFailure {
                    reason: format!("job {job_id} cannot pause while {other}"),
                    job_id,
                }),
            }
        }

        report.paused.sort();
        report.already_paused.sort();
        report.failures.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        if !report.is_clean() {
            tracing::warn!(failures = report.failures.len(), "some jobs could not be paused");
        }
        report
    }

    /// Status of a job: the live snapshot while tracked, otherwise the
    /// persisted status and its last logged state.
    pub fn job_status(&self, job_id: &str) -> Result<JobStatusView, ManagerError> {
        if let Ok(handle) = self.handle(job_id) {
            let snapshot = handle.snapshot();
            return Ok(JobStatusView {
                job_id: snapshot.job_id.clone(),
                init_time: snapshot.init_time,
                archived: false,
                state: Some(snapshot.state),
                live: Some(snapshot),
            });
        }

        let status: JobStatusRecord = self
            .shared
            .db
            .get_entry(&[job_id.into()])?
            .ok_or_else(|| ManagerError::NotFound(job_id.to_string()))?;
        let last: Vec<JobUpdateRecord> = self.shared.db.search_entries(
            &Query::new()
                .filter(Filter::eq("job_id", job_id))
                .descending(true)
                .paginate(1, 1),
        )?;
        Ok(JobStatusView {
            job_id: status.job_id,
            init_time: status.init_time,
            archived: status.archived,
            state: last.first().and_then(JobUpdateRecord::state),
            live: None,
        })
    }

    /// Snapshots of every job still tracked in memory, oldest first.
    pub fn active_jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = lock(&self.shared.jobs)
            .values()
            .map(JobHandle::snapshot)
            .collect();
        jobs.sort_by(|a, b| {
            a.init_time
                .cmp(&b.init_time)
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        jobs
    }

    /// Updates appended for `job_id` from now on.
    pub fn subscribe(
        &self,
        job_id: &str,
    ) -> Result<broadcast::Receiver<JobUpdateRecord>, ManagerError> {
        Ok(self.handle(job_id)?.subscribe())
    }

    /// A receiver that sees every snapshot change of `job_id`.
    pub fn watch(&self, job_id: &str) -> Result<watch::Receiver<JobSnapshot>, ManagerError> {
        Ok(self.handle(job_id)?.watch())
    }

    /// Wait until the job closes or faults.
    pub async fn wait_for_close(&self, job_id: &str) -> Result<JobSnapshot, ManagerError> {
        let mut rx = self.watch(job_id)?;
        let finished = rx
            .wait_for(JobSnapshot::is_finished)
            .await
            .map(|snapshot| snapshot.clone());
        Ok(match finished {
            Ok(snapshot) => snapshot,
            Err(_) => rx.borrow().clone(),
        })
    }

    /// Mark every finished job archived and stop tracking it in memory.
    /// Returns the archived ids.
    pub fn archive_closed(&self) -> Result<Vec<String>, ManagerError> {
        let mut finished: Vec<String> = lock(&self.shared.jobs)
            .iter()
            .filter(|(_, handle)| handle.snapshot().is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        finished.sort();

        for job_id in &finished {
            let mut status: JobStatusRecord = self
                .shared
                .db
                .get_entry(&[job_id.as_str().into()])?
                .ok_or_else(|| ManagerError::NotFound(job_id.clone()))?;
            status.archived = true;
            self.shared.db.set_entry(&status, SetMode::Update)?;

            lock(&self.shared.jobs).remove(job_id);
            lock(&self.shared.scheduler).started.remove(job_id);
            tracing::info!(job_id = %job_id, "job archived");
        }
        Ok(finished)
    }

    /// Sweep finished jobs into the archive every `every`, until the last
    /// clone of this manager is dropped or the task is aborted.
    pub fn spawn_archiver(&self, every: Duration) -> JoinHandle<()> {
        let shared = Arc::downgrade(&self.shared);
        let every = every.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                let manager = JobManager { shared };
                match manager.archive_closed() {
                    Ok(archived) if !archived.is_empty() => {
                        tracing::debug!(count = archived.len(), "archiver swept closed jobs");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!("archive sweep failed: {}", err),
                }
            }
            tracing::debug!("archiver stopped");
        })
    }

    /// Result of a tracked job once it has one.
    pub fn job_result(&self, job_id: &str) -> Result<Option<JobReturnCode>, ManagerError> {
        Ok(self.handle(job_id)?.snapshot().result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{Stage, StageFactory, StageKind};
    use crate::state::is_valid_history;
    use crate::template::{ParamKind, ParameterSpec, ResolvedParameters};
    use async_trait::async_trait;
    use jobserver_core::{
        ErrorRecord, JobUpdateSubtype, ServerUpdateRecord, ServerUpdateType, StoredEnum,
    };
    use jobserver_store::ErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use tempfile::TempDir;
    use tokio::sync::Notify;

    const WAIT: Duration = Duration::from_secs(10);

    /// Shared counters and signals for the gate stages of one fixture.
    #[derive(Clone, Default)]
    struct GateSignals {
        entered: Arc<Notify>,
        release: Arc<Notify>,
        cancels: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    struct Gate {
        signals: GateSignals,
        succeed: bool,
    }

    /// Blocks until released and ignores cancellation.
    struct GateStage {
        signals: GateSignals,
        succeed: bool,
    }

    #[async_trait]
    impl Stage for GateStage {
        fn name(&self) -> &str {
            "gate"
        }

        async fn start(&self) -> bool {
            self.signals.entered.notify_one();
            self.signals.release.notified().await;
            self.signals.finished.fetch_add(1, AtomicOrdering::SeqCst);
            self.succeed
        }

        fn cancel(&self) -> bool {
            self.signals.cancels.fetch_add(1, AtomicOrdering::SeqCst);
            false
        }
    }

    impl StageFactory for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        fn build(&self, _params: &ResolvedParameters) -> Arc<dyn Stage> {
            Arc::new(GateStage {
                signals: self.signals.clone(),
                succeed: self.succeed,
            })
        }
    }

    struct Fixture {
        _dir: TempDir,
        db: Arc<Database>,
        manager: JobManager,
        entered: Arc<Notify>,
        release: Arc<Notify>,
        cancels: Arc<AtomicUsize>,
        finished: Arc<AtomicUsize>,
    }

    fn fixture(workers: usize) -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::connect(&dir.path().join("jobs.sqlite3"), true).unwrap());
        let signals = GateSignals::default();

        let mut templates = TemplateRegistry::builtin();
        templates.register(
            JobTemplate::new("gated", "Wait for the test, then echo")
                .parameter(ParameterSpec::optional(
                    "message",
                    ParamKind::Text,
                    "gated".into(),
                    "Text to log",
                ))
                .stage(StageKind::Custom(Arc::new(Gate {
                    signals: signals.clone(),
                    succeed: true,
                })))
                .stage(StageKind::Echo),
        );
        templates.register(
            JobTemplate::new("gated-fail", "Wait for the test, then report failure").stage(
                StageKind::Custom(Arc::new(Gate {
                    signals: signals.clone(),
                    succeed: false,
                })),
            ),
        );

        let manager = JobManager::new(Arc::clone(&db), templates, workers);
        Fixture {
            _dir: dir,
            db,
            manager,
            entered: signals.entered,
            release: signals.release,
            cancels: signals.cancels,
            finished: signals.finished,
        }
    }

    fn history(db: &Database, job_id: &str) -> Vec<JobState> {
        db.search_entries::<JobUpdateRecord>(&Query::new().filter(Filter::eq("job_id", job_id)))
            .unwrap()
            .iter()
            .filter_map(JobUpdateRecord::state)
            .collect()
    }

    async fn wait_for_state(manager: &JobManager, job_id: &str, state: JobState) {
        let mut rx = manager.watch(job_id).unwrap();
        tokio::time::timeout(WAIT, rx.wait_for(|s| s.state == state))
            .await
            .expect("timed out waiting for state")
            .unwrap();
    }

    async fn closed(manager: &JobManager, job_id: &str) -> JobSnapshot {
        tokio::time::timeout(WAIT, manager.wait_for_close(job_id))
            .await
            .expect("timed out waiting for close")
            .unwrap()
    }

    #[tokio::test]
    async fn echo_job_runs_to_success() {
        let fx = fixture(4);
        fx.manager
            .submit("echo-1", JobParameters::new("echo").with("message", "hi"))
            .unwrap();

        let status: JobStatusRecord = fx.db.get_entry(&["echo-1".into()]).unwrap().unwrap();
        assert!(!status.archived);
        assert_eq!(history(&fx.db, "echo-1"), vec![JobState::Pending]);

        assert_eq!(fx.manager.start("echo-1").unwrap(), Admission::Running);
        let done = closed(&fx.manager, "echo-1").await;

        assert_eq!(done.state, JobState::Closed);
        assert_eq!(done.result, Some(JobReturnCode::Success));
        assert_eq!(
            history(&fx.db, "echo-1"),
            vec![
                JobState::Pending,
                JobState::Running,
                JobState::Exiting,
                JobState::Closed
            ]
        );
        assert_eq!(fx.manager.running_workers(), 0);
    }

    #[tokio::test]
    async fn failing_stage_records_an_error() {
        let fx = fixture(4);
        fx.manager
            .submit("echo-1", JobParameters::new("echo").with("fail", true))
            .unwrap();
        fx.manager.start("echo-1").unwrap();
        let done = closed(&fx.manager, "echo-1").await;
        assert_eq!(done.state, JobState::Closed);
        assert_eq!(done.result, Some(JobReturnCode::Failed));

        let errors: Vec<ErrorRecord> = fx
            .db
            .search_entries(&Query::new().filter(Filter::eq("job_id", "echo-1")))
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].severity_level, jobserver_core::ErrorSeverity::Bad);

        let updates: Vec<JobUpdateRecord> = fx
            .db
            .search_entries(&Query::new().filter(Filter::eq("job_id", "echo-1")))
            .unwrap();
        let exiting = updates
            .iter()
            .find(|u| u.state() == Some(JobState::Exiting))
            .unwrap();
        assert_eq!(exiting.error_id.as_deref(), Some(errors[0].error_id.as_str()));

        let notices: Vec<ServerUpdateRecord> = fx
            .db
            .search_entries(&Query::new().filter(Filter::eq("job_id", "echo-1")))
            .unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].update_type, ServerUpdateType::Job);
        assert_eq!(notices[0].subtype, JobUpdateSubtype::StageError.code());
    }

    #[tokio::test]
    async fn zero_budget_keeps_jobs_queued() {
        let fx = fixture(0);
        fx.manager.submit("echo-1", JobParameters::new("echo")).unwrap();
        assert_eq!(fx.manager.start("echo-1").unwrap(), Admission::Queued);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(history(&fx.db, "echo-1"), vec![JobState::Pending]);
        assert_eq!(fx.manager.queued_jobs(), vec!["echo-1".to_string()]);

        fx.manager.update_available_workers(1);
        let done = closed(&fx.manager, "echo-1").await;
        assert_eq!(done.result, Some(JobReturnCode::Success));
    }

    #[tokio::test]
    async fn queue_admits_by_priority_then_arrival() {
        let fx = fixture(0);
        for (id, priority) in [("low", 1), ("first", 3), ("urgent", 5), ("second", 3)] {
            fx.manager
                .submit(id, JobParameters::new("echo").with("priority", priority))
                .unwrap();
            fx.manager.start(id).unwrap();
        }
        assert_eq!(
            fx.manager.queued_jobs(),
            vec!["urgent", "first", "second", "low"]
        );

        fx.manager.update_available_workers(1);
        for id in ["low", "first", "urgent", "second"] {
            closed(&fx.manager, id).await;
        }

        let mut started: Vec<(DateTime<Utc>, String)> = ["low", "first", "urgent", "second"]
            .iter()
            .map(|id| {
                let updates: Vec<JobUpdateRecord> = fx
                    .db
                    .search_entries(&Query::new().filter(Filter::eq("job_id", *id)))
                    .unwrap();
                let running = updates
                    .iter()
                    .find(|u| u.state() == Some(JobState::Running))
                    .unwrap();
                (running.update_time, id.to_string())
            })
            .collect();
        started.sort();
        let order: Vec<String> = started.into_iter().map(|(_, id)| id).collect();
        assert_eq!(order, vec!["urgent", "first", "second", "low"]);
    }

    #[tokio::test]
    async fn pause_parks_at_the_next_boundary_and_resume_continues() {
        let fx = fixture(1);
        fx.manager.submit("g", JobParameters::new("gated")).unwrap();
        fx.manager.start("g").unwrap();
        tokio::time::timeout(WAIT, fx.entered.notified()).await.unwrap();

        assert_eq!(fx.manager.pause("g").await.unwrap(), JobState::Pausing);
        assert_eq!(
            fx.manager.pause("g").await.unwrap_err().kind(),
            ErrorKind::InvalidTransition
        );
        fx.release.notify_one();
        wait_for_state(&fx.manager, "g", JobState::Paused).await;
        assert_eq!(fx.manager.job_status("g").unwrap().live.unwrap().stage_index, 1);

        assert_eq!(fx.manager.resume("g").await.unwrap(), JobState::Resuming);
        let done = closed(&fx.manager, "g").await;
        assert_eq!(done.result, Some(JobReturnCode::Success));

        let log = history(&fx.db, "g");
        assert!(is_valid_history(&log));
        assert_eq!(
            log,
            vec![
                JobState::Pending,
                JobState::Running,
                JobState::Pausing,
                JobState::Paused,
                JobState::Resuming,
                JobState::Running,
                JobState::Exiting,
                JobState::Closed
            ]
        );
    }

    #[tokio::test]
    async fn invalid_pause_writes_nothing() {
        let fx = fixture(1);
        fx.manager.submit("p", JobParameters::new("echo")).unwrap();
        let err = fx.manager.pause("p").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(history(&fx.db, "p"), vec![JobState::Pending]);

        let err = fx.manager.resume("p").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
        assert_eq!(history(&fx.db, "p"), vec![JobState::Pending]);
    }

    #[tokio::test]
    async fn cancel_mid_stage_closes_cancelled() {
        let fx = fixture(1);
        fx.manager
            .submit("s", JobParameters::new("sleep").with("duration_ms", 60_000))
            .unwrap();
        fx.manager.start("s").unwrap();
        wait_for_state(&fx.manager, "s", JobState::Running).await;

        assert_eq!(fx.manager.cancel("s").await.unwrap(), JobState::Closed);
        let done = closed(&fx.manager, "s").await;
        assert_eq!(done.result, Some(JobReturnCode::Cancelled));
        assert_eq!(
            history(&fx.db, "s"),
            vec![
                JobState::Pending,
                JobState::Running,
                JobState::Exiting,
                JobState::Closed
            ]
        );

        let err = fx.manager.cancel("s").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn cancelled_stage_runs_to_completion_before_its_slot_returns() {
        let fx = fixture(1);
        fx.manager.submit("g", JobParameters::new("gated")).unwrap();
        fx.manager.submit("next", JobParameters::new("echo")).unwrap();
        fx.manager.start("g").unwrap();
        tokio::time::timeout(WAIT, fx.entered.notified()).await.unwrap();
        assert_eq!(fx.manager.start("next").unwrap(), Admission::Queued);

        assert_eq!(fx.manager.cancel("g").await.unwrap(), JobState::Closed);
        assert_eq!(fx.cancels.load(AtomicOrdering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.finished.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(fx.manager.running_workers(), 1);
        assert_eq!(fx.manager.queued_jobs(), vec!["next".to_string()]);

        fx.release.notify_one();
        let next = closed(&fx.manager, "next").await;
        assert_eq!(next.result, Some(JobReturnCode::Success));
        assert_eq!(fx.finished.load(AtomicOrdering::SeqCst), 1);

        let done = closed(&fx.manager, "g").await;
        assert_eq!(done.result, Some(JobReturnCode::Cancelled));
        assert_eq!(
            history(&fx.db, "g"),
            vec![
                JobState::Pending,
                JobState::Running,
                JobState::Exiting,
                JobState::Closed
            ]
        );
    }

    #[tokio::test]
    async fn cancel_while_paused_closes_cancelled() {
        let fx = fixture(1);
        fx.manager.submit("g", JobParameters::new("gated")).unwrap();
        fx.manager.start("g").unwrap();
        tokio::time::timeout(WAIT, fx.entered.notified()).await.unwrap();

        fx.manager.pause("g").await.unwrap();
        fx.release.notify_one();
        wait_for_state(&fx.manager, "g", JobState::Paused).await;

        assert_eq!(fx.manager.cancel("g").await.unwrap(), JobState::Closed);
        assert_eq!(fx.cancels.load(AtomicOrdering::SeqCst), 0);
        assert_eq!(fx.manager.running_workers(), 0);

        let done = closed(&fx.manager, "g").await;
        assert_eq!(done.result, Some(JobReturnCode::Cancelled));
        let log = history(&fx.db, "g");
        assert!(is_valid_history(&log));
        assert_eq!(
            log,
            vec![
                JobState::Pending,
                JobState::Running,
                JobState::Pausing,
                JobState::Paused,
                JobState::Exiting,
                JobState::Closed
            ]
        );
    }

    #[tokio::test]
    async fn stage_failure_while_pausing_closes_failed() {
        let fx = fixture(1);
        fx.manager.submit("f", JobParameters::new("gated-fail")).unwrap();
        fx.manager.start("f").unwrap();
        tokio::time::timeout(WAIT, fx.entered.notified()).await.unwrap();

        assert_eq!(fx.manager.pause("f").await.unwrap(), JobState::Pausing);
        fx.release.notify_one();

        let done = closed(&fx.manager, "f").await;
        assert_eq!(done.state, JobState::Closed);
        assert_eq!(done.result, Some(JobReturnCode::Failed));

        let log = history(&fx.db, "f");
        assert!(is_valid_history(&log));
        assert_eq!(
            log,
            vec![
                JobState::Pending,
                JobState::Running,
                JobState::Pausing,
                JobState::Exiting,
                JobState::Closed
            ]
        );

        let errors: Vec<ErrorRecord> = fx
            .db
            .search_entries(&Query::new().filter(Filter::eq("job_id", "f")))
            .unwrap();
        assert_eq!(errors.len(), 1);
    }

    #[tokio::test]
    async fn cancel_while_queued_frees_the_queue() {
        let fx = fixture(0);
        fx.manager.submit("q", JobParameters::new("echo")).unwrap();
        fx.manager.start("q").unwrap();
        assert_eq!(fx.manager.cancel("q").await.unwrap(), JobState::Closed);
        assert!(fx.manager.queued_jobs().is_empty());
        assert_eq!(
            history(&fx.db, "q"),
            vec![JobState::Pending, JobState::Exiting, JobState::Closed]
        );
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let fx = fixture(0);
        fx.manager.submit("twice", JobParameters::new("echo")).unwrap();
        fx.manager.start("twice").unwrap();
        let err = fx.manager.start("twice").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransition);
    }

    #[tokio::test]
    async fn submit_validates_template_and_parameters() {
        let fx = fixture(1);
        let err = fx
            .manager
            .submit("x", JobParameters::new("no-such-template"))
            .unwrap_err();
        assert!(matches!(err, ManagerError::TemplateNotFound(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = fx
            .manager
            .submit("x", JobParameters::new("echo").with("fail", "sometimes"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);

        let err = fx
            .manager
            .submit("x", JobParameters::new("file-write-read"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);

        let missing: Option<JobStatusRecord> = fx.db.get_entry(&["x".into()]).unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn reused_job_id_is_a_constraint_violation() {
        let fx = fixture(1);
        fx.manager.submit("dup", JobParameters::new("echo")).unwrap();
        let err = fx
            .manager
            .submit("dup", JobParameters::new("echo"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConstraintViolation);
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let fx = fixture(1);
        assert_eq!(
            fx.manager.pause("ghost").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(fx.manager.start("ghost").unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            fx.manager.job_status("ghost").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn control_on_behalf_of_a_client_is_logged() {
        let fx = fixture(1);
        fx.db
            .set_entry(&ConnectionRecord::new("tok", "127.0.0.1"), SetMode::Insert)
            .unwrap();
        fx.manager.submit("c", JobParameters::new("echo")).unwrap();

        let err = fx
            .manager
            .control("c", Request::Cancel, Some("stranger"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::ClientNotFound(_)));

        fx.manager
            .control("c", Request::Cancel, Some("tok"))
            .await
            .unwrap();
        let updates: Vec<JobUpdateRecord> = fx
            .db
            .search_entries(&Query::new().filter(Filter::eq("client_token", "tok")))
            .unwrap();
        let states: Vec<Option<JobState>> = updates.iter().map(JobUpdateRecord::state).collect();
        assert_eq!(states, vec![Some(JobState::Exiting), Some(JobState::Closed)]);
    }

    #[tokio::test]
    async fn pause_all_reports_every_job() {
        let fx = fixture(2);
        fx.manager.submit("running", JobParameters::new("gated")).unwrap();
        fx.manager.submit("idle", JobParameters::new("echo")).unwrap();
        fx.manager.submit("done", JobParameters::new("echo")).unwrap();

        fx.manager.start("done").unwrap();
        closed(&fx.manager, "done").await;
        fx.manager.start("running").unwrap();
        tokio::time::timeout(WAIT, fx.entered.notified()).await.unwrap();
        wait_for_state(&fx.manager, "running", JobState::Running).await;

        let report = fx.manager.pause_all().await;
        assert_eq!(report.paused, vec!["running".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].job_id, "idle");

        let again = fx.manager.pause_all().await;
        assert_eq!(again.already_paused, vec!["running".to_string()]);

        fx.release.notify_one();
        wait_for_state(&fx.manager, "running", JobState::Paused).await;
        fx.manager.resume("running").await.unwrap();
        closed(&fx.manager, "running").await;
    }

    #[tokio::test]
    async fn subscribers_see_appended_updates() {
        let fx = fixture(1);
        fx.manager.submit("sub", JobParameters::new("echo")).unwrap();
        let mut rx = fx.manager.subscribe("sub").unwrap();
        fx.manager.start("sub").unwrap();

        let mut seen = Vec::new();
        while seen.last() != Some(&JobState::Closed) {
            let update = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            seen.extend(update.state());
        }
        assert_eq!(
            seen,
            vec![JobState::Running, JobState::Exiting, JobState::Closed]
        );
    }

    #[tokio::test]
    async fn archive_sweeps_closed_jobs() {
        let fx = fixture(1);
        fx.manager.submit("old", JobParameters::new("echo")).unwrap();
        fx.manager.submit("new", JobParameters::new("echo")).unwrap();
        fx.manager.start("old").unwrap();
        closed(&fx.manager, "old").await;

        assert_eq!(fx.manager.archive_closed().unwrap(), vec!["old".to_string()]);
        let ids: Vec<String> = fx
            .manager
            .active_jobs()
            .into_iter()
            .map(|s| s.job_id)
            .collect();
        assert_eq!(ids, vec!["new".to_string()]);

        let status = fx.manager.job_status("old").unwrap();
        assert!(status.archived);
        assert!(status.live.is_none());
        assert_eq!(status.state, Some(JobState::Closed));
    }

    #[tokio::test]
    async fn archiver_sweeps_closed_jobs_on_its_own() {
        let fx = fixture(1);
        let archiver = fx.manager.spawn_archiver(Duration::from_millis(20));
        fx.manager.submit("swept", JobParameters::new("echo")).unwrap();
        fx.manager.submit("waiting", JobParameters::new("echo")).unwrap();
        fx.manager.start("swept").unwrap();

        tokio::time::timeout(WAIT, async {
            while !fx.manager.job_status("swept").unwrap().archived {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("closed job was never archived");

        let status: JobStatusRecord = fx.db.get_entry(&["swept".into()]).unwrap().unwrap();
        assert!(status.archived);
        let active: Vec<String> = fx
            .manager
            .active_jobs()
            .into_iter()
            .map(|s| s.job_id)
            .collect();
        assert_eq!(active, vec!["waiting".to_string()]);

        archiver.abort();
    }

    #[tokio::test]
    async fn write_failure_in_the_runner_faults_the_job() {
        let fx = fixture(1);
        fx.manager.submit("f", JobParameters::new("gated")).unwrap();
        fx.manager.start("f").unwrap();
        tokio::time::timeout(WAIT, fx.entered.notified()).await.unwrap();
        wait_for_state(&fx.manager, "f", JobState::Running).await;

        fx.db.disconnect().unwrap();
        fx.release.notify_one();

        let done = closed(&fx.manager, "f").await;
        assert!(done.fault.is_some());
        assert_eq!(done.result, Some(JobReturnCode::Failed));
        assert_eq!(done.state, JobState::Running);
    }

    #[tokio::test]
    async fn write_failure_in_a_control_request_faults_at_the_boundary() {
        let fx = fixture(1);
        fx.manager.submit("f", JobParameters::new("gated")).unwrap();
        fx.manager.start("f").unwrap();
        tokio::time::timeout(WAIT, fx.entered.notified()).await.unwrap();
        wait_for_state(&fx.manager, "f", JobState::Running).await;

        fx.db.disconnect().unwrap();
        let err = fx.manager.pause("f").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(fx.manager.job_status("f").unwrap().state, Some(JobState::Running));

        fx.release.notify_one();
        let done = closed(&fx.manager, "f").await;
        assert!(done.fault.is_some());
        assert_eq!(done.result, Some(JobReturnCode::Failed));
    }

    #[tokio::test]
    async fn templates_are_listed_and_looked_up() {
        let fx = fixture(1);
        let names: Vec<String> = fx
            .manager
            .list_job_templates()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert!(names.contains(&"gated".to_string()));
        assert!(names.contains(&"echo".to_string()));
        assert_eq!(
            fx.manager.get_job_template("missing").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }
}
