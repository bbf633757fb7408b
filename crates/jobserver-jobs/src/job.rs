// ABOUTME: Per-job actor that owns one job's state machine, runs its stages and logs every transition.
// ABOUTME: JobHandle sends admissions and control requests, reads snapshots and subscribes to appended updates.

use std::sync::Arc;

use jobserver_core::{
    ErrorRecord, ErrorSeverity, JobReturnCode, JobState, JobUpdateRecord, JobUpdateSubtype,
    MonotonicClock, ServerUpdateRecord, ServerUpdateType,
};
use jobserver_store::{Database, SetMode, StoreError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use ulid::Ulid;

use crate::error::JobError;
use crate::manager::WorkerSlot;
use crate::stage::Stage;
use crate::state::{JobSnapshot, Request, next_state};

type ControlReply = oneshot::Sender<Result<JobState, JobError>>;

enum Message {
    /// A worker slot was granted; the job may leave `Pending`.
    Admit(WorkerSlot),
    Control {
        request: Request,
        client_token: Option<String>,
        reply: ControlReply,
    },
}

/// Handle for interacting with a running job actor.
#[derive(Clone)]
pub(crate) struct JobHandle {
    job_id: String,
    tx: mpsc::UnboundedSender<Message>,
    snapshot: watch::Receiver<JobSnapshot>,
    updates: broadcast::Sender<JobUpdateRecord>,
}

impl JobHandle {
    pub(crate) fn snapshot(&self) -> JobSnapshot {
        self.snapshot.borrow().clone()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<JobSnapshot> {
        self.snapshot.clone()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<JobUpdateRecord> {
        self.updates.subscribe()
    }

    /// Hand the job its worker slot. On failure the slot is dropped, which
    /// returns it to the budget.
    pub(crate) fn admit(&self, slot: WorkerSlot) -> bool {
        self.tx.send(Message::Admit(slot)).is_ok()
    }

    /// Send a control request and await the state it left the job in.
    pub(crate) async fn control(
        &self,
        request: Request,
        client_token: Option<String>,
    ) -> Result<JobState, JobError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Message::Control {
                request,
                client_token,
                reply,
            })
            .map_err(|_| JobError::ChannelClosed(self.job_id.clone()))?;
        rx.await
            .map_err(|_| JobError::ChannelClosed(self.job_id.clone()))?
    }
}

/// Spawn the actor for a freshly submitted job. The caller has already
/// persisted its status and `Pending` update; the job waits for admission.
pub(crate) fn spawn(
    initial: JobSnapshot,
    stages: Vec<Arc<dyn Stage>>,
    db: Arc<Database>,
    clock: Arc<MonotonicClock>,
) -> JobHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (snapshot_tx, snapshot_rx) = watch::channel(initial.clone());
    let (updates, _) = broadcast::channel(256);

    let handle = JobHandle {
        job_id: initial.job_id.clone(),
        tx,
        snapshot: snapshot_rx,
        updates: updates.clone(),
    };

    let actor = JobActor {
        view: initial,
        stages,
        db,
        clock,
        rx,
        inbox_open: true,
        snapshot: snapshot_tx,
        updates,
        in_flight: None,
        pending_fault: None,
        slot: None,
    };
    tokio::spawn(actor.run());

    handle
}

struct JobActor {
    view: JobSnapshot,
    stages: Vec<Arc<dyn Stage>>,
    db: Arc<Database>,
    clock: Arc<MonotonicClock>,
    rx: mpsc::UnboundedReceiver<Message>,
    inbox_open: bool,
    snapshot: watch::Sender<JobSnapshot>,
    updates: broadcast::Sender<JobUpdateRecord>,
    in_flight: Option<Arc<dyn Stage>>,
    /// A control request failed to write; the job faults at its next boundary.
    pending_fault: Option<String>,
    slot: Option<WorkerSlot>,
}

impl JobActor {
    async fn run(mut self) {
        if self.wait_for_admission().await {
            self.run_stages().await;
        }
        self.slot = None;

        // Finished: keep answering requests until the manager lets go.
        while let Some(msg) = self.rx.recv().await {
            self.handle(msg);
        }
        tracing::debug!(job_id = %self.view.job_id, "job actor stopped");
    }

    async fn wait_for_admission(&mut self) -> bool {
        loop {
            if let Some(reason) = self.pending_fault.take() {
                self.fault(reason);
                return false;
            }
            if self.view.state != JobState::Pending {
                return false;
            }
            match self.rx.recv().await {
                Some(Message::Admit(slot)) => {
                    self.slot = Some(slot);
                    return true;
                }
                Some(msg) => self.handle(msg),
                None => return false,
            }
        }
    }

    async fn run_stages(&mut self) {
        if let Err(err) = self.transition(JobState::Running, "started", None, None) {
            self.fault(err.to_string());
            return;
        }

        while self.view.stage_index < self.stages.len() {
            if !self.at_boundary().await {
                return;
            }
            let stage = Arc::clone(&self.stages[self.view.stage_index]);
            let name = stage.name().to_string();
            self.view.current_stage = Some(name.clone());
            self.publish();
            tracing::debug!(
                job_id = %self.view.job_id,
                stage = %name,
                index = self.view.stage_index,
                "stage starting"
            );

            match self.run_stage(stage).await {
                None => return,
                Some(true) => {
                    self.view.stage_index += 1;
                    self.view.current_stage = None;
                    self.publish();
                }
                Some(false) => {
                    self.stage_failed(&name);
                    return;
                }
            }
        }

        if !self.at_boundary().await {
            return;
        }
        if let Err(err) = self.transition(JobState::Exiting, "completed", None, None) {
            self.fault(err.to_string());
            return;
        }
        if let Err(err) = self.close(JobReturnCode::Success, None) {
            self.fault(err.to_string());
        }
    }

    /// Run one stage while still serving control requests. A cancelled
    /// stage is awaited to the end and its result dropped; `None` means the
    /// job closed while the stage was in flight.
    async fn run_stage(&mut self, stage: Arc<dyn Stage>) -> Option<bool> {
        self.in_flight = Some(Arc::clone(&stage));
        let mut work = stage.start();
        let ok = loop {
            tokio::select! {
                ok = &mut work => break ok,
                msg = self.rx.recv(), if self.inbox_open => match msg {
                    Some(msg) => self.handle(msg),
                    None => self.inbox_open = false,
                },
            }
        };
        self.in_flight = None;
        if self.view.state.is_terminal() {
            tracing::debug!(job_id = %self.view.job_id, ok, "stage returned after the job closed");
            return None;
        }
        Some(ok)
    }

    /// Settle pause and resume between stages. Returns whether the job
    /// should keep running.
    async fn at_boundary(&mut self) -> bool {
        loop {
            if let Some(reason) = self.pending_fault.take() {
                self.fault(reason);
                return false;
            }
            match self.view.state {
                JobState::Running => return true,
                JobState::Pausing => {
                    if let Err(err) =
                        self.transition(JobState::Paused, "paused at stage boundary", None, None)
                    {
                        self.fault(err.to_string());
                        return false;
                    }
                }
                JobState::Paused => match self.rx.recv().await {
                    Some(msg) => self.handle(msg),
                    None => {
                        tracing::warn!(job_id = %self.view.job_id, "paused job abandoned");
                        return false;
                    }
                },
                JobState::Resuming => {
                    if let Some(stage) = self.stages.get(self.view.stage_index) {
                        stage.resume();
                    }
                    if let Err(err) = self.transition(JobState::Running, "resumed", None, None) {
                        self.fault(err.to_string());
                        return false;
                    }
                }
                JobState::Exiting => {
                    self.fault("job stopped before it could close".to_string());
                    return false;
                }
                JobState::Pending | JobState::Closed => return false,
            }
        }
    }

    fn handle(&mut self, msg: Message) {
        match msg {
            Message::Admit(slot) => {
                tracing::debug!(job_id = %self.view.job_id, "late admission returned");
                drop(slot);
            }
            Message::Control {
                request,
                client_token,
                reply,
            } => {
                let result = self.control(request, client_token);
                let _ = reply.send(result);
            }
        }
    }

    fn control(
        &mut self,
        request: Request,
        client_token: Option<String>,
    ) -> Result<JobState, JobError> {
        // Start goes through admission, never through here.
        let next = match next_state(self.view.state, request) {
            Some(next) if request != Request::Start && self.view.fault.is_none() => next,
            _ => {
                return Err(JobError::InvalidTransition {
                    job_id: self.view.job_id.clone(),
                    state: self.view.state,
                    request,
                });
            }
        };

        let written = match request {
            Request::Pause => {
                let written = self.transition(next, "pause requested", client_token, None);
                if written.is_ok()
                    && let Some(stage) = &self.in_flight
                {
                    stage.pause();
                }
                written
            }
            Request::Resume => self.transition(next, "resume requested", client_token, None),
            Request::Cancel => {
                if let Some(stage) = &self.in_flight {
                    stage.cancel();
                }
                self.transition(next, "cancel requested", client_token.clone(), None)
                    .and_then(|_| self.close(JobReturnCode::Cancelled, client_token))
            }
            Request::Start => Ok(()),
        };

        match written {
            Ok(()) => Ok(self.view.state),
            Err(err) => {
                tracing::warn!(
                    job_id = %self.view.job_id,
                    %request,
                    "control write failed: {}",
                    err
                );
                self.pending_fault = Some(err.to_string());
                Err(err.into())
            }
        }
    }

    fn stage_failed(&mut self, stage: &str) {
        let job_id = self.view.job_id.clone();
        tracing::warn!(job_id = %job_id, stage = %stage, "stage failed");

        let traceback = format!(
            "stage {} ({} of {}) of job {} reported failure",
            stage,
            self.view.stage_index + 1,
            self.stages.len(),
            job_id
        );
        let error = ErrorRecord::new(Ulid::new().to_string(), ErrorSeverity::Bad, traceback)
            .for_job(&job_id);
        let notice = ServerUpdateRecord::new(
            self.clock.now(),
            ServerUpdateType::Job,
            JobUpdateSubtype::StageError,
            format!("stage {stage} failed"),
        )
        .for_job(&job_id);

        let outcome = self
            .db
            .set_entry(&error, SetMode::Insert)
            .and_then(|_| self.db.set_entry(&notice, SetMode::Insert))
            .and_then(|_| {
                self.transition(
                    JobState::Exiting,
                    "stage failed",
                    None,
                    Some(error.error_id.clone()),
                )
            })
            .and_then(|_| self.close(JobReturnCode::Failed, None));
        if let Err(err) = outcome {
            self.fault(err.to_string());
        }
    }

    /// Abandon the job after a failed durable write. The closing updates are
    /// best effort; the in-memory state only follows what was written.
    fn fault(&mut self, reason: String) {
        tracing::error!(job_id = %self.view.job_id, %reason, "job faulted");
        self.view.fault = Some(reason);
        self.view.result = Some(JobReturnCode::Failed);
        if self.view.state.can_transition_to(JobState::Exiting) {
            let _ = self.transition(JobState::Exiting, "faulted", None, None);
        }
        if self.view.state == JobState::Exiting {
            let _ = self.transition(JobState::Closed, "closed: Failed", None, None);
        }
        self.slot = None;
        self.publish();
    }

    fn close(
        &mut self,
        code: JobReturnCode,
        client_token: Option<String>,
    ) -> Result<(), StoreError> {
        let previous = self.view.result.replace(code);
        let comment = format!("closed: {code}");
        if let Err(err) = self.transition(JobState::Closed, &comment, client_token, None) {
            self.view.result = previous;
            return Err(err);
        }
        tracing::info!(job_id = %self.view.job_id, result = %code, "job closed");
        Ok(())
    }

    /// Append the update, then commit the state. Nothing changes in memory
    /// when the write fails.
    fn transition(
        &mut self,
        next: JobState,
        comment: &str,
        client_token: Option<String>,
        error_id: Option<String>,
    ) -> Result<(), StoreError> {
        let mut record = JobUpdateRecord::new(&self.view.job_id, self.clock.now(), next, comment);
        record.client_token = client_token;
        record.error_id = error_id;
        self.db.set_entry(&record, SetMode::Insert)?;

        let previous = self.view.state;
        self.view.state = next;
        if next.is_terminal() {
            self.view.current_stage = None;
            // A stage still in flight keeps the slot until it returns.
            if self.in_flight.is_none() {
                self.slot = None;
            }
        }
        self.publish();
        let _ = self.updates.send(record);
        tracing::info!(job_id = %self.view.job_id, from = %previous, to = %next, "job transition");
        Ok(())
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.view.clone());
    }
}
