//! Single-slot-per-kind job registry

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::background::{BackgroundExecution, NoBackground};
use super::context::JobContext;
use super::{JobError, JobEvent, JobHandle, JobKind, JobOutcome, JobOutput, JobStatus};
use crate::error::PreconditionViolation;

struct JobSlot {
    handle: JobHandle,
    status: JobStatus,
    cancel_tx: watch::Sender<bool>,
    cancel_requested: bool,
    task: JoinHandle<()>,
}

/// Starts jobs on spawned tasks and tracks them until their completion
/// has been delivered
///
/// At most one job of each `JobKind` exists at a time. A slot is freed by
/// `complete`, which the owner calls after handling the `Completed` event.
pub struct JobRunner {
    events_tx: mpsc::UnboundedSender<JobEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<JobEvent>>,
    slots: HashMap<JobKind, JobSlot>,
    background: Arc<dyn BackgroundExecution>,
}

impl JobRunner {
    pub fn new() -> Self {
        Self::with_background(Arc::new(NoBackground))
    }

    pub fn with_background(background: Arc<dyn BackgroundExecution>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx: Some(events_rx),
            slots: HashMap::new(),
            background,
        }
    }

    /// Runner together with its event receiver
    pub fn with_receiver(
        background: Arc<dyn BackgroundExecution>,
    ) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let runner = Self {
            events_tx,
            events_rx: None,
            slots: HashMap::new(),
            background,
        };
        (runner, events_rx)
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<JobEvent>> {
        self.events_rx.take()
    }

    /// Start `work` on a new task
    ///
    /// Rejects a second job of the same kind; nothing is queued.
    pub fn start<F, Fut>(
        &mut self,
        kind: JobKind,
        work: F,
    ) -> Result<JobHandle, PreconditionViolation>
    where
        F: FnOnce(JobContext) -> Fut,
        Fut: Future<Output = Result<JobOutput, JobError>> + Send + 'static,
    {
        if self.slots.contains_key(&kind) {
            return Err(PreconditionViolation::JobInFlight(kind));
        }

        let handle = JobHandle::new(kind);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = JobContext::new(handle, self.events_tx.clone(), cancel_rx);

        let resume_tx = self.events_tx.clone();
        self.background.register_background_completion_handler(
            handle.id,
            Box::new(move || {
                let _ = resume_tx.send(JobEvent::Resumed { handle });
            }),
        );

        let fut = work(ctx.clone());
        let task = tokio::spawn(run_job(ctx, self.events_tx.clone(), fut));

        info!(job = %handle.id, kind = %kind, "Job started");
        self.slots.insert(
            kind,
            JobSlot {
                handle,
                status: JobStatus::Pending,
                cancel_tx,
                cancel_requested: false,
                task,
            },
        );
        Ok(handle)
    }

    /// Request cancellation
    ///
    /// Best effort: the job still delivers exactly one `Completed`, which
    /// may be `Succeeded` if the work had passed its point of no return.
    /// Returns false when the job is unknown or already terminal.
    pub fn cancel(&mut self, handle: JobHandle) -> bool {
        let Some(slot) = self.slot_mut(handle) else {
            return false;
        };
        if slot.status.is_terminal() {
            return false;
        }
        if !slot.cancel_requested {
            slot.cancel_requested = true;
            let _ = slot.cancel_tx.send(true);
            info!(job = %handle.id, kind = %handle.kind, "Cancellation requested");
        }
        true
    }

    /// Record what an event says about its job's status
    pub fn observe(&mut self, event: &JobEvent) {
        let handle = event.handle();
        let Some(slot) = self.slot_mut(handle) else {
            debug!(job = %handle.id, "Event for a job that is no longer tracked");
            return;
        };
        match event {
            JobEvent::Progress {
                fraction, message, ..
            } => {
                if !slot.status.is_terminal() {
                    slot.status = JobStatus::Running {
                        progress: *fraction,
                        message: message.clone(),
                    };
                }
            }
            JobEvent::Completed { outcome, .. } => slot.status = outcome.status(),
            JobEvent::Resumed { .. } => {}
        }
    }

    /// Free the slot once the job's completion has been handled
    pub fn complete(&mut self, handle: JobHandle) {
        if self.slot_mut(handle).is_some() {
            self.slots.remove(&handle.kind);
            self.background.release(handle.id);
            debug!(job = %handle.id, kind = %handle.kind, "Job slot released");
        }
    }

    /// The job of `kind` that has not yet been completed, if any
    pub fn in_flight(&self, kind: JobKind) -> Option<JobHandle> {
        self.slots.get(&kind).map(|slot| slot.handle)
    }

    pub fn any_in_flight(&self) -> bool {
        !self.slots.is_empty()
    }

    pub fn status(&self, handle: JobHandle) -> Option<JobStatus> {
        self.slots
            .get(&handle.kind)
            .filter(|slot| slot.handle == handle)
            .map(|slot| slot.status.clone())
    }

    pub fn cancel_requested(&self, handle: JobHandle) -> bool {
        self.slots
            .get(&handle.kind)
            .filter(|slot| slot.handle == handle)
            .is_some_and(|slot| slot.cancel_requested)
    }

    fn slot_mut(&mut self, handle: JobHandle) -> Option<&mut JobSlot> {
        self.slots
            .get_mut(&handle.kind)
            .filter(|slot| slot.handle == handle)
    }
}

impl Default for JobRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for JobRunner {
    fn drop(&mut self) {
        for slot in self.slots.values() {
            slot.task.abort();
        }
    }
}

/// Drive one job to its single terminal event
async fn run_job<Fut>(ctx: JobContext, events: mpsc::UnboundedSender<JobEvent>, work: Fut)
where
    Fut: Future<Output = Result<JobOutput, JobError>> + Send + 'static,
{
    let handle = ctx.handle();

    let guarded = AssertUnwindSafe(work).catch_unwind();
    let result = tokio::select! {
        biased;
        _ = ctx.cancelled_before_commit() => Err(JobError::Cancelled),
        result = guarded => match result {
            Ok(result) => result,
            Err(_) => Err(JobError::Aborted("job task panicked".to_string())),
        },
    };

    let outcome = JobOutcome::from_result(result);
    match &outcome {
        JobOutcome::Succeeded(_) => {
            info!(job = %handle.id, kind = %handle.kind, "Job succeeded");
            let _ = events.send(JobEvent::Progress {
                handle,
                fraction: 1.0,
                message: "Completed".to_string(),
            });
        }
        JobOutcome::Failed(e) => {
            warn!(job = %handle.id, kind = %handle.kind, error = %e, "Job failed")
        }
        JobOutcome::Cancelled => info!(job = %handle.id, kind = %handle.kind, "Job cancelled"),
    }

    let _ = events.send(JobEvent::Completed { handle, outcome });
}
