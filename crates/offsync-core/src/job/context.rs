//! Handle given to a job's work future

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use super::{JobError, JobEvent, JobHandle};

/// What a running job can see of its surroundings
///
/// Cancellation is cooperative. The work calls `checkpoint` between steps
/// and `commit` once it reaches its point of no return; after a successful
/// `commit` a cancel request can no longer change the outcome.
#[derive(Debug, Clone)]
pub struct JobContext {
    handle: JobHandle,
    events: mpsc::UnboundedSender<JobEvent>,
    cancel_rx: watch::Receiver<bool>,
    committed: Arc<AtomicBool>,
}

impl JobContext {
    pub(crate) fn new(
        handle: JobHandle,
        events: mpsc::UnboundedSender<JobEvent>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            handle,
            events,
            cancel_rx,
            committed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn handle(&self) -> JobHandle {
        self.handle
    }

    /// Report progress in `0.0..=1.0`
    pub fn report(&self, fraction: f32, message: impl Into<String>) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let _ = self.events.send(JobEvent::Progress {
            handle: self.handle,
            fraction,
            message: message.into(),
        });
    }

    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// Stop here if a cancel request is pending and the job has not committed
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_cancel_requested() && !self.is_committed() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    /// Pass the point of no return
    ///
    /// Fails with `Cancelled` if a cancel request arrived first.
    pub fn commit(&self) -> Result<(), JobError> {
        self.checkpoint()?;
        self.committed.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Resolves once a cancel request arrives before `commit`
    ///
    /// Never resolves for a committed job.
    pub(crate) async fn cancelled_before_commit(&self) {
        let mut rx = self.cancel_rx.clone();
        loop {
            if *rx.borrow_and_update() && !self.is_committed() {
                return;
            }
            if rx.changed().await.is_err() {
                // Runner dropped the slot; nobody can cancel any more
                std::future::pending::<()>().await;
            }
        }
    }
}
