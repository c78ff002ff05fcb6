//! Platform background-execution hook
//!
//! Mobile platforms may suspend the process mid-transfer. The runner
//! registers a continuation for every job so the platform can wake the
//! coordination loop when the transfer finishes in the background.

use super::JobId;

/// Called by the platform when a backgrounded job's transfer finishes
pub type CompletionHandler = Box<dyn FnOnce() + Send + 'static>;

/// OS-level background continuation, supplied by the embedding application
pub trait BackgroundExecution: Send + Sync {
    /// Keep `job` alive while backgrounded and invoke `handler` on resume
    fn register_background_completion_handler(&self, job: JobId, handler: CompletionHandler);

    /// The job's completion was delivered; drop its continuation
    fn release(&self, job: JobId);
}

/// For processes that are never suspended (CLI, tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackground;

impl BackgroundExecution for NoBackground {
    fn register_background_completion_handler(&self, _job: JobId, _handler: CompletionHandler) {}

    fn release(&self, _job: JobId) {}
}
