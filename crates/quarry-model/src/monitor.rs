//! Progress reporting for long-running operations.

/// Receives progress notes from a long operation (connect, async task).
///
/// Implementations decide where the text goes: the session monitor appends
/// it to the message log, a task monitor stores it as the task's status.
/// `Send + Sync` because the operation may run on any tokio worker.
pub trait ProgressMonitor: Send + Sync {
    /// A new top-level step started.
    fn begin_task(&self, name: &str);

    /// A sub-step of the current task started.
    fn sub_task(&self, name: &str) {
        self.begin_task(name);
    }

    /// `true` once the operation has been asked to stop.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A monitor that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMonitor;

impl ProgressMonitor for NullMonitor {
    fn begin_task(&self, _name: &str) {}
}
