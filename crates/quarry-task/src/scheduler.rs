//! The per-session task table and the execution unit that runs each task.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use futures_util::FutureExt;
use parking_lot::Mutex;
use quarry_model::{BoxError, MessageLog, TaskId};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::{AsyncTask, TaskConfig, TaskError, TaskInfo, TaskMonitor, TaskOutcome, TaskState};

/// Process-wide task id counter. Ids are never reused.
static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Runs and tracks the async tasks of one session.
///
/// The scheduler never awaits the work itself: [`submit`](Self::submit)
/// spawns it on the injected runtime and returns at once. The task table
/// and the in-flight counter are the only shared state; the table lock is
/// never held while work runs.
pub struct TaskScheduler {
    config: TaskConfig,
    runtime: Handle,
    tasks: Mutex<HashMap<TaskId, Arc<AsyncTask>>>,
    in_flight: Arc<AtomicUsize>,
    log: Arc<MessageLog>,
}

impl TaskScheduler {
    /// Creates a scheduler that spawns work on `runtime` and reports task
    /// failures to `log`.
    pub fn new(config: TaskConfig, runtime: Handle, log: Arc<MessageLog>) -> Self {
        Self {
            config: config.validated(),
            runtime,
            tasks: Mutex::new(HashMap::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            log,
        }
    }

    /// Starts `work` in the background and returns its task immediately.
    ///
    /// The work receives a [`TaskMonitor`] for progress and cancellation.
    /// Its error type only has to convert into a boxed error; the error is
    /// stored on the task as text and recorded as a session message.
    pub fn submit<F, Fut, E>(&self, name: impl Into<String>, work: F) -> Arc<AsyncTask>
    where
        F: FnOnce(TaskMonitor) -> Fut + Send + 'static,
        Fut: Future<Output = Result<TaskOutcome, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let id = TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed));
        let task = Arc::new(AsyncTask::new(id, name.into()));
        self.tasks.lock().insert(id, Arc::clone(&task));

        task.mark_running();
        let unit = ExecutionUnit {
            task: Arc::clone(&task),
            in_flight: Arc::clone(&self.in_flight),
            query_limit: self.config.query_limit,
            log: Arc::clone(&self.log),
        };
        let handle = self.runtime.spawn(unit.run(work));
        task.attach(handle);

        debug!(task_id = %id, name = task.name(), "async task submitted");
        task
    }

    /// Returns the task's current snapshot.
    ///
    /// The running flag is recomputed from the live tokio task. A task
    /// that is no longer running is evicted when `remove_on_finish` is set,
    /// so the next poll of the same id fails with
    /// [`TaskError::NotFound`].
    pub fn poll(&self, id: TaskId, remove_on_finish: bool) -> Result<TaskInfo, TaskError> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get(&id).ok_or(TaskError::NotFound(id))?;

        if !task.is_running() && !task.state().is_terminal() {
            // The worker is gone without recording an outcome (runtime shut
            // down under it).
            task.fail(
                TaskState::Failed,
                TaskError::Failed("execution unit stopped unexpectedly".into()),
            );
        }

        let info = task.info();
        if remove_on_finish && !info.running {
            tasks.remove(&id);
            debug!(task_id = %id, "finished task removed");
        }
        Ok(info)
    }

    /// Requests cooperative cancellation. Returns once the flag is raised;
    /// the work decides when to stop.
    pub fn cancel(&self, id: TaskId) -> Result<(), TaskError> {
        let task = self
            .tasks
            .lock()
            .get(&id)
            .cloned()
            .ok_or(TaskError::NotFound(id))?;
        task.request_cancel();
        info!(task_id = %id, "async task cancellation requested");
        Ok(())
    }

    /// Requests cancellation of every task that is still running.
    pub fn cancel_all(&self) {
        let tasks: Vec<_> = self.tasks.lock().values().cloned().collect();
        for task in tasks.iter().filter(|t| !t.state().is_terminal()) {
            task.request_cancel();
        }
    }

    /// Looks a task up without touching its state.
    pub fn task(&self, id: TaskId) -> Option<Arc<AsyncTask>> {
        self.tasks.lock().get(&id).cloned()
    }

    /// Number of tasks whose work is executing right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Number of tasks in the table (running or not yet drained).
    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }
}

// ---------------------------------------------------------------------------
// Execution unit
// ---------------------------------------------------------------------------

/// Everything the spawned tokio task needs, moved into it at submit time.
struct ExecutionUnit {
    task: Arc<AsyncTask>,
    in_flight: Arc<AtomicUsize>,
    query_limit: Option<usize>,
    log: Arc<MessageLog>,
}

impl ExecutionUnit {
    async fn run<F, Fut, E>(self, work: F)
    where
        F: FnOnce(TaskMonitor) -> Fut + Send + 'static,
        Fut: Future<Output = Result<TaskOutcome, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let slot = InFlightSlot::enter(&self.in_flight);
        let id = self.task.id();

        if let Some(limit) = self.query_limit {
            if slot.count > limit {
                let err = TaskError::QuotaExceeded {
                    limit,
                    in_flight: slot.count,
                };
                warn!(task_id = %id, limit, in_flight = slot.count, "async task rejected by quota");
                self.log.push_error(&err);
                self.task.fail(TaskState::Failed, err);
                return;
            }
        }

        if self.task.is_cancel_requested() {
            info!(task_id = %id, "async task cancelled before start");
            self.task.fail(TaskState::Cancelled, TaskError::Cancelled);
            return;
        }

        let monitor = TaskMonitor::new(Arc::clone(&self.task));
        // Calling `work` inside the async block keeps a panic in the
        // closure itself within `catch_unwind`.
        let outcome = AssertUnwindSafe(async move { work(monitor).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(outcome)) => {
                self.task.finish(outcome);
                info!(task_id = %id, "async task finished");
            }
            Ok(Err(err)) => {
                let err: BoxError = err.into();
                if self.task.is_cancel_requested() {
                    info!(task_id = %id, error = %err, "async task cancelled");
                    self.task.fail(TaskState::Cancelled, TaskError::Cancelled);
                } else {
                    warn!(task_id = %id, error = %err, "async task failed");
                    self.log.push_error(&*err);
                    self.task.fail(TaskState::Failed, TaskError::Failed(err.to_string()));
                }
            }
            Err(panic) => {
                let err = TaskError::Panicked(panic_message(panic.as_ref()));
                warn!(task_id = %id, error = %err, "async task panicked");
                self.log.push_error(&err);
                self.task.fail(TaskState::Failed, err);
            }
        }
        // `slot` drops here and releases the in-flight count.
    }
}

/// Holds one unit of the in-flight counter for as long as it lives.
struct InFlightSlot<'a> {
    counter: &'a AtomicUsize,
    /// The counter value right after this slot was taken.
    count: usize,
}

impl<'a> InFlightSlot<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let count = counter.fetch_add(1, Ordering::AcqRel) + 1;
        Self { counter, count }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Extracts the text of a panic payload (`&str` or `String`).
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_slot_releases_on_drop() {
        let counter = AtomicUsize::new(0);
        {
            let a = InFlightSlot::enter(&counter);
            let b = InFlightSlot::enter(&counter);
            assert_eq!(a.count, 1);
            assert_eq!(b.count, 2);
        }
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_panic_message_reads_str_and_string() {
        let s: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(s.as_ref()), "boom");
        let s: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(s.as_ref()), "bang");
        let s: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(s.as_ref()), "unknown panic");
    }
}
