//! The task record shared between the scheduler, its worker and pollers.

use std::sync::Arc;

use parking_lot::Mutex;
use quarry_model::{ProgressMonitor, TaskId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::TaskError;

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// Lifecycle state of an [`AsyncTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl TaskState {
    /// `true` for Finished, Failed and Cancelled. Terminal states are sticky.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }
}

// ---------------------------------------------------------------------------
// TaskOutcome
// ---------------------------------------------------------------------------

/// What a successful unit of work produces.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskOutcome {
    pub result: Option<Value>,
    pub extended_result: Option<Value>,
}

impl TaskOutcome {
    pub fn new(result: impl Into<Value>) -> Self {
        Self {
            result: Some(result.into()),
            extended_result: None,
        }
    }

    pub fn with_extended(mut self, extended: impl Into<Value>) -> Self {
        self.extended_result = Some(extended.into());
        self
    }
}

// ---------------------------------------------------------------------------
// TaskInfo
// ---------------------------------------------------------------------------

/// Snapshot of a task, as returned to a polling client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInfo {
    pub id: TaskId,
    pub name: String,
    pub running: bool,
    pub state: TaskState,
    pub status: Option<String>,
    pub error: Option<String>,
    pub result: Option<Value>,
    pub extended_result: Option<Value>,
}

// ---------------------------------------------------------------------------
// AsyncTask
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Progress {
    status: Option<String>,
    error: Option<TaskError>,
    outcome: TaskOutcome,
}

/// One submitted unit of work.
///
/// Shared as `Arc<AsyncTask>` between the scheduler table, the tokio task
/// running the work, and whoever polls it. The state lives in a `watch`
/// channel so waiters wake when it turns terminal; everything else sits
/// behind a short-lived mutex.
#[derive(Debug)]
pub struct AsyncTask {
    id: TaskId,
    name: String,
    /// Current state. Terminal states are never left; `wait` subscribes
    /// here.
    state: watch::Sender<TaskState>,
    /// Flips to `true` once on cancel. Work observes it through
    /// `TaskMonitor`.
    cancel: watch::Sender<bool>,
    /// Status text, error and result. Written together with a state change
    /// while the state lock is held, so take the state first.
    progress: Mutex<Progress>,
    /// The tokio task running the work. `None` between spawn and attach.
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncTask {
    pub(crate) fn new(id: TaskId, name: String) -> Self {
        Self {
            id,
            name,
            state: watch::Sender::new(TaskState::Created),
            cancel: watch::Sender::new(false),
            progress: Mutex::new(Progress {
                status: None,
                error: None,
                outcome: TaskOutcome::default(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    pub fn status(&self) -> Option<String> {
        self.progress.lock().status.clone()
    }

    /// The error recorded when the task ended Failed or Cancelled.
    pub fn error(&self) -> Option<TaskError> {
        self.progress.lock().error.clone()
    }

    pub fn outcome(&self) -> TaskOutcome {
        self.progress.lock().outcome.clone()
    }

    /// `true` once cancellation has been requested.
    pub fn is_cancel_requested(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Waits until the task reaches a terminal state and returns it.
    pub async fn wait(&self) -> TaskState {
        let mut rx = self.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            // The sender lives in `self`, so the channel cannot close while
            // we borrow it.
            Err(_) => self.state(),
        }
    }

    /// `true` while the work has not reached a terminal state and its tokio
    /// task is still alive.
    pub fn is_running(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        match self.handle.lock().as_ref() {
            Some(handle) => !handle.is_finished(),
            // Not attached yet: the worker was just spawned.
            None => true,
        }
    }

    pub fn info(&self) -> TaskInfo {
        let running = self.is_running();
        let state = self.state();
        let progress = self.progress.lock();
        TaskInfo {
            id: self.id,
            name: self.name.clone(),
            running,
            state,
            status: progress.status.clone(),
            error: progress.error.as_ref().map(ToString::to_string),
            result: progress.outcome.result.clone(),
            extended_result: progress.outcome.extended_result.clone(),
        }
    }

    // -- Transitions (scheduler and worker only) ----------------------------

    pub(crate) fn attach(&self, handle: JoinHandle<()>) {
        *self.handle.lock() = Some(handle);
    }

    pub(crate) fn request_cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub(crate) fn set_status(&self, status: &str) {
        self.progress.lock().status = Some(status.to_string());
    }

    pub(crate) fn mark_running(&self) {
        self.transition(TaskState::Running, |_| {});
    }

    pub(crate) fn finish(&self, outcome: TaskOutcome) {
        self.transition(TaskState::Finished, |progress| {
            progress.outcome = outcome;
            progress.status = Some("Finished".to_string());
        });
    }

    pub(crate) fn fail(&self, state: TaskState, error: TaskError) {
        self.transition(state, |progress| progress.error = Some(error));
    }

    /// Moves to `next` unless the task is already terminal. `record` runs
    /// only when the move happens, under the state lock, so a terminal
    /// task never picks up a late result or error.
    ///
    /// Lock order: state, then progress.
    fn transition(&self, next: TaskState, record: impl FnOnce(&mut Progress)) {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            record(&mut self.progress.lock());
            *state = next;
            true
        });
    }

    /// Resolves once cancellation is requested.
    async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

// ---------------------------------------------------------------------------
// TaskMonitor
// ---------------------------------------------------------------------------

/// Handed to the unit of work. Progress notes become the task's status
/// text; the work checks [`is_cancelled`](ProgressMonitor::is_cancelled) or
/// awaits [`cancelled`](TaskMonitor::cancelled) to stop early.
#[derive(Debug, Clone)]
pub struct TaskMonitor {
    task: Arc<AsyncTask>,
}

impl TaskMonitor {
    pub(crate) fn new(task: Arc<AsyncTask>) -> Self {
        Self { task }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.id
    }

    /// Resolves once the task has been cancelled. Meant for `tokio::select!`
    /// next to the real work.
    pub async fn cancelled(&self) {
        self.task.cancelled().await;
    }
}

impl ProgressMonitor for TaskMonitor {
    fn begin_task(&self, name: &str) {
        self.task.set_status(name);
    }

    fn is_cancelled(&self) -> bool {
        self.task.is_cancel_requested()
    }
}
