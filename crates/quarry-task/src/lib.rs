//! Background async tasks for Quarry sessions.
//!
//! A session hands long operations (query execution, metadata reads) to a
//! [`TaskScheduler`]. Each submission becomes an [`AsyncTask`] running on
//! its own tokio task; the request that submitted it returns immediately
//! and later requests poll or cancel it by [`TaskId`](quarry_model::TaskId).
//!
//! # Lifecycle
//!
//! ```text
//! Created ──submit──→ Running ──→ Finished
//!                        ├──────→ Failed     (error, panic, quota)
//!                        └──────→ Cancelled  (cooperative)
//! ```
//!
//! Terminal states never change. A terminal task stays in the table until a
//! poll with `remove_on_finish` evicts it.
//!
//! # Cancellation
//!
//! Cancellation is advisory: [`TaskScheduler::cancel`] raises a flag the
//! work observes through its [`TaskMonitor`]. Nothing is aborted.

mod config;
mod error;
mod scheduler;
mod task;

pub use config::TaskConfig;
pub use error::TaskError;
pub use scheduler::TaskScheduler;
pub use task::{AsyncTask, TaskInfo, TaskMonitor, TaskOutcome, TaskState};
