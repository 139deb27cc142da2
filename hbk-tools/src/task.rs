use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Error};

/// Cancellation and logging handle threaded through every long-running
/// operation.
///
/// Iterations over contents, blobs or indexes call [`check_abort`] at
/// least once per step, so a user-initiated stop takes effect promptly
/// even in the middle of a maintenance run.
///
/// [`check_abort`]: TaskContext::check_abort
pub trait TaskContext: Send + Sync {
    /// If the task should be aborted, this fails with a cancellation
    /// error.
    fn check_abort(&self) -> Result<(), Error>;

    /// Create a log message for this task.
    fn log(&self, level: log::Level, message: &std::fmt::Arguments);
}

/// Convenience implementation:
impl<T: TaskContext + ?Sized> TaskContext for Arc<T> {
    fn check_abort(&self) -> Result<(), Error> {
        <T as TaskContext>::check_abort(self)
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        <T as TaskContext>::log(self, level, message)
    }
}

/// Marker error produced by aborted tasks, so callers can tell a
/// cancellation from a timeout or a real failure.
#[derive(Debug)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("task cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Whether `err` is (or wraps) a task cancellation.
pub fn is_cancelled(err: &Error) -> bool {
    err.downcast_ref::<Cancelled>().is_some()
}

/// Simple [TaskContext] backed by an atomic abort flag, logging through
/// the global `log` facade with a fixed correlation id.
pub struct SimpleTask {
    id: String,
    abort: AtomicBool,
}

impl SimpleTask {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            abort: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

impl TaskContext for SimpleTask {
    fn check_abort(&self) -> Result<(), Error> {
        if self.abort.load(Ordering::SeqCst) {
            bail!(Cancelled);
        }
        Ok(())
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        log::log!(level, "[{}] {}", self.id, message);
    }
}

#[macro_export]
macro_rules! task_error {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::TaskContext::log(&*$task, log::Level::Error, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_warn {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::TaskContext::log(&*$task, log::Level::Warn, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_log {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::TaskContext::log(&*$task, log::Level::Info, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_debug {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::TaskContext::log(&*$task, log::Level::Debug, &format_args!($($fmt)+))
    }};
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn abort_flag() {
        let task = SimpleTask::new("test");
        assert!(task.check_abort().is_ok());
        task.request_abort();
        let err = task.check_abort().unwrap_err();
        assert!(is_cancelled(&err));
    }
}
