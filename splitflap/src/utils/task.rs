//! Defines the task helpers shared by the session workers.

use tokio::task::JoinHandle;

use crate::errors::Error;

/// Represents the result of a handler or worker.
/// A callback may return either () or Result<(), Error> for flexibility which
/// will be converted to a TaskResult.
pub enum TaskResult {
    Ok,
    Err(Error),
}

/// Represents a handler to a running session worker.
pub type TaskHandler = JoinHandle<()>;

impl From<Result<(), Error>> for TaskResult {
    fn from(result: Result<(), Error>) -> Self {
        match result {
            Ok(_) => TaskResult::Ok,
            Err(e) => TaskResult::Err(e),
        }
    }
}

impl From<()> for TaskResult {
    fn from(_: ()) -> Self {
        TaskResult::Ok
    }
}

/// Checks that the caller runs inside a tokio runtime (required to spawn the session workers).
pub fn ensure_runtime() -> Result<tokio::runtime::Handle, Error> {
    tokio::runtime::Handle::try_current().map_err(|_| Error::RuntimeError)
}

#[macro_export]
macro_rules! pause {
    ($ms:expr) => {
        $crate::utils::tokio::time::sleep($crate::utils::tokio::time::Duration::from_millis($ms as u64)).await
    };
}

#[macro_export]
macro_rules! pause_sync {
    ($ms:expr) => {
        std::thread::sleep(std::time::Duration::from_millis($ms as u64))
    };
}
