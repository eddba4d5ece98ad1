//! Cancelable task substrate shared by every sync run.
//!
//! A run observes two signals: the caller's token and an internal abort
//! token raised by the first fatal error. The abort token is a child of the
//! caller's token, so checking it covers both.

use crate::error::{BatchResult, FailedObject, SyncError, SyncResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type ErrorHook = Box<dyn Fn(&SyncError) + Send + Sync>;

#[derive(Default)]
struct TaskState {
    error: Option<SyncError>,
    failed: Vec<FailedObject>,
}

/// State of one sync run: cancellation, first fatal error and the
/// recoverable failures collected so far.
pub struct SyncTask {
    user: CancellationToken,
    abort: CancellationToken,
    state: Mutex<TaskState>,
    on_error: Option<ErrorHook>,
}

impl SyncTask {
    /// Creates a task observing the caller's token.
    pub fn new(user: CancellationToken) -> Self {
        let abort = user.child_token();
        Self {
            user,
            abort,
            state: Mutex::new(TaskState::default()),
            on_error: None,
        }
    }

    /// Sets a hook invoked once, when the first error is recorded.
    pub fn with_error_hook(mut self, hook: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    /// Token canceled when either the caller cancels or the run aborts.
    pub fn token(&self) -> &CancellationToken {
        &self.abort
    }

    /// Returns true if the caller canceled or the run aborted.
    pub fn is_canceled(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Fails with [`SyncError::Canceled`] if the run should stop.
    pub fn check_canceled(&self) -> SyncResult<()> {
        if self.is_canceled() {
            Err(SyncError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Records a fatal error and aborts the run.
    ///
    /// Only the first error is kept; later calls still abort but leave the
    /// recorded error untouched.
    pub fn set_error(&self, error: SyncError) {
        {
            let mut state = self.state.lock();
            if state.error.is_some() {
                debug!(%error, "ignoring error after abort");
                return;
            }
            warn!(%error, "sync run aborted");
            state.error = Some(error.clone());
        }
        self.abort.cancel();
        if let Some(hook) = &self.on_error {
            hook(&error);
        }
    }

    /// Records a recoverable failure. The run continues.
    pub fn add_failed_object(&self, failed: FailedObject) {
        debug!(id = %failed.id, error = %failed.error, "object failed");
        self.state.lock().failed.push(failed);
    }

    /// Returns true if a fatal error was recorded.
    pub fn has_error(&self) -> bool {
        self.state.lock().error.is_some()
    }

    /// Number of recoverable failures recorded so far.
    pub fn failed_count(&self) -> usize {
        self.state.lock().failed.len()
    }

    /// Produces the run result, draining the recorded state.
    pub fn finish(&self) -> BatchResult {
        let state = std::mem::take(&mut *self.state.lock());
        match state.error {
            Some(error) if error.is_canceled() => Err(SyncError::Canceled),
            Some(error) => Err(error),
            None if self.user.is_cancelled() => Err(SyncError::Canceled),
            None => Ok(state.failed),
        }
    }
}

impl std::fmt::Debug for SyncTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncTask")
            .field("canceled", &self.is_canceled())
            .field("has_error", &self.has_error())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ObjectError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use wscache_protocol::{ClientError, RemoteId};

    fn failed(id: &str) -> FailedObject {
        FailedObject::new(
            RemoteId::parse("S.C", id),
            id,
            ObjectError::DependencyNotSynced,
        )
    }

    #[test]
    fn success_with_failed_objects() {
        let task = SyncTask::new(CancellationToken::new());
        task.add_failed_object(failed("A"));
        task.add_failed_object(failed("B"));

        assert!(!task.is_canceled());
        let failed = task.finish().unwrap();
        assert_eq!(failed.len(), 2);
    }

    #[test]
    fn first_error_wins() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let task = SyncTask::new(CancellationToken::new()).with_error_hook(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        task.set_error(SyncError::Network(ClientError::connection("first")));
        task.set_error(SyncError::Internal("second".into()));

        assert!(task.is_canceled());
        assert!(task.check_canceled().is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match task.finish() {
            Err(SyncError::Network(err)) => assert_eq!(err.message, "first"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn user_cancel_is_distinct() {
        let user = CancellationToken::new();
        let task = SyncTask::new(user.clone());
        task.add_failed_object(failed("A"));

        user.cancel();
        assert!(task.is_canceled());
        assert!(matches!(task.finish(), Err(SyncError::Canceled)));
    }

    #[test]
    fn abort_does_not_cancel_caller() {
        let user = CancellationToken::new();
        let task = SyncTask::new(user.clone());
        task.set_error(SyncError::Internal("boom".into()));

        assert!(task.token().is_cancelled());
        assert!(!user.is_cancelled());
    }

    #[test]
    fn canceled_request_reports_canceled() {
        let task = SyncTask::new(CancellationToken::new());
        task.set_error(SyncError::Network(ClientError::canceled()));
        assert!(matches!(task.finish(), Err(SyncError::Canceled)));
    }
}
