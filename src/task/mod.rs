// src/task/mod.rs

//! One-shot, memoized, cancelable async values.
//!
//! A [`Task`] is a cheap handle over a computation running on its own tokio
//! worker. The result is memoized: every waiter observes the same
//! `Result<Arc<T>, TaskError>`, and terminal states are sticky. Cancellation
//! goes through the task's [`Context`] token; the worker races the body
//! against it, so a cancelled body is dropped at its next suspension point.
//!
//! Combinators for success-gated continuations live in [`combinators`].

pub mod combinators;
pub mod context;

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub use combinators::{after_both, continue_with, wait_all, Waitable};
pub use context::Context;

/// Lifecycle of a task. Transitions are monotonic:
/// `Created -> Running -> (Completed | Failed | Canceled)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Canceled
        )
    }
}

/// Failure of a task body or of one of its precedents.
#[derive(Error, Debug, Clone)]
pub enum TaskError {
    #[error("task canceled")]
    Canceled,

    #[error("panic in task body: {message}")]
    PanicRecovered { message: String, backtrace: String },

    #[error("precedent task failed: {0}")]
    PrecedentFailure(#[source] Box<TaskError>),

    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl TaskError {
    pub(crate) fn failed(err: anyhow::Error) -> Self {
        TaskError::Failed(Arc::new(err))
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, TaskError::Canceled)
    }

    pub fn is_panic(&self) -> bool {
        matches!(self, TaskError::PanicRecovered { .. })
    }

    /// Innermost error after unwrapping any precedent-failure layers.
    pub fn root(&self) -> &TaskError {
        match self {
            TaskError::PrecedentFailure(inner) => inner.root(),
            other => other,
        }
    }

    /// The original user error, if this failure carries one.
    ///
    /// Callers can `downcast_ref` the returned `anyhow::Error` to recover
    /// their concrete error type.
    pub fn user_error(&self) -> Option<&anyhow::Error> {
        match self.root() {
            TaskError::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::failed(err)
    }
}

struct Shared<T> {
    cancel: CancellationToken,
    state: watch::Sender<TaskState>,
    result: OnceLock<Result<Arc<T>, TaskError>>,
}

impl<T> Shared<T> {
    /// Advance the published state. Terminal states are sticky.
    fn advance(&self, next: TaskState) {
        self.state.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Publish the terminal state matching the memoized result, if any.
    fn publish_terminal(&self) {
        let terminal = match self.result.get() {
            Some(Ok(_)) => TaskState::Completed,
            Some(Err(TaskError::Canceled)) => TaskState::Canceled,
            Some(Err(_)) => TaskState::Failed,
            None => return,
        };
        self.advance(terminal);
    }

    fn finish(&self, result: Result<Arc<T>, TaskError>) {
        // First writer wins; the published state always matches the
        // memoized result, whichever writer got there first.
        let _ = self.result.set(result);
        self.publish_terminal();
    }
}

/// Handle to a one-shot async computation yielding `Arc<T>`.
///
/// Handles are cheap to clone; all clones observe the same state and result.
pub struct Task<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T> Task<T>
where
    T: Send + Sync + 'static,
{
    /// Start `body` on a fresh worker.
    ///
    /// The body receives a child of `ctx`; cancelling `ctx` (or calling
    /// [`Task::cancel`]) drops the body at its next suspension point and
    /// terminates the task as `Canceled`. A panicking body terminates the
    /// task as `Failed` with [`TaskError::PanicRecovered`].
    pub fn start<F, Fut>(ctx: &Context, body: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, TaskError>> + Send + 'static,
    {
        let body_ctx = ctx.child();
        let (state, _) = watch::channel(TaskState::Created);
        let shared = Arc::new(Shared {
            cancel: body_ctx.token().clone(),
            state,
            result: OnceLock::new(),
        });

        let worker = Arc::clone(&shared);
        tokio::spawn(async move {
            worker.advance(TaskState::Running);
            let cancel = worker.cancel.clone();
            tokio::select! {
                outcome = guard_panic(body(body_ctx)) => {
                    worker.finish(outcome.map(Arc::new));
                }
                _ = cancel.cancelled() => {
                    debug!("task canceled; dropping body");
                    worker.finish(Err(TaskError::Canceled));
                }
            }
        });

        Self { shared }
    }

    /// Await termination and return the memoized result.
    ///
    /// Cancel-safe: dropping the returned future never alters task state,
    /// so callers may bound a wait with `tokio::select!` or `timeout`.
    /// Any number of concurrent waiters see the same result.
    pub async fn wait(&self) -> Result<Arc<T>, TaskError> {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `shared`, so this cannot observe a closed
        // channel while `self` is alive.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        match self.shared.result.get() {
            Some(result) => result.clone(),
            None => Err(TaskError::Canceled),
        }
    }

    /// Signal cancellation. Idempotent; has no effect on a terminal task.
    pub fn cancel(&self) {
        let _ = self.shared.result.set(Err(TaskError::Canceled));
        self.shared.cancel.cancel();
        self.shared.publish_terminal();
    }
}

impl<T> Task<T> {
    pub fn state(&self) -> TaskState {
        *self.shared.state.borrow()
    }
}

/// Run a future, converting an unwinding panic into
/// [`TaskError::PanicRecovered`].
///
/// Used both by the task worker and by the retry driver, so retries cover
/// panicking attempts the same way they cover returned errors.
pub(crate) async fn guard_panic<T, Fut>(fut: Fut) -> Result<T, TaskError>
where
    Fut: Future<Output = Result<T, TaskError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(payload) => Err(TaskError::PanicRecovered {
            message: panic_message(payload.as_ref()),
            backtrace: std::backtrace::Backtrace::force_capture().to_string(),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
