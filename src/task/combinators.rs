// src/task/combinators.rs

//! Success-gated task composition.
//!
//! `continue_with` and `after_both` start a successor task whose body runs
//! only if every parent completed successfully; otherwise the successor
//! terminates with [`TaskError::PrecedentFailure`] wrapping the parent
//! error, without invoking the continuation. `wait_all` gates on an
//! arbitrary set of type-erased tasks and reports the first failure
//! immediately while the remaining tasks keep running.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};

use super::{Context, Task, TaskError};

/// Type-erased wait surface over a [`Task`].
///
/// Step instances expose their underlying task through this trait so that
/// ordering-only dependencies can be awaited without knowing the output
/// type.
pub trait Waitable: Send + Sync {
    /// Resolves when the task terminates; `Err` for failure or cancellation.
    fn wait_done(&self) -> BoxFuture<'static, Result<(), TaskError>>;
}

impl<T> Waitable for Task<T>
where
    T: Send + Sync + 'static,
{
    fn wait_done(&self) -> BoxFuture<'static, Result<(), TaskError>> {
        let task = self.clone();
        Box::pin(async move { task.wait().await.map(|_| ()) })
    }
}

/// Start a successor that consumes `parent`'s result.
///
/// If the parent fails or is canceled, `f` is not invoked and the successor
/// fails with [`TaskError::PrecedentFailure`]. The successor's own token is
/// a child of `ctx`.
pub fn continue_with<T, S, F, Fut>(ctx: &Context, parent: &Task<T>, f: F) -> Task<S>
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
    F: FnOnce(Context, Arc<T>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<S, TaskError>> + Send + 'static,
{
    let parent = parent.clone();
    Task::start(ctx, move |ctx| async move {
        match parent.wait().await {
            Ok(value) => f(ctx, value).await,
            Err(err) => Err(TaskError::PrecedentFailure(Box::new(err))),
        }
    })
}

/// Start a successor that consumes the results of two parents.
///
/// The parents run concurrently; `f` runs only once both completed
/// successfully. If either fails, the successor fails with
/// [`TaskError::PrecedentFailure`] wrapping the first observed parent error.
pub fn after_both<T, S, R, F, Fut>(
    ctx: &Context,
    first: &Task<T>,
    second: &Task<S>,
    f: F,
) -> Task<R>
where
    T: Send + Sync + 'static,
    S: Send + Sync + 'static,
    R: Send + Sync + 'static,
    F: FnOnce(Context, Arc<T>, Arc<S>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<R, TaskError>> + Send + 'static,
{
    let first = first.clone();
    let second = second.clone();
    Task::start(ctx, move |ctx| async move {
        let (a, b) = match tokio::try_join!(first.wait(), second.wait()) {
            Ok(pair) => pair,
            Err(err) => return Err(TaskError::PrecedentFailure(Box::new(err))),
        };
        f(ctx, a, b).await
    })
}

/// Await a set of tasks; succeed iff all complete successfully.
///
/// Returns the first failure as soon as it is observed. Tasks that have not
/// yet terminated keep running independently; cancel their context to stop
/// them.
pub async fn wait_all(tasks: &[Arc<dyn Waitable>]) -> Result<(), TaskError> {
    if tasks.is_empty() {
        return Ok(());
    }
    let mut pending: FuturesUnordered<_> = tasks.iter().map(|task| task.wait_done()).collect();
    while let Some(result) = pending.next().await {
        result?;
    }
    Ok(())
}
