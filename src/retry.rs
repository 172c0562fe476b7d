// src/retry.rs

//! Retry driver wrapped around a step body.
//!
//! The driver runs attempt 1, consults the policy on each failure, and
//! sleeps interruptibly between attempts. Panicking attempts are converted
//! to errors before the policy sees them, so retries cover panics the same
//! way they cover returned errors.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::task::{guard_panic, Context, TaskError};

/// Decides whether a failed attempt should be re-run and how long to sleep
/// before doing so.
///
/// Policies may be stateful (`&mut self`); the job layer constructs a fresh
/// policy value for every step invocation site, so state is never shared
/// across steps or across job instances.
pub trait RetryPolicy: Send {
    fn should_retry(&mut self, err: &TaskError) -> bool;
    fn sleep_interval(&mut self) -> Duration;
}

/// Summary of the retries performed for one step invocation.
///
/// `count` is the number of re-attempts: a step that fails `k` times and
/// then succeeds reports `count == k` (total attempts `k + 1`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub count: u32,
    pub last_error: Option<String>,
}

pub(crate) async fn run_with_retry<T, F, Fut>(
    ctx: &Context,
    mut policy: Box<dyn RetryPolicy>,
    report: &mut RetryReport,
    mut attempt: F,
) -> Result<T, TaskError>
where
    F: FnMut(Context) -> Fut,
    Fut: Future<Output = Result<T, TaskError>> + Send,
{
    loop {
        let err = match guard_panic(attempt(ctx.clone())).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if ctx.is_cancelled() {
            debug!(error = %err, "context canceled; not retrying");
            return Err(err);
        }
        if !policy.should_retry(&err) {
            debug!(retries = report.count, error = %err, "retry policy declined; giving up");
            return Err(err);
        }

        report.count += 1;
        report.last_error = Some(err.to_string());
        warn!(retry = report.count, error = %err, "attempt failed; retrying");

        tokio::select! {
            _ = tokio::time::sleep(policy.sleep_interval()) => {}
            _ = ctx.cancelled() => return Err(err),
        }
    }
}
