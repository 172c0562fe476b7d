// src/task/context.rs

//! Cancellation-aware execution context handed to task bodies.
//!
//! A [`Context`] bundles a [`CancellationToken`] with a [`tracing::Span`].
//! Deriving a child context ([`Context::child`]) creates a child token, so
//! cancelling a parent cascades to every descendant. Step bodies receive a
//! descendant of the job-instance context and are expected to observe it at
//! their suspension points.

use tokio_util::sync::CancellationToken;
use tracing::Span;

#[derive(Clone, Debug)]
pub struct Context {
    cancel: CancellationToken,
    span: Span,
}

impl Context {
    /// Root context with a fresh cancellation token.
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            span: Span::current(),
        }
    }

    /// Derive a context whose token is a child of this one.
    ///
    /// Cancelling `self` cancels the child; cancelling the child leaves
    /// `self` untouched.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            span: self.span.clone(),
        }
    }

    /// Replace the span carried by this context.
    ///
    /// This is the supported way for context enrichers to attach per-step
    /// logging scope. Enrichers must preserve the cancellation lineage:
    /// returning a context whose token is detached from the instance root
    /// breaks job-wide cancellation.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Signal cancellation to this context and all children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once this context (or an ancestor) is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
