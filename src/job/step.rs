// src/job/step.rs

//! Step metadata, typed definition handles, and per-step options.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::errors::JobError;
use crate::graph::{DotNodeSpec, GraphNode};
use crate::job::instance::{StepInstanceMeta, StepInstanceSet};
use crate::retry::RetryPolicy;
use crate::task::Context;

/// What a step node represents in the job graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// The synthetic root step whose result is the job input.
    Root,
    /// A regular computation step.
    Task,
    /// A projection of the job input (created by `step_from_input`).
    InputParam,
}

/// Immutable step metadata shared between the definition and its instances.
#[derive(Debug)]
pub(crate) struct StepMeta {
    pub(crate) name: String,
    pub(crate) kind: StepKind,
    /// Predecessor step names in declaration order: data parents first,
    /// then ordering-only dependencies.
    pub(crate) depends_on: Vec<String>,
}

pub(crate) type RetryFactory = Arc<dyn Fn() -> Box<dyn RetryPolicy> + Send + Sync>;
pub(crate) type ContextEnricher = Arc<dyn Fn(Context) -> Context + Send + Sync>;

/// Behavioral options applied to a step's instrumented body.
#[derive(Clone, Default)]
pub(crate) struct ExecutionOptions {
    pub(crate) retry_factory: Option<RetryFactory>,
    pub(crate) enricher: Option<ContextEnricher>,
}

/// Options accepted by every step builder.
///
/// Chainable in the builder style:
///
/// `StepOptions::new().with_retry(|| policy).execute_after(&other_step)`
#[derive(Clone, Default)]
pub struct StepOptions {
    pub(crate) execution: ExecutionOptions,
    pub(crate) extra_deps: Vec<String>,
}

impl StepOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a retry policy.
    ///
    /// `factory` is invoked once per step instantiation so that every job
    /// instance gets a fresh, unshared policy value.
    pub fn with_retry<P, F>(mut self, factory: F) -> Self
    where
        P: RetryPolicy + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        self.execution.retry_factory = Some(Arc::new(move || Box::new(factory())));
        self
    }

    /// Wrap the context visible to the step body.
    ///
    /// The enricher must preserve the cancellation lineage: replace the
    /// span or wrap values, never detach the token.
    pub fn with_context_enrichment<F>(mut self, enricher: F) -> Self
    where
        F: Fn(Context) -> Context + Send + Sync + 'static,
    {
        self.execution.enricher = Some(Arc::new(enricher));
        self
    }

    /// Declare an ordering-only dependency: the new step starts after
    /// `step` succeeded but consumes none of its output. A failure of
    /// `step` fails the new step with a precedent-failure error.
    pub fn execute_after<T>(mut self, step: &StepDefinition<T>) -> Self {
        self.extra_deps.push(step.name().to_string());
        self
    }
}

impl fmt::Debug for StepOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepOptions")
            .field("retry", &self.execution.retry_factory.is_some())
            .field("enricher", &self.execution.enricher.is_some())
            .field("extra_deps", &self.extra_deps)
            .finish()
    }
}

/// Typed handle to a step inside a job definition.
///
/// Handles are cheap to clone and are how downstream builders reference
/// their data parents: only type-compatible successors compile.
pub struct StepDefinition<T> {
    pub(crate) meta: Arc<StepMeta>,
    _output: PhantomData<fn() -> T>,
}

impl<T> Clone for StepDefinition<T> {
    fn clone(&self) -> Self {
        Self {
            meta: Arc::clone(&self.meta),
            _output: PhantomData,
        }
    }
}

impl<T> fmt::Debug for StepDefinition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.meta.name)
            .field("kind", &self.meta.kind)
            .field("depends_on", &self.meta.depends_on)
            .finish()
    }
}

impl<T> StepDefinition<T> {
    pub(crate) fn new(meta: Arc<StepMeta>) -> Self {
        Self {
            meta,
            _output: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn kind(&self) -> StepKind {
        self.meta.kind
    }

    pub fn depends_on(&self) -> &[String] {
        &self.meta.depends_on
    }
}

/// Read-only view of a step definition, independent of its output type.
pub trait StepDefinitionMeta: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> StepKind;
    fn depends_on(&self) -> &[String];
}

/// Materializes one step at job-instance start time.
///
/// The factory resolves predecessor instances from the (already populated)
/// set, re-asserts the typed parent task handles, and starts the
/// instrumented body through the appropriate combinator.
pub(crate) type InstanceFactory = Box<
    dyn Fn(&Context, &StepInstanceSet) -> Result<Arc<dyn StepInstanceMeta>, JobError>
        + Send
        + Sync,
>;

/// Type-erased step entry stored by the job definition.
pub(crate) struct ErasedStep {
    pub(crate) meta: Arc<StepMeta>,
    /// `None` only for the root step, which the job instance materializes
    /// directly from the input value.
    pub(crate) factory: Option<InstanceFactory>,
}

impl StepDefinitionMeta for ErasedStep {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn kind(&self) -> StepKind {
        self.meta.kind
    }

    fn depends_on(&self) -> &[String] {
        &self.meta.depends_on
    }
}

impl GraphNode for Arc<ErasedStep> {
    fn id(&self) -> &str {
        &self.meta.name
    }

    fn dot_spec(&self) -> DotNodeSpec {
        let (shape, style, fill_color) = match self.meta.kind {
            StepKind::Root => ("ellipse", "filled", "lightgray"),
            StepKind::InputParam => ("note", "filled", "lightyellow"),
            StepKind::Task => ("box", "rounded,filled", "white"),
        };
        DotNodeSpec {
            id: self.meta.name.clone(),
            name: self.meta.name.clone(),
            tooltip: format!("kind={:?}", self.meta.kind),
            shape: shape.to_string(),
            style: style.to_string(),
            fill_color: fill_color.to_string(),
        }
    }
}
