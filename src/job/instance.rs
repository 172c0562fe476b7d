// src/job/instance.rs

//! Runtime counterparts of a job definition: step instances and the job
//! instance that owns them.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;

use crate::errors::JobError;
use crate::graph::{DotEdgeSpec, DotNodeSpec, Graph, GraphNode};
use crate::job::step::{StepDefinition, StepKind, StepMeta};
use crate::retry::RetryReport;
use crate::task::{Context, Task, TaskState, Waitable};

/// Observable state of a step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Not yet started: waiting on predecessors (or not yet scheduled).
    Pending,
    /// The step body is executing.
    Running,
    Completed,
    Failed,
}

/// Timing and retry information recorded while a step runs.
#[derive(Debug, Clone, Default)]
pub struct ExecutionData {
    /// Set iff the step body was invoked.
    pub start_time: Option<Instant>,
    pub duration: Duration,
    /// Present iff the step carries a retry policy.
    pub retried: Option<RetryReport>,
}

/// Mutable per-instance step state, written only by the step's own worker.
///
/// Readers outside the worker only observe it after the underlying task
/// reached a terminal state, which gives the required publication edge.
pub(crate) struct InstanceCell {
    marked: Mutex<Option<StepState>>,
    execution: Mutex<ExecutionData>,
}

impl InstanceCell {
    pub(crate) fn new() -> Self {
        Self {
            marked: Mutex::new(None),
            execution: Mutex::new(ExecutionData::default()),
        }
    }

    pub(crate) fn mark_running(&self) {
        *self.marked.lock() = Some(StepState::Running);
        self.execution.lock().start_time = Some(Instant::now());
    }

    pub(crate) fn mark_completed(&self) {
        *self.marked.lock() = Some(StepState::Completed);
    }

    pub(crate) fn mark_failed(&self) {
        *self.marked.lock() = Some(StepState::Failed);
    }

    pub(crate) fn record_duration(&self, duration: Duration) {
        self.execution.lock().duration = duration;
    }

    pub(crate) fn set_retry_report(&self, report: RetryReport) {
        self.execution.lock().retried = Some(report);
    }

    fn marked_state(&self) -> Option<StepState> {
        *self.marked.lock()
    }

    fn execution_data(&self) -> ExecutionData {
        self.execution.lock().clone()
    }
}

/// Runtime counterpart of a [`StepDefinition`], bound to one job instance.
pub struct StepInstance<T> {
    meta: Arc<StepMeta>,
    cell: Arc<InstanceCell>,
    task: Task<T>,
}

impl<T> fmt::Debug for StepInstance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepInstance")
            .field("name", &self.meta.name)
            .field("state", &self.state_impl())
            .finish_non_exhaustive()
    }
}

impl<T> StepInstance<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(meta: Arc<StepMeta>, cell: Arc<InstanceCell>, task: Task<T>) -> Self {
        Self { meta, cell, task }
    }

    pub(crate) fn typed_task(&self) -> Task<T> {
        self.task.clone()
    }
}

impl<T> StepInstance<T> {
    /// Consistent state on both execution paths: explicit terminal marks
    /// from the instrumented body win; otherwise the state is derived from
    /// the underlying task (which covers combinator short-circuits, where
    /// the body never ran).
    fn state_impl(&self) -> StepState {
        let marked = self.cell.marked_state();
        if let Some(state @ (StepState::Completed | StepState::Failed)) = marked {
            return state;
        }
        match self.task.state() {
            TaskState::Completed => StepState::Completed,
            TaskState::Failed | TaskState::Canceled => StepState::Failed,
            TaskState::Created | TaskState::Running => match marked {
                Some(StepState::Running) => StepState::Running,
                _ => StepState::Pending,
            },
        }
    }
}

/// Read-only view of a step instance, independent of its output type.
pub trait StepInstanceMeta: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> StepKind;
    fn depends_on(&self) -> &[String];
    fn state(&self) -> StepState;
    /// Snapshot of the timing/retry data recorded so far.
    fn execution_data(&self) -> ExecutionData;
    /// Type-erased handle to the underlying task.
    fn waitable(&self) -> Arc<dyn Waitable>;
    fn as_any(&self) -> &dyn Any;
}

impl<T> StepInstanceMeta for StepInstance<T>
where
    T: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn kind(&self) -> StepKind {
        self.meta.kind
    }

    fn depends_on(&self) -> &[String] {
        &self.meta.depends_on
    }

    fn state(&self) -> StepState {
        self.state_impl()
    }

    fn execution_data(&self) -> ExecutionData {
        self.cell.execution_data()
    }

    fn waitable(&self) -> Arc<dyn Waitable> {
        Arc::new(self.task.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl GraphNode for Arc<dyn StepInstanceMeta> {
    fn id(&self) -> &str {
        self.name()
    }

    fn dot_spec(&self) -> DotNodeSpec {
        let state = self.state();
        let execution = self.execution_data();
        let retries = execution.retried.as_ref().map(|r| r.count).unwrap_or(0);
        let fill_color = match state {
            StepState::Pending => "lightgray",
            StepState::Running => "gold",
            StepState::Completed => "palegreen",
            StepState::Failed => "lightcoral",
        };
        let shape = match self.kind() {
            StepKind::Root => "ellipse",
            StepKind::InputParam => "note",
            StepKind::Task => "box",
        };
        DotNodeSpec {
            id: self.name().to_string(),
            name: self.name().to_string(),
            tooltip: format!(
                "state={:?} duration={:?} retries={}",
                state, execution.duration, retries
            ),
            shape: shape.to_string(),
            style: "filled".to_string(),
            fill_color: fill_color.to_string(),
        }
    }
}

pub(crate) fn instance_edge_spec(
    from: &Arc<dyn StepInstanceMeta>,
    to: &Arc<dyn StepInstanceMeta>,
) -> DotEdgeSpec {
    let color = if from.state() == StepState::Failed {
        "red"
    } else {
        "black"
    };
    DotEdgeSpec {
        from: from.name().to_string(),
        to: to.name().to_string(),
        tooltip: format!("{} -> {}", from.name(), to.name()),
        style: "solid".to_string(),
        color: color.to_string(),
    }
}

/// Name-keyed step instances in materialization (insertion) order.
pub(crate) struct StepInstanceSet {
    order: Vec<String>,
    map: HashMap<String, Arc<dyn StepInstanceMeta>>,
}

impl StepInstanceSet {
    pub(crate) fn new() -> Self {
        Self {
            order: Vec::new(),
            map: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, instance: Arc<dyn StepInstanceMeta>) {
        self.order.push(instance.name().to_string());
        self.map.insert(instance.name().to_string(), instance);
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Arc<dyn StepInstanceMeta>> {
        self.map.get(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<dyn StepInstanceMeta>> {
        self.order.iter().filter_map(move |name| self.map.get(name))
    }

    /// Type-erased task handles for the named predecessors.
    pub(crate) fn waitables(&self, names: &[String]) -> Result<Vec<Arc<dyn Waitable>>, JobError> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .map(|instance| instance.waitable())
                    .ok_or_else(|| JobError::StepNotFound(name.clone()))
            })
            .collect()
    }

    /// Recover the typed task of a previously materialized step.
    ///
    /// The definition's type parameters fix the concrete type, so the
    /// downcast only fails if the set was built from a different job
    /// definition, which the builders prevent.
    pub(crate) fn typed_task<T>(&self, name: &str) -> Result<Task<T>, JobError>
    where
        T: Send + Sync + 'static,
    {
        self.get(name)
            .and_then(|instance| instance.as_any().downcast_ref::<StepInstance<T>>())
            .map(StepInstance::typed_task)
            .ok_or_else(|| JobError::StepNotFound(name.to_string()))
    }
}

/// One execution of a job definition, bound to a specific input.
///
/// Created by [`JobDefinition::start`]; by the time it is returned, every
/// step instance has been materialized and started.
///
/// [`JobDefinition::start`]: crate::job::JobDefinition::start
pub struct JobInstance<P> {
    job_name: String,
    ctx: Context,
    steps: StepInstanceSet,
    graph: Graph<Arc<dyn StepInstanceMeta>>,
    _input: PhantomData<fn() -> P>,
}

impl<P> fmt::Debug for JobInstance<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobInstance")
            .field("job", &self.job_name)
            .field("steps", &self.steps.len())
            .finish_non_exhaustive()
    }
}

impl<P> JobInstance<P>
where
    P: Send + Sync + 'static,
{
    pub(crate) fn new(
        job_name: String,
        ctx: Context,
        steps: StepInstanceSet,
        graph: Graph<Arc<dyn StepInstanceMeta>>,
    ) -> Self {
        Self {
            job_name,
            ctx,
            steps,
            graph,
            _input: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.job_name
    }

    /// Await every step instance.
    ///
    /// Returns `Ok(())` iff all steps completed successfully; otherwise the
    /// first failure **in step-insertion order**, for deterministic
    /// reporting when siblings fail concurrently. Idempotent: results are
    /// memoized, so repeated calls return the same outcome. Cancel-safe.
    pub async fn wait(&self) -> Result<(), JobError> {
        let mut first: Option<JobError> = None;
        for instance in self.steps.iter() {
            if let Err(err) = instance.waitable().wait_done().await {
                if first.is_none() {
                    first = Some(JobError::from_task_error(Arc::clone(instance), err));
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Cancel the whole instance.
    ///
    /// Cascades through the instance context to every step body and retry
    /// sleep. Idempotent.
    pub fn cancel(&self) {
        info!(job = %self.job_name, "canceling job instance");
        self.ctx.cancel();
    }

    /// Render the instance graph, including per-step state, duration and
    /// retry counts.
    pub fn visualize(&self) -> String {
        self.graph.to_dot(&self.job_name)
    }

    /// Look up a step instance by name.
    pub fn step(&self, name: &str) -> Option<Arc<dyn StepInstanceMeta>> {
        self.steps.get(name).cloned()
    }

    /// Steps in materialization order.
    pub fn steps(&self) -> impl Iterator<Item = &Arc<dyn StepInstanceMeta>> {
        self.steps.iter()
    }

    /// Await the typed result of one step, identified by its definition
    /// handle.
    pub async fn result_of<T>(&self, step: &StepDefinition<T>) -> Result<Arc<T>, JobError>
    where
        T: Send + Sync + 'static,
    {
        let instance = self
            .steps
            .get(step.name())
            .cloned()
            .ok_or_else(|| JobError::StepNotFound(step.name().to_string()))?;
        let task = self.steps.typed_task::<T>(step.name())?;
        task.wait()
            .await
            .map_err(|err| JobError::from_task_error(instance, err))
    }
}
