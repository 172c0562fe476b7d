// src/job/definition.rs

//! Job templates: a named, typed set of steps plus their dependency graph.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::errors::JobError;
use crate::graph::{DotEdgeSpec, Graph};
use crate::job::instance::{InstanceCell, JobInstance, StepInstance, StepInstanceMeta, StepInstanceSet};
use crate::job::step::{ErasedStep, StepDefinition, StepDefinitionMeta, StepKind, StepMeta};
use crate::task::{Context, Task};

/// Name of the synthetic root step present in every job definition.
pub const ROOT_STEP_NAME: &str = "root";

pub(crate) struct StepTable {
    pub(crate) order: Vec<String>,
    pub(crate) steps: HashMap<String, Arc<ErasedStep>>,
    pub(crate) graph: Graph<Arc<ErasedStep>>,
}

fn definition_edge_spec(from: &Arc<ErasedStep>, to: &Arc<ErasedStep>) -> DotEdgeSpec {
    DotEdgeSpec {
        from: from.meta.name.clone(),
        to: to.meta.name.clone(),
        tooltip: format!("{} -> {}", from.meta.name, to.meta.name),
        style: "solid".to_string(),
        color: "black".to_string(),
    }
}

struct DefinitionInner {
    name: String,
    sealed: AtomicBool,
    root: Arc<ErasedStep>,
    table: Mutex<StepTable>,
}

/// Typed template describing a job's steps and dependencies.
///
/// Cheap to clone; all clones share the same underlying definition. Steps
/// may be added until the definition is sealed, which happens explicitly
/// via [`JobDefinition::seal`] or implicitly on the first
/// [`JobDefinition::start`]. A sealed definition is immutable and can be
/// started concurrently from any number of threads.
pub struct JobDefinition<P> {
    inner: Arc<DefinitionInner>,
    _input: PhantomData<fn() -> P>,
}

impl<P> Clone for JobDefinition<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _input: PhantomData,
        }
    }
}

impl<P> fmt::Debug for JobDefinition<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("name", &self.inner.name)
            .field("sealed", &self.inner.sealed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl<P> JobDefinition<P>
where
    P: Send + Sync + 'static,
{
    /// Create a definition with a synthetic root step of type `P`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let root_meta = Arc::new(StepMeta {
            name: ROOT_STEP_NAME.to_string(),
            kind: StepKind::Root,
            depends_on: Vec::new(),
        });
        let root = Arc::new(ErasedStep {
            meta: root_meta,
            factory: None,
        });

        let mut graph = Graph::new(definition_edge_spec);
        // The graph is empty; the only possible error is a duplicate.
        let _ = graph.add_node(Arc::clone(&root));

        let mut steps = HashMap::new();
        steps.insert(ROOT_STEP_NAME.to_string(), Arc::clone(&root));

        Self {
            inner: Arc::new(DefinitionInner {
                name,
                sealed: AtomicBool::new(false),
                root,
                table: Mutex::new(StepTable {
                    order: vec![ROOT_STEP_NAME.to_string()],
                    steps,
                    graph,
                }),
            }),
            _input: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Opaque handle to the root step.
    pub fn root_step(&self) -> Arc<dyn StepDefinitionMeta> {
        Arc::clone(&self.inner.root) as Arc<dyn StepDefinitionMeta>
    }

    /// Strongly typed handle to the root step, consumable by `step_after`.
    pub fn root_step_typed(&self) -> StepDefinition<P> {
        StepDefinition::new(Arc::clone(&self.inner.root.meta))
    }

    /// Whether the definition has been sealed.
    pub fn sealed(&self) -> bool {
        self.inner.sealed.load(Ordering::Acquire)
    }

    /// Seal the definition, making it read-only. Idempotent.
    pub fn seal(&self) {
        if !self.inner.sealed.swap(true, Ordering::AcqRel) {
            debug!(job = %self.inner.name, "sealing job definition");
            // Builders only reference already-added steps, so the graph is
            // acyclic by construction.
            debug_assert!(self.inner.table.lock().graph.is_acyclic());
        }
    }

    /// Render the definition graph (no execution data).
    pub fn visualize(&self) -> String {
        let table = self.inner.table.lock();
        table.graph.to_dot(&self.inner.name)
    }

    /// Seal the definition (on first call) and start a new instance bound
    /// to `input`.
    ///
    /// Returns only after every step instance has been materialized; the
    /// instance's steps are already running when this returns.
    pub fn start(&self, ctx: &Context, input: P) -> Result<JobInstance<P>, JobError> {
        self.seal();

        let instance_ctx = ctx.child();
        let table = self.inner.table.lock();

        let mut set = StepInstanceSet::new();
        let mut graph = Graph::new(crate::job::instance::instance_edge_spec);

        // Root first: a task that immediately yields the input value.
        let root_task = Task::start(&instance_ctx, move |_ctx| async move { Ok(input) });
        let root_instance: Arc<dyn StepInstanceMeta> = Arc::new(StepInstance::new(
            Arc::clone(&self.inner.root.meta),
            Arc::new(InstanceCell::new()),
            root_task,
        ));
        graph
            .add_node(Arc::clone(&root_instance))
            .map_err(|_| JobError::DuplicateStep(ROOT_STEP_NAME.to_string()))?;
        set.insert(root_instance);

        // Remaining steps in insertion order, which is a topological order
        // because builders only reference already-added predecessors.
        for name in &table.order {
            if name == ROOT_STEP_NAME {
                continue;
            }
            let erased = match table.steps.get(name) {
                Some(erased) => erased,
                None => return Err(JobError::StepNotFound(name.clone())),
            };
            let factory = match &erased.factory {
                Some(factory) => factory,
                None => continue,
            };

            let instance = factory(&instance_ctx, &set)?;
            graph
                .add_node(Arc::clone(&instance))
                .map_err(|_| JobError::DuplicateStep(name.clone()))?;
            for dep in instance.depends_on() {
                graph
                    .connect(dep, name)
                    .map_err(|_| JobError::StepNotFound(dep.clone()))?;
            }
            set.insert(instance);
        }

        info!(
            job = %self.inner.name,
            steps = set.len(),
            "job instance started"
        );

        Ok(JobInstance::new(
            self.inner.name.clone(),
            instance_ctx,
            set,
            graph,
        ))
    }
}

impl<P> JobDefinition<P> {
    /// Register a fully built step. Fails if the definition is sealed or
    /// the name collides.
    pub(crate) fn register(&self, step: Arc<ErasedStep>) -> Result<(), JobError> {
        let mut table = self.inner.table.lock();
        // Re-check under the lock: `start` seals before taking the lock,
        // so a builder racing a first `start` cannot slip a step in.
        if self.inner.sealed.load(Ordering::Acquire) {
            return Err(JobError::JobSealed(self.inner.name.clone()));
        }

        // Validate before mutating so a failed registration leaves the
        // table untouched.
        let name = step.meta.name.clone();
        if table.steps.contains_key(&name) {
            return Err(JobError::DuplicateStep(name));
        }
        for dep in &step.meta.depends_on {
            if !table.steps.contains_key(dep) {
                return Err(JobError::StepNotFound(dep.clone()));
            }
        }

        table
            .graph
            .add_node(Arc::clone(&step))
            .map_err(|_| JobError::DuplicateStep(name.clone()))?;
        for dep in &step.meta.depends_on {
            table
                .graph
                .connect(dep, &name)
                .map_err(|_| JobError::StepNotFound(dep.clone()))?;
        }
        table.steps.insert(name.clone(), step);
        table.order.push(name);
        Ok(())
    }

    /// Verify that `step` is the very step registered in this definition
    /// under its name (not a same-named handle from another job).
    pub(crate) fn ensure_member<T>(&self, step: &StepDefinition<T>) -> Result<(), JobError> {
        let table = self.inner.table.lock();
        match table.steps.get(step.name()) {
            Some(existing) if Arc::ptr_eq(&existing.meta, &step.meta) => Ok(()),
            _ => Err(JobError::StepNotFound(step.name().to_string())),
        }
    }
}
