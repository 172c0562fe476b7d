// src/job/builder.rs

//! Typed step builders.
//!
//! Each builder registers a step definition, wires its dependency edges,
//! and captures an instance factory that materializes the step at start
//! time. The factory resolves the typed parent tasks from the instance set
//! and starts the instrumented body through the matching combinator:
//! `Task::start` for no-input steps, `continue_with` for one data parent,
//! `after_both` for two.
//!
//! The instrumented body gates on every declared predecessor with
//! `wait_all`, applies context enrichment, drives retries, and records
//! state and timing on the step instance.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn, Instrument};

use crate::errors::JobError;
use crate::job::definition::{JobDefinition, ROOT_STEP_NAME};
use crate::job::instance::{InstanceCell, StepInstance, StepInstanceMeta, StepInstanceSet};
use crate::job::step::{
    ErasedStep, ExecutionOptions, InstanceFactory, StepDefinition, StepKind, StepMeta, StepOptions,
};
use crate::retry::{run_with_retry, RetryReport};
use crate::task::{
    after_both, continue_with, guard_panic, wait_all, Context, Task, TaskError, Waitable,
};

impl<P> JobDefinition<P>
where
    P: Send + Sync + 'static,
{
    /// Add a step with no data input.
    ///
    /// Unless `options` declares dependencies via `execute_after`, the step
    /// is gated on the root step so it cannot start before the instance
    /// does.
    pub fn add_step<T, F, Fut>(
        &self,
        name: &str,
        step_fn: F,
        options: StepOptions,
    ) -> Result<StepDefinition<T>, JobError>
    where
        T: Send + Sync + 'static,
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let StepOptions {
            execution,
            extra_deps,
        } = options;

        let mut depends_on = dedup(extra_deps);
        if depends_on.is_empty() {
            depends_on.push(ROOT_STEP_NAME.to_string());
        }

        let meta = Arc::new(StepMeta {
            name: name.to_string(),
            kind: StepKind::Task,
            depends_on,
        });
        let step_fn = Arc::new(step_fn);

        let factory: InstanceFactory = {
            let meta = Arc::clone(&meta);
            Box::new(move |ctx: &Context, set: &StepInstanceSet| {
                let ordering = set.waitables(&meta.depends_on)?;
                let cell = Arc::new(InstanceCell::new());

                let step_fn = Arc::clone(&step_fn);
                let execution = execution.clone();
                let step_name = meta.name.clone();
                let body_cell = Arc::clone(&cell);
                let task = Task::start(ctx, move |ctx| async move {
                    run_instrumented(step_name, body_cell, execution, ordering, ctx, move |ctx| {
                        let step_fn = Arc::clone(&step_fn);
                        async move { step_fn(ctx).await.map_err(TaskError::from) }
                    })
                    .await
                });

                Ok(Arc::new(StepInstance::new(Arc::clone(&meta), cell, task))
                    as Arc<dyn StepInstanceMeta>)
            })
        };

        self.register(Arc::new(ErasedStep {
            meta: Arc::clone(&meta),
            factory: Some(factory),
        }))?;
        debug!(job = %self.name(), step = %name, "step added");
        Ok(StepDefinition::new(meta))
    }

    /// Add a step consuming the job input.
    pub fn step_from_input<T, F, Fut>(
        &self,
        name: &str,
        step_fn: F,
        options: StepOptions,
    ) -> Result<StepDefinition<T>, JobError>
    where
        T: Send + Sync + 'static,
        F: Fn(Context, Arc<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let root = self.root_step_typed();
        self.step_with_parent(name, StepKind::InputParam, &root, step_fn, options)
    }

    /// Add a step after a preceding step, consuming its output.
    pub fn step_after<T, S, F, Fut>(
        &self,
        name: &str,
        parent: &StepDefinition<T>,
        step_fn: F,
        options: StepOptions,
    ) -> Result<StepDefinition<S>, JobError>
    where
        T: Send + Sync + 'static,
        S: Send + Sync + 'static,
        F: Fn(Context, Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        self.step_with_parent(name, StepKind::Task, parent, step_fn, options)
    }

    /// Add a step after two preceding steps, consuming both outputs.
    ///
    /// Fan-in beyond two data parents is expressed by promoting the extra
    /// predecessors to ordering-only dependencies with
    /// [`StepOptions::execute_after`].
    pub fn step_after_both<T, S, R, F, Fut>(
        &self,
        name: &str,
        first: &StepDefinition<T>,
        second: &StepDefinition<S>,
        step_fn: F,
        options: StepOptions,
    ) -> Result<StepDefinition<R>, JobError>
    where
        T: Send + Sync + 'static,
        S: Send + Sync + 'static,
        R: Send + Sync + 'static,
        F: Fn(Context, Arc<T>, Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        self.ensure_member(first)?;
        self.ensure_member(second)?;
        let StepOptions {
            execution,
            extra_deps,
        } = options;

        let mut depends_on = vec![first.name().to_string(), second.name().to_string()];
        depends_on.extend(extra_deps);
        let depends_on = dedup(depends_on);

        let meta = Arc::new(StepMeta {
            name: name.to_string(),
            kind: StepKind::Task,
            depends_on,
        });
        let first_name = first.name().to_string();
        let second_name = second.name().to_string();
        let step_fn = Arc::new(step_fn);

        let factory: InstanceFactory = {
            let meta = Arc::clone(&meta);
            Box::new(move |ctx: &Context, set: &StepInstanceSet| {
                let ordering = set.waitables(&meta.depends_on)?;
                let first_task = set.typed_task::<T>(&first_name)?;
                let second_task = set.typed_task::<S>(&second_name)?;
                let cell = Arc::new(InstanceCell::new());

                let step_fn = Arc::clone(&step_fn);
                let execution = execution.clone();
                let step_name = meta.name.clone();
                let body_cell = Arc::clone(&cell);
                let task = after_both(
                    ctx,
                    &first_task,
                    &second_task,
                    move |ctx, a: Arc<T>, b: Arc<S>| async move {
                        run_instrumented(
                            step_name,
                            body_cell,
                            execution,
                            ordering,
                            ctx,
                            move |ctx| {
                                let step_fn = Arc::clone(&step_fn);
                                let a = Arc::clone(&a);
                                let b = Arc::clone(&b);
                                async move { step_fn(ctx, a, b).await.map_err(TaskError::from) }
                            },
                        )
                        .await
                    },
                );

                Ok(Arc::new(StepInstance::new(Arc::clone(&meta), cell, task))
                    as Arc<dyn StepInstanceMeta>)
            })
        };

        self.register(Arc::new(ErasedStep {
            meta: Arc::clone(&meta),
            factory: Some(factory),
        }))?;
        debug!(job = %self.name(), step = %name, "step added");
        Ok(StepDefinition::new(meta))
    }

    fn step_with_parent<T, S, F, Fut>(
        &self,
        name: &str,
        kind: StepKind,
        parent: &StepDefinition<T>,
        step_fn: F,
        options: StepOptions,
    ) -> Result<StepDefinition<S>, JobError>
    where
        T: Send + Sync + 'static,
        S: Send + Sync + 'static,
        F: Fn(Context, Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        self.ensure_member(parent)?;
        let StepOptions {
            execution,
            extra_deps,
        } = options;

        let mut depends_on = vec![parent.name().to_string()];
        depends_on.extend(extra_deps);
        let depends_on = dedup(depends_on);

        let meta = Arc::new(StepMeta {
            name: name.to_string(),
            kind,
            depends_on,
        });
        let parent_name = parent.name().to_string();
        let step_fn = Arc::new(step_fn);

        let factory: InstanceFactory = {
            let meta = Arc::clone(&meta);
            Box::new(move |ctx: &Context, set: &StepInstanceSet| {
                let ordering = set.waitables(&meta.depends_on)?;
                let parent_task = set.typed_task::<T>(&parent_name)?;
                let cell = Arc::new(InstanceCell::new());

                let step_fn = Arc::clone(&step_fn);
                let execution = execution.clone();
                let step_name = meta.name.clone();
                let body_cell = Arc::clone(&cell);
                let task = continue_with(ctx, &parent_task, move |ctx, value: Arc<T>| async move {
                    run_instrumented(step_name, body_cell, execution, ordering, ctx, move |ctx| {
                        let step_fn = Arc::clone(&step_fn);
                        let value = Arc::clone(&value);
                        async move { step_fn(ctx, value).await.map_err(TaskError::from) }
                    })
                    .await
                });

                Ok(Arc::new(StepInstance::new(Arc::clone(&meta), cell, task))
                    as Arc<dyn StepInstanceMeta>)
            })
        };

        self.register(Arc::new(ErasedStep {
            meta: Arc::clone(&meta),
            factory: Some(factory),
        }))?;
        debug!(job = %self.name(), step = %name, "step added");
        Ok(StepDefinition::new(meta))
    }
}

/// The body every step runs, wrapped around the user function.
async fn run_instrumented<T, F, Fut>(
    step_name: String,
    cell: Arc<InstanceCell>,
    options: ExecutionOptions,
    ordering: Vec<Arc<dyn Waitable>>,
    ctx: Context,
    attempt: F,
) -> Result<T, TaskError>
where
    F: Fn(Context) -> Fut + Send,
    Fut: Future<Output = Result<T, TaskError>> + Send,
{
    // All declared predecessors, data parents included. Data-parent
    // failures short-circuit in the combinator before this body runs, so
    // a failure observed here comes from an ordering-only dependency.
    if let Err(err) = wait_all(&ordering).await {
        debug!(step = %step_name, error = %err, "precedent failed; step body skipped");
        cell.mark_failed();
        return Err(TaskError::PrecedentFailure(Box::new(err)));
    }

    let ctx = match &options.enricher {
        Some(enrich) => enrich(ctx),
        None => ctx,
    };
    let span = ctx.span().clone();

    cell.mark_running();
    debug!(step = %step_name, "step body starting");
    let started = Instant::now();

    let result = match &options.retry_factory {
        Some(make_policy) => {
            let mut report = RetryReport::default();
            let outcome = run_with_retry(&ctx, make_policy(), &mut report, |ctx| {
                attempt(ctx).instrument(span.clone())
            })
            .await;
            cell.set_retry_report(report);
            outcome
        }
        None => guard_panic(attempt(ctx.clone()).instrument(span.clone())).await,
    };

    cell.record_duration(started.elapsed());

    match result {
        Ok(value) => {
            cell.mark_completed();
            debug!(step = %step_name, "step completed");
            Ok(value)
        }
        Err(err) => {
            cell.mark_failed();
            warn!(step = %step_name, error = %err, "step failed");
            Err(err)
        }
    }
}

fn dedup(names: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        if !out.contains(&name) {
            out.push(name);
        }
    }
    out
}
