//! Runs a [`Plan`], phase by phase.
//!
//! With a single job every step runs on the calling thread in schedule order.
//! With more jobs, steps of a phase are dispatched to a bounded rayon pool as
//! soon as all of their predecessors have completed. Either way the calling
//! thread owns every produced value: it prepares a step's inputs, hands them
//! to the worker, and commits the returned outcome, so no locking is needed.

mod diagnostics;

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::LazyLock;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use indicatif::ProgressStyle;
use rayon::ThreadPool;
use tracing::Span;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::error::RunError;
use crate::output::{GeneratedFile, GeneratorOutput};
use crate::provider::{Dynamic, ProviderId};
use crate::schedule::{Plan, Schedule, Step, StepId, StepKind};
use crate::task::{BuildContext, BuildFn, InitContext, TaskEntry, TaskInit};

pub use diagnostics::{Diagnostics, StepExecution};

static RUN_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::with_template(
        "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=>-")
});

static STEP_STYLE: LazyLock<ProgressStyle> = LazyLock::new(|| {
    ProgressStyle::with_template("{spinner:.blue} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
});

/// Everything a successful run produced.
#[derive(Debug)]
pub struct GeneratorRun {
    pub output: GeneratorOutput,
    pub diagnostics: Diagnostics,
}

/// Executes every step of `plan`. `jobs` is the number of worker threads, a
/// value of `0` or `1` runs strictly sequentially.
///
/// The first failing step aborts the run. Steps already dispatched to workers
/// are allowed to finish, but their results are discarded.
pub fn execute(plan: &Plan, jobs: usize) -> Result<GeneratorRun, RunError> {
    let pool = match jobs {
        0 | 1 => None,
        n => Some(rayon::ThreadPoolBuilder::new().num_threads(n).build()?),
    };

    let root = tracing::info_span!("generate", jobs);
    root.pb_set_length(plan.len() as u64);
    root.pb_set_style(&RUN_STYLE);
    root.pb_set_message("Running generator tasks...");
    let _enter = root.enter();

    let mut executor = Executor::new(plan);

    for schedule in plan.schedules() {
        let phase = schedule.phase().map(|p| p.name()).unwrap_or("<none>");
        let span = tracing::info_span!("phase", phase);
        let _enter = span.enter();
        tracing::info!(steps = schedule.len(), "Running phase {phase}");

        match &pool {
            Some(pool) => executor.run_parallel(pool, schedule, &root)?,
            None => executor.run_sequential(schedule, &root)?,
        }
    }

    tracing::info!(files = executor.output.len(), "Generation complete!");

    Ok(GeneratorRun {
        output: executor.output,
        diagnostics: Diagnostics {
            execution_times: executor.times,
        },
    })
}

/// Inputs of a step, prepared by the owning thread.
enum StepInput<'a> {
    Init(Vec<(&'a str, ProviderId, Option<Dynamic>)>),
    Build(Option<BuildFn>),
}

enum StepOutcome {
    Init(TaskInit),
    Build {
        files: Vec<GeneratedFile>,
        output: Option<Dynamic>,
    },
}

struct Executor<'a> {
    plan: &'a Plan,
    exports: HashMap<(usize, ProviderId), Dynamic>,
    outputs: HashMap<usize, Dynamic>,
    builds: HashMap<usize, BuildFn>,
    output: GeneratorOutput,
    times: HashMap<StepId, StepExecution>,
}

impl<'a> Executor<'a> {
    fn new(plan: &'a Plan) -> Self {
        Self {
            plan,
            exports: HashMap::new(),
            outputs: HashMap::new(),
            builds: HashMap::new(),
            output: GeneratorOutput::new(),
            times: HashMap::new(),
        }
    }

    fn run_sequential(&mut self, schedule: &'a Schedule, root: &Span) -> Result<(), RunError> {
        for (&step, id) in schedule.order.iter().zip(schedule.steps()) {
            let input = self.prepare(step);
            let start = Instant::now();
            let outcome = perform(&self.plan.entries[step.task], id, input);
            let duration = start.elapsed();

            self.commit(step, id, outcome?, start, duration)?;
            root.pb_inc(1);
        }

        Ok(())
    }

    /// Dispatches steps of `schedule` to `pool` while tracking how many
    /// predecessors each step still waits for. The calling thread sits in the
    /// receive loop and releases dependents as results arrive.
    fn run_parallel(
        &mut self,
        pool: &ThreadPool,
        schedule: &'a Schedule,
        root: &Span,
    ) -> Result<(), RunError> {
        let total = schedule.order.len();
        if total == 0 {
            return Ok(());
        }

        let mut dependents = vec![Vec::new(); total];
        let mut waiting = vec![0usize; total];
        for (at, predecessors) in schedule.predecessors.iter().enumerate() {
            waiting[at] = predecessors.len();
            for &predecessor in predecessors {
                dependents[predecessor].push(at);
            }
        }

        let plan = self.plan;
        let (sender, receiver) =
            channel::<(usize, Result<StepOutcome, RunError>, Instant, Duration)>();

        pool.in_place_scope(|scope| -> Result<(), RunError> {
            let spawn = |executor: &mut Self, at: usize| {
                let step = schedule.order[at];
                let id = &schedule.steps()[at];
                let entry = &plan.entries[step.task];
                let input = executor.prepare(step);
                let sender = sender.clone();

                scope.spawn(move |_| {
                    let start = Instant::now();
                    let outcome = perform(entry, id, input);
                    // results arriving after an abort are dropped
                    let _ = sender.send((at, outcome, start, start.elapsed()));
                });
            };

            for at in 0..total {
                if waiting[at] == 0 {
                    spawn(self, at);
                }
            }

            let mut completed = 0;
            for (at, outcome, start, duration) in receiver.iter() {
                let step = schedule.order[at];
                self.commit(step, &schedule.steps()[at], outcome?, start, duration)?;
                completed += 1;
                root.pb_inc(1);

                if completed == total {
                    break;
                }

                for &dependent in &dependents[at] {
                    waiting[dependent] -= 1;
                    if waiting[dependent] == 0 {
                        spawn(self, dependent);
                    }
                }
            }

            Ok(())
        })
    }

    fn prepare(&mut self, step: Step) -> StepInput<'a> {
        match step.kind {
            StepKind::Init => {
                let plan = self.plan;
                let values = plan.resolved[step.task]
                    .iter()
                    .map(|resolved| {
                        let provider = resolved.dependency.provider().id();
                        let value = resolved.producer.and_then(|producer| {
                            if resolved.dependency.is_output() {
                                self.outputs.get(&producer).cloned()
                            } else {
                                self.exports.get(&(producer, provider)).cloned()
                            }
                        });
                        (resolved.key.as_str(), provider, value)
                    })
                    .collect();
                StepInput::Init(values)
            }
            StepKind::Build => StepInput::Build(self.builds.remove(&step.task)),
        }
    }

    fn commit(
        &mut self,
        step: Step,
        id: &StepId,
        outcome: StepOutcome,
        start: Instant,
        duration: Duration,
    ) -> Result<(), RunError> {
        let plan = self.plan;
        let entry = &plan.entries[step.task];
        self.times.insert(id.clone(), StepExecution { start, duration });

        match outcome {
            StepOutcome::Init(init) => {
                for (provider, value) in init.providers {
                    if !entry.exports.values().any(|export| export.provider() == &provider) {
                        return Err(RunError::UndeclaredProvider {
                            task: entry.id.clone(),
                            provider: provider.name().to_string(),
                        });
                    }
                    tracing::debug!(task = %entry.id, provider = provider.name(), "export provided");
                    self.exports.insert((step.task, provider.id()), value);
                }

                for export in entry.exports.values() {
                    if !self.exports.contains_key(&(step.task, export.provider().id())) {
                        return Err(RunError::MissingExport {
                            task: entry.id.clone(),
                            provider: export.provider().name().to_string(),
                        });
                    }
                }

                if let Some(build) = init.build {
                    self.builds.insert(step.task, build);
                }
            }
            StepOutcome::Build { files, output } => {
                self.output.extend(files)?;

                match (&entry.output, output) {
                    (Some(_), Some(value)) => {
                        self.outputs.insert(step.task, value);
                    }
                    (Some(export), None) => {
                        return Err(RunError::MissingOutput {
                            task: entry.id.clone(),
                            provider: export.provider().name().to_string(),
                        });
                    }
                    (None, _) => {}
                }
            }
        }

        Ok(())
    }
}

fn perform<'a>(entry: &'a TaskEntry, id: &StepId, input: StepInput<'a>) -> Result<StepOutcome, RunError> {
    let span = tracing::info_span!("step", step = %id);
    span.pb_set_style(&STEP_STYLE);
    span.pb_set_message(&format!("Running {id}"));
    let _enter = span.enter();

    // A panicking task only owns the inputs it was handed, so nothing shared
    // can be left half-updated.
    let result = panic::catch_unwind(AssertUnwindSafe(|| match input {
        StepInput::Init(values) => {
            let ctx = InitContext {
                task: &entry.id,
                values,
            };
            (entry.run)(&ctx).map(StepOutcome::Init)
        }
        StepInput::Build(build) => {
            let output = entry.output.as_ref().map(|export| export.provider().id());
            let mut ctx = BuildContext::new(&entry.id, output);
            if let Some(build) = build {
                build(&mut ctx)?;
            }
            Ok(StepOutcome::Build {
                files: ctx.files,
                output: ctx.output,
            })
        }
    }));

    match result {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(source)) => Err(RunError::Step {
            step: id.clone(),
            source,
        }),
        Err(payload) => {
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                String::from("unknown payload")
            };
            Err(RunError::Panicked {
                step: id.clone(),
                message,
            })
        }
    }
}
