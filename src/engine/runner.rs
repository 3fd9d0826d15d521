use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::engine::plan::{EdgeKind, Plan};
use crate::engine::report::{Outcome, Report};
use crate::engine::{ExecOptions, UpToDate};
use crate::error::{GantryError, GraphError};
use crate::registry::Registry;
use crate::task::{SkipReason, Task, TaskContext, TaskStatus};
use crate::utils::as_overhead;

type Completion = (NodeIndex, anyhow::Result<()>, Duration);

/// Executes a plan on a worker pool.
///
/// The scheduler thread stays outside the pool:
/// 1. Tasks with no predecessors in the plan are resolved first.
/// 2. Resolving a task either settles it on the spot (skipped, up to date,
///    lifecycle) or spawns its action on the pool.
/// 3. Workers report back over a channel. Every completion decrements the
///    pending predecessor count of the task's successors, and those that reach
///    zero are resolved next.
/// 4. The loop ends when nothing is ready and nothing is in flight.
pub(crate) fn run_plan(
    registry: &Registry,
    plan: &Plan,
    policy: &dyn UpToDate,
    options: &ExecOptions,
) -> Result<Report, GantryError> {
    let graph = &plan.graph;

    let tasks: Vec<Arc<Task>> = graph
        .node_weights()
        .map(|id| {
            registry
                .get(id)
                .cloned()
                .map(Arc::new)
                .ok_or_else(|| GraphError::UnknownTask(id.clone()))
        })
        .collect::<Result<_, _>>()?;

    let mut report = Report {
        order: plan.order(),
        outcomes: HashMap::with_capacity(plan.len()),
    };

    if plan.is_empty() {
        return Ok(report);
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(options.max_concurrency.max(1))
        .thread_name(|i| format!("gantry-worker-{i}"))
        .build()?;

    let mut state = State {
        plan,
        options,
        statuses: vec![TaskStatus::Pending; graph.node_count()],
        pending: graph
            .node_indices()
            .map(|i| plan.predecessors(i).count())
            .collect(),
        ready: BinaryHeap::new(),
        aborting: false,
    };

    for &index in plan.indices() {
        state.transition(index, TaskStatus::Scheduled);
        if state.pending[index.index()] == 0 {
            state.ready.push(Reverse(index));
        }
    }

    let root_span = tracing::span!(Level::INFO, "executing_tasks");
    root_span.pb_set_length(plan.len() as u64);
    root_span.pb_set_style(&crate::utils::get_style_root().map_err(anyhow::Error::from)?);
    root_span.pb_set_message("Running tasks...");
    let _enter = root_span.enter();

    let pb_style = crate::utils::get_style_task().map_err(anyhow::Error::from)?;
    let (sender, receiver) = channel::<Completion>();
    let mut in_flight = 0usize;

    loop {
        while let Some(Reverse(index)) = state.ready.pop() {
            let task = &tasks[index.index()];

            if let Some(status) = state.resolve(index, task, policy) {
                state.settle(index, status.clone());
                report.outcomes.insert(
                    task.id.clone(),
                    Outcome {
                        status,
                        duration: Duration::ZERO,
                        error: None,
                    },
                );
                root_span.pb_inc(1);
                continue;
            }

            // Lifecycle tasks never get here, `resolve` settles them.
            let Some(action) = task.action.clone() else {
                continue;
            };

            state.transition(index, TaskStatus::Running);
            in_flight += 1;

            let id = task.id.clone();
            let sender = sender.clone();
            let pb_style = pb_style.clone();
            let parent = root_span.clone();

            pool.spawn(move || {
                let span = tracing::span!(parent: &parent, Level::INFO, "task", name = %id);
                span.pb_set_style(&pb_style);
                span.pb_set_message(&format!("Running {id}"));
                let _enter = span.enter();

                let context = TaskContext {
                    id: id.clone(),
                    span: span.clone(),
                };

                let start = Instant::now();

                // The action only sees its own context and shared immutable
                // configuration, a panic can't leave the scheduler in a bad state.
                let result = match catch_unwind(AssertUnwindSafe(|| action(&context))) {
                    Ok(result) => result,
                    Err(panic) => {
                        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                            format!("Task panicked: {s}")
                        } else if let Some(s) = panic.downcast_ref::<String>() {
                            format!("Task panicked: {s}")
                        } else {
                            String::from("Task panicked with unknown payload")
                        };

                        Err(anyhow::anyhow!(msg))
                    }
                };

                // The receiver only goes away once the scheduler gave up.
                let _ = sender.send((index, result, start.elapsed()));
            });
        }

        if in_flight == 0 {
            break;
        }

        let (index, result, duration) = receiver
            .recv()
            .map_err(|_| anyhow::anyhow!("Worker pool disconnected"))?;
        in_flight -= 1;
        root_span.pb_inc(1);

        let id = tasks[index.index()].id.clone();
        let (status, error) = match result {
            Ok(()) => {
                tracing::info!("{id} {}", as_overhead(duration));
                (TaskStatus::Succeeded, None)
            }
            Err(err) => {
                tracing::error!("{id} failed: {err:#}");
                if !options.continue_on_failure && !state.aborting {
                    tracing::warn!("Stopping dispatch after failure of '{id}'");
                    state.aborting = true;
                }
                (TaskStatus::Failed, Some(Arc::new(err)))
            }
        };

        state.settle(index, status.clone());
        report.outcomes.insert(
            id,
            Outcome {
                status,
                duration,
                error,
            },
        );
    }

    if report.is_success() {
        tracing::info!("Build complete!");
    }

    Ok(report)
}

struct State<'a> {
    plan: &'a Plan,
    options: &'a ExecOptions,
    statuses: Vec<TaskStatus>,
    /// Predecessors that haven't settled yet, per node.
    pending: Vec<usize>,
    ready: BinaryHeap<Reverse<NodeIndex>>,
    aborting: bool,
}

impl State<'_> {
    fn transition(&mut self, index: NodeIndex, status: TaskStatus) {
        if let Some(observer) = &self.options.on_transition {
            observer(&self.plan.graph[index], &status);
        }
        self.statuses[index.index()] = status;
    }

    /// Records a terminal status and releases successors.
    fn settle(&mut self, index: NodeIndex, status: TaskStatus) {
        if let TaskStatus::Skipped(reason) = &status {
            tracing::debug!("{} skipped: {status}", self.plan.graph[index]);
            if matches!(reason, SkipReason::DependencyFailed { .. }) {
                tracing::warn!("{} {status}", self.plan.graph[index]);
            }
        }

        self.transition(index, status);

        let successors: Vec<_> = self.plan.successors(index).collect();
        for next in successors {
            let count = &mut self.pending[next.index()];
            *count -= 1;
            if *count == 0 {
                self.ready.push(Reverse(next));
            }
        }
    }

    /// Decides the fate of a ready task without running it. `None` means the
    /// action has to run.
    fn resolve(&self, index: NodeIndex, task: &Task, policy: &dyn UpToDate) -> Option<TaskStatus> {
        let hard: Vec<NodeIndex> = self
            .plan
            .predecessors(index)
            .filter(|(_, kind)| *kind == EdgeKind::Hard)
            .map(|(dep, _)| dep)
            .collect();

        for &dep in &hard {
            match &self.statuses[dep.index()] {
                TaskStatus::Failed => {
                    return Some(TaskStatus::Skipped(SkipReason::DependencyFailed {
                        cause: self.plan.graph[dep].clone(),
                    }));
                }
                TaskStatus::Skipped(SkipReason::DependencyFailed { cause }) => {
                    return Some(TaskStatus::Skipped(SkipReason::DependencyFailed {
                        cause: cause.clone(),
                    }));
                }
                TaskStatus::Skipped(SkipReason::Aborted) => {
                    return Some(TaskStatus::Skipped(SkipReason::Aborted));
                }
                _ => {}
            }
        }

        if self.aborting && !self.finalizes_executed(index) {
            return Some(TaskStatus::Skipped(SkipReason::Aborted));
        }

        if task.is_lifecycle() {
            let current = hard.iter().all(|dep| self.statuses[dep.index()].is_up_to_date());
            return Some(if current {
                TaskStatus::Skipped(SkipReason::UpToDate)
            } else {
                TaskStatus::Succeeded
            });
        }

        if policy.is_up_to_date(task) {
            return Some(TaskStatus::Skipped(SkipReason::UpToDate));
        }

        None
    }

    /// Whether this task finalizes a task whose action ran.
    fn finalizes_executed(&self, index: NodeIndex) -> bool {
        self.plan
            .predecessors(index)
            .filter(|(_, kind)| *kind == EdgeKind::Finalizer)
            .any(|(dep, _)| {
                matches!(
                    self.statuses[dep.index()],
                    TaskStatus::Succeeded | TaskStatus::Failed
                )
            })
    }
}
