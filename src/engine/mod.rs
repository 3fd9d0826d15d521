mod plan;
mod report;
mod runner;
mod uptodate;

use std::fmt;
use std::sync::Arc;

use crate::error::{GantryError, GraphError};
use crate::registry::Registry;
use crate::task::{TaskId, TaskStatus};

pub use plan::{EdgeKind, Plan, Selection, schedule, schedule_order};
pub use report::{Outcome, Report};
pub use uptodate::{Always, Timestamps, UpToDate};

/// Called on the scheduler thread for every status change.
pub type TransitionObserver = Arc<dyn Fn(&TaskId, &TaskStatus) + Send + Sync>;

#[derive(Clone)]
pub struct ExecOptions {
    /// Size of the worker pool.
    pub max_concurrency: usize,
    /// Keep dispatching independent tasks after a failure.
    pub continue_on_failure: bool,
    pub on_transition: Option<TransitionObserver>,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            max_concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            continue_on_failure: false,
            on_transition: None,
        }
    }
}

impl fmt::Debug for ExecOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecOptions")
            .field("max_concurrency", &self.max_concurrency)
            .field("continue_on_failure", &self.continue_on_failure)
            .field("on_transition", &self.on_transition.is_some())
            .finish()
    }
}

/// Owns the registry for one invocation and runs plans over it.
pub struct Engine {
    registry: Registry,
    options: ExecOptions,
    policy: Box<dyn UpToDate>,
}

impl Engine {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            options: ExecOptions::default(),
            policy: Box::new(Timestamps),
        }
    }

    pub fn with_options(mut self, options: ExecOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_policy(mut self, policy: impl UpToDate + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn schedule(&self, selection: &Selection) -> Result<Plan, GraphError> {
        schedule(&self.registry, selection)
    }

    /// Runs every task of the plan. Task failures end up in the report, the
    /// error side is reserved for the engine itself failing.
    pub fn execute(&self, plan: &Plan) -> Result<Report, GantryError> {
        runner::run_plan(&self.registry, plan, self.policy.as_ref(), &self.options)
    }

    /// Schedules and executes in one go, failing on any failed task.
    pub fn run(&self, selection: &Selection) -> Result<Report, GantryError> {
        let plan = self.schedule(selection)?;
        Ok(self.execute(&plan)?.into_result()?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[test]
    fn test_cycle_runs_nothing() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let mut builder = Registry::builder();
        builder.task("a").depends_on(["b"]).run(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        });
        builder.task("b").depends_on(["a"]).run(|_| Ok(()));
        let engine = Engine::new(builder.finish().unwrap());

        let err = engine.run(&Selection::new(["a"])).unwrap_err();
        assert!(matches!(err, GantryError::Graph(GraphError::Cycle { .. })));
        assert_eq!(err.exit_code(), 2);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_run_reports_task_failure() {
        let mut builder = Registry::builder();
        builder.task("a").run(|_| anyhow::bail!("broken"));
        let engine = Engine::new(builder.finish().unwrap()).with_policy(Always);

        let err = engine.run(&Selection::new(["a"])).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }
}
