//! Task records and their runtime status.
//!
//! A [`Task`] is an immutable description of a unit of work: its id, an
//! optional action, and three distinct edge sets.
//!
//! * **hard** (`depends_on`): must finish successfully first and pulls the
//!   dependency into the execution set;
//! * **soft** (`should_run_after`): ordering only, applies when both tasks
//!   happen to be scheduled;
//! * **finalizers** (`finalized_by`): run after this task whether it
//!   succeeded or not.
//!
//! Tasks are created through [`RegistryBuilder`](crate::RegistryBuilder) and
//! never mutated afterwards.
use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;

/// Atomic reference-counted string used for task identifiers.
pub type TaskId = Arc<str>;

pub(crate) type Action = Arc<dyn Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync>;

pub(crate) type Predicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Handed to every task action while it runs.
pub struct TaskContext {
    /// Id of the running task.
    pub id: TaskId,
    /// Span the task runs under, progress bars hang off it.
    pub span: tracing::Span,
}

#[derive(Clone)]
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) description: Option<String>,
    pub(crate) action: Option<Action>,
    pub(crate) hard_deps: Vec<TaskId>,
    pub(crate) soft_deps: Vec<TaskId>,
    pub(crate) finalizers: Vec<TaskId>,
    pub(crate) inputs: Vec<Utf8PathBuf>,
    pub(crate) outputs: Vec<Utf8PathBuf>,
    pub(crate) up_to_date_when: Vec<Predicate>,
}

impl Task {
    pub(crate) fn new(id: TaskId) -> Self {
        Self {
            id,
            description: None,
            action: None,
            hard_deps: Vec::new(),
            soft_deps: Vec::new(),
            finalizers: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            up_to_date_when: Vec::new(),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn hard_deps(&self) -> &[TaskId] {
        &self.hard_deps
    }

    pub fn soft_deps(&self) -> &[TaskId] {
        &self.soft_deps
    }

    pub fn finalizers(&self) -> &[TaskId] {
        &self.finalizers
    }

    pub fn inputs(&self) -> &[Utf8PathBuf] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Utf8PathBuf] {
        &self.outputs
    }

    /// Lifecycle tasks only aggregate their dependencies.
    pub fn is_lifecycle(&self) -> bool {
        self.action.is_none()
    }

    pub(crate) fn predicates_hold(&self) -> bool {
        self.up_to_date_when.iter().all(|check| check())
    }

    /// All ids this task refers to, across every edge kind.
    pub(crate) fn references(&self) -> impl Iterator<Item = &TaskId> {
        self.hard_deps
            .iter()
            .chain(&self.soft_deps)
            .chain(&self.finalizers)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("hard_deps", &self.hard_deps)
            .field("soft_deps", &self.soft_deps)
            .field("finalizers", &self.finalizers)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("has_action", &self.action.is_some())
            .finish()
    }
}

/// Why a task did not run its action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Outputs are current, or a lifecycle task whose dependencies all were.
    UpToDate,
    /// A hard dependency failed; `cause` is the task that actually failed.
    DependencyFailed { cause: TaskId },
    /// Dispatch stopped after an unrelated failure.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Scheduled,
    Running,
    Succeeded,
    Failed,
    Skipped(SkipReason),
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped(_)
        )
    }

    /// Whether dependents may run after this status.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Skipped(SkipReason::UpToDate)
        )
    }

    pub fn is_up_to_date(&self) -> bool {
        matches!(self, TaskStatus::Skipped(SkipReason::UpToDate))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Scheduled => write!(f, "SCHEDULED"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Succeeded => write!(f, "OK"),
            TaskStatus::Failed => write!(f, "FAILED"),
            TaskStatus::Skipped(SkipReason::UpToDate) => write!(f, "UP-TO-DATE"),
            TaskStatus::Skipped(SkipReason::DependencyFailed { cause }) => {
                write!(f, "SKIPPED (dependency '{cause}' failed)")
            }
            TaskStatus::Skipped(SkipReason::Aborted) => write!(f, "SKIPPED (aborted)"),
        }
    }
}
