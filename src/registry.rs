use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::error::GraphError;
use crate::task::{Task, TaskContext, TaskId};

/// The immutable set of tasks for one invocation.
///
/// A `Registry` is produced by [`RegistryBuilder::finish`], which rejects
/// duplicate ids and references to tasks that were never registered. Once
/// built, it is handed to the scheduler by reference; nothing mutates it.
///
/// # Example
///
/// ```rust
/// use gantry::Registry;
///
/// let mut builder = Registry::builder();
/// builder.task("copyLocal").run(|_| Ok(()));
/// builder.task("copyLib").depends_on(["copyLocal"]).run(|_| Ok(()));
/// builder.task("assemble").depends_on(["copyLib"]).register();
/// let registry = builder.finish().unwrap();
/// assert_eq!(registry.len(), 3);
/// ```
pub struct Registry {
    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Position of the task in declaration order, used to break ties.
    pub(crate) fn position(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Tasks in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tasks.iter()).finish()
    }
}

/// Collects task definitions. All edges are finalized here, validation runs
/// once in [`finish`](Self::finish).
#[derive(Default)]
pub struct RegistryBuilder {
    tasks: Vec<Task>,
}

impl RegistryBuilder {
    /// The entry point for a new task definition.
    pub fn task(&mut self, id: impl Into<TaskId>) -> TaskDef<'_> {
        TaskDef {
            builder: self,
            task: Task::new(id.into()),
        }
    }

    /// Tasks registered so far, in declaration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub(crate) fn push(&mut self, task: Task) -> TaskId {
        let id = task.id.clone();
        self.tasks.push(task);
        id
    }

    pub fn finish(self) -> Result<Registry, GraphError> {
        let mut index = HashMap::with_capacity(self.tasks.len());

        for (i, task) in self.tasks.iter().enumerate() {
            if index.insert(task.id.clone(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.id.clone()));
            }
        }

        for task in &self.tasks {
            if let Some(missing) = task.references().find(|id| !index.contains_key(*id)) {
                return Err(GraphError::UnknownDependency {
                    task: task.id.clone(),
                    dependency: missing.clone(),
                });
            }
        }

        Ok(Registry {
            tasks: self.tasks,
            index,
        })
    }
}

pub struct TaskDef<'a> {
    builder: &'a mut RegistryBuilder,
    task: Task,
}

impl<'a> TaskDef<'a> {
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.task.description = Some(description.into());
        self
    }

    /// Hard dependencies: must succeed before this task, and are scheduled
    /// along with it.
    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.task.hard_deps.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Soft dependencies: only order, never schedule.
    pub fn should_run_after<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.task.soft_deps.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn finalized_by<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.task.finalizers.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn inputs<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        self.task.inputs.extend(paths.into_iter().map(Into::into));
        self
    }

    pub fn outputs<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        self.task.outputs.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Extra condition for the up-to-date check, on top of timestamps.
    pub fn up_to_date_when<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.task.up_to_date_when.push(Arc::new(check));
        self
    }

    /// Registers the task with an action.
    pub fn run<F>(mut self, action: F) -> TaskId
    where
        F: Fn(&TaskContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.task.action = Some(Arc::new(action));
        self.builder.push(self.task)
    }

    /// Registers a lifecycle task without an action.
    pub fn register(self) -> TaskId {
        self.builder.push(self.task)
    }
}
