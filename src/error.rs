use std::fmt;
use std::sync::Arc;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::task::TaskId;

/// Which edge set a cycle was found in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// The cycle runs through `depends_on` edges only.
    Hard,
    /// The cycle needs at least one `should_run_after` or `finalized_by` edge.
    Ordering,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleKind::Hard => write!(f, "dependency"),
            CycleKind::Ordering => write!(f, "ordering"),
        }
    }
}

/// Raised while building the registry or the execution plan. Nothing has run
/// when one of these is returned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Task '{0}' not found in the registry")]
    UnknownTask(TaskId),

    #[error("Task '{task}' references unknown task '{dependency}'")]
    UnknownDependency { task: TaskId, dependency: TaskId },

    #[error("Task '{0}' is registered more than once")]
    DuplicateTask(TaskId),

    #[error("Found a {kind} cycle between tasks: {}", join(.tasks))]
    Cycle { kind: CycleKind, tasks: Vec<TaskId> },
}

fn join(tasks: &[TaskId]) -> String {
    tasks
        .iter()
        .map(|id| id.as_ref())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Resource '{0}' does not exist")]
    MissingSource(Utf8PathBuf),

    #[error("Couldn't filter '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't replace '{path}' with the filtered copy.\n{source}")]
    Persist {
        path: Utf8PathBuf,
        source: tempfile::PersistError,
    },

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error("Path '{0}' is not valid UTF-8")]
    PathFormat(std::path::PathBuf),
}

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Artifact '{0}' does not exist")]
    MissingSource(Utf8PathBuf),

    #[error("Libraries '{first}' and '{second}' would both be staged as '{name}'")]
    DuplicateLibrary {
        name: String,
        first: Utf8PathBuf,
        second: Utf8PathBuf,
    },

    #[error(
        "Manifest Class-Path does not match {dir}: missing from lib [{}], not in manifest [{}]",
        .missing.join(", "),
        .unlisted.join(", ")
    )]
    ClasspathMismatch {
        dir: Utf8PathBuf,
        missing: Vec<String>,
        unlisted: Vec<String>,
    },

    #[error("Nothing staged at '{0}', run `assemble` first")]
    NothingStaged(Utf8PathBuf),

    #[error("Local override '{0}' would be replaced by staged dependencies or the application")]
    ReservedOverride(Utf8PathBuf),

    #[error("Couldn't stage '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Walk(#[from] walkdir::Error),

    #[error("Path '{0}' is not valid UTF-8")]
    PathFormat(std::path::PathBuf),
}

/// Teardown is best-effort: every path is attempted and the ones that
/// resisted are reported together.
#[derive(Debug, Error)]
#[error("Couldn't remove {}", list(.failures))]
pub struct CleanupError {
    pub failures: Vec<(Utf8PathBuf, std::io::Error)>,
}

fn list(failures: &[(Utf8PathBuf, std::io::Error)]) -> String {
    failures
        .iter()
        .map(|(path, err)| format!("'{path}' ({err})"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Manifest line {0} is not a `Name: value` pair")]
    Malformed(usize),

    #[error("Manifest has no '{0}' attribute")]
    MissingAttribute(&'static str),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config '{path}'.\n{source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't parse config '{path}'.\n{source}")]
    Parse {
        path: Utf8PathBuf,
        source: toml::de::Error,
    },

    #[error("Version alias '{0}' is not defined in [versions]")]
    UnknownVersion(String),

    #[error("Unterminated placeholder in '{0}'")]
    Placeholder(String),

    #[error(transparent)]
    Pattern(#[from] glob::PatternError),

    #[error(transparent)]
    Glob(#[from] glob::GlobError),

    #[error("Path '{0}' is not valid UTF-8")]
    PathFormat(std::path::PathBuf),
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Another invocation holds '{0}'; remove it if no build is running")]
    Held(Utf8PathBuf),

    #[error("Couldn't create lock '{path}'.\n{source}")]
    Io {
        path: Utf8PathBuf,
        source: std::io::Error,
    },
}

/// A single task that ended in [`TaskStatus::Failed`](crate::TaskStatus::Failed).
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub id: TaskId,
    pub cause: Arc<anyhow::Error>,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task '{}':\n{:#}", self.id, self.cause)
    }
}

#[derive(Debug, Error)]
#[error("{} task(s) failed:\n{}", .failures.len(), failures_list(.failures))]
pub struct ExecutionError {
    pub failures: Vec<TaskFailure>,
}

fn failures_list(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Error)]
pub enum GantryError {
    #[error("Error while constructing the task graph:\n{0}")]
    Graph(#[from] GraphError),

    #[error("Error while executing tasks:\n{0}")]
    Execution(#[from] ExecutionError),

    #[error("Error while loading configuration:\n{0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Failed to build worker pool")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GantryError {
    /// Process exit code: task failures and graph errors are told apart.
    pub fn exit_code(&self) -> u8 {
        match self {
            GantryError::Execution(_) => 1,
            GantryError::Graph(_) => 2,
            _ => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_lists_tasks() {
        let err = GraphError::Cycle {
            kind: CycleKind::Hard,
            tasks: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.to_string(), "Found a dependency cycle between tasks: a -> b");
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let graph = GantryError::from(GraphError::UnknownTask("x".into()));
        let exec = GantryError::from(ExecutionError { failures: vec![] });
        assert_eq!(graph.exit_code(), 2);
        assert_eq!(exec.exit_code(), 1);
    }
}
