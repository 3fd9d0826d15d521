use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ExecutionError, TaskFailure};
use crate::task::{SkipReason, TaskId, TaskStatus};

/// How a single task ended.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: TaskStatus,
    /// Time spent in the action, zero when it was skipped.
    pub duration: Duration,
    pub error: Option<Arc<anyhow::Error>>,
}

/// Result of one execution: final status of every planned task.
#[derive(Debug, Default)]
pub struct Report {
    /// Plan order, not completion order.
    pub order: Vec<TaskId>,
    pub outcomes: HashMap<TaskId, Outcome>,
}

impl Report {
    pub fn status(&self, id: &str) -> Option<&TaskStatus> {
        self.outcomes.get(id).map(|o| &o.status)
    }

    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(|o| o.status.is_success())
    }

    /// Tasks whose action actually ran.
    pub fn executed(&self) -> impl Iterator<Item = &TaskId> {
        self.order.iter().filter(|id| {
            matches!(
                self.status(id),
                Some(TaskStatus::Succeeded | TaskStatus::Failed)
            )
        })
    }

    pub fn failures(&self) -> Vec<TaskFailure> {
        self.order
            .iter()
            .filter_map(|id| {
                let outcome = self.outcomes.get(id)?;
                match (&outcome.status, &outcome.error) {
                    (TaskStatus::Failed, Some(cause)) => Some(TaskFailure {
                        id: id.clone(),
                        cause: cause.clone(),
                    }),
                    _ => None,
                }
            })
            .collect()
    }

    /// Turns failed tasks into an error, keeping the report otherwise.
    pub fn into_result(self) -> Result<Report, ExecutionError> {
        let failures = self.failures();
        if failures.is_empty() {
            Ok(self)
        } else {
            Err(ExecutionError { failures })
        }
    }

    /// Renders the executed plan as a Mermaid diagram, colored by status.
    ///
    /// * **Green**: ran successfully
    /// * **Red**: failed
    /// * **Blue**: up to date
    /// * **Grey**: skipped after a failure
    pub fn render_mermaid(&self) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for (i, id) in self.order.iter().enumerate() {
            let name = id.replace('"', "\\\"");
            let Some(outcome) = self.outcomes.get(id) else {
                continue;
            };

            let color = match &outcome.status {
                TaskStatus::Succeeded => "#90EE90",
                TaskStatus::Failed => "#FF7F7F",
                TaskStatus::Skipped(SkipReason::UpToDate) => "#ADD8E6",
                _ => "#D3D3D3",
            };

            let _ = writeln!(
                f,
                "    {i}[\"{name}\\n{} {:.2?}\"]",
                outcome.status, outcome.duration
            );
            let _ = writeln!(f, "    style {i} fill:{color}");
        }

        f
    }
}
