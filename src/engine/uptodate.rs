use std::fs;
use std::time::SystemTime;

use camino::Utf8Path;
use walkdir::WalkDir;

use crate::task::Task;

/// Decides whether a task's action can be skipped.
pub trait UpToDate: Send + Sync {
    fn is_up_to_date(&self, task: &Task) -> bool;
}

/// Compares modification times of declared inputs and outputs.
///
/// A task is current when it declares at least one output, every output
/// exists, no input is newer than the oldest output and every
/// `up_to_date_when` predicate holds. A task without outputs always runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct Timestamps;

impl UpToDate for Timestamps {
    fn is_up_to_date(&self, task: &Task) -> bool {
        if task.outputs().is_empty() {
            return false;
        }

        let mut oldest_output: Option<SystemTime> = None;
        for path in task.outputs() {
            match oldest(path) {
                Some(time) => {
                    oldest_output = Some(oldest_output.map_or(time, |t| t.min(time)));
                }
                None => return false,
            }
        }

        let mut newest_input: Option<SystemTime> = None;
        for path in task.inputs() {
            if !path.exists() {
                tracing::debug!("{}: input {path} is missing", task.id());
                return false;
            }
            if let Some(time) = newest(path) {
                newest_input = Some(newest_input.map_or(time, |t| t.max(time)));
            }
        }

        if let (Some(input), Some(output)) = (newest_input, oldest_output)
            && input > output
        {
            return false;
        }

        task.predicates_hold()
    }
}

/// Never skips anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct Always;

impl UpToDate for Always {
    fn is_up_to_date(&self, _: &Task) -> bool {
        false
    }
}

fn modified(path: &std::path::Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Oldest mtime under `path`, `None` if it doesn't exist.
fn oldest(path: &Utf8Path) -> Option<SystemTime> {
    if path.is_dir() {
        let files = WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| modified(e.path()))
            .min();
        files.or_else(|| modified(path.as_std_path()))
    } else {
        modified(path.as_std_path())
    }
}

/// Newest mtime under `path`.
fn newest(path: &Utf8Path) -> Option<SystemTime> {
    if path.is_dir() {
        WalkDir::new(path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| modified(e.path()))
            .max()
    } else {
        modified(path.as_std_path())
    }
}
