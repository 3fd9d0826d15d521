//! Teardown tasks paired with everything that produces outputs.
//!
//! For a task `copyLib` declaring outputs, `cleanCopyLib` removes exactly
//! those outputs. `cleanRun` wipes the staging root and `clean` aggregates it
//! with the teardowns of tasks writing outside of the staging root.
use std::fs;
use std::io::ErrorKind;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::CleanupError;
use crate::registry::RegistryBuilder;
use crate::task::TaskId;

pub const CLEAN: &str = "clean";
pub const CLEAN_RUN: &str = "cleanRun";

/// `copyLib` -> `cleanCopyLib`
pub fn teardown_name(task: &str) -> String {
    let mut chars = task.chars();
    match chars.next() {
        Some(first) => format!("{CLEAN}{}{}", first.to_uppercase(), chars.as_str()),
        None => CLEAN.to_string(),
    }
}

/// Deletes every path, files and directories alike. Paths that are already
/// gone are fine, anything else is collected and reported at the end.
pub fn remove_outputs<P: AsRef<Utf8Path>>(paths: &[P]) -> Result<(), CleanupError> {
    let mut failures = Vec::new();

    for path in paths {
        let path = path.as_ref();
        let result = match fs::symlink_metadata(path) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
            Ok(_) => fs::remove_file(path),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => tracing::debug!("removed {path}"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => failures.push((path.to_owned(), err)),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(CleanupError { failures })
    }
}

/// Registers a teardown for every task declared so far that has outputs,
/// plus `cleanRun` and the aggregate `clean`. Returns the id of `clean`.
pub fn register_cleanup(builder: &mut RegistryBuilder, staging_root: &Utf8Path) -> TaskId {
    let producers: Vec<(TaskId, Vec<Utf8PathBuf>)> = builder
        .tasks()
        .iter()
        .filter(|task| !task.outputs().is_empty())
        .map(|task| (task.id().clone(), task.outputs().to_vec()))
        .collect();

    let mut aggregate: Vec<TaskId> = Vec::new();

    let root = staging_root.to_owned();
    aggregate.push(
        builder
            .task(CLEAN_RUN)
            .describe(format!("Deletes the staging directory {root}"))
            .run(move |_| Ok(remove_outputs(&[&root])?)),
    );

    for (id, outputs) in producers {
        let outside = outputs.iter().any(|path| !path.starts_with(staging_root));
        let description = format!("Deletes the outputs of {id}");

        let teardown = builder
            .task(teardown_name(&id))
            .describe(description)
            .run(move |_| Ok(remove_outputs(&outputs)?));

        if outside {
            aggregate.push(teardown);
        }
    }

    builder
        .task(CLEAN)
        .describe("Deletes everything the build produced")
        .depends_on(aggregate)
        .register()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, Selection};
    use crate::registry::Registry;

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_teardown_names() {
        assert_eq!(teardown_name("copyLib"), "cleanCopyLib");
        assert_eq!(teardown_name("processResources"), "cleanProcessResources");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (_dir, root) = temp_root();
        let file = root.join("a.txt");
        let dir = root.join("tree/nested");
        fs::write(&file, "a").unwrap();
        fs::create_dir_all(&dir).unwrap();

        let paths = [file.clone(), root.join("tree")];
        remove_outputs(&paths).unwrap();
        remove_outputs(&paths).unwrap();

        assert!(!file.exists());
        assert!(!root.join("tree").exists());
    }

    #[test]
    fn test_remove_collects_failures() {
        let (_dir, root) = temp_root();
        let file = root.join("plain");
        fs::write(&file, "x").unwrap();
        let other = root.join("other.txt");
        fs::write(&other, "y").unwrap();

        let err = remove_outputs(&[file.join("child"), other.clone()]).unwrap_err();

        assert_eq!(err.failures.len(), 1);
        assert_eq!(err.failures[0].0, file.join("child"));
        assert!(!other.exists());
    }

    #[test]
    fn test_clean_composition() {
        let (_dir, root) = temp_root();
        let run = root.join("run");
        let resources = root.join("build/resources/main");
        fs::create_dir_all(run.join("data/lib")).unwrap();
        fs::create_dir_all(&resources).unwrap();

        let mut builder = Registry::builder();
        builder
            .task("processResources")
            .outputs([resources.clone()])
            .run(|_| Ok(()));
        builder
            .task("copyLib")
            .outputs([run.join("data/lib")])
            .run(|_| Ok(()));
        register_cleanup(&mut builder, &run);
        let registry = builder.finish().unwrap();

        let clean = registry.get(CLEAN).unwrap();
        let deps: Vec<_> = clean.hard_deps().iter().map(|d| d.as_ref()).collect();
        assert_eq!(deps, [CLEAN_RUN, "cleanProcessResources"]);
        assert!(registry.get("cleanCopyLib").is_some());

        let engine = Engine::new(registry);
        engine.run(&Selection::new([CLEAN])).unwrap();
        assert!(!run.exists());
        assert!(!resources.exists());

        // Nothing left to remove, still fine.
        engine.run(&Selection::new([CLEAN])).unwrap();
    }
}
