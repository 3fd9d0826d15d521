//! Assembling the runnable deployment tree.
//!
//! ```text
//! run/                  copyLocal: local overrides, verbatim
//! run/data/lib/         copyLib: runtime dependencies, flattened
//! run/data/apps/<app>   copyApp: the primary artifact, renamed
//! ```
//!
//! Each step is a [`CopyPlan`] computed from its declared inputs before any
//! file is touched, the plan's destinations are exactly the step's outputs.
use std::collections::{BTreeSet, HashMap};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use walkdir::WalkDir;

use crate::error::StagingError;
use crate::manifest::Manifest;

/// Canonical name of the staged application.
pub const DEFAULT_APP_NAME: &str = "HederaNode.jar";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingLayout {
    root: Utf8PathBuf,
    app_name: String,
}

impl StagingLayout {
    pub fn new(root: impl Into<Utf8PathBuf>, app_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            app_name: app_name.into(),
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn lib_dir(&self) -> Utf8PathBuf {
        self.root.join("data").join("lib")
    }

    pub fn apps_dir(&self) -> Utf8PathBuf {
        self.root.join("data").join("apps")
    }

    pub fn app_path(&self) -> Utf8PathBuf {
        self.apps_dir().join(&self.app_name)
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyEntry {
    pub from: Utf8PathBuf,
    pub to: Utf8PathBuf,
}

/// Files to copy, plus optionally a directory that must end up holding
/// nothing but the copied files.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyPlan {
    entries: Vec<CopyEntry>,
    exclusive: Option<Utf8PathBuf>,
}

impl CopyPlan {
    pub fn entries(&self) -> &[CopyEntry] {
        &self.entries
    }

    pub fn destinations(&self) -> impl Iterator<Item = &Utf8Path> {
        self.entries.iter().map(|e| e.to.as_path())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn apply(&self) -> Result<(), StagingError> {
        for CopyEntry { from, to } in &self.entries {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent).map_err(|source| StagingError::Io {
                    path: parent.to_owned(),
                    source,
                })?;
            }
            fs::copy(from, to).map_err(|source| StagingError::Io {
                path: from.clone(),
                source,
            })?;
        }

        if let Some(dir) = &self.exclusive {
            self.prune(dir)?;
        }

        tracing::debug!("copied {} file(s)", self.entries.len());
        Ok(())
    }

    /// Removes files in `dir` that this plan did not put there.
    fn prune(&self, dir: &Utf8Path) -> Result<(), StagingError> {
        let keep: BTreeSet<&Utf8Path> = self.destinations().collect();

        for path in list_files(dir)? {
            if !keep.contains(path.as_path()) {
                tracing::warn!("removing stale {path}");
                fs::remove_file(&path).map_err(|source| StagingError::Io { path, source })?;
            }
        }

        Ok(())
    }
}

/// `copyLocal`: mirror the override directory into the staging root. A missing
/// directory stages nothing.
///
/// `data/lib` and the staged application belong to `copyLib` and `copyApp`,
/// an override landing there is rejected.
pub fn plan_local(local_dir: &Utf8Path, layout: &StagingLayout) -> Result<CopyPlan, StagingError> {
    let mut plan = CopyPlan::default();

    if !local_dir.is_dir() {
        return Ok(plan);
    }

    let lib_dir = layout.lib_dir();
    let app_path = layout.app_path();

    for path in list_files_recursive(local_dir)? {
        if let Ok(rel) = path.strip_prefix(local_dir) {
            let to = layout.root().join(rel);
            if to.starts_with(&lib_dir) || to == app_path {
                return Err(StagingError::ReservedOverride(path));
            }
            plan.entries.push(CopyEntry { from: path, to });
        }
    }

    Ok(plan)
}

/// `copyLib`: flatten runtime dependencies into `data/lib`, keeping their file
/// names. The directory ends up holding exactly this set.
pub fn plan_libs(libs: &[Utf8PathBuf], layout: &StagingLayout) -> Result<CopyPlan, StagingError> {
    let lib_dir = layout.lib_dir();
    let mut seen: HashMap<&str, &Utf8PathBuf> = HashMap::new();
    let mut entries = Vec::with_capacity(libs.len());

    for lib in libs {
        if !lib.is_file() {
            return Err(StagingError::MissingSource(lib.clone()));
        }
        let Some(name) = lib.file_name() else {
            return Err(StagingError::MissingSource(lib.clone()));
        };
        if let Some(first) = seen.insert(name, lib) {
            return Err(StagingError::DuplicateLibrary {
                name: name.to_string(),
                first: first.clone(),
                second: lib.clone(),
            });
        }
        entries.push(CopyEntry {
            from: lib.clone(),
            to: lib_dir.join(name),
        });
    }

    Ok(CopyPlan {
        entries,
        exclusive: Some(lib_dir),
    })
}

/// `copyApp`: the primary artifact under its canonical name.
pub fn plan_app(artifact: &Utf8Path, layout: &StagingLayout) -> Result<CopyPlan, StagingError> {
    if !artifact.is_file() {
        return Err(StagingError::MissingSource(artifact.to_owned()));
    }

    Ok(CopyPlan {
        entries: vec![CopyEntry {
            from: artifact.to_owned(),
            to: layout.app_path(),
        }],
        exclusive: None,
    })
}

/// Checks that a staged application exists before launching it.
pub fn verify_staged(layout: &StagingLayout) -> Result<(), StagingError> {
    if layout.app_path().is_file() {
        Ok(())
    } else {
        Err(StagingError::NothingStaged(layout.root().to_owned()))
    }
}

/// The manifest's class path has to name exactly the files in `lib_dir`.
pub fn verify_classpath(manifest: &Manifest, lib_dir: &Utf8Path) -> Result<(), StagingError> {
    let listed = manifest.library_names();
    let listed: BTreeSet<&str> = listed.iter().map(String::as_str).collect();
    let present = file_names(lib_dir)?;
    let present: BTreeSet<&str> = present.iter().map(String::as_str).collect();

    let missing: Vec<String> = listed.difference(&present).map(|s| s.to_string()).collect();
    let unlisted: Vec<String> = present.difference(&listed).map(|s| s.to_string()).collect();

    if missing.is_empty() && unlisted.is_empty() {
        Ok(())
    } else {
        Err(StagingError::ClasspathMismatch {
            dir: lib_dir.to_owned(),
            missing,
            unlisted,
        })
    }
}

/// Sorted names of the regular files directly in `dir`, empty if it's missing.
pub fn file_names(dir: &Utf8Path) -> Result<Vec<String>, StagingError> {
    let mut names: Vec<String> = list_files(dir)?
        .iter()
        .filter_map(|p| p.file_name().map(String::from))
        .collect();
    names.sort();
    Ok(names)
}

fn list_files(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StagingError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in dir.read_dir_utf8().map_err(|source| StagingError::Io {
        path: dir.to_owned(),
        source,
    })? {
        let entry = entry.map_err(|source| StagingError::Io {
            path: dir.to_owned(),
            source,
        })?;
        if entry.path().is_file() {
            files.push(entry.into_path());
        }
    }

    Ok(files)
}

fn list_files_recursive(dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, StagingError> {
    let mut files = Vec::new();

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            let path =
                Utf8PathBuf::from_path_buf(entry.into_path()).map_err(StagingError::PathFormat)?;
            files.push(path);
        }
    }

    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    fn touch(path: &Utf8Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_layout_paths() {
        let layout = StagingLayout::new("build/run", DEFAULT_APP_NAME);
        assert_eq!(layout.lib_dir(), "build/run/data/lib");
        assert_eq!(layout.app_path(), "build/run/data/apps/HederaNode.jar");
    }

    #[test]
    fn test_missing_local_dir_is_empty() {
        let (_dir, root) = temp_root();
        let layout = StagingLayout::new(root.join("run"), DEFAULT_APP_NAME);

        let plan = plan_local(&root.join("configuration/dev"), &layout).unwrap();
        assert!(plan.is_empty());
        plan.apply().unwrap();
    }

    #[test]
    fn test_local_overrides_keep_structure() {
        let (_dir, root) = temp_root();
        let local = root.join("local");
        touch(&local.join("settings.txt"), "a");
        touch(&local.join("data/config/api-permission.properties"), "b");
        let layout = StagingLayout::new(root.join("run"), DEFAULT_APP_NAME);

        plan_local(&local, &layout).unwrap().apply().unwrap();

        assert_eq!(fs::read_to_string(root.join("run/settings.txt")).unwrap(), "a");
        assert!(root.join("run/data/config/api-permission.properties").is_file());
    }

    #[test]
    fn test_local_overrides_cannot_touch_staged_libs_or_app() {
        let (_dir, root) = temp_root();
        let layout = StagingLayout::new(root.join("run"), DEFAULT_APP_NAME);

        let local = root.join("local");
        touch(&local.join("data/lib/override.jar"), "o");
        assert!(matches!(
            plan_local(&local, &layout),
            Err(StagingError::ReservedOverride(path)) if path.ends_with("data/lib/override.jar")
        ));

        let local = root.join("other");
        touch(&local.join("data/apps").join(DEFAULT_APP_NAME), "app");
        assert!(matches!(
            plan_local(&local, &layout),
            Err(StagingError::ReservedOverride(_))
        ));

        // Siblings of the reserved paths are fine.
        let local = root.join("fine");
        touch(&local.join("data/apps/extra.txt"), "x");
        touch(&local.join("data/config/application.properties"), "y");
        assert_eq!(plan_local(&local, &layout).unwrap().entries().len(), 2);
    }

    #[test]
    fn test_libs_are_flattened_and_pruned() {
        let (_dir, root) = temp_root();
        let a = root.join("cache/group/a/1.0/a-1.0.jar");
        let b = root.join("cache/other/b-2.0.jar");
        touch(&a, "a");
        touch(&b, "b");
        let layout = StagingLayout::new(root.join("run"), DEFAULT_APP_NAME);
        touch(&layout.lib_dir().join("old-0.1.jar"), "stale");

        let plan = plan_libs(&[a, b], &layout).unwrap();
        plan.apply().unwrap();

        assert_eq!(
            file_names(&layout.lib_dir()).unwrap(),
            ["a-1.0.jar", "b-2.0.jar"]
        );
    }

    #[test]
    fn test_duplicate_library_names() {
        let (_dir, root) = temp_root();
        let a = root.join("x/common.jar");
        let b = root.join("y/common.jar");
        touch(&a, "a");
        touch(&b, "b");
        let layout = StagingLayout::new(root.join("run"), DEFAULT_APP_NAME);

        match plan_libs(&[a, b], &layout) {
            Err(StagingError::DuplicateLibrary { name, .. }) => assert_eq!(name, "common.jar"),
            other => panic!("expected duplicate, got {other:?}"),
        }
    }

    #[test]
    fn test_app_is_renamed() {
        let (_dir, root) = temp_root();
        let jar = root.join("build/libs/hedera-node-1.2.3.jar");
        touch(&jar, "jar");
        let layout = StagingLayout::new(root.join("run"), DEFAULT_APP_NAME);

        assert!(verify_staged(&layout).is_err());
        plan_app(&jar, &layout).unwrap().apply().unwrap();

        assert_eq!(fs::read_to_string(layout.app_path()).unwrap(), "jar");
        verify_staged(&layout).unwrap();
    }

    #[test]
    fn test_missing_artifact() {
        let layout = StagingLayout::new("run", DEFAULT_APP_NAME);
        assert!(matches!(
            plan_app(Utf8Path::new("no/such.jar"), &layout),
            Err(StagingError::MissingSource(_))
        ));
    }

    #[test]
    fn test_lib_and_app_destinations_are_disjoint() {
        let (_dir, root) = temp_root();
        let lib = root.join("cache/a.jar");
        let jar = root.join("app.jar");
        touch(&lib, "a");
        touch(&jar, "app");
        let layout = StagingLayout::new(root.join("run"), DEFAULT_APP_NAME);

        let libs = plan_libs(&[lib], &layout).unwrap();
        let app = plan_app(&jar, &layout).unwrap();

        let lib_dir = layout.lib_dir();
        let apps_dir = layout.apps_dir();
        assert!(libs.destinations().all(|p| p.starts_with(&lib_dir)));
        assert!(app.destinations().all(|p| p.starts_with(&apps_dir)));
    }

    #[test]
    fn test_verify_classpath_reports_both_sides() {
        let (_dir, root) = temp_root();
        let lib_dir = root.join("lib");
        touch(&lib_dir.join("a.jar"), "a");
        touch(&lib_dir.join("extra.jar"), "x");

        let manifest = Manifest::for_libraries("Main", &["a.jar", "b.jar"]);
        match verify_classpath(&manifest, &lib_dir) {
            Err(StagingError::ClasspathMismatch {
                missing, unlisted, ..
            }) => {
                assert_eq!(missing, ["b.jar"]);
                assert_eq!(unlisted, ["extra.jar"]);
            }
            other => panic!("expected mismatch, got {other:?}"),
        }

        fs::remove_file(lib_dir.join("extra.jar")).unwrap();
        touch(&lib_dir.join("b.jar"), "b");
        verify_classpath(&manifest, &lib_dir).unwrap();
    }

    #[test]
    fn test_verify_classpath_with_spaces_in_names() {
        let (_dir, root) = temp_root();
        let lib = root.join("cache/my lib.jar");
        touch(&lib, "l");
        let layout = StagingLayout::new(root.join("run"), DEFAULT_APP_NAME);
        plan_libs(&[lib.clone()], &layout).unwrap().apply().unwrap();

        let rendered = Manifest::for_libraries("Main", &[lib]).render();
        let manifest = Manifest::parse(&rendered).unwrap();
        verify_classpath(&manifest, &layout.lib_dir()).unwrap();
    }
}
