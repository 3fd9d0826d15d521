//! Registers the standard pipeline for a project directory.
//!
//! ```text
//! processResources   jarManifest ─┐
//!        └──── jar (optional) ────┤
//! copyLocal ─┬─ copyLib ──────────┤
//!            └─ copyApp ──────────┴─ assemble ─┐
//!                                   launch ────┴─ run
//! ```
//!
//! Every task producing files also gets a paired teardown, see
//! [`cleanup`](crate::cleanup).
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::process::Command;
use std::sync::Arc;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use tempfile::NamedTempFile;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cleanup::{CLEAN, register_cleanup};
use crate::config::Config;
use crate::engine::Engine;
use crate::error::{ConfigError, GantryError};
use crate::filter::{filter_str, process_resources};
use crate::manifest::Manifest;
use crate::registry::Registry;
use crate::stage::{
    StagingLayout, file_names, plan_app, plan_libs, plan_local, verify_classpath, verify_staged,
};

pub const PROCESS_RESOURCES: &str = "processResources";
pub const JAR_MANIFEST: &str = "jarManifest";
pub const JAR: &str = "jar";
pub const COPY_LOCAL: &str = "copyLocal";
pub const COPY_LIB: &str = "copyLib";
pub const COPY_APP: &str = "copyApp";
pub const ASSEMBLE: &str = "assemble";
pub const LAUNCH: &str = "launch";
pub const RUN: &str = "run";
pub const SHOW_HAPI_VERSION: &str = "showHapiVersion";

/// Catalog alias of the protocol version.
pub const HAPI_VERSION: &str = "hapi-version";

/// Produces the flattened runtime class path.
pub trait DependencyResolver: Send + Sync {
    fn resolve(&self) -> anyhow::Result<Vec<Utf8PathBuf>>;
}

/// Version aliases, e.g. `hapi-version`.
pub trait VersionCatalog: Send + Sync {
    fn version(&self, alias: &str) -> Option<String>;
}

impl VersionCatalog for BTreeMap<String, String> {
    fn version(&self, alias: &str) -> Option<String> {
        self.get(alias).cloned()
    }
}

/// Resolves glob patterns relative to a root, sorted and without duplicates.
#[derive(Debug, Clone)]
pub struct GlobResolver {
    root: Utf8PathBuf,
    patterns: Vec<String>,
}

impl GlobResolver {
    pub fn new(root: impl Into<Utf8PathBuf>, patterns: Vec<String>) -> Self {
        Self {
            root: root.into(),
            patterns,
        }
    }
}

impl DependencyResolver for GlobResolver {
    fn resolve(&self) -> anyhow::Result<Vec<Utf8PathBuf>> {
        let mut found = Vec::new();

        for pattern in &self.patterns {
            let full = self.root.join(pattern);
            for entry in glob::glob(full.as_str()).map_err(ConfigError::from)? {
                let path = entry.map_err(ConfigError::from)?;
                let path = Utf8PathBuf::from_path_buf(path).map_err(ConfigError::PathFormat)?;
                if path.is_file() {
                    found.push(path);
                }
            }
        }

        found.sort();
        found.dedup();
        Ok(found)
    }
}

/// A project directory together with its configuration and collaborators.
pub struct Project {
    root: Utf8PathBuf,
    config: Config,
    resolver: Arc<dyn DependencyResolver>,
    catalog: Arc<dyn VersionCatalog>,
}

impl Project {
    pub fn new(root: impl Into<Utf8PathBuf>, config: Config) -> Self {
        let root = root.into();
        let resolver = GlobResolver::new(root.clone(), config.dependencies.classpath.clone());
        let catalog = config.versions.clone();

        Self {
            root,
            config,
            resolver: Arc::new(resolver),
            catalog: Arc::new(catalog),
        }
    }

    pub fn with_resolver(mut self, resolver: impl DependencyResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn with_catalog(mut self, catalog: impl VersionCatalog + 'static) -> Self {
        self.catalog = Arc::new(catalog);
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn build_dir(&self) -> Utf8PathBuf {
        self.config.build_dir(&self.root)
    }

    pub fn layout(&self) -> StagingLayout {
        StagingLayout::new(self.config.run_dir(&self.root), &self.config.staging.app_name)
    }

    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.build_dir().join("tmp").join("jar").join("MANIFEST.MF")
    }

    /// The protocol version from the catalog, without building anything.
    pub fn proto_version(&self) -> Result<String, ConfigError> {
        self.catalog
            .version(HAPI_VERSION)
            .ok_or_else(|| ConfigError::UnknownVersion(HAPI_VERSION.into()))
    }

    pub fn engine(&self) -> Result<Engine, GantryError> {
        Ok(Engine::new(self.registry()?).with_options(self.config.exec_options()))
    }

    pub fn registry(&self) -> Result<Registry, GantryError> {
        let config = &self.config;
        let layout = self.layout();
        let build_dir = self.build_dir();
        let manifest_path = self.manifest_path();
        let artifact = self.root.join(&config.artifact.path);

        let libs: Arc<[Utf8PathBuf]> = self.resolver.resolve()?.into();
        tracing::debug!("resolved {} runtime dependencies", libs.len());

        let mut builder = Registry::builder();

        // copyLocal, nothing to copy makes it a no-op lifecycle task
        {
            let local_dir = self.root.join(&config.staging.local_dir);
            let plan = plan_local(&local_dir, &layout).map_err(anyhow::Error::from)?;
            let def = builder
                .task(COPY_LOCAL)
                .describe("Copies local overrides into the staging root")
                .should_run_after([CLEAN]);

            if plan.is_empty() {
                def.register();
            } else {
                let outputs: Vec<Utf8PathBuf> =
                    plan.destinations().map(Utf8Path::to_owned).collect();
                def.inputs([local_dir])
                    .outputs(outputs)
                    .run(move |_| Ok(plan.apply()?));
            }
        }

        // processResources
        {
            let src = self.root.join(&config.resources.source_dir);
            let dst = build_dir.join("resources").join("main");
            let patterns = config
                .resources
                .filter
                .iter()
                .map(|p| Pattern::new(p))
                .collect::<Result<Vec<_>, _>>()
                .map_err(ConfigError::from)?;
            let inputs: Vec<Utf8PathBuf> = src.is_dir().then(|| src.clone()).into_iter().collect();

            let current = {
                let (src, dst, patterns) = (src.clone(), dst.clone(), patterns.clone());
                let config = config.clone();
                let catalog = self.catalog.clone();
                move || resources_current(&src, &dst, &patterns, &config, catalog.as_ref())
            };

            let config = config.clone();
            let catalog = self.catalog.clone();
            builder
                .task(PROCESS_RESOURCES)
                .describe("Copies resources, filtering version properties")
                .should_run_after([CLEAN])
                .inputs(inputs)
                .outputs([dst.clone()])
                .up_to_date_when(current)
                .run(move |_| {
                    let filter = config.line_filter(catalog.as_ref())?;
                    let written = process_resources(&src, &dst, &patterns, &filter)?;
                    tracing::debug!("processed {} resource(s)", written.len());
                    Ok(())
                });
        }

        // jarManifest
        {
            let manifest = Manifest::for_libraries(&config.artifact.main_class, &libs[..]);
            let rendered = manifest.render();
            let path = manifest_path.clone();

            builder
                .task(JAR_MANIFEST)
                .describe("Writes the manifest with the runtime Class-Path")
                .should_run_after([CLEAN])
                .inputs(libs.iter().cloned())
                .outputs([manifest_path.clone()])
                .up_to_date_when({
                    let path = path.clone();
                    let rendered = rendered.clone();
                    move || fs::read_to_string(&path).is_ok_and(|text| text == rendered)
                })
                .run(move |_| {
                    write_atomic(&path, &rendered)?;
                    Ok(())
                });
        }

        // jar, only with a packaging command
        let packaged = !config.artifact.package.is_empty();
        if packaged {
            let command: Vec<String> = config
                .artifact
                .package
                .iter()
                .map(|arg| {
                    arg.replace("{manifest}", manifest_path.as_str())
                        .replace("{artifact}", artifact.as_str())
                })
                .collect();
            let root = self.root.clone();

            builder
                .task(JAR)
                .describe("Packages the primary artifact")
                .depends_on([JAR_MANIFEST, PROCESS_RESOURCES])
                .should_run_after([CLEAN])
                .inputs([manifest_path.clone(), build_dir.join("resources").join("main")])
                .outputs([artifact.clone()])
                .run(move |_| execute(&command, &root));
        }

        // copyLib
        {
            let lib_dir = layout.lib_dir();
            let expected: Vec<String> = {
                let mut names: Vec<String> = libs
                    .iter()
                    .filter_map(|p| p.file_name().map(String::from))
                    .collect();
                names.sort();
                names
            };
            let layout = layout.clone();
            let libs = libs.clone();

            builder
                .task(COPY_LIB)
                .describe("Copies runtime dependencies into data/lib")
                .depends_on([COPY_LOCAL])
                .should_run_after([CLEAN])
                .inputs(libs.iter().cloned())
                .outputs([lib_dir.clone()])
                .up_to_date_when(move || file_names(&lib_dir).is_ok_and(|names| names == expected))
                .run(move |ctx| {
                    ctx.span.pb_set_message(&format!("Copying {} libraries", libs.len()));
                    plan_libs(&libs, &layout)?.apply()?;
                    Ok(())
                });
        }

        // copyApp
        {
            let layout = layout.clone();
            let artifact = artifact.clone();
            let mut deps = vec![COPY_LOCAL];
            if packaged {
                deps.push(JAR);
            }

            builder
                .task(COPY_APP)
                .describe(format!("Copies the artifact into data/apps as {}", layout.app_name()))
                .depends_on(deps)
                .should_run_after([CLEAN])
                .inputs([artifact.clone()])
                .outputs([layout.app_path()])
                .run(move |_| Ok(plan_app(&artifact, &layout)?.apply()?));
        }

        builder
            .task(ASSEMBLE)
            .describe("Stages a runnable deployment")
            .depends_on([COPY_LIB, COPY_APP, JAR_MANIFEST])
            .register();

        // launch
        {
            let layout = layout.clone();
            let manifest_path = manifest_path.clone();
            let command = config.launch.command.clone();

            builder
                .task(LAUNCH)
                .describe("Starts the staged node from the staging root")
                .depends_on([ASSEMBLE])
                .run(move |_| {
                    verify_staged(&layout)?;
                    if manifest_path.is_file() {
                        let text = fs::read_to_string(&manifest_path)
                            .with_context(|| format!("Couldn't read {manifest_path}"))?;
                        verify_classpath(&Manifest::parse(&text)?, &layout.lib_dir())?;
                    }
                    execute(&command, layout.root())
                });
        }

        builder
            .task(RUN)
            .describe("Assembles and launches the node")
            .depends_on([ASSEMBLE, LAUNCH])
            .register();

        {
            let catalog = self.catalog.clone();
            builder
                .task(SHOW_HAPI_VERSION)
                .describe("Prints the protocol version from the catalog")
                .run(move |_| {
                    let version = catalog
                        .version(HAPI_VERSION)
                        .ok_or_else(|| ConfigError::UnknownVersion(HAPI_VERSION.into()))?;
                    println!("{version}");
                    Ok(())
                });
        }

        register_cleanup(&mut builder, layout.root());

        Ok(builder.finish()?)
    }
}

/// Whether every filtered resource already holds what filtering would write.
fn resources_current(
    src: &Utf8Path,
    dst: &Utf8Path,
    patterns: &[Pattern],
    config: &Config,
    catalog: &dyn VersionCatalog,
) -> bool {
    let Ok(filter) = config.line_filter(catalog) else {
        return false;
    };

    walkdir::WalkDir::new(src)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| Utf8PathBuf::from_path_buf(e.into_path()).ok())
        .filter_map(|path| {
            let rel = path.strip_prefix(src).ok()?.to_owned();
            let name = rel.file_name()?.to_owned();
            patterns
                .iter()
                .any(|p| p.matches(rel.as_str()) || p.matches(&name))
                .then_some((path, rel))
        })
        .all(|(path, rel)| {
            match (fs::read_to_string(&path), fs::read_to_string(dst.join(&rel))) {
                (Ok(source), Ok(staged)) => filter_str(&source, &filter) == staged,
                _ => false,
            }
        })
}

fn write_atomic(path: &Utf8Path, contents: &str) -> anyhow::Result<()> {
    let parent = path.parent().unwrap_or(Utf8Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("Couldn't create {parent}"))?;

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(contents.as_bytes())?;
    temp.persist(path)?;

    Ok(())
}

/// Runs an external command to completion, failing on a non-zero exit.
fn execute(command: &[String], cwd: &Utf8Path) -> anyhow::Result<()> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("Empty command");
    };

    tracing::debug!("running `{}` in {cwd}", command.join(" "));

    let status = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .status()
        .with_context(|| format!("Couldn't start `{program}`"))?;

    if !status.success() {
        anyhow::bail!("`{}` exited with {status}", command.join(" "));
    }

    Ok(())
}
