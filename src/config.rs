//! `gantry.toml`, every key optional.
//!
//! ```toml
//! [project]
//! version = "0.30.0"
//!
//! [versions]
//! hapi-version = "0.30.0"
//!
//! [dependencies]
//! classpath = ["build/deps/*.jar"]
//! ```
//!
//! Relative paths are resolved against the project directory. Flags given on
//! the command line override the file through [`RuntimeArgs`].
use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::engine::ExecOptions;
use crate::error::ConfigError;
use crate::filter::{LineFilter, Substitution};
use crate::project::VersionCatalog;
use crate::stage::DEFAULT_APP_NAME;

pub const CONFIG_FILE: &str = "gantry.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub project: ProjectConfig,
    /// Version catalog, alias to version.
    pub versions: BTreeMap<String, String>,
    pub resources: ResourcesConfig,
    pub staging: StagingConfig,
    pub artifact: ArtifactConfig,
    pub dependencies: DependenciesConfig,
    pub launch: LaunchConfig,
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProjectConfig {
    pub name: String,
    pub version: String,
    pub build_dir: Utf8PathBuf,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: "hedera-node".into(),
            version: "0.0.0".into(),
            build_dir: "build".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubstitutionConfig {
    pub contains: String,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ResourcesConfig {
    pub source_dir: Utf8PathBuf,
    /// Glob patterns of files that go through the filter.
    pub filter: Vec<String>,
    pub substitutions: Vec<SubstitutionConfig>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            source_dir: "src/main/resources".into(),
            filter: vec!["semantic-version.properties".into()],
            substitutions: vec![
                SubstitutionConfig {
                    contains: "hapi-proto.version".into(),
                    key: "hapi.proto.version".into(),
                    value: "${catalog:hapi-version}".into(),
                },
                SubstitutionConfig {
                    contains: "project.version".into(),
                    key: "hedera.services.version".into(),
                    value: "${project.version}".into(),
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StagingConfig {
    /// Overrides copied verbatim into the staging root.
    pub local_dir: Utf8PathBuf,
    /// Staging root, `<build-dir>/run` when unset.
    pub run_dir: Option<Utf8PathBuf>,
    pub app_name: String,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            local_dir: "local".into(),
            run_dir: None,
            app_name: DEFAULT_APP_NAME.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ArtifactConfig {
    /// The primary artifact produced by the toolchain.
    pub path: Utf8PathBuf,
    pub main_class: String,
    /// Packaging command, `{manifest}` and `{artifact}` are replaced. Empty
    /// means the artifact is produced elsewhere.
    pub package: Vec<String>,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            path: "build/libs/hedera-node.jar".into(),
            main_class: "com.hedera.services.ServicesMain".into(),
            package: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DependenciesConfig {
    /// Glob patterns naming the runtime class path.
    pub classpath: Vec<String>,
}

impl Default for DependenciesConfig {
    fn default() -> Self {
        Self {
            classpath: vec!["build/deps/*.jar".into()],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LaunchConfig {
    /// Run with the staging root as working directory.
    pub command: Vec<String>,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "java".into(),
                "-jar".into(),
                format!("data/apps/{DEFAULT_APP_NAME}"),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExecutionConfig {
    /// Zero picks the number of available cores.
    pub max_concurrency: usize,
    pub continue_on_failure: bool,
}

/// Command line overrides.
#[derive(Debug, Clone, Default)]
pub struct RuntimeArgs {
    pub max_concurrency: Option<usize>,
    pub continue_on_failure: Option<bool>,
}

impl Config {
    pub fn parse(text: &str, path: &Utf8Path) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Loads `gantry.toml` from `root`, defaults when there is none.
    pub fn discover(root: &Utf8Path) -> Result<Self, ConfigError> {
        let path = root.join(CONFIG_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            tracing::debug!("no {CONFIG_FILE} in {root}, using defaults");
            Ok(Self::default())
        }
    }

    pub fn apply(&mut self, args: &RuntimeArgs) {
        if let Some(n) = args.max_concurrency {
            self.execution.max_concurrency = n;
        }
        if let Some(continue_on_failure) = args.continue_on_failure {
            self.execution.continue_on_failure = continue_on_failure;
        }
    }

    pub fn exec_options(&self) -> ExecOptions {
        let mut options = ExecOptions {
            continue_on_failure: self.execution.continue_on_failure,
            ..ExecOptions::default()
        };
        if self.execution.max_concurrency > 0 {
            options.max_concurrency = self.execution.max_concurrency;
        }
        options
    }

    pub fn build_dir(&self, root: &Utf8Path) -> Utf8PathBuf {
        root.join(&self.project.build_dir)
    }

    pub fn run_dir(&self, root: &Utf8Path) -> Utf8PathBuf {
        match &self.staging.run_dir {
            Some(dir) => root.join(dir),
            None => self.build_dir(root).join("run"),
        }
    }

    /// The resource filter with every placeholder resolved.
    pub fn line_filter(&self, catalog: &dyn VersionCatalog) -> Result<LineFilter, ConfigError> {
        let rules = self
            .resources
            .substitutions
            .iter()
            .map(|rule| {
                Ok(Substitution {
                    contains: rule.contains.clone(),
                    key: rule.key.clone(),
                    value: expand(&rule.value, &self.project.version, catalog)?,
                })
            })
            .collect::<Result<_, ConfigError>>()?;

        Ok(LineFilter::new(rules))
    }
}

/// Resolves `${project.version}` and `${catalog:<alias>}`. Other placeholders
/// are kept as they are.
pub fn expand(
    text: &str,
    project_version: &str,
    catalog: &dyn VersionCatalog,
) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ConfigError::Placeholder(text.to_string()))?;
        let name = &after[..end];

        if name == "project.version" {
            out.push_str(project_version);
        } else if let Some(alias) = name.strip_prefix("catalog:") {
            let version = catalog
                .version(alias)
                .ok_or_else(|| ConfigError::UnknownVersion(alias.to_string()))?;
            out.push_str(&version);
        } else {
            out.push_str(&rest[start..start + 2 + end + 1]);
        }

        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> BTreeMap<String, String> {
        BTreeMap::from([("hapi-version".to_string(), "0.30.0".to_string())])
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::parse("", Utf8Path::new(CONFIG_FILE)).unwrap();

        assert_eq!(config.project.build_dir, "build");
        assert_eq!(config.staging.app_name, "HederaNode.jar");
        assert_eq!(config.resources.filter, ["semantic-version.properties"]);
        assert_eq!(config.run_dir(Utf8Path::new("/p")), "/p/build/run");
        assert_eq!(config.launch.command[0], "java");
    }

    #[test]
    fn test_partial_sections() {
        let text = r#"
            [project]
            version = "1.2.3"

            [versions]
            hapi-version = "0.30.0"

            [staging]
            run-dir = "out/run"

            [execution]
            max-concurrency = 2
        "#;
        let config = Config::parse(text, Utf8Path::new(CONFIG_FILE)).unwrap();

        assert_eq!(config.project.version, "1.2.3");
        assert_eq!(config.project.name, "hedera-node");
        assert_eq!(config.versions["hapi-version"], "0.30.0");
        assert_eq!(config.run_dir(Utf8Path::new("/p")), "/p/out/run");
        assert_eq!(config.exec_options().max_concurrency, 2);
    }

    #[test]
    fn test_parse_error_names_file() {
        let err = Config::parse("[project", Utf8Path::new("x.toml")).unwrap_err();
        assert!(err.to_string().contains("x.toml"));
    }

    #[test]
    fn test_runtime_args_override() {
        let mut config = Config::default();
        config.apply(&RuntimeArgs {
            max_concurrency: Some(3),
            continue_on_failure: Some(true),
        });

        let options = config.exec_options();
        assert_eq!(options.max_concurrency, 3);
        assert!(options.continue_on_failure);
    }

    #[test]
    fn test_expand_placeholders() {
        let catalog = catalog();
        assert_eq!(
            expand("v${project.version}/${catalog:hapi-version}", "1.2.3", &catalog).unwrap(),
            "v1.2.3/0.30.0"
        );
        assert_eq!(expand("${other}", "1", &catalog).unwrap(), "${other}");
        assert!(matches!(
            expand("${catalog:missing}", "1", &catalog),
            Err(ConfigError::UnknownVersion(_))
        ));
        assert!(matches!(
            expand("${project.version", "1", &catalog),
            Err(ConfigError::Placeholder(_))
        ));
    }

    #[test]
    fn test_default_filter_rules() {
        let mut config = Config::default();
        config.project.version = "1.2.3".into();

        let filter = config.line_filter(&catalog()).unwrap();
        assert_eq!(filter.rules()[0].value, "0.30.0");
        assert_eq!(filter.rules()[1].value, "1.2.3");
    }
}
