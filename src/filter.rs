//! Line-oriented token substitution for text resources.
//!
//! Filtering is a single pass over the source: every line is handed to a
//! [`LineTransform`] and written out in order, line endings untouched. The
//! output goes to a temporary file next to the destination which is renamed
//! over it only once everything was written, so a failed filter never leaves a
//! half-written resource behind.
use std::borrow::Cow;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use crate::error::FilterError;

pub trait LineTransform {
    /// Maps a line without its terminator.
    fn transform<'a>(&self, line: &'a str) -> Cow<'a, str>;
}

/// Replace any line containing `contains` with `key=value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Substitution {
    pub contains: String,
    pub key: String,
    pub value: String,
}

/// Ordered substitution rules, the first matching rule wins.
#[derive(Debug, Clone, Default)]
pub struct LineFilter {
    rules: Vec<Substitution>,
}

impl LineFilter {
    pub fn new(rules: Vec<Substitution>) -> Self {
        Self { rules }
    }

    pub fn rule(
        mut self,
        contains: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.rules.push(Substitution {
            contains: contains.into(),
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn rules(&self) -> &[Substitution] {
        &self.rules
    }
}

impl LineTransform for LineFilter {
    fn transform<'a>(&self, line: &'a str) -> Cow<'a, str> {
        match self.rules.iter().find(|rule| line.contains(&rule.contains)) {
            Some(rule) => Cow::Owned(format!("{}={}", rule.key, rule.value)),
            None => Cow::Borrowed(line),
        }
    }
}

fn split_ending(line: &str) -> (&str, &str) {
    if let Some(body) = line.strip_suffix("\r\n") {
        (body, "\r\n")
    } else if let Some(body) = line.strip_suffix('\n') {
        (body, "\n")
    } else {
        (line, "")
    }
}

/// Filters text held in memory, same rules as [`filter_file`].
pub fn filter_str(text: &str, transform: &impl LineTransform) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (body, ending) = split_ending(line);
        out.push_str(&transform.transform(body));
        out.push_str(ending);
    }
    out
}

/// Filters `src` into `dst`, replacing `dst` atomically.
pub fn filter_file(
    src: &Utf8Path,
    dst: &Utf8Path,
    transform: &impl LineTransform,
) -> Result<(), FilterError> {
    if !src.is_file() {
        return Err(FilterError::MissingSource(src.to_owned()));
    }

    let io = |path: &Utf8Path| {
        let path = path.to_owned();
        move |source: std::io::Error| FilterError::Io { path, source }
    };

    let parent = match dst.parent() {
        Some(parent) if !parent.as_str().is_empty() => parent,
        _ => Utf8Path::new("."),
    };
    fs::create_dir_all(parent).map_err(io(parent))?;

    // Dropping the temp file on any early return removes it.
    let mut temp = NamedTempFile::new_in(parent).map_err(io(parent))?;

    let mut reader = BufReader::new(File::open(src).map_err(io(src))?);
    let mut writer = BufWriter::new(temp.as_file_mut());
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line).map_err(io(src))? == 0 {
            break;
        }
        let (body, ending) = split_ending(&line);
        writer
            .write_all(transform.transform(body).as_bytes())
            .map_err(io(dst))?;
        writer.write_all(ending.as_bytes()).map_err(io(dst))?;
    }

    writer.flush().map_err(io(dst))?;
    drop(writer);

    temp.persist(dst).map_err(|source| FilterError::Persist {
        path: dst.to_owned(),
        source,
    })?;

    Ok(())
}

/// Copies a resource tree, filtering the files whose relative path matches
/// one of `patterns` and copying everything else byte for byte.
///
/// A missing source directory yields no resources. Returns the written files.
pub fn process_resources(
    src_dir: &Utf8Path,
    dst_dir: &Utf8Path,
    patterns: &[Pattern],
    transform: &impl LineTransform,
) -> Result<Vec<Utf8PathBuf>, FilterError> {
    let mut written = Vec::new();

    fs::create_dir_all(dst_dir).map_err(|source| FilterError::Io {
        path: dst_dir.to_owned(),
        source,
    })?;

    if !src_dir.is_dir() {
        tracing::debug!("no resources at {src_dir}");
        return Ok(written);
    }

    for entry in WalkDir::new(src_dir).sort_by_file_name() {
        let entry = entry.map_err(|err| FilterError::Io {
            path: src_dir.to_owned(),
            source: err.into(),
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let path = Utf8Path::from_path(entry.path())
            .ok_or_else(|| FilterError::PathFormat(entry.path().to_path_buf()))?;
        let Ok(rel) = path.strip_prefix(src_dir) else {
            continue;
        };
        let dst = dst_dir.join(rel);

        if matches(patterns, rel) {
            tracing::debug!("filtering {rel}");
            filter_file(path, &dst, transform)?;
        } else {
            if let Some(parent) = dst.parent() {
                fs::create_dir_all(parent).map_err(|source| FilterError::Io {
                    path: parent.to_owned(),
                    source,
                })?;
            }
            fs::copy(path, &dst).map_err(|source| FilterError::Io {
                path: path.to_owned(),
                source,
            })?;
        }

        written.push(dst);
    }

    Ok(written)
}

/// Matches either the whole relative path or just the file name.
fn matches(patterns: &[Pattern], rel: &Utf8Path) -> bool {
    patterns.iter().any(|pattern| {
        pattern.matches(rel.as_str()) || rel.file_name().is_some_and(|name| pattern.matches(name))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version_filter() -> LineFilter {
        LineFilter::default()
            .rule("hapi-proto.version", "hapi.proto.version", "0.30.0")
            .rule("project.version", "hedera.services.version", "1.2.3")
    }

    fn temp_root() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
        (dir, root)
    }

    #[test]
    fn test_version_properties_scenario() {
        let (_dir, root) = temp_root();
        let src = root.join("semantic-version.properties");
        let dst = root.join("out/semantic-version.properties");
        let source = "hapi-proto.version=${hapi-proto.version}\n\
                      hedera.services.version=${project.version}\n";
        fs::write(&src, source).unwrap();

        filter_file(&src, &dst, &version_filter()).unwrap();

        assert_eq!(
            fs::read_to_string(&dst).unwrap(),
            "hapi.proto.version=0.30.0\nhedera.services.version=1.2.3\n"
        );
    }

    #[test]
    fn test_untouched_lines_and_missing_newline() {
        let (_dir, root) = temp_root();
        let src = root.join("a.properties");
        let dst = root.join("b.properties");
        fs::write(&src, "# comment\r\nname=x\nproject.version").unwrap();

        filter_file(&src, &dst, &version_filter()).unwrap();

        assert_eq!(
            fs::read_to_string(&dst).unwrap(),
            "# comment\r\nname=x\nhedera.services.version=1.2.3"
        );
    }

    #[test]
    fn test_first_rule_wins() {
        let filter = LineFilter::default()
            .rule("version", "first", "1")
            .rule("project.version", "second", "2");
        assert_eq!(filter.transform("project.version=0"), "first=1");
    }

    #[test]
    fn test_missing_source_leaves_destination() {
        let (_dir, root) = temp_root();
        let dst = root.join("out.properties");
        fs::write(&dst, "old").unwrap();

        let err = filter_file(&root.join("nope"), &dst, &version_filter()).unwrap_err();

        assert!(matches!(err, FilterError::MissingSource(_)));
        assert_eq!(fs::read_to_string(&dst).unwrap(), "old");
        assert_eq!(fs::read_dir(&root).unwrap().count(), 1);
    }

    #[test]
    fn test_invalid_source_discards_temp_file() {
        let (_dir, root) = temp_root();
        let src = root.join("binary.properties");
        let out = root.join("out");
        fs::create_dir_all(&out).unwrap();
        fs::write(&src, [0xff, 0xfe, b'\n']).unwrap();

        let err = filter_file(&src, &out.join("binary.properties"), &version_filter());

        assert!(matches!(err, Err(FilterError::Io { .. })));
        assert_eq!(fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn test_process_resources_filters_only_matches() {
        let (_dir, root) = temp_root();
        let src = root.join("resources");
        let dst = root.join("build/resources/main");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("semantic-version.properties"), "project.version\n").unwrap();
        fs::write(src.join("nested/other.properties"), "project.version\n").unwrap();

        let patterns = [Pattern::new("semantic-version.properties").unwrap()];
        let written = process_resources(&src, &dst, &patterns, &version_filter()).unwrap();

        assert_eq!(written.len(), 2);
        assert_eq!(
            fs::read_to_string(dst.join("semantic-version.properties")).unwrap(),
            "hedera.services.version=1.2.3\n"
        );
        assert_eq!(
            fs::read_to_string(dst.join("nested/other.properties")).unwrap(),
            "project.version\n"
        );
    }

    #[test]
    fn test_filter_str_matches_file_filter() {
        assert_eq!(
            filter_str("a\nhapi-proto.version=\n", &version_filter()),
            "a\nhapi.proto.version=0.30.0\n"
        );
    }
}
