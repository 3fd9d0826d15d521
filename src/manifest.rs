//! The JAR manifest that makes `data/apps/<app>.jar` runnable from the
//! staging tree: its `Class-Path` points at `../lib/<name>` for every staged
//! library.
use std::fmt;

use camino::Utf8Path;

use crate::error::ManifestError;

/// Relative prefix from `data/apps` to the flattened libraries.
pub const LIB_PREFIX: &str = "../lib/";

/// Longest allowed line in bytes, terminator excluded.
const LINE_LIMIT: usize = 72;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub main_class: String,
    /// Entries exactly as they appear in `Class-Path`.
    pub class_path: Vec<String>,
}

impl Manifest {
    pub fn new(main_class: impl Into<String>) -> Self {
        Self {
            main_class: main_class.into(),
            class_path: Vec::new(),
        }
    }

    /// Class path of `../lib/<file name>` for every library, in order. Names
    /// are escaped since `Class-Path` is a space separated list of URLs.
    pub fn for_libraries<P: AsRef<Utf8Path>>(main_class: impl Into<String>, libs: &[P]) -> Self {
        Self {
            main_class: main_class.into(),
            class_path: libs
                .iter()
                .filter_map(|lib| lib.as_ref().file_name())
                .map(|name| format!("{LIB_PREFIX}{}", escape(name)))
                .collect(),
        }
    }

    /// File names the class path expects under `data/lib`, unescaped.
    pub fn library_names(&self) -> Vec<String> {
        self.class_path
            .iter()
            .map(|entry| unescape(entry.strip_prefix(LIB_PREFIX).unwrap_or(entry)))
            .collect()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        push_attribute(&mut out, "Manifest-Version", "1.0");
        push_attribute(&mut out, "Main-Class", &self.main_class);
        if !self.class_path.is_empty() {
            push_attribute(&mut out, "Class-Path", &self.class_path.join(" "));
        }
        out.push_str("\r\n");
        out
    }

    /// Reads the main section. Continuation lines are joined and both `\n` and
    /// `\r\n` terminators are accepted.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut logical: Vec<(usize, String)> = Vec::new();

        for (i, line) in text.lines().enumerate() {
            if line.is_empty() {
                break;
            }
            match (line.strip_prefix(' '), logical.last_mut()) {
                (Some(rest), Some((_, last))) => last.push_str(rest),
                (Some(_), None) => return Err(ManifestError::Malformed(i + 1)),
                (None, _) => logical.push((i + 1, line.to_string())),
            }
        }

        let mut main_class = None;
        let mut class_path = Vec::new();

        for (number, line) in logical {
            let (name, value) = line
                .split_once(": ")
                .ok_or(ManifestError::Malformed(number))?;

            match name {
                "Main-Class" => main_class = Some(value.to_string()),
                "Class-Path" => class_path = value.split_whitespace().map(String::from).collect(),
                _ => {}
            }
        }

        Ok(Self {
            main_class: main_class.ok_or(ManifestError::MissingAttribute("Main-Class"))?,
            class_path,
        })
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Percent-encodes the bytes that can't appear raw in a `Class-Path` URL.
fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        if matches!(ch, ' ' | '%' | '"' | '#' | '?') || ch.is_control() {
            let mut buf = [0; 4];
            for byte in ch.encode_utf8(&mut buf).bytes() {
                out.push_str(&format!("%{byte:02X}"));
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// Decodes `%XX` sequences, leaving malformed ones as they are.
fn unescape(entry: &str) -> String {
    let bytes = entry.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        let decoded = (bytes[i] == b'%')
            .then(|| entry.get(i + 1..i + 3))
            .flatten()
            .filter(|hex| hex.bytes().all(|b| b.is_ascii_hexdigit()))
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());

        match decoded {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }

    String::from_utf8(out).unwrap_or_else(|_| entry.to_string())
}

/// Writes `Name: value`, continuing on lines that start with a single space.
fn push_attribute(out: &mut String, name: &str, value: &str) {
    let line = format!("{name}: {value}");
    let mut rest = line.as_str();
    let mut limit = LINE_LIMIT;

    loop {
        if rest.len() <= limit {
            out.push_str(rest);
            out.push_str("\r\n");
            return;
        }

        let mut cut = limit;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }

        out.push_str(&rest[..cut]);
        out.push_str("\r\n ");
        rest = &rest[cut..];
        limit = LINE_LIMIT - 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_short_manifest() {
        let manifest = Manifest::for_libraries(
            "com.hedera.services.ServicesMain",
            &["/cache/a.jar", "/cache/b.jar"],
        );

        assert_eq!(
            manifest.render(),
            "Manifest-Version: 1.0\r\n\
             Main-Class: com.hedera.services.ServicesMain\r\n\
             Class-Path: ../lib/a.jar ../lib/b.jar\r\n\
             \r\n"
        );
    }

    #[test]
    fn test_long_lines_wrap_at_72_bytes() {
        let libs: Vec<String> = (0..20).map(|i| format!("/m2/library-number-{i}.jar")).collect();
        let manifest = Manifest::for_libraries("Main", &libs);
        let text = manifest.render();

        for line in text.split("\r\n") {
            assert!(line.len() <= 72, "line too long: {line:?}");
        }
        assert_eq!(Manifest::parse(&text).unwrap(), manifest);
    }

    #[test]
    fn test_wrapping_respects_char_boundaries() {
        let manifest = Manifest::new("ą".repeat(80));
        let text = manifest.render();

        assert!(text.split("\r\n").all(|line| line.len() <= 72));
        assert_eq!(Manifest::parse(&text).unwrap(), manifest);
    }

    #[test]
    fn test_parse_accepts_plain_newlines() {
        let manifest =
            Manifest::parse("Manifest-Version: 1.0\nMain-Class: a.B\nClass-Path: ../lib/x.jar\n")
                .unwrap();

        assert_eq!(manifest.main_class, "a.B");
        assert_eq!(manifest.library_names(), ["x.jar"]);
    }

    #[test]
    fn test_names_with_spaces_are_escaped() {
        let manifest = Manifest::for_libraries("Main", &["/cache/my lib.jar", "/cache/100%.jar"]);
        let text = manifest.render();

        assert!(text.contains("Class-Path: ../lib/my%20lib.jar ../lib/100%25.jar\r\n"));
        assert_eq!(
            Manifest::parse(&text).unwrap().library_names(),
            ["my lib.jar", "100%.jar"]
        );
    }

    #[test]
    fn test_unescape_leaves_malformed_sequences() {
        assert_eq!(unescape("a%2"), "a%2");
        assert_eq!(unescape("a%zzb"), "a%zzb");
        assert_eq!(unescape("a%+1"), "a%+1");
        assert_eq!(unescape("%C4%85.jar"), "ą.jar");
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            Manifest::parse("Manifest-Version: 1.0\n"),
            Err(ManifestError::MissingAttribute("Main-Class"))
        ));
        assert!(matches!(
            Manifest::parse("Manifest-Version 1.0\n"),
            Err(ManifestError::Malformed(1))
        ));
    }
}
