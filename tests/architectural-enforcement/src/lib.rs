//! Architectural Enforcement Integration Tests
//!
//! This package contains integration tests that enforce architectural principles
//! on the tube client engine:
//! - No sleep() calls in production code (wait on channels, never poll)
//! - No blocking I/O inside async code
//!
//! The helpers here locate and pre-process the production sources; the rules
//! themselves live in `tests/`.

use std::fs;
use std::path::{Path, PathBuf};

/// Source directories scanned by the enforcement tests, relative to the workspace root
pub const SCANNED_DIRS: &[&str] = &["tube-client/core/src"];

/// Kind of function a line belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FnKind {
    /// `fn` (runs before or outside the async runtime's scheduling)
    Sync,
    /// `async fn`
    Async,
}

/// One production source file, split into lines
#[derive(Debug)]
pub struct SourceFile {
    /// Path of the file
    pub path: PathBuf,
    /// File contents by line
    pub lines: Vec<String>,
}

impl SourceFile {
    /// Format a violation at `idx` (0-based line index)
    pub fn violation(&self, idx: usize, what: &str) -> String {
        format!(
            "{}:{} - {}: {}",
            self.path.display(),
            idx + 1,
            what,
            self.lines[idx].trim()
        )
    }
}

/// Workspace root, derived from this package's manifest directory
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join("..")
}

/// All `.rs` files under [`SCANNED_DIRS`]
pub fn production_sources() -> Vec<SourceFile> {
    let root = workspace_root();
    let mut files = Vec::new();

    for dir in SCANNED_DIRS {
        let path = root.join(dir);
        if !path.exists() {
            continue;
        }

        for entry in walkdir::WalkDir::new(&path)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.path().extension().and_then(|s| s.to_str()) != Some("rs") {
                continue;
            }
            let Ok(content) = fs::read_to_string(entry.path()) else {
                continue;
            };
            files.push(SourceFile {
                path: entry.path().to_path_buf(),
                lines: content.lines().map(str::to_string).collect(),
            });
        }
    }

    files
}

/// The part of a line before any `//` comment
pub fn code_part(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Whether the line is inside a `#[cfg(test)]` module
///
/// Test modules sit at the bottom of each file, so everything after the
/// attribute is test code.
pub fn is_in_test_code<S: AsRef<str>>(lines: &[S], current_idx: usize) -> bool {
    lines[..current_idx]
        .iter()
        .any(|line| line.as_ref().trim().starts_with("#[cfg(test)]"))
}

/// The kind of the nearest function declared above the line, if any
pub fn enclosing_fn<S: AsRef<str>>(lines: &[S], current_idx: usize) -> Option<FnKind> {
    for line in lines[..=current_idx].iter().rev() {
        let line = code_part(line.as_ref()).trim();
        let decl = line
            .trim_start_matches("pub(crate) ")
            .trim_start_matches("pub ");

        if decl.starts_with("async fn ") {
            return Some(FnKind::Async);
        }
        if decl.starts_with("fn ") {
            return Some(FnKind::Sync);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enclosing_fn_detection() {
        let code = [
            "use std::net::SocketAddr;",
            "pub async fn run() {",
            "    let x = 1;",
            "}",
            "pub(crate) fn helper() {",
            "    let y = 2;",
            "}",
        ];
        assert_eq!(enclosing_fn(&code, 0), None);
        assert_eq!(enclosing_fn(&code, 2), Some(FnKind::Async));
        assert_eq!(enclosing_fn(&code, 5), Some(FnKind::Sync));
    }

    #[test]
    fn test_test_module_detection() {
        let code = ["fn real() {}", "#[cfg(test)]", "mod tests {", "    fn t() {}", "}"];
        assert!(!is_in_test_code(&code, 0));
        assert!(is_in_test_code(&code, 3));
    }

    #[test]
    fn test_code_part_strips_comments() {
        assert_eq!(code_part("let a = 1; // sleep(10)"), "let a = 1; ");
    }

    #[test]
    fn test_scanned_dirs_exist() {
        for dir in SCANNED_DIRS {
            assert!(workspace_root().join(dir).exists(), "missing {dir}");
        }
    }
}
