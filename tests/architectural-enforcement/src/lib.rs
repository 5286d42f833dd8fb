//! Architectural Enforcement Integration Tests
//!
//! Source scanners used by the tests in `tests/` to enforce:
//! - Agent process and stream I/O only through tokio (no blocking calls in async code)
//! - No sleep-based waiting
//! - No `unwrap()`/`expect()` in production code
//! - Surfaces (CLI, WebSocket) stay out of the core crate
//!
//! Everything after the first `#[cfg(test)]` in a file is treated as test
//! code and skipped.

use std::fs;
use std::path::{Path, PathBuf};

/// A forbidden pattern
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    /// Short description shown in reports
    pub name: &'static str,
    /// Literal text to look for
    pub pattern: &'static str,
    /// Only a violation inside an `async fn`
    pub async_only: bool,
}

impl Rule {
    /// Rule that applies everywhere
    #[must_use]
    pub const fn always(name: &'static str, pattern: &'static str) -> Self {
        Self {
            name,
            pattern,
            async_only: false,
        }
    }

    /// Rule that applies inside async functions
    #[must_use]
    pub const fn in_async(name: &'static str, pattern: &'static str) -> Self {
        Self {
            name,
            pattern,
            async_only: true,
        }
    }
}

/// Blocking calls that would stall the runtime
pub const BLOCKING_RULES: &[Rule] = &[
    Rule::always("Blocking process I/O", "std::process::Command"),
    Rule::always("Blocking sleep", "std::thread::sleep"),
    Rule::always("Blocking network I/O", "std::net::TcpStream"),
    Rule::always("Blocking network I/O", "std::net::TcpListener"),
    Rule::in_async("Blocking file I/O", "std::fs::"),
    Rule::in_async("Blocking stdin", "std::io::stdin()"),
    Rule::in_async("Blocking stdout", "std::io::stdout()"),
];

/// Panicking shortcuts
pub const PANIC_RULES: &[Rule] = &[
    Rule::always("unwrap() in production code", ".unwrap()"),
    Rule::always("expect() in production code", ".expect("),
];

/// Production source directories, relative to the workspace root
pub const PRODUCTION_DIRS: &[&str] = &["conductor/core/src", "conductor/daemon/src"];

/// One rule violation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File containing the violation
    pub path: PathBuf,
    /// 1-based line number
    pub line: usize,
    /// Rule name
    pub rule: &'static str,
    /// The offending line, trimmed
    pub text: String,
}

impl std::fmt::Display for Violation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} - {}: {}",
            self.path.display(),
            self.line,
            self.rule,
            self.text
        )
    }
}

/// Workspace root (two levels above this crate)
#[must_use]
pub fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("..")
}

/// Scan every production directory
#[must_use]
pub fn scan_production(rules: &[Rule]) -> Vec<Violation> {
    let root = workspace_root();
    PRODUCTION_DIRS
        .iter()
        .flat_map(|dir| scan_directory(&root.join(dir), rules))
        .collect()
}

/// Scan all `.rs` files under `dir`
#[must_use]
pub fn scan_directory(dir: &Path, rules: &[Rule]) -> Vec<Violation> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().and_then(|s| s.to_str()) == Some("rs"))
        .flat_map(|entry| {
            let content = fs::read_to_string(entry.path()).unwrap_or_default();
            scan_source(entry.path(), &content, rules)
        })
        .collect()
}

/// Scan one file's contents
#[must_use]
pub fn scan_source(path: &Path, content: &str, rules: &[Rule]) -> Vec<Violation> {
    let lines: Vec<&str> = content.lines().collect();
    let end = test_section_start(&lines);
    let mut violations = Vec::new();

    for (idx, line) in lines[..end].iter().enumerate() {
        let code = strip_comment(line);
        if code.trim().is_empty() {
            continue;
        }
        for rule in rules {
            if !code.contains(rule.pattern) {
                continue;
            }
            if rule.async_only && !is_in_async_function(&lines, idx) {
                continue;
            }
            violations.push(Violation {
                path: path.to_path_buf(),
                line: idx + 1,
                rule: rule.name,
                text: line.trim().to_string(),
            });
        }
    }
    violations
}

/// Index of the first `#[cfg(test)]` line, or the line count
#[must_use]
pub fn test_section_start(lines: &[&str]) -> usize {
    lines
        .iter()
        .position(|l| l.trim_start().starts_with("#[cfg(test)]"))
        .unwrap_or(lines.len())
}

fn strip_comment(line: &str) -> &str {
    line.split("//").next().unwrap_or(line)
}

/// Check if line is inside an async function
#[must_use]
pub fn is_in_async_function(lines: &[&str], current_idx: usize) -> bool {
    for i in (0..current_idx).rev() {
        let line = lines[i].trim();

        if line.contains("async fn ") {
            return true;
        }

        if (line.starts_with("fn ") || line.contains(" fn ")) && !line.contains("async") {
            return false;
        }

        // Stop at module/impl boundaries
        if line.starts_with("mod ") || (line.starts_with("impl") && line.contains('{')) {
            return false;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_async_function_detection() {
        let code = [
            "async fn bad_function() {",
            "    let contents = std::fs::read_to_string(\"file.txt\")?;",
            "}",
        ];
        assert!(is_in_async_function(&code, 1));

        let code = [
            "pub fn load() {",
            "    let contents = std::fs::read_to_string(\"config.toml\")?;",
            "}",
        ];
        assert!(!is_in_async_function(&code, 1));
    }

    #[test]
    fn test_async_only_rule() {
        let source = "\
fn load() {
    std::fs::read_to_string(\"a\");
}

async fn run() {
    std::fs::read_to_string(\"b\");
}
";
        let violations = scan_source(Path::new("x.rs"), source, BLOCKING_RULES);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 6);
    }

    #[test]
    fn test_test_section_and_comments_skipped() {
        let source = "\
fn ok() {
    // value.unwrap() is fine in a comment
    let x = value.unwrap_or_default();
}

#[cfg(test)]
mod tests {
    fn helper() { value.unwrap(); }
}
";
        assert!(scan_source(Path::new("x.rs"), source, PANIC_RULES).is_empty());

        let source = "fn bad() { value.unwrap(); }\n";
        let violations = scan_source(Path::new("x.rs"), source, PANIC_RULES);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].to_string().starts_with("x.rs:1 - unwrap()"));
    }
}
