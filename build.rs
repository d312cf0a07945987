// ========================================================================================
//
//                          METHYLPREP SOURCE POLICY CHECKS
//
// ========================================================================================
//
// Every build scans the crate's own Rust sources and fails on the patterns the project
// does not accept: underscore-prefixed names, change-log comments, `**` emphasis in
// plain comments, and `#[allow(dead_code)]`. It also stamps the build time into the
// binary for `methylprep version`.

use grep::regex::RegexMatcher;
use grep::searcher::{Searcher, Sink, SinkMatch};
use std::error::Error;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

// Directories holding the crate's own Rust sources.
const SOURCE_DIRS: [&str; 5] = ["prep", "cohort", "cli", "tests", "benches"];

/// One source rule: a line pattern plus a filter that discards false positives.
struct Rule {
    name: &'static str,
    pattern: &'static str,
    applies_to_build_script: bool,
    accept: fn(&str) -> bool,
    advice: &'static str,
}

const RULES: [Rule; 4] = [
    Rule {
        name: "underscore-prefixed names",
        pattern: r"\b(_[a-zA-Z0-9_]+)\b",
        applies_to_build_script: true,
        accept: is_underscore_violation,
        advice: "Use the binding under its real name or remove it completely.",
    },
    Rule {
        name: "change-log comments",
        pattern: r"(//|/\*).*(?:FIXED|CORRECTED|FIX|FIXES|NEW|CHANGED|CHANGES|CHANGE|MODIFIED|MODIFIES|MODIFY|UPDATED|UPDATES|UPDATE)",
        applies_to_build_script: false,
        accept: any_line,
        advice: "Comments describe the code as it is, not how it came to be.",
    },
    Rule {
        name: "`**` in plain comments",
        pattern: r"(//|/\*).*\*\*",
        applies_to_build_script: false,
        accept: is_plain_comment_line,
        advice: "Emphasis markup belongs in doc comments only.",
    },
    Rule {
        name: "#[allow(dead_code)] attributes",
        pattern: r"#\s*\[\s*allow\s*\(\s*dead_code\s*\)\s*\]",
        applies_to_build_script: false,
        accept: any_line,
        advice: "Use the item or delete it.",
    },
];

fn any_line(line: &str) -> bool {
    let _ = line;
    true
}

fn is_plain_comment_line(line: &str) -> bool {
    !line.trim_start().starts_with("///")
}

// Comment lines and names spelled inside string literals are not bindings.
fn is_underscore_violation(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") || line.contains("/*") {
        return false;
    }
    !line
        .split('"')
        .enumerate()
        .any(|(i, part)| i % 2 == 1 && part.contains('_'))
}

/// Collects the matching lines of one file that the rule accepts.
struct LineCollector {
    accept: fn(&str) -> bool,
    violations: Vec<String>,
}

impl Sink for LineCollector {
    type Error = std::io::Error;

    fn matched(&mut self, _: &Searcher, mat: &SinkMatch) -> Result<bool, Self::Error> {
        let line_number = mat.line_number().unwrap_or(0);
        let line_text = std::str::from_utf8(mat.bytes()).unwrap_or("").trim_end();
        if (self.accept)(line_text) {
            self.violations.push(format!("{line_number}:{line_text}"));
        }
        Ok(true)
    }
}

// Every `.rs` file under the source directories, sorted for stable output.
fn rust_sources() -> Vec<PathBuf> {
    let mut sources: Vec<PathBuf> = SOURCE_DIRS
        .iter()
        .flat_map(|dir| WalkDir::new(dir).into_iter().filter_map(|e| e.ok()))
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "rs"))
        .map(|e| e.into_path())
        .collect();
    sources.sort();
    sources
}

fn check_rule(rule: &Rule, sources: &[PathBuf]) -> Result<(), Box<dyn Error>> {
    let matcher = RegexMatcher::new_line_matcher(rule.pattern)?;
    let mut searcher = Searcher::new();
    let build_script = Path::new("build.rs");
    let extra = rule.applies_to_build_script.then_some(build_script);

    for path in sources.iter().map(PathBuf::as_path).chain(extra) {
        if !path.is_file() {
            continue;
        }
        let mut collector = LineCollector {
            accept: rule.accept,
            violations: Vec::new(),
        };
        searcher.search_path(&matcher, path, &mut collector)?;
        if !collector.violations.is_empty() {
            let mut message = format!(
                "\n❌ ERROR: Found {} {} in {}:\n",
                collector.violations.len(),
                rule.name,
                path.display()
            );
            for violation in &collector.violations {
                message.push_str(&format!("   {violation}\n"));
            }
            message.push_str(&format!("\n⚠️ {}\n", rule.advice));
            return Err(message.into());
        }
    }
    Ok(())
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    for dir in SOURCE_DIRS {
        println!("cargo:rerun-if-changed={dir}");
    }

    let build_timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=METHYLPREP_BUILD_TIMESTAMP={build_timestamp}");

    let sources = rust_sources();
    for rule in &RULES {
        if let Err(e) = check_rule(rule, &sources) {
            // Printed to stderr so cargo shows it with the failure.
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}
