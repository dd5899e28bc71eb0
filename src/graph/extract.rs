//! Import scanning and specifier resolution
//!
//! Specifiers are found with a handful of regular expressions rather than a
//! parser. Comments are stripped first so commented-out imports do not
//! create edges; imports built from computed strings are not seen at all.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use rustc_hash::FxHashSet as HashSet;
use tracing::warn;

use crate::config::Project;
use crate::files::normalize_path;

struct Patterns {
    comment_or_string: Regex,
    static_import: Regex,
    dynamic_import: Regex,
    require: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        // String literals are matched too so a `//` inside one is not a comment.
        comment_or_string: Regex::new(
            r#"(?s)("(?:\\.|[^"\\\n])*"|'(?:\\.|[^'\\\n])*'|`(?:\\.|[^`\\])*`)|/\*.*?\*/|//[^\n]*"#,
        )
        .expect("static regex"),
        // import x from 'a'; import {a, b} from "a"; import 'a'; export * from 'a'
        static_import: Regex::new(
            r#"\b(?:import|export)\s+(?:type\s+)?(?:[\w*${}\s,]+?\s+from\s+)?['"]([^'"\n]+)['"]"#,
        )
        .expect("static regex"),
        dynamic_import: Regex::new(r#"\bimport\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).expect("static regex"),
        require: Regex::new(r#"\brequire\s*\(\s*['"]([^'"\n]+)['"]\s*\)"#).expect("static regex"),
    })
}

/// Collect module specifiers in source order, without duplicates
pub fn scan_specifiers(source: &str) -> Vec<String> {
    let p = patterns();
    let text = p.comment_or_string.replace_all(source, |caps: &regex::Captures| {
        caps.get(1).map_or(String::new(), |literal| literal.as_str().to_string())
    });

    let mut found: Vec<(usize, String)> = Vec::new();
    for re in [&p.static_import, &p.dynamic_import, &p.require] {
        for caps in re.captures_iter(&text) {
            if let Some(m) = caps.get(1) {
                found.push((m.start(), m.as_str().to_string()));
            }
        }
    }
    found.sort_by_key(|(pos, _)| *pos);

    let mut seen = HashSet::default();
    found
        .into_iter()
        .map(|(_, spec)| spec)
        .filter(|spec| seen.insert(spec.clone()))
        .collect()
}

/// Resolve a specifier written in `importer` to a first-party file.
///
/// Returns `None` for external packages and for specifiers that do not
/// resolve to an existing file.
pub fn resolve_specifier(project: &Project, specifier: &str, importer: &Path) -> Option<PathBuf> {
    if is_relative(specifier) {
        let base = importer.parent()?;
        return resolve_file(project, &base.join(specifier));
    }
    if specifier.starts_with('/') {
        return resolve_file(project, Path::new(specifier));
    }
    // Aliases are sorted longest prefix first.
    project
        .aliases
        .iter()
        .find_map(|(prefix, target)| alias_remainder(prefix, specifier).map(|rest| target.join(rest)))
        .and_then(|candidate| resolve_file(project, &candidate))
}

/// Read a file and resolve its first-party dependencies.
///
/// Unreadable files yield an empty set and a warning.
pub fn extract_dependencies(project: &Project, file: &Path) -> HashSet<PathBuf> {
    let source = match std::fs::read_to_string(file) {
        Ok(source) => source,
        Err(e) => {
            warn!(file = %file.display(), "cannot read file for dependency scan: {}", e);
            return HashSet::default();
        }
    };
    scan_specifiers(&source)
        .iter()
        .filter_map(|spec| resolve_specifier(project, spec, file))
        .filter(|dep| dep != file)
        .collect()
}

fn is_relative(specifier: &str) -> bool {
    specifier == "." || specifier == ".." || specifier.starts_with("./") || specifier.starts_with("../")
}

fn alias_remainder<'a>(prefix: &str, specifier: &'a str) -> Option<&'a str> {
    if prefix.ends_with('/') {
        return specifier.strip_prefix(prefix);
    }
    let rest = specifier.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else {
        rest.strip_prefix('/')
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

/// Verbatim, then each extension appended, then `index.<ext>` inside a directory
fn resolve_file(project: &Project, candidate: &Path) -> Option<PathBuf> {
    let candidate = normalize_path(candidate);
    if candidate.is_file() {
        return Some(candidate);
    }
    if let Some(found) = project
        .extensions
        .iter()
        .map(|ext| with_suffix(&candidate, ext))
        .find(|p| p.is_file())
    {
        return Some(found);
    }
    if candidate.is_dir() {
        return project
            .extensions
            .iter()
            .map(|ext| candidate.join(format!("index{}", ext)))
            .find(|p| p.is_file());
    }
    None
}
