//! Dependency extraction from task descriptions.
//!
//! Dependencies are written in prose: "depends on task-1", "requires A",
//! "after setup", "blocked by B, C and D". Matching is case-insensitive and
//! purely textual, so a misspelled reference simply does not resolve.
//!
//! ```
//! use conductor::core::extract_dependencies;
//!
//! let deps = extract_dependencies("Wire the API. Depends on task-1 and task-2.");
//! assert_eq!(deps, vec!["task-1", "task-2"]);
//! ```

use regex::Regex;
use std::sync::LazyLock;

/// Keyword followed by one reference or a list of references.
static DEPENDENCY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:depends\s+on|requires|after|blocked\s+by)\s*:?\s+([a-z0-9][\w.\-]*(?:(?:\s*,\s*|\s+and\s+|\s*&\s*)[a-z0-9][\w.\-]*)*)",
    )
    .unwrap()
});

/// Separators inside a captured reference list.
static LIST_SEPARATOR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s*,\s*|\s+and\s+|\s*&\s*").unwrap());

/// Extract referenced task ids in order of first appearance, without duplicates.
pub fn extract_dependencies(description: &str) -> Vec<String> {
    let mut deps: Vec<String> = Vec::new();
    for caps in DEPENDENCY_RE.captures_iter(description) {
        let Some(list) = caps.get(1) else {
            continue;
        };
        for reference in LIST_SEPARATOR_RE.split(list.as_str()) {
            let reference = reference.trim().trim_end_matches(['.', '-']);
            if reference.is_empty() {
                continue;
            }
            if !deps.iter().any(|d| d == reference) {
                deps.push(reference.to_string());
            }
        }
    }
    deps
}
