//! Line diff between two compiled scripts
//!
//! Used by deployment previews to show what an apply would change on an
//! agent relative to the last ruleset applied there.

use std::fmt::Write;

/// Header line that differs on every compile
const TIMESTAMP_PREFIX: &str = "# Generated at:";

fn normalize(script: &str) -> String {
    script
        .lines()
        .filter(|line| !line.starts_with(TIMESTAMP_PREFIX))
        .fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
}

/// Unified-style diff (`- `, `+ `, `  ` prefixes) of `old` against `new`.
///
/// Returns `None` when the scripts only differ in their generation
/// timestamp.
pub fn script_diff(old: &str, new: &str) -> Option<String> {
    let old_text = normalize(old);
    let new_text = normalize(new);
    if old_text == new_text {
        return None;
    }

    let diff = similar::TextDiff::from_lines(&old_text, &new_text);
    let mut result = String::new();

    for change in diff.iter_all_changes() {
        let sign = match change.tag() {
            similar::ChangeTag::Delete => "- ",
            similar::ChangeTag::Insert => "+ ",
            similar::ChangeTag::Equal => "  ",
        };
        let _ = write!(result, "{sign}{change}");
    }

    Some(result)
}

/// Counts inserted and deleted lines in a diff produced by [`script_diff`].
pub fn change_counts(diff: &str) -> (usize, usize) {
    diff.lines().fold((0, 0), |(added, removed), line| {
        if line.starts_with("+ ") {
            (added + 1, removed)
        } else if line.starts_with("- ") {
            (added, removed + 1)
        } else {
            (added, removed)
        }
    })
}
