//! Patch model: a ticket's proposed changes against a specific base snapshot.
//!
//! A patch (virtual branch) is created by the generation pipeline, refined by
//! review and conflict resolution, and consumed by the merge queue. This
//! module also owns the deterministic text-rebase: a line diff from base to
//! patch, reapplied hunk by hunk onto the current snapshot.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// A ticket's proposed file changes, computed against snapshot `base_version`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub ticket_id: String,
    pub base_version: u64,
    pub files: BTreeMap<String, String>,
    /// Paths in the order they were produced, as reported to observers.
    pub applied_files: Vec<String>,
}

impl Patch {
    pub fn new(ticket_id: &str, base_version: u64, files: BTreeMap<String, String>) -> Self {
        let applied_files = files.keys().cloned().collect();
        Self {
            ticket_id: ticket_id.to_string(),
            base_version,
            files,
            applied_files,
        }
    }

    /// Merge replacement contents into the patch (review auto-fix, conflict
    /// resolution). New paths are appended to the applied-file list.
    pub fn merge_files(&mut self, files: BTreeMap<String, String>) {
        for (path, content) in files {
            if !self.files.contains_key(&path) {
                self.applied_files.push(path.clone());
            }
            self.files.insert(path, content);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

static FILE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)<file\s+path="([^"]+)"\s*>(.*?)</file>"#).unwrap());
static OPEN_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<file\s+path="([^"]+)"\s*>"#).unwrap());

/// Extract `<file path="...">content</file>` blocks from generated text.
///
/// Blocks may appear in any order; a trailing block missing its close tag is
/// still captured. Paths are normalized (leading slashes removed) and stray
/// code-fence lines are dropped from the content.
pub fn extract_file_blocks(text: &str) -> BTreeMap<String, String> {
    let mut files = BTreeMap::new();
    let mut last_end = 0;

    for caps in FILE_BLOCK.captures_iter(text) {
        let whole = caps.get(0).unwrap();
        let path = normalize_path(&caps[1]);
        if !path.is_empty() {
            files.insert(path, clean_content(&caps[2]));
        }
        last_end = whole.end();
    }

    // Tolerate one unterminated trailing block.
    if let Some(caps) = OPEN_TAG.captures_at(text, last_end) {
        let open = caps.get(0).unwrap();
        let path = normalize_path(&caps[1]);
        if !path.is_empty() {
            files.insert(path, clean_content(&text[open.end()..]));
        }
    }

    files
}

fn normalize_path(raw: &str) -> String {
    raw.trim().trim_start_matches('/').to_string()
}

fn clean_content(raw: &str) -> String {
    let body = raw.strip_prefix('\n').unwrap_or(raw);
    let kept: Vec<&str> = body
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect();
    let mut out = kept.join("\n");
    if body.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Per-file merge classification against the current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMergeState {
    /// Nothing changed underneath the branch; take the patch content.
    CleanBase,
    /// The current snapshot already holds exactly the patch content.
    AlreadyApplied,
    /// The branch did not actually change this file; keep the current content.
    Untouched,
    /// Base, current, and patch all differ; a real conflict.
    Conflicting,
    /// The file exists in some states but not others; escalated rather than
    /// auto-resolved.
    Ambiguous,
}

impl FileMergeState {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflicting | Self::Ambiguous)
    }
}

/// Classify one patched file against its base and the current snapshot.
pub fn classify_file(base: Option<&str>, main: Option<&str>, patch: &str) -> FileMergeState {
    if main == Some(patch) {
        return FileMergeState::AlreadyApplied;
    }
    if base == main {
        return FileMergeState::CleanBase;
    }
    if base == Some(patch) {
        return FileMergeState::Untouched;
    }
    if base.is_none() || main.is_none() {
        return FileMergeState::Ambiguous;
    }
    FileMergeState::Conflicting
}

// ── Deterministic line-based rebase ─────────────────────────────────

/// Context lines carried on each side of a hunk when matching against the
/// rebase target.
const HUNK_CONTEXT: usize = 3;

/// Beyond this many cell comparisons the middle section is diffed as a single
/// replacement hunk instead of line-by-line.
const MAX_DIFF_CELLS: usize = 4_000_000;

#[derive(Debug, Clone, PartialEq)]
struct Hunk {
    context_before: Vec<String>,
    removed: Vec<String>,
    added: Vec<String>,
    context_after: Vec<String>,
}

impl Hunk {
    fn pattern(&self) -> Vec<String> {
        let mut p = self.context_before.clone();
        p.extend(self.removed.iter().cloned());
        p.extend(self.context_after.iter().cloned());
        p
    }

    fn replacement(&self) -> Vec<String> {
        let mut r = self.context_before.clone();
        r.extend(self.added.iter().cloned());
        r.extend(self.context_after.iter().cloned());
        r
    }
}

/// Rebase a file's intended change onto a newer base.
///
/// Computes the line diff `base → patch` and applies every hunk onto `main`.
/// Returns the rebased content only if every hunk matches `main` at exactly
/// one position; any miss or ambiguity returns `None` so the caller can
/// escalate.
pub fn rebase_file(base: &str, main: &str, patch: &str) -> Option<String> {
    if base == patch {
        return Some(main.to_string());
    }
    if base == main {
        return Some(patch.to_string());
    }

    let base_lines: Vec<&str> = base.lines().collect();
    let patch_lines: Vec<&str> = patch.lines().collect();
    let hunks = diff_hunks(&base_lines, &patch_lines);

    let mut main_lines: Vec<String> = main.lines().map(String::from).collect();
    for hunk in &hunks {
        let pattern = hunk.pattern();
        let position = find_unique(&main_lines, &pattern)?;
        main_lines.splice(position..position + pattern.len(), hunk.replacement());
    }

    let mut out = main_lines.join("\n");
    if main.ends_with('\n') || patch.ends_with('\n') {
        out.push('\n');
    }
    Some(out)
}

/// Index of the single occurrence of `pattern` in `lines`, or `None` when the
/// pattern is absent or matches more than once.
fn find_unique(lines: &[String], pattern: &[String]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > lines.len() {
        return None;
    }
    let mut found = None;
    for start in 0..=(lines.len() - pattern.len()) {
        if lines[start..start + pattern.len()]
            .iter()
            .zip(pattern)
            .all(|(a, b)| a == b)
        {
            if found.is_some() {
                return None;
            }
            found = Some(start);
        }
    }
    found
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum EditOp<'a> {
    Keep(&'a str),
    Delete(&'a str),
    Insert(&'a str),
}

/// Group the edit script into hunks: each maximal run of non-keep edits plus
/// up to [`HUNK_CONTEXT`] surrounding lines of old-file context.
fn diff_hunks(old: &[&str], new: &[&str]) -> Vec<Hunk> {
    let script = edit_script(old, new);
    let mut hunks = Vec::new();
    let mut old_idx: usize = 0;
    let mut i = 0;

    while i < script.len() {
        if let EditOp::Keep(_) = script[i] {
            old_idx += 1;
            i += 1;
            continue;
        }

        let change_start = old_idx;
        let mut removed = Vec::new();
        let mut added = Vec::new();
        while i < script.len() {
            match script[i] {
                EditOp::Keep(_) => break,
                EditOp::Delete(line) => {
                    removed.push(line.to_string());
                    old_idx += 1;
                }
                EditOp::Insert(line) => added.push(line.to_string()),
            }
            i += 1;
        }

        let ctx_from = change_start.saturating_sub(HUNK_CONTEXT);
        let ctx_to = (old_idx + HUNK_CONTEXT).min(old.len());
        hunks.push(Hunk {
            context_before: old[ctx_from..change_start].iter().map(|s| s.to_string()).collect(),
            removed,
            added,
            context_after: old[old_idx..ctx_to].iter().map(|s| s.to_string()).collect(),
        });
    }

    hunks
}

/// Line-level edit script over the full files. The common prefix and suffix
/// are kept verbatim; the middle is LCS-diffed, falling back to one coarse
/// replacement when the middle is too large to diff quadratically.
fn edit_script<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<EditOp<'a>> {
    let mut prefix = 0;
    while prefix < old.len() && prefix < new.len() && old[prefix] == new[prefix] {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old.len() - prefix
        && suffix < new.len() - prefix
        && old[old.len() - 1 - suffix] == new[new.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let mut script: Vec<EditOp<'a>> = old[..prefix].iter().map(|l| EditOp::Keep(l)).collect();

    if old_mid.len() * new_mid.len() > MAX_DIFF_CELLS {
        script.extend(old_mid.iter().map(|l| EditOp::Delete(l)));
        script.extend(new_mid.iter().map(|l| EditOp::Insert(l)));
    } else {
        script.extend(lcs_script(old_mid, new_mid));
    }

    script.extend(old[old.len() - suffix..].iter().map(|l| EditOp::Keep(l)));
    script
}

fn lcs_script<'a>(old: &[&'a str], new: &[&'a str]) -> Vec<EditOp<'a>> {
    let n = old.len();
    let m = new.len();
    let mut table = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[idx(i, j)] = if old[i] == new[j] {
                table[idx(i + 1, j + 1)] + 1
            } else {
                table[idx(i + 1, j)].max(table[idx(i, j + 1)])
            };
        }
    }

    let mut script = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if old[i] == new[j] {
            script.push(EditOp::Keep(old[i]));
            i += 1;
            j += 1;
        } else if table[idx(i + 1, j)] >= table[idx(i, j + 1)] {
            script.push(EditOp::Delete(old[i]));
            i += 1;
        } else {
            script.push(EditOp::Insert(new[j]));
            j += 1;
        }
    }
    while i < n {
        script.push(EditOp::Delete(old[i]));
        i += 1;
    }
    while j < m {
        script.push(EditOp::Insert(new[j]));
        j += 1;
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── file block extraction ──

    #[test]
    fn test_extract_single_block() {
        let text = r#"Here is the change:
<file path="src/App.tsx">
export default function App() {}
</file>
Done."#;
        let files = extract_file_blocks(text);
        assert_eq!(files.len(), 1);
        assert_eq!(files["src/App.tsx"], "export default function App() {}\n");
    }

    #[test]
    fn test_extract_multiple_blocks_order_independent() {
        let text = concat!(
            "<file path=\"b.ts\">two</file>\n",
            "<file path=\"a.ts\">one</file>"
        );
        let files = extract_file_blocks(text);
        assert_eq!(files.len(), 2);
        assert_eq!(files["a.ts"], "one");
        assert_eq!(files["b.ts"], "two");
    }

    #[test]
    fn test_extract_normalizes_leading_slash() {
        let files = extract_file_blocks("<file path=\"/src/x.ts\">x</file>");
        assert!(files.contains_key("src/x.ts"));
    }

    #[test]
    fn test_extract_tolerates_unterminated_trailing_block() {
        let text = concat!(
            "<file path=\"a.ts\">done</file>\n",
            "<file path=\"b.ts\">\nconst b = 1;\n"
        );
        let files = extract_file_blocks(text);
        assert_eq!(files.len(), 2);
        assert_eq!(files["b.ts"], "const b = 1;\n");
    }

    #[test]
    fn test_extract_strips_code_fences() {
        let text = "<file path=\"a.ts\">\n```ts\nconst a = 1;\n```\n</file>";
        let files = extract_file_blocks(text);
        assert_eq!(files["a.ts"], "const a = 1;\n");
    }

    #[test]
    fn test_extract_empty_output() {
        assert!(extract_file_blocks("no blocks here").is_empty());
    }

    // ── conflict classification ──

    #[test]
    fn test_unchanged_base_is_clean() {
        // base == main: nothing changed underneath, any patch content merges
        assert_eq!(
            classify_file(Some("same"), Some("same"), "anything"),
            FileMergeState::CleanBase
        );
    }

    #[test]
    fn test_new_file_nobody_else_created_is_clean() {
        assert_eq!(classify_file(None, None, "new"), FileMergeState::CleanBase);
    }

    #[test]
    fn test_already_applied() {
        assert_eq!(
            classify_file(Some("old"), Some("patched"), "patched"),
            FileMergeState::AlreadyApplied
        );
    }

    #[test]
    fn test_untouched_by_branch() {
        assert_eq!(
            classify_file(Some("old"), Some("advanced"), "old"),
            FileMergeState::Untouched
        );
    }

    #[test]
    fn test_all_three_distinct_conflicts() {
        assert_eq!(
            classify_file(Some("base"), Some("main"), "patch"),
            FileMergeState::Conflicting
        );
    }

    #[test]
    fn test_missing_base_is_ambiguous() {
        // File created both underneath and by the branch, differently
        assert_eq!(
            classify_file(None, Some("theirs"), "ours"),
            FileMergeState::Ambiguous
        );
    }

    #[test]
    fn test_missing_main_is_ambiguous() {
        // File deleted underneath while the branch edited it
        assert_eq!(
            classify_file(Some("base"), None, "edited"),
            FileMergeState::Ambiguous
        );
    }

    // ── rebase ──

    #[test]
    fn test_rebase_disjoint_edits() {
        let base = "line1\nline2\nline3\nline4\nline5\nline6\nline7\nline8\n";
        // Patch edits line2
        let patch = "line1\nline2-patched\nline3\nline4\nline5\nline6\nline7\nline8\n";
        // Main edited line8 underneath
        let main = "line1\nline2\nline3\nline4\nline5\nline6\nline7\nline8-main\n";

        let rebased = rebase_file(base, main, patch).unwrap();
        assert_eq!(
            rebased,
            "line1\nline2-patched\nline3\nline4\nline5\nline6\nline7\nline8-main\n"
        );
    }

    #[test]
    fn test_rebase_fails_on_overlapping_edits() {
        let base = "a\nb\nc\n";
        let patch = "a\nB-patch\nc\n";
        let main = "a\nB-main\nc\n";
        // The hunk's removed line "b" no longer exists in main
        assert!(rebase_file(base, main, patch).is_none());
    }

    #[test]
    fn test_rebase_fails_on_ambiguous_match() {
        // The edited region appears twice in main, so the hunk has no unique home
        let base = "x\ny\n";
        let patch = "x\ny\nz\n";
        let main = "x\ny\nx\ny\n";
        assert!(rebase_file(base, main, patch).is_none());
    }

    #[test]
    fn test_rebase_pure_insertion() {
        let base = "fn main() {\n    start();\n}\n";
        let patch = "fn main() {\n    start();\n    finish();\n}\n";
        let main = "// header\nfn main() {\n    start();\n}\n";
        let rebased = rebase_file(base, main, patch).unwrap();
        assert_eq!(rebased, "// header\nfn main() {\n    start();\n    finish();\n}\n");
    }

    #[test]
    fn test_rebase_identity_shortcuts() {
        // Branch didn't touch the file: keep main
        assert_eq!(rebase_file("b", "m", "b").as_deref(), Some("m"));
        // Nothing changed underneath: take patch
        assert_eq!(rebase_file("b", "b", "p").as_deref(), Some("p"));
    }

    #[test]
    fn test_rebase_multiple_hunks() {
        let base = "one\ntwo\nthree\nfour\nfive\nsix\nseven\neight\nnine\nten\n";
        let patch = "one\nTWO\nthree\nfour\nfive\nsix\nseven\neight\nNINE\nten\n";
        let main = "zero\none\ntwo\nthree\nfour\nfive\nsix\nseven\neight\nnine\nten\n";
        let rebased = rebase_file(base, main, patch).unwrap();
        assert_eq!(
            rebased,
            "zero\none\nTWO\nthree\nfour\nfive\nsix\nseven\neight\nNINE\nten\n"
        );
    }

    // ── patch plumbing ──

    #[test]
    fn test_merge_files_appends_new_paths() {
        let mut patch = Patch::new(
            "t-1",
            0,
            [("a.ts".to_string(), "a".to_string())].into_iter().collect(),
        );
        patch.merge_files(
            [
                ("a.ts".to_string(), "a2".to_string()),
                ("b.ts".to_string(), "b".to_string()),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(patch.files["a.ts"], "a2");
        assert_eq!(patch.applied_files, vec!["a.ts", "b.ts"]);
    }
}
