use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::Command;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyFailure {
    /// `git apply` ran and refused the patch; holds its raw diagnostic.
    #[error("{0}")]
    Rejected(String),
    /// The apply tool could not be run at all.
    #[error("failed to run git apply: {0}")]
    Tool(String),
}

pub trait PatchApplier {
    /// Applies the whole patch or nothing.
    fn apply(&self, workspace: &Path, diff: &str) -> std::result::Result<(), ApplyFailure>;
}

/// Lenient about line counts and whitespace, strict about conflicting content.
#[derive(Debug, Default, Clone)]
pub struct GitPatchApplier;

impl PatchApplier for GitPatchApplier {
    fn apply(&self, workspace: &Path, diff: &str) -> std::result::Result<(), ApplyFailure> {
        let mut patch_file = tempfile::Builder::new()
            .prefix("safeagent-patch-")
            .suffix(".diff")
            .tempfile()
            .map_err(|e| ApplyFailure::Tool(e.to_string()))?;
        patch_file
            .write_all(diff.as_bytes())
            .and_then(|_| patch_file.flush())
            .map_err(|e| ApplyFailure::Tool(e.to_string()))?;

        let output = Command::new("git")
            .arg("apply")
            .arg("--recount")
            .arg("--unidiff-zero")
            .arg("--whitespace=fix")
            .arg(patch_file.path())
            .current_dir(workspace)
            .output()
            .map_err(|e| ApplyFailure::Tool(e.to_string()))?;

        if output.status.success() {
            return Ok(());
        }
        let mut detail = String::from_utf8_lossy(&output.stdout).to_string();
        detail.push_str(&String::from_utf8_lossy(&output.stderr));
        if detail.trim().is_empty() {
            detail = format!("git apply exited with {}", output.status);
        }
        Err(ApplyFailure::Rejected(detail))
    }
}

/// What a diff's file headers claim to touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffTargets {
    pub paths: Vec<String>,
    pub creates_file: bool,
    pub deletes_file: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiffStats {
    pub additions: usize,
    pub deletions: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffLine<'a> {
    OldHeader(&'a str),
    NewHeader(&'a str),
    Meta(&'a str),
    Added,
    Removed,
    Other,
}

/// Classifies every line of a patch. Inside a hunk the `@@ -a,b +c,d @@`
/// counts decide how many lines are body, so a removed `-- comment` line
/// (`--- comment`) is a deletion and never a file header.
fn scan_diff(diff: &str) -> Vec<DiffLine<'_>> {
    let mut out = Vec::new();
    let mut old_left = 0usize;
    let mut new_left = 0usize;
    for line in diff.lines() {
        if old_left > 0 || new_left > 0 {
            match line.as_bytes().first() {
                Some(b'-') => {
                    old_left = old_left.saturating_sub(1);
                    out.push(DiffLine::Removed);
                    continue;
                }
                Some(b'+') => {
                    new_left = new_left.saturating_sub(1);
                    out.push(DiffLine::Added);
                    continue;
                }
                Some(b' ') | None => {
                    old_left = old_left.saturating_sub(1);
                    new_left = new_left.saturating_sub(1);
                    out.push(DiffLine::Other);
                    continue;
                }
                Some(b'\\') => {
                    out.push(DiffLine::Other);
                    continue;
                }
                // malformed hunk; resume header parsing
                _ => {
                    old_left = 0;
                    new_left = 0;
                }
            }
        }

        if let Some((old, new)) = parse_hunk_header(line) {
            old_left = old;
            new_left = new;
            out.push(DiffLine::Other);
        } else if let Some(raw) = line.strip_prefix("--- ") {
            out.push(DiffLine::OldHeader(raw));
        } else if let Some(raw) = line.strip_prefix("+++ ") {
            out.push(DiffLine::NewHeader(raw));
        } else if line.starts_with('-') {
            // body past an undercounted hunk; git apply --recount keeps it
            out.push(DiffLine::Removed);
        } else if line.starts_with('+') {
            out.push(DiffLine::Added);
        } else {
            out.push(DiffLine::Meta(line));
        }
    }
    out
}

/// Old and new line counts of a `@@ -a[,b] +c[,d] @@` header.
fn parse_hunk_header(line: &str) -> Option<(usize, usize)> {
    let mut parts = line.strip_prefix("@@ ")?.split_whitespace();
    let old = range_len(parts.next()?.strip_prefix('-')?)?;
    let new = range_len(parts.next()?.strip_prefix('+')?)?;
    Some((old, new))
}

fn range_len(range: &str) -> Option<usize> {
    match range.split_once(',') {
        Some((start, len)) => {
            start.parse::<usize>().ok()?;
            len.parse().ok()
        }
        None => range.parse::<usize>().ok().map(|_| 1),
    }
}

pub fn inspect_diff(diff: &str) -> DiffTargets {
    let mut paths = BTreeSet::new();
    let mut targets = DiffTargets::default();
    for line in scan_diff(diff) {
        match line {
            DiffLine::NewHeader(raw) => match parse_patch_path(raw) {
                Some(path) => {
                    paths.insert(path);
                }
                None => targets.deletes_file = true,
            },
            DiffLine::OldHeader(raw) => match parse_patch_path(raw) {
                Some(path) => {
                    paths.insert(path);
                }
                None => targets.creates_file = true,
            },
            DiffLine::Meta(meta) => {
                if meta.starts_with("new file mode") {
                    targets.creates_file = true;
                } else if meta.starts_with("deleted file mode") {
                    targets.deletes_file = true;
                } else if let Some(rest) = meta.strip_prefix("rename to ") {
                    paths.insert(rest.trim().to_string());
                }
            }
            DiffLine::Added | DiffLine::Removed | DiffLine::Other => {}
        }
    }
    targets.paths = paths.into_iter().collect();
    targets
}

fn parse_patch_path(raw: &str) -> Option<String> {
    // traditional diffs may append a tab and timestamp
    let raw = raw.split('\t').next().unwrap_or(raw).trim_end();
    if raw == "/dev/null" {
        return None;
    }
    let normalized = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    if normalized.is_empty() {
        return None;
    }
    Some(normalized.to_string())
}

/// Added and removed body lines, read hunk by hunk.
pub fn diff_stats(diff: &str) -> DiffStats {
    let mut stats = DiffStats::default();
    for line in scan_diff(diff) {
        match line {
            DiffLine::Added => stats.additions += 1,
            DiffLine::Removed => stats.deletions += 1,
            _ => {}
        }
    }
    stats
}

/// Unified diff turning `original` into `rewritten`, with headers naming `path`.
/// Works on temp files only; nothing in a working copy is touched.
pub fn diff_from_rewrite(path: &str, original: &str, rewritten: &str) -> Result<String> {
    let dir = tempfile::tempdir().context("failed to create diff scratch dir")?;
    fs::write(dir.path().join("before"), original)?;
    fs::write(dir.path().join("after"), rewritten)?;

    let output = Command::new("git")
        .args([
            "diff",
            "--no-index",
            "--no-color",
            "--no-ext-diff",
            "--",
            "before",
            "after",
        ])
        .current_dir(dir.path())
        .output()
        .context("failed to execute git diff")?;

    // --no-index exits 1 when the files differ
    match output.status.code() {
        Some(0) => return Ok(String::new()),
        Some(1) => {}
        _ => {
            return Err(anyhow!(
                "git diff failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
    }

    let raw = String::from_utf8_lossy(&output.stdout);
    let Some(hunks_at) = raw.find("\n@@").map(|idx| idx + 1) else {
        return Err(anyhow!("git diff produced no hunks for {path}"));
    };
    Ok(format!(
        "diff --git a/{path} b/{path}\n--- a/{path}\n+++ b/{path}\n{}",
        &raw[hunks_at..]
    ))
}
