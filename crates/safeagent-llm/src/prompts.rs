use safeagent_core::Manifest;
use serde_json::json;
use std::collections::BTreeMap;

pub const SELECT_SYSTEM: &str = "\
You are SafeAgent.

Given a change request and the list of files in a repository, reply with a JSON
array of the files that must be edited to fulfil it.

Rules:
- Pick only files from the list. Never invent paths.
- Reply with the JSON array only, no commentary.

Example:
[\"README.md\", \"app/main.py\"]
";

const PLAN_SCHEMA: &str = r#"{
  "edits": [
    {
      "file_path": "string",
      "original_hash": "string",
      "unified_diff": "string"
    }
  ]
}"#;

pub fn plan_system() -> String {
    format!(
        "You are SafeAgent, a careful code modification assistant.\n\n\
         Reply with JSON only, matching this schema:\n\n{PLAN_SCHEMA}\n\n\
         Rules:\n\
         - original_hash must be copied from the manifest for that file.\n\
         - unified_diff must apply with `git apply` and use a/ and b/ path prefixes.\n\
         - Edit only files shown in the context. Never create or delete files.\n\
         - Keep changes minimal. No explanations.\n"
    )
}

pub fn repair_system() -> String {
    format!(
        "You are SafeAgent repairing a patch that `git apply` rejected.\n\n\
         You receive the change request, the current file contents, the rejected\n\
         diff and the tool's error output.\n\n\
         Reply with JSON only, matching this schema:\n\n{PLAN_SCHEMA}\n\n\
         Rules:\n\
         - The new diff must apply cleanly to the contents shown.\n\
         - Do not touch unrelated lines. Never create or delete files.\n\
         - original_hash must be copied from the manifest. No explanations.\n"
    )
}

pub const REWRITE_SYSTEM: &str = "\
You are SafeAgent performing a full file rewrite.

Reply with the complete updated file content only: no explanations, no markdown
fences, no JSON.
";

pub fn select_user(intent: &str, candidates: &[String]) -> String {
    let listing = serde_json::to_string_pretty(candidates).unwrap_or_else(|_| "[]".to_string());
    format!("Change request:\n{intent}\n\nFiles:\n{listing}")
}

/// Inlines each file, cut at `max_chars` characters.
pub fn file_context(contents: &BTreeMap<String, String>, max_chars: usize) -> String {
    let mut context = String::new();
    for (path, content) in contents {
        let clipped: String = content.chars().take(max_chars).collect();
        context.push_str(&format!("\n### {path}\n{clipped}\n"));
    }
    context
}

fn digests_for(contents: &BTreeMap<String, String>, digests: &Manifest) -> BTreeMap<String, String> {
    contents
        .keys()
        .filter_map(|path| digests.get(path).map(|d| (path.clone(), d.clone())))
        .collect()
}

pub fn plan_user(
    intent: &str,
    contents: &BTreeMap<String, String>,
    digests: &Manifest,
    max_chars: usize,
) -> String {
    let manifest = json!({
        "prompt": intent,
        "files": contents.keys().collect::<Vec<_>>(),
        "hashes": digests_for(contents, digests),
    });
    format!(
        "Change request:\n{intent}\n\nContext:\n{}\n\nManifest:\n{}\n",
        file_context(contents, max_chars),
        serde_json::to_string_pretty(&manifest).unwrap_or_default()
    )
}

pub fn repair_user(
    intent: &str,
    contents: &BTreeMap<String, String>,
    digests: &Manifest,
    failed_diff: &str,
    tool_error: &str,
    max_chars: usize,
) -> String {
    let failure = json!({
        "prompt": intent,
        "files": contents.keys().collect::<Vec<_>>(),
        "hashes": digests_for(contents, digests),
        "previous_diff": failed_diff,
        "git_error": tool_error,
    });
    format!(
        "Context:\n{}\n\nFailure info:\n{}\n",
        file_context(contents, max_chars),
        serde_json::to_string_pretty(&failure).unwrap_or_default()
    )
}

pub fn rewrite_user(intent: &str, path: &str, content: &str) -> String {
    format!(
        "Change request:\n{intent}\n\nFile: {path}\n\nCurrent content:\n{content}\n\n\
         Return the full updated file content with minimal changes.\n"
    )
}
