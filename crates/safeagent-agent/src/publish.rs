use safeagent_core::{PipelineError, Plan, PublishConfig, PublishRef, RunContext};
use safeagent_publish::{Publisher, branch_name};
use safeagent_snapshot::WorkingCopy;
use std::fs;

const TITLE_MAX_CHARS: usize = 72;

pub struct PublishOutcome {
    pub reference: PublishRef,
    /// Set when the change request exists but the summary comment failed.
    pub comment_error: Option<String>,
}

/// Branch, commits, change request, then the optional comment. Progress is
/// tracked so a failure reports exactly which remote writes already happened.
pub fn publish_changes(
    publisher: &dyn Publisher,
    cfg: &PublishConfig,
    ctx: &RunContext,
    wc: &WorkingCopy,
    plan: &Plan,
    verification: &[String],
) -> Result<PublishOutcome, PipelineError> {
    let prompt_line = first_line(&ctx.request.prompt);
    let branch = branch_name(&cfg.branch_prefix, &ctx.request.prompt, &ctx.run_id.to_string());
    let mut progress = PublishRef::default();
    let fail = |progress: &PublishRef, detail: String| PipelineError::Publish {
        detail,
        progress: progress.clone(),
    };

    publisher
        .create_branch(&branch)
        .map_err(|err| fail(&progress, format!("create branch {branch}: {err:#}")))?;
    progress.branch = Some(branch.clone());

    let message = format!("safeagent: {prompt_line}");
    for path in plan.paths() {
        let content = fs::read_to_string(wc.path().join(&path))
            .map_err(|err| fail(&progress, format!("read {path}: {err}")))?;
        publisher
            .commit_file(&branch, &path, &content, &message)
            .map_err(|err| fail(&progress, format!("commit {path}: {err:#}")))?;
        progress.committed_files.push(path);
    }

    let title = format!("SafeAgent: {}", truncate_chars(prompt_line, TITLE_MAX_CHARS));
    let body = change_request_body(&ctx.request.prompt, &progress.committed_files, verification);
    let change = publisher
        .open_change_request(&branch, &title, &body)
        .map_err(|err| fail(&progress, format!("open change request: {err:#}")))?;
    progress.change_request = Some(change.clone());

    let mut comment_error = None;
    if cfg.comment_summary {
        let comment = format!("Verification summary:\n{}", bullet_list(verification));
        match publisher.comment_on_change_request(&change, &comment) {
            Ok(()) => progress.commented = true,
            Err(err) => comment_error = Some(format!("{err:#}")),
        }
    }

    Ok(PublishOutcome {
        reference: progress,
        comment_error,
    })
}

fn change_request_body(prompt: &str, files: &[String], verification: &[String]) -> String {
    let quoted: Vec<String> = prompt.lines().map(|l| format!("> {l}")).collect();
    format!(
        "Automated change by SafeAgent.\n\nRequest:\n{}\n\nFiles changed:\n{}\n\nVerification:\n{}\n",
        quoted.join("\n"),
        bullet_list(files),
        bullet_list(verification)
    )
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_quotes_prompt_and_lists_files() {
        let body = change_request_body(
            "Fix typo\nin the intro",
            &["README.md".to_string()],
            &["syntax: skipped".to_string()],
        );
        assert!(body.contains("> Fix typo\n> in the intro"));
        assert!(body.contains("- README.md"));
        assert!(body.contains("- syntax: skipped"));
    }

    #[test]
    fn titles_are_capped() {
        let long = "x".repeat(100);
        assert_eq!(truncate_chars(&long, TITLE_MAX_CHARS).len(), 72);
        assert_eq!(bullet_list(&[]), "- (none)");
    }
}
