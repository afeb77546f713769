use crate::trace_note;
use crate::validate::validate_plan;
use safeagent_core::{
    FileEdit, Manifest, PipelineError, Plan, RepairConfig, RetryDecision, RetryError, RetryPolicy,
    RunContext,
};
use safeagent_diff::{ApplyFailure, PatchApplier, diff_from_rewrite};
use safeagent_llm::{CompletionService, RepairRequest};
use safeagent_observe::Observer;
use safeagent_policy::PolicyGate;
use safeagent_snapshot::{SnapshotService, WorkingCopy};
use std::collections::BTreeMap;
use std::fs;

/// The plan that finally applied and the exact patch text handed to the applier.
#[derive(Debug, Clone)]
pub struct AppliedPlan {
    pub plan: Plan,
    pub diff: String,
    pub repair_cycles: u32,
}

enum AttemptError {
    /// The applier refused the patch; holds its raw diagnostic.
    Rejected(String),
    Fatal(PipelineError),
}

pub struct RepairLoop<'a> {
    pub completion: &'a dyn CompletionService,
    pub applier: &'a dyn PatchApplier,
    pub snapshot: &'a SnapshotService,
    pub policy: &'a PolicyGate,
    pub observer: &'a Observer,
    pub cfg: &'a RepairConfig,
    pub max_file_bytes: usize,
}

impl RepairLoop<'_> {
    /// Applies `plan`, asking for a repaired plan after each rejected attempt.
    /// Every repaired plan is re-validated before it may touch the working copy.
    pub fn run(
        &self,
        ctx: &mut RunContext,
        wc: &WorkingCopy,
        plan: Plan,
    ) -> Result<AppliedPlan, PipelineError> {
        let max_cycles = self.cfg.max_cycles;
        let intent = ctx.request.prompt.clone();
        let mut current = plan;
        let mut last_error = String::new();
        let mut cycles = 0;

        let outcome = RetryPolicy::immediate(max_cycles.saturating_add(1)).run(
            |attempt| {
                if attempt > 0 {
                    let rewrite = self.cfg.rewrite_fallback && attempt == max_cycles;
                    trace_note(
                        self.observer,
                        ctx,
                        format!(
                            "repair cycle {attempt}/{max_cycles}{}",
                            if rewrite { " (full-file rewrite)" } else { "" }
                        ),
                    );
                    cycles = attempt;
                    current = self
                        .next_plan(&intent, wc, &current, &last_error, rewrite)
                        .map_err(AttemptError::Fatal)?;
                    trace_note(
                        self.observer,
                        ctx,
                        format!("repaired plan accepted: {} edit(s)", current.edits.len()),
                    );
                }
                let diff = current.combined_diff();
                match self.applier.apply(wc.path(), &diff) {
                    Ok(()) => Ok(diff),
                    Err(ApplyFailure::Rejected(detail)) => {
                        trace_note(
                            self.observer,
                            ctx,
                            format!("apply attempt {} rejected: {}", attempt + 1, first_line(&detail)),
                        );
                        last_error = detail.clone();
                        Err(AttemptError::Rejected(detail))
                    }
                    Err(ApplyFailure::Tool(detail)) => {
                        Err(AttemptError::Fatal(PipelineError::Apply(detail)))
                    }
                }
            },
            |err| match err {
                AttemptError::Rejected(_) => RetryDecision::Retry,
                AttemptError::Fatal(_) => RetryDecision::Fatal,
            },
        );

        match outcome {
            Ok(diff) => Ok(AppliedPlan {
                plan: current,
                diff,
                repair_cycles: cycles,
            }),
            Err(RetryError::Exhausted { last, .. }) => {
                let detail = match last {
                    AttemptError::Rejected(detail) => detail,
                    AttemptError::Fatal(err) => return Err(err),
                };
                Err(PipelineError::RepairExhausted {
                    cycles: max_cycles,
                    detail,
                })
            }
            Err(RetryError::Fatal { error, .. }) => match error {
                AttemptError::Fatal(err) => Err(err),
                AttemptError::Rejected(detail) => Err(PipelineError::Apply(detail)),
            },
        }
    }

    fn next_plan(
        &self,
        intent: &str,
        wc: &WorkingCopy,
        failed: &Plan,
        tool_error: &str,
        rewrite: bool,
    ) -> Result<Plan, PipelineError> {
        // git apply is atomic, so these are still the pre-patch contents.
        let contents = self.snapshot.read(wc, &failed.paths(), self.max_file_bytes);
        let digests = self.snapshot.manifest(wc);
        let plan = if rewrite {
            self.rewrite_plan(intent, wc, &contents, &digests)?
        } else {
            self.completion
                .repair_plan(&RepairRequest {
                    intent,
                    contents: &contents,
                    digests: &digests,
                    failed_diff: &failed.combined_diff(),
                    tool_error,
                })
                .map_err(|err| PipelineError::Completion(format!("repair failed: {err:#}")))?
        };
        validate_plan(&plan, &digests, self.policy)?;
        Ok(plan)
    }

    /// Full-file rewrites of the failed plan's targets. Files larger than the
    /// read cap are left out, since only their prefix is known.
    fn rewrite_plan(
        &self,
        intent: &str,
        wc: &WorkingCopy,
        contents: &BTreeMap<String, String>,
        digests: &Manifest,
    ) -> Result<Plan, PipelineError> {
        let mut edits = Vec::new();
        for (path, original) in contents {
            if !fully_read(wc, path, original) {
                continue;
            }
            let rewritten = self
                .completion
                .rewrite_file(intent, path, original)
                .map_err(|err| PipelineError::Completion(format!("rewrite of {path} failed: {err:#}")))?;
            let diff = diff_from_rewrite(path, original, &rewritten)
                .map_err(|err| PipelineError::Apply(format!("{err:#}")))?;
            if diff.is_empty() {
                continue;
            }
            edits.push(FileEdit {
                file_path: path.clone(),
                original_hash: digests.get(path).cloned().unwrap_or_default(),
                unified_diff: diff,
            });
        }
        if edits.is_empty() {
            return Err(PipelineError::Completion(
                "full-file rewrite produced no changes".to_string(),
            ));
        }
        Ok(Plan::new(edits))
    }
}

fn fully_read(wc: &WorkingCopy, path: &str, content: &str) -> bool {
    fs::metadata(wc.path().join(path)).is_ok_and(|meta| meta.len() == content.len() as u64)
}

fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_skips_blank_lines() {
        assert_eq!(
            first_line("\n  error: patch failed: README.md:1\nerror: README.md: patch does not apply"),
            "error: patch failed: README.md:1"
        );
        assert_eq!(first_line(""), "");
    }
}
