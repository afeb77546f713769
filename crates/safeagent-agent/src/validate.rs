use safeagent_core::{Manifest, PipelineError, Plan};
use safeagent_policy::PolicyGate;

/// Optimistic concurrency check followed by the policy gate. Neither touches
/// the working copy.
pub fn validate_plan(
    plan: &Plan,
    manifest: &Manifest,
    policy: &PolicyGate,
) -> Result<(), PipelineError> {
    if plan.is_empty() {
        return Err(PipelineError::PolicyViolation(
            "plan contains no edits".to_string(),
        ));
    }
    for edit in &plan.edits {
        match manifest.get(&edit.file_path) {
            Some(actual) if actual.eq_ignore_ascii_case(edit.original_hash.trim()) => {}
            actual => {
                return Err(PipelineError::StalePlan {
                    path: edit.file_path.clone(),
                    expected: edit.original_hash.clone(),
                    actual: actual.cloned(),
                });
            }
        }
    }
    policy
        .check_plan(plan)
        .map_err(|err| PipelineError::PolicyViolation(err.to_string()))
}
