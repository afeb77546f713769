use safeagent_core::{FileEdit, Manifest, PipelineError, Plan};
use safeagent_diff::diff_from_rewrite;
use safeagent_snapshot::WorkingCopy;
use std::fs;

pub const MANUAL_TARGET: &str = "README.md";
pub const MANUAL_HEADING: &str = "# SafeAgent manual test";
pub const MANUAL_MARKER: &str = "# SafeAgent manual test\n\n";

/// One-edit plan prepending the manual-test marker to the README. Exercises
/// the whole pipeline without a completion service.
pub fn manual_plan(wc: &WorkingCopy, manifest: &Manifest) -> Result<Plan, PipelineError> {
    let Some(hash) = manifest.get(MANUAL_TARGET) else {
        return Err(PipelineError::Completion(format!(
            "manual run needs {MANUAL_TARGET} in the repository"
        )));
    };
    let original = fs::read_to_string(wc.path().join(MANUAL_TARGET)).map_err(|err| {
        PipelineError::Completion(format!("cannot read {MANUAL_TARGET}: {err}"))
    })?;
    if original.contains(MANUAL_HEADING) {
        return Err(PipelineError::Completion(format!(
            "patch generation produced nothing: {MANUAL_TARGET} already carries the manual marker"
        )));
    }
    let rewritten = format!("{MANUAL_MARKER}{original}");
    let diff = diff_from_rewrite(MANUAL_TARGET, &original, &rewritten)
        .map_err(|err| PipelineError::Completion(format!("{err:#}")))?;
    if diff.is_empty() {
        return Err(PipelineError::Completion(
            "patch generation produced nothing".to_string(),
        ));
    }
    Ok(Plan::new(vec![FileEdit {
        file_path: MANUAL_TARGET.to_string(),
        original_hash: hash.clone(),
        unified_diff: diff,
    }]))
}
