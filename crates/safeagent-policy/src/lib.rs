use safeagent_core::{FileEdit, Plan};
use safeagent_diff::{diff_stats, inspect_diff};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("edit to {path} is under forbidden prefix {prefix}")]
    ForbiddenPath { path: String, prefix: String },
    #[error("diff for {declared} touches undeclared path {actual}")]
    UndeclaredTarget { declared: String, actual: String },
    #[error("diff for {path} creates or deletes a file")]
    FileLifecycle { path: String },
    #[error("unsafe diff: deletes too many lines ({deletions} > {max})")]
    DestructiveDiff { deletions: usize, max: usize },
}

#[derive(Debug, Clone)]
pub struct PolicyGate {
    forbidden_prefixes: Vec<String>,
    max_deleted_lines: usize,
}

impl PolicyGate {
    pub fn new(forbidden_prefixes: Vec<String>, max_deleted_lines: usize) -> Self {
        Self {
            forbidden_prefixes,
            max_deleted_lines,
        }
    }

    pub fn from_app_config(cfg: &safeagent_core::PolicyConfig) -> Self {
        Self::new(cfg.forbidden_prefixes.clone(), cfg.max_deleted_lines)
    }

    /// Runs every check over the whole plan. Nothing is filtered; the first
    /// violation rejects the plan.
    pub fn check_plan(&self, plan: &Plan) -> Result<(), PolicyError> {
        for edit in &plan.edits {
            self.check_path(&edit.file_path)?;
            self.check_declared_targets(edit)?;
        }
        self.check_deletions(plan)
    }

    pub fn check_path(&self, path: &str) -> Result<(), PolicyError> {
        let normalized = path.trim_start_matches("./");
        for prefix in &self.forbidden_prefixes {
            if !prefix.is_empty() && normalized.starts_with(prefix.as_str()) {
                return Err(PolicyError::ForbiddenPath {
                    path: path.to_string(),
                    prefix: prefix.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_declared_targets(&self, edit: &FileEdit) -> Result<(), PolicyError> {
        let targets = inspect_diff(&edit.unified_diff);
        if targets.creates_file || targets.deletes_file {
            return Err(PolicyError::FileLifecycle {
                path: edit.file_path.clone(),
            });
        }
        for actual in targets.paths {
            // a header naming a forbidden path is reported as such
            self.check_path(&actual)?;
            if actual != edit.file_path {
                return Err(PolicyError::UndeclaredTarget {
                    declared: edit.file_path.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }

    fn check_deletions(&self, plan: &Plan) -> Result<(), PolicyError> {
        let deletions = plan
            .edits
            .iter()
            .map(|edit| count_deleted_lines(&edit.unified_diff))
            .sum::<usize>();
        if deletions > self.max_deleted_lines {
            return Err(PolicyError::DestructiveDiff {
                deletions,
                max: self.max_deleted_lines,
            });
        }
        Ok(())
    }
}

/// Removed body lines. Hunk headers bound each hunk, so a deleted line that
/// itself starts with `--` still counts.
pub fn count_deleted_lines(diff: &str) -> usize {
    diff_stats(diff).deletions
}
