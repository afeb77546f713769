use crate::{PublishRef, RunState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationStage {
    Syntax,
    Tests,
}

impl std::fmt::Display for VerificationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerificationStage::Syntax => write!(f, "syntax"),
            VerificationStage::Tests => write!(f, "tests"),
        }
    }
}

/// Terminal failure of a pipeline run.
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("failed to acquire working copy of {repo_url} after {attempts} attempts: {detail}")]
    Acquisition {
        repo_url: String,
        attempts: u32,
        detail: String,
    },
    #[error("stale plan for {path}: expected {expected}, found {}", .actual.as_deref().unwrap_or("<missing>"))]
    StalePlan {
        path: String,
        expected: String,
        actual: Option<String>,
    },
    #[error("blocked by policy: {0}")]
    PolicyViolation(String),
    #[error("patch failed to apply: {0}")]
    Apply(String),
    #[error("patch still failing after {cycles} repair cycles: {detail}")]
    RepairExhausted { cycles: u32, detail: String },
    #[error("verification failed ({stage}): {detail}")]
    Verification {
        stage: VerificationStage,
        detail: String,
    },
    #[error("publish failed after partial progress: {detail}")]
    Publish {
        detail: String,
        progress: PublishRef,
    },
    #[error("completion service error: {0}")]
    Completion(String),
}

impl PipelineError {
    /// Stable name stored with the audit record.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Acquisition { .. } => "AcquisitionError",
            PipelineError::StalePlan { .. } => "StalePlanError",
            PipelineError::PolicyViolation(_) => "PolicyViolation",
            PipelineError::Apply(_) => "ApplyError",
            PipelineError::RepairExhausted { .. } => "RepairExhausted",
            PipelineError::Verification { .. } => "VerificationError",
            PipelineError::Publish { .. } => "PublishError",
            PipelineError::Completion(_) => "CompletionError",
        }
    }

    pub fn terminal_state(&self) -> RunState {
        match self {
            PipelineError::StalePlan { .. } | PipelineError::PolicyViolation(_) => {
                RunState::Rejected
            }
            _ => RunState::Failed,
        }
    }

    /// Publish sub-steps that completed before the failure, if any.
    pub fn partial_publish(&self) -> Option<&PublishRef> {
        match self {
            PipelineError::Publish { progress, .. } if !progress.is_empty() => Some(progress),
            _ => None,
        }
    }
}
