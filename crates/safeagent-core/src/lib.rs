use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

mod config;
mod error;
mod retry;

pub use config::*;
pub use error::*;
pub use retry::*;

pub type Result<T> = anyhow::Result<T>;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".safeagent")
}

/// One proposed change to a file that already exists in the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub file_path: String,
    /// SHA-256 the author of the edit saw when writing the diff.
    pub original_hash: String,
    pub unified_diff: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub edits: Vec<FileEdit>,
}

impl Plan {
    pub fn new(edits: Vec<FileEdit>) -> Self {
        Self { edits }
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for edit in &self.edits {
            if !out.contains(&edit.file_path) {
                out.push(edit.file_path.clone());
            }
        }
        out
    }

    /// All edit diffs in plan order, each terminated by a newline, as one patch.
    pub fn combined_diff(&self) -> String {
        let mut out = String::new();
        for edit in &self.edits {
            out.push_str(&edit.unified_diff);
            if !edit.unified_diff.ends_with('\n') {
                out.push('\n');
            }
        }
        out
    }
}

/// Path to lowercase hex SHA-256 of the file's raw bytes.
pub type Manifest = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Rejected,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Rejected => "rejected",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Start,
    SnapshotReady,
    Validated,
    Applied,
    Verified,
    Published,
    Rejected,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Start => "start",
            RunState::SnapshotReady => "snapshot_ready",
            RunState::Validated => "validated",
            RunState::Applied => "applied",
            RunState::Verified => "verified",
            RunState::Published => "published",
            RunState::Rejected => "rejected",
            RunState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Published | RunState::Rejected | RunState::Failed
        )
    }

    pub fn status(&self) -> Option<RunStatus> {
        match self {
            RunState::Published => Some(RunStatus::Success),
            RunState::Rejected => Some(RunStatus::Rejected),
            RunState::Failed => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

pub fn is_valid_run_state_transition(from: &RunState, to: &RunState) -> bool {
    match from {
        RunState::Start => matches!(to, RunState::SnapshotReady | RunState::Failed),
        // Rejected is reachable here only for an empty or unusable plan.
        RunState::SnapshotReady => matches!(
            to,
            RunState::Validated | RunState::Rejected | RunState::Failed
        ),
        RunState::Validated => matches!(
            to,
            RunState::Applied | RunState::Rejected | RunState::Failed
        ),
        RunState::Applied => matches!(to, RunState::Verified | RunState::Failed),
        RunState::Verified => matches!(to, RunState::Published | RunState::Failed),
        RunState::Published | RunState::Rejected | RunState::Failed => false,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub at: DateTime<Utc>,
    pub state: RunState,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequestRef {
    pub number: u64,
    pub url: String,
}

/// Which publish sub-steps completed. Also the publish reference of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRef {
    pub branch: Option<String>,
    pub committed_files: Vec<String>,
    pub change_request: Option<ChangeRequestRef>,
    pub commented: bool,
}

impl PublishRef {
    pub fn is_empty(&self) -> bool {
        self.branch.is_none() && self.committed_files.is_empty() && self.change_request.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRequest {
    pub repo_url: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub final_state: RunState,
    pub files_changed: Vec<String>,
    pub plan: Option<Plan>,
    pub diff: Option<String>,
    pub trace: Vec<TraceEvent>,
    pub publish: Option<PublishRef>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub duration_sec: f64,
}

/// Per-run state passed explicitly through every pipeline stage.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub request: RunRequest,
    pub working_copy: PathBuf,
    started: Instant,
    state: RunState,
    trace: Vec<TraceEvent>,
}

impl RunContext {
    pub fn new(request: RunRequest, workspace_root: &Path) -> Self {
        let run_id = Uuid::now_v7();
        Self {
            run_id,
            request,
            working_copy: workspace_root.join(run_id.to_string()),
            started: Instant::now(),
            state: RunState::Start,
            trace: vec![TraceEvent {
                at: Utc::now(),
                state: RunState::Start,
                detail: "run started".to_string(),
            }],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn trace(&self) -> &[TraceEvent] {
        &self.trace
    }

    /// Moves to `to`, recording the transition. Invalid edges are refused.
    pub fn transition(&mut self, to: RunState, detail: impl Into<String>) -> Result<&TraceEvent> {
        if !is_valid_run_state_transition(&self.state, &to) {
            return Err(anyhow::anyhow!(
                "invalid run state transition {:?} -> {:?}",
                self.state,
                to
            ));
        }
        self.state = to;
        self.push_trace(detail.into());
        Ok(self.last_event())
    }

    /// Records a note against the current state without moving.
    pub fn note(&mut self, detail: impl Into<String>) -> &TraceEvent {
        self.push_trace(detail.into());
        self.last_event()
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn into_trace(self) -> Vec<TraceEvent> {
        self.trace
    }

    fn push_trace(&mut self, detail: String) {
        self.trace.push(TraceEvent {
            at: Utc::now(),
            state: self.state,
            detail,
        });
    }

    fn last_event(&self) -> &TraceEvent {
        // trace always holds the start event
        &self.trace[self.trace.len() - 1]
    }
}
