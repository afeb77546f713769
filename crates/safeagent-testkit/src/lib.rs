//! In-memory doubles for the pipeline's collaborators plus fixture helpers.
//! Every double is cheaply cloneable and shares its state, so a test can hand
//! one clone to the pipeline and inspect another afterwards.

use anyhow::{Result, anyhow};
use safeagent_core::{ChangeRequestRef, ExecutionResult, FileEdit, Manifest, Plan, RunRequest};
use safeagent_diff::{ApplyFailure, GitPatchApplier, PatchApplier, sha256_hex};
use safeagent_llm::{CompletionService, RepairRequest};
use safeagent_publish::Publisher;
use safeagent_snapshot::RepoSource;
use safeagent_store::AuditRecorder;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|out| out.status.success())
}

pub fn temp_workspace(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("safeagent-{label}-{}", Uuid::now_v7()));
    let _ = fs::create_dir_all(&dir);
    dir
}

/// Edit whose hash matches `original`.
pub fn edit_for(path: &str, original: &str, diff: &str) -> FileEdit {
    FileEdit {
        file_path: path.to_string(),
        original_hash: sha256_hex(original.as_bytes()),
        unified_diff: diff.to_string(),
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Writes a fixed file tree into the destination instead of cloning.
#[derive(Debug, Clone, Default)]
pub struct FixtureSource {
    files: BTreeMap<String, Vec<u8>>,
    failures_left: Arc<Mutex<u32>>,
    fetches: Arc<Mutex<u32>>,
}

impl FixtureSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: &str, content: &str) -> Self {
        self.files.insert(path.to_string(), content.as_bytes().to_vec());
        self
    }

    pub fn with_bytes(mut self, path: &str, content: &[u8]) -> Self {
        self.files.insert(path.to_string(), content.to_vec());
        self
    }

    /// The first `n` fetches fail after leaving a partial tree behind.
    pub fn failing_first(self, n: u32) -> Self {
        *lock(&self.failures_left) = n;
        self
    }

    pub fn fetches(&self) -> u32 {
        *lock(&self.fetches)
    }
}

impl RepoSource for FixtureSource {
    fn fetch(&self, _repo_url: &str, dest: &Path) -> Result<()> {
        *lock(&self.fetches) += 1;
        fs::create_dir_all(dest)?;
        let mut failures = lock(&self.failures_left);
        if *failures > 0 {
            *failures -= 1;
            fs::write(dest.join(".partial"), b"half-cloned")?;
            return Err(anyhow!("simulated clone failure"));
        }
        for (rel, bytes) in &self.files {
            let full = dest.join(rel);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(full, bytes)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompletionCalls {
    pub select: u32,
    pub generate: u32,
    pub repair: u32,
    pub rewrite: u32,
    /// Tool errors handed to each repair call, in order.
    pub repair_errors: Vec<String>,
}

#[derive(Default)]
struct Script {
    selections: VecDeque<Result<Vec<String>, String>>,
    plans: VecDeque<Result<Plan, String>>,
    repairs: VecDeque<Result<Plan, String>>,
    rewrites: VecDeque<Result<String, String>>,
    calls: CompletionCalls,
}

/// Completion service answering from queues; an empty queue is an error.
#[derive(Clone, Default)]
pub struct ScriptedCompletion {
    script: Arc<Mutex<Script>>,
}

impl ScriptedCompletion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selection(self, paths: &[&str]) -> Self {
        lock(&self.script)
            .selections
            .push_back(Ok(paths.iter().map(|p| p.to_string()).collect()));
        self
    }

    pub fn with_plan(self, plan: Plan) -> Self {
        lock(&self.script).plans.push_back(Ok(plan));
        self
    }

    pub fn with_plan_error(self, message: &str) -> Self {
        lock(&self.script).plans.push_back(Err(message.to_string()));
        self
    }

    pub fn with_repair(self, plan: Plan) -> Self {
        lock(&self.script).repairs.push_back(Ok(plan));
        self
    }

    pub fn with_repeated_repair(self, plan: Plan, times: usize) -> Self {
        {
            let mut script = lock(&self.script);
            for _ in 0..times {
                script.repairs.push_back(Ok(plan.clone()));
            }
        }
        self
    }

    pub fn with_repair_error(self, message: &str) -> Self {
        lock(&self.script).repairs.push_back(Err(message.to_string()));
        self
    }

    pub fn with_rewrite(self, content: &str) -> Self {
        lock(&self.script).rewrites.push_back(Ok(content.to_string()));
        self
    }

    pub fn calls(&self) -> CompletionCalls {
        lock(&self.script).calls.clone()
    }
}

fn scripted<T>(queue: &mut VecDeque<Result<T, String>>, what: &str) -> Result<T> {
    match queue.pop_front() {
        Some(Ok(value)) => Ok(value),
        Some(Err(message)) => Err(anyhow!(message)),
        None => Err(anyhow!("no scripted {what} left")),
    }
}

impl CompletionService for ScriptedCompletion {
    fn select_files(&self, _intent: &str, candidates: &[String]) -> Result<Vec<String>> {
        let mut script = lock(&self.script);
        script.calls.select += 1;
        let selected = scripted(&mut script.selections, "selection")?;
        Ok(safeagent_llm::narrow_selection(selected, candidates))
    }

    fn generate_plan(
        &self,
        _intent: &str,
        _contents: &BTreeMap<String, String>,
        _digests: &Manifest,
    ) -> Result<Plan> {
        let mut script = lock(&self.script);
        script.calls.generate += 1;
        scripted(&mut script.plans, "plan")
    }

    fn repair_plan(&self, request: &RepairRequest<'_>) -> Result<Plan> {
        let mut script = lock(&self.script);
        script.calls.repair += 1;
        script.calls.repair_errors.push(request.tool_error.to_string());
        scripted(&mut script.repairs, "repair")
    }

    fn rewrite_file(&self, _intent: &str, _path: &str, _content: &str) -> Result<String> {
        let mut script = lock(&self.script);
        script.calls.rewrite += 1;
        scripted(&mut script.rewrites, "rewrite")
    }
}

#[derive(Debug, Clone)]
enum ApplyMode {
    Git,
    AlwaysReject(String),
    RejectFirst(u32, String),
}

/// Records every diff handed to it; applies with git or rejects on script.
#[derive(Debug, Clone)]
pub struct TrackingApplier {
    mode: Arc<Mutex<ApplyMode>>,
    diffs: Arc<Mutex<Vec<String>>>,
}

impl TrackingApplier {
    pub fn git() -> Self {
        Self::with_mode(ApplyMode::Git)
    }

    pub fn always_rejecting(detail: &str) -> Self {
        Self::with_mode(ApplyMode::AlwaysReject(detail.to_string()))
    }

    /// Rejects the first `n` diffs, then applies with git.
    pub fn rejecting_first(n: u32, detail: &str) -> Self {
        Self::with_mode(ApplyMode::RejectFirst(n, detail.to_string()))
    }

    fn with_mode(mode: ApplyMode) -> Self {
        Self {
            mode: Arc::new(Mutex::new(mode)),
            diffs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls(&self) -> usize {
        lock(&self.diffs).len()
    }

    pub fn diffs(&self) -> Vec<String> {
        lock(&self.diffs).clone()
    }
}

impl PatchApplier for TrackingApplier {
    fn apply(&self, workspace: &Path, diff: &str) -> std::result::Result<(), ApplyFailure> {
        lock(&self.diffs).push(diff.to_string());
        let mut mode = lock(&self.mode);
        match &mut *mode {
            ApplyMode::Git => GitPatchApplier.apply(workspace, diff),
            ApplyMode::AlwaysReject(detail) => Err(ApplyFailure::Rejected(detail.clone())),
            ApplyMode::RejectFirst(left, detail) => {
                if *left > 0 {
                    *left -= 1;
                    return Err(ApplyFailure::Rejected(detail.clone()));
                }
                GitPatchApplier.apply(workspace, diff)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    CreateBranch,
    Commit,
    OpenChangeRequest,
    Comment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommit {
    pub branch: String,
    pub path: String,
    pub content: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedChangeRequest {
    pub branch: String,
    pub title: String,
    pub body: String,
}

#[derive(Debug, Default)]
struct PublisherState {
    fail_at: Option<PublishStep>,
    branches: Vec<String>,
    commits: Vec<RecordedCommit>,
    change_requests: Vec<RecordedChangeRequest>,
    comments: Vec<(u64, String)>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    state: Arc<Mutex<PublisherState>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_at(step: PublishStep) -> Self {
        let publisher = Self::default();
        lock(&publisher.state).fail_at = Some(step);
        publisher
    }

    pub fn branches(&self) -> Vec<String> {
        lock(&self.state).branches.clone()
    }

    pub fn commits(&self) -> Vec<RecordedCommit> {
        lock(&self.state).commits.clone()
    }

    pub fn change_requests(&self) -> Vec<RecordedChangeRequest> {
        lock(&self.state).change_requests.clone()
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        lock(&self.state).comments.clone()
    }

    fn check(&self, step: PublishStep) -> Result<()> {
        if lock(&self.state).fail_at == Some(step) {
            return Err(anyhow!("simulated {step:?} failure"));
        }
        Ok(())
    }
}

impl Publisher for RecordingPublisher {
    fn create_branch(&self, name: &str) -> Result<()> {
        self.check(PublishStep::CreateBranch)?;
        lock(&self.state).branches.push(name.to_string());
        Ok(())
    }

    fn commit_file(&self, branch: &str, path: &str, content: &str, message: &str) -> Result<()> {
        self.check(PublishStep::Commit)?;
        lock(&self.state).commits.push(RecordedCommit {
            branch: branch.to_string(),
            path: path.to_string(),
            content: content.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    fn open_change_request(&self, branch: &str, title: &str, body: &str) -> Result<ChangeRequestRef> {
        self.check(PublishStep::OpenChangeRequest)?;
        let mut state = lock(&self.state);
        state.change_requests.push(RecordedChangeRequest {
            branch: branch.to_string(),
            title: title.to_string(),
            body: body.to_string(),
        });
        let number = state.change_requests.len() as u64;
        Ok(ChangeRequestRef {
            number,
            url: format!("https://example.test/pull/{number}"),
        })
    }

    fn comment_on_change_request(&self, change: &ChangeRequestRef, body: &str) -> Result<()> {
        self.check(PublishStep::Comment)?;
        lock(&self.state)
            .comments
            .push((change.number, body.to_string()));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RecordedRun {
    pub id: String,
    pub result: ExecutionResult,
    pub request: RunRequest,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryAuditRecorder {
    runs: Arc<Mutex<Vec<RecordedRun>>>,
    failing: bool,
}

impl MemoryAuditRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn runs(&self) -> Vec<RecordedRun> {
        lock(&self.runs).clone()
    }
}

impl AuditRecorder for MemoryAuditRecorder {
    fn record(&self, result: &ExecutionResult, request: &RunRequest) -> Result<String> {
        if self.failing {
            return Err(anyhow!("audit store unavailable"));
        }
        let id = Uuid::now_v7().to_string();
        lock(&self.runs).push(RecordedRun {
            id: id.clone(),
            result: result.clone(),
            request: request.clone(),
        });
        Ok(id)
    }
}
