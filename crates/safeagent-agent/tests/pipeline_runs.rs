use anyhow::Result;
use safeagent_agent::{
    CommandOutcome, CommandRunner, MANUAL_HEADING, MANUAL_MARKER, Pipeline, PipelineServices,
};
use safeagent_core::{AppConfig, Plan, PublishRef, RunRequest, RunState, RunStatus, TelemetryConfig};
use safeagent_observe::Observer;
use safeagent_testkit::{
    FixtureSource, MemoryAuditRecorder, PublishStep, RecordingPublisher, ScriptedCompletion,
    TrackingApplier, edit_for, git_available, temp_workspace,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const README: &str = "# Widgets\n\nA small library.\n";
const README_INSERT: &str = "--- a/README.md\n+++ b/README.md\n@@ -1,3 +1,4 @@\n # Widgets\n+Now with more widgets.\n \n A small library.\n";
const README_PATCHED: &str = "# Widgets\nNow with more widgets.\n\nA small library.\n";

#[derive(Clone)]
struct FixedRunner {
    status: Option<i32>,
    commands: Arc<Mutex<Vec<String>>>,
}

impl FixedRunner {
    fn exiting(status: i32) -> Self {
        Self {
            status: Some(status),
            commands: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl CommandRunner for FixedRunner {
    fn run(&self, cmd: &str, _cwd: &Path, _timeout: Duration) -> Result<CommandOutcome> {
        self.commands.lock().expect("lock").push(cmd.to_string());
        Ok(CommandOutcome {
            status: self.status,
            output: "collected 2 items\n1 failed".to_string(),
            timed_out: false,
        })
    }
}

struct Harness {
    root: PathBuf,
    cfg: AppConfig,
    source: FixtureSource,
    completion: ScriptedCompletion,
    applier: TrackingApplier,
    publisher: RecordingPublisher,
    recorder: MemoryAuditRecorder,
    runner: FixedRunner,
}

impl Harness {
    fn new(source: FixtureSource) -> Self {
        let root = temp_workspace("pipeline");
        let mut cfg = AppConfig::default();
        cfg.snapshot.workspace_root = root.join("runs").to_string_lossy().to_string();
        cfg.snapshot.clone_backoff_ms = 0;
        cfg.policy.forbidden_prefixes = Vec::new();
        cfg.verify.require_tests = false;
        Self {
            root,
            cfg,
            source,
            completion: ScriptedCompletion::new(),
            applier: TrackingApplier::git(),
            publisher: RecordingPublisher::new(),
            recorder: MemoryAuditRecorder::new(),
            runner: FixedRunner::exiting(0),
        }
    }

    fn readme() -> Self {
        Self::new(FixtureSource::new().with_file("README.md", README))
    }

    fn pipeline(&self) -> Pipeline {
        let observer = Observer::new(&self.root, &TelemetryConfig::default()).expect("observer");
        Pipeline::new(
            self.cfg.clone(),
            PipelineServices {
                source: Box::new(self.source.clone()),
                completion: Box::new(self.completion.clone()),
                applier: Box::new(self.applier.clone()),
                publisher: Box::new(self.publisher.clone()),
                recorder: Box::new(self.recorder.clone()),
                test_runner: Box::new(self.runner.clone()),
            },
            observer,
        )
    }

    fn kept_file(&self, run_id: &str, path: &str) -> String {
        let full = Path::new(&self.cfg.snapshot.workspace_root)
            .join(run_id)
            .join(path);
        fs::read_to_string(full).expect("read kept working copy")
    }
}

fn request(prompt: &str) -> RunRequest {
    RunRequest {
        repo_url: "https://github.com/acme/widgets.git".to_string(),
        prompt: prompt.to_string(),
    }
}

fn readme_plan() -> Plan {
    Plan::new(vec![edit_for("README.md", README, README_INSERT)])
}

fn states(trace: &[safeagent_core::TraceEvent]) -> Vec<RunState> {
    let mut out: Vec<RunState> = Vec::new();
    for event in trace {
        if out.last() != Some(&event.state) {
            out.push(event.state);
        }
    }
    out
}

#[test]
fn valid_readme_insert_is_published_and_audited() {
    if !git_available() {
        return;
    }
    let h = Harness::readme();
    let report = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), readme_plan())
        .expect("run");

    let result = &report.result;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.final_state, RunState::Published);
    assert_eq!(result.diff.as_deref(), Some(README_INSERT));
    assert_eq!(result.files_changed, vec!["README.md".to_string()]);
    assert_eq!(
        states(&result.trace),
        vec![
            RunState::Start,
            RunState::SnapshotReady,
            RunState::Validated,
            RunState::Applied,
            RunState::Verified,
            RunState::Published,
        ]
    );

    let commits = h.publisher.commits();
    assert_eq!(commits.len(), 1);
    assert_eq!(commits[0].content, README_PATCHED);
    assert_eq!(commits[0].message, "safeagent: Mention more widgets");
    assert!(commits[0].branch.starts_with("safeagent/mention-more-widgets-"));
    let change_requests = h.publisher.change_requests();
    assert_eq!(change_requests[0].title, "SafeAgent: Mention more widgets");
    assert_eq!(h.publisher.comments().len(), 1);

    let runs = h.recorder.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, report.audit_id);
    assert_eq!(runs[0].result.status, RunStatus::Success);
    assert_eq!(runs[0].result.diff.as_deref(), Some(README_INSERT));
    let publish = runs[0].result.publish.as_ref().expect("publish ref");
    assert_eq!(publish.committed_files, vec!["README.md".to_string()]);
    assert!(publish.commented);
}

#[test]
fn removed_sql_comment_line_applies_and_publishes() {
    if !git_available() {
        return;
    }
    let schema = "-- old comment\nSELECT 1;\n";
    let diff = "--- a/schema.sql\n+++ b/schema.sql\n@@ -1,2 +1,2 @@\n--- old comment\n+-- new comment\n SELECT 1;\n";
    let h = Harness::new(FixtureSource::new().with_file("schema.sql", schema));

    let result = h
        .pipeline()
        .execute_plan(
            request("Reword the schema comment"),
            Plan::new(vec![edit_for("schema.sql", schema, diff)]),
        )
        .expect("run")
        .result;
    assert_eq!(result.final_state, RunState::Published);
    assert_eq!(h.applier.calls(), 1);
    assert_eq!(h.publisher.commits()[0].content, "-- new comment\nSELECT 1;\n");
}

#[test]
fn wrong_hash_is_rejected_without_touching_anything() {
    let mut h = Harness::readme();
    h.cfg.snapshot.keep_working_copy = true;
    let mut plan = readme_plan();
    plan.edits[0].original_hash = "0".repeat(64);

    let report = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), plan)
        .expect("run");
    let result = &report.result;
    assert_eq!(result.status, RunStatus::Rejected);
    assert_eq!(result.error_kind.as_deref(), Some("StalePlanError"));
    assert_eq!(result.diff, None);
    assert_eq!(result.publish, None);
    assert!(result.files_changed.is_empty());
    assert_eq!(h.applier.calls(), 0);
    assert!(h.publisher.branches().is_empty());
    assert_eq!(h.kept_file(&result.run_id.to_string(), "README.md"), README);

    let runs = h.recorder.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].result.status, RunStatus::Rejected);
    assert_eq!(runs[0].result.diff, None);
    assert_eq!(runs[0].result.publish, None);
}

#[test]
fn missing_file_is_a_stale_plan() {
    let h = Harness::readme();
    let plan = Plan::new(vec![edit_for("docs/guide.md", "", "--- a/docs/guide.md\n+++ b/docs/guide.md\n")]);
    let result = h
        .pipeline()
        .execute_plan(request("docs"), plan)
        .expect("run")
        .result;
    assert_eq!(result.final_state, RunState::Rejected);
    assert_eq!(result.error_kind.as_deref(), Some("StalePlanError"));
    assert_eq!(h.applier.calls(), 0);
}

#[test]
fn forbidden_prefix_is_rejected_before_applying() {
    let ci = "name: ci\non: push\n";
    let mut h = Harness::new(FixtureSource::new().with_file(".github/workflows/ci.yml", ci));
    h.cfg.policy = AppConfig::default().policy;
    let plan = Plan::new(vec![edit_for(
        ".github/workflows/ci.yml",
        ci,
        "--- a/.github/workflows/ci.yml\n+++ b/.github/workflows/ci.yml\n@@ -1,2 +1,2 @@\n name: ci\n-on: push\n+on: pull_request\n",
    )]);

    let result = h
        .pipeline()
        .execute_plan(request("run ci on prs"), plan)
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Rejected);
    assert_eq!(result.error_kind.as_deref(), Some("PolicyViolation"));
    assert_eq!(h.applier.calls(), 0);
}

#[test]
fn deletion_ceiling_rejects_otherwise_valid_plan() {
    let text = "a\nb\nc\nd\n";
    let mut h = Harness::new(FixtureSource::new().with_file("notes.txt", text));
    h.cfg.policy.max_deleted_lines = 2;
    let plan = Plan::new(vec![edit_for(
        "notes.txt",
        text,
        "--- a/notes.txt\n+++ b/notes.txt\n@@ -1,4 +1,1 @@\n-a\n-b\n-c\n d\n",
    )]);

    let result = h
        .pipeline()
        .execute_plan(request("trim notes"), plan)
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Rejected);
    assert!(result.error.as_deref().unwrap_or_default().contains("deletes too many lines"));
    assert_eq!(h.applier.calls(), 0);
}

#[test]
fn empty_plan_is_rejected() {
    let h = Harness::readme();
    let result = h
        .pipeline()
        .execute_plan(request("nothing"), Plan::default())
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Rejected);
}

#[test]
fn failing_applier_exhausts_exactly_the_repair_budget() {
    let mut h = Harness::readme();
    h.cfg.repair.max_cycles = 2;
    h.applier = TrackingApplier::always_rejecting("error: patch failed: README.md:1");
    h.completion = ScriptedCompletion::new().with_repeated_repair(readme_plan(), 5);

    let result = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_kind.as_deref(), Some("RepairExhausted"));
    assert!(result.error.as_deref().unwrap_or_default().contains("patch failed: README.md:1"));
    assert_eq!(h.completion.calls().repair, 2);
    assert_eq!(h.applier.calls(), 3);
    assert_eq!(
        h.completion.calls().repair_errors,
        vec!["error: patch failed: README.md:1".to_string(); 2]
    );
    assert!(h.publisher.branches().is_empty());
}

#[test]
fn zero_repair_budget_never_calls_repair() {
    let mut h = Harness::readme();
    h.cfg.repair.max_cycles = 0;
    h.applier = TrackingApplier::always_rejecting("error: corrupt patch");

    let result = h
        .pipeline()
        .execute_plan(request("x"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.error_kind.as_deref(), Some("RepairExhausted"));
    assert_eq!(h.completion.calls().repair, 0);
    assert_eq!(h.applier.calls(), 1);
}

#[test]
fn repaired_plan_on_forbidden_path_is_rejected() {
    let ci = "name: ci\n";
    let mut h = Harness::new(
        FixtureSource::new()
            .with_file("README.md", README)
            .with_file(".github/workflows/ci.yml", ci),
    );
    h.cfg.policy = AppConfig::default().policy;
    h.applier = TrackingApplier::always_rejecting("error: patch does not apply");
    h.completion = ScriptedCompletion::new().with_repair(Plan::new(vec![edit_for(
        ".github/workflows/ci.yml",
        ci,
        "--- a/.github/workflows/ci.yml\n+++ b/.github/workflows/ci.yml\n@@ -1 +1,2 @@\n name: ci\n+permissions: write-all\n",
    )]));

    let result = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Rejected);
    assert_eq!(result.error_kind.as_deref(), Some("PolicyViolation"));
    assert_eq!(h.applier.calls(), 1);
    assert_eq!(result.diff, None);
}

#[test]
fn repair_completion_error_fails_the_run() {
    let mut h = Harness::readme();
    h.applier = TrackingApplier::always_rejecting("error: patch does not apply");
    h.completion = ScriptedCompletion::new().with_repair_error("HTTP 503");

    let result = h
        .pipeline()
        .execute_plan(request("x"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_kind.as_deref(), Some("CompletionError"));
}

#[test]
fn repair_cycle_lands_the_repaired_diff() {
    if !git_available() {
        return;
    }
    let mut h = Harness::readme();
    h.applier = TrackingApplier::rejecting_first(1, "error: patch failed: README.md:3");
    let broken = Plan::new(vec![edit_for(
        "README.md",
        README,
        "--- a/README.md\n+++ b/README.md\n@@ -9,1 +9,2 @@\n no such line\n+x\n",
    )]);
    h.completion = ScriptedCompletion::new().with_repair(readme_plan());

    let result = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), broken)
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.diff.as_deref(), Some(README_INSERT));
    assert_eq!(result.plan, Some(readme_plan()));
    assert_eq!(h.completion.calls().repair, 1);
    assert!(result.trace.iter().any(|e| e.detail.starts_with("repair cycle 1/2")));
}

#[test]
fn rewrite_fallback_replaces_the_last_repair_call() {
    if !git_available() {
        return;
    }
    let mut h = Harness::readme();
    h.cfg.repair.max_cycles = 1;
    h.cfg.repair.rewrite_fallback = true;
    h.applier = TrackingApplier::rejecting_first(1, "error: patch failed");
    h.completion = ScriptedCompletion::new().with_rewrite(README_PATCHED);

    let result = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(h.completion.calls().rewrite, 1);
    assert_eq!(h.completion.calls().repair, 0);
    assert_eq!(h.publisher.commits()[0].content, README_PATCHED);
}

#[test]
fn unbounded_repair_budget_lands_the_first_repair() {
    if !git_available() {
        return;
    }
    let mut h = Harness::readme();
    h.cfg.repair.max_cycles = u32::MAX;
    h.applier = TrackingApplier::rejecting_first(1, "error: patch failed");
    h.completion = ScriptedCompletion::new().with_repair(readme_plan());

    let result = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(h.completion.calls().repair, 1);
    assert_eq!(h.applier.calls(), 2);
}

#[test]
fn rewrite_fallback_skips_files_larger_than_the_read_cap() {
    if !git_available() {
        return;
    }
    let mut h = Harness::readme();
    h.cfg.snapshot.max_file_bytes = 12;
    h.cfg.repair.max_cycles = 1;
    h.cfg.repair.rewrite_fallback = true;
    h.applier = TrackingApplier::rejecting_first(1, "error: patch failed");
    h.completion = ScriptedCompletion::new().with_rewrite(README_PATCHED);

    let result = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(
        result
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("full-file rewrite produced no changes")
    );
    assert_eq!(h.completion.calls().rewrite, 0);
    assert_eq!(h.applier.calls(), 1);
    assert!(h.publisher.commits().is_empty());
}

#[test]
fn disabled_test_check_publishes_despite_failing_suite() {
    if !git_available() {
        return;
    }
    let mut h = Harness::new(
        FixtureSource::new()
            .with_file("README.md", README)
            .with_file("pytest.ini", "[pytest]\n"),
    );
    h.runner = FixedRunner::exiting(1);

    let result = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.final_state, RunState::Published);
    assert!(h.runner.commands.lock().expect("lock").is_empty());
    assert!(result.trace.iter().any(|e| e.detail.contains("test check skipped")));
}

#[test]
fn failing_suite_fails_the_run_after_apply() {
    if !git_available() {
        return;
    }
    let mut h = Harness::new(
        FixtureSource::new()
            .with_file("README.md", README)
            .with_file("pytest.ini", "[pytest]\n"),
    );
    h.cfg.verify.require_tests = true;
    h.runner = FixedRunner::exiting(1);

    let result = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_kind.as_deref(), Some("VerificationError"));
    assert_eq!(result.diff.as_deref(), Some(README_INSERT));
    assert_eq!(
        h.runner.commands.lock().expect("lock").as_slice(),
        ["pytest -q".to_string()]
    );
    assert!(h.publisher.branches().is_empty());
}

#[test]
fn python_syntax_error_fails_verification() {
    if !git_available() {
        return;
    }
    let source = "def area(r):\n    return 3.14 * r * r\n";
    let h = Harness::new(FixtureSource::new().with_file("geometry.py", source));
    let plan = Plan::new(vec![edit_for(
        "geometry.py",
        source,
        "--- a/geometry.py\n+++ b/geometry.py\n@@ -1,2 +1,2 @@\n-def area(r):\n+def area(r:\n     return 3.14 * r * r\n",
    )]);

    let result = h
        .pipeline()
        .execute_plan(request("type hints"), plan)
        .expect("run")
        .result;
    assert_eq!(result.error_kind.as_deref(), Some("VerificationError"));
    assert!(result.error.as_deref().unwrap_or_default().contains("(syntax)"));
}

#[test]
fn commit_failure_after_branch_records_partial_publish() {
    if !git_available() {
        return;
    }
    let mut h = Harness::readme();
    h.publisher = RecordingPublisher::failing_at(PublishStep::Commit);

    let result = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_kind.as_deref(), Some("PublishError"));
    let publish = result.publish.expect("partial publish");
    assert!(publish.branch.is_some());
    assert!(publish.committed_files.is_empty());
    assert_eq!(publish.change_request, None);
    assert_eq!(h.publisher.branches().len(), 1);
}

#[test]
fn branch_failure_leaves_no_publish_reference() {
    if !git_available() {
        return;
    }
    let mut h = Harness::readme();
    h.publisher = RecordingPublisher::failing_at(PublishStep::CreateBranch);

    let result = h
        .pipeline()
        .execute_plan(request("x"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.error_kind.as_deref(), Some("PublishError"));
    assert_eq!(result.publish, None);
}

#[test]
fn change_request_failure_after_commit_records_partial_publish() {
    if !git_available() {
        return;
    }
    let mut h = Harness::readme();
    h.publisher = RecordingPublisher::failing_at(PublishStep::OpenChangeRequest);

    let result = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_kind.as_deref(), Some("PublishError"));
    let publish = result.publish.clone().expect("partial publish");
    assert!(publish.branch.is_some());
    assert_eq!(publish.committed_files, vec!["README.md".to_string()]);
    assert_eq!(publish.change_request, None);
    assert!(h.publisher.change_requests().is_empty());

    let runs = h.recorder.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].result.publish, result.publish);
}

#[test]
fn comment_failure_keeps_the_run_published() {
    if !git_available() {
        return;
    }
    let mut h = Harness::readme();
    h.publisher = RecordingPublisher::failing_at(PublishStep::Comment);

    let result = h
        .pipeline()
        .execute_plan(request("Mention more widgets"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.final_state, RunState::Published);
    let publish: PublishRef = result.publish.clone().expect("publish");
    assert!(publish.change_request.is_some());
    assert!(!publish.commented);
    assert!(result.trace.iter().any(|e| e.detail.contains("summary comment failed")));
}

#[test]
fn model_run_selects_plans_and_publishes() {
    if !git_available() {
        return;
    }
    let mut h = Harness::new(
        FixtureSource::new()
            .with_file("README.md", README)
            .with_file("src/app.py", "print('hi')\n"),
    );
    h.completion = ScriptedCompletion::new()
        .with_selection(&["README.md", "ghost.md"])
        .with_plan(readme_plan());

    let result = h
        .pipeline()
        .run(request("Mention more widgets"))
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Success);
    let calls = h.completion.calls();
    assert_eq!((calls.select, calls.generate), (1, 1));
    assert!(result.trace.iter().any(|e| e.detail == "selected 1 file(s): README.md"));
}

#[test]
fn empty_selection_fails_and_is_audited() {
    let mut h = Harness::readme();
    h.completion = ScriptedCompletion::new().with_selection(&[]);

    let report = h.pipeline().run(request("x")).expect("run");
    assert_eq!(report.result.status, RunStatus::Failed);
    assert_eq!(report.result.error_kind.as_deref(), Some("CompletionError"));
    assert_eq!(h.recorder.runs().len(), 1);
}

#[test]
fn plan_generation_error_fails_the_run() {
    let mut h = Harness::readme();
    h.completion = ScriptedCompletion::new()
        .with_selection(&["README.md"])
        .with_plan_error("model output was never valid JSON");

    let result = h.pipeline().run(request("x")).expect("run").result;
    assert_eq!(result.final_state, RunState::Failed);
    assert!(
        result
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("never valid JSON")
    );
}

#[test]
fn manual_run_prepends_marker() {
    if !git_available() {
        return;
    }
    let h = Harness::readme();
    let result = h
        .pipeline()
        .run_manual(request("manual smoke test"))
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Success);
    let commits = h.publisher.commits();
    assert_eq!(commits[0].content, format!("{MANUAL_MARKER}{README}"));
}

#[test]
fn manual_run_on_marked_readme_fails() {
    let h = Harness::new(
        FixtureSource::new().with_file("README.md", &format!("{MANUAL_MARKER}{README}")),
    );
    let result = h
        .pipeline()
        .run_manual(request("manual smoke test"))
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.as_deref().unwrap_or_default().contains("produced nothing"));
}

#[test]
fn manual_run_on_readme_with_marker_further_down_fails() {
    let h = Harness::new(
        FixtureSource::new().with_file("README.md", &format!("{README}\n{MANUAL_HEADING}\n")),
    );
    let result = h
        .pipeline()
        .run_manual(request("manual smoke test"))
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.error.as_deref().unwrap_or_default().contains("produced nothing"));
    assert_eq!(h.applier.calls(), 0);
}

#[test]
fn acquisition_exhaustion_fails_after_configured_attempts() {
    let h = Harness::new(
        FixtureSource::new()
            .with_file("README.md", README)
            .failing_first(10),
    );
    let result = h
        .pipeline()
        .execute_plan(request("x"), readme_plan())
        .expect("run")
        .result;
    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.error_kind.as_deref(), Some("AcquisitionError"));
    assert_eq!(h.source.fetches(), 3);
    assert_eq!(states(&result.trace), vec![RunState::Start, RunState::Failed]);
}

#[test]
fn audit_write_failure_is_returned() {
    let mut h = Harness::readme();
    h.recorder = MemoryAuditRecorder::failing();
    let err = h
        .pipeline()
        .execute_plan(request("x"), Plan::default())
        .expect_err("audit failure");
    assert!(format!("{err:#}").contains("audit store unavailable"));
}

#[test]
fn analyze_lists_files_and_leaves_no_trace() {
    let h = Harness::new(
        FixtureSource::new()
            .with_file("README.md", README)
            .with_file("src/app.py", "print('hi')\n")
            .with_file("__pycache__/app.cpython-312.pyc", "bytecode"),
    );
    let files = h
        .pipeline()
        .analyze(&request("x"))
        .expect("analyze");
    assert_eq!(files, vec!["README.md".to_string(), "src/app.py".to_string()]);
    assert!(h.recorder.runs().is_empty());
    let leftovers = fs::read_dir(&h.cfg.snapshot.workspace_root)
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(leftovers, 0);
}
