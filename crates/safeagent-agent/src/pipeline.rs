use crate::manual::manual_plan;
use crate::publish::publish_changes;
use crate::repair::RepairLoop;
use crate::trace_note;
use crate::validate::validate_plan;
use crate::verify::{CommandRunner, ShellCommandRunner, Verifier};
use anyhow::{Context, Result};
use safeagent_core::{
    AppConfig, ExecutionResult, PipelineError, Plan, PublishRef, RunContext, RunRequest, RunState,
    RunStatus,
};
use safeagent_diff::{GitPatchApplier, PatchApplier};
use safeagent_llm::{CompletionService, ModelPlanner, OpenAiChatClient};
use safeagent_observe::Observer;
use safeagent_policy::PolicyGate;
use safeagent_publish::{GitHubPublisher, Publisher, UnavailablePublisher};
use safeagent_snapshot::{GitCloneSource, RepoSource, SnapshotService, WorkingCopy};
use safeagent_store::AuditRecorder;
use std::fs;
use std::path::Path;

/// Collaborators behind the pipeline's seams.
pub struct PipelineServices {
    pub source: Box<dyn RepoSource + Send + Sync>,
    pub completion: Box<dyn CompletionService + Send + Sync>,
    pub applier: Box<dyn PatchApplier + Send + Sync>,
    pub publisher: Box<dyn Publisher + Send + Sync>,
    pub recorder: Box<dyn AuditRecorder + Send + Sync>,
    pub test_runner: Box<dyn CommandRunner + Send + Sync>,
}

impl PipelineServices {
    /// git clone, the configured chat model, git apply, GitHub and `sh`.
    /// A publisher that cannot be configured fails at publish time instead.
    pub fn production(
        cfg: &AppConfig,
        repo_url: &str,
        recorder: Box<dyn AuditRecorder + Send + Sync>,
    ) -> Result<Self> {
        let client = OpenAiChatClient::new(cfg.llm.clone())?;
        let publisher: Box<dyn Publisher + Send + Sync> =
            match GitHubPublisher::new(&cfg.publish, repo_url) {
                Ok(publisher) => Box::new(publisher),
                Err(err) => Box::new(UnavailablePublisher::new(format!("{err:#}"))),
            };
        Ok(Self {
            source: Box::new(GitCloneSource),
            completion: Box::new(ModelPlanner::new(client, cfg.llm.clone())),
            applier: Box::new(GitPatchApplier),
            publisher,
            recorder,
            test_runner: Box::new(ShellCommandRunner),
        })
    }
}

/// A finished run and the id of its audit record.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub audit_id: String,
    pub result: ExecutionResult,
}

enum PlanSource {
    Model,
    Manual,
    Supplied(Plan),
}

/// What the run produced before it ended, whichever way it ended.
#[derive(Default)]
struct RunProgress {
    plan: Option<Plan>,
    diff: Option<String>,
    publish: Option<PublishRef>,
}

pub struct Pipeline {
    cfg: AppConfig,
    snapshot: SnapshotService,
    policy: PolicyGate,
    verifier: Verifier,
    completion: Box<dyn CompletionService + Send + Sync>,
    applier: Box<dyn PatchApplier + Send + Sync>,
    publisher: Box<dyn Publisher + Send + Sync>,
    recorder: Box<dyn AuditRecorder + Send + Sync>,
    observer: Observer,
}

impl Pipeline {
    pub fn new(cfg: AppConfig, services: PipelineServices, observer: Observer) -> Self {
        Self {
            snapshot: SnapshotService::new(&cfg.snapshot, services.source),
            policy: PolicyGate::from_app_config(&cfg.policy),
            verifier: Verifier::new(cfg.verify.clone(), services.test_runner),
            completion: services.completion,
            applier: services.applier,
            publisher: services.publisher,
            recorder: services.recorder,
            observer,
            cfg,
        }
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    /// Files the repository would offer to the model. Leaves no audit record.
    pub fn analyze(&self, request: &RunRequest) -> Result<Vec<String>> {
        let ctx = RunContext::new(request.clone(), self.workspace_root());
        let wc = match self.snapshot.acquire(&request.repo_url, &ctx.working_copy) {
            Ok(wc) => wc,
            Err(err) => {
                self.discard_partial(&ctx);
                return Err(err.into());
            }
        };
        let files = self.snapshot.list_files(&wc);
        self.snapshot.dispose(wc)?;
        Ok(files)
    }

    /// Model-planned run: select files, plan, then the guarded execution.
    pub fn run(&self, request: RunRequest) -> Result<RunReport> {
        self.drive(request, PlanSource::Model)
    }

    /// Deterministic README edit; needs no completion service.
    pub fn run_manual(&self, request: RunRequest) -> Result<RunReport> {
        self.drive(request, PlanSource::Manual)
    }

    pub fn execute_plan(&self, request: RunRequest, plan: Plan) -> Result<RunReport> {
        self.drive(request, PlanSource::Supplied(plan))
    }

    fn workspace_root(&self) -> &Path {
        Path::new(&self.cfg.snapshot.workspace_root)
    }

    fn drive(&self, request: RunRequest, source: PlanSource) -> Result<RunReport> {
        let mut ctx = RunContext::new(request, self.workspace_root());
        if let Some(start) = ctx.trace().first() {
            let _ = self.observer.record_trace_event(ctx.run_id, start);
        }
        let mut progress = RunProgress::default();

        let outcome = match self.snapshot.acquire(&ctx.request.repo_url, &ctx.working_copy) {
            Ok(wc) => {
                let outcome = self.guarded(&mut ctx, &wc, source, &mut progress);
                self.release(&mut ctx, wc);
                outcome
            }
            Err(err) => {
                self.discard_partial(&ctx);
                Err(err)
            }
        };
        self.finish(ctx, outcome, progress)
    }

    fn guarded(
        &self,
        ctx: &mut RunContext,
        wc: &WorkingCopy,
        source: PlanSource,
        progress: &mut RunProgress,
    ) -> Result<(), PipelineError> {
        let file_count = self.snapshot.list_files(wc).len();
        self.advance(
            ctx,
            RunState::SnapshotReady,
            format!("working copy ready at {} ({file_count} files)", wc.path().display()),
        );

        let plan = match source {
            PlanSource::Supplied(plan) => plan,
            PlanSource::Manual => manual_plan(wc, &self.snapshot.manifest(wc))?,
            PlanSource::Model => self.plan_from_model(ctx, wc)?,
        };
        trace_note(
            &self.observer,
            ctx,
            format!("plan has {} edit(s): {}", plan.edits.len(), plan.paths().join(", ")),
        );
        progress.plan = Some(plan.clone());

        let manifest = self.snapshot.manifest(wc);
        validate_plan(&plan, &manifest, &self.policy)?;
        self.advance(
            ctx,
            RunState::Validated,
            format!("hashes match and policy accepts {} edit(s)", plan.edits.len()),
        );

        let applied = RepairLoop {
            completion: self.completion.as_ref(),
            applier: self.applier.as_ref(),
            snapshot: &self.snapshot,
            policy: &self.policy,
            observer: &self.observer,
            cfg: &self.cfg.repair,
            max_file_bytes: self.cfg.snapshot.max_file_bytes,
        }
        .run(ctx, wc, plan)?;
        progress.plan = Some(applied.plan.clone());
        progress.diff = Some(applied.diff.clone());
        self.advance(
            ctx,
            RunState::Applied,
            format!("patch applied after {} repair cycle(s)", applied.repair_cycles),
        );

        let changed = applied.plan.paths();
        let syntax = format!("syntax check {}", self.verifier.check_syntax(wc.path(), &changed)?);
        trace_note(&self.observer, ctx, syntax.clone());
        let tests = format!("test check {}", self.verifier.run_tests(wc.path())?);
        trace_note(&self.observer, ctx, tests.clone());
        self.advance(ctx, RunState::Verified, "verification gates passed");

        let outcome = publish_changes(
            self.publisher.as_ref(),
            &self.cfg.publish,
            ctx,
            wc,
            &applied.plan,
            &[syntax, tests],
        )?;
        if let Some(err) = &outcome.comment_error {
            self.observer
                .warn_log(&format!("summary comment failed for run {}: {err}", ctx.run_id));
            trace_note(&self.observer, ctx, format!("summary comment failed: {err}"));
        }
        let detail = match &outcome.reference.change_request {
            Some(change) => format!("change request #{} opened: {}", change.number, change.url),
            None => "published".to_string(),
        };
        progress.publish = Some(outcome.reference);
        self.advance(ctx, RunState::Published, detail);
        Ok(())
    }

    fn plan_from_model(&self, ctx: &mut RunContext, wc: &WorkingCopy) -> Result<Plan, PipelineError> {
        let intent = ctx.request.prompt.clone();
        let files = self.snapshot.list_files(wc);
        let selected = self
            .completion
            .select_files(&intent, &files)
            .map_err(|err| PipelineError::Completion(format!("file selection failed: {err:#}")))?;
        if selected.is_empty() {
            return Err(PipelineError::Completion(
                "no relevant files selected".to_string(),
            ));
        }
        trace_note(
            &self.observer,
            ctx,
            format!("selected {} file(s): {}", selected.len(), selected.join(", ")),
        );
        let contents = self
            .snapshot
            .read(wc, &selected, self.cfg.snapshot.max_file_bytes);
        let digests = self.snapshot.manifest(wc);
        self.completion
            .generate_plan(&intent, &contents, &digests)
            .map_err(|err| PipelineError::Completion(format!("plan generation failed: {err:#}")))
    }

    fn finish(
        &self,
        mut ctx: RunContext,
        outcome: Result<(), PipelineError>,
        progress: RunProgress,
    ) -> Result<RunReport> {
        if let Err(err) = &outcome {
            self.advance(&mut ctx, err.terminal_state(), err.to_string());
        }
        let final_state = ctx.state();
        let status = final_state.status().unwrap_or(RunStatus::Failed);
        let rejected = final_state == RunState::Rejected;

        let (error, error_kind, publish) = match &outcome {
            Ok(()) => (None, None, progress.publish),
            Err(err) => (
                Some(err.to_string()),
                Some(err.kind().to_string()),
                err.partial_publish().cloned(),
            ),
        };
        let files_changed = match (&progress.plan, rejected) {
            (Some(plan), false) => plan.paths(),
            _ => Vec::new(),
        };
        let duration_sec = ctx.elapsed_secs();
        let run_id = ctx.run_id;
        let request = ctx.request.clone();
        let result = ExecutionResult {
            run_id,
            status,
            final_state,
            files_changed,
            plan: progress.plan,
            diff: if rejected { None } else { progress.diff },
            trace: ctx.into_trace(),
            publish: if rejected { None } else { publish },
            error,
            error_kind,
            duration_sec,
        };

        let audit_id = match self.recorder.record(&result, &request) {
            Ok(id) => id,
            Err(err) => {
                self.observer
                    .warn_log(&format!("failed to write audit record for run {run_id}: {err:#}"));
                return Err(err).context(format!("audit record for run {run_id} was not written"));
            }
        };
        let _ = self.observer.record_run(&result, Some(&audit_id));
        Ok(RunReport { audit_id, result })
    }

    fn advance(&self, ctx: &mut RunContext, to: RunState, detail: impl Into<String>) {
        let run_id = ctx.run_id;
        match ctx.transition(to, detail) {
            Ok(event) => {
                let event = event.clone();
                let _ = self.observer.record_trace_event(run_id, &event);
            }
            Err(err) => self.observer.warn_log(&format!("run {run_id}: {err:#}")),
        }
    }

    fn release(&self, ctx: &mut RunContext, wc: WorkingCopy) {
        if self.cfg.snapshot.keep_working_copy {
            trace_note(
                &self.observer,
                ctx,
                format!("working copy kept at {}", wc.path().display()),
            );
            return;
        }
        if let Err(err) = self.snapshot.dispose(wc) {
            self.observer
                .warn_log(&format!("failed to dispose working copy: {err:#}"));
        }
    }

    fn discard_partial(&self, ctx: &RunContext) {
        if ctx.working_copy.exists() && !self.cfg.snapshot.keep_working_copy {
            let _ = fs::remove_dir_all(&ctx.working_copy);
        }
    }
}
