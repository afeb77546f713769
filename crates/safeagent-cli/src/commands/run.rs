use anyhow::{Context, Result};
use safeagent_agent::{Pipeline, PipelineServices, RunReport};
use safeagent_core::{AppConfig, Plan, RunRequest, RunStatus};
use safeagent_observe::Observer;
use safeagent_store::AuditStore;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::output::print_json;

pub(crate) enum RunMode {
    Model,
    Manual,
    PlanFile(PathBuf),
}

fn build_pipeline(cwd: &Path, repo_url: &str, verbose: bool) -> Result<Pipeline> {
    let cfg = AppConfig::load(cwd)?;
    let store = AuditStore::new(&cfg.audit_db_path(cwd))?;
    let services = PipelineServices::production(&cfg, repo_url, Box::new(store))?;
    let mut observer = Observer::new(cwd, &cfg.telemetry)?;
    observer.set_verbose(verbose);
    Ok(Pipeline::new(cfg, services, observer))
}

pub(crate) fn load_plan(path: &Path) -> Result<Plan> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read plan file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("invalid plan file {}", path.display()))
}

pub(crate) fn run_analyze(cwd: &Path, repo_url: &str, json_mode: bool, verbose: bool) -> Result<ExitCode> {
    let pipeline = build_pipeline(cwd, repo_url, verbose)?;
    let request = RunRequest {
        repo_url: repo_url.to_string(),
        prompt: String::new(),
    };
    let files = pipeline.analyze(&request)?;
    if json_mode {
        print_json(&json!({ "repo_url": repo_url, "files": files }))?;
    } else {
        for file in &files {
            println!("{file}");
        }
        println!("{} file(s)", files.len());
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn run_pipeline(
    cwd: &Path,
    mode: RunMode,
    repo_url: &str,
    prompt: &str,
    json_mode: bool,
    verbose: bool,
) -> Result<ExitCode> {
    // A bad plan file should fail before anything is cloned.
    let plan = match &mode {
        RunMode::PlanFile(path) => Some(load_plan(path)?),
        _ => None,
    };
    let pipeline = build_pipeline(cwd, repo_url, verbose)?;
    let request = RunRequest {
        repo_url: repo_url.to_string(),
        prompt: prompt.to_string(),
    };
    let report = match (mode, plan) {
        (_, Some(plan)) => pipeline.execute_plan(request, plan)?,
        (RunMode::Manual, None) => pipeline.run_manual(request)?,
        _ => pipeline.run(request)?,
    };
    print_report(&report, json_mode)?;
    Ok(if report.result.status == RunStatus::Success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(report: &RunReport, json_mode: bool) -> Result<()> {
    let result = &report.result;
    if json_mode {
        let mut value = serde_json::to_value(result)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("audit_id".to_string(), json!(report.audit_id));
        }
        return print_json(&value);
    }
    println!("run {} {}", result.run_id, result.status.as_str());
    println!("final state: {}", result.final_state.as_str());
    if !result.files_changed.is_empty() {
        println!("files changed: {}", result.files_changed.join(", "));
    }
    if let Some(change) = result
        .publish
        .as_ref()
        .and_then(|publish| publish.change_request.as_ref())
    {
        println!("change request: {}", change.url);
    }
    if let Some(error) = &result.error {
        println!(
            "error [{}]: {error}",
            result.error_kind.as_deref().unwrap_or("unknown")
        );
    }
    println!("audit id: {}", report.audit_id);
    Ok(())
}
