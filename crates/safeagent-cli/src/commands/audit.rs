use anyhow::{Result, anyhow};
use safeagent_core::AppConfig;
use safeagent_store::AuditStore;
use serde_json::json;
use std::path::Path;
use std::process::ExitCode;

use crate::output::{one_line, print_json};

fn open_store(cwd: &Path) -> Result<AuditStore> {
    let cfg = AppConfig::load(cwd)?;
    AuditStore::new(&cfg.audit_db_path(cwd))
}

pub(crate) fn run_sessions(cwd: &Path, limit: usize, json_mode: bool) -> Result<ExitCode> {
    let runs = open_store(cwd)?.list_recent(limit)?;
    if json_mode {
        print_json(&runs)?;
        return Ok(ExitCode::SUCCESS);
    }
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(ExitCode::SUCCESS);
    }
    println!(
        "{:<36} | {:<8} | {:<25} | {:>8} | PROMPT",
        "AUDIT ID", "STATUS", "CREATED AT", "SECONDS"
    );
    println!("{:-<36}-+-{:-<8}-+-{:-<25}-+-{:->8}-+-{:-<40}", "", "", "", "", "");
    for run in runs {
        println!(
            "{:<36} | {:<8} | {:<25} | {:>8.1} | {}",
            run.id,
            run.status,
            run.created_at,
            run.duration_sec,
            one_line(&run.prompt, 40)
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn run_show(cwd: &Path, id: &str, json_mode: bool) -> Result<ExitCode> {
    let record = open_store(cwd)?
        .get(id)?
        .ok_or_else(|| anyhow!("audit record not found: {id}"))?;
    if json_mode {
        print_json(&record)?;
        return Ok(ExitCode::SUCCESS);
    }
    println!("Audit ID:    {}", record.id);
    println!("Run ID:      {}", record.run_id);
    println!("Created At:  {}", record.created_at);
    println!("Repository:  {}", record.repo_url);
    println!("Status:      {} ({})", record.status, record.final_state);
    println!("Duration:    {:.1}s", record.duration_sec);
    if !record.files_changed.is_empty() {
        println!("Files:       {}", record.files_changed.join(", "));
    }
    if let Some(change) = record
        .publish
        .as_ref()
        .and_then(|publish| publish.change_request.as_ref())
    {
        println!("Change:      #{} {}", change.number, change.url);
    }
    if let Some(error) = &record.error {
        println!(
            "Error:       [{}] {error}",
            record.error_kind.as_deref().unwrap_or("unknown")
        );
    }
    println!("Prompt:\n{}", record.prompt);
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn run_diff(cwd: &Path, id: &str, json_mode: bool) -> Result<ExitCode> {
    let diff = open_store(cwd)?.diff(id)?;
    if json_mode {
        print_json(&json!({ "id": id, "diff": diff }))?;
        return Ok(ExitCode::SUCCESS);
    }
    match diff {
        Some(diff) => print!("{diff}"),
        None => println!("No diff recorded for {id}."),
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn run_trace(cwd: &Path, id: &str, json_mode: bool) -> Result<ExitCode> {
    let trace = open_store(cwd)?.trace(id)?;
    if json_mode {
        print_json(&trace)?;
        return Ok(ExitCode::SUCCESS);
    }
    for event in trace {
        println!(
            "{} {:<14} {}",
            event.at.to_rfc3339(),
            event.state.as_str(),
            event.detail
        );
    }
    Ok(ExitCode::SUCCESS)
}
