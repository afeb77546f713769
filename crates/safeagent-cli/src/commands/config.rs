use anyhow::Result;
use safeagent_core::AppConfig;
use std::path::Path;
use std::process::ExitCode;

use crate::output::{print_json, redact_config_for_display};

pub(crate) fn run_config(cwd: &Path, json_mode: bool) -> Result<ExitCode> {
    let cfg = AppConfig::load(cwd)?;
    let redacted = redact_config_for_display(&cfg)?;
    if json_mode {
        print_json(&redacted)?;
    } else {
        println!("{}", serde_json::to_string_pretty(&redacted)?);
    }
    Ok(ExitCode::SUCCESS)
}
