use anyhow::Result;
use chrono::Utc;
use reqwest::blocking::Client;
use safeagent_core::{ExecutionResult, TelemetryConfig, TraceEvent, runtime_dir};
use serde_json::json;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub struct Observer {
    log_path: PathBuf,
    telemetry: Option<TelemetrySink>,
    verbose: bool,
}

struct TelemetrySink {
    endpoint: String,
    client: Client,
}

impl Observer {
    pub fn new(workspace: &Path, telemetry_cfg: &TelemetryConfig) -> Result<Self> {
        let dir = runtime_dir(workspace);
        fs::create_dir_all(&dir)?;
        let telemetry = telemetry_sink(telemetry_cfg)?;
        Ok(Self {
            log_path: dir.join("observe.log"),
            telemetry,
            verbose: false,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn record_trace_event(&self, run_id: Uuid, event: &TraceEvent) -> Result<()> {
        let line = json!({
            "run_id": run_id,
            "at": event.at.to_rfc3339(),
            "state": event.state,
            "detail": event.detail,
        });
        self.append_log_line(&format!("{} EVENT {line}", Utc::now().to_rfc3339()))?;
        self.verbose_log(&format!("[{}] {}", event.state.as_str(), event.detail));
        Ok(())
    }

    /// One summary line per finished run, mirrored to telemetry.
    pub fn record_run(&self, result: &ExecutionResult, audit_id: Option<&str>) -> Result<()> {
        let summary = json!({
            "run_id": result.run_id,
            "audit_id": audit_id,
            "status": result.status,
            "final_state": result.final_state,
            "files_changed": result.files_changed.len(),
            "error_kind": result.error_kind,
            "duration_sec": result.duration_sec,
        });
        self.append_log_line(&format!("{} RUN {summary}", Utc::now().to_rfc3339()))?;
        self.emit_telemetry("telemetry.run", summary)
    }

    pub fn set_verbose(&mut self, verbose: bool) {
        self.verbose = verbose;
    }

    /// Stderr only, and only with `--verbose`.
    pub fn verbose_log(&self, msg: &str) {
        if self.verbose {
            eprintln!("[safeagent] {msg}");
        }
    }

    /// Always written to the log file and to stderr.
    pub fn warn_log(&self, msg: &str) {
        eprintln!("[safeagent WARN] {msg}");
        let _ = self.append_log_line(&format!("{} WARN {msg}", Utc::now().to_rfc3339()));
    }

    fn append_log_line(&self, line: &str) -> Result<()> {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    fn emit_telemetry(&self, name: &str, payload: serde_json::Value) -> Result<()> {
        let Some(sink) = &self.telemetry else {
            return Ok(());
        };

        let body = json!({
            "name": name,
            "at": Utc::now().to_rfc3339(),
            "payload": payload,
        });

        // Never blocks the run; failures only reach the log file.
        let client = sink.client.clone();
        let endpoint = sink.endpoint.clone();
        let log_path = self.log_path.clone();
        std::thread::spawn(move || {
            if let Err(err) = client.post(&endpoint).json(&body).send() {
                let line = format!("{} TELEMETRY_ERROR error={}", Utc::now().to_rfc3339(), err);
                let _ = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&log_path)
                    .and_then(|mut f| writeln!(f, "{line}"));
            }
        });
        Ok(())
    }
}

fn telemetry_sink(cfg: &TelemetryConfig) -> Result<Option<TelemetrySink>> {
    if !cfg.enabled {
        return Ok(None);
    }
    let Some(endpoint) = cfg.endpoint.clone() else {
        return Ok(None);
    };
    let client = Client::builder().timeout(Duration::from_secs(3)).build()?;
    Ok(Some(TelemetrySink { endpoint, client }))
}
