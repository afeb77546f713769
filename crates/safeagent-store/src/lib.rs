use anyhow::{Result, anyhow};
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, Row, params};
use safeagent_core::{ExecutionResult, Plan, PublishRef, RunRequest, TraceEvent};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS runs (
            seq INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,
            run_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            repo_url TEXT NOT NULL,
            prompt TEXT NOT NULL,
            status TEXT NOT NULL,
            final_state TEXT NOT NULL,
            duration_sec REAL NOT NULL,
            files_changed TEXT NOT NULL,
            plan TEXT,
            diff TEXT,
            trace TEXT NOT NULL,
            publish TEXT,
            error TEXT,
            error_kind TEXT,
            result TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);",
    ),
    (
        2,
        "CREATE TRIGGER IF NOT EXISTS runs_no_update BEFORE UPDATE ON runs
         BEGIN SELECT RAISE(ABORT, 'audit records are append-only'); END;
         CREATE TRIGGER IF NOT EXISTS runs_no_delete BEFORE DELETE ON runs
         BEGIN SELECT RAISE(ABORT, 'audit records are append-only'); END;",
    ),
];

/// Persists exactly one record per finished run.
pub trait AuditRecorder {
    /// Returns the new record's id.
    fn record(&self, result: &ExecutionResult, request: &RunRequest) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub run_id: String,
    pub created_at: String,
    pub repo_url: String,
    pub prompt: String,
    pub status: String,
    pub final_state: String,
    pub duration_sec: f64,
    pub files_changed: Vec<String>,
    pub plan: Option<Plan>,
    pub diff: Option<String>,
    pub trace: Vec<TraceEvent>,
    pub publish: Option<PublishRef>,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditSummary {
    pub id: String,
    pub created_at: String,
    pub repo_url: String,
    pub prompt: String,
    pub status: String,
    pub final_state: String,
    pub duration_sec: f64,
}

pub struct AuditStore {
    db_path: PathBuf,
}

impl AuditStore {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self {
            db_path: db_path.to_path_buf(),
        };
        store.init_db()?;
        Ok(store)
    }

    fn db(&self) -> Result<Connection> {
        Ok(Connection::open(&self.db_path)?)
    }

    pub fn get(&self, id: &str) -> Result<Option<AuditRecord>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, created_at, repo_url, prompt, status, final_state, duration_sec,
                    files_changed, plan, diff, trace, publish, error, error_kind, result
             FROM runs WHERE id = ?1",
        )?;
        let raw = stmt.query_row([id], RawRecord::from_row).optional()?;
        raw.map(RawRecord::decode).transpose()
    }

    /// Newest first.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<AuditSummary>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, repo_url, prompt, status, final_state, duration_sec
             FROM runs ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], |row| {
            Ok(AuditSummary {
                id: row.get(0)?,
                created_at: row.get(1)?,
                repo_url: row.get(2)?,
                prompt: row.get(3)?,
                status: row.get(4)?,
                final_state: row.get(5)?,
                duration_sec: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// The applied diff, `None` when the run never applied one.
    pub fn diff(&self, id: &str) -> Result<Option<String>> {
        let conn = self.db()?;
        let diff: Option<Option<String>> = conn
            .query_row("SELECT diff FROM runs WHERE id = ?1", [id], |r| r.get(0))
            .optional()?;
        diff.ok_or_else(|| anyhow!("audit record not found: {id}"))
    }

    pub fn trace(&self, id: &str) -> Result<Vec<TraceEvent>> {
        let conn = self.db()?;
        let raw: Option<String> = conn
            .query_row("SELECT trace FROM runs WHERE id = ?1", [id], |r| r.get(0))
            .optional()?;
        let raw = raw.ok_or_else(|| anyhow!("audit record not found: {id}"))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.db()?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
             );",
        )?;

        for (version, sql) in MIGRATIONS {
            let already: i64 = conn.query_row(
                "SELECT COUNT(1) FROM schema_migrations WHERE version = ?1",
                [*version],
                |r| r.get(0),
            )?;
            if already == 0 {
                conn.execute_batch(sql)?;
                conn.execute(
                    "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                    params![version, Utc::now().to_rfc3339()],
                )?;
            }
        }
        Ok(())
    }
}

impl AuditRecorder for AuditStore {
    fn record(&self, result: &ExecutionResult, request: &RunRequest) -> Result<String> {
        let id = Uuid::now_v7().to_string();
        let conn = self.db()?;
        conn.execute(
            "INSERT INTO runs (id, run_id, created_at, repo_url, prompt, status, final_state, duration_sec,
                               files_changed, plan, diff, trace, publish, error, error_kind, result)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                id,
                result.run_id.to_string(),
                Utc::now().to_rfc3339(),
                request.repo_url,
                request.prompt,
                result.status.as_str(),
                result.final_state.as_str(),
                result.duration_sec,
                serde_json::to_string(&result.files_changed)?,
                result.plan.as_ref().map(serde_json::to_string).transpose()?,
                result.diff,
                serde_json::to_string(&result.trace)?,
                result.publish.as_ref().map(serde_json::to_string).transpose()?,
                result.error,
                result.error_kind,
                serde_json::to_string(result)?,
            ],
        )?;
        Ok(id)
    }
}

struct RawRecord {
    id: String,
    run_id: String,
    created_at: String,
    repo_url: String,
    prompt: String,
    status: String,
    final_state: String,
    duration_sec: f64,
    files_changed: String,
    plan: Option<String>,
    diff: Option<String>,
    trace: String,
    publish: Option<String>,
    error: Option<String>,
    error_kind: Option<String>,
    result: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            created_at: row.get(2)?,
            repo_url: row.get(3)?,
            prompt: row.get(4)?,
            status: row.get(5)?,
            final_state: row.get(6)?,
            duration_sec: row.get(7)?,
            files_changed: row.get(8)?,
            plan: row.get(9)?,
            diff: row.get(10)?,
            trace: row.get(11)?,
            publish: row.get(12)?,
            error: row.get(13)?,
            error_kind: row.get(14)?,
            result: row.get(15)?,
        })
    }

    fn decode(self) -> Result<AuditRecord> {
        Ok(AuditRecord {
            id: self.id,
            run_id: self.run_id,
            created_at: self.created_at,
            repo_url: self.repo_url,
            prompt: self.prompt,
            status: self.status,
            final_state: self.final_state,
            duration_sec: self.duration_sec,
            files_changed: serde_json::from_str(&self.files_changed)?,
            plan: self.plan.as_deref().map(serde_json::from_str).transpose()?,
            diff: self.diff,
            trace: serde_json::from_str(&self.trace)?,
            publish: self.publish.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error,
            error_kind: self.error_kind,
            result: serde_json::from_str(&self.result)?,
        })
    }
}
