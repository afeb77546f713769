use anyhow::{Result, anyhow};
use safeagent_core::{PipelineError, VerificationStage, VerifyConfig};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tree_sitter::{Node, Parser};
use wait_timeout::ChildExt;

const MAX_FAILURE_OUTPUT_CHARS: usize = 2500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub status: Option<i32>,
    /// stdout followed by stderr.
    pub output: String,
    pub timed_out: bool,
}

pub trait CommandRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<CommandOutcome>;
}

/// Runs through `sh -lc`, falling back to `bash -lc`. Output is spooled to
/// temp files so a chatty test suite cannot fill a pipe and stall the wait.
#[derive(Debug, Default, Clone)]
pub struct ShellCommandRunner;

impl CommandRunner for ShellCommandRunner {
    fn run(&self, cmd: &str, cwd: &Path, timeout: Duration) -> Result<CommandOutcome> {
        let mut stdout = tempfile::tempfile()?;
        let mut stderr = tempfile::tempfile()?;
        let mut child = spawn_command(cmd, cwd, &stdout, &stderr)?;

        let status = child.wait_timeout(timeout)?;
        let timed_out = status.is_none();
        let status = match status {
            Some(status) => status,
            None => {
                child.kill()?;
                child.wait()?
            }
        };

        let mut output = read_spool(&mut stdout)?;
        output.push_str(&read_spool(&mut stderr)?);
        Ok(CommandOutcome {
            status: status.code(),
            output,
            timed_out,
        })
    }
}

fn spawn_command(cmd: &str, cwd: &Path, stdout: &File, stderr: &File) -> Result<Child> {
    let mut errors = Vec::new();
    for shell in ["sh", "bash"] {
        let mut command = Command::new(shell);
        command
            .arg("-lc")
            .arg(cmd)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout.try_clone()?))
            .stderr(Stdio::from(stderr.try_clone()?));
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(err) => errors.push(format!("{shell}: {err}")),
        }
    }
    Err(anyhow!(
        "failed to spawn command '{cmd}' in '{}': {}",
        cwd.display(),
        errors.join(" | ")
    ))
}

fn read_spool(file: &mut File) -> Result<String> {
    file.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Passed(String),
    Skipped(String),
}

impl std::fmt::Display for GateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateOutcome::Passed(detail) => write!(f, "passed: {detail}"),
            GateOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

pub struct Verifier {
    cfg: VerifyConfig,
    runner: Box<dyn CommandRunner + Send + Sync>,
}

impl Verifier {
    pub fn new(cfg: VerifyConfig, runner: Box<dyn CommandRunner + Send + Sync>) -> Self {
        Self { cfg, runner }
    }

    /// Parses every changed file with a checked extension.
    pub fn check_syntax(&self, root: &Path, changed: &[String]) -> Result<GateOutcome, PipelineError> {
        let checked: Vec<&String> = changed
            .iter()
            .filter(|path| {
                Path::new(path.as_str())
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| self.cfg.syntax_extensions.iter().any(|e| e == ext))
            })
            .collect();
        if checked.is_empty() {
            return Ok(GateOutcome::Skipped("no changed files to parse".to_string()));
        }
        for path in &checked {
            let source = fs::read_to_string(root.join(path.as_str())).map_err(|err| {
                PipelineError::Verification {
                    stage: VerificationStage::Syntax,
                    detail: format!("{path}: cannot read: {err}"),
                }
            })?;
            check_python_syntax(&source).map_err(|detail| PipelineError::Verification {
                stage: VerificationStage::Syntax,
                detail: format!("{path}: {detail}"),
            })?;
        }
        Ok(GateOutcome::Passed(format!("{} file(s) parsed cleanly", checked.len())))
    }

    pub fn run_tests(&self, root: &Path) -> Result<GateOutcome, PipelineError> {
        if !self.cfg.require_tests {
            return Ok(GateOutcome::Skipped("test check disabled".to_string()));
        }
        if !self
            .cfg
            .harness_markers
            .iter()
            .any(|marker| root.join(marker).exists())
        {
            return Ok(GateOutcome::Skipped(format!(
                "no test harness found (looked for {})",
                self.cfg.harness_markers.join(", ")
            )));
        }

        let cmd = &self.cfg.test_command;
        let timeout = Duration::from_secs(self.cfg.timeout_seconds);
        let outcome = self
            .runner
            .run(cmd, root, timeout)
            .map_err(|err| PipelineError::Verification {
                stage: VerificationStage::Tests,
                detail: format!("`{cmd}` could not run: {err:#}"),
            })?;
        if outcome.timed_out {
            return Err(PipelineError::Verification {
                stage: VerificationStage::Tests,
                detail: format!(
                    "`{cmd}` timed out after {}s\n{}",
                    self.cfg.timeout_seconds,
                    tail(&outcome.output, MAX_FAILURE_OUTPUT_CHARS)
                ),
            });
        }
        if outcome.status != Some(0) {
            let code = outcome
                .status
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(PipelineError::Verification {
                stage: VerificationStage::Tests,
                detail: format!(
                    "`{cmd}` exited with {code}\n{}",
                    tail(&outcome.output, MAX_FAILURE_OUTPUT_CHARS)
                ),
            });
        }
        Ok(GateOutcome::Passed(format!("`{cmd}` succeeded")))
    }
}

/// `Err` names the first error node's position, 1-based.
pub fn check_python_syntax(source: &str) -> std::result::Result<(), String> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|err| format!("python grammar unavailable: {err}"))?;
    let tree = parser
        .parse(source, None)
        .ok_or_else(|| "tree-sitter parse failed".to_string())?;
    let root = tree.root_node();
    if !root.has_error() {
        return Ok(());
    }
    let position = first_error(root).unwrap_or(root).start_position();
    Err(format!(
        "syntax error at line {}, column {}",
        position.row + 1,
        position.column + 1
    ))
}

fn first_error(node: Node<'_>) -> Option<Node<'_>> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        if (child.has_error() || child.is_missing())
            && let Some(found) = first_error(child)
        {
            return Some(found);
        }
    }
    None
}

/// Last `max` characters; failure summaries sit at the end of test output.
fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let kept: String = text.chars().skip(count - max).collect();
    format!("...{kept}")
}
