use anyhow::{Result, anyhow};
use safeagent_core::{LlmConfig, Manifest, Plan, RetryDecision, RetryError, RetryPolicy};
use serde_json::Value;
use std::collections::BTreeMap;

mod client;
pub mod decode;
pub mod prompts;

pub use client::{ChatBackend, OpenAiChatClient};
pub use decode::{DecodeError, decode_json, strip_code_fences};

/// Everything a repair request carries back to the model.
#[derive(Debug, Clone, Copy)]
pub struct RepairRequest<'a> {
    pub intent: &'a str,
    pub contents: &'a BTreeMap<String, String>,
    pub digests: &'a Manifest,
    pub failed_diff: &'a str,
    pub tool_error: &'a str,
}

pub trait CompletionService {
    /// Ordered subset of `candidates` relevant to `intent`.
    fn select_files(&self, intent: &str, candidates: &[String]) -> Result<Vec<String>>;

    fn generate_plan(
        &self,
        intent: &str,
        contents: &BTreeMap<String, String>,
        digests: &Manifest,
    ) -> Result<Plan>;

    fn repair_plan(&self, request: &RepairRequest<'_>) -> Result<Plan>;

    /// Full replacement text for one file.
    fn rewrite_file(&self, intent: &str, path: &str, content: &str) -> Result<String>;
}

/// Keeps candidates only, in model order, without duplicates. A selected
/// `README.md` narrows the selection to that file alone.
pub fn narrow_selection(selected: Vec<String>, candidates: &[String]) -> Vec<String> {
    if selected.iter().any(|p| p == "README.md") && candidates.iter().any(|p| p == "README.md") {
        return vec!["README.md".to_string()];
    }
    let mut out: Vec<String> = Vec::new();
    for path in selected {
        if candidates.contains(&path) && !out.contains(&path) {
            out.push(path);
        }
    }
    out
}

enum AskError {
    Backend(anyhow::Error),
    Decode(DecodeError),
}

/// Completion service driven by a chat model.
pub struct ModelPlanner<B> {
    backend: B,
    cfg: LlmConfig,
}

impl<B: ChatBackend> ModelPlanner<B> {
    pub fn new(backend: B, cfg: LlmConfig) -> Self {
        Self { backend, cfg }
    }

    /// Asks for JSON, requesting a fresh completion whenever the output does
    /// not decode. Transport errors are not retried here.
    fn ask_json(&self, system: &str, user: &str) -> Result<Value> {
        let policy = RetryPolicy::immediate(self.cfg.json_retries);
        let outcome = policy.run(
            |_| {
                let raw = self.backend.complete(system, user).map_err(AskError::Backend)?;
                decode_json(&raw).map_err(AskError::Decode)
            },
            |err| match err {
                AskError::Backend(_) => RetryDecision::Fatal,
                AskError::Decode(_) => RetryDecision::Retry,
            },
        );
        match outcome {
            Ok(value) => Ok(value),
            Err(RetryError::Exhausted {
                attempts,
                last: AskError::Decode(err),
            }) => Err(DecodeError::Exhausted {
                attempts,
                raw: err.raw().unwrap_or_default().to_string(),
            }
            .into()),
            Err(err) => match err.into_inner() {
                AskError::Backend(err) => Err(err),
                AskError::Decode(err) => Err(err.into()),
            },
        }
    }

    fn decode_plan(value: Value) -> Result<Plan> {
        if !value.get("edits").is_some_and(Value::is_array) {
            return Err(DecodeError::Shape {
                expected: "an object with an edits array",
                found: decode::value_kind(&value),
            }
            .into());
        }
        serde_json::from_value(value).map_err(|err| anyhow!("model plan has invalid edits: {err}"))
    }
}

impl<B: ChatBackend> CompletionService for ModelPlanner<B> {
    fn select_files(&self, intent: &str, candidates: &[String]) -> Result<Vec<String>> {
        let limited: Vec<String> = candidates
            .iter()
            .take(self.cfg.max_candidate_files)
            .cloned()
            .collect();
        let value = self.ask_json(prompts::SELECT_SYSTEM, &prompts::select_user(intent, &limited))?;
        let items = match value {
            Value::Array(items) => items,
            other => {
                return Err(DecodeError::Shape {
                    expected: "an array of paths",
                    found: decode::value_kind(&other),
                }
                .into());
            }
        };
        let selected = items
            .into_iter()
            .filter_map(|item| item.as_str().map(ToString::to_string))
            .collect();
        Ok(narrow_selection(selected, &limited))
    }

    fn generate_plan(
        &self,
        intent: &str,
        contents: &BTreeMap<String, String>,
        digests: &Manifest,
    ) -> Result<Plan> {
        let user = prompts::plan_user(intent, contents, digests, self.cfg.max_prompt_file_chars);
        Self::decode_plan(self.ask_json(&prompts::plan_system(), &user)?)
    }

    fn repair_plan(&self, request: &RepairRequest<'_>) -> Result<Plan> {
        let user = prompts::repair_user(
            request.intent,
            request.contents,
            request.digests,
            request.failed_diff,
            request.tool_error,
            self.cfg.max_prompt_file_chars,
        );
        Self::decode_plan(self.ask_json(&prompts::repair_system(), &user)?)
    }

    fn rewrite_file(&self, intent: &str, path: &str, content: &str) -> Result<String> {
        let raw = self.backend.complete(
            prompts::REWRITE_SYSTEM,
            &prompts::rewrite_user(intent, path, content),
        )?;
        let mut text = strip_code_fences(&raw).to_string();
        if content.ends_with('\n') && !text.ends_with('\n') {
            text.push('\n');
        }
        Ok(text)
    }
}
