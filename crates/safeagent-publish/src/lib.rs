use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use safeagent_core::{ChangeRequestRef, PublishConfig};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;

const MAX_ERROR_BODY_LEN: usize = 500;

/// Write path to the hosting service. Only branch creation, commits to that
/// branch and change requests exist; there is no delete or force operation.
pub trait Publisher {
    fn create_branch(&self, name: &str) -> Result<()>;
    /// Creates or updates `path` on `branch`. Updates send the current remote
    /// blob sha so a concurrent change is never silently overwritten.
    fn commit_file(&self, branch: &str, path: &str, content: &str, message: &str) -> Result<()>;
    fn open_change_request(&self, branch: &str, title: &str, body: &str) -> Result<ChangeRequestRef>;
    fn comment_on_change_request(&self, change: &ChangeRequestRef, body: &str) -> Result<()>;
}

/// Stands in when the hosting service is not configured; every write fails
/// with the configuration problem.
#[derive(Debug, Clone)]
pub struct UnavailablePublisher {
    reason: String,
}

impl UnavailablePublisher {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl Publisher for UnavailablePublisher {
    fn create_branch(&self, _name: &str) -> Result<()> {
        Err(anyhow!("{}", self.reason))
    }

    fn commit_file(&self, _branch: &str, _path: &str, _content: &str, _message: &str) -> Result<()> {
        Err(anyhow!("{}", self.reason))
    }

    fn open_change_request(&self, _branch: &str, _title: &str, _body: &str) -> Result<ChangeRequestRef> {
        Err(anyhow!("{}", self.reason))
    }

    fn comment_on_change_request(&self, _change: &ChangeRequestRef, _body: &str) -> Result<()> {
        Err(anyhow!("{}", self.reason))
    }
}

/// `<prefix><slug>-<first 8 of run id>`, slug from the prompt's first line.
pub fn branch_name(prefix: &str, prompt: &str, run_id: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or_default();
    let mut slug = String::new();
    for ch in first_line.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
        if slug.len() >= 40 {
            break;
        }
    }
    let slug = slug.trim_matches('-');
    let short_id: String = run_id.chars().filter(|c| *c != '-').take(8).collect();
    if slug.is_empty() {
        format!("{prefix}run-{short_id}")
    } else {
        format!("{prefix}{slug}-{short_id}")
    }
}

/// Extract owner and repo from a GitHub remote URL (ssh or https).
pub fn parse_remote_url(url: &str) -> Option<(String, String)> {
    let path = if let Some(rest) = url.strip_prefix("git@github.com:") {
        rest.to_string()
    } else {
        let idx = url.find("github.com")?;
        url[idx + "github.com".len()..]
            .trim_start_matches([':', '/'])
            .to_string()
    };
    let path = path.trim_end_matches('/').trim_end_matches(".git");
    let mut parts = path.splitn(2, '/');
    let owner = parts.next().filter(|s| !s.is_empty())?;
    let repo = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
    Some((owner.to_string(), repo.to_string()))
}

#[derive(Debug, Clone)]
pub struct GitHubPublisher {
    client: Client,
    api_base: String,
    owner: String,
    repo: String,
    base_branch: String,
    token: String,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    message: String,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: Option<String>,
}

impl GitHubPublisher {
    /// Owner and repo come from config, else from `repo_url`.
    pub fn new(cfg: &PublishConfig, repo_url: &str) -> Result<Self> {
        let (owner, repo) = match (&cfg.owner, &cfg.repo) {
            (Some(owner), Some(repo)) => (owner.clone(), repo.clone()),
            _ => parse_remote_url(repo_url).ok_or_else(|| {
                anyhow!("GitHub owner/repo not configured and not derivable from {repo_url}")
            })?,
        };
        let token = cfg.resolve_token().ok_or_else(|| {
            anyhow!(
                "GitHub auth not configured: set {} or publish.token",
                cfg.token_env
            )
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            api_base: cfg.api_base.trim_end_matches('/').to_string(),
            owner,
            repo,
            base_branch: cfg.base_branch.clone(),
            token,
        })
    }

    fn repo_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = Url::parse(&self.api_base).context("invalid publish.api_base")?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("publish.api_base cannot carry a path"))?
            .pop_if_empty()
            .extend(["repos", self.owner.as_str(), self.repo.as_str()])
            .extend(segments);
        Ok(url)
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", "safeagent")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    fn ensure_not_base(&self, branch: &str) -> Result<()> {
        let bare = branch.strip_prefix("refs/heads/").unwrap_or(branch);
        if bare == self.base_branch {
            return Err(anyhow!(
                "refusing to write to protected base branch {}",
                self.base_branch
            ));
        }
        Ok(())
    }

    fn base_sha(&self) -> Result<String> {
        let url = self.repo_url(&["git", "ref", "heads", &self.base_branch])?;
        let resp = self
            .authed(self.client.get(url))
            .send()
            .context("failed to fetch base ref")?;
        let value = expect_success(resp, "get base ref")?;
        value
            .pointer("/object/sha")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| anyhow!("base ref response has no object.sha"))
    }

    fn remote_blob_sha(&self, branch: &str, segments: &[&str]) -> Result<Option<String>> {
        let mut url = self.repo_url(segments)?;
        url.query_pairs_mut().append_pair("ref", branch);
        let resp = self
            .authed(self.client.get(url))
            .send()
            .context("failed to fetch current file contents")?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value = expect_success(resp, "get file contents")?;
        Ok(value
            .get("sha")
            .and_then(Value::as_str)
            .map(ToString::to_string))
    }
}

impl Publisher for GitHubPublisher {
    fn create_branch(&self, name: &str) -> Result<()> {
        self.ensure_not_base(name)?;
        let sha = self.base_sha()?;
        let url = self.repo_url(&["git", "refs"])?;
        let resp = self
            .authed(self.client.post(url))
            .json(&json!({"ref": format!("refs/heads/{name}"), "sha": sha}))
            .send()
            .context("failed to send branch creation request")?;
        expect_success(resp, "create branch")?;
        Ok(())
    }

    fn commit_file(&self, branch: &str, path: &str, content: &str, message: &str) -> Result<()> {
        self.ensure_not_base(branch)?;
        let mut segments = vec!["contents"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        let existing = self.remote_blob_sha(branch, &segments)?;

        let mut payload = json!({
            "message": message,
            "content": BASE64.encode(content.as_bytes()),
            "branch": branch,
        });
        if let Some(sha) = existing {
            payload["sha"] = Value::String(sha);
        }
        let url = self.repo_url(&segments)?;
        let resp = self
            .authed(self.client.put(url))
            .json(&payload)
            .send()
            .context("failed to send commit request")?;
        expect_success(resp, "commit file")?;
        Ok(())
    }

    fn open_change_request(&self, branch: &str, title: &str, body: &str) -> Result<ChangeRequestRef> {
        self.ensure_not_base(branch)?;
        let url = self.repo_url(&["pulls"])?;
        let body = if body.trim().is_empty() {
            "Created by SafeAgent"
        } else {
            body
        };
        let resp = self
            .authed(self.client.post(url))
            .json(&json!({
                "title": title,
                "head": branch,
                "base": self.base_branch,
                "body": body,
            }))
            .send()
            .context("failed to send pull request creation")?;
        let value = expect_success(resp, "open pull request")?;
        let number = value
            .get("number")
            .and_then(Value::as_u64)
            .ok_or_else(|| anyhow!("pull request response has no number"))?;
        let url = value
            .get("html_url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(ChangeRequestRef { number, url })
    }

    fn comment_on_change_request(&self, change: &ChangeRequestRef, body: &str) -> Result<()> {
        let number = change.number.to_string();
        let url = self.repo_url(&["issues", &number, "comments"])?;
        let resp = self
            .authed(self.client.post(url))
            .json(&json!({"body": body}))
            .send()
            .context("failed to send pull request comment")?;
        expect_success(resp, "comment on pull request")?;
        Ok(())
    }
}

fn expect_success(resp: Response, action: &str) -> Result<Value> {
    let status = resp.status();
    let body = resp.text().unwrap_or_default();
    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&body)
            .with_context(|| format!("failed to parse {action} response"));
    }
    let detail = match serde_json::from_str::<ApiErrorResponse>(&body) {
        Ok(api_error) => {
            let extra = api_error
                .errors
                .first()
                .and_then(|e| e.message.clone())
                .unwrap_or_default();
            if extra.is_empty() {
                api_error.message
            } else {
                format!("{}: {}", api_error.message, extra)
            }
        }
        Err(_) => sanitize_error_body(&body),
    };
    Err(anyhow!(
        "GitHub {action} failed (HTTP {}): {detail}",
        status.as_u16()
    ))
}

fn sanitize_error_body(body: &str) -> String {
    const SECRET_PATTERNS: &[&str] = &[
        "token",
        "secret",
        "password",
        "credential",
        "bearer",
        "ghp_",
        "gho_",
        "ghu_",
        "github_pat_",
    ];
    let truncated: String = if body.chars().count() > MAX_ERROR_BODY_LEN {
        let head: String = body.chars().take(MAX_ERROR_BODY_LEN).collect();
        format!("{head}... (truncated)")
    } else {
        body.to_string()
    };
    let lower = truncated.to_lowercase();
    if SECRET_PATTERNS.iter().any(|p| lower.contains(p)) {
        return "(error details redacted - may contain sensitive data)".to_string();
    }
    truncated
}
