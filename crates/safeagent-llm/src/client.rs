use anyhow::{Result, anyhow};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use safeagent_core::{LlmConfig, RetryDecision, RetryPolicy};
use serde_json::{Value, json};
use std::error::Error as StdError;
use std::time::Duration;

/// One system + user exchange returning the assistant's text.
pub trait ChatBackend {
    fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Blocking client for an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiChatClient {
    cfg: LlmConfig,
    client: Client,
}

impl OpenAiChatClient {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self { cfg, client })
    }

    fn build_payload(&self, system: &str, user: &str) -> Value {
        json!({
            "model": self.cfg.model,
            "temperature": self.cfg.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        })
    }

    fn complete_inner(&self, payload: &Value, api_key: &str) -> Result<String> {
        let policy = RetryPolicy::new(
            u32::from(self.cfg.max_retries).saturating_add(1),
            self.cfg.retry_base_ms,
        );
        policy
            .run(
                |attempt| self.attempt_completion(payload, api_key, attempt),
                |failure| failure.decision,
            )
            .map_err(|err| err.into_inner().error)
    }

    fn attempt_completion(
        &self,
        payload: &Value,
        api_key: &str,
        attempt: u32,
    ) -> std::result::Result<String, AttemptFailure> {
        let resp = self
            .client
            .post(&self.cfg.endpoint)
            .bearer_auth(api_key)
            .json(payload)
            .send()
            .map_err(|e| AttemptFailure {
                error: format_transport_error(&e),
                decision: if should_retry_transport_error(&e) {
                    RetryDecision::Retry
                } else {
                    RetryDecision::Fatal
                },
            })?;

        let status = resp.status();
        let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
        let body = resp.text().map_err(|e| AttemptFailure::fatal(e.into()))?;
        if status.is_success() {
            return parse_completion_payload(&body).map_err(AttemptFailure::fatal);
        }
        Err(AttemptFailure {
            error: format_api_error(
                status,
                &body,
                attempt,
                self.cfg.max_retries,
                &self.cfg.api_key_env,
            ),
            decision: status_decision(status, retry_after),
        })
    }
}

/// One failed request and whether the retry policy may try again.
struct AttemptFailure {
    error: anyhow::Error,
    decision: RetryDecision,
}

impl AttemptFailure {
    fn fatal(error: anyhow::Error) -> Self {
        Self {
            error,
            decision: RetryDecision::Fatal,
        }
    }
}

impl ChatBackend for OpenAiChatClient {
    fn complete(&self, system: &str, user: &str) -> Result<String> {
        let Some(api_key) = self.cfg.resolve_api_key() else {
            return Err(anyhow!(
                "no API key configured: set {} or llm.api_key in settings",
                self.cfg.api_key_env
            ));
        };
        let payload = self.build_payload(system, user);
        self.complete_inner(&payload, &api_key)
    }
}

fn format_api_error(
    status: StatusCode,
    body: &str,
    attempt: u32,
    max_retries: u8,
    key_env: &str,
) -> anyhow::Error {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED => anyhow!(
            "Invalid or missing API key (HTTP 401). Set {key_env} or llm.api_key in settings."
        ),
        StatusCode::TOO_MANY_REQUESTS => anyhow!(
            "Rate limited (HTTP 429). Exhausted {}/{} retries. Detail: {}",
            attempt + 1,
            u32::from(max_retries) + 1,
            detail
        ),
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => anyhow!(
            "Completion server error (HTTP {}). Exhausted {}/{} retries. Detail: {}",
            status.as_u16(),
            attempt + 1,
            u32::from(max_retries) + 1,
            detail
        ),
        _ => anyhow!("Completion API error (HTTP {}): {}", status.as_u16(), detail),
    }
}

fn format_transport_error(err: &reqwest::Error) -> anyhow::Error {
    let inner_msg = err
        .source()
        .map(|e| e.to_string())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let is_dns = inner_msg.contains("dns")
        || inner_msg.contains("resolve")
        || inner_msg.contains("name or service not known")
        || inner_msg.contains("no such host");

    if err.is_timeout() {
        anyhow!("Completion request timed out. Consider raising llm.timeout_seconds.")
    } else if is_dns {
        anyhow!("DNS resolution failed for the completion endpoint.")
    } else if err.is_connect() {
        anyhow!("Connection refused by the completion endpoint.")
    } else {
        anyhow!("Network error: {err}")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

/// A `Retry-After` header replaces the policy backoff for that retry.
fn status_decision(status: StatusCode, retry_after_seconds: Option<u64>) -> RetryDecision {
    if !should_retry_status(status) {
        return RetryDecision::Fatal;
    }
    match retry_after_seconds {
        Some(seconds) => RetryDecision::RetryAfter(Duration::from_secs(seconds)),
        None => RetryDecision::Retry,
    }
}

fn parse_completion_payload(body: &str) -> Result<String> {
    let value: Value = serde_json::from_str(body)?;
    let Some(choice) = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
    else {
        return Err(anyhow!("unexpected completion payload: missing choices[0]"));
    };
    let content = choice
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or_default()
        .trim()
        .to_string();
    if content.is_empty() {
        return Err(anyhow!(
            "unexpected completion payload: empty message.content"
        ));
    }
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parses_first_choice_content() {
        let body = r#"{"choices":[{"message":{"content":"  [\"a.py\"]  "}}]}"#;
        assert_eq!(parse_completion_payload(body).expect("parse"), "[\"a.py\"]");
        assert!(parse_completion_payload(r#"{"choices":[]}"#).is_err());
    }

    #[test]
    fn payload_pins_model_and_temperature() {
        let client = OpenAiChatClient::new(LlmConfig::default()).expect("client");
        let payload = client.build_payload("sys", "usr");
        assert_eq!(payload["model"], "gpt-4o-mini");
        assert_eq!(payload["temperature"], 0.0);
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][1]["content"], "usr");
    }

    #[test]
    fn retry_status_classification() {
        assert!(should_retry_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(should_retry_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!should_retry_status(StatusCode::UNAUTHORIZED));
        assert!(!should_retry_status(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn retry_after_header_sets_the_delay() {
        assert_eq!(
            status_decision(StatusCode::TOO_MANY_REQUESTS, Some(2)),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            status_decision(StatusCode::SERVICE_UNAVAILABLE, None),
            RetryDecision::Retry
        );
        assert_eq!(
            status_decision(StatusCode::UNAUTHORIZED, Some(2)),
            RetryDecision::Fatal
        );
    }

    #[test]
    fn persistent_server_errors_exhaust_the_retry_budget() {
        let (endpoint, count) = serve_scripted(vec![(500, r#"{"error":"down"}"#.to_string())]);
        let cfg = LlmConfig {
            endpoint,
            api_key: Some("test-key".to_string()),
            api_key_env: "SAFEAGENT_LLM_EXHAUST_TEST_UNSET".to_string(),
            max_retries: 2,
            retry_base_ms: 1,
            ..LlmConfig::default()
        };
        let client = OpenAiChatClient::new(cfg).expect("client");
        let err = client.complete("sys", "usr").expect_err("never succeeds");
        assert!(err.to_string().contains("Exhausted 3/3 retries"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn transient_status_is_retried_then_succeeds() {
        let (endpoint, count) = serve_scripted(vec![
            (503, r#"{"error":"busy"}"#.to_string()),
            (
                200,
                r#"{"choices":[{"message":{"content":"ok-after-retry"}}]}"#.to_string(),
            ),
        ]);
        let cfg = LlmConfig {
            endpoint,
            api_key: Some("test-key".to_string()),
            api_key_env: "SAFEAGENT_LLM_RETRY_TEST_UNSET".to_string(),
            max_retries: 2,
            retry_base_ms: 1,
            ..LlmConfig::default()
        };
        let client = OpenAiChatClient::new(cfg).expect("client");
        let out = client.complete("sys", "usr").expect("eventually succeeds");
        assert_eq!(out, "ok-after-retry");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unauthorized_is_not_retried() {
        let (endpoint, count) = serve_scripted(vec![(
            401,
            r#"{"error":{"message":"invalid_api_key"}}"#.to_string(),
        )]);
        let cfg = LlmConfig {
            endpoint,
            api_key: Some("bad".to_string()),
            api_key_env: "SAFEAGENT_LLM_401_TEST_UNSET".to_string(),
            max_retries: 3,
            retry_base_ms: 1,
            ..LlmConfig::default()
        };
        let client = OpenAiChatClient::new(cfg).expect("client");
        let err = client.complete("sys", "usr").expect_err("401");
        assert!(err.to_string().contains("HTTP 401"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_key_fails_before_any_request() {
        let cfg = LlmConfig {
            endpoint: "http://127.0.0.1:9/never".to_string(),
            api_key: None,
            api_key_env: "SAFEAGENT_LLM_NO_KEY_TEST_UNSET".to_string(),
            ..LlmConfig::default()
        };
        let client = OpenAiChatClient::new(cfg).expect("client");
        let err = client.complete("sys", "usr").expect_err("no key");
        assert!(err.to_string().contains("SAFEAGENT_LLM_NO_KEY_TEST_UNSET"));
    }

    /// Serves one scripted response per connection; the last one repeats.
    fn serve_scripted(responses: Vec<(u16, String)>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                let _ = consume_http_request(&mut stream);
                let idx = seen.fetch_add(1, Ordering::SeqCst);
                let (status, body) = responses
                    .get(idx)
                    .or_else(|| responses.last())
                    .cloned()
                    .expect("scripted response");
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nRetry-After: 0\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (format!("http://{addr}/v1/chat/completions"), count)
    }

    fn consume_http_request(stream: &mut std::net::TcpStream) -> std::io::Result<()> {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 1024];
        let header_end = loop {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                return Ok(());
            }
            buffer.extend_from_slice(&chunk[..read]);
            if let Some(idx) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break idx + 4;
            }
        };
        let headers = String::from_utf8_lossy(&buffer[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let mut body_len = buffer.len() - header_end;
        while body_len < content_length {
            let read = stream.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            body_len += read;
        }
        Ok(())
    }
}
