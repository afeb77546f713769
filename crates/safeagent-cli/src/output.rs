use anyhow::Result;
use safeagent_core::AppConfig;
use serde::Serialize;
use serde_json::json;

pub(crate) const REDACTED: &str = "***REDACTED***";

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) fn redact_config_for_display(cfg: &AppConfig) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(cfg)?;
    for (section, key) in [("llm", "api_key"), ("publish", "token")] {
        if let Some(entry) = value.get_mut(section).and_then(|entry| entry.as_object_mut())
            && entry.get(key).is_some_and(|v| !v.is_null())
        {
            entry.insert(key.to_string(), json!(REDACTED));
        }
    }
    Ok(value)
}

/// Single-line preview for tables.
pub(crate) fn one_line(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_only_configured_secrets() {
        let mut cfg = AppConfig::default();
        cfg.llm.api_key = Some("sk-live".to_string());
        let value = redact_config_for_display(&cfg).expect("redact");
        assert_eq!(value["llm"]["api_key"], REDACTED);
        assert!(value["publish"]["token"].is_null());
        assert_eq!(value["publish"]["base_branch"], "main");
    }

    #[test]
    fn one_line_flattens_and_truncates() {
        assert_eq!(one_line("fix\ntypo", 20), "fix typo");
        assert_eq!(one_line("abcdefghij", 6), "abc...");
    }
}
