use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use prechat_core::config::{AppConfig, LoadOptions};
use toml::Value;

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for (key, value, env_keys) in effective_values(&config) {
        let source =
            field_source(key, env_keys, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(key, &value, source));
    }

    lines.join("\n")
}

fn effective_values(config: &AppConfig) -> Vec<(&'static str, String, &'static [&'static str])> {
    let api_key = if config.llm.api_key.is_some() { "<redacted>" } else { "<unset>" };
    vec![
        ("database.url", config.database.url.clone(), &["PRECHAT_DATABASE_URL"]),
        (
            "database.max_connections",
            config.database.max_connections.to_string(),
            &["PRECHAT_DATABASE_MAX_CONNECTIONS"],
        ),
        (
            "database.timeout_secs",
            config.database.timeout_secs.to_string(),
            &["PRECHAT_DATABASE_TIMEOUT_SECS"],
        ),
        ("llm.provider", config.llm.provider.as_str().to_string(), &["PRECHAT_LLM_PROVIDER"]),
        ("llm.model", config.llm.model.clone(), &["PRECHAT_LLM_MODEL"]),
        ("llm.base_url", config.llm.effective_base_url().to_string(), &["PRECHAT_LLM_BASE_URL"]),
        ("llm.api_key", api_key.to_string(), &["PRECHAT_LLM_API_KEY"]),
        ("llm.timeout_secs", config.llm.timeout_secs.to_string(), &["PRECHAT_LLM_TIMEOUT_SECS"]),
        ("server.bind_address", config.server.bind_address.clone(), &["PRECHAT_SERVER_BIND_ADDRESS"]),
        ("server.port", config.server.port.to_string(), &["PRECHAT_SERVER_PORT"]),
        (
            "server.graceful_shutdown_secs",
            config.server.graceful_shutdown_secs.to_string(),
            &[],
        ),
        (
            "logging.level",
            config.logging.level.clone(),
            &["PRECHAT_LOGGING_LEVEL", "PRECHAT_LOG_LEVEL"],
        ),
        (
            "logging.format",
            format!("{:?}", config.logging.format).to_ascii_lowercase(),
            &["PRECHAT_LOGGING_FORMAT", "PRECHAT_LOG_FORMAT"],
        ),
        (
            "calendar.utc_offset_minutes",
            config.calendar.utc_offset_minutes.to_string(),
            &["PRECHAT_CALENDAR_UTC_OFFSET_MINUTES"],
        ),
        (
            "budget.requests_per_minute",
            config.budget.requests_per_minute.to_string(),
            &["PRECHAT_BUDGET_REQUESTS_PER_MINUTE"],
        ),
        (
            "budget.requests_per_day",
            config.budget.requests_per_day.to_string(),
            &["PRECHAT_BUDGET_REQUESTS_PER_DAY"],
        ),
        (
            "budget.tokens_per_minute",
            config.budget.tokens_per_minute.to_string(),
            &["PRECHAT_BUDGET_TOKENS_PER_MINUTE"],
        ),
        (
            "budget.tokens_per_day",
            config.budget.tokens_per_day.to_string(),
            &["PRECHAT_BUDGET_TOKENS_PER_DAY"],
        ),
        (
            "budget.safety_margin",
            config.budget.safety_margin.to_string(),
            &["PRECHAT_BUDGET_SAFETY_MARGIN"],
        ),
        ("cache.max_entries", config.cache.max_entries.to_string(), &[]),
        ("cache.ttl_secs", config.cache.ttl_secs.to_string(), &[]),
        ("coalescing.enabled", config.coalescing.enabled.to_string(), &[]),
        ("coalescing.window_secs", config.coalescing.window_secs.to_string(), &[]),
        ("coalescing.max_batch", config.coalescing.max_batch.to_string(), &[]),
        (
            "coalescing.flush_interval_secs",
            config.coalescing.flush_interval_secs.to_string(),
            &[],
        ),
        ("throttle.enabled", config.throttle.enabled.to_string(), &["PRECHAT_THROTTLE_ENABLED"]),
        (
            "throttle.max_responses_per_day",
            config.throttle.max_responses_per_day.to_string(),
            &["PRECHAT_THROTTLE_MAX_RESPONSES_PER_DAY"],
        ),
        ("throttle.shopping_bonus", config.throttle.shopping_bonus.to_string(), &[]),
        ("throttle.block_duration_secs", config.throttle.block_duration_secs.to_string(), &[]),
        ("throttle.retention_days", config.throttle.retention_days.to_string(), &[]),
        (
            "messages.company_phone",
            config.messages.company_phone.clone(),
            &["PRECHAT_MESSAGES_COMPANY_PHONE"],
        ),
        (
            "classification.use_model",
            config.classification.use_model.to_string(),
            &["PRECHAT_CLASSIFICATION_USE_MODEL"],
        ),
        ("classification.temperature", config.classification.temperature.to_string(), &[]),
        ("classification.max_tokens", config.classification.max_tokens.to_string(), &[]),
        (
            "classification.max_prompt_chars",
            config.classification.max_prompt_chars.to_string(),
            &[],
        ),
        ("maintenance.interval_secs", config.maintenance.interval_secs.to_string(), &[]),
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("prechat.toml"), PathBuf::from("config/prechat.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use super::contains_path;

    #[test]
    fn contains_path_walks_nested_tables() {
        let doc: toml::Value = "[budget]\nsafety_margin = 0.7\n".parse().expect("toml");
        assert!(contains_path(&doc, "budget.safety_margin"));
        assert!(!contains_path(&doc, "budget.tokens_per_day"));
        assert!(!contains_path(&doc, "cache.ttl_secs"));
    }
}
