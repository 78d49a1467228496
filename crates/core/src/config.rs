use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Ten years; longer blocks would push `blocked_until` toward the end of chrono's range.
pub const MAX_BLOCK_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub calendar: CalendarConfig,
    pub budget: BudgetConfig,
    pub cache: CacheConfig,
    pub coalescing: CoalescingConfig,
    pub throttle: ThrottleConfig,
    pub messages: MessagesConfig,
    pub maintenance: MaintenanceConfig,
    pub classification: ClassificationConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Day boundaries for daily windows and per-sender counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CalendarConfig {
    pub utc_offset_minutes: i32,
}

/// Provider limits for the upstream model plus the enforced headroom.
#[derive(Clone, Debug, PartialEq)]
pub struct BudgetConfig {
    pub requests_per_minute: u64,
    pub requests_per_day: u64,
    pub tokens_per_minute: u64,
    pub tokens_per_day: u64,
    pub safety_margin: f64,
    /// Tokens reserved up front for the model's answer on top of the prompt estimate.
    pub response_token_allowance: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub ttl_secs: u64,
    pub key_prefix_chars: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoalescingConfig {
    pub enabled: bool,
    pub window_secs: u64,
    pub max_batch: usize,
    pub delimiter: String,
    pub flush_interval_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThrottleConfig {
    pub enabled: bool,
    pub max_responses_per_day: u32,
    pub shopping_bonus_enabled: bool,
    pub shopping_bonus: u32,
    pub block_duration_secs: u64,
    pub retention_days: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessagesConfig {
    pub company_phone: String,
    pub limit_reached: String,
    pub blocked: String,
    pub maintenance: Vec<String>,
    pub received: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub interval_secs: u64,
}

/// Model-backed intent classification. Keyword matching is used when disabled or denied.
#[derive(Clone, Debug, PartialEq)]
pub struct ClassificationConfig {
    pub use_model: bool,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Longer messages are cut at the first sentence, or truncated, before classification.
    pub max_prompt_chars: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    Groq,
    OpenAi,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Groq => "groq",
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Ollama => "http://localhost:11434/v1",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_api_key: Option<String>,
    pub server_port: Option<u16>,
    pub budget_safety_margin: Option<f64>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://prechat.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: None,
                model: "llama3.1".to_string(),
                timeout_secs: 10,
                temperature: 0.7,
                max_tokens: 500,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
            calendar: CalendarConfig { utc_offset_minutes: 0 },
            budget: BudgetConfig::default(),
            cache: CacheConfig::default(),
            coalescing: CoalescingConfig::default(),
            throttle: ThrottleConfig::default(),
            messages: MessagesConfig::default(),
            maintenance: MaintenanceConfig { interval_secs: 3600 },
            classification: ClassificationConfig::default(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            requests_per_day: 14_400,
            tokens_per_minute: 6_000,
            tokens_per_day: 500_000,
            safety_margin: 0.8,
            response_token_allowance: 150,
        }
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self { use_model: false, temperature: 0.2, max_tokens: 20, max_prompt_chars: 500 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 1_000, ttl_secs: 3_600, key_prefix_chars: 100 }
    }
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 30,
            max_batch: 5,
            delimiter: " | ".to_string(),
            flush_interval_secs: 5,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_responses_per_day: 5,
            shopping_bonus_enabled: true,
            shopping_bonus: 2,
            block_duration_secs: 3 * 24 * 60 * 60,
            retention_days: 7,
        }
    }
}

impl Default for MessagesConfig {
    fn default() -> Self {
        Self {
            company_phone: "(11) 99999-9999".to_string(),
            limit_reached: "You have reached the limit of automated replies for today ({count}/{ceiling}). \
                            To continue, please contact us directly: {company_phone}"
                .to_string(),
            blocked: "You have been handed over to our sales team. Please wait for their contact. \
                      Automated replies are paused for {remaining}."
                .to_string(),
            maintenance: vec![
                "We are going through a brief technical maintenance. Please try again in a few minutes."
                    .to_string(),
                "Our assistant is temporarily unavailable. We will be back shortly!".to_string(),
                "We are making a few technical adjustments. Please try again soon.".to_string(),
            ],
            received: "Message received! Processing...".to_string(),
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "groq" => Ok(Self::Groq),
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected groq|openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl LlmConfig {
    pub fn effective_base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .map(|value| value.trim_end_matches('/'))
            .unwrap_or_else(|| self.provider.default_base_url())
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("prechat.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(llm_api_key_value) = llm.api_key {
                self.llm.api_key = Some(secret_value(llm_api_key_value));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(temperature) = llm.temperature {
                self.llm.temperature = temperature;
            }
            if let Some(max_tokens) = llm.max_tokens {
                self.llm.max_tokens = max_tokens;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }

        if let Some(calendar) = patch.calendar {
            if let Some(utc_offset_minutes) = calendar.utc_offset_minutes {
                self.calendar.utc_offset_minutes = utc_offset_minutes;
            }
        }

        if let Some(budget) = patch.budget {
            if let Some(value) = budget.requests_per_minute {
                self.budget.requests_per_minute = value;
            }
            if let Some(value) = budget.requests_per_day {
                self.budget.requests_per_day = value;
            }
            if let Some(value) = budget.tokens_per_minute {
                self.budget.tokens_per_minute = value;
            }
            if let Some(value) = budget.tokens_per_day {
                self.budget.tokens_per_day = value;
            }
            if let Some(value) = budget.safety_margin {
                self.budget.safety_margin = value;
            }
            if let Some(value) = budget.response_token_allowance {
                self.budget.response_token_allowance = value;
            }
        }

        if let Some(cache) = patch.cache {
            if let Some(value) = cache.max_entries {
                self.cache.max_entries = value;
            }
            if let Some(value) = cache.ttl_secs {
                self.cache.ttl_secs = value;
            }
            if let Some(value) = cache.key_prefix_chars {
                self.cache.key_prefix_chars = value;
            }
        }

        if let Some(coalescing) = patch.coalescing {
            if let Some(value) = coalescing.enabled {
                self.coalescing.enabled = value;
            }
            if let Some(value) = coalescing.window_secs {
                self.coalescing.window_secs = value;
            }
            if let Some(value) = coalescing.max_batch {
                self.coalescing.max_batch = value;
            }
            if let Some(value) = coalescing.delimiter {
                self.coalescing.delimiter = value;
            }
            if let Some(value) = coalescing.flush_interval_secs {
                self.coalescing.flush_interval_secs = value;
            }
        }

        if let Some(throttle) = patch.throttle {
            if let Some(value) = throttle.enabled {
                self.throttle.enabled = value;
            }
            if let Some(value) = throttle.max_responses_per_day {
                self.throttle.max_responses_per_day = value;
            }
            if let Some(value) = throttle.shopping_bonus_enabled {
                self.throttle.shopping_bonus_enabled = value;
            }
            if let Some(value) = throttle.shopping_bonus {
                self.throttle.shopping_bonus = value;
            }
            if let Some(value) = throttle.block_duration_secs {
                self.throttle.block_duration_secs = value;
            }
            if let Some(value) = throttle.retention_days {
                self.throttle.retention_days = value;
            }
        }

        if let Some(messages) = patch.messages {
            if let Some(value) = messages.company_phone {
                self.messages.company_phone = value;
            }
            if let Some(value) = messages.limit_reached {
                self.messages.limit_reached = value;
            }
            if let Some(value) = messages.blocked {
                self.messages.blocked = value;
            }
            if let Some(value) = messages.maintenance {
                self.messages.maintenance = value;
            }
            if let Some(value) = messages.received {
                self.messages.received = value;
            }
        }

        if let Some(maintenance) = patch.maintenance {
            if let Some(value) = maintenance.interval_secs {
                self.maintenance.interval_secs = value;
            }
        }

        if let Some(classification) = patch.classification {
            if let Some(value) = classification.use_model {
                self.classification.use_model = value;
            }
            if let Some(value) = classification.temperature {
                self.classification.temperature = value;
            }
            if let Some(value) = classification.max_tokens {
                self.classification.max_tokens = value;
            }
            if let Some(value) = classification.max_prompt_chars {
                self.classification.max_prompt_chars = value;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("PRECHAT_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("PRECHAT_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_env("PRECHAT_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("PRECHAT_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_env("PRECHAT_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PRECHAT_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("PRECHAT_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("PRECHAT_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("PRECHAT_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("PRECHAT_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_env("PRECHAT_LLM_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("PRECHAT_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("PRECHAT_SERVER_PORT") {
            self.server.port = parse_env("PRECHAT_SERVER_PORT", &value)?;
        }

        if let Some(value) = read_env("PRECHAT_CALENDAR_UTC_OFFSET_MINUTES") {
            self.calendar.utc_offset_minutes =
                parse_env("PRECHAT_CALENDAR_UTC_OFFSET_MINUTES", &value)?;
        }

        if let Some(value) = read_env("PRECHAT_BUDGET_REQUESTS_PER_MINUTE") {
            self.budget.requests_per_minute =
                parse_env("PRECHAT_BUDGET_REQUESTS_PER_MINUTE", &value)?;
        }
        if let Some(value) = read_env("PRECHAT_BUDGET_REQUESTS_PER_DAY") {
            self.budget.requests_per_day = parse_env("PRECHAT_BUDGET_REQUESTS_PER_DAY", &value)?;
        }
        if let Some(value) = read_env("PRECHAT_BUDGET_TOKENS_PER_MINUTE") {
            self.budget.tokens_per_minute = parse_env("PRECHAT_BUDGET_TOKENS_PER_MINUTE", &value)?;
        }
        if let Some(value) = read_env("PRECHAT_BUDGET_TOKENS_PER_DAY") {
            self.budget.tokens_per_day = parse_env("PRECHAT_BUDGET_TOKENS_PER_DAY", &value)?;
        }
        if let Some(value) = read_env("PRECHAT_BUDGET_SAFETY_MARGIN") {
            self.budget.safety_margin = parse_env("PRECHAT_BUDGET_SAFETY_MARGIN", &value)?;
        }

        if let Some(value) = read_env("PRECHAT_THROTTLE_ENABLED") {
            self.throttle.enabled = parse_env("PRECHAT_THROTTLE_ENABLED", &value)?;
        }
        if let Some(value) = read_env("PRECHAT_THROTTLE_MAX_RESPONSES_PER_DAY") {
            self.throttle.max_responses_per_day =
                parse_env("PRECHAT_THROTTLE_MAX_RESPONSES_PER_DAY", &value)?;
        }

        if let Some(value) = read_env("PRECHAT_MESSAGES_COMPANY_PHONE") {
            self.messages.company_phone = value;
        }

        if let Some(value) = read_env("PRECHAT_CLASSIFICATION_USE_MODEL") {
            self.classification.use_model = parse_env("PRECHAT_CLASSIFICATION_USE_MODEL", &value)?;
        }

        let log_level =
            read_env("PRECHAT_LOGGING_LEVEL").or_else(|| read_env("PRECHAT_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("PRECHAT_LOGGING_FORMAT").or_else(|| read_env("PRECHAT_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(safety_margin) = overrides.budget_safety_margin {
            self.budget.safety_margin = safety_margin;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_llm(&self.llm)?;
        validate_server(&self.server)?;
        validate_logging(&self.logging)?;
        validate_calendar(&self.calendar)?;
        validate_budget(&self.budget)?;
        validate_cache(&self.cache)?;
        validate_coalescing(&self.coalescing)?;
        validate_throttle(&self.throttle)?;
        validate_messages(&self.messages)?;
        validate_classification(&self.classification)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("prechat.toml"), PathBuf::from("config/prechat.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    if !(0.0..=2.0).contains(&llm.temperature) {
        return Err(ConfigError::Validation(
            "llm.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }

    match llm.provider {
        LlmProvider::Groq | LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for groq/openai providers".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {}
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn validate_calendar(calendar: &CalendarConfig) -> Result<(), ConfigError> {
    if calendar.utc_offset_minutes.abs() >= 24 * 60 {
        return Err(ConfigError::Validation(
            "calendar.utc_offset_minutes must be strictly between -1440 and 1440".to_string(),
        ));
    }
    Ok(())
}

fn validate_budget(budget: &BudgetConfig) -> Result<(), ConfigError> {
    if !(budget.safety_margin > 0.0 && budget.safety_margin <= 1.0) {
        return Err(ConfigError::Validation(
            "budget.safety_margin must be in range (0.0, 1.0]".to_string(),
        ));
    }

    let limits = [
        ("budget.requests_per_minute", budget.requests_per_minute),
        ("budget.requests_per_day", budget.requests_per_day),
        ("budget.tokens_per_minute", budget.tokens_per_minute),
        ("budget.tokens_per_day", budget.tokens_per_day),
    ];
    if let Some((name, _)) = limits.iter().find(|(_, limit)| *limit == 0) {
        return Err(ConfigError::Validation(format!("{name} must be greater than zero")));
    }

    if budget.requests_per_minute > budget.requests_per_day
        || budget.tokens_per_minute > budget.tokens_per_day
    {
        return Err(ConfigError::Validation(
            "per-minute budget limits must not exceed per-day limits".to_string(),
        ));
    }

    Ok(())
}

fn validate_cache(cache: &CacheConfig) -> Result<(), ConfigError> {
    if cache.max_entries == 0 {
        return Err(ConfigError::Validation(
            "cache.max_entries must be greater than zero".to_string(),
        ));
    }
    if cache.ttl_secs == 0 {
        return Err(ConfigError::Validation("cache.ttl_secs must be greater than zero".to_string()));
    }
    if cache.key_prefix_chars == 0 {
        return Err(ConfigError::Validation(
            "cache.key_prefix_chars must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_coalescing(coalescing: &CoalescingConfig) -> Result<(), ConfigError> {
    if coalescing.max_batch == 0 {
        return Err(ConfigError::Validation(
            "coalescing.max_batch must be greater than zero".to_string(),
        ));
    }
    if coalescing.window_secs == 0 {
        return Err(ConfigError::Validation(
            "coalescing.window_secs must be greater than zero".to_string(),
        ));
    }
    if coalescing.flush_interval_secs == 0 {
        return Err(ConfigError::Validation(
            "coalescing.flush_interval_secs must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_throttle(throttle: &ThrottleConfig) -> Result<(), ConfigError> {
    if throttle.max_responses_per_day == 0 {
        return Err(ConfigError::Validation(
            "throttle.max_responses_per_day must be greater than zero".to_string(),
        ));
    }
    if throttle.block_duration_secs == 0 || throttle.block_duration_secs > MAX_BLOCK_DURATION_SECS {
        return Err(ConfigError::Validation(format!(
            "throttle.block_duration_secs must be in range 1..={MAX_BLOCK_DURATION_SECS}"
        )));
    }
    if throttle.retention_days == 0 {
        return Err(ConfigError::Validation(
            "throttle.retention_days must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_classification(classification: &ClassificationConfig) -> Result<(), ConfigError> {
    if !(0.0..=2.0).contains(&classification.temperature) {
        return Err(ConfigError::Validation(
            "classification.temperature must be in range 0.0..=2.0".to_string(),
        ));
    }
    if classification.max_tokens == 0 {
        return Err(ConfigError::Validation(
            "classification.max_tokens must be greater than zero".to_string(),
        ));
    }
    if classification.max_prompt_chars == 0 {
        return Err(ConfigError::Validation(
            "classification.max_prompt_chars must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_messages(messages: &MessagesConfig) -> Result<(), ConfigError> {
    if messages.maintenance.iter().all(|message| message.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "messages.maintenance must contain at least one non-empty message".to_string(),
        ));
    }
    Ok(())
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    llm: Option<LlmPatch>,
    server: Option<ServerPatch>,
    logging: Option<LoggingPatch>,
    calendar: Option<CalendarPatch>,
    budget: Option<BudgetPatch>,
    cache: Option<CachePatch>,
    coalescing: Option<CoalescingPatch>,
    throttle: Option<ThrottlePatch>,
    messages: Option<MessagesPatch>,
    maintenance: Option<MaintenancePatch>,
    classification: Option<ClassificationPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[derive(Debug, Default, Deserialize)]
struct CalendarPatch {
    utc_offset_minutes: Option<i32>,
}

#[derive(Debug, Default, Deserialize)]
struct BudgetPatch {
    requests_per_minute: Option<u64>,
    requests_per_day: Option<u64>,
    tokens_per_minute: Option<u64>,
    tokens_per_day: Option<u64>,
    safety_margin: Option<f64>,
    response_token_allowance: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct CachePatch {
    max_entries: Option<usize>,
    ttl_secs: Option<u64>,
    key_prefix_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct CoalescingPatch {
    enabled: Option<bool>,
    window_secs: Option<u64>,
    max_batch: Option<usize>,
    delimiter: Option<String>,
    flush_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ThrottlePatch {
    enabled: Option<bool>,
    max_responses_per_day: Option<u32>,
    shopping_bonus_enabled: Option<bool>,
    shopping_bonus: Option<u32>,
    block_duration_secs: Option<u64>,
    retention_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesPatch {
    company_phone: Option<String>,
    limit_reached: Option<String>,
    blocked: Option<String>,
    maintenance: Option<Vec<String>>,
    received: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MaintenancePatch {
    interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ClassificationPatch {
    use_model: Option<bool>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    max_prompt_chars: Option<usize>,
}
