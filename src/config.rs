//! Pipeline Configuration
//!
//! Tunable thresholds and limits. Defaults mirror the values the record
//! layer was tuned with; every value can be overridden from `NLQ_*`
//! environment variables or a `.env` file.

use crate::error::{NlqError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Entity detection thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Confidence for a whole-word keyword match
    pub exact_confidence: f64,
    /// Confidence for a keyword found only inside a longer token
    pub substring_confidence: f64,
    /// Entities below this are dropped unless nothing clears it
    pub min_confidence: f64,
    /// Hard cap on candidates handed downstream
    pub max_entities: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            exact_confidence: 0.9,
            substring_confidence: 0.6,
            min_confidence: 0.7,
            max_entities: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectorConfig {
    /// Jaro-Winkler similarity needed to repair a misspelled table identifier
    pub fuzzy_threshold: f64,
}

impl Default for CorrectorConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.9,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Total execution attempts, including the first
    pub max_attempts: u8,
    pub retry_backoff_ms: u64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl GuardConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// When false, generated queries are downgraded to a plain listing
    pub allow_dynamic_queries: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            allow_dynamic_queries: true,
        }
    }
}

/// Which reasoning backend answers planning requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenRouter,
    Gemini,
    Rules,
}

impl FromStr for LlmProvider {
    type Err = NlqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openrouter" | "openai" => Ok(LlmProvider::OpenRouter),
            "gemini" => Ok(LlmProvider::Gemini),
            "rules" | "rule-based" | "rule_based" => Ok(LlmProvider::Rules),
            other => Err(NlqError::Config(format!("Unknown provider '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub request_timeout_secs: u64,
    /// Sent as `HTTP-Referer` to OpenRouter
    pub site_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::Rules,
            api_key: None,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "google/gemini-2.0-flash-exp:free".to_string(),
            request_timeout_secs: 30,
            site_url: "http://localhost".to_string(),
        }
    }
}

impl LlmConfig {
    pub fn gemini(api_key: String) -> Self {
        Self {
            provider: LlmProvider::Gemini,
            api_key: Some(api_key),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-1.5-flash".to_string(),
            ..Self::default()
        }
    }

    pub fn openrouter(api_key: String) -> Self {
        Self {
            provider: LlmProvider::OpenRouter,
            api_key: Some(api_key),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub detector: DetectorConfig,
    pub corrector: CorrectorConfig,
    pub guard: GuardConfig,
    pub router: RouterConfig,
    pub llm: LlmConfig,
    /// Whole-invocation deadline; `None` disables it
    pub timeout_ms: Option<u64>,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self {
            timeout_ms: Some(60_000),
            ..Self::default()
        }
    }

    /// Defaults overridden by `.env` and `NLQ_*` variables
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let mut config = Self::new();

        if let Some(v) = env_parse::<f64>("NLQ_EXACT_CONFIDENCE")? {
            config.detector.exact_confidence = v;
        }
        if let Some(v) = env_parse::<f64>("NLQ_SUBSTRING_CONFIDENCE")? {
            config.detector.substring_confidence = v;
        }
        if let Some(v) = env_parse::<f64>("NLQ_MIN_CONFIDENCE")? {
            config.detector.min_confidence = v;
        }
        if let Some(v) = env_parse::<usize>("NLQ_MAX_ENTITIES")? {
            config.detector.max_entities = v;
        }
        if let Some(v) = env_parse::<f64>("NLQ_FUZZY_THRESHOLD")? {
            config.corrector.fuzzy_threshold = v;
        }
        if let Some(v) = env_parse::<u8>("NLQ_MAX_ATTEMPTS")? {
            config.guard.max_attempts = v;
        }
        if let Some(v) = env_parse::<u64>("NLQ_RETRY_BACKOFF_MS")? {
            config.guard.retry_backoff_ms = v;
        }
        if let Some(v) = env_parse::<bool>("NLQ_ALLOW_DYNAMIC_QUERIES")? {
            config.router.allow_dynamic_queries = v;
        }
        if let Some(v) = env_parse::<u64>("NLQ_TIMEOUT_MS")? {
            config.timeout_ms = if v == 0 { None } else { Some(v) };
        }

        // Provider follows whichever key is present, OpenRouter first
        if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
            config.llm = LlmConfig::openrouter(key);
        } else if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            config.llm = LlmConfig::gemini(key);
        } else if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.llm = LlmConfig {
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o-mini".to_string(),
                ..LlmConfig::openrouter(key)
            };
        }
        if let Ok(provider) = std::env::var("NLQ_PROVIDER") {
            config.llm.provider = provider.parse()?;
        }
        if let Ok(model) = std::env::var("NLQ_MODEL") {
            config.llm.model = model;
        }
        if let Ok(url) = std::env::var("NLQ_LLM_BASE_URL") {
            config.llm.base_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let d = &self.detector;
        for (name, value) in [
            ("exact_confidence", d.exact_confidence),
            ("substring_confidence", d.substring_confidence),
            ("min_confidence", d.min_confidence),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(NlqError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if d.substring_confidence >= d.exact_confidence {
            return Err(NlqError::Config(format!(
                "substring_confidence ({}) must be below exact_confidence ({})",
                d.substring_confidence, d.exact_confidence
            )));
        }
        if !(1..=3).contains(&d.max_entities) {
            return Err(NlqError::Config(format!(
                "max_entities must be between 1 and 3, got {}",
                d.max_entities
            )));
        }
        if !(0.0..=1.0).contains(&self.corrector.fuzzy_threshold) {
            return Err(NlqError::Config(format!(
                "fuzzy_threshold must be within [0, 1], got {}",
                self.corrector.fuzzy_threshold
            )));
        }
        if !(1..=3).contains(&self.guard.max_attempts) {
            return Err(NlqError::Config(format!(
                "max_attempts must be between 1 and 3, got {}",
                self.guard.max_attempts
            )));
        }
        if self.llm.provider != LlmProvider::Rules && self.llm.api_key.is_none() {
            return Err(NlqError::Config(format!(
                "Provider {:?} requires an API key",
                self.llm.provider
            )));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| NlqError::Config(format!("{} has an invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}
