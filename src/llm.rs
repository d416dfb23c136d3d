use crate::config::{LlmConfig, LlmProvider};
use crate::error::{NlqError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use std::time::Duration;
use tracing::debug;

lazy_static! {
    static ref FENCED_JSON: Regex =
        Regex::new(r"```(?:json)?\s*(\{[\s\S]*?\})\s*```").expect("fenced json pattern compiles");
}

/// Chat-completion client for the reasoning collaborator.
/// Speaks the OpenAI-compatible protocol (OpenRouter, OpenAI) and
/// Gemini's `generateContent`.
pub struct LlmClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| NlqError::Llm(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Send a system prompt plus the user's question, return the raw text answer
    pub async fn complete(&self, system_prompt: &str, user_message: &str) -> Result<String> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| NlqError::Llm("No API key configured".to_string()))?;

        match self.config.provider {
            LlmProvider::OpenRouter => self.call_chat_completions(api_key, system_prompt, user_message).await,
            LlmProvider::Gemini => self.call_gemini(api_key, system_prompt, user_message).await,
            LlmProvider::Rules => Err(NlqError::Llm(
                "Rule-based provider has no remote model".to_string(),
            )),
        }
    }

    async fn call_chat_completions(&self, api_key: &str, system_prompt: &str, user_message: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_message}
            ],
            "temperature": 0.1
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .header("HTTP-Referer", &self.config.site_url)
            .header("X-Title", "DocType Query Assistant")
            .json(&body)
            .send()
            .await
            .map_err(|e| NlqError::Llm(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(NlqError::Llm(format!("LLM API error: {} - {}", status, text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NlqError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| NlqError::Llm("No content in LLM response".to_string()))?;

        debug!("LLM answered with {} chars", content.len());
        Ok(content.to_string())
    }

    async fn call_gemini(&self, api_key: &str, system_prompt: &str, user_message: &str) -> Result<String> {
        let body = serde_json::json!({
            "systemInstruction": {"parts": [{"text": system_prompt}]},
            "contents": [{"role": "user", "parts": [{"text": user_message}]}],
            "generationConfig": {"temperature": 0.1}
        });

        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );
        let response = self
            .http
            .post(url)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|e| NlqError::Llm(format!("Gemini API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(NlqError::Llm(format!("Gemini API error: {} - {}", status, text)));
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| NlqError::Llm(format!("Failed to parse Gemini response: {}", e)))?;

        let content = response_json["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| NlqError::Llm("No content in Gemini response".to_string()))?;

        Ok(content.to_string())
    }
}

/// Pull the JSON object out of a model answer. Accepts a fenced
/// ```json block, otherwise the first balanced `{...}` in the text.
pub fn extract_json(response: &str) -> Option<String> {
    if let Some(caps) = FENCED_JSON.captures(response) {
        if let Some(m) = caps.get(1) {
            return Some(m.as_str().to_string());
        }
    }

    let start = response.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in response[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(response[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }

    None
}
