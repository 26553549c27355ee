use crate::config::LlmConfig;
use crate::error::{QaError, Result};
use std::time::Duration;
use tracing::debug;

/// A text-in, text-out generative model. Its output is untrusted: callers
/// validate it before acting on it.
pub trait TextOracle {
    fn complete(&self, prompt: &str) -> Result<String>;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct LlmClient {
    api_key: Option<String>,
    base_url: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    http: reqwest::blocking::Client,
}

impl LlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| QaError::Llm(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            http,
        })
    }

    /// `None` when the oracle is disabled in configuration.
    pub fn from_config(config: &LlmConfig) -> Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        Self::new(config).map(Some)
    }
}

impl TextOracle for LlmClient {
    fn complete(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": "You are a precise JSON-only responder. Always return valid JSON, no other text."},
                {"role": "user", "content": prompt}
            ],
            "temperature": self.temperature,
            "max_tokens": self.max_tokens
        });

        let mut request = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .map_err(|e| QaError::Llm(format!("LLM API call failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(QaError::Llm(format!("LLM API returned {}", response.status())));
        }

        let response_json: serde_json::Value = response
            .json()
            .map_err(|e| QaError::Llm(format!("Failed to parse LLM response: {}", e)))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| QaError::Llm("No content in LLM response".to_string()))?;

        debug!("LLM responded with {} chars", content.len());
        Ok(content.to_string())
    }
}

/// Cut the outermost `{...}` out of a model reply (models like to wrap JSON in prose or fences).
pub fn extract_json(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (end > start).then(|| &reply[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json() {
        assert_eq!(
            extract_json("```json\n{\"a\": 1}\n```"),
            Some("{\"a\": 1}")
        );
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} {"), None);
    }

    #[test]
    fn test_disabled_client_is_none() {
        let config = LlmConfig::default();
        assert!(LlmClient::from_config(&config).unwrap().is_none());
    }
}
