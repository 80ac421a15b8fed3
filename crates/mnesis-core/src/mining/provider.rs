//! LLM Providers for Conversation Analysis
//!
//! The miner consumes any provider implementing `chat(prompt) -> text`.
//! Recognized providers: OpenAI, Anthropic, Ollama, plus the built-in
//! heuristic mode. Local providers get a reachability preflight and several
//! endpoint conventions are tried in order (`/api/generate`, `/api/chat`,
//! `/v1/chat/completions`).

use serde::{Deserialize, Serialize};

use crate::config::ConversationAnalysisConfig;

/// Chat-style provider timeout.
const CHAT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);
/// Local (Ollama) provider timeout.
const LOCAL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);
/// Preflight timeout.
const PREFLIGHT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(3);

/// Provider error taxonomy. Provider failures never abort a miner run;
/// they are logged, counted, and trigger the heuristic fallback.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{0}")]
    Unconfigured(String),
    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("{provider} request failed ({status}){detail}")]
    Http {
        provider: &'static str,
        status: u16,
        detail: String,
    },
    #[error("Provider returned no parseable JSON")]
    Parse,
}

/// Supported provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
    #[default]
    Heuristic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Heuristic => "heuristic",
        }
    }

    pub fn is_llm(&self) -> bool {
        !matches!(self, ProviderKind::Heuristic)
    }
}

/// Normalize a provider id, accepting common aliases. Unknown ids map to
/// heuristic; `auto`/empty stay unresolved for config fallback.
pub fn normalize_provider(raw: &str) -> String {
    let value = raw.trim().to_lowercase();
    match value.as_str() {
        "" => "auto".to_string(),
        "oai" | "chatgpt" => "openai".to_string(),
        "claude" => "anthropic".to_string(),
        "local" | "local-ollama" => "ollama".to_string(),
        other => other.to_string(),
    }
}

// ============================================================================
// RUNTIME RESOLUTION
// ============================================================================

/// A fully resolved provider runtime.
#[derive(Debug, Clone)]
pub struct ProviderRuntime {
    pub kind: ProviderKind,
    pub model: String,
    pub api_base_url: String,
    pub api_key: String,
}

impl ProviderRuntime {
    /// Resolve a runtime from an explicit provider request plus the config
    /// section, filling provider-specific defaults from the environment.
    pub fn resolve(
        provider: &str,
        model: Option<&str>,
        api_base_url: Option<&str>,
        api_key: Option<&str>,
        config: &ConversationAnalysisConfig,
    ) -> Self {
        let mut resolved = normalize_provider(provider);
        if resolved == "auto" {
            let configured = normalize_provider(&config.provider);
            resolved = if configured == "auto" {
                "heuristic".to_string()
            } else {
                configured
            };
        }

        let kind = match resolved.as_str() {
            "openai" => ProviderKind::OpenAi,
            "anthropic" => ProviderKind::Anthropic,
            "ollama" => ProviderKind::Ollama,
            _ => ProviderKind::Heuristic,
        };

        let mut model = model
            .map(str::to_string)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| config.model.trim().to_string());
        let mut api_base_url = api_base_url
            .map(str::to_string)
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| config.api_base_url.trim().to_string());
        let mut api_key = api_key
            .map(str::to_string)
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| config.api_key.trim().to_string());

        match kind {
            ProviderKind::OpenAi => {
                if model.is_empty() {
                    model = "gpt-4o-mini".to_string();
                }
                if api_base_url.is_empty() {
                    api_base_url = std::env::var("OPENAI_BASE_URL")
                        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
                }
                if api_key.is_empty() {
                    api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
                }
            }
            ProviderKind::Anthropic => {
                if model.is_empty() {
                    model = "claude-3-5-haiku-latest".to_string();
                }
                if api_base_url.is_empty() {
                    api_base_url = std::env::var("ANTHROPIC_BASE_URL")
                        .unwrap_or_else(|_| "https://api.anthropic.com/v1".to_string());
                }
                if api_key.is_empty() {
                    api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
                }
            }
            ProviderKind::Ollama => {
                if model.is_empty() {
                    model = std::env::var("OLLAMA_MODEL")
                        .unwrap_or_else(|_| "llama3.2:3b".to_string());
                }
                if api_base_url.is_empty() {
                    api_base_url = std::env::var("OLLAMA_BASE_URL")
                        .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string());
                }
                if api_key.is_empty() {
                    api_key = std::env::var("OLLAMA_API_KEY").unwrap_or_default();
                }
            }
            ProviderKind::Heuristic => {}
        }

        Self {
            kind,
            model,
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    /// Whether the runtime is complete enough to issue LLM calls.
    pub fn can_use_llm(&self) -> bool {
        match self.kind {
            ProviderKind::OpenAi | ProviderKind::Anthropic => {
                !self.model.is_empty() && !self.api_key.is_empty()
            }
            ProviderKind::Ollama => !self.model.is_empty() && !self.api_base_url.is_empty(),
            ProviderKind::Heuristic => false,
        }
    }

    /// Human-readable reason why LLM mode is unavailable.
    pub fn unconfigured_reason(&self) -> String {
        match self.kind {
            ProviderKind::Heuristic => {
                "Conversation analysis requires an LLM provider (OpenAI, Anthropic, or Ollama)."
                    .to_string()
            }
            ProviderKind::OpenAi | ProviderKind::Anthropic => {
                let name = self.kind.as_str();
                if self.model.is_empty() && self.api_key.is_empty() {
                    format!("Configure {name} model and API key in Settings > Insights AI.")
                } else if self.model.is_empty() {
                    format!("Configure a {name} model in Settings > Insights AI.")
                } else if self.api_key.is_empty() {
                    format!("Configure a {name} API key in Settings > Insights AI.")
                } else {
                    "LLM configuration is incomplete for conversation analysis.".to_string()
                }
            }
            ProviderKind::Ollama => {
                if self.model.is_empty() {
                    "Configure an Ollama model in Settings > Insights AI.".to_string()
                } else if self.api_base_url.is_empty() {
                    "Configure the Ollama base URL in Settings > Insights AI \
                     (example: http://127.0.0.1:11434)."
                        .to_string()
                } else {
                    "LLM configuration is incomplete for conversation analysis.".to_string()
                }
            }
        }
    }

    // ========================================================================
    // PREFLIGHT
    // ========================================================================

    /// Fast reachability check to avoid long blocked runs when local
    /// endpoints are down. Remote providers skip the preflight.
    pub async fn preflight(&self) -> Result<(), ProviderError> {
        if self.kind != ProviderKind::Ollama {
            return Ok(());
        }
        if self.api_base_url.is_empty() {
            return Err(ProviderError::Unconfigured(
                "Ollama base URL is empty.".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(PREFLIGHT_TIMEOUT)
            .build()?;
        let response = client
            .get(format!("{}/api/tags", self.api_base_url))
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProviderError::Http {
                provider: "ollama",
                status: status.as_u16(),
                detail: shorten_detail(&detail),
            });
        }
        let payload: serde_json::Value = response.json().await.unwrap_or_default();
        let available = extract_ollama_model_names(&payload);
        if !self.model.is_empty() && available.is_empty() {
            return Err(ProviderError::Unconfigured(format!(
                "Ollama has no local models installed. Run 'ollama pull {}' (or any model) first.",
                self.model
            )));
        }
        if !self.model.is_empty()
            && !available.is_empty()
            && !ollama_model_available(&self.model, &available)
        {
            let mut preview: Vec<&String> = available.iter().collect();
            preview.sort();
            let preview: Vec<String> =
                preview.into_iter().take(6).map(|s| s.to_string()).collect();
            return Err(ProviderError::Unconfigured(format!(
                "Ollama model '{}' not found locally. Available: {}. \
                 Run 'ollama pull {}' or pick an installed model.",
                self.model,
                preview.join(", "),
                self.model
            )));
        }
        Ok(())
    }

    // ========================================================================
    // CHAT
    // ========================================================================

    /// Send a prompt and return the raw text response.
    pub async fn chat(&self, prompt: &str) -> Result<String, ProviderError> {
        match self.kind {
            ProviderKind::OpenAi => self.chat_openai(prompt).await,
            ProviderKind::Anthropic => self.chat_anthropic(prompt).await,
            ProviderKind::Ollama => self.chat_ollama(prompt).await,
            ProviderKind::Heuristic => Err(ProviderError::Unconfigured(
                "Heuristic mode has no chat endpoint.".to_string(),
            )),
        }
    }

    async fn chat_openai(&self, prompt: &str) -> Result<String, ProviderError> {
        let client = reqwest::Client::builder().timeout(CHAT_TIMEOUT).build()?;
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0.2,
            "max_tokens": 700,
            "messages": [
                {"role": "system", "content": "Return valid JSON only."},
                {"role": "user", "content": prompt},
            ],
        });
        let response = client
            .post(format!("{}/chat/completions", self.api_base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ProviderError::Http {
                provider: "openai",
                status: status.as_u16(),
                detail: shorten_detail(&response.text().await.unwrap_or_default()),
            });
        }
        let payload: serde_json::Value = response.json().await?;
        Ok(extract_openai_compatible_text(&payload))
    }

    async fn chat_anthropic(&self, prompt: &str) -> Result<String, ProviderError> {
        let client = reqwest::Client::builder().timeout(CHAT_TIMEOUT).build()?;
        let body = serde_json::json!({
            "model": self.model,
            "max_tokens": 700,
            "temperature": 0.2,
            "messages": [{"role": "user", "content": prompt}],
        });
        let response = client
            .post(format!("{}/messages", self.api_base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ProviderError::Http {
                provider: "anthropic",
                status: status.as_u16(),
                detail: shorten_detail(&response.text().await.unwrap_or_default()),
            });
        }
        let payload: serde_json::Value = response.json().await?;
        let mut parts = Vec::new();
        if let Some(content) = payload.get("content").and_then(|c| c.as_array()) {
            for block in content {
                if block.get("type").and_then(|t| t.as_str()) == Some("text") {
                    if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                        parts.push(text.to_string());
                    }
                }
            }
        }
        Ok(parts.join("\n"))
    }

    /// Ollama with endpoint-convention fallbacks: `/api/generate`, then
    /// `/api/chat`, then OpenAI-compatible `/v1/chat/completions`.
    async fn chat_ollama(&self, prompt: &str) -> Result<String, ProviderError> {
        let client = reqwest::Client::builder().timeout(LOCAL_TIMEOUT).build()?;
        let base = &self.api_base_url;

        let generate_body = serde_json::json!({
            "model": self.model,
            "prompt": format!("Return valid JSON only.\n\n{prompt}"),
            "stream": false,
            "options": {"temperature": 0.2},
        });
        let mut request = client.post(format!("{base}/api/generate")).json(&generate_body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await?;

        if response.status().as_u16() == 404 {
            let chat_body = serde_json::json!({
                "model": self.model,
                "messages": [
                    {"role": "system", "content": "Return valid JSON only."},
                    {"role": "user", "content": prompt},
                ],
                "stream": false,
                "options": {"temperature": 0.2},
            });
            let chat = client
                .post(format!("{base}/api/chat"))
                .json(&chat_body)
                .send()
                .await?;
            if chat.status().as_u16() < 400 {
                let payload: serde_json::Value = chat.json().await?;
                let text = payload
                    .get("message")
                    .and_then(|m| m.get("content"))
                    .and_then(|c| c.as_str())
                    .unwrap_or("");
                if !text.is_empty() {
                    return Ok(text.to_string());
                }
            }

            let compat_body = serde_json::json!({
                "model": self.model,
                "temperature": 0.2,
                "max_tokens": 700,
                "messages": [
                    {"role": "system", "content": "Return valid JSON only."},
                    {"role": "user", "content": prompt},
                ],
            });
            let compat = client
                .post(format!("{base}/v1/chat/completions"))
                .json(&compat_body)
                .send()
                .await?;
            if compat.status().as_u16() < 400 {
                let payload: serde_json::Value = compat.json().await?;
                let text = extract_openai_compatible_text(&payload);
                if !text.is_empty() {
                    return Ok(text);
                }
            }
            return Err(ProviderError::Http {
                provider: "ollama",
                status: 404,
                detail: String::new(),
            });
        }

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(ProviderError::Http {
                provider: "ollama",
                status: status.as_u16(),
                detail: shorten_detail(&response.text().await.unwrap_or_default()),
            });
        }
        let payload: serde_json::Value = response.json().await?;
        Ok(payload
            .get("response")
            .and_then(|r| r.as_str())
            .unwrap_or("")
            .to_string())
    }
}

// ============================================================================
// RESPONSE PARSING
// ============================================================================

fn shorten_detail(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let cut: String = trimmed.chars().take(220).collect();
    format!(": {cut}")
}

pub(crate) fn extract_openai_compatible_text(payload: &serde_json::Value) -> String {
    payload
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .unwrap_or("")
        .to_string()
}

fn extract_ollama_model_names(payload: &serde_json::Value) -> Vec<String> {
    payload
        .get("models")
        .and_then(|m| m.as_array())
        .map(|models| {
            models
                .iter()
                .filter_map(|item| item.get("name").and_then(|n| n.as_str()))
                .map(|n| n.trim().to_lowercase())
                .filter(|n| !n.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Model availability: exact match or matching base tag
/// (`llama3.2` matches `llama3.2:3b`).
fn ollama_model_available(requested: &str, available: &[String]) -> bool {
    let requested = requested.trim().to_lowercase();
    if requested.is_empty() {
        return false;
    }
    if available.iter().any(|m| *m == requested) {
        return true;
    }
    let requested_base = requested.split(':').next().unwrap_or("");
    if requested_base.is_empty() {
        return false;
    }
    available
        .iter()
        .any(|m| m.split(':').next().unwrap_or("") == requested_base)
}

/// Pull the first JSON object out of provider text (models wrap JSON in
/// prose more often than not).
pub fn extract_json_obj(text: &str) -> Option<serde_json::Value> {
    let payload = text.trim();
    if payload.is_empty() {
        return None;
    }
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) {
        if value.is_object() {
            return Some(value);
        }
    }

    let start = payload.find('{')?;
    let end = payload.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<serde_json::Value>(&payload[start..=end])
        .ok()
        .filter(|v| v.is_object())
}

/// The strict-JSON extraction prompt for one conversation context.
pub fn build_extraction_prompt(
    conversation_payload: &serde_json::Value,
    max_candidates: usize,
    min_confidence: f64,
) -> String {
    format!(
        "You extract durable user memories from conversation transcripts.\n\
         Return STRICT JSON only with this schema:\n\
         {{\"memories\":[{{\"content\":\"...\",\"category\":\"identity|preferences|skills|relationships|projects|history|working\",\
         \"level\":\"semantic|episodic|working\",\"confidence\":0.0,\"source_message_id\":\"...\"}}]}}\n\
         Rules:\n\
         - Return at most {max_candidates} memories.\n\
         - Keep only memories with confidence >= {min_confidence:.2}.\n\
         - Keep durable, user-centric facts and preferences. Avoid transient tasks and one-off requests.\n\
         - Write in third-person declarative style (never first-person).\n\
         - Source grounding: source_message_id must reference a USER message from this transcript.\n\
         - Each memory must be 20-480 chars.\n\
         - Keep key context when available (time window, concrete reason, constraints), not generic paraphrases.\n\
         - Reject vague capability claims (e.g., 'the user can ... if needed') unless concretely evidenced and durable.\n\
         - Never truncate with ellipsis ('...'). If needed, shorten while keeping a complete sentence.\n\
         - Merge tightly related facts from the same topic into one memory instead of splitting excessively.\n\
         - Do not duplicate semantically equivalent memories.\n\
         Conversation data: {conversation_payload}"
    )
}

// ============================================================================
// TESTS
// ============================================================================
