//! The captioning boundary: one uniform call over any vision provider.
//!
//! The runner only knows [`CaptionClient::describe`]: image bytes plus the
//! context around the image in, `Some(description)`, `None` (a deliberate
//! skip) or a [`ProviderError`] out. A skip is never an error and is never
//! retried.
//!
//! Two clients ship with the crate:
//!
//! * [`GeminiCaptionClient`]: talks to the Gemini `generateContent` endpoint
//!   directly over reqwest, with the connection-pool size taken from
//!   [`CaptionConfig::pool_size`] at construction time.
//! * [`LlmCaptionClient`]: wraps any `edgequake_llm::LLMProvider`
//!   (OpenAI, Anthropic, Mistral, Ollama, …).
//!
//! Both are natively non-blocking. A client without a non-blocking form
//! reports `supports_non_blocking() == false` and implements
//! [`CaptionClient::describe_blocking`]; the strategy selector then never
//! puts it on an event loop.

use crate::config::CaptionConfig;
use crate::error::{CaptionError, ProviderError, ProviderErrorKind};
use crate::pipeline::encode::encode_bytes;
use crate::prompts::{context_user_prompt, custom_prompt_with_context, parse_reply, DEFAULT_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default Gemini model, used when none is configured.
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.5-flash";

/// Default model for edgequake-llm providers.
pub const DEFAULT_LLM_MODEL: &str = "gpt-4.1-nano";

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const AUTO_PROVIDER: &str = "auto";

/// One captioning call.
#[derive(Debug, Clone, Copy)]
pub struct CaptionRequest<'a> {
    pub image: &'a [u8],
    /// Filename of the image, for logs.
    pub filename: &'a str,
    pub context_before: Option<&'a str>,
    pub context_after: Option<&'a str>,
    pub prompt_override: Option<&'a str>,
}

/// Provider family, detected from the client rather than configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderFamily {
    Gemini,
    OpenAi,
    Anthropic,
    Other(String),
}

impl ProviderFamily {
    /// Map a provider name (as understood by `ProviderFactory`) to its family.
    pub fn from_provider_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "gemini" | "google" | "vertexai" => ProviderFamily::Gemini,
            "openai" | "azure" | "openai-compatible" | "openrouter" | "lmstudio" => {
                ProviderFamily::OpenAi
            }
            "anthropic" | "claude" => ProviderFamily::Anthropic,
            other => ProviderFamily::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ProviderFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderFamily::Gemini => f.write_str("gemini"),
            ProviderFamily::OpenAi => f.write_str("openai"),
            ProviderFamily::Anthropic => f.write_str("anthropic"),
            ProviderFamily::Other(name) => f.write_str(name),
        }
    }
}

/// What a worker process needs to rebuild a client on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    pub provider: String,
    pub model: String,
    pub api_key: Option<String>,
}

/// A vision provider able to describe one image.
#[async_trait]
pub trait CaptionClient: Send + Sync {
    /// Provider family, reported in diagnostics.
    fn family(&self) -> ProviderFamily;

    /// Whether [`describe`](Self::describe) is a genuine non-blocking call.
    fn supports_non_blocking(&self) -> bool {
        true
    }

    /// Describe an image. `Ok(None)` means the provider chose to skip it.
    async fn describe(&self, request: &CaptionRequest<'_>) -> Result<Option<String>, ProviderError>;

    /// Blocking form, for clients that report `supports_non_blocking() == false`.
    fn describe_blocking(&self, request: &CaptionRequest<'_>) -> Result<Option<String>, ProviderError> {
        let _ = request;
        Err(ProviderError::setup("client has no blocking call form"))
    }

    /// How to rebuild this client in a worker process, if it can be.
    fn descriptor(&self) -> Option<ClientDescriptor> {
        None
    }
}

/// System and user prompt for a request.
fn build_prompt(request: &CaptionRequest<'_>, window: usize) -> (Option<&'static str>, String) {
    match request.prompt_override.filter(|p| !p.trim().is_empty()) {
        Some(custom) => (
            None,
            custom_prompt_with_context(custom, request.context_before, request.context_after, window),
        ),
        None => (
            Some(DEFAULT_SYSTEM_PROMPT),
            context_user_prompt(request.context_before, request.context_after, window),
        ),
    }
}

// ── Gemini over reqwest ──────────────────────────────────────────────────

/// Direct client for the Gemini `generateContent` endpoint.
pub struct GeminiCaptionClient {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    temperature: f32,
    max_output_tokens: usize,
    context_window: usize,
}

impl GeminiCaptionClient {
    /// Build a client whose connection pool and timeout come from `config`.
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        config: &CaptionConfig,
    ) -> Result<Self, CaptionError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(config.pool_size())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| CaptionError::ProviderNotConfigured {
                provider: "gemini".into(),
                hint: format!("HTTP client construction failed: {e}"),
            })?;

        Ok(Self {
            http,
            api_key: api_key.into(),
            model: model.into(),
            base_url: GEMINI_BASE_URL.to_string(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            context_window: config.context_window,
        })
    }

    /// Point the client at another endpoint (proxies, test servers).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    fn request_body(&self, request: &CaptionRequest<'_>) -> serde_json::Value {
        let (system, user) = build_prompt(request, self.context_window);
        let prompt = match system {
            Some(system) => format!("{system}\n\n{user}"),
            None => user,
        };
        let image = encode_bytes(request.image);

        serde_json::json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": image.mime_type, "data": image.data } }
                ]
            }],
            "generationConfig": {
                "temperature": self.temperature,
                "topP": 0.95,
                "topK": 40,
                "maxOutputTokens": self.max_output_tokens
            }
        })
    }
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

impl GenerateResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

fn reqwest_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() || e.is_connect() {
        ProviderError::new(ProviderErrorKind::Transient, e.to_string())
    } else {
        ProviderError::classify(e.to_string())
    }
}

#[async_trait]
impl CaptionClient for GeminiCaptionClient {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Gemini
    }

    async fn describe(&self, request: &CaptionRequest<'_>) -> Result<Option<String>, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        );
        debug!("Calling Gemini (model: {}) for {}", self.model, request.filename);

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::classify(format!("HTTP {status}: {body}")));
        }

        let parsed: GenerateResponse = response.json().await.map_err(reqwest_error)?;
        let text = parsed.text();
        debug!("Gemini replied for {} ({} chars)", request.filename, text.len());
        Ok(parse_reply(&text))
    }

    fn descriptor(&self) -> Option<ClientDescriptor> {
        Some(ClientDescriptor {
            provider: "gemini".into(),
            model: self.model.clone(),
            api_key: Some(self.api_key.clone()),
        })
    }
}

// ── Any edgequake-llm provider ───────────────────────────────────────────

/// Caption client over an `edgequake_llm::LLMProvider`.
pub struct LlmCaptionClient {
    provider: Arc<dyn LLMProvider>,
    provider_name: String,
    model: String,
    temperature: f32,
    max_output_tokens: usize,
    context_window: usize,
    timeout: Duration,
}

impl LlmCaptionClient {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        provider_name: impl Into<String>,
        model: impl Into<String>,
        config: &CaptionConfig,
    ) -> Self {
        Self {
            provider,
            provider_name: provider_name.into(),
            model: model.into(),
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            context_window: config.context_window,
            timeout: Duration::from_secs(config.request_timeout_secs),
        }
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_output_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl CaptionClient for LlmCaptionClient {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::from_provider_name(&self.provider_name)
    }

    async fn describe(&self, request: &CaptionRequest<'_>) -> Result<Option<String>, ProviderError> {
        let (system, user) = build_prompt(request, self.context_window);
        let image = encode_bytes(request.image).into_image_data();

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system {
            messages.push(ChatMessage::system(system));
        }
        messages.push(ChatMessage::user_with_images(user.as_str(), vec![image]));

        let options = self.options();
        let call = self.provider.chat(&messages, Some(&options));
        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(response)) => {
                debug!(
                    "{}: {} input tokens, {} output tokens",
                    request.filename, response.prompt_tokens, response.completion_tokens
                );
                Ok(parse_reply(&response.content))
            }
            Ok(Err(e)) => Err(ProviderError::classify(e.to_string())),
            Err(_) => Err(ProviderError::new(
                ProviderErrorKind::Transient,
                format!("call timed out after {}s", self.timeout.as_secs()),
            )),
        }
    }

    fn descriptor(&self) -> Option<ClientDescriptor> {
        // Auto-detected providers have no name a worker could rebuild from.
        if self.provider_name == AUTO_PROVIDER {
            return None;
        }
        Some(ClientDescriptor {
            provider: self.provider_name.clone(),
            model: self.model.clone(),
            api_key: None,
        })
    }
}

// ── Resolution ───────────────────────────────────────────────────────────

/// Env var holding the API key for a provider name.
pub fn api_key_env_var(provider: &str) -> Option<&'static str> {
    match provider.to_ascii_lowercase().as_str() {
        "gemini" | "google" => Some("GEMINI_API_KEY"),
        "openai" => Some("OPENAI_API_KEY"),
        "anthropic" | "claude" => Some("ANTHROPIC_API_KEY"),
        "mistral" => Some("MISTRAL_API_KEY"),
        "azure" => Some("AZURE_OPENAI_API_KEY"),
        "openrouter" => Some("OPENROUTER_API_KEY"),
        _ => None,
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Build a client for a named provider.
///
/// Gemini goes through [`GeminiCaptionClient`]; everything else through
/// `ProviderFactory`, which reads its API key from the environment.
pub fn client_for_provider(
    provider: &str,
    model: Option<&str>,
    api_key: Option<&str>,
    config: &CaptionConfig,
) -> Result<Arc<dyn CaptionClient>, CaptionError> {
    if ProviderFamily::from_provider_name(provider) == ProviderFamily::Gemini {
        let key = api_key
            .map(str::to_string)
            .or_else(|| non_empty_env("GEMINI_API_KEY"))
            .or_else(|| non_empty_env("GOOGLE_API_KEY"))
            .ok_or_else(|| CaptionError::ProviderNotConfigured {
                provider: provider.to_string(),
                hint: "Set GEMINI_API_KEY or pass --api-key.".into(),
            })?;
        let model = model.unwrap_or(DEFAULT_GEMINI_MODEL);
        return Ok(Arc::new(GeminiCaptionClient::new(key, model, config)?));
    }

    let model = model.unwrap_or(DEFAULT_LLM_MODEL);
    let llm = ProviderFactory::create_llm_provider(provider, model).map_err(|e| {
        CaptionError::ProviderNotConfigured {
            provider: provider.to_string(),
            hint: format!("{e}"),
        }
    })?;
    Ok(Arc::new(LlmCaptionClient::new(llm, provider, model, config)))
}

/// Resolve the caption client, from most-specific to least-specific.
///
/// 1. Pre-built client (`config.client`).
/// 2. Named provider (`config.provider_name`) + optional model.
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL`, when both are set.
/// 4. `GEMINI_API_KEY` present → Gemini.
/// 5. `ProviderFactory::from_env` auto-detection.
pub fn resolve_client(config: &CaptionConfig) -> Result<Arc<dyn CaptionClient>, CaptionError> {
    if let Some(ref client) = config.client {
        return Ok(Arc::clone(client));
    }

    if let Some(ref name) = config.provider_name {
        return client_for_provider(
            name,
            config.model.as_deref(),
            config.api_key.as_deref(),
            config,
        );
    }

    if let (Some(prov), Some(model)) = (
        non_empty_env("EDGEQUAKE_LLM_PROVIDER"),
        non_empty_env("EDGEQUAKE_MODEL"),
    ) {
        return client_for_provider(&prov, Some(&model), config.api_key.as_deref(), config);
    }

    if config.api_key.is_some() || non_empty_env("GEMINI_API_KEY").is_some() {
        return client_for_provider(
            "gemini",
            config.model.as_deref(),
            config.api_key.as_deref(),
            config,
        );
    }

    let (llm, _embedding) =
        ProviderFactory::from_env().map_err(|e| CaptionError::ProviderNotConfigured {
            provider: AUTO_PROVIDER.to_string(),
            hint: format!(
                "No caption provider could be auto-detected from environment.\n\
                Set GEMINI_API_KEY, OPENAI_API_KEY, or ANTHROPIC_API_KEY.\n\
                Error: {}",
                e
            ),
        })?;
    let model = config.model.as_deref().unwrap_or(DEFAULT_LLM_MODEL);
    Ok(Arc::new(LlmCaptionClient::new(llm, AUTO_PROVIDER, model, config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(prompt: Option<&'a str>) -> CaptionRequest<'a> {
        CaptionRequest {
            image: b"\x89PNG\r\n\x1a\n",
            filename: "a.png",
            context_before: Some("Revenue grew in Q3."),
            context_after: None,
            prompt_override: prompt,
        }
    }

    #[test]
    fn default_prompt_carries_context_and_system() {
        let (system, user) = build_prompt(&request(None), 800);
        assert!(system.unwrap().contains("SKIP"));
        assert!(user.contains("DOCUMENT CONTEXT BEFORE:\nRevenue grew in Q3."));
    }

    #[test]
    fn blank_override_uses_default_prompt() {
        let (system, _) = build_prompt(&request(Some("   ")), 800);
        assert!(system.is_some());
    }

    #[test]
    fn override_prompt_gets_context_appended() {
        let (system, user) = build_prompt(&request(Some("Describe the chart.")), 800);
        assert!(system.is_none());
        assert!(user.starts_with("Describe the chart."));
        assert!(user.contains("Context before: Revenue grew in Q3."));
    }

    #[test]
    fn family_detection() {
        assert_eq!(ProviderFamily::from_provider_name("Gemini"), ProviderFamily::Gemini);
        assert_eq!(ProviderFamily::from_provider_name("azure"), ProviderFamily::OpenAi);
        assert_eq!(
            ProviderFamily::from_provider_name("ollama"),
            ProviderFamily::Other("ollama".into())
        );
    }

    #[test]
    fn gemini_body_shape() {
        let client =
            GeminiCaptionClient::new("key", "gemini-2.5-flash", &CaptionConfig::default()).unwrap();
        let body = client.request_body(&request(None));
        let parts = &body["contents"][0]["parts"];
        assert!(parts[0]["text"].as_str().unwrap().contains("DOCUMENT CONTEXT BEFORE"));
        assert_eq!(parts[1]["inline_data"]["mime_type"], "image/png");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 8192);
    }

    #[test]
    fn gemini_response_text_joins_parts() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Bar Chart: "},{"text":"sales"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.text(), "Bar Chart: sales");

        let blocked: GenerateResponse = serde_json::from_str(r#"{"promptFeedback":{}}"#).unwrap();
        assert_eq!(blocked.text(), "");
    }

    #[test]
    fn gemini_descriptor_carries_credentials() {
        let client = GeminiCaptionClient::new("k", "m", &CaptionConfig::default()).unwrap();
        let d = client.descriptor().unwrap();
        assert_eq!(d.provider, "gemini");
        assert_eq!(d.api_key.as_deref(), Some("k"));
    }
}
