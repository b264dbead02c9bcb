//! Configuration types for document conversion and image captioning.
//!
//! All behaviour is controlled through [`CaptionConfig`], built via its
//! [`CaptionConfigBuilder`]. One struct carries every knob so a config can be
//! shared across worker threads and logged as a whole.
//!
//! The three fields that shape a captioning run (`concurrency_limit`,
//! `prompt_override`, `context_enabled`) are read-only for the duration of a
//! run; [`CaptionConfig::run_config`] exposes exactly that view.

use crate::client::CaptionClient;
use crate::error::CaptionError;
use crate::progress::ProgressCallback;
use crate::runtime::Strategy;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Characters of document text kept on each side of an image reference.
pub const DEFAULT_CONTEXT_WINDOW: usize = 800;

/// Default number of captioning calls in flight.
pub const DEFAULT_CONCURRENCY: usize = 20;

/// Consecutive rate-limit-like failures before the advisory fires.
pub const DEFAULT_RATE_LIMIT_THRESHOLD: usize = 5;

/// Configuration for converting a document and captioning its images.
///
/// # Example
/// ```rust
/// use captionmd::CaptionConfig;
///
/// let config = CaptionConfig::builder()
///     .concurrency_limit(8)
///     .model("gemini-2.5-flash")
///     .build()
///     .unwrap();
/// assert_eq!(config.concurrency_limit, 8);
/// ```
#[derive(Clone)]
pub struct CaptionConfig {
    /// Maximum captioning calls in flight at once, whatever the strategy. Default: 20.
    ///
    /// Vision APIs are network-bound; twenty parallel calls keep a typical
    /// document well inside free-tier quotas. Lower it when the run logs the
    /// sustained rate-limit advisory.
    pub concurrency_limit: usize,

    /// Custom captioning prompt. Document context is still appended to it.
    pub prompt_override: Option<String>,

    /// Send the text around each image reference with the captioning call. Default: true.
    pub context_enabled: bool,

    /// Characters of context on each side of an image reference. Default: 800.
    pub context_window: usize,

    /// Consecutive rate-limit-like failures that trigger the advisory. Default: 5.
    pub rate_limit_threshold: usize,

    /// Vision model identifier. If None, uses the provider default.
    pub model: Option<String>,

    /// Provider name (e.g. "gemini", "openai", "anthropic").
    /// If None along with `client`, the provider is auto-detected from the environment.
    pub provider_name: Option<String>,

    /// API key for the provider. If None, read from the provider's env var.
    pub api_key: Option<String>,

    /// Pre-constructed caption client. Takes precedence over `provider_name`.
    pub client: Option<Arc<dyn CaptionClient>>,

    /// Sampling temperature for the caption call. Default: 0.1.
    pub temperature: f32,

    /// Maximum tokens the model may generate per description. Default: 8192.
    pub max_output_tokens: usize,

    /// Per-call timeout applied by clients this crate constructs, in seconds. Default: 120.
    ///
    /// The runner itself never times out a call; a stuck request is the
    /// client's to abandon.
    pub request_timeout_secs: u64,

    /// Idle HTTP connections kept per host by clients this crate constructs.
    /// If None, matches `concurrency_limit` so every in-flight call can reuse
    /// a pooled connection.
    pub connection_pool_size: Option<usize>,

    /// Path to the `captionmd-worker` executable for the subprocess strategy.
    pub worker_program: Option<PathBuf>,

    /// Force a strategy instead of detecting one. Intended for tests and
    /// for hosts that know better than the probe.
    pub strategy_override: Option<Strategy>,

    /// PDF user password for encrypted documents.
    pub password: Option<String>,

    /// Per-image progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY,
            prompt_override: None,
            context_enabled: true,
            context_window: DEFAULT_CONTEXT_WINDOW,
            rate_limit_threshold: DEFAULT_RATE_LIMIT_THRESHOLD,
            model: None,
            provider_name: None,
            api_key: None,
            client: None,
            temperature: 0.1,
            max_output_tokens: 8192,
            request_timeout_secs: 120,
            connection_pool_size: None,
            worker_program: None,
            strategy_override: None,
            password: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for CaptionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptionConfig")
            .field("concurrency_limit", &self.concurrency_limit)
            .field("prompt_override", &self.prompt_override.as_ref().map(|p| p.len()))
            .field("context_enabled", &self.context_enabled)
            .field("context_window", &self.context_window)
            .field("rate_limit_threshold", &self.rate_limit_threshold)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("client", &self.client.as_ref().map(|_| "<dyn CaptionClient>"))
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("connection_pool_size", &self.connection_pool_size)
            .field("worker_program", &self.worker_program)
            .field("strategy_override", &self.strategy_override)
            .finish()
    }
}

/// The read-only slice of [`CaptionConfig`] that governs one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub concurrency_limit: usize,
    pub prompt_override: Option<String>,
    pub context_enabled: bool,
}

impl CaptionConfig {
    /// Create a new builder for `CaptionConfig`.
    pub fn builder() -> CaptionConfigBuilder {
        CaptionConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            concurrency_limit: self.concurrency_limit,
            prompt_override: self.prompt_override.clone(),
            context_enabled: self.context_enabled,
        }
    }

    /// Effective connection-pool size for clients built from this config.
    pub fn pool_size(&self) -> usize {
        self.connection_pool_size
            .unwrap_or(self.concurrency_limit)
            .max(1)
    }
}

/// Builder for [`CaptionConfig`].
#[derive(Debug)]
pub struct CaptionConfigBuilder {
    config: CaptionConfig,
}

impl CaptionConfigBuilder {
    pub fn concurrency_limit(mut self, n: usize) -> Self {
        self.config.concurrency_limit = n;
        self
    }

    pub fn prompt_override(mut self, prompt: impl Into<String>) -> Self {
        self.config.prompt_override = Some(prompt.into());
        self
    }

    pub fn context_enabled(mut self, v: bool) -> Self {
        self.config.context_enabled = v;
        self
    }

    pub fn context_window(mut self, chars: usize) -> Self {
        self.config.context_window = chars;
        self
    }

    pub fn rate_limit_threshold(mut self, n: usize) -> Self {
        self.config.rate_limit_threshold = n;
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn client(mut self, client: Arc<dyn CaptionClient>) -> Self {
        self.config.client = Some(client);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_output_tokens(mut self, n: usize) -> Self {
        self.config.max_output_tokens = n;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn connection_pool_size(mut self, n: usize) -> Self {
        self.config.connection_pool_size = Some(n.max(1));
        self
    }

    pub fn worker_program(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.worker_program = Some(path.into());
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.config.strategy_override = Some(strategy);
        self
    }

    pub fn password(mut self, pwd: impl Into<String>) -> Self {
        self.config.password = Some(pwd.into());
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<CaptionConfig, CaptionError> {
        let c = &self.config;
        if c.concurrency_limit == 0 {
            return Err(CaptionError::InvalidConfig(
                "Concurrency limit must be ≥ 1".into(),
            ));
        }
        if c.context_window == 0 {
            return Err(CaptionError::InvalidConfig(
                "Context window must be ≥ 1 character".into(),
            ));
        }
        if c.rate_limit_threshold == 0 {
            return Err(CaptionError::InvalidConfig(
                "Rate-limit threshold must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_behaviour() {
        let c = CaptionConfig::default();
        assert_eq!(c.concurrency_limit, 20);
        assert_eq!(c.context_window, 800);
        assert!(c.context_enabled);
        assert_eq!(c.pool_size(), 20);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = CaptionConfig::builder()
            .concurrency_limit(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("Concurrency"));
    }

    #[test]
    fn explicit_pool_size_wins() {
        let c = CaptionConfig::builder()
            .concurrency_limit(4)
            .connection_pool_size(32)
            .build()
            .unwrap();
        assert_eq!(c.pool_size(), 32);
    }

    #[test]
    fn debug_redacts_api_key() {
        let c = CaptionConfig::builder().api_key("sk-secret").build().unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("sk-secret"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn run_config_view() {
        let c = CaptionConfig::builder()
            .concurrency_limit(3)
            .prompt_override("describe")
            .context_enabled(false)
            .build()
            .unwrap();
        assert_eq!(
            c.run_config(),
            RunConfig {
                concurrency_limit: 3,
                prompt_override: Some("describe".into()),
                context_enabled: false,
            }
        );
    }
}
