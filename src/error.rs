//! Error types for the captionmd library.
//!
//! Three error types reflect three distinct failure scopes:
//!
//! * [`CaptionError`]: **fatal**, the conversion cannot proceed at all
//!   (missing input, unreadable PDF, invalid configuration). Returned as
//!   `Err(CaptionError)` from the top-level `convert*` functions.
//!
//! * [`ProviderError`]: **per image**, one captioning call failed (network,
//!   quota, auth). Recorded as a failed outcome for that image; every other
//!   image is still attempted.
//!
//! * [`SetupError`]: **per strategy**, the chosen execution strategy could not
//!   start or keep going. The runner answers it by falling back to the
//!   thread-pool strategy, never by aborting the conversion.
//!
//! Captioning is best-effort enrichment: a document whose images all fail to
//! caption still converts successfully.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the captionmd library.
#[derive(Debug, Error)]
pub enum CaptionError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Input file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The file is neither a PDF nor a supported image.
    #[error("Unsupported input '{path}': expected a PDF, PNG or JPEG file")]
    UnsupportedInput { path: PathBuf },

    // ── PDF errors ────────────────────────────────────────────────────────
    /// PDF header/trailer/xref is corrupt and cannot be parsed.
    #[error("PDF '{path}' is corrupt: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    /// PDF requires a password but none (or the wrong one) was provided.
    #[error("PDF '{path}' is encrypted.\nProvide the password with --password <PASSWORD>.")]
    PasswordRequired { path: PathBuf },

    /// Text or image extraction failed for a page.
    #[error("Extraction failed for page {page}: {detail}")]
    ExtractionFailed { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium or install pdfium system-wide."
    )]
    PdfiumBindingFailed(String),

    // ── Provider errors ───────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("Caption provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Worker errors ─────────────────────────────────────────────────────
    /// The worker request or response payload could not be read or written.
    #[error("Worker payload error at '{path}': {detail}")]
    WorkerPayload { path: PathBuf, detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output Markdown file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Classification of a failed captioning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderErrorKind {
    /// Quota or throttling signal (HTTP 429, "resource exhausted", …).
    RateLimited,
    /// Network failure, timeout, 5xx.
    Transient,
    /// Bad or missing credentials (401/403).
    Auth,
    /// The client itself cannot operate in this strategy.
    Setup,
    /// Anything else, including a panic inside the client.
    Other,
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProviderErrorKind::RateLimited => "rate-limited",
            ProviderErrorKind::Transient => "transient",
            ProviderErrorKind::Auth => "auth",
            ProviderErrorKind::Setup => "setup",
            ProviderErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// A failed captioning call, distinguishable from a deliberate skip.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} provider error: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

/// Error-text fragments that mark a failure as rate-limit-like.
const RATE_LIMIT_SIGNALS: &[&str] = &[
    "429",
    "rate limit",
    "ratelimit",
    "rate_limit",
    "quota",
    "resource exhausted",
    "resource_exhausted",
    "too many requests",
    "throttl",
];

const AUTH_SIGNALS: &[&str] = &["401", "403", "unauthorized", "forbidden", "api key", "api_key"];

const TRANSIENT_SIGNALS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "500",
    "502",
    "503",
    "504",
    "unavailable",
    "overloaded",
];

/// True when the error text carries a quota or throttling signal.
pub fn is_rate_limit_like(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RATE_LIMIT_SIGNALS.iter().any(|s| lower.contains(s))
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Classify a raw error message by inspecting its text.
    ///
    /// Rate-limit signals win over everything else, so a "503 quota exceeded"
    /// counts toward the consecutive rate-limit streak.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        let kind = if is_rate_limit_like(&lower) {
            ProviderErrorKind::RateLimited
        } else if AUTH_SIGNALS.iter().any(|s| lower.contains(s)) {
            ProviderErrorKind::Auth
        } else if TRANSIENT_SIGNALS.iter().any(|s| lower.contains(s)) {
            ProviderErrorKind::Transient
        } else {
            ProviderErrorKind::Other
        };
        Self { kind, message }
    }

    pub fn setup(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Setup, message)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == ProviderErrorKind::RateLimited
    }
}

/// The chosen strategy could not start or continue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{strategy} strategy setup failed: {detail}")]
pub struct SetupError {
    pub strategy: &'static str,
    pub detail: String,
}

impl SetupError {
    pub fn new(strategy: &'static str, detail: impl Into<String>) -> Self {
        Self {
            strategy,
            detail: detail.into(),
        }
    }
}
