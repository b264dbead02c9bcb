//! # captionmd
//!
//! Convert documents to Markdown and describe their images with a
//! vision-capable language model.
//!
//! ## Why this crate?
//!
//! Layout extractors turn charts, diagrams and formulas into bare
//! `![](figure-3.png)` references: the text survives, the figures do not.
//! This crate sends every extracted image, together with the text around its
//! reference, to a vision model and inserts the description directly above
//! the original reference. The reference itself is never touched.
//!
//! The hard part is running N rate-limited, slow captioning calls as fast as
//! is safe *in the caller's process*. Each run probes its environment and
//! picks one of three strategies: a private event loop, a thread pool, or an
//! isolated worker process (when a tokio runtime is already running on the
//! calling thread). A strategy that cannot start falls back to the thread pool
//! without repeating finished work.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / PNG / JPEG
//!  │
//!  ├─ 1. Extract   page text + embedded images (pdfium)
//!  ├─ 2. Context   text window before/after each image reference
//!  ├─ 3. Strategy  event loop │ thread pool │ subprocess worker
//!  ├─ 4. Caption   bounded parallel calls to gemini / gpt-4.1 / claude / …
//!  └─ 5. Splice    description block inserted above each reference
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use captionmd::{convert, CaptionConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from GEMINI_API_KEY / OPENAI_API_KEY / ANTHROPIC_API_KEY
//!     let config = CaptionConfig::default();
//!     let output = convert("report.pdf", &config)?;
//!     println!("{}", output.markdown);
//!     eprintln!("{} described, {} skipped, {} failed",
//!         output.stats.described, output.stats.skipped, output.stats.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `captionmd` and `captionmd-worker` binaries (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod client;
pub mod config;
pub mod convert;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod runner;
pub mod runtime;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use client::{resolve_client, CaptionClient, CaptionRequest, ProviderFamily};
pub use config::{CaptionConfig, CaptionConfigBuilder, RunConfig};
pub use convert::{convert, convert_bytes, convert_to_file, describe_document};
pub use error::{CaptionError, ProviderError, ProviderErrorKind, SetupError};
pub use output::{
    CaptionOutcome, ConversionOutput, ImageSource, ImageTask, RunReport, RunResult, RunStats,
};
pub use progress::{CaptionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use runner::{run, Orchestrator};
pub use runtime::{runtime_allows_nested_async, set_isolation_marker, Strategy};
pub use worker::{WorkerInvoker, WorkerOutcome, WorkerRequest};
