//! Top-level conversion entry points.
//!
//! All entry points are synchronous. The orchestrator picks the concurrency
//! model per run, so callers inside a tokio runtime are served too (through
//! the subprocess worker) instead of tripping over a nested runtime.
//!
//! Captioning is best-effort: a missing provider, or every image failing,
//! still yields `Ok` with the extracted Markdown and the failure counts in
//! [`ConversionOutput::stats`].

use crate::client::resolve_client;
use crate::config::CaptionConfig;
use crate::error::CaptionError;
use crate::output::{ConversionOutput, RunResult, RunStats};
use crate::pipeline::context::build_tasks;
use crate::pipeline::extract::{extractor_for, ExtractedImage};
use crate::pipeline::splice::splice;
use crate::runner::Orchestrator;
use std::io::Write;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Convert a PDF or image file to Markdown with image descriptions.
///
/// # Errors
/// Returns `Err(CaptionError)` only when no Markdown can be produced:
/// missing or unreadable input, unsupported format, corrupt or encrypted
/// PDF, pdfium not available.
pub fn convert(
    input: impl AsRef<Path>,
    config: &CaptionConfig,
) -> Result<ConversionOutput, CaptionError> {
    let total_start = Instant::now();
    let path = input.as_ref();
    info!("Starting conversion: {}", path.display());

    // ── Step 1: Extract layout ───────────────────────────────────────────
    let extractor = extractor_for(path, config.password.as_deref())?;
    let document = extractor.extract(path)?;
    debug!(
        "Extracted {} chars of Markdown, {} images",
        document.markdown.len(),
        document.images.len()
    );

    // ── Step 2: Caption and splice ───────────────────────────────────────
    let output = describe_document(&document.markdown, &document.images, config);

    info!(
        "Conversion complete: {} images, {} described in {}ms",
        output.image_count,
        output.stats.described,
        total_start.elapsed().as_millis()
    );
    Ok(output)
}

/// Caption the images of an already-extracted document and splice the
/// descriptions in above their references.
///
/// `images` are the extractor's `(filename, bytes)` pairs in document order.
pub fn describe_document(
    markdown: &str,
    images: &[ExtractedImage],
    config: &CaptionConfig,
) -> ConversionOutput {
    let tasks = build_tasks(markdown, images, config);
    if tasks.is_empty() {
        return ConversionOutput {
            markdown: markdown.to_string(),
            descriptions: RunResult::new(),
            image_count: images.len(),
            stats: RunStats::default(),
        };
    }

    let client = match resolve_client(config) {
        Ok(c) => c,
        Err(e) => {
            warn!("Image descriptions unavailable: {}", e);
            return ConversionOutput {
                markdown: markdown.to_string(),
                descriptions: RunResult::new(),
                image_count: images.len(),
                stats: RunStats {
                    total: tasks.len(),
                    failed: tasks.len(),
                    ..Default::default()
                },
            };
        }
    };

    let report = Orchestrator::new(client).run(&tasks, config);
    if report.stats.failed > 0 {
        warn!(
            "{} of {} image descriptions failed",
            report.stats.failed, report.stats.total
        );
    }

    ConversionOutput {
        markdown: splice(markdown, &report.result),
        descriptions: report.result,
        image_count: images.len(),
        stats: report.stats,
    }
}

/// Convert and write the Markdown to `output_path`.
///
/// Uses atomic write (temp file + rename) to prevent partial files.
pub fn convert_to_file(
    input: impl AsRef<Path>,
    output_path: impl AsRef<Path>,
    config: &CaptionConfig,
) -> Result<RunStats, CaptionError> {
    let output = convert(input, config)?;
    let path = output_path.as_ref();

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| CaptionError::OutputWriteFailed {
            path: path.to_path_buf(),
            source: e,
        })?;
    }

    let tmp_path = path.with_extension("md.tmp");
    std::fs::write(&tmp_path, &output.markdown).map_err(|e| CaptionError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| CaptionError::OutputWriteFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    Ok(output.stats)
}

/// Convert an in-memory PDF or image.
///
/// The bytes go through a managed [`tempfile`] that is removed on return.
///
/// # Example
/// ```rust,no_run
/// use captionmd::{convert_bytes, CaptionConfig};
///
/// let bytes = std::fs::read("report.pdf").unwrap();
/// let output = convert_bytes(&bytes, &CaptionConfig::default()).unwrap();
/// println!("{}", output.markdown);
/// ```
pub fn convert_bytes(bytes: &[u8], config: &CaptionConfig) -> Result<ConversionOutput, CaptionError> {
    let suffix = if bytes.starts_with(b"%PDF") {
        ".pdf"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        ".jpg"
    } else {
        ".png"
    };
    let mut tmp = tempfile::Builder::new()
        .prefix("captionmd-input-")
        .suffix(suffix)
        .tempfile()
        .map_err(|e| CaptionError::Internal(format!("tempfile: {e}")))?;
    tmp.write_all(bytes)
        .map_err(|e| CaptionError::Internal(format!("tempfile write: {e}")))?;
    tmp.flush()
        .map_err(|e| CaptionError::Internal(format!("tempfile flush: {e}")))?;
    // `tmp` is dropped (and the file deleted) when `convert` returns
    convert(tmp.path(), config)
}
