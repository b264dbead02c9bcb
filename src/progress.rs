//! Progress-callback trait for per-image captioning events.
//!
//! Inject an [`Arc<dyn CaptionProgressCallback>`] via
//! [`crate::config::CaptionConfigBuilder::progress_callback`] to receive
//! events as the runner captions each image.
//!
//! # Example
//!
//! ```rust
//! use captionmd::{CaptionConfig, CaptionProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     described: AtomicUsize,
//! }
//!
//! impl CaptionProgressCallback for CountingCallback {
//!     fn on_image_described(&self, _index: usize, filename: &str, chars: usize) {
//!         self.described.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{filename}: {chars} chars");
//!     }
//! }
//!
//! let config = CaptionConfig::builder()
//!     .progress_callback(Arc::new(CountingCallback { described: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use crate::output::RunStats;
use crate::runtime::Strategy;
use std::sync::Arc;

/// Called by the runner as it captions each image.
///
/// Implementations must be `Send + Sync`: with the thread-pool strategy the
/// per-image methods are called concurrently from different worker threads.
/// With the subprocess strategy per-image events happen in the child process
/// and only the run-level events reach the parent. All methods have no-op
/// defaults.
pub trait CaptionProgressCallback: Send + Sync {
    /// Called once when the strategy is known, before any call is made.
    fn on_run_start(&self, total_images: usize, strategy: Strategy) {
        let _ = (total_images, strategy);
    }

    /// Called just before the captioning call for an image.
    fn on_image_start(&self, index: usize, filename: &str) {
        let _ = (index, filename);
    }

    /// Called when an image received a description.
    fn on_image_described(&self, index: usize, filename: &str, chars: usize) {
        let _ = (index, filename, chars);
    }

    /// Called when the provider declined to describe an image.
    fn on_image_skipped(&self, index: usize, filename: &str) {
        let _ = (index, filename);
    }

    /// Called when the captioning call for an image failed.
    fn on_image_failed(&self, index: usize, filename: &str, error: &str) {
        let _ = (index, filename, error);
    }

    /// Called once after every image has been attempted.
    fn on_run_complete(&self, stats: &RunStats) {
        let _ = stats;
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl CaptionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::CaptionConfig`].
pub type ProgressCallback = Arc<dyn CaptionProgressCallback>;
