//! Data carried through a captioning run and returned to the caller.
//!
//! [`ImageTask`] is built once per extracted image and never mutated.
//! [`CaptionOutcome`] is produced exactly once per task. [`RunResult`] is the
//! only artifact that outlives a run: an append-only map from image filename
//! to description, holding described images only.

use crate::error::ProviderError;
use crate::runtime::Strategy;
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};
use std::path::PathBuf;
use std::sync::Arc;

/// Where the bytes of an image live.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// Image already on disk (extracted files, worker requests).
    Path(PathBuf),
    /// Image held in memory (extractor output).
    Bytes(Arc<[u8]>),
}

impl ImageSource {
    /// Read the image bytes. In-memory sources are returned without copying.
    pub fn load(&self) -> std::io::Result<Arc<[u8]>> {
        match self {
            ImageSource::Path(p) => Ok(Arc::from(std::fs::read(p)?)),
            ImageSource::Bytes(b) => Ok(Arc::clone(b)),
        }
    }
}

/// One image to caption, with the document text around its reference.
#[derive(Debug, Clone)]
pub struct ImageTask {
    sequence_index: usize,
    filename: String,
    source: ImageSource,
    context_before: Option<String>,
    context_after: Option<String>,
}

impl ImageTask {
    /// Create a task without context. `sequence_index` is 1-based.
    pub fn new(sequence_index: usize, filename: impl Into<String>, source: ImageSource) -> Self {
        Self {
            sequence_index,
            filename: filename.into(),
            source,
            context_before: None,
            context_after: None,
        }
    }

    /// Attach the context window found around the image reference.
    pub fn with_context(mut self, before: Option<String>, after: Option<String>) -> Self {
        self.context_before = before.filter(|s| !s.is_empty());
        self.context_after = after.filter(|s| !s.is_empty());
        self
    }

    pub fn sequence_index(&self) -> usize {
        self.sequence_index
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    pub fn context_before(&self) -> Option<&str> {
        self.context_before.as_deref()
    }

    pub fn context_after(&self) -> Option<&str> {
        self.context_after.as_deref()
    }
}

/// Result of captioning one image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptionOutcome {
    /// The provider returned a description.
    Described(String),
    /// The provider judged the image out of scope (logo, button, divider).
    Skipped,
    /// The call failed; the image is abandoned for this run.
    Failed(ProviderError),
}

/// Filename → description for every described image of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunResult {
    descriptions: BTreeMap<String, String>,
}

impl RunResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a description. An existing entry is never overwritten, so the
    /// first completed task for a filename wins.
    pub fn insert(&mut self, filename: impl Into<String>, description: impl Into<String>) -> bool {
        match self.descriptions.entry(filename.into()) {
            btree_map::Entry::Vacant(v) => {
                v.insert(description.into());
                true
            }
            btree_map::Entry::Occupied(_) => false,
        }
    }

    pub fn get(&self, filename: &str) -> Option<&str> {
        self.descriptions.get(filename).map(String::as_str)
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.descriptions.contains_key(filename)
    }

    pub fn len(&self) -> usize {
        self.descriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.descriptions
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.descriptions
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RunResult {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut result = RunResult::new();
        for (k, v) in iter {
            result.insert(k, v);
        }
        result
    }
}

/// Diagnostics for one captioning run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Number of tasks submitted.
    pub total: usize,
    pub described: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Failures classified as rate-limit-like.
    pub rate_limited: usize,
    /// Strategy selected for the run; `None` when there was nothing to caption.
    pub strategy: Option<Strategy>,
    /// Strategy the run fell back to, if the selected one failed.
    pub fallback: Option<Strategy>,
    /// Provider family detected from the client.
    pub provider_family: Option<String>,
    pub duration_ms: u64,
}

impl RunStats {
    /// Every submitted task produced exactly one outcome.
    pub fn is_complete(&self) -> bool {
        self.described + self.skipped + self.failed == self.total
    }
}

/// Output of one orchestrated run.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub result: RunResult,
    pub stats: RunStats,
}

/// Result of converting one document.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionOutput {
    /// Final Markdown with descriptions spliced above their images.
    pub markdown: String,
    /// Descriptions by image filename.
    pub descriptions: RunResult,
    /// Number of images the extractor produced.
    pub image_count: usize,
    pub stats: RunStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_result_is_append_only() {
        let mut r = RunResult::new();
        assert!(r.insert("a.png", "first"));
        assert!(!r.insert("a.png", "second"));
        assert_eq!(r.get("a.png"), Some("first"));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn run_result_serialises_as_flat_map() {
        let r: RunResult = [("a.png", "A"), ("b.png", "B")].into_iter().collect();
        let json = serde_json::to_string(&r).unwrap();
        assert_eq!(json, r#"{"a.png":"A","b.png":"B"}"#);
        let back: RunResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn task_drops_empty_context() {
        let t = ImageTask::new(1, "x.png", ImageSource::Bytes(Arc::from(&b"x"[..])))
            .with_context(Some(String::new()), Some("after".into()));
        assert_eq!(t.context_before(), None);
        assert_eq!(t.context_after(), Some("after"));
    }

    #[test]
    fn stats_completeness() {
        let s = RunStats {
            total: 3,
            described: 2,
            failed: 1,
            ..Default::default()
        };
        assert!(s.is_complete());
    }
}
