//! Splicing: insert descriptions above their image references.
//!
//! The splicer only ever *inserts*. Every original `![alt](path)` reference
//! stays in the output, unchanged and in its original position relative to
//! all other text; a description block is placed directly before each
//! reference whose terminal path segment has an entry in the [`RunResult`].
//!
//! Splicing is not idempotent: running it twice with the same non-empty
//! result inserts two blocks per image. Callers splice once per run.

use crate::output::RunResult;
use crate::pipeline::context::{terminal_segment, RE_IMAGE_REF};

/// Heading that introduces every inserted description.
pub const DESCRIPTION_HEADING: &str = "**[AI-Generated Image Description]**";

/// The exact text inserted before a described image reference.
pub fn description_block(description: &str) -> String {
    format!("\n\n{}\n\n{}\n\n", DESCRIPTION_HEADING, description.trim())
}

/// Insert a description block before every reference with a result entry.
///
/// Single left-to-right pass. References without an entry, and all other
/// text, are copied through untouched, so
/// `output.len() == input.len() + Σ inserted block lengths`.
pub fn splice(document_text: &str, result: &RunResult) -> String {
    if result.is_empty() {
        return document_text.to_string();
    }

    let mut out = String::with_capacity(document_text.len() + result.len() * 256);
    let mut cursor = 0;

    for caps in RE_IMAGE_REF.captures_iter(document_text) {
        let Some(m) = caps.get(0) else { continue };
        let Some(description) = result.get(terminal_segment(&caps[2])) else {
            continue;
        };
        out.push_str(&document_text[cursor..m.start()]);
        out.push_str(&description_block(description));
        out.push_str(m.as_str());
        cursor = m.end();
    }

    out.push_str(&document_text[cursor..]);
    out
}
