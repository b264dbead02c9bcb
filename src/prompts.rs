//! Prompts for context-aware image captioning.
//!
//! Every prompt lives here so the wording can change without touching the
//! client or runner code, and so tests can inspect prompts without a model.
//!
//! The default prompt asks the model to answer `SKIP: <reason>` for images
//! that carry no content (logos, buttons, dividers). [`parse_reply`] turns
//! that marker into a skip, which the runner never treats as a failure.

/// Marker a model uses to decline describing an image.
pub const SKIP_MARKER: &str = "SKIP:";

/// System instructions for describing a content image in a text-only document.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert at analyzing charts, diagrams, and visualizations embedded in documents.

Your task is to create detailed, accessible text descriptions that will accompany images in a text-only document.

IMPORTANT: SKIP the following types of images by responding with exactly "SKIP: [reason]":
- Navigation elements (buttons, menus, breadcrumbs, headers, footers)
- UI elements (icons, logos, decorative graphics, social media buttons)
- Call-to-action buttons or link graphics
- Page layout elements (dividers, backgrounds, borders)
- Non-content images

ONLY describe content-relevant visualizations such as:
- Charts (Line, Bar, Area, Pie, etc.)
- Graphs and plots
- Tables with data
- Diagrams (flowcharts, schematics, concept maps)
- Formulas and equations
- Screenshots of actual data or dashboards
- Infographics

For valid content visualizations, the description MUST:
1. Start by identifying the TYPE (Line Graph, Bar Chart, Table, Diagram, Formula, Dashboard, etc.)
2. Describe what is being measured or visualized
3. Explain the key patterns, trends, or insights visible
4. Include specific data points, axis labels, and important values when present
5. Be complete enough for someone listening via text-to-speech to understand it

FORMATTING RULES:
- Write in the SAME LANGUAGE as the document text
- Do NOT include image URLs or file paths in your description
- Do NOT use phrases like "the image shows" - describe directly
- Write in clear, professional language

The surrounding document context is provided to help you understand what the visualization illustrates."#;

/// Build the user turn for the default prompt, with optional document context.
///
/// Each context side is clipped to `window` characters.
pub fn context_user_prompt(
    context_before: Option<&str>,
    context_after: Option<&str>,
    window: usize,
) -> String {
    let mut parts = Vec::new();
    if let Some(before) = context_before.filter(|s| !s.is_empty()) {
        parts.push(format!(
            "DOCUMENT CONTEXT BEFORE:\n{}",
            clip_chars(before, window)
        ));
    }
    if let Some(after) = context_after.filter(|s| !s.is_empty()) {
        parts.push(format!(
            "DOCUMENT CONTEXT AFTER:\n{}",
            clip_chars(after, window)
        ));
    }

    format!(
        "Analyze this image and determine if it's a content-relevant visualization or a UI/navigation element.\n\n\
{}\n\n\
If it's a UI element, button, logo, or navigation graphic, respond with \"SKIP: [brief reason]\".\n\n\
If it's a chart, graph, table, diagram, or formula, provide a comprehensive description.\n\
IMPORTANT: Write in the same language as the document text above. Do NOT include any URLs or image paths.",
        parts.join("\n\n")
    )
}

/// Append document context to a caller-supplied prompt.
///
/// Custom prompts get half the window per side; they are usually short and
/// the caller controls the framing.
pub fn custom_prompt_with_context(
    prompt: &str,
    context_before: Option<&str>,
    context_after: Option<&str>,
    window: usize,
) -> String {
    let half = (window / 2).max(1);
    let mut parts = Vec::new();
    if let Some(before) = context_before.filter(|s| !s.is_empty()) {
        parts.push(format!("Context before: {}", clip_chars(before, half)));
    }
    if let Some(after) = context_after.filter(|s| !s.is_empty()) {
        parts.push(format!("Context after: {}", clip_chars(after, half)));
    }
    if parts.is_empty() {
        prompt.to_string()
    } else {
        format!("{}\n\n{}", prompt, parts.join("\n\n"))
    }
}

/// Interpret a raw model reply: `None` for a skip, `Some(text)` otherwise.
///
/// Empty replies count as skips; the model had nothing to say.
pub fn parse_reply(reply: &str) -> Option<String> {
    let text = reply.trim();
    if text.is_empty() {
        return None;
    }
    let head: String = text.chars().take(SKIP_MARKER.len()).collect();
    if head.eq_ignore_ascii_case(SKIP_MARKER) {
        return None;
    }
    Some(text.to_string())
}

/// First `n` characters of `s`, on a char boundary.
pub(crate) fn clip_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
