//! Context windows: the document text around an image reference.
//!
//! A caption is far more useful when the model knows what the paragraph
//! around a chart is talking about. For each extracted image we find its
//! Markdown reference (`![alt](path)`) in the generated document and hand the
//! text immediately before and after it to the captioning call.
//!
//! Matching compares the *terminal path segment* of the reference with the
//! image filename for exact equality, so `image.png` never matches
//! `myimage.png` or `other/image.png.bak`.

use crate::config::CaptionConfig;
use crate::output::{ImageSource, ImageTask};
use crate::pipeline::extract::ExtractedImage;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// A Markdown image reference: `![alt](target)` or `![alt](<target>)`.
///
/// The angle-bracket form may contain spaces and parentheses.
pub(crate) static RE_IMAGE_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"!\[([^\]]*)\]\((<[^>\n]*>[^)\n]*|[^)]*)\)").unwrap());

/// Final path segment of an image reference target.
///
/// Handles `<angle bracketed>` targets, trailing `"titles"`, URL query or
/// fragment suffixes on bare targets, and both `/` and `\` separators.
pub(crate) fn terminal_segment(target: &str) -> &str {
    let t = target.trim();
    let path = match t.strip_prefix('<') {
        Some(rest) => rest.split('>').next().unwrap_or(rest),
        None => {
            let bare = t.split_whitespace().next().unwrap_or(t);
            bare.split(|c| c == '?' || c == '#').next().unwrap_or(bare)
        }
    };
    path.rsplit(|c| c == '/' || c == '\\').next().unwrap_or(path)
}

/// Make `name` usable as an image filename inside a reference target.
///
/// Path separators, angle brackets and control characters become `_`.
pub fn reference_safe_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '<' | '>' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Markdown reference to `filename` that [`extract`] and the splicer will
/// find again.
///
/// Names with whitespace, parentheses, `?` or `#` use the angle-bracket
/// form. Brackets are dropped from `alt`.
pub fn image_reference(alt: &str, filename: &str) -> String {
    let alt: String = alt.chars().filter(|c| !matches!(c, '[' | ']')).collect();
    let needs_brackets = filename
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '?' | '#'));
    if needs_brackets {
        format!("![{alt}](<{filename}>)")
    } else {
        format!("![{alt}]({filename})")
    }
}

/// Locate the first reference to `filename` and return the text around it.
///
/// Each side is at most `window` characters, trimmed of surrounding
/// whitespace. Returns `(None, None)` when no reference matches.
pub fn extract(document_text: &str, filename: &str, window: usize) -> (Option<String>, Option<String>) {
    let found = RE_IMAGE_REF.captures_iter(document_text).find_map(|caps| {
        if terminal_segment(&caps[2]) == filename {
            caps.get(0)
        } else {
            None
        }
    });

    let Some(m) = found else {
        return (None, None);
    };

    let before = tail_chars(&document_text[..m.start()], window).trim();
    let after = head_chars(&document_text[m.end()..], window).trim();
    (Some(before.to_string()), Some(after.to_string()))
}

/// Build one [`ImageTask`] per distinct extracted image, in extractor order.
///
/// Duplicate filenames keep their first occurrence. Context is only looked
/// up when `config.context_enabled` is set.
pub fn build_tasks(
    document_text: &str,
    images: &[ExtractedImage],
    config: &CaptionConfig,
) -> Vec<ImageTask> {
    let mut seen = HashSet::new();
    let mut tasks = Vec::with_capacity(images.len());

    for image in images {
        if !seen.insert(image.filename.as_str()) {
            debug!("Duplicate image '{}' ignored", image.filename);
            continue;
        }
        let (before, after) = if config.run_config().context_enabled {
            extract(document_text, &image.filename, config.context_window)
        } else {
            (None, None)
        };
        let task = ImageTask::new(
            tasks.len() + 1,
            image.filename.clone(),
            ImageSource::Bytes(Arc::clone(&image.bytes)),
        )
        .with_context(before, after);
        tasks.push(task);
    }

    tasks
}

/// Last `n` characters of `s`.
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    match s.char_indices().rev().nth(n - 1) {
        Some((idx, _)) => &s[idx..],
        None => s,
    }
}

/// First `n` characters of `s`.
fn head_chars(s: &str, n: usize) -> &str {
    crate::prompts::clip_chars(s, n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_around_reference() {
        let text = "before-text ![a](img1.png) after-text";
        let (before, after) = extract(text, "img1.png", 800);
        assert!(before.unwrap().ends_with("before-text"));
        assert!(after.unwrap().starts_with("after-text"));
    }

    #[test]
    fn missing_reference_yields_none() {
        assert_eq!(extract("no images here", "img1.png", 800), (None, None));
    }

    #[test]
    fn suffix_does_not_match_other_file() {
        let text = "first ![x](dir/myimage.png) middle ![y](dir/image.png) last";
        let (before, after) = extract(text, "image.png", 800);
        assert!(before.unwrap().ends_with("middle"));
        assert_eq!(after.as_deref(), Some("last"));
    }

    #[test]
    fn first_occurrence_wins() {
        let text = "one ![](a.png) two ![](a.png) three";
        let (before, _) = extract(text, "a.png", 800);
        assert_eq!(before.as_deref(), Some("one"));
    }

    #[test]
    fn window_bounds_each_side() {
        let text = format!("{} ![](a.png) {}", "b".repeat(2000), "é".repeat(2000));
        let (before, after) = extract(&text, "a.png", 800);
        assert_eq!(before.unwrap().chars().count(), 799); // trailing space trimmed
        assert_eq!(after.unwrap().chars().count(), 799); // leading space trimmed
    }

    #[test]
    fn terminal_segment_variants() {
        assert_eq!(terminal_segment("a/b/c.png"), "c.png");
        assert_eq!(terminal_segment(r"C:\tmp\c.png"), "c.png");
        assert_eq!(terminal_segment("c.png \"Figure 1\""), "c.png");
        assert_eq!(terminal_segment("<my dir/c d.png>"), "c d.png");
        assert_eq!(terminal_segment("https://x.org/img/c.png?v=2"), "c.png");
    }

    #[test]
    fn names_with_spaces_and_parentheses_are_found() {
        for name in ["my chart.png", "Annual Report (final)-1-1.png", "fig#2?.png"] {
            let text = format!("before {} after", image_reference("x", name));
            let (before, after) = extract(&text, name, 800);
            assert_eq!(before.as_deref(), Some("before"), "{name}");
            assert_eq!(after.as_deref(), Some("after"), "{name}");
        }
    }

    #[test]
    fn plain_names_keep_the_bare_form() {
        assert_eq!(image_reference("chart", "chart.png"), "![chart](chart.png)");
        assert_eq!(image_reference("a [b]", "a b.png"), "![a b](<a b.png>)");
    }

    #[test]
    fn angle_target_with_title() {
        let text = "x ![](<dir/a (1).png> \"Figure\") y";
        assert_eq!(extract(text, "a (1).png", 800).0.as_deref(), Some("x"));
    }

    #[test]
    fn unsafe_characters_are_replaced() {
        assert_eq!(reference_safe_name("a/b\\c<d>.png"), "a_b_c_d_.png");
        assert_eq!(reference_safe_name("my chart (v2).png"), "my chart (v2).png");
    }

    #[test]
    fn build_tasks_dedupes_and_numbers_from_one() {
        let img = |name: &str| ExtractedImage {
            filename: name.to_string(),
            bytes: Arc::from(&b"png"[..]),
        };
        let images = vec![img("a.png"), img("b.png"), img("a.png")];
        let text = "intro ![](a.png) mid ![](b.png) end";
        let tasks = build_tasks(text, &images, &CaptionConfig::default());
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].sequence_index(), 1);
        assert_eq!(tasks[1].sequence_index(), 2);
        assert_eq!(tasks[1].context_before(), Some("intro ![](a.png) mid"));
    }

    #[test]
    fn build_tasks_without_context() {
        let images = vec![ExtractedImage {
            filename: "a.png".into(),
            bytes: Arc::from(&b"png"[..]),
        }];
        let config = CaptionConfig::builder().context_enabled(false).build().unwrap();
        let tasks = build_tasks("text ![](a.png) text", &images, &config);
        assert_eq!(tasks[0].context_before(), None);
        assert_eq!(tasks[0].context_after(), None);
    }
}
