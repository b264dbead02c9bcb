//! Layout extraction: turn an input file into Markdown plus its images.
//!
//! The captioning core only needs `(markdown, [(filename, bytes)])`; how the
//! Markdown is produced is the extractor's business. [`LayoutExtractor`] is
//! that seam. Two implementations ship with the crate:
//!
//! * [`PdfiumExtractor`]: page text plus every embedded image object,
//!   exported as PNG and referenced after the text of its page.
//! * [`ImageFileExtractor`]: a standalone PNG/JPEG becomes a one-line
//!   document referencing itself, so it is captioned like any other image.
//!
//! Inputs are classified by magic bytes, not by extension.

use crate::error::CaptionError;
use crate::pipeline::context::{image_reference, reference_safe_name};
use crate::pipeline::encode::png_bytes;
use pdfium_render::prelude::*;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An image produced by the extractor, referenced by `filename` in the Markdown.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub filename: String,
    pub bytes: Arc<[u8]>,
}

/// Extractor output: Markdown text and the images it references, in order.
#[derive(Debug, Clone, Default)]
pub struct ExtractedDocument {
    pub markdown: String,
    pub images: Vec<ExtractedImage>,
}

/// Turns an input file into an [`ExtractedDocument`].
pub trait LayoutExtractor: Send + Sync {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, CaptionError>;
}

/// What kind of document a file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pdf,
    Image,
}

/// Validate that `path` is readable and classify it by its magic bytes.
pub fn classify_input(path: &Path) -> Result<InputKind, CaptionError> {
    if !path.exists() {
        return Err(CaptionError::FileNotFound {
            path: path.to_path_buf(),
        });
    }

    let mut magic = [0u8; 8];
    let read = match std::fs::File::open(path) {
        Ok(mut f) => f.read(&mut magic).unwrap_or(0),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(CaptionError::PermissionDenied {
                path: path.to_path_buf(),
            });
        }
        Err(_) => {
            return Err(CaptionError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
    };
    let magic = &magic[..read];

    if magic.starts_with(b"%PDF") {
        return Ok(InputKind::Pdf);
    }
    match image::guess_format(magic) {
        Ok(image::ImageFormat::Png) | Ok(image::ImageFormat::Jpeg) => Ok(InputKind::Image),
        _ => Err(CaptionError::UnsupportedInput {
            path: path.to_path_buf(),
        }),
    }
}

/// Pick the built-in extractor for a file.
pub fn extractor_for(path: &Path, password: Option<&str>) -> Result<Box<dyn LayoutExtractor>, CaptionError> {
    Ok(match classify_input(path)? {
        InputKind::Pdf => Box::new(PdfiumExtractor::new(password.map(str::to_string))),
        InputKind::Image => Box::new(ImageFileExtractor),
    })
}

// ── Standalone images ────────────────────────────────────────────────────

/// A single image file as a one-reference document.
pub struct ImageFileExtractor;

impl LayoutExtractor for ImageFileExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, CaptionError> {
        let bytes = std::fs::read(path).map_err(|_| CaptionError::FileNotFound {
            path: path.to_path_buf(),
        })?;
        let filename = reference_safe_name(&file_name(path));
        let stem = file_stem(path);

        Ok(ExtractedDocument {
            markdown: format!("{}\n", image_reference(&stem, &filename)),
            images: vec![ExtractedImage {
                filename,
                bytes: Arc::from(bytes),
            }],
        })
    }
}

// ── PDF via pdfium ───────────────────────────────────────────────────────

/// Page text and embedded images of a PDF, via pdfium.
pub struct PdfiumExtractor {
    password: Option<String>,
}

impl PdfiumExtractor {
    pub fn new(password: Option<String>) -> Self {
        Self { password }
    }
}

impl LayoutExtractor for PdfiumExtractor {
    fn extract(&self, path: &Path) -> Result<ExtractedDocument, CaptionError> {
        let pdfium = bind_pdfium()?;
        let password = self.password.as_deref();

        let document = pdfium.load_pdf_from_file(path, password).map_err(|e| {
            let err_str = format!("{:?}", e);
            if err_str.to_ascii_lowercase().contains("password") {
                CaptionError::PasswordRequired {
                    path: path.to_path_buf(),
                }
            } else {
                CaptionError::CorruptPdf {
                    path: path.to_path_buf(),
                    detail: err_str,
                }
            }
        })?;

        let doc_name = reference_safe_name(&file_stem(path));
        let mut pages_md = Vec::new();
        let mut images = Vec::new();

        for (page_index, page) in document.pages().iter().enumerate() {
            let text = page
                .text()
                .map_err(|e| CaptionError::ExtractionFailed {
                    page: page_index + 1,
                    detail: format!("{:?}", e),
                })?
                .all();

            let mut page_md = text.trim().to_string();
            let mut image_index = 0usize;

            for object in page.objects().iter() {
                let Some(image_object) = object.as_image_object() else {
                    continue;
                };
                let raw = match image_object.get_raw_image() {
                    Ok(img) => img,
                    Err(e) => {
                        warn!("Page {}: unreadable image object: {:?}", page_index + 1, e);
                        continue;
                    }
                };
                let bytes = match png_bytes(&raw) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!("Page {}: PNG encoding failed: {}", page_index + 1, e);
                        continue;
                    }
                };

                image_index += 1;
                let filename = pdf_image_name(&doc_name, page_index, image_index);
                debug!("Extracted {} ({} bytes)", filename, bytes.len());
                page_md.push_str("\n\n");
                page_md.push_str(&image_reference("", &filename));
                images.push(ExtractedImage {
                    filename,
                    bytes: Arc::from(bytes),
                });
            }

            pages_md.push(page_md);
        }

        info!(
            "Extracted {} pages, {} images from {}",
            pages_md.len(),
            images.len(),
            path.display()
        );

        let mut markdown = pages_md.join("\n\n");
        markdown.push('\n');
        Ok(ExtractedDocument { markdown, images })
    }
}

/// Bind pdfium from `PDFIUM_LIB_PATH` (file or directory) or the system.
fn bind_pdfium() -> Result<Pdfium, CaptionError> {
    let bindings = match std::env::var("PDFIUM_LIB_PATH") {
        Ok(p) if !p.is_empty() => {
            let p = PathBuf::from(p);
            let lib = if p.is_dir() {
                Pdfium::pdfium_platform_library_name_at_path(&p)
            } else {
                p
            };
            Pdfium::bind_to_library(lib)
        }
        _ => Pdfium::bind_to_system_library(),
    }
    .map_err(|e| CaptionError::PdfiumBindingFailed(format!("{:?}", e)))?;

    Ok(Pdfium::new(bindings))
}

/// `<doc>-<page>-<index>.png`, page and index both counted from 1.
fn pdf_image_name(doc_stem: &str, page_index: usize, image_index: usize) -> String {
    format!("{}-{}-{}.png", doc_stem, page_index + 1, image_index)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string())
}
