//! Document stages around the captioning run.
//!
//! ## Data Flow
//!
//! ```text
//! extract ──▶ context ──▶ (runner) ──▶ splice
//! (pdfium)    (windows)   (captions)   (insert)
//! ```
//!
//! 1. [`extract`]: turn a PDF or image file into Markdown plus images
//! 2. [`context`]: find each image reference and build one task per image
//! 3. [`encode`]:  base64-wrap image bytes for provider requests
//! 4. [`splice`]:  insert descriptions above their references; the only
//!    stage that writes document text

pub mod context;
pub mod encode;
pub mod extract;
pub mod splice;
