//! Page classification without text decoding
//!
//! Scans each page's content stream for text-showing operators and image
//! placements so the pipeline knows which pages carry a usable text layer
//! and which are image-only scans that need OCR.

use lopdf::{Document, Object, ObjectId};
use serde::Serialize;

/// Classification of a single page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    /// Page has text-showing operators
    Text,
    /// Page places images but shows (almost) no text
    ImageOnly,
    /// Page has neither text nor images
    Blank,
}

/// Classification of a whole document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// Every page has a text layer
    TextBased,
    /// No page has a text layer
    Scanned,
    /// Some pages need OCR
    Mixed,
}

/// Content-stream profile of a single page
#[derive(Debug, Clone, Serialize)]
pub struct PageProfile {
    /// Page number (1-indexed)
    pub page: u32,
    /// Number of text-showing operators found
    pub text_operator_count: u32,
    /// Whether the page places or references an image XObject
    pub has_images: bool,
    /// Derived classification
    pub kind: PageKind,
}

/// Configuration for page classification
#[derive(Debug, Clone)]
pub struct DetectionConfig {
    /// Minimum text operator count for a page to count as text-based
    pub min_text_ops_per_page: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            min_text_ops_per_page: 3,
        }
    }
}

/// Profile every page of a loaded document, in page order
pub fn profile_pages(doc: &Document, config: &DetectionConfig) -> Vec<PageProfile> {
    doc.get_pages()
        .iter()
        .map(|(&page, &page_id)| {
            let (text_operator_count, placed_images) = scan_page_content(doc, page_id);
            let has_images = placed_images || page_references_images(doc, page_id);
            let kind = classify(text_operator_count, has_images, config);
            PageProfile {
                page,
                text_operator_count,
                has_images,
                kind,
            }
        })
        .collect()
}

fn classify(text_ops: u32, has_images: bool, config: &DetectionConfig) -> PageKind {
    if text_ops >= config.min_text_ops_per_page {
        PageKind::Text
    } else if has_images {
        PageKind::ImageOnly
    } else {
        PageKind::Blank
    }
}

impl DocumentKind {
    /// Summarize page profiles into a document classification
    pub fn from_profiles(profiles: &[PageProfile]) -> Self {
        let text_pages = profiles
            .iter()
            .filter(|p| p.kind == PageKind::Text)
            .count();

        if text_pages == profiles.len() && !profiles.is_empty() {
            DocumentKind::TextBased
        } else if text_pages == 0 {
            DocumentKind::Scanned
        } else {
            DocumentKind::Mixed
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::TextBased => "text_based",
            DocumentKind::Scanned => "scanned",
            DocumentKind::Mixed => "mixed",
        }
    }
}

/// Count text operators and image placements across a page's content streams
fn scan_page_content(doc: &Document, page_id: ObjectId) -> (u32, bool) {
    let mut text_ops = 0u32;
    let mut has_images = false;

    for content_id in doc.get_page_contents(page_id) {
        if let Ok(Object::Stream(stream)) = doc.get_object(content_id) {
            let content = match stream.decompressed_content() {
                Ok(data) => data,
                Err(_) => stream.content.clone(),
            };

            let (ops, imgs) = scan_content_for_text_operators(&content);
            text_ops += ops;
            has_images = has_images || imgs;
        }
    }

    (text_ops, has_images)
}

/// Fast scan of content stream bytes for text operators
///
/// Counts `Tj`, `TJ`, and the quote operators (`'` and `"`) when they follow
/// a string operand. `Do` marks an XObject placement.
fn scan_content_for_text_operators(content: &[u8]) -> (u32, bool) {
    let mut text_ops = 0u32;
    let mut has_images = false;

    let is_delimited = |idx: usize| idx >= content.len() || content[idx].is_ascii_whitespace();

    for i in 0..content.len() {
        let b = content[i];
        let next = content.get(i + 1).copied();

        if b == b'T' && matches!(next, Some(b'j') | Some(b'J')) && is_delimited(i + 2) {
            text_ops += 1;
        }

        if (b == b'\'' || b == b'"') && is_delimited(i + 1) && follows_string(content, i) {
            text_ops += 1;
        }

        if b == b'D' && next == Some(b'o') && is_delimited(i + 2) {
            has_images = true;
        }
    }

    (text_ops, has_images)
}

/// Whether the last non-whitespace byte before `idx` closes a string operand
fn follows_string(content: &[u8], idx: usize) -> bool {
    content[..idx]
        .iter()
        .rev()
        .find(|b| !b.is_ascii_whitespace())
        .map_or(false, |&b| b == b')' || b == b'>')
}

/// Whether the page's resources reference an Image XObject
fn page_references_images(doc: &Document, page_id: ObjectId) -> bool {
    let Ok(page_dict) = doc.get_dictionary(page_id) else {
        return false;
    };
    let resources = match page_dict.get(b"Resources") {
        Ok(Object::Reference(id)) => doc.get_dictionary(*id).ok(),
        Ok(Object::Dictionary(dict)) => Some(dict),
        _ => None,
    };
    let Some(resources) = resources else {
        return false;
    };
    let xobjects = match resources.get(b"XObject") {
        Ok(Object::Reference(id)) => doc.get_dictionary(*id).ok(),
        Ok(Object::Dictionary(dict)) => Some(dict),
        _ => None,
    };
    let Some(xobjects) = xobjects else {
        return false;
    };

    xobjects.iter().any(|(_, value)| {
        value
            .as_reference()
            .ok()
            .and_then(|id| doc.get_object(id).ok())
            .and_then(|obj| obj.as_stream().ok())
            .and_then(|stream| stream.dict.get(b"Subtype").ok())
            .and_then(|subtype| subtype.as_name().ok())
            .map_or(false, |name| name == b"Image")
    })
}

/// Get document title from Info dictionary
pub fn document_title(doc: &Document) -> Option<String> {
    let info_ref = doc.trailer.get(b"Info").ok()?.as_reference().ok()?;
    let info = doc.get_dictionary(info_ref).ok()?;

    let title = match info.get(b"Title").ok()? {
        Object::String(bytes, _) => {
            // UTF-16BE with BOM
            if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
                let utf16: Vec<u16> = bytes[2..]
                    .chunks_exact(2)
                    .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                    .collect();
                Some(String::from_utf16_lossy(&utf16))
            } else {
                Some(String::from_utf8_lossy(bytes).to_string())
            }
        }
        _ => None,
    };

    title.filter(|title| !title.trim().is_empty())
}
