//! Text-layer extraction from PDF using lopdf
//!
//! Walks each page's content stream, positions text items through the
//! current transformation and text matrices, and rebuilds the page text in
//! reading order. Pages come out as [`PageText`] so that OCR results can
//! later replace individual pages without touching the rest.

use crate::AuditError;
use lopdf::{Document, Object, ObjectId};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Where a page's text came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageSource {
    /// Decoded from the PDF text layer
    TextLayer,
    /// Recognized from a rendered page image
    Ocr,
}

/// The text of one page
#[derive(Debug, Clone, Serialize)]
pub struct PageText {
    /// Page number (1-indexed)
    pub number: u32,
    pub text: String,
    pub source: PageSource,
}

impl PageText {
    pub fn new(number: u32, text: impl Into<String>, source: PageSource) -> Self {
        Self {
            number,
            text: text.into(),
            source,
        }
    }

    /// Number of non-whitespace characters
    pub fn char_count(&self) -> usize {
        non_whitespace_char_count(&self.text)
    }

    /// Whether the page has too little text to be useful
    pub fn is_sparse(&self, min_chars: usize) -> bool {
        self.char_count() < min_chars
    }
}

/// A text item with position information
#[derive(Debug, Clone)]
pub struct TextItem {
    /// The text content
    pub text: String,
    /// X position on page
    pub x: f32,
    /// Y position on page (PDF coordinates, origin at bottom-left)
    pub y: f32,
    /// Rendered font size
    pub font_size: f32,
    /// Page number (1-indexed)
    pub page: u32,
}

/// A line of text (grouped text items)
#[derive(Debug, Clone)]
pub struct TextLine {
    pub items: Vec<TextItem>,
    pub y: f32,
    pub page: u32,
}

impl TextLine {
    pub fn text(&self) -> String {
        self.items
            .iter()
            .map(|i| i.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Load a PDF from disk, rejecting encrypted or page-less documents
pub fn load_document<P: AsRef<Path>>(path: P) -> Result<Document, AuditError> {
    let doc = Document::load(path)?;
    validate_document(doc)
}

/// Load a PDF from a memory buffer
pub fn load_document_mem(buffer: &[u8]) -> Result<Document, AuditError> {
    let doc = Document::load_mem(buffer)?;
    validate_document(doc)
}

fn validate_document(doc: Document) -> Result<Document, AuditError> {
    if doc.is_encrypted() {
        return Err(AuditError::Encrypted);
    }
    if doc.get_pages().is_empty() {
        return Err(AuditError::InvalidStructure);
    }
    Ok(doc)
}

/// Extract the text layer of every page, limited to the first `max_pages`
///
/// A page whose content stream cannot be decoded yields empty text so the
/// OCR fallback can still pick it up.
pub fn extract_pages(doc: &Document, max_pages: Option<usize>) -> Vec<PageText> {
    let pages = doc.get_pages();
    let limit = max_pages.unwrap_or(usize::MAX);

    if pages.len() > limit {
        log::info!("Limiting extraction to first {} of {} pages", limit, pages.len());
    }

    pages
        .iter()
        .take(limit)
        .map(|(&page_num, &page_id)| {
            page_text(page_num, extract_page_text_items(doc, page_id, page_num))
        })
        .collect()
}

fn page_text(page_num: u32, items: Result<Vec<TextItem>, AuditError>) -> PageText {
    let text = match items {
        Ok(items) => group_into_lines(items)
            .iter()
            .map(TextLine::text)
            .collect::<Vec<_>>()
            .join("\n"),
        Err(e) => {
            log::warn!("Could not decode text layer of page {}: {}", page_num, e);
            String::new()
        }
    };
    PageText::new(page_num, text, PageSource::TextLayer)
}

/// Render pages as one document string with `--- Page N ---` markers
///
/// Pages without text are skipped.
pub fn render_marked(pages: &[PageText]) -> String {
    let mut out = String::new();
    for page in pages {
        let text = page.text.trim();
        if text.is_empty() {
            log::warn!("No text extracted from page {}", page.number);
            continue;
        }
        out.push_str(&page_marker(page.number));
        out.push('\n');
        out.push_str(text);
        out.push_str("\n\n");
    }
    out
}

/// The marker line that introduces a page in rendered text
pub fn page_marker(page: u32) -> String {
    format!("--- Page {} ---", page)
}

pub fn non_whitespace_char_count(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

/// Multiply two 2D transformation matrices
/// Matrix format: [a, b, c, d, e, f] representing:
/// | a  b  0 |
/// | c  d  0 |
/// | e  f  1 |
fn multiply_matrices(m1: &[f32; 6], m2: &[f32; 6]) -> [f32; 6] {
    [
        m1[0] * m2[0] + m1[1] * m2[2],
        m1[0] * m2[1] + m1[1] * m2[3],
        m1[2] * m2[0] + m1[3] * m2[2],
        m1[2] * m2[1] + m1[3] * m2[3],
        m1[4] * m2[0] + m1[5] * m2[2] + m2[4],
        m1[4] * m2[1] + m1[5] * m2[3] + m2[5],
    ]
}

const IDENTITY: [f32; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

/// Text state while walking a content stream
struct TextState {
    ctm: [f32; 6],
    ctm_stack: Vec<[f32; 6]>,
    font: String,
    font_size: f32,
    text_matrix: [f32; 6],
    line_matrix: [f32; 6],
    in_text_block: bool,
}

impl TextState {
    fn new() -> Self {
        Self {
            ctm: IDENTITY,
            ctm_stack: Vec::new(),
            font: String::new(),
            font_size: 12.0,
            text_matrix: IDENTITY,
            line_matrix: IDENTITY,
            in_text_block: false,
        }
    }

    fn next_line(&mut self) {
        // Approximate leading
        self.line_matrix[5] -= self.font_size * 1.2;
        self.text_matrix = self.line_matrix;
    }

    fn item(&self, text: String, page: u32) -> TextItem {
        let combined = multiply_matrices(&self.text_matrix, &self.ctm);
        TextItem {
            text,
            x: combined[4],
            y: combined[5],
            font_size: effective_font_size(self.font_size, &self.text_matrix),
            page,
        }
    }
}

/// Extract text items from a single page
fn extract_page_text_items(
    doc: &Document,
    page_id: ObjectId,
    page_num: u32,
) -> Result<Vec<TextItem>, AuditError> {
    use lopdf::content::Content;

    let mut items = Vec::new();
    let fonts = doc.get_page_fonts(page_id).unwrap_or_default();

    let content_data = doc
        .get_page_content(page_id)
        .map_err(|e| AuditError::Parse(e.to_string()))?;
    let content = Content::decode(&content_data).map_err(|e| AuditError::Parse(e.to_string()))?;

    let mut state = TextState::new();

    for op in &content.operations {
        let operands = &op.operands;
        match op.operator.as_str() {
            "q" => state.ctm_stack.push(state.ctm),
            "Q" => {
                if let Some(saved) = state.ctm_stack.pop() {
                    state.ctm = saved;
                }
            }
            "cm" if operands.len() >= 6 => {
                let m = read_matrix(operands);
                state.ctm = multiply_matrices(&m, &state.ctm);
            }
            "BT" => {
                state.in_text_block = true;
                state.text_matrix = IDENTITY;
                state.line_matrix = IDENTITY;
            }
            "ET" => state.in_text_block = false,
            "Tf" if operands.len() >= 2 => {
                if let Ok(name) = operands[0].as_name() {
                    state.font = String::from_utf8_lossy(name).to_string();
                }
                if let Some(size) = get_number(&operands[1]) {
                    state.font_size = size;
                }
            }
            "Td" | "TD" if operands.len() >= 2 => {
                state.line_matrix[4] += get_number(&operands[0]).unwrap_or(0.0);
                state.line_matrix[5] += get_number(&operands[1]).unwrap_or(0.0);
                state.text_matrix = state.line_matrix;
            }
            "Tm" if operands.len() >= 6 => {
                state.text_matrix = read_matrix(operands);
                state.line_matrix = state.text_matrix;
            }
            "T*" => state.next_line(),
            "Tj" if state.in_text_block && !operands.is_empty() => {
                let text = extract_text_from_operand(&operands[0], doc, &fonts, &state.font);
                if let Some(text) = text {
                    if !text.trim().is_empty() {
                        items.push(state.item(text, page_num));
                    }
                }
            }
            "TJ" if state.in_text_block && !operands.is_empty() => {
                if let Ok(array) = operands[0].as_array() {
                    let combined: String = array
                        .iter()
                        .filter_map(|part| {
                            extract_text_from_operand(part, doc, &fonts, &state.font)
                        })
                        .collect();
                    if !combined.trim().is_empty() {
                        items.push(state.item(combined, page_num));
                    }
                }
            }
            "'" | "\"" => {
                state.next_line();
                // `"` carries word and char spacing before the string
                if let Some(operand) = operands.last() {
                    if let Some(text) = extract_text_from_operand(operand, doc, &fonts, &state.font)
                    {
                        if !text.trim().is_empty() {
                            items.push(state.item(text, page_num));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    Ok(items)
}

fn read_matrix(operands: &[Object]) -> [f32; 6] {
    let mut m = IDENTITY;
    for (i, operand) in operands.iter().take(6).enumerate() {
        if let Some(value) = get_number(operand) {
            m[i] = value;
        }
    }
    m
}

/// Helper to get f32 from Object
fn get_number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r),
        _ => None,
    }
}

/// Compute effective font size from base size and text matrix
fn effective_font_size(base_size: f32, text_matrix: &[f32; 6]) -> f32 {
    let scale_x = (text_matrix[0].powi(2) + text_matrix[1].powi(2)).sqrt();
    let scale_y = (text_matrix[2].powi(2) + text_matrix[3].powi(2)).sqrt();
    base_size * scale_x.max(scale_y)
}

/// Extract text from a text operand, handling encoding
fn extract_text_from_operand(
    obj: &Object,
    doc: &Document,
    fonts: &BTreeMap<Vec<u8>, &lopdf::Dictionary>,
    current_font: &str,
) -> Option<String> {
    let Object::String(bytes, _) = obj else {
        return None;
    };

    if let Some(font_dict) = fonts.get(current_font.as_bytes()) {
        if let Ok(encoding) = font_dict.get_font_encoding(doc) {
            if let Ok(text) = Document::decode_text(&encoding, bytes) {
                return Some(text);
            }
        }
    }

    // Fallback: UTF-16BE then Latin-1
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let utf16: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect();
        return Some(String::from_utf16_lossy(&utf16));
    }

    Some(bytes.iter().map(|&b| b as char).collect())
}

/// Group text items into lines, page by page
pub fn group_into_lines(items: Vec<TextItem>) -> Vec<TextLine> {
    let mut by_page: BTreeMap<u32, Vec<TextItem>> = BTreeMap::new();
    for item in items {
        by_page.entry(item.page).or_default().push(item);
    }

    by_page
        .into_values()
        .flat_map(group_single_column)
        .collect()
}

/// Group items from one page into lines
///
/// Preserves content stream order, which is usually reading order, and only
/// merges consecutive items whose Y positions are within tolerance.
fn group_single_column(items: Vec<TextItem>) -> Vec<TextLine> {
    const Y_TOLERANCE: f32 = 3.0;
    let mut lines: Vec<TextLine> = Vec::new();

    for item in items {
        match lines.last_mut() {
            Some(last) if last.page == item.page && (last.y - item.y).abs() < Y_TOLERANCE => {
                last.items.push(item);
            }
            _ => {
                let (y, page) = (item.y, item.page);
                lines.push(TextLine {
                    items: vec![item],
                    y,
                    page,
                });
            }
        }
    }

    for line in &mut lines {
        line.items
            .sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap_or(std::cmp::Ordering::Equal));
    }

    lines
}
