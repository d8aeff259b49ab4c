//! Loan agreement auditing over PDF text
//!
//! This crate provides:
//! - Page classification of text-based vs scanned PDFs using lopdf
//! - Text layer extraction with an OCR fallback for image-only pages
//! - Keyword hotspots and selective context for long agreements
//! - Model-backed audits (single-shot, map-reduce, hotspot, inline document)
//!   merged into one trust-scored report

pub mod analyzer;
pub mod chunker;
pub mod context;
pub mod detector;
pub mod extractor;
pub mod hotspot;
pub mod llm;
pub mod merge;
pub mod ocr;
pub mod pipeline;
pub mod prompt;
pub mod report;

pub use analyzer::{AnalysisConfig, AnalysisInput, Analyzer, Strategy};
pub use detector::{profile_pages, DetectionConfig, DocumentKind, PageKind, PageProfile};
pub use extractor::{extract_pages, load_document, render_marked, PageSource, PageText};
pub use hotspot::{scan_pages, HotspotConfig, RiskCategory, ScanReport};
pub use llm::{FallbackChain, GeminiClient, GenerativeModel, LlmConfig, LlmError, RetryPolicy};
pub use ocr::{OcrConfig, OcrEngine, OcrMode, TesseractOcr};
pub use pipeline::{extract_document, scan_file, AuditConfig, Auditor, ExtractedDocument};
pub use report::{AuditReport, ErrorReport, LoanFacts, RedFlag, Severity, Verdict};

use std::path::Path;

/// Audit a PDF file with default settings and the local Tesseract install
///
/// This function will:
/// 1. Classify pages and extract the text layer
/// 2. OCR pages without usable text, when Tesseract is available
/// 3. Run a map-reduce audit with `model`
pub fn audit_pdf<P: AsRef<Path>>(
    path: P,
    model: &dyn GenerativeModel,
) -> Result<AuditReport, AuditError> {
    let ocr = TesseractOcr::default();
    Auditor::new(AuditConfig::default(), model, Some(&ocr)).audit_file(path)
}

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("PDF parsing error: {0}")]
    Parse(String),
    #[error("PDF is encrypted")]
    Encrypted,
    #[error("Invalid PDF structure")]
    InvalidStructure,
    #[error("OCR error: {0}")]
    Ocr(String),
    #[error("OCR is required but no OCR engine is available (install pdftoppm and tesseract)")]
    OcrUnavailable,
    #[error("Model error: {0}")]
    Llm(#[from] LlmError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("No text could be extracted from the document")]
    NoText,
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl AuditError {
    /// Headline for the `error` field of an [`ErrorReport`]
    pub fn headline(&self) -> &'static str {
        match self {
            AuditError::Llm(_) | AuditError::Json(_) => "AI Analysis failed",
            AuditError::Config(_) => "Invalid configuration",
            _ => "OCR Digitization failed",
        }
    }

    pub fn to_report(&self) -> ErrorReport {
        ErrorReport::new(self.headline(), self)
    }
}

impl From<lopdf::Error> for AuditError {
    fn from(e: lopdf::Error) -> Self {
        AuditError::Parse(e.to_string())
    }
}
