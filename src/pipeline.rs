//! End-to-end audit: load, classify, extract, OCR fallback, analyze

use crate::analyzer::{AnalysisConfig, AnalysisInput, Analyzer};
use crate::detector::{document_title, profile_pages, DetectionConfig, DocumentKind, PageProfile};
use crate::extractor::{extract_pages, load_document, load_document_mem, render_marked, PageText};
use crate::hotspot::{scan_pages, HotspotConfig, ScanReport};
use crate::llm::GenerativeModel;
use crate::ocr::{apply_ocr_fallback, ocr_candidates, OcrConfig, OcrEngine, OcrMode, OcrOutcome};
use crate::report::{AuditReport, Performance};
use crate::AuditError;
use lopdf::Document;
use std::borrow::Cow;
use std::io::Write;
use std::path::Path;
use std::time::Instant;

/// Everything that shapes an audit
#[derive(Debug, Clone, Default)]
pub struct AuditConfig {
    pub detection: DetectionConfig,
    pub ocr: OcrConfig,
    /// Only the first `max_pages` pages are extracted
    pub max_pages: Option<usize>,
    pub analysis: AnalysisConfig,
}

/// Text and page classification of one PDF
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub filename: String,
    pub title: Option<String>,
    pub kind: DocumentKind,
    pub profiles: Vec<PageProfile>,
    /// Extracted pages, possibly fewer than `page_count`
    pub pages: Vec<PageText>,
    pub page_count: usize,
    pub ocr: OcrOutcome,
    pub extraction_ms: u64,
}

impl ExtractedDocument {
    /// Page text joined with `--- Page N ---` markers
    pub fn marked_text(&self) -> String {
        render_marked(&self.pages)
    }

    pub fn has_text(&self) -> bool {
        self.pages.iter().any(|p| !p.text.trim().is_empty())
    }

    /// Keyword hotspots over the extracted text
    pub fn scan(&self, config: &HotspotConfig) -> ScanReport {
        scan_pages(&self.pages, config)
    }
}

enum Source<'b> {
    File(&'b Path),
    Memory(&'b [u8]),
}

/// Load and extract a PDF on disk
pub fn extract_document<P: AsRef<Path>>(
    path: P,
    config: &AuditConfig,
    ocr: Option<&dyn OcrEngine>,
) -> Result<ExtractedDocument, AuditError> {
    let start = Instant::now();
    let path = path.as_ref();
    let doc = load_document(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    extract_loaded(&doc, filename, Source::File(path), config, ocr, start)
}

/// Load and extract a PDF held in memory
pub fn extract_document_mem(
    filename: &str,
    buffer: &[u8],
    config: &AuditConfig,
    ocr: Option<&dyn OcrEngine>,
) -> Result<ExtractedDocument, AuditError> {
    let start = Instant::now();
    let doc = load_document_mem(buffer)?;
    extract_loaded(&doc, filename.to_string(), Source::Memory(buffer), config, ocr, start)
}

fn extract_loaded(
    doc: &Document,
    filename: String,
    source: Source<'_>,
    config: &AuditConfig,
    ocr: Option<&dyn OcrEngine>,
    start: Instant,
) -> Result<ExtractedDocument, AuditError> {
    let profiles = profile_pages(doc, &config.detection);
    let kind = DocumentKind::from_profiles(&profiles);
    let page_count = doc.get_pages().len();
    log::info!("{}: {} page(s), {}", filename, page_count, kind.as_str());

    let mut pages = extract_pages(doc, config.max_pages);
    let mut outcome = OcrOutcome::default();

    let candidates = ocr_candidates(&pages, &config.ocr);
    if !candidates.is_empty() {
        match ocr {
            Some(engine) => {
                outcome = match source {
                    Source::File(path) => {
                        apply_ocr_fallback(&mut pages, path, engine, &config.ocr)?
                    }
                    Source::Memory(bytes) => {
                        // OCR tools read from disk
                        let mut file = tempfile::Builder::new()
                            .prefix("opticloan-")
                            .suffix(".pdf")
                            .tempfile()?;
                        file.write_all(bytes)?;
                        file.flush()?;
                        apply_ocr_fallback(&mut pages, file.path(), engine, &config.ocr)?
                    }
                };
            }
            None if config.ocr.mode == OcrMode::Force => return Err(AuditError::OcrUnavailable),
            None => {
                let message = format!(
                    "{} page(s) have no usable text layer and no OCR engine is configured",
                    candidates.len()
                );
                log::warn!("{}", message);
                outcome.warnings.push(message);
            }
        }
    }

    if pages.len() < page_count {
        outcome.warnings.push(format!(
            "Only the first {} of {} pages were extracted",
            pages.len(),
            page_count
        ));
    }

    let extraction_ms = start.elapsed().as_millis() as u64;
    log::info!(
        "Extracted {} page(s) in {}ms ({} via OCR)",
        pages.len(),
        extraction_ms,
        outcome.ocr_pages.len()
    );

    Ok(ExtractedDocument {
        filename,
        title: document_title(doc),
        kind,
        profiles,
        pages,
        page_count,
        ocr: outcome,
        extraction_ms,
    })
}

/// Keyword hotspots of a PDF on disk, without OCR or a model
pub fn scan_file<P: AsRef<Path>>(path: P, config: &AuditConfig) -> Result<ScanReport, AuditError> {
    let document = extract_document(path, config, None)?;
    Ok(document.scan(&config.analysis.hotspot))
}

/// Runs audits with one model and OCR engine
pub struct Auditor<'a> {
    config: AuditConfig,
    model: &'a dyn GenerativeModel,
    ocr: Option<&'a dyn OcrEngine>,
}

impl<'a> Auditor<'a> {
    pub fn new(
        config: AuditConfig,
        model: &'a dyn GenerativeModel,
        ocr: Option<&'a dyn OcrEngine>,
    ) -> Self {
        Self { config, model, ocr }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    pub fn extract<P: AsRef<Path>>(&self, path: P) -> Result<ExtractedDocument, AuditError> {
        extract_document(path, &self.config, self.ocr)
    }

    /// Extraction settings for an audit run
    ///
    /// Strategies that send the PDF itself never read OCR text.
    fn audit_extraction(&self) -> Cow<'_, AuditConfig> {
        if self.config.analysis.strategy.needs_text() {
            return Cow::Borrowed(&self.config);
        }
        let mut config = self.config.clone();
        config.ocr.mode = OcrMode::Off;
        Cow::Owned(config)
    }

    pub fn audit_file<P: AsRef<Path>>(&self, path: P) -> Result<AuditReport, AuditError> {
        let start = Instant::now();
        let path = path.as_ref();
        let document = extract_document(path, &self.audit_extraction(), self.ocr)?;
        let pdf = if self.config.analysis.strategy.needs_text() {
            None
        } else {
            Some(std::fs::read(path)?)
        };
        self.analyze(&document, pdf.as_deref(), start)
    }

    pub fn audit_bytes(&self, filename: &str, buffer: &[u8]) -> Result<AuditReport, AuditError> {
        let start = Instant::now();
        let document = extract_document_mem(filename, buffer, &self.audit_extraction(), self.ocr)?;
        self.analyze(&document, Some(buffer), start)
    }

    /// Analyze an already extracted document
    pub fn analyze(
        &self,
        document: &ExtractedDocument,
        pdf: Option<&[u8]>,
        start: Instant,
    ) -> Result<AuditReport, AuditError> {
        let strategy = self.config.analysis.strategy;
        if strategy.needs_text() && !document.has_text() {
            let ocr_ready = self.ocr.map_or(false, |engine| engine.is_available());
            if document.kind == DocumentKind::Scanned && !ocr_ready {
                return Err(AuditError::OcrUnavailable);
            }
            return Err(AuditError::NoText);
        }

        let analysis_start = Instant::now();
        let analyzer = Analyzer::new(self.model, self.config.analysis.clone());
        let mut report = analyzer.analyze(&AnalysisInput {
            filename: &document.filename,
            title: document.title.as_deref(),
            pages: &document.pages,
            page_count: document.page_count,
            pdf,
        })?;
        let analysis_ms = analysis_start.elapsed().as_millis() as u64;

        let mut warnings = document.ocr.warnings.clone();
        warnings.append(&mut report.explainability.warnings);
        report.explainability.warnings = warnings;

        report.performance = Performance {
            extraction_ms: document.extraction_ms,
            analysis_ms,
            total_ms: start.elapsed().as_millis() as u64,
            pages: document.page_count,
            ocr_pages: document.ocr.ocr_pages.clone(),
        };

        log::info!(
            "Audit of {} finished in {}ms: score {} ({}), {} red flag(s)",
            document.filename,
            report.performance.total_ms,
            report.document_metadata.overall_trust_score,
            report.document_metadata.verdict,
            report.red_flags.len()
        );
        Ok(report)
    }
}
