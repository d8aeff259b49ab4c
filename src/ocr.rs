//! OCR fallback for image-only pages
//!
//! Pages whose text layer is empty or nearly empty are rendered to an image
//! and run through an OCR engine. The default engine shells out to Poppler's
//! `pdftoppm` and to `tesseract`, one page at a time.

use crate::extractor::{non_whitespace_char_count, PageSource, PageText};
use crate::AuditError;
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

/// When to run OCR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrMode {
    /// Never run OCR
    Off,
    /// OCR pages whose text layer is too sparse
    #[default]
    Auto,
    /// OCR every page
    Force,
}

impl OcrMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrMode::Off => "off",
            OcrMode::Auto => "auto",
            OcrMode::Force => "force",
        }
    }
}

impl FromStr for OcrMode {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(OcrMode::Off),
            "auto" => Ok(OcrMode::Auto),
            "force" | "always" => Ok(OcrMode::Force),
            other => Err(AuditError::Config(format!("unknown OCR mode '{}'", other))),
        }
    }
}

/// OCR fallback configuration
#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub mode: OcrMode,
    /// Pages with fewer non-whitespace chars than this are OCR candidates in auto mode
    pub min_text_chars: usize,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            mode: OcrMode::Auto,
            min_text_chars: 25,
        }
    }
}

/// An engine that recognizes the text of a single PDF page
pub trait OcrEngine: Send + Sync {
    /// Recognize the text of `page` (1-indexed) of the PDF at `pdf_path`
    fn recognize_page(&self, pdf_path: &Path, page: u32) -> Result<String, AuditError>;

    /// Whether the engine can run in this environment
    fn is_available(&self) -> bool {
        true
    }
}

/// Tesseract OCR over pages rendered by `pdftoppm`
#[derive(Debug, Clone)]
pub struct TesseractOcr {
    /// Rendering resolution
    pub dpi: u32,
    /// Tesseract language code
    pub lang: String,
    pub pdftoppm: PathBuf,
    pub tesseract: PathBuf,
}

impl Default for TesseractOcr {
    fn default() -> Self {
        Self {
            dpi: 300,
            lang: "eng".to_string(),
            pdftoppm: PathBuf::from("pdftoppm"),
            tesseract: PathBuf::from("tesseract"),
        }
    }
}

impl TesseractOcr {
    fn render_page(&self, pdf_path: &Path, page: u32, dir: &Path) -> Result<PathBuf, AuditError> {
        let prefix = dir.join(format!("page-{}", page));
        let page_arg = page.to_string();

        let output = Command::new(&self.pdftoppm)
            .args(["-f", &page_arg, "-l", &page_arg])
            .args(["-r", &self.dpi.to_string()])
            .args(["-png", "-singlefile"])
            .arg(pdf_path)
            .arg(&prefix)
            .output()
            .map_err(|e| AuditError::Ocr(format!("failed to run pdftoppm: {}", e)))?;

        if !output.status.success() {
            return Err(AuditError::Ocr(format!(
                "pdftoppm failed on page {}: {}",
                page,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let image = prefix.with_extension("png");
        if !image.exists() {
            return Err(AuditError::Ocr(format!(
                "pdftoppm produced no image for page {}",
                page
            )));
        }
        Ok(image)
    }
}

impl OcrEngine for TesseractOcr {
    fn recognize_page(&self, pdf_path: &Path, page: u32) -> Result<String, AuditError> {
        let dir = tempfile::tempdir()?;
        let image = self.render_page(pdf_path, page, dir.path())?;

        let output = Command::new(&self.tesseract)
            .arg(&image)
            .arg("stdout")
            .args(["-l", &self.lang])
            .output()
            .map_err(|e| AuditError::Ocr(format!("failed to run tesseract: {}", e)))?;

        if !output.status.success() {
            return Err(AuditError::Ocr(format!(
                "tesseract failed on page {}: {}",
                page,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn is_available(&self) -> bool {
        command_available(&self.pdftoppm) && command_available(&self.tesseract)
    }
}

fn command_available(program: &Path) -> bool {
    Command::new(program)
        .arg("-v")
        .output()
        .map(|_| true)
        .unwrap_or(false)
}

/// Summary of an OCR fallback pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct OcrOutcome {
    /// Pages whose text was replaced by OCR output
    pub ocr_pages: Vec<u32>,
    /// Non-fatal problems, one line each
    pub warnings: Vec<String>,
}

/// Pages that should be sent through OCR under `config`
pub fn ocr_candidates(pages: &[PageText], config: &OcrConfig) -> Vec<u32> {
    match config.mode {
        OcrMode::Off => Vec::new(),
        OcrMode::Force => pages.iter().map(|p| p.number).collect(),
        OcrMode::Auto => pages
            .iter()
            .filter(|p| p.is_sparse(config.min_text_chars))
            .map(|p| p.number)
            .collect(),
    }
}

/// Replace sparse pages with OCR output
///
/// In auto mode every OCR problem is downgraded to a warning and the text
/// layer is kept. In force mode any failure aborts.
pub fn apply_ocr_fallback(
    pages: &mut [PageText],
    pdf_path: &Path,
    engine: &dyn OcrEngine,
    config: &OcrConfig,
) -> Result<OcrOutcome, AuditError> {
    let mut outcome = OcrOutcome::default();
    let candidates = ocr_candidates(pages, config);
    if candidates.is_empty() {
        return Ok(outcome);
    }

    if !engine.is_available() {
        if config.mode == OcrMode::Force {
            return Err(AuditError::OcrUnavailable);
        }
        let message = format!(
            "OCR requested for {} page(s) but no OCR engine is available",
            candidates.len()
        );
        log::warn!("{}", message);
        outcome.warnings.push(message);
        return Ok(outcome);
    }

    log::info!("Running OCR on {} page(s)", candidates.len());

    let results: Vec<(u32, Result<String, AuditError>)> = candidates
        .par_iter()
        .map(|&page| (page, engine.recognize_page(pdf_path, page)))
        .collect();

    for (page_num, result) in results {
        let Some(page) = pages.iter_mut().find(|p| p.number == page_num) else {
            continue;
        };

        match result {
            Ok(text) if non_whitespace_char_count(&text) > 0 => {
                page.text = text.trim_end().to_string();
                page.source = PageSource::Ocr;
                outcome.ocr_pages.push(page_num);
            }
            Ok(_) => {
                let message = format!("OCR text was empty for page {}", page_num);
                if config.mode == OcrMode::Force {
                    return Err(AuditError::Ocr(message));
                }
                log::warn!("{}", message);
                outcome.warnings.push(message);
            }
            Err(e) => {
                if config.mode == OcrMode::Force {
                    return Err(e);
                }
                let message = format!("OCR fallback failed for page {}: {}", page_num, e);
                log::warn!("{}", message);
                outcome.warnings.push(message);
            }
        }
    }

    outcome.ocr_pages.sort_unstable();
    Ok(outcome)
}
