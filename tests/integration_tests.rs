//! Integration tests for the opticloan library

use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, Stream};
use opticloan::llm::LlmError;
use opticloan::ocr::{OcrConfig, OcrEngine};
use opticloan::pipeline::{extract_document, extract_document_mem};
use opticloan::report::{ChunkFindings, ErrorReport};
use opticloan::{
    scan_file, AnalysisConfig, AuditConfig, AuditError, Auditor, DocumentKind, GenerativeModel,
    OcrMode, PageKind, PageSource, Severity, Strategy, Verdict,
};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

enum PageSpec<'a> {
    Text(&'a [&'a str]),
    Image,
}

/// Build a PDF with one Courier text line per string, or a full-page image
fn build_pdf(pages: &[PageSpec<'_>]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let image_id = doc.add_object(Stream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Image",
            "Width" => 1,
            "Height" => 1,
            "ColorSpace" => "DeviceGray",
            "BitsPerComponent" => 8,
        },
        vec![0u8],
    ));

    let mut kids: Vec<Object> = Vec::new();
    for spec in pages {
        let (operations, resources) = match spec {
            PageSpec::Text(lines) => {
                let mut ops = vec![
                    Operation::new("BT", vec![]),
                    Operation::new("Tf", vec!["F1".into(), 12.into()]),
                    Operation::new("Td", vec![72.into(), 720.into()]),
                ];
                for line in lines.iter() {
                    ops.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
                    ops.push(Operation::new("Td", vec![0.into(), (-16).into()]));
                }
                ops.push(Operation::new("ET", vec![]));
                (ops, dictionary! { "Font" => dictionary! { "F1" => font_id } })
            }
            PageSpec::Image => (
                vec![
                    Operation::new("q", vec![]),
                    Operation::new(
                        "cm",
                        vec![612.into(), 0.into(), 0.into(), 792.into(), 0.into(), 0.into()],
                    ),
                    Operation::new("Do", vec!["Im1".into()]),
                    Operation::new("Q", vec![]),
                ],
                dictionary! { "XObject" => dictionary! { "Im1" => image_id } },
            ),
        };

        let content = Content { operations };
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    let info_id = doc.add_object(dictionary! {
        "Title" => Object::string_literal("Home Loan Agreement"),
    });
    doc.trailer.set("Root", catalog_id);
    doc.trailer.set("Info", info_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer).unwrap();
    buffer
}

const COVER: &[&str] = &[
    "HOME LOAN AGREEMENT",
    "Borrower: Jane Doe",
    "Principal amount: $250,000.00",
    "Annual percentage rate: 8.75%",
];

const TERMS: &[&str] = &[
    "4. Prepayment",
    "If the Borrower repays early, a prepayment penalty of 5% of the",
    "outstanding balance is due together with a yield maintenance charge.",
];

const DEFAULT_TERMS: &[&str] = &[
    "9. Default",
    "Upon an Event of Default all sums become immediately due and payable.",
    "The Lender may accelerate if it deems itself insecure.",
];

fn loan_pdf() -> Vec<u8> {
    build_pdf(&[
        PageSpec::Text(COVER),
        PageSpec::Text(TERMS),
        PageSpec::Text(DEFAULT_TERMS),
    ])
}

fn write_temp_pdf(bytes: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".pdf").tempfile().unwrap();
    file.write_all(bytes).unwrap();
    file.flush().unwrap();
    file
}

/// Replies with a fixed answer and records each request
struct FakeModel {
    reply: Result<String, String>,
    requests: Mutex<Vec<(String, Option<usize>)>>,
}

impl FakeModel {
    fn replying(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn requests(&self) -> Vec<(String, Option<usize>)> {
        self.requests.lock().unwrap().clone()
    }

    fn answer(&self) -> Result<String, LlmError> {
        self.reply.clone().map_err(LlmError::Auth)
    }
}

impl GenerativeModel for FakeModel {
    fn name(&self) -> &str {
        "fake-gemini"
    }

    fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.requests.lock().unwrap().push((prompt.to_string(), None));
        self.answer()
    }

    fn generate_with_pdf(&self, prompt: &str, pdf: &[u8]) -> Result<String, LlmError> {
        assert!(pdf.starts_with(b"%PDF"));
        self.requests
            .lock()
            .unwrap()
            .push((prompt.to_string(), Some(pdf.len())));
        self.answer()
    }
}

/// Returns fixed text for every page and checks the PDF is on disk
struct FakeOcr {
    text: String,
    calls: Mutex<Vec<u32>>,
}

impl FakeOcr {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl OcrEngine for FakeOcr {
    fn recognize_page(&self, pdf_path: &Path, page: u32) -> Result<String, AuditError> {
        assert!(pdf_path.exists(), "OCR input should exist on disk");
        self.calls.lock().unwrap().push(page);
        Ok(self.text.clone())
    }
}

const MODEL_REPORT: &str = r#"```json
{
  "document_metadata": {"overall_trust_score": 35, "verdict": "Safe"},
  "facts": {
    "borrower_name": "Jane Doe",
    "loan_amount": 250000,
    "interest_rate_apr": 8.75,
    "term_months": null
  },
  "red_flags": [
    {"severity": "High", "category": "Prepayment Penalty",
     "text_found": "a prepayment penalty of 5% of the", "page_number": 2,
     "reasoning": "Penalizes early payoff."},
    {"severity": "Medium", "category": "Draconian Default",
     "text_found": "all sums become immediately due and payable", "page_number": 3,
     "reasoning": "Acceleration on any default."}
  ],
  "explainability_data": {"model_confidence": 0.8, "clauses_analyzed": 9,
                          "legal_precedents_referenced": ["Truth in Lending Act"]}
}
```"#;

fn fast_config(strategy: Strategy) -> AuditConfig {
    AuditConfig {
        analysis: AnalysisConfig {
            strategy,
            pace: Duration::ZERO,
            ..AnalysisConfig::default()
        },
        ..AuditConfig::default()
    }
}

// ============================================================================
// Detection Tests
// ============================================================================

#[test]
fn test_detect_text_based_pdf() {
    let doc = opticloan::extractor::load_document_mem(&loan_pdf()).unwrap();
    let profiles = opticloan::profile_pages(&doc, &Default::default());
    assert_eq!(profiles.len(), 3);
    assert!(profiles.iter().all(|p| p.kind == PageKind::Text));
    assert_eq!(DocumentKind::from_profiles(&profiles), DocumentKind::TextBased);
}

#[test]
fn test_detect_scanned_and_mixed_pdf() {
    let scanned = build_pdf(&[PageSpec::Image, PageSpec::Image]);
    let doc = opticloan::extractor::load_document_mem(&scanned).unwrap();
    let profiles = opticloan::profile_pages(&doc, &Default::default());
    assert!(profiles.iter().all(|p| p.kind == PageKind::ImageOnly));
    assert_eq!(DocumentKind::from_profiles(&profiles), DocumentKind::Scanned);

    let mixed = build_pdf(&[PageSpec::Text(COVER), PageSpec::Image]);
    let doc = opticloan::extractor::load_document_mem(&mixed).unwrap();
    let profiles = opticloan::profile_pages(&doc, &Default::default());
    assert_eq!(DocumentKind::from_profiles(&profiles), DocumentKind::Mixed);
    assert_eq!(profiles[1].page, 2);
    assert!(profiles[1].has_images);
}

#[test]
fn test_invalid_pdf_is_rejected() {
    let result = opticloan::extractor::load_document_mem(b"definitely not a pdf");
    assert!(matches!(result, Err(AuditError::Parse(_))));
}

// ============================================================================
// Extraction Tests
// ============================================================================

#[test]
fn test_extract_text_with_page_markers() {
    let file = write_temp_pdf(&loan_pdf());
    let document = extract_document(file.path(), &AuditConfig::default(), None).unwrap();

    assert_eq!(document.page_count, 3);
    assert_eq!(document.title.as_deref(), Some("Home Loan Agreement"));
    assert!(document.has_text());
    assert!(document.ocr.warnings.is_empty());

    let first = &document.pages[0];
    assert_eq!(first.source, PageSource::TextLayer);
    assert_eq!(first.text.lines().next(), Some("HOME LOAN AGREEMENT"));
    assert!(first.text.contains("Principal amount: $250,000.00"));

    let marked = document.marked_text();
    assert!(marked.starts_with("--- Page 1 ---\nHOME LOAN AGREEMENT"));
    assert!(marked.contains("--- Page 3 ---\n9. Default"));
}

#[test]
fn test_extract_respects_max_pages() {
    let config = AuditConfig {
        max_pages: Some(2),
        ..AuditConfig::default()
    };
    let document = extract_document_mem("loan.pdf", &loan_pdf(), &config, None).unwrap();
    assert_eq!(document.pages.len(), 2);
    assert_eq!(document.page_count, 3);
    assert!(document
        .ocr
        .warnings
        .iter()
        .any(|w| w.contains("first 2 of 3")));
}

#[test]
fn test_ocr_fallback_fills_image_pages() {
    let pdf = build_pdf(&[PageSpec::Text(COVER), PageSpec::Image]);
    let ocr = FakeOcr::new("Late charges of 10% apply. No grace period is provided.");
    let document =
        extract_document_mem("mixed.pdf", &pdf, &AuditConfig::default(), Some(&ocr)).unwrap();

    assert_eq!(*ocr.calls.lock().unwrap(), vec![2]);
    assert_eq!(document.ocr.ocr_pages, vec![2]);
    assert_eq!(document.pages[1].source, PageSource::Ocr);
    assert!(document.pages[1].text.contains("Late charges"));
    assert_eq!(document.pages[0].source, PageSource::TextLayer);
}

#[test]
fn test_ocr_off_leaves_pages_alone() {
    let pdf = build_pdf(&[PageSpec::Text(COVER), PageSpec::Image]);
    let ocr = FakeOcr::new("should not be used");
    let config = AuditConfig {
        ocr: OcrConfig {
            mode: OcrMode::Off,
            ..OcrConfig::default()
        },
        ..AuditConfig::default()
    };
    let document = extract_document_mem("mixed.pdf", &pdf, &config, Some(&ocr)).unwrap();
    assert!(ocr.calls.lock().unwrap().is_empty());
    assert!(document.pages[1].text.is_empty());
}

#[test]
fn test_force_ocr_without_engine_fails() {
    let config = AuditConfig {
        ocr: OcrConfig {
            mode: OcrMode::Force,
            ..OcrConfig::default()
        },
        ..AuditConfig::default()
    };
    let result = extract_document_mem("loan.pdf", &loan_pdf(), &config, None);
    assert!(matches!(result, Err(AuditError::OcrUnavailable)));
}

// ============================================================================
// Hotspot Scan Tests
// ============================================================================

#[test]
fn test_scan_file_finds_risky_pages() {
    let file = write_temp_pdf(&loan_pdf());
    let scan = scan_file(file.path(), &AuditConfig::default()).unwrap();

    assert_eq!(scan.pages_scanned, 3);
    let pages: Vec<u32> = scan.hotspots.iter().map(|h| h.page).collect();
    assert!(pages.contains(&2));
    assert!(pages.contains(&3));
    assert!(!pages.contains(&1));
    assert!(scan.missing_protections.contains(&"Grace Period".to_string()));
}

// ============================================================================
// Audit Tests
// ============================================================================

#[test]
fn test_single_shot_audit_of_file() {
    let file = write_temp_pdf(&loan_pdf());
    let model = FakeModel::replying(MODEL_REPORT);
    let auditor = Auditor::new(fast_config(Strategy::SingleShot), &model, None);

    let report = auditor.audit_file(file.path()).unwrap();

    let meta = &report.document_metadata;
    assert!(meta.filename.ends_with(".pdf"));
    assert_eq!(meta.title.as_deref(), Some("Home Loan Agreement"));
    assert_eq!(meta.overall_trust_score, 35);
    assert_eq!(meta.verdict, Verdict::HighRisk);

    assert_eq!(report.facts.borrower_name.as_deref(), Some("Jane Doe"));
    assert_eq!(report.facts.loan_amount, Some(250_000.0));
    assert_eq!(report.facts.currency.as_deref(), Some("USD"));
    assert_eq!(report.facts.term_months, None);

    assert_eq!(report.red_flags.len(), 2);
    assert_eq!(report.red_flags[0].severity, Severity::High);
    assert_eq!(report.red_flags[0].page_number, Some(2));

    assert_eq!(report.explainability.model, "fake-gemini");
    assert_eq!(report.explainability.clauses_analyzed, Some(9));
    assert_eq!(report.performance.pages, 3);
    assert!(report.performance.ocr_pages.is_empty());

    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].0.contains("--- Page 2 ---"));
    assert!(requests[0].0.contains("prepayment penalty of 5%"));
}

#[test]
fn test_map_reduce_audit_with_local_score() {
    let chunk_reply = r#"{"facts": {"borrower_name": "Jane Doe"},
        "red_flags": [{"severity": "High", "category": "Prepayment Penalty",
                       "text_found": "prepayment penalty of 5%", "reasoning": "Fee"}]}"#;
    // the synthesis call gets the same reply, which carries no score
    let model = FakeModel::replying(chunk_reply);
    let auditor = Auditor::new(fast_config(Strategy::MapReduce), &model, None);

    let report = auditor.audit_bytes("loan.pdf", &loan_pdf()).unwrap();

    assert_eq!(model.requests().len(), 2);
    assert_eq!(report.explainability.chunks_analyzed, 1);
    assert_eq!(report.explainability.chunks_failed, 0);
    assert_eq!(report.document_metadata.overall_trust_score, 75);
    assert_eq!(report.document_metadata.verdict, Verdict::Caution);
    assert_eq!(report.document_metadata.filename, "loan.pdf");
}

#[test]
fn test_document_strategy_uploads_pdf() {
    let pdf = build_pdf(&[PageSpec::Image]);
    let model = FakeModel::replying(MODEL_REPORT);
    let auditor = Auditor::new(fast_config(Strategy::Document), &model, None);

    let report = auditor.audit_bytes("scan.pdf", &pdf).unwrap();

    let requests = model.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1, Some(pdf.len()));
    // page 2 and 3 do not exist in a one-page document
    assert!(report.red_flags.iter().all(|f| f.page_number.is_none()));
    assert_eq!(report.explainability.strategy, "document");
}

#[test]
fn test_document_strategy_skips_ocr() {
    let pdf = build_pdf(&[PageSpec::Text(COVER), PageSpec::Image]);
    let model = FakeModel::replying(MODEL_REPORT);
    let ocr = FakeOcr::new("Late charges of 10% apply.");
    let auditor = Auditor::new(fast_config(Strategy::Document), &model, Some(&ocr));

    let report = auditor.audit_bytes("mixed.pdf", &pdf).unwrap();

    assert!(ocr.calls.lock().unwrap().is_empty());
    assert!(report.performance.ocr_pages.is_empty());
    assert!(report
        .explainability
        .warnings
        .iter()
        .all(|w| !w.contains("OCR")));
    assert_eq!(model.requests().len(), 1);
}

#[test]
fn test_document_strategy_ignores_forced_ocr() {
    let pdf = build_pdf(&[PageSpec::Image]);
    let model = FakeModel::replying(MODEL_REPORT);
    let mut config = fast_config(Strategy::Document);
    config.ocr.mode = OcrMode::Force;
    let auditor = Auditor::new(config, &model, None);

    let report = auditor.audit_bytes("scan.pdf", &pdf).unwrap();
    assert_eq!(report.document_metadata.overall_trust_score, 35);
    assert_eq!(model.requests()[0].1, Some(pdf.len()));

    // text strategies still need the engine
    let mut config = fast_config(Strategy::SingleShot);
    config.ocr.mode = OcrMode::Force;
    let auditor = Auditor::new(config, &model, None);
    assert!(matches!(
        auditor.audit_bytes("scan.pdf", &pdf),
        Err(AuditError::OcrUnavailable)
    ));
}

#[test]
fn test_scanned_pdf_without_ocr_is_reported() {
    let pdf = build_pdf(&[PageSpec::Image]);
    let model = FakeModel::replying(MODEL_REPORT);
    let auditor = Auditor::new(fast_config(Strategy::SingleShot), &model, None);

    let result = auditor.audit_bytes("scan.pdf", &pdf);
    assert!(matches!(result, Err(AuditError::OcrUnavailable)));
    assert!(model.requests().is_empty());
}

#[test]
fn test_model_failure_surfaces_as_analysis_error() {
    let model = FakeModel::failing("API key not valid");
    let auditor = Auditor::new(fast_config(Strategy::SingleShot), &model, None);

    let err = auditor.audit_bytes("loan.pdf", &loan_pdf()).unwrap_err();
    assert!(matches!(err, AuditError::Llm(LlmError::Auth(_))));

    let report = err.to_report();
    assert_eq!(report.error, "AI Analysis failed");
    assert!(report.details.contains("API key not valid"));
}

#[test]
fn test_ocr_warnings_reach_the_report() {
    let pdf = build_pdf(&[
        PageSpec::Text(COVER),
        PageSpec::Text(TERMS),
        PageSpec::Image,
    ]);
    let model = FakeModel::replying(MODEL_REPORT);
    let auditor = Auditor::new(fast_config(Strategy::SingleShot), &model, None);

    let report = auditor.audit_bytes("mixed.pdf", &pdf).unwrap();
    assert!(report
        .explainability
        .warnings
        .iter()
        .any(|w| w.contains("no OCR engine")));
}

// ============================================================================
// Report Shape Tests
// ============================================================================

#[test]
fn test_report_json_shape() {
    let model = FakeModel::replying(MODEL_REPORT);
    let auditor = Auditor::new(fast_config(Strategy::SingleShot), &model, None);
    let report = auditor.audit_bytes("loan.pdf", &loan_pdf()).unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["document_metadata"]["verdict"], "High Risk");
    assert_eq!(json["document_metadata"]["filename"], "loan.pdf");
    assert_eq!(json["facts"]["currency"], "USD");
    assert_eq!(json["red_flags"][0]["severity"], "High");
    assert_eq!(json["explainability"]["strategy"], "single-shot");
    assert_eq!(json["performance"]["pages"], 3);

    let back: opticloan::AuditReport = serde_json::from_value(json).unwrap();
    assert_eq!(back.red_flags, report.red_flags);
}

#[test]
fn test_error_report_shape() {
    let report = AuditError::NoText.to_report();
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["error"], "OCR Digitization failed");
    assert!(json["details"].as_str().unwrap().contains("No text"));

    let direct = ErrorReport::new("AI Analysis failed", "quota");
    assert_eq!(
        serde_json::to_string(&direct).unwrap(),
        r#"{"error":"AI Analysis failed","details":"quota"}"#
    );
}

#[test]
fn test_chunk_findings_tolerate_loose_output() {
    let value = serde_json::json!({
        "facts": {"Loan Amount": "$12,500", "Term": "3 years"},
        "red_flags": [{"level": "CRITICAL", "type": "Balloon Payment", "quote": "final balloon payment"}],
        "explainability": {"confidence": "90%"}
    });
    let findings = ChunkFindings::from_value(&value);
    assert_eq!(findings.facts.loan_amount, Some(12_500.0));
    assert_eq!(findings.facts.term_months, Some(36));
    assert_eq!(findings.red_flags[0].severity, Severity::High);
    assert_eq!(findings.red_flags[0].category, "Balloon Payment");
    assert_eq!(findings.confidence, Some(0.9));
}
