//! Reasoning strategies over an extracted loan document
//!
//! All strategies end in the same post-processing step, so a report looks
//! the same whichever path produced it: the verdict is derived from the
//! final score, metadata is stamped locally, and page numbers the document
//! cannot have are dropped.

use crate::chunker::{chunk_text, ChunkConfig};
use crate::context::{assemble, ContextBudget};
use crate::extractor::{render_marked, PageText};
use crate::hotspot::{scan_pages, HotspotConfig};
use crate::llm::{parse_json_payload, GenerativeModel, LlmError};
use crate::merge::{merge_findings, MergedFindings};
use crate::prompt;
use crate::report::{
    AuditReport, ChunkFindings, DocumentMetadata, Explainability, Verdict,
};
use crate::AuditError;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::thread;
use std::time::Duration;

/// How the document is presented to the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// The whole marked text in one call
    SingleShot,
    /// Overlapping chunks, merged, then one synthesis call
    #[default]
    MapReduce,
    /// Only the lead page and keyword hotspots, in one call
    Hotspot,
    /// The original PDF attached to one call
    Document,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::SingleShot => "single-shot",
            Strategy::MapReduce => "map-reduce",
            Strategy::Hotspot => "hotspot",
            Strategy::Document => "document",
        }
    }

    /// Whether the strategy reads the extracted text
    pub fn needs_text(&self) -> bool {
        !matches!(self, Strategy::Document)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = AuditError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "single-shot" | "single" => Ok(Strategy::SingleShot),
            "map-reduce" | "chunked" => Ok(Strategy::MapReduce),
            "hotspot" | "hotspots" | "selective" => Ok(Strategy::Hotspot),
            "document" | "pdf" => Ok(Strategy::Document),
            other => Err(AuditError::Config(format!("unknown strategy '{}'", other))),
        }
    }
}

/// Analysis configuration
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub strategy: Strategy,
    pub chunk: ChunkConfig,
    pub hotspot: HotspotConfig,
    pub budget: ContextBudget,
    /// Pause between consecutive model calls
    pub pace: Duration,
    /// Whether map-reduce ends with a synthesis call
    pub synthesize: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            chunk: ChunkConfig::default(),
            hotspot: HotspotConfig::default(),
            budget: ContextBudget::default(),
            pace: Duration::from_secs(5),
            synthesize: true,
        }
    }
}

/// What the analyzer needs to know about a document
#[derive(Debug, Clone, Copy)]
pub struct AnalysisInput<'d> {
    pub filename: &'d str,
    pub title: Option<&'d str>,
    pub pages: &'d [PageText],
    /// Total pages in the document, which may exceed `pages.len()` when extraction was capped
    pub page_count: usize,
    /// The original PDF, for the document strategy
    pub pdf: Option<&'d [u8]>,
}

/// Merged findings plus bookkeeping, before post-processing
struct Analysis {
    merged: MergedFindings,
    chunks_analyzed: usize,
    chunks_failed: usize,
    warnings: Vec<String>,
    explain: Explainability,
}

impl Analysis {
    fn single(findings: ChunkFindings) -> Self {
        Self {
            merged: merge_findings(&[(0, findings)]),
            chunks_analyzed: 1,
            chunks_failed: 0,
            warnings: Vec::new(),
            explain: Explainability::default(),
        }
    }
}

pub struct Analyzer<'m> {
    model: &'m dyn GenerativeModel,
    config: AnalysisConfig,
}

impl<'m> Analyzer<'m> {
    pub fn new(model: &'m dyn GenerativeModel, config: AnalysisConfig) -> Self {
        Self { model, config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Run the configured strategy and post-process its findings
    pub fn analyze(&self, input: &AnalysisInput<'_>) -> Result<AuditReport, AuditError> {
        let strategy = self.config.strategy;
        log::info!(
            "Analyzing {} ({} pages) with {} strategy",
            input.filename,
            input.page_count,
            strategy
        );

        let analysis = match strategy {
            Strategy::SingleShot => self.single_shot(input)?,
            Strategy::MapReduce => self.map_reduce(input)?,
            Strategy::Hotspot => self.hotspot(input)?,
            Strategy::Document => self.document(input)?,
        };

        Ok(self.finalize(analysis, input))
    }

    fn single_shot(&self, input: &AnalysisInput<'_>) -> Result<Analysis, AuditError> {
        let text = marked_text(input.pages)?;
        let value = self.call(&prompt::audit_prompt(&text))?;
        Ok(Analysis::single(ChunkFindings::from_value(&value)))
    }

    fn map_reduce(&self, input: &AnalysisInput<'_>) -> Result<Analysis, AuditError> {
        let text = marked_text(input.pages)?;
        let chunks = chunk_text(&text, &self.config.chunk)?;
        log::info!("Split document into {} chunk(s)", chunks.len());

        let mut parts: Vec<(usize, ChunkFindings)> = Vec::with_capacity(chunks.len());
        let mut warnings = Vec::new();
        let mut last_error: Option<LlmError> = None;

        for chunk in &chunks {
            if chunk.index > 0 {
                self.pause();
            }
            log::debug!(
                "Analyzing chunk {} (chars {}..{}, starts on page {:?})",
                chunk.label(),
                chunk.start,
                chunk.end,
                chunk.first_page
            );

            match self.call(&prompt::chunk_prompt(chunk)) {
                Ok(value) => parts.push((chunk.index, ChunkFindings::from_value(&value))),
                Err(AuditError::Llm(e)) => {
                    let message = format!("Skipped chunk {}: {}", chunk.label(), e);
                    log::warn!("{}", message);
                    warnings.push(message);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if parts.is_empty() {
            let e = last_error.unwrap_or_else(|| LlmError::EmptyResponse("no chunks".into()));
            return Err(AuditError::Llm(e));
        }

        let mut merged = merge_findings(&parts);
        log::info!(
            "Merged {} chunk(s): {} red flag(s), {} fact conflict(s)",
            parts.len(),
            merged.red_flags.len(),
            merged.conflicts.len()
        );

        if self.config.synthesize {
            self.pause();
            let prompt =
                prompt::synthesis_prompt(&merged.facts, &merged.red_flags, input.page_count);
            match self.call(&prompt) {
                Ok(value) => apply_synthesis(&mut merged, &ChunkFindings::from_value(&value)),
                Err(AuditError::Llm(e)) => {
                    let message = format!("Synthesis failed, using local score: {}", e);
                    log::warn!("{}", message);
                    warnings.push(message);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Analysis {
            merged,
            chunks_analyzed: parts.len(),
            chunks_failed: chunks.len() - parts.len(),
            warnings,
            explain: Explainability::default(),
        })
    }

    fn hotspot(&self, input: &AnalysisInput<'_>) -> Result<Analysis, AuditError> {
        let scan = scan_pages(input.pages, &self.config.hotspot);
        let bundle = assemble(input.pages, &scan, &self.config.budget);
        if bundle.text.trim().is_empty() {
            return Err(AuditError::NoText);
        }
        log::info!(
            "Selected {} of {} page(s) for analysis ({} signals)",
            bundle.included_pages.len(),
            input.pages.len(),
            scan.total_signals
        );

        let value = self.call(&prompt::hotspot_prompt(&bundle, &scan))?;
        let mut analysis = Analysis::single(ChunkFindings::from_value(&value));
        analysis.explain.heuristic_signals = scan.signal_summaries();
        analysis.explain.missing_protections = scan.missing_protections.clone();
        if !bundle.omitted_pages.is_empty() {
            analysis.warnings.push(format!(
                "Hotspot pages {:?} did not fit the context budget",
                bundle.omitted_pages
            ));
        }
        Ok(analysis)
    }

    fn document(&self, input: &AnalysisInput<'_>) -> Result<Analysis, AuditError> {
        let pdf = input.pdf.ok_or_else(|| {
            AuditError::Config("the document strategy needs the original PDF bytes".into())
        })?;
        let raw = self.model.generate_with_pdf(&prompt::document_prompt(), pdf)?;
        let value = parse_json_payload(&raw)?;
        Ok(Analysis::single(ChunkFindings::from_value(&value)))
    }

    fn call(&self, prompt: &str) -> Result<Value, AuditError> {
        let raw = self.model.generate(prompt)?;
        Ok(parse_json_payload(&raw)?)
    }

    fn pause(&self) {
        if !self.config.pace.is_zero() {
            thread::sleep(self.config.pace);
        }
    }

    fn finalize(&self, analysis: Analysis, input: &AnalysisInput<'_>) -> AuditReport {
        let Analysis {
            merged,
            chunks_analyzed,
            chunks_failed,
            warnings,
            explain,
        } = analysis;

        let mut facts = merged.facts;
        if facts.loan_amount.is_some() && facts.currency.is_none() {
            facts.currency = Some("USD".to_string());
        }

        let page_count = input.page_count as u32;
        let mut red_flags = merged.red_flags;
        for flag in &mut red_flags {
            if let Some(page) = flag.page_number {
                if page == 0 || page > page_count {
                    log::debug!("Dropping out-of-range page {} from red flag", page);
                    flag.page_number = None;
                }
            }
        }

        let score = merged.trust_score.min(100);

        AuditReport {
            document_metadata: DocumentMetadata {
                filename: input.filename.to_string(),
                title: input.title.map(String::from),
                analysis_timestamp: chrono::Utc::now().to_rfc3339(),
                overall_trust_score: score,
                verdict: Verdict::from_score(score),
            },
            facts,
            red_flags,
            explainability: Explainability {
                model_confidence: merged.confidence.unwrap_or(0.0),
                clauses_analyzed: merged.clauses_analyzed,
                legal_precedents_referenced: merged.precedents,
                strategy: self.config.strategy.to_string(),
                model: self.model.name().to_string(),
                chunks_analyzed,
                chunks_failed,
                fact_conflicts: merged.conflicts,
                warnings,
                ..explain
            },
            performance: Default::default(),
        }
    }
}

/// Take score, confidence and precedents from the synthesis call
fn apply_synthesis(merged: &mut MergedFindings, synthesis: &ChunkFindings) {
    if let Some(score) = synthesis.trust_score {
        merged.trust_score = score;
        merged.score_from_model = true;
    }
    if synthesis.confidence.is_some() {
        merged.confidence = synthesis.confidence;
    }
    for precedent in &synthesis.precedents {
        if !merged
            .precedents
            .iter()
            .any(|p| p.eq_ignore_ascii_case(precedent))
        {
            merged.precedents.push(precedent.clone());
        }
    }
}

fn marked_text(pages: &[PageText]) -> Result<String, AuditError> {
    let text = render_marked(pages);
    if text.trim().is_empty() {
        return Err(AuditError::NoText);
    }
    Ok(text)
}
