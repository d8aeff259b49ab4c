//! CLI for auditing loan agreement PDFs

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use opticloan::chunker::ChunkConfig;
use opticloan::merge::severity_counts;
use opticloan::ocr::OcrConfig;
use opticloan::pipeline::extract_document;
use opticloan::{
    AnalysisConfig, AuditConfig, AuditError, AuditReport, Auditor, DocumentKind, ErrorReport,
    LlmConfig, LlmError, OcrMode, PageKind, Strategy, TesseractOcr,
};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "opticloan")]
#[command(version, about = "Audit loan agreements for predatory clauses")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a model-backed audit and print the report
    Audit(AuditArgs),
    /// List keyword hotspots without calling a model
    Scan {
        pdf: PathBuf,
        #[arg(long)]
        max_pages: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Print the extracted text with page markers
    Extract {
        pdf: PathBuf,
        #[arg(long)]
        max_pages: Option<usize>,
        #[arg(long, default_value = "auto")]
        ocr: OcrMode,
        /// Write the text to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Classify pages as text, image-only or blank
    Detect {
        pdf: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct AuditArgs {
    pdf: PathBuf,
    /// single-shot, map-reduce, hotspot or document
    #[arg(long, default_value = "map-reduce")]
    strategy: Strategy,
    #[arg(long)]
    max_pages: Option<usize>,
    #[arg(long, default_value = "auto")]
    ocr: OcrMode,
    /// Characters per chunk for map-reduce
    #[arg(long, default_value_t = 20_000)]
    chunk_size: usize,
    #[arg(long, default_value_t = 500)]
    chunk_overlap: usize,
    /// Seconds to wait between model calls
    #[arg(long, default_value_t = 5)]
    pace_secs: u64,
    /// Print the report as compact JSON
    #[arg(long)]
    json: bool,
    /// Print the report as indented JSON
    #[arg(long, conflicts_with = "json")]
    pretty: bool,
    /// Also write the JSON report to a file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl Command {
    fn wants_json(&self) -> bool {
        match self {
            Command::Audit(args) => args.json || args.pretty,
            Command::Scan { json, .. } | Command::Detect { json, .. } => *json,
            Command::Extract { .. } => false,
        }
    }
}

fn main() -> ExitCode {
    // a missing .env is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("opticloan=info")),
        )
        .init();

    let cli = Cli::parse();
    let json = cli.command.wants_json();

    match run(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let audit_error = e.downcast_ref::<AuditError>();
            let report = match audit_error {
                Some(err) => err.to_report(),
                None if e.downcast_ref::<LlmError>().is_some() => {
                    ErrorReport::new("AI Analysis failed", format!("{:#}", e))
                }
                None => ErrorReport::new("Audit failed", format!("{:#}", e)),
            };

            if json {
                match serde_json::to_string(&report) {
                    Ok(line) => println!("{}", line),
                    Err(_) => eprintln!("Error: {:#}", e),
                }
            } else {
                eprintln!("{}: {:#}", report.error, e);
            }

            if matches!(audit_error, Some(AuditError::OcrUnavailable)) {
                ExitCode::from(2)
            } else {
                ExitCode::from(1)
            }
        }
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Audit(args) => audit(args),
        Command::Scan {
            pdf,
            max_pages,
            json,
        } => scan(pdf, max_pages, json),
        Command::Extract {
            pdf,
            max_pages,
            ocr,
            output,
        } => extract(pdf, max_pages, ocr, output),
        Command::Detect { pdf, json } => detect(pdf, json),
    }
}

fn audit(args: AuditArgs) -> Result<()> {
    let chunk = ChunkConfig {
        size: args.chunk_size,
        overlap: args.chunk_overlap,
    };
    chunk.validate()?;

    let config = AuditConfig {
        ocr: OcrConfig {
            mode: args.ocr,
            ..OcrConfig::default()
        },
        max_pages: args.max_pages,
        analysis: AnalysisConfig {
            strategy: args.strategy,
            chunk,
            pace: Duration::from_secs(args.pace_secs),
            ..AnalysisConfig::default()
        },
        ..AuditConfig::default()
    };

    let llm = LlmConfig::from_env()?;
    let model = llm.build_chain()?;
    let ocr = TesseractOcr::default();

    let report = Auditor::new(config, &model, Some(&ocr)).audit_file(&args.pdf)?;

    if let Some(path) = &args.output {
        let body = serde_json::to_string_pretty(&report)?;
        fs::write(path, body).with_context(|| format!("writing {}", path.display()))?;
        log::info!("Report written to {}", path.display());
    }

    if args.pretty {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if args.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &AuditReport) {
    let meta = &report.document_metadata;
    println!("Loan Audit Report");
    println!("=================");
    println!("File: {}", meta.filename);
    if let Some(title) = &meta.title {
        println!("Title: {}", title);
    }
    println!(
        "Verdict: {} (trust score {}/100)",
        meta.verdict, meta.overall_trust_score
    );
    println!();

    let facts = &report.facts;
    println!("Facts:");
    if let Some(name) = &facts.borrower_name {
        println!("  Borrower: {}", name);
    }
    if let Some(amount) = facts.loan_amount {
        println!(
            "  Amount: {:.2} {}",
            amount,
            facts.currency.as_deref().unwrap_or("")
        );
    }
    if let Some(apr) = facts.interest_rate_apr {
        println!("  APR: {}%", apr);
    }
    if let Some(term) = facts.term_months {
        println!("  Term: {} months", term);
    }
    if let Some(maturity) = &facts.maturity_date {
        println!("  Maturity: {}", maturity);
    }
    for (key, value) in &facts.other {
        println!("  {}: {}", key, value);
    }
    println!();

    let counts = severity_counts(&report.red_flags)
        .iter()
        .map(|(severity, n)| format!("{} {}", n, severity))
        .collect::<Vec<_>>()
        .join(", ");
    println!("Red flags: {} ({})", report.red_flags.len(), counts);
    for flag in &report.red_flags {
        let page = flag
            .page_number
            .map(|p| format!("p.{}", p))
            .unwrap_or_else(|| "p.?".to_string());
        println!("  [{}] {} ({})", flag.severity, flag.category, page);
        println!("      \"{}\"", flag.text_found);
        if !flag.reasoning.is_empty() {
            println!("      {}", flag.reasoning);
        }
    }

    let explain = &report.explainability;
    if !explain.fact_conflicts.is_empty() {
        println!();
        println!("Conflicting facts:");
        for conflict in &explain.fact_conflicts {
            println!(
                "  {}: kept {}, chunk {} said {}",
                conflict.field,
                conflict.kept,
                conflict.chunk + 1,
                conflict.rejected
            );
        }
    }
    if !explain.missing_protections.is_empty() {
        println!();
        println!("Missing protections: {}", explain.missing_protections.join(", "));
    }
    for warning in &explain.warnings {
        println!("Warning: {}", warning);
    }

    println!();
    println!(
        "Model: {} ({}), confidence {:.0}%",
        explain.model,
        explain.strategy,
        explain.model_confidence * 100.0
    );
    println!(
        "Time: {}ms total ({}ms extraction, {}ms analysis)",
        report.performance.total_ms,
        report.performance.extraction_ms,
        report.performance.analysis_ms
    );
}

fn scan(pdf: PathBuf, max_pages: Option<usize>, json: bool) -> Result<()> {
    let config = AuditConfig {
        max_pages,
        ..AuditConfig::default()
    };
    let start = Instant::now();
    let document = extract_document(&pdf, &config, None)?;
    let scan = document.scan(&config.analysis.hotspot);

    if json {
        let hotspots: Vec<serde_json::Value> = scan
            .hotspots
            .iter()
            .map(|h| {
                serde_json::json!({
                    "page": h.page,
                    "score": h.score,
                    "categories": h.categories.iter().map(|c| c.name()).collect::<Vec<_>>(),
                    "signals": h.signals.iter().map(|s| &s.phrase).collect::<Vec<_>>(),
                })
            })
            .collect();
        let out = serde_json::json!({
            "filename": document.filename,
            "pages_scanned": scan.pages_scanned,
            "total_signals": scan.total_signals,
            "hotspots": hotspots,
            "missing_protections": scan.missing_protections,
            "scan_time_ms": start.elapsed().as_millis() as u64,
        });
        println!("{}", out);
        return Ok(());
    }

    println!("Hotspot Scan");
    println!("============");
    println!("File: {}", document.filename);
    println!(
        "Pages scanned: {}, signals: {}",
        scan.pages_scanned, scan.total_signals
    );
    println!();
    if scan.hotspots.is_empty() {
        println!("No hotspots found.");
    }
    for hotspot in &scan.hotspots {
        let categories: Vec<&str> = hotspot.categories.iter().map(|c| c.name()).collect();
        println!(
            "Page {:>4}  score {:>3}  {}",
            hotspot.page,
            hotspot.score,
            categories.join(", ")
        );
        for signal in &hotspot.signals {
            println!("            \"{}\"", signal.phrase);
        }
    }
    if !scan.missing_protections.is_empty() {
        println!();
        println!("Missing protections: {}", scan.missing_protections.join(", "));
    }
    Ok(())
}

fn extract(
    pdf: PathBuf,
    max_pages: Option<usize>,
    ocr: OcrMode,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = AuditConfig {
        ocr: OcrConfig {
            mode: ocr,
            ..OcrConfig::default()
        },
        max_pages,
        ..AuditConfig::default()
    };
    let engine = TesseractOcr::default();
    let document = extract_document(&pdf, &config, Some(&engine))?;

    if !document.has_text() {
        if document.kind == DocumentKind::Scanned && document.ocr.ocr_pages.is_empty() {
            return Err(AuditError::OcrUnavailable.into());
        }
        return Err(AuditError::NoText.into());
    }

    let text = document.marked_text();
    match output {
        Some(path) => {
            fs::write(&path, &text).with_context(|| format!("writing {}", path.display()))?;
            eprintln!(
                "Wrote {} characters from {} page(s) to {}",
                text.chars().count(),
                document.pages.len(),
                path.display()
            );
        }
        None => print!("{}", text),
    }
    Ok(())
}

fn detect(pdf: PathBuf, json: bool) -> Result<()> {
    let start = Instant::now();
    let doc = opticloan::load_document(&pdf)?;
    let profiles = opticloan::profile_pages(&doc, &Default::default());
    let kind = DocumentKind::from_profiles(&profiles);
    let title = opticloan::detector::document_title(&doc);

    if json {
        let out = serde_json::json!({
            "document_kind": kind.as_str(),
            "page_count": profiles.len(),
            "title": title,
            "pages": profiles,
            "detection_time_ms": start.elapsed().as_millis() as u64,
        });
        println!("{}", out);
        return Ok(());
    }

    let count = |k: PageKind| profiles.iter().filter(|p| p.kind == k).count();
    println!("PDF Type Detection Results");
    println!("==========================");
    println!("File: {}", pdf.display());
    if let Some(title) = &title {
        println!("Title: {}", title);
    }
    println!();
    println!(
        "Type: {}",
        match kind {
            DocumentKind::TextBased => "TEXT-BASED (extractable text)",
            DocumentKind::Scanned => "SCANNED (OCR needed)",
            DocumentKind::Mixed => "MIXED (some text, some images)",
        }
    );
    println!("Page count: {}", profiles.len());
    println!("Text pages: {}", count(PageKind::Text));
    println!("Image-only pages: {}", count(PageKind::ImageOnly));
    println!("Blank pages: {}", count(PageKind::Blank));
    println!("Detection time: {:?}", start.elapsed());
    Ok(())
}
