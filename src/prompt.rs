//! Prompt templates for the legal-auditor model calls

use crate::chunker::Chunk;
use crate::context::ContextBundle;
use crate::hotspot::ScanReport;
use crate::report::{LoanFacts, RedFlag};

const REPORT_SCHEMA: &str = r#"{
  "document_metadata": {
    "overall_trust_score": <integer 0-100, 100 is safest>,
    "verdict": "Safe" | "Caution" | "High Risk"
  },
  "facts": {
    "borrower_name": <string or null>,
    "loan_amount": <number or null>,
    "currency": <ISO 4217 code, e.g. "USD">,
    "interest_rate_apr": <number, percent, or null>,
    "term_months": <integer or null>,
    "maturity_date": <"YYYY-MM-DD" or null>
  },
  "red_flags": [
    {
      "severity": "High" | "Medium" | "Low",
      "category": <short risk family, e.g. "Prepayment Penalty">,
      "text_found": <exact quote from the document>,
      "page_number": <integer or null>,
      "reasoning": <why this harms the borrower>
    }
  ],
  "explainability_data": {
    "model_confidence": <number 0.0-1.0>,
    "clauses_analyzed": <integer>,
    "legal_precedents_referenced": [<string>]
  }
}"#;

const AUDIT_TASK: &str = "\
**Task:**
1. **Extract Facts**: Identify key financial details like Principal, APR, Term, Maturity and the Borrower.
2. **Audit for Risks**: Search for \"Red Flags\" and \"Trap Clauses\" that prey on borrowers.
   - **Prepayment Penalties**: Fees for early payoff, including yield maintenance.
   - **Variable Rate Spikes**: Unexpected interest rate increases.
   - **Missing Clauses**: Key protections like \"Grace Periods\".
   - **Discrepancy Check**: Inconsistent numbers across pages.
   - **Draconian Default**: Aggressive default terms, cross-collateralization, acceleration at the lender's discretion.";

const OUTPUT_RULES: &str = "\
**Output Format:**
Return the result strictly as valid JSON matching this schema, with no prose around it:";

const NOTES: &str = "\
Note:
- `overall_trust_score` should be an integer 0-100 (100 is safest).
- `verdict` should be \"Safe\", \"Caution\", or \"High Risk\".
- `page_number` in red_flags should be inferred from the \"--- Page X ---\" markers if present.
- Quote `text_found` verbatim; do not paraphrase.";

/// Single-call audit over the full marked document text
pub fn audit_prompt(document_text: &str) -> String {
    format!(
        "You are an expert legal auditor and AI loan analyst. Your job is to strictly analyze the provided loan agreement text.\n\n\
         {AUDIT_TASK}\n\n\
         **Document Text:**\n{document_text}\n\n\
         {OUTPUT_RULES}\n{REPORT_SCHEMA}\n\n{NOTES}\n"
    )
}

/// Extraction prompt for one chunk of a longer document
pub fn chunk_prompt(chunk: &Chunk) -> String {
    format!(
        "You are a legal auditor. Extract key loan facts and identify \"Red Flags\" (predatory clauses) \
         from the following text chunk (Part {label}).\n\
         The chunk may start or end mid-sentence; only report what it actually contains.\n\n\
         Text:\n{text}\n\n\
         Return JSON with:\n\
         - facts: {{ borrower_name, loan_amount, currency, interest_rate_apr, term_months, maturity_date }} \
         (null for anything not stated in this chunk; other notable terms may be added as extra keys)\n\
         - red_flags: [ {{ severity, category, text_found, page_number, reasoning }} ]\n\
         Infer page_number from the \"--- Page X ---\" markers.\n",
        label = chunk.label(),
        text = chunk.text,
    )
}

/// Reduce-step prompt scoring the merged findings of all chunks
pub fn synthesis_prompt(facts: &LoanFacts, flags: &[RedFlag], pages: usize) -> String {
    let facts_json = serde_json::to_string_pretty(facts).unwrap_or_else(|_| "{}".to_string());
    let flags_json = serde_json::to_string_pretty(flags).unwrap_or_else(|_| "[]".to_string());
    format!(
        "You are an expert legal auditor. A {pages}-page loan agreement was reviewed in parts; \
         these are the combined findings.\n\n\
         **Facts:**\n{facts_json}\n\n\
         **Red Flags:**\n{flags_json}\n\n\
         Weigh the findings as a whole and return JSON with:\n\
         - overall_trust_score: integer 0-100 (100 is safest)\n\
         - model_confidence: number 0.0-1.0\n\
         - legal_precedents_referenced: [string] (statutes or regulations the findings touch, e.g. TILA)\n"
    )
}

/// Audit over a selective context built from heuristic hotspots
pub fn hotspot_prompt(bundle: &ContextBundle, scan: &ScanReport) -> String {
    let mut signals = String::new();
    for hotspot in &scan.hotspots {
        let categories: Vec<&str> = hotspot.categories.iter().map(|c| c.name()).collect();
        signals.push_str(&format!(
            "- Page {}: {}\n",
            hotspot.page,
            categories.join(", ")
        ));
    }
    if signals.is_empty() {
        signals.push_str("- none\n");
    }

    let missing = if scan.missing_protections.is_empty() {
        "none".to_string()
    } else {
        scan.missing_protections.join(", ")
    };

    let omitted = if bundle.omitted_pages.is_empty() {
        String::new()
    } else {
        format!(
            "Pages {:?} were flagged but left out for length; treat their signals as unverified.\n",
            bundle.omitted_pages
        )
    };

    format!(
        "You are an expert legal auditor and AI loan analyst. You are given excerpts of a {pages}-page \
         loan agreement: the opening page and the passages a keyword scan marked as risky. \
         \"[...]\" marks text that was skipped.\n\n\
         {AUDIT_TASK}\n\n\
         **Keyword signals by page:**\n{signals}\
         **Protections not found anywhere in the document:** {missing}\n\
         {omitted}\n\
         **Excerpts:**\n{text}\n\n\
         {OUTPUT_RULES}\n{REPORT_SCHEMA}\n\n{NOTES}\n\
         - Confirm or dismiss each keyword signal from the excerpt text; do not flag a signal you cannot quote.\n",
        pages = scan.pages_scanned,
        text = bundle.text,
    )
}

/// Audit of an attached PDF document
pub fn document_prompt() -> String {
    format!(
        "You are an expert legal auditor and AI loan analyst. The attached PDF is a loan agreement; \
         read every page, including scanned ones.\n\n\
         {AUDIT_TASK}\n\n\
         {OUTPUT_RULES}\n{REPORT_SCHEMA}\n\n{NOTES}\n\
         - Use the PDF's own page numbering (first page is 1) for `page_number`.\n"
    )
}
