//! Audit result model
//!
//! The serialized shape of [`AuditReport`] is the contract with consumers
//! (dashboard, CLI JSON). Model output is parsed leniently into
//! [`ChunkFindings`] because hosted models drift from any schema they are
//! given: numbers arrive as `"$25,000"`, keys move between sections, and
//! severities come in any case.

use crate::hotspot::HeuristicSignal;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"-?\d[\d,]*(?:\.\d+)?").unwrap());

/// Risk severity of a red flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Severity {
    High,
    Medium,
    Low,
}

impl Severity {
    /// Higher is more severe
    pub fn rank(&self) -> u8 {
        match self {
            Severity::High => 3,
            Severity::Medium => 2,
            Severity::Low => 1,
        }
    }

    /// Trust-score points deducted per flag of this severity
    pub fn penalty(&self) -> u32 {
        match self {
            Severity::High => 25,
            Severity::Medium => 10,
            Severity::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "High",
            Severity::Medium => "Medium",
            Severity::Low => "Low",
        }
    }
}

impl From<String> for Severity {
    fn from(s: String) -> Self {
        Severity::from(s.as_str())
    }
}

impl From<&str> for Severity {
    fn from(s: &str) -> Self {
        let s = s.trim().to_ascii_lowercase();
        if s.starts_with("high") || s.starts_with("critical") || s.starts_with("severe") {
            Severity::High
        } else if s.starts_with("low") || s.starts_with("minor") || s.starts_with("info") {
            Severity::Low
        } else {
            Severity::Medium
        }
    }
}

impl From<Severity> for String {
    fn from(s: Severity) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall verdict, always derived from the trust score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Safe,
    Caution,
    #[serde(rename = "High Risk")]
    HighRisk,
}

impl Verdict {
    pub fn from_score(score: u8) -> Self {
        match score {
            80..=u8::MAX => Verdict::Safe,
            50..=79 => Verdict::Caution,
            _ => Verdict::HighRisk,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Safe => "Safe",
            Verdict::Caution => "Caution",
            Verdict::HighRisk => "High Risk",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key loan terms
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoanFacts {
    pub borrower_name: Option<String>,
    /// Total principal amount
    pub loan_amount: Option<f64>,
    pub currency: Option<String>,
    /// Annual percentage rate, in percent
    pub interest_rate_apr: Option<f64>,
    pub term_months: Option<u32>,
    /// Final payment date (YYYY-MM-DD when known)
    pub maturity_date: Option<String>,
    /// Facts outside the fixed schema, keyed as the model named them
    #[serde(flatten)]
    pub other: BTreeMap<String, Value>,
}

impl LoanFacts {
    /// Parse a `facts` object, accepting common aliases and formatted numbers
    pub fn from_value(value: &Value) -> Self {
        let mut facts = LoanFacts::default();
        let Some(map) = value.as_object() else {
            return facts;
        };

        for (key, value) in map {
            if is_blank(value) {
                continue;
            }
            match normalize_key(key).as_str() {
                "borrower_name" | "borrower" | "borrowers" => {
                    facts.borrower_name = value_text(value);
                }
                "loan_amount" | "principal" | "principal_amount" | "amount" | "loan_principal" => {
                    facts.loan_amount = parse_number(value);
                    if facts.currency.is_none() {
                        facts.currency = value.as_str().and_then(currency_from_text);
                    }
                }
                "currency" => facts.currency = value_text(value),
                "interest_rate_apr" | "apr" | "interest_rate" | "annual_percentage_rate" => {
                    facts.interest_rate_apr = parse_number(value);
                }
                "term_months" | "term" | "loan_term" | "tenure" => {
                    facts.term_months = parse_term_months(value);
                }
                "maturity_date" | "maturity" | "final_payment_date" => {
                    facts.maturity_date = value_text(value);
                }
                _ => {
                    facts.other.insert(key.clone(), value.clone());
                }
            }
        }
        facts
    }

    /// Number of populated facts
    pub fn count(&self) -> usize {
        [
            self.borrower_name.is_some(),
            self.loan_amount.is_some(),
            self.currency.is_some(),
            self.interest_rate_apr.is_some(),
            self.term_months.is_some(),
            self.maturity_date.is_some(),
        ]
        .iter()
        .filter(|&&set| set)
        .count()
            + self.other.len()
    }
}

/// A predatory or risky clause
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedFlag {
    pub severity: Severity,
    /// Risk family, e.g. "Prepayment Penalty"
    pub category: String,
    /// The exact snippet that triggered the flag
    pub text_found: String,
    pub page_number: Option<u32>,
    pub reasoning: String,
}

impl RedFlag {
    /// Parse one red flag object; returns `None` when it carries no text at all
    pub fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_object()?;
        let text_found = first_text(map, &["text_found", "text", "clause", "quote", "snippet"])
            .unwrap_or_default();
        let reasoning = first_text(map, &["reasoning", "reason", "explanation", "description"])
            .unwrap_or_default();
        if text_found.is_empty() && reasoning.is_empty() {
            return None;
        }

        Some(RedFlag {
            severity: first_text(map, &["severity", "risk_level", "level"])
                .map(|s| Severity::from(s.as_str()))
                .unwrap_or(Severity::Medium),
            category: first_text(map, &["category", "type", "risk_type", "title"])
                .unwrap_or_else(|| "Uncategorized".to_string()),
            text_found,
            page_number: ["page_number", "page"]
                .iter()
                .find_map(|k| map.get(*k))
                .and_then(parse_number)
                .filter(|n| *n >= 1.0)
                .map(|n| n as u32),
            reasoning,
        })
    }
}

/// A fact reported with different values by different chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactConflict {
    pub field: String,
    pub kept: Value,
    pub rejected: Value,
    /// 0-based index of the chunk whose value was rejected
    pub chunk: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub title: Option<String>,
    pub analysis_timestamp: String,
    /// 0 (predatory) to 100 (safest)
    pub overall_trust_score: u8,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Explainability {
    /// 0.0 to 1.0
    pub model_confidence: f64,
    pub clauses_analyzed: Option<u32>,
    #[serde(default)]
    pub legal_precedents_referenced: Vec<String>,
    pub strategy: String,
    pub model: String,
    pub chunks_analyzed: usize,
    pub chunks_failed: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fact_conflicts: Vec<FactConflict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub heuristic_signals: Vec<HeuristicSignal>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_protections: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Performance {
    pub extraction_ms: u64,
    pub analysis_ms: u64,
    pub total_ms: u64,
    pub pages: usize,
    #[serde(default)]
    pub ocr_pages: Vec<u32>,
}

/// The complete audit of one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub document_metadata: DocumentMetadata,
    pub facts: LoanFacts,
    pub red_flags: Vec<RedFlag>,
    pub explainability: Explainability,
    #[serde(default)]
    pub performance: Performance,
}

/// Failure output in the same JSON channel as reports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub error: String,
    pub details: String,
}

impl ErrorReport {
    pub fn new(error: impl Into<String>, details: impl fmt::Display) -> Self {
        Self {
            error: error.into(),
            details: details.to_string(),
        }
    }
}

/// What one model response contributed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkFindings {
    pub facts: LoanFacts,
    pub red_flags: Vec<RedFlag>,
    pub trust_score: Option<u8>,
    pub confidence: Option<f64>,
    pub precedents: Vec<String>,
    pub clauses_analyzed: Option<u32>,
}

impl ChunkFindings {
    pub fn from_value(value: &Value) -> Self {
        let explain = ["explainability_data", "explainability"]
            .iter()
            .find_map(|k| value.get(*k));
        let metadata = value.get("document_metadata");

        let facts = value
            .get("facts")
            .map(LoanFacts::from_value)
            .unwrap_or_default();

        let red_flags = value
            .get("red_flags")
            .and_then(Value::as_array)
            .map(|flags| flags.iter().filter_map(RedFlag::from_value).collect())
            .unwrap_or_default();

        let trust_score = [metadata, Some(value)]
            .into_iter()
            .flatten()
            .find_map(|v| {
                ["overall_trust_score", "trust_score"]
                    .iter()
                    .find_map(|k| v.get(*k).and_then(parse_number))
            })
            .map(|n| n.round().clamp(0.0, 100.0) as u8);

        let confidence = [explain, Some(value)]
            .into_iter()
            .flatten()
            .find_map(|v| {
                ["model_confidence", "confidence"]
                    .iter()
                    .find_map(|k| v.get(*k).and_then(parse_number))
            })
            .map(|c| if c > 1.0 { c / 100.0 } else { c })
            .map(|c| c.clamp(0.0, 1.0));

        let precedents = [explain, Some(value)]
            .into_iter()
            .flatten()
            .find_map(|v| v.get("legal_precedents_referenced"))
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(value_text).collect())
            .unwrap_or_default();

        let clauses_analyzed = explain
            .and_then(|e| e.get("clauses_analyzed"))
            .and_then(parse_number)
            .filter(|n| *n >= 0.0)
            .map(|n| n as u32);

        ChunkFindings {
            facts,
            red_flags,
            trust_score,
            confidence,
            precedents,
            clauses_analyzed,
        }
    }
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .to_ascii_lowercase()
        .replace(|c: char| c == ' ' || c == '-', "_")
        .replace("(", "")
        .replace(")", "")
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => {
            let s = s.trim();
            s.is_empty()
                || s.eq_ignore_ascii_case("null")
                || s.eq_ignore_ascii_case("n/a")
                || s.eq_ignore_ascii_case("none")
                || s.eq_ignore_ascii_case("unknown")
        }
        _ => false,
    }
}

fn value_text(value: &Value) -> Option<String> {
    if is_blank(value) {
        return None;
    }
    match value {
        Value::String(s) => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn first_text(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| map.get(*k).and_then(value_text))
}

/// Read a number from a JSON number or from formatted text like "$25,000.00" or "8.5%"
pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let m = NUMBER.find(s)?;
            m.as_str().replace(',', "").parse().ok()
        }
        _ => None,
    }
}

fn parse_term_months(value: &Value) -> Option<u32> {
    let n = parse_number(value)?;
    if n < 0.0 {
        return None;
    }
    let in_years = value.as_str().map_or(false, |s| {
        let s = s.to_ascii_lowercase();
        (s.contains("year") || s.contains("yr")) && !s.contains("month")
    });
    let months = if in_years { n * 12.0 } else { n };
    Some(months.round() as u32)
}

fn currency_from_text(text: &str) -> Option<String> {
    let code = if text.contains('$') {
        "USD"
    } else if text.contains('€') {
        "EUR"
    } else if text.contains('£') {
        "GBP"
    } else if text.contains('₹') {
        "INR"
    } else {
        return None;
    };
    Some(code.to_string())
}
