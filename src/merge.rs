//! Merging partial findings from several model calls
//!
//! Chunks overlap and models repeat themselves, so the same clause is often
//! flagged more than once with slightly different clipping. Facts follow a
//! first-value-wins rule; later disagreements are kept as conflicts rather
//! than silently dropped.

use crate::report::{ChunkFindings, FactConflict, LoanFacts, RedFlag, Severity};
use serde::Serialize;
use serde_json::Value;

/// Findings from all successful calls, reduced to one set
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedFindings {
    pub facts: LoanFacts,
    pub red_flags: Vec<RedFlag>,
    pub conflicts: Vec<FactConflict>,
    /// Final 0-100 score
    pub trust_score: u8,
    /// Whether `trust_score` came from a model rather than local penalties
    pub score_from_model: bool,
    pub confidence: Option<f64>,
    pub precedents: Vec<String>,
    pub clauses_analyzed: Option<u32>,
}

/// Merge findings tagged with the index of the chunk they came from
pub fn merge_findings(parts: &[(usize, ChunkFindings)]) -> MergedFindings {
    let mut conflicts = Vec::new();
    let mut facts = LoanFacts::default();
    for (chunk, part) in parts {
        merge_facts(&mut facts, &part.facts, *chunk, &mut conflicts);
    }

    let red_flags = dedupe_red_flags(parts.iter().flat_map(|(_, p)| p.red_flags.iter().cloned()));

    let model_score = parts.iter().filter_map(|(_, p)| p.trust_score).min();
    let trust_score = model_score.unwrap_or_else(|| local_trust_score(&red_flags));

    let mut precedents: Vec<String> = Vec::new();
    for precedent in parts.iter().flat_map(|(_, p)| p.precedents.iter()) {
        if !precedents.iter().any(|p| p.eq_ignore_ascii_case(precedent)) {
            precedents.push(precedent.clone());
        }
    }

    let clauses: Vec<u32> = parts.iter().filter_map(|(_, p)| p.clauses_analyzed).collect();

    MergedFindings {
        facts,
        red_flags,
        conflicts,
        trust_score,
        score_from_model: model_score.is_some(),
        confidence: mean_confidence(parts.iter().filter_map(|(_, p)| p.confidence)),
        precedents,
        clauses_analyzed: (!clauses.is_empty()).then(|| clauses.iter().sum()),
    }
}

/// Fold `incoming` into `kept`; the first non-null value of each fact wins
pub fn merge_facts(
    kept: &mut LoanFacts,
    incoming: &LoanFacts,
    chunk: usize,
    conflicts: &mut Vec<FactConflict>,
) {
    macro_rules! merge {
        ($field:ident, $same:expr) => {
            merge_field(
                stringify!($field),
                &mut kept.$field,
                &incoming.$field,
                chunk,
                conflicts,
                $same,
            )
        };
    }

    merge!(borrower_name, same_text);
    merge!(loan_amount, same_number);
    merge!(currency, same_text);
    merge!(interest_rate_apr, same_number);
    merge!(term_months, |a, b| a == b);
    merge!(maturity_date, same_text);

    for (key, value) in &incoming.other {
        match kept.other.get(key) {
            None => {
                kept.other.insert(key.clone(), value.clone());
            }
            Some(existing) if !same_value(existing, value) => conflicts.push(FactConflict {
                field: key.clone(),
                kept: existing.clone(),
                rejected: value.clone(),
                chunk,
            }),
            Some(_) => {}
        }
    }
}

fn merge_field<T: Clone + Serialize>(
    field: &str,
    kept: &mut Option<T>,
    incoming: &Option<T>,
    chunk: usize,
    conflicts: &mut Vec<FactConflict>,
    same: fn(&T, &T) -> bool,
) {
    let Some(value) = incoming else {
        return;
    };
    match kept {
        None => *kept = Some(value.clone()),
        Some(existing) if !same(existing, value) => {
            log::debug!("Conflicting {} in chunk {}", field, chunk + 1);
            conflicts.push(FactConflict {
                field: field.to_string(),
                kept: to_value(existing),
                rejected: to_value(value),
                chunk,
            });
        }
        Some(_) => {}
    }
}

fn to_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn same_text(a: &String, b: &String) -> bool {
    normalize_text(a) == normalize_text(b)
}

fn same_number(a: &f64, b: &f64) -> bool {
    (a - b).abs() < 1e-6
}

fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(a), Value::String(b)) => same_text(a, b),
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => same_number(&a, &b),
            _ => a == b,
        },
        _ => a == b,
    }
}

/// Lowercase, collapse whitespace, and trim surrounding quotes, punctuation and ellipses
pub fn normalize_text(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_matches(|c: char| {
            c.is_whitespace()
                || c == '…'
                || c == '"'
                || c == '\''
                || c == '\u{201c}'
                || c == '\u{201d}'
                || c == '\u{2018}'
                || c == '\u{2019}'
                || (c.is_ascii_punctuation() && c != '%' && c != '$' && c != ')')
        })
        .to_string()
}

fn is_duplicate(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return a == b;
    }
    a == b || a.contains(b) || b.contains(a)
}

/// Collapse red flags that quote the same clause
///
/// Output is ordered by severity, then by first appearance.
pub fn dedupe_red_flags(flags: impl IntoIterator<Item = RedFlag>) -> Vec<RedFlag> {
    let mut kept: Vec<(String, RedFlag)> = Vec::new();

    for flag in flags {
        let key = normalize_text(&flag.text_found);
        let existing = kept.iter_mut().find(|(k, f)| {
            if key.is_empty() && k.is_empty() {
                normalize_text(&f.reasoning) == normalize_text(&flag.reasoning)
            } else {
                is_duplicate(k, &key)
            }
        });

        let Some((existing_key, existing)) = existing else {
            kept.push((key, flag));
            continue;
        };

        if flag.severity.rank() > existing.severity.rank() {
            existing.severity = flag.severity;
            existing.category = flag.category.clone();
        }
        if flag.text_found.chars().count() > existing.text_found.chars().count() {
            existing.text_found = flag.text_found.clone();
            *existing_key = key;
        }
        if existing.page_number.is_none() {
            existing.page_number = flag.page_number;
        }
        if flag.reasoning.chars().count() > existing.reasoning.chars().count() {
            existing.reasoning = flag.reasoning;
        }
    }

    let mut flags: Vec<RedFlag> = kept.into_iter().map(|(_, f)| f).collect();
    // stable: equal severities keep first-appearance order
    flags.sort_by(|a, b| b.severity.rank().cmp(&a.severity.rank()));
    flags
}

/// 100 minus the severity penalties of `flags`, floored at 0
pub fn local_trust_score(flags: &[RedFlag]) -> u8 {
    let penalty: u32 = flags.iter().map(|f| f.severity.penalty()).sum();
    100u32.saturating_sub(penalty) as u8
}

/// Mean of the given confidences, clamped to 0..=1
pub fn mean_confidence(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let values: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Some(mean.clamp(0.0, 1.0))
}

/// Count of flags at each severity, highest first
pub fn severity_counts(flags: &[RedFlag]) -> [(Severity, usize); 3] {
    [Severity::High, Severity::Medium, Severity::Low]
        .map(|s| (s, flags.iter().filter(|f| f.severity == s).count()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flag(severity: Severity, text: &str, page: Option<u32>, reasoning: &str) -> RedFlag {
        RedFlag {
            severity,
            category: "Test".to_string(),
            text_found: text.to_string(),
            page_number: page,
            reasoning: reasoning.to_string(),
        }
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(
            normalize_text("  \"...a Prepayment   PENALTY of 5%…\" "),
            "a prepayment penalty of 5%"
        );
        assert_eq!(normalize_text("..."), "");
    }

    #[test]
    fn test_first_fact_wins_and_conflicts_are_recorded() {
        let a = ChunkFindings {
            facts: LoanFacts {
                loan_amount: Some(250_000.0),
                borrower_name: Some("Jane Doe".into()),
                ..LoanFacts::default()
            },
            ..ChunkFindings::default()
        };
        let b = ChunkFindings {
            facts: LoanFacts {
                loan_amount: Some(25_000.0),
                borrower_name: Some("JANE  doe".into()),
                interest_rate_apr: Some(8.5),
                ..LoanFacts::default()
            },
            ..ChunkFindings::default()
        };

        let merged = merge_findings(&[(0, a), (1, b)]);
        assert_eq!(merged.facts.loan_amount, Some(250_000.0));
        assert_eq!(merged.facts.borrower_name.as_deref(), Some("Jane Doe"));
        assert_eq!(merged.facts.interest_rate_apr, Some(8.5));
        assert_eq!(merged.conflicts.len(), 1);
        assert_eq!(merged.conflicts[0].field, "loan_amount");
        assert_eq!(merged.conflicts[0].kept, json!(250000.0));
        assert_eq!(merged.conflicts[0].rejected, json!(25000.0));
        assert_eq!(merged.conflicts[0].chunk, 1);
    }

    #[test]
    fn test_extra_facts_merge() {
        let mut kept = LoanFacts::default();
        let mut conflicts = Vec::new();
        let mut incoming = LoanFacts::default();
        incoming.other.insert("collateral".into(), json!("Residence"));
        merge_facts(&mut kept, &incoming, 0, &mut conflicts);
        incoming.other.insert("collateral".into(), json!("Vehicle"));
        merge_facts(&mut kept, &incoming, 2, &mut conflicts);

        assert_eq!(kept.other["collateral"], json!("Residence"));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].chunk, 2);
    }

    #[test]
    fn test_dedupe_overlapping_clauses() {
        let flags = vec![
            flag(Severity::Medium, "a prepayment penalty of 5%", None, "short"),
            flag(Severity::Low, "late fee of $50", Some(3), "fee"),
            flag(
                Severity::High,
                "...Borrower shall pay a prepayment penalty of 5% of the balance",
                Some(4),
                "a much longer reasoning",
            ),
        ];
        let merged = dedupe_red_flags(flags);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].severity, Severity::High);
        assert!(merged[0].text_found.contains("Borrower shall pay"));
        assert_eq!(merged[0].page_number, Some(4));
        assert_eq!(merged[0].reasoning, "a much longer reasoning");
        assert_eq!(merged[1].text_found, "late fee of $50");
    }

    #[test]
    fn test_dedupe_keeps_first_known_page() {
        let merged = dedupe_red_flags(vec![
            flag(Severity::Low, "Clause X", Some(2), "r"),
            flag(Severity::Low, "clause x.", Some(9), "r"),
        ]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].page_number, Some(2));
    }

    #[test]
    fn test_order_by_severity_then_appearance() {
        let merged = dedupe_red_flags(vec![
            flag(Severity::Low, "one", None, ""),
            flag(Severity::High, "two", None, ""),
            flag(Severity::Low, "three", None, ""),
            flag(Severity::High, "four", None, ""),
        ]);
        let texts: Vec<&str> = merged.iter().map(|f| f.text_found.as_str()).collect();
        assert_eq!(texts, vec!["two", "four", "one", "three"]);
    }

    #[test]
    fn test_trust_score_sources() {
        let flags = vec![
            flag(Severity::High, "a", None, ""),
            flag(Severity::Medium, "b", None, ""),
            flag(Severity::Low, "c", None, ""),
        ];
        assert_eq!(local_trust_score(&flags), 62);
        let many: Vec<RedFlag> = (0..5)
            .map(|i| flag(Severity::High, &i.to_string(), None, ""))
            .collect();
        assert_eq!(local_trust_score(&many), 0);

        let parts = vec![
            (0, ChunkFindings { trust_score: Some(70), ..ChunkFindings::default() }),
            (1, ChunkFindings { trust_score: Some(45), ..ChunkFindings::default() }),
        ];
        let merged = merge_findings(&parts);
        assert_eq!(merged.trust_score, 45);
        assert!(merged.score_from_model);

        let merged = merge_findings(&[(0, ChunkFindings::default())]);
        assert_eq!(merged.trust_score, 100);
        assert!(!merged.score_from_model);
    }

    #[test]
    fn test_mean_confidence() {
        assert_eq!(mean_confidence(vec![]), None);
        assert_eq!(mean_confidence(vec![0.5, 1.0]), Some(0.75));
        assert_eq!(mean_confidence(vec![2.0]), Some(1.0));
    }

    #[test]
    fn test_precedents_are_unioned() {
        let parts = vec![
            (
                0,
                ChunkFindings {
                    precedents: vec!["TILA".into()],
                    clauses_analyzed: Some(10),
                    ..ChunkFindings::default()
                },
            ),
            (
                1,
                ChunkFindings {
                    precedents: vec!["tila".into(), "RESPA".into()],
                    clauses_analyzed: Some(5),
                    ..ChunkFindings::default()
                },
            ),
        ];
        let merged = merge_findings(&parts);
        assert_eq!(merged.precedents, vec!["TILA".to_string(), "RESPA".to_string()]);
        assert_eq!(merged.clauses_analyzed, Some(15));
    }
}
