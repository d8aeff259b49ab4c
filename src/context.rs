//! Selective-context assembly
//!
//! Builds a bounded text bundle from the lead page and the highest-scoring
//! hotspot windows, so a single model call sees the clauses most likely to
//! matter instead of the entire agreement.

use crate::extractor::{page_marker, PageText};
use crate::hotspot::{floor_char_boundary, ScanReport};
use serde::Serialize;

/// Separator between non-adjacent windows of one page
const WINDOW_SEPARATOR: &str = " [...] ";
/// A section is only squeezed into the remaining budget if at least this much is left
const MIN_SECTION_CHARS: usize = 200;
const ELLIPSIS: char = '…';

/// Character budget for an assembled context
#[derive(Debug, Clone)]
pub struct ContextBudget {
    /// Hard cap on the whole bundle
    pub max_chars: usize,
    /// Cap on the content taken from one hotspot page
    pub per_page_chars: usize,
    /// Cap on the lead page
    pub lead_page_chars: usize,
}

impl Default for ContextBudget {
    fn default() -> Self {
        Self {
            max_chars: 30_000,
            per_page_chars: 4_000,
            lead_page_chars: 3_000,
        }
    }
}

/// The assembled context and an account of what went into it
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextBundle {
    pub text: String,
    /// Pages present in the bundle, ascending
    pub included_pages: Vec<u32>,
    /// Included pages whose content was cut
    pub truncated_pages: Vec<u32>,
    /// Hotspot pages that did not fit
    pub omitted_pages: Vec<u32>,
}

struct Section {
    page: u32,
    body: String,
    truncated: bool,
}

/// Assemble the lead page plus hotspot windows within `budget`
pub fn assemble(pages: &[PageText], scan: &ScanReport, budget: &ContextBudget) -> ContextBundle {
    let mut sections: Vec<Section> = Vec::new();
    let mut bundle = ContextBundle::default();
    let mut used = 0usize;

    let lead = pages.iter().find(|p| !p.text.trim().is_empty());
    if let Some(lead) = lead {
        let (body, truncated) = truncate_chars(lead.text.trim(), budget.lead_page_chars);
        let section = fit_section(lead.number, body, truncated, &mut used, budget.max_chars);
        sections.extend(section);
    }

    for hotspot in &scan.hotspots {
        if sections.iter().any(|s| s.page == hotspot.page) {
            continue;
        }
        let Some(page) = pages.iter().find(|p| p.number == hotspot.page) else {
            continue;
        };

        let joined = hotspot
            .windows
            .iter()
            .map(|w| w.slice(&page.text).trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(WINDOW_SEPARATOR);
        let (body, truncated) = truncate_chars(&joined, budget.per_page_chars);

        match fit_section(hotspot.page, body, truncated, &mut used, budget.max_chars) {
            Some(section) => sections.push(section),
            None => bundle.omitted_pages.push(hotspot.page),
        }
    }

    sections.sort_by_key(|s| s.page);

    let mut parts = Vec::with_capacity(sections.len());
    for section in sections {
        bundle.included_pages.push(section.page);
        if section.truncated {
            bundle.truncated_pages.push(section.page);
        }
        parts.push(format!("{}\n{}", page_marker(section.page), section.body));
    }
    bundle.text = parts.join("\n\n");
    bundle.omitted_pages.sort_unstable();

    log::debug!(
        "Assembled context: {} chars from pages {:?}, omitted {:?}",
        bundle.text.chars().count(),
        bundle.included_pages,
        bundle.omitted_pages
    );

    bundle
}

/// Charge a section against the budget, shrinking it to fit when worthwhile
fn fit_section(
    page: u32,
    body: String,
    truncated: bool,
    used: &mut usize,
    max_chars: usize,
) -> Option<Section> {
    // marker line plus the blank line joining sections
    let overhead = page_marker(page).chars().count() + 3;
    let remaining = max_chars.saturating_sub(*used);
    if remaining <= overhead {
        return None;
    }

    let body_len = body.chars().count();
    let (body, truncated) = if overhead + body_len <= remaining {
        (body, truncated)
    } else if remaining - overhead >= MIN_SECTION_CHARS {
        let (cut, _) = truncate_chars(&body, remaining - overhead);
        (cut, true)
    } else {
        return None;
    };

    *used += overhead + body.chars().count();
    Some(Section {
        page,
        body,
        truncated,
    })
}

/// Cut `text` to at most `max_chars` characters, marking the cut with an ellipsis
///
/// Returns the text and whether it was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    if max_chars == 0 {
        return (String::new(), true);
    }

    let cut = text
        .char_indices()
        .nth(max_chars - 1)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len());
    let cut = floor_char_boundary(text, cut);
    let mut out = text[..cut].trim_end().to_string();
    out.push(ELLIPSIS);
    (out, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::PageSource;
    use crate::hotspot::{scan_pages, HotspotConfig};

    fn page(number: u32, text: &str) -> PageText {
        PageText::new(number, text, PageSource::TextLayer)
    }

    fn sample_pages() -> Vec<PageText> {
        vec![
            page(1, "LOAN AGREEMENT\nPrincipal: $250,000\nAPR: 8.75%"),
            page(2, &"Boilerplate definitions. ".repeat(40)),
            page(
                3,
                "Section 4.2. Any payment late by more than three days triggers a late fee and recapitalization of interest.",
            ),
            page(
                7,
                "Upon an Event of Default the Lender may declare all sums immediately due and payable.",
            ),
        ]
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("short", 10), ("short".to_string(), false));
        let (cut, truncated) = truncate_chars("abcdefghij", 5);
        assert!(truncated);
        assert_eq!(cut, "abcd…");
        assert_eq!(cut.chars().count(), 5);

        let (cut, _) = truncate_chars("ééééé", 3);
        assert_eq!(cut, "éé…");
    }

    #[test]
    fn test_assemble_lead_and_hotspots_in_page_order() {
        let pages = sample_pages();
        let scan = scan_pages(&pages, &HotspotConfig::default());
        let bundle = assemble(&pages, &scan, &ContextBudget::default());

        assert_eq!(bundle.included_pages, vec![1, 3, 7]);
        assert!(bundle.omitted_pages.is_empty());
        assert!(bundle.text.starts_with("--- Page 1 ---\nLOAN AGREEMENT"));
        let p3 = bundle.text.find("--- Page 3 ---").unwrap();
        let p7 = bundle.text.find("--- Page 7 ---").unwrap();
        assert!(p3 < p7);
        assert!(!bundle.text.contains("Boilerplate"));
    }

    #[test]
    fn test_assemble_respects_budget() {
        let mut pages = sample_pages();
        pages[0].text = "Lead page text. ".repeat(100);
        let scan = scan_pages(&pages, &HotspotConfig::default());
        let budget = ContextBudget {
            max_chars: 400,
            per_page_chars: 300,
            lead_page_chars: 350,
        };
        let bundle = assemble(&pages, &scan, &budget);

        assert!(bundle.text.chars().count() <= budget.max_chars);
        assert_eq!(bundle.included_pages, vec![1]);
        assert_eq!(bundle.truncated_pages, vec![1]);
        assert_eq!(bundle.omitted_pages, vec![3, 7]);
    }

    #[test]
    fn test_assemble_without_hotspots_sends_lead_page() {
        let pages = vec![page(1, "Principal $5,000 payable monthly.")];
        let scan = scan_pages(&pages, &HotspotConfig::default());
        let bundle = assemble(&pages, &scan, &ContextBudget::default());
        assert_eq!(bundle.included_pages, vec![1]);
        assert!(bundle.text.contains("Principal $5,000"));
    }
}
