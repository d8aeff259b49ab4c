//! Keyword heuristics for predatory-clause hotspots
//!
//! Each page is scanned for phrases that commonly introduce risky loan
//! terms. Pages that collect enough weighted signals become hotspots, and
//! the text around each signal is cut into windows for selective context.

use crate::extractor::PageText;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Risk families the scanner looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    PrepaymentPenalty,
    VariableRate,
    DefaultAcceleration,
    LateFees,
    BalloonPayment,
    CrossCollateral,
    WaiverOfRights,
    HiddenFees,
    InsecurityClause,
}

impl RiskCategory {
    pub const ALL: [RiskCategory; 9] = [
        RiskCategory::PrepaymentPenalty,
        RiskCategory::VariableRate,
        RiskCategory::DefaultAcceleration,
        RiskCategory::LateFees,
        RiskCategory::BalloonPayment,
        RiskCategory::CrossCollateral,
        RiskCategory::WaiverOfRights,
        RiskCategory::HiddenFees,
        RiskCategory::InsecurityClause,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RiskCategory::PrepaymentPenalty => "Prepayment Penalty",
            RiskCategory::VariableRate => "Variable Rate",
            RiskCategory::DefaultAcceleration => "Draconian Default",
            RiskCategory::LateFees => "Late Fees",
            RiskCategory::BalloonPayment => "Balloon Payment",
            RiskCategory::CrossCollateral => "Cross-Collateralization",
            RiskCategory::WaiverOfRights => "Waiver of Rights",
            RiskCategory::HiddenFees => "Hidden Fees",
            RiskCategory::InsecurityClause => "Insecurity Acceleration",
        }
    }

    /// Score contributed by the first hit of this category on a page
    pub fn weight(&self) -> u32 {
        match self {
            RiskCategory::PrepaymentPenalty
            | RiskCategory::VariableRate
            | RiskCategory::DefaultAcceleration
            | RiskCategory::BalloonPayment
            | RiskCategory::InsecurityClause => 3,
            RiskCategory::LateFees
            | RiskCategory::CrossCollateral
            | RiskCategory::WaiverOfRights => 2,
            RiskCategory::HiddenFees => 1,
        }
    }

    fn pattern(&self) -> &'static str {
        match self {
            RiskCategory::PrepaymentPenalty => {
                r"prepayment (?:penalty|premium|fee|charge)|early (?:re)?payment (?:fee|charge|penalty)|yield maintenance|make[- ]whole|defeasance|exit fee|early (?:payoff|termination) (?:fee|charge|penalty)"
            }
            RiskCategory::VariableRate => {
                r"variable (?:interest )?rate|adjustable[- ]rate|floating (?:interest )?rate|rate (?:may|shall|will) (?:increase|change|adjust)|plus a margin|index plus|teaser rate|rate adjustment"
            }
            RiskCategory::DefaultAcceleration => {
                r"events? of default|accelerat(?:e|ed|ion)|immediately due and payable|cross[- ]default|default under any other agreement"
            }
            RiskCategory::LateFees => {
                r"late (?:payment )?(?:fee|charge)s?|default (?:interest|rate)|penalty interest|re-?capitali[sz](?:e|ed|ation)|compound(?:ed)? interest"
            }
            RiskCategory::BalloonPayment => {
                r"balloon (?:payment|maturity|installment)|lump[- ]sum payment|final payment of the entire"
            }
            RiskCategory::CrossCollateral => {
                r"cross[- ]collaterali[sz](?:e|ed|ation)|existing obligations|all (?:present and future|other) (?:obligations|indebtedness)|blanket lien|security interest in all"
            }
            RiskCategory::WaiverOfRights => {
                r"waives?|waiver|binding arbitration|jury trial|confess(?:ion of)? judgment|class action"
            }
            RiskCategory::HiddenFees => {
                r"origination fee|processing fee|documentation fee|administrative fee|service charge|credit (?:life )?insurance|broker(?:age)? fee"
            }
            RiskCategory::InsecurityClause => {
                r"deems? (?:itself |himself |herself )?insecure|material adverse change|(?:in|at) (?:its|the lender's) sole discretion"
            }
        }
    }
}

/// Repeated hits of one category on one page stop adding score after this many
const MAX_HITS_PER_CATEGORY: u32 = 3;

static CATEGORY_PATTERNS: Lazy<Vec<(RiskCategory, Regex)>> = Lazy::new(|| {
    RiskCategory::ALL
        .iter()
        .filter_map(|category| {
            Regex::new(&format!(r"(?i)\b(?:{})\b", category.pattern()))
                .ok()
                .map(|re| (*category, re))
        })
        .collect()
});

static GRACE_PERIOD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bgrace period\b").unwrap());

/// One keyword hit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    pub category: RiskCategory,
    /// The matched text as it appears on the page
    pub phrase: String,
    pub page: u32,
    /// Byte offset of the match in the page text
    pub start: usize,
    pub end: usize,
}

/// A byte range of page text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextWindow {
    pub start: usize,
    pub end: usize,
}

impl TextWindow {
    pub fn slice<'t>(&self, text: &'t str) -> &'t str {
        text.get(self.start..self.end).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// A page flagged by the keyword heuristics
#[derive(Debug, Clone)]
pub struct Hotspot {
    pub page: u32,
    pub score: u32,
    /// Distinct categories hit, ordered
    pub categories: Vec<RiskCategory>,
    pub signals: Vec<Signal>,
    /// Merged, non-overlapping windows around the signals, ordered by offset
    pub windows: Vec<TextWindow>,
}

/// Serializable summary of a signal for reports and prompts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeuristicSignal {
    pub page: u32,
    pub category: String,
    pub phrase: String,
}

/// Scanner configuration
#[derive(Debug, Clone)]
pub struct HotspotConfig {
    /// Bytes of context kept on each side of a signal
    pub window_radius: usize,
    /// Minimum page score to count as a hotspot
    pub min_score: u32,
    /// Hotspots kept after ranking
    pub max_hotspots: usize,
}

impl Default for HotspotConfig {
    fn default() -> Self {
        Self {
            window_radius: 600,
            min_score: 3,
            max_hotspots: 12,
        }
    }
}

/// Result of scanning a whole document
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// Hotspots ranked by score (desc), then page (asc)
    pub hotspots: Vec<Hotspot>,
    /// Total signals found, including pages below the hotspot threshold
    pub total_signals: usize,
    pub pages_scanned: usize,
    /// Protective clauses not found anywhere in the document
    pub missing_protections: Vec<String>,
}

impl ScanReport {
    pub fn signal_summaries(&self) -> Vec<HeuristicSignal> {
        let mut summaries: Vec<HeuristicSignal> = self
            .hotspots
            .iter()
            .flat_map(|h| h.signals.iter())
            .map(|s| HeuristicSignal {
                page: s.page,
                category: s.category.name().to_string(),
                phrase: s.phrase.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.page.cmp(&b.page));
        summaries
    }

    pub fn hotspot(&self, page: u32) -> Option<&Hotspot> {
        self.hotspots.iter().find(|h| h.page == page)
    }
}

/// Find every keyword signal on a page, ordered by offset
pub fn scan_page(page: &PageText) -> Vec<Signal> {
    let mut signals: Vec<Signal> = CATEGORY_PATTERNS
        .iter()
        .flat_map(|(category, re)| {
            re.find_iter(&page.text).map(move |m| Signal {
                category: *category,
                phrase: m.as_str().to_string(),
                page: page.number,
                start: m.start(),
                end: m.end(),
            })
        })
        .collect();
    signals.sort_by_key(|s| (s.start, s.end));
    signals
}

/// Score a page's signals
pub fn score_signals(signals: &[Signal]) -> u32 {
    let mut hits: BTreeMap<RiskCategory, u32> = BTreeMap::new();
    for signal in signals {
        *hits.entry(signal.category).or_default() += 1;
    }
    hits.iter()
        .map(|(category, &count)| category.weight() + count.min(MAX_HITS_PER_CATEGORY) - 1)
        .sum()
}

/// Scan all pages and rank hotspots
pub fn scan_pages(pages: &[PageText], config: &HotspotConfig) -> ScanReport {
    let mut report = ScanReport {
        pages_scanned: pages.len(),
        ..ScanReport::default()
    };

    for page in pages {
        let signals = scan_page(page);
        report.total_signals += signals.len();

        let score = score_signals(&signals);
        if signals.is_empty() || score < config.min_score {
            continue;
        }

        let mut categories: Vec<RiskCategory> = signals.iter().map(|s| s.category).collect();
        categories.sort();
        categories.dedup();

        let windows = signal_windows(&page.text, &signals, config.window_radius);
        report.hotspots.push(Hotspot {
            page: page.number,
            score,
            categories,
            signals,
            windows,
        });
    }

    report
        .hotspots
        .sort_by(|a, b| b.score.cmp(&a.score).then(a.page.cmp(&b.page)));
    report.hotspots.truncate(config.max_hotspots);

    if !pages.iter().any(|p| GRACE_PERIOD.is_match(&p.text)) {
        report.missing_protections.push("Grace Period".to_string());
    }

    log::debug!(
        "Scanned {} pages: {} signals, {} hotspots",
        report.pages_scanned,
        report.total_signals,
        report.hotspots.len()
    );

    report
}

/// Expand each signal into a window and merge overlapping windows
pub fn signal_windows(text: &str, signals: &[Signal], radius: usize) -> Vec<TextWindow> {
    let mut windows: Vec<TextWindow> = signals
        .iter()
        .map(|s| expand_window(text, s.start, s.end, radius))
        .collect();
    windows.sort_by_key(|w| w.start);

    let mut merged: Vec<TextWindow> = Vec::with_capacity(windows.len());
    for window in windows {
        match merged.last_mut() {
            Some(last) if window.start <= last.end + 1 => {
                last.end = last.end.max(window.end);
            }
            _ => merged.push(window),
        }
    }
    merged
}

/// Grow `[start, end)` by `radius` bytes each side, trimming partial lines
fn expand_window(text: &str, start: usize, end: usize, radius: usize) -> TextWindow {
    let mut lo = floor_char_boundary(text, start.saturating_sub(radius));
    let mut hi = ceil_char_boundary(text, (end + radius).min(text.len()));

    if lo > 0 {
        if let Some(pos) = text[lo..start].find('\n') {
            lo += pos + 1;
        }
    }
    if hi < text.len() {
        if let Some(pos) = text[end..hi].rfind('\n') {
            hi = end + pos;
        }
    }

    TextWindow { start: lo, end: hi }
}

/// Largest char boundary not above `idx`
pub(crate) fn floor_char_boundary(text: &str, idx: usize) -> usize {
    let mut idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Smallest char boundary not below `idx`
pub(crate) fn ceil_char_boundary(text: &str, idx: usize) -> usize {
    let mut idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
