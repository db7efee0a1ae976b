//! Deterministic rule matching: category patterns, tie-breaks, parameter extraction.
//!
//! Everything here is pure. The same normalized question and registry always
//! produce the same outcome.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::evidence::SiteRecord;
use crate::registry::AxiomRegistry;

use super::QueryCategory;

static AXIOM_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bba-(\d{3})\b").expect("Invalid axiom id regex"));

static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("Invalid whitespace regex"));

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(p).expect("Invalid category regex"))
        .collect()
}

static COMPARISON: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\bcompar(e|es|ed|ing|ison)\b",
        r"\bversus\b",
        r"\bvs\.?(\s|$)",
        r"\bdifference between\b",
        r"\b(higher|lower|more|less) than\b",
    ])
});

static PROVENANCE: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\bprovenance\b",
        r"\bsources?\b",
        r"\bcitations?\b",
        r"\bcited\b",
        r"\bevidence\b",
        r"\bwhere does\b.*\bcome from\b",
        r"\bhow do (you|we) know\b",
        r"\bdois?\b",
        r"\bbacked by\b",
        r"\bjustif(y|ied|ies|ication)\b",
    ])
});

static AXIOM_TERMS: Lazy<Vec<Regex>> =
    Lazy::new(|| compile(&[r"\baxioms?\b", r"\bcoefficients?\b", r"\bbridge\b"]));

static RISK: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\brisks?\b",
        r"\bdegrad",
        r"\bbleach",
        r"\bdeclin",
        r"\b(loss|lose|lost|losing)\b",
        r"\bthreat",
        r"\bscenarios?\b",
        r"\bwhat if\b",
        r"\bclimate\b",
        r"\bstress",
        r"\bat stake\b",
        r"\bcollapse",
    ])
});

static VALUATION: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\bworth\b",
        r"\bvalues?\b",
        r"\bvalu(ation|ed)\b",
        r"\besv\b",
        r"\bhow much\b",
        r"\$",
        r"\bdollars?\b",
        r"\beconomic\b",
        r"\bfinancial\b",
    ])
});

static EXPLANATION: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"\bwhat (is|are)\b",
        r"\bexplain\b",
        r"\bhow does\b",
        r"\bmechanisms?\b",
        r"\bwhy\b",
        r"\bdescribe\b",
        r"\bdefine\b",
        r"\bmeaning of\b",
    ])
});

/// Metric keywords and the canonical stem matched against axiom output names.
const METRICS: &[(&str, &str)] = &[
    ("coastal protection", "coastal_protection"),
    ("flood", "coastal_protection"),
    ("storm", "coastal_protection"),
    ("tourism", "tourism"),
    ("tourist", "tourism"),
    ("diving", "tourism"),
    ("fisheries", "fisheries"),
    ("fishery", "fisheries"),
    ("fishing", "fisheries"),
    ("carbon", "carbon"),
    ("sequestration", "carbon"),
    ("biomass", "biomass"),
];

fn any_match(patterns: &[Regex], text: &str) -> bool {
    patterns.iter().any(|p| p.is_match(text))
}

/// Lowercase, trim, collapse whitespace.
pub fn normalize(question: &str) -> String {
    WHITESPACE
        .replace_all(question.trim(), " ")
        .to_lowercase()
}

/// Canonical (upper-case) axiom ids in order of appearance, deduplicated.
pub fn extract_axiom_ids(text: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for cap in AXIOM_ID.captures_iter(text) {
        let id = format!("BA-{}", &cap[1]);
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

pub fn extract_metric(normalized: &str) -> Option<&'static str> {
    METRICS
        .iter()
        .find(|(keyword, _)| find_word(normalized, keyword).is_some())
        .map(|(_, stem)| *stem)
}

/// Position of `needle` in `haystack` at word boundaries.
fn find_word(haystack: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() {
        return None;
    }
    let mut from = 0;
    while let Some(rel) = haystack[from..].find(needle) {
        let start = from + rel;
        let end = start + needle.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .map_or(true, |c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .map_or(true, |c| !c.is_alphanumeric());
        if before_ok && after_ok {
            return Some(start);
        }
        from = start + needle.len().max(1);
        if from >= haystack.len() {
            break;
        }
    }
    None
}

/// Alias table mapping informal site names to their registered full names.
#[derive(Debug, Clone, Default)]
pub struct SiteAliases {
    /// (lowercase alias, canonical name), longest alias first.
    entries: Vec<(String, String)>,
}

impl SiteAliases {
    pub fn new<I, A>(sites: I) -> Self
    where
        I: IntoIterator<Item = (String, A)>,
        A: IntoIterator<Item = String>,
    {
        let mut entries = Vec::new();
        for (canonical, aliases) in sites {
            entries.push((canonical.to_lowercase(), canonical.clone()));
            for alias in aliases {
                let alias = alias.trim().to_lowercase();
                if !alias.is_empty() {
                    entries.push((alias, canonical.clone()));
                }
            }
        }
        entries.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        entries.dedup();
        Self { entries }
    }

    pub fn from_sites(sites: &[SiteRecord]) -> Self {
        Self::new(
            sites
                .iter()
                .map(|s| (s.name.clone(), s.aliases.clone())),
        )
    }

    /// Canonical name for an exact alias or full name.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        let needle = name.trim().to_lowercase();
        self.entries
            .iter()
            .find(|(alias, _)| *alias == needle)
            .map(|(_, canonical)| canonical.as_str())
    }

    /// Every distinct site mentioned in normalized text, in order of appearance.
    pub fn find_all(&self, normalized: &str) -> Vec<String> {
        let mut hits: Vec<(usize, &str)> = Vec::new();
        let mut claimed: Vec<(usize, usize)> = Vec::new();
        for (alias, canonical) in &self.entries {
            let Some(pos) = find_word(normalized, alias) else {
                continue;
            };
            let end = pos + alias.len();
            // A shorter alias inside a longer, already matched one is not a new site.
            if claimed.iter().any(|&(s, e)| pos >= s && end <= e) {
                continue;
            }
            claimed.push((pos, end));
            if !hits.iter().any(|(_, c)| c == canonical) {
                hits.push((pos, canonical));
            }
        }
        hits.sort_by_key(|(pos, _)| *pos);
        hits.into_iter().map(|(_, c)| c.to_string()).collect()
    }
}

/// What the rules decided, with the extracted parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    /// None when no rule matched at all.
    pub category: Option<QueryCategory>,
    pub confidence: f64,
    pub sites: Vec<String>,
    pub axiom_ids: Vec<String>,
    pub concept_id: Option<String>,
    pub metric: Option<String>,
}

/// Apply the ordered category rules to a normalized question.
pub fn apply_rules(normalized: &str, registry: &AxiomRegistry, sites: Vec<String>) -> RuleOutcome {
    let axiom_ids = extract_axiom_ids(normalized);
    let concept_id = registry
        .concept_mentioned_in(normalized)
        .map(|c| c.id.clone());
    let metric = extract_metric(normalized).map(str::to_string);

    let has_axiom = !axiom_ids.is_empty();
    let has_site = !sites.is_empty();
    let has_concept = concept_id.is_some();

    let (category, confidence) = if any_match(&COMPARISON, normalized) {
        match (has_axiom, sites.len() >= 2) {
            (true, true) => (Some(QueryCategory::Comparison), 0.9),
            (true, false) => (Some(QueryCategory::AxiomExplanation), 0.85),
            (false, true) => (Some(QueryCategory::Comparison), 0.9),
            (false, false) => (Some(QueryCategory::Comparison), 0.55),
        }
    } else if any_match(&PROVENANCE, normalized) {
        let anchored = has_site || has_axiom || metric.is_some();
        (
            Some(QueryCategory::ProvenanceDrilldown),
            if anchored { 0.85 } else { 0.6 },
        )
    } else if has_axiom {
        (Some(QueryCategory::AxiomExplanation), 0.9)
    } else if any_match(&RISK, normalized) {
        (
            Some(QueryCategory::RiskAssessment),
            if has_site { 0.85 } else { 0.6 },
        )
    } else if any_match(&VALUATION, normalized) {
        match (has_site, has_concept) {
            (true, _) => (Some(QueryCategory::SiteValuation), 0.9),
            (false, true) => (Some(QueryCategory::ConceptExplanation), 0.6),
            (false, false) => (Some(QueryCategory::SiteValuation), 0.45),
        }
    } else if has_site {
        (Some(QueryCategory::SiteValuation), 0.6)
    } else if any_match(&AXIOM_TERMS, normalized) {
        if has_concept {
            (Some(QueryCategory::ConceptExplanation), 0.7)
        } else {
            (Some(QueryCategory::AxiomExplanation), 0.4)
        }
    } else if has_concept {
        let explicit = any_match(&EXPLANATION, normalized);
        (
            Some(QueryCategory::ConceptExplanation),
            if explicit { 0.85 } else { 0.6 },
        )
    } else if any_match(&EXPLANATION, normalized) {
        (Some(QueryCategory::ConceptExplanation), 0.35)
    } else {
        (None, 0.0)
    };

    RuleOutcome {
        category,
        confidence,
        sites,
        axiom_ids,
        concept_id,
        metric,
    }
}
