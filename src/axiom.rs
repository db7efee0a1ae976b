//! Typed catalog records: bridge axioms, evidence references, concepts.
//!
//! These are the validated forms. Raw catalog JSON is parsed and checked in
//! [`crate::registry`]; nothing here is constructed lazily from untyped data.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

// =============================================================================
// HABITAT
// =============================================================================

/// A habitat declared by the catalog (e.g. `coral_reef`, `mangrove`).
///
/// Habitats are an open set per catalog version, so they are a normalized
/// newtype rather than a Rust enum. The registry rejects any axiom or concept
/// that names a habitat the catalog did not declare.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Habitat(String);

impl Habitat {
    pub fn new(name: &str) -> Self {
        let normalized = name
            .trim()
            .to_lowercase()
            .split(|c: char| c.is_whitespace() || c == '-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("_");
        Self(normalized)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Habitat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// EVIDENCE
// =============================================================================

/// Ordinal evidence quality. T1 is peer-reviewed journal work, T4 grey literature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Tier {
    T1,
    T2,
    T3,
    T4,
}

impl Tier {
    /// Tier applied to evidence nodes that carry no explicit tier.
    pub const DEFAULT: Tier = Tier::T2;

    /// Base score used by the confidence model.
    pub fn base_score(&self) -> f64 {
        match self {
            Tier::T1 => 0.95,
            Tier::T2 => 0.80,
            Tier::T3 => 0.65,
            Tier::T4 => 0.50,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::T1 => "T1",
            Tier::T2 => "T2",
            Tier::T3 => "T3",
            Tier::T4 => "T4",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "T1" => Some(Tier::T1),
            "T2" => Some(Tier::T2),
            "T3" => Some(Tier::T3),
            "T4" => Some(Tier::T4),
            _ => None,
        }
    }
}

/// A citation backing an axiom or concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doi_or_url: Option<String>,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_ref: Option<String>,
}

impl EvidenceRef {
    pub fn effective_tier(&self) -> Tier {
        self.tier.unwrap_or(Tier::DEFAULT)
    }

    /// True when `doi_or_url` holds a well-formed DOI (bare, `doi:` or doi.org form).
    pub fn has_doi(&self) -> bool {
        self.doi_or_url
            .as_deref()
            .and_then(crate::registry::normalize_doi)
            .is_some()
    }

    /// Key used to count independent sources: DOI/URL when present, else title.
    pub fn source_key(&self) -> String {
        match self.doi_or_url.as_deref() {
            Some(d) => crate::registry::normalize_doi(d)
                .unwrap_or_else(|| d.trim().to_lowercase()),
            None => self.title.trim().to_lowercase(),
        }
    }
}

// =============================================================================
// AXIOM
// =============================================================================

/// Which domains an axiom bridges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxiomCategory {
    EcologicalToService,
    ServiceToFinancial,
    GovernanceToEcological,
    Risk,
}

impl AxiomCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AxiomCategory::EcologicalToService => "ecological_to_service",
            AxiomCategory::ServiceToFinancial => "service_to_financial",
            AxiomCategory::GovernanceToEcological => "governance_to_ecological",
            AxiomCategory::Risk => "risk",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace(['-', ' '], "_").as_str() {
            "ecological_to_service" => Some(AxiomCategory::EcologicalToService),
            "service_to_financial" => Some(AxiomCategory::ServiceToFinancial),
            "governance_to_ecological" => Some(AxiomCategory::GovernanceToEcological),
            "risk" => Some(AxiomCategory::Risk),
            _ => None,
        }
    }
}

/// Sampling distribution declared for an axiom's coefficient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionKind {
    Triangular,
    Lognormal,
}

impl DistributionKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "triangular" => Some(DistributionKind::Triangular),
            "lognormal" | "log_normal" => Some(DistributionKind::Lognormal),
            _ => None,
        }
    }
}

/// A named, unit-carrying parameter in an axiom's input or output schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub unit: String,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, unit: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
        }
    }

    /// Currency-denominated outputs are the ones summed into a valuation.
    pub fn is_currency(&self) -> bool {
        let unit = self.unit.to_lowercase();
        unit == "usd" || unit.starts_with("usd/") || unit.starts_with("usd_")
    }
}

/// Minimum number of independent sources before an axiom is considered well-supported.
pub const MIN_INDEPENDENT_SOURCES: usize = 3;

/// A quantified, evidence-backed translation rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeAxiom {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: AxiomCategory,
    pub inputs: Vec<ParamSpec>,
    pub output: ParamSpec,
    pub coefficient: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub distribution: DistributionKind,
    pub sample_size: u32,
    pub applicable_habitats: BTreeSet<Habitat>,
    pub evidence: Vec<EvidenceRef>,
}

impl BridgeAxiom {
    /// Count of distinct sources among this axiom's evidence.
    pub fn independent_sources(&self) -> usize {
        self.evidence
            .iter()
            .map(EvidenceRef::source_key)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Evidence-thin axioms still execute; they are flagged, never dropped.
    pub fn is_low_confidence(&self) -> bool {
        self.independent_sources() < MIN_INDEPENDENT_SOURCES
    }

    pub fn applies_to(&self, habitats: &BTreeSet<Habitat>) -> bool {
        self.applicable_habitats
            .iter()
            .any(|h| habitats.contains(h))
    }

    pub fn consumes(&self, name: &str) -> bool {
        self.inputs.iter().any(|p| p.name == name)
    }
}

// =============================================================================
// CONCEPT
// =============================================================================

/// A named domain topic that groups axioms, used for siteless questions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Concept {
    pub id: String,
    pub name: String,
    pub domain: String,
    pub description: String,
    pub keywords: Vec<String>,
    pub applicable_habitats: BTreeSet<Habitat>,
    pub involved_axiom_ids: Vec<String>,
}

impl Concept {
    /// Whether normalized text mentions this concept's name or any keyword
    /// as whole words.
    pub fn mentioned_in(&self, normalized: &str) -> bool {
        std::iter::once(&self.name)
            .chain(&self.keywords)
            .any(|term| contains_phrase(normalized, term))
    }
}

fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    let phrase = phrase.trim().to_lowercase();
    if phrase.is_empty() {
        return false;
    }
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(&phrase)))
        .map(|re| re.is_match(haystack))
        .unwrap_or(false)
}
