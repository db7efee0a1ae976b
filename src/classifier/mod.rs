//! Query classification into the fixed category taxonomy.
//!
//! Rules run first and are deterministic. Only when they are inconclusive does
//! the classifier consult the injected fallback, under a deadline. Whatever
//! happens, a category always comes out: an unavailable, slow or unsure
//! fallback degrades to `site_valuation` at low confidence.

pub mod fallback;
pub mod rules;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::llm::LlmError;
use crate::registry::AxiomRegistry;

pub use fallback::LlmClassifier;
pub use rules::{apply_rules, normalize, RuleOutcome, SiteAliases};

// =============================================================================
// CATEGORIES
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryCategory {
    SiteValuation,
    ProvenanceDrilldown,
    AxiomExplanation,
    Comparison,
    RiskAssessment,
    ConceptExplanation,
}

impl QueryCategory {
    pub const ALL: [QueryCategory; 6] = [
        QueryCategory::SiteValuation,
        QueryCategory::ProvenanceDrilldown,
        QueryCategory::AxiomExplanation,
        QueryCategory::Comparison,
        QueryCategory::RiskAssessment,
        QueryCategory::ConceptExplanation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueryCategory::SiteValuation => "site_valuation",
            QueryCategory::ProvenanceDrilldown => "provenance_drilldown",
            QueryCategory::AxiomExplanation => "axiom_explanation",
            QueryCategory::Comparison => "comparison",
            QueryCategory::RiskAssessment => "risk_assessment",
            QueryCategory::ConceptExplanation => "concept_explanation",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            QueryCategory::SiteValuation => "the financial value of a named site",
            QueryCategory::ProvenanceDrilldown => {
                "where a number comes from: sources, citations, evidence chain"
            }
            QueryCategory::AxiomExplanation => "what a specific bridge axiom says and how it is used",
            QueryCategory::Comparison => "comparing two or more sites or axioms",
            QueryCategory::RiskAssessment => "value at risk under degradation or policy scenarios",
            QueryCategory::ConceptExplanation => {
                "how an ecological mechanism or topic (e.g. blue carbon) works, not tied to a site"
            }
        }
    }
}

impl FromStr for QueryCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase().replace(['-', ' '], "_");
        QueryCategory::ALL
            .into_iter()
            .find(|c| c.as_str() == key)
            .ok_or_else(|| format!("unknown category {s:?}"))
    }
}

// =============================================================================
// CLASSIFIER SEAM
// =============================================================================

/// A category decision from a secondary classifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryVerdict {
    pub category: QueryCategory,
    pub confidence: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Swappable category classifier. The LLM fallback implements it; tests mock it.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, question: &str) -> Result<CategoryVerdict, ClassifierError>;
}

// =============================================================================
// RESULT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Rules,
    Fallback,
    Default,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: QueryCategory,
    /// Primary canonical site, if any.
    pub site: Option<String>,
    /// All canonical sites mentioned, primary first.
    pub sites: Vec<String>,
    pub axiom_ids: Vec<String>,
    pub concept_id: Option<String>,
    pub metric: Option<String>,
    pub confidence: f64,
    pub source: ClassificationSource,
    /// Why the result degraded, when it did.
    pub notes: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Rule outcomes below this confidence count as inconclusive.
    pub min_rule_confidence: f64,
    /// Fallback verdicts below this confidence are discarded.
    pub fallback_floor: f64,
    /// Confidence attached to the deterministic default.
    pub default_confidence: f64,
    pub fallback_timeout: Duration,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_rule_confidence: 0.5,
            fallback_floor: 0.25,
            default_confidence: 0.3,
            fallback_timeout: Duration::from_secs(8),
        }
    }
}

// =============================================================================
// QUERY CLASSIFIER
// =============================================================================

pub struct QueryClassifier {
    registry: Arc<AxiomRegistry>,
    aliases: SiteAliases,
    fallback: Option<Arc<dyn Classifier>>,
    config: ClassifierConfig,
}

impl QueryClassifier {
    pub fn new(registry: Arc<AxiomRegistry>, aliases: SiteAliases, config: ClassifierConfig) -> Self {
        Self {
            registry,
            aliases,
            fallback: None,
            config,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Classifier>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn aliases(&self) -> &SiteAliases {
        &self.aliases
    }

    /// Pure rule pass. An explicit site override becomes the primary site.
    pub fn classify_rules(&self, question: &str, site_override: Option<&str>) -> RuleOutcome {
        let normalized = normalize(question);
        let mut sites = self.aliases.find_all(&normalized);
        if let Some(site) = site_override {
            let canonical = self
                .aliases
                .resolve(site)
                .map(str::to_string)
                .unwrap_or_else(|| site.trim().to_string());
            sites.retain(|s| *s != canonical);
            sites.insert(0, canonical);
        }
        apply_rules(&normalized, &self.registry, sites)
    }

    pub async fn classify(&self, question: &str, site_override: Option<&str>) -> Classification {
        let outcome = self.classify_rules(question, site_override);

        if let Some(category) = outcome.category {
            if outcome.confidence >= self.config.min_rule_confidence {
                debug!(category = category.as_str(), confidence = outcome.confidence, "rules classified question");
                return build(outcome, category, ClassificationSource::Rules, Vec::new());
            }
        }

        let mut notes = Vec::new();
        match self.consult_fallback(question).await {
            Ok(verdict) if verdict.confidence >= self.config.fallback_floor => {
                info!(
                    category = verdict.category.as_str(),
                    confidence = verdict.confidence,
                    "fallback classified question"
                );
                let mut outcome = outcome;
                outcome.confidence = verdict.confidence.clamp(0.0, 1.0);
                return build(outcome, verdict.category, ClassificationSource::Fallback, notes);
            }
            Ok(verdict) => notes.push(format!(
                "classification ambiguous: fallback confidence {:.2} below floor {:.2}",
                verdict.confidence, self.config.fallback_floor
            )),
            Err(reason) => notes.push(format!("classification ambiguous: {reason}")),
        }

        warn!(notes = ?notes, "defaulting to site_valuation");
        let mut outcome = outcome;
        outcome.confidence = self.config.default_confidence;
        build(outcome, QueryCategory::SiteValuation, ClassificationSource::Default, notes)
    }

    async fn consult_fallback(&self, question: &str) -> Result<CategoryVerdict, String> {
        let Some(fallback) = &self.fallback else {
            return Err("rules inconclusive and no fallback classifier configured".into());
        };
        match tokio::time::timeout(self.config.fallback_timeout, fallback.classify(question)).await {
            Ok(Ok(verdict)) => Ok(verdict),
            Ok(Err(err)) => Err(format!("fallback classifier failed: {err}")),
            Err(_) => Err(format!(
                "fallback classifier timed out after {:?}",
                self.config.fallback_timeout
            )),
        }
    }
}

fn build(
    outcome: RuleOutcome,
    category: QueryCategory,
    source: ClassificationSource,
    notes: Vec<String>,
) -> Classification {
    Classification {
        category,
        site: outcome.sites.first().cloned(),
        sites: outcome.sites,
        axiom_ids: outcome.axiom_ids,
        concept_id: outcome.concept_id,
        metric: outcome.metric,
        confidence: outcome.confidence,
        source,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_round_trip_through_strings() {
        for c in QueryCategory::ALL {
            assert_eq!(c.as_str().parse::<QueryCategory>().unwrap(), c);
        }
        assert_eq!(
            "Risk Assessment".parse::<QueryCategory>().unwrap(),
            QueryCategory::RiskAssessment
        );
        assert!("weather".parse::<QueryCategory>().is_err());
    }
}
