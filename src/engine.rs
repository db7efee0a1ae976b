//! Question answering over the axiom catalog and evidence store.
//!
//! `ReasoningEngine::answer` classifies a question, dispatches to the handler
//! for its category, scores the result and, when a generator is configured,
//! has it phrased. Every handler produces a deterministic context block; the
//! template answer is built from the same numbers, and generated prose is
//! checked against that block before its confidence is trusted.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::axiom::{BridgeAxiom, EvidenceRef};
use crate::chain::{
    backward_chain, forward_chain, ChainError, ClaimTarget, InputSource, ProvenanceTrail, ServiceValue,
    SkipReason, TranslationChain,
};
use crate::classifier::{Classification, ClassificationSource, QueryCategory, QueryClassifier};
use crate::confidence::{compute, verify_numeric_claims, ConfidenceBreakdown, ConfidenceCap, ConfidenceInputs};
use crate::config::EngineConfig;
use crate::evidence::{
    bind_evidence, bind_site, edges_from, query_with_timeout, BoundEvidence, EcologicalState, EvidenceError,
    EvidenceQuery, EvidenceStore, GraphEdge, GraphNode,
};
use crate::generation::AnswerGenerator;
use crate::monte_carlo::{simulate, SimulationResult};
use crate::registry::{AxiomNotFound, AxiomRegistry};
use crate::scenario::{ScenarioError, ScenarioParameters};
use crate::sensitivity::{analyze, SensitivityReport};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Scenario(#[from] ScenarioError),
    #[error(transparent)]
    AxiomNotFound(#[from] AxiomNotFound),
}

impl EngineError {
    /// Short stable code for callers and logs.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Evidence(EvidenceError::Unavailable { .. }) => "evidence_unavailable",
            EngineError::Evidence(EvidenceError::NotFound(_)) => "evidence_not_found",
            EngineError::Evidence(EvidenceError::Malformed { .. }) => "evidence_malformed",
            EngineError::Evidence(EvidenceError::Cache(_)) => "evidence_cache",
            EngineError::Chain(ChainError::Cycle { .. }) => "chain_cycle",
            EngineError::Chain(ChainError::NoApplicableAxioms { .. }) => "no_applicable_axioms",
            EngineError::Chain(ChainError::AxiomNotFound(_)) | EngineError::AxiomNotFound(_) => "axiom_not_found",
            EngineError::Scenario(_) => "scenario_out_of_bounds",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Evidence(e) if e.is_retryable())
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::Evidence(EvidenceError::Unavailable { retry_after, .. }) => Some(*retry_after),
            _ => None,
        }
    }

    /// Failures on our side rather than the caller's.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            EngineError::Chain(ChainError::Cycle { .. })
                | EngineError::Evidence(EvidenceError::Malformed { .. })
                | EngineError::Evidence(EvidenceError::Unavailable { .. })
                | EngineError::Evidence(EvidenceError::Cache(_))
        )
    }
}

// =============================================================================
// REQUEST / RESULT
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    pub question: String,
    /// Explicit site, taking precedence over sites named in the question.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<ScenarioParameters>,
    #[serde(default)]
    pub simulate: bool,
    #[serde(default)]
    pub sensitivity: bool,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            ..Default::default()
        }
    }

    pub fn site(mut self, site: impl Into<String>) -> Self {
        self.site = Some(site.into());
        self
    }

    pub fn scenario(mut self, scenario: ScenarioParameters) -> Self {
        self.scenario = Some(scenario);
        self
    }

    pub fn with_simulation(mut self) -> Self {
        self.simulate = true;
        self
    }

    pub fn with_sensitivity(mut self) -> Self {
        self.sensitivity = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    Template,
    Generated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioComparison {
    pub description: String,
    pub baseline_total: f64,
    pub scenario_total: f64,
    pub delta: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Valuation {
    pub site: String,
    pub services: Vec<ServiceValue>,
    pub total_value: f64,
    /// Sum of per-service lower bounds.
    pub total_low: f64,
    /// Sum of per-service upper bounds.
    pub total_high: f64,
    pub value_at_risk: Vec<ServiceValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<ScenarioComparison>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub subject: String,
    pub value: f64,
    pub low: f64,
    pub high: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub query_id: Uuid,
    pub generated_at: String,
    pub question: String,
    pub classification: Classification,
    pub answer: String,
    pub answer_source: AnswerSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_confidence: Option<f64>,
    pub confidence: ConfidenceBreakdown,
    pub axioms_used: Vec<String>,
    pub evidence: Vec<EvidenceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph_path: Option<Vec<GraphEdge>>,
    pub caveats: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain: Option<TranslationChain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<ProvenanceTrail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valuation: Option<Valuation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison: Option<Vec<ComparisonRow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simulation: Option<SimulationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<SensitivityReport>,
}

/// Forward-chained valuation of one site.
#[derive(Debug, Clone)]
pub struct SiteAssessment {
    pub state: EcologicalState,
    pub chain: TranslationChain,
    pub valuation: Valuation,
    pub evidence: Vec<EvidenceRef>,
    pub graph_path: Vec<GraphEdge>,
    pub confidence: ConfidenceBreakdown,
    pub caveats: Vec<String>,
}

/// Handler output before simulation, generation and caps.
struct Draft {
    summary: String,
    facts: Vec<String>,
    evidence: Vec<EvidenceRef>,
    axioms_used: Vec<String>,
    graph_path: Option<Vec<GraphEdge>>,
    confidence: ConfidenceBreakdown,
    caveats: Vec<String>,
    chain: Option<TranslationChain>,
    provenance: Option<ProvenanceTrail>,
    valuation: Option<Valuation>,
    comparison: Option<Vec<ComparisonRow>>,
}

impl Draft {
    fn new(summary: String, facts: Vec<String>, confidence: ConfidenceBreakdown) -> Self {
        Self {
            summary,
            facts,
            evidence: Vec::new(),
            axioms_used: Vec::new(),
            graph_path: None,
            confidence,
            caveats: Vec::new(),
            chain: None,
            provenance: None,
            valuation: None,
            comparison: None,
        }
    }

    fn context(&self) -> String {
        self.facts.join("\n")
    }
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct ReasoningEngine {
    registry: Arc<AxiomRegistry>,
    store: Arc<dyn EvidenceStore>,
    classifier: QueryClassifier,
    generator: Option<Arc<dyn AnswerGenerator>>,
    config: EngineConfig,
}

impl ReasoningEngine {
    pub fn new(
        registry: Arc<AxiomRegistry>,
        store: Arc<dyn EvidenceStore>,
        classifier: QueryClassifier,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            store,
            classifier,
            generator: None,
            config,
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn AnswerGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn registry(&self) -> &AxiomRegistry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn classify(&self, question: &str, site: Option<&str>) -> Classification {
        self.classifier.classify(question, site).await
    }

    pub async fn answer(&self, request: &QueryRequest) -> Result<QueryResult, EngineError> {
        let query_id = Uuid::new_v4();
        let classification = self.classify(&request.question, request.site.as_deref()).await;
        info!(
            %query_id,
            category = classification.category.as_str(),
            confidence = classification.confidence,
            site = ?classification.site,
            "question classified"
        );

        if let Some(scenario) = &request.scenario {
            scenario.validate()?;
        }
        let scenario = request.scenario.as_ref().filter(|s| !s.is_empty());

        let mut draft = match classification.category {
            QueryCategory::SiteValuation => self.site_valuation(&classification, scenario).await?,
            QueryCategory::RiskAssessment => self.risk_assessment(&classification, scenario).await?,
            QueryCategory::Comparison => self.comparison(&classification, scenario).await?,
            QueryCategory::AxiomExplanation => self.axiom_explanation(&classification).await?,
            QueryCategory::ConceptExplanation => self.concept_explanation(&classification).await?,
            QueryCategory::ProvenanceDrilldown => self.provenance(&classification).await?,
        };

        if classification.source == ClassificationSource::Default {
            draft.caveats.extend(classification.notes.iter().cloned());
        }

        let services = draft
            .valuation
            .as_ref()
            .map(|v| v.services.clone())
            .unwrap_or_default();
        let simulation = if request.simulate {
            self.run_simulation(services.clone(), &mut draft.caveats).await
        } else {
            None
        };
        let sensitivity = if request.sensitivity {
            if services.is_empty() {
                draft.caveats.push("sensitivity skipped: no monetary services".into());
                None
            } else {
                Some(analyze(&services))
            }
        } else {
            None
        };

        let (answer, answer_source, claimed_confidence) = self.phrase(&request.question, &mut draft).await;

        if draft.confidence.caps.contains(&ConfidenceCap::NoEvidence) {
            push_unique(
                &mut draft.caveats,
                "no evidence bound; confidence capped at 0.25".to_string(),
            );
        }

        Ok(QueryResult {
            query_id,
            generated_at: Utc::now().to_rfc3339(),
            question: request.question.clone(),
            classification,
            answer,
            answer_source,
            claimed_confidence,
            confidence: draft.confidence,
            axioms_used: draft.axioms_used,
            evidence: draft.evidence,
            graph_path: draft.graph_path,
            caveats: draft.caveats,
            chain: draft.chain,
            provenance: draft.provenance,
            valuation: draft.valuation,
            comparison: draft.comparison,
            simulation,
            sensitivity,
        })
    }

    /// Forward-chain a site, optionally under a scenario and toward one metric.
    pub async fn assess_site(
        &self,
        site: &str,
        scenario: Option<&ScenarioParameters>,
        metric: Option<&str>,
    ) -> Result<SiteAssessment, EngineError> {
        let nodes = self.fetch(EvidenceQuery::site(site, self.config.evidence_hops)).await?;
        let state = bind_site(&nodes)?;
        let bound = bind_evidence(&nodes)?;
        let mut caveats = Vec::new();

        let baseline = self.chain_toward(&state, &BTreeMap::new(), metric, &mut caveats)?;
        let (chain, comparison) = match scenario {
            Some(scenario) => {
                scenario.validate()?;
                let overrides = scenario.input_overrides(&state);
                let mut adjusted = self.chain_toward(&state, &overrides, metric, &mut Vec::new())?;
                scenario.adjust_services(&mut adjusted.services);
                adjusted.total_value = adjusted.services.iter().map(|s| s.mean).sum();
                let delta = adjusted.total_value - baseline.total_value;
                let comparison = ScenarioComparison {
                    description: scenario.describe(),
                    baseline_total: baseline.total_value,
                    scenario_total: adjusted.total_value,
                    delta,
                    delta_pct: (baseline.total_value != 0.0).then(|| 100.0 * delta / baseline.total_value),
                };
                (adjusted, Some(comparison))
            }
            None => (baseline, None),
        };

        let used: HashSet<&str> = chain.steps.iter().map(|s| s.axiom_id.as_str()).collect();
        let evidence = dedupe(
            bound
                .iter()
                .filter(|b| b.axiom_id.as_deref().map_or(true, |id| used.contains(id))),
        );

        let measurement_years = chain
            .steps
            .iter()
            .flat_map(|s| s.inputs.iter())
            .filter_map(|i| match i.source {
                InputSource::Measurement { measurement_year } => measurement_year,
                _ => None,
            })
            .collect();
        let confidence = compute(
            &ConfidenceInputs {
                evidence: &evidence,
                hops: chain.hops(),
                axiom_sources: self.source_counts(chain.steps.iter().map(|s| s.axiom_id.as_str())),
                measurement_years,
            },
            self.config.reference_year,
        );

        for id in chain.low_confidence_axioms() {
            caveats.push(format!(
                "{id} rests on fewer than three independent sources; treat its contribution as provisional"
            ));
        }
        for skipped in &chain.skipped {
            if let SkipReason::MissingInputs { inputs } = &skipped.reason {
                caveats.push(format!(
                    "{} not applied: no value for {}",
                    skipped.axiom_id,
                    inputs.join(", ")
                ));
            }
        }
        if state.is_stale() {
            caveats.push(format!("site data for {} is marked stale", state.site));
        }
        if chain.services.is_empty() {
            caveats.push(format!("no monetary service could be computed for {}", state.site));
        }

        let valuation = Valuation {
            site: state.site.clone(),
            total_value: chain.total_value,
            total_low: chain.services.iter().map(|s| s.ci_low).sum(),
            total_high: chain.services.iter().map(|s| s.ci_high).sum(),
            services: chain.services.clone(),
            value_at_risk: chain.value_at_risk.clone(),
            scenario: comparison,
        };

        Ok(SiteAssessment {
            graph_path: edges_from(&nodes),
            state,
            chain,
            valuation,
            evidence,
            confidence,
            caveats,
        })
    }

    fn chain_toward(
        &self,
        state: &EcologicalState,
        overrides: &BTreeMap<String, f64>,
        metric: Option<&str>,
        caveats: &mut Vec<String>,
    ) -> Result<TranslationChain, EngineError> {
        match forward_chain(&self.registry, state, overrides, metric) {
            Err(ChainError::NoApplicableAxioms { target, .. }) if metric.is_some() => {
                debug!(site = %state.site, %target, "no producer for metric, chaining all services");
                caveats.push(format!(
                    "no axiom produces {target} for {}; reporting all services instead",
                    state.site
                ));
                Ok(forward_chain(&self.registry, state, overrides, None)?)
            }
            other => Ok(other?),
        }
    }

    // -------------------------------------------------------------------------
    // handlers
    // -------------------------------------------------------------------------

    async fn site_valuation(
        &self,
        classification: &Classification,
        scenario: Option<&ScenarioParameters>,
    ) -> Result<Draft, EngineError> {
        let Some(site) = classification.site.as_deref() else {
            return Ok(self.degraded("no site could be identified in the question; name a site to value"));
        };
        let assessment = self
            .assess_site(site, scenario, classification.metric.as_deref())
            .await?;

        let v = &assessment.valuation;
        let mut facts = vec![format!("site: {}", v.site)];
        facts.extend(service_facts(&v.services));
        facts.push(format!(
            "total value: {} USD/yr (range {} to {})",
            amount(v.total_value),
            amount(v.total_low),
            amount(v.total_high)
        ));
        let mut summary = if v.services.is_empty() {
            format!("No monetary value could be derived for {} from the catalog.", v.site)
        } else {
            format!(
                "{} is valued at about {} USD/yr (range {} to {}) across {} services.",
                v.site,
                amount(v.total_value),
                amount(v.total_low),
                amount(v.total_high),
                v.services.len()
            )
        };
        if let Some(s) = &v.scenario {
            facts.extend(scenario_facts(s));
            summary.push_str(&format!(
                " Under {}, the total moves from {} to {}.",
                s.description,
                amount(s.baseline_total),
                amount(s.scenario_total)
            ));
        }
        Ok(self.assessment_draft(summary, facts, assessment))
    }

    async fn risk_assessment(
        &self,
        classification: &Classification,
        scenario: Option<&ScenarioParameters>,
    ) -> Result<Draft, EngineError> {
        let Some(site) = classification.site.as_deref() else {
            return Ok(self.degraded("risk assessment needs a site; none was identified"));
        };
        let assessment = self.assess_site(site, scenario, None).await?;
        let v = &assessment.valuation;

        let mut facts = vec![format!("site: {}", v.site)];
        facts.extend(service_facts(&v.services));
        for risk in &v.value_at_risk {
            facts.push(format!(
                "value at risk, {} ({}): {} USD (range {} to {})",
                risk.service,
                risk.axiom_id,
                amount(risk.mean),
                amount(risk.ci_low),
                amount(risk.ci_high)
            ));
        }

        let mut no_scenario = None;
        let summary = match &v.scenario {
            Some(s) => {
                facts.extend(scenario_facts(s));
                let loss = (s.baseline_total - s.scenario_total).max(0.0);
                facts.push(format!("scenario loss: {} USD/yr", amount(loss)));
                format!(
                    "Under {}, {} would lose about {} USD/yr ({} to {}).",
                    s.description,
                    v.site,
                    amount(loss),
                    amount(s.baseline_total),
                    amount(s.scenario_total)
                )
            }
            None => {
                no_scenario = Some("no scenario parameters given; risk reflects catalog risk axioms only".to_string());
                if v.value_at_risk.is_empty() {
                    format!("No risk axiom applies to {} and no scenario was given.", v.site)
                } else {
                    let at_risk: f64 = v.value_at_risk.iter().map(|r| r.mean).sum();
                    facts.push(format!("total value at risk: {} USD", amount(at_risk)));
                    format!("Catalog risk axioms put {} USD at risk for {}.", amount(at_risk), v.site)
                }
            }
        };
        let mut draft = self.assessment_draft(summary, facts, assessment);
        draft.caveats.extend(no_scenario);
        Ok(draft)
    }

    async fn comparison(
        &self,
        classification: &Classification,
        scenario: Option<&ScenarioParameters>,
    ) -> Result<Draft, EngineError> {
        if classification.sites.len() >= 2 {
            return self.compare_sites(&classification.sites, scenario, classification.metric.as_deref()).await;
        }
        if classification.axiom_ids.len() >= 2 {
            return self.compare_axioms(&classification.axiom_ids).await;
        }
        Ok(self.degraded("comparison needs two sites or two axioms; fewer were identified"))
    }

    async fn compare_sites(
        &self,
        sites: &[String],
        scenario: Option<&ScenarioParameters>,
        metric: Option<&str>,
    ) -> Result<Draft, EngineError> {
        let mut rows = Vec::with_capacity(sites.len());
        let mut facts = Vec::new();
        let mut evidence = Vec::new();
        let mut axioms_used = Vec::new();
        let mut caveats = Vec::new();
        let mut graph_path = Vec::new();
        let mut weakest: Option<ConfidenceBreakdown> = None;

        for site in sites {
            let a = self.assess_site(site, scenario, metric).await?;
            let v = &a.valuation;
            facts.push(format!(
                "{}: {} USD/yr (range {} to {}), confidence {:.2}",
                v.site,
                amount(v.total_value),
                amount(v.total_low),
                amount(v.total_high),
                a.confidence.composite
            ));
            rows.push(ComparisonRow {
                subject: v.site.clone(),
                value: v.total_value,
                low: v.total_low,
                high: v.total_high,
                confidence: a.confidence.composite,
            });
            for id in a.chain.axiom_ids() {
                if !axioms_used.contains(&id) {
                    axioms_used.push(id);
                }
            }
            evidence.extend(a.evidence);
            caveats.extend(a.caveats);
            graph_path.extend(a.graph_path);
            if weakest.as_ref().map_or(true, |w| a.confidence.composite < w.composite) {
                weakest = Some(a.confidence);
            }
        }

        rows.sort_by(|a, b| b.value.total_cmp(&a.value));
        let summary = match (rows.first(), rows.last()) {
            (Some(top), Some(bottom)) => format!(
                "{} has the highest estimated value at {} USD/yr; {} the lowest at {} USD/yr.",
                top.subject,
                amount(top.value),
                bottom.subject,
                amount(bottom.value)
            ),
            _ => "No sites could be compared.".to_string(),
        };
        let confidence = weakest.unwrap_or_else(|| self.score(&[], 0, Vec::new()));
        let mut draft = Draft::new(summary, facts, confidence);
        draft.evidence = dedupe_refs(evidence);
        draft.axioms_used = axioms_used;
        draft.caveats = caveats;
        draft.graph_path = Some(graph_path);
        draft.comparison = Some(rows);
        Ok(draft)
    }

    async fn compare_axioms(&self, ids: &[String]) -> Result<Draft, EngineError> {
        let mut rows = Vec::new();
        let mut facts = Vec::new();
        let mut evidence = Vec::new();
        let mut graph_path = Vec::new();
        let mut axioms = Vec::new();
        for id in ids {
            let axiom = self.registry.lookup_by_id(id)?;
            let nodes = self.fetch(EvidenceQuery::axiom(&axiom.id, 1)).await?;
            evidence.extend(bind_evidence(&nodes)?.into_iter().map(|b| b.reference));
            graph_path.extend(edges_from(&nodes));
            facts.extend(axiom_facts(axiom));
            rows.push(ComparisonRow {
                subject: axiom.id.clone(),
                value: axiom.coefficient,
                low: axiom.ci_low,
                high: axiom.ci_high,
                confidence: 0.0,
            });
            axioms.push(axiom);
        }
        let evidence = dedupe_refs(evidence);
        let confidence = self.score(&evidence, 1, axioms.iter().map(|a| a.independent_sources()).collect());
        for row in &mut rows {
            row.confidence = confidence.composite;
        }
        let summary = axioms
            .iter()
            .map(|a| {
                format!(
                    "{} ({}) applies a coefficient of {} [{} to {}] per unit of {}.",
                    a.id,
                    a.name,
                    amount(a.coefficient),
                    amount(a.ci_low),
                    amount(a.ci_high),
                    a.inputs.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(" x ")
                )
            })
            .collect::<Vec<_>>()
            .join(" ");
        let mut draft = Draft::new(summary, facts, confidence);
        draft.caveats = low_confidence_caveats(&axioms);
        draft.axioms_used = axioms.iter().map(|a| a.id.clone()).collect();
        draft.evidence = evidence;
        draft.graph_path = Some(graph_path);
        draft.comparison = Some(rows);
        Ok(draft)
    }

    async fn axiom_explanation(&self, classification: &Classification) -> Result<Draft, EngineError> {
        if classification.axiom_ids.is_empty() {
            return Ok(self.degraded("no axiom id (BA-nnn) found in the question"));
        }
        let mut facts = Vec::new();
        let mut evidence = Vec::new();
        let mut graph_path = Vec::new();
        let mut axioms = Vec::new();
        let mut summaries = Vec::new();
        for id in &classification.axiom_ids {
            let axiom = self.registry.lookup_by_id(id)?;
            let nodes = self.fetch(EvidenceQuery::axiom(&axiom.id, 1)).await?;
            evidence.extend(bind_evidence(&nodes)?.into_iter().map(|b| b.reference));
            graph_path.extend(edges_from(&nodes));
            facts.extend(axiom_facts(axiom));
            summaries.push(format!(
                "{} ({}) converts {} into {} with a coefficient of {} (95% interval {} to {}), backed by {} independent sources.",
                axiom.id,
                axiom.name,
                axiom.inputs.iter().map(|p| p.name.as_str()).collect::<Vec<_>>().join(" and "),
                axiom.output.name,
                amount(axiom.coefficient),
                amount(axiom.ci_low),
                amount(axiom.ci_high),
                axiom.independent_sources()
            ));
            axioms.push(axiom);
        }
        let evidence = dedupe_refs(evidence);
        let confidence = self.score(&evidence, 1, axioms.iter().map(|a| a.independent_sources()).collect());
        let mut draft = Draft::new(summaries.join(" "), facts, confidence);
        draft.caveats = low_confidence_caveats(&axioms);
        draft.axioms_used = axioms.iter().map(|a| a.id.clone()).collect();
        draft.evidence = evidence;
        draft.graph_path = Some(graph_path);
        Ok(draft)
    }

    async fn concept_explanation(&self, classification: &Classification) -> Result<Draft, EngineError> {
        let concept = match classification.concept_id.as_deref().and_then(|id| self.registry.concept(id)) {
            Some(concept) => concept,
            None => return Ok(self.degraded("no catalog concept matches the question")),
        };
        let nodes = self.fetch(EvidenceQuery::concept(&concept.id, 2)).await?;
        let evidence = dedupe(bind_evidence(&nodes)?.iter());

        let axioms: Vec<&BridgeAxiom> = concept
            .involved_axiom_ids
            .iter()
            .filter_map(|id| self.registry.lookup_by_id(id).ok())
            .collect();
        let mut facts = vec![
            format!("concept: {} ({})", concept.name, concept.domain),
            format!("description: {}", concept.description),
        ];
        for axiom in &axioms {
            facts.extend(axiom_facts(axiom));
        }
        let summary = format!(
            "{}: {} It is quantified in the catalog by {}.",
            concept.name,
            concept.description.trim(),
            if axioms.is_empty() {
                "no axioms".to_string()
            } else {
                axioms.iter().map(|a| a.id.as_str()).collect::<Vec<_>>().join(", ")
            }
        );
        let confidence = self.score(&evidence, 2, axioms.iter().map(|a| a.independent_sources()).collect());
        let mut draft = Draft::new(summary, facts, confidence);
        draft.caveats = low_confidence_caveats(&axioms);
        draft.axioms_used = axioms.iter().map(|a| a.id.clone()).collect();
        draft.evidence = evidence;
        draft.graph_path = Some(edges_from(&nodes));
        Ok(draft)
    }

    async fn provenance(&self, classification: &Classification) -> Result<Draft, EngineError> {
        let habitats = match classification.site.as_deref() {
            Some(site) => {
                let nodes = self.fetch(EvidenceQuery::site(site, 1)).await?;
                Some(bind_site(&nodes)?.habitats)
            }
            None => None,
        };

        let claim = if let Some(id) = classification.axiom_ids.first() {
            ClaimTarget::Axiom(id.clone())
        } else if let Some(metric) = &classification.metric {
            ClaimTarget::Metric(metric.clone())
        } else if habitats.is_some() {
            // Every currency output: the site's valuation as a whole.
            ClaimTarget::Metric("usd".to_string())
        } else {
            return Ok(self.degraded(
                "provenance needs an axiom id, a metric or a site to trace; none was identified",
            ));
        };

        let trail = backward_chain(&self.registry, &claim, habitats.as_ref(), self.config.max_hops)?;
        let mut evidence = Vec::new();
        let mut graph_path = trail.edges.clone();
        let mut axioms = Vec::new();
        let mut facts = Vec::new();
        for id in &trail.axioms {
            let axiom = self.registry.lookup_by_id(id)?;
            let nodes = self.fetch(EvidenceQuery::axiom(&axiom.id, 1)).await?;
            for bound in bind_evidence(&nodes)? {
                facts.push(format!("{} cites {}", axiom.id, describe_ref(&bound.reference)));
                evidence.push(bound.reference);
            }
            graph_path.extend(edges_from(&nodes));
            facts.extend(axiom_facts(axiom));
            axioms.push(axiom);
        }
        if !trail.primary_inputs.is_empty() {
            facts.push(format!("primary measured inputs: {}", trail.primary_inputs.join(", ")));
        }
        let evidence = dedupe_refs(evidence);
        let confidence = self.score(
            &evidence,
            trail.hops,
            axioms.iter().map(|a| a.independent_sources()).collect(),
        );
        let summary = format!(
            "The claim traces through {} ({} hops) to {} cited sources{}.",
            trail.axioms.join(" <- "),
            trail.hops,
            evidence.len(),
            if trail.primary_inputs.is_empty() {
                String::new()
            } else {
                format!(" and the measured inputs {}", trail.primary_inputs.join(", "))
            }
        );

        let mut draft = Draft::new(summary, facts, confidence);
        draft.caveats = low_confidence_caveats(&axioms);
        if trail.truncated {
            draft.caveats.push(format!(
                "provenance truncated at {} hops; deeper supporting axioms were not traced",
                self.config.max_hops
            ));
        }
        draft.axioms_used = trail.axioms.clone();
        draft.evidence = evidence;
        draft.graph_path = Some(graph_path);
        draft.provenance = Some(trail);
        Ok(draft)
    }

    // -------------------------------------------------------------------------
    // helpers
    // -------------------------------------------------------------------------

    async fn fetch(&self, query: EvidenceQuery) -> Result<Vec<GraphNode>, EvidenceError> {
        query_with_timeout(self.store.as_ref(), &query, self.config.evidence_timeout).await
    }

    fn source_counts<'a>(&self, ids: impl Iterator<Item = &'a str>) -> Vec<usize> {
        ids.filter_map(|id| self.registry.lookup_by_id(id).ok())
            .map(BridgeAxiom::independent_sources)
            .collect()
    }

    fn score(&self, evidence: &[EvidenceRef], hops: usize, axiom_sources: Vec<usize>) -> ConfidenceBreakdown {
        compute(
            &ConfidenceInputs {
                evidence,
                hops,
                axiom_sources,
                measurement_years: Vec::new(),
            },
            self.config.reference_year,
        )
    }

    fn degraded(&self, reason: &str) -> Draft {
        warn!(reason, "answer degraded");
        let mut draft = Draft::new(
            format!("No answer could be derived: {reason}."),
            Vec::new(),
            self.score(&[], 0, Vec::new()),
        );
        draft.caveats.push(reason.to_string());
        draft
    }

    fn assessment_draft(&self, summary: String, facts: Vec<String>, a: SiteAssessment) -> Draft {
        let mut draft = Draft::new(summary, facts, a.confidence);
        draft.axioms_used = a.chain.axiom_ids();
        draft.evidence = a.evidence;
        draft.caveats = a.caveats;
        draft.graph_path = Some(a.graph_path);
        draft.chain = Some(a.chain);
        draft.valuation = Some(a.valuation);
        draft
    }

    async fn run_simulation(&self, services: Vec<ServiceValue>, caveats: &mut Vec<String>) -> Option<SimulationResult> {
        if services.is_empty() {
            caveats.push("simulation skipped: no monetary services".into());
            return None;
        }
        let config = self.config.monte_carlo.clone();
        let outcome = match tokio::task::spawn_blocking(move || simulate(&services, &config)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(error = %err, "simulation task failed");
                caveats.push(format!("simulation failed: {err}"));
                return None;
            }
        };
        match outcome {
            Ok(result) => {
                caveats.push("simulation samples services independently; correlated shocks are not modeled".into());
                Some(result)
            }
            Err(err) => {
                warn!(error = %err, "simulation failed");
                caveats.push(format!("simulation failed: {err}"));
                None
            }
        }
    }

    /// Template answer, or generated prose checked against the context.
    async fn phrase(&self, question: &str, draft: &mut Draft) -> (String, AnswerSource, Option<f64>) {
        let Some(generator) = &self.generator else {
            return (draft.summary.clone(), AnswerSource::Template, None);
        };
        let context = format!("{}\n{}", draft.summary, draft.context());
        match generator.generate(question, &context, &self.config.generation).await {
            Ok(generated) => {
                let check = verify_numeric_claims(&generated.answer_text, &context);
                if !check.all_verified() {
                    warn!(unverified = ?check.unverified, "generated answer contains unverified numbers");
                    draft.confidence.apply_cap(ConfidenceCap::UnverifiedClaim);
                    draft.caveats.push(format!(
                        "answer contains numbers not found in the evidence ({}); confidence capped at 0.35",
                        check.unverified.join(", ")
                    ));
                }
                let known: HashSet<String> = draft
                    .evidence
                    .iter()
                    .flat_map(|e| [e.source_key(), e.title.to_lowercase()])
                    .collect();
                let unknown: Vec<&String> = generated
                    .evidence_used
                    .iter()
                    .filter(|cited| !known.contains(&cited.trim().to_lowercase()))
                    .collect();
                if !unknown.is_empty() {
                    debug!(?unknown, "generator cited sources outside the bound evidence");
                }
                (generated.answer_text, AnswerSource::Generated, Some(generated.claimed_confidence))
            }
            Err(err) => {
                warn!(code = err.code(), error = %err, "generation failed, using template answer");
                draft.caveats.push(format!("generation unavailable ({}); template answer used", err.code()));
                (draft.summary.clone(), AnswerSource::Template, None)
            }
        }
    }
}

// =============================================================================
// FORMATTING
// =============================================================================

fn service_facts(services: &[ServiceValue]) -> Vec<String> {
    services
        .iter()
        .map(|s| {
            format!(
                "{} via {}: {} {} (range {} to {}, {:?})",
                s.service,
                s.axiom_id,
                amount(s.mean),
                s.unit,
                amount(s.ci_low),
                amount(s.ci_high),
                s.distribution
            )
        })
        .collect()
}

fn scenario_facts(s: &ScenarioComparison) -> Vec<String> {
    let mut facts = vec![
        format!("scenario: {}", s.description),
        format!("baseline total: {} USD/yr", amount(s.baseline_total)),
        format!("scenario total: {} USD/yr", amount(s.scenario_total)),
        format!("change: {} USD/yr", amount(s.delta)),
    ];
    if let Some(pct) = s.delta_pct {
        facts.push(format!("change: {pct:.1}%"));
    }
    facts
}

fn axiom_facts(axiom: &BridgeAxiom) -> Vec<String> {
    let mut facts = vec![
        format!("{}: {} [{}]", axiom.id, axiom.name, axiom.category.as_str()),
        format!(
            "{} coefficient: {} (interval {} to {}, {:?}, sample size {})",
            axiom.id,
            amount(axiom.coefficient),
            amount(axiom.ci_low),
            amount(axiom.ci_high),
            axiom.distribution,
            axiom.sample_size
        ),
        format!(
            "{} inputs: {}; output: {} ({})",
            axiom.id,
            axiom
                .inputs
                .iter()
                .map(|p| format!("{} ({})", p.name, p.unit))
                .collect::<Vec<_>>()
                .join(", "),
            axiom.output.name,
            axiom.output.unit
        ),
        format!("{} independent sources: {}", axiom.id, axiom.independent_sources()),
    ];
    if !axiom.description.is_empty() {
        facts.push(format!("{} description: {}", axiom.id, axiom.description));
    }
    facts
}

fn describe_ref(r: &EvidenceRef) -> String {
    let mut text = r.title.clone();
    if let Some(year) = r.year {
        text.push_str(&format!(" ({year})"));
    }
    if let Some(locator) = &r.doi_or_url {
        text.push_str(&format!(", {locator}"));
    }
    text.push_str(&format!(", tier {}", r.effective_tier().as_str()));
    text
}

fn low_confidence_caveats(axioms: &[&BridgeAxiom]) -> Vec<String> {
    axioms
        .iter()
        .filter(|a| a.is_low_confidence())
        .map(|a| {
            format!(
                "{} rests on fewer than three independent sources; treat its contribution as provisional",
                a.id
            )
        })
        .collect()
}

fn dedupe<'a>(bound: impl Iterator<Item = &'a BoundEvidence>) -> Vec<EvidenceRef> {
    dedupe_refs(bound.map(|b| b.reference.clone()).collect())
}

fn dedupe_refs(refs: Vec<EvidenceRef>) -> Vec<EvidenceRef> {
    let mut seen = HashSet::new();
    refs.into_iter().filter(|r| seen.insert(r.source_key())).collect()
}

fn push_unique(caveats: &mut Vec<String>, caveat: String) {
    if !caveats.contains(&caveat) {
        caveats.push(caveat);
    }
}

/// Whole numbers with thousands separators above 1,000; two decimals below.
pub fn amount(value: f64) -> String {
    if value.abs() < 1000.0 {
        return format!("{value:.2}");
    }
    let rounded = value.round() as i64;
    let digits = rounded.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if rounded < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
