use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use esv_bridge::classifier::{ClassifierConfig, QueryCategory, QueryClassifier, SiteAliases};
use esv_bridge::confidence::ConfidenceCap;
use esv_bridge::config::EngineConfig;
use esv_bridge::engine::{AnswerSource, QueryRequest, ReasoningEngine};
use esv_bridge::evidence::{EvidenceError, EvidenceQuery, EvidenceStore, GraphNode, GraphSnapshot, InMemoryEvidenceStore};
use esv_bridge::generation::{AnswerGenerator, GeneratedAnswer, GenerationConstraints};
use esv_bridge::llm::LlmError;
use esv_bridge::registry::AxiomRegistry;
use esv_bridge::scenario::ScenarioParameters;

const CATALOG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data/catalog.json");
const GRAPH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data/graph.json");

fn config() -> EngineConfig {
    EngineConfig {
        reference_year: 2024,
        ..EngineConfig::default()
    }
}

fn engine_with(store: Option<Arc<dyn EvidenceStore>>, config: EngineConfig) -> ReasoningEngine {
    let registry = Arc::new(AxiomRegistry::from_path(CATALOG).unwrap());
    let snapshot = GraphSnapshot::from_path(GRAPH).unwrap();
    let aliases = SiteAliases::from_sites(&snapshot.sites);
    let store: Arc<dyn EvidenceStore> = match store {
        Some(store) => store,
        None => Arc::new(InMemoryEvidenceStore::new(registry.clone(), snapshot)),
    };
    let classifier = QueryClassifier::new(registry.clone(), aliases, ClassifierConfig::default());
    ReasoningEngine::new(registry, store, classifier, config)
}

fn engine() -> ReasoningEngine {
    engine_with(None, config())
}

struct HangingStore;

#[async_trait]
impl EvidenceStore for HangingStore {
    async fn query(&self, _query: &EvidenceQuery) -> Result<Vec<GraphNode>, EvidenceError> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Vec::new())
    }
}

struct ScriptedGenerator(&'static str);

#[async_trait]
impl AnswerGenerator for ScriptedGenerator {
    async fn generate(
        &self,
        _question: &str,
        _context: &str,
        _constraints: &GenerationConstraints,
    ) -> Result<GeneratedAnswer, LlmError> {
        Ok(GeneratedAnswer {
            answer_text: self.0.to_string(),
            claimed_confidence: 0.9,
            evidence_used: Vec::new(),
        })
    }
}

#[tokio::test]
async fn site_valuation_end_to_end() {
    let result = engine()
        .answer(&QueryRequest::new("What is Cabo Pulmo worth?"))
        .await
        .unwrap();

    assert_eq!(result.classification.category, QueryCategory::SiteValuation);
    assert_eq!(result.answer_source, AnswerSource::Template);
    assert!(result.answer.contains("Cabo Pulmo National Park"));

    let valuation = result.valuation.as_ref().unwrap();
    assert_eq!(valuation.services.len(), 3);
    assert!((valuation.total_value - 35_036_963.65).abs() < 0.01);
    assert!(valuation.total_low < valuation.total_value);
    assert!(valuation.total_high > valuation.total_value);

    for id in ["BA-001", "BA-004", "BA-005", "BA-007"] {
        assert!(result.axioms_used.iter().any(|a| a == id), "missing {id}");
    }
    assert!(!result.evidence.is_empty());
    assert!(!result.confidence.is_capped());
    assert!(result.confidence.composite >= 0.10 && result.confidence.composite <= 0.95);
    assert!(result
        .caveats
        .iter()
        .any(|c| c.starts_with("BA-005 rests on fewer than three")));
    assert!(result.graph_path.as_ref().is_some_and(|p| !p.is_empty()));
}

#[tokio::test]
async fn habitat_loss_scenario_halves_mangrove_value() {
    let request = QueryRequest::new("What happens to Magdalena Bay if mangrove loss reaches 50%?").scenario(
        ScenarioParameters {
            habitat_loss_pct: Some(50.0),
            ..Default::default()
        },
    );
    let result = engine().answer(&request).await.unwrap();

    assert_eq!(result.classification.category, QueryCategory::RiskAssessment);
    let comparison = result.valuation.as_ref().unwrap().scenario.as_ref().unwrap();
    assert!((comparison.baseline_total - 17_040_000.0).abs() < 1e-3);
    assert!((comparison.scenario_total - 8_520_000.0).abs() < 1e-3);
    assert!((comparison.delta_pct.unwrap() + 50.0).abs() < 1e-9);
    assert!(result.answer.contains("8,520,000"));
}

#[tokio::test]
async fn out_of_bounds_scenario_is_rejected() {
    let request = QueryRequest::new("What is Cabo Pulmo worth?").scenario(ScenarioParameters {
        carbon_price_usd_per_t: Some(900.0),
        ..Default::default()
    });
    let err = engine().answer(&request).await.unwrap_err();
    assert_eq!(err.code(), "scenario_out_of_bounds");
}

#[tokio::test]
async fn stale_site_is_flagged() {
    let result = engine()
        .answer(&QueryRequest::new("How much is Ningaloo worth?"))
        .await
        .unwrap();
    assert!(result.caveats.iter().any(|c| c.contains("marked stale")));
    assert!(result
        .caveats
        .iter()
        .any(|c| c == "BA-007 not applied: no value for bleaching_probability"));
    assert!(result.confidence.staleness_discount < 1.0);
}

#[tokio::test]
async fn axiom_and_concept_questions() {
    let engine = engine();

    let axiom = engine.answer(&QueryRequest::new("Explain ba-002")).await.unwrap();
    assert_eq!(axiom.classification.category, QueryCategory::AxiomExplanation);
    assert_eq!(axiom.axioms_used, vec!["BA-002"]);
    assert_eq!(axiom.evidence.len(), 3);

    let concept = engine.answer(&QueryRequest::new("What is blue carbon?")).await.unwrap();
    assert_eq!(concept.classification.category, QueryCategory::ConceptExplanation);
    assert_eq!(concept.axioms_used, vec!["BA-002", "BA-003"]);
    assert!(concept.caveats.iter().any(|c| c.starts_with("BA-003")));
}

#[tokio::test]
async fn provenance_of_a_site_metric() {
    let result = engine()
        .answer(&QueryRequest::new("Where does the tourism value for Cabo Pulmo come from?"))
        .await
        .unwrap();
    assert_eq!(result.classification.category, QueryCategory::ProvenanceDrilldown);
    let trail = result.provenance.as_ref().unwrap();
    assert_eq!(trail.axioms[0], "BA-001");
    assert!(trail.axioms.iter().any(|a| a == "BA-006"));
    assert!(trail.primary_inputs.iter().any(|i| i == "reef_area_ha"));
    assert!(!trail.truncated);
}

#[tokio::test]
async fn comparison_ranks_sites_by_value() {
    let result = engine()
        .answer(&QueryRequest::new("Compare Magdalena Bay versus Cabo Pulmo"))
        .await
        .unwrap();
    assert_eq!(result.classification.category, QueryCategory::Comparison);
    let rows = result.comparison.as_ref().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].subject, "Cabo Pulmo National Park");
    let weakest = rows.iter().map(|r| r.confidence).fold(f64::INFINITY, f64::min);
    assert!((result.confidence.composite - weakest).abs() < 1e-12);
}

#[tokio::test]
async fn siteless_valuation_degrades_with_capped_confidence() {
    let result = engine()
        .answer(&QueryRequest::new("How much is a reef worth?"))
        .await
        .unwrap();
    assert!(result.valuation.is_none());
    assert!(result.confidence.caps.contains(&ConfidenceCap::NoEvidence));
    assert!(result.confidence.composite <= 0.25);
    assert!(result.caveats.iter().any(|c| c.contains("capped at 0.25")));
}

#[tokio::test]
async fn simulation_and_sensitivity_on_request() {
    let mut config = config();
    config.monte_carlo.iterations = 2_000;
    let request = QueryRequest::new("What is Cabo Pulmo worth?")
        .with_simulation()
        .with_sensitivity();
    let result = engine_with(None, config).answer(&request).await.unwrap();

    let simulation = result.simulation.as_ref().unwrap();
    assert_eq!(simulation.iterations, 2_000);
    assert!(simulation.p5 < simulation.p95);
    let sensitivity = result.sensitivity.as_ref().unwrap();
    assert_eq!(sensitivity.evaluations, 13);
    assert!(result.caveats.iter().any(|c| c.contains("independently")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_simulations_are_reproducible() {
    let mut config = config();
    config.monte_carlo.iterations = 2_000;
    let engine = Arc::new(engine_with(None, config));
    let request = QueryRequest::new("What is Cabo Pulmo worth?").with_simulation();

    let (a, b) = tokio::join!(engine.answer(&request), engine.answer(&request));
    let a = a.unwrap().simulation.unwrap();
    let b = b.unwrap().simulation.unwrap();
    assert_eq!(a.p50, b.p50);
    assert_eq!(a.mean, b.mean);
}

#[tokio::test]
async fn unavailable_store_reports_retry_hint() {
    let config = EngineConfig {
        evidence_timeout: Duration::from_millis(50),
        ..config()
    };
    let engine = engine_with(Some(Arc::new(HangingStore)), config);
    let err = engine
        .answer(&QueryRequest::new("What is Cabo Pulmo worth?"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "evidence_unavailable");
    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(Duration::from_millis(50)));
}

#[tokio::test]
async fn invented_numbers_cap_generated_answers() {
    let engine = engine().with_generator(Arc::new(ScriptedGenerator(
        "Cabo Pulmo National Park is worth 99 million USD per year.",
    )));
    let result = engine
        .answer(&QueryRequest::new("What is Cabo Pulmo worth?"))
        .await
        .unwrap();
    assert_eq!(result.answer_source, AnswerSource::Generated);
    assert_eq!(result.claimed_confidence, Some(0.9));
    assert!(result.confidence.caps.contains(&ConfidenceCap::UnverifiedClaim));
    assert!(result.confidence.composite <= 0.35);
    assert!(result.caveats.iter().any(|c| c.contains("99 million")));
}

#[tokio::test]
async fn grounded_numbers_keep_confidence() {
    let engine = engine().with_generator(Arc::new(ScriptedGenerator(
        "Cabo Pulmo National Park is worth about 35 million USD per year.",
    )));
    let result = engine
        .answer(&QueryRequest::new("What is Cabo Pulmo worth?"))
        .await
        .unwrap();
    assert_eq!(result.answer_source, AnswerSource::Generated);
    assert!(!result.confidence.caps.contains(&ConfidenceCap::UnverifiedClaim));
}
