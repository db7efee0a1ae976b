use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use esv_bridge::classifier::{
    CategoryVerdict, Classifier, ClassifierConfig, ClassifierError, ClassificationSource, QueryCategory,
    QueryClassifier, SiteAliases,
};
use esv_bridge::evidence::GraphSnapshot;
use esv_bridge::registry::AxiomRegistry;

const CATALOG: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data/catalog.json");
const GRAPH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/data/graph.json");

struct FixedVerdict {
    verdict: CategoryVerdict,
    delay: Duration,
}

#[async_trait]
impl Classifier for FixedVerdict {
    async fn classify(&self, _question: &str) -> Result<CategoryVerdict, ClassifierError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.verdict)
    }
}

fn classifier(config: ClassifierConfig) -> QueryClassifier {
    let registry = Arc::new(AxiomRegistry::from_path(CATALOG).unwrap());
    let snapshot = GraphSnapshot::from_path(GRAPH).unwrap();
    QueryClassifier::new(registry, SiteAliases::from_sites(&snapshot.sites), config)
}

fn with_fallback(category: QueryCategory, confidence: f64, delay: Duration, config: ClassifierConfig) -> QueryClassifier {
    classifier(config).with_fallback(Arc::new(FixedVerdict {
        verdict: CategoryVerdict { category, confidence },
        delay,
    }))
}

#[tokio::test]
async fn informal_site_name_resolves_to_canonical() {
    let c = classifier(ClassifierConfig::default()).classify("What is Cabo Pulmo worth?", None).await;
    assert_eq!(c.category, QueryCategory::SiteValuation);
    assert_eq!(c.site.as_deref(), Some("Cabo Pulmo National Park"));
    assert_eq!(c.source, ClassificationSource::Rules);
    assert!(c.confidence >= 0.5);
}

#[tokio::test]
async fn lowercase_axiom_id_is_an_axiom_question() {
    let c = classifier(ClassifierConfig::default()).classify("explain ba-002 please", None).await;
    assert_eq!(c.category, QueryCategory::AxiomExplanation);
    assert_eq!(c.axiom_ids, vec!["BA-002"]);
}

#[tokio::test]
async fn axiom_id_case_does_not_change_the_classification() {
    let c = classifier(ClassifierConfig::default());
    let upper = c.classify("Explain BA-002", None).await;
    let lower = c.classify("explain ba-002", None).await;
    assert_eq!(upper.category, QueryCategory::AxiomExplanation);
    assert_eq!(upper.category, lower.category);
    assert_eq!(upper.axiom_ids, vec!["BA-002"]);
    assert_eq!(upper.axiom_ids, lower.axiom_ids);
}

#[tokio::test]
async fn comparing_axioms_without_two_sites_is_an_axiom_question() {
    let c = classifier(ClassifierConfig::default());
    let axioms = c.classify("Compare BA-001 and BA-002", None).await;
    assert_eq!(axioms.category, QueryCategory::AxiomExplanation);

    let sites = c.classify("Compare BA-001 at Cabo Pulmo and Ningaloo", None).await;
    assert_eq!(sites.category, QueryCategory::Comparison);
    assert_eq!(sites.sites.len(), 2);
}

#[tokio::test]
async fn two_sites_make_a_comparison() {
    let c = classifier(ClassifierConfig::default())
        .classify("Compare Ningaloo with Cabo Pulmo", None)
        .await;
    assert_eq!(c.category, QueryCategory::Comparison);
    assert_eq!(c.sites, vec!["Ningaloo Reef", "Cabo Pulmo National Park"]);
}

#[tokio::test]
async fn risk_words_with_a_site_and_metric() {
    let c = classifier(ClassifierConfig::default())
        .classify("What tourism revenue does Cabo Pulmo risk losing to bleaching?", None)
        .await;
    assert_eq!(c.category, QueryCategory::RiskAssessment);
    assert_eq!(c.metric.as_deref(), Some("tourism"));
}

#[tokio::test]
async fn site_override_becomes_primary() {
    let c = classifier(ClassifierConfig::default())
        .classify("How much is it worth?", Some("magdalena bay"))
        .await;
    assert_eq!(c.category, QueryCategory::SiteValuation);
    assert_eq!(c.site.as_deref(), Some("Magdalena Bay Mangroves"));
}

#[tokio::test]
async fn fallback_decides_when_rules_are_silent() {
    let c = with_fallback(
        QueryCategory::ConceptExplanation,
        0.8,
        Duration::ZERO,
        ClassifierConfig::default(),
    )
    .classify("Tell me something interesting", None)
    .await;
    assert_eq!(c.category, QueryCategory::ConceptExplanation);
    assert_eq!(c.source, ClassificationSource::Fallback);
    assert!((c.confidence - 0.8).abs() < 1e-9);
}

#[tokio::test]
async fn slow_fallback_degrades_to_default() {
    let config = ClassifierConfig {
        fallback_timeout: Duration::from_millis(20),
        ..ClassifierConfig::default()
    };
    let c = with_fallback(QueryCategory::Comparison, 0.9, Duration::from_secs(5), config)
        .classify("Tell me something interesting", None)
        .await;
    assert_eq!(c.category, QueryCategory::SiteValuation);
    assert_eq!(c.source, ClassificationSource::Default);
    assert!((c.confidence - 0.3).abs() < 1e-9);
    assert!(c.notes.iter().any(|n| n.contains("timed out")));
}

#[tokio::test]
async fn fallback_below_floor_is_ignored() {
    let c = with_fallback(
        QueryCategory::Comparison,
        0.1,
        Duration::ZERO,
        ClassifierConfig::default(),
    )
    .classify("Tell me something interesting", None)
    .await;
    assert_eq!(c.source, ClassificationSource::Default);
    assert_eq!(c.category, QueryCategory::SiteValuation);
    assert!(c.notes.iter().any(|n| n.contains("below floor")));
}
