//! Forward and backward chaining over bridge axioms.
//!
//! Forward chaining turns a site's ecological state into service values:
//! applicable axioms are ordered by their input/output dependencies and
//! executed in that order, each output optionally feeding a later input.
//! Backward chaining walks from a financial claim to the axioms and primary
//! inputs that justify it, bounded by a hop limit.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::axiom::{AxiomCategory, BridgeAxiom, DistributionKind, Habitat, ParamSpec};
use crate::evidence::{EcologicalState, GraphEdge};
use crate::registry::AxiomRegistry;

pub const DEFAULT_MAX_HOPS: usize = 4;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ChainError {
    #[error("dependency cycle among axioms {}", axioms.join(", "))]
    Cycle { axioms: Vec<String> },
    #[error("no applicable axiom produces {target:?} for habitats [{habitats}]")]
    NoApplicableAxioms { target: String, habitats: String },
    #[error("axiom {0} not found")]
    AxiomNotFound(String),
}

// =============================================================================
// FORWARD CHAIN TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InputSource {
    Measurement {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        measurement_year: Option<i32>,
    },
    Scenario,
    Axiom {
        axiom_id: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundInput {
    pub name: String,
    pub unit: String,
    pub value: f64,
    pub low: f64,
    pub high: f64,
    pub source: InputSource,
}

/// One executed axiom.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainStep {
    pub axiom_id: String,
    pub axiom_name: String,
    pub category: AxiomCategory,
    pub inputs: Vec<BoundInput>,
    pub output: ParamSpec,
    pub value: f64,
    pub low: f64,
    pub high: f64,
    pub distribution: DistributionKind,
    /// 1 for axioms fed only by measurements, +1 per upstream axiom.
    pub depth: usize,
    /// Fewer than three independent sources back this axiom.
    pub low_confidence: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    MissingInputs { inputs: Vec<String> },
    OutputObserved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedAxiom {
    pub axiom_id: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

/// A terminal monetary value with its uncertainty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceValue {
    pub service: String,
    pub axiom_id: String,
    pub unit: String,
    pub mean: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub distribution: DistributionKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationChain {
    pub site: String,
    pub steps: Vec<ChainStep>,
    pub skipped: Vec<SkippedAxiom>,
    pub services: Vec<ServiceValue>,
    /// Terminal outputs of risk axioms, kept apart from the service total.
    pub value_at_risk: Vec<ServiceValue>,
    pub total_value: f64,
}

impl TranslationChain {
    /// Deepest step in the chain.
    pub fn hops(&self) -> usize {
        self.steps.iter().map(|s| s.depth).max().unwrap_or(0)
    }

    pub fn axiom_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.axiom_id.clone()).collect()
    }

    pub fn low_confidence_axioms(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| s.low_confidence)
            .map(|s| s.axiom_id.as_str())
            .collect()
    }

    pub fn step(&self, axiom_id: &str) -> Option<&ChainStep> {
        self.steps.iter().find(|s| s.axiom_id == axiom_id)
    }
}

/// Whether an output name answers a metric request.
pub fn output_matches(output: &str, target: &str) -> bool {
    let target = target.trim().to_lowercase();
    !target.is_empty() && (output == target || output.contains(&target))
}

// =============================================================================
// FORWARD CHAINING
// =============================================================================

/// Run applicable axioms against a site state.
///
/// `overrides` are scenario-set inputs and take precedence over measurements.
/// Measured quantities take precedence over modeled ones: an axiom whose
/// output the site already measures is skipped. With a `target`, only the
/// producers of matching outputs and the axioms they transitively need run.
pub fn forward_chain(
    registry: &AxiomRegistry,
    state: &EcologicalState,
    overrides: &BTreeMap<String, f64>,
    target: Option<&str>,
) -> Result<TranslationChain, ChainError> {
    let candidates: Vec<&BridgeAxiom> = registry
        .axioms()
        .iter()
        .filter(|a| a.applies_to(&state.habitats))
        .collect();

    let observed = |name: &str| overrides.contains_key(name) || state.measurement(name).is_some();

    let selected = match target {
        None => candidates,
        Some(target) => {
            let roots: Vec<&BridgeAxiom> = candidates
                .iter()
                .copied()
                .filter(|a| output_matches(&a.output.name, target))
                .collect();
            if roots.is_empty() {
                return Err(ChainError::NoApplicableAxioms {
                    target: target.to_string(),
                    habitats: join_habitats(&state.habitats),
                });
            }
            producer_closure(&candidates, roots, &observed)
        }
    };

    let order = dependency_order(&selected)?;

    // output name -> index into `steps`
    let mut produced: HashMap<String, usize> = HashMap::new();
    let mut steps: Vec<ChainStep> = Vec::new();
    let mut skipped = Vec::new();

    for axiom in order {
        if state.measurement(&axiom.output.name).is_some() {
            debug!(axiom = %axiom.id, output = %axiom.output.name, "output measured directly");
            skipped.push(SkippedAxiom {
                axiom_id: axiom.id.clone(),
                reason: SkipReason::OutputObserved,
            });
            continue;
        }

        let mut inputs = Vec::with_capacity(axiom.inputs.len());
        let mut missing = Vec::new();
        let mut upstream_depth = 0;
        for spec in &axiom.inputs {
            let bound = if let Some(value) = overrides.get(&spec.name) {
                Some(point_input(spec, *value, InputSource::Scenario))
            } else if let Some(m) = state.measurement(&spec.name) {
                Some(point_input(
                    spec,
                    m.value,
                    InputSource::Measurement {
                        measurement_year: m.measurement_year,
                    },
                ))
            } else if let Some(&idx) = produced.get(&spec.name) {
                let upstream = &steps[idx];
                upstream_depth = upstream_depth.max(upstream.depth);
                Some(BoundInput {
                    name: spec.name.clone(),
                    unit: spec.unit.clone(),
                    value: upstream.value,
                    low: upstream.low,
                    high: upstream.high,
                    source: InputSource::Axiom {
                        axiom_id: upstream.axiom_id.clone(),
                    },
                })
            } else {
                None
            };
            match bound {
                Some(input) => inputs.push(input),
                None => missing.push(spec.name.clone()),
            }
        }

        if !missing.is_empty() {
            debug!(axiom = %axiom.id, missing = ?missing, "axiom skipped for missing inputs");
            skipped.push(SkippedAxiom {
                axiom_id: axiom.id.clone(),
                reason: SkipReason::MissingInputs { inputs: missing },
            });
            continue;
        }

        produced.insert(axiom.output.name.clone(), steps.len());
        steps.push(execute(axiom, inputs, upstream_depth + 1));
    }

    // Risk axioms report a share of a service; they do not replace it.
    let consumed: HashSet<&str> = steps
        .iter()
        .filter(|s| s.category != AxiomCategory::Risk)
        .flat_map(|s| s.inputs.iter())
        .filter(|i| matches!(i.source, InputSource::Axiom { .. }))
        .map(|i| i.name.as_str())
        .collect();

    let mut services = Vec::new();
    let mut value_at_risk = Vec::new();
    for step in &steps {
        if !step.output.is_currency() || consumed.contains(step.output.name.as_str()) {
            continue;
        }
        let value = ServiceValue {
            service: step.output.name.clone(),
            axiom_id: step.axiom_id.clone(),
            unit: step.output.unit.clone(),
            mean: step.value,
            ci_low: step.low,
            ci_high: step.high,
            distribution: step.distribution,
        };
        if step.category == AxiomCategory::Risk {
            value_at_risk.push(value);
        } else {
            services.push(value);
        }
    }
    let total_value = services.iter().map(|s| s.mean).sum();

    Ok(TranslationChain {
        site: state.site.clone(),
        steps,
        skipped,
        services,
        value_at_risk,
        total_value,
    })
}

fn point_input(spec: &ParamSpec, value: f64, source: InputSource) -> BoundInput {
    BoundInput {
        name: spec.name.clone(),
        unit: spec.unit.clone(),
        value,
        low: value,
        high: value,
        source,
    }
}

/// output = coefficient x product(inputs), bounds from the interval endpoints.
fn execute(axiom: &BridgeAxiom, inputs: Vec<BoundInput>, depth: usize) -> ChainStep {
    let mut value = axiom.coefficient;
    let mut low = axiom.ci_low;
    let mut high = axiom.ci_high;
    for input in &inputs {
        value *= input.value;
        low *= input.low;
        high *= input.high;
    }
    let lo = low.min(high).min(value);
    let hi = low.max(high).max(value);
    ChainStep {
        axiom_id: axiom.id.clone(),
        axiom_name: axiom.name.clone(),
        category: axiom.category,
        inputs,
        output: axiom.output.clone(),
        value,
        low: lo,
        high: hi,
        distribution: axiom.distribution,
        depth,
        low_confidence: axiom.is_low_confidence(),
    }
}

/// Roots plus every candidate that produces an input the chain cannot observe.
fn producer_closure<'a>(
    candidates: &[&'a BridgeAxiom],
    roots: Vec<&'a BridgeAxiom>,
    observed: &dyn Fn(&str) -> bool,
) -> Vec<&'a BridgeAxiom> {
    let mut selected: BTreeMap<&str, &BridgeAxiom> = BTreeMap::new();
    let mut pending: VecDeque<&BridgeAxiom> = roots.into();
    while let Some(axiom) = pending.pop_front() {
        if selected.insert(axiom.id.as_str(), axiom).is_some() {
            continue;
        }
        for input in &axiom.inputs {
            if observed(&input.name) {
                continue;
            }
            if let Some(producer) = candidates.iter().find(|c| c.output.name == input.name) {
                if !selected.contains_key(producer.id.as_str()) {
                    pending.push_back(*producer);
                }
            }
        }
    }
    selected.into_values().collect()
}

/// Kahn's algorithm; ties broken by axiom id so the order is deterministic.
fn dependency_order<'a>(axioms: &[&'a BridgeAxiom]) -> Result<Vec<&'a BridgeAxiom>, ChainError> {
    let by_id: BTreeMap<&str, &BridgeAxiom> = axioms.iter().map(|a| (a.id.as_str(), *a)).collect();
    let mut indegree: BTreeMap<&str, usize> = by_id.keys().map(|id| (*id, 0)).collect();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();

    for consumer in by_id.values() {
        for producer in by_id.values() {
            if producer.id != consumer.id && consumer.consumes(&producer.output.name) {
                dependents
                    .entry(producer.id.as_str())
                    .or_default()
                    .push(consumer.id.as_str());
                *indegree.entry(consumer.id.as_str()).or_default() += 1;
            }
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(by_id.len());

    while let Some(id) = ready.pop_first() {
        order.push(by_id[id]);
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(d) = indegree.get_mut(dependent) {
                *d -= 1;
                if *d == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }

    if order.len() < by_id.len() {
        let axioms = indegree
            .into_iter()
            .filter(|(_, d)| *d > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(ChainError::Cycle { axioms });
    }
    Ok(order)
}

fn join_habitats(habitats: &BTreeSet<Habitat>) -> String {
    habitats
        .iter()
        .map(Habitat::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

// =============================================================================
// BACKWARD CHAINING
// =============================================================================

/// What a provenance walk starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimTarget {
    /// A metric stem or output name, such as `tourism` or `carbon_credit_value_usd`.
    Metric(String),
    Axiom(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceTrail {
    /// Axiom ids in discovery order, nearest to the claim first.
    pub axioms: Vec<String>,
    /// Inputs no applicable axiom produces; these come from measurements.
    pub primary_inputs: Vec<String>,
    pub edges: Vec<GraphEdge>,
    pub hops: usize,
    /// The walk stopped at `max_hops` with producers still unexplored.
    pub truncated: bool,
}

/// Walk from a claim back to the axioms supporting it.
///
/// Breadth-first over producer layers; each axiom is visited once so cyclic
/// catalogs terminate. `habitats` narrows the walk to axioms applicable there.
pub fn backward_chain(
    registry: &AxiomRegistry,
    claim: &ClaimTarget,
    habitats: Option<&BTreeSet<Habitat>>,
    max_hops: usize,
) -> Result<ProvenanceTrail, ChainError> {
    let max_hops = max_hops.max(1);
    let applicable = |a: &&BridgeAxiom| habitats.map_or(true, |h| a.applies_to(h));

    let (roots, claim_label): (Vec<&BridgeAxiom>, String) = match claim {
        ClaimTarget::Axiom(id) => {
            let axiom = registry
                .lookup_by_id(id)
                .map_err(|e| ChainError::AxiomNotFound(e.0))?;
            (vec![axiom], axiom.output.name.clone())
        }
        ClaimTarget::Metric(metric) => {
            let roots: Vec<&BridgeAxiom> = registry
                .axioms()
                .iter()
                .filter(applicable)
                .filter(|a| output_matches(&a.output.name, metric))
                .collect();
            if roots.is_empty() {
                return Err(ChainError::NoApplicableAxioms {
                    target: metric.clone(),
                    habitats: habitats.map(join_habitats).unwrap_or_default(),
                });
            }
            (roots, metric.clone())
        }
    };

    let mut trail = ProvenanceTrail {
        axioms: Vec::new(),
        primary_inputs: Vec::new(),
        edges: Vec::new(),
        hops: 0,
        truncated: false,
    };
    let mut visited: HashSet<&str> = HashSet::new();
    let mut layer: Vec<&BridgeAxiom> = roots;
    let mut depth = 0;

    while !layer.is_empty() {
        if depth == max_hops {
            trail.truncated = true;
            debug!(claim = %claim_label, max_hops, "provenance walk truncated");
            break;
        }
        depth += 1;
        let mut next = Vec::new();
        for axiom in layer {
            if !visited.insert(axiom.id.as_str()) {
                continue;
            }
            trail.axioms.push(axiom.id.clone());
            trail.edges.push(GraphEdge {
                from: axiom.id.clone(),
                relationship: "PRODUCES".into(),
                to: axiom.output.name.clone(),
            });
            for input in &axiom.inputs {
                trail.edges.push(GraphEdge {
                    from: input.name.clone(),
                    relationship: "FEEDS".into(),
                    to: axiom.id.clone(),
                });
                match registry.producer_of(&input.name).filter(|p| applicable(p)) {
                    Some(producer) if !visited.contains(producer.id.as_str()) => next.push(producer),
                    Some(_) => {}
                    None => {
                        if !trail.primary_inputs.contains(&input.name) {
                            trail.primary_inputs.push(input.name.clone());
                        }
                    }
                }
            }
        }
        // A producer queued earlier in this layer may have been walked later in it.
        let mut queued: HashSet<&str> = HashSet::new();
        next.retain(|p| !visited.contains(p.id.as_str()) && queued.insert(p.id.as_str()));
        trail.hops = depth;
        layer = next;
    }

    Ok(trail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::Measurement;

    fn registry(axioms: &str) -> AxiomRegistry {
        let raw = format!(
            r#"{{"version": "1.0.0", "habitats": ["coral_reef", "mangrove"], "axioms": [{axioms}]}}"#
        );
        AxiomRegistry::from_json_str(&raw).unwrap()
    }

    fn axiom(id: &str, inputs: &[&str], output: &str, unit: &str, coef: f64) -> String {
        let inputs = inputs
            .iter()
            .map(|i| format!(r#"{{"name": "{i}", "unit": "x"}}"#))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            r#"{{"id": "{id}", "name": "{id}", "category": "ecological_to_service",
                "inputs": [{inputs}], "output": {{"name": "{output}", "unit": "{unit}"}},
                "coefficient": {coef}, "ci_low": {lo}, "ci_high": {hi}, "sample_size": 4,
                "applicable_habitats": ["coral_reef"],
                "evidence": [{{"doi_or_url": "10.1000/{id}", "title": "t", "year": 2015}}]}}"#,
            lo = coef * 0.5,
            hi = coef * 2.0
        )
    }

    fn state(measurements: &[(&str, f64)]) -> EcologicalState {
        EcologicalState {
            site: "Test Reef".into(),
            habitats: [Habitat::new("coral_reef")].into_iter().collect(),
            measurements: measurements
                .iter()
                .map(|(k, v)| (k.to_string(), Measurement::new(*v, "x", Some(2020))))
                .collect(),
            neoli_score: None,
            data_freshness_status: None,
            documents: Vec::new(),
        }
    }

    #[test]
    fn upstream_output_feeds_downstream_input() {
        let reg = registry(&[
            axiom("BA-002", &["fish_biomass"], "tourism_value_usd", "usd", 10.0),
            axiom("BA-001", &["enforcement"], "fish_biomass", "t", 2.0),
        ]
        .join(","));
        let chain = forward_chain(&reg, &state(&[("enforcement", 3.0)]), &BTreeMap::new(), None).unwrap();
        assert_eq!(chain.axiom_ids(), vec!["BA-001", "BA-002"]);
        assert_eq!(chain.hops(), 2);
        assert_eq!(chain.services.len(), 1);
        assert!((chain.total_value - 60.0).abs() < 1e-9);
        let last = chain.step("BA-002").unwrap();
        assert!((last.low - 15.0).abs() < 1e-9);
        assert!((last.high - 240.0).abs() < 1e-9);
    }

    #[test]
    fn missing_inputs_are_skipped_not_invented() {
        let reg = registry(&axiom("BA-001", &["reef_area_ha"], "tourism_value_usd", "usd", 5.0));
        let chain = forward_chain(&reg, &state(&[]), &BTreeMap::new(), None).unwrap();
        assert!(chain.steps.is_empty());
        assert_eq!(
            chain.skipped[0].reason,
            SkipReason::MissingInputs {
                inputs: vec!["reef_area_ha".into()]
            }
        );
        assert_eq!(chain.total_value, 0.0);
    }

    #[test]
    fn cycle_is_an_error() {
        let reg = registry(&[
            axiom("BA-001", &["b"], "a", "x", 1.0),
            axiom("BA-002", &["a"], "b", "x", 1.0),
        ]
        .join(","));
        let err = forward_chain(&reg, &state(&[]), &BTreeMap::new(), None).unwrap_err();
        assert_eq!(
            err,
            ChainError::Cycle {
                axioms: vec!["BA-001".into(), "BA-002".into()]
            }
        );
    }

    #[test]
    fn backward_walk_respects_hop_bound() {
        let reg = registry(&[
            axiom("BA-001", &["a"], "b", "x", 1.0),
            axiom("BA-002", &["b"], "c", "x", 1.0),
            axiom("BA-003", &["c"], "value_usd", "usd", 1.0),
        ]
        .join(","));
        let full = backward_chain(&reg, &ClaimTarget::Metric("value_usd".into()), None, 4).unwrap();
        assert_eq!(full.axioms, vec!["BA-003", "BA-002", "BA-001"]);
        assert_eq!(full.primary_inputs, vec!["a"]);
        assert!(!full.truncated);

        let cut = backward_chain(&reg, &ClaimTarget::Metric("value_usd".into()), None, 2).unwrap();
        assert_eq!(cut.hops, 2);
        assert!(cut.truncated);
    }

    #[test]
    fn producer_in_the_same_layer_does_not_cost_a_hop() {
        let consumer_first = registry(&[
            axiom("BA-001", &["b_usd"], "a_usd", "usd", 1.0),
            axiom("BA-002", &["area_ha"], "b_usd", "usd", 1.0),
        ]
        .join(","));
        let claim = ClaimTarget::Metric("usd".into());

        let tight = backward_chain(&consumer_first, &claim, None, 1).unwrap();
        assert_eq!(tight.axioms, vec!["BA-001", "BA-002"]);
        assert_eq!(tight.primary_inputs, vec!["area_ha"]);
        assert_eq!(tight.hops, 1);
        assert!(!tight.truncated);

        let loose = backward_chain(&consumer_first, &claim, None, 4).unwrap();
        assert_eq!(loose.hops, 1);

        let producer_first = registry(&[
            axiom("BA-002", &["area_ha"], "b_usd", "usd", 1.0),
            axiom("BA-001", &["b_usd"], "a_usd", "usd", 1.0),
        ]
        .join(","));
        let reversed = backward_chain(&producer_first, &claim, None, 1).unwrap();
        assert_eq!(reversed.hops, tight.hops);
        assert_eq!(reversed.truncated, tight.truncated);
    }
}
