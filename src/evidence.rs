//! Evidence store contract and binding.
//!
//! The graph store itself is external. This module fixes what the engine asks
//! for (structurally typed, hop-bounded queries), what it gets back (ordered
//! nodes with their relationship paths), and how those nodes bind into
//! evidence references and ecological state. [`InMemoryEvidenceStore`] serves
//! the same contract from the registry plus a site snapshot.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::axiom::{EvidenceRef, Habitat};
use crate::registry::AxiomRegistry;

/// Hard cap on traversal depth for any store query.
pub const MAX_STORE_HOPS: u8 = 6;

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum EvidenceError {
    /// Store timed out or is down. Callers may retry after `retry_after`.
    #[error("evidence store unavailable: {reason} (retry after {retry_after:?})")]
    Unavailable {
        reason: String,
        retry_after: Duration,
    },
    #[error("no evidence node for {0}")]
    NotFound(String),
    #[error("malformed evidence node {node_id}: {message}")]
    Malformed { node_id: String, message: String },
    #[error("evidence cache error: {0}")]
    Cache(String),
}

impl EvidenceError {
    pub fn unavailable(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self::Unavailable {
            reason: reason.into(),
            retry_after,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Cache(_))
    }
}

// =============================================================================
// QUERY / RESPONSE
// =============================================================================

/// What the engine asks the store about. Never free text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EvidenceTarget {
    Axiom(String),
    Concept(String),
    Site(String),
}

impl EvidenceTarget {
    pub fn describe(&self) -> String {
        match self {
            EvidenceTarget::Axiom(id) => format!("axiom {id}"),
            EvidenceTarget::Concept(id) => format!("concept {id}"),
            EvidenceTarget::Site(name) => format!("site {name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvidenceQuery {
    pub target: EvidenceTarget,
    pub max_hops: u8,
}

impl EvidenceQuery {
    /// Hop count is clamped into `1..=MAX_STORE_HOPS`.
    pub fn new(target: EvidenceTarget, max_hops: u8) -> Self {
        Self {
            target,
            max_hops: max_hops.clamp(1, MAX_STORE_HOPS),
        }
    }

    pub fn axiom(id: impl Into<String>, max_hops: u8) -> Self {
        Self::new(EvidenceTarget::Axiom(id.into()), max_hops)
    }

    pub fn concept(id: impl Into<String>, max_hops: u8) -> Self {
        Self::new(EvidenceTarget::Concept(id.into()), max_hops)
    }

    pub fn site(name: impl Into<String>, max_hops: u8) -> Self {
        Self::new(EvidenceTarget::Site(name.into()), max_hops)
    }

    /// Stable textual key, used for caching.
    pub fn cache_key(&self) -> String {
        let (kind, id) = match &self.target {
            EvidenceTarget::Axiom(id) => ("axiom", id),
            EvidenceTarget::Concept(id) => ("concept", id),
            EvidenceTarget::Site(name) => ("site", name),
        };
        format!("{kind}|{}|{}", id.to_lowercase(), self.max_hops)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Site,
    Habitat,
    Axiom,
    Concept,
    Document,
}

/// One node of a store response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub node_type: NodeType,
    pub node_id: String,
    pub properties: Map<String, Value>,
    /// Relationship labels walked from the query root to this node.
    pub relationship_path: Vec<String>,
}

impl GraphNode {
    pub fn hops(&self) -> usize {
        self.relationship_path.len()
    }
}

/// A traversed relationship, reported back to callers as the graph path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub relationship: String,
    pub to: String,
}

#[async_trait]
pub trait EvidenceStore: Send + Sync {
    async fn query(&self, query: &EvidenceQuery) -> Result<Vec<GraphNode>, EvidenceError>;
}

/// Run a store query under a deadline. A timeout becomes `Unavailable`.
pub async fn query_with_timeout(
    store: &dyn EvidenceStore,
    query: &EvidenceQuery,
    timeout: Duration,
) -> Result<Vec<GraphNode>, EvidenceError> {
    match tokio::time::timeout(timeout, store.query(query)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(target = %query.target.describe(), ?timeout, "evidence query timed out");
            Err(EvidenceError::unavailable(
                format!("{} timed out after {timeout:?}", query.target.describe()),
                timeout,
            ))
        }
    }
}

// =============================================================================
// SITES
// =============================================================================

/// A measured quantity on a site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: f64,
    #[serde(default)]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub measurement_year: Option<i32>,
}

impl Measurement {
    pub fn new(value: f64, unit: impl Into<String>, measurement_year: Option<i32>) -> Self {
        Self {
            value,
            unit: unit.into(),
            measurement_year,
        }
    }
}

/// Site as held by the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteRecord {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub habitats: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// NEOLI criteria met (0-5).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neoli_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_freshness_status: Option<String>,
    #[serde(default)]
    pub measurements: BTreeMap<String, Measurement>,
    #[serde(default)]
    pub evidence: Vec<EvidenceRef>,
}

impl SiteRecord {
    pub fn matches(&self, name: &str) -> bool {
        let needle = name.trim().to_lowercase();
        self.name.to_lowercase() == needle || self.aliases.iter().any(|a| a.to_lowercase() == needle)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub sites: Vec<SiteRecord>,
}

impl GraphSnapshot {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Ecological state of one site, as the chaining engine consumes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EcologicalState {
    pub site: String,
    pub habitats: BTreeSet<Habitat>,
    pub measurements: BTreeMap<String, Measurement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neoli_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_freshness_status: Option<String>,
    /// Site-level documents (survey reports and the like).
    #[serde(default)]
    pub documents: Vec<EvidenceRef>,
}

impl EcologicalState {
    pub fn measurement(&self, name: &str) -> Option<&Measurement> {
        self.measurements.get(name)
    }

    pub fn is_stale(&self) -> bool {
        self.data_freshness_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("stale"))
    }
}

impl From<SiteRecord> for EcologicalState {
    fn from(site: SiteRecord) -> Self {
        let mut measurements = site.measurements;
        if let Some(score) = site.neoli_score {
            measurements
                .entry("neoli_score".to_string())
                .or_insert_with(|| Measurement::new(f64::from(score), "criteria", None));
        }
        Self {
            site: site.name,
            habitats: site.habitats.iter().map(|h| Habitat::new(h)).collect(),
            measurements,
            neoli_score: site.neoli_score,
            data_freshness_status: site.data_freshness_status,
            documents: site.evidence,
        }
    }
}

// =============================================================================
// BINDING
// =============================================================================

/// An evidence reference bound from a store response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundEvidence {
    pub reference: EvidenceRef,
    pub node_id: String,
    /// Distance from the query root.
    pub hops: usize,
    /// Axiom the document supports, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axiom_id: Option<String>,
}

/// Bind every document node into an evidence reference, in response order.
pub fn bind_evidence(nodes: &[GraphNode]) -> Result<Vec<BoundEvidence>, EvidenceError> {
    nodes
        .iter()
        .filter(|n| n.node_type == NodeType::Document)
        .map(|node| {
            let reference: EvidenceRef = serde_json::from_value(Value::Object(node.properties.clone()))
                .map_err(|e| EvidenceError::Malformed {
                    node_id: node.node_id.clone(),
                    message: e.to_string(),
                })?;
            let axiom_id = node
                .properties
                .get("axiom_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok(BoundEvidence {
                reference,
                node_id: node.node_id.clone(),
                hops: node.hops(),
                axiom_id,
            })
        })
        .collect()
}

/// Bind the root site node into ecological state.
pub fn bind_site(nodes: &[GraphNode]) -> Result<EcologicalState, EvidenceError> {
    let node = nodes
        .iter()
        .find(|n| n.node_type == NodeType::Site && n.relationship_path.is_empty())
        .ok_or_else(|| EvidenceError::NotFound("site root node".into()))?;
    let record: SiteRecord = serde_json::from_value(Value::Object(node.properties.clone()))
        .map_err(|e| EvidenceError::Malformed {
            node_id: node.node_id.clone(),
            message: e.to_string(),
        })?;
    Ok(record.into())
}

/// Graph edges implied by the relationship paths of a response.
pub fn edges_from(nodes: &[GraphNode]) -> Vec<GraphEdge> {
    let mut edges = Vec::new();
    let mut last_at_depth: Vec<String> = Vec::new();
    for node in nodes {
        let depth = node.hops();
        last_at_depth.truncate(depth);
        if depth > 0 {
            if let (Some(parent), Some(rel)) = (last_at_depth.get(depth - 1), node.relationship_path.last()) {
                edges.push(GraphEdge {
                    from: parent.clone(),
                    relationship: rel.clone(),
                    to: node.node_id.clone(),
                });
            }
        }
        if last_at_depth.len() == depth {
            last_at_depth.push(node.node_id.clone());
        }
    }
    edges
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// Serves the store contract from a loaded registry and site snapshot.
///
/// Responses are emitted depth-first (each node followed by its children) so
/// that [`edges_from`] can reconstruct the traversed edges.
#[derive(Debug, Clone)]
pub struct InMemoryEvidenceStore {
    registry: Arc<AxiomRegistry>,
    sites: Vec<SiteRecord>,
}

impl InMemoryEvidenceStore {
    pub fn new(registry: Arc<AxiomRegistry>, snapshot: GraphSnapshot) -> Self {
        Self {
            registry,
            sites: snapshot.sites,
        }
    }

    pub fn sites(&self) -> &[SiteRecord] {
        &self.sites
    }

    fn axiom_nodes(&self, id: &str, base: &[&str], max_hops: usize, out: &mut Vec<GraphNode>) -> bool {
        let Ok(axiom) = self.registry.lookup_by_id(id) else {
            return false;
        };
        if base.len() > max_hops {
            return true;
        }
        let mut props = Map::new();
        props.insert("id".into(), json!(axiom.id));
        props.insert("name".into(), json!(axiom.name));
        props.insert("category".into(), json!(axiom.category.as_str()));
        props.insert("output".into(), json!(axiom.output.name));
        props.insert("coefficient".into(), json!(axiom.coefficient));
        props.insert("ci_low".into(), json!(axiom.ci_low));
        props.insert("ci_high".into(), json!(axiom.ci_high));
        props.insert("independent_sources".into(), json!(axiom.independent_sources()));
        out.push(GraphNode {
            node_type: NodeType::Axiom,
            node_id: axiom.id.clone(),
            properties: props,
            relationship_path: path(base, None),
        });

        if base.len() < max_hops {
            for evidence in &axiom.evidence {
                out.push(document_node(evidence, Some(&axiom.id), path(base, Some("EVIDENCED_BY"))));
            }
        }
        true
    }
}

fn path(base: &[&str], next: Option<&str>) -> Vec<String> {
    base.iter()
        .copied()
        .chain(next)
        .map(str::to_string)
        .collect()
}

fn document_node(evidence: &EvidenceRef, axiom_id: Option<&str>, relationship_path: Vec<String>) -> GraphNode {
    let mut properties = match serde_json::to_value(evidence) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    if let Some(id) = axiom_id {
        properties.insert("axiom_id".into(), json!(id));
    }
    GraphNode {
        node_type: NodeType::Document,
        node_id: evidence.source_key(),
        properties,
        relationship_path,
    }
}

#[async_trait]
impl EvidenceStore for InMemoryEvidenceStore {
    async fn query(&self, query: &EvidenceQuery) -> Result<Vec<GraphNode>, EvidenceError> {
        let max_hops = usize::from(query.max_hops);
        let mut out = Vec::new();

        match &query.target {
            EvidenceTarget::Axiom(id) => {
                if !self.axiom_nodes(id, &[], max_hops, &mut out) {
                    return Err(EvidenceError::NotFound(query.target.describe()));
                }
            }
            EvidenceTarget::Concept(id) => {
                let concept = self
                    .registry
                    .concept(id)
                    .ok_or_else(|| EvidenceError::NotFound(query.target.describe()))?;
                let mut props = Map::new();
                props.insert("id".into(), json!(concept.id));
                props.insert("name".into(), json!(concept.name));
                props.insert("domain".into(), json!(concept.domain));
                props.insert("description".into(), json!(concept.description));
                out.push(GraphNode {
                    node_type: NodeType::Concept,
                    node_id: concept.id.clone(),
                    properties: props,
                    relationship_path: Vec::new(),
                });
                for axiom_id in &concept.involved_axiom_ids {
                    self.axiom_nodes(axiom_id, &["INVOLVES"], max_hops, &mut out);
                }
            }
            EvidenceTarget::Site(name) => {
                let site = self
                    .sites
                    .iter()
                    .find(|s| s.matches(name))
                    .ok_or_else(|| EvidenceError::NotFound(query.target.describe()))?;
                let properties = match serde_json::to_value(site) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) | Err(_) => {
                        return Err(EvidenceError::Malformed {
                            node_id: site.name.clone(),
                            message: "site did not serialize to an object".into(),
                        })
                    }
                };
                out.push(GraphNode {
                    node_type: NodeType::Site,
                    node_id: site.name.clone(),
                    properties,
                    relationship_path: Vec::new(),
                });
                for doc in &site.evidence {
                    out.push(document_node(doc, None, vec!["DOCUMENTED_BY".into()]));
                }
                let habitats: BTreeSet<Habitat> = site.habitats.iter().map(|h| Habitat::new(h)).collect();
                for habitat in &habitats {
                    out.push(GraphNode {
                        node_type: NodeType::Habitat,
                        node_id: habitat.to_string(),
                        properties: Map::new(),
                        relationship_path: vec!["HAS_HABITAT".into()],
                    });
                    if max_hops < 2 {
                        continue;
                    }
                    for axiom in self.registry.lookup_by_habitat(habitat) {
                        self.axiom_nodes(&axiom.id, &["HAS_HABITAT", "APPLIES"], max_hops, &mut out);
                    }
                }
            }
        }

        Ok(out)
    }
}
