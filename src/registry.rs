//! Axiom registry: loads and validates the versioned catalog, then serves lookups.
//!
//! Validation is eager and all-or-nothing. A catalog with one bad record never
//! yields a partially populated registry. The registry is immutable after load;
//! a reload builds a fresh value that callers swap in wholesale.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::axiom::{
    AxiomCategory, BridgeAxiom, Concept, DistributionKind, EvidenceRef, Habitat, ParamSpec, Tier,
};

/// Catalog major version this build understands.
pub const SUPPORTED_CATALOG_MAJOR: u32 = 1;

static DOI_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^10\.\d{4,9}/\S+$").expect("Invalid DOI regex"));

// =============================================================================
// ERRORS
// =============================================================================

/// Fatal catalog problems. Any of these aborts the load.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("io error reading catalog: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed catalog JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported catalog version {0:?} (expected major {SUPPORTED_CATALOG_MAJOR})")]
    UnsupportedVersion(String),
    #[error("{owner} references undefined habitat {habitat:?}")]
    UndefinedHabitat { owner: String, habitat: String },
    #[error("{axiom}: field {field} must be a finite number")]
    NonNumeric { axiom: String, field: &'static str },
    #[error("{axiom}: ci_low {ci_low} > ci_high {ci_high}")]
    InvalidInterval {
        axiom: String,
        ci_low: f64,
        ci_high: f64,
    },
    #[error("{axiom}: coefficient {coefficient} outside [{ci_low}, {ci_high}]")]
    CoefficientOutsideInterval {
        axiom: String,
        coefficient: f64,
        ci_low: f64,
        ci_high: f64,
    },
    #[error("{axiom}: at least one evidence reference is required")]
    MissingEvidence { axiom: String },
    #[error("{owner}: invalid evidence tier {value:?}")]
    InvalidTier { owner: String, value: String },
    #[error("{owner}: unrecognized DOI {value:?}")]
    InvalidDoi { owner: String, value: String },
    #[error("{owner}: invalid {field}: {message}")]
    InvalidField {
        owner: String,
        field: &'static str,
        message: String,
    },
    #[error("duplicate id {0}")]
    DuplicateId(String),
    #[error("concept {concept} references unknown axiom {axiom}")]
    UnknownAxiomReference { concept: String, axiom: String },
    #[error("{first} and {second} both produce {output}")]
    DoubleCountedService {
        output: String,
        first: String,
        second: String,
    },
}

/// Lookup miss by axiom id.
#[derive(Debug, Clone, thiserror::Error)]
#[error("axiom not found: {0}")]
pub struct AxiomNotFound(pub String);

// =============================================================================
// RAW CATALOG
// =============================================================================

#[derive(Debug, Deserialize)]
struct RawCatalog {
    version: String,
    habitats: Vec<String>,
    axioms: Vec<RawAxiom>,
    #[serde(default)]
    concepts: Vec<RawConcept>,
}

#[derive(Debug, Deserialize)]
struct RawAxiom {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    category: String,
    inputs: Vec<ParamSpec>,
    output: ParamSpec,
    coefficient: Value,
    ci_low: Value,
    ci_high: Value,
    #[serde(default = "default_distribution")]
    distribution: String,
    #[serde(default)]
    sample_size: u32,
    applicable_habitats: Vec<String>,
    #[serde(default)]
    evidence: Vec<RawEvidence>,
}

fn default_distribution() -> String {
    "triangular".into()
}

#[derive(Debug, Deserialize)]
struct RawEvidence {
    #[serde(default)]
    doi_or_url: Option<String>,
    title: String,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    tier: Option<String>,
    #[serde(default)]
    quote: Option<String>,
    #[serde(default)]
    page_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawConcept {
    id: String,
    name: String,
    #[serde(default)]
    domain: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    keywords: Vec<String>,
    #[serde(default)]
    applicable_habitats: Vec<String>,
    #[serde(default)]
    involved_axiom_ids: Vec<String>,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Read-only catalog of bridge axioms and concepts.
///
/// Construct once and share behind an `Arc`; every component takes it by
/// injection so tests can run several catalogs side by side.
#[derive(Debug, Clone)]
pub struct AxiomRegistry {
    version: String,
    habitats: BTreeSet<Habitat>,
    axioms: Vec<BridgeAxiom>,
    by_id: HashMap<String, usize>,
    concepts: Vec<Concept>,
    /// axiom id -> concept ids that involve it
    concepts_by_axiom: HashMap<String, Vec<String>>,
}

impl AxiomRegistry {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, CatalogError> {
        let catalog: RawCatalog = serde_json::from_str(raw)?;
        Self::build(catalog)
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self, CatalogError> {
        let catalog: RawCatalog = serde_json::from_reader(reader)?;
        Self::build(catalog)
    }

    fn build(catalog: RawCatalog) -> Result<Self, CatalogError> {
        check_version(&catalog.version)?;

        let habitats: BTreeSet<Habitat> = catalog.habitats.iter().map(|h| Habitat::new(h)).collect();

        let mut axioms = Vec::with_capacity(catalog.axioms.len());
        let mut by_id = HashMap::new();
        for raw in catalog.axioms {
            let axiom = validate_axiom(raw, &habitats)?;
            if by_id.insert(axiom.id.clone(), axioms.len()).is_some() {
                return Err(CatalogError::DuplicateId(axiom.id));
            }
            axioms.push(axiom);
        }
        check_double_counting(&axioms)?;

        let mut concepts = Vec::with_capacity(catalog.concepts.len());
        let mut seen_concepts = HashSet::new();
        let mut concepts_by_axiom: HashMap<String, Vec<String>> = HashMap::new();
        for raw in catalog.concepts {
            let concept = validate_concept(raw, &habitats, &by_id)?;
            if !seen_concepts.insert(concept.id.clone()) {
                return Err(CatalogError::DuplicateId(concept.id));
            }
            for axiom_id in &concept.involved_axiom_ids {
                concepts_by_axiom
                    .entry(axiom_id.clone())
                    .or_default()
                    .push(concept.id.clone());
            }
            concepts.push(concept);
        }

        info!(
            version = %catalog.version,
            axioms = axioms.len(),
            concepts = concepts.len(),
            "axiom catalog loaded"
        );

        Ok(Self {
            version: catalog.version,
            habitats,
            axioms,
            by_id,
            concepts,
            concepts_by_axiom,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn habitats(&self) -> &BTreeSet<Habitat> {
        &self.habitats
    }

    pub fn axioms(&self) -> &[BridgeAxiom] {
        &self.axioms
    }

    pub fn concepts(&self) -> &[Concept] {
        &self.concepts
    }

    pub fn len(&self) -> usize {
        self.axioms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.axioms.is_empty()
    }

    /// Case-insensitive id lookup (`ba-002` finds `BA-002`).
    pub fn lookup_by_id(&self, id: &str) -> Result<&BridgeAxiom, AxiomNotFound> {
        let key = id.trim().to_uppercase();
        self.by_id
            .get(&key)
            .map(|&idx| &self.axioms[idx])
            .ok_or(AxiomNotFound(key))
    }

    /// Keyword lookup across names, descriptions and concepts.
    ///
    /// Matches when the keyword appears in an axiom's name or description, or
    /// when it matches a concept (by id, name or keyword, in either direction)
    /// that involves the axiom. Needs no site or axiom id.
    pub fn lookup_by_concept(&self, keyword: &str) -> Vec<&BridgeAxiom> {
        let needle = keyword.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let mut ids: BTreeSet<&str> = BTreeSet::new();
        for axiom in &self.axioms {
            if axiom.name.to_lowercase().contains(&needle)
                || axiom.description.to_lowercase().contains(&needle)
            {
                ids.insert(&axiom.id);
            }
        }
        for concept in &self.concepts {
            let id_match = concept.id.to_lowercase() == needle;
            if id_match || concept.mentioned_in(&needle) || concept.name.to_lowercase().contains(&needle)
            {
                ids.extend(concept.involved_axiom_ids.iter().map(String::as_str));
            }
        }

        debug!(keyword = %needle, hits = ids.len(), "concept lookup");
        ids.into_iter()
            .filter_map(|id| self.lookup_by_id(id).ok())
            .collect()
    }

    pub fn lookup_by_habitat(&self, habitat: &Habitat) -> Vec<&BridgeAxiom> {
        self.axioms
            .iter()
            .filter(|a| a.applicable_habitats.contains(habitat))
            .collect()
    }

    /// The single axiom producing `output_name`, if any.
    pub fn producer_of(&self, output_name: &str) -> Option<&BridgeAxiom> {
        self.axioms.iter().find(|a| a.output.name == output_name)
    }

    pub fn concept(&self, id: &str) -> Option<&Concept> {
        let key = id.trim().to_lowercase();
        self.concepts.iter().find(|c| c.id.to_lowercase() == key)
    }

    /// Concepts that list `axiom_id` among their involved axioms.
    pub fn concepts_for_axiom(&self, axiom_id: &str) -> Vec<&Concept> {
        self.concepts_by_axiom
            .get(axiom_id)
            .map(|ids| ids.iter().filter_map(|id| self.concept(id)).collect())
            .unwrap_or_default()
    }

    /// First concept mentioned anywhere in normalized text.
    pub fn concept_mentioned_in(&self, normalized: &str) -> Option<&Concept> {
        self.concepts.iter().find(|c| c.mentioned_in(normalized))
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

fn check_version(version: &str) -> Result<(), CatalogError> {
    let major = version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()
        .and_then(|m| m.parse::<u32>().ok());
    match major {
        Some(SUPPORTED_CATALOG_MAJOR) => Ok(()),
        _ => Err(CatalogError::UnsupportedVersion(version.to_string())),
    }
}

fn number(value: &Value, axiom: &str, field: &'static str) -> Result<f64, CatalogError> {
    value
        .as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| CatalogError::NonNumeric {
            axiom: axiom.to_string(),
            field,
        })
}

fn resolve_habitats(
    owner: &str,
    names: &[String],
    declared: &BTreeSet<Habitat>,
) -> Result<BTreeSet<Habitat>, CatalogError> {
    let mut out = BTreeSet::new();
    for name in names {
        let habitat = Habitat::new(name);
        if !declared.contains(&habitat) {
            return Err(CatalogError::UndefinedHabitat {
                owner: owner.to_string(),
                habitat: name.clone(),
            });
        }
        out.insert(habitat);
    }
    Ok(out)
}

fn validate_axiom(raw: RawAxiom, habitats: &BTreeSet<Habitat>) -> Result<BridgeAxiom, CatalogError> {
    let id = raw.id.trim().to_uppercase();
    if id.is_empty() {
        return Err(CatalogError::InvalidField {
            owner: raw.name,
            field: "id",
            message: "empty".into(),
        });
    }

    let category = AxiomCategory::parse(&raw.category).ok_or_else(|| CatalogError::InvalidField {
        owner: id.clone(),
        field: "category",
        message: format!("unknown category {:?}", raw.category),
    })?;
    let distribution =
        DistributionKind::parse(&raw.distribution).ok_or_else(|| CatalogError::InvalidField {
            owner: id.clone(),
            field: "distribution",
            message: format!("unknown distribution {:?}", raw.distribution),
        })?;

    if raw.inputs.is_empty() {
        return Err(CatalogError::InvalidField {
            owner: id,
            field: "inputs",
            message: "at least one input is required".into(),
        });
    }
    if raw.inputs.iter().any(|p| p.name == raw.output.name) {
        return Err(CatalogError::InvalidField {
            owner: id,
            field: "output",
            message: format!("output {} also listed as an input", raw.output.name),
        });
    }

    let coefficient = number(&raw.coefficient, &id, "coefficient")?;
    let ci_low = number(&raw.ci_low, &id, "ci_low")?;
    let ci_high = number(&raw.ci_high, &id, "ci_high")?;
    if ci_low > ci_high {
        return Err(CatalogError::InvalidInterval {
            axiom: id,
            ci_low,
            ci_high,
        });
    }
    if coefficient < ci_low || coefficient > ci_high {
        return Err(CatalogError::CoefficientOutsideInterval {
            axiom: id,
            coefficient,
            ci_low,
            ci_high,
        });
    }

    let applicable_habitats = resolve_habitats(&id, &raw.applicable_habitats, habitats)?;

    if raw.evidence.is_empty() {
        return Err(CatalogError::MissingEvidence { axiom: id });
    }
    let evidence = raw
        .evidence
        .into_iter()
        .map(|e| validate_evidence(e, &id))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(BridgeAxiom {
        id,
        name: raw.name,
        description: raw.description,
        category,
        inputs: raw.inputs,
        output: raw.output,
        coefficient,
        ci_low,
        ci_high,
        distribution,
        sample_size: raw.sample_size,
        applicable_habitats,
        evidence,
    })
}

fn validate_evidence(raw: RawEvidence, owner: &str) -> Result<EvidenceRef, CatalogError> {
    let tier = match raw.tier.as_deref() {
        None => None,
        Some(t) => Some(Tier::parse(t).ok_or_else(|| CatalogError::InvalidTier {
            owner: owner.to_string(),
            value: t.to_string(),
        })?),
    };

    let doi_or_url = raw
        .doi_or_url
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(value) = &doi_or_url {
        if !is_valid_locator(value) {
            return Err(CatalogError::InvalidDoi {
                owner: owner.to_string(),
                value: value.clone(),
            });
        }
    }

    Ok(EvidenceRef {
        doi_or_url,
        title: raw.title,
        year: raw.year,
        tier,
        quote: raw.quote,
        page_ref: raw.page_ref,
    })
}

fn validate_concept(
    raw: RawConcept,
    habitats: &BTreeSet<Habitat>,
    axiom_ids: &HashMap<String, usize>,
) -> Result<Concept, CatalogError> {
    let id = raw.id.trim().to_string();
    let applicable_habitats = resolve_habitats(&id, &raw.applicable_habitats, habitats)?;
    let mut involved = Vec::with_capacity(raw.involved_axiom_ids.len());
    for axiom in raw.involved_axiom_ids {
        let key = axiom.trim().to_uppercase();
        if !axiom_ids.contains_key(&key) {
            return Err(CatalogError::UnknownAxiomReference {
                concept: id,
                axiom,
            });
        }
        involved.push(key);
    }
    Ok(Concept {
        id,
        name: raw.name,
        domain: raw.domain,
        description: raw.description,
        keywords: raw.keywords.into_iter().map(|k| k.to_lowercase()).collect(),
        applicable_habitats,
        involved_axiom_ids: involved,
    })
}

/// Each output (ecosystem service or intermediate quantity) has exactly one producer.
///
/// A site spanning several habitats would otherwise sum two producers of the
/// same service.
fn check_double_counting(axioms: &[BridgeAxiom]) -> Result<(), CatalogError> {
    let mut producers: HashMap<&str, &str> = HashMap::new();
    for axiom in axioms {
        if let Some(first) = producers.insert(axiom.output.name.as_str(), &axiom.id) {
            return Err(CatalogError::DoubleCountedService {
                output: axiom.output.name.clone(),
                first: first.to_string(),
                second: axiom.id.clone(),
            });
        }
    }
    Ok(())
}

/// URLs pass through; anything else must be a DOI in a recognized form.
fn is_valid_locator(value: &str) -> bool {
    if normalize_doi(value).is_some() {
        return true;
    }
    let lower = value.to_lowercase();
    let is_doi_url = lower.contains("doi.org/");
    (lower.starts_with("https://") || lower.starts_with("http://")) && !is_doi_url
}

/// Canonical lowercase DOI from bare, `doi:` or resolver-URL forms.
pub fn normalize_doi(value: &str) -> Option<String> {
    let trimmed = value.trim();
    let lower = trimmed.to_lowercase();
    let bare = [
        "https://doi.org/",
        "http://doi.org/",
        "https://dx.doi.org/",
        "http://dx.doi.org/",
        "doi:",
    ]
    .iter()
    .find_map(|prefix| lower.strip_prefix(prefix))
    .unwrap_or(&lower)
    .trim();
    DOI_PATTERN.is_match(bare).then(|| bare.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with(axiom_patch: &str) -> String {
        format!(
            r#"{{
                "version": "1.0.0",
                "habitats": ["coral_reef"],
                "axioms": [{{
                    "id": "BA-001",
                    "name": "Biomass to tourism",
                    "category": "ecological_to_service",
                    "inputs": [{{"name": "biomass_ratio", "unit": "ratio"}}],
                    "output": {{"name": "tourism_value_usd", "unit": "usd"}},
                    "sample_size": 3,
                    "applicable_habitats": ["coral_reef"],
                    "evidence": [{{"doi_or_url": "10.1371/journal.pone.0023601", "title": "Cabo Pulmo recovery", "year": 2011, "tier": "T1"}}],
                    {axiom_patch}
                }}]
            }}"#
        )
    }

    #[test]
    fn loads_valid_catalog() {
        let raw = catalog_with(r#""coefficient": 0.3, "ci_low": 0.2, "ci_high": 0.5"#);
        let registry = AxiomRegistry::from_json_str(&raw).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup_by_id("ba-001").unwrap().id, "BA-001");
    }

    #[test]
    fn rejects_string_coefficient() {
        let raw = catalog_with(r#""coefficient": "0.3", "ci_low": 0.2, "ci_high": 0.5"#);
        let err = AxiomRegistry::from_json_str(&raw).unwrap_err();
        assert!(matches!(err, CatalogError::NonNumeric { field: "coefficient", .. }));
    }

    #[test]
    fn rejects_inverted_interval() {
        let raw = catalog_with(r#""coefficient": 0.3, "ci_low": 0.6, "ci_high": 0.5"#);
        let err = AxiomRegistry::from_json_str(&raw).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidInterval { .. }));
    }

    #[test]
    fn rejects_coefficient_outside_interval() {
        let raw = catalog_with(r#""coefficient": 0.9, "ci_low": 0.2, "ci_high": 0.5"#);
        let err = AxiomRegistry::from_json_str(&raw).unwrap_err();
        assert!(matches!(err, CatalogError::CoefficientOutsideInterval { .. }));
    }

    #[test]
    fn doi_forms_normalize() {
        assert_eq!(
            normalize_doi("https://doi.org/10.1038/NATURE12345").as_deref(),
            Some("10.1038/nature12345")
        );
        assert_eq!(normalize_doi("doi:10.1016/j.ecolecon.2013.04.013").as_deref(), Some("10.1016/j.ecolecon.2013.04.013"));
        assert!(normalize_doi("10.12/short").is_none());
        assert!(is_valid_locator("https://www.worldbank.org/report"));
        assert!(!is_valid_locator("https://doi.org/not-a-doi"));
        assert!(!is_valid_locator("ISBN 978-0-12"));
    }

    #[test]
    fn rejects_unsupported_version() {
        let raw = catalog_with(r#""coefficient": 0.3, "ci_low": 0.2, "ci_high": 0.5"#)
            .replace("\"1.0.0\"", "\"2.1.0\"");
        let err = AxiomRegistry::from_json_str(&raw).unwrap_err();
        assert!(matches!(err, CatalogError::UnsupportedVersion(_)));
    }
}
