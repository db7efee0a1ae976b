#![forbid(unsafe_code)]

//! # esv-bridge
//!
//! Turns ecological observations into financial valuations you can audit.
//!
//! A catalog of **bridge axioms** encodes peer-reviewed coefficients that
//! translate one quantity into another: fish biomass into tourism revenue,
//! mangrove area into sequestered carbon, carbon into credit value. The engine
//! classifies a question, binds site measurements and citations from an
//! evidence graph, chains the applicable axioms, and reports the answer with a
//! decomposed confidence score. No number is produced that cannot be traced
//! back to a cited source or a bound measurement.

pub mod axiom;
pub mod cache;
pub mod chain;
pub mod classifier;
pub mod confidence;
pub mod config;
pub mod engine;
pub mod evidence;
pub mod generation;
pub mod llm;
pub mod monte_carlo;
pub mod prompts;
pub mod registry;
pub mod scenario;
pub mod sensitivity;

pub use axiom::{AxiomCategory, BridgeAxiom, Concept, DistributionKind, EvidenceRef, Habitat, ParamSpec, Tier};
pub use cache::{CachedEvidenceStore, EvidenceCache, SqliteEvidenceCache};
pub use chain::{backward_chain, forward_chain, ChainError, ClaimTarget, ProvenanceTrail, ServiceValue, TranslationChain};
pub use classifier::{Classification, Classifier, LlmClassifier, QueryCategory, QueryClassifier, SiteAliases};
pub use confidence::{ConfidenceBreakdown, ConfidenceCap};
pub use config::EngineConfig;
pub use engine::{EngineError, QueryRequest, QueryResult, ReasoningEngine};
pub use evidence::{EcologicalState, EvidenceError, EvidenceQuery, EvidenceStore, GraphSnapshot, InMemoryEvidenceStore};
pub use generation::{AnswerGenerator, LlmAnswerGenerator};
pub use llm::{ChatCompletion, LlmError, OpenRouterClient};
pub use monte_carlo::{simulate, MonteCarloConfig, SimulationError, SimulationResult};
pub use registry::{AxiomRegistry, CatalogError};
pub use scenario::ScenarioParameters;
pub use sensitivity::SensitivityReport;
