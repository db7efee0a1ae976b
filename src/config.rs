//! Engine configuration with environment overrides.

use std::str::FromStr;
use std::time::Duration;

use chrono::{Datelike, Utc};

use crate::chain::DEFAULT_MAX_HOPS;
use crate::classifier::ClassifierConfig;
use crate::generation::GenerationConstraints;
use crate::monte_carlo::MonteCarloConfig;

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}={value:?} is not a valid value")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bound on backward-chaining axiom layers.
    pub max_hops: usize,
    /// Hop budget passed to the evidence store (at most 6).
    pub evidence_hops: u8,
    pub evidence_timeout: Duration,
    pub classifier: ClassifierConfig,
    /// Year ages are measured from.
    pub reference_year: i32,
    pub monte_carlo: MonteCarloConfig,
    pub model: String,
    pub generation: GenerationConstraints,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_hops: DEFAULT_MAX_HOPS,
            evidence_hops: 3,
            evidence_timeout: Duration::from_secs(10),
            classifier: ClassifierConfig::default(),
            reference_year: Utc::now().year(),
            monte_carlo: MonteCarloConfig::default(),
            model: DEFAULT_MODEL.to_string(),
            generation: GenerationConstraints::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `ESV_*` variables. Unset variables keep the default;
    /// malformed ones are an error rather than silently ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_parse::<usize>("ESV_MAX_HOPS")? {
            config.max_hops = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("ESV_EVIDENCE_TIMEOUT_SECONDS")? {
            config.evidence_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("ESV_CLASSIFIER_TIMEOUT_SECONDS")? {
            config.classifier.fallback_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<f64>("ESV_FALLBACK_FLOOR")? {
            config.classifier.fallback_floor = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_parse::<i32>("ESV_REFERENCE_YEAR")? {
            config.reference_year = v;
        }
        if let Some(v) = env_parse::<usize>("ESV_MC_ITERATIONS")? {
            config.monte_carlo.iterations = v;
        }
        if let Some(v) = env_parse::<u64>("ESV_MC_SEED")? {
            config.monte_carlo.seed = v;
        }
        if let Ok(model) = std::env::var("ESV_MODEL") {
            if !model.trim().is_empty() {
                config.model = model.trim().to_string();
            }
        }
        Ok(config)
    }
}

fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        _ => Ok(None),
    }
}
