#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use esv_bridge::cache::{CachedEvidenceStore, SqliteEvidenceCache};
use esv_bridge::classifier::{ClassifierConfig, LlmClassifier, QueryClassifier, SiteAliases};
use esv_bridge::config::EngineConfig;
use esv_bridge::engine::{QueryRequest, ReasoningEngine};
use esv_bridge::evidence::{EvidenceStore, GraphSnapshot, InMemoryEvidenceStore};
use esv_bridge::generation::LlmAnswerGenerator;
use esv_bridge::llm::{ChatCompletion, OpenRouterClient, RetryConfig, RetryingClient};
use esv_bridge::monte_carlo::{simulate, MonteCarloConfig};
use esv_bridge::registry::AxiomRegistry;
use esv_bridge::scenario::ScenarioParameters;
use esv_bridge::sensitivity::analyze;

#[derive(Parser)]
#[command(name = "esv", version, about = "Ecosystem service valuation over bridge axioms")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct DataArgs {
    /// Axiom catalog JSON
    #[arg(long, default_value = "data/catalog.json")]
    catalog: PathBuf,
    /// Site graph snapshot JSON
    #[arg(long, default_value = "data/graph.json")]
    graph: PathBuf,
}

#[derive(Args, Clone, Default)]
struct ScenarioArgs {
    #[arg(long)]
    carbon_price: Option<f64>,
    /// Percent of habitat area lost (0-100)
    #[arg(long)]
    habitat_loss: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    tourism_growth: Option<f64>,
    #[arg(long, allow_hyphen_values = true)]
    fisheries_change: Option<f64>,
}

impl ScenarioArgs {
    fn to_parameters(&self) -> Option<ScenarioParameters> {
        let params = ScenarioParameters {
            carbon_price_usd_per_t: self.carbon_price,
            habitat_loss_pct: self.habitat_loss,
            tourism_growth_pct: self.tourism_growth,
            fisheries_change_pct: self.fisheries_change,
        };
        (!params.is_empty()).then_some(params)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question about a site, axiom or concept
    Ask {
        question: String,
        #[command(flatten)]
        data: DataArgs,
        /// Site to use instead of any named in the question
        #[arg(long)]
        site: Option<String>,
        #[command(flatten)]
        scenario: ScenarioArgs,
        #[arg(long)]
        simulate: bool,
        #[arg(long)]
        sensitivity: bool,
        /// Cache evidence lookups in this SQLite file
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Use OpenRouter for the classification fallback and answer prose
        #[arg(long)]
        llm: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Load and validate a catalog
    Validate {
        #[arg(long, default_value = "data/catalog.json")]
        catalog: PathBuf,
    },
    /// Monte Carlo over a site's service values
    Simulate {
        #[arg(long)]
        site: String,
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        scenario: ScenarioArgs,
        #[arg(long)]
        iterations: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// One-at-a-time sensitivity over a site's service values
    Sensitivity {
        #[arg(long)]
        site: String,
        #[command(flatten)]
        data: DataArgs,
        #[command(flatten)]
        scenario: ScenarioArgs,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Prune the evidence cache (by age and/or size)
    CachePrune {
        #[arg(long)]
        db: Option<PathBuf>,
        #[arg(long)]
        max_age_days: Option<u64>,
        #[arg(long)]
        max_rows: Option<usize>,
    },
}

#[derive(Serialize)]
struct CatalogSummary<'a> {
    version: &'a str,
    habitats: Vec<&'a str>,
    axioms: usize,
    concepts: usize,
    low_confidence_axioms: Vec<&'a str>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("esv_bridge=warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;

    match cli.command {
        Commands::Ask {
            question,
            data,
            site,
            scenario,
            simulate,
            sensitivity,
            cache,
            llm,
            out,
        } => {
            let engine = build_engine(&data, cache.as_deref(), llm, config).await?;
            let request = QueryRequest {
                question,
                site,
                scenario: scenario.to_parameters(),
                simulate,
                sensitivity,
            };
            match engine.answer(&request).await {
                Ok(result) => emit(&result, out.as_deref())?,
                Err(err) => {
                    let hint = err
                        .retry_after()
                        .map(|d| format!(" (retry after {}s)", d.as_secs()))
                        .unwrap_or_default();
                    return Err(format!("{}: {err}{hint}", err.code()).into());
                }
            }
        }
        Commands::Validate { catalog } => {
            let registry = AxiomRegistry::from_path(&catalog)?;
            let summary = CatalogSummary {
                version: registry.version(),
                habitats: registry.habitats().iter().map(|h| h.as_str()).collect(),
                axioms: registry.len(),
                concepts: registry.concepts().len(),
                low_confidence_axioms: registry
                    .axioms()
                    .iter()
                    .filter(|a| a.is_low_confidence())
                    .map(|a| a.id.as_str())
                    .collect(),
            };
            emit(&summary, None)?;
        }
        Commands::Simulate {
            site,
            data,
            scenario,
            iterations,
            seed,
            out,
        } => {
            if let Some(n) = iterations {
                config.monte_carlo.iterations = n;
            }
            if let Some(seed) = seed {
                config.monte_carlo.seed = seed;
            }
            let mc: MonteCarloConfig = config.monte_carlo.clone();
            let engine = build_engine(&data, None, false, config).await?;
            let assessment = engine
                .assess_site(&site, scenario.to_parameters().as_ref(), None)
                .await?;
            let result = simulate(&assessment.valuation.services, &mc)?;
            emit(&result, out.as_deref())?;
        }
        Commands::Sensitivity {
            site,
            data,
            scenario,
            out,
        } => {
            let engine = build_engine(&data, None, false, config).await?;
            let assessment = engine
                .assess_site(&site, scenario.to_parameters().as_ref(), None)
                .await?;
            emit(&analyze(&assessment.valuation.services), out.as_deref())?;
        }
        Commands::CachePrune {
            db,
            max_age_days,
            max_rows,
        } => {
            if max_age_days.is_none() && max_rows.is_none() {
                return Err("cache-prune requires --max-age-days and/or --max-rows".into());
            }
            if matches!(max_rows, Some(0)) {
                return Err("--max-rows must be >= 1".into());
            }
            let path = db.unwrap_or_else(SqliteEvidenceCache::default_path);
            let cache = SqliteEvidenceCache::new(path)?;
            let stats = cache.prune(max_age_days, max_rows).await?;
            println!("pruned {} rows; {} rows remain", stats.deleted, stats.remaining);
        }
    }

    Ok(())
}

async fn build_engine(
    data: &DataArgs,
    cache: Option<&Path>,
    llm: bool,
    config: EngineConfig,
) -> Result<ReasoningEngine, Box<dyn std::error::Error>> {
    let registry = Arc::new(AxiomRegistry::from_path(&data.catalog)?);
    let snapshot = GraphSnapshot::from_path(&data.graph)?;
    let memory = InMemoryEvidenceStore::new(registry.clone(), snapshot);
    let aliases = SiteAliases::from_sites(memory.sites());

    let store: Arc<dyn EvidenceStore> = match cache {
        Some(path) => Arc::new(CachedEvidenceStore::new(
            memory,
            SqliteEvidenceCache::new(path)?,
            registry.version(),
        )),
        None => Arc::new(memory),
    };

    let classifier_config: ClassifierConfig = config.classifier.clone();
    let mut classifier = QueryClassifier::new(registry.clone(), aliases, classifier_config);
    let model = config.model.clone();

    let client: Option<Arc<dyn ChatCompletion>> = if llm {
        let client = RetryingClient::new(OpenRouterClient::from_env()?, RetryConfig::default());
        Some(Arc::new(client))
    } else {
        None
    };
    if let Some(client) = &client {
        classifier = classifier.with_fallback(Arc::new(LlmClassifier::new(client.clone(), model.clone())));
    }

    let mut engine = ReasoningEngine::new(registry, store, classifier, config);
    if let Some(client) = client {
        engine = engine.with_generator(Arc::new(LlmAnswerGenerator::new(client, model)));
    }
    Ok(engine)
}

fn emit<T: Serialize>(value: &T, out: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let json = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => std::fs::write(path, json)?,
        None => println!("{json}"),
    }
    Ok(())
}
