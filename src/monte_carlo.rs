//! Monte Carlo propagation of service-value uncertainty.
//!
//! Each service is sampled independently from its declared distribution and
//! the draws are summed per iteration. Correlation between services (a storm
//! that hits tourism and coastal protection together) is not modeled; the
//! aggregate spread is therefore narrower than it would be under positive
//! correlation.
//!
//! Iterations run in fixed-size chunks on the rayon pool. Every chunk owns an
//! RNG seeded from the run seed and the chunk index, so results depend on the
//! seed alone, never on thread count or scheduling.

use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{LogNormal, Triangular};
use statrs::statistics::{Data, OrderStatistics, Statistics};

use crate::axiom::DistributionKind;
use crate::chain::ServiceValue;

pub const DEFAULT_ITERATIONS: usize = 10_000;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_BINS: usize = 20;

const CHUNK_SIZE: usize = 1_000;
/// z-score of a two-sided 95% interval.
const Z_95: f64 = 1.96;
const CHUNK_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimulationError {
    #[error("invalid distribution for {service}: {reason}")]
    InvalidDistribution { service: String, reason: String },
    #[error("nothing to simulate: no services")]
    NoServices,
    #[error("iterations must be positive")]
    ZeroIterations,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloConfig {
    pub iterations: usize,
    pub seed: u64,
    pub bins: usize,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            seed: DEFAULT_SEED,
            bins: DEFAULT_BINS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBin {
    pub lower: f64,
    pub upper: f64,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub iterations: usize,
    pub seed: u64,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub p5: f64,
    pub p50: f64,
    pub p95: f64,
    pub histogram: Vec<HistogramBin>,
}

#[derive(Debug, Clone, Copy)]
enum Sampler {
    Constant(f64),
    Triangular(Triangular),
    LogNormal(LogNormal),
}

impl Sampler {
    fn for_service(service: &ServiceValue) -> Result<Self, SimulationError> {
        let invalid = |reason: String| SimulationError::InvalidDistribution {
            service: service.service.clone(),
            reason,
        };
        let (lo, mean, hi) = (service.ci_low, service.mean, service.ci_high);
        if !(lo.is_finite() && mean.is_finite() && hi.is_finite()) {
            return Err(invalid("non-finite parameters".into()));
        }
        if !(lo <= mean && mean <= hi) {
            return Err(invalid(format!(
                "expected ci_low <= mean <= ci_high, got {lo} / {mean} / {hi}"
            )));
        }
        if lo == hi {
            return Ok(Sampler::Constant(mean));
        }
        match service.distribution {
            DistributionKind::Triangular => Triangular::new(lo, hi, mean)
                .map(Sampler::Triangular)
                .map_err(|e| invalid(e.to_string())),
            DistributionKind::Lognormal => {
                if lo <= 0.0 {
                    return Err(invalid(format!("lognormal needs positive bounds, got ci_low {lo}")));
                }
                let sigma = (hi.ln() - lo.ln()) / (2.0 * Z_95);
                let mu = mean.ln() - sigma * sigma / 2.0;
                LogNormal::new(mu, sigma)
                    .map(Sampler::LogNormal)
                    .map_err(|e| invalid(e.to_string()))
            }
        }
    }

    fn draw(&self, rng: &mut StdRng) -> f64 {
        match self {
            Sampler::Constant(v) => *v,
            Sampler::Triangular(d) => d.sample(rng),
            Sampler::LogNormal(d) => d.sample(rng),
        }
    }
}

/// Simulate the summed value of `services`.
pub fn simulate(services: &[ServiceValue], config: &MonteCarloConfig) -> Result<SimulationResult, SimulationError> {
    if services.is_empty() {
        return Err(SimulationError::NoServices);
    }
    if config.iterations == 0 {
        return Err(SimulationError::ZeroIterations);
    }
    let samplers = services
        .iter()
        .map(Sampler::for_service)
        .collect::<Result<Vec<_>, _>>()?;

    let chunks = config.iterations.div_ceil(CHUNK_SIZE);
    let mut totals: Vec<f64> = (0..chunks)
        .into_par_iter()
        .map(|chunk| {
            let start = chunk * CHUNK_SIZE;
            let len = CHUNK_SIZE.min(config.iterations - start);
            let mut rng = StdRng::seed_from_u64(chunk_seed(config.seed, chunk));
            (0..len)
                .map(|_| samplers.iter().map(|s| s.draw(&mut rng)).sum::<f64>())
                .collect::<Vec<f64>>()
        })
        .flatten()
        .collect();

    totals.sort_by(f64::total_cmp);
    let mean = totals.iter().mean();
    let std_dev = if totals.len() > 1 { totals.iter().std_dev() } else { 0.0 };
    let min = totals[0];
    let max = totals[totals.len() - 1];
    let histogram = histogram(&totals, config.bins.max(1), min, max);

    let mut data = Data::new(totals);
    Ok(SimulationResult {
        iterations: config.iterations,
        seed: config.seed,
        mean,
        std_dev,
        min,
        max,
        p5: data.percentile(5),
        p50: data.percentile(50),
        p95: data.percentile(95),
        histogram,
    })
}

fn chunk_seed(seed: u64, chunk: usize) -> u64 {
    seed.wrapping_add((chunk as u64).wrapping_mul(CHUNK_SEED_STRIDE))
}

fn histogram(sorted: &[f64], bins: usize, min: f64, max: f64) -> Vec<HistogramBin> {
    if max <= min {
        return vec![HistogramBin {
            lower: min,
            upper: max,
            count: sorted.len(),
        }];
    }
    let width = (max - min) / bins as f64;
    let mut out: Vec<HistogramBin> = (0..bins)
        .map(|i| HistogramBin {
            lower: min + width * i as f64,
            upper: if i + 1 == bins { max } else { min + width * (i + 1) as f64 },
            count: 0,
        })
        .collect();
    for v in sorted {
        let idx = (((v - min) / width) as usize).min(bins - 1);
        out[idx].count += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, lo: f64, mean: f64, hi: f64, distribution: DistributionKind) -> ServiceValue {
        ServiceValue {
            service: name.into(),
            axiom_id: "BA-000".into(),
            unit: "usd".into(),
            mean,
            ci_low: lo,
            ci_high: hi,
            distribution,
        }
    }

    #[test]
    fn constant_services_collapse() {
        let result = simulate(
            &[service("a", 5.0, 5.0, 5.0, DistributionKind::Triangular)],
            &MonteCarloConfig {
                iterations: 100,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(result.p5, 5.0);
        assert_eq!(result.p95, 5.0);
        assert_eq!(result.histogram.len(), 1);
        assert_eq!(result.histogram[0].count, 100);
    }

    #[test]
    fn rejects_mean_outside_interval() {
        let err = simulate(
            &[service("a", 5.0, 1.0, 10.0, DistributionKind::Triangular)],
            &MonteCarloConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SimulationError::InvalidDistribution { .. }));
    }

    #[test]
    fn lognormal_requires_positive_bounds() {
        let err = simulate(
            &[service("a", 0.0, 1.0, 10.0, DistributionKind::Lognormal)],
            &MonteCarloConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SimulationError::InvalidDistribution { .. }));
    }

    #[test]
    fn percentiles_are_ordered_and_within_support() {
        let result = simulate(
            &[
                service("tourism", 10.0, 20.0, 40.0, DistributionKind::Triangular),
                service("protection", 5.0, 10.0, 20.0, DistributionKind::Lognormal),
            ],
            &MonteCarloConfig {
                iterations: 5_000,
                seed: 7,
                bins: 10,
            },
        )
        .unwrap();
        assert!(result.p5 <= result.p50 && result.p50 <= result.p95);
        assert!(result.min >= 10.0);
        assert_eq!(result.histogram.iter().map(|b| b.count).sum::<usize>(), 5_000);
    }
}
