//! One-at-a-time sensitivity analysis.
//!
//! Each parameter is moved by -20%, -10%, +10% and +20% with every other
//! parameter at baseline, so N parameters cost exactly `4N + 1` model
//! evaluations including the baseline. The valuation model is additive across
//! independent services, which makes first-order OAT sufficient.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::chain::ServiceValue;

pub const PERTURBATIONS: [f64; 4] = [-0.20, -0.10, 0.10, 0.20];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Perturbation {
    /// Relative change applied, e.g. `-0.1`.
    pub change: f64,
    pub total: f64,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityRow {
    pub parameter: String,
    pub baseline: f64,
    pub perturbations: Vec<Perturbation>,
    pub max_abs_delta: f64,
}

/// One bar of a tornado chart: the swing between the extreme perturbations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TornadoBar {
    pub parameter: String,
    pub low_delta: f64,
    pub high_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensitivityReport {
    pub baseline_total: f64,
    pub evaluations: usize,
    /// Ranked by `max_abs_delta`, largest first.
    pub rows: Vec<SensitivityRow>,
    pub dominant_parameter: Option<String>,
    pub tornado: Vec<TornadoBar>,
}

/// OAT over service means with the additive valuation model.
pub fn analyze(services: &[ServiceValue]) -> SensitivityReport {
    let names: Vec<String> = services.iter().map(|s| s.service.clone()).collect();
    let baseline: Vec<f64> = services.iter().map(|s| s.mean).collect();
    analyze_with(&names, &baseline, |values| values.iter().sum())
}

/// OAT over an arbitrary model of the parameter vector.
pub fn analyze_with<F>(names: &[String], baseline: &[f64], mut model: F) -> SensitivityReport
where
    F: FnMut(&[f64]) -> f64,
{
    let mut evaluations = 0usize;
    let mut eval = |values: &[f64]| {
        evaluations += 1;
        model(values)
    };

    let baseline_total = eval(baseline);
    let mut params = baseline.to_vec();
    let mut rows = Vec::with_capacity(names.len());

    for (idx, name) in names.iter().enumerate().take(baseline.len()) {
        let base = baseline[idx];
        let perturbations: Vec<Perturbation> = PERTURBATIONS
            .iter()
            .map(|change| {
                params[idx] = base * (1.0 + change);
                let total = eval(&params);
                Perturbation {
                    change: *change,
                    total,
                    delta: total - baseline_total,
                }
            })
            .collect();
        params[idx] = base;

        let max_abs_delta = perturbations.iter().map(|p| p.delta.abs()).fold(0.0, f64::max);
        rows.push(SensitivityRow {
            parameter: name.clone(),
            baseline: base,
            perturbations,
            max_abs_delta,
        });
    }

    rows.sort_by(|a, b| {
        b.max_abs_delta
            .partial_cmp(&a.max_abs_delta)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.parameter.cmp(&b.parameter))
    });

    let tornado = rows
        .iter()
        .map(|row| TornadoBar {
            parameter: row.parameter.clone(),
            low_delta: row.perturbations.first().map_or(0.0, |p| p.delta),
            high_delta: row.perturbations.last().map_or(0.0, |p| p.delta),
        })
        .collect();

    SensitivityReport {
        baseline_total,
        evaluations,
        dominant_parameter: rows.first().map(|r| r.parameter.clone()),
        rows,
        tornado,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluation_count_is_four_n_plus_one() {
        for n in 0..6 {
            let names: Vec<String> = (0..n).map(|i| format!("p{i}")).collect();
            let baseline = vec![1.0; n];
            let report = analyze_with(&names, &baseline, |v| v.iter().sum());
            assert_eq!(report.evaluations, 4 * n + 1);
        }
    }

    #[test]
    fn largest_service_dominates() {
        let names = vec!["small".to_string(), "large".to_string()];
        let report = analyze_with(&names, &[10.0, 100.0], |v| v.iter().sum());
        assert_eq!(report.dominant_parameter.as_deref(), Some("large"));
        assert!((report.rows[0].max_abs_delta - 20.0).abs() < 1e-9);
        assert!((report.tornado[0].low_delta + 20.0).abs() < 1e-9);
        assert!((report.tornado[0].high_delta - 20.0).abs() < 1e-9);
    }

    #[test]
    fn empty_input_has_no_dominant_parameter() {
        let report = analyze(&[]);
        assert_eq!(report.evaluations, 1);
        assert!(report.dominant_parameter.is_none());
    }
}
