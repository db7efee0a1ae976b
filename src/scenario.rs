//! What-if scenario parameters for risk assessment.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::chain::ServiceValue;
use crate::evidence::EcologicalState;

pub const CARBON_PRICE_INPUT: &str = "carbon_price_usd_per_t";
const AREA_SUFFIX: &str = "_area_ha";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScenarioError {
    #[error("{parameter} = {value} is outside [{min}, {max}]")]
    OutOfBounds {
        parameter: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

/// Adjustments applied on top of a site's observed state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioParameters {
    /// Replaces the carbon price input, USD per tonne CO2e.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carbon_price_usd_per_t: Option<f64>,
    /// Share of habitat area lost, 0-100. Scales every `*_area_ha` input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub habitat_loss_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tourism_growth_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fisheries_change_pct: Option<f64>,
}

impl ScenarioParameters {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        check("carbon_price_usd_per_t", self.carbon_price_usd_per_t, 0.0, 500.0)?;
        check("habitat_loss_pct", self.habitat_loss_pct, 0.0, 100.0)?;
        check("tourism_growth_pct", self.tourism_growth_pct, -100.0, 200.0)?;
        check("fisheries_change_pct", self.fisheries_change_pct, -100.0, 200.0)?;
        Ok(())
    }

    /// Chain inputs this scenario sets, taking precedence over measurements.
    pub fn input_overrides(&self, state: &EcologicalState) -> BTreeMap<String, f64> {
        let mut overrides = BTreeMap::new();
        if let Some(price) = self.carbon_price_usd_per_t {
            overrides.insert(CARBON_PRICE_INPUT.to_string(), price);
        }
        if let Some(loss) = self.habitat_loss_pct {
            let keep = 1.0 - loss / 100.0;
            for (name, m) in &state.measurements {
                if name.ends_with(AREA_SUFFIX) {
                    overrides.insert(name.clone(), m.value * keep);
                }
            }
        }
        overrides
    }

    /// Scale tourism and fisheries services by their growth settings.
    pub fn adjust_services(&self, services: &mut [ServiceValue]) {
        for service in services {
            let pct = if service.service.contains("tourism") {
                self.tourism_growth_pct
            } else if service.service.contains("fisher") {
                self.fisheries_change_pct
            } else {
                None
            };
            if let Some(pct) = pct {
                let factor = 1.0 + pct / 100.0;
                service.mean *= factor;
                service.ci_low *= factor;
                service.ci_high *= factor;
            }
        }
    }

    /// Short human-readable summary for caveats and logs.
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = self.carbon_price_usd_per_t {
            parts.push(format!("carbon price {v} USD/t"));
        }
        if let Some(v) = self.habitat_loss_pct {
            parts.push(format!("habitat loss {v}%"));
        }
        if let Some(v) = self.tourism_growth_pct {
            parts.push(format!("tourism {v:+}%"));
        }
        if let Some(v) = self.fisheries_change_pct {
            parts.push(format!("fisheries {v:+}%"));
        }
        if parts.is_empty() {
            "baseline".to_string()
        } else {
            parts.join(", ")
        }
    }
}

fn check(parameter: &'static str, value: Option<f64>, min: f64, max: f64) -> Result<(), ScenarioError> {
    match value {
        Some(v) if !(v.is_finite() && (min..=max).contains(&v)) => Err(ScenarioError::OutOfBounds {
            parameter,
            value: v,
            min,
            max,
        }),
        _ => Ok(()),
    }
}
