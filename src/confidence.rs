//! Composite confidence scoring.
//!
//! `composite = tier_base * path_discount * staleness_discount * sample_factor`,
//! clamped to `[0.10, 0.95]`. Hard caps are applied after the formula and are
//! never inputs to it:
//!
//! - no evidence bound at all: at most 0.25
//! - a number in generated prose that the context does not contain: at most 0.35
//!
//! Median age uses the lower middle element for even-length lists, so ages
//! `[2, 12]` have median 2.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::axiom::{EvidenceRef, Tier};

pub const COMPOSITE_FLOOR: f64 = 0.10;
pub const COMPOSITE_CEILING: f64 = 0.95;
pub const NO_EVIDENCE_CAP: f64 = 0.25;
pub const UNVERIFIED_CLAIM_CAP: f64 = 0.35;

const PATH_STEP: f64 = 0.05;
const PATH_FLOOR: f64 = 0.10;
const FRESH_YEARS: i32 = 5;
const STALENESS_PER_YEAR: f64 = 0.02;
const STALENESS_FLOOR: f64 = 0.30;
const NO_YEAR_STALENESS: f64 = 0.85;
const SAMPLE_MIN: f64 = 0.60;
const SAMPLE_FULL_AT: usize = 4;
/// Weight of a reference without a DOI in the tier mean.
const NO_DOI_WEIGHT: f64 = 0.5;
/// Relative tolerance when matching a claimed number against the context.
const CLAIM_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceCap {
    NoEvidence,
    UnverifiedClaim,
}

impl ConfidenceCap {
    pub fn ceiling(&self) -> f64 {
        match self {
            ConfidenceCap::NoEvidence => NO_EVIDENCE_CAP,
            ConfidenceCap::UnverifiedClaim => UNVERIFIED_CLAIM_CAP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub composite: f64,
    /// Product of the four factors before clamping and caps.
    pub raw_composite: f64,
    pub tier_base: f64,
    pub path_discount: f64,
    pub staleness_discount: f64,
    pub sample_factor: f64,
    pub hops: usize,
    pub median_age_years: Option<i32>,
    pub caps: Vec<ConfidenceCap>,
    pub explanation: String,
}

impl ConfidenceBreakdown {
    /// Apply a hard ceiling. Idempotent per cap kind.
    pub fn apply_cap(&mut self, cap: ConfidenceCap) {
        if !self.caps.contains(&cap) {
            self.caps.push(cap);
        }
        self.composite = self.composite.min(cap.ceiling());
        self.explanation = explain(self);
    }

    pub fn is_capped(&self) -> bool {
        !self.caps.is_empty()
    }
}

/// Everything the score depends on.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceInputs<'a> {
    pub evidence: &'a [EvidenceRef],
    /// Graph distance from primary evidence to the claim.
    pub hops: usize,
    /// Independent source counts of the axioms in the chain.
    pub axiom_sources: Vec<usize>,
    /// Measurement years of bound site inputs, counted alongside evidence years.
    pub measurement_years: Vec<i32>,
}

pub fn compute(inputs: &ConfidenceInputs<'_>, reference_year: i32) -> ConfidenceBreakdown {
    let tier_base = tier_base(inputs.evidence);
    let path_discount = path_discount(inputs.hops);

    let mut years: Vec<i32> = inputs.evidence.iter().filter_map(|e| e.year).collect();
    years.extend(inputs.measurement_years.iter().copied());
    let median_age = median_age(&years, reference_year);
    let staleness_discount = staleness_discount(median_age);

    let sample_factor = if inputs.axiom_sources.is_empty() {
        let distinct: HashSet<String> = inputs.evidence.iter().map(EvidenceRef::source_key).collect();
        sample_factor(distinct.len())
    } else {
        inputs
            .axiom_sources
            .iter()
            .map(|n| sample_factor(*n))
            .fold(1.0, f64::min)
    };

    let raw_composite = tier_base * path_discount * staleness_discount * sample_factor;
    let mut breakdown = ConfidenceBreakdown {
        composite: raw_composite.clamp(COMPOSITE_FLOOR, COMPOSITE_CEILING),
        raw_composite,
        tier_base,
        path_discount,
        staleness_discount,
        sample_factor,
        hops: inputs.hops,
        median_age_years: median_age,
        caps: Vec::new(),
        explanation: String::new(),
    };
    if inputs.evidence.is_empty() {
        breakdown.apply_cap(ConfidenceCap::NoEvidence);
    }
    breakdown.explanation = explain(&breakdown);
    breakdown
}

/// Weighted mean of tier scores. An empty set scores as the default tier so
/// that the no-evidence cap, not the formula, decides the outcome.
pub fn tier_base(evidence: &[EvidenceRef]) -> f64 {
    let (sum, weight) = evidence.iter().fold((0.0, 0.0), |(sum, weight), e| {
        let w = if e.has_doi() { 1.0 } else { NO_DOI_WEIGHT };
        (sum + w * e.effective_tier().base_score(), weight + w)
    });
    if weight > 0.0 {
        sum / weight
    } else {
        Tier::DEFAULT.base_score()
    }
}

pub fn path_discount(hops: usize) -> f64 {
    (1.0 - PATH_STEP * hops as f64).max(PATH_FLOOR)
}

/// Median age in whole years; lower middle element for even counts.
pub fn median_age(years: &[i32], reference_year: i32) -> Option<i32> {
    if years.is_empty() {
        return None;
    }
    let mut ages: Vec<i32> = years.iter().map(|y| (reference_year - y).max(0)).collect();
    ages.sort_unstable();
    Some(ages[(ages.len() - 1) / 2])
}

pub fn staleness_discount(median_age: Option<i32>) -> f64 {
    match median_age {
        None => NO_YEAR_STALENESS,
        Some(age) if age <= FRESH_YEARS => 1.0,
        Some(age) => (1.0 - STALENESS_PER_YEAR * f64::from(age - FRESH_YEARS)).max(STALENESS_FLOOR),
    }
}

/// 0.60 at one source or fewer, linear to 1.00 at four.
pub fn sample_factor(sources: usize) -> f64 {
    if sources <= 1 {
        return SAMPLE_MIN;
    }
    if sources >= SAMPLE_FULL_AT {
        return 1.0;
    }
    let span = (SAMPLE_FULL_AT - 1) as f64;
    (SAMPLE_MIN + (sources - 1) as f64 * (1.0 - SAMPLE_MIN) / span).min(1.0)
}

fn explain(b: &ConfidenceBreakdown) -> String {
    let age = match b.median_age_years {
        Some(age) => format!("median age {age}y"),
        None => "no dated evidence".to_string(),
    };
    let mut text = format!(
        "tier {:.2} x path {:.2} ({} hops) x staleness {:.2} ({}) x sample {:.2} = {:.3}",
        b.tier_base, b.path_discount, b.hops, b.staleness_discount, age, b.sample_factor, b.raw_composite
    );
    if (b.raw_composite - b.raw_composite.clamp(COMPOSITE_FLOOR, COMPOSITE_CEILING)).abs() > f64::EPSILON {
        text.push_str(&format!(", clamped to [{COMPOSITE_FLOOR:.2}, {COMPOSITE_CEILING:.2}]"));
    }
    for cap in &b.caps {
        let reason = match cap {
            ConfidenceCap::NoEvidence => "no evidence bound",
            ConfidenceCap::UnverifiedClaim => "unverified numeric claim",
        };
        text.push_str(&format!(", capped at {:.2} ({reason})", cap.ceiling()));
    }
    text.push_str(&format!("; composite {:.3}", b.composite));
    text
}

// =============================================================================
// NUMERIC CLAIM VERIFICATION
// =============================================================================

static AXIOM_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bba-\d{3}\b").expect("axiom id regex"));

static NUMBER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d[\d,]*(?:\.\d+)?)(?:\s?(billion|million|thousand|bn)\b|([km])\b|\s?(%))?")
        .expect("number regex")
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericClaim {
    pub text: String,
    pub value: f64,
    pub percent: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClaimCheck {
    pub claims: Vec<NumericClaim>,
    /// Claim texts the context does not support.
    pub unverified: Vec<String>,
}

impl ClaimCheck {
    pub fn all_verified(&self) -> bool {
        self.unverified.is_empty()
    }
}

/// Pull numeric tokens out of prose, with thousand separators and scale words applied.
pub fn extract_numbers(text: &str) -> Vec<NumericClaim> {
    let stripped = AXIOM_ID.replace_all(text, " ");
    NUMBER
        .captures_iter(&stripped)
        .filter_map(|caps| {
            let whole = caps.get(0)?.as_str().trim().to_string();
            let digits = caps.get(1)?.as_str().replace(',', "");
            let base: f64 = digits.parse().ok()?;
            let scale = match caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str().to_lowercase())
                .as_deref()
            {
                Some("billion") | Some("bn") => 1e9,
                Some("million") | Some("m") => 1e6,
                Some("thousand") | Some("k") => 1e3,
                _ => 1.0,
            };
            Some(NumericClaim {
                text: whole,
                value: base * scale,
                percent: caps.get(4).is_some(),
            })
        })
        .collect()
}

/// Check every number in `answer` against the numbers present in `context`.
///
/// A claim passes when its literal text appears in the context or its value is
/// within 1% of a context value. Percentages also match their fractional form.
pub fn verify_numeric_claims(answer: &str, context: &str) -> ClaimCheck {
    let known: Vec<f64> = extract_numbers(context).into_iter().map(|n| n.value).collect();
    let claims = extract_numbers(answer);
    let unverified = claims
        .iter()
        .filter(|claim| {
            if context.contains(&claim.text) {
                return false;
            }
            let mut candidates = vec![claim.value];
            if claim.percent {
                candidates.push(claim.value / 100.0);
            }
            !candidates
                .iter()
                .any(|c| known.iter().any(|k| within_tolerance(*c, *k)))
        })
        .map(|claim| claim.text.clone())
        .collect();
    ClaimCheck { claims, unverified }
}

fn within_tolerance(claim: f64, known: f64) -> bool {
    if known == 0.0 {
        return claim == 0.0;
    }
    ((claim - known) / known).abs() <= CLAIM_TOLERANCE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference(tier: Tier, year: i32, doi: Option<&str>, title: &str) -> EvidenceRef {
        EvidenceRef {
            doi_or_url: doi.map(str::to_string),
            title: title.to_string(),
            year: Some(year),
            tier: Some(tier),
            quote: None,
            page_ref: None,
        }
    }

    #[test]
    fn median_of_two_takes_lower_age() {
        let evidence = vec![
            reference(Tier::T1, 2023, Some("10.1000/a"), "a"),
            reference(Tier::T2, 2013, Some("10.1000/b"), "b"),
        ];
        let b = compute(
            &ConfidenceInputs {
                evidence: &evidence,
                hops: 1,
                ..Default::default()
            },
            2025,
        );
        assert_eq!(b.median_age_years, Some(2));
        assert_eq!(b.staleness_discount, 1.0);
        assert!((b.tier_base - 0.875).abs() < 1e-12);
    }

    #[test]
    fn staleness_decays_then_floors() {
        assert_eq!(staleness_discount(Some(5)), 1.0);
        assert!((staleness_discount(Some(10)) - 0.90).abs() < 1e-12);
        assert_eq!(staleness_discount(Some(80)), STALENESS_FLOOR);
        assert_eq!(staleness_discount(None), NO_YEAR_STALENESS);
    }

    #[test]
    fn sample_ramp_endpoints() {
        assert_eq!(sample_factor(0), 0.60);
        assert_eq!(sample_factor(1), 0.60);
        assert!((sample_factor(2) - (0.60 + 0.4 / 3.0)).abs() < 1e-12);
        assert_eq!(sample_factor(4), 1.0);
        assert_eq!(sample_factor(9), 1.0);
    }

    #[test]
    fn doi_less_reference_weighs_half() {
        let evidence = vec![
            reference(Tier::T1, 2020, Some("10.1000/a"), "a"),
            reference(Tier::T4, 2020, None, "grey report"),
        ];
        let expected = (0.95 + 0.5 * 0.50) / 1.5;
        assert!((tier_base(&evidence) - expected).abs() < 1e-12);
    }

    #[test]
    fn empty_evidence_is_capped() {
        let b = compute(&ConfidenceInputs::default(), 2025);
        assert!(b.composite <= NO_EVIDENCE_CAP);
        assert_eq!(b.caps, vec![ConfidenceCap::NoEvidence]);
        assert!(b.explanation.contains("no evidence bound"));
    }

    #[test]
    fn composite_bounded_and_non_increasing_in_hops() {
        let evidence = vec![
            reference(Tier::T1, 2024, Some("10.1000/a"), "a"),
            reference(Tier::T1, 2024, Some("10.1000/b"), "b"),
            reference(Tier::T1, 2024, Some("10.1000/c"), "c"),
            reference(Tier::T1, 2024, Some("10.1000/d"), "d"),
        ];
        let mut previous = f64::INFINITY;
        for hops in 0..30 {
            let b = compute(
                &ConfidenceInputs {
                    evidence: &evidence,
                    hops,
                    ..Default::default()
                },
                2025,
            );
            assert!((COMPOSITE_FLOOR..=COMPOSITE_CEILING).contains(&b.composite));
            assert!(b.composite <= previous);
            previous = b.composite;
        }
    }

    #[test]
    fn claim_check_accepts_context_numbers() {
        let context = "total value: 12,500,000 USD; coefficient 0.35; biomass ratio 4.63";
        let check = verify_numeric_claims("Worth about $12.5 million, with a ratio of 4.63.", context);
        assert!(check.all_verified(), "{:?}", check.unverified);
    }

    #[test]
    fn claim_check_flags_invented_numbers_but_ignores_axiom_ids() {
        let context = "BA-001 coefficient 0.35";
        let check = verify_numeric_claims("Per BA-001 the value is 42 million.", context);
        assert_eq!(check.unverified, vec!["42 million".to_string()]);
    }

    #[test]
    fn cap_lowers_composite() {
        let evidence = vec![reference(Tier::T1, 2024, Some("10.1000/a"), "a")];
        let mut b = compute(
            &ConfidenceInputs {
                evidence: &evidence,
                ..Default::default()
            },
            2025,
        );
        b.apply_cap(ConfidenceCap::UnverifiedClaim);
        assert!(b.composite <= UNVERIFIED_CLAIM_CAP);
        assert!(b.is_capped());
    }
}
