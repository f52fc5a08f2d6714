//! Stateless valuation models: discounted cash flow and the Gordon-growth
//! dividend discount model. Pure functions over normalized data with no
//! I/O, deterministic for identical inputs.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use valuation_core::{
    ModelKind, NormalizedFundamentals, Provenance, ValuationError, ValuationResult,
};

/// Minimum cash-flow periods a DCF needs to estimate a trend.
pub const MIN_CASHFLOW_PERIODS: usize = 2;

const DEFAULT_PROJECTION_YEARS: usize = 5;

/// DCF assumptions. `growth_rate: None` derives the rate from the CAGR of
/// the free-cash-flow history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcfConfig {
    pub growth_rate: Option<f64>,
    /// Required rate of return (WACC input).
    pub discount_rate: f64,
    pub terminal_growth_rate: f64,
    pub projection_years: usize,
}

impl Default for DcfConfig {
    fn default() -> Self {
        Self {
            growth_rate: None,
            discount_rate: 0.12,
            terminal_growth_rate: 0.02,
            projection_years: DEFAULT_PROJECTION_YEARS,
        }
    }
}

/// DDM assumptions. `dividend_growth_rate: None` derives the rate from
/// the CAGR of the dividend history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DdmConfig {
    pub required_return: f64,
    pub dividend_growth_rate: Option<f64>,
}

impl Default for DdmConfig {
    fn default() -> Self {
        Self {
            required_return: 0.12,
            dividend_growth_rate: None,
        }
    }
}

/// Compound annual growth rate between the first and last point of a
/// series spanning `periods` intervals.
pub fn compound_annual_growth_rate(
    first: f64,
    last: f64,
    periods: usize,
) -> Result<f64, ValuationError> {
    if periods == 0 {
        return Err(ValuationError::InvalidAssumptions(
            "cannot derive a growth rate from a single period".to_string(),
        ));
    }
    if first <= 0.0 || last <= 0.0 {
        return Err(ValuationError::InvalidAssumptions(format!(
            "cannot derive a growth rate from non-positive values ({} -> {}); \
             supply an explicit growth rate instead",
            first, last
        )));
    }
    Ok((last / first).powf(1.0 / periods as f64) - 1.0)
}

/// Intrinsic value per share via discounted free cash flows.
///
/// Projects `projection_years` flows compounding at the growth rate,
/// discounts each plus a Gordon-growth terminal value back to present at
/// the discount rate, and divides the sum by shares outstanding.
pub fn compute_dcf(
    fundamentals: &NormalizedFundamentals,
    config: &DcfConfig,
) -> Result<ValuationResult, ValuationError> {
    fundamentals.validate()?;

    if config.discount_rate <= 0.0 {
        return Err(ValuationError::InvalidAssumptions(format!(
            "discount rate must be positive, got {}",
            config.discount_rate
        )));
    }
    if config.discount_rate <= config.terminal_growth_rate {
        // Terminal value would diverge or go negative.
        return Err(ValuationError::InvalidAssumptions(format!(
            "discount rate {} must exceed terminal growth rate {}",
            config.discount_rate, config.terminal_growth_rate
        )));
    }
    if config.projection_years == 0 {
        return Err(ValuationError::InvalidAssumptions(
            "projection_years must be at least 1".to_string(),
        ));
    }

    let flows = &fundamentals.free_cash_flows;
    if flows.len() < MIN_CASHFLOW_PERIODS {
        return Err(ValuationError::InsufficientHistory {
            required: MIN_CASHFLOW_PERIODS,
            available: flows.len(),
        });
    }

    let (growth_rate, growth_source) = match config.growth_rate {
        Some(g) => (g, "override"),
        None => {
            let first = flows.first().map(|c| c.free_cash_flow).unwrap_or(0.0);
            let last = flows.last().map(|c| c.free_cash_flow).unwrap_or(0.0);
            (
                compound_annual_growth_rate(first, last, flows.len() - 1)?,
                "derived_cagr",
            )
        }
    };

    let last_flow = fundamentals
        .latest_free_cash_flow()
        .expect("length checked above");
    if last_flow <= 0.0 {
        return Err(ValuationError::InvalidAssumptions(format!(
            "latest free cash flow {} is not positive; DCF is inapplicable",
            last_flow
        )));
    }

    let r = config.discount_rate;
    let mut projected = last_flow;
    let mut present_value = 0.0;
    for year in 1..=config.projection_years {
        projected *= 1.0 + growth_rate;
        present_value += projected / (1.0 + r).powi(year as i32);
    }

    // The terminal value stands in for the year after the projection
    // horizon, so it is discounted one period further than the last
    // projected flow.
    let terminal_value =
        projected * (1.0 + config.terminal_growth_rate) / (r - config.terminal_growth_rate);
    present_value += terminal_value / (1.0 + r).powi(config.projection_years as i32 + 1);

    let per_share = present_value / fundamentals.shares_outstanding;
    tracing::debug!(
        "DCF for {}: growth {:.4}, discount {:.4}, enterprise value {:.2}, per share {:.2}",
        fundamentals.symbol,
        growth_rate,
        r,
        present_value,
        per_share
    );

    Ok(ValuationResult {
        symbol: fundamentals.symbol.clone(),
        model: ModelKind::Dcf,
        intrinsic_value: per_share,
        currency: fundamentals.currency.clone(),
        assumptions: json!({
            "growth_rate": growth_rate,
            "growth_source": growth_source,
            "discount_rate": r,
            "terminal_growth_rate": config.terminal_growth_rate,
            "projection_years": config.projection_years,
            "last_free_cash_flow": last_flow,
            "shares_outstanding": fundamentals.shares_outstanding,
        }),
        provenance: Provenance {
            quote: None,
            fundamentals: Some(fundamentals.source.clone()),
            cashflows: Some(fundamentals.source.clone()),
        },
        computed_at: Utc::now(),
    })
}

/// Intrinsic value per share via the Gordon growth dividend discount
/// model: `next expected dividend / (required return - growth)`.
pub fn compute_ddm(
    fundamentals: &NormalizedFundamentals,
    config: &DdmConfig,
) -> Result<ValuationResult, ValuationError> {
    let dividends = &fundamentals.dividends_per_share;
    if dividends.is_empty() {
        // DDM is inapplicable to non-dividend payers; surfaced, never a
        // silent zero valuation.
        return Err(ValuationError::NoDividendHistory(
            fundamentals.symbol.clone(),
        ));
    }

    let last_dividend = *dividends.last().expect("non-empty checked above");
    if last_dividend <= 0.0 {
        return Err(ValuationError::NoDividendHistory(
            fundamentals.symbol.clone(),
        ));
    }

    let (growth, growth_source) = match config.dividend_growth_rate {
        Some(g) => (g, "override"),
        None => (
            compound_annual_growth_rate(dividends[0], last_dividend, dividends.len() - 1)?,
            "derived_cagr",
        ),
    };

    if config.required_return <= growth {
        return Err(ValuationError::InvalidAssumptions(format!(
            "required return {} must exceed dividend growth rate {}",
            config.required_return, growth
        )));
    }

    let next_dividend = last_dividend * (1.0 + growth);
    let value = next_dividend / (config.required_return - growth);

    Ok(ValuationResult {
        symbol: fundamentals.symbol.clone(),
        model: ModelKind::Ddm,
        intrinsic_value: value,
        currency: fundamentals.currency.clone(),
        assumptions: json!({
            "dividend_growth_rate": growth,
            "growth_source": growth_source,
            "required_return": config.required_return,
            "last_dividend": last_dividend,
            "next_expected_dividend": next_dividend,
        }),
        provenance: Provenance {
            quote: None,
            fundamentals: Some(fundamentals.source.clone()),
            cashflows: None,
        },
        computed_at: Utc::now(),
    })
}

/// Blended fair value across models, with a margin-of-safety target price.
#[derive(Debug, Clone, Serialize)]
pub struct FairValueSummary {
    pub symbol: String,
    pub currency: String,
    pub dcf_value: Option<f64>,
    pub ddm_value: Option<f64>,
    /// Mean of the models that produced a value.
    pub fair_value: f64,
    /// Fair value discounted by the margin of safety.
    pub target_price: f64,
    /// Percent upside of fair value vs. the last traded price.
    pub upside_percent: Option<f64>,
    pub provenance: Provenance,
}

/// Combine DCF and DDM into a single fair value: the mean when both
/// apply, otherwise whichever succeeded. `margin_of_safety` is a fraction
/// in `[0, 1)` shaved off the fair value to produce a target price.
pub fn blend_fair_value(
    dcf: Option<&ValuationResult>,
    ddm: Option<&ValuationResult>,
    last_price: Option<f64>,
    margin_of_safety: f64,
) -> Result<FairValueSummary, ValuationError> {
    if !(0.0..1.0).contains(&margin_of_safety) {
        return Err(ValuationError::InvalidAssumptions(format!(
            "margin of safety must be in [0, 1), got {}",
            margin_of_safety
        )));
    }

    let base = dcf.or(ddm).ok_or_else(|| {
        ValuationError::InvalidAssumptions(
            "neither DCF nor DDM produced a value to blend".to_string(),
        )
    })?;

    if let (Some(a), Some(b)) = (dcf, ddm) {
        if a.currency != b.currency {
            return Err(ValuationError::CurrencyMismatch {
                expected: a.currency.clone(),
                found: b.currency.clone(),
            });
        }
    }

    let fair_value = match (dcf, ddm) {
        (Some(a), Some(b)) => (a.intrinsic_value + b.intrinsic_value) / 2.0,
        (Some(a), None) => a.intrinsic_value,
        (None, Some(b)) => b.intrinsic_value,
        (None, None) => unreachable!("guarded above"),
    };

    let upside_percent = last_price
        .filter(|p| *p > 0.0)
        .map(|p| (fair_value - p) / p * 100.0);

    Ok(FairValueSummary {
        symbol: base.symbol.clone(),
        currency: base.currency.clone(),
        dcf_value: dcf.map(|r| r.intrinsic_value),
        ddm_value: ddm.map(|r| r.intrinsic_value),
        fair_value,
        target_price: fair_value * (1.0 - margin_of_safety),
        upside_percent,
        provenance: base.provenance.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use valuation_core::Cashflow;

    /// Helper: fundamentals with the given annual free cash flows,
    /// oldest first, starting at fiscal 2020.
    fn fundamentals(flows: &[f64], dividends: &[f64], shares: f64) -> NormalizedFundamentals {
        NormalizedFundamentals {
            symbol: "AAA.NS".to_string(),
            currency: "INR".to_string(),
            revenue: Some(1_000.0),
            free_cash_flows: flows
                .iter()
                .enumerate()
                .map(|(i, f)| Cashflow {
                    fiscal_year: 2020 + i as i32,
                    free_cash_flow: *f,
                })
                .collect(),
            shares_outstanding: shares,
            dividends_per_share: dividends.to_vec(),
            growth_estimate: None,
            beta: None,
            source: "alpha_vantage".to_string(),
        }
    }

    #[test]
    fn test_cagr_derivation() {
        let g = compound_annual_growth_rate(100.0, 121.0, 2).unwrap();
        assert!((g - 0.10).abs() < 1e-12);

        assert!(compound_annual_growth_rate(100.0, 121.0, 0).is_err());
        assert!(compound_annual_growth_rate(-100.0, 121.0, 2).is_err());
        assert!(compound_annual_growth_rate(100.0, 0.0, 2).is_err());
    }

    #[test]
    fn test_dcf_reference_example() {
        // 10% CAGR history, r = 0.12, terminal g = 0.03, 2-year horizon,
        // 100 shares.
        let f = fundamentals(&[100.0, 110.0, 121.0], &[], 100.0);
        let config = DcfConfig {
            growth_rate: None,
            discount_rate: 0.12,
            terminal_growth_rate: 0.03,
            projection_years: 2,
        };

        let result = compute_dcf(&f, &config).unwrap();

        // Closed form: flows 133.1, 146.41 discounted at 12%, plus the
        // Gordon terminal value as a third flow discounted from year 3.
        let y1 = 121.0 * 1.10;
        let y2 = y1 * 1.10;
        let terminal = y2 * 1.03 / (0.12 - 0.03);
        let expected =
            (y1 / 1.12 + y2 / 1.12_f64.powi(2) + terminal / 1.12_f64.powi(3)) / 100.0;
        assert!((result.intrinsic_value - expected).abs() < 1e-9);
        assert_eq!(result.model, ModelKind::Dcf);
        assert_eq!(result.currency, "INR");
        assert_eq!(result.assumptions["growth_source"], "derived_cagr");

        // Deterministic across repeated runs with identical inputs.
        let again = compute_dcf(&f, &config).unwrap();
        assert_eq!(result.intrinsic_value, again.intrinsic_value);
    }

    #[test]
    fn test_dcf_monotone_in_discount_rate() {
        let f = fundamentals(&[100.0, 110.0, 121.0], &[], 100.0);
        let mut config = DcfConfig::default();

        let mut previous = f64::INFINITY;
        for r in [0.08, 0.10, 0.12, 0.15, 0.20] {
            config.discount_rate = r;
            let value = compute_dcf(&f, &config).unwrap().intrinsic_value;
            assert!(
                value < previous,
                "value {} at r={} not below {}",
                value,
                r,
                previous
            );
            previous = value;
        }
    }

    #[test]
    fn test_dcf_rejects_diverging_terminal_value() {
        let f = fundamentals(&[100.0, 110.0], &[], 100.0);

        let equal = DcfConfig {
            discount_rate: 0.05,
            terminal_growth_rate: 0.05,
            ..Default::default()
        };
        assert!(matches!(
            compute_dcf(&f, &equal),
            Err(ValuationError::InvalidAssumptions(_))
        ));

        let inverted = DcfConfig {
            discount_rate: 0.03,
            terminal_growth_rate: 0.05,
            ..Default::default()
        };
        assert!(matches!(
            compute_dcf(&f, &inverted),
            Err(ValuationError::InvalidAssumptions(_))
        ));

        let non_positive = DcfConfig {
            discount_rate: 0.0,
            terminal_growth_rate: -0.01,
            ..Default::default()
        };
        assert!(matches!(
            compute_dcf(&f, &non_positive),
            Err(ValuationError::InvalidAssumptions(_))
        ));
    }

    #[test]
    fn test_dcf_insufficient_history() {
        let f = fundamentals(&[121.0], &[], 100.0);
        assert!(matches!(
            compute_dcf(&f, &DcfConfig::default()),
            Err(ValuationError::InsufficientHistory {
                required: 2,
                available: 1
            })
        ));
    }

    #[test]
    fn test_dcf_growth_override_beats_history() {
        let f = fundamentals(&[100.0, 110.0, 121.0], &[], 100.0);
        let config = DcfConfig {
            growth_rate: Some(0.25),
            ..Default::default()
        };
        let result = compute_dcf(&f, &config).unwrap();
        assert_eq!(result.assumptions["growth_source"], "override");
        assert!((result.assumptions["growth_rate"].as_f64().unwrap() - 0.25).abs() < 1e-12);

        let derived = compute_dcf(&f, &DcfConfig::default()).unwrap();
        assert!(result.intrinsic_value > derived.intrinsic_value);
    }

    #[test]
    fn test_dcf_negative_latest_flow_rejected() {
        // Derivation would fail first, so force an override.
        let f = fundamentals(&[100.0, -50.0], &[], 100.0);
        let config = DcfConfig {
            growth_rate: Some(0.05),
            ..Default::default()
        };
        assert!(matches!(
            compute_dcf(&f, &config),
            Err(ValuationError::InvalidAssumptions(_))
        ));
    }

    #[test]
    fn test_ddm_gordon_value() {
        let f = fundamentals(&[100.0, 110.0], &[20.0], 100.0);
        let config = DdmConfig {
            required_return: 0.12,
            dividend_growth_rate: Some(0.08),
        };
        let result = compute_ddm(&f, &config).unwrap();
        // 20 * 1.08 / (0.12 - 0.08) = 540
        assert!((result.intrinsic_value - 540.0).abs() < 1e-9);
        assert_eq!(result.model, ModelKind::Ddm);
    }

    #[test]
    fn test_ddm_growth_derived_from_history() {
        let f = fundamentals(&[100.0, 110.0], &[10.0, 11.0, 12.1], 100.0);
        let config = DdmConfig {
            required_return: 0.15,
            dividend_growth_rate: None,
        };
        let result = compute_ddm(&f, &config).unwrap();
        // Derived growth 10%: 12.1 * 1.10 / (0.15 - 0.10) = 266.2
        assert!((result.intrinsic_value - 266.2).abs() < 1e-9);
        assert_eq!(result.assumptions["growth_source"], "derived_cagr");
    }

    #[test]
    fn test_ddm_required_return_boundary() {
        let f = fundamentals(&[100.0, 110.0], &[20.0], 100.0);

        // Equality must fail cleanly, never divide by zero.
        let equal = DdmConfig {
            required_return: 0.08,
            dividend_growth_rate: Some(0.08),
        };
        assert!(matches!(
            compute_ddm(&f, &equal),
            Err(ValuationError::InvalidAssumptions(_))
        ));

        let inverted = DdmConfig {
            required_return: 0.05,
            dividend_growth_rate: Some(0.08),
        };
        assert!(matches!(
            compute_ddm(&f, &inverted),
            Err(ValuationError::InvalidAssumptions(_))
        ));
    }

    #[test]
    fn test_ddm_no_dividend_history() {
        let f = fundamentals(&[100.0, 110.0], &[], 100.0);
        let result = compute_ddm(&f, &DdmConfig::default());
        assert!(matches!(result, Err(ValuationError::NoDividendHistory(_))));
    }

    #[test]
    fn test_blend_prefers_mean_of_both_models() {
        let f = fundamentals(&[100.0, 110.0, 121.0], &[10.0, 11.0, 12.1], 100.0);
        let dcf = compute_dcf(&f, &DcfConfig::default()).unwrap();
        let ddm = compute_ddm(
            &f,
            &DdmConfig {
                required_return: 0.15,
                dividend_growth_rate: None,
            },
        )
        .unwrap();

        let summary = blend_fair_value(Some(&dcf), Some(&ddm), Some(150.0), 0.20).unwrap();
        let expected_fair = (dcf.intrinsic_value + ddm.intrinsic_value) / 2.0;
        assert!((summary.fair_value - expected_fair).abs() < 1e-9);
        assert!((summary.target_price - expected_fair * 0.8).abs() < 1e-9);
        let expected_upside = (expected_fair - 150.0) / 150.0 * 100.0;
        assert!((summary.upside_percent.unwrap() - expected_upside).abs() < 1e-9);
    }

    #[test]
    fn test_blend_falls_back_to_single_model() {
        let f = fundamentals(&[100.0, 110.0, 121.0], &[], 100.0);
        let dcf = compute_dcf(&f, &DcfConfig::default()).unwrap();

        let summary = blend_fair_value(Some(&dcf), None, None, 0.0).unwrap();
        assert_eq!(summary.fair_value, dcf.intrinsic_value);
        assert_eq!(summary.ddm_value, None);
        assert_eq!(summary.upside_percent, None);

        assert!(blend_fair_value(None, None, None, 0.2).is_err());
    }
}
