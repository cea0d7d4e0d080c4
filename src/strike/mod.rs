// =============================================================================
// Strike Selector — filter, score, and pick one contract from a chain
// =============================================================================
//
// Filtering happens in a fixed order (DTE, delta band, liquidity gate,
// volatility band, gamma-regime delay) and each stage reports a distinct
// failure class so upstream can tell "nothing tradable" from "blocked by
// budget" from "wait for the gamma regime to roll over".
//
// Survivors are scored as a weighted sum of six fitness components; weights
// vary per setup type. Ties break on score, then distance from the
// preferred DTE window, then open interest.
// =============================================================================

use chrono::NaiveDate;
use serde::Serialize;

use crate::market::OptionRow;
use crate::types::{GexState, OptionType, Regime, SetupType};

// =============================================================================
// Request / response types
// =============================================================================

/// Hard dollar limits for a single selection.
#[derive(Debug, Clone, Copy)]
pub struct RiskBudget {
    /// Maximum total premium at risk (contracts x premium x 100).
    pub max_premium_loss: f64,
    /// Maximum capital allocated to the position.
    pub max_capital_allocation: f64,
}

/// Everything the selector needs to pick a contract.
#[derive(Debug, Clone)]
pub struct StrikeRequest {
    pub symbol: String,
    pub spot_price: f64,
    pub direction: OptionType,
    pub setup_type: SetupType,
    /// Signal confidence in [0, 100].
    pub signal_confidence: f64,
    pub expected_hold_min: f64,
    pub expected_move_pct: f64,
    pub regime: Regime,
    pub gex_state: GexState,
    /// IV percentile of the underlying in [0, 100].
    pub iv_percentile: f64,
    pub event_risk: Vec<String>,
    pub risk_budget: RiskBudget,
    pub chain: Vec<OptionRow>,
    /// Evaluation date for DTE arithmetic.
    pub today: NaiveDate,
}

/// Why no contract was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    NoValidStrike,
    LiquidityFiltered,
    DteFiltered,
    DeltaFiltered,
    BudgetExceeded,
    RegimeBlock,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NoValidStrike => "NO_VALID_STRIKE",
            Self::LiquidityFiltered => "LIQUIDITY_FILTERED",
            Self::DteFiltered => "DTE_FILTERED",
            Self::DeltaFiltered => "DELTA_FILTERED",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::RegimeBlock => "REGIME_BLOCK",
        };
        write!(f, "{s}")
    }
}

/// Per-component scores in [0, 1] plus the weighted total.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ScoreBreakdown {
    pub liquidity: f64,
    pub greeks: f64,
    pub theta: f64,
    pub vega: f64,
    pub cost: f64,
    pub gex: f64,
    pub total: f64,
}

/// Limits the exit engine will enforce on the resulting position.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Guardrails {
    /// Daily theta burn (% of premium per day) above which Tier-1 fires.
    pub theta_burn_limit_pct: f64,
    /// Spread% above which liquidity deterioration fires.
    pub max_spread_pct: f64,
}

/// A successful pick.
#[derive(Debug, Clone)]
pub struct StrikeSelection {
    pub contract: OptionRow,
    pub contracts: i64,
    pub score: ScoreBreakdown,
    pub guardrails: Guardrails,
    pub rationale: Vec<String>,
}

/// Every way a selection attempt can end.
#[derive(Debug, Clone)]
pub enum SelectionOutcome {
    Selected(Box<StrikeSelection>),
    /// Gamma-regime delay: no selection now, retry later. Not a failure.
    Delayed { reason: String },
    Failed {
        reason: FailureReason,
        rationale: Vec<String>,
    },
}

// =============================================================================
// Per-setup policy tables
// =============================================================================

/// Filter thresholds for one setup class.
#[derive(Debug, Clone, Copy)]
pub struct SetupPolicy {
    pub min_dte: i64,
    pub max_dte: i64,
    pub preferred_dte_lo: i64,
    pub preferred_dte_hi: i64,
    /// Absolute delta band.
    pub delta_lo: f64,
    pub delta_hi: f64,
    pub max_spread_pct: f64,
    pub min_open_interest: i64,
    pub min_volume: i64,
    /// IV percentile band for the underlying.
    pub iv_pctl_lo: f64,
    pub iv_pctl_hi: f64,
    /// Daily theta burn guardrail (% of premium per day).
    pub theta_burn_limit_pct: f64,
}

/// Filter thresholds per setup type.
pub fn policy_for(setup: SetupType) -> SetupPolicy {
    match setup {
        SetupType::ScalpGuarded => SetupPolicy {
            min_dte: 0,
            max_dte: 3,
            preferred_dte_lo: 1,
            preferred_dte_hi: 2,
            delta_lo: 0.45,
            delta_hi: 0.65,
            max_spread_pct: 8.0,
            min_open_interest: 500,
            min_volume: 100,
            iv_pctl_lo: 0.0,
            iv_pctl_hi: 70.0,
            theta_burn_limit_pct: 15.0,
        },
        SetupType::Swing => SetupPolicy {
            min_dte: 21,
            max_dte: 90,
            preferred_dte_lo: 30,
            preferred_dte_hi: 60,
            delta_lo: 0.25,
            delta_hi: 0.40,
            max_spread_pct: 12.0,
            min_open_interest: 250,
            min_volume: 25,
            iv_pctl_lo: 10.0,
            iv_pctl_hi: 80.0,
            theta_burn_limit_pct: 5.0,
        },
        SetupType::Position => SetupPolicy {
            min_dte: 60,
            max_dte: 180,
            preferred_dte_lo: 90,
            preferred_dte_hi: 120,
            delta_lo: 0.30,
            delta_hi: 0.55,
            max_spread_pct: 15.0,
            min_open_interest: 100,
            min_volume: 10,
            iv_pctl_lo: 5.0,
            iv_pctl_hi: 75.0,
            theta_burn_limit_pct: 2.5,
        },
        SetupType::Leaps => SetupPolicy {
            min_dte: 180,
            max_dte: 730,
            preferred_dte_lo: 300,
            preferred_dte_hi: 450,
            delta_lo: 0.55,
            delta_hi: 0.80,
            max_spread_pct: 20.0,
            min_open_interest: 50,
            min_volume: 5,
            iv_pctl_lo: 0.0,
            iv_pctl_hi: 60.0,
            theta_burn_limit_pct: 1.0,
        },
    }
}

/// Scoring weights per setup type. Each row sums to 1.0.
#[derive(Debug, Clone, Copy)]
struct ScoreWeights {
    liquidity: f64,
    greeks: f64,
    theta: f64,
    vega: f64,
    cost: f64,
    gex: f64,
}

fn weights_for(setup: SetupType) -> ScoreWeights {
    match setup {
        // Scalps live and die on fills and gamma.
        SetupType::ScalpGuarded => ScoreWeights {
            liquidity: 0.35,
            greeks: 0.20,
            theta: 0.05,
            vega: 0.05,
            cost: 0.15,
            gex: 0.20,
        },
        SetupType::Swing => ScoreWeights {
            liquidity: 0.20,
            greeks: 0.20,
            theta: 0.20,
            vega: 0.15,
            cost: 0.15,
            gex: 0.10,
        },
        SetupType::Position => ScoreWeights {
            liquidity: 0.15,
            greeks: 0.20,
            theta: 0.25,
            vega: 0.20,
            cost: 0.15,
            gex: 0.05,
        },
        // LEAPS: theta and cost dominate, gamma regime is noise at that range.
        SetupType::Leaps => ScoreWeights {
            liquidity: 0.10,
            greeks: 0.20,
            theta: 0.30,
            vega: 0.20,
            cost: 0.20,
            gex: 0.00,
        },
    }
}

// =============================================================================
// Selection
// =============================================================================

/// Run the ordered filter-and-score pipeline over the chain.
pub fn select_strike(req: &StrikeRequest) -> SelectionOutcome {
    let policy = policy_for(req.setup_type);
    let mut rationale: Vec<String> = Vec::new();

    // ── Hard regime block ───────────────────────────────────────────────
    // Guard, not a chain filter: REGIME_BLOCK fires before the ladder so
    // DTE/liquidity exhaustion on the same chain cannot mask the reason.
    let contra = (req.direction == OptionType::Call && req.regime == Regime::StrongBear)
        || (req.direction == OptionType::Put && req.regime == Regime::StrongBull);
    if contra {
        return SelectionOutcome::Failed {
            reason: FailureReason::RegimeBlock,
            rationale: vec![format!(
                "{} entry blocked in {} regime",
                req.direction, req.regime
            )],
        };
    }
    if req.event_risk.iter().any(|e| e == "BINARY_EVENT" || e == "HALT") {
        return SelectionOutcome::Failed {
            reason: FailureReason::RegimeBlock,
            rationale: vec!["binary event risk flagged for underlying".to_string()],
        };
    }

    // ── 1. Right + DTE policy ───────────────────────────────────────────
    let candidates: Vec<&OptionRow> = req
        .chain
        .iter()
        .filter(|c| c.option_type == req.direction)
        .filter(|c| {
            let dte = c.dte(req.today);
            dte >= policy.min_dte && dte <= policy.max_dte
        })
        .collect();
    if candidates.is_empty() {
        return SelectionOutcome::Failed {
            reason: FailureReason::NoValidStrike,
            rationale: vec![format!(
                "no {} contracts within DTE [{}, {}]",
                req.direction, policy.min_dte, policy.max_dte
            )],
        };
    }
    rationale.push(format!("{} contracts pass DTE policy", candidates.len()));

    // ── 2. Delta band ───────────────────────────────────────────────────
    let candidates: Vec<&OptionRow> = candidates
        .into_iter()
        .filter(|c| {
            let d = c.delta.abs();
            d >= policy.delta_lo && d <= policy.delta_hi
        })
        .collect();
    if candidates.is_empty() {
        return SelectionOutcome::Failed {
            reason: FailureReason::DeltaFiltered,
            rationale: vec![format!(
                "no contracts in |delta| band [{:.2}, {:.2}]",
                policy.delta_lo, policy.delta_hi
            )],
        };
    }
    rationale.push(format!("{} contracts pass delta band", candidates.len()));

    // ── 3. Liquidity gate ───────────────────────────────────────────────
    let candidates: Vec<&OptionRow> = candidates
        .into_iter()
        .filter(|c| {
            c.spread_pct() <= policy.max_spread_pct
                && c.open_interest >= policy.min_open_interest
                && c.volume >= policy.min_volume
                && c.mid() > 0.0
        })
        .collect();
    if candidates.is_empty() {
        return SelectionOutcome::Failed {
            reason: FailureReason::LiquidityFiltered,
            rationale: vec![format!(
                "no contracts pass liquidity gate (spread<={:.0}%, OI>={}, vol>={})",
                policy.max_spread_pct, policy.min_open_interest, policy.min_volume
            )],
        };
    }
    rationale.push(format!("{} contracts pass liquidity gate", candidates.len()));

    // ── 4. Volatility band ──────────────────────────────────────────────
    if req.iv_percentile < policy.iv_pctl_lo || req.iv_percentile > policy.iv_pctl_hi {
        return SelectionOutcome::Failed {
            reason: FailureReason::NoValidStrike,
            rationale: vec![format!(
                "IV percentile {:.0} outside [{:.0}, {:.0}] for {}",
                req.iv_percentile, policy.iv_pctl_lo, policy.iv_pctl_hi, req.setup_type
            )],
        };
    }

    // ── 5. Gamma-regime delay ───────────────────────────────────────────
    // High positive dealer gamma pins price: delay new calls. High negative
    // gamma accelerates downside: delay new puts. A delay is not a failure.
    match (req.gex_state, req.direction) {
        (GexState::PositiveHigh, OptionType::Call) => {
            return SelectionOutcome::Delayed {
                reason: "POSITIVE_HIGH gamma regime delays call entries".to_string(),
            };
        }
        (GexState::NegativeHigh, OptionType::Put) => {
            return SelectionOutcome::Delayed {
                reason: "NEGATIVE_HIGH gamma regime delays put entries".to_string(),
            };
        }
        _ => {}
    }

    // ── 6. Score survivors ──────────────────────────────────────────────
    let weights = weights_for(req.setup_type);
    let mut scored: Vec<(ScoreBreakdown, &OptionRow)> = candidates
        .into_iter()
        .map(|c| (score_contract(c, req, &policy, &weights), c))
        .collect();

    let preferred_mid = (policy.preferred_dte_lo + policy.preferred_dte_hi) / 2;
    scored.sort_by(|(sa, ca), (sb, cb)| {
        sb.total
            .partial_cmp(&sa.total)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                let da = (ca.dte(req.today) - preferred_mid).abs();
                let db = (cb.dte(req.today) - preferred_mid).abs();
                da.cmp(&db)
            })
            .then_with(|| cb.open_interest.cmp(&ca.open_interest))
    });

    let (score, best) = scored.remove(0);

    // ── 7. Budget check ─────────────────────────────────────────────────
    let premium = best.mid() * 100.0;
    let budget = req
        .risk_budget
        .max_premium_loss
        .min(req.risk_budget.max_capital_allocation);
    let contracts = (budget / premium).floor() as i64;
    if contracts < 1 {
        return SelectionOutcome::Failed {
            reason: FailureReason::BudgetExceeded,
            rationale: vec![format!(
                "premium {premium:.0} exceeds budget {budget:.0} for one contract"
            )],
        };
    }

    rationale.push(format!(
        "selected {} dte={} |delta|={:.2} score={:.3}",
        best.option_symbol,
        best.dte(req.today),
        best.delta.abs(),
        score.total
    ));
    rationale.push(format!(
        "sizing {contracts} contract(s) at {premium:.0} premium within budget {budget:.0}"
    ));

    SelectionOutcome::Selected(Box::new(StrikeSelection {
        contract: best.clone(),
        contracts,
        score,
        guardrails: Guardrails {
            theta_burn_limit_pct: policy.theta_burn_limit_pct,
            max_spread_pct: policy.max_spread_pct,
        },
        rationale,
    }))
}

// =============================================================================
// Component scoring
// =============================================================================

fn score_contract(
    c: &OptionRow,
    req: &StrikeRequest,
    policy: &SetupPolicy,
    weights: &ScoreWeights,
) -> ScoreBreakdown {
    let mid = c.mid();

    // Liquidity fitness: tight spread + deep book.
    let spread_fit = (1.0 - c.spread_pct() / policy.max_spread_pct).clamp(0.0, 1.0);
    let depth_fit = ((c.open_interest as f64) / (4.0 * policy.min_open_interest as f64))
        .min(1.0)
        * 0.5
        + ((c.volume as f64) / (4.0 * policy.min_volume as f64)).min(1.0) * 0.5;
    let liquidity = spread_fit * 0.6 + depth_fit * 0.4;

    // Greeks stability: delta centered in the band, modest gamma.
    let band_mid = (policy.delta_lo + policy.delta_hi) / 2.0;
    let band_half = (policy.delta_hi - policy.delta_lo) / 2.0;
    let delta_fit = if band_half > 0.0 {
        (1.0 - (c.delta.abs() - band_mid).abs() / band_half).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let gamma_penalty = (c.gamma * req.spot_price / 10.0).clamp(0.0, 1.0);
    let greeks = delta_fit * 0.7 + (1.0 - gamma_penalty) * 0.3;

    // Theta survivability: daily burn projected over the expected hold.
    let daily_burn_pct = if mid > 0.0 { c.theta.abs() / mid * 100.0 } else { 100.0 };
    let hold_days = (req.expected_hold_min / (60.0 * 24.0)).max(1.0 / 24.0);
    let theta = (1.0 - (daily_burn_pct * hold_days / 100.0).clamp(0.0, 1.0)).clamp(0.0, 1.0);

    // Vega/IV alignment: rich vol wants small vega exposure, cheap vol the
    // opposite.
    let vega_ratio = if mid > 0.0 { (c.vega / mid).clamp(0.0, 2.0) / 2.0 } else { 1.0 };
    let vega_target = if req.iv_percentile > 60.0 { 0.2 } else { 0.7 };
    let vega = (1.0 - (vega_ratio - vega_target).abs()).clamp(0.0, 1.0);

    // Cost efficiency: premium per unit of delta, relative to spot.
    let cost = if c.delta.abs() > 0.0 && req.spot_price > 0.0 {
        let cost_per_delta = mid / c.delta.abs();
        (1.0 - cost_per_delta / (0.2 * req.spot_price)).clamp(0.0, 1.0)
    } else {
        0.0
    };

    // GEX suitability for the requested direction.
    let gex = match (req.gex_state, req.direction) {
        (GexState::PositiveHigh, OptionType::Put) => 0.8,
        (GexState::PositiveLow, OptionType::Call) => 0.4,
        (GexState::PositiveLow, OptionType::Put) => 0.7,
        (GexState::NegativeHigh, OptionType::Call) => 0.8,
        (GexState::NegativeLow, OptionType::Call) => 0.7,
        (GexState::NegativeLow, OptionType::Put) => 0.4,
        _ => 0.6,
    };

    let total = weights.liquidity * liquidity
        + weights.greeks * greeks
        + weights.theta * theta
        + weights.vega * vega
        + weights.cost * cost
        + weights.gex * gex;

    ScoreBreakdown {
        liquidity,
        greeks,
        theta,
        vega,
        cost,
        gex,
        total,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap()
    }

    fn contract(dte: i64, delta: f64, bid: f64, ask: f64, oi: i64, volume: i64) -> OptionRow {
        let expiration = today() + chrono::Duration::days(dte);
        OptionRow {
            option_symbol: format!("SPY{}C{}", expiration.format("%y%m%d"), (delta * 1000.0) as i64),
            underlying: "SPY".to_string(),
            strike: 500.0,
            expiration,
            option_type: OptionType::Call,
            bid,
            ask,
            last: (bid + ask) / 2.0,
            delta,
            gamma: 0.01,
            theta: -0.05,
            vega: 0.5,
            iv: 0.22,
            open_interest: oi,
            volume,
        }
    }

    fn swing_request(chain: Vec<OptionRow>) -> StrikeRequest {
        StrikeRequest {
            symbol: "SPY".to_string(),
            spot_price: 500.0,
            direction: OptionType::Call,
            setup_type: SetupType::Swing,
            signal_confidence: 70.0,
            expected_hold_min: 3.0 * 24.0 * 60.0,
            expected_move_pct: 2.0,
            regime: Regime::Bull,
            gex_state: GexState::Neutral,
            iv_percentile: 40.0,
            event_risk: Vec::new(),
            risk_budget: RiskBudget {
                max_premium_loss: 2_000.0,
                max_capital_allocation: 5_000.0,
            },
            chain,
            today: today(),
        }
    }

    #[test]
    fn swing_chain_selects_banded_contract() {
        let chain = vec![
            contract(45, 0.30, 4.90, 5.10, 1_000, 200), // in band, liquid
            contract(45, 0.10, 1.00, 1.10, 1_000, 200), // delta too low
            contract(45, 0.70, 20.00, 20.50, 1_000, 200), // delta too high
        ];
        let outcome = select_strike(&swing_request(chain));
        match outcome {
            SelectionOutcome::Selected(sel) => {
                assert!((sel.contract.delta - 0.30).abs() < 1e-9);
                assert!(sel.contracts >= 1);
                assert!(sel.score.total > 0.0);
                assert!(!sel.rationale.is_empty());
            }
            other => panic!("expected selection, got {other:?}"),
        }
    }

    #[test]
    fn all_short_dte_yields_no_valid_strike() {
        // Every contract expires in 5 days; SWING needs 21+.
        let chain = vec![
            contract(5, 0.30, 4.90, 5.10, 1_000, 200),
            contract(5, 0.35, 5.90, 6.10, 1_000, 200),
        ];
        let outcome = select_strike(&swing_request(chain));
        match outcome {
            SelectionOutcome::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::NoValidStrike);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn delta_exhaustion_reports_delta_filtered() {
        let chain = vec![
            contract(45, 0.10, 1.00, 1.10, 1_000, 200),
            contract(45, 0.90, 40.00, 41.00, 1_000, 200),
        ];
        let outcome = select_strike(&swing_request(chain));
        match outcome {
            SelectionOutcome::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::DeltaFiltered);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn illiquid_chain_reports_liquidity_filtered() {
        // Wide spread and thin book.
        let chain = vec![contract(45, 0.30, 3.00, 6.00, 5, 1)];
        let outcome = select_strike(&swing_request(chain));
        match outcome {
            SelectionOutcome::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::LiquidityFiltered);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn positive_high_gamma_delays_calls() {
        let chain = vec![contract(45, 0.30, 4.90, 5.10, 1_000, 200)];
        let mut req = swing_request(chain);
        req.gex_state = GexState::PositiveHigh;
        assert!(matches!(
            select_strike(&req),
            SelectionOutcome::Delayed { .. }
        ));
    }

    #[test]
    fn negative_high_gamma_delays_puts_only() {
        let mut put = contract(45, -0.30, 4.90, 5.10, 1_000, 200);
        put.option_type = OptionType::Put;
        let mut req = swing_request(vec![put]);
        req.direction = OptionType::Put;
        req.gex_state = GexState::NegativeHigh;
        assert!(matches!(
            select_strike(&req),
            SelectionOutcome::Delayed { .. }
        ));

        // Calls are not delayed in NEGATIVE_HIGH.
        let call_chain = vec![contract(45, 0.30, 4.90, 5.10, 1_000, 200)];
        let mut call_req = swing_request(call_chain);
        call_req.gex_state = GexState::NegativeHigh;
        assert!(matches!(
            select_strike(&call_req),
            SelectionOutcome::Selected(_)
        ));
    }

    #[test]
    fn contra_regime_blocks() {
        let chain = vec![contract(45, 0.30, 4.90, 5.10, 1_000, 200)];
        let mut req = swing_request(chain);
        req.regime = Regime::StrongBear;
        match select_strike(&req) {
            SelectionOutcome::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::RegimeBlock);
            }
            other => panic!("expected regime block, got {other:?}"),
        }
    }

    #[test]
    fn budget_too_small_reports_budget_exceeded() {
        let chain = vec![contract(45, 0.30, 24.90, 25.10, 1_000, 200)];
        let mut req = swing_request(chain);
        // One contract costs ~2 500; the budget allows 1 000.
        req.risk_budget = RiskBudget {
            max_premium_loss: 1_000.0,
            max_capital_allocation: 5_000.0,
        };
        match select_strike(&req) {
            SelectionOutcome::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::BudgetExceeded);
            }
            other => panic!("expected budget failure, got {other:?}"),
        }
    }

    #[test]
    fn contracts_fit_inside_both_budgets() {
        let chain = vec![contract(45, 0.30, 4.90, 5.10, 1_000, 200)];
        let mut req = swing_request(chain);
        req.risk_budget = RiskBudget {
            max_premium_loss: 1_600.0,       // 3 contracts at ~500
            max_capital_allocation: 10_000.0,
        };
        match select_strike(&req) {
            SelectionOutcome::Selected(sel) => {
                assert_eq!(sel.contracts, 3);
                assert!(sel.contracts as f64 * sel.contract.mid() * 100.0 <= 1_600.0);
            }
            other => panic!("expected selection, got {other:?}"),
        }
    }

    #[test]
    fn tie_break_prefers_preferred_dte_then_oi() {
        // Identical pricing and greeks, different DTE: 45 sits in the
        // preferred window's center, 85 is at the edge.
        let near = contract(45, 0.32, 4.90, 5.10, 1_000, 200);
        let far = contract(85, 0.32, 4.90, 5.10, 1_000, 200);
        let outcome = select_strike(&swing_request(vec![far, near.clone()]));
        match outcome {
            SelectionOutcome::Selected(sel) => {
                assert_eq!(sel.contract.option_symbol, near.option_symbol);
            }
            other => panic!("expected selection, got {other:?}"),
        }
    }

    #[test]
    fn iv_band_gates_selection() {
        let chain = vec![contract(45, 0.30, 4.90, 5.10, 1_000, 200)];
        let mut req = swing_request(chain);
        req.iv_percentile = 95.0; // SWING band tops out at 80.
        match select_strike(&req) {
            SelectionOutcome::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::NoValidStrike);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
