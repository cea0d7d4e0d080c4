// =============================================================================
// Exit Decision Engine — four-tier rule evaluator over live position state
// =============================================================================
//
// A pure function over (position, exit rule, market snapshot, now). Rules
// are classed into four tiers; higher tiers dominate lower ones:
//
//   Tier 1 — hard fails: thesis invalidation, scalp time limit, theta burn
//            beyond the setup guardrail, stop loss (including a tightened
//            stop level tracked on the position).
//   Tier 2 — regime/liquidity: progress checkpoints, spread blowout,
//            gamma-era regime flip against the position's direction.
//   Tier 3 — profit management: partial exits at configured milestones,
//            each firing at most once per position.
//   Tier 4 — time stops: day-based CHECK_PROGRESS / EXIT_IF_FLAT /
//            TIGHTEN_STOP / REVIEW_THESIS plus the rule row's max-hold and
//            minimum-DTE limits.
//
// The caller owns milestone bookkeeping: fired milestone indices come in,
// and the decision reports which index it would fire.
// =============================================================================

use std::collections::HashSet;

use serde::Serialize;

use crate::store::{ExitRuleRow, PositionRow};
use crate::strike::policy_for;
use crate::types::{ExitAction, OptionType, Regime, SetupType, Urgency};

/// Hard hold limit for scalps (minutes).
const SCALP_MAX_HOLD_MIN: f64 = 90.0;
/// Spread% at which liquidity deterioration fires.
const LIQUIDITY_EXIT_SPREAD_PCT: f64 = 20.0;
/// "Flat" band for EXIT_IF_FLAT (absolute PnL %).
const FLAT_BAND_PCT: f64 = 5.0;

/// Live market inputs for one evaluation.
#[derive(Debug, Clone)]
pub struct ExitSnapshot {
    pub option_mid: f64,
    pub spot_price: f64,
    pub spread_pct: f64,
    pub dte: i64,
    pub thesis_valid: bool,
    pub htf_invalidation: bool,
    pub regime: Regime,
}

/// Derived metrics attached to every decision.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExitMetrics {
    pub time_in_trade_min: f64,
    pub option_pnl_pct: f64,
    /// Estimated premium decay, % per day.
    pub theta_burn_estimate: f64,
    pub spread_pct: f64,
    pub dte: i64,
}

/// The evaluator's verdict.
#[derive(Debug, Clone, Serialize)]
pub struct ExitDecision {
    pub action: ExitAction,
    pub urgency: Urgency,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_stop_level: Option<f64>,
    pub triggered_rules: Vec<String>,
    pub rationale: Vec<String>,
    pub metrics: ExitMetrics,
    pub timestamp_ms: i64,
    /// Index of the profit milestone this decision fires, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub milestone_index: Option<usize>,
}

/// Day-based time-stop behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimeStopKind {
    CheckProgress,
    ExitIfFlat,
    TightenStop,
    ReviewThesis,
}

// =============================================================================
// Per-setup tables
// =============================================================================

/// Progress checkpoints: (minutes held, minimum PnL%). The first pair whose
/// time has passed with PnL below the floor fires.
fn progress_checkpoints(setup: SetupType) -> &'static [(f64, f64)] {
    match setup {
        SetupType::ScalpGuarded => &[(30.0, 0.0), (60.0, 5.0)],
        SetupType::Swing => &[(1_440.0, -10.0), (2_880.0, 0.0)],
        SetupType::Position => &[(4_320.0, -15.0), (10_080.0, 0.0)],
        SetupType::Leaps => &[],
    }
}

/// Profit milestones: (PnL% threshold, % of position to exit).
fn profit_milestones(setup: SetupType) -> &'static [(f64, f64)] {
    match setup {
        SetupType::ScalpGuarded => &[(10.0, 50.0)],
        SetupType::Swing => &[(25.0, 25.0), (50.0, 25.0), (100.0, 50.0)],
        SetupType::Position => &[(30.0, 25.0), (60.0, 25.0), (120.0, 50.0)],
        SetupType::Leaps => &[(50.0, 20.0), (100.0, 30.0)],
    }
}

/// Day-based time stops.
fn time_stops(setup: SetupType) -> &'static [(f64, TimeStopKind)] {
    match setup {
        SetupType::ScalpGuarded => &[],
        SetupType::Swing => &[
            (3.0, TimeStopKind::CheckProgress),
            (7.0, TimeStopKind::TightenStop),
            (14.0, TimeStopKind::ExitIfFlat),
        ],
        SetupType::Position => &[
            (14.0, TimeStopKind::CheckProgress),
            (30.0, TimeStopKind::TightenStop),
            (45.0, TimeStopKind::ReviewThesis),
        ],
        SetupType::Leaps => &[
            (60.0, TimeStopKind::ReviewThesis),
            (180.0, TimeStopKind::CheckProgress),
        ],
    }
}

// =============================================================================
// Evaluation
// =============================================================================

/// Evaluate the tiers in order; the first tier that fires decides.
pub fn evaluate(
    position: &PositionRow,
    rule: &ExitRuleRow,
    snapshot: &ExitSnapshot,
    fired_milestones: &HashSet<usize>,
    now_ms: i64,
) -> ExitDecision {
    let setup = position.setup_type.unwrap_or(SetupType::Swing);
    let metrics = compute_metrics(position, snapshot, now_ms);

    let hold = |metrics: ExitMetrics, rationale: Vec<String>| ExitDecision {
        action: ExitAction::Hold,
        urgency: Urgency::Low,
        size_percent: None,
        new_stop_level: None,
        triggered_rules: Vec::new(),
        rationale,
        metrics,
        timestamp_ms: now_ms,
        milestone_index: None,
    };

    // ── Tier 1: hard fails ──────────────────────────────────────────────
    let mut tier1: Vec<String> = Vec::new();
    if !snapshot.thesis_valid || snapshot.htf_invalidation {
        tier1.push("THESIS_INVALIDATED".to_string());
    }
    if setup == SetupType::ScalpGuarded && metrics.time_in_trade_min > SCALP_MAX_HOLD_MIN {
        tier1.push("SCALP_TIME_LIMIT".to_string());
    }
    let burn_limit = policy_for(setup).theta_burn_limit_pct;
    if metrics.theta_burn_estimate >= burn_limit {
        tier1.push("THETA_BURN_LIMIT".to_string());
    }
    if let Some(stop_pct) = rule.stop_loss_percent {
        if metrics.option_pnl_pct <= -stop_pct.abs() {
            tier1.push("STOP_LOSS_HIT".to_string());
        }
    }
    if let Some(stop_level) = position.stop_level {
        if snapshot.option_mid <= stop_level {
            tier1.push("TIGHTENED_STOP_HIT".to_string());
        }
    }
    if !tier1.is_empty() {
        let rationale = tier1
            .iter()
            .map(|r| tier1_rationale(r, &metrics, burn_limit))
            .collect();
        return ExitDecision {
            action: ExitAction::FullExit,
            urgency: Urgency::High,
            size_percent: None,
            new_stop_level: None,
            triggered_rules: tier1,
            rationale,
            metrics,
            timestamp_ms: now_ms,
            milestone_index: None,
        };
    }

    // ── Tier 2: regime / liquidity ──────────────────────────────────────
    for (at_min, min_profit) in progress_checkpoints(setup) {
        if metrics.time_in_trade_min >= *at_min && metrics.option_pnl_pct < *min_profit {
            return ExitDecision {
                action: ExitAction::FullExit,
                urgency: Urgency::Medium,
                size_percent: None,
                new_stop_level: None,
                triggered_rules: vec!["PROGRESS_CHECK_FAILED".to_string()],
                rationale: vec![format!(
                    "pnl {:.1}% below {:.1}% floor after {:.0} min",
                    metrics.option_pnl_pct, min_profit, at_min
                )],
                metrics,
                timestamp_ms: now_ms,
                milestone_index: None,
            };
        }
    }
    if metrics.spread_pct >= LIQUIDITY_EXIT_SPREAD_PCT {
        return ExitDecision {
            action: ExitAction::FullExit,
            urgency: Urgency::High,
            size_percent: None,
            new_stop_level: None,
            triggered_rules: vec!["LIQUIDITY_DETERIORATION".to_string()],
            rationale: vec![format!(
                "spread {:.1}% >= {LIQUIDITY_EXIT_SPREAD_PCT:.0}% — exit while a market exists",
                metrics.spread_pct
            )],
            metrics,
            timestamp_ms: now_ms,
            milestone_index: None,
        };
    }
    let regime_flip = match position.option_type {
        OptionType::Call => snapshot.regime.is_bearish(),
        OptionType::Put => snapshot.regime.is_bullish(),
    };
    if regime_flip {
        return ExitDecision {
            action: ExitAction::FullExit,
            urgency: Urgency::Medium,
            size_percent: None,
            new_stop_level: None,
            triggered_rules: vec!["REGIME_FLIP".to_string()],
            rationale: vec![format!(
                "{} position against {} regime",
                position.option_type, snapshot.regime
            )],
            metrics,
            timestamp_ms: now_ms,
            milestone_index: None,
        };
    }

    // ── Tier 3: profit milestones (each fires once) ─────────────────────
    for (index, (at_percent, exit_percent)) in profit_milestones(setup).iter().enumerate() {
        if metrics.option_pnl_pct >= *at_percent && !fired_milestones.contains(&index) {
            return ExitDecision {
                action: ExitAction::PartialExit,
                urgency: Urgency::Medium,
                size_percent: Some(*exit_percent),
                new_stop_level: None,
                triggered_rules: vec![format!("PROFIT_MILESTONE_{}", *at_percent as i64)],
                rationale: vec![format!(
                    "pnl {:.1}% crossed +{:.0}% milestone — exiting {:.0}%",
                    metrics.option_pnl_pct, at_percent, exit_percent
                )],
                metrics,
                timestamp_ms: now_ms,
                milestone_index: Some(index),
            };
        }
    }

    // ── Tier 4: time-based ──────────────────────────────────────────────
    if let Some(max_hours) = rule.max_hold_time_hours {
        if metrics.time_in_trade_min >= max_hours * 60.0 {
            return ExitDecision {
                action: ExitAction::FullExit,
                urgency: Urgency::High,
                size_percent: None,
                new_stop_level: None,
                triggered_rules: vec!["MAX_HOLD_TIME".to_string()],
                rationale: vec![format!(
                    "held {:.0} min beyond {max_hours:.0} h limit",
                    metrics.time_in_trade_min
                )],
                metrics,
                timestamp_ms: now_ms,
                milestone_index: None,
            };
        }
    }
    if let Some(min_dte) = rule.min_dte_exit {
        if metrics.dte <= min_dte {
            return ExitDecision {
                action: ExitAction::FullExit,
                urgency: Urgency::High,
                size_percent: None,
                new_stop_level: None,
                triggered_rules: vec!["DTE_EXIT".to_string()],
                rationale: vec![format!("{} DTE at or below {min_dte} floor", metrics.dte)],
                metrics,
                timestamp_ms: now_ms,
                milestone_index: None,
            };
        }
    }

    let days_held = metrics.time_in_trade_min / (24.0 * 60.0);
    let mut applicable: Option<(f64, TimeStopKind)> = None;
    for (day, kind) in time_stops(setup) {
        if days_held >= *day {
            applicable = Some((*day, *kind));
        }
    }
    if let Some((day, kind)) = applicable {
        match kind {
            TimeStopKind::CheckProgress => {
                if metrics.option_pnl_pct < 0.0 {
                    return ExitDecision {
                        action: ExitAction::FullExit,
                        urgency: Urgency::Medium,
                        size_percent: None,
                        new_stop_level: None,
                        triggered_rules: vec![format!("TIME_STOP_CHECK_PROGRESS_D{}", day as i64)],
                        rationale: vec![format!(
                            "day-{day:.0} progress check: pnl {:.1}% negative",
                            metrics.option_pnl_pct
                        )],
                        metrics,
                        timestamp_ms: now_ms,
                        milestone_index: None,
                    };
                }
            }
            TimeStopKind::ExitIfFlat => {
                if metrics.option_pnl_pct.abs() < FLAT_BAND_PCT {
                    return ExitDecision {
                        action: ExitAction::FullExit,
                        urgency: Urgency::Low,
                        size_percent: None,
                        new_stop_level: None,
                        triggered_rules: vec![format!("TIME_STOP_EXIT_IF_FLAT_D{}", day as i64)],
                        rationale: vec![format!(
                            "day-{day:.0} flat exit: pnl {:.1}% inside +/-{FLAT_BAND_PCT:.0}%",
                            metrics.option_pnl_pct
                        )],
                        metrics,
                        timestamp_ms: now_ms,
                        milestone_index: None,
                    };
                }
            }
            TimeStopKind::TightenStop => {
                // Halve the distance to the stop, in option-price terms.
                let stop_pct = rule.stop_loss_percent.unwrap_or(50.0).abs();
                let new_stop = position.entry_price * (1.0 - stop_pct / 200.0);
                let already_tighter = position.stop_level.map(|s| s >= new_stop).unwrap_or(false);
                if !already_tighter {
                    return ExitDecision {
                        action: ExitAction::TightenStop,
                        urgency: Urgency::Low,
                        size_percent: None,
                        new_stop_level: Some(new_stop),
                        triggered_rules: vec![format!("TIME_STOP_TIGHTEN_D{}", day as i64)],
                        rationale: vec![format!(
                            "day-{day:.0} stop tighten to {new_stop:.2}"
                        )],
                        metrics,
                        timestamp_ms: now_ms,
                        milestone_index: None,
                    };
                }
            }
            TimeStopKind::ReviewThesis => {
                return hold(
                    metrics,
                    vec![format!("day-{day:.0} thesis review due — holding")],
                );
            }
        }
    }

    hold(metrics, vec!["no exit rule fired".to_string()])
}

fn compute_metrics(position: &PositionRow, snapshot: &ExitSnapshot, now_ms: i64) -> ExitMetrics {
    let time_in_trade_min = (now_ms - position.entry_timestamp_ms).max(0) as f64 / 60_000.0;
    let option_pnl_pct = if position.entry_price > 0.0 {
        (snapshot.option_mid - position.entry_price) / position.entry_price * 100.0
    } else {
        0.0
    };
    // Rough decay model: an option loses roughly half its extrinsic value
    // over its remaining life, accelerating into expiry.
    let theta_burn_estimate = 50.0 / (snapshot.dte.max(1) as f64);

    ExitMetrics {
        time_in_trade_min,
        option_pnl_pct,
        theta_burn_estimate,
        spread_pct: snapshot.spread_pct,
        dte: snapshot.dte,
    }
}

fn tier1_rationale(rule: &str, metrics: &ExitMetrics, burn_limit: f64) -> String {
    match rule {
        "THESIS_INVALIDATED" => "thesis invalidated by collaborator".to_string(),
        "SCALP_TIME_LIMIT" => format!(
            "scalp held {:.0} min > {SCALP_MAX_HOLD_MIN:.0} min limit",
            metrics.time_in_trade_min
        ),
        "THETA_BURN_LIMIT" => format!(
            "theta burn {:.1}%/day >= {burn_limit:.1}%/day guardrail",
            metrics.theta_burn_estimate
        ),
        "STOP_LOSS_HIT" => format!("pnl {:.1}% through stop", metrics.option_pnl_pct),
        "TIGHTENED_STOP_HIT" => "price through tightened stop level".to_string(),
        other => other.to_string(),
    }
}

// =============================================================================
// Tests
// =============================================================================
