// =============================================================================
// Shared types used across the Meridian options engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Whether the platform simulates fills (paper) or routes to a live broker.
/// Live routing is not implemented in this core; the mode exists so that the
/// policy engine can refuse to arm execution outside of paper trading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AppMode {
    Paper,
    Live,
}

impl Default for AppMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for AppMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "PAPER"),
            Self::Live => write!(f, "LIVE"),
        }
    }
}

impl AppMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "PAPER" => Some(Self::Paper),
            "LIVE" => Some(Self::Live),
            _ => None,
        }
    }
}

/// Canonical trade direction after webhook normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Long => "long",
            Self::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "long" => Some(Self::Long),
            "short" => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Pending,
    Approved,
    Rejected,
    Failed,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which of the two competing decision engines a signal was assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineVariant {
    A,
    B,
}

impl EngineVariant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How an experiment's recommendations are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    ShadowOnly,
    EngineAPrimary,
    EngineBPrimary,
    SplitCapital,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShadowOnly => "SHADOW_ONLY",
            Self::EngineAPrimary => "ENGINE_A_PRIMARY",
            Self::EngineBPrimary => "ENGINE_B_PRIMARY",
            Self::SplitCapital => "SPLIT_CAPITAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SHADOW_ONLY" => Some(Self::ShadowOnly),
            "ENGINE_A_PRIMARY" => Some(Self::EngineAPrimary),
            "ENGINE_B_PRIMARY" => Some(Self::EngineBPrimary),
            "SPLIT_CAPITAL" => Some(Self::SplitCapital),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a paper order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    PendingExecution,
    Filled,
    Failed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingExecution => "pending_execution",
            Self::Filled => "filled",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_execution" => Some(Self::PendingExecution),
            "filled" => Some(Self::Filled),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a position. `Closing` is a one-way reservation taken
/// by the exit monitor; `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "closing" => Some(Self::Closing),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Contract right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Put => "put",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "call" => Some(Self::Call),
            "put" => Some(Self::Put),
            _ => None,
        }
    }

    /// The contract right implied by a trade direction.
    pub fn from_direction(direction: Direction) -> Self {
        match direction {
            Direction::Long => Self::Call,
            Direction::Short => Self::Put,
        }
    }
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Holding-horizon class that parameterizes strike policy, exit rules, and
/// scoring weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetupType {
    ScalpGuarded,
    Swing,
    Position,
    Leaps,
}

impl SetupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScalpGuarded => "SCALP_GUARDED",
            Self::Swing => "SWING",
            Self::Position => "POSITION",
            Self::Leaps => "LEAPS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCALP_GUARDED" => Some(Self::ScalpGuarded),
            "SWING" => Some(Self::Swing),
            "POSITION" => Some(Self::Position),
            "LEAPS" => Some(Self::Leaps),
            _ => None,
        }
    }

    /// Derive a setup class from a normalized timeframe (e.g. `5m`, `4h`).
    ///
    /// Short intraday frames map to scalps, multi-hour frames to swings,
    /// daily frames to position trades, and weekly frames to LEAPS.
    pub fn from_timeframe(timeframe: &str) -> Self {
        let minutes = crate::ingest::timeframe_minutes(timeframe).unwrap_or(60);
        match minutes {
            0..=15 => Self::ScalpGuarded,
            16..=480 => Self::Swing,
            481..=2880 => Self::Position,
            _ => Self::Leaps,
        }
    }
}

impl std::fmt::Display for SetupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classified market stance, received from collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Regime {
    StrongBull,
    Bull,
    Choppy,
    Bear,
    StrongBear,
    Breakout,
    Breakdown,
}

impl Regime {
    pub fn is_bullish(&self) -> bool {
        matches!(self, Self::StrongBull | Self::Bull | Self::Breakout)
    }

    pub fn is_bearish(&self) -> bool {
        matches!(self, Self::StrongBear | Self::Bear | Self::Breakdown)
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StrongBull => "STRONG_BULL",
            Self::Bull => "BULL",
            Self::Choppy => "CHOPPY",
            Self::Bear => "BEAR",
            Self::StrongBear => "STRONG_BEAR",
            Self::Breakout => "BREAKOUT",
            Self::Breakdown => "BREAKDOWN",
        };
        write!(f, "{s}")
    }
}

/// Quantized dealer-gamma regime used to delay or permit directional entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GexState {
    PositiveHigh,
    PositiveLow,
    Neutral,
    NegativeLow,
    NegativeHigh,
}

impl Default for GexState {
    fn default() -> Self {
        Self::Neutral
    }
}

impl std::fmt::Display for GexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PositiveHigh => "POSITIVE_HIGH",
            Self::PositiveLow => "POSITIVE_LOW",
            Self::Neutral => "NEUTRAL",
            Self::NegativeLow => "NEGATIVE_LOW",
            Self::NegativeHigh => "NEGATIVE_HIGH",
        };
        write!(f, "{s}")
    }
}

/// Action emitted by the exit decision engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitAction {
    Hold,
    PartialExit,
    FullExit,
    TightenStop,
}

impl std::fmt::Display for ExitAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Hold => "HOLD",
            Self::PartialExit => "PARTIAL_EXIT",
            Self::FullExit => "FULL_EXIT",
            Self::TightenStop => "TIGHTEN_STOP",
        };
        write!(f, "{s}")
    }
}

/// Urgency attached to an exit decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrips() {
        for s in [
            SignalStatus::Pending,
            SignalStatus::Approved,
            SignalStatus::Rejected,
            SignalStatus::Failed,
        ] {
            assert_eq!(SignalStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            OrderStatus::PendingExecution,
            OrderStatus::Filled,
            OrderStatus::Failed,
            OrderStatus::Cancelled,
        ] {
            assert_eq!(OrderStatus::parse(s.as_str()), Some(s));
        }
        for s in [
            PositionStatus::Open,
            PositionStatus::Closing,
            PositionStatus::Closed,
        ] {
            assert_eq!(PositionStatus::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn execution_mode_strings_match_wire_format() {
        assert_eq!(ExecutionMode::ShadowOnly.as_str(), "SHADOW_ONLY");
        assert_eq!(ExecutionMode::EngineAPrimary.as_str(), "ENGINE_A_PRIMARY");
        assert_eq!(
            ExecutionMode::parse("ENGINE_B_PRIMARY"),
            Some(ExecutionMode::EngineBPrimary)
        );
    }

    #[test]
    fn setup_type_from_timeframe_buckets() {
        assert_eq!(SetupType::from_timeframe("5m"), SetupType::ScalpGuarded);
        assert_eq!(SetupType::from_timeframe("15m"), SetupType::ScalpGuarded);
        assert_eq!(SetupType::from_timeframe("1h"), SetupType::Swing);
        assert_eq!(SetupType::from_timeframe("4h"), SetupType::Swing);
        assert_eq!(SetupType::from_timeframe("1d"), SetupType::Position);
        assert_eq!(SetupType::from_timeframe("1w"), SetupType::Leaps);
    }

    #[test]
    fn regime_direction_helpers() {
        assert!(Regime::StrongBull.is_bullish());
        assert!(Regime::Breakdown.is_bearish());
        assert!(!Regime::Choppy.is_bullish());
        assert!(!Regime::Choppy.is_bearish());
    }
}
