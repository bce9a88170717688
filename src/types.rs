// =============================================================================
// Shared types used across the trading engine
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: Decimal,
    #[serde(default)]
    pub locked: Decimal,
}

/// Position side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for LONG, -1 for SHORT — used to sign PnL arithmetic.
    pub fn sign(self) -> i64 {
        match self {
            Self::Long => 1,
            Self::Short => -1,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Outer scheduler/position state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    Idle,
    Monitoring,
    Opening,
    Position,
    Closing,
    Halted,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self::Idle
    }
}

impl std::fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Monitoring => "MONITORING",
            Self::Opening => "OPENING",
            Self::Position => "POSITION",
            Self::Closing => "CLOSING",
            Self::Halted => "HALTED",
        };
        write!(f, "{s}")
    }
}

/// Closed vocabulary for why a trade closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    Tp1,
    Tp2,
    TrailingStopHit,
    StopHitObserved,
    Timeout,
    ForcedClose,
    CompensatedCloseUnknown,
    OperatorClose,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Tp1 => "TP1",
            Self::Tp2 => "TP2",
            Self::TrailingStopHit => "trailing-stop-hit",
            Self::StopHitObserved => "stop-hit-observed",
            Self::Timeout => "timeout",
            Self::ForcedClose => "forced-close",
            Self::CompensatedCloseUnknown => "compensated-close-unknown",
            Self::OperatorClose => "operator-close",
        };
        write!(f, "{s}")
    }
}

/// Advisory-reported risk band, used both for the advisory response and for
/// the `riskMultiplier` lookup in dynamic leverage sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl Default for RiskLevel {
    fn default() -> Self {
        Self::Medium
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
        }
    }
}

/// Snapshot of the indicators computed during one strategy evaluation pass,
/// carried on a `Signal` purely for logging/auditing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub ema20: f64,
    pub ema30: f64,
    pub ema60: f64,
    pub rsi14: f64,
    pub atr14: f64,
    pub adx15m: f64,
    pub adx1h: f64,
    pub adx4h: f64,
}

/// Advisory adapter response, gated but never solely decisive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisoryOpinion {
    pub direction: Option<Direction>,
    pub confidence: f64,
    pub score: f64,
    pub risk_level: RiskLevel,
    pub reasoning: String,
    /// Free-form technical snapshot the advisory echoed back, carried only
    /// for audit/logging — never consulted by any gate.
    #[serde(default)]
    pub technical_data: serde_json::Value,
}

impl AdvisoryOpinion {
    /// The sentinel the `AdvisoryAdapter` contract requires on timeout or a
    /// malformed upstream response — never a thrown error.
    pub fn sentinel() -> Self {
        Self {
            direction: None,
            confidence: 0.0,
            score: 0.0,
            risk_level: RiskLevel::High,
            reasoning: "advisory unavailable".to_string(),
            technical_data: serde_json::Value::Null,
        }
    }
}

/// Why the evaluator declined to produce a signal for a symbol on this pass.
/// A closed set so every branch is loggable and matchable in tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RejectionReason {
    InsufficientCandles,
    AdxGate,
    DirectionUndetermined,
    EntryGateEmaDeviation,
    EntryGateRsi,
    EntryGateCandle,
    EntryGateVolume,
    AdvisoryDirectionMismatch,
    AdvisoryLowConfidence,
    AdvisoryRiskTooHigh,
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InsufficientCandles => "insufficient candles",
            Self::AdxGate => "ADX gate",
            Self::DirectionUndetermined => "direction undetermined",
            Self::EntryGateEmaDeviation => "entry gate: EMA deviation",
            Self::EntryGateRsi => "entry gate: RSI out of range",
            Self::EntryGateCandle => "entry gate: candle not confirming",
            Self::EntryGateVolume => "entry gate: volume not confirming",
            Self::AdvisoryDirectionMismatch => "advisory: direction mismatch",
            Self::AdvisoryLowConfidence => "advisory: confidence too low",
            Self::AdvisoryRiskTooHigh => "advisory: risk level too high",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rejection {
    pub symbol: String,
    pub reason: RejectionReason,
}

/// A tradable opportunity produced by the strategy evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: String,
    pub direction: Direction,
    pub price: Decimal,
    pub indicators: IndicatorSnapshot,
    pub advisory: Option<AdvisoryOpinion>,
    pub reason: String,
}

/// Tagged union the evaluator returns — never an untyped nullable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StrategyOutcome {
    Signal(Signal),
    Rejected(Rejection),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_sign_and_opposite() {
        assert_eq!(Direction::Long.sign(), 1);
        assert_eq!(Direction::Short.sign(), -1);
        assert_eq!(Direction::Long.opposite(), Direction::Short);
    }

    #[test]
    fn engine_status_default_is_idle() {
        assert_eq!(EngineStatus::default(), EngineStatus::Idle);
    }

    #[test]
    fn close_reason_display_matches_closed_vocabulary() {
        assert_eq!(CloseReason::StopHitObserved.to_string(), "stop-hit-observed");
        assert_eq!(CloseReason::CompensatedCloseUnknown.to_string(), "compensated-close-unknown");
    }

    #[test]
    fn advisory_sentinel_is_idle_low_confidence_high_risk() {
        let sentinel = AdvisoryOpinion::sentinel();
        assert!(sentinel.direction.is_none());
        assert_eq!(sentinel.confidence, 0.0);
        assert_eq!(sentinel.risk_level, RiskLevel::High);
    }
}
