// =============================================================================
// Position — the one open position the engine may hold at a time
// =============================================================================
//
// Reworked from a multi-position `Vec<Position>` model: the invariant
// that `status == POSITION` is equivalent to "exactly one position
// exists" is modeled directly as `Option<Position>` rather than a
// collection with an implied capacity of one.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::Direction;

/// Descriptive snapshot of the live stop-loss order on the exchange, used
/// purely for display/audit — the source of truth for "is it still live"
/// is always a fresh `fetchOrder` call, never this cached copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopOrderSnapshot {
    pub side: String,
    pub order_type: String,
    pub quantity: Decimal,
    pub stop_price: Decimal,
    pub status: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,

    pub stop_loss: Decimal,
    pub initial_stop_loss: Decimal,
    pub take_profit_1: Decimal,
    pub take_profit_2: Decimal,

    pub open_time: i64,
    pub order_id: String,
    pub stop_loss_order_id: Option<String>,
    pub stop_order_snapshot: Option<StopOrderSnapshot>,

    pub last_stop_loss_update: i64,
}

impl Position {
    /// Initial risk per unit: `|entry - initialStopLoss|` (used for RR math
    /// in take-profit and trailing-stop calculations).
    pub fn initial_risk_per_unit(&self) -> Decimal {
        (self.entry_price - self.initial_stop_loss).abs()
    }

    /// Attempt to move the stop loss to `candidate`. Only ever moves in
    /// the profitable direction, equality allowed. Returns `true` if the
    /// stop was actually moved.
    pub fn try_update_stop_loss(&mut self, candidate: Decimal, now_ms: i64) -> bool {
        let improves = match self.direction {
            Direction::Long => candidate > self.stop_loss,
            Direction::Short => candidate < self.stop_loss,
        };
        if improves {
            self.stop_loss = candidate;
            self.last_stop_loss_update = now_ms;
        }
        improves
    }

    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        let diff = match self.direction {
            Direction::Long => current_price - self.entry_price,
            Direction::Short => self.entry_price - current_price,
        };
        diff * self.quantity
    }

    pub fn unrealized_pnl_percentage(&self, current_price: Decimal) -> Decimal {
        let notional = self.entry_price * self.quantity;
        if notional == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.unrealized_pnl(current_price) / notional * Decimal::from(100) * Decimal::from(self.leverage)
    }

    pub fn holding_duration_hours(&self, now_ms: i64) -> f64 {
        let ms = (now_ms - self.open_time).max(0);
        ms as f64 / 3_600_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position() -> Position {
        Position {
            symbol: "BTC/USDT".to_string(),
            direction: Direction::Long,
            entry_price: dec!(50000),
            quantity: dec!(0.01),
            leverage: 10,
            stop_loss: dec!(49700),
            initial_stop_loss: dec!(49700),
            take_profit_1: dec!(50300),
            take_profit_2: dec!(50600),
            open_time: 0,
            order_id: "order-1".to_string(),
            stop_loss_order_id: Some("stop-1".to_string()),
            stop_order_snapshot: None,
            last_stop_loss_update: 0,
        }
    }

    #[test]
    fn stop_loss_only_moves_up_for_long() {
        let mut pos = long_position();
        assert!(pos.try_update_stop_loss(dec!(49800), 1));
        assert_eq!(pos.stop_loss, dec!(49800));
        // A worse candidate must not move the stop.
        assert!(!pos.try_update_stop_loss(dec!(49750), 2));
        assert_eq!(pos.stop_loss, dec!(49800));
    }

    #[test]
    fn stop_loss_only_moves_down_for_short() {
        let mut pos = long_position();
        pos.direction = Direction::Short;
        pos.stop_loss = dec!(50300);
        assert!(pos.try_update_stop_loss(dec!(50200), 1));
        assert!(!pos.try_update_stop_loss(dec!(50250), 2));
        assert_eq!(pos.stop_loss, dec!(50200));
    }

    #[test]
    fn equal_candidate_does_not_count_as_improvement() {
        let mut pos = long_position();
        assert!(!pos.try_update_stop_loss(dec!(49700), 1));
    }

    #[test]
    fn unrealized_pnl_long_profits_on_price_increase() {
        let pos = long_position();
        let pnl = pos.unrealized_pnl(dec!(50300));
        assert_eq!(pnl, dec!(3.00));
    }

    #[test]
    fn initial_risk_per_unit_is_entry_minus_initial_stop() {
        let pos = long_position();
        assert_eq!(pos.initial_risk_per_unit(), dec!(300));
    }
}
