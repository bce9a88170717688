// =============================================================================
// State Store — persisted runtime state and append-only trade history
// =============================================================================
//
// Three JSON artifacts live under the data directory: `config.json` (see
// `config.rs`), `state.json`, and `history.json`. All writes are whole-file
// atomic (write-to-`.tmp` then `rename`); reads are tolerant — a malformed
// or missing file falls back to defaults/empty and logs a warning rather
// than aborting startup.
// =============================================================================

use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::position::Position;
use crate::types::{CloseReason, Direction, EngineStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    #[serde(default)]
    pub is_triggered: bool,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub daily_loss: Decimal,
    #[serde(default)]
    pub consecutive_losses: u32,
}

/// Single persisted runtime-state record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    #[serde(default)]
    pub status: EngineStatus,
    #[serde(default)]
    pub is_running: bool,
    #[serde(default = "default_true")]
    pub allow_new_trades: bool,
    #[serde(default)]
    pub current_position: Option<Position>,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerState,
    #[serde(default)]
    pub today_trades: u32,
    #[serde(default)]
    pub daily_pnl: Decimal,
    #[serde(default = "default_reset_date")]
    pub last_reset_date: String,
    #[serde(default)]
    pub last_trade_time: i64,

    // Derived live fields, only meaningful while `current_position.is_some()`.
    #[serde(default)]
    pub current_price: Option<Decimal>,
    #[serde(default)]
    pub current_pnl: Option<Decimal>,
    #[serde(default)]
    pub current_pnl_percentage: Option<Decimal>,

    // Aggregates, recomputed from history on boot (never hand-edited).
    #[serde(default)]
    pub total_trades: u64,
    #[serde(default)]
    pub total_pnl: Decimal,
    #[serde(default)]
    pub win_rate: f64,
}

fn default_true() -> bool {
    true
}

fn default_reset_date() -> String {
    "1970-01-01".to_string()
}

impl Default for State {
    fn default() -> Self {
        Self {
            status: EngineStatus::Idle,
            is_running: false,
            allow_new_trades: true,
            current_position: None,
            circuit_breaker: CircuitBreakerState::default(),
            today_trades: 0,
            daily_pnl: Decimal::ZERO,
            last_reset_date: default_reset_date(),
            last_trade_time: 0,
            current_price: None,
            current_pnl: None,
            current_pnl_percentage: None,
            total_trades: 0,
            total_pnl: Decimal::ZERO,
            win_rate: 0.0,
        }
    }
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            is_triggered: false,
            reason: None,
            timestamp: 0,
            daily_loss: Decimal::ZERO,
            consecutive_losses: 0,
        }
    }
}

impl State {
    /// Invariant: `status == POSITION` iff a position exists. Every
    /// mutation path must go through a setter that keeps this true; this
    /// is the one place it is checked.
    pub fn check_position_invariant(&self) -> bool {
        (self.status == EngineStatus::Position) == self.current_position.is_some()
    }

    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<State>(&raw) {
                Ok(state) => state,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "state.json malformed — starting fresh");
                    State::default()
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no state.json found — starting fresh");
                State::default()
            }
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        atomic_write_json(path, self)
    }
}

/// One append-only trade-history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeHistoryRow {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    pub pnl: Decimal,
    pub pnl_percentage: Decimal,
    pub open_time: i64,
    pub close_time: i64,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradeHistory {
    #[serde(default)]
    rows: Vec<TradeHistoryRow>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HistoryAggregates {
    pub total_trades: u64,
    pub total_pnl: Decimal,
    pub win_rate: f64,
}

impl TradeHistory {
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<TradeHistory>(&raw) {
                Ok(history) => history,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "history.json malformed — starting empty (totals recomputed from whatever parses)");
                    TradeHistory::default()
                }
            },
            Err(_) => TradeHistory::default(),
        }
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        atomic_write_json(path, self)
    }

    /// Append-only. Rows must sort strictly later by `close_time`; the
    /// caller is responsible for stamping a fresh `close_time`, but we
    /// still assert ordering defensively here.
    pub fn append(&mut self, row: TradeHistoryRow) {
        debug_assert!(
            self.rows.last().map(|r| row.close_time > r.close_time).unwrap_or(true),
            "history rows must be strictly increasing by close_time"
        );
        self.rows.push(row);
    }

    pub fn rows(&self) -> &[TradeHistoryRow] {
        &self.rows
    }

    /// Newest-first page of history rows, with aggregate stats — backs
    /// `GET /bot/history?page&pageSize`.
    pub fn page(&self, page: usize, page_size: usize) -> (Vec<TradeHistoryRow>, HistoryAggregates) {
        let page_size = page_size.max(1);
        let mut newest_first: Vec<TradeHistoryRow> = self.rows.iter().cloned().collect();
        newest_first.reverse();

        let start = page.saturating_mul(page_size);
        let end = (start + page_size).min(newest_first.len());
        let slice = if start < newest_first.len() {
            newest_first[start..end].to_vec()
        } else {
            Vec::new()
        };

        (slice, self.aggregates())
    }

    /// Pure function of history: `totalPnL == sum(history.pnl)`.
    pub fn aggregates(&self) -> HistoryAggregates {
        let total_trades = self.rows.len() as u64;
        let total_pnl: Decimal = self.rows.iter().map(|r| r.pnl).sum();
        let wins = self.rows.iter().filter(|r| r.pnl > Decimal::ZERO).count();
        let win_rate = if total_trades > 0 {
            wins as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };
        HistoryAggregates {
            total_trades,
            total_pnl,
            win_rate,
        }
    }
}

fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let tmp_path: PathBuf = {
        let mut p = path.to_path_buf();
        let file_name = format!("{}.tmp", path.file_name().and_then(|n| n.to_str()).unwrap_or("data.json"));
        p.set_file_name(file_name);
        p
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let json = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn row(pnl: Decimal, close_time: i64) -> TradeHistoryRow {
        TradeHistoryRow {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: "BTC/USDT".to_string(),
            direction: Direction::Long,
            entry_price: dec!(50000),
            exit_price: dec!(50300),
            quantity: dec!(0.01),
            leverage: 10,
            pnl,
            pnl_percentage: dec!(6),
            open_time: 0,
            close_time,
            reason: CloseReason::Tp1,
        }
    }

    #[test]
    fn default_state_has_no_position_and_matches_invariant() {
        let state = State::default();
        assert!(state.check_position_invariant());
    }

    #[test]
    fn history_aggregates_are_pure_sum_of_rows() {
        let mut history = TradeHistory::default();
        history.append(row(dec!(10), 1));
        history.append(row(dec!(-4), 2));
        let agg = history.aggregates();
        assert_eq!(agg.total_trades, 2);
        assert_eq!(agg.total_pnl, dec!(6));
        assert_eq!(agg.win_rate, 50.0);
    }

    #[test]
    fn page_returns_newest_first() {
        let mut history = TradeHistory::default();
        history.append(row(dec!(1), 1));
        history.append(row(dec!(2), 2));
        history.append(row(dec!(3), 3));
        let (page0, _) = history.page(0, 2);
        assert_eq!(page0.len(), 2);
        assert_eq!(page0[0].close_time, 3);
        assert_eq!(page0[1].close_time, 2);
    }

    #[test]
    fn state_save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("meridian-state-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");
        let mut state = State::default();
        state.today_trades = 3;
        state.save(&path).unwrap();
        let loaded = State::load(&path);
        assert_eq!(loaded.today_trades, 3);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
