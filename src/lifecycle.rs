// =============================================================================
// Order Lifecycle — open, monitor, close
// =============================================================================
//
// A demo/live dispatch split generalized to a single live path against
// `ExchangeAdapter`, a mutate-then-persist idiom, and a drift-detection
// helper extended from warn-only into an active compensated close. Every
// function mutates `State`/`TradeHistory` in place and persists before
// returning, matching the "read snapshot -> do I/O -> write-back ->
// persist" discipline used throughout the engine.
// =============================================================================

use std::path::Path;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::exchange::{ExchangeAdapter, ExchangeError, OrderQueryOptions, OrderSide, OrderStatus};
use crate::position::{Position, StopOrderSnapshot};
use crate::risk;
use crate::state_store::{State, TradeHistory, TradeHistoryRow};
use crate::types::{CloseReason, Direction, EngineStatus, RiskLevel, Signal};

const POST_ENTRY_CONFIRM_ATTEMPTS: u32 = 3;
const POST_ENTRY_CONFIRM_SPACING_MS: u64 = 500;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("entry not confirmed after {0} attempts")]
    EntryNotConfirmed(u32),
    #[error("equity below minimum safety floor: {0} < {1}")]
    EquityBelowFloor(Decimal, Decimal),
    #[error("exchange error: {0}")]
    Exchange(#[from] ExchangeError),
    #[error("precondition violated: {0}")]
    Precondition(&'static str),
}

fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

fn f64_to_decimal(v: f64) -> Decimal {
    Decimal::from_f64(v).unwrap_or(Decimal::ZERO)
}

/// `openPosition(signal)`.
pub async fn open_position(
    exchange: &dyn ExchangeAdapter,
    cfg: &Config,
    state: &mut State,
    state_path: &Path,
    signal: Signal,
    now_ms: i64,
) -> Result<(), LifecycleError> {
    if state.status != EngineStatus::Monitoring || state.current_position.is_some() || !state.allow_new_trades {
        return Err(LifecycleError::Precondition("openPosition requires MONITORING, no position, allowNewTrades"));
    }

    state.status = EngineStatus::Opening;
    let _ = state.save(state_path);

    let equity = exchange.fetch_balance("USDT").await?;
    if equity < cfg.min_equity_floor {
        warn!(%equity, floor = %cfg.min_equity_floor, "equity below safety floor — aborting entry");
        state.status = EngineStatus::Monitoring;
        let _ = state.save(state_path);
        return Err(LifecycleError::EquityBelowFloor(equity, cfg.min_equity_floor));
    }

    let entry = signal.price;
    let atr = f64_to_decimal(signal.indicators.atr14);
    let stop_distance = (atr * f64_to_decimal(cfg.stop_loss_atr_multiplier))
        .min(entry * f64_to_decimal(cfg.max_stop_loss_percentage) / Decimal::from(100));
    let stop_loss = match signal.direction {
        Direction::Long => entry - stop_distance,
        Direction::Short => entry + stop_distance,
    };

    let stop_distance_fraction = if entry == Decimal::ZERO {
        Decimal::ZERO
    } else {
        (stop_distance / entry).abs()
    };

    let leverage = compute_leverage(cfg, &signal, decimal_to_f64(stop_distance_fraction));

    if let Err(e) = exchange.set_leverage(&signal.symbol, leverage).await {
        warn!(error = %e, symbol = %signal.symbol, "set_leverage failed — continuing with exchange default");
    }
    if let Err(e) = exchange.set_margin_mode(&signal.symbol, crate::exchange::MarginMode::Cross).await {
        warn!(error = %e, symbol = %signal.symbol, "set_margin_mode failed — continuing");
    }
    if let Err(e) = exchange.set_position_mode(crate::exchange::PositionMode::OneWay).await {
        warn!(error = %e, "set_position_mode failed — continuing");
    }

    let risk_amount = equity * f64_to_decimal(cfg.max_risk_percentage) / Decimal::from(100);
    let mut usdt_notional = if stop_distance_fraction > Decimal::ZERO {
        (risk_amount / stop_distance_fraction).min(equity * Decimal::from(leverage))
    } else {
        equity * Decimal::from(leverage)
    };

    let filters = exchange.symbol_filters(&signal.symbol).await?;
    let min_notional = filters.min_notional.max(cfg.min_notional_floor);
    if usdt_notional < min_notional {
        usdt_notional = min_notional;
    }

    let quantity = round_to_precision(usdt_notional / entry, filters.lot_precision);
    if quantity <= Decimal::ZERO {
        state.status = EngineStatus::Monitoring;
        let _ = state.save(state_path);
        return Err(LifecycleError::Precondition("computed order quantity is non-positive"));
    }

    let side = OrderSide::from(signal.direction);
    let order = exchange.market_order(&signal.symbol, side, quantity).await?;

    let confirmed = confirm_entry(exchange, &signal.symbol).await;
    let Some(confirmed_qty) = confirmed else {
        error!(symbol = %signal.symbol, "entry not confirmed after retries — reverting to MONITORING");
        state.status = EngineStatus::Monitoring;
        let _ = state.save(state_path);
        return Err(LifecycleError::EntryNotConfirmed(POST_ENTRY_CONFIRM_ATTEMPTS));
    };

    let stop_side = OrderSide::from(signal.direction.opposite());
    let stop_order = exchange.stop_market_order(&signal.symbol, stop_side, confirmed_qty, stop_loss).await?;

    let risk_per_unit = (entry - stop_loss).abs();
    let tp_cfg = &cfg.risk_config.take_profit;
    let (tp1, tp2) = match signal.direction {
        Direction::Long => (
            entry + risk_per_unit * f64_to_decimal(tp_cfg.tp1_rr),
            entry + risk_per_unit * f64_to_decimal(tp_cfg.tp2_rr),
        ),
        Direction::Short => (
            entry - risk_per_unit * f64_to_decimal(tp_cfg.tp1_rr),
            entry - risk_per_unit * f64_to_decimal(tp_cfg.tp2_rr),
        ),
    };

    let position = Position {
        symbol: signal.symbol.clone(),
        direction: signal.direction,
        entry_price: entry,
        quantity: confirmed_qty,
        leverage,
        stop_loss,
        initial_stop_loss: stop_loss,
        take_profit_1: tp1,
        take_profit_2: tp2,
        open_time: now_ms,
        order_id: order.order_id,
        stop_loss_order_id: Some(stop_order.order_id.clone()),
        stop_order_snapshot: Some(StopOrderSnapshot {
            side: format!("{stop_side:?}"),
            order_type: "STOP_MARKET".to_string(),
            quantity: confirmed_qty,
            stop_price: stop_loss,
            status: format!("{:?}", stop_order.status),
            timestamp: now_ms,
        }),
        last_stop_loss_update: now_ms,
    };

    info!(symbol = %signal.symbol, direction = %signal.direction, %entry, %stop_loss, leverage, "position opened");

    state.current_position = Some(position);
    state.status = EngineStatus::Position;
    state.today_trades += 1;
    state.last_trade_time = now_ms;
    state.allow_new_trades = risk::check_daily_trade_limit(state.today_trades, &cfg.risk_config)
        && !state.circuit_breaker.is_triggered;
    debug_assert!(state.check_position_invariant());
    let _ = state.save(state_path);

    Ok(())
}

/// Leverage selection.
fn compute_leverage(cfg: &Config, signal: &Signal, stop_distance_fraction: f64) -> u32 {
    let dlc = &cfg.dynamic_leverage;

    let dynamic = if dlc.enabled {
        signal.advisory.as_ref().map(|advisory| {
            let risk_mult = match advisory.risk_level {
                RiskLevel::Low => dlc.risk_multiplier.low,
                RiskLevel::Medium => dlc.risk_multiplier.medium,
                RiskLevel::High => dlc.risk_multiplier.high,
            };
            let raw = dlc.base as f64 * (0.8 + advisory.confidence / 100.0) * risk_mult;
            (raw.round() as i64).clamp(dlc.min as i64, dlc.max as i64) as u32
        })
    } else {
        None
    };

    let safe = if stop_distance_fraction > 0.0 {
        ((cfg.max_risk_percentage / 100.0 / stop_distance_fraction).round() as i64).clamp(1, 20) as u32
    } else {
        1
    };

    match dynamic {
        Some(dynamic) => (dynamic.min(safe)).clamp(dlc.min, dlc.max),
        None => cfg.leverage,
    }
}

fn round_to_precision(value: Decimal, precision: u32) -> Decimal {
    value.round_dp(precision)
}

/// Post-entry confirmation loop. Returns the
/// exchange-reported filled quantity, never the submitted one.
async fn confirm_entry(exchange: &dyn ExchangeAdapter, symbol: &str) -> Option<Decimal> {
    for attempt in 1..=POST_ENTRY_CONFIRM_ATTEMPTS {
        match exchange.fetch_positions(Some(symbol)).await {
            Ok(positions) => {
                if let Some(p) = positions.into_iter().find(|p| p.symbol == symbol && p.quantity > Decimal::ZERO) {
                    return Some(p.quantity);
                }
            }
            Err(e) => warn!(error = %e, attempt, "fetch_positions failed during entry confirmation"),
        }
        if attempt < POST_ENTRY_CONFIRM_ATTEMPTS {
            tokio::time::sleep(std::time::Duration::from_millis(POST_ENTRY_CONFIRM_SPACING_MS)).await;
        }
    }
    None
}

/// `closePosition(reason)`.
pub async fn close_position(
    exchange: &dyn ExchangeAdapter,
    cfg: &Config,
    state: &mut State,
    state_path: &Path,
    history: &mut TradeHistory,
    history_path: &Path,
    reason: CloseReason,
    now_ms: i64,
) -> Result<(), LifecycleError> {
    let Some(position) = state.current_position.clone() else {
        return Err(LifecycleError::Precondition("closePosition requires an open position"));
    };

    state.status = EngineStatus::Closing;
    let _ = state.save(state_path);

    if let Some(stop_id) = &position.stop_loss_order_id {
        if let Err(e) = exchange.cancel_order(stop_id, &position.symbol, OrderQueryOptions { trigger: true }).await {
            warn!(error = %e, "cancel of stop-loss order failed — tolerated");
        }
    }
    if let Err(e) = exchange.cancel_all_orders(&position.symbol).await {
        warn!(error = %e, "cancel_all_orders failed — tolerated");
    }

    let close_side = OrderSide::from(position.direction.opposite());
    let order = exchange.market_order(&position.symbol, close_side, position.quantity).await?;
    let exit_price = order.average.or(order.price).unwrap_or_else(|| position.entry_price);

    let equity = exchange.fetch_balance("USDT").await.unwrap_or(position.entry_price * position.quantity);
    apply_close_accounting(cfg, state, history, &position, exit_price, equity, reason, now_ms);

    state.last_trade_time = now_ms;
    let _ = history.save(history_path);
    let _ = state.save(state_path);

    Ok(())
}

/// Shared accounting for every close path (explicit close and compensated
/// close alike): PnL, daily totals, consecutive-loss streak, circuit
/// breaker evaluation, and clearing `currentPosition`.
fn apply_close_accounting(
    cfg: &Config,
    state: &mut State,
    history: &mut TradeHistory,
    position: &Position,
    exit_price: Decimal,
    equity: Decimal,
    reason: CloseReason,
    now_ms: i64,
) {
    let dir_sign = Decimal::from(position.direction.sign());
    let pnl = (exit_price - position.entry_price) * position.quantity * dir_sign;
    let notional = position.entry_price * position.quantity;
    let pnl_percentage = if notional == Decimal::ZERO {
        Decimal::ZERO
    } else {
        pnl / notional * Decimal::from(100) * Decimal::from(position.leverage)
    };

    history.append(TradeHistoryRow {
        id: uuid::Uuid::new_v4().to_string(),
        symbol: position.symbol.clone(),
        direction: position.direction,
        entry_price: position.entry_price,
        exit_price,
        quantity: position.quantity,
        leverage: position.leverage,
        pnl,
        pnl_percentage,
        open_time: position.open_time,
        close_time: now_ms,
        reason,
    });

    state.daily_pnl += pnl;
    if pnl < Decimal::ZERO {
        state.circuit_breaker.consecutive_losses += 1;
    } else {
        state.circuit_breaker.consecutive_losses = 0;
    }

    let aggregates = history.aggregates();
    state.total_trades = aggregates.total_trades;
    state.total_pnl = aggregates.total_pnl;
    state.win_rate = aggregates.win_rate;

    if let Some(trip) = risk::check_circuit_breaker(
        state.daily_pnl,
        state.circuit_breaker.consecutive_losses,
        equity.max(Decimal::ONE),
        &cfg.risk_config,
    ) {
        state.circuit_breaker.is_triggered = true;
        state.circuit_breaker.reason = Some(trip.reason.clone());
        state.circuit_breaker.timestamp = now_ms;
        state.status = EngineStatus::Halted;
        state.is_running = false;
        state.allow_new_trades = false;
        warn!(reason = %trip.reason, "circuit breaker tripped on close");
    } else {
        state.status = EngineStatus::Monitoring;
    }

    state.current_position = None;
    state.current_price = None;
    state.current_pnl = None;
    state.current_pnl_percentage = None;
    debug_assert!(state.check_position_invariant());

    info!(symbol = %position.symbol, %pnl, %reason, "position closed");
}

/// `monitorPosition`. Bundles the per-tick state the
/// monitor needs to track between calls (last indicator recompute point,
/// last ADX(15m) observed) so the evaluator itself stays stateless.
#[derive(Clone)]
pub struct MonitorContext {
    pub last_indicator_price: Decimal,
    pub last_indicator_compute_ms: i64,
    pub last_adx15m: Option<f64>,
    pub last_log_ms: i64,
    pub last_log_pnl_pct: Decimal,
}

impl Default for MonitorContext {
    fn default() -> Self {
        Self {
            last_indicator_price: Decimal::ZERO,
            last_indicator_compute_ms: 0,
            last_adx15m: None,
            last_log_ms: 0,
            last_log_pnl_pct: Decimal::ZERO,
        }
    }
}

pub enum MonitorOutcome {
    StillOpen,
    Closed(CloseReason),
}

#[allow(clippy::too_many_arguments)]
pub async fn monitor_position(
    exchange: &dyn ExchangeAdapter,
    cfg: &Config,
    state: &mut State,
    state_path: &Path,
    history: &mut TradeHistory,
    history_path: &Path,
    ctx: &mut MonitorContext,
    current_adx15m: Option<f64>,
    current_rsi15m: Option<f64>,
    now_ms: i64,
) -> Result<MonitorOutcome, LifecycleError> {
    let Some(position) = state.current_position.clone() else {
        return Err(LifecycleError::Precondition("monitorPosition requires an open position"));
    };

    // 1. Consistency check — out-of-band liquidation / compensated close.
    let exchange_positions = exchange.fetch_positions(Some(&position.symbol)).await?;
    let still_open = exchange_positions.iter().any(|p| p.symbol == position.symbol && p.quantity > Decimal::ZERO);
    if !still_open {
        warn!(symbol = %position.symbol, "position missing on exchange — running compensated close");
        compensated_close(exchange, cfg, state, state_path, history, history_path, &position, now_ms).await?;
        return Ok(MonitorOutcome::Closed(CloseReason::StopHitObserved));
    }

    // 2. Price + live PnL.
    let price = exchange.fetch_price(&position.symbol).await?;
    let pnl = position.unrealized_pnl(price);
    let pnl_pct = position.unrealized_pnl_percentage(price);

    let should_log = now_ms - ctx.last_log_ms > 30_000 || (pnl_pct - ctx.last_log_pnl_pct).abs() > Decimal::from_f64(0.5).unwrap();
    if should_log {
        info!(symbol = %position.symbol, %price, %pnl, %pnl_pct, "position update");
        ctx.last_log_ms = now_ms;
        ctx.last_log_pnl_pct = pnl_pct;
    }

    state.current_price = Some(price);
    state.current_pnl = Some(pnl);
    state.current_pnl_percentage = Some(pnl_pct);
    let _ = state.save(state_path);

    // 3. Recompute-indicator throttle decision is the caller's
    // responsibility (it owns the OHLCV fetch); we only track the
    // bookkeeping fields here so the caller knows whether to refetch.
    let price_drift = if ctx.last_indicator_price == Decimal::ZERO {
        Decimal::MAX
    } else {
        ((price - ctx.last_indicator_price) / ctx.last_indicator_price).abs()
    };
    let should_recompute = now_ms - ctx.last_indicator_compute_ms >= 5 * 60_000 || price_drift > Decimal::from_f64(0.01).unwrap();
    if should_recompute {
        ctx.last_indicator_price = price;
        ctx.last_indicator_compute_ms = now_ms;
    }
    let prev_adx15m = ctx.last_adx15m;

    // 4. Timeout.
    let holding_hours = position.holding_duration_hours(now_ms);
    let adx_weakening = match (prev_adx15m, current_adx15m) {
        (Some(prev), Some(now)) => now < prev,
        _ => false,
    };
    if holding_hours >= cfg.position_timeout_hours && adx_weakening {
        close_position(exchange, cfg, state, state_path, history, history_path, CloseReason::Timeout, now_ms).await?;
        return Ok(MonitorOutcome::Closed(CloseReason::Timeout));
    }

    // 5. TP2.
    let risk_per_unit = position.initial_risk_per_unit();
    let tp_cfg = &cfg.risk_config.take_profit;
    let tp2_threshold = risk_per_unit * f64_to_decimal(tp_cfg.tp2_rr) * position.quantity;
    let rsi_extreme_hit = match (position.direction, current_rsi15m) {
        (Direction::Long, Some(rsi)) => rsi >= tp_cfg.rsi_extreme.long,
        (Direction::Short, Some(rsi)) => rsi <= tp_cfg.rsi_extreme.short,
        (_, None) => false,
    };
    let adx_decrease_hit = match (prev_adx15m, current_adx15m) {
        (Some(prev), Some(now)) => prev - now >= tp_cfg.adx_decrease_threshold,
        _ => false,
    };
    if pnl >= tp2_threshold || rsi_extreme_hit || adx_decrease_hit {
        close_position(exchange, cfg, state, state_path, history, history_path, CloseReason::Tp2, now_ms).await?;
        return Ok(MonitorOutcome::Closed(CloseReason::Tp2));
    }

    if let Some(adx) = current_adx15m {
        ctx.last_adx15m = Some(adx);
    }

    // 6. TP1 (full close; see DESIGN.md open-question decision).
    let tp1_threshold = risk_per_unit * f64_to_decimal(tp_cfg.tp1_rr) * position.quantity;
    if pnl >= tp1_threshold {
        // TODO: wire a reduce-only partial order once ExchangeAdapter
        // exposes one, and scale out 50% here instead of full-closing.
        close_position(exchange, cfg, state, state_path, history, history_path, CloseReason::Tp1, now_ms).await?;
        return Ok(MonitorOutcome::Closed(CloseReason::Tp1));
    }

    // 7. Trailing stop.
    if cfg.trailing_stop.enabled && now_ms - position.last_stop_loss_update >= (cfg.trailing_stop.update_interval_seconds as i64) * 1000 {
        maybe_update_trailing_stop(exchange, cfg, state, state_path, &position, price, risk_per_unit, pnl, now_ms).await?;
    }

    Ok(MonitorOutcome::StillOpen)
}

async fn maybe_update_trailing_stop(
    exchange: &dyn ExchangeAdapter,
    cfg: &Config,
    state: &mut State,
    state_path: &Path,
    position: &Position,
    price: Decimal,
    risk_per_unit: Decimal,
    pnl: Decimal,
    now_ms: i64,
) -> Result<(), LifecycleError> {
    if risk_per_unit == Decimal::ZERO {
        return Ok(());
    }
    let profit_rr = pnl / (risk_per_unit * position.quantity);
    if profit_rr < f64_to_decimal(cfg.trailing_stop.activation_ratio) {
        return Ok(());
    }

    let atr_estimate = risk_per_unit / f64_to_decimal(cfg.stop_loss_atr_multiplier.max(0.0001));
    let distance = atr_estimate * f64_to_decimal(cfg.trailing_stop.trailing_distance_atr_mult);
    let candidate = match position.direction {
        Direction::Long => price - distance,
        Direction::Short => price + distance,
    };

    let mut updated_position = position.clone();
    if !updated_position.try_update_stop_loss(candidate, now_ms) {
        return Ok(());
    }

    if let Some(old_stop_id) = &position.stop_loss_order_id {
        if let Err(e) = exchange.cancel_order(old_stop_id, &position.symbol, OrderQueryOptions { trigger: true }).await {
            warn!(error = %e, "cancel of old trailing stop failed — tolerated");
        }
    }

    let stop_side = OrderSide::from(position.direction.opposite());
    let new_stop = exchange.stop_market_order(&position.symbol, stop_side, position.quantity, candidate).await?;
    updated_position.stop_loss_order_id = Some(new_stop.order_id.clone());
    updated_position.stop_order_snapshot = Some(StopOrderSnapshot {
        side: format!("{stop_side:?}"),
        order_type: "STOP_MARKET".to_string(),
        quantity: position.quantity,
        stop_price: candidate,
        status: format!("{:?}", new_stop.status),
        timestamp: now_ms,
    });

    info!(symbol = %position.symbol, new_stop = %candidate, "trailing stop updated");
    state.current_position = Some(updated_position);
    let _ = state.save(state_path);
    Ok(())
}

/// Compensated close: the position vanished from the exchange between
/// ticks. If a stop-order id is on record, ask the exchange what happened
/// to it; otherwise fall back to current market price and a
/// `compensated-close-unknown` reason.
async fn compensated_close(
    exchange: &dyn ExchangeAdapter,
    cfg: &Config,
    state: &mut State,
    state_path: &Path,
    history: &mut TradeHistory,
    history_path: &Path,
    position: &Position,
    now_ms: i64,
) -> Result<(), LifecycleError> {
    let (exit_price, reason) = match &position.stop_loss_order_id {
        Some(stop_id) => match exchange.fetch_order(stop_id, &position.symbol, OrderQueryOptions { trigger: true }).await {
            Ok(order) if matches!(order.status, OrderStatus::Closed | OrderStatus::Filled) => {
                let price = order.average.or(order.price).unwrap_or(position.stop_loss);
                (price, CloseReason::StopHitObserved)
            }
            Ok(_) => {
                if let Err(e) = exchange.cancel_order(stop_id, &position.symbol, OrderQueryOptions { trigger: true }).await {
                    warn!(error = %e, "cancel of stale stop order failed during compensated close — tolerated");
                }
                let price = exchange.fetch_price(&position.symbol).await.unwrap_or(position.stop_loss);
                (price, CloseReason::CompensatedCloseUnknown)
            }
            Err(e) => {
                warn!(error = %e, "fetch_order failed during compensated close — falling back to market price");
                let price = exchange.fetch_price(&position.symbol).await.unwrap_or(position.stop_loss);
                (price, CloseReason::CompensatedCloseUnknown)
            }
        },
        None => {
            let price = exchange.fetch_price(&position.symbol).await.unwrap_or(position.stop_loss);
            (price, CloseReason::CompensatedCloseUnknown)
        }
    };

    let equity = exchange.fetch_balance("USDT").await.unwrap_or(position.entry_price * position.quantity);
    apply_close_accounting(cfg, state, history, position, exit_price, equity, reason, now_ms);
    state.last_trade_time = now_ms;
    let _ = history.save(history_path);
    let _ = state.save(state_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_leverage_falls_back_to_static_when_dynamic_disabled() {
        let cfg = Config::default();
        let signal = Signal {
            symbol: "BTC/USDT".to_string(),
            direction: Direction::Long,
            price: Decimal::from(50000),
            indicators: crate::types::IndicatorSnapshot {
                ema20: 0.0,
                ema30: 0.0,
                ema60: 0.0,
                rsi14: 0.0,
                atr14: 0.0,
                adx15m: 0.0,
                adx1h: 0.0,
                adx4h: 0.0,
            },
            advisory: None,
            reason: "test".to_string(),
        };
        let leverage = compute_leverage(&cfg, &signal, 0.02);
        assert!(leverage >= 1 && leverage <= cfg.dynamic_leverage.max.max(cfg.leverage));
    }

    #[test]
    fn round_to_precision_truncates_to_lot_size() {
        let value = Decimal::new(123456, 3); // 123.456
        let rounded = round_to_precision(value, 2);
        assert_eq!(rounded, Decimal::new(12346, 2));
    }
}
