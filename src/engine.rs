// =============================================================================
// Engine — the shared handle the scheduler and HTTP API both mutate through
// =============================================================================
//
// One `Arc<Engine>` is constructed in `main.rs` and handed to both the
// scheduler task and the axum router — no process-wide singleton.
// Config/State/TradeHistory
// live behind `parking_lot::RwLock`s; every mutation follows the same
// read-snapshot -> async I/O -> write-back -> persist discipline lifecycle.rs
// and risk.rs already use, so Engine itself holds no lock across an `.await`.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::advisory::{AdvisoryAdapter, MarketSnapshot};
use crate::config::Config;
use crate::exchange::ExchangeAdapter;
use crate::lifecycle::{self, MonitorContext, MonitorOutcome};
use crate::logging::LogBuffer;
use crate::market_data::CandleSeries;
use crate::price_stream::PriceStreamAdapter;
use crate::risk;
use crate::state_store::{HistoryAggregates, State, TradeHistory, TradeHistoryRow};
use crate::strategy::{self, EvaluationInput, PreAdvisoryOutcome};
use crate::types::{CloseReason, EngineStatus, StrategyOutcome};

const MIN_CANDLES_FOR_SCAN: u32 = 120;

fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

pub struct EnginePaths {
    pub config: PathBuf,
    pub state: PathBuf,
    pub history: PathBuf,
}

pub struct Engine {
    pub exchange: Arc<dyn ExchangeAdapter>,
    pub advisory: Arc<dyn AdvisoryAdapter>,
    pub price_stream: Arc<dyn PriceStreamAdapter>,

    config: RwLock<Config>,
    state: RwLock<State>,
    history: RwLock<TradeHistory>,
    paths: EnginePaths,
    logs: LogBuffer,

    monitor_ctx: Mutex<MonitorContext>,
    is_scanning: AtomicBool,
}

impl Engine {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        advisory: Arc<dyn AdvisoryAdapter>,
        price_stream: Arc<dyn PriceStreamAdapter>,
        config: Config,
        state: State,
        history: TradeHistory,
        paths: EnginePaths,
        logs: LogBuffer,
    ) -> Self {
        Self {
            exchange,
            advisory,
            price_stream,
            config: RwLock::new(config),
            state: RwLock::new(state),
            history: RwLock::new(history),
            paths,
            logs,
            monitor_ctx: Mutex::new(MonitorContext::default()),
            is_scanning: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn state(&self) -> State {
        self.state.read().clone()
    }

    pub fn history_page(&self, page: usize, page_size: usize) -> (Vec<TradeHistoryRow>, HistoryAggregates) {
        self.history.read().page(page, page_size)
    }

    /// Last ≤50 formatted log lines, oldest first.
    pub fn recent_logs(&self) -> Vec<String> {
        self.logs.recent()
    }

    /// Best-effort balance read for the status endpoint; `None` on any
    /// adapter failure rather than failing the whole response.
    pub async fn current_balance(&self) -> Option<Decimal> {
        self.exchange.fetch_balance("USDT").await.ok()
    }

    /// Idempotent operator intent switch.
    /// Also clears a tripped circuit breaker, since the only way an operator
    /// can resume trading after a halt is an explicit `start()`. Does not
    /// itself open a position — the next scheduler tick decides that.
    pub fn start(&self) {
        let mut state = self.state.write();
        if state.circuit_breaker.is_triggered {
            state.circuit_breaker = Default::default();
            state.allow_new_trades = risk::check_daily_trade_limit(state.today_trades, &self.config().risk_config);
            info!("circuit breaker reset on start");
        }
        if state.is_running {
            let _ = state.save(&self.paths.state);
            return;
        }
        state.is_running = true;
        if state.status == EngineStatus::Halted || state.status == EngineStatus::Idle {
            state.status = EngineStatus::Monitoring;
        }
        let _ = state.save(&self.paths.state);
        info!("engine started");
    }

    /// Idempotent. Leaves any open position
    /// exactly as it is — stopping only prevents new entries and monitor
    /// ticks from running until `start()` is called again.
    pub fn stop(&self) {
        let mut state = self.state.write();
        if !state.is_running {
            return;
        }
        state.is_running = false;
        let _ = state.save(&self.paths.state);
        info!("engine stopped");
    }

    /// Takes effect at the next tick boundary — `tick()` never observes a config change mid-tick
    /// because it reads its own `Config` snapshot once at the top. Also
    /// re-evaluates `allowNewTrades` against the new `dailyTradeLimit`,
    /// since a patch can raise or lower that limit relative to
    /// `todayTrades` without waiting for the next daily reset.
    pub fn apply_config_patch(&self, patch: &serde_json::Value) -> Result<Config, crate::config::ConfigError> {
        let merged = self.config.read().with_patch(patch)?;
        merged.save(&self.paths.config)?;
        *self.config.write() = merged.clone();

        let mut state = self.state.write();
        state.allow_new_trades = risk::check_daily_trade_limit(state.today_trades, &merged.risk_config)
            && !state.circuit_breaker.is_triggered;
        let _ = state.save(&self.paths.state);

        info!("config patch applied");
        Ok(merged)
    }

    /// One scheduler tick. Returns the delay, in seconds,
    /// the scheduler should wait before the next tick.
    pub async fn tick(&self) -> u64 {
        if self.is_scanning.swap(true, Ordering::SeqCst) {
            warn!("tick skipped: previous tick still in flight");
            return 1;
        }
        let result = self.tick_inner().await;
        self.is_scanning.store(false, Ordering::SeqCst);
        result
    }

    async fn tick_inner(&self) -> u64 {
        let cfg = self.config();
        let now = chrono::Utc::now();
        let now_ms = now.timestamp_millis();

        // 1. Daily reset.
        {
            let mut state = self.state.write();
            if risk::should_reset_daily_state(&state.last_reset_date, now, &cfg) {
                info!(previous = %state.last_reset_date, "daily reset");
                let was_halted_by_breaker_or_cap = !state.is_running
                    && (state.circuit_breaker.is_triggered || !risk::check_daily_trade_limit(state.today_trades, &cfg.risk_config));

                state.today_trades = 0;
                state.daily_pnl = rust_decimal::Decimal::ZERO;
                state.circuit_breaker = Default::default();
                state.last_reset_date = risk::local_date_string(now, &cfg);
                state.allow_new_trades = true;

                if was_halted_by_breaker_or_cap {
                    state.is_running = true;
                    state.status = EngineStatus::Monitoring;
                }
                let _ = state.save(&self.paths.state);
            }
        }

        // 2. Circuit breaker.
        if self.state.read().circuit_breaker.is_triggered {
            let mut state = self.state.write();
            state.status = EngineStatus::Halted;
            state.is_running = false;
            let _ = state.save(&self.paths.state);
            warn!("tick: circuit breaker tripped — halted");
            return cfg.scan_interval;
        }

        if !self.state.read().is_running {
            return cfg.scan_interval;
        }

        // 3. Forced-liquidate window.
        let has_position = self.state.read().current_position.is_some();
        if has_position && risk::should_force_liquidate(now, &cfg) {
            info!("tick: forced-liquidate window — closing position");
            self.run_close(CloseReason::ForcedClose, now_ms).await;
            return cfg.position_scan_interval;
        }

        // 4. Monitor.
        if has_position {
            self.run_monitor(now_ms).await;
            return cfg.position_scan_interval;
        }

        // 5. Scan.
        let allow_new_trades = self.state.read().allow_new_trades;
        let cooldown_ok = risk::cooldown_elapsed(self.state.read().last_trade_time, cfg.trade_cooldown_interval, now_ms);
        if allow_new_trades && cooldown_ok {
            self.run_scan(now_ms).await;
        } else {
            info!(allow_new_trades, cooldown_ok, "tick skipped: new trades not allowed this tick");
        }

        cfg.scan_interval
    }

    async fn run_close(&self, reason: CloseReason, now_ms: i64) {
        let cfg = self.config();
        let mut state = self.state();
        let mut history = self.history.read().clone();

        match lifecycle::close_position(self.exchange.as_ref(), &cfg, &mut state, &self.paths.state, &mut history, &self.paths.history, reason, now_ms).await {
            Ok(()) => {
                *self.state.write() = state;
                *self.history.write() = history;
            }
            Err(err) => warn!(error = %err, "close_position failed"),
        }
    }

    async fn run_monitor(&self, now_ms: i64) {
        let cfg = self.config();
        let mut state = self.state();
        let mut history = self.history.read().clone();

        let (current_adx15m, current_rsi15m) = self.maybe_recompute_indicators(&state, &cfg).await;

        let mut ctx = self.monitor_ctx.lock().clone();
        let result = lifecycle::monitor_position(
            self.exchange.as_ref(),
            &cfg,
            &mut state,
            &self.paths.state,
            &mut history,
            &self.paths.history,
            &mut ctx,
            current_adx15m,
            current_rsi15m,
            now_ms,
        )
        .await;

        match result {
            Ok(MonitorOutcome::StillOpen) => {
                *self.state.write() = state;
                *self.monitor_ctx.lock() = ctx;
            }
            Ok(MonitorOutcome::Closed(reason)) => {
                info!(%reason, "position closed by monitor");
                *self.state.write() = state;
                *self.history.write() = history;
                *self.monitor_ctx.lock() = MonitorContext::default();
            }
            Err(err) => warn!(error = %err, "monitor_position failed"),
        }
    }

    /// Recompute ADX(15m) and RSI(15m) for the open position's symbol if the
    /// throttle window has elapsed ("recompute only if ≥5min since last
    /// compute or price moved >1%"). Returns `(None, None)` when no recompute
    /// was due this tick, so the monitor keeps its last values.
    async fn maybe_recompute_indicators(&self, state: &State, cfg: &Config) -> (Option<f64>, Option<f64>) {
        let Some(position) = state.current_position.as_ref() else {
            return (None, None);
        };
        let ctx = self.monitor_ctx.lock();
        let now_ms = chrono::Utc::now().timestamp_millis();
        let price = state.current_price.unwrap_or(position.entry_price);
        let price_f64 = decimal_to_f64(price);
        let last_price_f64 = decimal_to_f64(ctx.last_indicator_price);
        let drift = if last_price_f64 == 0.0 { f64::MAX } else { ((price_f64 - last_price_f64) / last_price_f64).abs() };
        let due = now_ms - ctx.last_indicator_compute_ms >= 5 * 60_000 || drift > 0.01;
        drop(ctx);
        if !due {
            return (None, None);
        }

        let _ = cfg;
        let Ok(candles) = self.exchange.fetch_ohlcv(&position.symbol, "15m", MIN_CANDLES_FOR_SCAN).await else {
            return (None, None);
        };
        let mut series = CandleSeries::with_capacity(candles.len() + 10);
        series.replace(candles);
        let adx = crate::indicators::adx::calculate_adx(&series.as_slice(), 14);
        let rsi = crate::indicators::rsi::current_rsi(&series.closes(), 14).map(|(value, _)| value);
        (adx, rsi)
    }

    /// Preferred price source for a scan: the websocket cache within its
    /// TTL, falling back to a REST poll.
    async fn resolve_price(&self, symbol: &str) -> Result<Decimal, crate::exchange::ExchangeError> {
        if let Some(cached) = self.price_stream.get_cached_price(symbol) {
            return Ok(cached.price);
        }
        self.exchange.fetch_price(symbol).await
    }

    async fn run_scan(&self, now_ms: i64) {
        let cfg = self.config();

        for symbol in cfg.symbols.iter() {
            match self.evaluate_symbol(symbol, &cfg).await {
                Ok(StrategyOutcome::Rejected(rejection)) => {
                    info!(symbol = %rejection.symbol, reason = %rejection.reason, "scan: rejected");
                }
                Ok(StrategyOutcome::Signal(signal)) => {
                    info!(symbol = %signal.symbol, direction = %signal.direction, "scan: signal produced — opening position");
                    let cfg = self.config();
                    let mut state = self.state();
                    match lifecycle::open_position(self.exchange.as_ref(), &cfg, &mut state, &self.paths.state, signal, now_ms).await {
                        Ok(()) => {
                            *self.state.write() = state;
                            *self.monitor_ctx.lock() = MonitorContext::default();
                        }
                        Err(err) => warn!(error = %err, "open_position failed"),
                    }
                    return;
                }
                Err(err) => warn!(%symbol, error = %err, "scan: failed to evaluate symbol"),
            }
        }
    }

    async fn evaluate_symbol(&self, symbol: &str, cfg: &Config) -> Result<StrategyOutcome, crate::exchange::ExchangeError> {
        let price = self.resolve_price(symbol).await?;

        let (candles_15m, candles_1h, candles_4h) = tokio::try_join!(
            self.exchange.fetch_ohlcv(symbol, "15m", MIN_CANDLES_FOR_SCAN),
            self.exchange.fetch_ohlcv(symbol, "1h", MIN_CANDLES_FOR_SCAN),
            self.exchange.fetch_ohlcv(symbol, "4h", MIN_CANDLES_FOR_SCAN),
        )?;

        let mut series_15m = CandleSeries::with_capacity(candles_15m.len() + 10);
        series_15m.replace(candles_15m);
        let mut series_1h = CandleSeries::with_capacity(candles_1h.len() + 10);
        series_1h.replace(candles_1h);
        let mut series_4h = CandleSeries::with_capacity(candles_4h.len() + 10);
        series_4h.replace(candles_4h);

        let input = EvaluationInput {
            symbol,
            price,
            candles_15m: &series_15m,
            candles_1h: &series_1h,
            candles_4h: &series_4h,
            advisory: None,
        };

        let pre = match strategy::compute_pre_advisory(&input, cfg) {
            PreAdvisoryOutcome::Rejected(rejection, _) => return Ok(StrategyOutcome::Rejected(rejection)),
            PreAdvisoryOutcome::Ready(pre) => pre,
        };

        let opinion = if cfg.ai_config.enabled && cfg.ai_config.use_for_entry {
            let snapshot = MarketSnapshot {
                symbol: symbol.to_string(),
                price: decimal_to_f64(price),
                indicators: pre.indicators,
            };
            Some(self.advisory.analyze(&snapshot).await)
        } else {
            None
        };

        Ok(strategy::finalize(symbol, price, pre, opinion.as_ref(), cfg).0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::exchange::{
        ExchangeError, ExchangePosition, MarginMode, OrderQueryOptions, OrderResult, OrderSide, OrderStatus, PositionMode, SymbolFilters,
    };
    use crate::market_data::Candle;
    use crate::price_stream::CachedPrice;
    use crate::types::AdvisoryOpinion;

    /// Exercises only the paths `Engine` actually calls; every candle fetch
    /// returns too few bars for the evaluator to do anything but reject, so
    /// these tests never reach a live order call.
    struct FakeExchange {
        price: Decimal,
        balance: Result<Decimal, &'static str>,
    }

    impl Default for FakeExchange {
        fn default() -> Self {
            Self { price: dec!(50000), balance: Ok(dec!(10000)) }
        }
    }

    #[async_trait]
    impl ExchangeAdapter for FakeExchange {
        async fn load_markets(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn fetch_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
            Ok(self.price)
        }
        async fn fetch_ohlcv(&self, _symbol: &str, _timeframe: &str, _limit: u32) -> Result<Vec<Candle>, ExchangeError> {
            Ok(Vec::new())
        }
        async fn fetch_balance(&self, _asset: &str) -> Result<Decimal, ExchangeError> {
            self.balance.map_err(|e| ExchangeError::Other(e.to_string()))
        }
        async fn fetch_positions(&self, _symbol: Option<&str>) -> Result<Vec<ExchangePosition>, ExchangeError> {
            Ok(Vec::new())
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn set_margin_mode(&self, _symbol: &str, _mode: MarginMode) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn set_position_mode(&self, _mode: PositionMode) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn market_order(&self, _symbol: &str, _side: OrderSide, _quantity: Decimal) -> Result<OrderResult, ExchangeError> {
            unreachable!("tests never drive the evaluator far enough to place an order")
        }
        async fn stop_market_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _quantity: Decimal,
            _stop_price: Decimal,
        ) -> Result<OrderResult, ExchangeError> {
            unreachable!()
        }
        async fn cancel_order(&self, _order_id: &str, _symbol: &str, _opts: OrderQueryOptions) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn cancel_all_orders(&self, _symbol: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn fetch_order(&self, _order_id: &str, _symbol: &str, _opts: OrderQueryOptions) -> Result<OrderResult, ExchangeError> {
            Ok(OrderResult {
                order_id: "1".into(),
                status: OrderStatus::Filled,
                average: Some(self.price),
                price: Some(self.price),
                stop_price: None,
                filled_quantity: dec!(0),
            })
        }
        async fn symbol_filters(&self, _symbol: &str) -> Result<SymbolFilters, ExchangeError> {
            Ok(SymbolFilters { lot_precision: 3, min_notional: dec!(5) })
        }
    }

    struct FakeAdvisory;

    #[async_trait]
    impl AdvisoryAdapter for FakeAdvisory {
        async fn analyze(&self, _snapshot: &MarketSnapshot) -> AdvisoryOpinion {
            AdvisoryOpinion::sentinel()
        }
    }

    struct FakePriceStream;

    impl PriceStreamAdapter for FakePriceStream {
        fn subscribe(&self, _symbols: &[String], _callback: crate::price_stream::PriceCallback) {}
        fn get_cached_price(&self, _symbol: &str) -> Option<CachedPrice> {
            None
        }
        fn disconnect(&self) {}
    }

    fn test_paths(label: &str) -> EnginePaths {
        let dir = std::env::temp_dir().join(format!("meridian-engine-test-{label}-{}", std::process::id()));
        let _ = std::fs::create_dir_all(&dir);
        EnginePaths {
            config: dir.join("config.json"),
            state: dir.join("state.json"),
            history: dir.join("history.json"),
        }
    }

    fn build_engine(label: &str, config: Config, state: State) -> Arc<Engine> {
        Arc::new(Engine::new(
            Arc::new(FakeExchange::default()),
            Arc::new(FakeAdvisory),
            Arc::new(FakePriceStream),
            config,
            state,
            TradeHistory::default(),
            test_paths(label),
            LogBuffer::new(),
        ))
    }

    #[test]
    fn start_sets_running_and_leaves_idle_for_monitoring() {
        let engine = build_engine("start", Config::default(), State::default());
        engine.start();
        let state = engine.state();
        assert!(state.is_running);
        assert_eq!(state.status, EngineStatus::Monitoring);
    }

    #[test]
    fn stop_is_idempotent() {
        let engine = build_engine("stop", Config::default(), State::default());
        engine.start();
        engine.stop();
        engine.stop();
        assert!(!engine.state().is_running);
    }

    #[test]
    fn start_clears_a_tripped_circuit_breaker() {
        let mut state = State::default();
        state.circuit_breaker.is_triggered = true;
        state.circuit_breaker.reason = Some("daily loss".into());
        state.is_running = false;
        state.status = EngineStatus::Halted;

        let engine = build_engine("breaker-reset", Config::default(), state);
        engine.start();

        let state = engine.state();
        assert!(!state.circuit_breaker.is_triggered);
        assert!(state.is_running);
        assert_eq!(state.status, EngineStatus::Monitoring);
    }

    #[test]
    fn config_patch_reevaluates_allow_new_trades_against_new_limit() {
        let mut state = State::default();
        state.today_trades = 5;
        state.allow_new_trades = true;

        let engine = build_engine("patch", Config::default(), state);
        let patch = serde_json::json!({ "risk_config": { "daily_trade_limit": 3 } });
        let merged = engine.apply_config_patch(&patch).expect("patch should validate");

        assert_eq!(merged.risk_config.daily_trade_limit, 3);
        assert!(!engine.state().allow_new_trades);
    }

    #[tokio::test]
    async fn tick_with_insufficient_candles_rejects_every_symbol_without_opening() {
        let mut config = Config::default();
        config.symbols = std::iter::once("BTCUSDT".to_string()).collect();

        let mut state = State::default();
        state.is_running = true;
        state.status = EngineStatus::Monitoring;

        let engine = build_engine("tick-reject", config, state);
        let delay = engine.tick().await;

        assert!(delay > 0);
        assert!(engine.state().current_position.is_none());
    }

    #[tokio::test]
    async fn tick_skips_scan_while_stopped() {
        let mut config = Config::default();
        config.symbols = std::iter::once("BTCUSDT".to_string()).collect();

        let mut state = State::default();
        state.is_running = false;

        let engine = build_engine("tick-stopped", config, state);
        engine.tick().await;

        assert!(engine.state().current_position.is_none());
        assert!(!engine.state().is_running);
    }

    #[tokio::test]
    async fn daily_rollover_recovers_a_cap_halted_engine() {
        let mut config = Config::default();
        config.symbols = std::iter::once("BTCUSDT".to_string()).collect();
        config.risk_config.daily_trade_limit = 3;

        let mut state = State::default();
        state.today_trades = 3;
        state.allow_new_trades = false;
        state.is_running = false;
        state.status = EngineStatus::Monitoring;
        state.last_reset_date = "2000-01-01".to_string();

        let engine = build_engine("daily-rollover", config, state);
        engine.tick().await;

        let state = engine.state();
        assert_eq!(state.today_trades, 0);
        assert!(state.allow_new_trades);
        assert!(state.is_running);
        assert_eq!(state.status, EngineStatus::Monitoring);
    }
}
