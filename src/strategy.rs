// =============================================================================
// Strategy Evaluator — pure (symbol, snapshot, advisory?) -> Signal|Rejection
// =============================================================================
//
// A staged-pipeline shape (gate after gate, bail on the first miss)
// retargeted entirely onto the 15m/1h/4h
// EMA/RSI/ADX/ATR gates described for this engine. The evaluator touches
// no shared state: every input arrives as an argument, every output is a
// `StrategyOutcome`, and callers decide what to do with it.
// =============================================================================

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::{Config, DirectionEntryConfig};
use crate::indicators::{adx, atr, ema, rsi};
use crate::market_data::CandleSeries;
use crate::types::{AdvisoryOpinion, Direction, IndicatorSnapshot, Rejection, RejectionReason, RiskLevel, Signal, StrategyOutcome};

const MIN_CANDLES: usize = 96;

/// Everything the evaluator needs for one symbol, gathered by the caller
/// (scheduler/lifecycle) from the exchange and price-stream adapters.
pub struct EvaluationInput<'a> {
    pub symbol: &'a str,
    pub price: Decimal,
    pub candles_15m: &'a CandleSeries,
    pub candles_1h: &'a CandleSeries,
    pub candles_4h: &'a CandleSeries,
    pub advisory: Option<&'a AdvisoryOpinion>,
}

fn reject(symbol: &str, reason: RejectionReason) -> StrategyOutcome {
    debug!(symbol, %reason, "strategy rejected symbol");
    StrategyOutcome::Rejected(Rejection {
        symbol: symbol.to_string(),
        reason,
    })
}

/// Everything known about a symbol once every gate *except* the advisory
/// gate has been evaluated. The advisory call is async and lives outside
/// this module, so the caller builds a `MarketSnapshot` from `indicators`,
/// queries it, and passes the result to [`finalize`].
pub struct PreAdvisory {
    pub direction: Direction,
    pub indicators: IndicatorSnapshot,
    pub adx15m: f64,
}

pub enum PreAdvisoryOutcome {
    Rejected(Rejection, Option<f64>),
    Ready(PreAdvisory),
}

/// First stage of `evaluate`: candle-count, indicator computation, ADX
/// gate, direction, entry gate. Stops short of
/// the advisory query, which the caller performs out-of-band.
pub fn compute_pre_advisory(input: &EvaluationInput, cfg: &Config) -> PreAdvisoryOutcome {
    let symbol = input.symbol;

    if input.candles_15m.len() < MIN_CANDLES || input.candles_1h.len() < MIN_CANDLES || input.candles_4h.len() < MIN_CANDLES {
        return PreAdvisoryOutcome::Rejected(Rejection { symbol: symbol.to_string(), reason: RejectionReason::InsufficientCandles }, None);
    }

    let closes_15m = input.candles_15m.closes();
    let ema20_series = ema::calculate_ema(&closes_15m, 20);
    let ema30_series = ema::calculate_ema(&closes_15m, 30);
    let ema60_series = ema::calculate_ema(&closes_15m, 60);
    let rsi_series = rsi::calculate_rsi(&closes_15m, 14);

    let (Some(&ema20), Some(&ema30), Some(&ema60), Some(&rsi14)) =
        (ema20_series.last(), ema30_series.last(), ema60_series.last(), rsi_series.last())
    else {
        return PreAdvisoryOutcome::Rejected(Rejection { symbol: symbol.to_string(), reason: RejectionReason::InsufficientCandles }, None);
    };

    let reject_insufficient = || PreAdvisoryOutcome::Rejected(Rejection { symbol: symbol.to_string(), reason: RejectionReason::InsufficientCandles }, None);

    let Some(atr14) = atr::calculate_atr(&input.candles_15m.as_slice(), 14) else {
        return reject_insufficient();
    };
    let Some(adx15m) = adx::calculate_adx(&input.candles_15m.as_slice(), 14) else {
        return reject_insufficient();
    };
    let Some(adx1h) = adx::calculate_adx(&input.candles_1h.as_slice(), 14) else {
        return reject_insufficient();
    };
    let Some(adx4h) = adx::calculate_adx(&input.candles_4h.as_slice(), 14) else {
        return reject_insufficient();
    };

    let indicators = IndicatorSnapshot {
        ema20,
        ema30,
        ema60,
        rsi14,
        atr14,
        adx15m,
        adx1h,
        adx4h,
    };

    // ADX gate: OR across 1h/4h, intentionally widened from a stricter AND.
    let ic = &cfg.indicators_config;
    if adx1h < ic.adx_1h_threshold && adx4h < ic.adx_4h_threshold {
        return PreAdvisoryOutcome::Rejected(Rejection { symbol: symbol.to_string(), reason: RejectionReason::AdxGate }, Some(adx15m));
    }

    let price_f64: f64 = input.price.to_f64().unwrap_or(f64::NAN);

    let direction = if ema20 > ema60 && price_f64 > ema20 {
        Direction::Long
    } else if ema20 < ema60 && price_f64 < ema20 {
        Direction::Short
    } else {
        return PreAdvisoryOutcome::Rejected(Rejection { symbol: symbol.to_string(), reason: RejectionReason::DirectionUndetermined }, Some(adx15m));
    };

    let entry_cfg = match direction {
        Direction::Long => &ic.long,
        Direction::Short => &ic.short,
    };

    if let Some(rejection) = entry_gate(direction, price_f64, ema20, ema30, rsi14, input.candles_15m, entry_cfg) {
        return PreAdvisoryOutcome::Rejected(Rejection { symbol: symbol.to_string(), reason: rejection }, Some(adx15m));
    }

    PreAdvisoryOutcome::Ready(PreAdvisory { direction, indicators, adx15m })
}

/// Second stage of `evaluate`: the advisory gate and `Signal` construction,
/// given the opinion the caller already fetched
/// (or `None` if `aiConfig` doesn't apply it to entries).
pub fn finalize(symbol: &str, price: Decimal, pre: PreAdvisory, advisory: Option<&AdvisoryOpinion>, cfg: &Config) -> (StrategyOutcome, Option<f64>) {
    let PreAdvisory { direction, indicators, adx15m } = pre;

    let mut advisory_opinion = advisory.cloned();
    if cfg.ai_config.enabled && cfg.ai_config.use_for_entry {
        match advisory {
            None => return (reject(symbol, RejectionReason::AdvisoryLowConfidence), Some(adx15m)),
            Some(raw_opinion) => {
                // Post-adjustment runs on the raw opinion first, then the
                // gates below judge the adjusted figures: applied after the
                // advisory returns and before the gating check.
                let adjusted = post_adjust_advisory(raw_opinion.clone(), adx15m, indicators.rsi14, indicators.atr14);

                if adjusted.direction != Some(direction) {
                    return (reject(symbol, RejectionReason::AdvisoryDirectionMismatch), Some(adx15m));
                }
                if adjusted.confidence < cfg.ai_config.min_confidence {
                    return (reject(symbol, RejectionReason::AdvisoryLowConfidence), Some(adx15m));
                }
                if risk_level_rank(adjusted.risk_level) > risk_level_rank(cfg.ai_config.max_risk_level) {
                    return (reject(symbol, RejectionReason::AdvisoryRiskTooHigh), Some(adx15m));
                }
                advisory_opinion = Some(adjusted);
            }
        }
    }

    let reason = format!(
        "{direction} {symbol}: ema20={:.4} ema60={:.4} rsi14={:.2} adx1h={:.2} adx4h={:.2}",
        indicators.ema20, indicators.ema60, indicators.rsi14, indicators.adx1h, indicators.adx4h
    );

    let signal = Signal {
        symbol: symbol.to_string(),
        direction,
        price,
        indicators,
        advisory: advisory_opinion,
        reason,
    };

    (StrategyOutcome::Signal(signal), Some(adx15m))
}

/// `evaluate` — the evaluator's single entry point for callers (tests,
/// anything synchronous) that already have the advisory
/// opinion in hand. Equivalent to `compute_pre_advisory` followed by
/// `finalize`; callers doing a live advisory lookup should call those two
/// stages directly with the async call in between.
pub fn evaluate(input: &EvaluationInput, cfg: &Config) -> (StrategyOutcome, Option<f64>) {
    match compute_pre_advisory(input, cfg) {
        PreAdvisoryOutcome::Rejected(r, adx) => (StrategyOutcome::Rejected(r), adx),
        PreAdvisoryOutcome::Ready(pre) => finalize(input.symbol, input.price, pre, input.advisory, cfg),
    }
}

fn risk_level_rank(level: RiskLevel) -> u8 {
    match level {
        RiskLevel::Low => 0,
        RiskLevel::Medium => 1,
        RiskLevel::High => 2,
    }
}

/// Deterministic post-adjustment of the advisory's confidence/score/risk
/// based on indicator strength. Applied as a pure function after the
/// advisory call, never before the gating checks above, so a borderline
/// advisory is judged on its own terms first.
fn post_adjust_advisory(mut opinion: AdvisoryOpinion, adx15m: f64, rsi14: f64, atr14: f64) -> AdvisoryOpinion {
    let trend_bonus = ((adx15m - 25.0) / 10.0).clamp(-5.0, 5.0);
    let rsi_penalty = if !(30.0..=70.0).contains(&rsi14) { 5.0 } else { 0.0 };
    opinion.confidence = (opinion.confidence + trend_bonus - rsi_penalty).clamp(0.0, 100.0);
    opinion.score = (opinion.score + trend_bonus - rsi_penalty).clamp(0.0, 100.0);
    if atr14 <= 0.0 {
        opinion.risk_level = RiskLevel::High;
    }
    opinion
}

fn entry_gate(
    direction: Direction,
    price: f64,
    ema20: f64,
    ema30: f64,
    rsi14: f64,
    candles_15m: &CandleSeries,
    cfg: &DirectionEntryConfig,
) -> Option<RejectionReason> {
    let dev20 = relative_deviation(price, ema20);
    let dev30 = relative_deviation(price, ema30);
    if dev20 > cfg.ema_deviation_threshold && dev30 > cfg.ema_deviation_threshold {
        return Some(RejectionReason::EntryGateEmaDeviation);
    }

    if rsi14 < cfg.rsi_min || rsi14 > cfg.rsi_max {
        return Some(RejectionReason::EntryGateRsi);
    }

    let Some(last) = candles_15m.last() else {
        return Some(RejectionReason::EntryGateCandle);
    };

    let candle_confirms = match direction {
        Direction::Long => last.is_bullish_body() || last.lower_shadow_fraction() >= cfg.candle_shadow_threshold,
        Direction::Short => !last.is_bullish_body() || last.upper_shadow_fraction() >= cfg.candle_shadow_threshold,
    };
    if !candle_confirms {
        return Some(RejectionReason::EntryGateCandle);
    }

    if cfg.volume_confirmation {
        let volumes = candles_15m.volumes();
        let vol_ema = ema::calculate_ema(&volumes, cfg.volume_ema_period);
        let Some(&last_vol_ema) = vol_ema.last() else {
            return Some(RejectionReason::EntryGateVolume);
        };
        if last.volume < cfg.volume_ema_multiplier * last_vol_ema {
            return Some(RejectionReason::EntryGateVolume);
        }
    }

    None
}

fn relative_deviation(price: f64, ema_value: f64) -> f64 {
    if ema_value == 0.0 {
        return f64::INFINITY;
    }
    ((price - ema_value) / ema_value).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::market_data::Candle;
    use rust_decimal_macros::dec;

    fn trending_candles(n: usize, start: f64, step: f64) -> CandleSeries {
        let mut series = CandleSeries::with_capacity(n + 10);
        let mut candles = Vec::with_capacity(n);
        let mut price = start;
        for i in 0..n {
            let open = price;
            let close = price + step;
            let high = open.max(close) + step.abs() * 0.5;
            let low = open.min(close) - step.abs() * 0.1;
            candles.push(Candle::new(i as i64, open, high, low, close, 100.0, i as i64 + 1));
            price = close;
        }
        series.replace(candles);
        series
    }

    #[test]
    fn rejects_when_insufficient_candles() {
        let series = trending_candles(10, 100.0, 1.0);
        let input = EvaluationInput {
            symbol: "BTC/USDT",
            price: dec!(110),
            candles_15m: &series,
            candles_1h: &series,
            candles_4h: &series,
            advisory: None,
        };
        let (outcome, _) = evaluate(&input, &Config::default());
        assert!(matches!(outcome, StrategyOutcome::Rejected(r) if r.reason == RejectionReason::InsufficientCandles));
    }

    #[test]
    fn uptrend_with_adx_gate_open_produces_long_signal_or_explainable_rejection() {
        let series_15m = trending_candles(150, 100.0, 0.8);
        let series_1h = trending_candles(150, 100.0, 0.8);
        let series_4h = trending_candles(150, 100.0, 0.8);
        let last_close = series_15m.last().unwrap().close;

        let mut cfg = Config::default();
        cfg.indicators_config.adx_1h_threshold = 0.0;
        cfg.indicators_config.adx_4h_threshold = 0.0;
        cfg.indicators_config.long.rsi_min = 0.0;
        cfg.indicators_config.long.rsi_max = 100.0;
        cfg.indicators_config.long.ema_deviation_threshold = 1.0;

        let input = EvaluationInput {
            symbol: "BTC/USDT",
            price: Decimal::from_f64(last_close * 1.0001).unwrap(),
            candles_15m: &series_15m,
            candles_1h: &series_1h,
            candles_4h: &series_4h,
            advisory: None,
        };
        let (outcome, adx_snapshot) = evaluate(&input, &cfg);
        assert!(adx_snapshot.is_some());
        // A clean uptrend with every gate disabled except direction/candle
        // should never come back as a generic insufficient-candles reject.
        if let StrategyOutcome::Rejected(r) = &outcome {
            assert_ne!(r.reason, RejectionReason::InsufficientCandles);
        }
    }

    #[test]
    fn advisory_direction_mismatch_is_rejected_when_ai_enabled() {
        let series = trending_candles(150, 100.0, 0.8);
        let mut cfg = Config::default();
        cfg.ai_config.enabled = true;
        cfg.ai_config.use_for_entry = true;
        cfg.indicators_config.adx_1h_threshold = 0.0;
        cfg.indicators_config.adx_4h_threshold = 0.0;
        cfg.indicators_config.long.ema_deviation_threshold = 1.0;
        cfg.indicators_config.long.rsi_min = 0.0;
        cfg.indicators_config.long.rsi_max = 100.0;

        let opinion = AdvisoryOpinion {
            direction: Some(Direction::Short),
            confidence: 90.0,
            score: 80.0,
            risk_level: RiskLevel::Low,
            reasoning: "test".to_string(),
            technical_data: serde_json::Value::Null,
        };

        let last_close = series.last().unwrap().close;
        let input = EvaluationInput {
            symbol: "BTC/USDT",
            price: Decimal::from_f64(last_close * 1.0001).unwrap(),
            candles_15m: &series,
            candles_1h: &series,
            candles_4h: &series,
            advisory: Some(&opinion),
        };
        let (outcome, _) = evaluate(&input, &cfg);
        assert!(matches!(
            outcome,
            StrategyOutcome::Rejected(r) if r.reason == RejectionReason::AdvisoryDirectionMismatch
        ));
    }

    #[test]
    fn relative_deviation_is_symmetric_absolute_fraction() {
        assert!((relative_deviation(110.0, 100.0) - 0.1).abs() < 1e-9);
        assert!((relative_deviation(90.0, 100.0) - 0.1).abs() < 1e-9);
    }
}
