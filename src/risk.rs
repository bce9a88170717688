// =============================================================================
// Risk Controller — pure circuit-breaker predicates + daily reset
// =============================================================================
//
// Unlike earlier incarnations of this codebase, the risk controller owns no
// state of its own: `State` (see `state_store.rs`) is the single
// serialization point, and every function here is a pure predicate over
// values the caller reads from it. This keeps the breaker logic trivially
// unit-testable and keeps the latching invariant enforceable by inspection
// — nothing can trip or clear a breaker except the two functions below.
// =============================================================================

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::warn;

use crate::config::{Config, RiskConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerTrip {
    pub reason: String,
}

/// `checkCircuitBreaker`: trips on either a daily-loss percentage breach
/// or a consecutive-loss-count breach.
pub fn check_circuit_breaker(
    daily_pnl: Decimal,
    consecutive_losses: u32,
    equity: Decimal,
    cfg: &RiskConfig,
) -> Option<CircuitBreakerTrip> {
    if equity > Decimal::ZERO && daily_pnl < Decimal::ZERO {
        let loss_pct = (-daily_pnl / equity) * Decimal::from(100);
        if loss_pct >= Decimal::from_f64(cfg.circuit_breaker.daily_loss_threshold_pct).unwrap_or(Decimal::MAX) {
            let reason = format!(
                "daily loss {loss_pct:.2}% exceeds threshold {:.2}%",
                cfg.circuit_breaker.daily_loss_threshold_pct
            );
            warn!(%reason, "circuit breaker tripped: daily loss");
            return Some(CircuitBreakerTrip { reason });
        }
    }

    if consecutive_losses >= cfg.circuit_breaker.consecutive_losses_threshold {
        let reason = format!(
            "{consecutive_losses} consecutive losses reached threshold {}",
            cfg.circuit_breaker.consecutive_losses_threshold
        );
        warn!(%reason, "circuit breaker tripped: consecutive losses");
        return Some(CircuitBreakerTrip { reason });
    }

    None
}

/// `shouldForceLiquidate`: true during the minute range
/// `[forceLiquidateTime, end-of-hour]` of local time, where "local" is the
/// explicit `local_utc_offset_minutes` configured offset — never process
/// locale.
pub fn should_force_liquidate(now_utc: chrono::DateTime<Utc>, cfg: &Config) -> bool {
    let local = now_utc + ChronoDuration::minutes(cfg.local_utc_offset_minutes as i64);
    let time = local.time();
    let target = &cfg.risk_config.force_liquidate_time;
    let start = chrono::NaiveTime::from_hms_opt(target.hour, target.minute, 0).unwrap_or(chrono::NaiveTime::MIN);
    if target.hour >= 24 {
        return false;
    }
    let end_of_hour = chrono::NaiveTime::from_hms_opt(target.hour, 59, 59).unwrap_or(chrono::NaiveTime::MIN);
    time >= start && time <= end_of_hour
}

/// `shouldResetDailyState`.
pub fn should_reset_daily_state(last_reset_date: &str, now_utc: chrono::DateTime<Utc>, cfg: &Config) -> bool {
    local_date_string(now_utc, cfg) != last_reset_date
}

/// `checkDailyTradeLimit`.
pub fn check_daily_trade_limit(today_trades: u32, cfg: &RiskConfig) -> bool {
    today_trades < cfg.daily_trade_limit
}

/// `cooldownElapsed`. `last_trade_time` and `now` are Unix
/// milliseconds; `0` means "no trade yet", which is always cooldown-elapsed.
pub fn cooldown_elapsed(last_trade_time_ms: i64, trade_cooldown_interval_secs: u64, now_ms: i64) -> bool {
    if last_trade_time_ms <= 0 {
        return true;
    }
    now_ms - last_trade_time_ms >= (trade_cooldown_interval_secs as i64) * 1000
}

/// The local calendar date (`YYYY-MM-DD`) under the configured explicit
/// offset, used both by daily-reset and by `State.last_reset_date`.
pub fn local_date_string(now_utc: chrono::DateTime<Utc>, cfg: &Config) -> String {
    let local = now_utc + ChronoDuration::minutes(cfg.local_utc_offset_minutes as i64);
    local.format("%Y-%m-%d").to_string()
}

pub fn parse_local_date(date: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn cfg() -> Config {
        Config::default()
    }

    #[test]
    fn circuit_breaker_trips_on_daily_loss_threshold() {
        let risk_cfg = cfg().risk_config;
        let trip = check_circuit_breaker(dec!(-60), 0, dec!(1000), &risk_cfg);
        assert!(trip.is_some());
    }

    #[test]
    fn circuit_breaker_clear_below_threshold() {
        let risk_cfg = cfg().risk_config;
        let trip = check_circuit_breaker(dec!(-10), 0, dec!(1000), &risk_cfg);
        assert!(trip.is_none());
    }

    #[test]
    fn circuit_breaker_trips_on_consecutive_losses() {
        let risk_cfg = cfg().risk_config;
        let trip = check_circuit_breaker(dec!(5), 3, dec!(1000), &risk_cfg);
        assert!(trip.is_some());
    }

    #[test]
    fn daily_trade_limit_respected() {
        let risk_cfg = cfg().risk_config;
        assert!(check_daily_trade_limit(risk_cfg.daily_trade_limit - 1, &risk_cfg));
        assert!(!check_daily_trade_limit(risk_cfg.daily_trade_limit, &risk_cfg));
    }

    #[test]
    fn cooldown_elapsed_true_when_no_prior_trade() {
        assert!(cooldown_elapsed(0, 300, 1_000_000));
    }

    #[test]
    fn cooldown_not_elapsed_immediately_after_trade() {
        assert!(!cooldown_elapsed(1_000_000, 300, 1_000_500));
    }

    #[test]
    fn cooldown_elapsed_after_interval() {
        assert!(cooldown_elapsed(1_000_000, 300, 1_000_000 + 300_000));
    }

    #[test]
    fn should_reset_daily_state_on_date_change() {
        let c = cfg();
        let now = Utc.with_ymd_and_hms(2026, 7, 26, 10, 0, 0).unwrap();
        assert!(should_reset_daily_state("2026-07-25", now, &c));
        assert!(!should_reset_daily_state("2026-07-26", now, &c));
    }
}
