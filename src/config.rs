// =============================================================================
// Runtime Configuration — persisted, patchable, reloaded into the engine
// =============================================================================
//
// `Config` is loaded once at boot from `config.json` and thereafter mutated
// only through `apply_patch`, which deep-merges a partial JSON document,
// validates the result, and persists atomically (write to `.tmp`, then
// rename) before the new value is installed. A missing or malformed file
// never aborts startup: we fall back to `Config::default()` and log a
// warning, per the Persistence/Config rows of the error table.
// =============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config patch left symbols empty")]
    EmptySymbols,
    #[error("config patch has a non-positive interval: {0}")]
    NonPositiveInterval(&'static str),
    #[error("config patch has an out-of-range threshold: {0}")]
    OutOfRangeThreshold(&'static str),
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to persist config: {0}")]
    Io(#[from] std::io::Error),
}

fn default_true() -> bool {
    true
}

fn default_leverage() -> u32 {
    10
}

fn default_scan_interval() -> u64 {
    60
}

fn default_position_scan_interval() -> u64 {
    15
}

fn default_cooldown_interval() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicLeverageConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_leverage")]
    pub min: u32,
    #[serde(default = "default_dynamic_leverage_max")]
    pub max: u32,
    #[serde(default = "default_leverage")]
    pub base: u32,
    #[serde(default)]
    pub risk_multiplier: RiskMultiplierConfig,
}

fn default_dynamic_leverage_max() -> u32 {
    20
}

impl Default for DynamicLeverageConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min: default_leverage(),
            max: default_dynamic_leverage_max(),
            base: default_leverage(),
            risk_multiplier: RiskMultiplierConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskMultiplierConfig {
    #[serde(default = "default_risk_mult_low")]
    pub low: f64,
    #[serde(default = "default_risk_mult_medium")]
    pub medium: f64,
    #[serde(default = "default_risk_mult_high")]
    pub high: f64,
}

fn default_risk_mult_low() -> f64 {
    1.2
}
fn default_risk_mult_medium() -> f64 {
    1.0
}
fn default_risk_mult_high() -> f64 {
    0.6
}

impl Default for RiskMultiplierConfig {
    fn default() -> Self {
        Self {
            low: default_risk_mult_low(),
            medium: default_risk_mult_medium(),
            high: default_risk_mult_high(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_daily_loss_threshold")]
    pub daily_loss_threshold_pct: f64,
    #[serde(default = "default_consecutive_losses_threshold")]
    pub consecutive_losses_threshold: u32,
}

fn default_daily_loss_threshold() -> f64 {
    5.0
}
fn default_consecutive_losses_threshold() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            daily_loss_threshold_pct: default_daily_loss_threshold(),
            consecutive_losses_threshold: default_consecutive_losses_threshold(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimeOfDay {
    #[serde(default)]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RsiExtremeConfig {
    #[serde(default = "default_rsi_extreme_long")]
    pub long: f64,
    #[serde(default = "default_rsi_extreme_short")]
    pub short: f64,
}

fn default_rsi_extreme_long() -> f64 {
    75.0
}
fn default_rsi_extreme_short() -> f64 {
    25.0
}

impl Default for RsiExtremeConfig {
    fn default() -> Self {
        Self {
            long: default_rsi_extreme_long(),
            short: default_rsi_extreme_short(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfitConfig {
    #[serde(default = "default_tp1_rr")]
    pub tp1_rr: f64,
    #[serde(default = "default_tp2_rr")]
    pub tp2_rr: f64,
    #[serde(default)]
    pub rsi_extreme: RsiExtremeConfig,
    #[serde(default = "default_adx_decrease_threshold")]
    pub adx_decrease_threshold: f64,
}

fn default_tp1_rr() -> f64 {
    1.0
}
fn default_tp2_rr() -> f64 {
    2.0
}
fn default_adx_decrease_threshold() -> f64 {
    8.0
}

impl Default for TakeProfitConfig {
    fn default() -> Self {
        Self {
            tp1_rr: default_tp1_rr(),
            tp2_rr: default_tp2_rr(),
            rsi_extreme: RsiExtremeConfig::default(),
            adx_decrease_threshold: default_adx_decrease_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default = "default_force_liquidate_time")]
    pub force_liquidate_time: TimeOfDay,
    #[serde(default)]
    pub take_profit: TakeProfitConfig,
    #[serde(default = "default_daily_trade_limit")]
    pub daily_trade_limit: u32,
}

fn default_force_liquidate_time() -> TimeOfDay {
    TimeOfDay { hour: 23, minute: 45 }
}
fn default_daily_trade_limit() -> u32 {
    10
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            force_liquidate_time: default_force_liquidate_time(),
            take_profit: TakeProfitConfig::default(),
            daily_trade_limit: default_daily_trade_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub max_risk_level: crate::types::RiskLevel,
    #[serde(default = "default_true")]
    pub use_for_entry: bool,
    #[serde(default)]
    pub use_for_exit: bool,
    #[serde(default = "default_cache_duration_minutes")]
    pub cache_duration_minutes: u64,
}

fn default_min_confidence() -> f64 {
    60.0
}
fn default_cache_duration_minutes() -> u64 {
    10
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_confidence: default_min_confidence(),
            max_risk_level: crate::types::RiskLevel::Medium,
            use_for_entry: true,
            use_for_exit: false,
            cache_duration_minutes: default_cache_duration_minutes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingStopConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_activation_ratio")]
    pub activation_ratio: f64,
    #[serde(default = "default_trailing_distance_atr_mult")]
    pub trailing_distance_atr_mult: f64,
    #[serde(default = "default_update_interval_seconds")]
    pub update_interval_seconds: u64,
}

fn default_activation_ratio() -> f64 {
    0.5
}
fn default_trailing_distance_atr_mult() -> f64 {
    1.2
}
fn default_update_interval_seconds() -> u64 {
    30
}

impl Default for TrailingStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            activation_ratio: default_activation_ratio(),
            trailing_distance_atr_mult: default_trailing_distance_atr_mult(),
            update_interval_seconds: default_update_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectionEntryConfig {
    #[serde(default = "default_ema_deviation_threshold")]
    pub ema_deviation_threshold: f64,
    #[serde(default = "default_rsi_min")]
    pub rsi_min: f64,
    #[serde(default = "default_rsi_max")]
    pub rsi_max: f64,
    #[serde(default = "default_candle_shadow_threshold")]
    pub candle_shadow_threshold: f64,
    #[serde(default)]
    pub volume_confirmation: bool,
    #[serde(default = "default_volume_ema_period")]
    pub volume_ema_period: usize,
    #[serde(default = "default_volume_ema_multiplier")]
    pub volume_ema_multiplier: f64,
}

fn default_ema_deviation_threshold() -> f64 {
    0.006
}
fn default_rsi_min() -> f64 {
    35.0
}
fn default_rsi_max() -> f64 {
    65.0
}
fn default_candle_shadow_threshold() -> f64 {
    0.25
}
fn default_volume_ema_period() -> usize {
    20
}
fn default_volume_ema_multiplier() -> f64 {
    1.2
}

impl Default for DirectionEntryConfig {
    fn default() -> Self {
        Self {
            ema_deviation_threshold: default_ema_deviation_threshold(),
            rsi_min: default_rsi_min(),
            rsi_max: default_rsi_max(),
            candle_shadow_threshold: default_candle_shadow_threshold(),
            volume_confirmation: false,
            volume_ema_period: default_volume_ema_period(),
            volume_ema_multiplier: default_volume_ema_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorsConfig {
    #[serde(default = "default_adx_threshold")]
    pub adx_15m_threshold: f64,
    #[serde(default = "default_adx_threshold")]
    pub adx_1h_threshold: f64,
    #[serde(default = "default_adx_threshold")]
    pub adx_4h_threshold: f64,
    #[serde(default)]
    pub long: DirectionEntryConfig,
    #[serde(default)]
    pub short: DirectionEntryConfig,
}

fn default_adx_threshold() -> f64 {
    25.0
}

impl Default for IndicatorsConfig {
    fn default() -> Self {
        Self {
            adx_15m_threshold: default_adx_threshold(),
            adx_1h_threshold: default_adx_threshold(),
            adx_4h_threshold: default_adx_threshold(),
            long: DirectionEntryConfig::default(),
            short: DirectionEntryConfig::default(),
        }
    }
}

/// Top-level persisted, patchable engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_symbols")]
    pub symbols: HashSet<String>,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    #[serde(default)]
    pub dynamic_leverage: DynamicLeverageConfig,
    #[serde(default = "default_max_risk_percentage")]
    pub max_risk_percentage: f64,
    #[serde(default = "default_stop_loss_atr_multiplier")]
    pub stop_loss_atr_multiplier: f64,
    #[serde(default = "default_max_stop_loss_percentage")]
    pub max_stop_loss_percentage: f64,
    #[serde(default = "default_position_timeout_hours")]
    pub position_timeout_hours: f64,
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    #[serde(default = "default_position_scan_interval")]
    pub position_scan_interval: u64,
    #[serde(default = "default_cooldown_interval")]
    pub trade_cooldown_interval: u64,
    #[serde(default)]
    pub risk_config: RiskConfig,
    #[serde(default)]
    pub ai_config: AiConfig,
    #[serde(default)]
    pub trailing_stop: TrailingStopConfig,
    #[serde(default)]
    pub indicators_config: IndicatorsConfig,
    /// Explicit local-time offset (minutes east of UTC) used for the daily
    /// reset and forced-liquidate windows. Never derived from process
    /// locale.
    #[serde(default)]
    pub local_utc_offset_minutes: i32,
    /// Absolute minimum equity (quote units) required to open a position.
    #[serde(default = "default_min_equity_floor")]
    pub min_equity_floor: Decimal,
    /// Exchange-side minimum notional fallback if `lotPrecision`/
    /// `minNotional` cannot be fetched for a symbol.
    #[serde(default = "default_min_notional_floor")]
    pub min_notional_floor: Decimal,
}

fn default_symbols() -> HashSet<String> {
    let mut set = HashSet::new();
    set.insert("BTC/USDT".to_string());
    set
}

fn default_max_risk_percentage() -> f64 {
    1.0
}
fn default_stop_loss_atr_multiplier() -> f64 {
    1.5
}
fn default_max_stop_loss_percentage() -> f64 {
    2.0
}
fn default_position_timeout_hours() -> f64 {
    24.0
}
fn default_min_equity_floor() -> Decimal {
    dec!(120)
}
fn default_min_notional_floor() -> Decimal {
    dec!(20)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            leverage: default_leverage(),
            dynamic_leverage: DynamicLeverageConfig::default(),
            max_risk_percentage: default_max_risk_percentage(),
            stop_loss_atr_multiplier: default_stop_loss_atr_multiplier(),
            max_stop_loss_percentage: default_max_stop_loss_percentage(),
            position_timeout_hours: default_position_timeout_hours(),
            scan_interval: default_scan_interval(),
            position_scan_interval: default_position_scan_interval(),
            trade_cooldown_interval: default_cooldown_interval(),
            risk_config: RiskConfig::default(),
            ai_config: AiConfig::default(),
            trailing_stop: TrailingStopConfig::default(),
            indicators_config: IndicatorsConfig::default(),
            local_utc_offset_minutes: 0,
            min_equity_floor: default_min_equity_floor(),
            min_notional_floor: default_min_notional_floor(),
        }
    }
}

impl Config {
    /// Load from `path`, falling back to (and writing out) defaults on a
    /// missing or malformed file. Never fails startup over a corrupt file.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Config>(&raw) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!(error = %err, path = %path.display(), "config.json malformed — falling back to defaults");
                    let cfg = Config::default();
                    let _ = cfg.save(path);
                    cfg
                }
            },
            Err(_) => {
                info!(path = %path.display(), "no config.json found — writing defaults");
                let cfg = Config::default();
                let _ = cfg.save(path);
                cfg
            }
        }
    }

    /// Atomic whole-file write: serialize to `<path>.tmp`, then rename over
    /// `path`. A crash mid-write leaves the previous file intact.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let tmp_path: PathBuf = {
            let mut p = path.to_path_buf();
            let file_name = format!("{}.tmp", path.file_name().and_then(|n| n.to_str()).unwrap_or("config.json"));
            p.set_file_name(file_name);
            p
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Deep-merge a partial JSON patch over the current config, validate
    /// invariants, and return the merged result without mutating `self` —
    /// callers persist only after validation passes.
    pub fn with_patch(&self, patch: &serde_json::Value) -> Result<Config, ConfigError> {
        let mut current = serde_json::to_value(self)?;
        merge_json(&mut current, patch);
        let merged: Config = serde_json::from_value(current)?;
        merged.validate()?;
        Ok(merged)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::EmptySymbols);
        }
        if self.scan_interval == 0 {
            return Err(ConfigError::NonPositiveInterval("scanInterval"));
        }
        if self.position_scan_interval == 0 {
            return Err(ConfigError::NonPositiveInterval("positionScanInterval"));
        }
        if self.trade_cooldown_interval == 0 {
            return Err(ConfigError::NonPositiveInterval("tradeCooldownInterval"));
        }
        if !(0.0..=100.0).contains(&self.max_risk_percentage) {
            return Err(ConfigError::OutOfRangeThreshold("maxRiskPercentage"));
        }
        if !(0.0..=100.0).contains(&self.max_stop_loss_percentage) {
            return Err(ConfigError::OutOfRangeThreshold("maxStopLossPercentage"));
        }
        Ok(())
    }
}

/// Recursive JSON merge: objects merge key-by-key, everything else (including
/// arrays) is replaced wholesale by the patch value.
fn merge_json(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                merge_json(base_map.entry(k.clone()).or_insert(serde_json::Value::Null), v);
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn patch_rejects_empty_symbols() {
        let cfg = Config::default();
        let patch = json!({ "symbols": [] });
        let err = cfg.with_patch(&patch).unwrap_err();
        assert!(matches!(err, ConfigError::EmptySymbols));
    }

    #[test]
    fn patch_deep_merges_nested_fields_without_clobbering_siblings() {
        let cfg = Config::default();
        // field names are snake_case in our struct; a patch uses the same
        // keys serde emits (snake_case, since no rename attrs are applied).
        let patch = json!({ "risk_config": { "daily_trade_limit": 3u32 } });
        let merged = cfg.with_patch(&patch).unwrap();
        assert_eq!(merged.risk_config.daily_trade_limit, 3);
        // sibling field survives the merge untouched.
        assert_eq!(
            merged.risk_config.circuit_breaker.consecutive_losses_threshold,
            cfg.risk_config.circuit_breaker.consecutive_losses_threshold
        );
    }

    #[test]
    fn patch_rejects_zero_scan_interval() {
        let cfg = Config::default();
        let patch = json!({ "scan_interval": 0u64 });
        let err = cfg.with_patch(&patch).unwrap_err();
        assert!(matches!(err, ConfigError::NonPositiveInterval(_)));
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = std::env::temp_dir().join(format!("meridian-cfg-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        let cfg = Config::default();
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path);
        assert_eq!(loaded.leverage, cfg.leverage);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn load_falls_back_to_defaults_on_malformed_json() {
        let dir = std::env::temp_dir().join(format!("meridian-cfg-test-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, "{ not valid json").unwrap();
        let loaded = Config::load(&path);
        assert_eq!(loaded.leverage, Config::default().leverage);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
