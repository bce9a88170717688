// =============================================================================
// Market Data Types
// =============================================================================
//
// `Candle` is the one shared OHLCV representation the indicator library,
// the strategy evaluator, and the price-stream adapter all speak. It is a
// plain `f64` value type — conversions to `Decimal` happen once, at the
// exchange adapter boundary, when a candle is turned into a signal input.
// =============================================================================

pub mod candle_series;

pub use candle_series::CandleSeries;

/// One OHLCV bar. `is_closed` distinguishes a still-forming bar (the
/// websocket stream updates it in place) from a finalized one; strategy and
/// indicator code must only ever read closed bars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Candle {
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64, close_time: i64) -> Self {
        Self {
            open_time,
            close_time,
            open,
            high,
            low,
            close,
            volume,
            is_closed: true,
        }
    }

    /// True when the candle closed above where it opened.
    pub fn is_bullish_body(&self) -> bool {
        self.close > self.open
    }

    /// Lower shadow as a fraction of the candle's open price.
    pub fn lower_shadow_fraction(&self) -> f64 {
        if self.open == 0.0 {
            return 0.0;
        }
        (self.open.min(self.close) - self.low) / self.open
    }

    /// Upper shadow as a fraction of the candle's open price.
    pub fn upper_shadow_fraction(&self) -> f64 {
        if self.open == 0.0 {
            return 0.0;
        }
        (self.high - self.open.max(self.close)) / self.open
    }
}
