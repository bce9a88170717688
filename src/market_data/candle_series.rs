// =============================================================================
// Candle Series — fixed-capacity ring buffer of closed OHLCV bars
// =============================================================================
//
// A thin helper around a bounded `VecDeque<Candle>`. The strategy evaluator
// uses one per (symbol, timeframe) to hold the last-closed-bar window it
// fetched from the exchange adapter before handing it to the indicator
// library. Oldest-first ordering is preserved throughout.
// =============================================================================

use std::collections::VecDeque;

use super::Candle;

#[derive(Debug, Clone)]
pub struct CandleSeries {
    capacity: usize,
    candles: VecDeque<Candle>,
}

impl CandleSeries {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            candles: VecDeque::with_capacity(capacity),
        }
    }

    /// Replace the whole series with a freshly-fetched slice of closed
    /// candles, oldest first. Truncates to `capacity` most-recent bars.
    pub fn replace(&mut self, candles: Vec<Candle>) {
        self.candles.clear();
        let start = candles.len().saturating_sub(self.capacity);
        self.candles.extend(candles.into_iter().skip(start));
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.back()
    }

    pub fn as_slice(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }

    pub fn volumes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.volume).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(close: f64) -> Candle {
        Candle::new(0, close, close, close, close, 1.0, 0)
    }

    #[test]
    fn replace_truncates_to_capacity() {
        let mut series = CandleSeries::with_capacity(3);
        series.replace((1..=10).map(|i| candle(i as f64)).collect());
        assert_eq!(series.len(), 3);
        assert_eq!(series.closes(), vec![8.0, 9.0, 10.0]);
    }

    #[test]
    fn empty_series_has_no_last() {
        let series = CandleSeries::with_capacity(5);
        assert!(series.last().is_none());
        assert!(series.is_empty());
    }
}
