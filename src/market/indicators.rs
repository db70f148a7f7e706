//! Indicator series computed locally from klines.
//!
//! Everything here is plain rolling arithmetic over the close/high/low
//! series; outputs are aligned so the last element corresponds to the last
//! kline.

use serde::{Deserialize, Serialize};

use super::Kline;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MacdSeries {
    pub macd: Vec<f64>,
    pub signal: Vec<f64>,
    pub histogram: Vec<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BollSeries {
    pub middle: Vec<f64>,
    pub upper: Vec<f64>,
    pub lower: Vec<f64>,
}

pub fn closes(klines: &[Kline]) -> Vec<f64> {
    klines.iter().map(|k| k.close).collect()
}

/// Exponential moving average, seeded with the first value.
pub fn ema(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 {
        return Vec::new();
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut out = Vec::with_capacity(values.len());
    let mut prev = values[0];
    out.push(prev);
    for &v in &values[1..] {
        prev = v * k + prev * (1.0 - k);
        out.push(prev);
    }
    out
}

/// Simple moving average; the first `period - 1` slots repeat the partial mean.
pub fn sma(values: &[f64], period: usize) -> Vec<f64> {
    if values.is_empty() || period == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(values.len());
    let mut sum = 0.0;
    for (i, &v) in values.iter().enumerate() {
        sum += v;
        if i >= period {
            sum -= values[i - period];
        }
        let n = (i + 1).min(period);
        out.push(sum / n as f64);
    }
    out
}

/// MACD(12, 26, 9) over closes.
pub fn macd(values: &[f64]) -> MacdSeries {
    if values.is_empty() {
        return MacdSeries::default();
    }
    let fast = ema(values, 12);
    let slow = ema(values, 26);
    let macd_line: Vec<f64> = fast.iter().zip(&slow).map(|(f, s)| f - s).collect();
    let signal = ema(&macd_line, 9);
    let histogram = macd_line.iter().zip(&signal).map(|(m, s)| m - s).collect();
    MacdSeries {
        macd: macd_line,
        signal,
        histogram,
    }
}

/// Wilder-smoothed RSI. Values before `period` warm-up are emitted as 50.
pub fn rsi(values: &[f64], period: usize) -> Vec<f64> {
    if values.len() < 2 || period == 0 {
        return vec![50.0; values.len()];
    }
    let mut out = vec![50.0; values.len()];
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for i in 1..values.len() {
        let delta = values[i] - values[i - 1];
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        if i <= period {
            avg_gain += gain / period as f64;
            avg_loss += loss / period as f64;
            if i < period {
                continue;
            }
        } else {
            avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
            avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        }

        out[i] = if avg_loss <= f64::EPSILON {
            100.0
        } else {
            100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
        };
    }
    out
}

/// Wilder-smoothed average true range.
pub fn atr(klines: &[Kline], period: usize) -> Vec<f64> {
    if klines.is_empty() || period == 0 {
        return Vec::new();
    }
    let mut trs = Vec::with_capacity(klines.len());
    for (i, k) in klines.iter().enumerate() {
        let tr = if i == 0 {
            k.high - k.low
        } else {
            let prev_close = klines[i - 1].close;
            (k.high - k.low)
                .max((k.high - prev_close).abs())
                .max((k.low - prev_close).abs())
        };
        trs.push(tr);
    }

    let mut out = Vec::with_capacity(trs.len());
    let mut prev = trs[0];
    out.push(prev);
    for &tr in &trs[1..] {
        prev = (prev * (period as f64 - 1.0) + tr) / period as f64;
        out.push(prev);
    }
    out
}

/// Bollinger bands: SMA(20) ± 2 population standard deviations.
pub fn boll(values: &[f64], period: usize, k: f64) -> BollSeries {
    if values.is_empty() || period == 0 {
        return BollSeries::default();
    }
    let middle = sma(values, period);
    let mut upper = Vec::with_capacity(values.len());
    let mut lower = Vec::with_capacity(values.len());
    for i in 0..values.len() {
        let start = i.saturating_sub(period - 1);
        let window = &values[start..=i];
        let mean = middle[i];
        let var =
            window.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / window.len() as f64;
        let sd = var.sqrt();
        upper.push(mean + k * sd);
        lower.push(mean - k * sd);
    }
    BollSeries {
        middle,
        upper,
        lower,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kline(h: f64, l: f64, c: f64) -> Kline {
        Kline {
            high: h,
            low: l,
            close: c,
            open: c,
            ..Default::default()
        }
    }

    #[test]
    fn ema_converges_to_constant_series() {
        let values = vec![10.0; 50];
        let out = ema(&values, 20);
        assert_eq!(out.len(), 50);
        assert!((out[49] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn sma_window() {
        let out = sma(&[1.0, 2.0, 3.0, 4.0, 5.0], 3);
        assert_eq!(out, vec![1.0, 1.5, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn rsi_all_gains_saturates() {
        let values: Vec<f64> = (0..40).map(|i| 100.0 + i as f64).collect();
        let out = rsi(&values, 14);
        assert!((out[39] - 100.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_alternating_is_balanced() {
        let mut values = Vec::new();
        for i in 0..60 {
            values.push(if i % 2 == 0 { 100.0 } else { 101.0 });
        }
        let out = rsi(&values, 14);
        // symmetric gains and losses keep RSI near 50
        assert!((out[59] - 50.0).abs() < 10.0);
    }

    #[test]
    fn atr_flat_market_is_range() {
        let klines: Vec<Kline> = (0..30).map(|_| kline(101.0, 99.0, 100.0)).collect();
        let out = atr(&klines, 14);
        assert!((out[29] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn boll_bands_bracket_mean() {
        let values: Vec<f64> = (0..40).map(|i| 100.0 + (i % 5) as f64).collect();
        let out = boll(&values, 20, 2.0);
        for i in 0..values.len() {
            assert!(out.lower[i] <= out.middle[i] && out.middle[i] <= out.upper[i]);
        }
    }

    #[test]
    fn macd_lengths_match() {
        let values: Vec<f64> = (0..100).map(|i| (i as f64).sin() + 100.0).collect();
        let out = macd(&values);
        assert_eq!(out.macd.len(), 100);
        assert_eq!(out.signal.len(), 100);
        assert_eq!(out.histogram.len(), 100);
    }
}
