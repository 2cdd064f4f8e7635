//! Pure time-series analytics over the price history ring.
//!
//! Everything here is a deterministic function of its inputs so the scorer
//! stays side-effect free and the math is unit-testable without feeds.

/// Logistic squash.
pub fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Log returns of consecutive points.
pub fn log_returns(prices: &[f64]) -> Vec<f64> {
    prices
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect()
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

fn variance(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64
}

/// Wilder RSI over the trailing `period` closes. Returns 50 when history is
/// too short to say anything.
pub fn rsi(prices: &[f64], period: usize) -> f64 {
    if prices.len() < period + 1 {
        return 50.0;
    }
    let tail = &prices[prices.len() - (period + 1)..];
    let mut gain = 0.0;
    let mut loss = 0.0;
    for w in tail.windows(2) {
        let d = w[1] - w[0];
        if d >= 0.0 {
            gain += d;
        } else {
            loss -= d;
        }
    }
    if loss <= 0.0 {
        return if gain > 0.0 { 100.0 } else { 50.0 };
    }
    let rs = (gain / period as f64) / (loss / period as f64);
    100.0 - 100.0 / (1.0 + rs)
}

/// Williams %R over the trailing `period` closes, in [-100, 0].
pub fn williams_r(prices: &[f64], period: usize) -> f64 {
    if prices.len() < period {
        return -50.0;
    }
    let tail = &prices[prices.len() - period..];
    let high = tail.iter().cloned().fold(f64::MIN, f64::max);
    let low = tail.iter().cloned().fold(f64::MAX, f64::min);
    let close = *tail.last().unwrap();
    if high <= low {
        return -50.0;
    }
    -100.0 * (high - close) / (high - low)
}

/// Variance ratio test statistic: Var(q-period returns) / (q * Var(1-period)).
/// > 1 suggests trending, < 1 mean reversion.
pub fn variance_ratio(prices: &[f64], q: usize) -> f64 {
    if q < 2 || prices.len() < q * 4 {
        return 1.0;
    }
    let r1 = log_returns(prices);
    if r1.len() < q * 2 {
        return 1.0;
    }
    let rq: Vec<f64> = prices
        .windows(q + 1)
        .filter(|w| w[0] > 0.0 && w[q] > 0.0)
        .map(|w| (w[q] / w[0]).ln())
        .collect();
    let v1 = variance(&r1);
    if v1 <= 0.0 {
        return 1.0;
    }
    variance(&rq) / (q as f64 * v1)
}

/// Lag-1 autocorrelation of log returns.
pub fn autocorr_lag1(prices: &[f64]) -> f64 {
    let r = log_returns(prices);
    if r.len() < 8 {
        return 0.0;
    }
    let m = mean(&r);
    let denom: f64 = r.iter().map(|x| (x - m).powi(2)).sum();
    if denom <= 0.0 {
        return 0.0;
    }
    let num: f64 = r.windows(2).map(|w| (w[0] - m) * (w[1] - m)).sum();
    (num / denom).clamp(-1.0, 1.0)
}

/// Z-score of the most recent short-window move against trailing vol.
/// Returns `(z, direction_sign)`; `|z|` large means a jump.
pub fn jump_z(prices: &[f64], window: usize) -> (f64, f64) {
    if prices.len() < window + 8 {
        return (0.0, 0.0);
    }
    let r = log_returns(prices);
    if r.len() < window + 4 {
        return (0.0, 0.0);
    }
    let (head, tail) = r.split_at(r.len() - window);
    let recent: f64 = tail.iter().sum();
    let sd = variance(head).sqrt() * (window as f64).sqrt();
    if sd <= 0.0 {
        return (0.0, 0.0);
    }
    let z = recent / sd;
    (z.abs(), z.signum())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(n: usize, start: f64, step: f64) -> Vec<f64> {
        (0..n).map(|i| start + step * i as f64).collect()
    }

    #[test]
    fn rsi_extremes() {
        let up = ramp(30, 100.0, 0.5);
        assert!(rsi(&up, 14) > 90.0);
        let down = ramp(30, 100.0, -0.5);
        assert!(rsi(&down, 14) < 10.0);
        assert_eq!(rsi(&[1.0, 2.0], 14), 50.0);
    }

    #[test]
    fn williams_r_range() {
        let up = ramp(20, 100.0, 1.0);
        // Close at the high of the window.
        assert!(williams_r(&up, 14) > -5.0);
        let down = ramp(20, 100.0, -1.0);
        assert!(williams_r(&down, 14) < -95.0);
    }

    #[test]
    fn variance_ratio_detects_trend() {
        let trend = ramp(200, 100.0, 0.3);
        assert!(variance_ratio(&trend, 4) > 1.0);

        // Alternating series mean-reverts.
        let mr: Vec<f64> = (0..200)
            .map(|i| if i % 2 == 0 { 100.0 } else { 100.5 })
            .collect();
        assert!(variance_ratio(&mr, 4) < 1.0);
    }

    #[test]
    fn autocorr_sign() {
        let trend = ramp(100, 100.0, 0.2);
        // Constant positive returns have ~zero variance; use alternation.
        let mr: Vec<f64> = (0..100)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        assert!(autocorr_lag1(&mr) < -0.5);
        let _ = trend;
    }

    #[test]
    fn jump_detection_fires_on_spike() {
        let mut prices = ramp(120, 100.0, 0.01);
        let last = *prices.last().unwrap();
        prices.push(last * 1.02);
        let (z, sign) = jump_z(&prices, 1);
        assert!(z > 3.0);
        assert!(sign > 0.0);
    }

    #[test]
    fn logistic_is_centered() {
        assert!((logistic(0.0) - 0.5).abs() < 1e-12);
        assert!(logistic(10.0) > 0.99);
    }
}
