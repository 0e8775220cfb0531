/// indicators.rs — Rolling indicators and channel/pivot detection
///
/// ─────────────────────────────────────────────────────────────────────────
/// MATHEMATICAL SPECIFICATION
/// ─────────────────────────────────────────────────────────────────────────
///
/// All functions are stateless and operate on slices ending at a given
/// index, so the caller controls the window placement (no hidden
/// mutable cursor). OLS regression uses the centered-x trick for
/// numerical stability:
///
///   x_i = i - x̄,  x̄ = (n-1)/2
///   m̂ = Σ(x_i · y_i) / Σ(x_i²)
///   ĉ = ȳ - m̂ · x̄          (intercept at x = 0, i.e. window start)
///
/// The midline value at the *last* index of the window is:
///
///   mid = m̂ · (n - 1) + ĉ
///
/// `slope_norm = m̂ / mid` is the slope expressed as a fraction of price
/// level, which is what the strategy's slope-bound filters compare
/// against.
/// ─────────────────────────────────────────────────────────────────────────
use crate::error::{EngineError, Result};
use crate::types::Bar;

/// Mean of the last `period` values ending at `end_index` (inclusive).
pub fn sma(values: &[f64], period: usize, end_index: usize) -> Result<f64> {
    if period == 0 || end_index + 1 < period {
        return Err(EngineError::InsufficientData { need: period, have: end_index + 1 });
    }
    let start = end_index + 1 - period;
    let window = &values[start..=end_index];
    Ok(window.iter().sum::<f64>() / period as f64)
}

fn true_range(bar: &Bar, prev_close: f64) -> f64 {
    let a = bar.high - bar.low;
    let b = (bar.high - prev_close).abs();
    let c = (bar.low - prev_close).abs();
    a.max(b).max(c)
}

/// Mean of the last `period` True Ranges ending at `end_index`. Needs at
/// least `period + 1` bars since each TR needs a previous close.
pub fn atr(bars: &[Bar], period: usize, end_index: usize) -> Result<f64> {
    if period == 0 || end_index + 1 < period + 1 {
        return Err(EngineError::InsufficientData { need: period + 1, have: end_index + 1 });
    }
    let start = end_index + 1 - period;
    let mut total = 0.0;
    for i in start..=end_index {
        total += true_range(&bars[i], bars[i - 1].close);
    }
    Ok(total / period as f64)
}

/// Arithmetic mean of volume over the last `period` bars; absent volume
/// counts as zero (but still occupies a slot in the window).
pub fn avg_volume(bars: &[Bar], period: usize, end_index: usize) -> Result<f64> {
    if period == 0 || end_index + 1 < period {
        return Err(EngineError::InsufficientData { need: period, have: end_index + 1 });
    }
    let start = end_index + 1 - period;
    let total: f64 = bars[start..=end_index].iter().map(|b| b.volume.unwrap_or(0.0)).sum();
    Ok(total / period as f64)
}

fn sample_stdev(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / n as f64;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
    var.sqrt()
}

fn close_to_close_returns(closes: &[f64]) -> Vec<f64> {
    closes.windows(2).map(|w| w[1] / w[0] - 1.0).collect()
}

/// Short/long realized-volatility ratio from simple close-to-close
/// returns. Requires at least `long + 1` closes.
pub fn volatility_ratio(closes: &[f64], short: usize, long: usize) -> Result<(f64, f64, f64)> {
    if closes.len() < long + 1 {
        return Err(EngineError::InsufficientData { need: long + 1, have: closes.len() });
    }
    let all_returns = close_to_close_returns(closes);
    let short_returns = &all_returns[all_returns.len() - short..];
    let long_returns = &all_returns[all_returns.len() - long..];
    let short_vol = sample_stdev(short_returns);
    let long_vol = sample_stdev(long_returns);
    let ratio = if long_vol > 0.0 { short_vol / long_vol } else { 1.0 };
    Ok((short_vol, long_vol, ratio))
}

/// OLS fit of `window` against `x = 0..n-1`, via the centered-x form.
/// Returns `(m, c, slope_norm)` where `c` is the intercept at `x = 0`
/// and `mid = m*(n-1) + c` is the fitted value at the window's last
/// index. A degenerate (zero-variance-in-x, i.e. n < 2) window yields
/// slope 0 with `c` equal to the mean.
pub fn slope_of_closes(window: &[f64]) -> (f64, f64, f64) {
    let n = window.len();
    if n < 2 {
        let c = window.first().copied().unwrap_or(0.0);
        return (0.0, c, 0.0);
    }
    let x_bar = (n - 1) as f64 / 2.0;
    let y_bar = window.iter().sum::<f64>() / n as f64;

    let mut num = 0.0;
    let mut den = 0.0;
    for (i, &y) in window.iter().enumerate() {
        let xc = i as f64 - x_bar;
        num += xc * y;
        den += xc * xc;
    }
    let m = if den.abs() < 1e-12 { 0.0 } else { num / den };
    let c = y_bar - m * x_bar;
    let mid = m * (n - 1) as f64 + c;
    let slope_norm = if mid.abs() < 1e-12 { 0.0 } else { m / mid };
    (m, c, slope_norm)
}

/// A qualifying pivot low: index, price, and whether it met every
/// significance constraint (as opposed to being an argmin fallback).
#[derive(Debug, Clone, Copy)]
pub struct PivotLow {
    pub index: usize,
    pub price: f64,
    pub is_significant: bool,
}

/// Select the pivot low within `lows`/`highs` (same length, 0-based,
/// window-local indices).
///
/// A candidate at `j in [k, n-k-2]` qualifies when:
///   - `lows[j]` is strictly less than both k-neighborhoods around it,
///   - the prior drop `max(highs[0..=j]) / lows[j] - 1 >= drop_min`,
///   - the post-pivot rebound `min(lows[j+1 .. j+1+rebound_days]) > lows[j]`.
///
/// Ties among qualifiers break by price ascending, then index
/// descending (more recent wins). With no qualifier, falls back to the
/// global argmin of `lows` (marked non-significant) so a pivot is
/// always produced for a window of sufficient length.
pub fn pick_pivot_low(
    lows: &[f64],
    highs: &[f64],
    k: usize,
    drop_min: f64,
    rebound_days: usize,
) -> Option<PivotLow> {
    let n = lows.len();
    if n < 2 * k + 3 || n != highs.len() {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for j in k..=(n - k - 2) {
        let left_min = lows[j - k..j].iter().cloned().fold(f64::INFINITY, f64::min);
        let right_min = lows[j + 1..=j + k].iter().cloned().fold(f64::INFINITY, f64::min);
        if !(lows[j] < left_min && lows[j] < right_min) {
            continue;
        }
        let prior_high = highs[0..=j].iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if lows[j] <= 0.0 || prior_high / lows[j] - 1.0 < drop_min {
            continue;
        }
        let rebound_end = (j + 1 + rebound_days).min(n);
        if j + 1 >= rebound_end {
            continue;
        }
        let rebound_min = lows[j + 1..rebound_end].iter().cloned().fold(f64::INFINITY, f64::min);
        if rebound_min <= lows[j] {
            continue;
        }

        best = match best {
            None => Some((j, lows[j])),
            Some((bj, bp)) => {
                if lows[j] < bp || (lows[j] == bp && j > bj) {
                    Some((j, lows[j]))
                } else {
                    Some((bj, bp))
                }
            }
        };
    }

    if let Some((j, p)) = best {
        return Some(PivotLow { index: j, price: p, is_significant: true });
    }

    // Fallback: global argmin, not significant.
    let (j, &p) = lows
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
        .map(|(i, v)| (i, v))?;
    Some(PivotLow { index: j, price: p, is_significant: false })
}

/// Output of `find_channel`: a midline/band pair anchored at a pivot
/// low, plus the slope and volume-ratio context the strategy's filter
/// pipeline consumes.
#[derive(Debug, Clone, Copy)]
pub struct ChannelFit {
    pub mid: f64,
    pub lower: f64,
    pub upper: f64,
    pub slope_norm: f64,
    pub vol_ratio: f64,
    pub pivot_index: usize,
    pub pivot_is_significant: bool,
}

/// Fit a regression midline over `window_closes`, pick a pivot low from
/// `window_lows`/`window_highs`, and derive lower/upper bands as
/// mirror offsets from the midline anchored at the pivot.
///
/// The upper band mirrors the *lower* offset rather than being fit
/// independently — `upper = mid - (pivot_low - pivot_mid_y)` — which is
/// intentional for a lower-pivot-anchored channel and must be preserved
/// exactly (see `SPEC_FULL.md` §9).
pub fn find_channel(
    window_closes: &[f64],
    window_highs: &[f64],
    window_lows: &[f64],
    window_vols: &[f64],
    k: usize,
    drop_min: f64,
    rebound_days: usize,
) -> Result<ChannelFit> {
    let n = window_closes.len();
    if n == 0 || n != window_highs.len() || n != window_lows.len() {
        return Err(EngineError::InvalidInput("find_channel: mismatched window lengths".into()));
    }

    let (m, c, slope_norm) = slope_of_closes(window_closes);
    let mid = m * (n - 1) as f64 + c;

    let pivot = pick_pivot_low(window_lows, window_highs, k, drop_min, rebound_days)
        .ok_or_else(|| EngineError::InsufficientData { need: 2 * k + 3, have: n })?;

    // Midline value at the pivot's position, using the same fitted line.
    let pivot_mid_y = m * pivot.index as f64 + c;
    let offset = pivot.price - pivot_mid_y;
    let lower = mid + offset;
    let upper = mid - offset;

    let vol_mean = if window_vols.is_empty() {
        0.0
    } else {
        window_vols.iter().sum::<f64>() / window_vols.len() as f64
    };
    let last_vol = window_vols.last().copied().unwrap_or(0.0);
    let vol_ratio = if vol_mean > 0.0 { last_vol / vol_mean } else { 1.0 };

    Ok(ChannelFit {
        mid,
        lower,
        upper,
        slope_norm,
        vol_ratio,
        pivot_index: pivot.index,
        pivot_is_significant: pivot.is_significant,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(dt: (i32, u32, u32), o: f64, h: f64, l: f64, c: f64, v: f64, idx: usize) -> Bar {
        Bar::new(
            "X",
            NaiveDate::from_ymd_opt(dt.0, dt.1, dt.2).unwrap(),
            o, h, l, c, Some(v), idx,
        )
        .unwrap()
    }

    #[test]
    fn sma_insufficient_data() {
        let v = vec![1.0, 2.0, 3.0];
        assert!(sma(&v, 5, 2).is_err());
    }

    #[test]
    fn sma_basic() {
        let v = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&v, 3, 4).unwrap(), 4.0);
        assert_eq!(sma(&v, 5, 4).unwrap(), 3.0);
    }

    #[test]
    fn atr_needs_period_plus_one() {
        let bars: Vec<Bar> = (0..3)
            .map(|i| bar((2024, 1, 1 + i as u32), 10.0, 11.0, 9.0, 10.0, 100.0, i))
            .collect();
        assert!(atr(&bars, 3, 2).is_err());
    }

    #[test]
    fn slope_of_flat_series_is_zero() {
        let window = vec![10.0; 10];
        let (m, _c, slope_norm) = slope_of_closes(&window);
        assert_eq!(m, 0.0);
        assert_eq!(slope_norm, 0.0);
    }

    #[test]
    fn slope_of_rising_series_is_positive() {
        let window: Vec<f64> = (0..10).map(|i| 10.0 + i as f64).collect();
        let (m, _c, slope_norm) = slope_of_closes(&window);
        assert!(m > 0.0);
        assert!(slope_norm > 0.0);
    }

    #[test]
    fn pivot_low_v_shape() {
        // index:        0    1    2    3    4    5    6
        let lows =  vec![9.5, 9.0, 8.5, 8.0, 8.3, 8.8, 9.5];
        let highs = vec![10.5,10.0,9.5, 9.0, 9.3, 9.8,10.5];
        let pivot = pick_pivot_low(&lows, &highs, 2, 0.05, 2).expect("pivot found");
        assert_eq!(pivot.index, 3);
        assert!(pivot.is_significant);
    }

    #[test]
    fn pivot_low_none_for_short_window() {
        let lows = vec![9.0, 8.5, 8.0];
        let highs = vec![9.5, 9.0, 8.5];
        assert!(pick_pivot_low(&lows, &highs, 2, 0.05, 2).is_none());
    }

    #[test]
    fn find_channel_mirrors_offset() {
        let closes: Vec<f64> = vec![10.0, 9.5, 9.0, 8.6, 8.5, 8.8, 9.3, 9.8, 10.2, 10.5];
        let highs: Vec<f64> = closes.iter().map(|c| c + 0.5).collect();
        let lows: Vec<f64> = closes.iter().map(|c| c - 0.5).collect();
        let vols = vec![100.0; closes.len()];
        let fit = find_channel(&closes, &highs, &lows, &vols, 2, 0.01, 2).unwrap();
        let offset = fit.mid - fit.lower;
        assert!((fit.upper - (fit.mid - offset)).abs() < 1e-9);
    }
}
