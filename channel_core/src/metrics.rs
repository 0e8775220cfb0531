/// metrics.rs — Performance statistics computed from an equity curve and
/// a trade list.
///
/// Every ratio here is a plain closed-form reduction over `returns`
/// (daily, simple, not log) or over `Trade`s. Nothing here reads bars or
/// touches the broker — `compute_metrics` is a pure function of its two
/// inputs so it's trivial to unit test against hand-built curves.
use chrono::Datelike;
use serde::{Deserialize, Serialize};

use crate::types::{EquityPoint, Trade};

const TRADING_DAYS_PER_YEAR: f64 = 252.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct DrawdownInfo {
    pub max_drawdown: f64,
    pub peak_index: usize,
    pub trough_index: usize,
    pub duration_days: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TradeStats {
    pub total_trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub win_loss_ratio: f64,
    pub avg_r_multiple: f64,
    pub expectancy: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub total_return: f64,
    pub cagr: f64,
    pub annual_return: f64,
    pub volatility: f64,
    pub downside_volatility: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub k_ratio: f64,
    pub tail_ratio: f64,
    pub drawdown: DrawdownInfo,
    pub trades: TradeStats,
    pub monthly_returns: Vec<(String, f64)>,
    pub profitable_days: usize,
    pub losing_days: usize,
    pub best_day: f64,
    pub worst_day: f64,
}

fn daily_returns(curve: &[EquityPoint]) -> Vec<f64> {
    curve.iter().skip(1).map(|p| p.returns).collect()
}

fn mean(xs: &[f64]) -> f64 {
    if xs.is_empty() {
        0.0
    } else {
        xs.iter().sum::<f64>() / xs.len() as f64
    }
}

/// Sample standard deviation (ddof = 1); zero for fewer than 2 points.
fn sample_stdev(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let m = mean(xs);
    let var = xs.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (xs.len() - 1) as f64;
    var.sqrt()
}

fn max_drawdown(curve: &[EquityPoint]) -> DrawdownInfo {
    let mut peak = curve.first().map(|p| p.equity).unwrap_or(0.0);
    let mut peak_index = 0usize;
    let mut current_dd_start = 0usize;

    let mut worst = DrawdownInfo::default();

    for (i, point) in curve.iter().enumerate() {
        if point.equity > peak {
            peak = point.equity;
            peak_index = i;
            current_dd_start = i;
        }
        if peak > 0.0 {
            let dd = (peak - point.equity) / peak;
            if dd > worst.max_drawdown {
                worst.max_drawdown = dd;
                worst.peak_index = peak_index;
                worst.trough_index = i;
                worst.duration_days = (curve[i].dt - curve[current_dd_start].dt).num_days();
            }
        }
    }
    worst
}

fn cagr(curve: &[EquityPoint]) -> f64 {
    let (Some(first), Some(last)) = (curve.first(), curve.last()) else {
        return 0.0;
    };
    if first.equity <= 0.0 {
        return 0.0;
    }
    let years = (last.dt - first.dt).num_days() as f64 / 365.25;
    if years <= 0.0 {
        return 0.0;
    }
    (last.equity / first.equity).powf(1.0 / years) - 1.0
}

fn simple_annual_return(curve: &[EquityPoint]) -> f64 {
    let (Some(first), Some(last)) = (curve.first(), curve.last()) else {
        return 0.0;
    };
    if first.equity <= 0.0 {
        return 0.0;
    }
    let total = last.equity / first.equity - 1.0;
    let years = (last.dt - first.dt).num_days() as f64 / 365.25;
    if years <= 0.0 {
        0.0
    } else {
        total / years
    }
}

/// OLS slope of the cumulative-return curve against its index, scaled
/// by 1000.
fn k_ratio(curve: &[EquityPoint]) -> f64 {
    if curve.len() < 2 {
        return 0.0;
    }
    let first_equity = curve[0].equity;
    if first_equity <= 0.0 {
        return 0.0;
    }
    let cum: Vec<f64> = curve.iter().map(|p| p.equity / first_equity - 1.0).collect();
    let n = cum.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = mean(&cum);
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in cum.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den == 0.0 {
        return 0.0;
    }
    (num / den) * 1000.0
}

fn tail_ratio(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let tail_n = ((sorted.len() as f64 * 0.10).ceil() as usize).max(1);
    let best_avg = mean(&sorted[sorted.len() - tail_n..]);
    let worst_avg = mean(&sorted[..tail_n]);
    if worst_avg == 0.0 {
        return if best_avg > 0.0 { f64::INFINITY } else { 0.0 };
    }
    (best_avg / worst_avg.abs()).abs()
}

fn monthly_returns(curve: &[EquityPoint]) -> Vec<(String, f64)> {
    let mut out = Vec::new();
    let mut start_equity = match curve.first() {
        Some(p) => p.equity,
        None => return out,
    };
    let mut current_key = curve[0].dt.format("%Y-%m").to_string();
    for pair in curve.windows(2) {
        let key = pair[1].dt.format("%Y-%m").to_string();
        if key != current_key {
            let prev_close = pair[0].equity;
            if start_equity > 0.0 {
                out.push((current_key.clone(), prev_close / start_equity - 1.0));
            }
            start_equity = prev_close;
            current_key = key;
        }
    }
    if let Some(last) = curve.last() {
        if start_equity > 0.0 {
            out.push((current_key, last.equity / start_equity - 1.0));
        }
    }
    out
}

fn trade_stats(trades: &[Trade]) -> TradeStats {
    if trades.is_empty() {
        return TradeStats::default();
    }
    let wins: Vec<f64> = trades.iter().filter(|t| t.is_winning()).map(|t| t.pnl).collect();
    let losses: Vec<f64> = trades.iter().filter(|t| !t.is_winning()).map(|t| t.pnl).collect();

    let win_rate = wins.len() as f64 / trades.len() as f64;
    let gross_profit: f64 = wins.iter().sum();
    let gross_loss: f64 = losses.iter().sum::<f64>().abs();
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else if gross_profit > 0.0 {
        f64::INFINITY
    } else {
        0.0
    };
    let avg_win = mean(&wins);
    let avg_loss = mean(&losses);
    let largest_win = wins.iter().cloned().fold(0.0, f64::max);
    let largest_loss = losses.iter().cloned().fold(0.0, f64::min);
    let win_loss_ratio = if avg_loss != 0.0 { (avg_win / avg_loss).abs() } else { 0.0 };

    let r_multiples: Vec<f64> = trades.iter().filter_map(|t| t.r_multiple).collect();
    let avg_r_multiple = mean(&r_multiples);
    let expectancy = win_rate * avg_win + (1.0 - win_rate) * avg_loss;

    TradeStats {
        total_trades: trades.len(),
        win_rate,
        profit_factor,
        avg_win,
        avg_loss,
        largest_win,
        largest_loss,
        win_loss_ratio,
        avg_r_multiple,
        expectancy,
    }
}

/// Compute the full `Metrics` bundle from a daily equity curve and a
/// list of closed trades. Pure function of its inputs: no I/O, no
/// config lookups beyond the annual risk-free rate passed in.
pub fn compute_metrics(curve: &[EquityPoint], trades: &[Trade], risk_free_rate: f64) -> Metrics {
    if curve.is_empty() {
        return Metrics::default();
    }
    let returns = daily_returns(curve);
    let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();

    let volatility = sample_stdev(&returns) * TRADING_DAYS_PER_YEAR.sqrt();
    let downside_volatility = sample_stdev(&downside) * TRADING_DAYS_PER_YEAR.sqrt();

    let daily_rf = risk_free_rate / TRADING_DAYS_PER_YEAR;
    let excess: Vec<f64> = returns.iter().map(|r| r - daily_rf).collect();
    let excess_mean = mean(&excess);
    let excess_std = sample_stdev(&excess);
    let sharpe = if excess_std > 0.0 {
        excess_mean / excess_std * TRADING_DAYS_PER_YEAR.sqrt()
    } else {
        0.0
    };

    let downside_excess: Vec<f64> = excess.iter().copied().filter(|r| *r < 0.0).collect();
    let downside_excess_std = sample_stdev(&downside_excess);
    let sortino = if downside_excess_std > 0.0 {
        excess_mean / downside_excess_std * TRADING_DAYS_PER_YEAR.sqrt()
    } else {
        0.0
    };

    let drawdown = max_drawdown(curve);
    let c = cagr(curve);
    let calmar = if drawdown.max_drawdown == 0.0 {
        if c > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        c / drawdown.max_drawdown
    };

    let total_return = {
        let first = curve.first().unwrap();
        if first.equity > 0.0 {
            curve.last().unwrap().equity / first.equity - 1.0
        } else {
            0.0
        }
    };

    let profitable_days = returns.iter().filter(|r| **r > 0.0).count();
    let losing_days = returns.iter().filter(|r| **r < 0.0).count();
    let best_day = if returns.is_empty() { 0.0 } else { returns.iter().cloned().fold(f64::MIN, f64::max) };
    let worst_day = if returns.is_empty() { 0.0 } else { returns.iter().cloned().fold(f64::MAX, f64::min) };

    Metrics {
        total_return,
        cagr: c,
        annual_return: simple_annual_return(curve),
        volatility,
        downside_volatility,
        sharpe,
        sortino,
        calmar,
        k_ratio: k_ratio(curve),
        tail_ratio: tail_ratio(&returns),
        drawdown,
        trades: trade_stats(trades),
        monthly_returns: monthly_returns(curve),
        profitable_days,
        losing_days,
        best_day,
        worst_day,
    }
}

#[allow(dead_code)]
fn month_index(dt: chrono::NaiveDate) -> u32 {
    dt.month()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn point(y: i32, m: u32, d: u32, equity: f64, returns: f64) -> EquityPoint {
        EquityPoint { dt: NaiveDate::from_ymd_opt(y, m, d).unwrap(), equity, returns }
    }

    #[test]
    fn flat_curve_has_zero_vol_and_zero_drawdown() {
        let curve = vec![
            point(2024, 1, 1, 100.0, 0.0),
            point(2024, 1, 2, 100.0, 0.0),
            point(2024, 1, 3, 100.0, 0.0),
        ];
        let m = compute_metrics(&curve, &[], 0.02);
        assert_eq!(m.volatility, 0.0);
        assert_eq!(m.drawdown.max_drawdown, 0.0);
        assert_eq!(m.sharpe, 0.0);
    }

    #[test]
    fn drawdown_detects_peak_to_trough() {
        let curve = vec![
            point(2024, 1, 1, 100.0, 0.0),
            point(2024, 1, 2, 120.0, 0.2),
            point(2024, 1, 3, 90.0, -0.25),
            point(2024, 1, 4, 110.0, 0.22),
        ];
        let m = compute_metrics(&curve, &[], 0.02);
        assert!((m.drawdown.max_drawdown - 0.25).abs() < 1e-9);
    }

    #[test]
    fn calmar_is_infinite_when_no_drawdown_and_positive_cagr() {
        let curve = vec![
            point(2023, 1, 1, 100.0, 0.0),
            point(2024, 1, 1, 150.0, 0.5),
        ];
        let m = compute_metrics(&curve, &[], 0.02);
        assert!(m.calmar.is_infinite());
    }

    #[test]
    fn trade_stats_expectancy_matches_manual_calc() {
        let trades = vec![
            Trade {
                symbol: "AAA".into(),
                entry_dt: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                exit_dt: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
                qty: 100,
                entry_price: 10.0,
                exit_price: 12.0,
                pnl: 200.0,
                r_multiple: Some(2.0),
                holding_days: 5,
                entry_reason: "x".into(),
                exit_reason: "y".into(),
                initial_stop: Some(9.0),
                trailing_stop: None,
            },
            Trade {
                symbol: "AAA".into(),
                entry_dt: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                exit_dt: NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
                qty: 100,
                entry_price: 10.0,
                exit_price: 9.0,
                pnl: -100.0,
                r_multiple: Some(-1.0),
                holding_days: 3,
                entry_reason: "x".into(),
                exit_reason: "y".into(),
                initial_stop: Some(9.0),
                trailing_stop: None,
            },
        ];
        let stats = trade_stats(&trades);
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.win_rate, 0.5);
        assert!((stats.profit_factor - 2.0).abs() < 1e-9);
        assert!((stats.avg_r_multiple - 0.5).abs() < 1e-9);
    }

    #[test]
    fn tail_ratio_is_nonnegative_or_infinite() {
        let returns = vec![0.01, 0.02, 0.015, 0.03, 0.01];
        let r = tail_ratio(&returns);
        assert!(r.is_infinite() || r >= 0.0);
    }
}
