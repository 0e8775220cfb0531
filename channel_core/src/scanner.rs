/// scanner.rs — single-symbol backtest/scan adapters
///
/// Thin glue over `engine::run`: load bars, build a strategy, run, and
/// shape the result either as the full `RunResult` ("detail") or a
/// compact metrics dict suitable for a batch sweep row.
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::config::{BacktestConfig, ChannelHFConfig, EventEngineConfig};
use crate::data::load_bars_from_csv;
use crate::engine;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::strategy::ChannelHfStrategy;
use crate::types::{RunResult, SignalLogEntry};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub symbol: String,
    pub data_path: PathBuf,
    pub index_path: Option<PathBuf>,
    pub window: Option<(NaiveDate, NaiveDate)>,
    pub detail: bool,
    pub robust_segments: Option<usize>,
    pub backtest_cfg: BacktestConfig,
    pub strategy_cfg: ChannelHFConfig,
    pub lot_size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RobustScore {
    pub segment_scores: Vec<f64>,
    pub mean: f64,
    pub std: f64,
    pub aggregate: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompactSummary {
    pub symbol: String,
    pub total_return: f64,
    pub cagr: f64,
    pub max_drawdown: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub calmar: f64,
    pub tail_ratio: f64,
    pub expectancy: f64,
    pub profit_factor: f64,
    pub largest_loss: f64,
    pub win_rate: f64,
    pub trade_count: usize,
    pub final_equity: f64,
    pub anomaly_count: usize,
    pub score: Option<f64>,
    pub robust: Option<RobustScore>,
}

pub enum BacktestOutcome {
    Detail(Box<RunResult>),
    Compact(CompactSummary),
}

fn score_from_metrics(m: &Metrics) -> f64 {
    20.0 * m.sharpe + 100.0 * m.cagr + 50.0 * m.trades.win_rate - 50.0 * m.drawdown.max_drawdown
}

fn compact_from(symbol: &str, result: &RunResult) -> CompactSummary {
    let m = &result.metrics;
    CompactSummary {
        symbol: symbol.to_string(),
        total_return: m.total_return,
        cagr: m.cagr,
        max_drawdown: m.drawdown.max_drawdown,
        sharpe: m.sharpe,
        sortino: m.sortino,
        calmar: m.calmar,
        tail_ratio: m.tail_ratio,
        expectancy: m.trades.expectancy,
        profit_factor: m.trades.profit_factor,
        largest_loss: m.trades.largest_loss,
        win_rate: m.trades.win_rate,
        trade_count: m.trades.total_trades,
        final_equity: result.equity_curve.last().map(|p| p.equity).unwrap_or(result.metrics.total_return),
        anomaly_count: result.anomalies.len(),
        score: Some(score_from_metrics(m)),
        robust: None,
    }
}

fn build_strategy(req: &ScanRequest, benchmark_bars: &[crate::types::Bar]) -> ChannelHfStrategy {
    ChannelHfStrategy::new(req.strategy_cfg.clone(), req.lot_size, benchmark_bars)
}

fn load_all(req: &ScanRequest) -> Result<(Vec<crate::types::Bar>, Vec<crate::types::Bar>)> {
    let bars = load_bars_from_csv(&req.data_path, &req.symbol, req.window)?;
    let benchmark_bars = match &req.index_path {
        Some(path) => load_bars_from_csv(path, "BENCHMARK", req.window)?,
        None => Vec::new(),
    };
    Ok((bars, benchmark_bars))
}

/// Run one full backtest for a symbol and shape the result per `detail`.
pub fn backtest_for_symbol(req: &ScanRequest) -> Result<BacktestOutcome> {
    let (bars, benchmark_bars) = load_all(req)?;
    let mut strategy = build_strategy(req, &benchmark_bars);
    let result = engine::run(&bars, &benchmark_bars, &mut strategy, &req.backtest_cfg, EventEngineConfig::default(), None)?;

    if req.detail {
        return Ok(BacktestOutcome::Detail(Box::new(result)));
    }

    let mut summary = compact_from(&req.symbol, &result);
    if let Some(k) = req.robust_segments {
        if k > 1 {
            summary.robust = Some(robust_score(req, &bars, &benchmark_bars, k)?);
        }
    }
    Ok(BacktestOutcome::Compact(summary))
}

/// Split `bars` into `k` equal-length contiguous segments, run the same
/// strategy/config over each, and aggregate as `mean - std` of the
/// per-segment composite score.
fn robust_score(req: &ScanRequest, bars: &[crate::types::Bar], benchmark_bars: &[crate::types::Bar], k: usize) -> Result<RobustScore> {
    let n = bars.len();
    let seg_len = n / k;
    if seg_len == 0 {
        return Ok(RobustScore::default());
    }

    let mut scores = Vec::with_capacity(k);
    for seg in 0..k {
        let start = seg * seg_len;
        let end = if seg == k - 1 { n } else { start + seg_len };
        let segment = &bars[start..end];
        if segment.len() < 2 {
            continue;
        }
        let mut strategy = build_strategy(req, benchmark_bars);
        let result = engine::run(segment, benchmark_bars, &mut strategy, &req.backtest_cfg, EventEngineConfig::default(), None)?;
        scores.push(score_from_metrics(&result.metrics));
    }

    if scores.is_empty() {
        return Ok(RobustScore::default());
    }
    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
    let std = variance.sqrt();
    Ok(RobustScore { segment_scores: scores, mean, std, aggregate: mean - std })
}

/// Run with `capture_logs = true` and return the most recent
/// non-neutral signal within `scan_recent_days` of the last bar, if any.
pub fn scan_channel_for_symbol(req: &ScanRequest) -> Result<Option<SignalLogEntry>> {
    let mut req = req.clone();
    req.strategy_cfg.capture_logs = true;

    let (bars, benchmark_bars) = load_all(&req)?;
    let Some(last_dt) = bars.last().map(|b| b.dt) else { return Ok(None) };
    let cutoff = last_dt - chrono::Duration::days(req.strategy_cfg.scan_recent_days as i64);

    let mut strategy = build_strategy(&req, &benchmark_bars);
    let mut result = engine::run(&bars, &benchmark_bars, &mut strategy, &req.backtest_cfg, EventEngineConfig::default(), None)?;

    let logs = std::mem::take(&mut result.signal_logs);
    Ok(logs
        .into_iter()
        .filter(|log| log.dt >= cutoff && log.final_signal != 0)
        .max_by_key(|log| log.dt))
}

pub fn symbol_from_path(path: &Path) -> String {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("UNKNOWN").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::types::{EquityPoint, Trade};
    use chrono::NaiveDate;

    fn point(dt: NaiveDate, equity: f64) -> EquityPoint {
        EquityPoint { dt, equity, returns: 0.0 }
    }

    #[test]
    fn score_from_metrics_rewards_sharpe_and_penalizes_drawdown() {
        let mut m = Metrics::default();
        m.sharpe = 1.0;
        m.cagr = 0.1;
        m.trades.win_rate = 0.6;
        m.drawdown.max_drawdown = 0.1;
        let low_dd_score = score_from_metrics(&m);
        m.drawdown.max_drawdown = 0.3;
        let high_dd_score = score_from_metrics(&m);
        assert!(low_dd_score > high_dd_score);
    }

    #[test]
    fn compact_from_reports_final_equity_from_curve() {
        let result = RunResult {
            equity_curve: vec![point(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(), 100_000.0), point(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 105_000.0)],
            benchmark_curve: vec![],
            trades: Vec::<Trade>::new(),
            metrics: Metrics::default(),
            anomalies: vec![],
            signal_logs: vec![],
            status: crate::types::RunStatus::Completed,
        };
        let summary = compact_from("AAA", &result);
        assert_eq!(summary.final_equity, 105_000.0);
        assert_eq!(summary.anomaly_count, 0);
    }
}
