/// selector.rs — ranks symbols across two backtest result CSVs (two
/// exit modes) by composite rank, after hard filters.
use std::path::Path;

use channel_core::error::Result;
use csv::ReaderBuilder;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SelectorRow {
    pub symbol: String,
    pub annualized_return: f64,
    pub sharpe: f64,
    pub max_drawdown: f64,
    pub trades: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct Criteria {
    pub min_annualized_return: f64,
    pub min_sharpe: f64,
    pub max_drawdown: f64,
    pub min_trades: u64,
    pub min_calmar: f64,
}

impl Default for Criteria {
    fn default() -> Self {
        Criteria { min_annualized_return: 0.0, min_sharpe: 0.0, max_drawdown: 1.0, min_trades: 0, min_calmar: 0.0 }
    }
}

#[derive(Debug, Clone)]
pub struct RankedRow {
    pub mode: String,
    pub row: SelectorRow,
    pub calmar: f64,
    pub rank_sum: u64,
}

#[derive(Debug, Clone)]
pub struct ModeSummary {
    pub mode: String,
    pub candidate_count: usize,
    pub avg_annualized_return: f64,
    pub avg_sharpe: f64,
}

pub fn calmar(annualized_return: f64, max_drawdown: f64) -> f64 {
    if max_drawdown == 0.0 {
        if annualized_return > 0.0 {
            f64::INFINITY
        } else {
            0.0
        }
    } else {
        annualized_return / max_drawdown.abs()
    }
}

fn load_rows(path: impl AsRef<Path>) -> Result<Vec<SelectorRow>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize() {
        let row: SelectorRow = record?;
        rows.push(row);
    }
    Ok(rows)
}

fn passes(row: &SelectorRow, calmar_val: f64, criteria: &Criteria) -> bool {
    row.annualized_return >= criteria.min_annualized_return
        && row.sharpe >= criteria.min_sharpe
        && row.max_drawdown <= criteria.max_drawdown
        && row.trades > criteria.min_trades
        && calmar_val >= criteria.min_calmar
}

fn rank_descending(values: &[f64]) -> Vec<u64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(std::cmp::Ordering::Equal));
    let mut ranks = vec![0u64; values.len()];
    for (rank, &idx) in order.iter().enumerate() {
        ranks[idx] = rank as u64 + 1;
    }
    ranks
}

fn rank_ascending(values: &[f64]) -> Vec<u64> {
    let negated: Vec<f64> = values.iter().map(|v| -v).collect();
    rank_descending(&negated)
}

/// Load both mode CSVs, apply hard filters, rank survivors by Calmar,
/// Sharpe, annualized return (descending) and MDD (ascending), and
/// return the top-N plus a per-mode summary of all candidates.
pub fn select(mode_a: (&str, impl AsRef<Path>), mode_b: (&str, impl AsRef<Path>), criteria: &Criteria, top_n: usize) -> Result<(Vec<RankedRow>, Vec<ModeSummary>)> {
    let mut candidates = Vec::new();
    let mut summaries = Vec::new();

    for (mode_name, path) in [(mode_a.0, mode_a.1.as_ref().to_path_buf()), (mode_b.0, mode_b.1.as_ref().to_path_buf())] {
        let rows = load_rows(&path)?;
        let mut mode_candidates: Vec<(SelectorRow, f64)> = Vec::new();
        for row in rows {
            let c = calmar(row.annualized_return, row.max_drawdown);
            if passes(&row, c, criteria) {
                mode_candidates.push((row, c));
            }
        }

        let count = mode_candidates.len();
        let avg_ar = if count > 0 { mode_candidates.iter().map(|(r, _)| r.annualized_return).sum::<f64>() / count as f64 } else { 0.0 };
        let avg_sharpe = if count > 0 { mode_candidates.iter().map(|(r, _)| r.sharpe).sum::<f64>() / count as f64 } else { 0.0 };
        summaries.push(ModeSummary { mode: mode_name.to_string(), candidate_count: count, avg_annualized_return: avg_ar, avg_sharpe });

        for (row, c) in mode_candidates {
            candidates.push((mode_name.to_string(), row, c));
        }
    }

    if candidates.is_empty() {
        return Ok((Vec::new(), summaries));
    }

    let calmars: Vec<f64> = candidates.iter().map(|(_, _, c)| *c).collect();
    let sharpes: Vec<f64> = candidates.iter().map(|(_, r, _)| r.sharpe).collect();
    let ann_returns: Vec<f64> = candidates.iter().map(|(_, r, _)| r.annualized_return).collect();
    let drawdowns: Vec<f64> = candidates.iter().map(|(_, r, _)| r.max_drawdown).collect();

    let calmar_ranks = rank_descending(&calmars);
    let sharpe_ranks = rank_descending(&sharpes);
    let ar_ranks = rank_descending(&ann_returns);
    let dd_ranks = rank_ascending(&drawdowns);

    let mut ranked: Vec<RankedRow> = candidates
        .into_iter()
        .enumerate()
        .map(|(i, (mode, row, c))| RankedRow {
            mode,
            row,
            calmar: c,
            rank_sum: calmar_ranks[i] + sharpe_ranks[i] + ar_ranks[i] + dd_ranks[i],
        })
        .collect();

    ranked.sort_by_key(|r| r.rank_sum);
    ranked.truncate(top_n);
    Ok((ranked, summaries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn calmar_is_infinite_with_zero_drawdown_and_positive_return() {
        assert_eq!(calmar(0.2, 0.0), f64::INFINITY);
        assert_eq!(calmar(0.0, 0.0), 0.0);
        assert!((calmar(0.2, 0.1) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn select_filters_and_ranks_across_two_modes() {
        let a = write_csv("symbol,annualized_return,sharpe,max_drawdown,trades\nAAA,0.30,1.5,0.10,20\nBBB,0.01,0.1,0.50,5\n");
        let b = write_csv("symbol,annualized_return,sharpe,max_drawdown,trades\nCCC,0.25,1.2,0.15,15\n");

        let criteria = Criteria { min_annualized_return: 0.1, min_sharpe: 0.5, max_drawdown: 0.3, min_trades: 10, min_calmar: 0.0 };
        let (ranked, summaries) = select(("mid_up", a.path()), ("upper_down", b.path()), &criteria, 10).unwrap();

        assert_eq!(ranked.len(), 2);
        assert_eq!(ranked[0].row.symbol, "AAA"); // higher calmar/sharpe/return
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].candidate_count, 1); // BBB filtered out
    }
}
