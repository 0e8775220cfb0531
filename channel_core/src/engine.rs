/// engine.rs — Event-driven daily backtest loop
///
/// ┌──────────────┐   ┌──────────────┐   ┌───────────────┐   ┌───────────────┐
/// │ fills at open │ → │  on_open()   │ → │ mark-to-market│ → │   on_close()  │
/// └──────────────┘   └──────────────┘   └───────────────┘   └───────┬───────┘
///        ▲                                                          │
///        └──────────────── orders rescheduled to D+1 ───────────────┘
///
/// One pass per calendar date in the union of every symbol's trading
/// calendar (plus the benchmark's, if any). Within a date the ordering
/// above is the engine's core guarantee: fills always precede
/// `on_open`, mark-to-market always precedes `on_close`.
use std::collections::BTreeMap;

use ahash::AHashMap;
use chrono::NaiveDate;

use crate::broker::PortfolioBroker;
use crate::config::{BacktestConfig, EventEngineConfig};
use crate::error::Result;
use crate::metrics::compute_metrics;
use crate::types::{
    Anomaly, AnomalyKind, Bar, EquityPoint, MarketFrame, Order, RunResult, RunStatus,
    SignalLogEntry,
};

/// Strategy contract the engine drives once per trading date.
pub trait Strategy {
    /// Called right after same-day fills are applied, before
    /// mark-to-market. Used for bookkeeping (days-held, cooldown) that
    /// must reflect the day's fills.
    fn on_open(&mut self, index: usize, frame: &MarketFrame, broker: &PortfolioBroker);

    /// Called after mark-to-market; `equity` is the value just computed.
    /// Returns orders to schedule for the next trading date.
    fn on_close(&mut self, index: usize, frame: &MarketFrame, broker: &mut PortfolioBroker, equity: f64) -> Vec<Order>;

    /// Signal logs captured during the run, if the strategy supports
    /// `capture_logs`. Default: none.
    fn take_signal_logs(&mut self) -> Vec<SignalLogEntry> {
        Vec::new()
    }
}

fn validate_symbol_bars(symbol: &str, bars: &[Bar], cfg: EventEngineConfig, anomalies: &mut Vec<Anomaly>) {
    if bars.is_empty() {
        anomalies.push(Anomaly { symbol: symbol.into(), kind: AnomalyKind::Empty, detail: "no bars".into(), dt: None });
        return;
    }
    if bars.len() < cfg.min_trading_days {
        anomalies.push(Anomaly {
            symbol: symbol.into(),
            kind: AnomalyKind::InsufficientRows,
            detail: format!("{} rows < minimum {}", bars.len(), cfg.min_trading_days),
            dt: None,
        });
    }
    for w in bars.windows(2) {
        let gap_days = (w[1].dt - w[0].dt).num_days();
        if gap_days > cfg.max_date_gap_days {
            anomalies.push(Anomaly {
                symbol: symbol.into(),
                kind: AnomalyKind::CalendarGap,
                detail: format!("{gap_days} day gap"),
                dt: Some(w[1].dt),
            });
        }
        if w[0].close > 0.0 {
            let pct = (w[1].close / w[0].close - 1.0).abs();
            if pct > cfg.abnormal_gap_pct {
                anomalies.push(Anomaly {
                    symbol: symbol.into(),
                    kind: AnomalyKind::AbnormalGap,
                    detail: format!("{:.1}% day-over-day move", pct * 100.0),
                    dt: Some(w[1].dt),
                });
            }
        }
        if w[1].has_ohlc_violation() {
            anomalies.push(Anomaly {
                symbol: symbol.into(),
                kind: AnomalyKind::OhlcViolation,
                detail: "low/high inconsistent with open/close".into(),
                dt: Some(w[1].dt),
            });
        }
    }
}

/// Bucket a flat, possibly multi-symbol bar list by symbol, and within
/// each symbol by date, keeping the higher-`index` bar on duplicates.
fn index_by_symbol_and_date(bars: &[Bar]) -> AHashMap<&str, AHashMap<NaiveDate, &Bar>> {
    let mut out: AHashMap<&str, AHashMap<NaiveDate, &Bar>> = AHashMap::default();
    for bar in bars {
        let per_symbol = out.entry(bar.symbol.as_str()).or_default();
        match per_symbol.get(&bar.dt) {
            Some(existing) if existing.index >= bar.index => {
                tracing::warn!(symbol = %bar.symbol, dt = %bar.dt, "duplicate bar, keeping higher index");
            }
            _ => {
                per_symbol.insert(bar.dt, bar);
            }
        }
    }
    out
}

/// Run the Event Engine over `bars` (all symbols interleaved) using
/// `strategy` for signal generation. `benchmark_bars`, if provided,
/// drives a carried-forward benchmark equity curve alongside the
/// simulated one.
pub fn run<S: Strategy>(
    bars: &[Bar],
    benchmark_bars: &[Bar],
    strategy: &mut S,
    cfg: &BacktestConfig,
    engine_cfg: EventEngineConfig,
    start_date: Option<NaiveDate>,
) -> Result<RunResult> {
    let mut anomalies = Vec::new();

    let by_symbol_date = index_by_symbol_and_date(bars);
    for (symbol, per_date) in &by_symbol_date {
        let mut sorted: Vec<&Bar> = per_date.values().copied().collect();
        sorted.sort_by_key(|b| b.dt);
        let owned: Vec<Bar> = sorted.into_iter().cloned().collect();
        validate_symbol_bars(symbol, &owned, engine_cfg, &mut anomalies);
    }

    let benchmark_by_date: AHashMap<NaiveDate, &Bar> = benchmark_bars.iter().map(|b| (b.dt, b)).collect();
    let benchmark_first_close = benchmark_bars.first().map(|b| b.close);

    let mut calendar: Vec<NaiveDate> = bars.iter().map(|b| b.dt).chain(benchmark_bars.iter().map(|b| b.dt)).collect();
    calendar.sort();
    calendar.dedup();
    if let Some(start) = start_date {
        calendar.retain(|d| *d >= start);
    }

    let mut broker = PortfolioBroker::new(cfg.initial_cash, cfg.broker);
    let mut pending: BTreeMap<NaiveDate, Vec<Order>> = BTreeMap::new();
    let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(calendar.len());
    let mut benchmark_curve: Vec<EquityPoint> = Vec::with_capacity(calendar.len());
    let mut last_benchmark_equity = cfg.initial_cash;
    let mut prev_equity = cfg.initial_cash;
    let mut prev_benchmark_equity = cfg.initial_cash;

    for (i, &date) in calendar.iter().enumerate() {
        let frame: MarketFrame = by_symbol_date
            .iter()
            .filter_map(|(symbol, per_date)| per_date.get(&date).map(|b| (*symbol, *b)))
            .collect();

        if let (Some(bench_bar), Some(first_close)) = (benchmark_by_date.get(&date), benchmark_first_close) {
            if first_close > 0.0 {
                last_benchmark_equity = cfg.initial_cash * bench_bar.close / first_close;
            }
        }
        benchmark_curve.push(EquityPoint {
            dt: date,
            equity: last_benchmark_equity,
            returns: if prev_benchmark_equity > 0.0 { last_benchmark_equity / prev_benchmark_equity - 1.0 } else { 0.0 },
        });
        prev_benchmark_equity = last_benchmark_equity;

        if let Some(orders) = pending.remove(&date) {
            for order in orders.iter().filter(|o| o.qty > 0) {
                match frame.get(order.symbol.as_str()) {
                    Some(bar) => {
                        broker.execute_order_open(order, bar, bar.index);
                    }
                    None => {
                        tracing::warn!(symbol = %order.symbol, dt = %date, "no bar for scheduled order, skipped");
                    }
                }
            }
        }

        strategy.on_open(i, &frame, &broker);

        let closes: BTreeMap<&str, f64> = frame.iter().map(|(s, b)| (*s, b.close)).collect();
        let equity = broker.mark_to_market(&closes);
        equity_curve.push(EquityPoint {
            dt: date,
            equity,
            returns: if prev_equity > 0.0 { equity / prev_equity - 1.0 } else { 0.0 },
        });
        prev_equity = equity;

        let new_orders = strategy.on_close(i, &frame, &mut broker, equity);
        if let Some(next_date) = calendar.get(i + 1) {
            for mut order in new_orders {
                order.dt = *next_date;
                pending.entry(*next_date).or_default().push(order);
            }
        }
        // Orders with no next date (final trading day) are simply
        // dropped per the terminal rule: no synthetic fills.
    }

    let metrics = compute_metrics(&equity_curve, broker.trades(), cfg.risk_free_rate);

    Ok(RunResult {
        equity_curve,
        benchmark_curve,
        trades: broker.trades().to_vec(),
        metrics,
        anomalies,
        signal_logs: strategy.take_signal_logs(),
        status: RunStatus::Completed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;
    use chrono::NaiveDate;

    struct BuyOnceStrategy {
        bought: bool,
    }

    impl Strategy for BuyOnceStrategy {
        fn on_open(&mut self, _index: usize, _frame: &MarketFrame, _broker: &PortfolioBroker) {}

        fn on_close(&mut self, _index: usize, frame: &MarketFrame, _broker: &mut PortfolioBroker, _equity: f64) -> Vec<Order> {
            if self.bought {
                return vec![];
            }
            if let Some(bar) = frame.get("AAA") {
                self.bought = true;
                return vec![Order {
                    symbol: "AAA".into(),
                    qty: 10,
                    side: Side::Buy,
                    dt: bar.dt,
                    reason: "test".into(),
                    initial_stop: None,
                    limit_price: None,
                    open_price: None,
                }];
            }
            vec![]
        }
    }

    fn bar(dt: NaiveDate, idx: usize, px: f64) -> Bar {
        Bar::new("AAA", dt, px, px + 0.5, px - 0.5, px, Some(1000.0), idx).unwrap()
    }

    #[test]
    fn single_bar_run_has_no_trades_and_unchanged_equity() {
        let bars = vec![bar(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(), 0, 10.0)];
        let mut strategy = BuyOnceStrategy { bought: true }; // never signals
        let cfg = BacktestConfig::default();
        let result = run(&bars, &[], &mut strategy, &cfg, EventEngineConfig::default(), None).unwrap();
        assert_eq!(result.equity_curve.len(), 1);
        assert_eq!(result.equity_curve[0].equity, cfg.initial_cash);
        assert_eq!(result.trades.len(), 0);
    }

    #[test]
    fn order_issued_on_close_fills_next_day() {
        let bars: Vec<Bar> = (0..5)
            .map(|i| bar(NaiveDate::from_ymd_opt(2024, 1, 2 + i as u32).unwrap(), i, 10.0 + i as f64))
            .collect();
        let mut strategy = BuyOnceStrategy { bought: false };
        let cfg = BacktestConfig::default();
        let result = run(&bars, &[], &mut strategy, &cfg, EventEngineConfig::default(), None).unwrap();
        assert_eq!(result.trades.len(), 0); // never sold, position stays open
        assert!(result.equity_curve.last().unwrap().equity != cfg.initial_cash);
    }
}
