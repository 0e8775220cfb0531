/// broker.rs — Portfolio broker: cash, positions, fills, trades
///
/// Owns cash and every open `PositionState`. The Event Engine is the
/// only caller; strategies never touch cash or positions directly,
/// they only emit `Order`s. Fills and Trades are append-only — nothing
/// downstream mutates history once it lands in these vectors.
use chrono::NaiveDate;
use std::collections::BTreeMap;

use crate::config::BrokerConfig;
use crate::types::{Bar, Fill, Order, PositionState, Side, Trade};

pub struct PortfolioBroker {
    config: BrokerConfig,
    cash: f64,
    positions: BTreeMap<String, PositionState>,
    fills: Vec<Fill>,
    trades: Vec<Trade>,
}

impl PortfolioBroker {
    pub fn new(initial_cash: f64, config: BrokerConfig) -> Self {
        PortfolioBroker {
            config,
            cash: initial_cash,
            positions: BTreeMap::new(),
            fills: Vec::new(),
            trades: Vec::new(),
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn position(&self, symbol: &str) -> Option<&PositionState> {
        self.positions.get(symbol)
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.values().filter(|p| p.is_open()).count()
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    /// Resolve the execution price per §4.3's fill model. Returns `None`
    /// when a limit order is infeasible against the bar's range.
    fn resolve_price(order: &Order, bar: &Bar) -> Option<f64> {
        if let Some(forced) = order.open_price {
            return Some(forced);
        }
        if let Some(limit) = order.limit_price {
            return match order.side {
                Side::Buy if bar.low <= limit => Some(bar.open.min(limit)),
                Side::Sell if bar.high >= limit => Some(bar.open.max(limit)),
                _ => None,
            };
        }
        Some(bar.open)
    }

    /// Execute a pending order against the bar scheduled to fill it.
    /// Returns the resulting Fill, or `None` if the order is rejected or
    /// infeasible (never an error — see `SPEC_FULL.md` §7, `Infeasible`).
    pub fn execute_order_open(&mut self, order: &Order, bar: &Bar, day_index: usize) -> Option<Fill> {
        if order.symbol != bar.symbol || order.qty == 0 {
            return None;
        }

        let raw_px = Self::resolve_price(order, bar)?;
        let px = clamp_to_limit(order.side, apply_slippage_rate(order.side, raw_px, self.config.slippage_rate), order.limit_price);

        match order.side {
            Side::Buy => self.fill_buy(order, px, bar.dt, day_index),
            Side::Sell => self.fill_sell(order, px, bar.dt, day_index),
        }
    }

    fn fill_buy(&mut self, order: &Order, px: f64, dt: NaiveDate, day_index: usize) -> Option<Fill> {
        let notional = order.qty as f64 * px;
        let commission = self.config.calculate_commission(notional);
        let total_cost = notional + commission;
        if total_cost > self.cash {
            return None;
        }
        self.cash -= total_cost;

        let entry = self.positions.entry(order.symbol.clone()).or_insert_with(|| PositionState {
            symbol: order.symbol.clone(),
            qty: 0,
            avg_price: 0.0,
            entry_qty: 0,
            entry_notional: 0.0,
            entry_fee: 0.0,
            entry_dt: None,
            entry_price: None,
            entry_index: None,
            entry_reason: order.reason.clone(),
            initial_stop: order.initial_stop,
            trailing_stop: None,
            highest_close: None,
        });

        let old_qty = entry.qty;
        let old_cost = old_qty as f64 * entry.avg_price;
        let new_qty = old_qty + order.qty;
        entry.avg_price = (old_cost + notional) / new_qty as f64;
        entry.qty = new_qty;
        entry.entry_qty += order.qty;
        entry.entry_notional += notional;
        entry.entry_fee += commission;
        if entry.entry_dt.is_none() {
            entry.entry_dt = Some(dt);
            entry.entry_price = Some(px);
            entry.entry_index = Some(day_index);
            entry.entry_reason = order.reason.clone();
        }
        if let Some(stop) = order.initial_stop {
            entry.initial_stop = Some(stop);
        }

        let fill = Fill { symbol: order.symbol.clone(), side: Side::Buy, qty: order.qty, price: px, fee: commission, dt };
        self.fills.push(fill.clone());
        Some(fill)
    }

    fn fill_sell(&mut self, order: &Order, px: f64, dt: NaiveDate, day_index: usize) -> Option<Fill> {
        let pos = self.positions.get_mut(&order.symbol)?;
        if pos.qty == 0 {
            return None;
        }
        let qty = order.qty.min(pos.qty);
        let notional = qty as f64 * px;
        let commission = self.config.calculate_commission(notional);
        let stamp_duty = notional * self.config.stamp_duty_rate;
        let fee = commission + stamp_duty;
        self.cash += notional - fee;

        let entry_avg = pos.avg_price;
        let entry_dt = pos.entry_dt.unwrap_or(dt);
        let entry_index = pos.entry_index.unwrap_or(day_index);
        let entry_reason = pos.entry_reason.clone();
        let initial_stop = pos.initial_stop;
        let trailing_stop = pos.trailing_stop;

        let pnl = (px - entry_avg) * qty as f64;
        let holding_days = (day_index as i64) - (entry_index as i64) + 1;
        let r_multiple = initial_stop.and_then(|stop| {
            let risk = entry_avg - stop;
            if risk > 0.0 {
                Some((px - entry_avg) / risk)
            } else {
                None
            }
        });

        pos.qty -= qty;
        if pos.qty == 0 {
            self.positions.remove(&order.symbol);
        }

        let trade = Trade {
            symbol: order.symbol.clone(),
            entry_dt,
            exit_dt: dt,
            qty,
            entry_price: entry_avg,
            exit_price: px,
            pnl,
            r_multiple,
            holding_days,
            entry_reason,
            exit_reason: order.reason.clone(),
            initial_stop,
            trailing_stop,
        };
        self.trades.push(trade);

        let fill = Fill { symbol: order.symbol.clone(), side: Side::Sell, qty, price: px, fee, dt };
        self.fills.push(fill.clone());
        Some(fill)
    }

    /// `equity = cash + sum(qty * close)` over symbols present in
    /// `close_by_symbol`. A position whose symbol is absent from the map
    /// contributes nothing that day — it is not carried forward at its
    /// last valuation (see `SPEC_FULL.md` §4.3).
    pub fn mark_to_market(&self, close_by_symbol: &BTreeMap<&str, f64>) -> f64 {
        let mut equity = self.cash;
        for (symbol, pos) in &self.positions {
            if let Some(close) = close_by_symbol.get(symbol.as_str()) {
                equity += pos.qty as f64 * close;
            }
        }
        equity
    }

    pub fn exposure(&self, close_by_symbol: &BTreeMap<&str, f64>) -> f64 {
        self.positions
            .iter()
            .filter_map(|(symbol, pos)| close_by_symbol.get(symbol.as_str()).map(|c| pos.market_value(*c)))
            .sum()
    }
}

fn apply_slippage_rate(side: Side, px: f64, slippage_rate: f64) -> f64 {
    match side {
        Side::Buy => px * (1.0 + slippage_rate),
        Side::Sell => px * (1.0 - slippage_rate),
    }
}

fn clamp_to_limit(side: Side, px: f64, limit: Option<f64>) -> f64 {
    match (side, limit) {
        (Side::Buy, Some(l)) => px.min(l),
        (Side::Sell, Some(l)) => px.max(l),
        _ => px,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn bar(open: f64, high: f64, low: f64, close: f64, dt: NaiveDate) -> Bar {
        Bar::new("AAA", dt, open, high, low, close, Some(1000.0), 0).unwrap()
    }

    #[test]
    fn buy_then_sell_round_trip_keeps_cash_nonnegative() {
        let mut broker = PortfolioBroker::new(100_000.0, BrokerConfig::default());
        let buy = Order {
            symbol: "AAA".into(), qty: 100, side: Side::Buy, dt: d(2024, 1, 2),
            reason: "entry".into(), initial_stop: Some(9.0), limit_price: None, open_price: None,
        };
        let bar1 = bar(10.0, 10.5, 9.8, 10.2, d(2024, 1, 2));
        let fill = broker.execute_order_open(&buy, &bar1, 0).expect("buy should fill");
        assert!(fill.price > 10.0); // slippage pushes buys up
        assert!(broker.cash() >= 0.0);
        assert_eq!(broker.open_position_count(), 1);

        let sell = Order {
            symbol: "AAA".into(), qty: 100, side: Side::Sell, dt: d(2024, 1, 3),
            reason: "exit".into(), initial_stop: None, limit_price: None, open_price: None,
        };
        let bar2 = bar(11.0, 11.5, 10.8, 11.2, d(2024, 1, 3));
        let sell_fill = broker.execute_order_open(&sell, &bar2, 1).expect("sell should fill");
        assert!(sell_fill.price < 11.0); // slippage pushes sells down
        assert_eq!(broker.open_position_count(), 0);
        assert_eq!(broker.trades().len(), 1);
        assert!(broker.trades()[0].pnl > 0.0);
        assert!(broker.trades()[0].r_multiple.is_some());
    }

    #[test]
    fn insufficient_cash_rejects_buy() {
        let mut broker = PortfolioBroker::new(100.0, BrokerConfig::default());
        let buy = Order {
            symbol: "AAA".into(), qty: 1000, side: Side::Buy, dt: d(2024, 1, 2),
            reason: "entry".into(), initial_stop: None, limit_price: None, open_price: None,
        };
        let bar1 = bar(10.0, 10.5, 9.8, 10.2, d(2024, 1, 2));
        assert!(broker.execute_order_open(&buy, &bar1, 0).is_none());
        assert_eq!(broker.cash(), 100.0);
    }

    #[test]
    fn limit_buy_feasibility() {
        let broker_cfg = BrokerConfig { slippage_rate: 0.0, ..BrokerConfig::default() };
        let mut broker = PortfolioBroker::new(100_000.0, broker_cfg);
        let order = Order {
            symbol: "AAA".into(), qty: 100, side: Side::Buy, dt: d(2024, 1, 2),
            reason: "entry".into(), initial_stop: None, limit_price: Some(10.00), open_price: None,
        };
        let feasible_bar = bar(10.50, 10.80, 9.90, 10.20, d(2024, 1, 2));
        let fill = broker.execute_order_open(&order, &feasible_bar, 0).expect("limit should fill");
        assert_eq!(fill.price, 10.00);
    }

    #[test]
    fn limit_buy_infeasible_when_low_above_limit() {
        let mut broker = PortfolioBroker::new(100_000.0, BrokerConfig::default());
        let order = Order {
            symbol: "AAA".into(), qty: 100, side: Side::Buy, dt: d(2024, 1, 2),
            reason: "entry".into(), initial_stop: None, limit_price: Some(10.00), open_price: None,
        };
        let infeasible_bar = bar(10.20, 10.80, 10.10, 10.50, d(2024, 1, 2));
        assert!(broker.execute_order_open(&order, &infeasible_bar, 0).is_none());
    }

    #[test]
    fn mark_to_market_skips_missing_symbol() {
        let mut broker = PortfolioBroker::new(100_000.0, BrokerConfig::default());
        let buy = Order {
            symbol: "AAA".into(), qty: 100, side: Side::Buy, dt: d(2024, 1, 2),
            reason: "entry".into(), initial_stop: None, limit_price: None, open_price: None,
        };
        let bar1 = bar(10.0, 10.5, 9.8, 10.2, d(2024, 1, 2));
        broker.execute_order_open(&buy, &bar1, 0);

        let empty: BTreeMap<&str, f64> = BTreeMap::new();
        let equity_without_symbol = broker.mark_to_market(&empty);
        assert_eq!(equity_without_symbol, broker.cash());
    }
}
