//! Core data model: bars, orders, fills, positions, trades, equity points.
//!
//! Mirrors the shape of a typical columnar-per-symbol backtest: these are
//! the record types that flow between the Loader, the Broker, the Event
//! Engine and the Strategy. Bars and Trades are immutable once produced;
//! PositionState is the one entity mutated in place as fills land.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn is_buy(self) -> bool {
        matches!(self, Side::Buy)
    }
}

/// One trading day's OHLCV record for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub dt: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: Option<f64>,
    /// 0-based position within this symbol's sorted bar sequence.
    pub index: usize,
}

impl Bar {
    /// Hard invariants only: positive prices, non-negative volume, a
    /// non-empty symbol. OHLC ordering (`low <= open,close <= high`) is
    /// checked by the loader, which logs but does not reject.
    pub fn new(
        symbol: impl Into<String>,
        dt: NaiveDate,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: Option<f64>,
        index: usize,
    ) -> Result<Self> {
        let symbol = symbol.into();
        if symbol.is_empty() {
            return Err(EngineError::InvalidInput("symbol cannot be empty".into()));
        }
        if open <= 0.0 || high <= 0.0 || low <= 0.0 || close <= 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "prices must be positive: o={open} h={high} l={low} c={close}"
            )));
        }
        if let Some(v) = volume {
            if v < 0.0 {
                return Err(EngineError::InvalidInput(format!(
                    "volume cannot be negative: {v}"
                )));
            }
        }
        Ok(Bar { symbol, dt, open, high, low, close, volume, index })
    }

    pub fn typical_price(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }

    pub fn hl2(&self) -> f64 {
        (self.high + self.low) / 2.0
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    /// True iff the bar violates loose OHLC ordering; callers log this,
    /// they don't reject the bar.
    pub fn has_ohlc_violation(&self) -> bool {
        let lo = self.open.min(self.close);
        let hi = self.open.max(self.close);
        self.low > lo || self.high < hi || self.low > self.high
    }
}

/// A scheduled (not yet executed) order from the strategy.
#[derive(Debug, Clone)]
pub struct Order {
    pub symbol: String,
    pub qty: u64,
    pub side: Side,
    /// Scheduled execution date (T+1 relative to the signal bar).
    pub dt: NaiveDate,
    pub reason: String,
    pub initial_stop: Option<f64>,
    pub limit_price: Option<f64>,
    /// Forced execution price override, bypassing open/limit logic.
    pub open_price: Option<f64>,
}

/// One executed fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub symbol: String,
    pub side: Side,
    pub qty: u64,
    pub price: f64,
    pub fee: f64,
    pub dt: NaiveDate,
}

impl Fill {
    pub fn notional(&self) -> f64 {
        self.qty as f64 * self.price
    }
}

/// Live (open) position state owned exclusively by the Broker.
#[derive(Debug, Clone)]
pub struct PositionState {
    pub symbol: String,
    pub qty: u64,
    pub avg_price: f64,
    pub entry_qty: u64,
    pub entry_notional: f64,
    pub entry_fee: f64,
    pub entry_dt: Option<NaiveDate>,
    pub entry_price: Option<f64>,
    pub entry_index: Option<usize>,
    pub entry_reason: String,
    pub initial_stop: Option<f64>,
    pub trailing_stop: Option<f64>,
    pub highest_close: Option<f64>,
}

impl PositionState {
    pub fn is_open(&self) -> bool {
        self.qty > 0
    }

    pub fn market_value(&self, current_price: f64) -> f64 {
        if self.is_open() {
            self.qty as f64 * current_price
        } else {
            0.0
        }
    }

    pub fn unrealized_pnl(&self, current_price: f64) -> f64 {
        if !self.is_open() {
            return 0.0;
        }
        self.qty as f64 * (current_price - self.avg_price)
    }
}

/// A closed trade. Immutable once emitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub symbol: String,
    pub entry_dt: NaiveDate,
    pub exit_dt: NaiveDate,
    pub qty: u64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub r_multiple: Option<f64>,
    pub holding_days: i64,
    pub entry_reason: String,
    pub exit_reason: String,
    pub initial_stop: Option<f64>,
    pub trailing_stop: Option<f64>,
}

impl Trade {
    pub fn is_winning(&self) -> bool {
        self.pnl > 0.0
    }

    pub fn pnl_percentage(&self) -> f64 {
        if self.entry_price == 0.0 {
            0.0
        } else {
            self.exit_price / self.entry_price - 1.0
        }
    }
}

/// One point on an equity curve.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EquityPoint {
    pub dt: NaiveDate,
    pub equity: f64,
    pub returns: f64,
}

/// `symbol -> Bar` for one calendar date.
pub type MarketFrame<'a> = BTreeMap<&'a str, &'a Bar>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnomalyKind {
    ParseFailed,
    Empty,
    InsufficientRows,
    DuplicateDates,
    Stale,
    NonPositivePrice,
    OhlcViolation,
    ListingTooNew,
    StName,
    LowAvgTurnover,
    LowPrice,
    LongHalt,
    AbnormalGap,
    CalendarGap,
}

impl AnomalyKind {
    /// Anomalies that mark a symbol's quality record as not `ok`.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            AnomalyKind::ParseFailed
                | AnomalyKind::Empty
                | AnomalyKind::InsufficientRows
                | AnomalyKind::DuplicateDates
                | AnomalyKind::Stale
                | AnomalyKind::NonPositivePrice
                | AnomalyKind::OhlcViolation
                | AnomalyKind::ListingTooNew
                | AnomalyKind::StName
                | AnomalyKind::LowAvgTurnover
                | AnomalyKind::LowPrice
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub symbol: String,
    pub kind: AnomalyKind,
    pub detail: String,
    pub dt: Option<NaiveDate>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// One step of a ChannelHF filter-pipeline trace, captured only when
/// `capture_logs` is set on the strategy config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    pub step: &'static str,
    pub threshold: Option<f64>,
    pub actual: Option<f64>,
    pub passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalLogEntry {
    pub symbol: String,
    pub dt: NaiveDate,
    pub mid: f64,
    pub lower: f64,
    pub upper: f64,
    pub vol_ratio: f64,
    pub slope_norm: f64,
    pub trace: Vec<TraceStep>,
    pub final_signal: i8,
}

/// Bundle returned by one Event Engine run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub equity_curve: Vec<EquityPoint>,
    pub benchmark_curve: Vec<EquityPoint>,
    pub trades: Vec<Trade>,
    pub metrics: crate::metrics::Metrics,
    pub anomalies: Vec<Anomaly>,
    pub signal_logs: Vec<SignalLogEntry>,
    pub status: RunStatus,
}
