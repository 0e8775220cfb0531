/// config.rs — Typed configuration structs
///
/// The reference implementation threads loosely-typed dicts with many
/// optional keys through every component. Here each component gets a
/// frozen struct with an explicit `Default` and a validating
/// constructor; unknown keys simply don't parse (no `HashMap` escape
/// hatch), so drift between a config file and the code it configures
/// surfaces at compile/parse time instead of silently at runtime.
use std::env;
use std::fmt::Display;
use std::str::FromStr;

use crate::error::{EngineError, Result};

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr + Copy,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| EngineError::InvalidInput(format!("{key}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}

/// Commission / slippage / stamp-duty / lot-size model for the broker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrokerConfig {
    pub commission_rate: f64,
    pub min_commission: f64,
    pub stamp_duty_rate: f64,
    pub slippage_rate: f64,
    pub lot_size: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            commission_rate: 0.0003,
            min_commission: 5.0,
            // The reference implementation uses 0.0005 at one call site
            // and 0.001 at another; we pick the more conservative value
            // as the default and keep it a plain configurable field.
            stamp_duty_rate: 0.001,
            slippage_rate: 0.001,
            lot_size: 100,
        }
    }
}

impl BrokerConfig {
    pub fn validated(self) -> Result<Self> {
        if !(0.0..=0.01).contains(&self.commission_rate) {
            return Err(EngineError::InvalidInput(format!(
                "commission_rate out of range [0, 0.01]: {}",
                self.commission_rate
            )));
        }
        if self.min_commission < 0.0 {
            return Err(EngineError::InvalidInput(
                "min_commission cannot be negative".into(),
            ));
        }
        if !(0.0..=0.01).contains(&self.stamp_duty_rate) {
            return Err(EngineError::InvalidInput(format!(
                "stamp_duty_rate out of range [0, 0.01]: {}",
                self.stamp_duty_rate
            )));
        }
        if !(0.0..=0.01).contains(&self.slippage_rate) {
            return Err(EngineError::InvalidInput(format!(
                "slippage_rate out of range [0, 0.01]: {}",
                self.slippage_rate
            )));
        }
        if self.lot_size == 0 {
            return Err(EngineError::InvalidInput("lot_size must be positive".into()));
        }
        Ok(self)
    }

    pub fn calculate_commission(&self, notional: f64) -> f64 {
        if notional <= 0.0 {
            return 0.0;
        }
        (notional * self.commission_rate).max(self.min_commission)
    }

    pub fn from_env() -> Result<Self> {
        let cfg = BrokerConfig {
            commission_rate: parse_env("BROKER_COMMISSION_RATE", BrokerConfig::default().commission_rate)?,
            min_commission: parse_env("BROKER_MIN_COMMISSION", BrokerConfig::default().min_commission)?,
            stamp_duty_rate: parse_env("BROKER_STAMP_DUTY_RATE", BrokerConfig::default().stamp_duty_rate)?,
            slippage_rate: parse_env("BROKER_SLIPPAGE_RATE", BrokerConfig::default().slippage_rate)?,
            lot_size: parse_env("BROKER_LOT_SIZE", BrokerConfig::default().lot_size)?,
        };
        cfg.validated()
    }
}

/// Top-level backtest configuration: starting cash, broker model, and an
/// optional benchmark symbol for the Event Engine's benchmark curve.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub initial_cash: f64,
    pub broker: BrokerConfig,
    pub benchmark_symbol: Option<String>,
    /// Annual risk-free rate used by `metrics::compute_metrics` for the
    /// Sharpe/Sortino excess-return baseline.
    pub risk_free_rate: f64,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            initial_cash: 1_000_000.0,
            broker: BrokerConfig::default(),
            benchmark_symbol: None,
            risk_free_rate: 0.02,
        }
    }
}

impl BacktestConfig {
    pub fn validated(self) -> Result<Self> {
        if self.initial_cash <= 0.0 {
            return Err(EngineError::InvalidInput("initial_cash must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.risk_free_rate) {
            return Err(EngineError::InvalidInput(format!(
                "risk_free_rate out of range [0, 1]: {}",
                self.risk_free_rate
            )));
        }
        Ok(self)
    }
}

/// Volume-contraction band: either a hard `[min, max]` ratio window, or a
/// one-sided threshold whose direction depends on whether it's >= 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VolShrinkRule {
    Band { min: f64, max: f64 },
    Threshold(f64),
    Disabled,
}

/// Where the sell target sits relative to the channel midline/upper band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SellTargetMode {
    MidUp,
    UpperDown,
    MidDown,
}

/// ChannelHF strategy configuration. See `SPEC_FULL.md` §3/§4.5 for the
/// semantics of each field.
#[derive(Debug, Clone)]
pub struct ChannelHFConfig {
    pub channel_period: usize,

    pub buy_touch_eps: f64,
    pub sell_trigger_eps: f64,
    pub channel_break_eps: f64,
    pub entry_fill_eps: f64,

    pub stop_loss_mul: f64,
    pub stop_loss_on_close: bool,
    pub stop_loss_panic_eps: f64,

    pub max_holding_days: i64,
    pub cooling_period: i64,

    pub min_slope_norm: f64,
    pub slope_abs_max: f64,

    pub vol_shrink: VolShrinkRule,
    pub volatility_ratio_max: f64,

    pub min_channel_height: f64,
    pub min_mid_room: f64,
    pub min_mid_profit_pct: f64,
    pub min_rr_to_mid: f64,

    pub pivot_k: usize,
    pub pivot_drop_min: f64,
    pub pivot_rebound_days: usize,
    pub pivot_confirm_days: usize,
    pub pivot_confirm_requires_sig: bool,
    pub pivot_no_new_low_tol: f64,
    pub pivot_rebound_amp: f64,

    pub require_index_condition: bool,
    pub index_bear_exit: bool,
    pub index_trend_ma_period: usize,

    pub max_positions: usize,
    pub max_position_pct: f64,

    pub trend_ma_period: usize,
    pub require_rebound: bool,
    pub require_green_candle: bool,

    pub fill_at_close: bool,
    pub sell_target_mode: SellTargetMode,

    pub scan_recent_days: usize,
    pub capture_logs: bool,
}

impl Default for ChannelHFConfig {
    fn default() -> Self {
        ChannelHFConfig {
            channel_period: 20,

            buy_touch_eps: 0.01,
            sell_trigger_eps: 0.0,
            channel_break_eps: 0.02,
            entry_fill_eps: 0.0,

            stop_loss_mul: 0.95,
            stop_loss_on_close: true,
            stop_loss_panic_eps: 0.0,

            max_holding_days: 20,
            cooling_period: 3,

            min_slope_norm: -1.0,
            slope_abs_max: 1.0,

            vol_shrink: VolShrinkRule::Disabled,
            volatility_ratio_max: 1.0,

            min_channel_height: 0.0,
            min_mid_room: 0.0,
            min_mid_profit_pct: 0.0,
            min_rr_to_mid: 0.0,

            pivot_k: 3,
            pivot_drop_min: 0.05,
            pivot_rebound_days: 2,
            pivot_confirm_days: 0,
            pivot_confirm_requires_sig: true,
            pivot_no_new_low_tol: 0.0,
            pivot_rebound_amp: 0.0,

            require_index_condition: false,
            index_bear_exit: false,
            index_trend_ma_period: 0,

            max_positions: 10,
            max_position_pct: 0.1,

            trend_ma_period: 0,
            require_rebound: false,
            require_green_candle: false,

            fill_at_close: false,
            sell_target_mode: SellTargetMode::MidUp,

            scan_recent_days: 5,
            capture_logs: false,
        }
    }
}

impl ChannelHFConfig {
    pub fn validated(self) -> Result<Self> {
        if self.channel_period < 5 {
            return Err(EngineError::InvalidInput(
                "channel_period must be at least 5".into(),
            ));
        }
        if self.max_positions == 0 {
            return Err(EngineError::InvalidInput("max_positions must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.max_position_pct) {
            return Err(EngineError::InvalidInput(
                "max_position_pct must be within [0, 1]".into(),
            ));
        }
        if self.stop_loss_mul <= 0.0 || self.stop_loss_mul >= 1.0 {
            return Err(EngineError::InvalidInput(
                "stop_loss_mul must be within (0, 1)".into(),
            ));
        }
        Ok(self)
    }
}

/// Event Engine level configuration (complements `BacktestConfig`): the
/// data-quality thresholds enforced once before the date loop.
#[derive(Debug, Clone, Copy)]
pub struct EventEngineConfig {
    pub min_trading_days: usize,
    pub max_date_gap_days: i64,
    pub abnormal_gap_pct: f64,
}

impl Default for EventEngineConfig {
    fn default() -> Self {
        EventEngineConfig {
            min_trading_days: 20,
            max_date_gap_days: 7,
            abnormal_gap_pct: 0.20,
        }
    }
}

/// Batch task manager resource limits.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_tasks: usize,
    pub ttl_seconds: i64,
    pub max_in_flight: usize,
    pub max_return_samples: usize,
    pub max_combo_examples: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_tasks: 64,
            ttl_seconds: 3600,
            max_in_flight: 16,
            max_return_samples: 5_000,
            max_combo_examples: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_config_defaults_validate() {
        assert!(BrokerConfig::default().validated().is_ok());
    }

    #[test]
    fn broker_config_rejects_out_of_range_commission() {
        let cfg = BrokerConfig { commission_rate: 0.02, ..BrokerConfig::default() };
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn channel_hf_config_rejects_short_period() {
        let cfg = ChannelHFConfig { channel_period: 2, ..ChannelHFConfig::default() };
        assert!(cfg.validated().is_err());
    }

    #[test]
    fn commission_floors_at_minimum() {
        let cfg = BrokerConfig::default();
        assert_eq!(cfg.calculate_commission(100.0), cfg.min_commission);
        assert_eq!(cfg.calculate_commission(0.0), 0.0);
    }
}
